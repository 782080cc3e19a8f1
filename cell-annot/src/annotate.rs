use crate::backend::Backend;
use crate::mapping::{ClusterId, LabelMapping};
use adata_types::{AnnMatrix, CategoryType, Column, ElemType, SparseMatrix};
use anyhow::{bail, Context, Error};
use itertools::Itertools;
use log::{debug, info};
use std::collections::HashSet;

/// obsp key of the cell neighbor graph
pub const CONNECTIVITIES: &str = "connectivities";

/// Settings of one clustering pass
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterParams {
    /// obs column receiving the cluster ids
    pub key: String,
    /// obsm representation the neighbor graph is built from
    pub use_rep: String,
    /// Community-detection resolution
    pub resolution: f64,
    /// Neighbors per cell when a graph has to be built
    pub n_neighbors: usize,
    /// Random seed
    pub seed: u64,
}

/// Build the neighbor graph over `obsm[use_rep]` and store it as `obsp["connectivities"]`,
/// replacing any existing graph.
pub fn compute_neighbors(adata: &mut AnnMatrix, backend: &dyn Backend, use_rep: &str, k: usize) -> Result<(), Error> {
    let n_obs = adata.n_obs();
    if n_obs < 2 {
        bail!("cannot build a neighbor graph over {n_obs} cells");
    }
    let k = k.min(n_obs - 1);
    info!("computing {k}-nearest-neighbor graph over {n_obs} cells from '{use_rep}'");
    let graph = backend.neighbors(adata.obsm_array(use_rep)?, k)?;
    if graph.shape() != (n_obs, n_obs) {
        bail!("neighbor graph has shape {:?}, expected ({n_obs}, {n_obs})", graph.shape());
    }
    adata
        .obsp
        .insert(CONNECTIVITIES.to_string(), SparseMatrix::new(graph, ElemType::Float32));
    Ok(())
}

/// Cluster cells over the stored neighbor graph (building one first if there is none) and write
/// the cluster ids to `obs[params.key]` as a categorical of decimal strings. Returns the number of
/// clusters.
pub fn cluster_cells(adata: &mut AnnMatrix, backend: &dyn Backend, params: &ClusterParams) -> Result<usize, Error> {
    if !adata.obsp.contains_key(CONNECTIVITIES) {
        info!("no stored neighbor graph");
        compute_neighbors(adata, backend, &params.use_rep, params.n_neighbors)?;
    }
    let graph = &adata.obsp[CONNECTIVITIES].matrix;
    let clusters = backend
        .cluster(graph, params.resolution, params.seed)
        .context("clustering cells")?;
    if clusters.len() != adata.n_obs() {
        bail!("clustering returned {} labels for {} cells", clusters.len(), adata.n_obs());
    }
    let n_clusters = clusters.iter().max().map_or(0, |&m| m + 1);
    let column = Column::Categorical {
        categories: (0..n_clusters).map(|c| c.to_string()).collect(),
        codes: clusters.iter().map(|&c| c as i32).collect(),
        ordered: false,
        dtype: CategoryType::Text,
    };
    adata.obs.insert(&params.key, column);
    info!(
        "found {n_clusters} clusters at resolution {} over {} cells",
        params.resolution,
        adata.n_obs()
    );
    Ok(n_clusters)
}

/// Cluster id of every cell, parsed from the decimal labels in `obs[cluster_key]`.
pub fn cluster_ids(adata: &AnnMatrix, cluster_key: &str) -> Result<Vec<ClusterId>, Error> {
    adata
        .obs_labels(cluster_key)?
        .into_iter()
        .map(|l| {
            l.parse::<ClusterId>()
                .with_context(|| format!("'{l}' in '{cluster_key}' is not a cluster id"))
        })
        .collect()
}

/// Label every cell according to `mapping` applied to its cluster in `obs[cluster_key]`, writing
/// the result to `obs[label_key]`. Fails without touching `adata` if the mapping is inconsistent,
/// names a cluster that does not occur, or leaves any cluster unlabeled.
pub fn annotate_cell_types(
    adata: &mut AnnMatrix,
    mapping: &LabelMapping,
    cluster_key: &str,
    label_key: &str,
) -> Result<(), Error> {
    let lookup = mapping.lookup()?;
    let clusters = cluster_ids(adata, cluster_key)?;
    let present: HashSet<ClusterId> = clusters.iter().copied().collect();

    for (label, ids) in mapping.iter() {
        if let Some(c) = ids.iter().find(|&c| !present.contains(c)) {
            bail!("cluster {c} assigned to '{label}' does not exist in '{cluster_key}'");
        }
    }
    let unmapped: Vec<ClusterId> = present
        .iter()
        .filter(|&c| !lookup.contains_key(c))
        .copied()
        .sorted()
        .collect();
    if !unmapped.is_empty() {
        bail!("clusters {unmapped:?} of '{cluster_key}' have no label");
    }

    let labels: Vec<&str> = clusters.iter().map(|c| lookup[c]).collect();
    adata.set_obs_labels(label_key, &labels)?;
    for (label, count) in label_counts(adata, label_key)? {
        debug!("  {label}: {count} cells");
    }
    info!("assigned {} labels to {} cells in '{label_key}'", mapping.len(), adata.n_obs());
    Ok(())
}

/// Number of cells per label of `obs[key]`, largest first.
pub fn label_counts(adata: &AnnMatrix, key: &str) -> Result<Vec<(String, usize)>, Error> {
    Ok(adata
        .obs_labels(key)?
        .into_iter()
        .counts()
        .into_iter()
        .map(|(l, n)| (l.to_string(), n))
        .sorted_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)))
        .collect())
}
