use crate::annotate::{cluster_cells, compute_neighbors, ClusterParams};
use crate::backend::Backend;
use adata_types::AnnMatrix;
use anyhow::{bail, format_err, Context, Error};
use log::info;

/// obsm key of the 2d embedding
pub const UMAP_KEY: &str = "X_umap";

/// Rows whose label in `obs[key]` satisfies `selector`, in matrix order.
pub fn select_rows(adata: &AnnMatrix, key: &str, selector: impl Fn(&str) -> bool) -> Result<Vec<usize>, Error> {
    Ok(adata
        .obs_labels(key)?
        .into_iter()
        .enumerate()
        .filter(|(_, l)| selector(*l))
        .map(|(i, _)| i)
        .collect())
}

/// Independent copy of the cells whose `obs[key]` equals `value`.
pub fn subset_where(adata: &AnnMatrix, key: &str, value: &str) -> Result<AnnMatrix, Error> {
    let rows = select_rows(adata, key, |l| l == value)?;
    info!("selected {} cells with {key} = '{value}'", rows.len());
    adata.subset_obs(&rows)
}

/// Recompute the neighbor graph, the embedding and the clustering of a subset from its own
/// `obsm[use_rep]`. Returns the number of clusters.
pub fn reprocess_subset(subset: &mut AnnMatrix, backend: &dyn Backend, params: &ClusterParams) -> Result<usize, Error> {
    compute_neighbors(subset, backend, &params.use_rep, params.n_neighbors)?;
    recompute_embedding(subset, backend, &params.use_rep, params.n_neighbors, params.seed)?;
    cluster_cells(subset, backend, params)
}

/// Replace `obsm["X_umap"]` with a fresh embedding of `obsm[use_rep]`.
pub fn recompute_embedding(
    adata: &mut AnnMatrix,
    backend: &dyn Backend,
    use_rep: &str,
    n_neighbors: usize,
    seed: u64,
) -> Result<(), Error> {
    let n_obs = adata.n_obs();
    if n_obs < 2 {
        bail!("cannot embed {n_obs} cells");
    }
    info!("computing embedding of {n_obs} cells from '{use_rep}'");
    let embedding = backend
        .embed(adata.obsm_array(use_rep)?, n_neighbors.min(n_obs - 1), seed)
        .context("computing embedding")?;
    if embedding.nrows() != n_obs {
        bail!("embedding has {} rows for {n_obs} cells", embedding.nrows());
    }
    adata.obsm.insert(UMAP_KEY.to_string(), embedding);
    Ok(())
}

/// Copy the labels of `subset.obs[key]` into `parent.obs[key]`, matching cells by identifier.
/// Only the rows of cells present in the subset change; new labels are added to the parent's
/// categories. Fails, leaving `parent` untouched, if a subset cell is not in the parent. Returns
/// the number of updated cells.
pub fn integrate_labels(parent: &mut AnnMatrix, subset: &AnnMatrix, key: &str) -> Result<usize, Error> {
    let labels = subset.obs_labels(key).context("reading subset labels")?;
    let rows: Vec<usize> = {
        let index = parent.obs_index();
        subset
            .obs_names
            .iter()
            .map(|name| {
                index
                    .get(name.as_str())
                    .copied()
                    .ok_or_else(|| format_err!("cell '{name}' of the subset is not in the full matrix"))
            })
            .collect::<Result<_, Error>>()?
    };

    let n_obs = parent.n_obs();
    let column = parent
        .obs
        .get_mut(key)
        .ok_or_else(|| format_err!("obs column '{key}' not found in the full matrix"))?;
    let mut updated = column.clone();
    for (&row, label) in rows.iter().zip(labels) {
        updated.set_label(row, label)?;
    }
    *column = updated;
    info!("integrated {} labels of '{key}' back into {n_obs} cells", rows.len());
    Ok(rows.len())
}

/// Select cells by their `obs[key]` label, refine the selection on an independent copy and merge
/// the refined `obs[key]` back by cell identifier. Returns a new matrix; `full` is not modified.
pub fn refine_and_integrate<S, F>(full: &AnnMatrix, key: &str, selector: S, refine: F) -> Result<AnnMatrix, Error>
where
    S: Fn(&str) -> bool,
    F: FnOnce(&mut AnnMatrix) -> Result<(), Error>,
{
    let rows = select_rows(full, key, selector)?;
    if rows.is_empty() {
        bail!("no cells selected from '{key}'");
    }
    let mut subset = full.subset_obs(&rows)?;
    refine(&mut subset)?;
    let mut merged = full.clone();
    integrate_labels(&mut merged, &subset, key)?;
    Ok(merged)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::annotate::annotate_cell_types;
    use crate::mapping::LabelMapping;
    use crate::test_util::{blobs, FakeBackend};

    fn labelled(labels: &[&str]) -> AnnMatrix {
        let mut adata = blobs(&[labels.len()]);
        adata.set_obs_labels("cell_type", labels).unwrap();
        adata
    }

    #[test]
    fn test_five_cells() {
        let mut parent = labelled(&["T", "T", "T", "T", "T"]);
        let mut subset = parent.subset_obs(&[0, 1, 2, 3, 4]).unwrap();
        subset.set_obs_labels("leiden", &["0", "0", "1", "1", "1"]).unwrap();
        let mapping = LabelMapping::new([("X", vec![0]), ("Y", vec![1])]);
        annotate_cell_types(&mut subset, &mapping, "leiden", "cell_type").unwrap();

        assert_eq!(integrate_labels(&mut parent, &subset, "cell_type").unwrap(), 5);
        assert_eq!(parent.obs_labels("cell_type").unwrap(), vec!["X", "X", "Y", "Y", "Y"]);
    }

    #[test]
    fn test_scoped_and_by_identity() {
        let mut parent = labelled(&["B", "myeloid", "B", "myeloid", "myeloid", "NK"]);
        let before = parent.clone();
        // the subset comes back in a different order than the parent
        let mut subset = parent.subset_obs(&[4, 1, 3]).unwrap();
        subset.set_obs_labels("cell_type", &["pDC", "cDC", "Mono"]).unwrap();

        integrate_labels(&mut parent, &subset, "cell_type").unwrap();
        assert_eq!(
            parent.obs_labels("cell_type").unwrap(),
            vec!["B", "cDC", "B", "Mono", "pDC", "NK"]
        );
        assert_eq!(parent.obs_names, before.obs_names);
        assert_eq!(parent.x, before.x);
    }

    #[test]
    fn test_missing_cell_fails() {
        let mut parent = labelled(&["a", "b", "c", "d"]);
        let mut subset = parent.subset_obs(&[1, 2]).unwrap();
        subset.obs_names[1] = "elsewhere".into();
        subset.set_obs_labels("cell_type", &["x", "y"]).unwrap();
        let before = parent.obs.clone();
        assert!(integrate_labels(&mut parent, &subset, "cell_type").is_err());
        assert_eq!(parent.obs, before);
    }

    #[test]
    fn test_subset_where() {
        let adata = labelled(&["a", "b", "a", "c"]);
        let s = subset_where(&adata, "cell_type", "a").unwrap();
        assert_eq!(s.obs_names, vec!["cell000", "cell002"]);
        assert_eq!(subset_where(&adata, "cell_type", "z").unwrap().n_obs(), 0);
        assert!(subset_where(&adata, "nope", "a").is_err());
    }

    #[test]
    fn test_refine_and_integrate() {
        let mut full = blobs(&[6, 4, 5]);
        let coarse: Vec<&str> = (0..15).map(|i| if i < 6 { "Hepatocytes" } else { "myeloid" }).collect();
        full.set_obs_labels("cell_type", &coarse).unwrap();
        let original = full.clone();

        let params = ClusterParams {
            key: "leiden".into(),
            use_rep: "X_scVI".into(),
            resolution: 0.3,
            n_neighbors: 3,
            seed: 0,
        };
        let merged = refine_and_integrate(
            &full,
            "cell_type",
            |l| l == "myeloid",
            |sub| {
                assert_eq!(sub.n_obs(), 9);
                reprocess_subset(sub, &FakeBackend, &params)?;
                assert_eq!(sub.obsm[UMAP_KEY].nrows(), 9);
                let mapping = LabelMapping::new([("Monocytes", vec![0]), ("cDCs", vec![1])]);
                annotate_cell_types(sub, &mapping, "leiden", "cell_type")
            },
        )
        .unwrap();

        // input untouched
        assert_eq!(full.obs, original.obs);

        let labels = merged.obs_labels("cell_type").unwrap();
        assert!(labels[..6].iter().all(|&l| l == "Hepatocytes"));
        // blob of 5 is the larger subcluster
        assert!(labels[6..10].iter().all(|&l| l == "cDCs"));
        assert!(labels[10..].iter().all(|&l| l == "Monocytes"));
        // the parent's other columns and embedding inputs are kept
        assert_eq!(merged.obsm["X_scVI"], original.obsm["X_scVI"]);
        assert!(merged.obs.get("leiden").is_none());

        let none = refine_and_integrate(&original, "cell_type", |l| l == "B cells", |_| Ok(()));
        assert!(none.is_err());
    }
}
