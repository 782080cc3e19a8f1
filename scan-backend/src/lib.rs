//! # scan-backend: cell-annot numerics on the scan-rs stack
//!
//! Ball-tree neighbors and size-ordered relabelling from `scan-rs`, Leiden community detection,
//! UMAP embeddings and sSeq differential expression.

#![deny(missing_docs)]
#![deny(warnings)]

use anyhow::{bail, Error};
use cell_annot::{Backend, GeneTest, ThreadBudget};
use diff_exp::{compute_sseq_params, sseq_differential_expression};
use leiden::leiden::Leiden;
use leiden::{Clustering, Graph, Network, SimpleClustering};
use log::{debug, info};
use ndarray::Array2;
use scan_rs::merge_clusters::relabel_by_size;
use sprs::{CsMat, CsMatI, TriMat};
use sqz::AdaptiveMat;
use umap_rs::dist::DistanceType;
use umap_rs::umap::Umap;

const LEIDEN_RANDOMNESS: f64 = 1e-2;
const MAX_LEIDEN_ITERATIONS: usize = 100;

const UMAP_MIN_DIST: f64 = 0.5;
const UMAP_SPREAD: f64 = 1.0;

/// [`Backend`] running on the scan-rs crates
#[derive(Clone, Copy, Debug)]
pub struct ScanBackend {
    threads: usize,
}

impl ScanBackend {
    /// Backend sized to the configured worker pool
    pub fn new(budget: ThreadBudget) -> ScanBackend {
        ScanBackend {
            threads: budget.threads(),
        }
    }
}

/// Leiden network with the edges of the upper triangle of `graph` and nodes weighted by degree,
/// which together with a resolution of `γ / 2m` optimizes modularity. Returns the network and its
/// total edge weight `m`.
fn modularity_network(graph: &CsMat<f64>) -> (Network, f64) {
    let n = graph.rows();
    let mut degree = vec![0.0f32; n];
    let mut edges = Vec::new();
    for (w, (i, j)) in graph.iter() {
        if i < j {
            edges.push((i, j, *w as f32));
            degree[i] += *w as f32;
            degree[j] += *w as f32;
        }
    }
    let total: f64 = edges.iter().map(|&(_, _, w)| w as f64).sum();

    let mut leiden_graph = Graph::with_capacity(n, edges.len());
    for &d in &degree {
        leiden_graph.add_node(d);
    }
    for (i, j, w) in edges {
        leiden_graph.add_edge((i as u32).into(), (j as u32).into(), w);
    }
    (Network::new_from_graph(leiden_graph), total)
}

impl Backend for ScanBackend {
    fn neighbors(&self, rep: &Array2<f64>, k: usize) -> Result<CsMat<f64>, Error> {
        let n = rep.nrows();
        let rep = rep.as_standard_layout();
        let knn = scan_rs::nn::knn::<u32>(&rep.view(), k);
        let mut tri = TriMat::with_capacity((n, n), 2 * n * k);
        for (i, row) in knn.outer_iter().enumerate() {
            for &j in row.iter().filter(|&&j| j != u32::MAX) {
                tri.add_triplet(i, j as usize, 1.0);
                tri.add_triplet(j as usize, i, 1.0);
            }
        }
        let graph: CsMat<f64> = tri.to_csr();
        debug!("neighbor graph has {} edges", graph.nnz() / 2);
        Ok(graph.map(|_| 1.0))
    }

    fn cluster(&self, graph: &CsMat<f64>, resolution: f64, seed: u64) -> Result<Vec<usize>, Error> {
        let n = graph.rows();
        let (network, total_weight) = modularity_network(graph);
        if total_weight <= 0.0 {
            bail!("cannot cluster a graph without edges");
        }

        let mut leiden = Leiden::new(resolution / (2.0 * total_weight), LEIDEN_RANDOMNESS, Some(seed as usize));
        let mut clustering = SimpleClustering::init_different_clusters(n);
        for iteration in 0..MAX_LEIDEN_ITERATIONS {
            let updated = leiden.iterate(&network, &mut clustering);
            debug!("leiden iteration {}: {} clusters", iteration + 1, clustering.num_clusters());
            if !updated {
                break;
            }
        }
        info!("leiden found {} clusters", clustering.num_clusters());

        if clustering.num_clusters() > i16::MAX as usize {
            bail!("too many clusters to relabel: {}", clustering.num_clusters());
        }
        let labels: Vec<i16> = (0..n).map(|i| clustering.get(i) as i16).collect();
        Ok(relabel_by_size(labels).into_iter().map(|l| l as usize).collect())
    }

    fn embed(&self, rep: &Array2<f64>, n_neighbors: usize, seed: u64) -> Result<Array2<f64>, Error> {
        if n_neighbors == 0 || n_neighbors >= rep.nrows() {
            bail!("cannot embed {} cells with {n_neighbors} neighbors", rep.nrows());
        }
        let umap = Umap::new(
            Some(DistanceType::euclidean()),
            2,
            UMAP_MIN_DIST,
            UMAP_SPREAD,
            n_neighbors,
            None,
        );
        let rep = rep.as_standard_layout().to_owned();
        let mut state = umap.initialize_fit(&rep, Some(seed), self.threads);
        state.optimize();
        Ok(state.embedding)
    }

    fn differential_expression(&self, counts: &CsMat<f64>, a: &[usize], b: &[usize]) -> Result<Vec<GeneTest>, Error> {
        let (samples, genes) = counts.shape();
        if let Some(&s) = a.iter().chain(b).find(|&&s| s >= samples) {
            bail!("sample {s} out of range for {samples} samples");
        }
        // sSeq takes integer counts, genes × samples
        let mut tri = TriMat::with_capacity((genes, samples), counts.nnz());
        for (&v, (sample, gene)) in counts.iter() {
            let v = v.round();
            if v > 0.0 {
                tri.add_triplet(gene, sample, v as u32);
            }
        }
        let csr: CsMatI<u32, usize, u32> = tri.to_csr();
        let mat: AdaptiveMat = AdaptiveMat::from_csmat(&csr);

        let params = compute_sseq_params(&mat, None, None, None);
        let result = sseq_differential_expression(&mat, a, b, &params, None);
        info!(
            "tested {} of {genes} genes",
            result.genes_tested.iter().filter(|&&t| t).count()
        );
        Ok((0..genes)
            .map(|gene| GeneTest {
                gene,
                mean_in: result.normalized_mean_in[gene],
                mean_out: result.normalized_mean_out[gene],
                log2_fold_change: result.log2_fold_change[gene],
                p_value: result.p_values[gene],
                adjusted_p_value: result.adjusted_p_values[gene],
            })
            .collect())
    }
}
