use anyhow::Error;
use ndarray::Array2;
use sprs::CsMat;

/// Outcome of a differential-expression test for one gene
#[derive(Clone, Debug, PartialEq)]
pub struct GeneTest {
    /// Column of the gene in the tested matrix
    pub gene: usize,
    /// Normalized mean in the first group
    pub mean_in: f64,
    /// Normalized mean in the second group
    pub mean_out: f64,
    /// log2 fold change of the first group over the second
    pub log2_fold_change: f64,
    /// Raw p-value
    pub p_value: f64,
    /// Multiple-testing adjusted p-value
    pub adjusted_p_value: f64,
}

/// Numerical routines the workflow delegates to. All calls are deterministic for a given seed.
pub trait Backend {
    /// Symmetric cell × cell connectivity graph joining every row of `rep` to its `k` nearest
    /// neighbors.
    fn neighbors(&self, rep: &Array2<f64>, k: usize) -> Result<CsMat<f64>, Error>;

    /// Community detection over a symmetric weighted graph. Returns one cluster per node, numbered
    /// from 0 by decreasing cluster size.
    fn cluster(&self, graph: &CsMat<f64>, resolution: f64, seed: u64) -> Result<Vec<usize>, Error>;

    /// Two-dimensional embedding of the rows of `rep`.
    fn embed(&self, rep: &Array2<f64>, n_neighbors: usize, seed: u64) -> Result<Array2<f64>, Error>;

    /// Test samples × genes `counts` for genes differentially expressed between the rows in `a`
    /// and the rows in `b`. Returns one result per gene.
    fn differential_expression(&self, counts: &CsMat<f64>, a: &[usize], b: &[usize]) -> Result<Vec<GeneTest>, Error>;
}
