//! Synthetic data and a deterministic backend for unit tests.

use crate::backend::{Backend, GeneTest};
use adata_types::sparse::csr_from_triplets;
use adata_types::{AnnMatrix, Column, ElemType, SparseMatrix};
use anyhow::Error;
use ndarray::{Array2, Axis};
use sprs::CsMat;
use std::collections::BTreeSet;

pub const GENES: [&str; 5] = ["ALB", "CD3E", "LYZ", "HBB", "MKI67"];

/// Cells in well separated groups of the given sizes, in order. Cell `i` of group `b` sits near
/// `(100 b, -50 b, 10)` in `X_scVI` and expresses gene `b % 5`.
pub fn blobs(sizes: &[usize]) -> AnnMatrix {
    let n: usize = sizes.iter().sum();
    let mut rep = Array2::zeros((n, 3));
    let (mut rows, mut cols, mut vals) = (Vec::new(), Vec::new(), Vec::new());
    let mut i = 0;
    for (b, &size) in sizes.iter().enumerate() {
        for _ in 0..size {
            rep[[i, 0]] = 100.0 * b as f64 + 0.1 * (i % 5) as f64;
            rep[[i, 1]] = -50.0 * b as f64 + 0.1 * ((i * 7) % 3) as f64;
            rep[[i, 2]] = 10.0;
            rows.push(i);
            cols.push(b % GENES.len());
            vals.push(5.0 + (i % 3) as f64);
            if i % 3 == 0 {
                rows.push(i);
                cols.push(4);
                vals.push(1.0);
            }
            i += 1;
        }
    }
    let x = csr_from_triplets((n, GENES.len()), &rows, &cols, &vals).unwrap();
    let total: Vec<f64> = x.outer_iterator().map(|r| r.data().iter().sum()).collect();
    let mut adata = AnnMatrix::new(
        (0..n).map(|i| format!("cell{i:03}")).collect(),
        GENES.iter().map(ToString::to_string).collect(),
        SparseMatrix::new(x, ElemType::Float32),
    )
    .unwrap();
    let patients: Vec<String> = (0..n).map(|i| format!("P{}", i % 2 + 1)).collect();
    adata.set_obs_labels("patient_id", &patients).unwrap();
    adata.obs.insert("total_counts", Column::Float(total));
    adata.obsm.insert("X_scVI".into(), rep);
    adata
}

fn sq_dist(a: ndarray::ArrayView1<f64>, b: ndarray::ArrayView1<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Brute-force neighbors, connected components as clusters, leading coordinates as embedding.
pub struct FakeBackend;

impl Backend for FakeBackend {
    fn neighbors(&self, rep: &Array2<f64>, k: usize) -> Result<CsMat<f64>, Error> {
        let n = rep.nrows();
        let mut edges = BTreeSet::new();
        for i in 0..n {
            let mut others: Vec<(f64, usize)> = (0..n)
                .filter(|&j| j != i)
                .map(|j| (sq_dist(rep.row(i), rep.row(j)), j))
                .collect();
            others.sort_by(|a, b| a.partial_cmp(b).unwrap());
            for &(_, j) in others.iter().take(k) {
                edges.insert((i, j));
                edges.insert((j, i));
            }
        }
        let (rows, cols): (Vec<usize>, Vec<usize>) = edges.into_iter().unzip();
        let vals = vec![1.0; rows.len()];
        csr_from_triplets((n, n), &rows, &cols, &vals)
    }

    fn cluster(&self, graph: &CsMat<f64>, _resolution: f64, _seed: u64) -> Result<Vec<usize>, Error> {
        let n = graph.rows();
        let mut component = vec![usize::MAX; n];
        let mut sizes = Vec::new();
        for start in 0..n {
            if component[start] != usize::MAX {
                continue;
            }
            let id = sizes.len();
            let mut stack = vec![start];
            component[start] = id;
            let mut size = 0;
            while let Some(node) = stack.pop() {
                size += 1;
                if let Some(row) = graph.outer_view(node) {
                    for (j, _) in row.iter() {
                        if component[j] == usize::MAX {
                            component[j] = id;
                            stack.push(j);
                        }
                    }
                }
            }
            sizes.push(size);
        }
        let mut order: Vec<usize> = (0..sizes.len()).collect();
        order.sort_by_key(|&c| std::cmp::Reverse(sizes[c]));
        let mut rank = vec![0; sizes.len()];
        for (r, &c) in order.iter().enumerate() {
            rank[c] = r;
        }
        Ok(component.into_iter().map(|c| rank[c]).collect())
    }

    fn embed(&self, rep: &Array2<f64>, _n_neighbors: usize, _seed: u64) -> Result<Array2<f64>, Error> {
        let mut out = Array2::zeros((rep.nrows(), 2));
        for (mut o, r) in out.axis_iter_mut(Axis(0)).zip(rep.axis_iter(Axis(0))) {
            for (d, v) in r.iter().take(2).enumerate() {
                o[d] = *v;
            }
        }
        Ok(out)
    }

    fn differential_expression(&self, counts: &CsMat<f64>, a: &[usize], b: &[usize]) -> Result<Vec<GeneTest>, Error> {
        let mean = |rows: &[usize], gene: usize| {
            rows.iter().map(|&r| counts.get(r, gene).copied().unwrap_or(0.0)).sum::<f64>() / rows.len().max(1) as f64
        };
        Ok((0..counts.cols())
            .map(|gene| {
                let (mean_in, mean_out) = (mean(a, gene), mean(b, gene));
                let p_value = 1.0 / (1.0 + (mean_in - mean_out).abs());
                GeneTest {
                    gene,
                    mean_in,
                    mean_out,
                    log2_fold_change: ((mean_in + 1.0) / (mean_out + 1.0)).log2(),
                    p_value,
                    adjusted_p_value: p_value,
                }
            })
            .collect())
    }
}
