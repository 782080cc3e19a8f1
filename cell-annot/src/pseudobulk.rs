use crate::backend::Backend;
use adata_types::sparse::csr_from_triplets;
use adata_types::AnnMatrix;
use anyhow::{bail, format_err, Context, Error};
use log::{debug, info};
use sprs::CsMat;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Layer holding raw counts, summed in preference to `X` when present
pub const COUNTS_LAYER: &str = "counts";

/// Expression summed over all cells sharing a combination of grouping labels.
#[derive(Clone, Debug)]
pub struct PseudoBulk {
    /// Grouping obs columns
    pub keys: Vec<String>,
    /// Label of each group for every key, groups in order of first appearance
    pub groups: Vec<Vec<String>>,
    /// Cells in each group
    pub n_cells: Vec<usize>,
    /// Summed counts, groups × genes
    pub counts: CsMat<f64>,
    /// Gene identifiers
    pub var_names: Vec<String>,
}

/// A gene found up-regulated in a group of pseudobulk samples
#[derive(Clone, Debug, PartialEq)]
pub struct RankedGene {
    /// Gene identifier
    pub gene: String,
    /// log2 fold change over the other samples
    pub log2_fold_change: f64,
    /// Raw p-value
    pub p_value: f64,
    /// Adjusted p-value
    pub adjusted_p_value: f64,
    /// Mean log-normalized expression over the samples of the group
    pub mean_log_expression: f64,
}

/// Sum the counts of `adata` (layer `counts` if present, otherwise `X`) over every distinct
/// combination of the labels in `group_keys`.
pub fn pseudobulk<S: AsRef<str>>(adata: &AnnMatrix, group_keys: &[S]) -> Result<PseudoBulk, Error> {
    if group_keys.is_empty() {
        bail!("pseudobulk needs at least one grouping column");
    }
    let keys: Vec<String> = group_keys.iter().map(|k| k.as_ref().to_string()).collect();
    let columns = keys
        .iter()
        .map(|k| adata.obs_labels(k).context("grouping cells for pseudobulk"))
        .collect::<Result<Vec<_>, _>>()?;
    let source = match adata.layers.get(COUNTS_LAYER) {
        Some(layer) => {
            debug!("summing layer '{COUNTS_LAYER}'");
            &layer.matrix
        }
        None => &adata.x.matrix,
    };

    let mut index: HashMap<Vec<&str>, usize> = HashMap::new();
    let mut groups = Vec::new();
    let mut n_cells = Vec::new();
    let (mut rows, mut cols, mut vals) = (Vec::new(), Vec::new(), Vec::new());
    for (cell, row) in source.outer_iterator().enumerate() {
        let labels: Vec<&str> = columns.iter().map(|c| c[cell]).collect();
        let group = *index.entry(labels).or_insert_with_key(|labels| {
            groups.push(labels.iter().map(ToString::to_string).collect());
            n_cells.push(0);
            groups.len() - 1
        });
        n_cells[group] += 1;
        for (gene, &v) in row.iter() {
            rows.push(group);
            cols.push(gene);
            vals.push(v);
        }
    }
    let counts = csr_from_triplets((groups.len(), adata.n_vars()), &rows, &cols, &vals)?;
    info!("aggregated {} cells into {} pseudobulk samples by {keys:?}", adata.n_obs(), groups.len());
    Ok(PseudoBulk {
        keys,
        groups,
        n_cells,
        counts,
        var_names: adata.var_names.clone(),
    })
}

impl PseudoBulk {
    /// Number of pseudobulk samples
    pub fn n_groups(&self) -> usize {
        self.groups.len()
    }

    /// Label of every sample for grouping column `key`
    pub fn values(&self, key: &str) -> Result<Vec<&str>, Error> {
        let k = self
            .keys
            .iter()
            .position(|k| k == key)
            .ok_or_else(|| format_err!("'{key}' is not a pseudobulk grouping column, have {:?}", self.keys))?;
        Ok(self.groups.iter().map(|g| g[k].as_str()).collect())
    }

    /// Counts scaled to one million per sample, then `ln(1 + x)`.
    pub fn log_normalized(&self) -> CsMat<f64> {
        let (mut rows, mut cols, mut vals) = (Vec::new(), Vec::new(), Vec::new());
        for (r, row) in self.counts.outer_iterator().enumerate() {
            let total: f64 = row.data().iter().sum();
            if total <= 0.0 {
                continue;
            }
            for (c, &v) in row.iter() {
                rows.push(r);
                cols.push(c);
                vals.push((v * 1e6 / total).ln_1p());
            }
        }
        CsMat::new(
            self.counts.shape(),
            csr_indptr(&rows, self.counts.rows()),
            cols,
            vals,
        )
    }

    /// Genes up-regulated in the samples whose `key` label is one of `groups` compared with all
    /// other samples, at most `n_genes`, most significant first.
    pub fn rank_genes<S: AsRef<str>>(
        &self,
        backend: &dyn Backend,
        key: &str,
        groups: &[S],
        n_genes: usize,
    ) -> Result<Vec<RankedGene>, Error> {
        let values = self.values(key)?;
        let (a, b): (Vec<usize>, Vec<usize>) =
            (0..self.n_groups()).partition(|&i| groups.iter().any(|g| g.as_ref() == values[i]));
        let wanted: Vec<&str> = groups.iter().map(AsRef::as_ref).collect();
        if a.is_empty() || b.is_empty() {
            bail!(
                "cannot compare {key} in {wanted:?}: {} samples inside, {} outside",
                a.len(),
                b.len()
            );
        }
        info!("testing {} pseudobulk samples with {key} in {wanted:?} against {} others", a.len(), b.len());
        let mut tests = backend.differential_expression(&self.counts, &a, &b)?;
        tests.retain(|t| t.log2_fold_change > 0.0 && t.adjusted_p_value.is_finite());
        tests.sort_by(|x, y| {
            x.adjusted_p_value
                .partial_cmp(&y.adjusted_p_value)
                .unwrap_or(Ordering::Equal)
                .then_with(|| {
                    y.log2_fold_change
                        .partial_cmp(&x.log2_fold_change)
                        .unwrap_or(Ordering::Equal)
                })
        });
        let norm = self.log_normalized();
        let mut in_group = vec![0.0; self.var_names.len()];
        for &s in &a {
            if let Some(row) = norm.outer_view(s) {
                for (gene, &v) in row.iter() {
                    in_group[gene] += v / a.len() as f64;
                }
            }
        }
        tests
            .into_iter()
            .take(n_genes)
            .map(|t| {
                let gene = self
                    .var_names
                    .get(t.gene)
                    .ok_or_else(|| format_err!("gene index {} out of range", t.gene))?;
                Ok(RankedGene {
                    gene: gene.clone(),
                    log2_fold_change: t.log2_fold_change,
                    p_value: t.p_value,
                    adjusted_p_value: t.adjusted_p_value,
                    mean_log_expression: in_group[t.gene],
                })
            })
            .collect()
    }
}

/// indptr of a CSR matrix with `n_rows` rows given the (sorted) row of every entry
fn csr_indptr(rows: &[usize], n_rows: usize) -> Vec<usize> {
    let mut indptr = vec![0; n_rows + 1];
    for &r in rows {
        indptr[r + 1] += 1;
    }
    for i in 0..n_rows {
        indptr[i + 1] += indptr[i];
    }
    indptr
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::{blobs, FakeBackend};
    use adata_types::{ElemType, SparseMatrix};
    use approx::assert_abs_diff_eq;

    fn grouped() -> AnnMatrix {
        // patients alternate P1, P2; clusters 0 0 0 1 1 1
        let mut adata = blobs(&[3, 3]);
        adata.set_obs_labels("leiden", &["0", "0", "0", "1", "1", "1"]).unwrap();
        adata
    }

    #[test]
    fn test_sums() {
        let adata = grouped();
        let pb = pseudobulk(&adata, &["patient_id", "leiden"]).unwrap();
        assert_eq!(pb.n_groups(), 4);
        assert_eq!(pb.values("patient_id").unwrap(), vec!["P1", "P2", "P2", "P1"]);
        assert_eq!(pb.values("leiden").unwrap(), vec!["0", "0", "1", "1"]);
        assert_eq!(pb.n_cells, vec![2, 1, 2, 1]);
        // P1 / cluster 0 is cells 0 and 2: ALB 5 + 7, MKI67 1 from cell 0
        assert_eq!(pb.counts.get(0, 0), Some(&12.0));
        assert_eq!(pb.counts.get(0, 4), Some(&1.0));
        // P2 / cluster 1 is cells 3 and 5: CD3E 5 + 7, MKI67 1 + 0
        assert_eq!(pb.counts.get(2, 1), Some(&12.0));
        assert_eq!(pb.counts.get(2, 4), Some(&1.0));
        assert!(pb.values("cell_type").is_err());
        assert!(pseudobulk(&adata, &["cell_type"]).is_err());
        assert!(pseudobulk::<&str>(&adata, &[]).is_err());
    }

    #[test]
    fn test_counts_layer_preferred() {
        let mut adata = grouped();
        let doubled = adata.x.matrix.map(|v| 2.0 * v);
        adata
            .layers
            .insert(COUNTS_LAYER.into(), SparseMatrix::new(doubled, ElemType::Int32));
        let pb = pseudobulk(&adata, &["leiden"]).unwrap();
        assert_eq!(pb.counts.get(0, 0), Some(&36.0));
    }

    #[test]
    fn test_log_normalized() {
        let pb = pseudobulk(&grouped(), &["patient_id", "leiden"]).unwrap();
        let norm = pb.log_normalized();
        assert_eq!(norm.shape(), pb.counts.shape());
        assert_abs_diff_eq!(*norm.get(0, 0).unwrap(), (12.0f64 / 13.0 * 1e6).ln_1p(), epsilon = 1e-9);
        assert_abs_diff_eq!(*norm.get(0, 4).unwrap(), (1.0f64 / 13.0 * 1e6).ln_1p(), epsilon = 1e-9);
        assert_eq!(norm.get(0, 1), None);
    }

    #[test]
    fn test_rank_genes() {
        let pb = pseudobulk(&grouped(), &["patient_id", "leiden"]).unwrap();
        let ranked = pb.rank_genes(&FakeBackend, "leiden", &["1"], 2).unwrap();
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].gene, "CD3E");
        assert!(ranked[0].log2_fold_change > 0.0);
        // CD3E in P2 / cluster 1 (12 of 13 counts) and P1 / cluster 1 (6 of 6)
        let expected = ((12.0f64 / 13.0 * 1e6).ln_1p() + 1e6f64.ln_1p()) / 2.0;
        assert_abs_diff_eq!(ranked[0].mean_log_expression, expected, epsilon = 1e-9);
        assert!(pb.rank_genes(&FakeBackend, "leiden", &["7"], 2).is_err());
    }
}
