use crate::frame::{Column, Frame};
use crate::sparse::{column_dense, select_rows, select_square};
use anyhow::{bail, format_err, Error};
use ndarray::{Array2, Axis};
use sprs::CsMat;
use std::collections::{BTreeMap, HashMap};

/// Element type a matrix was stored with on disk. Values are held as f64 in memory and converted
/// back to this type when written.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ElemType {
    /// 32-bit float
    #[default]
    Float32,
    /// 64-bit float
    Float64,
    /// 32-bit integer
    Int32,
    /// 64-bit integer
    Int64,
}

/// Layout a matrix was stored with on disk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StorageFormat {
    /// Compressed sparse rows
    #[default]
    Csr,
    /// Compressed sparse columns
    Csc,
    /// Dense 2d array
    Dense,
}

/// Matrix held in CSR layout together with its on-disk element type and layout.
#[derive(Clone, Debug, PartialEq)]
pub struct SparseMatrix {
    /// Row-major sparse values
    pub matrix: CsMat<f64>,
    /// Element type to write back
    pub elem_type: ElemType,
    /// Layout to write back
    pub format: StorageFormat,
}

impl SparseMatrix {
    /// Wrap a CSR matrix, stored as CSR
    pub fn new(matrix: CsMat<f64>, elem_type: ElemType) -> SparseMatrix {
        SparseMatrix {
            matrix,
            elem_type,
            format: StorageFormat::Csr,
        }
    }

    /// Same values, stored with `format`
    pub fn with_format(self, format: StorageFormat) -> SparseMatrix {
        SparseMatrix { format, ..self }
    }

    /// Copy restricted to the rows at `rows`, in the given order
    pub fn select_rows(&self, rows: &[usize]) -> SparseMatrix {
        SparseMatrix {
            matrix: select_rows(&self.matrix, rows),
            ..*self
        }
    }

    /// (rows, cols)
    pub fn shape(&self) -> (usize, usize) {
        self.matrix.shape()
    }
}

/// The unfiltered cells × genes matrix kept alongside the working one, with its own genes.
#[derive(Clone, Debug, PartialEq)]
pub struct RawMatrix {
    /// Expression values, cells × raw genes
    pub x: SparseMatrix,
    /// Raw gene identifiers
    pub var_names: Vec<String>,
    /// Per-gene metadata of the raw genes
    pub var: Frame,
    /// Per-gene dense arrays of the raw genes
    pub varm: BTreeMap<String, Array2<f64>>,
}

impl RawMatrix {
    fn validate(&self, n_obs: usize) -> Result<(), Error> {
        let n_vars = self.var_names.len();
        if self.x.shape() != (n_obs, n_vars) {
            bail!("raw X has shape {:?}, expected ({n_obs}, {n_vars})", self.x.shape());
        }
        self.var.check_rows(n_vars).map_err(|e| e.context("raw var"))?;
        for (key, arr) in &self.varm {
            if arr.nrows() != n_vars {
                bail!("raw varm['{key}'] has {} rows, expected {n_vars}", arr.nrows());
            }
        }
        Ok(())
    }
}

/// Cells × genes expression matrix with per-cell and per-gene annotations. Cells are identified by
/// `obs_names`, which are unique; all per-cell slots share the row order of `obs_names`.
#[derive(Clone, Debug)]
pub struct AnnMatrix {
    /// Unique cell identifiers
    pub obs_names: Vec<String>,
    /// Gene identifiers
    pub var_names: Vec<String>,
    /// Expression values, cells × genes
    pub x: SparseMatrix,
    /// Per-cell metadata
    pub obs: Frame,
    /// Per-gene metadata
    pub var: Frame,
    /// Per-cell dense arrays (embeddings)
    pub obsm: BTreeMap<String, Array2<f64>>,
    /// Per-cell tables stored in obsm
    pub obsm_frames: BTreeMap<String, Frame>,
    /// Per-gene dense arrays
    pub varm: BTreeMap<String, Array2<f64>>,
    /// Cell × cell sparse matrices (neighbor graphs)
    pub obsp: BTreeMap<String, SparseMatrix>,
    /// Gene × gene matrices
    pub varp: BTreeMap<String, SparseMatrix>,
    /// Alternative cells × genes matrices (e.g. raw counts)
    pub layers: BTreeMap<String, SparseMatrix>,
    /// Unfiltered matrix, if kept
    pub raw: Option<RawMatrix>,
}

impl AnnMatrix {
    /// Create a matrix with empty metadata. Fails if the shape of `x` does not match the names or if
    /// a cell identifier is repeated.
    pub fn new(obs_names: Vec<String>, var_names: Vec<String>, x: SparseMatrix) -> Result<AnnMatrix, Error> {
        let m = AnnMatrix {
            obs_names,
            var_names,
            x,
            obs: Frame::new(),
            var: Frame::new(),
            obsm: BTreeMap::new(),
            obsm_frames: BTreeMap::new(),
            varm: BTreeMap::new(),
            obsp: BTreeMap::new(),
            varp: BTreeMap::new(),
            layers: BTreeMap::new(),
            raw: None,
        };
        m.validate()?;
        Ok(m)
    }

    /// Number of cells
    pub fn n_obs(&self) -> usize {
        self.obs_names.len()
    }

    /// Number of genes
    pub fn n_vars(&self) -> usize {
        self.var_names.len()
    }

    /// Check that every slot agrees with the cell and gene counts and that cell identifiers are
    /// unique.
    pub fn validate(&self) -> Result<(), Error> {
        let (n_obs, n_vars) = (self.n_obs(), self.n_vars());
        if self.x.shape() != (n_obs, n_vars) {
            bail!(
                "X has shape {:?} but there are {n_obs} cells and {n_vars} genes",
                self.x.shape()
            );
        }
        if self.obs_index().len() != n_obs {
            bail!("cell identifiers are not unique");
        }
        self.obs.check_rows(n_obs).map_err(|e| e.context("obs"))?;
        self.var.check_rows(n_vars).map_err(|e| e.context("var"))?;
        for (key, arr) in &self.obsm {
            if arr.nrows() != n_obs {
                bail!("obsm['{key}'] has {} rows, expected {n_obs}", arr.nrows());
            }
        }
        for (key, frame) in &self.obsm_frames {
            frame.check_rows(n_obs).map_err(|e| e.context(format!("obsm['{key}']")))?;
        }
        for (key, arr) in &self.varm {
            if arr.nrows() != n_vars {
                bail!("varm['{key}'] has {} rows, expected {n_vars}", arr.nrows());
            }
        }
        for (key, mat) in &self.varp {
            if mat.shape() != (n_vars, n_vars) {
                bail!("varp['{key}'] has shape {:?}, expected ({n_vars}, {n_vars})", mat.shape());
            }
        }
        for (key, mat) in &self.obsp {
            if mat.shape() != (n_obs, n_obs) {
                bail!("obsp['{key}'] has shape {:?}, expected ({n_obs}, {n_obs})", mat.shape());
            }
        }
        for (key, mat) in &self.layers {
            if mat.shape() != (n_obs, n_vars) {
                bail!("layers['{key}'] has shape {:?}, expected ({n_obs}, {n_vars})", mat.shape());
            }
        }
        if let Some(raw) = &self.raw {
            raw.validate(n_obs)?;
        }
        Ok(())
    }

    /// Map from cell identifier to row
    pub fn obs_index(&self) -> HashMap<&str, usize> {
        self.obs_names.iter().enumerate().map(|(i, n)| (n.as_str(), i)).collect()
    }

    /// Column of a gene in `x`, if present
    pub fn var_position(&self, gene: &str) -> Option<usize> {
        self.var_names.iter().position(|g| g == gene)
    }

    /// Independent copy restricted to the cells at `rows`, in the given order. Every per-cell slot,
    /// `raw` included, is restricted the same way; cell × cell matrices are restricted on both axes.
    pub fn subset_obs(&self, rows: &[usize]) -> Result<AnnMatrix, Error> {
        if let Some(&bad) = rows.iter().find(|&&r| r >= self.n_obs()) {
            bail!("row {bad} out of range for {} cells", self.n_obs());
        }
        let subset = AnnMatrix {
            obs_names: rows.iter().map(|&r| self.obs_names[r].clone()).collect(),
            var_names: self.var_names.clone(),
            x: self.x.select_rows(rows),
            obs: self.obs.select(rows),
            var: self.var.clone(),
            obsm: self
                .obsm
                .iter()
                .map(|(k, a)| (k.clone(), a.select(Axis(0), rows)))
                .collect(),
            obsm_frames: self
                .obsm_frames
                .iter()
                .map(|(k, f)| (k.clone(), f.select(rows)))
                .collect(),
            varm: self.varm.clone(),
            obsp: self
                .obsp
                .iter()
                .map(|(k, m)| {
                    let matrix = select_square(&m.matrix, rows);
                    (k.clone(), SparseMatrix { matrix, ..*m })
                })
                .collect(),
            varp: self.varp.clone(),
            layers: self
                .layers
                .iter()
                .map(|(k, m)| (k.clone(), m.select_rows(rows)))
                .collect(),
            raw: self.raw.as_ref().map(|raw| RawMatrix {
                x: raw.x.select_rows(rows),
                ..raw.clone()
            }),
        };
        subset.validate()?;
        Ok(subset)
    }

    /// Label of every cell in the categorical or text column `key`. Fails if the column is missing,
    /// is not a label column, or leaves any cell without a value.
    pub fn obs_labels(&self, key: &str) -> Result<Vec<&str>, Error> {
        let column = self
            .obs
            .get(key)
            .ok_or_else(|| format_err!("obs column '{key}' not found"))?;
        let values = column
            .str_values()
            .ok_or_else(|| format_err!("obs column '{key}' is {}, not a label column", column.kind()))?;
        values
            .into_iter()
            .enumerate()
            .map(|(i, v)| v.ok_or_else(|| format_err!("cell '{}' has no value in '{key}'", self.obs_names[i])))
            .collect()
    }

    /// Store `labels` as a categorical obs column `key`, replacing any existing column.
    pub fn set_obs_labels<S: AsRef<str>>(&mut self, key: &str, labels: &[S]) -> Result<(), Error> {
        if labels.len() != self.n_obs() {
            bail!("{} labels given for {} cells", labels.len(), self.n_obs());
        }
        self.obs.insert(key, Column::from_labels(labels));
        Ok(())
    }

    /// Numeric values of the obs column `key`
    pub fn obs_numeric(&self, key: &str) -> Result<Vec<f64>, Error> {
        let column = self
            .obs
            .get(key)
            .ok_or_else(|| format_err!("obs column '{key}' not found"))?;
        column
            .numeric_values()
            .ok_or_else(|| format_err!("obs column '{key}' is {}, not numeric", column.kind()))
    }

    /// Expression of `gene` in every cell, or `None` if the gene is not in the matrix.
    pub fn gene_expression(&self, gene: &str) -> Option<Vec<f64>> {
        self.var_position(gene).map(|col| column_dense(&self.x.matrix, col))
    }

    /// Dense per-cell array `key` from obsm
    pub fn obsm_array(&self, key: &str) -> Result<&Array2<f64>, Error> {
        self.obsm.get(key).ok_or_else(|| {
            format_err!(
                "obsm['{key}'] not found, available: {:?}",
                self.obsm.keys().collect::<Vec<_>>()
            )
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sparse::csr_from_triplets;
    use ndarray::array;

    fn small() -> AnnMatrix {
        let x = csr_from_triplets((3, 2), &[0, 1, 2], &[0, 1, 0], &[1.0, 2.0, 3.0]).unwrap();
        let mut m = AnnMatrix::new(
            vec!["c0".into(), "c1".into(), "c2".into()],
            vec!["g0".into(), "g1".into()],
            SparseMatrix::new(x, ElemType::Float32),
        )
        .unwrap();
        m.set_obs_labels("leiden", &["0", "1", "0"]).unwrap();
        m.obs.insert("total_counts", Column::Float(vec![10.0, 20.0, 30.0]));
        m.obsm.insert("X_umap".into(), array![[0.0, 0.0], [1.0, 1.0], [2.0, 2.0]]);
        let g = csr_from_triplets((3, 3), &[0, 1, 2, 0], &[1, 0, 0, 2], &[1.0, 1.0, 1.0, 0.5]).unwrap();
        m.obsp.insert("connectivities".into(), SparseMatrix::new(g, ElemType::Float32));
        m
    }

    fn with_raw(mut m: AnnMatrix) -> AnnMatrix {
        let raw_x = csr_from_triplets((3, 3), &[0, 1, 2], &[2, 1, 0], &[4.0, 5.0, 6.0]).unwrap();
        m.raw = Some(RawMatrix {
            x: SparseMatrix::new(raw_x, ElemType::Int32).with_format(StorageFormat::Csc),
            var_names: vec!["g0".into(), "g1".into(), "g2".into()],
            var: Frame::new(),
            varm: BTreeMap::new(),
        });
        let mut qc = Frame::new();
        qc.insert("doublet_score", Column::Float(vec![0.1, 0.2, 0.3]));
        m.obsm_frames.insert("qc".into(), qc);
        m
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let x = csr_from_triplets((2, 1), &[], &[], &[]).unwrap();
        let res = AnnMatrix::new(
            vec!["a".into(), "a".into()],
            vec!["g".into()],
            SparseMatrix::new(x, ElemType::Float32),
        );
        assert!(res.is_err());
    }

    #[test]
    fn test_subset_restricts_every_slot() {
        let m = small();
        let s = m.subset_obs(&[2, 0]).unwrap();
        assert_eq!(s.obs_names, vec!["c2", "c0"]);
        assert_eq!(s.obs_labels("leiden").unwrap(), vec!["0", "0"]);
        assert_eq!(s.obs_numeric("total_counts").unwrap(), vec![30.0, 10.0]);
        assert_eq!(s.obsm["X_umap"], array![[2.0, 2.0], [0.0, 0.0]]);
        assert_eq!(s.gene_expression("g0").unwrap(), vec![3.0, 1.0]);
        assert_eq!(s.obsp["connectivities"].shape(), (2, 2));
        assert_eq!(s.obsp["connectivities"].matrix.get(0, 1), Some(&1.0));
        // the copy is independent of the parent
        assert_eq!(m.n_obs(), 3);
        assert!(m.subset_obs(&[3]).is_err());
    }

    #[test]
    fn test_subset_restricts_raw_and_obsm_frames() {
        let m = with_raw(small());
        m.validate().unwrap();
        let s = m.subset_obs(&[2, 1]).unwrap();
        let raw = s.raw.as_ref().unwrap();
        assert_eq!(raw.x.shape(), (2, 3));
        assert_eq!(raw.x.matrix.get(0, 0), Some(&6.0));
        assert_eq!(raw.x.matrix.get(1, 1), Some(&5.0));
        assert_eq!(raw.x.format, StorageFormat::Csc);
        assert_eq!(raw.var_names.len(), 3);
        assert_eq!(
            s.obsm_frames["qc"].get("doublet_score").unwrap().numeric_values().unwrap(),
            vec![0.3, 0.2]
        );
    }

    #[test]
    fn test_raw_rows_checked() {
        let mut m = with_raw(small());
        let short = csr_from_triplets((2, 3), &[], &[], &[]).unwrap();
        if let Some(raw) = m.raw.as_mut() {
            raw.x = SparseMatrix::new(short, ElemType::Float32);
        }
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_labels_errors() {
        let m = small();
        assert!(m.obs_labels("missing").is_err());
        assert!(m.obs_labels("total_counts").is_err());
        assert!(m.obs_numeric("leiden").is_err());
        assert!(m.obsm_array("X_scVI").is_err());
        assert!(m.gene_expression("nope").is_none());
    }

    #[test]
    fn test_set_labels_length_checked() {
        let mut m = small();
        assert!(m.set_obs_labels("cell_type", &["a"]).is_err());
        m.set_obs_labels("cell_type", &["a", "b", "a"]).unwrap();
        assert_eq!(m.obs_labels("cell_type").unwrap(), vec!["a", "b", "a"]);
    }
}
