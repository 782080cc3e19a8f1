use crate::subcluster::select_rows;
use adata_types::AnnMatrix;
use anyhow::Error;
use log::info;
use serde::{Deserialize, Serialize};

/// Collapse every label containing `contains` into `label`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoarseRule {
    /// Substring to look for
    pub contains: String,
    /// Coarse label
    pub label: String,
}

impl CoarseRule {
    /// Rule mapping labels containing `contains` to `label`
    pub fn new(contains: &str, label: &str) -> CoarseRule {
        CoarseRule {
            contains: contains.to_string(),
            label: label.to_string(),
        }
    }
}

/// Copy of `adata` without the cells whose `obs[key]` is one of `exclude`. The remaining cells keep
/// their relative order.
pub fn remove_labels<S: AsRef<str>>(adata: &AnnMatrix, key: &str, exclude: &[S]) -> Result<AnnMatrix, Error> {
    let keep = select_rows(adata, key, |l| !exclude.iter().any(|e| e.as_ref() == l))?;
    info!(
        "removing {} of {} cells labelled {:?}",
        adata.n_obs() - keep.len(),
        adata.n_obs(),
        exclude.iter().map(AsRef::as_ref).collect::<Vec<_>>()
    );
    adata.subset_obs(&keep)
}

/// Coarse form of a label: the target of the first rule whose substring it contains, or the label
/// itself.
pub fn coarsen(label: &str, rules: &[CoarseRule]) -> String {
    rules
        .iter()
        .find(|r| label.contains(&r.contains))
        .map_or(label, |r| r.label.as_str())
        .to_string()
}

/// Write the coarse form of every label in `obs[label_key]` to `obs[coarse_key]`.
pub fn add_coarse_labels(
    adata: &mut AnnMatrix,
    label_key: &str,
    coarse_key: &str,
    rules: &[CoarseRule],
) -> Result<(), Error> {
    let coarse: Vec<String> = adata
        .obs_labels(label_key)?
        .into_iter()
        .map(|l| coarsen(l, rules))
        .collect();
    adata.set_obs_labels(coarse_key, &coarse)
}
