use anyhow::{bail, Context, Error};
use log::debug;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const DEFAULT_CPUS: usize = 2;
const DEFAULT_ADATA_PATH: &str = "../data/results/03_scvi/artifacts/adata_scvi_doublet_filtered.h5ad";
const DEFAULT_ARTIFACT_DIR: &str = "./artifacts";
const DEFAULT_MARKER_GENES_PATH: &str = "../tables/cell_type_markers.csv";

/// File name of the annotated output, relative to the artifact directory
pub const OUTPUT_FILE: &str = "adata_cell_types.h5ad";

/// Run parameters: worker threads and file locations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Params {
    /// Worker threads for numerical work
    pub cpus: usize,
    /// Input annotated matrix
    pub adata_path: PathBuf,
    /// Output directory
    pub artifact_dir: PathBuf,
    /// Marker gene table
    pub marker_genes_path: PathBuf,
}

impl Default for Params {
    fn default() -> Self {
        Params {
            cpus: DEFAULT_CPUS,
            adata_path: DEFAULT_ADATA_PATH.into(),
            artifact_dir: DEFAULT_ARTIFACT_DIR.into(),
            marker_genes_path: DEFAULT_MARKER_GENES_PATH.into(),
        }
    }
}

/// Values supplied by an external parameter source or the command line. Unset fields fall through
/// to the next source.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct ParamValues {
    /// see [`Params::cpus`]
    pub cpus: Option<usize>,
    /// see [`Params::adata_path`]
    pub adata_path: Option<PathBuf>,
    /// see [`Params::artifact_dir`]
    pub artifact_dir: Option<PathBuf>,
    /// see [`Params::marker_genes_path`]
    pub marker_genes_path: Option<PathBuf>,
    #[serde(flatten)]
    unknown: BTreeMap<String, Value>,
}

impl ParamValues {
    /// Parse a flat JSON object of parameters.
    pub fn from_json(json: &str) -> Result<ParamValues, Error> {
        let values: ParamValues = serde_json::from_str(json)?;
        for key in values.unknown.keys() {
            debug!("ignoring unknown parameter '{key}'");
        }
        Ok(values)
    }

    /// Read a parameter file
    pub fn load(path: impl AsRef<Path>) -> Result<ParamValues, Error> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).with_context(|| path.display().to_string())?;
        ParamValues::from_json(&json).with_context(|| format!("parsing parameters from {}", path.display()))
    }
}

impl Params {
    /// Resolve parameters: values from `overrides` win over values from `source`, and anything
    /// neither sets takes its default.
    pub fn resolve(source: Option<&ParamValues>, overrides: &ParamValues) -> Result<Params, Error> {
        let defaults = Params::default();
        let pick = |f: fn(&ParamValues) -> Option<PathBuf>, default: PathBuf| {
            f(overrides).or_else(|| source.and_then(f)).unwrap_or(default)
        };
        let params = Params {
            cpus: overrides
                .cpus
                .or_else(|| source.and_then(|s| s.cpus))
                .unwrap_or(defaults.cpus),
            adata_path: pick(|v| v.adata_path.clone(), defaults.adata_path),
            artifact_dir: pick(|v| v.artifact_dir.clone(), defaults.artifact_dir),
            marker_genes_path: pick(|v| v.marker_genes_path.clone(), defaults.marker_genes_path),
        };
        if params.cpus == 0 {
            bail!("cpus must be at least 1");
        }
        Ok(params)
    }

    /// Where the annotated matrix is written
    pub fn output_path(&self) -> PathBuf {
        self.artifact_dir.join(OUTPUT_FILE)
    }

    /// Where figures are written
    pub fn figures_dir(&self) -> PathBuf {
        self.artifact_dir.join("figures")
    }
}
