//! # cell-annot: curated cell-type annotation of integrated single-cell data
//!
//! Clusters cells over a batch-corrected latent representation, labels clusters from a curated
//! mapping, refines selected compartments by subclustering, drops unwanted populations and adds
//! coarse labels. Numeric kernels are reached through the [`Backend`] trait.

#![deny(missing_docs)]
#![deny(warnings)]

/// Clustering and cluster-to-label annotation
pub mod annotate;

/// Numeric kernels the workflow depends on
pub mod backend;

/// Removal of unwanted populations and coarse labels
pub mod cleanup;

/// HTML figures for inspection
pub mod figures;

/// Curated cluster-to-label mappings
pub mod mapping;

/// Marker gene tables
pub mod markers;

/// Run parameters
pub mod params;

/// The annotation workflow
pub mod pipeline;

/// Curated annotation plans
pub mod plan;

/// Pseudobulk aggregation and gene ranking
pub mod pseudobulk;

/// Subset selection, re-processing and label integration
pub mod subcluster;

/// Global worker pool
pub mod threads;

#[cfg(test)]
mod test_util;

pub use backend::{Backend, GeneTest};
pub use figures::FigureWriter;
pub use mapping::{ClusterId, LabelMapping};
pub use markers::MarkerTable;
pub use params::{ParamValues, Params};
pub use pipeline::{run, RunSummary};
pub use plan::AnnotationPlan;
pub use threads::{init_thread_pool, ThreadBudget};
