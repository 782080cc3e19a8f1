//! # h5ad-io: annotated matrices on disk
//!
//! Reads and writes [`adata_types::AnnMatrix`] in the h5ad layout (the anndata >= 0.8 on-disk
//! encoding). Groups the matrix does not model are carried over from the source file.

#![deny(missing_docs)]
#![deny(warnings)]

mod encoding;
mod passthrough;

/// h5ad -> AnnMatrix
pub mod read;
/// AnnMatrix -> h5ad
pub mod write;

pub use read::read_h5ad;
pub use write::{write_h5ad, write_h5ad_from};
