//! # adata-types: in-memory annotated single-cell matrix
//!
//! A cells × genes expression matrix together with its per-cell and per-gene metadata,
//! mirroring the slots of an h5ad file.

#![deny(missing_docs)]
#![deny(warnings)]

/// Ordered per-row metadata tables (obs / var)
pub mod frame;

/// The annotated matrix aggregate
pub mod matrix;

/// Sparse matrix helpers for row selection
pub mod sparse;

pub use frame::{CategoryType, Column, Frame};
pub use matrix::{AnnMatrix, ElemType, RawMatrix, SparseMatrix, StorageFormat};
