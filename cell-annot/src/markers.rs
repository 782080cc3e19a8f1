use adata_types::AnnMatrix;
use anyhow::{Context, Error};
use itertools::Itertools;
use log::{info, warn};
use serde::Deserialize;
use std::io::Read;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct MarkerRecord {
    cell_type: String,
    gene_identifier: String,
}

/// Marker genes per cell type, in file order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MarkerTable {
    rows: Vec<(String, String)>,
}

impl MarkerTable {
    /// Build a table from (cell type, gene) pairs
    pub fn new(rows: Vec<(String, String)>) -> MarkerTable {
        MarkerTable { rows }
    }

    /// Load a CSV file with (at least) `cell_type` and `gene_identifier` columns
    pub fn load(path: impl AsRef<Path>) -> Result<MarkerTable, Error> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).with_context(|| path.display().to_string())?;
        let table = MarkerTable::from_reader(file).with_context(|| format!("parsing {}", path.display()))?;
        info!(
            "loaded {} markers for {} cell types from {}",
            table.len(),
            table.cell_types().len(),
            path.display()
        );
        Ok(table)
    }

    /// Parse CSV from any reader
    pub fn from_reader<R: Read>(reader: R) -> Result<MarkerTable, Error> {
        let mut rdr = csv::Reader::from_reader(reader);
        let mut rows = Vec::new();
        for record in rdr.deserialize() {
            let MarkerRecord {
                cell_type,
                gene_identifier,
            } = record?;
            rows.push((cell_type, gene_identifier));
        }
        Ok(MarkerTable { rows })
    }

    /// Number of (cell type, gene) rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True if the table has no rows
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// (cell type, gene) rows
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.rows.iter().map(|(c, g)| (c.as_str(), g.as_str()))
    }

    /// Distinct cell types, in order of first appearance
    pub fn cell_types(&self) -> Vec<&str> {
        self.rows.iter().map(|(c, _)| c.as_str()).unique().collect()
    }

    /// Distinct marker genes, in order of first appearance
    pub fn genes(&self) -> Vec<&str> {
        self.rows.iter().map(|(_, g)| g.as_str()).unique().collect()
    }

    /// Rows whose cell type contains any of `patterns` (case-sensitive). An empty pattern list
    /// keeps every row.
    pub fn filter<S: AsRef<str>>(&self, patterns: &[S]) -> MarkerTable {
        if patterns.is_empty() {
            return self.clone();
        }
        let rows = self
            .rows
            .iter()
            .filter(|(c, _)| patterns.iter().any(|p| c.contains(p.as_ref())))
            .cloned()
            .collect();
        MarkerTable { rows }
    }

    /// Rows whose gene is measured in `adata`. Dropped genes are reported.
    pub fn genes_present(&self, adata: &AnnMatrix) -> MarkerTable {
        let known: std::collections::HashSet<&str> = adata.var_names.iter().map(String::as_str).collect();
        let (rows, missing): (Vec<_>, Vec<_>) = self
            .rows
            .iter()
            .cloned()
            .partition(|(_, g)| known.contains(g.as_str()));
        if !missing.is_empty() {
            warn!(
                "{} marker genes not found in the data: {}",
                missing.len(),
                missing.iter().map(|(_, g)| g).unique().join(", ")
            );
        }
        MarkerTable { rows }
    }
}
