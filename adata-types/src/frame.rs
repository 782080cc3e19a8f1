use anyhow::{bail, format_err, Error};
use itertools::Itertools;
use std::collections::HashMap;

/// Name of the index column used by anndata when none is given.
pub const DEFAULT_INDEX_NAME: &str = "_index";

/// On-disk type of the categories of a categorical column. Categories are held as strings in
/// memory and converted back to this type when written.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CategoryType {
    /// Strings
    #[default]
    Text,
    /// Integers
    Int,
    /// Floating point numbers
    Float,
    /// Booleans
    Bool,
}

impl CategoryType {
    /// Whether `label` can be stored as a category of this type
    pub fn accepts(self, label: &str) -> bool {
        match self {
            CategoryType::Text => true,
            CategoryType::Int => label.parse::<i64>().is_ok(),
            CategoryType::Float => label.parse::<f64>().is_ok(),
            CategoryType::Bool => label.parse::<bool>().is_ok(),
        }
    }
}

/// One column of a per-row metadata table.
#[derive(Clone, Debug, PartialEq)]
pub enum Column {
    /// Values drawn from a fixed set of categories.
    Categorical {
        /// Category names, referenced by position from `codes`.
        categories: Vec<String>,
        /// Per-row index into `categories`; -1 marks a missing value.
        codes: Vec<i32>,
        /// Whether the category order carries meaning.
        ordered: bool,
        /// Type the categories are stored as
        dtype: CategoryType,
    },
    /// Floating point values
    Float(Vec<f64>),
    /// Integer values
    Int(Vec<i64>),
    /// Boolean values
    Bool(Vec<bool>),
    /// Free text values
    Text(Vec<String>),
    /// Integer values, some missing
    NullableInt {
        /// Values; those under the mask are meaningless
        values: Vec<i64>,
        /// True where the value is missing
        mask: Vec<bool>,
    },
    /// Boolean values, some missing
    NullableBool {
        /// Values; those under the mask are meaningless
        values: Vec<bool>,
        /// True where the value is missing
        mask: Vec<bool>,
    },
}

impl Column {
    /// Build an unordered categorical column from string labels. Categories are sorted.
    pub fn from_labels<S: AsRef<str>>(labels: &[S]) -> Column {
        let categories: Vec<String> = labels
            .iter()
            .map(|s| s.as_ref().to_string())
            .sorted()
            .dedup()
            .collect();
        let codes = {
            let index: HashMap<&str, i32> = categories
                .iter()
                .enumerate()
                .map(|(i, c)| (c.as_str(), i as i32))
                .collect();
            labels.iter().map(|s| index[s.as_ref()]).collect()
        };
        Column::Categorical {
            categories,
            codes,
            ordered: false,
            dtype: CategoryType::Text,
        }
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        match self {
            Column::Categorical { codes, .. } => codes.len(),
            Column::Float(v) => v.len(),
            Column::Int(v) => v.len(),
            Column::Bool(v) => v.len(),
            Column::Text(v) => v.len(),
            Column::NullableInt { mask, .. } | Column::NullableBool { mask, .. } => mask.len(),
        }
    }

    /// True if the column has no rows
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Short name of the column kind, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Column::Categorical { .. } => "categorical",
            Column::Float(_) => "float",
            Column::Int(_) => "int",
            Column::Bool(_) => "bool",
            Column::Text(_) => "text",
            Column::NullableInt { .. } => "nullable int",
            Column::NullableBool { .. } => "nullable bool",
        }
    }

    /// String values of a categorical or text column. Missing categorical values are `None`.
    pub fn str_values(&self) -> Option<Vec<Option<&str>>> {
        match self {
            Column::Categorical { categories, codes, .. } => Some(
                codes
                    .iter()
                    .map(|&c| usize::try_from(c).ok().and_then(|c| categories.get(c)).map(String::as_str))
                    .collect(),
            ),
            Column::Text(v) => Some(v.iter().map(|s| Some(s.as_str())).collect()),
            _ => None,
        }
    }

    /// Numeric view of a float, int or bool column. Missing values are NaN.
    pub fn numeric_values(&self) -> Option<Vec<f64>> {
        fn masked(values: impl Iterator<Item = f64>, mask: &[bool]) -> Vec<f64> {
            values.zip(mask).map(|(v, &m)| if m { f64::NAN } else { v }).collect()
        }
        match self {
            Column::Float(v) => Some(v.clone()),
            Column::Int(v) => Some(v.iter().map(|&x| x as f64).collect()),
            Column::Bool(v) => Some(v.iter().map(|&x| if x { 1.0 } else { 0.0 }).collect()),
            Column::NullableInt { values, mask } => Some(masked(values.iter().map(|&x| x as f64), mask)),
            Column::NullableBool { values, mask } => Some(masked(
                values.iter().map(|&x| if x { 1.0 } else { 0.0 }),
                mask,
            )),
            _ => None,
        }
    }

    /// Copy of the rows at `rows`, in the given order. Categorical columns keep all of their
    /// categories, including ones no longer used.
    pub fn select(&self, rows: &[usize]) -> Column {
        fn pick<T: Clone>(v: &[T], rows: &[usize]) -> Vec<T> {
            rows.iter().map(|&r| v[r].clone()).collect()
        }
        match self {
            Column::Categorical {
                categories,
                codes,
                ordered,
                dtype,
            } => Column::Categorical {
                categories: categories.clone(),
                codes: pick(codes, rows),
                ordered: *ordered,
                dtype: *dtype,
            },
            Column::Float(v) => Column::Float(pick(v, rows)),
            Column::Int(v) => Column::Int(pick(v, rows)),
            Column::Bool(v) => Column::Bool(pick(v, rows)),
            Column::Text(v) => Column::Text(pick(v, rows)),
            Column::NullableInt { values, mask } => Column::NullableInt {
                values: pick(values, rows),
                mask: pick(mask, rows),
            },
            Column::NullableBool { values, mask } => Column::NullableBool {
                values: pick(values, rows),
                mask: pick(mask, rows),
            },
        }
    }

    /// Overwrite the value of row `row` of a categorical column with `label`, adding `label` to the
    /// categories if it is new. Categories stored as numbers or booleans become text when `label`
    /// is not one.
    pub fn set_label(&mut self, row: usize, label: &str) -> Result<(), Error> {
        match self {
            Column::Categorical {
                categories, codes, dtype, ..
            } => {
                if row >= codes.len() {
                    bail!("row {row} out of range for column of length {}", codes.len());
                }
                let code = match categories.iter().position(|c| c == label) {
                    Some(code) => code,
                    None => {
                        if !dtype.accepts(label) {
                            *dtype = CategoryType::Text;
                        }
                        categories.push(label.to_string());
                        categories.len() - 1
                    }
                };
                codes[row] = code as i32;
                Ok(())
            }
            Column::Text(v) => {
                let len = v.len();
                *v.get_mut(row)
                    .ok_or_else(|| format_err!("row {row} out of range for column of length {len}"))? =
                    label.to_string();
                Ok(())
            }
            other => bail!("cannot store a label in a {} column", other.kind()),
        }
    }
}

/// Ordered collection of named columns sharing one row count. The row identifiers themselves are
/// kept by the owning matrix; only the name of the index column is stored here.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    /// Name under which the row identifiers are stored on disk.
    pub index_name: String,
    columns: Vec<(String, Column)>,
}

impl Default for Frame {
    fn default() -> Self {
        Frame {
            index_name: DEFAULT_INDEX_NAME.to_string(),
            columns: Vec::new(),
        }
    }
}

impl Frame {
    /// Empty frame with the default index name
    pub fn new() -> Frame {
        Frame::default()
    }

    /// Column names in order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(n, _)| n.as_str())
    }

    /// Iterate over (name, column) pairs in order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Column)> {
        self.columns.iter().map(|(n, c)| (n.as_str(), c))
    }

    /// Number of columns
    pub fn n_columns(&self) -> usize {
        self.columns.len()
    }

    /// Look up a column by name
    pub fn get(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, c)| c)
    }

    /// Look up a column by name, mutably
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Column> {
        self.columns.iter_mut().find(|(n, _)| n == name).map(|(_, c)| c)
    }

    /// Insert a column. An existing column of the same name is replaced in place, otherwise the
    /// column is appended.
    pub fn insert(&mut self, name: &str, column: Column) {
        match self.get_mut(name) {
            Some(existing) => *existing = column,
            None => self.columns.push((name.to_string(), column)),
        }
    }

    /// Remove a column, returning it if present.
    pub fn remove(&mut self, name: &str) -> Option<Column> {
        let pos = self.columns.iter().position(|(n, _)| n == name)?;
        Some(self.columns.remove(pos).1)
    }

    /// Copy of the frame restricted to `rows`, in the given order.
    pub fn select(&self, rows: &[usize]) -> Frame {
        Frame {
            index_name: self.index_name.clone(),
            columns: self.columns.iter().map(|(n, c)| (n.clone(), c.select(rows))).collect(),
        }
    }

    /// Check that every column has `n_rows` rows.
    pub fn check_rows(&self, n_rows: usize) -> Result<(), Error> {
        for (name, col) in &self.columns {
            if col.len() != n_rows {
                bail!("column '{name}' has {} rows, expected {n_rows}", col.len());
            }
        }
        Ok(())
    }
}
