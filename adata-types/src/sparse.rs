use anyhow::{bail, Error};
use sprs::{CsMat, TriMat};

/// Build a CSR matrix from coordinate triplets. Duplicate coordinates are summed and the column
/// indices of every row come out sorted, whatever order the triplets arrive in.
pub fn csr_from_triplets(
    shape: (usize, usize),
    rows: &[usize],
    cols: &[usize],
    values: &[f64],
) -> Result<CsMat<f64>, Error> {
    if rows.len() != cols.len() || rows.len() != values.len() {
        bail!(
            "triplet arrays differ in length: {} rows, {} cols, {} values",
            rows.len(),
            cols.len(),
            values.len()
        );
    }
    let mut tri = TriMat::with_capacity(shape, values.len());
    for ((&r, &c), &v) in rows.iter().zip(cols).zip(values) {
        if r >= shape.0 || c >= shape.1 {
            bail!("entry ({r}, {c}) outside of a {} x {} matrix", shape.0, shape.1);
        }
        tri.add_triplet(r, c, v);
    }
    Ok(tri.to_csr())
}

/// Build a CSR matrix from compressed parts (`indptr`, `indices`, `data`) of the given major axis.
/// `csr = false` interprets the parts as CSC. Row entries may be unsorted.
pub fn from_compressed(
    shape: (usize, usize),
    indptr: &[usize],
    indices: &[usize],
    data: &[f64],
    csr: bool,
) -> Result<CsMat<f64>, Error> {
    let n_outer = if csr { shape.0 } else { shape.1 };
    if indptr.len() != n_outer + 1 {
        bail!("indptr has {} entries, expected {}", indptr.len(), n_outer + 1);
    }
    if indices.len() != data.len() {
        bail!("{} indices but {} values", indices.len(), data.len());
    }
    let mut rows = Vec::with_capacity(data.len());
    let mut cols = Vec::with_capacity(data.len());
    for outer in 0..n_outer {
        let (start, end) = (indptr[outer], indptr[outer + 1]);
        if start > end || end > indices.len() {
            bail!("indptr is not monotone or overruns the index array at {outer}");
        }
        for &inner in &indices[start..end] {
            if csr {
                rows.push(outer);
                cols.push(inner);
            } else {
                rows.push(inner);
                cols.push(outer);
            }
        }
    }
    csr_from_triplets(shape, &rows, &cols, data)
}

/// Copy of the rows `rows` of a CSR matrix, in the given order.
pub fn select_rows(mat: &CsMat<f64>, rows: &[usize]) -> CsMat<f64> {
    let mut indptr = Vec::with_capacity(rows.len() + 1);
    let mut indices = Vec::new();
    let mut data = Vec::new();
    indptr.push(0);
    for &r in rows {
        if let Some(row) = mat.outer_view(r) {
            for (c, &v) in row.iter() {
                indices.push(c);
                data.push(v);
            }
        }
        indptr.push(indices.len());
    }
    CsMat::new((rows.len(), mat.cols()), indptr, indices, data)
}

/// Copy of the square (cell × cell) matrix restricted to `rows` on both axes. Entries whose column
/// is not selected are dropped; columns are renumbered to positions within `rows`.
pub fn select_square(mat: &CsMat<f64>, rows: &[usize]) -> CsMat<f64> {
    let mut new_pos = vec![None; mat.cols()];
    for (i, &r) in rows.iter().enumerate() {
        new_pos[r] = Some(i);
    }
    let mut indptr = Vec::with_capacity(rows.len() + 1);
    let mut indices = Vec::new();
    let mut data = Vec::new();
    let mut entries: Vec<(usize, f64)> = Vec::new();
    indptr.push(0);
    for &r in rows {
        entries.clear();
        if let Some(row) = mat.outer_view(r) {
            entries.extend(row.iter().filter_map(|(c, &v)| new_pos[c].map(|c| (c, v))));
        }
        entries.sort_by_key(|&(c, _)| c);
        for &(c, v) in &entries {
            indices.push(c);
            data.push(v);
        }
        indptr.push(indices.len());
    }
    CsMat::new((rows.len(), rows.len()), indptr, indices, data)
}

/// Dense copy of one column of a CSR matrix.
pub fn column_dense(mat: &CsMat<f64>, col: usize) -> Vec<f64> {
    (0..mat.rows())
        .map(|r| mat.get(r, col).copied().unwrap_or(0.0))
        .collect()
}
