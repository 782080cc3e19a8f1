use crate::encoding::{frame, kind, set_encoding, string_attr, to_varlen};
use crate::passthrough::copy_member;
use adata_types::{AnnMatrix, CategoryType, Column, ElemType, Frame, RawMatrix, SparseMatrix, StorageFormat};
use anyhow::{bail, Context, Error};
use hdf5::types::VarLenUnicode;
use hdf5::{Group, H5Type};
use log::{debug, info};
use ndarray::Array2;
use sprs::CsMat;
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

/// Top-level members written from the in-memory matrix
const MODELLED: [&str; 10] = ["X", "obs", "var", "obsm", "varm", "obsp", "varp", "layers", "raw", "uns"];

/// Write an annotated matrix to `path` in the h5ad layout, replacing any existing file. `uns` is
/// written empty.
pub fn write_h5ad(adata: &AnnMatrix, path: impl AsRef<Path>) -> Result<(), Error> {
    write(adata, None, path.as_ref())
}

/// Write an annotated matrix to `path` like [`write_h5ad`], carrying `uns` and every other member
/// the matrix does not model over unchanged from `source`, the file it was read from. `path` must
/// not be `source`.
pub fn write_h5ad_from(adata: &AnnMatrix, source: impl AsRef<Path>, path: impl AsRef<Path>) -> Result<(), Error> {
    let (source, path) = (source.as_ref(), path.as_ref());
    if let (Ok(a), Ok(b)) = (source.canonicalize(), path.canonicalize()) {
        if a == b {
            bail!("refusing to overwrite {} while copying from it", path.display());
        }
    }
    let src = hdf5::File::open(source).with_context(|| source.display().to_string())?;
    write(adata, Some(&*src), path)
}

fn write(adata: &AnnMatrix, source: Option<&Group>, path: &Path) -> Result<(), Error> {
    adata.validate()?;
    let file = hdf5::File::create(path).with_context(|| path.display().to_string())?;
    info!(
        "writing {} cells x {} genes to {}",
        adata.n_obs(),
        adata.n_vars(),
        path.display()
    );
    set_encoding(&file, kind::ANNDATA)?;

    write_matrix(&file, "X", &adata.x).context("writing X")?;
    write_frame(&file, "obs", &adata.obs_names, &adata.obs).context("writing obs")?;
    write_frame(&file, "var", &adata.var_names, &adata.var).context("writing var")?;
    let obsm = write_dense_dict(&file, "obsm", &adata.obsm).context("writing obsm")?;
    for (key, table) in &adata.obsm_frames {
        write_frame(&obsm, key, &adata.obs_names, table).with_context(|| format!("writing obsm['{key}']"))?;
    }
    write_dense_dict(&file, "varm", &adata.varm).context("writing varm")?;
    write_sparse_dict(&file, "obsp", &adata.obsp).context("writing obsp")?;
    write_sparse_dict(&file, "varp", &adata.varp).context("writing varp")?;
    write_sparse_dict(&file, "layers", &adata.layers).context("writing layers")?;
    if let Some(raw) = &adata.raw {
        write_raw(&file, raw).context("writing raw")?;
    }

    let mut has_uns = false;
    if let Some(source) = source {
        for name in source.member_names()? {
            if name != "uns" && MODELLED.contains(&name.as_str()) {
                continue;
            }
            debug!("carrying over '{name}'");
            copy_member(source, &file, &name).with_context(|| format!("copying '{name}'"))?;
            has_uns |= name == "uns";
        }
    }
    if !has_uns {
        set_encoding(&file.create_group("uns")?, kind::DICT)?;
    }
    Ok(())
}

fn write_array<T: H5Type>(group: &Group, name: &str, values: &[T]) -> Result<(), Error> {
    let ds = group.new_dataset::<T>().shape((values.len(),)).create(name)?;
    ds.write(values)?;
    set_encoding(&ds, kind::ARRAY)
}

fn write_strings(group: &Group, name: &str, values: &[String]) -> Result<(), Error> {
    let values = to_varlen(values)?;
    let ds = group.new_dataset::<VarLenUnicode>().shape((values.len(),)).create(name)?;
    ds.write(&values)?;
    set_encoding(&ds, kind::STRING_ARRAY)
}

fn write_2d<T: H5Type>(group: &Group, name: &str, values: &Array2<T>) -> Result<(), Error> {
    let values = values.as_standard_layout();
    let ds = group.new_dataset::<T>().shape(values.dim()).create(name)?;
    ds.write(&values)?;
    set_encoding(&ds, kind::ARRAY)
}

/// Values converted to the element type they are stored with
fn write_values(group: &Group, name: &str, values: &[f64], elem: ElemType) -> Result<(), Error> {
    match elem {
        ElemType::Float32 => write_array(group, name, &values.iter().map(|&v| v as f32).collect::<Vec<_>>()),
        ElemType::Float64 => write_array(group, name, values),
        ElemType::Int32 => write_array(group, name, &values.iter().map(|&v| v.round() as i32).collect::<Vec<_>>()),
        ElemType::Int64 => write_array(group, name, &values.iter().map(|&v| v.round() as i64).collect::<Vec<_>>()),
    }
}

/// Write a matrix in the layout it was read with.
fn write_matrix(parent: &Group, name: &str, m: &SparseMatrix) -> Result<(), Error> {
    match m.format {
        StorageFormat::Csr => write_compressed(parent, name, &m.matrix, m.elem_type, kind::CSR),
        StorageFormat::Csc => write_compressed(parent, name, &m.matrix.to_csc(), m.elem_type, kind::CSC),
        StorageFormat::Dense => {
            let dense = m.matrix.to_dense();
            match m.elem_type {
                ElemType::Float32 => write_2d(parent, name, &dense.mapv(|v| v as f32)),
                ElemType::Float64 => write_2d(parent, name, &dense),
                ElemType::Int32 => write_2d(parent, name, &dense.mapv(|v| v.round() as i32)),
                ElemType::Int64 => write_2d(parent, name, &dense.mapv(|v| v.round() as i64)),
            }
        }
    }
}

/// `compressed` is CSR for a csr_matrix and CSC for a csc_matrix; indptr runs over its outer axis.
fn write_compressed(
    parent: &Group,
    name: &str,
    compressed: &CsMat<f64>,
    elem: ElemType,
    encoding: &str,
) -> Result<(), Error> {
    let group = parent.create_group(name)?;
    set_encoding(&group, encoding)?;
    let (rows, cols) = compressed.shape();
    group
        .new_attr::<i64>()
        .shape((2,))
        .create("shape")?
        .write(&[rows as i64, cols as i64])?;

    write_values(&group, "data", compressed.data(), elem)?;
    let indices: Vec<i64> = compressed.indices().iter().map(|&i| i as i64).collect();
    write_array(&group, "indices", &indices)?;
    let mut indptr = Vec::with_capacity(compressed.outer_dims() + 1);
    indptr.push(0i64);
    for lane in compressed.outer_iterator() {
        indptr.push(indptr[indptr.len() - 1] + lane.nnz() as i64);
    }
    write_array(&group, "indptr", &indptr)
}

fn parse_categories<T>(categories: &[String]) -> Result<Vec<T>, Error>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    categories
        .iter()
        .map(|c| c.parse::<T>().with_context(|| format!("category '{c}'")))
        .collect()
}

fn write_column(group: &Group, name: &str, column: &Column) -> Result<(), Error> {
    match column {
        Column::Categorical {
            categories,
            codes,
            ordered,
            dtype,
        } => {
            let cat = group.create_group(name)?;
            set_encoding(&cat, kind::CATEGORICAL)?;
            cat.new_attr::<bool>().shape(()).create("ordered")?.write_scalar(ordered)?;
            match dtype {
                CategoryType::Text => write_strings(&cat, "categories", categories)?,
                CategoryType::Int => write_array(&cat, "categories", &parse_categories::<i64>(categories)?)?,
                CategoryType::Float => write_array(&cat, "categories", &parse_categories::<f64>(categories)?)?,
                CategoryType::Bool => write_array(&cat, "categories", &parse_categories::<bool>(categories)?)?,
            }
            write_array(&cat, "codes", codes)
        }
        Column::Float(v) => write_array(group, name, v),
        Column::Int(v) => write_array(group, name, v),
        Column::Bool(v) => write_array(group, name, v),
        Column::Text(v) => write_strings(group, name, v),
        Column::NullableInt { values, mask } => {
            let nullable = group.create_group(name)?;
            set_encoding(&nullable, kind::NULLABLE_INT)?;
            write_array(&nullable, "values", values)?;
            write_array(&nullable, "mask", mask)
        }
        Column::NullableBool { values, mask } => {
            let nullable = group.create_group(name)?;
            set_encoding(&nullable, kind::NULLABLE_BOOL)?;
            write_array(&nullable, "values", values)?;
            write_array(&nullable, "mask", mask)
        }
    }
}

fn write_frame(parent: &Group, name: &str, index: &[String], frame: &Frame) -> Result<(), Error> {
    let group = parent.create_group(name)?;
    set_encoding(&group, kind::DATAFRAME)?;
    string_attr(&group, frame::INDEX, &frame.index_name)?;
    let order: Vec<String> = frame.names().map(str::to_string).collect();
    if order.is_empty() {
        group.new_attr::<f64>().shape((0,)).create(frame::COLUMN_ORDER)?;
    } else {
        let order = to_varlen(&order)?;
        group
            .new_attr::<VarLenUnicode>()
            .shape((order.len(),))
            .create(frame::COLUMN_ORDER)?
            .write(&order)?;
    }
    write_strings(&group, &frame.index_name, index)?;
    for (col_name, column) in frame.iter() {
        write_column(&group, col_name, column).with_context(|| format!("column '{col_name}'"))?;
    }
    Ok(())
}

fn write_dense_dict(parent: &Group, name: &str, arrays: &BTreeMap<String, Array2<f64>>) -> Result<Group, Error> {
    let group = parent.create_group(name)?;
    set_encoding(&group, kind::DICT)?;
    for (key, arr) in arrays {
        write_2d(&group, key, arr).with_context(|| key.clone())?;
    }
    Ok(group)
}

fn write_sparse_dict(parent: &Group, name: &str, mats: &BTreeMap<String, SparseMatrix>) -> Result<(), Error> {
    let group = parent.create_group(name)?;
    set_encoding(&group, kind::DICT)?;
    for (key, m) in mats {
        write_matrix(&group, key, m).with_context(|| key.clone())?;
    }
    Ok(())
}

fn write_raw(parent: &Group, raw: &RawMatrix) -> Result<(), Error> {
    let group = parent.create_group("raw")?;
    set_encoding(&group, kind::RAW)?;
    write_matrix(&group, "X", &raw.x).context("writing X")?;
    write_frame(&group, "var", &raw.var_names, &raw.var).context("writing var")?;
    write_dense_dict(&group, "varm", &raw.varm).context("writing varm")?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::encoding::read_strings;
    use crate::read::read_h5ad;
    use adata_types::sparse::csr_from_triplets;
    use hdf5::types::{IntSize, TypeDescriptor};
    use ndarray::array;

    fn example() -> AnnMatrix {
        let x = csr_from_triplets((3, 2), &[0, 1, 2, 2], &[1, 0, 0, 1], &[3.0, 1.0, 7.0, 2.0]).unwrap();
        let mut adata = AnnMatrix::new(
            vec!["AAAC-1".into(), "AAAG-1".into(), "AACT-1".into()],
            vec!["CD3E".into(), "LYZ".into()],
            SparseMatrix::new(x.clone(), ElemType::Int32).with_format(StorageFormat::Dense),
        )
        .unwrap();
        adata.set_obs_labels("leiden", &["1", "0", "0"]).unwrap();
        adata.obs.insert("patient_id", Column::Text(vec!["P1".into(), "P1".into(), "P2".into()]));
        adata.obs.insert("total_counts", Column::Float(vec![3.0, 1.0, 9.0]));
        adata.obs.insert("is_doublet", Column::Bool(vec![false, false, true]));
        adata.obs.insert(
            "batch",
            Column::Categorical {
                categories: vec!["3".into(), "10".into()],
                codes: vec![1, 0, -1],
                ordered: true,
                dtype: CategoryType::Int,
            },
        );
        adata.obs.insert(
            "n_genes",
            Column::NullableInt {
                values: vec![2, 0, 5],
                mask: vec![false, true, false],
            },
        );
        adata.obsm.insert("X_umap".into(), array![[0.5, 1.0], [2.0, -1.0], [0.0, 0.0]]);
        let mut qc = Frame::new();
        qc.insert("doublet_score", Column::Float(vec![0.1, 0.2, 0.3]));
        adata.obsm_frames.insert("qc".into(), qc);
        adata.layers.insert("counts".into(), SparseMatrix::new(x, ElemType::Float32));
        let g = csr_from_triplets((3, 3), &[0, 1], &[1, 0], &[0.25, 0.25]).unwrap();
        adata.obsp.insert("connectivities".into(), SparseMatrix::new(g, ElemType::Float32));
        let gg = csr_from_triplets((2, 2), &[0], &[1], &[0.5]).unwrap();
        adata.varp.insert("coexpression".into(), SparseMatrix::new(gg, ElemType::Float64));
        let raw_x = csr_from_triplets((3, 3), &[0, 1, 2, 2], &[2, 0, 1, 2], &[4.0, 1.0, 7.0, 8.0]).unwrap();
        let mut raw_var = Frame::new();
        raw_var.insert("highly_variable", Column::Bool(vec![true, false, true]));
        adata.raw = Some(RawMatrix {
            x: SparseMatrix::new(raw_x, ElemType::Float32).with_format(StorageFormat::Csc),
            var_names: vec!["CD3E".into(), "LYZ".into(), "MT-CO1".into()],
            var: raw_var,
            varm: BTreeMap::new(),
        });
        adata
    }

    #[test]
    fn test_write_then_read() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("adata.h5ad");
        let adata = example();
        write_h5ad(&adata, &path)?;

        let back = read_h5ad(&path)?;
        assert_eq!(back.obs_names, adata.obs_names);
        assert_eq!(back.var_names, adata.var_names);
        assert_eq!(back.x, adata.x);
        assert_eq!(back.obs, adata.obs);
        assert_eq!(back.obsm, adata.obsm);
        assert_eq!(back.obsm_frames, adata.obsm_frames);
        assert_eq!(back.obsp, adata.obsp);
        assert_eq!(back.varp, adata.varp);
        assert_eq!(back.raw, adata.raw);
        assert_eq!(back.layers["counts"].elem_type, ElemType::Float32);
        assert_eq!(back.var.n_columns(), 0);

        // on-disk layout and dtypes are those of the input
        let file = hdf5::File::open(&path)?;
        let x = file.dataset("X")?;
        assert_eq!(x.shape(), vec![3, 2]);
        assert_eq!(x.dtype()?.to_descriptor()?, TypeDescriptor::Integer(IntSize::U4));
        let categories = file.dataset("obs/batch/categories")?;
        assert_eq!(categories.dtype()?.to_descriptor()?, TypeDescriptor::Integer(IntSize::U8));
        assert_eq!(categories.read_raw::<i64>()?, vec![3, 10]);
        assert_eq!(file.dataset("obs/n_genes/mask")?.read_raw::<bool>()?, vec![false, true, false]);
        assert_eq!(file.dataset("raw/X/indptr")?.size(), 4);
        Ok(())
    }

    #[test]
    fn test_unmodelled_members_carried_over() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let source = dir.path().join("in.h5ad");
        write_h5ad(&example(), &source)?;
        {
            let file = hdf5::File::open_rw(&source)?;
            let uns = file.group("uns")?;
            let colors = to_varlen(&["#1f77b4".to_string(), "#ff7f0e".to_string()])?;
            uns.new_dataset::<VarLenUnicode>()
                .shape((2,))
                .create("leiden_colors")?
                .write(&colors)?;
            let neighbors = uns.create_group("neighbors")?;
            string_attr(&neighbors, "method", "umap")?;
            neighbors.new_dataset::<i64>().shape(()).create("n_neighbors")?.write_scalar(&15i64)?;
            file.create_group("extra")?
                .new_dataset::<f32>()
                .shape((3,))
                .create("weights")?
                .write(&[0.5f32, 1.5, 2.5])?;
        }

        let adata = read_h5ad(&source)?.subset_obs(&[2, 0])?;
        let out = dir.path().join("out.h5ad");
        write_h5ad_from(&adata, &source, &out)?;

        let file = hdf5::File::open(&out)?;
        assert_eq!(
            read_strings(&file.dataset("uns/leiden_colors")?)?,
            vec!["#1f77b4", "#ff7f0e"]
        );
        let neighbors = file.group("uns/neighbors")?;
        assert_eq!(read_strings(&neighbors.attr("method")?)?, vec!["umap"]);
        assert_eq!(neighbors.dataset("n_neighbors")?.read_scalar::<i64>()?, 15);
        assert_eq!(file.dataset("extra/weights")?.read_raw::<f32>()?, vec![0.5, 1.5, 2.5]);

        let back = read_h5ad(&out)?;
        assert_eq!(back.obs_names, vec!["AACT-1", "AAAC-1"]);
        let raw = back.raw.as_ref().unwrap();
        assert_eq!(raw.x.shape(), (2, 3));
        assert_eq!(raw.x.matrix.get(0, 2), Some(&8.0));
        assert_eq!(back.obsm_frames["qc"].get("doublet_score"), Some(&Column::Float(vec![0.3, 0.1])));
        assert_eq!(back.varp["coexpression"].matrix.get(0, 1), Some(&0.5));
        Ok(())
    }

    #[test]
    fn test_refuses_to_overwrite_source() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("adata.h5ad");
        write_h5ad(&example(), &path)?;
        assert!(write_h5ad_from(&example(), &path, &path).is_err());
        assert_eq!(read_h5ad(&path)?.n_obs(), 3);
        Ok(())
    }

    #[test]
    fn test_missing_file() {
        let err = read_h5ad("/nonexistent/adata.h5ad").unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/adata.h5ad"));
    }
}
