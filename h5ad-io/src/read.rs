use crate::encoding::{encoding_of, frame, has_attr, is_string_type, kind, read_strings};
use adata_types::sparse::{csr_from_triplets, from_compressed};
use adata_types::{AnnMatrix, CategoryType, Column, ElemType, Frame, RawMatrix, SparseMatrix, StorageFormat};
use anyhow::{bail, format_err, Context, Error};
use hdf5::types::{FloatSize, IntSize, TypeDescriptor};
use hdf5::{Container, Dataset, Group};
use log::{debug, info, warn};
use ndarray::Array2;
use std::collections::BTreeMap;
use std::path::Path;

/// Load an annotated matrix from an h5ad file. `uns` and any other member without a slot in
/// [`AnnMatrix`] is left on disk; [`crate::write::write_h5ad_from`] carries it over.
pub fn read_h5ad(path: impl AsRef<Path>) -> Result<AnnMatrix, Error> {
    let path = path.as_ref();
    let file = hdf5::File::open(path).with_context(|| path.display().to_string())?;
    info!("reading annotated matrix from {}", path.display());

    let (obs_names, obs) = read_frame(&file.group("obs")?).context("reading obs")?;
    let (var_names, var) = read_frame(&file.group("var")?).context("reading var")?;
    let shape = (obs_names.len(), var_names.len());
    let x = read_matrix(&file, "X", shape).context("reading X")?;

    let mut adata = AnnMatrix::new(obs_names, var_names, x)?;
    adata.obs = obs;
    adata.var = var;

    let members = file.member_names()?;
    for name in &members {
        match name.as_str() {
            "obs" | "var" | "X" => {}
            "obsm" => {
                let (arrays, frames) = read_obsm(&file.group(name)?, shape.0).context("reading obsm")?;
                adata.obsm = arrays;
                adata.obsm_frames = frames;
            }
            "varm" => adata.varm = read_dense_dict(&file.group(name)?)?,
            "obsp" => adata.obsp = read_sparse_dict(&file.group(name)?, (shape.0, shape.0))?,
            "varp" => adata.varp = read_sparse_dict(&file.group(name)?, (shape.1, shape.1))?,
            "layers" => adata.layers = read_sparse_dict(&file.group(name)?, shape)?,
            "raw" => adata.raw = Some(read_raw(&file.group(name)?, shape.0).context("reading raw")?),
            other => debug!("leaving '{other}' on disk"),
        }
    }
    adata.validate()?;
    info!(
        "loaded {} cells x {} genes ({} obs columns)",
        adata.n_obs(),
        adata.n_vars(),
        adata.obs.n_columns()
    );
    Ok(adata)
}

fn elem_type(ds: &Container) -> Result<ElemType, Error> {
    Ok(match ds.dtype()?.to_descriptor()? {
        TypeDescriptor::Float(FloatSize::U8) => ElemType::Float64,
        TypeDescriptor::Float(_) => ElemType::Float32,
        TypeDescriptor::Integer(IntSize::U8) | TypeDescriptor::Unsigned(IntSize::U8) => ElemType::Int64,
        TypeDescriptor::Integer(_) | TypeDescriptor::Unsigned(_) => ElemType::Int32,
        other => bail!("unsupported matrix element type {other:?}"),
    })
}

fn read_indices(ds: &Dataset) -> Result<Vec<usize>, Error> {
    ds.read_raw::<i64>()?
        .into_iter()
        .map(|v| usize::try_from(v).map_err(|_| format_err!("negative index {v}")))
        .collect()
}

/// Read a sparse (csr/csc group) or dense (2d dataset) matrix into CSR form, remembering the layout
/// it was stored with.
fn read_matrix(parent: &Group, name: &str, shape: (usize, usize)) -> Result<SparseMatrix, Error> {
    if let Ok(ds) = parent.dataset(name) {
        let elem = elem_type(&ds)?;
        let dense = ds.read_2d::<f64>()?;
        if dense.dim() != shape {
            bail!("dense matrix '{name}' has shape {:?}, expected {shape:?}", dense.dim());
        }
        let (mut rows, mut cols, mut vals) = (Vec::new(), Vec::new(), Vec::new());
        for ((r, c), &v) in dense.indexed_iter() {
            if v != 0.0 {
                rows.push(r);
                cols.push(c);
                vals.push(v);
            }
        }
        let matrix = csr_from_triplets(shape, &rows, &cols, &vals)?;
        return Ok(SparseMatrix::new(matrix, elem).with_format(StorageFormat::Dense));
    }

    let group = parent.group(name)?;
    let format = match encoding_of(&group)?.as_deref() {
        Some(kind::CSR) => StorageFormat::Csr,
        Some(kind::CSC) => StorageFormat::Csc,
        other => bail!("matrix '{name}' has unsupported encoding {other:?}"),
    };
    let stored_shape = group.attr("shape")?.read_raw::<i64>()?;
    if stored_shape.len() != 2 || stored_shape[0] as usize != shape.0 || stored_shape[1] as usize != shape.1 {
        bail!("matrix '{name}' has shape {stored_shape:?}, expected {shape:?}");
    }
    let data_ds = group.dataset("data")?;
    let elem = elem_type(&data_ds)?;
    let data = data_ds.read_raw::<f64>()?;
    let indices = read_indices(&group.dataset("indices")?)?;
    let indptr = read_indices(&group.dataset("indptr")?)?;
    let matrix = from_compressed(shape, &indptr, &indices, &data, format == StorageFormat::Csr)
        .with_context(|| format!("matrix '{name}'"))?;
    Ok(SparseMatrix::new(matrix, elem).with_format(format))
}

fn read_dense_dict(group: &Group) -> Result<BTreeMap<String, Array2<f64>>, Error> {
    let mut out = BTreeMap::new();
    for name in group.member_names()? {
        match group.dataset(&name) {
            Ok(ds) if ds.ndim() == 2 => {
                out.insert(name.clone(), ds.read_2d::<f64>().with_context(|| name.clone())?);
            }
            Ok(ds) => warn!("skipping '{name}' with {} dimensions", ds.ndim()),
            Err(_) => warn!("skipping non-array member '{name}'"),
        }
    }
    Ok(out)
}

/// obsm holds dense arrays and, from some tools, dataframes indexed by cell.
fn read_obsm(group: &Group, n_obs: usize) -> Result<(BTreeMap<String, Array2<f64>>, BTreeMap<String, Frame>), Error> {
    let mut arrays = BTreeMap::new();
    let mut frames = BTreeMap::new();
    for name in group.member_names()? {
        if let Ok(ds) = group.dataset(&name) {
            if ds.ndim() == 2 {
                arrays.insert(name.clone(), ds.read_2d::<f64>().with_context(|| name.clone())?);
            } else {
                warn!("skipping obsm['{name}'] with {} dimensions", ds.ndim());
            }
            continue;
        }
        let member = group.group(&name)?;
        if encoding_of(&member)?.as_deref() != Some(kind::DATAFRAME) {
            warn!("skipping obsm['{name}'], neither an array nor a dataframe");
            continue;
        }
        let (index, frame) = read_frame(&member).with_context(|| name.clone())?;
        if index.len() != n_obs {
            bail!("obsm['{name}'] has {} rows, expected {n_obs}", index.len());
        }
        frames.insert(name, frame);
    }
    Ok((arrays, frames))
}

fn read_sparse_dict(group: &Group, shape: (usize, usize)) -> Result<BTreeMap<String, SparseMatrix>, Error> {
    let mut out = BTreeMap::new();
    for name in group.member_names()? {
        let m = read_matrix(group, &name, shape).with_context(|| name.clone())?;
        out.insert(name, m);
    }
    Ok(out)
}

fn read_raw(group: &Group, n_obs: usize) -> Result<RawMatrix, Error> {
    let (var_names, var) = read_frame(&group.group("var")?).context("reading var")?;
    let x = read_matrix(group, "X", (n_obs, var_names.len())).context("reading X")?;
    let varm = match group.group("varm") {
        Ok(varm) => read_dense_dict(&varm)?,
        Err(_) => BTreeMap::new(),
    };
    Ok(RawMatrix {
        x,
        var_names,
        var,
        varm,
    })
}

/// Read a dataframe group, returning its index values and columns.
fn read_frame(group: &Group) -> Result<(Vec<String>, Frame), Error> {
    match encoding_of(group)?.as_deref() {
        Some(kind::DATAFRAME) => {}
        other => bail!("expected a dataframe, found encoding {other:?}"),
    }
    let mut frame = Frame::new();
    if has_attr(group, frame::INDEX)? {
        if let Some(name) = read_strings(&group.attr(frame::INDEX)?)?.into_iter().next() {
            frame.index_name = name;
        }
    }
    let index = read_strings(&group.dataset(&frame.index_name)?).context("reading index")?;

    let order = if has_attr(group, frame::COLUMN_ORDER)? {
        let attr = group.attr(frame::COLUMN_ORDER)?;
        // an empty column order is stored as an empty float array
        if is_string_type(&attr)? {
            read_strings(&attr)?
        } else {
            Vec::new()
        }
    } else {
        Vec::new()
    };

    for name in order {
        let column = read_column(group, &name).with_context(|| format!("column '{name}'"))?;
        if column.len() != index.len() {
            bail!("column '{name}' has {} rows, index has {}", column.len(), index.len());
        }
        frame.insert(&name, column);
    }
    Ok((index, frame))
}

fn read_array_column(ds: &Container) -> Result<Column, Error> {
    if is_string_type(ds)? {
        return Ok(Column::Text(read_strings(ds)?));
    }
    Ok(match ds.dtype()?.to_descriptor()? {
        TypeDescriptor::Float(_) => Column::Float(ds.read_raw::<f64>()?),
        TypeDescriptor::Integer(_) | TypeDescriptor::Unsigned(_) => Column::Int(ds.read_raw::<i64>()?),
        TypeDescriptor::Boolean => Column::Bool(ds.read_raw::<bool>()?),
        other => bail!("unsupported column type {other:?}"),
    })
}

fn read_column(parent: &Group, name: &str) -> Result<Column, Error> {
    if let Ok(ds) = parent.dataset(name) {
        return read_array_column(&ds);
    }
    let group = parent.group(name)?;
    match encoding_of(&group)?.as_deref() {
        Some(kind::CATEGORICAL) => {
            let (categories, dtype) = match read_array_column(&group.dataset("categories")?)? {
                Column::Text(v) => (v, CategoryType::Text),
                Column::Int(v) => (v.iter().map(ToString::to_string).collect(), CategoryType::Int),
                Column::Float(v) => (v.iter().map(ToString::to_string).collect(), CategoryType::Float),
                Column::Bool(v) => (v.iter().map(ToString::to_string).collect(), CategoryType::Bool),
                other => bail!("unsupported category type {}", other.kind()),
            };
            let codes = group.dataset("codes")?.read_raw::<i32>()?;
            let ordered = if has_attr(&group, "ordered")? {
                group.attr("ordered")?.read_scalar::<bool>()?
            } else {
                false
            };
            Ok(Column::Categorical {
                categories,
                codes,
                ordered,
                dtype,
            })
        }
        Some(kind::NULLABLE_INT) => Ok(Column::NullableInt {
            values: group.dataset("values")?.read_raw::<i64>()?,
            mask: group.dataset("mask")?.read_raw::<bool>()?,
        }),
        Some(kind::NULLABLE_BOOL) => Ok(Column::NullableBool {
            values: group.dataset("values")?.read_raw::<bool>()?,
            mask: group.dataset("mask")?.read_raw::<bool>()?,
        }),
        other => bail!("unsupported column encoding {other:?}"),
    }
}
