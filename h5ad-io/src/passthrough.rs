//! Verbatim copies of h5ad members that have no counterpart in the in-memory matrix.

use anyhow::{bail, Context, Error};
use hdf5::types::{FloatSize, IntSize, TypeDescriptor, VarLenAscii, VarLenUnicode};
use hdf5::{Attribute, Dataset, Group, H5Type, Location};
use log::warn;

/// Call `$copy::<T>($($arg),*)` with `T` the Rust type of HDF5 type `$descriptor`.
macro_rules! dispatch_type {
    ($descriptor:expr, $copy:ident, $($arg:expr),*) => {
        match $descriptor {
            TypeDescriptor::Integer(IntSize::U1) => $copy::<i8>($($arg),*),
            TypeDescriptor::Integer(IntSize::U2) => $copy::<i16>($($arg),*),
            TypeDescriptor::Integer(IntSize::U4) => $copy::<i32>($($arg),*),
            TypeDescriptor::Integer(IntSize::U8) => $copy::<i64>($($arg),*),
            TypeDescriptor::Unsigned(IntSize::U1) => $copy::<u8>($($arg),*),
            TypeDescriptor::Unsigned(IntSize::U2) => $copy::<u16>($($arg),*),
            TypeDescriptor::Unsigned(IntSize::U4) => $copy::<u32>($($arg),*),
            TypeDescriptor::Unsigned(IntSize::U8) => $copy::<u64>($($arg),*),
            TypeDescriptor::Float(FloatSize::U4) => $copy::<f32>($($arg),*),
            TypeDescriptor::Float(FloatSize::U8) => $copy::<f64>($($arg),*),
            TypeDescriptor::Boolean => $copy::<bool>($($arg),*),
            TypeDescriptor::VarLenUnicode => $copy::<VarLenUnicode>($($arg),*),
            TypeDescriptor::VarLenAscii => $copy::<VarLenAscii>($($arg),*),
            other => bail!("cannot copy values of type {other:?}"),
        }
    };
}

/// Copy member `name` of `src`, a group or a dataset, into `dst` under the same name, together with
/// its attributes and everything below it. Datasets of types that cannot be copied are skipped with
/// a warning.
pub(crate) fn copy_member(src: &Group, dst: &Group, name: &str) -> Result<(), Error> {
    if let Ok(ds) = src.dataset(name) {
        let descriptor = ds.dtype()?.to_descriptor()?;
        let copied = (|| -> Result<Dataset, Error> { dispatch_type!(descriptor, copy_dataset, &ds, dst, name) })();
        match copied {
            Ok(out) => copy_attrs(&ds, &out).with_context(|| name.to_string()),
            Err(e) => {
                warn!("not carrying over '{}': {e:#}", ds.name());
                Ok(())
            }
        }
    } else {
        let group = src.group(name)?;
        let out = dst.create_group(name)?;
        copy_attrs(&group, &out).with_context(|| name.to_string())?;
        for member in group.member_names()? {
            copy_member(&group, &out, &member)?;
        }
        Ok(())
    }
}

fn copy_dataset<T: H5Type>(src: &Dataset, dst: &Group, name: &str) -> Result<Dataset, Error> {
    if src.is_scalar() {
        let value = src.read_scalar::<T>()?;
        let out = dst.new_dataset::<T>().shape(()).create(name)?;
        out.write_scalar(&value)?;
        return Ok(out);
    }
    let values = src.read_dyn::<T>()?;
    Ok(dst.new_dataset_builder().with_data(&values).create(name)?)
}

fn copy_attrs(src: &Location, dst: &Location) -> Result<(), Error> {
    for name in src.attr_names()? {
        let attr = src.attr(&name)?;
        let descriptor = attr.dtype()?.to_descriptor()?;
        let copied = (|| -> Result<(), Error> { dispatch_type!(descriptor, copy_attr, &attr, dst, &name) })();
        if let Err(e) = copied {
            warn!("not carrying over attribute '{name}' of '{}': {e:#}", src.name());
        }
    }
    Ok(())
}

fn copy_attr<T: H5Type>(src: &Attribute, dst: &Location, name: &str) -> Result<(), Error> {
    if src.is_scalar() {
        let value = src.read_scalar::<T>()?;
        dst.new_attr::<T>().shape(()).create(name)?.write_scalar(&value)?;
    } else {
        let values = src.read_dyn::<T>()?;
        dst.new_attr_builder().with_data(&values).create(name)?;
    }
    Ok(())
}
