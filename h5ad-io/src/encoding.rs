use anyhow::{bail, Error};
use hdf5::types::{TypeDescriptor, VarLenAscii, VarLenUnicode};
use hdf5::{Container, Location};
use std::str::FromStr;

pub(crate) const ENCODING_TYPE: &str = "encoding-type";
pub(crate) const ENCODING_VERSION: &str = "encoding-version";

pub(crate) mod kind {
    pub(crate) const ANNDATA: &str = "anndata";
    pub(crate) const ARRAY: &str = "array";
    pub(crate) const CATEGORICAL: &str = "categorical";
    pub(crate) const CSC: &str = "csc_matrix";
    pub(crate) const CSR: &str = "csr_matrix";
    pub(crate) const DATAFRAME: &str = "dataframe";
    pub(crate) const DICT: &str = "dict";
    pub(crate) const NULLABLE_BOOL: &str = "nullable-boolean";
    pub(crate) const NULLABLE_INT: &str = "nullable-integer";
    pub(crate) const RAW: &str = "raw";
    pub(crate) const STRING_ARRAY: &str = "string-array";
}

pub(crate) mod frame {
    pub(crate) const INDEX: &str = "_index";
    pub(crate) const COLUMN_ORDER: &str = "column-order";
}

/// Version string written for each encoding type.
pub(crate) fn version_of(encoding: &str) -> &'static str {
    match encoding {
        kind::ANNDATA | kind::CSR | kind::CSC | kind::DICT | kind::NULLABLE_BOOL | kind::NULLABLE_INT | kind::RAW => {
            "0.1.0"
        }
        _ => "0.2.0",
    }
}

pub(crate) fn has_attr(loc: &Location, name: &str) -> Result<bool, Error> {
    Ok(loc.attr_names()?.iter().any(|n| n == name))
}

/// Read a string dataset or attribute, whichever variable-length flavour it was written with.
pub(crate) fn read_strings(c: &Container) -> Result<Vec<String>, Error> {
    let strings = match c.dtype()?.to_descriptor()? {
        TypeDescriptor::VarLenUnicode => c
            .read_raw::<VarLenUnicode>()?
            .into_iter()
            .map(|s| s.as_str().to_string())
            .collect(),
        TypeDescriptor::VarLenAscii => c
            .read_raw::<VarLenAscii>()?
            .into_iter()
            .map(|s| s.as_str().to_string())
            .collect(),
        other => bail!("expected variable-length strings, found {other:?}"),
    };
    Ok(strings)
}

pub(crate) fn is_string_type(c: &Container) -> Result<bool, Error> {
    Ok(matches!(
        c.dtype()?.to_descriptor()?,
        TypeDescriptor::VarLenUnicode | TypeDescriptor::VarLenAscii
    ))
}

/// The `encoding-type` attribute of `loc`, if it has one.
pub(crate) fn encoding_of(loc: &Location) -> Result<Option<String>, Error> {
    if !has_attr(loc, ENCODING_TYPE)? {
        return Ok(None);
    }
    Ok(read_strings(&loc.attr(ENCODING_TYPE)?)?.into_iter().next())
}

pub(crate) fn string_attr(loc: &Location, name: &str, value: &str) -> Result<(), Error> {
    let attr = loc.new_attr::<VarLenUnicode>().shape(()).create(name)?;
    attr.write_scalar(&VarLenUnicode::from_str(value)?)?;
    Ok(())
}

pub(crate) fn set_encoding(loc: &Location, encoding: &str) -> Result<(), Error> {
    string_attr(loc, ENCODING_TYPE, encoding)?;
    string_attr(loc, ENCODING_VERSION, version_of(encoding))
}

pub(crate) fn to_varlen(strings: &[String]) -> Result<Vec<VarLenUnicode>, Error> {
    strings
        .iter()
        .map(|s| Ok(VarLenUnicode::from_str(s)?))
        .collect()
}
