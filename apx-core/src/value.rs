// SPDX-License-Identifier: MIT
// Copyright (c) 2025 the apx authors

use crate::ApxError;
use std::collections::HashMap;

/// Scalar leaf of a dynamic value tree.
#[derive(Debug, Clone, PartialEq)]
pub enum DtlScalar {
    None,
    Bool(bool),
    U32(u32),
    I32(i32),
    Str(String),
}

/// Dynamically typed value tree: the input of a pack program and the output
/// of an unpack program. The VM walks the tree by reference and never takes
/// ownership of it.
#[derive(Debug, Clone, PartialEq)]
pub enum DtlValue {
    Scalar(DtlScalar),
    Array(Vec<DtlValue>),
    Record(HashMap<String, DtlValue>),
}

impl DtlScalar {
    /// Coerce to u32. Booleans map to 0/1, non-negative signed values pass
    /// through, everything else is a value error.
    pub fn to_u32(&self) -> Result<u32, ApxError> {
        match self {
            DtlScalar::U32(v) => Ok(*v),
            DtlScalar::I32(v) if *v >= 0 => Ok(*v as u32),
            DtlScalar::Bool(v) => Ok(u32::from(*v)),
            _ => Err(ApxError::ValueError),
        }
    }

    pub fn to_i32(&self) -> Result<i32, ApxError> {
        match self {
            DtlScalar::I32(v) => Ok(*v),
            DtlScalar::U32(v) if *v <= i32::MAX as u32 => Ok(*v as i32),
            DtlScalar::Bool(v) => Ok(i32::from(*v)),
            _ => Err(ApxError::ValueError),
        }
    }

    pub fn to_bool(&self) -> Result<bool, ApxError> {
        match self {
            DtlScalar::Bool(v) => Ok(*v),
            DtlScalar::U32(v) => Ok(*v != 0),
            DtlScalar::I32(v) => Ok(*v != 0),
            _ => Err(ApxError::ValueError),
        }
    }

    pub fn as_str(&self) -> Result<&str, ApxError> {
        match self {
            DtlScalar::Str(s) => Ok(s),
            _ => Err(ApxError::ValueError),
        }
    }
}

impl DtlValue {
    pub fn u32(v: u32) -> Self {
        DtlValue::Scalar(DtlScalar::U32(v))
    }

    pub fn i32(v: i32) -> Self {
        DtlValue::Scalar(DtlScalar::I32(v))
    }

    pub fn bool(v: bool) -> Self {
        DtlValue::Scalar(DtlScalar::Bool(v))
    }

    pub fn str(v: impl Into<String>) -> Self {
        DtlValue::Scalar(DtlScalar::Str(v.into()))
    }

    pub fn array(items: Vec<DtlValue>) -> Self {
        DtlValue::Array(items)
    }

    pub fn record<K: Into<String>>(pairs: Vec<(K, DtlValue)>) -> Self {
        DtlValue::Record(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn as_scalar(&self) -> Result<&DtlScalar, ApxError> {
        match self {
            DtlValue::Scalar(s) => Ok(s),
            _ => Err(ApxError::DvTypeError),
        }
    }

    pub fn as_array(&self) -> Result<&[DtlValue], ApxError> {
        match self {
            DtlValue::Array(a) => Ok(a),
            _ => Err(ApxError::DvTypeError),
        }
    }

    pub fn as_record(&self) -> Result<&HashMap<String, DtlValue>, ApxError> {
        match self {
            DtlValue::Record(r) => Ok(r),
            _ => Err(ApxError::DvTypeError),
        }
    }

    /// Child value under `key`, for record values.
    pub fn get(&self, key: &str) -> Result<&DtlValue, ApxError> {
        self.as_record()?
            .get(key)
            .ok_or_else(|| ApxError::KeyNotFound(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_coercion() {
        assert_eq!(DtlScalar::U32(7).to_u32().unwrap(), 7);
        assert_eq!(DtlScalar::I32(7).to_u32().unwrap(), 7);
        assert_eq!(DtlScalar::Bool(true).to_u32().unwrap(), 1);
        assert!(DtlScalar::I32(-1).to_u32().is_err());
        assert!(DtlScalar::Str("x".into()).to_u32().is_err());
    }

    #[test]
    fn test_record_access() {
        let v = DtlValue::record(vec![("Red", DtlValue::u32(0xff))]);
        assert_eq!(v.get("Red").unwrap(), &DtlValue::u32(0xff));
        match v.get("Green") {
            Err(ApxError::KeyNotFound(k)) => assert_eq!(k, "Green"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
