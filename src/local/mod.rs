//! Coroutine-local storage: string keys mapped to a closed set of payload
//! kinds, scoped to one coroutine and released when it finishes.

use crate::coroutine::current;
use crate::error::{CoroError, Result};

/// Payload kinds storable in coroutine-local storage.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
}

impl From<bool> for LocalValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for LocalValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for LocalValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for LocalValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for LocalValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<Vec<u8>> for LocalValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

/// Stores `value` under `key` in the calling coroutine's local storage,
/// replacing any previous value. Fails with [`CoroError::InvalidContext`]
/// outside a coroutine body.
pub fn set_specific(key: impl Into<String>, value: impl Into<LocalValue>) -> Result<()> {
    match current() {
        Some(co) => {
            co.set_local(key.into(), value.into());
            Ok(())
        }
        None => Err(CoroError::InvalidContext("set_specific")),
    }
}

/// Reads the calling coroutine's local value under `key`. `Ok(None)` when the
/// key was never set.
pub fn get_specific(key: &str) -> Result<Option<LocalValue>> {
    match current() {
        Some(co) => Ok(co.get_specific(key)),
        None => Err(CoroError::InvalidContext("get_specific")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversions() {
        assert_eq!(LocalValue::from(true), LocalValue::Bool(true));
        assert_eq!(LocalValue::from(7i64), LocalValue::Int(7));
        assert_eq!(LocalValue::from(1.5f64), LocalValue::Float(1.5));
        assert_eq!(LocalValue::from("id"), LocalValue::Str("id".to_string()));
        assert_eq!(
            LocalValue::from(vec![1u8, 2]),
            LocalValue::Bytes(vec![1, 2])
        );
    }

    #[test]
    fn test_specific_outside_coroutine_fails() {
        assert!(matches!(
            set_specific("key", 1i64),
            Err(CoroError::InvalidContext(_))
        ));
        assert!(matches!(
            get_specific("key"),
            Err(CoroError::InvalidContext(_))
        ));
    }
}
