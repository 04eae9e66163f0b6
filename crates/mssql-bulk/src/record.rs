//! Record access.
//!
//! The engine never inspects caller types directly: it reads property values,
//! writes back generated keys and reaches owned sub-records through the
//! [`Record`] trait. [`DynamicRecord`] is a map-backed implementation for
//! callers that do not want to implement the trait on their own types.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::value::SqlValue;

/// Failure reading or writing a single property.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValueError {
    #[error("unknown property '{0}'")]
    UnknownProperty(String),

    #[error("cannot convert value for '{property}': {message}")]
    Conversion { property: String, message: String },
}

impl ValueError {
    pub fn conversion(property: &str, message: impl Into<String>) -> Self {
        ValueError::Conversion {
            property: property.to_string(),
            message: message.into(),
        }
    }
}

/// A caller-supplied structured value of a known shape.
///
/// Shadow properties (foreign keys of owned children, private fields) are
/// exposed through the same accessors as ordinary ones.
pub trait Record: Send + Sync {
    /// Current value of an own property.
    fn value(&self, property: &str) -> Result<SqlValue, ValueError>;

    /// Store a value produced by the destination (generated keys).
    fn set_value(&mut self, property: &str, value: SqlValue) -> Result<(), ValueError>;

    /// Owned records behind a navigation; empty when absent.
    fn owned(&self, _navigation: &str) -> Vec<&dyn Record> {
        Vec::new()
    }

    /// Mutable access to owned records, used when propagating generated keys.
    fn owned_mut(&mut self, _navigation: &str) -> Vec<&mut dyn Record> {
        Vec::new()
    }
}

/// Record backed by ordered maps.
///
/// Unknown properties read as an error, so a shape/record mismatch surfaces
/// as a row mapping failure rather than silent NULLs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DynamicRecord {
    values: BTreeMap<String, SqlValue>,
    owned: BTreeMap<String, Vec<DynamicRecord>>,
}

impl DynamicRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, property: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.values.insert(property.into(), value.into());
        self
    }

    pub fn with_owned(mut self, navigation: impl Into<String>, record: DynamicRecord) -> Self {
        self.owned.entry(navigation.into()).or_default().push(record);
        self
    }

    pub fn with_many(
        mut self,
        navigation: impl Into<String>,
        records: impl IntoIterator<Item = DynamicRecord>,
    ) -> Self {
        self.owned
            .entry(navigation.into())
            .or_default()
            .extend(records);
        self
    }

    pub fn get(&self, property: &str) -> Option<&SqlValue> {
        self.values.get(property)
    }

    pub fn children(&self, navigation: &str) -> &[DynamicRecord] {
        self.owned.get(navigation).map(Vec::as_slice).unwrap_or(&[])
    }
}

impl Record for DynamicRecord {
    fn value(&self, property: &str) -> Result<SqlValue, ValueError> {
        self.values
            .get(property)
            .cloned()
            .ok_or_else(|| ValueError::UnknownProperty(property.to_string()))
    }

    fn set_value(&mut self, property: &str, value: SqlValue) -> Result<(), ValueError> {
        self.values.insert(property.to_string(), value);
        Ok(())
    }

    fn owned(&self, navigation: &str) -> Vec<&dyn Record> {
        self.children(navigation)
            .iter()
            .map(|r| r as &dyn Record)
            .collect()
    }

    fn owned_mut(&mut self, navigation: &str) -> Vec<&mut dyn Record> {
        match self.owned.get_mut(navigation) {
            Some(records) => records.iter_mut().map(|r| r as &mut dyn Record).collect(),
            None => Vec::new(),
        }
    }
}
