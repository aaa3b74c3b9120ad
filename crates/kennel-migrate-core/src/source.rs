//! Read-only access to legacy tables.

use std::collections::BTreeMap;

use crate::{LegacyRecord, MigrateError};

/// Optional auxiliary table with `code,label` columns for course categories.
pub const COURSE_CATEGORIES_TABLE: &str = "course_categories";

pub trait LegacySource {
    /// Names of the tables this source can provide.
    ///
    /// # Errors
    /// Returns [`MigrateError::Source`] when the source cannot be enumerated.
    fn list_modules(&self) -> Result<Vec<String>, MigrateError>;

    /// Rows of `name` in export order. Tables that are not listed read as
    /// empty.
    ///
    /// # Errors
    /// Returns [`MigrateError::Source`] when a listed table cannot be read.
    fn read_module(&self, name: &str) -> Result<Vec<LegacyRecord>, MigrateError>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemorySource {
    tables: BTreeMap<String, Vec<LegacyRecord>>,
}

impl InMemorySource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_table(mut self, name: impl Into<String>, rows: Vec<LegacyRecord>) -> Self {
        self.tables.insert(name.into(), rows);
        self
    }
}

impl LegacySource for InMemorySource {
    fn list_modules(&self) -> Result<Vec<String>, MigrateError> {
        Ok(self.tables.keys().cloned().collect())
    }

    fn read_module(&self, name: &str) -> Result<Vec<LegacyRecord>, MigrateError> {
        Ok(self.tables.get(name).cloned().unwrap_or_default())
    }
}
