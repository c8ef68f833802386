//! Named test sequences and the criteria that judge them

use crate::criteria::{Criteria, LimitCriteria};
use eol_core::{EolError, Result, SequenceSpec};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct CatalogEntry {
    pub spec: Arc<SequenceSpec>,
    pub criteria: Arc<dyn Criteria>,
}

/// Sequences the engine can run by name. Fixed once the engine starts.
#[derive(Clone, Default)]
pub struct SequenceCatalog {
    entries: HashMap<String, CatalogEntry>,
}

impl SequenceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every spec with range criteria built from its limits
    pub fn from_specs(specs: impl IntoIterator<Item = SequenceSpec>) -> Result<Self> {
        let mut catalog = Self::new();
        for spec in specs {
            catalog.register(spec)?;
        }
        Ok(catalog)
    }

    pub fn register(&mut self, spec: SequenceSpec) -> Result<()> {
        let criteria = Arc::new(LimitCriteria::new(spec.limits.clone()));
        self.register_with(spec, criteria)
    }

    pub fn register_with(&mut self, spec: SequenceSpec, criteria: Arc<dyn Criteria>) -> Result<()> {
        spec.validate()?;
        if self.entries.contains_key(&spec.name) {
            return Err(EolError::Config(format!(
                "sequence '{}' registered twice",
                spec.name
            )));
        }
        self.entries.insert(
            spec.name.clone(),
            CatalogEntry {
                spec: Arc::new(spec),
                criteria,
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&CatalogEntry> {
        self.entries.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
