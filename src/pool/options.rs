/// Per-node options remembered across lookups
///
/// A topology refresh usually only knows host, port and role. Settings
/// learned earlier for the same node (credentials, client name, timeouts)
/// are carried forward unless the caller supplies new values.

use crate::core::NodeOptions;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct OptionsMemory {
    remembered: HashMap<String, NodeOptions>,
}

impl OptionsMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `supplied` over the remembered baseline for its key and
    /// remember the result. The first lookup of a key stores `supplied`
    /// as is.
    pub fn merge(&mut self, mut supplied: NodeOptions) -> NodeOptions {
        if let Some(baseline) = self.remembered.get(supplied.key()) {
            supplied.overrides.fill_from(&baseline.overrides);
        }
        self.remembered
            .insert(supplied.key().to_string(), supplied.clone());
        supplied
    }

    pub fn get(&self, key: &str) -> Option<&NodeOptions> {
        self.remembered.get(key)
    }

    pub fn len(&self) -> usize {
        self.remembered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.remembered.is_empty()
    }
}
