//! Index query arguments

use crate::error::Result;
use crate::key::{self, SEPARATOR};

/// Which slice of an index to read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexQueryArgs {
    /// Every entry whose computed key is `>= starting_key` (all entries if `None`).
    Range {
        /// Inclusive lower bound on the computed key
        starting_key: Option<String>,
    },
    /// Entries whose computed key starts with `prefix`, optionally from `starting_key`.
    Prefix {
        /// Required computed-key prefix
        prefix: String,
        /// Inclusive lower bound, clamped up to `prefix`
        starting_key: Option<String>,
    },
    /// Entries whose computed key equals `key`.
    Exact {
        /// Exact computed key
        key: String,
    },
}

impl Default for IndexQueryArgs {
    fn default() -> Self {
        IndexQueryArgs::Range { starting_key: None }
    }
}

/// An index query resolved to storage keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIndexQuery {
    /// First storage key to visit (inclusive)
    pub starting_key: String,
    /// Every matching storage key starts with this
    pub index_prefix: String,
}

impl ResolvedIndexQuery {
    /// True if `storage_key` belongs to the result set.
    pub fn contains(&self, storage_key: &str) -> bool {
        storage_key >= self.starting_key.as_str() && storage_key.starts_with(&self.index_prefix)
    }
}

impl IndexQueryArgs {
    /// Range over the whole index.
    pub fn all() -> Self {
        Self::default()
    }

    /// Range starting at `starting_key`.
    pub fn from_key(starting_key: impl Into<String>) -> Self {
        IndexQueryArgs::Range {
            starting_key: Some(starting_key.into()),
        }
    }

    /// Exact match on `key`.
    pub fn exact(key: impl Into<String>) -> Self {
        IndexQueryArgs::Exact { key: key.into() }
    }

    /// Prefix match on `prefix`.
    pub fn prefix(prefix: impl Into<String>) -> Self {
        IndexQueryArgs::Prefix {
            prefix: prefix.into(),
            starting_key: None,
        }
    }

    /// Resolve into storage keys for `entity_type` / `index_name`.
    pub fn resolve(&self, entity_type: &str, index_name: &str) -> Result<ResolvedIndexQuery> {
        let base = key::index_prefix(entity_type, index_name)?;
        Ok(match self {
            IndexQueryArgs::Range { starting_key } => ResolvedIndexQuery {
                starting_key: format!("{}{}", base, starting_key.as_deref().unwrap_or("")),
                index_prefix: base,
            },
            IndexQueryArgs::Prefix {
                prefix,
                starting_key,
            } => {
                let start = match starting_key {
                    Some(s) if s > prefix => s.as_str(),
                    _ => prefix.as_str(),
                };
                ResolvedIndexQuery {
                    starting_key: format!("{}{}", base, start),
                    index_prefix: format!("{}{}", base, prefix),
                }
            }
            IndexQueryArgs::Exact { key } => {
                let prefix = format!("{}{}{}", base, key, SEPARATOR);
                ResolvedIndexQuery {
                    starting_key: prefix.clone(),
                    index_prefix: prefix,
                }
            }
        })
    }
}
