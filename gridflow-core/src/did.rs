//! Data identifiers
//!
//! Every piece of data in GridFlow is addressed by a scoped identifier
//! (`scope:name`). An identifier names either a single file, a dataset of
//! files, or a container of datasets/containers. Replication rules target
//! any of the three; the rule engine flattens containers and datasets down
//! to their member files before placing replicas.

use crate::error::{GridFlowError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A scoped data identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DataIdentifier {
    pub scope: String,
    pub name: String,
}

impl DataIdentifier {
    pub fn new(scope: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            name: name.into(),
        }
    }

    /// Parse an identifier from its `scope:name` form
    pub fn parse(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some((scope, name)) if !scope.is_empty() && !name.is_empty() => {
                Ok(Self::new(scope, name))
            }
            _ => Err(GridFlowError::InvalidIdentifier(s.to_string())),
        }
    }
}

impl fmt::Display for DataIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope, self.name)
    }
}
