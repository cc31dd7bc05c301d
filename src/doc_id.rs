use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Minimum number of hex digits shown in the display form.
const SHORT_LEN: usize = 6;

/// Identifier of one ingested document.
///
/// Ids are allocated from a counter that is persisted with the knowledge base
/// and never rewinds, so an id is never handed out twice, even after the
/// document it named has been removed.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct DocumentId(u64);

impl DocumentId {
    /// Wrap a raw numeric id. Only the knowledge base allocates new ids; this
    /// is for keys read back from storage and for tests.
    pub fn from_raw(numeric: u64) -> Self {
        Self(numeric)
    }

    /// The numeric key used in the redb tables.
    pub fn numeric(self) -> u64 {
        self.0
    }

    /// The id that follows this one in allocation order.
    pub(crate) fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:0width$x}", self.0, width = SHORT_LEN)
    }
}

impl FromStr for DocumentId {
    type Err = Error;

    /// Parse `#00002a`, `00002a` or `2a`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s.trim().trim_start_matches('#');
        if hex.is_empty() {
            return Err(Error::Config("empty document id".to_string()));
        }
        u64::from_str_radix(hex, 16)
            .map(Self)
            .map_err(|e| Error::Config(format!("invalid document id '{s}': {e}")))
    }
}
