use std::fmt;
use std::str::FromStr;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Numeric identity of an item in the remote graph (`Q42` is `EntityId(42)`).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EntityId(pub u64);

impl EntityId {
    pub fn numeric(self) -> u64 {
        self.0
    }

    /// Accepts `Q42`, `q42`, `42` and entity URIs such as
    /// `http://www.wikidata.org/entity/Q42`.
    pub fn parse(value: &str) -> Option<Self> {
        let trimmed = value.trim();
        let tail = trimmed.rsplit('/').next().unwrap_or(trimmed);
        let digits = tail
            .strip_prefix('Q')
            .or_else(|| tail.strip_prefix('q'))
            .unwrap_or(tail);
        if digits.is_empty() || !digits.bytes().all(|byte| byte.is_ascii_digit()) {
            return None;
        }
        digits.parse::<u64>().ok().filter(|id| *id > 0).map(Self)
    }

    pub fn as_sql(self) -> i64 {
        i64::try_from(self.0).unwrap_or(i64::MAX)
    }

    pub fn from_sql(value: i64) -> Option<Self> {
        u64::try_from(value).ok().filter(|id| *id > 0).map(Self)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "Q{}", self.0)
    }
}

impl FromStr for EntityId {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match Self::parse(value) {
            Some(id) => Ok(id),
            None => bail!("invalid entity id: {value}"),
        }
    }
}
