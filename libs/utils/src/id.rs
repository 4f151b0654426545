use std::{fmt, str::FromStr};

use serde::{de, Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum IdError {
    #[error("invalid placement group id '{0}'")]
    PgParseError(String),
}

/// Unique ID of a storage node (an OSD). Assigned by the cluster monitor
/// when the daemon first joins the cluster.
#[derive(Clone, Copy, Eq, Ord, PartialEq, PartialOrd, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// ID of a storage pool. Pools carry placement policy and per-pool scrub
/// interval overrides.
#[derive(Clone, Copy, Eq, Ord, PartialEq, PartialOrd, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PoolId(pub u64);

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Placement group identifier: a pool plus the PG's ordinal within the pool.
///
/// Rendered as `<pool>.<seq-in-hex>`, e.g. `1.2a`, which is also the
/// serialized form used in dumps and on the wire.
#[derive(Clone, Copy, Eq, Ord, PartialEq, PartialOrd, Hash, Debug)]
pub struct PgId {
    pub pool: PoolId,
    pub seq: u32,
}

impl PgId {
    pub fn new(pool: PoolId, seq: u32) -> Self {
        PgId { pool, seq }
    }
}

impl fmt::Display for PgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:x}", self.pool, self.seq)
    }
}

impl FromStr for PgId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<PgId, Self::Err> {
        let bad = || IdError::PgParseError(s.to_owned());
        let (pool, seq) = s.split_once('.').ok_or_else(bad)?;
        let pool = pool.parse::<u64>().map_err(|_| bad())?;
        let seq = u32::from_str_radix(seq, 16).map_err(|_| bad())?;
        Ok(PgId::new(PoolId(pool), seq))
    }
}

impl Serialize for PgId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PgId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}
