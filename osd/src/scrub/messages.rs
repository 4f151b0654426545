//! The replica-facing wire surface of the scrub subsystem.
//!
//! Serialization and delivery belong to the messenger; this module only
//! defines the message shapes and the transport trait the scrub machine
//! sends through.

use serde::{Deserialize, Serialize};
use utils::id::{NodeId, PgId};

/// Reservation traffic between a primary and its replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReserveOp {
    /// Primary asks a replica to set aside scrub resources.
    Request,
    Grant,
    Reject,
    /// Primary is done with the replica's resources.
    Release,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrubReserve {
    pub pgid: PgId,
    /// Interval the message belongs to; stale-epoch messages are dropped
    /// by the dispatcher before they reach the machine.
    pub epoch: u64,
    pub from: NodeId,
    pub op: ReserveOp,
}

/// A half-open range of object names within the PG.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScrubRange {
    pub begin: String,
    pub end: String,
}

/// Primary asks a replica to build its scrub map over a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaMapRequest {
    pub pgid: PgId,
    pub epoch: u64,
    pub from: NodeId,
    pub range: ScrubRange,
    pub deep: bool,
}

/// A replica's answer to a map request. The map payload itself travels out
/// of band with the object-store backend; the scheduler core only sees the
/// verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaMapReply {
    pub pgid: PgId,
    pub epoch: u64,
    pub from: NodeId,
    pub preempted: bool,
    pub error: Option<String>,
}

pub trait ScrubTransport: Send + Sync {
    fn send_reserve(&self, to: NodeId, msg: ScrubReserve);
    fn send_map_request(&self, to: NodeId, msg: ReplicaMapRequest);
    fn send_map_reply(&self, to: NodeId, msg: ReplicaMapReply);
}
