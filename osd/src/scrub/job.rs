//! Per-PG scrub scheduling records.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use strum_macros::IntoStaticStr;
use utils::id::{NodeId, PgId};

/// Registration state of a job with respect to the OSD's scrub queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum QueueState {
    NotRegistered = 0,
    Registered = 1,
    /// Removal was requested; the queue erases the entry lazily on the
    /// next ready-to-scrub sweep.
    Unregistering = 2,
}

impl QueueState {
    fn from_u8(v: u8) -> QueueState {
        match v {
            0 => QueueState::NotRegistered,
            1 => QueueState::Registered,
            2 => QueueState::Unregistering,
            _ => unreachable!("invalid queue state discriminant"),
        }
    }
}

/// The earliest time a periodic scrub may be proposed for. Distinct from
/// the zero time, which serves as the "unset" sentinel.
pub fn scrub_must_stamp() -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(1)
}

/// The "unset" sentinel for schedule fields.
pub fn zero_time() -> SystemTime {
    UNIX_EPOCH
}

pub(crate) fn unix_seconds(t: SystemTime) -> f64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// When the job should be scrubbed, and until when the scrub may be
/// postponed. A zero deadline means "no deadline".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrubSchedule {
    pub scheduled_at: SystemTime,
    pub deadline: SystemTime,
}

impl Default for ScrubSchedule {
    fn default() -> Self {
        ScrubSchedule {
            scheduled_at: zero_time(),
            deadline: zero_time(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MustScrub {
    Mandatory,
    NotMandatory,
}

/// Scheduling inputs for one job, derived from operator requests, PG state
/// and pool options. Zero intervals fall back to the OSD-wide config.
#[derive(Debug, Clone, Copy)]
pub struct SchedParams {
    pub proposed_time: SystemTime,
    pub min_interval: Duration,
    pub max_interval: Duration,
    pub is_must: MustScrub,
}

impl Default for SchedParams {
    fn default() -> Self {
        SchedParams {
            proposed_time: zero_time(),
            min_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            is_must: MustScrub::NotMandatory,
        }
    }
}

/// The slice of PG state the scheduler consults when proposing a scrub
/// time.
#[derive(Debug, Clone, Copy)]
pub struct PgScrubbingInfo {
    pub last_scrub_stamp: SystemTime,
    pub stats_invalid: bool,
}

/// Operator/peering requests affecting the next scrub of a PG.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestedScrub {
    pub must_scrub: bool,
    pub need_auto: bool,
}

struct SchedFields {
    schedule: ScrubSchedule,
    penalty_timeout: SystemTime,
}

/// Per-PG scheduling record, shared between the PG and the OSD-wide scrub
/// queue.
///
/// `state` and the flag fields are atomics so that the PG side may update
/// them without taking the queue lock; the schedule itself is guarded by
/// the job's own mutex.
pub struct ScrubJob {
    pub pgid: PgId,
    /// The node the job belongs to. For logging.
    pub whoami: NodeId,

    state: AtomicU8,
    /// Mirrors queue membership: true iff the job sits in one of the two
    /// lanes.
    pub in_queues: AtomicBool,
    /// Set by the scrub machine when replica reservation failed; makes the
    /// next sweep move the job to the penalty lane.
    pub resources_failure: AtomicBool,
    /// Set whenever the schedule is refreshed. Pardons a penalized job on
    /// the next sweep.
    pub updated: AtomicBool,

    sched: Mutex<SchedFields>,
}

pub type ScrubJobRef = Arc<ScrubJob>;

impl ScrubJob {
    pub fn new(pgid: PgId, whoami: NodeId) -> ScrubJobRef {
        Arc::new(ScrubJob {
            pgid,
            whoami,
            state: AtomicU8::new(QueueState::NotRegistered as u8),
            in_queues: AtomicBool::new(false),
            resources_failure: AtomicBool::new(false),
            updated: AtomicBool::new(false),
            sched: Mutex::new(SchedFields {
                schedule: ScrubSchedule::default(),
                penalty_timeout: zero_time(),
            }),
        })
    }

    pub fn state(&self) -> QueueState {
        QueueState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: QueueState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// CAS on the registration state; returns whether the transition was
    /// made.
    pub fn compare_exchange_state(&self, from: QueueState, to: QueueState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn schedule(&self) -> ScrubSchedule {
        self.sched.lock().unwrap().schedule
    }

    /// Install a freshly computed schedule and raise the pardon signal.
    pub fn update_schedule(&self, schedule: ScrubSchedule) {
        self.sched.lock().unwrap().schedule = schedule;
        self.updated.store(true, Ordering::SeqCst);
    }

    pub fn penalty_timeout(&self) -> SystemTime {
        self.sched.lock().unwrap().penalty_timeout
    }

    pub fn set_penalty_timeout(&self, timeout: SystemTime) {
        self.sched.lock().unwrap().penalty_timeout = timeout;
    }

    pub fn dump(&self) -> ScrubJobDump {
        let sched = self.sched.lock().unwrap();
        ScrubJobDump {
            pgid: self.pgid,
            state: self.state().into(),
            scheduled_at: unix_seconds(sched.schedule.scheduled_at),
            deadline: unix_seconds(sched.schedule.deadline),
            resources_failure: self.resources_failure.load(Ordering::SeqCst),
            penalty_timeout: unix_seconds(sched.penalty_timeout),
        }
    }
}

impl std::fmt::Debug for ScrubJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state: &'static str = self.state().into();
        f.debug_struct("ScrubJob")
            .field("pgid", &self.pgid)
            .field("state", &state)
            .field("schedule", &self.schedule())
            .finish_non_exhaustive()
    }
}

/// One record of the `dump_scrubs` output. Timestamps are unix seconds.
#[derive(Debug, Clone, Serialize)]
pub struct ScrubJobDump {
    pub pgid: PgId,
    pub state: &'static str,
    pub scheduled_at: f64,
    pub deadline: f64,
    pub resources_failure: bool,
    pub penalty_timeout: f64,
}
