use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter, IntCounterVec,
    IntGauge,
};

pub(crate) static SCHEDULER_OPS_ENQUEUED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "osd_scheduler_ops_enqueued_total",
        "Ops accepted by the op scheduler, by scheduler class",
        &["class"]
    )
    .expect("failed to define a metric")
});

pub(crate) static SCHEDULER_OPS_DEQUEUED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "osd_scheduler_ops_dequeued_total",
        "Ops handed to worker threads by the op scheduler, by scheduler class",
        &["class"]
    )
    .expect("failed to define a metric")
});

pub(crate) static SCRUBS_STARTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "osd_scrubs_started_total",
        "Scrub sessions initiated by this OSD as a primary"
    )
    .expect("failed to define a metric")
});

pub(crate) static SCRUB_JOBS_PENALIZED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "osd_scrub_jobs_penalized_total",
        "Scrub jobs moved to the penalty lane after failing replica reservation"
    )
    .expect("failed to define a metric")
});

pub(crate) static SCRUB_RESERVATION_REPLIES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "osd_scrub_reservation_replies_total",
        "Replies this OSD sent to primaries requesting scrub reservations",
        &["outcome"]
    )
    .expect("failed to define a metric")
});

pub(crate) static SCRUB_BLOCKED_PGS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "osd_scrub_blocked_pgs",
        "PGs whose scrub is stuck waiting on a locked object range"
    )
    .expect("failed to define a metric")
});

pub(crate) static SCRUB_LOCAL_RESERVATIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "osd_scrub_local_reservations",
        "Scrubs this OSD is currently running as a primary"
    )
    .expect("failed to define a metric")
});

pub(crate) static SCRUB_REMOTE_RESERVATIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "osd_scrub_remote_reservations",
        "Scrub reservations this OSD has granted to remote primaries"
    )
    .expect("failed to define a metric")
});
