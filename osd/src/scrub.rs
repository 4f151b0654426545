//! Scrub scheduling and initiation for the OSD.
//!
//! [`OsdScrub`] owns the OSD-wide pieces: the queue of scrub jobs, the
//! resource counters, and the per-tick gating (random backoff, resources,
//! load, time windows, recovery activity). Each tick initiates at most one
//! scrub; everything per-PG then runs in that PG's
//! [`machine::ScrubMachine`].

pub mod job;
pub mod machine;
pub mod messages;
pub mod queue;
pub mod resources;
pub mod timer;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Local, Timelike};
use rand::Rng;
use tracing::{debug, info, trace};
use utils::id::{NodeId, PgId};

use crate::config::{ConfigHandle, PoolScrubOptions};
use crate::metrics::SCRUBS_STARTED;

use self::job::{PgScrubbingInfo, RequestedScrub, SchedParams, ScrubJobDump, ScrubJobRef};
use self::machine::ScrubStartKind;
use self::queue::ScrubQueue;
use self::resources::ScrubResources;

/// Outcome of trying to select a PG and scrub it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleResult {
    ScrubInitiated,
    /// this specific target cannot be scrubbed right now; try the next one
    TargetSpecificFailure,
    /// no target can be scrubbed this tick
    OsdWideFailure,
}

/// What kinds of scrubs the current OSD-wide conditions still allow.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsdRestrictions {
    /// recovery is active and config only tolerates operator-requested
    /// repairs
    pub allow_requested_repair_only: bool,
    pub high_priority_only: bool,
    /// load or the time window forbid regular scrubs; overdue ones only
    pub only_deadlined: bool,
}

/// The OSD services the scrub scheduler consumes: PG locking and identity.
pub trait ScrubSchedListener: Send + Sync {
    fn node_id(&self) -> NodeId;

    /// Lock the named PG, returning a guard that unlocks on drop. None if
    /// the PG is gone or cannot be locked.
    fn get_locked_pg(&self, pgid: PgId) -> Option<Box<dyn LockedPg + '_>>;
}

/// Operations available on a locked PG.
pub trait LockedPg {
    fn is_scrub_queued_or_active(&self) -> bool;
    /// whether the PG's pending scrub request asks for a repair
    fn is_repair_requested(&self) -> bool;
    /// post the start event into the PG's scrub machine
    fn start_scrubbing(&mut self, kind: ScrubStartKind);
    /// re-derive the PG's scrub schedule after a config change
    fn on_scrub_schedule_input_change(&mut self);
}

/// A 24-hour decaying average of the CPU load, and the "is the load low
/// enough to scrub" verdict derived from it.
pub struct LoadTracker {
    conf: ConfigHandle,
    whoami: NodeId,
    daily_loadavg: Mutex<Option<f64>>,
    cpu_count: usize,
}

impl LoadTracker {
    pub fn new(conf: ConfigHandle, whoami: NodeId) -> Self {
        LoadTracker {
            conf,
            whoami,
            daily_loadavg: Mutex::new(None),
            cpu_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }

    fn read_loadavg() -> Option<f64> {
        let contents = std::fs::read_to_string("/proc/loadavg").ok()?;
        contents.split_whitespace().next()?.parse().ok()
    }

    /// Fold a fresh sample into the decaying daily average and return
    /// 100x the result (the logger interface wants percent-like values).
    /// None if the load is not available on this platform.
    pub fn update_load_average(&self) -> Option<f64> {
        let sample = Self::read_loadavg()?;
        Some(self.update_from_sample(sample))
    }

    pub(crate) fn update_from_sample(&self, sample: f64) -> f64 {
        let mut daily = self.daily_loadavg.lock().unwrap();
        let updated = match *daily {
            None => sample,
            // one-second cadence against a 24-hour horizon
            Some(prev) => (prev * (86400.0 - 1.0) + sample) / 86400.0,
        };
        *daily = Some(updated);
        100.0 * updated
    }

    pub fn scrub_load_below_threshold(&self) -> bool {
        match Self::read_loadavg() {
            None => false,
            Some(loadavg) => self.load_is_low(loadavg),
        }
    }

    pub(crate) fn load_is_low(&self, loadavg: f64) -> bool {
        let per_cpu = loadavg / self.cpu_count as f64;
        if per_cpu < self.conf.get().osd_scrub_load_threshold {
            return true;
        }
        // also fine if the load is dropping below its daily average
        if let Some(daily) = *self.daily_loadavg.lock().unwrap() {
            if loadavg < daily {
                return true;
            }
        }
        debug!(
            osd = %self.whoami,
            loadavg,
            per_cpu,
            "load too high for scrubbing"
        );
        false
    }

    #[cfg(test)]
    fn with_cpu_count(mut self, cpu_count: usize) -> Self {
        self.cpu_count = cpu_count;
        self
    }
}

/// True iff `val` is inside the half-open `[begin, end)` window, wrapping
/// around the modulus. `begin == end` permits everything.
fn time_in_window(begin: u32, end: u32, val: u32) -> bool {
    if begin == end {
        true
    } else if begin < end {
        begin <= val && val < end
    } else {
        val >= begin || val < end
    }
}

/// Scrub initiation logic, off-loaded from the OSD proper.
pub struct OsdScrub {
    conf: ConfigHandle,
    osd_service: Arc<dyn ScrubSchedListener>,
    whoami: NodeId,

    resource_bookkeeper: ScrubResources,
    queue: ScrubQueue,
    load_tracker: LoadTracker,
}

impl OsdScrub {
    pub fn new(conf: ConfigHandle, osd_service: Arc<dyn ScrubSchedListener>) -> Self {
        let whoami = osd_service.node_id();
        OsdScrub {
            resource_bookkeeper: ScrubResources::new(conf.clone()),
            queue: ScrubQueue::new(conf.clone(), whoami),
            load_tracker: LoadTracker::new(conf.clone(), whoami),
            conf,
            osd_service,
            whoami,
        }
    }

    /// Called periodically by the OSD tick: select the first scrub-eligible
    /// PG, if any, and start scrubbing it.
    pub fn initiate_scrub(&self, is_recovery_active: bool, now: SystemTime) {
        if self.scrub_random_backoff() {
            trace!(osd = %self.whoami, "scrub tick skipped by the random backoff");
            return;
        }
        let Some(restrictions) = self.restrictions_on_scrubbing(is_recovery_active, now) else {
            return;
        };

        let targets = self.queue.ready_to_scrub(restrictions, now);
        if targets.is_empty() {
            trace!(osd = %self.whoami, "no scrub targets are ripe");
            return;
        }

        let mut initiated = false;
        for pgid in targets {
            match self.initiate_a_scrub(pgid, restrictions.allow_requested_repair_only) {
                ScheduleResult::ScrubInitiated => {
                    SCRUBS_STARTED.inc();
                    initiated = true;
                    break;
                }
                ScheduleResult::TargetSpecificFailure => continue,
                ScheduleResult::OsdWideFailure => break,
            }
        }
        if !initiated {
            // every candidate was offered its chance, the penalized ones
            // included; start the next sweep from a clean slate
            self.queue.set_restore_penalized();
        }
    }

    /// The OSD-wide gates: resource counters, the reserving-now flag,
    /// recovery activity, CPU load and the time window. None means no
    /// scrub may start this tick; otherwise the returned flags restrict
    /// which jobs qualify.
    fn restrictions_on_scrubbing(
        &self,
        is_recovery_active: bool,
        now: SystemTime,
    ) -> Option<OsdRestrictions> {
        if !self.resource_bookkeeper.can_inc_scrubs() {
            debug!(osd = %self.whoami, "scrub resources saturated");
            return None;
        }
        if self.queue.is_reserving_now() {
            debug!(osd = %self.whoami, "a pg is reserving replicas, not initiating");
            return None;
        }

        let conf = self.conf.get();
        let mut restrictions = OsdRestrictions::default();
        if is_recovery_active && !conf.osd_scrub_during_recovery {
            if !conf.osd_repair_during_recovery {
                debug!(osd = %self.whoami, "recovery in progress, not scrubbing");
                return None;
            }
            restrictions.allow_requested_repair_only = true;
            restrictions.high_priority_only = true;
        }

        let load_ok = self.load_tracker.scrub_load_below_threshold();
        let time_ok = self.scrub_time_permit(now);
        if !load_ok || !time_ok {
            restrictions.only_deadlined = true;
            debug!(
                osd = %self.whoami,
                load_ok,
                time_ok,
                "only overdue scrubs are allowed now"
            );
        }
        Some(restrictions)
    }

    /// Initiate a scrub on one specific PG, verifying under the PG lock
    /// that it is still eligible.
    fn initiate_a_scrub(&self, pgid: PgId, allow_requested_repair_only: bool) -> ScheduleResult {
        let Some(mut pg) = self.osd_service.get_locked_pg(pgid) else {
            debug!(%pgid, "pg is gone or cannot be locked, skipping");
            return ScheduleResult::TargetSpecificFailure;
        };
        if pg.is_scrub_queued_or_active() {
            debug!(%pgid, "pg is already scrubbing, skipping");
            return ScheduleResult::TargetSpecificFailure;
        }
        if allow_requested_repair_only && !pg.is_repair_requested() {
            debug!(
                %pgid,
                "only repair-requested scrubs are allowed now, skipping"
            );
            return ScheduleResult::TargetSpecificFailure;
        }

        info!(osd = %self.whoami, %pgid, "initiating a scrub");
        pg.start_scrubbing(ScrubStartKind::Regular);
        ScheduleResult::ScrubInitiated
    }

    /// Roll a dice: proceed with probability `osd_scrub_backoff_ratio`,
    /// skip the tick otherwise.
    fn scrub_random_backoff(&self) -> bool {
        let ratio = self.conf.get().osd_scrub_backoff_ratio.clamp(0.0, 1.0);
        !rand::thread_rng().gen_bool(ratio)
    }

    /// True iff the local wall time falls inside the configured
    /// day-of-week and hour windows.
    pub fn scrub_time_permit(&self, t: SystemTime) -> bool {
        use chrono::Datelike;
        let conf = self.conf.get();
        let local: DateTime<Local> = t.into();
        let day_permit = time_in_window(
            conf.osd_scrub_begin_week_day,
            conf.osd_scrub_end_week_day,
            local.weekday().num_days_from_sunday(),
        );
        let hour_permit = time_in_window(
            conf.osd_scrub_begin_hour,
            conf.osd_scrub_end_hour,
            local.hour(),
        );
        day_permit && hour_permit
    }

    /// How long to wait between scrub chunks: the regular sleep inside the
    /// permitted window (or for high-priority scrubs), the extended one
    /// otherwise.
    pub fn scrub_sleep_time(&self, t: SystemTime, high_priority_scrub: bool) -> Duration {
        let conf = self.conf.get();
        if high_priority_scrub || self.scrub_time_permit(t) {
            conf.osd_scrub_sleep
        } else {
            conf.osd_scrub_extended_sleep
        }
    }

    /// Refresh the decaying daily load average; forwarded to the logger by
    /// the OSD tick.
    pub fn update_load_average(&self) -> Option<f64> {
        self.load_tracker.update_load_average()
    }

    /// A scheduling-relevant config value changed: have every registered
    /// PG recompute its schedule.
    pub fn on_config_change(&self) {
        for job in self.queue.list_registered_jobs() {
            match self.osd_service.get_locked_pg(job.pgid) {
                Some(mut pg) => pg.on_scrub_schedule_input_change(),
                None => debug!(pgid = %job.pgid, "pg vanished during the config sweep"),
            }
        }
    }

    // ---- the PGs' interface to the scrub scheduling objects --------------

    pub fn register_with_osd(&self, job: &ScrubJobRef, suggested: &SchedParams) {
        self.queue.register_with_osd(job, suggested);
    }

    pub fn remove_from_osd_queue(&self, job: &ScrubJobRef) {
        self.queue.remove_from_osd_queue(job);
    }

    pub fn update_job(&self, job: &ScrubJobRef, suggested: &SchedParams) {
        self.queue.update_job(job, suggested);
    }

    pub fn determine_scrub_time(
        &self,
        request_flags: &RequestedScrub,
        pg_info: &PgScrubbingInfo,
        pool_conf: &PoolScrubOptions,
        now: SystemTime,
    ) -> SchedParams {
        self.queue
            .determine_scrub_time(request_flags, pg_info, pool_conf, now)
    }

    pub fn set_reserving_now(&self, reserving_id: PgId, now: SystemTime) -> bool {
        self.queue.set_reserving_now(reserving_id, now)
    }

    pub fn clear_reserving_now(&self, reserving_id: PgId) {
        self.queue.clear_reserving_now(reserving_id)
    }

    pub fn mark_pg_scrub_blocked(&self, blocked_pg: PgId) {
        self.queue.mark_pg_scrub_blocked(blocked_pg)
    }

    pub fn clear_pg_scrub_blocked(&self, blocked_pg: PgId) {
        self.queue.clear_pg_scrub_blocked(blocked_pg)
    }

    pub fn get_blocked_pgs_count(&self) -> i32 {
        self.queue.get_blocked_pgs_count()
    }

    pub fn inc_scrubs_local(&self) -> bool {
        self.resource_bookkeeper.inc_scrubs_local()
    }

    pub fn dec_scrubs_local(&self) {
        self.resource_bookkeeper.dec_scrubs_local()
    }

    pub fn inc_scrubs_remote(&self, pgid: PgId) -> bool {
        self.resource_bookkeeper.inc_scrubs_remote(pgid)
    }

    pub fn dec_scrubs_remote(&self, pgid: PgId) {
        self.resource_bookkeeper.dec_scrubs_remote(pgid)
    }

    pub fn resource_bookkeeper(&self) -> &ScrubResources {
        &self.resource_bookkeeper
    }

    pub fn dump_scrubs(&self) -> Vec<ScrubJobDump> {
        self.queue.dump_scrubs()
    }
}

#[cfg(test)]
mod tests {
    use super::job::{MustScrub, ScrubJob};
    use super::*;
    use crate::config::OsdConfig;
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;
    use std::time::UNIX_EPOCH;
    use utils::id::PoolId;

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[derive(Default, Clone)]
    struct FakePgState {
        lockable: bool,
        scrubbing: bool,
        repair_requested: bool,
        started: u32,
        schedule_recomputed: u32,
    }

    #[derive(Default)]
    struct FakePgMap {
        node: u64,
        pgs: Arc<Mutex<HashMap<PgId, FakePgState>>>,
    }

    impl FakePgMap {
        fn insert(&self, pgid: PgId, state: FakePgState) {
            self.pgs.lock().unwrap().insert(pgid, state);
        }

        fn state(&self, pgid: PgId) -> FakePgState {
            self.pgs.lock().unwrap().get(&pgid).unwrap().clone()
        }
    }

    struct FakeLockedPg {
        pgid: PgId,
        pgs: Arc<Mutex<HashMap<PgId, FakePgState>>>,
    }

    impl ScrubSchedListener for FakePgMap {
        fn node_id(&self) -> NodeId {
            NodeId(self.node)
        }

        fn get_locked_pg(&self, pgid: PgId) -> Option<Box<dyn LockedPg + '_>> {
            let pgs = self.pgs.lock().unwrap();
            let state = pgs.get(&pgid)?;
            if !state.lockable {
                return None;
            }
            Some(Box::new(FakeLockedPg {
                pgid,
                pgs: Arc::clone(&self.pgs),
            }))
        }
    }

    impl LockedPg for FakeLockedPg {
        fn is_scrub_queued_or_active(&self) -> bool {
            self.pgs.lock().unwrap()[&self.pgid].scrubbing
        }

        fn is_repair_requested(&self) -> bool {
            self.pgs.lock().unwrap()[&self.pgid].repair_requested
        }

        fn start_scrubbing(&mut self, _kind: ScrubStartKind) {
            let mut pgs = self.pgs.lock().unwrap();
            let state = pgs.get_mut(&self.pgid).unwrap();
            state.started += 1;
            state.scrubbing = true;
        }

        fn on_scrub_schedule_input_change(&mut self) {
            self.pgs.lock().unwrap().get_mut(&self.pgid).unwrap().schedule_recomputed += 1;
        }
    }

    struct Setup {
        scrub: OsdScrub,
        pgs: Arc<FakePgMap>,
    }

    fn setup(mutate: impl FnOnce(&mut OsdConfig)) -> Setup {
        let mut conf = OsdConfig::default();
        // deterministic tick: never skip on the dice roll
        conf.osd_scrub_backoff_ratio = 1.0;
        mutate(&mut conf);
        let pgs = Arc::new(FakePgMap {
            node: 3,
            pgs: Arc::default(),
        });
        let scrub = OsdScrub::new(ConfigHandle::new(conf), pgs.clone());
        Setup { scrub, pgs }
    }

    fn lockable_pg() -> FakePgState {
        FakePgState {
            lockable: true,
            ..Default::default()
        }
    }

    fn register_ripe(scrub: &OsdScrub, pgid: PgId) -> ScrubJobRef {
        let job = ScrubJob::new(pgid, NodeId(3));
        scrub.register_with_osd(
            &job,
            &SchedParams {
                proposed_time: at(50),
                is_must: MustScrub::Mandatory,
                ..Default::default()
            },
        );
        job
    }

    #[test]
    fn tick_initiates_one_ripe_scrub() {
        let s = setup(|_| {});
        let pgid = PgId::new(PoolId(1), 1);
        s.pgs.insert(pgid, lockable_pg());
        register_ripe(&s.scrub, pgid);

        s.scrub.initiate_scrub(false, at(100));
        assert_eq!(s.pgs.state(pgid).started, 1);

        // the next tick finds the PG already scrubbing and starts nothing
        s.scrub.initiate_scrub(false, at(101));
        assert_eq!(s.pgs.state(pgid).started, 1);
    }

    #[test]
    fn unlockable_target_falls_through_to_the_next() {
        let s = setup(|_| {});
        let stuck = PgId::new(PoolId(1), 1);
        let good = PgId::new(PoolId(1), 2);
        s.pgs.insert(stuck, FakePgState::default()); // not lockable
        s.pgs.insert(good, lockable_pg());
        // 'stuck' is riper than 'good'
        let stuck_job = ScrubJob::new(stuck, NodeId(3));
        s.scrub.register_with_osd(
            &stuck_job,
            &SchedParams {
                proposed_time: at(10),
                is_must: MustScrub::Mandatory,
                ..Default::default()
            },
        );
        register_ripe(&s.scrub, good);

        s.scrub.initiate_scrub(false, at(100));
        assert_eq!(s.pgs.state(good).started, 1);
        assert_eq!(s.pgs.state(stuck).started, 0);
    }

    #[test]
    fn saturated_resources_block_the_tick() {
        let s = setup(|conf| conf.osd_max_scrubs = 1);
        let pgid = PgId::new(PoolId(1), 1);
        s.pgs.insert(pgid, lockable_pg());
        register_ripe(&s.scrub, pgid);

        assert!(s.scrub.inc_scrubs_local());
        s.scrub.initiate_scrub(false, at(100));
        assert_eq!(s.pgs.state(pgid).started, 0);

        s.scrub.dec_scrubs_local();
        s.scrub.initiate_scrub(false, at(101));
        assert_eq!(s.pgs.state(pgid).started, 1);
    }

    #[test]
    fn reserving_pg_blocks_the_tick() {
        let s = setup(|_| {});
        let pgid = PgId::new(PoolId(1), 1);
        s.pgs.insert(pgid, lockable_pg());
        register_ripe(&s.scrub, pgid);

        assert!(s.scrub.set_reserving_now(PgId::new(PoolId(2), 9), at(99)));
        s.scrub.initiate_scrub(false, at(100));
        assert_eq!(s.pgs.state(pgid).started, 0);

        s.scrub.clear_reserving_now(PgId::new(PoolId(2), 9));
        s.scrub.initiate_scrub(false, at(101));
        assert_eq!(s.pgs.state(pgid).started, 1);
    }

    #[test]
    fn recovery_blocks_scrubs_unless_configured_otherwise() {
        let s = setup(|_| {});
        let pgid = PgId::new(PoolId(1), 1);
        s.pgs.insert(pgid, lockable_pg());
        register_ripe(&s.scrub, pgid);

        s.scrub.initiate_scrub(true, at(100));
        assert_eq!(s.pgs.state(pgid).started, 0);

        let during = setup(|conf| conf.osd_scrub_during_recovery = true);
        during.pgs.insert(pgid, lockable_pg());
        register_ripe(&during.scrub, pgid);
        during.scrub.initiate_scrub(true, at(100));
        assert_eq!(during.pgs.state(pgid).started, 1);
    }

    #[test]
    fn repair_during_recovery_admits_repair_requests_only() {
        let s = setup(|conf| conf.osd_repair_during_recovery = true);
        let plain = PgId::new(PoolId(1), 1);
        let repair = PgId::new(PoolId(1), 2);
        s.pgs.insert(plain, lockable_pg());
        s.pgs.insert(
            repair,
            FakePgState {
                lockable: true,
                repair_requested: true,
                ..Default::default()
            },
        );
        let plain_job = ScrubJob::new(plain, NodeId(3));
        s.scrub.register_with_osd(
            &plain_job,
            &SchedParams {
                proposed_time: at(10),
                is_must: MustScrub::Mandatory,
                ..Default::default()
            },
        );
        register_ripe(&s.scrub, repair);

        s.scrub.initiate_scrub(true, at(100));
        assert_eq!(s.pgs.state(plain).started, 0);
        assert_eq!(s.pgs.state(repair).started, 1);
    }

    #[test]
    fn on_config_change_revisits_every_registered_pg() {
        let s = setup(|_| {});
        let pg_a = PgId::new(PoolId(1), 1);
        let pg_b = PgId::new(PoolId(1), 2);
        s.pgs.insert(pg_a, lockable_pg());
        s.pgs.insert(pg_b, lockable_pg());
        register_ripe(&s.scrub, pg_a);
        register_ripe(&s.scrub, pg_b);

        s.scrub.on_config_change();
        assert_eq!(s.pgs.state(pg_a).schedule_recomputed, 1);
        assert_eq!(s.pgs.state(pg_b).schedule_recomputed, 1);
    }

    #[test]
    fn reservation_failure_is_penalized_via_the_next_sweep() {
        let s = setup(|conf| conf.osd_scrub_sleep = Duration::from_secs(5));
        let pgid = PgId::new(PoolId(1), 1);
        s.pgs.insert(pgid, lockable_pg());
        let job = register_ripe(&s.scrub, pgid);

        // the scrub machine reports the failed reservation attempt
        job.resources_failure.store(true, Ordering::SeqCst);
        s.scrub.initiate_scrub(false, at(100));
        assert_eq!(job.penalty_timeout(), at(410));
    }

    #[test]
    fn time_window_is_half_open_and_wraps() {
        assert!(time_in_window(8, 18, 8));
        assert!(time_in_window(8, 18, 17));
        assert!(!time_in_window(8, 18, 18));
        assert!(!time_in_window(8, 18, 3));

        // wrapping midnight
        assert!(time_in_window(22, 6, 23));
        assert!(time_in_window(22, 6, 2));
        assert!(!time_in_window(22, 6, 6));
        assert!(!time_in_window(22, 6, 12));

        // begin == end permits everything
        assert!(time_in_window(5, 5, 0));
        assert!(time_in_window(5, 5, 23));
    }

    #[test]
    fn sleep_time_extends_outside_the_window() {
        let regular = Duration::from_millis(100);
        let extended = Duration::from_secs(2);

        // a window that certainly excludes the current hour
        let now = SystemTime::now();
        let local: DateTime<Local> = now.into();
        let begin = (local.hour() + 1) % 24;
        let end = (local.hour() + 2) % 24;

        let s = setup(move |conf| {
            conf.osd_scrub_sleep = regular;
            conf.osd_scrub_extended_sleep = extended;
            conf.osd_scrub_begin_hour = begin;
            conf.osd_scrub_end_hour = end;
        });
        assert!(!s.scrub.scrub_time_permit(now));
        assert_eq!(s.scrub.scrub_sleep_time(now, false), extended);
        // high-priority scrubs never slow down to the extended sleep
        assert_eq!(s.scrub.scrub_sleep_time(now, true), regular);

        // a whole-day window permits, and the regular sleep applies
        let open = setup(move |conf| {
            conf.osd_scrub_sleep = regular;
            conf.osd_scrub_extended_sleep = extended;
        });
        assert!(open.scrub.scrub_time_permit(now));
        assert_eq!(open.scrub.scrub_sleep_time(now, false), regular);
    }

    #[test]
    fn load_tracker_decays_and_compares() {
        let conf = ConfigHandle::new(OsdConfig::default());
        let tracker = LoadTracker::new(conf, NodeId(3)).with_cpu_count(2);

        // threshold is 0.5/cpu: 0.8 over 2 cpus is 0.4 per cpu
        assert!(tracker.load_is_low(0.8));
        assert!(!tracker.load_is_low(1.2));

        // seed the daily average high; a lower instantaneous load passes
        assert_eq!(tracker.update_from_sample(4.0), 400.0);
        assert!(tracker.load_is_low(1.2));
        // the average decays towards subsequent samples
        let next = tracker.update_from_sample(0.0);
        assert!(next < 400.0);
    }
}
