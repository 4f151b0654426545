//! The queue of PGs waiting to be scrubbed.
//!
//! Two lanes: `to_scrub` holds the regular schedule, `penalized` quarantines
//! jobs whose replicas recently denied reservation. Penalized jobs are
//! reinstated after their penalty timeout, when their schedule is refreshed
//! (the `updated` pardon), or wholesale when a sweep went through all
//! candidates without starting anything.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use rand::Rng;
use tracing::{debug, trace};
use utils::id::{NodeId, PgId};

use crate::config::{ConfigHandle, PoolScrubOptions};
use crate::metrics::{SCRUB_BLOCKED_PGS, SCRUB_JOBS_PENALIZED};

use super::job::{
    zero_time, MustScrub, PgScrubbingInfo, QueueState, RequestedScrub, SchedParams, ScrubJobDump,
    ScrubJobRef, ScrubSchedule,
};
use super::job::scrub_must_stamp;
use super::OsdRestrictions;

#[derive(Default)]
struct Lanes {
    to_scrub: Vec<ScrubJobRef>,
    penalized: Vec<ScrubJobRef>,
    /// Forgive the whole penalty lane on the next sweep.
    restore_penalized: bool,
}

struct Reserving {
    pgid: PgId,
    #[allow(dead_code)]
    since: SystemTime,
}

pub struct ScrubQueue {
    conf: ConfigHandle,
    whoami: NodeId,

    /// Guards the two lanes and the lane-membership state of the jobs in
    /// them:
    /// - `in_queues` is asserted only while the job is in one of the lanes;
    /// - a job is in state `registered` only while in one of the lanes;
    /// - no job is in both lanes simultaneously.
    ///
    /// PG locks must not be acquired while holding this lock.
    jobs: Mutex<Lanes>,

    /// At most one PG may be securing replica resources at any time; this
    /// is that PG.
    reserving: Mutex<Option<Reserving>>,

    /// PGs stuck mid-scrub waiting for a locked object. Never negative.
    blocked_scrubs_cnt: AtomicI32,
}

impl ScrubQueue {
    pub fn new(conf: ConfigHandle, whoami: NodeId) -> Self {
        ScrubQueue {
            conf,
            whoami,
            jobs: Mutex::new(Lanes::default()),
            reserving: Mutex::new(None),
            blocked_scrubs_cnt: AtomicI32::new(0),
        }
    }

    // ---- job registration ------------------------------------------------

    /// Add the job to the set of PGs the OSD scrubs periodically. Safe to
    /// call when already registered, in which case only the schedule is
    /// refreshed.
    pub fn register_with_osd(&self, job: &ScrubJobRef, suggested: &SchedParams) {
        loop {
            let state_at_entry = job.state();
            trace!(pgid = %job.pgid, state = ?state_at_entry, "registering scrub job");
            match state_at_entry {
                QueueState::Registered => {
                    // just updating the schedule
                    self.update_job(job, suggested);
                }
                QueueState::NotRegistered => {
                    let mut lanes = self.jobs.lock().unwrap();
                    if job.state() != state_at_entry {
                        debug!(pgid = %job.pgid, "scrub job state changed, retrying");
                        continue;
                    }
                    self.update_job(job, suggested);
                    lanes.to_scrub.push(Arc::clone(job));
                    job.in_queues.store(true, Ordering::SeqCst);
                    job.set_state(QueueState::Registered);
                }
                QueueState::Unregistering => {
                    // the job is still physically queued unless the removal
                    // sweep already ran; reinsert in the latter case
                    let mut lanes = self.jobs.lock().unwrap();
                    self.update_job(job, suggested);
                    if job.state() == QueueState::NotRegistered {
                        debug!(pgid = %job.pgid, "scrub job was dequeued meanwhile, reinserting");
                        lanes.to_scrub.push(Arc::clone(job));
                    }
                    job.in_queues.store(true, Ordering::SeqCst);
                    job.set_state(QueueState::Registered);
                }
            }
            break;
        }
        debug!(
            osd = %self.whoami,
            pgid = %job.pgid,
            state = ?job.state(),
            scheduled_at = ?job.schedule().scheduled_at,
            "scrub job registered"
        );
    }

    /// Request removal of the job. The entry is erased lazily during the
    /// next ready-to-scrub sweep.
    pub fn remove_from_osd_queue(&self, job: &ScrubJobRef) {
        if job.compare_exchange_state(QueueState::Registered, QueueState::Unregistering) {
            debug!(pgid = %job.pgid, "scrub job unregistering");
        } else {
            // not an error: we may not have been the primary
            debug!(pgid = %job.pgid, state = ?job.state(), "removal of a non-registered scrub job");
        }
    }

    /// Recompute the job's target time from the suggested parameters and
    /// install it. Does not take the queue lock; the job synchronizes its
    /// own fields.
    pub fn update_job(&self, job: &ScrubJobRef, suggested: &SchedParams) {
        let adjusted = self.adjust_target_time(suggested);
        job.update_schedule(adjusted);
    }

    // ---- scheduling ------------------------------------------------------

    /// Compute scheduling parameters for a PG from operator requests, PG
    /// stats and pool options.
    pub fn determine_scrub_time(
        &self,
        request_flags: &RequestedScrub,
        pg_info: &PgScrubbingInfo,
        pool_conf: &PoolScrubOptions,
        now: SystemTime,
    ) -> SchedParams {
        if request_flags.must_scrub || request_flags.need_auto {
            // the smallest non-zero stamp: eligible immediately
            SchedParams {
                proposed_time: scrub_must_stamp(),
                is_must: MustScrub::Mandatory,
                ..Default::default()
            }
        } else if pg_info.stats_invalid && self.conf.get().osd_scrub_invalid_stats {
            SchedParams {
                proposed_time: now,
                is_must: MustScrub::Mandatory,
                ..Default::default()
            }
        } else {
            SchedParams {
                proposed_time: pg_info.last_scrub_stamp,
                min_interval: pool_conf.scrub_min_interval,
                max_interval: pool_conf.scrub_max_interval,
                is_must: MustScrub::NotMandatory,
            }
        }
    }

    /// Unless the scrub is mandatory, postpone the proposed time by the
    /// minimum interval plus a random fraction of it, and derive the
    /// deadline from the maximum interval.
    fn adjust_target_time(&self, times: &SchedParams) -> ScrubSchedule {
        self.adjust_target_time_with_random(times, rand::thread_rng().gen_range(0.0..1.0))
    }

    fn adjust_target_time_with_random(&self, times: &SchedParams, random: f64) -> ScrubSchedule {
        let mut adjusted = ScrubSchedule {
            scheduled_at: times.proposed_time,
            deadline: times.proposed_time,
        };
        if times.is_must == MustScrub::NotMandatory {
            let conf = self.conf.get();
            let min_interval = if times.min_interval > Duration::ZERO {
                times.min_interval
            } else {
                conf.osd_scrub_min_interval
            };
            let max_interval = if times.max_interval > Duration::ZERO {
                times.max_interval
            } else {
                conf.osd_scrub_max_interval
            };

            adjusted.scheduled_at = times.proposed_time
                + min_interval
                + min_interval.mul_f64(conf.osd_scrub_interval_randomize_ratio * random);
            adjusted.deadline = if max_interval == Duration::ZERO {
                zero_time()
            } else {
                times.proposed_time + max_interval
            };
        }
        adjusted
    }

    /// All scrub targets that are ready to go, regular-lane candidates
    /// first, each group sorted by scheduled time.
    pub fn ready_to_scrub(&self, restrictions: OsdRestrictions, now: SystemTime) -> Vec<PgId> {
        let mut lanes = self.jobs.lock().unwrap();
        trace!(
            to_scrub = lanes.to_scrub.len(),
            penalized = lanes.penalized.len(),
            ?restrictions,
            "ready-to-scrub sweep"
        );

        // pardon penalized jobs that timed out or were updated
        let forgive_all = lanes.restore_penalized;
        Self::scan_penalized(&mut lanes, forgive_all, now);
        lanes.restore_penalized = false;

        // a pardon requires an update arriving after this point
        for job in &lanes.to_scrub {
            job.updated.store(false, Ordering::SeqCst);
        }

        self.move_failed_pgs(&mut lanes, now);

        // candidates are copied out: the lists are used after the lock is
        // released
        let ripe_regular = Self::collect_ripe_jobs(&mut lanes.to_scrub, restrictions, now);
        let ripe_penalized = Self::collect_ripe_jobs(&mut lanes.penalized, restrictions, now);
        drop(lanes);

        ripe_regular
            .iter()
            .chain(ripe_penalized.iter())
            .map(|job| job.pgid)
            .collect()
    }

    /// Forgive the whole penalty lane on the next sweep. Set when a sweep
    /// offered every candidate, penalized ones included, and none could be
    /// scrubbed.
    pub fn set_restore_penalized(&self) {
        self.jobs.lock().unwrap().restore_penalized = true;
    }

    /// Move jobs whose replica reservation failed to the penalty lane.
    /// Called under the jobs lock.
    fn move_failed_pgs(&self, lanes: &mut Lanes, now: SystemTime) {
        let penalty =
            self.conf.get().osd_scrub_sleep * 2 + Duration::from_secs(300);
        let mut penalized_cnt = 0u64;
        let mut kept = Vec::with_capacity(lanes.to_scrub.len());
        for job in lanes.to_scrub.drain(..) {
            if job.resources_failure.load(Ordering::SeqCst) {
                debug!(pgid = %job.pgid, state = ?job.state(), "penalizing scrub job");
                job.set_penalty_timeout(now + penalty);
                job.resources_failure.store(false, Ordering::SeqCst);
                // otherwise the job would be pardoned immediately
                job.updated.store(false, Ordering::SeqCst);
                lanes.penalized.push(job);
                penalized_cnt += 1;
            } else {
                kept.push(job);
            }
        }
        lanes.to_scrub = kept;
        if penalized_cnt > 0 {
            SCRUB_JOBS_PENALIZED.inc_by(penalized_cnt);
            debug!(penalized_cnt, "scrub jobs penalized");
        }
    }

    /// Reinstate penalized jobs: all of them if `forgive_all`, otherwise
    /// those that were updated or whose penalty timed out. Called under the
    /// jobs lock.
    fn scan_penalized(lanes: &mut Lanes, forgive_all: bool, now: SystemTime) {
        Self::rm_unregistered_jobs(&mut lanes.penalized);
        if forgive_all {
            lanes.to_scrub.append(&mut lanes.penalized);
        } else {
            let (forgiven, still_penalized): (Vec<_>, Vec<_>) = lanes
                .penalized
                .drain(..)
                .partition(|job| {
                    job.updated.load(Ordering::SeqCst) || job.penalty_timeout() <= now
                });
            lanes.to_scrub.extend(forgiven);
            lanes.penalized = still_penalized;
        }
    }

    /// Drop entries whose PGs are being removed (or are no longer ours),
    /// updating job state to match. Called under the jobs lock.
    fn rm_unregistered_jobs(group: &mut Vec<ScrubJobRef>) {
        for job in group.iter() {
            match job.state() {
                QueueState::Unregistering => {
                    job.in_queues.store(false, Ordering::SeqCst);
                    job.set_state(QueueState::NotRegistered);
                }
                QueueState::NotRegistered => {
                    job.in_queues.store(false, Ordering::SeqCst);
                }
                QueueState::Registered => {}
            }
        }
        group.retain(|job| job.state() == QueueState::Registered);
    }

    /// The registered jobs in `group` whose scheduled time has passed,
    /// sorted by scheduled time. Copies the refs out; the caller uses them
    /// without the lock.
    fn collect_ripe_jobs(
        group: &mut Vec<ScrubJobRef>,
        restrictions: OsdRestrictions,
        now: SystemTime,
    ) -> Vec<ScrubJobRef> {
        Self::rm_unregistered_jobs(group);

        let ripe = |job: &ScrubJobRef| {
            let sched = job.schedule();
            sched.scheduled_at <= now
                && (!restrictions.only_deadlined
                    || (sched.deadline != zero_time() && sched.deadline <= now))
        };

        let mut ripes: Vec<_> = group.iter().filter(|job| ripe(job)).cloned().collect();
        ripes.sort_by_key(|job| job.schedule().scheduled_at);
        ripes
    }

    /// All registered jobs, both lanes. Used by the config-change handler
    /// and the admin dump.
    pub fn list_registered_jobs(&self) -> Vec<ScrubJobRef> {
        let lanes = self.jobs.lock().unwrap();
        lanes
            .to_scrub
            .iter()
            .chain(lanes.penalized.iter())
            .filter(|job| job.state() == QueueState::Registered)
            .cloned()
            .collect()
    }

    pub fn dump_scrubs(&self) -> Vec<ScrubJobDump> {
        let lanes = self.jobs.lock().unwrap();
        lanes
            .to_scrub
            .iter()
            .chain(lanes.penalized.iter())
            .map(|job| job.dump())
            .collect()
    }

    // ---- the reserving-now flag -----------------------------------------

    /// Claim the "a PG is reserving replicas" slot. Returns false if some
    /// other PG holds it; losing the race this way is expected.
    pub fn set_reserving_now(&self, reserving_id: PgId, now: SystemTime) -> bool {
        let mut reserving = self.reserving.lock().unwrap();
        match reserving.as_ref() {
            None => {
                *reserving = Some(Reserving {
                    pgid: reserving_id,
                    since: now,
                });
                true
            }
            Some(holder) => {
                assert_ne!(
                    holder.pgid, reserving_id,
                    "reserving_pg set twice by the same pg"
                );
                false
            }
        }
    }

    /// Release the slot, but only if held by the named PG; attempts by
    /// others are ignored silently.
    pub fn clear_reserving_now(&self, was_reserving_id: PgId) {
        let mut reserving = self.reserving.lock().unwrap();
        if reserving
            .as_ref()
            .is_some_and(|holder| holder.pgid == was_reserving_id)
        {
            *reserving = None;
        }
    }

    pub fn is_reserving_now(&self) -> bool {
        self.reserving.lock().unwrap().is_some()
    }

    // ---- the blocked-scrubs counter -------------------------------------

    pub fn mark_pg_scrub_blocked(&self, blocked_pg: PgId) {
        debug!(pgid = %blocked_pg, "pg is blocked on a locked object");
        let cnt = self.blocked_scrubs_cnt.fetch_add(1, Ordering::SeqCst) + 1;
        SCRUB_BLOCKED_PGS.set(i64::from(cnt));
    }

    pub fn clear_pg_scrub_blocked(&self, blocked_pg: PgId) {
        debug!(pgid = %blocked_pg, "pg is unblocked");
        let cnt = self.blocked_scrubs_cnt.fetch_sub(1, Ordering::SeqCst) - 1;
        assert!(cnt >= 0, "blocked-scrubs count went negative");
        SCRUB_BLOCKED_PGS.set(i64::from(cnt));
    }

    pub fn get_blocked_pgs_count(&self) -> i32 {
        self.blocked_scrubs_cnt.load(Ordering::SeqCst)
    }

    // ---- test introspection ---------------------------------------------

    #[cfg(test)]
    fn lane_of(&self, pgid: PgId) -> Option<&'static str> {
        let lanes = self.jobs.lock().unwrap();
        if lanes.to_scrub.iter().any(|j| j.pgid == pgid) {
            Some("to_scrub")
        } else if lanes.penalized.iter().any(|j| j.pgid == pgid) {
            Some("penalized")
        } else {
            None
        }
    }
}
