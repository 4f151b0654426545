//! Shared fakes for the scrub-subsystem unit tests: a manually fired
//! callback scheduler, a recording transport, and a scriptable PG backend.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use utils::id::NodeId;

use super::job::ScrubJobRef;
use super::machine::{ChunkOutcome, MapBuildStep, ScrubListener};
use super::messages::{
    ReplicaMapReply, ReplicaMapRequest, ReserveOp, ScrubReserve, ScrubTransport,
};
use super::timer::{CallbackScheduler, CallbackToken};

#[derive(Default)]
pub(crate) struct ManualScheduler {
    callbacks: Mutex<Vec<(CallbackToken, Box<dyn FnOnce() + Send>)>>,
    next_token: AtomicU64,
    canceled: AtomicUsize,
}

impl CallbackScheduler for ManualScheduler {
    fn schedule_after(&self, _delay: Duration, cb: Box<dyn FnOnce() + Send>) -> CallbackToken {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed) + 1;
        self.callbacks.lock().unwrap().push((token, cb));
        token
    }

    fn cancel(&self, token: CallbackToken) {
        let mut callbacks = self.callbacks.lock().unwrap();
        let before = callbacks.len();
        callbacks.retain(|(t, _)| *t != token);
        if callbacks.len() < before {
            self.canceled.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl ManualScheduler {
    /// Run every pending callback, as if all timers expired at once.
    pub fn fire_all(&self) {
        let callbacks: Vec<_> = self.callbacks.lock().unwrap().drain(..).collect();
        for (_token, cb) in callbacks {
            cb();
        }
    }

    /// Remove the pending callbacks without running them; the caller may
    /// run them later to simulate a firing that races cancellation.
    pub fn steal_callbacks(&self) -> Vec<Box<dyn FnOnce() + Send>> {
        self.callbacks
            .lock()
            .unwrap()
            .drain(..)
            .map(|(_, cb)| cb)
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.callbacks.lock().unwrap().len()
    }

    pub fn canceled_count(&self) -> usize {
        self.canceled.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub(crate) struct RecordingTransport {
    pub reserves: Mutex<Vec<(NodeId, ScrubReserve)>>,
    pub map_requests: Mutex<Vec<(NodeId, ReplicaMapRequest)>>,
    pub map_replies: Mutex<Vec<(NodeId, ReplicaMapReply)>>,
}

impl ScrubTransport for RecordingTransport {
    fn send_reserve(&self, to: NodeId, msg: ScrubReserve) {
        self.reserves.lock().unwrap().push((to, msg));
    }

    fn send_map_request(&self, to: NodeId, msg: ReplicaMapRequest) {
        self.map_requests.lock().unwrap().push((to, msg));
    }

    fn send_map_reply(&self, to: NodeId, msg: ReplicaMapReply) {
        self.map_replies.lock().unwrap().push((to, msg));
    }
}

impl RecordingTransport {
    pub fn reserve_ops(&self) -> Vec<(NodeId, ReserveOp)> {
        self.reserves
            .lock()
            .unwrap()
            .iter()
            .map(|(to, msg)| (*to, msg.op))
            .collect()
    }
}

/// A scriptable [`ScrubListener`]: knobs set up the environment, notable
/// calls are recorded by name.
pub(crate) struct FakeListener {
    pub replicas: Vec<NodeId>,
    pub epoch: u64,
    pub reservation_timeout: Duration,
    pub sleep: Duration,
    pub grace: Duration,

    /// whether the OSD-wide reserving slot is free
    pub reserving_slot_free: bool,
    /// whether the local OSD has remote scrub slots to grant
    pub remote_slots_free: bool,
    /// the job whose `resources_failure` gets flagged, when present
    pub job: Option<ScrubJobRef>,

    pub active_pushes: u32,
    pub updates_applied: bool,
    /// scripted outcomes of successive build steps; `Done` when exhausted
    pub build_steps: VecDeque<MapBuildStep>,
    pub all_maps_received: bool,
    /// scripted chunk outcomes; `LastChunk` when exhausted
    pub chunk_outcomes: VecDeque<ChunkOutcome>,
    pub pending_digest_updates: u32,

    calls: Vec<&'static str>,
}

impl FakeListener {
    pub fn new(replicas: Vec<NodeId>) -> Self {
        FakeListener {
            replicas,
            epoch: 7,
            reservation_timeout: Duration::from_secs(30),
            sleep: Duration::ZERO,
            grace: Duration::from_secs(60),
            reserving_slot_free: true,
            remote_slots_free: true,
            job: None,
            active_pushes: 0,
            updates_applied: true,
            build_steps: VecDeque::new(),
            all_maps_received: true,
            chunk_outcomes: VecDeque::new(),
            pending_digest_updates: 0,
            calls: Vec::new(),
        }
    }

    pub fn calls(&self, name: &str) -> usize {
        self.calls.iter().filter(|c| **c == name).count()
    }
}

impl ScrubListener for FakeListener {
    fn acting_replicas(&self) -> Vec<NodeId> {
        self.replicas.clone()
    }

    fn current_epoch(&self) -> u64 {
        self.epoch
    }

    fn reservation_timeout(&self) -> Duration {
        self.reservation_timeout
    }

    fn scrub_sleep_time(&self) -> Duration {
        self.sleep
    }

    fn range_blocked_grace(&self) -> Duration {
        self.grace
    }

    fn set_reserving_now(&mut self) -> bool {
        self.calls.push("set_reserving_now");
        self.reserving_slot_free
    }

    fn clear_reserving_now(&mut self) {
        self.calls.push("clear_reserving_now");
    }

    fn flag_reservations_failure(&mut self) {
        self.calls.push("flag_reservations_failure");
        if let Some(job) = &self.job {
            job.resources_failure
                .store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    fn set_scrub_blocked(&mut self) {
        self.calls.push("set_scrub_blocked");
    }

    fn clear_scrub_blocked(&mut self) {
        self.calls.push("clear_scrub_blocked");
    }

    fn inc_scrubs_remote(&mut self) -> bool {
        self.calls.push("inc_scrubs_remote");
        self.remote_slots_free
    }

    fn dec_scrubs_remote(&mut self) {
        self.calls.push("dec_scrubs_remote");
    }

    fn on_session_init(&mut self) {
        self.calls.push("on_session_init");
    }

    fn on_session_done(&mut self) {
        self.calls.push("on_session_done");
    }

    fn select_range_and_notify(&mut self) {
        self.calls.push("select_range");
    }

    fn active_pushes(&self) -> u32 {
        self.active_pushes
    }

    fn chunk_updates_applied(&self) -> bool {
        self.updates_applied
    }

    fn build_primary_map_chunk(&mut self) -> MapBuildStep {
        self.calls.push("build_primary_map_chunk");
        self.build_steps.pop_front().unwrap_or(MapBuildStep::Done)
    }

    fn all_replica_maps_received(&self) -> bool {
        self.all_maps_received
    }

    fn maps_compare_n_cleanup(&mut self) -> ChunkOutcome {
        self.calls.push("maps_compare_n_cleanup");
        self.chunk_outcomes
            .pop_front()
            .unwrap_or(ChunkOutcome::LastChunk)
    }

    fn pending_digest_updates(&self) -> u32 {
        self.pending_digest_updates
    }

    fn finish_scrub_session(&mut self) {
        self.calls.push("finish_scrub_session");
    }

    fn on_replica_op_start(&mut self, _request: &ReplicaMapRequest) {
        self.calls.push("on_replica_op_start");
    }

    fn build_replica_map_chunk(&mut self) -> MapBuildStep {
        self.calls.push("build_replica_map_chunk");
        self.build_steps.pop_front().unwrap_or(MapBuildStep::Done)
    }

    fn abort_replica_op(&mut self) {
        self.calls.push("abort_replica_op");
    }
}
