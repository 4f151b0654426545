//! The per-PG scrub session state machine.
//!
//! One machine exists per PG. The primary region drives a session through
//! replica reservation (`Session/ReservingReplicas`) and the chunked
//! map-building loop (`Session/ActiveScrubbing/*`); the replica region
//! (`ReplicaActive/*`) answers reservation and map requests from the PG's
//! primary. At most one region is active at a time, selected by the
//! peering outcome.
//!
//! Transitions are synchronous. Waiting is expressed as events delivered
//! later: either posted by the PG backend (chunk selection, map building)
//! or scheduled through the timer service and delivered via the machine's
//! event sink. The dispatcher (the PG's scrubber) owns both the machine
//! and the backend it drives, and serializes event processing under the
//! PG lock; the machine holds no back-reference and receives the backend
//! as an explicit context argument.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use strum_macros::IntoStaticStr;
use tracing::{debug, error, info, trace, warn};
use utils::id::{NodeId, PgId};

use crate::metrics::SCRUB_RESERVATION_REPLIES;

use super::messages::{ReplicaMapRequest, ReserveOp, ScrubReserve, ScrubTransport};
use super::timer::{CallbackScheduler, TimerEventToken};

//
// events
//

#[derive(Debug, IntoStaticStr)]
pub enum ScrubEvent {
    // external requests
    /// initiate a new scrubbing session (we are a primary)
    StartScrub,
    /// initiate a scrubbing session at recovery completion
    AfterRepairScrub,
    /// peering done, and we are a replica
    ReplicaActivate,
    /// a primary asks us to build a map over a chunk
    StartReplica(ReplicaMapRequest),
    /// a primary requests a scrub reservation
    ReplicaReserveReq { from: NodeId, msg: ScrubReserve },
    /// the primary released our reservation
    ReplicaRelease { from: NodeId },
    /// force the quiescent state
    FullReset,
    /// the PG interval ended; remote state is released autonomously
    IntervalChanged,

    // replica responses to our reservation requests
    ReplicaGrant { from: NodeId },
    ReplicaReject { from: NodeId },

    // scrub progress
    SelectedChunkFree,
    ChunkIsBusy,
    /// the PG unblocked the object range we were waiting for
    Unblocked,
    /// change in the in-flight recovery pushes count
    ActivePushesUpd,
    ReplicaPushesUpd,
    /// all updates up to the chunk boundary are committed
    UpdatesApplied,
    /// the internal counterpart of UpdatesApplied
    InternalAllUpdates,
    /// a replica map arrived (or: recheck the received set)
    GotReplicas,
    /// local map building finished
    IntLocalMapDone,
    /// local map building was preempted
    IntBmPreempted,
    DigestUpdate,
    /// finished this chunk, go get the next one
    NextChunk,
    /// all chunks handled
    ScrubFinished,
    InternalError,
    SchedReplica,
    InternalSchedScrub,

    // timer-delivered
    RemotesReserved,
    ReservationTimeout,
    RangeBlockedAlarm,
    SleepComplete,
}

impl ScrubEvent {
    fn name(&self) -> &'static str {
        self.into()
    }
}

/// Progress of one map-building step in the object-store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapBuildStep {
    /// keep going; the backend will post another scheduling event
    InProgress,
    Done,
    Preempted,
    Failed,
}

/// What the map comparison concluded about the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    MoreChunks,
    LastChunk,
}

/// How the session was requested. Post-repair scrubs are treated as high
/// priority by the sleep-time computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrubStartKind {
    Regular,
    AfterRepair,
}

/// The per-PG backend driven by the machine: chunk selection, map
/// building, digest bookkeeping, and the touch points into the OSD-wide
/// scrub services.
pub trait ScrubListener {
    // environment
    fn acting_replicas(&self) -> Vec<NodeId>;
    fn current_epoch(&self) -> u64;
    fn reservation_timeout(&self) -> Duration;
    fn scrub_sleep_time(&self) -> Duration;
    fn range_blocked_grace(&self) -> Duration;

    // OSD-wide coordination
    fn set_reserving_now(&mut self) -> bool;
    fn clear_reserving_now(&mut self);
    /// mark the PG's scrub job as having failed replica reservation
    fn flag_reservations_failure(&mut self);
    fn set_scrub_blocked(&mut self);
    fn clear_scrub_blocked(&mut self);
    fn inc_scrubs_remote(&mut self) -> bool;
    fn dec_scrubs_remote(&mut self);

    // primary-session backend
    fn on_session_init(&mut self);
    fn on_session_done(&mut self);
    /// pick the next object range; the backend later posts
    /// `SelectedChunkFree` or `ChunkIsBusy`
    fn select_range_and_notify(&mut self);
    fn active_pushes(&self) -> u32;
    fn chunk_updates_applied(&self) -> bool;
    fn build_primary_map_chunk(&mut self) -> MapBuildStep;
    fn all_replica_maps_received(&self) -> bool;
    /// reconcile the maps and digests for the chunk
    fn maps_compare_n_cleanup(&mut self) -> ChunkOutcome;
    fn pending_digest_updates(&self) -> u32;
    fn finish_scrub_session(&mut self);

    // replica-op backend
    fn on_replica_op_start(&mut self, request: &ReplicaMapRequest);
    /// build one step of the replica map; on `Done`/`Preempted`/`Failed`
    /// the backend has already sent the map reply
    fn build_replica_map_chunk(&mut self) -> MapBuildStep;
    fn abort_replica_op(&mut self);
}

/// Timer-delivered events land here; the owner re-dispatches them into
/// the machine under the PG lock.
pub type EventSink = Arc<dyn Fn(ScrubEvent) + Send + Sync>;

//
// the primary's reservation bag
//

/// The scrub session's replica reservations.
///
/// Requests go out on construction. Dropping the bag releases whatever
/// was granted, unless the reservations were discarded first: on an
/// interval change the replicas release autonomously and must not be
/// messaged.
pub struct ReplicaReservations {
    pgid: PgId,
    whoami: NodeId,
    epoch: u64,
    transport: Arc<dyn ScrubTransport>,
    waiting: BTreeSet<NodeId>,
    granted: BTreeSet<NodeId>,
    discarded: bool,
}

impl ReplicaReservations {
    fn new(
        pgid: PgId,
        whoami: NodeId,
        epoch: u64,
        replicas: Vec<NodeId>,
        transport: Arc<dyn ScrubTransport>,
    ) -> Self {
        for &peer in &replicas {
            transport.send_reserve(
                peer,
                ScrubReserve {
                    pgid,
                    epoch,
                    from: whoami,
                    op: ReserveOp::Request,
                },
            );
        }
        ReplicaReservations {
            pgid,
            whoami,
            epoch,
            transport,
            waiting: replicas.into_iter().collect(),
            granted: BTreeSet::new(),
            discarded: false,
        }
    }

    fn all_granted(&self) -> bool {
        self.waiting.is_empty()
    }

    /// Record a grant; returns true when every replica has now granted.
    fn handle_grant(&mut self, from: NodeId) -> bool {
        if self.waiting.remove(&from) {
            self.granted.insert(from);
        } else if !self.granted.contains(&from) {
            warn!(pgid = %self.pgid, %from, "grant from a peer we were not waiting for");
        }
        self.all_granted()
    }

    /// The replicas released their interval-specific state on their own;
    /// forget about it without sending releases.
    fn discard_remote_reservations(&mut self) {
        self.discarded = true;
    }
}

impl Drop for ReplicaReservations {
    fn drop(&mut self) {
        if self.discarded {
            return;
        }
        for &peer in &self.granted {
            self.transport.send_reserve(
                peer,
                ScrubReserve {
                    pgid: self.pgid,
                    epoch: self.epoch,
                    from: self.whoami,
                    op: ReserveOp::Release,
                },
            );
        }
    }
}

//
// states
//

enum State {
    /// quiescent; no active scrubbing
    NotActive,
    /// a primary scrub session: reserving, then actively scrubbing
    Session(Session),
    /// we are a replica for this PG
    ReplicaActive(ReplicaActive),
}

struct Session {
    /// owned by the session, not by individual phases, so that phase
    /// transitions do not disturb the reservations
    reservations: Option<ReplicaReservations>,
    /// whether this PG currently holds the OSD-wide "reserving now" slot
    holding_reserving_slot: bool,
    phase: SessionPhase,
}

enum SessionPhase {
    /// securing scrub resources from the replicas' OSDs; the token is the
    /// armed reservation timeout
    ReservingReplicas(TimerEventToken),
    ActiveScrubbing(ChunkPhase),
}

enum ChunkPhase {
    /// between chunks: optional configured sleep, then the next chunk
    PendingTimer { sleep: Option<TimerEventToken> },
    NewChunk,
    /// the selected range is held by another op
    RangeBlocked {
        alarm: TimerEventToken,
        blocked_reported: bool,
    },
    WaitPushes,
    WaitLastUpdate,
    BuildMap,
    /// preempted while building; drain replica maps before restarting
    DrainReplMaps,
    WaitReplicas {
        all_maps_already_called: bool,
    },
    WaitDigestUpdate,
}

struct ReplicaActive {
    reserved_by_my_primary: bool,
    op: Option<ReplicaOpPhase>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplicaOpPhase {
    WaitUpdates,
    BuildingMap,
}

pub struct ScrubMachine {
    pgid: PgId,
    whoami: NodeId,
    timers: Arc<dyn CallbackScheduler>,
    transport: Arc<dyn ScrubTransport>,
    sink: EventSink,
    state: State,
    /// label of the state the current event was dispatched from; the
    /// state value itself is moved out during the transition
    dispatching_from: &'static str,
    /// events posted by the machine to itself, processed before returning
    pending: VecDeque<ScrubEvent>,
}

fn state_label(state: &State) -> &'static str {
    match state {
        State::NotActive => "NotActive",
        State::Session(session) => match &session.phase {
            SessionPhase::ReservingReplicas(_) => "Session/ReservingReplicas",
            SessionPhase::ActiveScrubbing(chunk) => match chunk {
                ChunkPhase::PendingTimer { .. } => "Session/ActiveScrubbing/PendingTimer",
                ChunkPhase::NewChunk => "Session/ActiveScrubbing/NewChunk",
                ChunkPhase::RangeBlocked { .. } => "Session/ActiveScrubbing/RangeBlocked",
                ChunkPhase::WaitPushes => "Session/ActiveScrubbing/WaitPushes",
                ChunkPhase::WaitLastUpdate => "Session/ActiveScrubbing/WaitLastUpdate",
                ChunkPhase::BuildMap => "Session/ActiveScrubbing/BuildMap",
                ChunkPhase::DrainReplMaps => "Session/ActiveScrubbing/DrainReplMaps",
                ChunkPhase::WaitReplicas { .. } => "Session/ActiveScrubbing/WaitReplicas",
                ChunkPhase::WaitDigestUpdate => "Session/ActiveScrubbing/WaitDigestUpdate",
            },
        },
        State::ReplicaActive(replica) => match replica.op {
            None => "ReplicaActive/ReplicaIdle",
            Some(ReplicaOpPhase::WaitUpdates) => "ReplicaActive/ReplicaWaitUpdates",
            Some(ReplicaOpPhase::BuildingMap) => "ReplicaActive/ReplicaBuildingMap",
        },
    }
}

impl ScrubMachine {
    pub fn new(
        pgid: PgId,
        whoami: NodeId,
        timers: Arc<dyn CallbackScheduler>,
        transport: Arc<dyn ScrubTransport>,
        sink: EventSink,
    ) -> Self {
        ScrubMachine {
            pgid,
            whoami,
            timers,
            transport,
            sink,
            state: State::NotActive,
            dispatching_from: "NotActive",
            pending: VecDeque::new(),
        }
    }

    /// Feed one event into the machine, running any internally posted
    /// follow-ups to completion. Must be called under the PG lock.
    pub fn process_event(&mut self, ctx: &mut dyn ScrubListener, event: ScrubEvent) {
        self.pending.push_back(event);
        while let Some(event) = self.pending.pop_front() {
            trace!(
                pgid = %self.pgid,
                state = self.state_name(),
                event = event.name(),
                "scrub fsm event"
            );
            let state = std::mem::replace(&mut self.state, State::NotActive);
            self.dispatching_from = state_label(&state);
            self.state = self.transition(ctx, state, event);
        }
    }

    pub fn state_name(&self) -> &'static str {
        state_label(&self.state)
    }

    pub fn is_reserving(&self) -> bool {
        matches!(
            self.state,
            State::Session(Session {
                phase: SessionPhase::ReservingReplicas(_),
                ..
            })
        )
    }

    pub fn is_accepting_updates(&self) -> bool {
        matches!(
            self.state,
            State::Session(Session {
                phase: SessionPhase::ActiveScrubbing(ChunkPhase::WaitLastUpdate),
                ..
            })
        )
    }

    /// Fatal if the machine is mid-session; used by callers that assume
    /// quiescence.
    pub fn assert_not_active(&self) {
        assert!(
            matches!(self.state, State::NotActive),
            "scrub machine expected to be quiescent, was in {}",
            self.state_name()
        );
    }

    fn post(&mut self, event: ScrubEvent) {
        self.pending.push_back(event);
    }

    fn schedule_event_after(&self, delay: Duration, event: ScrubEvent) -> TimerEventToken {
        let sink = Arc::clone(&self.sink);
        TimerEventToken::arm(Arc::clone(&self.timers), delay, move || sink(event))
    }

    fn ignore(&self, event: ScrubEvent) {
        debug!(
            pgid = %self.pgid,
            state = self.dispatching_from,
            event = event.name(),
            "event not relevant in the current state, discarded"
        );
    }

    //
    // transitions
    //

    fn transition(
        &mut self,
        ctx: &mut dyn ScrubListener,
        state: State,
        event: ScrubEvent,
    ) -> State {
        use ScrubEvent::*;
        match state {
            State::NotActive => match event {
                StartScrub | AfterRepairScrub => self.start_session(ctx),
                ReplicaActivate => {
                    debug!(pgid = %self.pgid, "peered as a replica");
                    State::ReplicaActive(ReplicaActive {
                        reserved_by_my_primary: false,
                        op: None,
                    })
                }
                // already quiescent
                FullReset | IntervalChanged => State::NotActive,
                event => {
                    self.ignore(event);
                    State::NotActive
                }
            },
            State::Session(session) => self.session_transition(ctx, session, event),
            State::ReplicaActive(replica) => self.replica_transition(ctx, replica, event),
        }
    }

    fn start_session(&mut self, ctx: &mut dyn ScrubListener) -> State {
        info!(pgid = %self.pgid, "initiating a scrub session");
        let timeout = self.schedule_event_after(
            ctx.reservation_timeout(),
            ScrubEvent::ReservationTimeout,
        );
        let mut session = Session {
            reservations: None,
            holding_reserving_slot: false,
            phase: SessionPhase::ReservingReplicas(timeout),
        };

        if !ctx.set_reserving_now() {
            // lost the race against another PG entering its reservation
            // phase; retried on a later tick
            warn!(pgid = %self.pgid, "another pg is reserving replicas, backing off");
            ctx.flag_reservations_failure();
            self.post(ScrubEvent::FullReset);
            return State::Session(session);
        }
        session.holding_reserving_slot = true;

        let reservations = ReplicaReservations::new(
            self.pgid,
            self.whoami,
            ctx.current_epoch(),
            ctx.acting_replicas(),
            Arc::clone(&self.transport),
        );
        let all_granted = reservations.all_granted();
        session.reservations = Some(reservations);
        if all_granted {
            // no replicas to wait for
            self.post(ScrubEvent::RemotesReserved);
        }
        State::Session(session)
    }

    fn session_transition(
        &mut self,
        ctx: &mut dyn ScrubListener,
        session: Session,
        event: ScrubEvent,
    ) -> State {
        use ScrubEvent::*;
        match event {
            FullReset => return self.end_session(ctx, session),
            IntervalChanged => {
                info!(pgid = %self.pgid, "interval changed, abandoning the scrub session");
                let mut session = session;
                if let Some(reservations) = session.reservations.as_mut() {
                    reservations.discard_remote_reservations();
                }
                return self.end_session(ctx, session);
            }
            InternalError => {
                error!(pgid = %self.pgid, state = self.dispatching_from, "scrub session error, resetting");
                self.post(FullReset);
                return State::Session(session);
            }
            _ => {}
        }

        let Session {
            mut reservations,
            mut holding_reserving_slot,
            phase,
        } = session;

        let phase = match (phase, event) {
            (SessionPhase::ReservingReplicas(timeout), ReplicaGrant { from }) => {
                debug!(pgid = %self.pgid, %from, "replica granted the scrub reservation");
                if let Some(bag) = reservations.as_mut() {
                    if bag.handle_grant(from) {
                        self.post(RemotesReserved);
                    }
                }
                SessionPhase::ReservingReplicas(timeout)
            }
            (SessionPhase::ReservingReplicas(timeout), ReplicaReject { from }) => {
                warn!(pgid = %self.pgid, %from, "replica denied the scrub reservation");
                ctx.flag_reservations_failure();
                self.post(FullReset);
                SessionPhase::ReservingReplicas(timeout)
            }
            (SessionPhase::ReservingReplicas(timeout), ReservationTimeout) => {
                warn!(pgid = %self.pgid, "timed out waiting for replica reservations");
                ctx.flag_reservations_failure();
                self.post(FullReset);
                SessionPhase::ReservingReplicas(timeout)
            }
            (SessionPhase::ReservingReplicas(_timeout), RemotesReserved) => {
                // every replica granted; dropping the token cancels the
                // reservation timeout
                debug!(pgid = %self.pgid, "replicas reserved, starting to scrub");
                if holding_reserving_slot {
                    ctx.clear_reserving_now();
                    holding_reserving_slot = false;
                }
                ctx.on_session_init();
                SessionPhase::ActiveScrubbing(self.enter_pending_timer(ctx))
            }
            (SessionPhase::ActiveScrubbing(chunk), event) => {
                SessionPhase::ActiveScrubbing(self.chunk_transition(ctx, chunk, event))
            }
            (phase, event) => {
                self.ignore(event);
                phase
            }
        };

        State::Session(Session {
            reservations,
            holding_reserving_slot,
            phase,
        })
    }

    fn chunk_transition(
        &mut self,
        ctx: &mut dyn ScrubListener,
        phase: ChunkPhase,
        event: ScrubEvent,
    ) -> ChunkPhase {
        use ScrubEvent::*;
        match (phase, event) {
            (ChunkPhase::PendingTimer { sleep }, SleepComplete) => {
                drop(sleep);
                self.post(InternalSchedScrub);
                ChunkPhase::PendingTimer { sleep: None }
            }
            (ChunkPhase::PendingTimer { .. }, InternalSchedScrub) => self.enter_new_chunk(ctx),

            (ChunkPhase::NewChunk, SelectedChunkFree) => self.enter_wait_pushes(),
            (ChunkPhase::NewChunk, ChunkIsBusy) => self.enter_range_blocked(ctx),

            (ChunkPhase::RangeBlocked { blocked_reported, .. }, Unblocked) => {
                debug!(pgid = %self.pgid, "blocked object range released");
                if blocked_reported {
                    ctx.clear_scrub_blocked();
                }
                self.enter_pending_timer(ctx)
            }
            (
                ChunkPhase::RangeBlocked {
                    alarm,
                    blocked_reported,
                },
                RangeBlockedAlarm,
            ) => {
                warn!(
                    pgid = %self.pgid,
                    "scrub is stuck on a locked object range for too long"
                );
                if !blocked_reported {
                    ctx.set_scrub_blocked();
                }
                self.post(InternalError);
                ChunkPhase::RangeBlocked {
                    alarm,
                    blocked_reported: true,
                }
            }

            (ChunkPhase::WaitPushes, ActivePushesUpd) => {
                if ctx.active_pushes() == 0 {
                    self.enter_wait_last_update()
                } else {
                    ChunkPhase::WaitPushes
                }
            }

            (ChunkPhase::WaitLastUpdate, UpdatesApplied) => {
                if ctx.chunk_updates_applied() {
                    self.post(InternalAllUpdates);
                }
                ChunkPhase::WaitLastUpdate
            }
            (ChunkPhase::WaitLastUpdate, InternalAllUpdates) => self.enter_build_map(ctx),

            // the backend nudges the build loop with InternalSchedScrub
            (ChunkPhase::BuildMap, InternalSchedScrub) => self.enter_build_map(ctx),
            (ChunkPhase::BuildMap, IntLocalMapDone) => self.enter_wait_replicas(),
            (ChunkPhase::BuildMap, IntBmPreempted) => {
                debug!(pgid = %self.pgid, "map building preempted, draining replica maps");
                self.post(GotReplicas);
                ChunkPhase::DrainReplMaps
            }

            (ChunkPhase::DrainReplMaps, GotReplicas) => {
                if ctx.all_replica_maps_received() {
                    // all replicas accounted for; restart the chunk
                    self.enter_pending_timer(ctx)
                } else {
                    ChunkPhase::DrainReplMaps
                }
            }

            (
                ChunkPhase::WaitReplicas {
                    all_maps_already_called,
                },
                GotReplicas,
            ) => {
                if ctx.all_replica_maps_received() && !all_maps_already_called {
                    match ctx.maps_compare_n_cleanup() {
                        ChunkOutcome::MoreChunks => self.post(NextChunk),
                        ChunkOutcome::LastChunk => self.post(ScrubFinished),
                    }
                    ChunkPhase::WaitReplicas {
                        all_maps_already_called: true,
                    }
                } else {
                    ChunkPhase::WaitReplicas {
                        all_maps_already_called,
                    }
                }
            }
            (phase @ ChunkPhase::WaitReplicas { .. }, DigestUpdate) => {
                debug!(pgid = %self.pgid, "digest update while awaiting replica maps");
                phase
            }
            (ChunkPhase::WaitReplicas { .. }, ScrubFinished) => self.enter_wait_digest_update(),
            (ChunkPhase::WaitReplicas { .. }, NextChunk) => self.enter_pending_timer(ctx),

            (ChunkPhase::WaitDigestUpdate, DigestUpdate) => {
                if ctx.pending_digest_updates() == 0 {
                    self.post(ScrubFinished);
                }
                ChunkPhase::WaitDigestUpdate
            }
            (ChunkPhase::WaitDigestUpdate, ScrubFinished) => {
                info!(pgid = %self.pgid, "scrub session finished");
                ctx.finish_scrub_session();
                self.post(FullReset);
                ChunkPhase::WaitDigestUpdate
            }
            (ChunkPhase::WaitDigestUpdate, NextChunk) => self.enter_pending_timer(ctx),

            (phase, event) => {
                self.ignore(event);
                phase
            }
        }
    }

    fn replica_transition(
        &mut self,
        ctx: &mut dyn ScrubListener,
        mut replica: ReplicaActive,
        event: ScrubEvent,
    ) -> State {
        use ScrubEvent::*;
        match event {
            ReplicaReserveReq { from, msg } => {
                let granted = if replica.reserved_by_my_primary {
                    debug!(pgid = %self.pgid, %from, "duplicate reservation request, re-granting");
                    true
                } else if ctx.inc_scrubs_remote() {
                    replica.reserved_by_my_primary = true;
                    true
                } else {
                    false
                };
                let op = if granted {
                    ReserveOp::Grant
                } else {
                    ReserveOp::Reject
                };
                debug!(pgid = %self.pgid, %from, ?op, "answering a reservation request");
                SCRUB_RESERVATION_REPLIES
                    .with_label_values(&[if granted { "grant" } else { "reject" }])
                    .inc();
                self.transport.send_reserve(
                    from,
                    ScrubReserve {
                        pgid: self.pgid,
                        epoch: msg.epoch,
                        from: self.whoami,
                        op,
                    },
                );
                State::ReplicaActive(replica)
            }
            ReplicaRelease { from } => {
                if replica.reserved_by_my_primary {
                    ctx.dec_scrubs_remote();
                    replica.reserved_by_my_primary = false;
                } else {
                    warn!(pgid = %self.pgid, %from, "release of a reservation we do not hold");
                }
                State::ReplicaActive(replica)
            }
            IntervalChanged => {
                // no release messages are coming; clean up on our own
                debug!(pgid = %self.pgid, "interval changed, resetting the replica state");
                if replica.reserved_by_my_primary {
                    ctx.dec_scrubs_remote();
                }
                if replica.op.take().is_some() {
                    ctx.abort_replica_op();
                }
                State::NotActive
            }
            FullReset => {
                // abandon an in-flight op, keep the reservation
                if replica.op.take().is_some() {
                    ctx.abort_replica_op();
                }
                State::ReplicaActive(replica)
            }
            StartReplica(request) => {
                if replica.op.is_some() {
                    // the primary is evidently no longer waiting for the
                    // previous results; it still waits for these
                    error!(
                        pgid = %self.pgid,
                        "new replica scrub request while handling the previous one \
                         (protocol violation); abandoning the old request"
                    );
                    ctx.abort_replica_op();
                }
                ctx.on_replica_op_start(&request);
                replica.op = Some(ReplicaOpPhase::WaitUpdates);
                self.post(ReplicaPushesUpd);
                State::ReplicaActive(replica)
            }
            ReplicaPushesUpd => {
                if replica.op == Some(ReplicaOpPhase::WaitUpdates) && ctx.active_pushes() == 0 {
                    replica.op = Some(ReplicaOpPhase::BuildingMap);
                    self.post(SchedReplica);
                }
                State::ReplicaActive(replica)
            }
            SchedReplica => {
                if replica.op == Some(ReplicaOpPhase::BuildingMap) {
                    match ctx.build_replica_map_chunk() {
                        MapBuildStep::InProgress => {}
                        MapBuildStep::Done | MapBuildStep::Preempted => {
                            debug!(pgid = %self.pgid, "replica map chunk handled");
                            replica.op = None;
                        }
                        MapBuildStep::Failed => {
                            warn!(pgid = %self.pgid, "replica map building failed");
                            replica.op = None;
                        }
                    }
                }
                State::ReplicaActive(replica)
            }
            event => {
                self.ignore(event);
                State::ReplicaActive(replica)
            }
        }
    }

    /// Tear the session down into the quiescent state. Reservation
    /// releases are sent by the bag's drop, unless it was discarded.
    fn end_session(&mut self, ctx: &mut dyn ScrubListener, session: Session) -> State {
        if let SessionPhase::ActiveScrubbing(ChunkPhase::RangeBlocked {
            blocked_reported: true,
            ..
        }) = &session.phase
        {
            ctx.clear_scrub_blocked();
        }
        if session.holding_reserving_slot {
            ctx.clear_reserving_now();
        }
        // dropping the session cancels any in-flight timer and releases
        // the reservations
        drop(session);
        ctx.on_session_done();
        State::NotActive
    }

    //
    // state entry helpers
    //

    fn enter_pending_timer(&mut self, ctx: &mut dyn ScrubListener) -> ChunkPhase {
        let sleep = ctx.scrub_sleep_time();
        if sleep > Duration::ZERO {
            ChunkPhase::PendingTimer {
                sleep: Some(self.schedule_event_after(sleep, ScrubEvent::SleepComplete)),
            }
        } else {
            self.post(ScrubEvent::InternalSchedScrub);
            ChunkPhase::PendingTimer { sleep: None }
        }
    }

    fn enter_new_chunk(&mut self, ctx: &mut dyn ScrubListener) -> ChunkPhase {
        ctx.select_range_and_notify();
        ChunkPhase::NewChunk
    }

    fn enter_range_blocked(&mut self, ctx: &mut dyn ScrubListener) -> ChunkPhase {
        debug!(pgid = %self.pgid, "selected chunk is busy, waiting");
        ChunkPhase::RangeBlocked {
            alarm: self
                .schedule_event_after(ctx.range_blocked_grace(), ScrubEvent::RangeBlockedAlarm),
            blocked_reported: false,
        }
    }

    fn enter_wait_pushes(&mut self) -> ChunkPhase {
        self.post(ScrubEvent::ActivePushesUpd);
        ChunkPhase::WaitPushes
    }

    fn enter_wait_last_update(&mut self) -> ChunkPhase {
        self.post(ScrubEvent::UpdatesApplied);
        ChunkPhase::WaitLastUpdate
    }

    fn enter_build_map(&mut self, ctx: &mut dyn ScrubListener) -> ChunkPhase {
        match ctx.build_primary_map_chunk() {
            MapBuildStep::InProgress => {}
            MapBuildStep::Done => self.post(ScrubEvent::IntLocalMapDone),
            MapBuildStep::Preempted => self.post(ScrubEvent::IntBmPreempted),
            MapBuildStep::Failed => self.post(ScrubEvent::InternalError),
        }
        ChunkPhase::BuildMap
    }

    fn enter_wait_replicas(&mut self) -> ChunkPhase {
        self.post(ScrubEvent::GotReplicas);
        ChunkPhase::WaitReplicas {
            all_maps_already_called: false,
        }
    }

    fn enter_wait_digest_update(&mut self) -> ChunkPhase {
        self.post(ScrubEvent::DigestUpdate);
        ChunkPhase::WaitDigestUpdate
    }
}
