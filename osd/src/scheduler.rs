//! The per-shard-thread op scheduler.
//!
//! Interleaves client I/O, background recovery and background best-effort
//! work under dmClock reservation/weight/limit QoS, scaled by the device's
//! measured bandwidth. Strictly-immediate traffic (and, depending on the
//! cutoff policy, sufficiently high-priority traffic of any class) bypasses
//! the proportional-share queue into a strict-priority lane.
//!
//! Each op shard worker thread owns one [`OpScheduler`]; the scheduler is
//! not internally synchronized.

mod client_registry;
mod mclock;

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::json;
use strum_macros::IntoStaticStr;
use tracing::debug;
use utils::id::NodeId;

use crate::config::{ConfigHandle, CutoffPolicy};
use crate::metrics::{SCHEDULER_OPS_DEQUEUED, SCHEDULER_OPS_ENQUEUED};

use self::client_registry::ClientRegistry;
use self::mclock::{MclockQueue, Pull};

/// Op classes, in ascending order of urgency. `Immediate` never enters the
/// mClock queue.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, IntoStaticStr, serde::Serialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SchedulerClass {
    BackgroundBestEffort,
    BackgroundRecovery,
    Client,
    Immediate,
}

/// QoS identity of an external client.
///
/// Both fields are currently zero for all external clients, which makes
/// them share one mClock slot; nonzero values are reserved for the
/// distributed QoS feature.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub struct ClientProfileId {
    pub client_id: u64,
    pub profile_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub struct SchedulerId {
    pub class: SchedulerClass,
    pub client_profile: ClientProfileId,
}

pub type Priority = u32;

/// Priority of ordinary high-priority messages; the bypass boundary under
/// the `high` cutoff policy.
pub const PRIORITY_HIGH: Priority = 196;
/// The bypass boundary under the `low` cutoff policy.
pub const PRIORITY_LOW: Priority = 64;

/// Immediate-class items enter the strict lane above any message priority.
const IMMEDIATE_CLASS_PRIORITY: Priority = Priority::MAX;

/// Raw cost advertised by an op: bytes to transfer plus the approximate
/// number of random IOs needed to do so.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpCost {
    pub size_bytes: u64,
    pub iops: u64,
}

#[derive(Debug)]
pub struct OpSchedulerItem<T> {
    pub class: SchedulerClass,
    pub priority: Priority,
    pub cost: OpCost,
    pub payload: T,
}

/// Outcome of a [`OpScheduler::dequeue`] call.
#[derive(Debug)]
pub enum Dequeued<T> {
    /// The next work item.
    Ready(OpSchedulerItem<T>),
    /// Nothing is eligible yet; sleep until the given instant and retry.
    FutureReady(Instant),
    /// Both lanes are empty.
    Empty,
}

pub struct OpScheduler<T> {
    conf: ConfigHandle,
    whoami: NodeId,
    shard_id: u32,
    num_op_shard_threads: u32,
    is_rotational: bool,

    /// Additional cost charged for each random IO, in sequential bytes.
    /// Derived from the device-class capacity config.
    osd_bandwidth_cost_per_io: f64,
    /// Reservation/limit ratios resolve against this capacity, in bytes
    /// per second per op shard thread.
    osd_bandwidth_capacity_per_shard_thread: f64,

    /// Rolled once at construction; see [`CutoffPolicy`].
    cutoff_priority: Priority,

    client_registry: ClientRegistry,
    scheduler: MclockQueue<SchedulerId, OpSchedulerItem<T>>,
    /// Entries are dequeued in strict order ahead of mClock.
    /// Invariant: buckets are never empty.
    high_priority: BTreeMap<Priority, VecDeque<OpSchedulerItem<T>>>,

    /// Zero point for the queue-internal virtual clock.
    epoch: Instant,
}

impl<T> OpScheduler<T> {
    pub fn new(
        conf: ConfigHandle,
        whoami: NodeId,
        shard_id: u32,
        num_op_shard_threads: u32,
        is_rotational: bool,
    ) -> Self {
        let cutoff_priority = Self::priority_cutoff(&conf);
        let mut scheduler = OpScheduler {
            conf,
            whoami,
            shard_id,
            num_op_shard_threads: num_op_shard_threads.max(1),
            is_rotational,
            osd_bandwidth_cost_per_io: 0.0,
            osd_bandwidth_capacity_per_shard_thread: 0.0,
            cutoff_priority,
            client_registry: ClientRegistry::new(),
            scheduler: MclockQueue::new(),
            high_priority: BTreeMap::new(),
            epoch: Instant::now(),
        };
        scheduler.update_configuration();
        scheduler
    }

    fn priority_cutoff(conf: &ConfigHandle) -> Priority {
        match conf.get().osd_op_queue_cut_off {
            CutoffPolicy::High => PRIORITY_HIGH,
            CutoffPolicy::Low => PRIORITY_LOW,
            CutoffPolicy::DebugRandom => {
                if rand::thread_rng().gen_bool(0.5) {
                    PRIORITY_HIGH
                } else {
                    PRIORITY_LOW
                }
            }
        }
    }

    /// Recompute the cost and capacity parameters, then re-resolve the
    /// per-class dmClock parameters. Must be invoked when any of the
    /// `osd_mclock_*` config values change.
    pub fn update_configuration(&mut self) {
        let conf = self.conf.get();
        let (capacity_iops, bandwidth) = if self.is_rotational {
            (
                conf.osd_mclock_max_capacity_iops_hdd,
                conf.osd_mclock_max_sequential_bandwidth_hdd,
            )
        } else {
            (
                conf.osd_mclock_max_capacity_iops_ssd,
                conf.osd_mclock_max_sequential_bandwidth_ssd,
            )
        };
        self.osd_bandwidth_cost_per_io = bandwidth as f64 / capacity_iops;
        self.osd_bandwidth_capacity_per_shard_thread =
            bandwidth as f64 / f64::from(self.num_op_shard_threads);
        debug!(
            osd = %self.whoami,
            shard = self.shard_id,
            cost_per_io = self.osd_bandwidth_cost_per_io,
            capacity_per_shard_thread = self.osd_bandwidth_capacity_per_shard_thread,
            "op scheduler capacity parameters updated"
        );
        self.client_registry
            .update_from_config(&conf, self.osd_bandwidth_capacity_per_shard_thread);
    }

    /// Normalize an op's raw cost to sequential bytes, charging
    /// `osd_bandwidth_cost_per_io` for every random IO. Clamped to at
    /// least 1 so that zero-cost ops still consume queue bandwidth.
    pub fn calc_scaled_cost(&self, cost: OpCost) -> u32 {
        let scaled = cost.size_bytes as f64 + self.osd_bandwidth_cost_per_io * cost.iops as f64;
        scaled.clamp(1.0, f64::from(u32::MAX)) as u32
    }

    /// Enqueue an op at the back of its queue. Never blocks.
    pub fn enqueue(&mut self, item: OpSchedulerItem<T>) {
        SCHEDULER_OPS_ENQUEUED
            .with_label_values(&[item.class.into()])
            .inc();
        if item.class == SchedulerClass::Immediate {
            self.enqueue_high(IMMEDIATE_CLASS_PRIORITY, item, false);
        } else if item.priority > self.cutoff_priority {
            self.enqueue_high(item.priority, item, false);
        } else {
            let id = SchedulerId {
                class: item.class,
                client_profile: ClientProfileId::default(),
            };
            let info = *self.client_registry.get_info(&id);
            let cost = self.calc_scaled_cost(item.cost);
            let now = self.now_secs();
            self.scheduler.add_request(id, &info, cost, item, now);
        }
    }

    /// Enqueue at the head of the item's priority bucket in the strict
    /// lane. Used to requeue an op after a transient condition; a requeued
    /// op never re-enters mClock, so sub-cutoff priorities are raised to
    /// the cutoff.
    pub fn enqueue_front(&mut self, item: OpSchedulerItem<T>) {
        SCHEDULER_OPS_ENQUEUED
            .with_label_values(&[item.class.into()])
            .inc();
        let priority = if item.class == SchedulerClass::Immediate {
            IMMEDIATE_CLASS_PRIORITY
        } else if item.priority < self.cutoff_priority {
            self.cutoff_priority
        } else {
            item.priority
        };
        self.enqueue_high(priority, item, true);
    }

    fn enqueue_high(&mut self, priority: Priority, item: OpSchedulerItem<T>, front: bool) {
        let bucket = self.high_priority.entry(priority).or_default();
        if front {
            bucket.push_front(item);
        } else {
            bucket.push_back(item);
        }
    }

    /// Produce the next op to dispatch, or the instant at which one will
    /// become eligible. Never blocks.
    pub fn dequeue(&mut self) -> Dequeued<T> {
        if let Some(&priority) = self.high_priority.keys().next_back() {
            let bucket = self
                .high_priority
                .get_mut(&priority)
                .expect("key just observed");
            let item = bucket.pop_front().expect("buckets are never empty");
            if bucket.is_empty() {
                self.high_priority.remove(&priority);
            }
            SCHEDULER_OPS_DEQUEUED
                .with_label_values(&[item.class.into()])
                .inc();
            return Dequeued::Ready(item);
        }

        match self.scheduler.pull_request(self.now_secs()) {
            Pull::Ready(item) => {
                SCHEDULER_OPS_DEQUEUED
                    .with_label_values(&[item.class.into()])
                    .inc();
                Dequeued::Ready(item)
            }
            Pull::Future(at) => Dequeued::FutureReady(self.epoch + Duration::from_secs_f64(at)),
            Pull::Empty => Dequeued::Empty,
        }
    }

    pub fn empty(&self) -> bool {
        self.scheduler.is_empty() && self.high_priority.is_empty()
    }

    /// Total number of queued ops across both lanes.
    pub fn len(&self) -> usize {
        self.scheduler.len() + self.high_priority.values().map(VecDeque::len).sum::<usize>()
    }

    /// Formatted snapshot of the queues: per-class mClock depths plus the
    /// strict-lane backlog.
    pub fn dump(&self) -> serde_json::Value {
        let mclock_queues: Vec<_> = self
            .scheduler
            .depths()
            .into_iter()
            .map(|(id, depth)| json!({ "id": id, "depth": depth }))
            .collect();
        json!({
            "shard_id": self.shard_id,
            "cutoff_priority": self.cutoff_priority,
            "high_priority_backlog": self
                .high_priority
                .values()
                .map(VecDeque::len)
                .sum::<usize>(),
            "mclock_queues": mclock_queues,
        })
    }

    fn now_secs(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    #[cfg(test)]
    fn cutoff_priority(&self) -> Priority {
        self.cutoff_priority
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OsdConfig;

    fn test_conf() -> OsdConfig {
        // 1000 IOPS against 500 MB/s makes each random IO cost 500_000
        // sequential bytes.
        let mut conf = OsdConfig::default();
        conf.osd_mclock_max_capacity_iops_hdd = 1000.0;
        conf.osd_mclock_max_sequential_bandwidth_hdd = 500_000_000;
        conf
    }

    fn test_scheduler(conf: OsdConfig) -> OpScheduler<&'static str> {
        OpScheduler::new(ConfigHandle::new(conf), NodeId(1), 0, 1, true)
    }

    fn client_item(priority: Priority, payload: &'static str) -> OpSchedulerItem<&'static str> {
        OpSchedulerItem {
            class: SchedulerClass::Client,
            priority,
            cost: OpCost {
                size_bytes: 4096,
                iops: 1,
            },
            payload,
        }
    }

    fn expect_ready(scheduler: &mut OpScheduler<&'static str>) -> &'static str {
        match scheduler.dequeue() {
            Dequeued::Ready(item) => item.payload,
            other => panic!("expected Ready, got {other:?}"),
        }
    }

    #[test]
    fn scaled_cost_combines_bytes_and_iops() {
        let scheduler = test_scheduler(test_conf());
        let cost = OpCost {
            size_bytes: 4096,
            iops: 1,
        };
        assert_eq!(scheduler.calc_scaled_cost(cost), 504_096);
    }

    #[test]
    fn scaled_cost_clamps_to_one() {
        let scheduler = test_scheduler(test_conf());
        assert_eq!(scheduler.calc_scaled_cost(OpCost::default()), 1);
    }

    #[test]
    fn immediate_bypasses_mclock() {
        let mut scheduler = test_scheduler(test_conf());
        scheduler.enqueue(client_item(63, "client"));
        scheduler.enqueue(OpSchedulerItem {
            class: SchedulerClass::Immediate,
            priority: 0,
            cost: OpCost::default(),
            payload: "immediate",
        });

        assert_eq!(expect_ready(&mut scheduler), "immediate");
        assert_eq!(expect_ready(&mut scheduler), "client");
        assert!(scheduler.empty());
    }

    #[test]
    fn priority_above_cutoff_bypasses_mclock() {
        let mut scheduler = test_scheduler(test_conf());
        assert_eq!(scheduler.cutoff_priority(), PRIORITY_HIGH);

        scheduler.enqueue(client_item(63, "ordinary"));
        scheduler.enqueue(client_item(PRIORITY_HIGH + 1, "urgent"));
        assert_eq!(expect_ready(&mut scheduler), "urgent");
        assert_eq!(expect_ready(&mut scheduler), "ordinary");
    }

    #[test]
    fn high_lane_is_fifo_within_a_bucket_and_ordered_across() {
        let mut scheduler = test_scheduler(test_conf());
        scheduler.enqueue(client_item(200, "a"));
        scheduler.enqueue(client_item(200, "b"));
        scheduler.enqueue(client_item(210, "c"));
        scheduler.enqueue_front(client_item(200, "d"));

        assert_eq!(expect_ready(&mut scheduler), "c");
        assert_eq!(expect_ready(&mut scheduler), "d");
        assert_eq!(expect_ready(&mut scheduler), "a");
        assert_eq!(expect_ready(&mut scheduler), "b");
    }

    #[test]
    fn requeued_ops_go_to_the_strict_lane() {
        let mut scheduler = test_scheduler(test_conf());
        scheduler.enqueue(client_item(63, "fresh"));
        // a requeued op of the same low priority jumps ahead: it is raised
        // into the cutoff bucket instead of rejoining mclock
        scheduler.enqueue_front(client_item(63, "requeued"));

        assert_eq!(expect_ready(&mut scheduler), "requeued");
        assert_eq!(expect_ready(&mut scheduler), "fresh");
        assert!(scheduler.empty());
    }

    #[test]
    fn enqueue_dequeue_conservation() {
        let mut scheduler = test_scheduler(test_conf());
        scheduler.enqueue(client_item(63, "a"));
        scheduler.enqueue(client_item(200, "b"));
        scheduler.enqueue(OpSchedulerItem {
            class: SchedulerClass::BackgroundRecovery,
            priority: 10,
            cost: OpCost {
                size_bytes: 1,
                iops: 0,
            },
            payload: "c",
        });
        assert_eq!(scheduler.len(), 3);

        let mut dispatched = 0;
        while dispatched < 3 {
            match scheduler.dequeue() {
                Dequeued::Ready(_) => dispatched += 1,
                Dequeued::FutureReady(_) => std::thread::sleep(Duration::from_millis(1)),
                Dequeued::Empty => panic!("queue emptied early"),
            }
        }
        assert_eq!(scheduler.len(), 0);
        assert!(matches!(scheduler.dequeue(), Dequeued::Empty));
    }

    #[test]
    fn limited_class_reports_future_readiness() {
        let mut conf = test_conf();
        // No reservation floor, tiny ceiling: the second op of the burst
        // has to wait for the limit tag to come due.
        conf.osd_mclock_scheduler_client_res = 0.0;
        conf.osd_mclock_scheduler_client_lim = 0.000001;
        let mut scheduler = test_scheduler(conf);

        scheduler.enqueue(client_item(63, "first"));
        scheduler.enqueue(client_item(63, "second"));

        assert_eq!(expect_ready(&mut scheduler), "first");
        match scheduler.dequeue() {
            Dequeued::FutureReady(at) => assert!(at > Instant::now()),
            other => panic!("expected FutureReady, got {other:?}"),
        }
        assert_eq!(scheduler.len(), 1);
    }

    #[test]
    fn debug_random_rolls_one_of_the_two_cutoffs() {
        let mut conf = test_conf();
        conf.osd_op_queue_cut_off = CutoffPolicy::DebugRandom;
        let scheduler = test_scheduler(conf);
        assert!(
            scheduler.cutoff_priority() == PRIORITY_HIGH
                || scheduler.cutoff_priority() == PRIORITY_LOW
        );
    }

    #[test]
    fn update_configuration_tracks_device_class_changes() {
        let handle = ConfigHandle::new(test_conf());
        let mut scheduler: OpScheduler<&'static str> =
            OpScheduler::new(handle.clone(), NodeId(1), 0, 1, true);
        assert_eq!(
            scheduler.calc_scaled_cost(OpCost {
                size_bytes: 0,
                iops: 1
            }),
            500_000
        );

        let mut conf = test_conf();
        conf.osd_mclock_max_capacity_iops_hdd = 500.0;
        handle.update(conf);
        scheduler.update_configuration();
        assert_eq!(
            scheduler.calc_scaled_cost(OpCost {
                size_bytes: 0,
                iops: 1
            }),
            1_000_000
        );
    }
}
