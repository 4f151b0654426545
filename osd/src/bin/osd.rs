//! The OSD daemon entry point.
//!
//! Wires config, logging, the op shard workers and the scrub tick loop.
//! The messenger and the PG/object-store code are out of scope here: ops
//! reach the shard workers through per-worker channels (the messenger's
//! seam), and PGs appear once peering is up, so the registry the scrub
//! tick consults is empty.

use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant, SystemTime};

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use utils::id::{NodeId, PgId, PoolId};
use utils::logging::{self, LogFormat};

use osd::config::{ConfigHandle, OsdConfig};
use osd::scheduler::{Dequeued, OpCost, OpScheduler, OpSchedulerItem, SchedulerClass};
use osd::scrub::{LockedPg, OsdScrub, ScrubSchedListener};

#[derive(Parser)]
#[command(about = "object storage daemon")]
struct Args {
    /// Path to the config file; missing file means built-in defaults.
    #[arg(long, default_value = "osd.toml")]
    config: Utf8PathBuf,

    /// This node's id, as assigned by the cluster monitor.
    #[arg(long)]
    node_id: u64,

    /// Whether the backing device is rotational; selects the hdd/ssd
    /// capacity parameters of the cost model.
    #[arg(long)]
    rotational: bool,

    #[arg(long, default_value = "plain")]
    log_format: String,

    /// Seconds between scrub scheduling ticks.
    #[arg(long, default_value_t = 1.0)]
    tick_interval: f64,
}

/// The PG registry the scrub tick consults. Populated by peering, which is
/// out of scope here; the daemon runs with an empty one.
struct PgRegistry {
    whoami: NodeId,
}

impl ScrubSchedListener for PgRegistry {
    fn node_id(&self) -> NodeId {
        self.whoami
    }

    fn get_locked_pg(&self, _pgid: PgId) -> Option<Box<dyn LockedPg + '_>> {
        None
    }
}

/// Payload carried through the op scheduler. Decoding an op and executing
/// it against a PG belong to the messenger and the PG code; the scheduler
/// core only needs the target for tracing.
#[derive(Debug)]
struct OpPayload {
    pgid: PgId,
}

/// One op shard worker thread: owns its scheduler, feeds it from the
/// worker's op channel and dispatches whatever becomes eligible. Exits
/// when the channel closes.
fn shard_worker(
    shard_id: u32,
    conf: ConfigHandle,
    whoami: NodeId,
    num_op_shard_threads: u32,
    is_rotational: bool,
    ops: mpsc::Receiver<OpSchedulerItem<OpPayload>>,
) {
    let mut scheduler: OpScheduler<OpPayload> =
        OpScheduler::new(conf, whoami, shard_id, num_op_shard_threads, is_rotational);
    loop {
        match scheduler.dequeue() {
            Dequeued::Ready(item) => {
                // execution belongs to the PG code; the scheduler's work
                // ends at dispatch
                trace!(
                    shard = shard_id,
                    pgid = %item.payload.pgid,
                    class = ?item.class,
                    "op dispatched"
                );
            }
            Dequeued::FutureReady(at) => {
                // nothing is eligible before `at`; accept new arrivals in
                // the meantime
                let wait = at.saturating_duration_since(Instant::now());
                match ops.recv_timeout(wait) {
                    Ok(item) => scheduler.enqueue(item),
                    Err(mpsc::RecvTimeoutError::Timeout) => {}
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
            Dequeued::Empty => match ops.recv() {
                Ok(item) => scheduler.enqueue(item),
                Err(_) => break,
            },
        }
    }
    debug!(shard = shard_id, "op shard worker stopped");
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(args.log_format.parse::<LogFormat>()?, NodeId(args.node_id))?;

    let conf = if args.config.exists() {
        OsdConfig::load(&args.config)?
    } else {
        warn!(config = %args.config, "config file not found, using defaults");
        OsdConfig::default()
    };
    let conf = ConfigHandle::new(conf);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build the runtime")?;
    runtime.block_on(daemon_main(args, conf))
}

async fn daemon_main(args: Args, conf: ConfigHandle) -> anyhow::Result<()> {
    let whoami = NodeId(args.node_id);
    info!(osd = %whoami, "starting");

    // one op scheduler per shard worker thread; the send halves are where
    // the messenger will hand decoded ops over
    let (num_shards, threads_per_shard) = {
        let conf = conf.get();
        (
            conf.osd_op_num_shards.max(1),
            conf.osd_op_num_threads_per_shard.max(1),
        )
    };
    let num_op_shard_threads = num_shards * threads_per_shard;
    let mut op_queues = Vec::new();
    let mut workers = Vec::new();
    for shard_id in 0..num_shards {
        for thread in 0..threads_per_shard {
            let (tx, rx) = mpsc::channel();
            // a probe op exercises the queue plumbing end to end at startup
            tx.send(OpSchedulerItem {
                class: SchedulerClass::BackgroundBestEffort,
                priority: 0,
                cost: OpCost::default(),
                payload: OpPayload {
                    pgid: PgId::new(PoolId(0), 0),
                },
            })
            .expect("receiver is alive, not yet moved to the worker");
            op_queues.push(tx);

            let conf = conf.clone();
            let is_rotational = args.rotational;
            let handle = std::thread::Builder::new()
                .name(format!("op_shard-{shard_id}.{thread}"))
                .spawn(move || {
                    shard_worker(
                        shard_id,
                        conf,
                        whoami,
                        num_op_shard_threads,
                        is_rotational,
                        rx,
                    )
                })
                .context("failed to spawn an op shard worker")?;
            workers.push(handle);
        }
    }
    info!(workers = workers.len(), "op shard workers started");

    let registry = Arc::new(PgRegistry { whoami });
    let scrub = Arc::new(OsdScrub::new(conf.clone(), registry));

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            shutdown.cancel();
        }
    });

    let mut tick = tokio::time::interval(Duration::from_secs_f64(args.tick_interval.max(0.1)));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                let _ = scrub.update_load_average();
                // recovery activity is reported by the recovery pipeline;
                // without one, the tick treats the OSD as idle
                scrub.initiate_scrub(false, SystemTime::now());
            }
        }
    }

    // closing the op channels stops the shard workers
    drop(op_queues);
    for worker in workers {
        let _ = worker.join();
    }

    info!(osd = %whoami, "stopped");
    Ok(())
}
