//! Daemon configuration.
//!
//! Options are read from an `osd.toml` file and published through an
//! [`ArcSwap`] so that long-lived components observe updates without
//! restarting. Components that cache values derived from the config
//! (the op scheduler's capacity parameters, for instance) expose an
//! `update_configuration()` hook that re-reads the current snapshot.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use arc_swap::ArcSwap;
use camino::Utf8Path;
use serde::Deserialize;

/// Policy deciding which op priorities bypass the mClock queue and go to
/// the strict high-priority lane instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CutoffPolicy {
    /// Ordinary client-priority messages pass through mClock.
    High,
    /// Only genuinely immediate traffic bypasses mClock.
    Low,
    /// Pick one of the above at random, once, at scheduler construction.
    /// A stress-test knob.
    DebugRandom,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OsdConfig {
    // -- op scheduler shards --
    pub osd_op_num_shards: u32,
    pub osd_op_num_threads_per_shard: u32,

    // -- cost model --
    pub osd_op_queue_cut_off: CutoffPolicy,
    pub osd_mclock_max_capacity_iops_hdd: f64,
    pub osd_mclock_max_capacity_iops_ssd: f64,
    /// bytes per second
    pub osd_mclock_max_sequential_bandwidth_hdd: u64,
    pub osd_mclock_max_sequential_bandwidth_ssd: u64,

    // -- mClock (reservation, weight, limit) per class; res/lim are ratios
    // of the per-shard-thread capacity, weight is used as-is --
    pub osd_mclock_scheduler_client_res: f64,
    pub osd_mclock_scheduler_client_wgt: f64,
    pub osd_mclock_scheduler_client_lim: f64,
    pub osd_mclock_scheduler_background_recovery_res: f64,
    pub osd_mclock_scheduler_background_recovery_wgt: f64,
    pub osd_mclock_scheduler_background_recovery_lim: f64,
    pub osd_mclock_scheduler_background_best_effort_res: f64,
    pub osd_mclock_scheduler_background_best_effort_wgt: f64,
    pub osd_mclock_scheduler_background_best_effort_lim: f64,

    // -- scrub resource caps --
    pub osd_max_scrubs: u32,

    // -- scrub timing --
    #[serde(with = "humantime_serde")]
    pub osd_scrub_sleep: Duration,
    #[serde(with = "humantime_serde")]
    pub osd_scrub_extended_sleep: Duration,
    #[serde(with = "humantime_serde")]
    pub osd_scrub_min_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub osd_scrub_max_interval: Duration,
    pub osd_scrub_interval_randomize_ratio: f64,
    pub osd_scrub_backoff_ratio: f64,
    pub osd_scrub_invalid_stats: bool,
    pub osd_scrub_during_recovery: bool,
    pub osd_repair_during_recovery: bool,
    #[serde(with = "humantime_serde")]
    pub osd_scrub_reservation_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub osd_blocked_scrub_grace_period: Duration,

    // -- scrub windows --
    pub osd_scrub_load_threshold: f64,
    /// Hours are `0..=23`; `begin == end` permits the whole day.
    pub osd_scrub_begin_hour: u32,
    pub osd_scrub_end_hour: u32,
    /// Week days are `0..=6`, `0` is Sunday; `begin == end` permits the
    /// whole week.
    pub osd_scrub_begin_week_day: u32,
    pub osd_scrub_end_week_day: u32,
}

impl Default for OsdConfig {
    fn default() -> Self {
        OsdConfig {
            osd_op_num_shards: 5,
            osd_op_num_threads_per_shard: 1,
            osd_op_queue_cut_off: CutoffPolicy::High,
            osd_mclock_max_capacity_iops_hdd: 315.0,
            osd_mclock_max_capacity_iops_ssd: 21500.0,
            osd_mclock_max_sequential_bandwidth_hdd: 150 * 1024 * 1024,
            osd_mclock_max_sequential_bandwidth_ssd: 1200 * 1024 * 1024,
            osd_mclock_scheduler_client_res: 0.5,
            osd_mclock_scheduler_client_wgt: 1.0,
            osd_mclock_scheduler_client_lim: 0.0,
            osd_mclock_scheduler_background_recovery_res: 0.25,
            osd_mclock_scheduler_background_recovery_wgt: 1.0,
            osd_mclock_scheduler_background_recovery_lim: 0.0,
            osd_mclock_scheduler_background_best_effort_res: 0.25,
            osd_mclock_scheduler_background_best_effort_wgt: 2.0,
            osd_mclock_scheduler_background_best_effort_lim: 0.0,
            osd_max_scrubs: 1,
            osd_scrub_sleep: Duration::ZERO,
            osd_scrub_extended_sleep: Duration::from_secs(1),
            osd_scrub_min_interval: Duration::from_secs(24 * 60 * 60),
            osd_scrub_max_interval: Duration::from_secs(7 * 24 * 60 * 60),
            osd_scrub_interval_randomize_ratio: 0.5,
            osd_scrub_backoff_ratio: 0.66,
            osd_scrub_invalid_stats: true,
            osd_scrub_during_recovery: false,
            osd_repair_during_recovery: false,
            osd_scrub_reservation_timeout: Duration::from_secs(10),
            osd_blocked_scrub_grace_period: Duration::from_secs(120),
            osd_scrub_load_threshold: 0.5,
            osd_scrub_begin_hour: 0,
            osd_scrub_end_hour: 0,
            osd_scrub_begin_week_day: 0,
            osd_scrub_end_week_day: 0,
        }
    }
}

impl OsdConfig {
    pub fn from_toml(toml: &str) -> anyhow::Result<OsdConfig> {
        toml::from_str(toml).context("failed to parse the config file")
    }

    pub fn load(path: &Utf8Path) -> anyhow::Result<OsdConfig> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {path:?}"))?;
        Self::from_toml(&contents)
    }
}

/// Per-pool overrides for the scrub intervals. A zero duration means
/// "not set, use the OSD-wide value".
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct PoolScrubOptions {
    #[serde(with = "humantime_serde")]
    pub scrub_min_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub scrub_max_interval: Duration,
}

/// Shared, hot-swappable handle to the current [`OsdConfig`].
#[derive(Clone)]
pub struct ConfigHandle(Arc<ArcSwap<OsdConfig>>);

impl ConfigHandle {
    pub fn new(conf: OsdConfig) -> Self {
        ConfigHandle(Arc::new(ArcSwap::new(Arc::new(conf))))
    }

    /// Snapshot of the current config. Holders must not cache the returned
    /// `Arc` across reconfigurations.
    pub fn get(&self) -> Arc<OsdConfig> {
        self.0.load_full()
    }

    pub fn update(&self, conf: OsdConfig) {
        self.0.store(Arc::new(conf));
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        ConfigHandle::new(OsdConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_empty_toml() {
        let conf = OsdConfig::from_toml("").unwrap();
        assert_eq!(conf.osd_op_num_shards, 5);
        assert_eq!(conf.osd_scrub_backoff_ratio, 0.66);
        assert_eq!(conf.osd_scrub_min_interval, Duration::from_secs(86400));
    }

    #[test]
    fn humantime_durations_and_enums() {
        let conf = OsdConfig::from_toml(
            r#"
osd_scrub_sleep = "200ms"
osd_scrub_min_interval = "1day"
osd_op_queue_cut_off = "debug_random"
"#,
        )
        .unwrap();
        assert_eq!(conf.osd_scrub_sleep, Duration::from_millis(200));
        assert_eq!(conf.osd_scrub_min_interval, Duration::from_secs(86400));
        assert_eq!(conf.osd_op_queue_cut_off, CutoffPolicy::DebugRandom);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(OsdConfig::from_toml("osd_scrub_speling = 1\n").is_err());
    }

    #[test]
    fn config_handle_swap_is_visible() {
        let handle = ConfigHandle::default();
        assert_eq!(handle.get().osd_max_scrubs, 1);
        let mut conf = OsdConfig::default();
        conf.osd_max_scrubs = 3;
        handle.update(conf);
        assert_eq!(handle.get().osd_max_scrubs, 3);
    }
}
