//! Resolution of per-class dmClock parameters from the config.
//!
//! Reservation and limit are configured as ratios of the OSD's bandwidth
//! capacity so that operators do not have to compute absolute rates for
//! every device class in the cluster. The registry turns those ratios into
//! absolute cost-units-per-second using the capacity of one op shard
//! thread.

use std::collections::HashMap;

use crate::config::OsdConfig;

use super::mclock::ClientInfo;
use super::{ClientProfileId, SchedulerClass, SchedulerId};

pub(crate) struct ClientRegistry {
    background_recovery: ClientInfo,
    background_best_effort: ClientInfo,
    /// All external clients currently share one profile (both profile
    /// fields zero); per-client entries are reserved for the distributed
    /// QoS feature.
    external_client_infos: HashMap<ClientProfileId, ClientInfo>,
    default_external_client_info: ClientInfo,
}

fn resolve(res_ratio: f64, weight: f64, lim_ratio: f64, capacity: f64) -> ClientInfo {
    // A limit ratio of zero stands for "unlimited".
    let limit = if lim_ratio == 0.0 {
        f64::INFINITY
    } else {
        lim_ratio * capacity
    };
    ClientInfo::new(res_ratio * capacity, weight, limit)
}

impl ClientRegistry {
    pub fn new() -> Self {
        // Placeholders; replaced by update_from_config before first use.
        ClientRegistry {
            background_recovery: ClientInfo::new(1.0, 1.0, 1.0),
            background_best_effort: ClientInfo::new(1.0, 1.0, 1.0),
            external_client_infos: HashMap::new(),
            default_external_client_info: ClientInfo::new(1.0, 1.0, 1.0),
        }
    }

    /// Re-resolve the mClock parameters (reservation, weight and limit)
    /// for each class of IO from the current config.
    pub fn update_from_config(&mut self, conf: &OsdConfig, capacity_per_shard_thread: f64) {
        self.background_recovery = resolve(
            conf.osd_mclock_scheduler_background_recovery_res,
            conf.osd_mclock_scheduler_background_recovery_wgt,
            conf.osd_mclock_scheduler_background_recovery_lim,
            capacity_per_shard_thread,
        );
        self.background_best_effort = resolve(
            conf.osd_mclock_scheduler_background_best_effort_res,
            conf.osd_mclock_scheduler_background_best_effort_wgt,
            conf.osd_mclock_scheduler_background_best_effort_lim,
            capacity_per_shard_thread,
        );
        self.default_external_client_info = resolve(
            conf.osd_mclock_scheduler_client_res,
            conf.osd_mclock_scheduler_client_wgt,
            conf.osd_mclock_scheduler_client_lim,
            capacity_per_shard_thread,
        );
    }

    fn get_external_client(&self, client: &ClientProfileId) -> &ClientInfo {
        self.external_client_infos
            .get(client)
            .unwrap_or(&self.default_external_client_info)
    }

    pub fn get_info(&self, id: &SchedulerId) -> &ClientInfo {
        match id.class {
            SchedulerClass::Immediate => {
                unreachable!("immediate ops bypass the mclock queue")
            }
            SchedulerClass::Client => self.get_external_client(&id.client_profile),
            SchedulerClass::BackgroundRecovery => &self.background_recovery,
            SchedulerClass::BackgroundBestEffort => &self.background_best_effort,
        }
    }
}
