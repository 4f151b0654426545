//! OSD-wide scrub resource counters.
//!
//! One pool of `osd_max_scrubs` slots covers both scrubs this node runs as
//! a primary and reservations it has granted to remote primaries.

use std::collections::BTreeSet;
use std::sync::Mutex;

use serde::Serialize;
use tracing::{debug, warn};
use utils::id::PgId;

use crate::config::ConfigHandle;
use crate::metrics::{SCRUB_LOCAL_RESERVATIONS, SCRUB_REMOTE_RESERVATIONS};

#[derive(Default)]
struct Counters {
    scrubs_local: u32,
    granted_reservations: BTreeSet<PgId>,
}

pub struct ScrubResources {
    conf: ConfigHandle,
    counters: Mutex<Counters>,
}

/// Snapshot for the admin dump.
#[derive(Debug, Serialize)]
pub struct ScrubResourcesDump {
    pub scrubs_local: u32,
    pub granted_reservations: Vec<PgId>,
    pub osd_max_scrubs: u32,
}

impl ScrubResources {
    pub fn new(conf: ConfigHandle) -> Self {
        ScrubResources {
            conf,
            counters: Mutex::new(Counters::default()),
        }
    }

    fn total_of(counters: &Counters) -> u32 {
        counters.scrubs_local + counters.granted_reservations.len() as u32
    }

    /// Would another scrub be admitted right now? Does not reserve.
    pub fn can_inc_scrubs(&self) -> bool {
        let counters = self.counters.lock().unwrap();
        Self::total_of(&counters) < self.conf.get().osd_max_scrubs
    }

    /// Take one slot for a scrub this node runs as a primary.
    pub fn inc_scrubs_local(&self) -> bool {
        let mut counters = self.counters.lock().unwrap();
        if Self::total_of(&counters) >= self.conf.get().osd_max_scrubs {
            debug!(
                scrubs_local = counters.scrubs_local,
                granted = counters.granted_reservations.len(),
                "no local scrub slot available"
            );
            return false;
        }
        counters.scrubs_local += 1;
        SCRUB_LOCAL_RESERVATIONS.set(counters.scrubs_local as i64);
        true
    }

    pub fn dec_scrubs_local(&self) {
        let mut counters = self.counters.lock().unwrap();
        assert!(counters.scrubs_local > 0, "unbalanced dec_scrubs_local");
        counters.scrubs_local -= 1;
        SCRUB_LOCAL_RESERVATIONS.set(counters.scrubs_local as i64);
    }

    /// Take one slot on behalf of a remote primary scrubbing `pgid`.
    /// Granting twice for the same PG is answered affirmatively without
    /// consuming another slot.
    pub fn inc_scrubs_remote(&self, pgid: PgId) -> bool {
        let mut counters = self.counters.lock().unwrap();
        if counters.granted_reservations.contains(&pgid) {
            warn!(%pgid, "duplicate remote reservation request");
            return true;
        }
        if Self::total_of(&counters) >= self.conf.get().osd_max_scrubs {
            debug!(%pgid, "no scrub slot available for the remote primary");
            return false;
        }
        counters.granted_reservations.insert(pgid);
        SCRUB_REMOTE_RESERVATIONS.set(counters.granted_reservations.len() as i64);
        true
    }

    pub fn dec_scrubs_remote(&self, pgid: PgId) {
        let mut counters = self.counters.lock().unwrap();
        if !counters.granted_reservations.remove(&pgid) {
            warn!(%pgid, "releasing a remote reservation that was not held");
            return;
        }
        SCRUB_REMOTE_RESERVATIONS.set(counters.granted_reservations.len() as i64);
    }

    pub fn dump(&self) -> ScrubResourcesDump {
        let counters = self.counters.lock().unwrap();
        ScrubResourcesDump {
            scrubs_local: counters.scrubs_local,
            granted_reservations: counters.granted_reservations.iter().copied().collect(),
            osd_max_scrubs: self.conf.get().osd_max_scrubs,
        }
    }
}
