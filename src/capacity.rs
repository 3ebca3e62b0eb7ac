//! CPU capacity accounting for one node.
//!
//! Two modes, picked in the config:
//!
//! * **Counter** — a node-local integer, charged at dispatch and released
//!   when a job finishes or a running job is removed. Cheap, but blind to
//!   rows left behind by earlier daemon processes.
//! * **Query** — recomputed from the store on every read; authoritative
//!   across restarts. This is the default.
//!
//! The counters are atomics only to satisfy `Send + Sync`; the daemon runs
//! on a single-threaded scheduler and never touches them across a
//! suspension point.

use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};

use crate::jobstore::{JobStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapacityMode {
    Counter,
    Query,
}

pub struct CpuAccountant {
    mode: CapacityMode,
    total: AtomicI64,
    used: AtomicI64,
}

impl CpuAccountant {
    pub fn new(mode: CapacityMode, total: i64) -> Self {
        Self {
            mode,
            total: AtomicI64::new(total),
            used: AtomicI64::new(0),
        }
    }

    pub fn mode(&self) -> CapacityMode {
        self.mode
    }

    /// Configured node capacity.
    pub fn total(&self) -> i64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Runtime capacity change (`setconfig ncpus`).
    pub fn set_total(&self, total: i64) {
        self.total.store(total, Ordering::Relaxed);
    }

    /// CPUs in use on `node`, per the configured mode.
    pub async fn used(&self, store: &dyn JobStore, node: &str) -> Result<i64, StoreError> {
        match self.mode {
            CapacityMode::Counter => Ok(self.used.load(Ordering::Relaxed)),
            CapacityMode::Query => store.used_cpus(node).await,
        }
    }

    /// Charge a dispatched job's CPUs. No-op in query mode: the claimed row
    /// is committed before the next read, so the query already sees it.
    pub fn charge(&self, ncpus: i32) {
        if self.mode == CapacityMode::Counter {
            self.used.fetch_add(ncpus as i64, Ordering::Relaxed);
        }
    }

    /// Release a finished or removed job's CPUs, clamped at zero. A forced
    /// start can over-subscribe the node, so the counter may exceed `total`
    /// temporarily, but it never goes negative.
    pub fn release(&self, ncpus: i32) {
        if self.mode != CapacityMode::Counter {
            return;
        }
        let mut current = self.used.load(Ordering::Relaxed);
        loop {
            let next = (current - ncpus as i64).max(0);
            match self
                .used
                .compare_exchange(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }
}
