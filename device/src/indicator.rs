use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tracing::{debug, info};

/// Visible signals the device gives its operator.
pub trait Indicator: Send + Sync {
    /// A detection was handed to the reporter.
    fn acknowledge(&self);

    /// Toggle the alive signal.
    fn heartbeat(&self);
}

/// Host rendition of the status LED: state lives in memory, changes are logged.
#[derive(Default)]
pub struct LogIndicator {
    lit: AtomicBool,
    acknowledgements: AtomicU64,
}

#[cfg(test)]
impl LogIndicator {
    pub fn is_lit(&self) -> bool {
        self.lit.load(Ordering::Relaxed)
    }

    pub fn acknowledgements(&self) -> u64 {
        self.acknowledgements.load(Ordering::Relaxed)
    }
}

impl Indicator for LogIndicator {
    fn acknowledge(&self) {
        let n = self.acknowledgements.fetch_add(1, Ordering::Relaxed) + 1;
        info!(acknowledgements = n, "detection acknowledged");
    }

    fn heartbeat(&self) {
        let lit = !self.lit.fetch_xor(true, Ordering::Relaxed);
        debug!(lit, "heartbeat");
    }
}
