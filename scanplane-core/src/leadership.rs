//! Explicit "this controller is the active scanner" capability.
//!
//! Leadership is decided elsewhere; components only read the flag, and the
//! runtime reacts to rising edges by resuming work.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;

pub trait ScannerRole: Send + Sync + fmt::Debug {
    fn is_scanner(&self) -> bool;
}

/// Settable [`ScannerRole`] with change notification.
#[derive(Clone)]
pub struct LeadershipFlag {
    flag: Arc<AtomicBool>,
    tx: Arc<watch::Sender<bool>>,
}

impl fmt::Debug for LeadershipFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeadershipFlag")
            .field("is_scanner", &self.is_scanner())
            .field("watchers", &self.tx.receiver_count())
            .finish()
    }
}

impl LeadershipFlag {
    pub fn new(initial: bool) -> Self {
        let (tx, _) = watch::channel(initial);
        Self {
            flag: Arc::new(AtomicBool::new(initial)),
            tx: Arc::new(tx),
        }
    }

    /// Returns whether the value changed.
    pub fn set(&self, is_scanner: bool) -> bool {
        let previous = self.flag.swap(is_scanner, Ordering::SeqCst);
        if previous != is_scanner {
            tracing::info!(target: "scan::registry", is_scanner, "scanner role changed");
            self.tx.send_replace(is_scanner);
            true
        } else {
            false
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl ScannerRole for LeadershipFlag {
    fn is_scanner(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
