use std::sync::atomic::{AtomicBool, Ordering};

use crate::config;

static ENABLED: AtomicBool = AtomicBool::new(true);

pub(crate) enum RuntimeWarning {
    /// posted receives (current, target) fell below half of the target
    DeadlockAlert(usize, usize),
    /// posts still queued when the backlog queue was dropped
    BacklogLeftover(usize),
}

impl RuntimeWarning {
    pub(crate) fn enable_warnings() {
        ENABLED.store(true, Ordering::Relaxed);
    }
    pub(crate) fn disable_warnings() {
        ENABLED.store(false, Ordering::Relaxed);
    }
    fn print_warning(&self) -> bool {
        if ENABLED.load(Ordering::Relaxed) {
            match self {
                RuntimeWarning::DeadlockAlert(_, _) => config().deadlock_warning.unwrap_or(true),
                RuntimeWarning::BacklogLeftover(_) => config().backlog_warning.unwrap_or(true),
            }
        } else {
            false
        }
    }

    pub(crate) fn print(self) {
        if self.print_warning() {
            match self {
                RuntimeWarning::DeadlockAlert(posted, target) => {
                    tracing::warn!(
                        posted,
                        target,
                        "[LCI WARNING] only {posted} of {target} receives are posted, the packet pool is running dry. \
                        Incoming messages may stall until packets are released; consider raising LCI_SERVER_NUM_PKTS. \
                        Set LCI_DEADLOCK_WARNING=false to disable this warning."
                    );
                }
                RuntimeWarning::BacklogLeftover(count) => {
                    tracing::warn!(
                        count,
                        "[LCI WARNING] a device was dropped with {count} posts still waiting in its backlog queue, they will never be sent. \
                        Keep calling progress until outstanding operations complete. \
                        Set LCI_BACKLOG_WARNING=false to disable this warning."
                    );
                }
            }
        }
    }
}
