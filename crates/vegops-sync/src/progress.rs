//! Observer interface the orchestrator and rollup builders report through.
//! Passed explicitly through calls; the no-op default keeps the pipeline free
//! of any required observability dependency.

use tracing::{error, info, warn};

pub trait ProgressReporter: Send + Sync {
    fn started(&self, _label: &str) {}
    fn info(&self, _message: &str) {}
    fn success(&self, _message: &str) {}
    fn warning(&self, _message: &str) {}
    fn error(&self, _message: &str) {}
    fn progress(&self, _current: usize, _total: usize, _label: &str) {}
    fn completed(&self, _label: &str) {}
}

/// Default reporter: discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentReporter;

impl ProgressReporter for SilentReporter {}

/// Forwards every event to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ProgressReporter for TracingReporter {
    fn started(&self, label: &str) {
        info!(label, "started");
    }

    fn info(&self, message: &str) {
        info!("{message}");
    }

    fn success(&self, message: &str) {
        info!("{message}");
    }

    fn warning(&self, message: &str) {
        warn!("{message}");
    }

    fn error(&self, message: &str) {
        error!("{message}");
    }

    fn progress(&self, current: usize, total: usize, label: &str) {
        info!(current, total, label, "progress");
    }

    fn completed(&self, label: &str) {
        info!(label, "completed");
    }
}
