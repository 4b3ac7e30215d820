//! Test doubles shared by the monitoring tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Command;

use super::executor::BatchProbeExecutor;
use super::pool::BatchSink;
use super::probe::ProbeTool;
use super::types::ProbeBatch;
use crate::error::SubmitError;

/// Runs a shell script with the batch addresses as `$@`
pub struct Script(pub &'static str);

impl ProbeTool for Script {
    fn command(&self, addresses: &[String]) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(self.0).arg("probe").args(addresses);
        command
    }

    fn name(&self) -> &str {
        "script"
    }
}

/// Every host answers
pub const ALL_UP: &str =
    r#"for h in "$@"; do echo "$h : xmt/rcv/%loss = 3/3/0%, min/avg/max = 1.0/2.0/3.0" >&2; done"#;

pub fn script_executor(script: &'static str, batch_timeout_ms: u64) -> Arc<BatchProbeExecutor> {
    Arc::new(BatchProbeExecutor::new(
        Arc::new(Script(script)),
        Duration::from_millis(batch_timeout_ms),
        Duration::from_millis(500),
    ))
}

pub fn hosts(entries: &[(&str, u64)]) -> BTreeMap<String, u64> {
    entries.iter().map(|(address, cadence)| (address.to_string(), *cadence)).collect()
}

/// Sink that records batches instead of probing them
#[derive(Default)]
pub struct RecordingSink {
    batches: Mutex<Vec<ProbeBatch>>,
}

impl RecordingSink {
    pub fn take(&self) -> Vec<ProbeBatch> {
        std::mem::take(&mut *self.batches.lock().unwrap())
    }
}

impl BatchSink for RecordingSink {
    fn submit(&self, batch: ProbeBatch) -> Result<(), SubmitError> {
        self.batches.lock().unwrap().push(batch);
        Ok(())
    }
}
