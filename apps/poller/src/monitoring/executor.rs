use logger::HostFilter;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{ChildStderr, ChildStdout};
use tokio::time::timeout;
use tracing::{Level, debug, info, trace, warn};

use super::parser;
use super::probe::ProbeTool;
use super::types::{BatchId, ProbeCause, ProbeOutcome};
use crate::error::ProbeError;

/// Upper bound for reaping a process after it was killed
const KILL_REAP_WAIT: Duration = Duration::from_millis(500);

enum RunOutput {
    Exited(String),
    TimedOut,
}

/// Batch probe executor - runs one probe process for a whole batch of hosts
///
/// `execute` always returns exactly one outcome per requested address and
/// always finishes within `batch_timeout + output_wait` plus a short reap wait.
pub struct BatchProbeExecutor {
    tool: Arc<dyn ProbeTool>,
    batch_timeout: Duration,
    output_wait: Duration,
    trace_hosts: HostFilter,
}

impl BatchProbeExecutor {
    pub fn new(tool: Arc<dyn ProbeTool>, batch_timeout: Duration, output_wait: Duration) -> Self {
        Self { tool, batch_timeout, output_wait, trace_hosts: HostFilter::default() }
    }

    /// Restrict per-host trace lines to these hosts
    pub fn with_trace_hosts(mut self, trace_hosts: HostFilter) -> Self {
        self.trace_hosts = trace_hosts;
        self
    }

    /// Probe every address with a single process invocation
    pub async fn execute(
        &self,
        addresses: &[String],
        batch_id: BatchId,
    ) -> HashMap<String, ProbeOutcome> {
        if addresses.is_empty() {
            debug!(batch = %batch_id, "Empty batch, nothing to probe");
            return HashMap::new();
        }

        if tracing::enabled!(Level::TRACE) {
            for address in addresses.iter().filter(|a| self.trace_hosts.allows(a)) {
                trace!(batch = %batch_id, address = %address, "Added to batch");
            }
        }

        match self.run(addresses, batch_id).await {
            Ok(RunOutput::Exited(output)) => self.collect(addresses, &output, batch_id),
            Ok(RunOutput::TimedOut) => uniform(addresses, ProbeCause::Timeout),
            Err(error) => {
                warn!(batch = %batch_id, hosts = addresses.len(), "Probe run failed: {}", error);
                uniform(addresses, ProbeCause::Error)
            }
        }
    }

    async fn run(&self, addresses: &[String], batch_id: BatchId) -> Result<RunOutput, ProbeError> {
        let mut command = self.tool.command(addresses);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let started = Instant::now();
        let mut child = command.spawn().map_err(ProbeError::Start)?;
        info!(
            batch = %batch_id,
            tool = self.tool.name(),
            pid = ?child.id(),
            hosts = addresses.len(),
            timeout_ms = self.batch_timeout.as_millis() as u64,
            "Probe process started"
        );

        // Output must be drained while the process runs, or a full pipe blocks it forever
        let mut drain = tokio::spawn(drain_output(child.stdout.take(), child.stderr.take()));

        let status = match timeout(self.batch_timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(error)) => {
                drain.abort();
                let _ = child.start_kill();
                return Err(ProbeError::Wait(error));
            }
            Err(_) => {
                if let Err(error) = child.start_kill() {
                    warn!(batch = %batch_id, "Failed to kill probe process: {}", error);
                }
                drain.abort();
                let _ = timeout(KILL_REAP_WAIT, child.wait()).await;
                warn!(
                    batch = %batch_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    hosts = addresses.len(),
                    "Probe process timed out, killed"
                );
                return Ok(RunOutput::TimedOut);
            }
        };

        info!(
            batch = %batch_id,
            exit_code = ?status.code(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Probe process completed"
        );

        let output = match timeout(self.output_wait, &mut drain).await {
            Ok(Ok(read)) => read.map_err(ProbeError::OutputRead)?,
            Ok(Err(_)) => return Err(ProbeError::DrainAborted),
            Err(_) => {
                drain.abort();
                return Err(ProbeError::OutputTimeout(self.output_wait));
            }
        };
        debug!(batch = %batch_id, bytes = output.len(), "Probe output retrieved");

        Ok(RunOutput::Exited(output))
    }

    fn collect(
        &self,
        addresses: &[String],
        output: &str,
        batch_id: BatchId,
    ) -> HashMap<String, ProbeOutcome> {
        if output.trim().is_empty() {
            warn!(batch = %batch_id, "Empty output from probe process");
            return uniform(addresses, ProbeCause::Error);
        }

        let started = Instant::now();
        let mut parsed = parser::parse(output);
        info!(
            batch = %batch_id,
            parsed = parsed.len(),
            expected = addresses.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Parsing completed"
        );

        let mut outcomes = HashMap::with_capacity(addresses.len());
        for address in addresses {
            if outcomes.contains_key(address) {
                continue;
            }
            let outcome = match parsed.remove(address) {
                Some(outcome) => {
                    if self.trace_hosts.allows(address) {
                        trace!(
                            batch = %batch_id,
                            address = %address,
                            cause = %outcome.cause,
                            loss = outcome.packet_loss_percent,
                            avg_ms = outcome.rtt.map(|rtt| rtt.avg_ms).unwrap_or(-1.0),
                            "Parsed"
                        );
                    }
                    outcome
                }
                None => {
                    warn!(batch = %batch_id, address = %address, "Missing from probe output");
                    ProbeOutcome::failed(address.as_str(), ProbeCause::HostMissing)
                }
            };
            outcomes.insert(address.clone(), outcome);
        }

        if !parsed.is_empty() {
            debug!(batch = %batch_id, extra = parsed.len(), "Ignoring output lines for hosts outside the batch");
        }

        outcomes
    }
}

/// Same failure cause for every address
fn uniform(addresses: &[String], cause: ProbeCause) -> HashMap<String, ProbeOutcome> {
    addresses
        .iter()
        .map(|address| (address.clone(), ProbeOutcome::failed(address.as_str(), cause)))
        .collect()
}

/// Read stdout and stderr to the end concurrently and merge them
async fn drain_output(
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
) -> std::io::Result<String> {
    let (out, err) = tokio::try_join!(read_all(stdout), read_all(stderr))?;

    let mut combined = String::from_utf8_lossy(&out).into_owned();
    if !combined.is_empty() && !combined.ends_with('\n') {
        combined.push('\n');
    }
    combined.push_str(&String::from_utf8_lossy(&err));
    Ok(combined)
}

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> std::io::Result<Vec<u8>> {
    let mut buffer = Vec::with_capacity(8192);
    if let Some(mut reader) = reader {
        reader.read_to_end(&mut buffer).await?;
    }
    Ok(buffer)
}
