//! Per-host outcome files.
//!
//! Subscribes to both outcome channels and appends one record per event to
//! `<directory>/<address>.csv` (or `.jsonl`). Each received batch is written
//! in one pass with a single append per host file.

use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::OutputFormat;
use crate::monitoring::bus::{Channel, OutcomeBus};
use crate::monitoring::types::OutcomeEvent;

pub const CSV_HEADER: &str =
    "Timestamp,EpochMs,IP,Status,PacketLoss,MinRTT_ms,AvgRTT_ms,MaxRTT_ms,BatchId\n";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub struct OutcomeWriter {
    directory: PathBuf,
    format: OutputFormat,
    /// Files already checked for a header during this run
    prepared: HashSet<PathBuf>,
}

impl OutcomeWriter {
    pub fn new(directory: impl Into<PathBuf>, format: OutputFormat) -> Self {
        Self { directory: directory.into(), format, prepared: HashSet::new() }
    }

    /// Output file of one host
    pub fn path_for(&self, address: &str) -> PathBuf {
        let extension = match self.format {
            OutputFormat::Csv => "csv",
            OutputFormat::Jsonl => "jsonl",
        };
        self.directory.join(format!("{}.{extension}", file_stem(address)))
    }

    /// Append every event of a batch, one open and flush per host file.
    ///
    /// A failing file is logged and does not stop the rest of the batch.
    pub async fn write_batch(&mut self, events: &[OutcomeEvent]) -> usize {
        let mut records: BTreeMap<PathBuf, String> = BTreeMap::new();
        for event in events {
            match self.render(event) {
                Ok(record) => records.entry(self.path_for(&event.address)).or_default().push_str(&record),
                Err(e) => error!(address = %event.address, "Failed to render outcome: {}", e),
            }
        }

        let mut failed = 0;
        for (path, record) in &records {
            if let Err(e) = self.append(path, record).await {
                error!(path = %path.display(), "Failed to write outcome: {}", e);
                failed += 1;
            }
        }
        records.len() - failed
    }

    fn render(&self, event: &OutcomeEvent) -> io::Result<String> {
        Ok(match self.format {
            OutputFormat::Csv => render_csv_row(event),
            OutputFormat::Jsonl => {
                let mut line = serde_json::to_string(event)?;
                line.push('\n');
                line
            }
        })
    }

    async fn append(&mut self, path: &Path, records: &str) -> io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path).await?;

        let mut buffer = String::with_capacity(CSV_HEADER.len() + records.len());
        if self.format == OutputFormat::Csv && !self.prepared.contains(path) {
            if file.metadata().await?.len() == 0 {
                buffer.push_str(CSV_HEADER);
            }
            self.prepared.insert(path.to_path_buf());
        }
        buffer.push_str(records);

        file.write_all(buffer.as_bytes()).await?;
        file.flush().await
    }

    pub async fn ensure_directory(&self) -> io::Result<()> {
        fs::create_dir_all(&self.directory).await
    }

    /// Consume both channels until every publisher is gone
    pub fn spawn(mut self, bus: &OutcomeBus) -> JoinHandle<()> {
        let mut success = bus.subscribe(Channel::Success);
        let mut failure = bus.subscribe(Channel::Failure);

        tokio::spawn(async move {
            info!(directory = %self.directory.display(), format = %self.format, "Outcome writer started");
            let (mut success_open, mut failure_open) = (true, true);

            while success_open || failure_open {
                let (channel, received) = tokio::select! {
                    received = success.recv(), if success_open => (Channel::Success, received),
                    received = failure.recv(), if failure_open => (Channel::Failure, received),
                };

                match received {
                    Ok(events) => {
                        let written = self.write_batch(&events).await;
                        debug!(?channel, events = events.len(), files = written, "Outcomes written");
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(?channel, skipped, "Outcome writer fell behind, batches dropped");
                    }
                    Err(RecvError::Closed) => match channel {
                        Channel::Success => success_open = false,
                        Channel::Failure => failure_open = false,
                    },
                }
            }
            debug!("Outcome writer stopped");
        })
    }
}

/// File-name-safe form of an address
pub fn file_stem(address: &str) -> String {
    address.replace(['/', '\\'], "_")
}

/// One CSV row, newline terminated
pub fn render_csv_row(event: &OutcomeEvent) -> String {
    let rtt = |value: Option<f64>| value.map(|ms| format!("{ms:.2}")).unwrap_or_else(|| "-".into());

    let mut row = String::new();
    let _ = writeln!(
        row,
        "{},{},{},{},{}%,{},{},{},{}",
        event.timestamp.format(TIMESTAMP_FORMAT),
        event.timestamp.timestamp_millis(),
        event.address,
        event.cause,
        event.packet_loss_percent,
        rtt(event.min_rtt_ms),
        rtt(event.avg_rtt_ms),
        rtt(event.max_rtt_ms),
        event.batch_id,
    );
    row
}

/// Prepare the output directory and start a writer, if output is enabled
pub async fn start(
    enabled: bool,
    directory: &Path,
    format: OutputFormat,
    bus: &OutcomeBus,
) -> io::Result<Option<JoinHandle<()>>> {
    if !enabled {
        info!("Outcome files disabled");
        return Ok(None);
    }
    let writer = OutcomeWriter::new(directory, format);
    writer.ensure_directory().await?;
    Ok(Some(writer.spawn(bus)))
}
