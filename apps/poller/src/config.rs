use std::{env, fmt, fs, path};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const MAX_WORKERS: usize = 6;
pub const MIN_BATCH_TIMEOUT_MS: u64 = 100;
pub const MAX_BATCH_TIMEOUT_MS: u64 = 600_000;
pub const MAX_PROBE_COUNT: u32 = 100;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub roster: RosterConfig,
    pub scheduler: SchedulerConfig,
    pub probe: ProbeConfig,
    pub pool: PoolConfig,
    pub output: OutputConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RosterConfig {
    pub path: path::PathBuf,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerMode {
    /// One timer per cadence cluster, driven by the roster file
    #[default]
    Clustered,
    /// Periodic sweep over a roster store
    Store,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub mode: SchedulerMode,
    pub sweep_interval_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub program: path::PathBuf,
    pub count: u32,
    pub per_host_timeout_ms: u64,
    pub batch_timeout_ms: u64,
    /// How long to wait for output to drain after the probe exits
    pub output_wait_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub workers: usize,
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Csv,
    Jsonl,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Csv => write!(f, "csv"),
            OutputFormat::Jsonl => write!(f, "jsonl"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub enabled: bool,
    pub directory: path::PathBuf,
    pub format: OutputFormat,
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub trace_hosts: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_hosts_file: Option<path::PathBuf>,
}

impl Default for RosterConfig {
    fn default() -> Self {
        Self { path: "urls.txt".into() }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { mode: SchedulerMode::Clustered, sweep_interval_seconds: 5 }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            program: "fping".into(),
            count: 3,
            per_host_timeout_ms: 500,
            batch_timeout_ms: 4000,
            output_wait_ms: 1000,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { workers: MAX_WORKERS, queue_capacity: 64 }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: "stats".into(),
            format: OutputFormat::Csv,
            channel_capacity: 1024,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "compact".into(),
            trace_hosts: Vec::new(),
            trace_hosts_file: None,
        }
    }
}

/// Used to ensure we are actually reading a toml file
fn normalize_toml_path(path: &path::Path) -> path::PathBuf {
    let mut path = path.to_path_buf();
    if path.extension().map(|ext| ext != "toml").unwrap_or(true) {
        path.set_extension("toml");
    }
    path
}

/// Get default config path ($XDG_CONFIG_HOME/fping-poller/config.toml or
/// $HOME/.config/...)
fn default_config_path() -> Result<path::PathBuf, ConfigError> {
    let path = if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
        path::PathBuf::from(config_home)
    } else if let Some(home_dir) = env::home_dir() {
        home_dir.join(".config")
    } else {
        return Err(ConfigError::PathUnavailable);
    };

    Ok(path.join("fping-poller/config.toml"))
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let write_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str, value: &dyn fmt::Display| {
                writeln!(f, "  {:indent$}{}: {}", "", label, value, indent = level * 2)
            }
        };
        let write_title_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str| {
                writeln!(f, "{:indent$}{}", "", label, indent = level * 2)
            }
        };

        let write_title_1 = write_title_indented(1);
        let write_1 = write_indented(1);

        writeln!(f, "Current Internal Configuration State:")?;
        write_title_1(f, "Roster")?;
        write_1(f, "Path", &self.roster.path.display())?;

        write_title_1(f, "Scheduler")?;
        let mode = match self.scheduler.mode {
            SchedulerMode::Clustered => "clustered",
            SchedulerMode::Store => "store",
        };
        write_1(f, "Mode", &mode)?;
        write_1(f, "Sweep Interval (s)", &self.scheduler.sweep_interval_seconds)?;

        write_title_1(f, "Probe")?;
        write_1(f, "Program", &self.probe.program.display())?;
        write_1(f, "Count", &self.probe.count)?;
        write_1(f, "Per-host Timeout (ms)", &self.probe.per_host_timeout_ms)?;
        write_1(f, "Batch Timeout (ms)", &self.probe.batch_timeout_ms)?;
        write_1(f, "Output Wait (ms)", &self.probe.output_wait_ms)?;

        write_title_1(f, "Pool")?;
        write_1(f, "Workers", &self.pool.workers)?;
        write_1(f, "Queue Capacity", &self.pool.queue_capacity)?;

        write_title_1(f, "Output")?;
        write_1(f, "Enabled", &self.output.enabled)?;
        write_1(f, "Directory", &self.output.directory.display())?;
        write_1(f, "Format", &self.output.format)?;
        write_1(f, "Channel Capacity", &self.output.channel_capacity)?;

        write_title_1(f, "Logging")?;
        write_1(f, "Level", &self.logging.level)?;
        write_1(f, "Format", &self.logging.format)?;
        write_1(f, "Trace Hosts", &self.logging.trace_hosts.join(", "))?;
        if let Some(file) = &self.logging.trace_hosts_file {
            write_1(f, "Trace Hosts File", &file.display())?;
        }

        Ok(())
    }
}

impl Config {
    /// Generate Config structure from file
    ///
    /// Creates a default config in ~/.config/fping-poller/config.toml
    ///  or the specified path, with the extension .toml if one does not exist
    pub fn from_config(optional_path: Option<impl AsRef<path::Path>>) -> Result<Self, ConfigError> {
        let config_path: path::PathBuf = if let Some(path) = optional_path {
            normalize_toml_path(path.as_ref())
        } else {
            default_config_path()?
        };

        let config = if config_path.exists() {
            let raw_string = fs::read_to_string(&config_path)
                .map_err(|source| ConfigError::Read { path: config_path.clone(), source })?;
            toml::from_str(raw_string.as_str())
                .map_err(|source| ConfigError::Parse { path: config_path.clone(), source })?
        } else {
            let config = Self::default();
            config.write_config(&config_path)?;
            config
        };

        config.validate()?;
        Ok(config)
    }

    /// Serialize and write a config to a file
    pub fn write_config(&self, path: &path::Path) -> Result<(), ConfigError> {
        let config_str: String = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|source| ConfigError::Write { path: parent.to_path_buf(), source })?;
        }

        fs::write(path, config_str)
            .map_err(|source| ConfigError::Write { path: path.to_path_buf(), source })
    }

    /// Reject values the poller cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| Err(ConfigError::Invalid(message));

        if !(1..=MAX_WORKERS).contains(&self.pool.workers) {
            return invalid(format!("pool.workers must be between 1 and {MAX_WORKERS}"));
        }
        if self.pool.queue_capacity == 0 {
            return invalid("pool.queue_capacity must be positive".into());
        }
        if !(MIN_BATCH_TIMEOUT_MS..=MAX_BATCH_TIMEOUT_MS).contains(&self.probe.batch_timeout_ms) {
            return invalid(format!(
                "probe.batch_timeout_ms must be between {MIN_BATCH_TIMEOUT_MS} and {MAX_BATCH_TIMEOUT_MS}"
            ));
        }
        if !(1..=MAX_PROBE_COUNT).contains(&self.probe.count) {
            return invalid(format!("probe.count must be between 1 and {MAX_PROBE_COUNT}"));
        }
        if self.probe.per_host_timeout_ms == 0 {
            return invalid("probe.per_host_timeout_ms must be positive".into());
        }
        if self.probe.program.as_os_str().is_empty() {
            return invalid("probe.program is empty".into());
        }
        if self.scheduler.sweep_interval_seconds == 0 {
            return invalid("scheduler.sweep_interval_seconds must be positive".into());
        }
        if self.output.channel_capacity == 0 {
            return invalid("output.channel_capacity must be positive".into());
        }
        Ok(())
    }
}
