use std::path::PathBuf;
use tokio::process::Command;

/// Builds the external command that probes a whole batch in one process
pub trait ProbeTool: Send + Sync {
    /// Command covering every address. Stdio is configured by the caller.
    fn command(&self, addresses: &[String]) -> Command;

    /// Short name for logs
    fn name(&self) -> &str;
}

/// fping in summary mode: `fping -c <count> -t <timeout_ms> -q <hosts...>`
#[derive(Debug, Clone)]
pub struct Fping {
    program: PathBuf,
    count: u32,
    per_host_timeout_ms: u64,
}

impl Fping {
    pub fn new(program: impl Into<PathBuf>, count: u32, per_host_timeout_ms: u64) -> Self {
        Self { program: program.into(), count, per_host_timeout_ms }
    }

    pub fn args(&self, addresses: &[String]) -> Vec<String> {
        let mut args = Vec::with_capacity(addresses.len() + 5);
        args.push("-c".to_string());
        args.push(self.count.to_string());
        args.push("-t".to_string());
        args.push(self.per_host_timeout_ms.to_string());
        args.push("-q".to_string());
        args.extend(addresses.iter().cloned());
        args
    }
}

impl ProbeTool for Fping {
    fn command(&self, addresses: &[String]) -> Command {
        let mut command = Command::new(&self.program);
        command.args(self.args(addresses));
        command
    }

    fn name(&self) -> &str {
        "fping"
    }
}
