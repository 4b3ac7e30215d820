//! Parser for fping summary output (`-c N -q`).
//!
//! One line per host:
//!
//! ```text
//! 8.8.8.8     : xmt/rcv/%loss = 3/3/0%, min/avg/max = 10.1/12.3/15.0
//! 192.168.1.1 : xmt/rcv/%loss = 3/0/100%
//! ```
//!
//! Anything else (resolver errors, ICMP unreachable chatter, blank lines) is
//! skipped. Lines are parsed in parallel; each line is independent.

use rayon::prelude::*;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::{debug, trace};

use super::types::{ProbeCause, ProbeOutcome, RttStats};

fn summary_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^\s*(\S+)\s+:\s+xmt/rcv/%loss\s+=\s+(\d+)/(\d+)/(\d+)%(?:,\s+min/avg/max\s+=\s+([\d.]+)/([\d.]+)/([\d.]+))?\s*$",
        )
        .expect("summary pattern is valid")
    })
}

/// Parse complete probe output into address -> outcome.
///
/// If an address shows up twice the later line wins.
pub fn parse(output: &str) -> HashMap<String, ProbeOutcome> {
    if output.trim().is_empty() {
        return HashMap::new();
    }

    let lines: Vec<&str> = output.lines().filter(|line| !line.trim().is_empty()).collect();

    // indexed parallel collect keeps line order
    let parsed: Vec<ProbeOutcome> = lines
        .par_iter()
        .filter_map(|line| {
            let outcome = parse_line(line);
            if outcome.is_none() {
                debug!(line, "Skipping unparseable probe line");
            }
            outcome
        })
        .collect();

    let mut results = HashMap::with_capacity(parsed.len());
    for outcome in parsed {
        if let Some(previous) = results.insert(outcome.address.clone(), outcome) {
            trace!(address = %previous.address, "Duplicate probe line, keeping the later one");
        }
    }
    results
}

/// Parse one summary line. `None` for anything that is not a well-formed summary.
pub fn parse_line(line: &str) -> Option<ProbeOutcome> {
    let captures = summary_pattern().captures(line)?;

    let address = captures.get(1)?.as_str();
    let sent: u32 = captures.get(2)?.as_str().parse().ok()?;
    let received: u32 = captures.get(3)?.as_str().parse().ok()?;
    let loss: u8 = captures.get(4)?.as_str().parse().ok()?;

    if received == 0 {
        return Some(ProbeOutcome::down(address, sent));
    }

    // replies without a min/avg/max clause are malformed
    let min_ms: f64 = captures.get(5)?.as_str().parse().ok()?;
    let avg_ms: f64 = captures.get(6)?.as_str().parse().ok()?;
    let max_ms: f64 = captures.get(7)?.as_str().parse().ok()?;

    ProbeOutcome::up(address, sent, received, loss, RttStats { min_ms, avg_ms, max_ms }).ok()
}

/// Render an outcome back into the summary line format.
///
/// Only conclusive outcomes (OK, DOWN) have a textual form.
pub fn render_line(outcome: &ProbeOutcome) -> Option<String> {
    match (outcome.cause, outcome.rtt) {
        (ProbeCause::Ok, Some(rtt)) => Some(format!(
            "{} : xmt/rcv/%loss = {}/{}/{}%, min/avg/max = {}/{}/{}",
            outcome.address,
            outcome.packets_sent,
            outcome.packets_received,
            outcome.packet_loss_percent,
            rtt.min_ms,
            rtt.avg_ms,
            rtt.max_ms
        )),
        (ProbeCause::Down, _) => Some(format!(
            "{} : xmt/rcv/%loss = {}/0/100%",
            outcome.address, outcome.packets_sent
        )),
        _ => None,
    }
}
