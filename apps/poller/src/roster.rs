//! Roster file loading (file-driven mode).
//!
//! One host per line, `<address>,<cadenceSeconds>`. Blank lines and lines
//! starting with `#` are ignored. Bad lines are skipped with a warning and the
//! rest of the file still loads.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use tracing::{info, warn};

use crate::error::{RosterError, RosterIssue, RosterLineError};
use crate::monitoring::types::Host;

/// Longest accepted cadence, one year
pub const MAX_CADENCE_SECONDS: u64 = 365 * 24 * 60 * 60;

/// Hosts under management: address -> cadence in seconds
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    hosts: BTreeMap<String, u64>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a host, returning the previous cadence
    pub fn insert(&mut self, host: Host) -> Option<u64> {
        self.hosts.insert(host.address, host.cadence_seconds)
    }

    pub fn cadence_of(&self, address: &str) -> Option<u64> {
        self.hosts.get(address).copied()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.hosts.iter().map(|(address, cadence)| (address.as_str(), *cadence))
    }

    pub fn distinct_cadences(&self) -> BTreeSet<u64> {
        self.hosts.values().copied().collect()
    }
}

impl FromIterator<Host> for Roster {
    /// Later hosts replace earlier ones with the same address
    fn from_iter<T: IntoIterator<Item = Host>>(iter: T) -> Self {
        let mut roster = Roster::new();
        for host in iter {
            roster.insert(host);
        }
        roster
    }
}

/// Result of reading a roster: the hosts that loaded and the lines that did not
#[derive(Debug, Clone, Default)]
pub struct RosterLoad {
    pub roster: Roster,
    pub rejected: Vec<RosterLineError>,
}

/// Parse a single roster line. `Ok(None)` for blank and comment lines.
pub fn parse_line(line: &str) -> Result<Option<Host>, RosterIssue> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    match fields.len() {
        0 | 1 => return Err(RosterIssue::MissingField),
        2 => {}
        n => return Err(RosterIssue::ExtraFields(n)),
    }

    let address = fields[0];
    if address.is_empty() {
        return Err(RosterIssue::EmptyAddress);
    }
    // the address becomes a probe argument
    if address.starts_with('-') || address.chars().any(char::is_whitespace) {
        return Err(RosterIssue::UnsafeAddress(address.to_string()));
    }

    let cadence: i64 =
        fields[1].parse().map_err(|_| RosterIssue::InvalidCadence(fields[1].to_string()))?;
    if cadence <= 0 {
        return Err(RosterIssue::NonPositiveCadence(cadence));
    }
    if cadence as u64 > MAX_CADENCE_SECONDS {
        return Err(RosterIssue::CadenceTooLarge { cadence, max: MAX_CADENCE_SECONDS });
    }

    Ok(Some(Host::new(address, cadence as u64)))
}

/// Parse roster text. Duplicate addresses keep their first definition.
pub fn parse_roster(text: &str) -> RosterLoad {
    let mut load = RosterLoad::default();
    let mut first_seen: HashMap<String, usize> = HashMap::new();

    for (index, line) in text.lines().enumerate() {
        let line_number = index + 1;
        let reject = |issue| RosterLineError { line_number, line: line.to_string(), issue };

        match parse_line(line) {
            Ok(None) => {}
            Ok(Some(host)) => {
                if let Some(&first_line) = first_seen.get(&host.address) {
                    load.rejected.push(reject(RosterIssue::DuplicateAddress {
                        address: host.address,
                        first_line,
                    }));
                    continue;
                }
                first_seen.insert(host.address.clone(), line_number);
                load.roster.insert(host);
            }
            Err(issue) => load.rejected.push(reject(issue)),
        }
    }

    load
}

/// Read and parse a roster file, logging every skipped line
pub async fn load_roster(path: &Path) -> Result<RosterLoad, RosterError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| RosterError::Read { path: path.to_path_buf(), source })?;

    let load = parse_roster(&text);
    for rejected in &load.rejected {
        warn!(path = %path.display(), "Skipping roster entry: {}", rejected);
    }
    info!(
        path = %path.display(),
        hosts = load.roster.len(),
        cadences = load.roster.distinct_cadences().len(),
        rejected = load.rejected.len(),
        "Roster loaded"
    );

    Ok(load)
}
