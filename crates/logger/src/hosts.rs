use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;

/// Whitelist of addresses that get detailed per-host trace logging.
///
/// An empty filter allows every host, which is what you want while developing
/// against a handful of addresses. With thousands of hosts in production the
/// whitelist keeps TRACE output readable.
#[derive(Debug, Clone, Default)]
pub struct HostFilter {
    hosts: HashSet<String>,
}

impl HostFilter {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let hosts = hosts
            .into_iter()
            .map(|host| host.as_ref().trim().to_string())
            .filter(|host| !host.is_empty())
            .collect();
        Self { hosts }
    }

    /// Load a whitelist file: one address per line, `#` starts a comment line
    pub fn from_file(path: &Path) -> io::Result<Self> {
        let raw = fs::read_to_string(path)?;
        Ok(Self::new(raw.lines().filter(|line| !line.trim_start().starts_with('#'))))
    }

    /// Merge another whitelist into this one
    pub fn extend(&mut self, other: HostFilter) {
        self.hosts.extend(other.hosts);
    }

    pub fn allows(&self, address: &str) -> bool {
        self.hosts.is_empty() || self.hosts.contains(address)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}
