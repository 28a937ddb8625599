use std::time::Duration;

use thiserror::Error;

use crate::shared::{Version, DEFAULT_SUPPORTED_VERSIONS};

/// Parameters governing connection admission and dispatch
///
/// Default values bound the dispatcher's memory use under floods of spoofed
/// connection attempts while answering well-behaved peers promptly. The two
/// buffered-packet caps and the time-wait capacity are the knobs to tune first
/// when deploying behind links with unusual loss or reordering behavior.
pub struct DispatchConfig {
    pub(crate) supported_versions: Vec<Version>,
    pub(crate) time_wait_duration: Duration,
    pub(crate) max_time_wait_entries: usize,
    pub(crate) max_buffered_connections: usize,
    pub(crate) max_buffered_packets_per_connection: usize,
    pub(crate) buffered_packet_grace_period: Duration,
    pub(crate) max_sessions: usize,
    pub(crate) stateless_rejects_enabled: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            supported_versions: DEFAULT_SUPPORTED_VERSIONS.to_vec(),
            time_wait_duration: Duration::from_secs(5),
            max_time_wait_entries: 600_000,
            max_buffered_connections: 100,
            max_buffered_packets_per_connection: 8,
            buffered_packet_grace_period: Duration::from_secs(5),
            max_sessions: 65_536,
            stateless_rejects_enabled: true,
        }
    }
}

impl DispatchConfig {
    /// Protocol versions to accept, in preference order
    ///
    /// The first entry is assumed for first-contact datagrams that omit an
    /// explicit version.
    pub fn supported_versions(&mut self, versions: Vec<Version>) -> &mut Self {
        self.supported_versions = versions;
        self
    }

    /// How long a terminated connection ID keeps answering stray traffic
    pub fn time_wait_duration(&mut self, value: Duration) -> &mut Self {
        self.time_wait_duration = value;
        self
    }

    /// Ceiling on tracked recently-terminated connection IDs
    ///
    /// When full, the oldest entries are retired early to make room.
    pub fn max_time_wait_entries(&mut self, value: usize) -> &mut Self {
        self.max_time_wait_entries = value;
        self
    }

    /// Maximum number of not-yet-admitted connection IDs with buffered packets
    pub fn max_buffered_connections(&mut self, value: usize) -> &mut Self {
        self.max_buffered_connections = value;
        self
    }

    /// Maximum datagrams buffered for a single not-yet-admitted connection ID
    pub fn max_buffered_packets_per_connection(&mut self, value: usize) -> &mut Self {
        self.max_buffered_packets_per_connection = value;
        self
    }

    /// How long buffered packets may wait for their setup packet before the
    /// connection ID is written off
    pub fn buffered_packet_grace_period(&mut self, value: Duration) -> &mut Self {
        self.buffered_packet_grace_period = value;
        self
    }

    /// Ceiling on concurrently live sessions
    ///
    /// Connection attempts beyond this are statelessly refused.
    pub fn max_sessions(&mut self, value: usize) -> &mut Self {
        self.max_sessions = value;
        self
    }

    /// Whether to attempt stateless rejection before admitting a connection
    pub fn stateless_rejects_enabled(&mut self, value: bool) -> &mut Self {
        self.stateless_rejects_enabled = value;
        self
    }

    pub(crate) fn preferred_version(&self) -> Version {
        self.supported_versions[0]
    }

    pub(crate) fn is_supported(&self, version: Version) -> bool {
        self.supported_versions.contains(&version)
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.supported_versions.is_empty() {
            return Err(ConfigError::NoSupportedVersions);
        }
        if self.max_time_wait_entries == 0
            || self.max_buffered_connections == 0
            || self.max_buffered_packets_per_connection == 0
            || self.max_sessions == 0
        {
            return Err(ConfigError::IllegalValue);
        }
        Ok(())
    }
}

/// Errors in the parameters used to construct a dispatcher
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum ConfigError {
    /// The supported version list was empty
    #[error("no supported versions configured")]
    NoSupportedVersions,
    /// A capacity limit was zero
    #[error("capacity limits must be nonzero")]
    IllegalValue,
}
