//! Channel naming and the fixed broadcast topology
//!
//! Channels are dot-separated segments: `price`, `binance`, `feeds.kraken`.
//! Each segment must match: [a-zA-Z0-9_-]+
//!
//! The topology is declared once at startup: the reserved `system`,
//! `price` and `alerts` channels plus one channel per upstream data source.
//! Clients cannot create channels.

use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// Operator commands (`refresh`, `reload`, `announcement`)
pub const SYSTEM: &str = "system";
/// Generic price updates from every source
pub const PRICE: &str = "price";
/// Anomaly alerts
pub const ALERTS: &str = "alerts";

/// Channels always present in the topology
pub const RESERVED: [&str; 3] = [SYSTEM, PRICE, ALERTS];

/// Channels available to connections that present no token
pub const ANONYMOUS_CHANNELS: [&str; 2] = [PRICE, SYSTEM];

/// Grants access to every channel in an allow-list
pub const WILDCARD: &str = "*";

fn is_valid_segment_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

fn is_valid_segment(s: &str) -> bool {
    !s.is_empty() && s.chars().all(is_valid_segment_char)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("channel name cannot be empty")]
    Empty,

    #[error("invalid segment '{0}': must match [a-zA-Z0-9_-]+")]
    InvalidSegment(String),

    #[error("empty segment in channel name")]
    EmptySegment,

    #[error("source channel '{0}' collides with a reserved channel")]
    Reserved(String),
}

/// Validate a channel name
pub fn validate_name(name: &str) -> Result<(), ChannelError> {
    if name.is_empty() {
        return Err(ChannelError::Empty);
    }

    for part in name.split('.') {
        if part.is_empty() {
            return Err(ChannelError::EmptySegment);
        }
        if !is_valid_segment(part) {
            return Err(ChannelError::InvalidSegment(part.to_string()));
        }
    }

    Ok(())
}

/// The set of channels this server knows about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelTopology {
    sources: BTreeSet<String>,
}

impl ChannelTopology {
    /// Build a topology with one channel per upstream source
    pub fn new<I, S>(sources: I) -> Result<Self, ChannelError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = BTreeSet::new();
        for source in sources {
            let source = source.into();
            validate_name(&source)?;
            if RESERVED.contains(&source.as_str()) {
                return Err(ChannelError::Reserved(source));
            }
            set.insert(source);
        }
        Ok(Self { sources: set })
    }

    /// Topology with only the reserved channels
    pub fn reserved_only() -> Self {
        Self {
            sources: BTreeSet::new(),
        }
    }

    /// Check if a channel is declared
    pub fn contains(&self, channel: &str) -> bool {
        RESERVED.contains(&channel) || self.sources.contains(channel)
    }

    /// Check if a channel is a per-source channel
    pub fn is_source(&self, channel: &str) -> bool {
        self.sources.contains(channel)
    }

    /// The derived channel for an event's source tag, if declared
    pub fn source_channel<'a>(&self, source: &'a str) -> Option<&'a str> {
        if self.sources.contains(source) {
            Some(source)
        } else {
            None
        }
    }

    /// All channel names, reserved first
    pub fn names(&self) -> impl Iterator<Item = &str> {
        RESERVED
            .iter()
            .copied()
            .chain(self.sources.iter().map(String::as_str))
    }

    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.sources.iter().map(String::as_str)
    }
}

impl Default for ChannelTopology {
    fn default() -> Self {
        Self::reserved_only()
    }
}

impl fmt::Display for ChannelTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.names().collect();
        write!(f, "{}", names.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("price").is_ok());
        assert!(validate_name("feeds.kraken").is_ok());
        assert!(validate_name("source_5-eu").is_ok());

        assert_eq!(validate_name(""), Err(ChannelError::Empty));
        assert_eq!(validate_name("feeds..kraken"), Err(ChannelError::EmptySegment));
        assert!(matches!(
            validate_name("price updates"),
            Err(ChannelError::InvalidSegment(_))
        ));
        assert!(validate_name("*").is_err());
    }

    #[test]
    fn test_topology_contains_reserved_and_sources() {
        let topology = ChannelTopology::new(["binance", "kraken"]).unwrap();

        assert!(topology.contains(SYSTEM));
        assert!(topology.contains(PRICE));
        assert!(topology.contains(ALERTS));
        assert!(topology.contains("binance"));
        assert!(!topology.contains("coinbase"));

        assert!(topology.is_source("kraken"));
        assert!(!topology.is_source(PRICE));
        assert_eq!(topology.source_channel("binance"), Some("binance"));
        assert_eq!(topology.source_channel("coinbase"), None);
        assert_eq!(topology.sources().collect::<Vec<_>>(), vec!["binance", "kraken"]);
    }

    #[test]
    fn test_topology_rejects_reserved_source() {
        assert_eq!(
            ChannelTopology::new(["price"]),
            Err(ChannelError::Reserved("price".to_string()))
        );
        assert!(ChannelTopology::new(["bad name"]).is_err());
    }

    #[test]
    fn test_topology_names_order() {
        let topology = ChannelTopology::new(["zeta", "alpha"]).unwrap();
        let names: Vec<&str> = topology.names().collect();
        assert_eq!(names, vec!["system", "price", "alerts", "alpha", "zeta"]);
    }
}
