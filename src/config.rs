//! Server configuration

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for a Pricebus server
#[derive(Debug, Clone)]
pub struct PricebusConfig {
    /// Address for the HTTP/WebSocket listener
    pub bind_addr: SocketAddr,

    /// Upstream data sources, one channel each
    pub source_channels: Vec<String>,

    /// Whether connections without a token are admitted
    pub allow_anonymous: bool,

    /// Upper bound on a token store lookup
    pub lookup_timeout: Duration,

    /// Upper bound on a usage counter increment
    pub usage_timeout: Duration,

    /// Outbound events buffered per connection before delivery drops
    pub outbound_buffer: usize,

    /// Close connections with no activity for this long
    pub idle_timeout: Option<Duration>,

    /// How often idle rate limit windows are collected
    pub rate_limit_sweep_interval: Duration,
}

impl Default for PricebusConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            source_channels: Vec::new(),
            allow_anonymous: true,
            lookup_timeout: Duration::from_secs(5),
            usage_timeout: Duration::from_secs(5),
            outbound_buffer: 256,
            idle_timeout: None,
            rate_limit_sweep_interval: Duration::from_secs(60),
        }
    }
}

impl PricebusConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Declare the upstream source channels
    pub fn sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.source_channels = sources.into_iter().map(Into::into).collect();
        self
    }

    pub fn allow_anonymous(mut self, allow: bool) -> Self {
        self.allow_anonymous = allow;
        self
    }

    /// Set the store round-trip timeouts
    pub fn store_timeouts(mut self, lookup: Duration, usage: Duration) -> Self {
        self.lookup_timeout = lookup;
        self.usage_timeout = usage;
        self
    }

    pub fn outbound_buffer(mut self, size: usize) -> Self {
        self.outbound_buffer = size.max(1);
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn rate_limit_sweep_interval(mut self, interval: Duration) -> Self {
        self.rate_limit_sweep_interval = interval;
        self
    }
}

/// Server flags shared by `pricebus serve` and `pricebusd`
#[derive(Debug, Clone, clap::Args)]
pub struct ServeArgs {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:8080", env = "PRICEBUS_BIND")]
    pub bind: String,

    /// Upstream data sources, one channel each
    #[arg(long, env = "PRICEBUS_SOURCES", value_delimiter = ',')]
    pub sources: Vec<String>,

    /// Admit connections that present no token
    #[arg(long, env = "PRICEBUS_ALLOW_ANONYMOUS", default_value_t = true, action = clap::ArgAction::Set)]
    pub allow_anonymous: bool,

    /// Close connections idle for this many seconds
    #[arg(long, env = "PRICEBUS_IDLE_TIMEOUT")]
    pub idle_timeout: Option<u64>,

    /// Token store round-trip timeout in seconds
    #[arg(long, env = "PRICEBUS_STORE_TIMEOUT", default_value_t = 5)]
    pub store_timeout: u64,

    /// Outbound events buffered per connection
    #[arg(long, env = "PRICEBUS_OUTBOUND_BUFFER", default_value_t = 256)]
    pub outbound_buffer: usize,
}

impl ServeArgs {
    /// Build the server configuration these flags describe
    pub fn to_config(&self) -> Result<PricebusConfig> {
        let bind_addr = self.bind.parse().context("Invalid bind address")?;
        let store_timeout = Duration::from_secs(self.store_timeout);

        let mut config = PricebusConfig::new(bind_addr)
            .sources(self.sources.iter().map(|s| s.trim()).filter(|s| !s.is_empty()))
            .allow_anonymous(self.allow_anonymous)
            .store_timeouts(store_timeout, store_timeout)
            .outbound_buffer(self.outbound_buffer);
        if let Some(secs) = self.idle_timeout {
            config = config.idle_timeout(Duration::from_secs(secs));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Flags {
        #[command(flatten)]
        serve: ServeArgs,
    }

    #[test]
    fn test_defaults() {
        let config = PricebusConfig::default();
        assert_eq!(config.bind_addr.port(), 8080);
        assert!(config.allow_anonymous);
        assert!(config.source_channels.is_empty());
        assert!(config.idle_timeout.is_none());
        assert_eq!(config.outbound_buffer, 256);
    }

    #[test]
    fn test_builder() {
        let config = PricebusConfig::new("127.0.0.1:9000".parse().unwrap())
            .sources(["binance", "kraken"])
            .allow_anonymous(false)
            .outbound_buffer(0)
            .idle_timeout(Duration::from_secs(90));

        assert_eq!(config.source_channels, vec!["binance", "kraken"]);
        assert!(!config.allow_anonymous);
        assert_eq!(config.outbound_buffer, 1);
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(90)));
    }

    #[test]
    fn test_serve_args_map_every_flag() {
        let flags = Flags::try_parse_from([
            "pricebusd",
            "--bind",
            "127.0.0.1:9100",
            "--sources",
            "binance, kraken,",
            "--allow-anonymous",
            "false",
            "--idle-timeout",
            "120",
            "--store-timeout",
            "2",
            "--outbound-buffer",
            "64",
        ])
        .unwrap();
        let config = flags.serve.to_config().unwrap();

        assert_eq!(config.bind_addr.port(), 9100);
        assert_eq!(config.source_channels, vec!["binance", "kraken"]);
        assert!(!config.allow_anonymous);
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(120)));
        assert_eq!(config.lookup_timeout, Duration::from_secs(2));
        assert_eq!(config.usage_timeout, Duration::from_secs(2));
        assert_eq!(config.outbound_buffer, 64);
    }

    #[test]
    fn test_serve_args_reject_bad_bind() {
        let flags = Flags::try_parse_from(["pricebusd", "--bind", "nowhere"]).unwrap();
        assert!(flags.serve.to_config().is_err());
    }
}
