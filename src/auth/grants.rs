//! Channel access decisions

use crate::auth::tokens::TokenRecord;
use crate::channels::{ChannelTopology, ANONYMOUS_CHANNELS, WILDCARD};
use crate::error::Rejection;
use std::collections::BTreeSet;

/// Decides who may subscribe to and publish on which channel
#[derive(Debug, Clone)]
pub struct ChannelAuthorizer {
    /// Channels open to connections without a token
    anonymous: BTreeSet<String>,
}

impl ChannelAuthorizer {
    pub fn new() -> Self {
        Self {
            anonymous: ANONYMOUS_CHANNELS.iter().map(|c| c.to_string()).collect(),
        }
    }

    /// Check if a token (or an anonymous connection) may access a channel
    pub fn can_access(&self, token: Option<&TokenRecord>, channel: &str) -> bool {
        match token {
            None => self.anonymous.contains(channel),
            Some(record) => {
                record.allowed_channels.contains(WILDCARD)
                    || record.allowed_channels.contains(channel)
            }
        }
    }

    /// Authorize a subscription
    pub fn authorize_subscribe(
        &self,
        token: Option<&TokenRecord>,
        channel: &str,
    ) -> Result<(), Rejection> {
        if self.can_access(token, channel) {
            Ok(())
        } else {
            Err(Rejection::ChannelNotAuthorized {
                channel: channel.to_string(),
            })
        }
    }

    /// Authorize publishing on a data channel
    ///
    /// Requires channel access and the `write` (or `admin`) permission;
    /// anonymous connections never publish.
    pub fn authorize_publish(
        &self,
        token: Option<&TokenRecord>,
        channel: &str,
    ) -> Result<(), Rejection> {
        match token {
            Some(record) if record.can_publish() && self.can_access(token, channel) => Ok(()),
            _ => Err(Rejection::ChannelNotAuthorized {
                channel: channel.to_string(),
            }),
        }
    }

    /// Authorize a `system` channel command
    pub fn authorize_command(
        &self,
        token: Option<&TokenRecord>,
        command: &str,
    ) -> Result<(), Rejection> {
        match token {
            Some(record) if record.can_control_system() => Ok(()),
            _ => Err(Rejection::CommandNotAuthorized {
                command: command.to_string(),
            }),
        }
    }

    /// Declared channels this token may access
    pub fn accessible_channels(
        &self,
        token: Option<&TokenRecord>,
        topology: &ChannelTopology,
    ) -> Vec<String> {
        topology
            .names()
            .filter(|name| self.can_access(token, name))
            .map(str::to_string)
            .collect()
    }
}

impl Default for ChannelAuthorizer {
    fn default() -> Self {
        Self::new()
    }
}
