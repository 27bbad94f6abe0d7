//! CLI command definitions

use clap::{Parser, Subcommand};
use pricebus::auth::{Permission, RateLimitPolicy};
use pricebus::config::ServeArgs;

#[derive(Parser)]
#[command(name = "pricebus")]
#[command(about = "Token-authenticated real-time price broadcasting", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Database URL
    #[arg(long, env = "DATABASE_URL", global = true)]
    pub database_url: Option<String>,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the Pricebus server
    Serve(ServeArgs),

    /// Manage access tokens
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },

    /// Initialize the database schema
    Init,

    /// Show token statistics
    Status,
}

#[derive(Subcommand)]
pub enum TokenCommands {
    /// Create a new token and print its value once
    ///
    /// Examples:
    ///   pricebus token create --name desk -p read -c price -c binance
    ///   pricebus token create --name ops -p admin -c '*' --rate-limit 1000/60
    Create {
        /// Display name
        #[arg(long)]
        name: String,

        /// Domain rule: `*`, a host name, or a substring
        #[arg(long, default_value = "*")]
        domain: String,

        /// Permission: read, write, admin, system_control (can be repeated)
        #[arg(short, long = "permission", value_parser = parse_permission)]
        permission: Vec<Permission>,

        /// Channel the token may access, or `*` (can be repeated)
        #[arg(short, long = "channel")]
        channel: Vec<String>,

        /// Requests per window, e.g. `100/60`
        #[arg(long, value_parser = parse_rate_limit)]
        rate_limit: Option<RateLimitPolicy>,

        /// Expire after this many days
        #[arg(long)]
        expires_in_days: Option<i64>,

        /// Allow concurrent connections with this token
        #[arg(long)]
        multiple: bool,
    },

    /// Show token details
    Show {
        /// Token id
        id: String,
    },

    /// List all tokens
    List,

    /// Disable a token
    Disable {
        /// Token id
        id: String,
    },

    /// Re-enable a token
    Enable {
        /// Token id
        id: String,
    },
}

fn parse_permission(s: &str) -> Result<Permission, String> {
    s.parse::<Permission>().map_err(|e| e.to_string())
}

fn parse_rate_limit(s: &str) -> Result<RateLimitPolicy, String> {
    RateLimitPolicy::parse(s).map_err(|e| e.to_string())
}
