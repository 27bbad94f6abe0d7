//! Pricebus CLI entry point

mod cli;

use crate::cli::{Cli, Commands, TokenCommands};
use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use pricebus::auth::{generate_token_value, Permission, TokenRecord};
use pricebus::channels;
use pricebus::config::ServeArgs;
use pricebus::server::PricebusServer;
use pricebus::storage::{
    ConnectionLog, MemoryTokenStore, PostgresConfig, PostgresStore, TokenStore, TracingConnectionLog,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let db_config = || -> Result<PostgresConfig> {
        if let Some(url) = &cli.database_url {
            PostgresConfig::from_url(url).context("Invalid DATABASE_URL")
        } else {
            PostgresConfig::from_env().context("DATABASE_URL not set")
        }
    };

    match cli.command {
        Commands::Serve(ref args) => {
            let db = cli.database_url.as_ref().map(|_| db_config()).transpose()?;
            serve(args, db).await
        }
        Commands::Token { ref command } => token(db_config()?, command).await,
        Commands::Init => init(db_config()?).await,
        Commands::Status => status(db_config()?).await,
    }
}

async fn serve(args: &ServeArgs, db_config: Option<PostgresConfig>) -> Result<()> {
    let config = args.to_config()?;

    let (store, log): (Arc<dyn TokenStore>, Arc<dyn ConnectionLog>) = match db_config {
        Some(db_config) => {
            let store = Arc::new(PostgresStore::new(db_config).await?);
            (store.clone() as Arc<dyn TokenStore>, store as Arc<dyn ConnectionLog>)
        }
        None => {
            warn!("No database configured; serving anonymous connections only");
            (
                Arc::new(MemoryTokenStore::new()) as Arc<dyn TokenStore>,
                Arc::new(TracingConnectionLog) as Arc<dyn ConnectionLog>,
            )
        }
    };

    let server = PricebusServer::new(config, store, log)?;

    info!("Starting Pricebus server...");
    server.run().await?;

    Ok(())
}

async fn token(db_config: PostgresConfig, command: &TokenCommands) -> Result<()> {
    let store = PostgresStore::new(db_config).await?;

    match command {
        TokenCommands::Create {
            name,
            domain,
            permission,
            channel,
            rate_limit,
            expires_in_days,
            multiple,
        } => {
            for c in channel.iter().filter(|c| *c != channels::WILDCARD) {
                channels::validate_name(c).with_context(|| format!("Invalid channel: {}", c))?;
            }

            let value = generate_token_value();
            let mut builder = TokenRecord::builder(&value)
                .name(name.as_str())
                .domain(domain.as_str())
                .allow_multiple_connections(*multiple);
            if !permission.is_empty() {
                builder = builder.permissions(permission.iter().copied());
            }
            if !channel.is_empty() {
                builder = builder.channels(channel.iter().cloned());
            }
            if let Some(rate_limit) = rate_limit {
                builder = builder.rate_limit(*rate_limit);
            }
            if let Some(days) = expires_in_days {
                builder = builder.expires_at(Utc::now() + chrono::Duration::days(*days));
            }
            let record = builder.build();

            store.create_token(&record).await?;

            println!("{}", value);
            println!();
            print_record(&record);
            println!();
            println!("Store the value now; it cannot be shown again.");
        }
        TokenCommands::Show { id } => {
            let record = store.get_token(id).await?;
            print_record(&record);
        }
        TokenCommands::List => {
            let records = store.list_tokens().await?;
            if records.is_empty() {
                println!("(no tokens)");
            }
            for record in records {
                println!(
                    "{}  {:<20} {:<8} {:<24} {}",
                    record.id,
                    record.name,
                    if record.is_active { "active" } else { "disabled" },
                    record.domain,
                    record.permission_names().join(",")
                );
            }
        }
        TokenCommands::Disable { id } => {
            store.set_active(id, false).await?;
            println!("Disabled token: {}", id);
        }
        TokenCommands::Enable { id } => {
            store.set_active(id, true).await?;
            println!("Enabled token: {}", id);
        }
    }

    Ok(())
}

fn print_record(record: &TokenRecord) {
    println!("Id:          {}", record.id);
    println!("Name:        {}", record.name);
    println!("Domain:      {}", record.domain);
    println!("Permissions: {}", record.permission_names().join(", "));
    println!(
        "Channels:    {}",
        record.allowed_channels.iter().cloned().collect::<Vec<_>>().join(", ")
    );
    println!("Rate limit:  {}", record.rate_limit);
    println!("Active:      {}", record.is_active);
    println!("Multiple:    {}", record.allow_multiple_connections);
    match record.expires_at {
        Some(at) => println!("Expires:     {}", at),
        None => println!("Expires:     never"),
    }
    println!("Usage:       {}", record.usage_count);
    if record.has_permission(Permission::Admin) {
        println!("(admin token: can issue system commands and read /api/stats)");
    }
}

async fn init(db_config: PostgresConfig) -> Result<()> {
    let _store = PostgresStore::new(db_config).await?;
    println!("Database schema initialized successfully");
    Ok(())
}

async fn status(db_config: PostgresConfig) -> Result<()> {
    let store = PostgresStore::new(db_config).await?;
    let (total, active) = store.token_counts().await?;

    println!("Pricebus Status");
    println!("===============");
    println!("Database: Connected");
    println!("Tokens:   {} ({} active)", total, active);

    Ok(())
}
