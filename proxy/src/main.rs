use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::info;
use pgpooler_core::IdGenerator;
use pgpooler_proxy::{AuthQuery, DiscardAll, PoolRouter, PoolerConfig, StartupConnector};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Run the auth query of a pgpooler route")]
struct Args {
    /// Config file path
    #[clap(short, long, env = "PGPOOLER_CONFIG")]
    config: String,

    /// Client database of the route
    #[clap(short, long)]
    database: String,

    /// Client user of the route
    #[clap(short, long)]
    user: String,

    /// Log filter, overriding the configured level
    #[clap(long, env = "PGPOOLER_LOG_LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Parse command-line arguments
    let args = Args::parse();

    // Load configuration
    let config = PoolerConfig::from_file(&args.config)
        .with_context(|| format!("failed to load {}", args.config))?;

    // Initialize logging
    let level = args.log_level.as_deref().unwrap_or(&config.log_level);
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, level),
    );

    let route = config
        .find_route(&args.database, &args.user)
        .ok_or_else(|| anyhow!("no route for {}.{}", args.database, args.user))?;
    let spec = route
        .auth_query_spec()
        .ok_or_else(|| anyhow!("route {}.{} has no auth query", args.database, args.user))?;

    let ids = Arc::new(IdGenerator::new());
    let router = Arc::new(PoolRouter::new(&config.routes, ids.clone())?);
    let auth_query = AuthQuery::new(
        router,
        Arc::new(StartupConnector::new(config.connect_timeout())),
        Arc::new(DiscardAll::default()),
        ids,
    );

    info!(
        "Running auth query for {}.{} on {}@{}",
        args.database, args.user, spec.user, spec.database
    );

    let result = auth_query.fetch_password(&spec).await?;
    if result.is_captured() {
        info!("Password found ({} bytes)", result.len());
    } else {
        info!("No password found for {}.{}", args.database, args.user);
    }

    Ok(())
}
