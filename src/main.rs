//! Tenant DB Pool - Main entry point.
//!
//! Opens the shared main database, builds the tenant pool and its monitor and
//! serves the admin endpoints until SIGINT/SIGTERM.

use clap::Parser;
use std::sync::Arc;
use tenant_db_pool::config::Config;
use tenant_db_pool::db::{ConnectionFactory, DatabaseTarget, SqlxConnectionFactory, TenantPool};
use tenant_db_pool::monitor::ConnectionMonitor;
use tenant_db_pool::schema::SchemaRegistry;
use tenant_db_pool::transport::{AdminTransport, Transport};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse();

    // Initialize logging
    init_tracing(&config);

    let base_url = config.parse_base_url()?;
    let pool_config = config.tenant_pool_config()?;
    let monitor_config = config.monitor_config();

    info!(
        environment = %config.environment,
        db_type = %base_url.db_type,
        base_url = %base_url.masked(),
        "Starting Tenant DB Pool v{}",
        env!("CARGO_PKG_VERSION")
    );

    let registry = Arc::new(SchemaRegistry::new());
    let registered = registry.ensure_registered();
    info!(schemas = registered, "Schema registry ready");

    let factory = SqlxConnectionFactory::new(base_url);

    // The main database is opened once up front; failing here aborts startup
    let main_target = DatabaseTarget::from_option(config.main_database.as_deref())?;
    info!(database = %main_target, "Connecting to main database");
    let main = factory.open(&main_target).await?;

    let pool = TenantPool::new(factory, pool_config, registry);
    let monitor = ConnectionMonitor::new(pool, Some(main), monitor_config);

    let transport = AdminTransport::new(monitor, &config.admin_host, config.admin_port);
    info!(transport = transport.name(), "Serving admin endpoints");
    if let Err(e) = transport.run().await {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("Server shutdown complete");
    Ok(())
}
