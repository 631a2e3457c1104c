//! Main entry point for the resource broker service.
//!
//! Loads the configuration, builds the broker engine from the registered
//! implementations, and runs it until interrupted. When the API is enabled
//! the federation endpoint is served alongside so peers can reach this broker.

use broker_config::Config;
use clap::Parser;
use std::path::PathBuf;

mod factory_registry;
mod server;

/// Command-line arguments for the broker service.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
	/// Path to configuration file
	#[arg(short, long, default_value = "config/broker.toml")]
	config: PathBuf,

	/// Log level (trace, debug, info, warn, error)
	#[arg(short, long, default_value = "info")]
	log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	let args = Args::parse();

	use tracing_subscriber::{fmt, EnvFilter};

	let default_directive = args.log_level.to_string();
	let env_filter =
		EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

	fmt()
		.with_env_filter(env_filter)
		.with_thread_ids(true)
		.with_target(true)
		.init();

	tracing::info!("Started broker");

	let config_path = args
		.config
		.to_str()
		.ok_or_else(|| format!("Invalid config path: {}", args.config.display()))?;
	let config = Config::from_file(config_path).await?;
	tracing::info!("Loaded configuration [{}]", config.broker.provider_id);

	let broker = factory_registry::build_broker_from_config(config.clone()).await?;

	match config.api.clone().filter(|api| api.enabled) {
		Some(api_config) => {
			let api_task = server::start_server(api_config, broker.federation_handler());

			tokio::select! {
				result = broker.run() => {
					tracing::info!("Broker finished");
					result?;
				}
				result = api_task => {
					tracing::info!("API server finished");
					broker.shutdown().await;
					result?;
				}
			}
		},
		None => {
			tracing::info!("Starting broker without federation endpoint");
			broker.run().await?;
		},
	}

	tracing::info!("Stopped broker");
	Ok(())
}
