use anyhow::{Context, Result};
use clap::Parser;
use ucm_cli::{
	cli::{Cli, Commands, ServeArgs},
	daemon::{self, Daemon},
	logging,
};
use ucm_runtime::{Broker, BrokerConfig, LoopbackManager};

#[tokio::main]
async fn main() {
	let cli = Cli::parse();
	logging::init_logging(cli.verbose);

	let result = match cli.command {
		Commands::Serve(args) => serve(args).await,
	};
	if let Err(err) = result {
		eprintln!("ucmd: {err:#}");
		std::process::exit(1);
	}
}

async fn serve(args: ServeArgs) -> Result<()> {
	let mut config = match &args.config {
		Some(path) => BrokerConfig::load(path)
			.with_context(|| format!("Failed to load config: {}", path.display()))?,
		None => BrokerConfig::default(),
	}
	.with_env()
	.context("Invalid broker configuration in environment")?;
	if let Some(max_backlog) = args.max_backlog {
		config.max_backlog = max_backlog;
		config.validate().context("Invalid --max-backlog")?;
	}

	let broker = Broker::new(LoopbackManager::new(), &config);
	let socket_path = args.socket.unwrap_or_else(daemon::daemon_socket_path);
	Daemon::start(socket_path, broker).await?.run().await
}
