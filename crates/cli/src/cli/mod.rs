
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Root CLI for the connection broker daemon.
#[derive(Parser, Debug)]
#[command(name = "ucmd")]
#[command(about = "Session-scoped connection broker daemon")]
#[command(version)]
pub struct Cli {
	/// Increase verbosity (-v info, -vv debug)
	#[arg(short, long, global = true, action = clap::ArgAction::Count)]
	pub verbose: u8,

	#[command(subcommand)]
	pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
	/// Serve the broker on a Unix socket until SIGINT or SIGTERM.
	Serve(ServeArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
	/// Socket path (defaults to $XDG_RUNTIME_DIR/ucmd.sock).
	#[arg(long, value_name = "PATH")]
	pub socket: Option<PathBuf>,

	/// JSON broker configuration file.
	#[arg(long, value_name = "FILE")]
	pub config: Option<PathBuf>,

	/// Backlog ceiling, overriding the file and environment.
	#[arg(long, value_name = "N")]
	pub max_backlog: Option<u32>,
}
