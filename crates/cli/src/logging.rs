use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;

pub fn init_logging(verbosity: u8) {
	// 0 = errors only
	// 1 (-v) = daemon lifecycle, connections and teardown
	// 2+ (-vv) = per-command and per-event traffic
	let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter(verbosity)));

	let stderr = std::io::stderr.with_max_level(tracing::Level::TRACE);

	tracing_subscriber::fmt()
		.with_env_filter(env_filter)
		.with_writer(stderr)
		.with_target(true)
		.with_level(true)
		.compact()
		.init();
}

fn default_filter(verbosity: u8) -> &'static str {
	match verbosity {
		0 => "error",
		1 => "info",
		_ => "debug",
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn verbosity_maps_to_filter() {
		assert_eq!(default_filter(0), "error");
		assert_eq!(default_filter(1), "info");
		assert_eq!(default_filter(2), "debug");
		assert_eq!(default_filter(9), "debug");
	}
}
