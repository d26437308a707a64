use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;

pub fn init_logging(verbosity: u8) {
	// 0 = errors only, boundary traffic silenced
	// 1 (-v) = info for the CLI, warn for the client and runtime
	// 2+ (-vv) = debug for everything, including every request and response
	let filter = match verbosity {
		0 => "error,telco_runtime=off,telco_sim=off",
		1 => "info,telco=warn,telco_runtime=warn",
		_ => "debug",
	};

	let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

	let stderr = std::io::stderr.with_max_level(tracing::Level::TRACE);

	tracing_subscriber::fmt()
		.with_env_filter(env_filter)
		.with_writer(stderr)
		.with_target(true)
		.compact()
		.init();
}
