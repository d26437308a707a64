use std::path::PathBuf;

use clap::builder::Styles;
use clap::builder::styling::AnsiColor;
use clap::{Parser, Subcommand, ValueEnum};

use crate::output::OutputFormat;

/// Help colors in cargo's palette: green headers, cyan literals.
fn cli_styles() -> Styles {
	Styles::styled()
		.header(AnsiColor::Green.on_default().bold())
		.usage(AnsiColor::Green.on_default().bold())
		.literal(AnsiColor::Cyan.on_default())
		.placeholder(AnsiColor::Cyan.on_default())
		.valid(AnsiColor::Cyan.on_default())
}

#[derive(Parser, Debug)]
#[command(name = "telco")]
#[command(about = "Inspect and control processes through the telco instrumentation engine")]
#[command(version)]
#[command(styles = cli_styles())]
pub struct Cli {
	/// Increase verbosity (-v info, -vv debug)
	#[arg(short, long, global = true, action = clap::ArgAction::Count)]
	pub verbose: u8,

	/// Output format
	#[arg(short = 'f', long, global = true, value_enum, default_value = "text")]
	pub format: OutputFormat,

	/// Load client settings from a JSON file instead of TELCO_* variables
	#[arg(long, global = true, value_name = "FILE")]
	pub config: Option<PathBuf>,

	/// Talk to a built-in simulated engine instead of launching one
	#[arg(long, global = true, conflicts_with = "ws")]
	pub sim: bool,

	/// Connect to an engine already listening on a WebSocket URL
	#[arg(long, global = true, value_name = "URL")]
	pub ws: Option<String>,

	#[command(flatten)]
	pub device: DeviceSelection,

	#[command(subcommand)]
	pub command: Commands,
}

/// Which device a command runs against; the local one unless told otherwise.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct DeviceSelection {
	/// Device id (see `telco devices`)
	#[arg(short = 'D', long = "device", global = true, value_name = "ID")]
	pub id: Option<String>,

	/// First USB device
	#[arg(short = 'U', long, global = true, conflicts_with = "id")]
	pub usb: bool,

	/// Remote engine at HOST:PORT, registered for this run
	#[arg(short = 'H', long, global = true, value_name = "HOST:PORT", conflicts_with_all = ["id", "usb"])]
	pub remote: Option<String>,

	/// Authentication token for --remote
	#[arg(long, global = true, value_name = "TOKEN", requires = "remote")]
	pub token: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
	/// Print the engine version
	Version,

	/// List connected devices
	Devices,

	/// List processes on the device
	Ps {
		/// How much detail to ask the engine for
		#[arg(short, long, value_enum, default_value = "minimal")]
		scope: ScopeArg,

		/// Only these pids
		#[arg(short, long = "pid", value_name = "PID")]
		pids: Vec<u32>,
	},

	/// List installed applications, running ones first
	Apps {
		#[arg(short, long, value_enum, default_value = "minimal")]
		scope: ScopeArg,

		/// Only these bundle identifiers
		#[arg(short, long = "identifier", value_name = "ID")]
		identifiers: Vec<String>,
	},

	/// Start a program suspended and print its pid
	Spawn {
		program: String,

		/// Arguments, argv[0] included
		#[arg(trailing_var_arg = true, allow_hyphen_values = true)]
		argv: Vec<String>,

		/// Extra environment entries (KEY=VALUE), may repeat
		#[arg(short, long, value_name = "KEY=VALUE")]
		env: Vec<String>,

		#[arg(long, value_name = "DIR")]
		cwd: Option<String>,

		/// Resume the process right away
		#[arg(short, long)]
		resume: bool,
	},

	/// Resume a suspended process
	Resume { pid: u32 },

	/// Kill a process
	Kill { pid: u32 },
}

impl Commands {
	/// Name used in the result envelope.
	pub fn name(&self) -> &'static str {
		match self {
			Commands::Version => "version",
			Commands::Devices => "devices",
			Commands::Ps { .. } => "ps",
			Commands::Apps { .. } => "apps",
			Commands::Spawn { .. } => "spawn",
			Commands::Resume { .. } => "resume",
			Commands::Kill { .. } => "kill",
		}
	}
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum ScopeArg {
	#[default]
	Minimal,
	Metadata,
	Full,
}

impl From<ScopeArg> for telco::Scope {
	fn from(scope: ScopeArg) -> Self {
		match scope {
			ScopeArg::Minimal => telco::Scope::Minimal,
			ScopeArg::Metadata => telco::Scope::Metadata,
			ScopeArg::Full => telco::Scope::Full,
		}
	}
}
