//! Result envelope printed by every command.
//!
//! ```json
//! {
//!   "schemaVersion": 1,
//!   "ok": true,
//!   "command": "ps",
//!   "data": [ { "pid": 1, "name": "init" } ],
//!   "timings": { "durationMs": 12 }
//! }
//! ```
//!
//! Failures carry `"ok": false` and an `error` object with a stable code.


use std::io::{self, Write};
use std::time::{Duration, Instant};

use colored::Colorize;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Bumped on breaking changes to the envelope.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
	/// Tables and plain values
	#[default]
	Text,
	/// Pretty-printed JSON envelope
	Json,
	/// One JSON envelope per line
	Ndjson,
}

impl std::str::FromStr for OutputFormat {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_lowercase().as_str() {
			"text" => Ok(OutputFormat::Text),
			"json" => Ok(OutputFormat::Json),
			"ndjson" => Ok(OutputFormat::Ndjson),
			_ => Err(format!("unknown format: {s}")),
		}
	}
}

impl std::fmt::Display for OutputFormat {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			OutputFormat::Text => write!(f, "text"),
			OutputFormat::Json => write!(f, "json"),
			OutputFormat::Ndjson => write!(f, "ndjson"),
		}
	}
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult<T: Serialize> {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub schema_version: Option<u32>,

	pub ok: bool,

	pub command: String,

	/// Present on success
	#[serde(skip_serializing_if = "Option::is_none")]
	pub data: Option<T>,

	/// Present on failure
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<CommandError>,

	#[serde(skip_serializing_if = "Option::is_none")]
	pub timings: Option<Timings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandError {
	pub code: ErrorCode,

	pub message: String,

	#[serde(skip_serializing_if = "Option::is_none")]
	pub details: Option<Value>,
}

/// Codes scripts can match on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
	/// No engine executable could be found or started
	EngineUnavailable,
	/// The engine went away mid-command
	ConnectionLost,
	DeviceNotFound,
	ProcessNotFound,
	Timeout,
	InvalidInput,
	PermissionDenied,
	/// Any other failure the engine reported
	EngineError,
	ConfigError,
	IoError,
	InternalError,
}

impl std::fmt::Display for ErrorCode {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			ErrorCode::EngineUnavailable => write!(f, "ENGINE_UNAVAILABLE"),
			ErrorCode::ConnectionLost => write!(f, "CONNECTION_LOST"),
			ErrorCode::DeviceNotFound => write!(f, "DEVICE_NOT_FOUND"),
			ErrorCode::ProcessNotFound => write!(f, "PROCESS_NOT_FOUND"),
			ErrorCode::Timeout => write!(f, "TIMEOUT"),
			ErrorCode::InvalidInput => write!(f, "INVALID_INPUT"),
			ErrorCode::PermissionDenied => write!(f, "PERMISSION_DENIED"),
			ErrorCode::EngineError => write!(f, "ENGINE_ERROR"),
			ErrorCode::ConfigError => write!(f, "CONFIG_ERROR"),
			ErrorCode::IoError => write!(f, "IO_ERROR"),
			ErrorCode::InternalError => write!(f, "INTERNAL_ERROR"),
		}
	}
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timings {
	pub duration_ms: u64,
}

impl From<Duration> for Timings {
	fn from(duration: Duration) -> Self {
		Timings {
			duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
		}
	}
}

pub struct ResultBuilder<T: Serialize> {
	command: String,
	data: Option<T>,
	error: Option<CommandError>,
	start_time: Instant,
}

impl<T: Serialize> ResultBuilder<T> {
	/// Starts timing the command now.
	pub fn new(command: impl Into<String>) -> Self {
		Self {
			command: command.into(),
			data: None,
			error: None,
			start_time: Instant::now(),
		}
	}

	pub fn started_at(mut self, start: Instant) -> Self {
		self.start_time = start;
		self
	}

	pub fn data(mut self, data: T) -> Self {
		self.data = Some(data);
		self
	}

	pub fn error(mut self, code: ErrorCode, message: impl Into<String>) -> Self {
		self.error = Some(CommandError {
			code,
			message: message.into(),
			details: None,
		});
		self
	}

	pub fn error_with(mut self, error: CommandError) -> Self {
		self.error = Some(error);
		self
	}

	pub fn build(self) -> CommandResult<T> {
		let ok = self.error.is_none() && self.data.is_some();
		CommandResult {
			schema_version: Some(SCHEMA_VERSION),
			ok,
			command: self.command,
			data: self.data,
			error: self.error,
			timings: Some(Timings::from(self.start_time.elapsed())),
		}
	}
}

pub fn print_result<T: Serialize>(result: &CommandResult<T>, format: OutputFormat) {
	match format {
		OutputFormat::Json => {
			if let Ok(json) = serde_json::to_string_pretty(result) {
				println!("{json}");
			}
		}
		OutputFormat::Ndjson => {
			if let Ok(json) = serde_json::to_string(result) {
				println!("{json}");
			}
		}
		OutputFormat::Text => print_result_text(result),
	}
}

fn print_result_text<T: Serialize>(result: &CommandResult<T>) {
	let mut stdout = io::stdout().lock();

	if let Some(ref error) = result.error {
		let _ = writeln!(stdout, "Error [{}]: {}", error.code, error.message);
		return;
	}
	let Some(ref data) = result.data else {
		return;
	};
	let Ok(value) = serde_json::to_value(data) else {
		return;
	};
	let _ = stdout.write_all(render_text(&value).as_bytes());
}

/// Arrays of records become an aligned table, a record becomes `key: value`
/// lines and anything else is printed as is.
pub fn render_text(value: &Value) -> String {
	match value {
		Value::Array(rows) if rows.iter().all(Value::is_object) => {
			let rows: Vec<&Map<String, Value>> = rows.iter().filter_map(Value::as_object).collect();
			render_table(&rows)
		}
		Value::Object(record) => record
			.iter()
			.map(|(key, value)| format!("{key}: {}\n", cell(value)))
			.collect(),
		Value::Null => String::new(),
		other => format!("{}\n", cell(other)),
	}
}

fn render_table(rows: &[&Map<String, Value>]) -> String {
	let Some(first) = rows.first() else {
		return String::new();
	};
	let columns: Vec<&String> = first.keys().collect();
	let cells: Vec<Vec<String>> = rows
		.iter()
		.map(|row| columns.iter().map(|c| row.get(*c).map(cell).unwrap_or_default()).collect())
		.collect();

	let widths: Vec<usize> = columns
		.iter()
		.enumerate()
		.map(|(i, c)| cells.iter().map(|r| r[i].chars().count()).fold(c.chars().count(), usize::max))
		.collect();

	let line = |values: Vec<String>| {
		let padded: Vec<String> = values
			.iter()
			.zip(&widths)
			.map(|(v, w)| format!("{v:<w$}"))
			.collect();
		format!("{}\n", padded.join("  ").trim_end())
	};

	let mut out = line(columns.iter().map(|c| c.to_uppercase()).collect());
	out.push_str(&line(widths.iter().map(|w| "-".repeat(*w)).collect()));
	for row in cells {
		out.push_str(&line(row));
	}
	out
}

fn cell(value: &Value) -> String {
	match value {
		Value::String(s) => s.clone(),
		Value::Null => String::new(),
		other => other.to_string(),
	}
}

pub fn print_error_stderr(error: &CommandError) {
	eprintln!("{} [{}]: {}", "error".red().bold(), error.code, error.message);
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VersionData {
	pub client: String,
	pub engine: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeviceRow {
	pub id: String,
	pub name: String,
	#[serde(rename = "type")]
	pub kind: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProcessRow {
	pub pid: u32,
	pub name: String,
	/// Scope-dependent extras (path, user, ...)
	#[serde(flatten)]
	pub parameters: Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApplicationRow {
	/// Blank when not running
	#[serde(skip_serializing_if = "Option::is_none")]
	pub pid: Option<u32>,
	pub name: String,
	pub identifier: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PidData {
	pub pid: u32,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub resumed: Option<bool>,
}
