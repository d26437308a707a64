use serde_json::Value;
use telco::{Device, SpawnOptions};
use tracing::info;

use crate::error::{CliError, Result};
use crate::output::PidData;

pub async fn spawn(
	device: &Device,
	program: &str,
	argv: &[String],
	env: &[String],
	cwd: Option<&str>,
	resume: bool,
) -> Result<Value> {
	let mut options = SpawnOptions::new();
	if !argv.is_empty() {
		options = options.argv(argv);
	}
	if !env.is_empty() {
		options = options.env(check_env(env)?);
	}
	if let Some(cwd) = cwd {
		options = options.cwd(cwd);
	}

	let pid = device.spawn(program, options).await?;
	info!(pid, program, "spawned");
	if resume {
		device.resume(pid).await?;
	}
	Ok(serde_json::to_value(PidData {
		pid,
		resumed: Some(resume),
	})?)
}

pub async fn resume(device: &Device, pid: u32) -> Result<Value> {
	device.resume(pid).await?;
	Ok(serde_json::to_value(PidData { pid, resumed: None })?)
}

pub async fn kill(device: &Device, pid: u32) -> Result<Value> {
	device.kill(pid).await?;
	Ok(serde_json::to_value(PidData { pid, resumed: None })?)
}

/// Entries must look like `KEY=VALUE` with a non-empty key.
fn check_env(entries: &[String]) -> Result<&[String]> {
	match entries.iter().find(|e| e.split_once('=').is_none_or(|(key, _)| key.is_empty())) {
		Some(bad) => Err(CliError::Input(format!("environment entry {bad:?} is not KEY=VALUE"))),
		None => Ok(entries),
	}
}

#[cfg(test)]
mod tests {
	use telco::{Config, Scope, Telco};
	use telco_sim::Simulator;

	use super::*;

	#[test]
	fn env_entries_need_a_key() {
		assert!(check_env(&["A=1".into(), "B=".into()]).is_ok());
		assert!(matches!(check_env(&["=1".into()]), Err(CliError::Input(_))));
		assert!(check_env(&["PATH".into()]).is_err());
	}

	#[tokio::test]
	async fn spawn_resume_kill() {
		let sim = Simulator::new();
		let telco = Telco::connect(sim.connect(), Config::default());
		let device = telco.device_manager().await.unwrap().local_device().await.unwrap();

		let data = spawn(&device, "/usr/bin/top", &["top".into()], &["TERM=xterm".into()], None, true)
			.await
			.unwrap();
		let pid = u32::try_from(data["pid"].as_u64().unwrap()).unwrap();
		assert_eq!(data["resumed"], true);
		assert_eq!(device.process_by_pid(pid, Scope::Minimal).await.unwrap().name(), "top");

		kill(&device, pid).await.unwrap();
		let err = resume(&device, pid).await.unwrap_err();
		assert!(matches!(err, CliError::Telco(ref e) if e.code() == Some(telco::ErrorCode::ProcessNotFound)));
	}
}
