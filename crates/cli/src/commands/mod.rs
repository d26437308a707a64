//! Connecting to an engine, picking a device and running one command.

mod control;
mod list;

use std::time::Instant;

use serde_json::Value;
use telco::{Config, Device, DeviceManager, DeviceType, RemoteDeviceOptions, Telco};
use telco_sim::Simulator;
use tracing::{debug, info};

use crate::cli::{Cli, Commands, DeviceSelection};
use crate::error::Result;
use crate::output::{self, ResultBuilder};

/// Runs the parsed command line and prints its result.
pub async fn dispatch(cli: Cli) -> Result<()> {
	let started = Instant::now();
	let engine = Engine::connect(&cli).await?;

	let result = execute(&engine.telco, &cli.device, &cli.command).await;
	engine.close().await;
	let data = result?;

	let envelope = ResultBuilder::new(cli.command.name())
		.started_at(started)
		.data(data)
		.build();
	output::print_result(&envelope, cli.format);
	Ok(())
}

/// Runs one command against a connected engine and returns its data.
pub async fn execute(telco: &Telco, selection: &DeviceSelection, command: &Commands) -> Result<Value> {
	if let Commands::Version = command {
		return list::version(telco).await;
	}

	let manager = telco.device_manager().await?;
	if let Commands::Devices = command {
		return list::devices(&manager).await;
	}

	let device = select_device(&manager, selection).await?;
	info!(device = device.id(), command = command.name(), "running");
	match command {
		Commands::Ps { scope, pids } => list::processes(&device, *scope, pids).await,
		Commands::Apps { scope, identifiers } => list::applications(&device, *scope, identifiers).await,
		Commands::Spawn {
			program,
			argv,
			env,
			cwd,
			resume,
		} => control::spawn(&device, program, argv, env, cwd.as_deref(), *resume).await,
		Commands::Resume { pid } => control::resume(&device, *pid).await,
		Commands::Kill { pid } => control::kill(&device, *pid).await,
		Commands::Version | Commands::Devices => Ok(Value::Null),
	}
}

async fn select_device(manager: &DeviceManager, selection: &DeviceSelection) -> Result<Device> {
	let device = if let Some(address) = &selection.remote {
		let mut options = RemoteDeviceOptions::new();
		if let Some(token) = &selection.token {
			options = options.token(token.clone());
		}
		manager.add_remote_device(address, options).await?
	} else if let Some(id) = &selection.id {
		manager.find_device_by_id(id, None).await?
	} else if selection.usb {
		manager.find_device_by_type(DeviceType::Usb, None).await?
	} else {
		manager.local_device().await?
	};
	Ok(device)
}

/// The client plus, in `--sim` mode, the engine it talks to.
struct Engine {
	telco: Telco,
	sim: Option<Simulator>,
}

impl Engine {
	async fn connect(cli: &Cli) -> Result<Self> {
		let config = match &cli.config {
			Some(path) => Config::from_file(path)?,
			None => Config::from_env()?,
		};

		if cli.sim {
			let sim = Simulator::new();
			seed(&sim)?;
			debug!(version = sim.version(), "using simulated engine");
			let telco = Telco::connect(sim.connect(), config);
			return Ok(Self { telco, sim: Some(sim) });
		}

		let telco = match &cli.ws {
			Some(url) => Telco::connect_ws(url, config).await?,
			None => Telco::launch(config).await?,
		};
		Ok(Self { telco, sim: None })
	}

	async fn close(self) {
		if let Some(sim) = &self.sim {
			sim.disconnect_all();
		}
		if let Err(e) = self.telco.shutdown().await {
			debug!(error = %e, "engine shutdown");
		}
	}
}

/// A small world for `--sim`: a few processes, two apps and a USB device.
fn seed(sim: &Simulator) -> telco::Result<()> {
	let local = telco_sim::LOCAL_DEVICE;
	sim.add_process(local, 312, "sshd")?;
	sim.add_process(local, 808, "cron")?;
	sim.add_application(local, "org.example.notes", "Notes", 4242)?;
	sim.add_application(local, "org.example.mail", "Mail", 0)?;
	sim.set_frontmost(local, Some("org.example.notes"))?;
	sim.add_device("emulator-5554", "Android Emulator", DeviceType::Usb)?;
	sim.add_process("emulator-5554", 1, "init")?;
	sim.add_process("emulator-5554", 2110, "system_server")
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;
	use crate::cli::ScopeArg;

	fn seeded() -> (Telco, Simulator) {
		let sim = Simulator::new();
		seed(&sim).unwrap();
		let telco = Telco::connect(sim.connect(), Config::default());
		(telco, sim)
	}

	#[tokio::test]
	async fn ps_on_the_usb_device() {
		let (telco, _sim) = seeded();
		let selection = DeviceSelection {
			usb: true,
			..Default::default()
		};
		let command = Commands::Ps {
			scope: ScopeArg::Minimal,
			pids: vec![],
		};

		let data = execute(&telco, &selection, &command).await.unwrap();
		assert_eq!(
			data,
			json!([
				{ "pid": 1, "name": "init" },
				{ "pid": 2110, "name": "system_server" },
			])
		);
	}

	#[tokio::test]
	async fn devices_and_version() {
		let (telco, sim) = seeded();
		let selection = DeviceSelection::default();

		let data = execute(&telco, &selection, &Commands::Devices).await.unwrap();
		let ids: Vec<&str> = data.as_array().unwrap().iter().filter_map(|d| d["id"].as_str()).collect();
		assert_eq!(ids, ["local", "emulator-5554"]);

		let data = execute(&telco, &selection, &Commands::Version).await.unwrap();
		assert_eq!(data["engine"], sim.version());
	}

	#[tokio::test]
	async fn unknown_device_id_fails() {
		let config = Config::default().device_timeout(std::time::Duration::from_millis(20));
		let sim = Simulator::new();
		let telco = Telco::connect(sim.connect(), config);
		let selection = DeviceSelection {
			id: Some("nope".into()),
			..Default::default()
		};

		let err = execute(&telco, &selection, &Commands::Kill { pid: 1 }).await.unwrap_err();
		assert_eq!(err.to_command_error().code, crate::output::ErrorCode::Timeout);
	}
}
