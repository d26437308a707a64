use serde_json::Value;
use telco::{ApplicationQueryOptions, Device, DeviceManager, ProcessQueryOptions, Telco};

use crate::cli::ScopeArg;
use crate::error::Result;
use crate::output::{ApplicationRow, DeviceRow, ProcessRow, VersionData};

pub async fn version(telco: &Telco) -> Result<Value> {
	let data = VersionData {
		client: env!("CARGO_PKG_VERSION").to_string(),
		engine: telco.version().await?,
	};
	Ok(serde_json::to_value(data)?)
}

pub async fn devices(manager: &DeviceManager) -> Result<Value> {
	let rows: Vec<DeviceRow> = manager
		.enumerate_devices()
		.await?
		.iter()
		.map(|device| DeviceRow {
			id: device.id().to_string(),
			name: device.name().to_string(),
			kind: device.device_type().to_string(),
		})
		.collect();
	Ok(serde_json::to_value(rows)?)
}

pub async fn processes(device: &Device, scope: ScopeArg, pids: &[u32]) -> Result<Value> {
	let options = pids
		.iter()
		.fold(ProcessQueryOptions::new(scope.into()), |options, pid| options.select_pid(*pid));

	let rows: Vec<ProcessRow> = device
		.enumerate_processes(&options)
		.await?
		.iter()
		.map(|process| {
			let mut parameters = process.parameters().clone();
			// icons are image blobs, not table material
			if let Some(icons) = parameters.remove("icons") {
				let count = icons.as_array().map_or(0, Vec::len);
				parameters.insert("icons".to_string(), Value::from(count));
			}
			ProcessRow {
				pid: process.pid(),
				name: process.name().to_string(),
				parameters,
			}
		})
		.collect();
	Ok(serde_json::to_value(rows)?)
}

pub async fn applications(device: &Device, scope: ScopeArg, identifiers: &[String]) -> Result<Value> {
	let options = identifiers
		.iter()
		.fold(ApplicationQueryOptions::new(scope.into()), |options, id| {
			options.select_identifier(id.clone())
		});

	let rows: Vec<ApplicationRow> = device
		.enumerate_applications(&options)
		.await?
		.iter()
		.map(|app| ApplicationRow {
			pid: app.is_running().then(|| app.pid()),
			name: app.name().to_string(),
			identifier: app.identifier().to_string(),
		})
		.collect();
	Ok(serde_json::to_value(rows)?)
}

#[cfg(test)]
mod tests {
	use serde_json::json;
	use telco::Config;
	use telco_sim::Simulator;

	use super::*;

	#[tokio::test]
	async fn applications_list_running_first() {
		let sim = Simulator::new();
		sim.add_application("local", "org.example.mail", "Mail", 0).unwrap();
		sim.add_application("local", "org.example.notes", "Notes", 4242).unwrap();
		let telco = Telco::connect(sim.connect(), Config::default());
		let device = telco.device_manager().await.unwrap().local_device().await.unwrap();

		let data = applications(&device, ScopeArg::Minimal, &[]).await.unwrap();
		assert_eq!(
			data,
			json!([
				{ "pid": 4242, "name": "Notes", "identifier": "org.example.notes" },
				{ "name": "Mail", "identifier": "org.example.mail" },
			])
		);
	}

	#[tokio::test]
	async fn full_scope_summarises_icons() {
		let sim = Simulator::new();
		let telco = Telco::connect(sim.connect(), Config::default());
		let device = telco.device_manager().await.unwrap().local_device().await.unwrap();

		let data = processes(&device, ScopeArg::Full, &[1]).await.unwrap();
		assert_eq!(data[0]["icons"], 1);
		assert_eq!(data[0]["path"], "/usr/bin/init");
	}
}
