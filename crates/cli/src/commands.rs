use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use xprofile::{ConnectorConfig, CrossProfileType, generate};

use crate::cli::Commands;
use crate::output::CommandResult;

pub fn run(command: &Commands) -> CommandResult {
	let name = command.name();
	let outcome = match command {
		Commands::Inspect { descriptor, connector } => inspect(descriptor, connector.as_deref()),
		Commands::Validate { descriptors } => validate(descriptors),
		Commands::Config { path } => config(path),
	};

	match outcome {
		Ok(data) => CommandResult::success(name, data),
		Err(err) => {
			debug!(target = "xprofile.cli", command = name, error = %format!("{err:#}"), "command failed");
			CommandResult::failure(name, &err)
		}
	}
}

fn load_descriptor(path: &Path) -> Result<CrossProfileType> {
	CrossProfileType::load(path).with_context(|| format!("loading descriptor {}", path.display()))
}

fn load_config(path: &Path) -> Result<ConnectorConfig> {
	ConnectorConfig::load(path).with_context(|| format!("loading connector config {}", path.display()))
}

fn inspect(descriptor: &Path, connector: Option<&Path>) -> Result<Value> {
	let service = load_descriptor(descriptor)?;
	let config = connector.map(load_config).transpose()?;

	if let (Some(declared), Some(config)) = (service.connector(), config.as_ref()) {
		if declared != config.name {
			warn!(
				target = "xprofile.cli",
				service = service.name(),
				declared,
				connector = %config.name,
				"service declares a different connector"
			);
		}
	}

	let surface = generate(&service, config.as_ref());
	info!(
		target = "xprofile.cli",
		service = %surface.service,
		entry_points = surface.entry_points.len(),
		methods = surface.methods.len(),
		"generated surface"
	);
	Ok(serde_json::to_value(&surface)?)
}

fn validate(paths: &[PathBuf]) -> Result<Value> {
	let mut reports = Vec::with_capacity(paths.len());
	let mut failures = Vec::new();

	for path in paths {
		match load_descriptor(path) {
			Ok(service) => reports.push(json!({
				"path": path,
				"service": service.name(),
				"methods": service.methods().len(),
			})),
			Err(err) => failures.push(format!("{err:#}")),
		}
	}

	if !failures.is_empty() {
		return Err(xprofile::Error::InvalidDescriptor(failures.join("; ")).into());
	}
	Ok(json!({ "valid": reports }))
}

fn config(path: &Path) -> Result<Value> {
	let config = load_config(path)?;
	Ok(serde_json::to_value(&config)?)
}
