//! Contains type and functions related to the Whisper configuration file
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::error::Error;

pub const DEFAULT_CONF_FILE: &str = "/tmp/whisper.properties";

/// Process mode selected by the `role` key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
	Mediator,
	Center,
	Agent,
	Client,
}

impl Role {
	pub fn from_name(name: &str) -> Option<Role> {
		match name {
			"mediator" => Some(Role::Mediator),
			"center" => Some(Role::Center),
			"agent" => Some(Role::Agent),
			"client" => Some(Role::Client),
			_ => None,
		}
	}

	pub fn name(&self) -> &'static str {
		match self {
			Role::Mediator => "mediator",
			Role::Center => "center",
			Role::Agent => "agent",
			Role::Client => "client",
		}
	}
}

/// Represent the whole configuration
#[derive(Debug, Clone)]
pub struct Config {
	/// Process mode
	pub role: Role,
	/// Enables debug log output
	pub debug: bool,
	/// Root directory for all persisted state
	pub base_dir: PathBuf,
	/// Host of the coordination service
	pub mediator_host: String,
	/// Optional file containing a DO_NOTIFY body for the mediator-control
	/// subcommand
	pub mediator_control_body_file: Option<PathBuf>,
}

/// Read and parse configuration
pub fn read_config(config_file: &Path) -> Result<Config, Error> {
	let props = read_properties(config_file)?;

	let role = props
		.get("role")
		.and_then(|r| Role::from_name(r))
		.ok_or_else(|| {
			Error::Message(format!(
				"config file {} error, role required (mediator|center|agent|client)",
				config_file.display()
			))
		})?;

	Ok(Config {
		role,
		debug: props.get("debug").map(|v| v == "true").unwrap_or(false),
		base_dir: props
			.get("baseDir")
			.map(PathBuf::from)
			.unwrap_or_else(|| PathBuf::from(".")),
		mediator_host: props
			.get("mediatorHost")
			.cloned()
			.unwrap_or_else(|| crate::data::LOCALHOST.to_string()),
		mediator_control_body_file: props.get("mediatorControlBodyFile").map(PathBuf::from),
	})
}

/// Parse a line-based `key=value` properties file. Lines without exactly one
/// `=` are ignored; keys and values are trimmed.
pub fn read_properties(path: &Path) -> Result<HashMap<String, String>, Error> {
	let mut file = std::fs::OpenOptions::new().read(true).open(path)?;
	let mut content = String::new();
	file.read_to_string(&mut content)?;

	let mut props = HashMap::new();
	for line in content.lines() {
		let mut parts = line.splitn(2, '=');
		let key = parts.next().map(str::trim);
		let value = parts.next().map(str::trim);
		if let (Some(key), Some(value)) = (key, value) {
			if !key.is_empty() {
				props.insert(key.to_string(), value.to_string());
			}
		}
	}
	Ok(props)
}
