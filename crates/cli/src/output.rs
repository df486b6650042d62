use std::io::{self, Write};

use clap::ValueEnum;
use serde::Serialize;
use serde_json::Value;

/// Output format for CLI results.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
	/// Pretty-printed JSON envelope
	#[default]
	Json,
	/// Human-readable text
	Text,
}

/// The result envelope printed by every command.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
	pub ok: bool,
	pub command: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub data: Option<Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<CommandError>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandError {
	pub code: ErrorCode,
	pub message: String,
}

/// Standardized error codes for programmatic handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
	InvalidDescriptor,
	InvalidInput,
	IoError,
	InternalError,
}

impl ErrorCode {
	/// Maps a command failure to its code by the library error it carries.
	pub fn classify(err: &anyhow::Error) -> Self {
		match err.downcast_ref::<xprofile::Error>() {
			Some(xprofile::Error::InvalidDescriptor(_)) => ErrorCode::InvalidDescriptor,
			Some(xprofile::Error::Serialization(_)) => ErrorCode::InvalidInput,
			Some(xprofile::Error::Io(_)) => ErrorCode::IoError,
			_ => ErrorCode::InternalError,
		}
	}
}

impl CommandResult {
	pub fn success(command: &str, data: Value) -> Self {
		Self {
			ok: true,
			command: command.to_string(),
			data: Some(data),
			error: None,
		}
	}

	pub fn failure(command: &str, err: &anyhow::Error) -> Self {
		Self {
			ok: false,
			command: command.to_string(),
			data: None,
			error: Some(CommandError {
				code: ErrorCode::classify(err),
				message: format!("{err:#}"),
			}),
		}
	}
}

pub fn print_result(result: &CommandResult, format: OutputFormat) -> io::Result<()> {
	let stdout = io::stdout();
	let mut out = stdout.lock();
	match format {
		OutputFormat::Json => {
			serde_json::to_writer_pretty(&mut out, result)?;
			writeln!(out)
		}
		OutputFormat::Text => write_text(&mut out, result),
	}
}

fn write_text(out: &mut impl Write, result: &CommandResult) -> io::Result<()> {
	if let Some(error) = &result.error {
		return writeln!(out, "{} failed: {}", result.command, error.message);
	}
	match &result.data {
		Some(Value::Object(fields)) => {
			for (key, value) in fields {
				writeln!(out, "{key}: {}", text_value(value))?;
			}
			Ok(())
		}
		Some(value) => writeln!(out, "{}", text_value(value)),
		None => writeln!(out, "{}: ok", result.command),
	}
}

fn text_value(value: &Value) -> String {
	match value {
		Value::String(s) => s.clone(),
		Value::Array(items) if items.iter().all(|item| !item.is_object()) => items.iter().map(text_value).collect::<Vec<_>>().join(", "),
		Value::Null => "-".to_string(),
		other => other.to_string(),
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn classifies_library_errors_through_context() {
		let err = anyhow::Error::new(xprofile::Error::InvalidDescriptor("bad".into())).context("loading notes.json");
		assert_eq!(ErrorCode::classify(&err), ErrorCode::InvalidDescriptor);

		let err = anyhow::anyhow!("something else");
		assert_eq!(ErrorCode::classify(&err), ErrorCode::InternalError);
	}

	#[test]
	fn failure_envelope_includes_context_chain() {
		let err = anyhow::Error::new(xprofile::Error::Io("missing".into())).context("reading notes.json");
		let result = CommandResult::failure("inspect", &err);
		let json = serde_json::to_value(&result).unwrap();
		assert_eq!(json["ok"], false);
		assert_eq!(json["error"]["code"], "IO_ERROR");
		assert!(json["error"]["message"].as_str().unwrap().starts_with("reading notes.json: "));
		assert!(json.get("data").is_none());
	}

	#[test]
	fn text_output_lists_fields() {
		let result = CommandResult::success("inspect", json!({ "service": "Notes", "entryPoints": ["current", "other"] }));
		let mut buf = Vec::new();
		write_text(&mut buf, &result).unwrap();
		let text = String::from_utf8(buf).unwrap();
		assert!(text.contains("service: Notes"));
		assert!(text.contains("entryPoints: current, other"));
	}
}
