use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "xprofile")]
#[command(about = "Inspect and validate cross-profile service descriptors")]
#[command(version)]
pub struct Cli {
	/// Increase verbosity (-v info, -vv debug, -vvv trace)
	#[arg(short, long, global = true, action = clap::ArgAction::Count)]
	pub verbose: u8,

	/// Output format
	#[arg(short, long, global = true, value_enum, default_value = "json")]
	pub format: OutputFormat,

	#[command(subcommand)]
	pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
	/// Print the entry points and marshaling plan generated for a descriptor
	Inspect {
		/// Descriptor file (JSON)
		descriptor: PathBuf,

		/// Connector configuration the service is bound to
		#[arg(short, long, value_name = "FILE")]
		connector: Option<PathBuf>,
	},

	/// Check one or more descriptor files
	#[command(alias = "check")]
	Validate {
		#[arg(required = true)]
		descriptors: Vec<PathBuf>,
	},

	/// Print a connector configuration with defaults applied
	Config { path: PathBuf },
}

impl Commands {
	pub fn name(&self) -> &'static str {
		match self {
			Commands::Inspect { .. } => "inspect",
			Commands::Validate { .. } => "validate",
			Commands::Config { .. } => "config",
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_inspect_with_connector() {
		let cli = Cli::try_parse_from(["xprofile", "-vv", "inspect", "notes.json", "--connector", "notes.conf.json"]).unwrap();
		assert_eq!(cli.verbose, 2);
		match cli.command {
			Commands::Inspect { descriptor, connector } => {
				assert_eq!(descriptor, PathBuf::from("notes.json"));
				assert_eq!(connector, Some(PathBuf::from("notes.conf.json")));
			}
			other => panic!("unexpected command {other:?}"),
		}
	}

	#[test]
	fn validate_requires_a_descriptor() {
		assert!(Cli::try_parse_from(["xprofile", "validate"]).is_err());
		let cli = Cli::try_parse_from(["xprofile", "check", "a.json", "b.json", "-f", "text"]).unwrap();
		assert_eq!(cli.format, OutputFormat::Text);
		assert_eq!(cli.command.name(), "validate");
	}
}
