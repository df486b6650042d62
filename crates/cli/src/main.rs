use clap::Parser;
use tracing::error;
use xprofile_cli::cli::Cli;
use xprofile_cli::{commands, logging, output};

fn main() {
	let cli = Cli::parse();
	logging::init_logging(cli.verbose);

	let result = commands::run(&cli.command);
	if let Err(err) = output::print_result(&result, cli.format) {
		error!(target = "xprofile.cli", error = %err, "failed to write output");
		std::process::exit(2);
	}
	if !result.ok {
		std::process::exit(1);
	}
}
