use clap::Parser;
use telco_cli::{
	cli::Cli,
	commands,
	error::CliError,
	logging,
	output::{self, OutputFormat, ResultBuilder},
};

#[tokio::main]
async fn main() {
	let cli = Cli::parse();
	logging::init_logging(cli.verbose);

	let format = cli.format;
	let command = cli.command.name();

	if let Err(err) = commands::dispatch(cli).await {
		handle_error(command, err, format);
		std::process::exit(1);
	}
}

fn handle_error(command: &str, err: CliError, format: OutputFormat) {
	let cmd_error = err.to_command_error();

	// humans always get the message on stderr
	output::print_error_stderr(&cmd_error);

	// scripts get the failed envelope on stdout as well
	if format != OutputFormat::Text {
		let result: output::CommandResult<()> = ResultBuilder::new(command)
			.error_with(cmd_error)
			.build();
		output::print_result(&result, format);
	}
}
