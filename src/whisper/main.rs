//! Whisper entrypoint: reads the properties file and runs the configured
//! role, or sends one of the operator control commands.

#[macro_use]
extern crate tracing;

mod server;

use std::path::PathBuf;

use structopt::StructOpt;

use whisper_util::config::{read_config, Config};

#[derive(StructOpt, Debug)]
#[structopt(name = "whisper", about = "A small distributed blob store")]
struct Opt {
	/// Configuration file (line-based key=value properties)
	#[structopt(
		short = "c",
		long = "config",
		default_value = "/tmp/whisper.properties"
	)]
	config_file: PathBuf,

	#[structopt(subcommand)]
	cmd: Option<Command>,
}

#[derive(StructOpt, Debug)]
enum Command {
	/// Run the role configured in the properties file (the default)
	#[structopt(name = "server")]
	Server,

	/// Politely shut the configured role down
	#[structopt(name = "close")]
	Close(CloseOpt),

	/// Send the control body file to the mediator as one DO_NOTIFY
	#[structopt(name = "mediator-control")]
	MediatorControl,
}

#[derive(StructOpt, Debug)]
struct CloseOpt {
	/// RPC address of the center or agent to close; defaults to the
	/// role's port on localhost
	#[structopt(long = "rpc-host")]
	rpc_host: Option<String>,
}

#[tokio::main]
async fn main() {
	let opt = Opt::from_args();

	let config = match read_config(&opt.config_file) {
		Ok(config) => config,
		Err(e) => {
			eprintln!("whisper: {}", e);
			std::process::exit(1);
		}
	};

	init_logging(&config);

	let res = match opt.cmd.unwrap_or(Command::Server) {
		Command::Server => server::run_server(config).await,
		Command::Close(close) => server::run_close(config, close.rpc_host).await,
		Command::MediatorControl => server::run_mediator_control(config).await,
	};

	if let Err(e) = res {
		error!("{}", e);
		std::process::exit(1);
	}
}

fn init_logging(config: &Config) {
	if std::env::var("RUST_LOG").is_err() {
		let level = if config.debug { "debug" } else { "info" };
		std::env::set_var("RUST_LOG", level)
	}
	tracing_subscriber::fmt()
		.with_writer(std::io::stderr)
		.with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
		.init();
}
