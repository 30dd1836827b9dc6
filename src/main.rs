use clap::{Arg, ArgAction, ArgMatches, Command};
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use combox::config::{self, Config, PASSPHRASE_ENV};
use combox::scheduler::TokioScheduler;
use combox::{logging, runner, utils};

///////////////////////
// Utility functions //
///////////////////////

fn config_path(matches: &ArgMatches) -> PathBuf {
	matches.get_one::<String>("config").map(PathBuf::from).unwrap_or_else(Config::default_path)
}

fn load_config(matches: &ArgMatches) -> Result<Config, Box<dyn Error>> {
	let path = config_path(matches);
	let config = Config::load(&path)
		.map_err(|e| format!("{} (run `combox init` to create a configuration)", e))?;
	Ok(config)
}

fn init(matches: &ArgMatches, sub: &ArgMatches) -> Result<(), Box<dyn Error>> {
	let path = config_path(matches);
	if path.exists() {
		return Err(format!("{} already exists", path.display()).into());
	}

	let mut config = Config::default();
	if let Some(dir) = sub.get_one::<String>("combox-dir") {
		config.combox_dir = config::absolutize(&PathBuf::from(dir));
	}
	if let Some(dir) = sub.get_one::<String>("metadata-dir") {
		config.metadata_dir = config::absolutize(&PathBuf::from(dir));
	}
	for spec in sub.get_many::<String>("node").ok_or("init: at least one --node is required")? {
		let mut node = config::parse_node_spec(spec)?;
		node.path = config::absolutize(&node.path);
		config.nodes.push(node);
	}

	config.apply_env();
	if config.passphrase.is_empty() {
		let first = utils::prompt_passphrase("Passphrase: ")?;
		let second = utils::prompt_passphrase("Repeat passphrase: ")?;
		if first != second {
			return Err("passphrases do not match".into());
		}
		config.passphrase = first;
	}
	config.validate()?;

	// The passphrase from the environment is not written out
	let mut stored = config.clone();
	if std::env::var(PASSPHRASE_ENV).map(|p| !p.is_empty()).unwrap_or(false) {
		stored.passphrase.clear();
	}
	runner::prepare_dirs(&config)?;
	stored.save(&path)?;
	eprintln!("Wrote {}", path.display());
	Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
	logging::init_tracing();

	let matches = Command::new("combox")
		.version(env!("CARGO_PKG_VERSION"))
		.about("Encrypted sharding of one directory across several cloud sync folders")
		.subcommand_required(true)
		.arg(
			Arg::new("config")
				.short('c')
				.long("config")
				.value_name("FILE")
				.help("Configuration file (default: ~/.combox/config.toml)"),
		)
		.subcommand(
			Command::new("init")
				.about("Create a configuration file")
				.arg(Arg::new("combox-dir").long("combox-dir").value_name("DIR").help("Directory to shard"))
				.arg(
					Arg::new("metadata-dir")
						.long("metadata-dir")
						.value_name("DIR")
						.help("Directory holding the silo"),
				)
				.arg(
					Arg::new("node")
						.long("node")
						.value_name("NAME=PATH[:QUOTA]")
						.help("Node directory; repeat once per node")
						.required(true)
						.action(ArgAction::Append),
				),
		)
		.subcommand(Command::new("run").about("Housekeep, then watch all directories until interrupted"))
		.subcommand(Command::new("housekeep").about("Reconcile the silo and shards once and exit"))
		.subcommand(Command::new("dump").about("Print tracked files and pending counters as JSON"))
		.get_matches();

	match matches.subcommand() {
		Some(("init", sub)) => init(&matches, sub)?,
		Some(("run", _)) => {
			let config = load_config(&matches)?;
			runner::run(config).await?;
		}
		Some(("housekeep", _)) => {
			let config = load_config(&matches)?;
			runner::housekeep_only(&config, Arc::new(TokioScheduler::current()))?;
		}
		Some(("dump", _)) => {
			let config = load_config(&matches)?;
			println!("{}", runner::dump(&config)?);
		}
		_ => unreachable!("subcommand_required"),
	}

	Ok(())
}

// vim: ts=4
