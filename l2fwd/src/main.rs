mod config;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use config::{Cli, ConfigError};
use l2fwdlib::{forward_l2, stop_pair, Counters, ForwardError, Kernel, StatsReporter, StopHandle};
use std::{process, time::Duration};

/// Handle Ctrl+C and SIGTERM
fn handle_signal(stop: StopHandle) -> Result<()> {
	ctrlc::set_handler(move || {
		if let Err(e) = stop.stop() {
			log::error!("failed to request a stop: {}", e);
		}
	})
	.context("setting the termination handler")
}

fn run(cli: &Cli) -> Result<()> {
	let cfg = cli.to_config(config::ifindex)?;

	let (stop, signal) = stop_pair().context("creating the stop socket")?;
	handle_signal(stop)?;

	let counters = Counters::new();
	let _reporter = if cli.verbose {
		Some(StatsReporter::spawn(counters.clone(), Duration::from_secs(1)).context("starting the stats reporter")?)
	} else {
		None
	};

	#[cfg(feature = "debug")]
	println!("forwarding with {:?}", cfg);
	let mut kernel = Kernel::with_stop(signal);
	forward_l2(&mut kernel, &cfg, counters)?;
	log::info!("all programs detached, exiting");
	Ok(())
}

/// Exit status for a run that ended in `e`
///
/// A socket that could not be registered ends its pair early, but the process still exits
/// cleanly once the attached programs have been released.
fn exit_status(e: &anyhow::Error) -> i32 {
	match e.downcast_ref::<ForwardError>() {
		Some(ForwardError::Registration { .. }) => 0,
		_ => 1,
	}
}

fn main() {
	env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

	let cli = match Cli::try_parse() {
		Ok(cli) => cli,
		Err(e) => {
			let _ = e.print();
			process::exit(if e.use_stderr() { 1 } else { 0 });
		}
	};

	if let Err(e) = run(&cli) {
		if let Some(cfg_err) = e.downcast_ref::<ConfigError>() {
			if cfg_err.wants_usage() {
				let _ = Cli::command().print_help();
				eprintln!();
			}
		}
		log::error!("{:#}", e);
		process::exit(exit_status(&e));
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use l2fwdlib::XskError;
	use std::io;

	#[test]
	fn registration_failure_exits_cleanly() {
		let e = anyhow::Error::from(ForwardError::Registration {
			link: "eth1".into(),
			source: XskError::Busy("map update"),
		});
		assert_eq!(exit_status(&e), 0);
	}

	#[test]
	fn other_failures_exit_with_one() {
		let setup = anyhow::Error::from(ForwardError::Setup {
			context: "umem".into(),
			source: XskError::NoMem("mmap"),
		});
		let wait = anyhow::Error::from(ForwardError::Wait(io::Error::new(io::ErrorKind::Other, "poll")));
		let config = anyhow::Error::from(ConfigError::MissingLink("inlink"));
		assert_eq!(exit_status(&setup), 1);
		assert_eq!(exit_status(&wait), 1);
		assert_eq!(exit_status(&config), 1);
	}
}
