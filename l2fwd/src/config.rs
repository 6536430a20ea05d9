//! Command line flags and their resolution into a forwarding `Config`

use clap::Parser;
use l2fwdlib::{Config, Link, SOCKET_OPTIONS};
use pnet::util::MacAddr;
use thiserror::Error;

/// Forwards frames between two interface queues over a pair of AF_XDP sockets sharing one UMEM,
/// rewriting the destination MAC on the way.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
	/// Input network link
	#[arg(long)]
	pub inlink: Option<String>,

	/// Queue to bind on the input link
	#[arg(long, default_value_t = 0)]
	pub inlinkqueue: u32,

	/// Destination MAC written into frames forwarded from the input link
	#[arg(long, default_value = "ff:ff:ff:ff:ff:ff")]
	pub inlinkdst: String,

	/// Output network link
	#[arg(long)]
	pub outlink: Option<String>,

	/// Queue to bind on the output link
	#[arg(long, default_value_t = 0)]
	pub outlinkqueue: u32,

	/// Destination MAC written into frames forwarded from the output link
	#[arg(long, default_value = "ff:ff:ff:ff:ff:ff")]
	pub outlinkdst: String,

	/// Log the forwarding rate once a second
	#[arg(long)]
	pub verbose: bool,
}

#[derive(Error, Debug)]
pub enum ConfigError {
	#[error("--{0} is required")]
	MissingLink(&'static str),
	#[error("invalid MAC address {1:?} for --{0}")]
	BadMac(&'static str, String),
	#[error("no interface named {0}")]
	NoSuchLink(String),
}

impl ConfigError {
	/// Whether the usage text helps with this error
	pub fn wants_usage(&self) -> bool {
		!matches!(self, ConfigError::NoSuchLink(_))
	}
}

fn mac(flag: &'static str, text: &str) -> Result<MacAddr, ConfigError> {
	text.parse::<MacAddr>()
		.map_err(|_| ConfigError::BadMac(flag, text.to_string()))
}

impl Cli {
	/// Checks the flags and resolves both interface names through `lookup`
	pub fn to_config<F>(&self, lookup: F) -> Result<Config, ConfigError>
	where
		F: Fn(&str) -> Option<u32>,
	{
		let inlink = self.inlink.as_deref().ok_or(ConfigError::MissingLink("inlink"))?;
		let outlink = self.outlink.as_deref().ok_or(ConfigError::MissingLink("outlink"))?;
		let input_dst = mac("inlinkdst", &self.inlinkdst)?;
		let output_dst = mac("outlinkdst", &self.outlinkdst)?;
		let link = |name: &str, queue| {
			lookup(name)
				.map(|index| Link::new(name, index, queue))
				.ok_or_else(|| ConfigError::NoSuchLink(name.to_string()))
		};
		Ok(Config {
			input: link(inlink, self.inlinkqueue)?,
			input_dst,
			output: link(outlink, self.outlinkqueue)?,
			output_dst,
			options: SOCKET_OPTIONS,
		})
	}
}

/// Interface index of `name` on this host
pub fn ifindex(name: &str) -> Option<u32> {
	pnet::datalink::interfaces()
		.into_iter()
		.find(|iface| iface.name == name)
		.map(|iface| iface.index)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn lookup(name: &str) -> Option<u32> {
		match name {
			"eth0" => Some(2),
			"eth1" => Some(3),
			_ => None,
		}
	}

	#[test]
	fn defaults() {
		let cli = Cli::try_parse_from(["l2fwd", "--inlink", "eth0", "--outlink", "eth1"]).unwrap();
		assert!(!cli.verbose);
		let cfg = cli.to_config(lookup).unwrap();
		assert_eq!(cfg.input, Link::new("eth0", 2, 0));
		assert_eq!(cfg.output, Link::new("eth1", 3, 0));
		assert_eq!(cfg.input_dst, MacAddr::broadcast());
		assert_eq!(cfg.output_dst, MacAddr::broadcast());
		assert_eq!(cfg.options, SOCKET_OPTIONS);
	}

	#[test]
	fn every_flag() {
		let cli = Cli::try_parse_from([
			"l2fwd",
			"--inlink",
			"eth0",
			"--inlinkqueue",
			"2",
			"--inlinkdst",
			"de:ad:be:ef:00:01",
			"--outlink",
			"eth1",
			"--outlinkqueue",
			"5",
			"--outlinkdst",
			"02:00:00:00:00:02",
			"--verbose",
		])
		.unwrap();
		assert!(cli.verbose);
		let cfg = cli.to_config(lookup).unwrap();
		assert_eq!(cfg.input.queue_id, 2);
		assert_eq!(cfg.output.queue_id, 5);
		assert_eq!(cfg.input_dst, MacAddr::new(0xde, 0xad, 0xbe, 0xef, 0x00, 0x01));
		assert_eq!(cfg.output_dst, MacAddr::new(0x02, 0, 0, 0, 0, 0x02));
	}

	#[test]
	fn missing_links_are_reported_first() {
		let cli = Cli::try_parse_from(["l2fwd", "--outlink", "eth1", "--inlinkdst", "nope"]).unwrap();
		let err = cli.to_config(lookup).unwrap_err();
		assert!(matches!(err, ConfigError::MissingLink("inlink")));
		assert!(err.wants_usage());
	}

	#[test]
	fn bad_mac() {
		let cli =
			Cli::try_parse_from(["l2fwd", "--inlink", "eth0", "--outlink", "eth1", "--outlinkdst", "zz:00"]).unwrap();
		assert!(matches!(cli.to_config(lookup), Err(ConfigError::BadMac("outlinkdst", _))));
	}

	#[test]
	fn unknown_interface() {
		let cli = Cli::try_parse_from(["l2fwd", "--inlink", "eth0", "--outlink", "wlan9"]).unwrap();
		let err = cli.to_config(lookup).unwrap_err();
		assert!(matches!(err, ConfigError::NoSuchLink(ref n) if n == "wlan9"));
		assert!(!err.wants_usage());
	}

	#[test]
	fn bad_queue_is_a_parse_error() {
		assert!(Cli::try_parse_from(["l2fwd", "--inlink", "eth0", "--inlinkqueue", "-1"]).is_err());
	}
}
