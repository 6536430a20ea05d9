//! This module defines the structures required for AF_XDP based packet memory operations
//!
//! Errors related to the kernel transport
//!
//! Static socket sizing and the resolved (interface, queue) pair a socket binds to

mod desc;
mod poll;
mod pool;
mod program;
mod ring;
mod socket;
mod umem;
pub mod transport;

pub use desc::*;
pub use poll::*;
pub use pool::*;
pub use program::*;
pub use ring::*;
pub use socket::*;
pub use transport::{FrameMemory, Interest, Kernel, Readiness, Steering, Transport, Waiter, Wakeup, Xsk};
pub use umem::*;

use libc::{EACCES, EBUSY, EEXIST, EINVAL, ENOBUFS, ENODEV, ENOMEM, ENXIO, EOPNOTSUPP, EPERM};
use std::{fmt, io};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum XskError {
	#[error("{0}: operation not permitted (CAP_NET_ADMIN and CAP_BPF are required)")]
	NoPermission(&'static str),
	#[error("{0}: no such device")]
	NoDevice(&'static str),
	#[error("{0}: device or resource busy")]
	Busy(&'static str),
	#[error("{0}: not enough memory")]
	NoMem(&'static str),
	#[error("{0}: operation not supported on this device")]
	NoSupport(&'static str),
	#[error("{0}: invalid argument")]
	Invalid(&'static str),
	#[error("{0}: {1}")]
	Os(&'static str, #[source] io::Error),
}

impl XskError {
	/// Builds the error from `errno` right after a failed call
	pub fn new(op: &'static str) -> Self {
		Self::from_io(op, io::Error::last_os_error())
	}

	pub fn from_io(op: &'static str, err: io::Error) -> Self {
		match err.raw_os_error() {
			Some(EPERM) | Some(EACCES) => XskError::NoPermission(op),
			Some(ENODEV) | Some(ENXIO) => XskError::NoDevice(op),
			Some(EBUSY) | Some(EEXIST) => XskError::Busy(op),
			Some(ENOMEM) | Some(ENOBUFS) => XskError::NoMem(op),
			Some(EOPNOTSUPP) => XskError::NoSupport(op),
			Some(EINVAL) => XskError::Invalid(op),
			_ => XskError::Os(op, err),
		}
	}
}

/// Sizing of the shared UMEM and of every ring created on it.
///
/// Ring sizes must be powers of two, the kernel rejects anything else.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SocketOptions {
	pub num_frames: u32,
	pub frame_size: u32,
	pub fill_ring_num_descs: u32,
	pub completion_ring_num_descs: u32,
	pub rx_ring_num_descs: u32,
	pub tx_ring_num_descs: u32,
}

/// The sizing every forwarder starts with; not adjustable at runtime.
pub const SOCKET_OPTIONS: SocketOptions = SocketOptions {
	num_frames: 4096,
	frame_size: 2048,
	fill_ring_num_descs: 2048,
	completion_ring_num_descs: 1024,
	rx_ring_num_descs: 1024,
	tx_ring_num_descs: 1024,
};

impl SocketOptions {
	/// Length in bytes of the UMEM backing these options
	#[inline]
	pub fn umem_len(&self) -> usize {
		self.num_frames as usize * self.frame_size as usize
	}

	pub fn check(&self) -> Result<(), XskError> {
		let rings = [
			self.fill_ring_num_descs,
			self.completion_ring_num_descs,
			self.rx_ring_num_descs,
			self.tx_ring_num_descs,
		];
		if self.num_frames == 0 || rings.iter().any(|n| !n.is_power_of_two()) {
			return Err(XskError::Invalid("socket options"));
		}
		// 2048 and 4096 are the only chunk sizes an aligned UMEM accepts
		if self.frame_size != 2048 && self.frame_size != 4096 {
			return Err(XskError::Invalid("socket options"));
		}
		Ok(())
	}
}

impl Default for SocketOptions {
	fn default() -> Self {
		SOCKET_OPTIONS
	}
}

/// A network interface resolved to its index, together with the queue to bind on it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Link {
	pub name: String,
	pub index: u32,
	pub queue_id: u32,
}

impl Link {
	pub fn new(name: impl Into<String>, index: u32, queue_id: u32) -> Self {
		Self {
			name: name.into(),
			index,
			queue_id,
		}
	}
}

impl fmt::Display for Link {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} (ifindex {}, queue {})", self.name, self.index, self.queue_id)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn errno_maps_to_variants() {
		let e = XskError::from_io("bind", io::Error::from_raw_os_error(ENODEV));
		assert!(matches!(e, XskError::NoDevice("bind")));
		let e = XskError::from_io("bpf", io::Error::from_raw_os_error(EPERM));
		assert!(matches!(e, XskError::NoPermission("bpf")));
		let e = XskError::from_io("mmap", io::Error::from_raw_os_error(libc::EIO));
		assert!(matches!(e, XskError::Os("mmap", _)));
	}

	#[test]
	fn default_options_are_valid() {
		assert!(SOCKET_OPTIONS.check().is_ok());
		assert_eq!(SOCKET_OPTIONS.umem_len(), 4096 * 2048);
	}

	#[test]
	fn rejects_odd_ring_sizes() {
		let opts = SocketOptions {
			rx_ring_num_descs: 1000,
			..SOCKET_OPTIONS
		};
		assert!(opts.check().is_err());
		let opts = SocketOptions {
			frame_size: 1500,
			..SOCKET_OPTIONS
		};
		assert!(opts.check().is_err());
	}
}
