//! The seam between the forwarding engine and whatever moves frames on its behalf
//!
//! The engine only ever talks to these traits. `Kernel` binds them to real AF_XDP sockets, an
//! XSKMAP redirect program and `poll(2)`. The `loopback` module binds them to heap memory so the
//! whole engine can be driven from tests.
//!
//! Ring operations never block and never move more than the matching `num_*` query reported.

use std::{io, os::unix::io::RawFd};

use super::{Desc, Link, PollWaiter, SocketOptions, StopSignal, Umem, XdpProgram, XdpSocket, XskError};

/// The packet buffer region shared by both sockets of a pair
pub trait FrameMemory {
	fn frame_count(&self) -> u32;

	fn frame_size(&self) -> u32;

	/// Resolves a descriptor to exactly `desc.len` bytes of its frame.
	/// Returns None when the descriptor points outside the region.
	fn frame_mut(&mut self, desc: &Desc) -> Option<&mut [u8]>;
}

/// Whether handing descriptors to a Transmit ring should also wake the kernel right away
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wakeup {
	Kick,
	/// The next readiness wait on the socket wakes the kernel instead
	Defer,
}

/// One socket and its ring quartet
pub trait Xsk {
	fn num_free_fill_slots(&mut self) -> usize;

	/// Never enqueues more than `num_free_fill_slots` descriptors
	fn fill(&mut self, descs: &[Desc]) -> usize;

	fn num_received(&mut self) -> usize;

	fn receive(&mut self, n: usize, out: &mut Vec<Desc>) -> usize;

	/// Descriptors handed to Transmit whose completion has not been reclaimed yet
	fn num_transmitted(&self) -> usize;

	fn transmit(&mut self, descs: &[Desc], wakeup: Wakeup) -> usize;

	fn num_completed(&mut self) -> usize;

	fn complete(&mut self, n: usize, out: &mut Vec<Desc>) -> usize;

	/// The readiness handle
	fn fd(&self) -> RawFd;
}

/// The redirect program that steers an interface queue into a socket
pub trait Steering {
	fn attach(&mut self, ifindex: u32) -> Result<(), XskError>;

	fn detach(&mut self, ifindex: u32) -> Result<(), XskError>;

	fn register(&mut self, queue_id: u32, fd: RawFd) -> Result<(), XskError>;

	fn unregister(&mut self, queue_id: u32) -> Result<(), XskError>;
}

/// What the engine wants to hear about on one socket
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Interest {
	pub readable: bool,
	pub writable: bool,
}

/// What a socket turned out to be ready for
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Readiness {
	pub readable: bool,
	pub writable: bool,
}

impl Readiness {
	#[inline]
	pub fn any(&self) -> bool {
		self.readable || self.writable
	}
}

/// Blocks until one of the pair's sockets is ready
pub trait Waiter {
	/// `Ok(None)` means somebody asked the pair to stop.
	/// `io::ErrorKind::Interrupted` is transient and the caller should simply wait again.
	fn wait(&mut self, interest: &[Interest; 2]) -> io::Result<Option<[Readiness; 2]>>;
}

/// Creates everything a forwarding pair needs
pub trait Transport {
	type Umem: FrameMemory;
	type Socket: Xsk;
	type Program: Steering;
	type Waiter: Waiter;

	fn create_umem(&mut self, opts: &SocketOptions) -> Result<Self::Umem, XskError>;

	/// A program whose XSKMAP holds `entries` sockets
	fn new_program(&mut self, link: &Link, entries: u32) -> Result<Self::Program, XskError>;

	/// Binds a socket to `link`'s queue on top of the shared UMEM
	fn open_socket(
		&mut self,
		umem: &mut Self::Umem,
		link: &Link,
		opts: &SocketOptions,
	) -> Result<Self::Socket, XskError>;

	fn waiter(&mut self, fds: [RawFd; 2]) -> Result<Self::Waiter, XskError>;
}

/// AF_XDP sockets as provided by the running kernel
#[derive(Debug, Default)]
pub struct Kernel {
	stop: Option<StopSignal>,
}

impl Kernel {
	pub fn new() -> Self {
		Self::default()
	}

	/// The waiter returned by this transport also reports `stop` becoming readable
	pub fn with_stop(stop: StopSignal) -> Self {
		Self { stop: Some(stop) }
	}
}

impl Transport for Kernel {
	type Umem = Umem;
	type Socket = XdpSocket;
	type Program = XdpProgram;
	type Waiter = PollWaiter;

	fn create_umem(&mut self, opts: &SocketOptions) -> Result<Umem, XskError> {
		Umem::new(opts)
	}

	fn new_program(&mut self, link: &Link, entries: u32) -> Result<XdpProgram, XskError> {
		log::info!("loading redirect program for {}", link);
		XdpProgram::new(entries)
	}

	fn open_socket(
		&mut self,
		umem: &mut Umem,
		link: &Link,
		opts: &SocketOptions,
	) -> Result<XdpSocket, XskError> {
		XdpSocket::open(umem, link, opts)
	}

	fn waiter(&mut self, fds: [RawFd; 2]) -> Result<PollWaiter, XskError> {
		Ok(PollWaiter::new(fds, self.stop.take()))
	}
}
