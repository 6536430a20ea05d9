//! Readiness waiting for the kernel transport
//!
//! `PollWaiter` blocks in `poll(2)` on the two socket handles of a pair, plus the read end of a
//! stop socket when one was supplied. A byte written to the other end of the stop socket, from
//! a signal handler for instance, makes the next wait report a stop request.

use std::{
	io::{self, Write},
	os::unix::{
		io::{AsRawFd, RawFd},
		net::UnixStream,
	},
};

use super::{Interest, Readiness, Waiter};

/// The end of a stop socket that asks a forwarder to stop
#[derive(Debug)]
pub struct StopHandle(UnixStream);

/// The end of a stop socket a waiter listens on
#[derive(Debug)]
pub struct StopSignal(UnixStream);

/// Creates a connected stop socket
pub fn stop_pair() -> io::Result<(StopHandle, StopSignal)> {
	let (tx, rx) = UnixStream::pair()?;
	tx.set_nonblocking(true)?;
	rx.set_nonblocking(true)?;
	Ok((StopHandle(tx), StopSignal(rx)))
}

impl StopHandle {
	/// Requests a stop, repeated requests are harmless
	pub fn stop(&self) -> io::Result<()> {
		match (&self.0).write(&[1]) {
			Ok(_) => Ok(()),
			// the buffer is full of earlier requests already
			Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
			Err(e) => Err(e),
		}
	}
}

impl AsRawFd for StopSignal {
	fn as_raw_fd(&self) -> RawFd {
		self.0.as_raw_fd()
	}
}

pub struct PollWaiter {
	fds: [libc::pollfd; 3],
	nfds: usize,
	_stop: Option<StopSignal>,
}

impl PollWaiter {
	pub fn new(fds: [RawFd; 2], stop: Option<StopSignal>) -> Self {
		let pollfd = |fd| libc::pollfd {
			fd,
			events: 0,
			revents: 0,
		};
		let stop_fd = stop.as_ref().map(|s| s.as_raw_fd()).unwrap_or(-1);
		Self {
			fds: [pollfd(fds[0]), pollfd(fds[1]), pollfd(stop_fd)],
			nfds: if stop.is_some() { 3 } else { 2 },
			_stop: stop,
		}
	}
}

impl Waiter for PollWaiter {
	fn wait(&mut self, interest: &[Interest; 2]) -> io::Result<Option<[Readiness; 2]>> {
		for (pfd, want) in self.fds.iter_mut().zip(interest.iter()) {
			pfd.events = 0;
			if want.readable {
				pfd.events |= libc::POLLIN;
			}
			if want.writable {
				pfd.events |= libc::POLLOUT;
			}
			pfd.revents = 0;
		}
		self.fds[2].events = libc::POLLIN;
		self.fds[2].revents = 0;

		let rc = unsafe { libc::poll(self.fds.as_mut_ptr(), self.nfds as libc::nfds_t, -1) };
		if rc < 0 {
			return Err(io::Error::last_os_error());
		}
		if self.nfds == 3 && self.fds[2].revents != 0 {
			return Ok(None);
		}

		let mut ready = [Readiness::default(); 2];
		for (r, pfd) in ready.iter_mut().zip(self.fds.iter()) {
			if pfd.revents & libc::POLLNVAL != 0 {
				return Err(io::Error::from_raw_os_error(libc::EBADF));
			}
			// an error condition alone is not readiness, only a failed poll is fatal
			if pfd.revents & libc::POLLERR != 0 {
				log::debug!("socket {} reported an error condition", pfd.fd);
			}
			r.readable = pfd.revents & libc::POLLIN != 0;
			r.writable = pfd.revents & libc::POLLOUT != 0;
		}
		Ok(Some(ready))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::net::UdpSocket;

	#[test]
	fn stop_request_wakes_the_waiter() {
		let (handle, signal) = stop_pair().unwrap();
		let (a, _a) = UnixStream::pair().unwrap();
		let (b, _b) = UnixStream::pair().unwrap();
		let mut waiter = PollWaiter::new([a.as_raw_fd(), b.as_raw_fd()], Some(signal));
		handle.stop().unwrap();
		handle.stop().unwrap();
		let interest = [Interest { readable: true, writable: false }; 2];
		assert_eq!(waiter.wait(&interest).unwrap(), None);
	}

	#[test]
	fn reports_readable_sockets() {
		let (a, mut peer) = UnixStream::pair().unwrap();
		let (b, _b) = UnixStream::pair().unwrap();
		peer.write_all(b"x").unwrap();
		let mut waiter = PollWaiter::new([a.as_raw_fd(), b.as_raw_fd()], None);
		let interest = [Interest { readable: true, writable: false }; 2];
		let ready = waiter.wait(&interest).unwrap().unwrap();
		assert!(ready[0].readable);
		assert!(!ready[1].any());
	}

	#[test]
	fn error_condition_is_not_readiness() {
		// a datagram to a closed port leaves ECONNREFUSED pending on the sender
		let closed = UdpSocket::bind("127.0.0.1:0").unwrap();
		let port = closed.local_addr().unwrap().port();
		drop(closed);
		let a = UdpSocket::bind("127.0.0.1:0").unwrap();
		a.connect(("127.0.0.1", port)).unwrap();
		a.send(b"x").unwrap();

		let (b, _b) = UnixStream::pair().unwrap();
		let mut waiter = PollWaiter::new([a.as_raw_fd(), b.as_raw_fd()], None);
		let interest = [Interest { readable: true, writable: false }; 2];
		let ready = waiter.wait(&interest).unwrap().unwrap();
		assert!(!ready[0].any());
		assert!(!ready[1].any());
	}
}
