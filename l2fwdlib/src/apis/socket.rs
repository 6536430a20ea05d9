//! The XdpSocket struct binds a ring quartet to one (interface, queue)
//!
//! Sockets that share a UMEM across different devices or queues each need their own Fill and
//! Completion rings, so every socket sizes and maps all four. The first socket opened on a
//! UMEM reuses the registering socket, the others bind with `XDP_SHARED_UMEM`.

use std::{
	fmt, io, mem,
	os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd},
	ptr,
};

use super::{
	ring::{ConsRing, ProdRing, RingMmap, RingOffsets},
	Desc, FrameMemory, Link, SocketOptions, Umem, Wakeup, Xsk, XskError,
};

/// Definitions from `linux/if_xdp.h`
#[allow(non_camel_case_types)]
pub(crate) mod if_xdp {
	use super::{mem, RawFd, RingOffsets, XskError};

	pub const AF_XDP: libc::c_int = 44;
	pub const SOL_XDP: libc::c_int = 283;

	pub const XDP_SHARED_UMEM: u16 = 1 << 0;
	pub const XDP_USE_NEED_WAKEUP: u16 = 1 << 3;

	pub const XDP_MMAP_OFFSETS: libc::c_int = 1;
	pub const XDP_RX_RING: libc::c_int = 2;
	pub const XDP_TX_RING: libc::c_int = 3;
	pub const XDP_UMEM_REG: libc::c_int = 4;
	pub const XDP_UMEM_FILL_RING: libc::c_int = 5;
	pub const XDP_UMEM_COMPLETION_RING: libc::c_int = 6;

	pub const XDP_PGOFF_RX_RING: libc::off_t = 0;
	pub const XDP_PGOFF_TX_RING: libc::off_t = 0x8000_0000;
	pub const XDP_UMEM_PGOFF_FILL_RING: libc::off_t = 0x1_0000_0000;
	pub const XDP_UMEM_PGOFF_COMPLETION_RING: libc::off_t = 0x1_8000_0000;

	#[repr(C)]
	#[derive(Default, Debug)]
	pub struct xdp_umem_reg {
		pub addr: u64,
		pub len: u64,
		pub chunk_size: u32,
		pub headroom: u32,
		pub flags: u32,
		pub tx_metadata_len: u32,
	}

	#[repr(C)]
	#[derive(Default, Debug)]
	pub struct sockaddr_xdp {
		pub sxdp_family: u16,
		pub sxdp_flags: u16,
		pub sxdp_ifindex: u32,
		pub sxdp_queue_id: u32,
		pub sxdp_shared_umem_fd: u32,
	}

	#[repr(C)]
	#[derive(Default, Debug)]
	pub struct xdp_mmap_offsets {
		pub rx: RingOffsets,
		pub tx: RingOffsets,
		pub fr: RingOffsets,
		pub cr: RingOffsets,
	}

	pub fn setsockopt<T>(fd: RawFd, opt: libc::c_int, val: &T, op: &'static str) -> Result<(), XskError> {
		let rc = unsafe {
			libc::setsockopt(
				fd,
				SOL_XDP,
				opt,
				val as *const T as *const libc::c_void,
				mem::size_of::<T>() as libc::socklen_t,
			)
		};
		if rc != 0 {
			return Err(XskError::new(op));
		}
		Ok(())
	}

	pub fn mmap_offsets(fd: RawFd) -> Result<xdp_mmap_offsets, XskError> {
		let mut off = xdp_mmap_offsets::default();
		let mut len = mem::size_of::<xdp_mmap_offsets>() as libc::socklen_t;
		let rc = unsafe {
			libc::getsockopt(
				fd,
				SOL_XDP,
				XDP_MMAP_OFFSETS,
				&mut off as *mut _ as *mut libc::c_void,
				&mut len,
			)
		};
		if rc != 0 {
			return Err(XskError::new("get mmap offsets"));
		}
		Ok(off)
	}
}

pub struct XdpSocket {
	rx: ConsRing<Desc>,
	tx: ProdRing<Desc>,
	fill: ProdRing<u64>,
	completion: ConsRing<u64>,
	outstanding: usize,
	frame_size: u32,
	link: Link,
	fd: OwnedFd,
}

impl XdpSocket {
	pub fn open(umem: &mut Umem, link: &Link, opts: &SocketOptions) -> Result<Self, XskError> {
		let (fd, shared) = match umem.take_fd() {
			Some(fd) => (fd, false),
			None => {
				let fd = unsafe { libc::socket(if_xdp::AF_XDP, libc::SOCK_RAW | libc::SOCK_CLOEXEC, 0) };
				if fd < 0 {
					return Err(XskError::new("socket"));
				}
				(unsafe { OwnedFd::from_raw_fd(fd) }, true)
			}
		};
		let raw = fd.as_raw_fd();

		if_xdp::setsockopt(raw, if_xdp::XDP_UMEM_FILL_RING, &opts.fill_ring_num_descs, "size fill ring")?;
		if_xdp::setsockopt(
			raw,
			if_xdp::XDP_UMEM_COMPLETION_RING,
			&opts.completion_ring_num_descs,
			"size completion ring",
		)?;
		if_xdp::setsockopt(raw, if_xdp::XDP_RX_RING, &opts.rx_ring_num_descs, "size rx ring")?;
		if_xdp::setsockopt(raw, if_xdp::XDP_TX_RING, &opts.tx_ring_num_descs, "size tx ring")?;

		let off = if_xdp::mmap_offsets(raw)?;
		let rx = unsafe {
			let map = RingMmap::map(raw, off.rx.map_len::<Desc>(opts.rx_ring_num_descs), if_xdp::XDP_PGOFF_RX_RING)?;
			ConsRing::from_mmap(map, &off.rx, opts.rx_ring_num_descs)
		};
		let tx = unsafe {
			let map = RingMmap::map(raw, off.tx.map_len::<Desc>(opts.tx_ring_num_descs), if_xdp::XDP_PGOFF_TX_RING)?;
			ProdRing::from_mmap(map, &off.tx, opts.tx_ring_num_descs)
		};
		let fill = unsafe {
			let map = RingMmap::map(
				raw,
				off.fr.map_len::<u64>(opts.fill_ring_num_descs),
				if_xdp::XDP_UMEM_PGOFF_FILL_RING,
			)?;
			ProdRing::from_mmap(map, &off.fr, opts.fill_ring_num_descs)
		};
		let completion = unsafe {
			let map = RingMmap::map(
				raw,
				off.cr.map_len::<u64>(opts.completion_ring_num_descs),
				if_xdp::XDP_UMEM_PGOFF_COMPLETION_RING,
			)?;
			ConsRing::from_mmap(map, &off.cr, opts.completion_ring_num_descs)
		};

		// the kernel refuses need_wakeup together with a shared umem, the shared
		// socket inherits the mode of the socket that registered it
		let mut addr = if_xdp::sockaddr_xdp {
			sxdp_family: if_xdp::AF_XDP as u16,
			sxdp_ifindex: link.index,
			sxdp_queue_id: link.queue_id,
			..Default::default()
		};
		if shared {
			addr.sxdp_flags = if_xdp::XDP_SHARED_UMEM;
			addr.sxdp_shared_umem_fd = umem.fd() as u32;
		} else {
			addr.sxdp_flags = if_xdp::XDP_USE_NEED_WAKEUP;
		}
		let rc = unsafe {
			libc::bind(
				raw,
				&addr as *const _ as *const libc::sockaddr,
				mem::size_of::<if_xdp::sockaddr_xdp>() as libc::socklen_t,
			)
		};
		if rc != 0 {
			log::error!("failed to bind socket to {}", link);
			return Err(XskError::new("bind"));
		}
		log::info!("bound socket {} to {}{}", raw, link, if shared { " (shared umem)" } else { "" });

		Ok(Self {
			rx,
			tx,
			fill,
			completion,
			outstanding: 0,
			frame_size: umem.frame_size(),
			link: link.clone(),
			fd,
		})
	}

	#[inline]
	pub fn link(&self) -> &Link {
		&self.link
	}

	/// Asks the kernel to drain the Transmit ring, when it said it needs to be asked
	pub fn kick(&self) -> Result<(), XskError> {
		if !self.tx.needs_wakeup() {
			return Ok(());
		}
		let rc = unsafe {
			libc::sendto(
				self.fd.as_raw_fd(),
				ptr::null(),
				0,
				libc::MSG_DONTWAIT,
				ptr::null(),
				0,
			)
		};
		if rc >= 0 {
			return Ok(());
		}
		let err = io::Error::last_os_error();
		match err.raw_os_error() {
			// busy or out of buffers clears up by itself, the next wait kicks again
			Some(libc::EAGAIN) | Some(libc::EBUSY) | Some(libc::ENOBUFS) | Some(libc::ENETDOWN) => Ok(()),
			_ => Err(XskError::from_io("kick tx", err)),
		}
	}
}

impl Xsk for XdpSocket {
	#[inline]
	fn num_free_fill_slots(&mut self) -> usize {
		self.fill.free() as usize
	}

	fn fill(&mut self, descs: &[Desc]) -> usize {
		let frame_size = self.frame_size;
		self.fill.produce_map(descs, |d| d.frame_addr(frame_size))
	}

	#[inline]
	fn num_received(&mut self) -> usize {
		self.rx.available() as usize
	}

	fn receive(&mut self, n: usize, out: &mut Vec<Desc>) -> usize {
		self.rx.consume(n, out)
	}

	#[inline]
	fn num_transmitted(&self) -> usize {
		self.outstanding
	}

	fn transmit(&mut self, descs: &[Desc], wakeup: Wakeup) -> usize {
		let n = self.tx.produce(descs);
		self.outstanding += n;
		if n > 0 && wakeup == Wakeup::Kick {
			if let Err(e) = self.kick() {
				log::error!("{}: {}", self.link, e);
			}
		}
		n
	}

	#[inline]
	fn num_completed(&mut self) -> usize {
		self.completion.available() as usize
	}

	fn complete(&mut self, n: usize, out: &mut Vec<Desc>) -> usize {
		let frame_size = self.frame_size;
		let n = self.completion.consume_map(n, out, |addr| Desc::new(addr, frame_size));
		self.outstanding = self.outstanding.saturating_sub(n);
		n
	}

	#[inline]
	fn fd(&self) -> RawFd {
		self.fd.as_raw_fd()
	}
}

impl fmt::Debug for XdpSocket {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("XdpSocket")
			.field("fd", &self.fd.as_raw_fd())
			.field("link", &self.link)
			.field("outstanding", &self.outstanding)
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::if_xdp::*;
	use std::mem::size_of;

	#[test]
	fn abi_sizes() {
		assert_eq!(size_of::<xdp_umem_reg>(), 32);
		assert_eq!(size_of::<sockaddr_xdp>(), 16);
		assert_eq!(size_of::<xdp_mmap_offsets>(), 128);
	}
}
