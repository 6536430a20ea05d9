//! The Umem struct owns the packet buffer region both sockets of a pair receive into and
//! transmit from
//!
//! The region is an anonymous private mapping registered with the kernel through the first
//! AF_XDP socket. That socket is handed over to the first `XdpSocket` opened on the UMEM,
//! every later socket binds with `XDP_SHARED_UMEM` and points back at it.

use std::{
	fmt,
	os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd},
	ptr::{self, NonNull},
	slice,
};

use super::{socket::if_xdp, Desc, FrameMemory, SocketOptions, XskError};

pub struct Umem {
	area: NonNull<u8>,
	len: usize,
	frame_count: u32,
	frame_size: u32,
	fd: Option<OwnedFd>,
	raw_fd: RawFd,
}

impl Umem {
	pub fn new(opts: &SocketOptions) -> Result<Self, XskError> {
		opts.check()?;
		let len = opts.umem_len();
		let area = unsafe {
			libc::mmap(
				ptr::null_mut(),
				len,
				libc::PROT_READ | libc::PROT_WRITE,
				libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_POPULATE,
				-1,
				0,
			)
		};
		if area == libc::MAP_FAILED {
			log::error!("could not map {} bytes for the umem", len);
			return Err(XskError::new("mmap umem"));
		}
		let area = NonNull::new(area as *mut u8).ok_or(XskError::NoMem("mmap umem"))?;
		// from here on Drop unmaps the area whatever fails next
		let mut umem = Self {
			area,
			len,
			frame_count: opts.num_frames,
			frame_size: opts.frame_size,
			fd: None,
			raw_fd: -1,
		};

		let fd = unsafe { libc::socket(if_xdp::AF_XDP, libc::SOCK_RAW | libc::SOCK_CLOEXEC, 0) };
		if fd < 0 {
			return Err(XskError::new("socket"));
		}
		let fd = unsafe { OwnedFd::from_raw_fd(fd) };

		let reg = if_xdp::xdp_umem_reg {
			addr: umem.area.as_ptr() as u64,
			len: len as u64,
			chunk_size: opts.frame_size,
			..Default::default()
		};
		if_xdp::setsockopt(fd.as_raw_fd(), if_xdp::XDP_UMEM_REG, &reg, "register umem")?;

		umem.raw_fd = fd.as_raw_fd();
		umem.fd = Some(fd);
		log::info!(
			"created umem: {} frames of {} bytes",
			umem.frame_count,
			umem.frame_size
		);
		Ok(umem)
	}

	/// The socket the region was registered through
	#[inline]
	pub fn fd(&self) -> RawFd {
		self.raw_fd
	}

	/// Hands the registering socket to the first `XdpSocket` built on this UMEM.
	/// Returns None once it has been taken.
	pub(crate) fn take_fd(&mut self) -> Option<OwnedFd> {
		self.fd.take()
	}
}

impl FrameMemory for Umem {
	#[inline]
	fn frame_count(&self) -> u32 {
		self.frame_count
	}

	#[inline]
	fn frame_size(&self) -> u32 {
		self.frame_size
	}

	fn frame_mut(&mut self, desc: &Desc) -> Option<&mut [u8]> {
		let start = usize::try_from(desc.addr).ok()?;
		let end = start.checked_add(desc.len as usize)?;
		if end > self.len {
			return None;
		}
		Some(unsafe { slice::from_raw_parts_mut(self.area.as_ptr().add(start), desc.len as usize) })
	}
}

impl Drop for Umem {
	fn drop(&mut self) {
		if unsafe { libc::munmap(self.area.as_ptr() as *mut libc::c_void, self.len) } != 0 {
			log::error!("failed to unmap umem: {}", std::io::Error::last_os_error());
		}
	}
}

impl fmt::Debug for Umem {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct(&format!("umem@{:p}", self.area))
			.field("frames", &self.frame_count)
			.field("frame_size", &self.frame_size)
			.field("fd", &self.raw_fd)
			.finish()
	}
}
