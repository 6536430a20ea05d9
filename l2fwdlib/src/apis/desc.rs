//! The Desc structure is the unit that moves between rings
//!
//! It names a frame inside the UMEM by byte offset and carries the number of valid bytes.
//! Moving a `Desc` never touches the frame it points to.

use std::fmt;

/// Binary compatible with the kernel's `struct xdp_desc`
#[repr(C)]
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Desc {
	pub addr: u64,
	pub len: u32,
	pub options: u32,
}

impl Desc {
	#[inline]
	pub const fn new(addr: u64, len: u32) -> Self {
		Self {
			addr,
			len,
			options: 0,
		}
	}

	/// Index of the frame this descriptor points into
	#[inline]
	pub fn frame_index(&self, frame_size: u32) -> u64 {
		self.addr / frame_size as u64
	}

	/// Offset of the frame start, dropping any headroom the kernel added to `addr`
	#[inline]
	pub fn frame_addr(&self, frame_size: u32) -> u64 {
		self.frame_index(frame_size) * frame_size as u64
	}
}

impl fmt::Debug for Desc {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct(&format!("desc@{:#x}", self.addr))
			.field("len", &self.len)
			.field("options", &self.options)
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn layout_matches_xdp_desc() {
		assert_eq!(std::mem::size_of::<Desc>(), 16);
	}

	#[test]
	fn frame_addr_strips_headroom() {
		let d = Desc::new(3 * 2048 + 256, 64);
		assert_eq!(d.frame_index(2048), 3);
		assert_eq!(d.frame_addr(2048), 3 * 2048);
	}
}
