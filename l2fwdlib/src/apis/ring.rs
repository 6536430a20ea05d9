//! This module defines the single producer / single consumer rings an AF_XDP socket shares
//! with the kernel
//!
//! Every ring is a power of two sized array of entries followed by (or preceded by, the kernel
//! decides through `XDP_MMAP_OFFSETS`) a producer index, a consumer index and a flags word.
//! Indices run freely and wrap, the slot is `index & mask`.
//!
//! The engine is the producer of Fill and Transmit and the consumer of Receive and Completion.

use std::{
	marker::PhantomData,
	os::unix::io::RawFd,
	ptr::{self, NonNull},
	sync::atomic::{AtomicU32, Ordering},
};

use super::XskError;

/// Set by the kernel in a ring's flags when it needs a syscall to make progress
pub const XDP_RING_NEED_WAKEUP: u32 = 1;

/// Where a ring's fields live relative to the start of its mapping
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RingOffsets {
	pub producer: u64,
	pub consumer: u64,
	pub desc: u64,
	pub flags: u64,
}

impl RingOffsets {
	/// Bytes to map for a ring of `entries` elements of `T`
	#[inline]
	pub fn map_len<T>(&self, entries: u32) -> usize {
		self.desc as usize + entries as usize * std::mem::size_of::<T>()
	}
}

/// A ring mapped out of a socket, unmapped on Drop
pub struct RingMmap {
	addr: NonNull<u8>,
	len: usize,
}

impl RingMmap {
	pub fn map(fd: RawFd, len: usize, page_offset: libc::off_t) -> Result<Self, XskError> {
		let addr = unsafe {
			libc::mmap(
				ptr::null_mut(),
				len,
				libc::PROT_READ | libc::PROT_WRITE,
				libc::MAP_SHARED | libc::MAP_POPULATE,
				fd,
				page_offset,
			)
		};
		if addr == libc::MAP_FAILED {
			return Err(XskError::new("mmap ring"));
		}
		let addr = NonNull::new(addr as *mut u8).ok_or(XskError::NoMem("mmap ring"))?;
		Ok(Self { addr, len })
	}

	#[inline]
	fn base(&self) -> *mut u8 {
		self.addr.as_ptr()
	}
}

impl Drop for RingMmap {
	fn drop(&mut self) {
		unsafe {
			libc::munmap(self.addr.as_ptr() as *mut libc::c_void, self.len);
		}
	}
}

/// The raw pieces shared by both ring ends
struct RingPtrs<T> {
	producer: *const AtomicU32,
	consumer: *const AtomicU32,
	flags: *const AtomicU32,
	entries: *mut T,
	size: u32,
	mask: u32,
}

impl<T> RingPtrs<T> {
	unsafe fn new(base: *mut u8, off: &RingOffsets, size: u32) -> Self {
		debug_assert!(size.is_power_of_two());
		Self {
			producer: base.add(off.producer as usize) as *const AtomicU32,
			consumer: base.add(off.consumer as usize) as *const AtomicU32,
			flags: base.add(off.flags as usize) as *const AtomicU32,
			entries: base.add(off.desc as usize) as *mut T,
			size,
			mask: size - 1,
		}
	}

	#[inline]
	fn producer(&self) -> &AtomicU32 {
		unsafe { &*self.producer }
	}

	#[inline]
	fn consumer(&self) -> &AtomicU32 {
		unsafe { &*self.consumer }
	}

	#[inline]
	fn slot(&self, idx: u32) -> *mut T {
		unsafe { self.entries.add((idx & self.mask) as usize) }
	}
}

/// The producing end of a ring, Fill (`u64` addresses) or Transmit (`Desc`)
pub struct ProdRing<T> {
	ptrs: RingPtrs<T>,
	cached_prod: u32,
	cached_cons: u32,
	_map: Option<RingMmap>,
	_marker: PhantomData<T>,
}

impl<T: Copy> ProdRing<T> {
	/// # Safety
	/// `map` must be a ring mapping of at least `off.map_len::<T>(size)` bytes.
	pub unsafe fn from_mmap(map: RingMmap, off: &RingOffsets, size: u32) -> Self {
		let mut ring = Self::from_raw(map.base(), off, size);
		ring._map = Some(map);
		ring
	}

	/// # Safety
	/// `base` must stay valid, and laid out as `off` says, for the life of the ring.
	pub unsafe fn from_raw(base: *mut u8, off: &RingOffsets, size: u32) -> Self {
		let ptrs = RingPtrs::new(base, off, size);
		let cached_prod = ptrs.producer().load(Ordering::Relaxed);
		let cached_cons = ptrs.consumer().load(Ordering::Acquire);
		Self {
			ptrs,
			cached_prod,
			cached_cons,
			_map: None,
			_marker: PhantomData,
		}
	}

	#[inline]
	pub fn size(&self) -> u32 {
		self.ptrs.size
	}

	/// Number of entries that can be produced right now
	pub fn free(&mut self) -> u32 {
		self.cached_cons = self.ptrs.consumer().load(Ordering::Acquire);
		self.ptrs.size - self.cached_prod.wrapping_sub(self.cached_cons)
	}

	/// Writes as many of `items` as fit, mapped through `f`, and publishes them
	pub fn produce_map<U, F>(&mut self, items: &[U], mut f: F) -> usize
	where
		F: FnMut(&U) -> T,
	{
		let n = (self.free() as usize).min(items.len());
		if n == 0 {
			return 0;
		}
		for (i, item) in items[..n].iter().enumerate() {
			let slot = self.ptrs.slot(self.cached_prod.wrapping_add(i as u32));
			unsafe { ptr::write_volatile(slot, f(item)) };
		}
		self.cached_prod = self.cached_prod.wrapping_add(n as u32);
		self.ptrs.producer().store(self.cached_prod, Ordering::Release);
		n
	}

	#[inline]
	pub fn produce(&mut self, items: &[T]) -> usize {
		self.produce_map(items, |t| *t)
	}

	#[inline]
	pub fn needs_wakeup(&self) -> bool {
		unsafe { &*self.ptrs.flags }.load(Ordering::Relaxed) & XDP_RING_NEED_WAKEUP != 0
	}
}

/// The consuming end of a ring, Receive (`Desc`) or Completion (`u64` addresses)
pub struct ConsRing<T> {
	ptrs: RingPtrs<T>,
	cached_prod: u32,
	cached_cons: u32,
	_map: Option<RingMmap>,
	_marker: PhantomData<T>,
}

impl<T: Copy> ConsRing<T> {
	/// # Safety
	/// `map` must be a ring mapping of at least `off.map_len::<T>(size)` bytes.
	pub unsafe fn from_mmap(map: RingMmap, off: &RingOffsets, size: u32) -> Self {
		let mut ring = Self::from_raw(map.base(), off, size);
		ring._map = Some(map);
		ring
	}

	/// # Safety
	/// `base` must stay valid, and laid out as `off` says, for the life of the ring.
	pub unsafe fn from_raw(base: *mut u8, off: &RingOffsets, size: u32) -> Self {
		let ptrs = RingPtrs::new(base, off, size);
		let cached_cons = ptrs.consumer().load(Ordering::Relaxed);
		let cached_prod = ptrs.producer().load(Ordering::Acquire);
		Self {
			ptrs,
			cached_prod,
			cached_cons,
			_map: None,
			_marker: PhantomData,
		}
	}

	#[inline]
	pub fn size(&self) -> u32 {
		self.ptrs.size
	}

	/// Number of entries ready to be consumed
	pub fn available(&mut self) -> u32 {
		self.cached_prod = self.ptrs.producer().load(Ordering::Acquire);
		self.cached_prod.wrapping_sub(self.cached_cons)
	}

	/// Reads up to `n` entries into `out`, mapped through `f`, and releases their slots
	pub fn consume_map<U, F>(&mut self, n: usize, out: &mut Vec<U>, mut f: F) -> usize
	where
		F: FnMut(T) -> U,
	{
		let n = (self.available() as usize).min(n);
		if n == 0 {
			return 0;
		}
		out.reserve(n);
		for i in 0..n {
			let slot = self.ptrs.slot(self.cached_cons.wrapping_add(i as u32));
			out.push(f(unsafe { ptr::read_volatile(slot) }));
		}
		self.cached_cons = self.cached_cons.wrapping_add(n as u32);
		self.ptrs.consumer().store(self.cached_cons, Ordering::Release);
		n
	}

	#[inline]
	pub fn consume(&mut self, n: usize, out: &mut Vec<T>) -> usize {
		self.consume_map(n, out, |t| t)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::Desc;

	const OFF: RingOffsets = RingOffsets {
		producer: 0,
		consumer: 8,
		flags: 16,
		desc: 64,
	};

	/// Heap backing laid out like a kernel ring, u64 words keep it aligned
	fn backing<T>(entries: u32) -> Vec<u64> {
		vec![0u64; OFF.map_len::<T>(entries) / 8 + 1]
	}

	fn kernel_index(mem: &mut [u64], word: usize) -> &AtomicU32 {
		unsafe { &*(mem.as_mut_ptr().add(word) as *const AtomicU32) }
	}

	#[test]
	fn producer_stops_at_capacity() {
		let mut mem = backing::<u64>(4);
		let mut fill = unsafe { ProdRing::<u64>::from_raw(mem.as_mut_ptr() as *mut u8, &OFF, 4) };
		assert_eq!(fill.free(), 4);
		assert_eq!(fill.produce(&[0, 2048, 4096, 6144, 8192]), 4);
		assert_eq!(fill.free(), 0);
		assert_eq!(fill.produce(&[8192]), 0);

		// kernel consumes two
		kernel_index(&mut mem, 1).store(2, Ordering::Release);
		assert_eq!(fill.free(), 2);
		assert_eq!(fill.produce(&[8192]), 1);
		assert_eq!(kernel_index(&mut mem, 0).load(Ordering::Acquire), 5);
	}

	#[test]
	fn consumer_reads_what_was_published() {
		let mut mem = backing::<Desc>(4);
		let base = mem.as_mut_ptr() as *mut u8;
		let mut kernel = unsafe { ProdRing::<Desc>::from_raw(base, &OFF, 4) };
		let mut rx = unsafe { ConsRing::<Desc>::from_raw(base, &OFF, 4) };
		assert_eq!(rx.available(), 0);

		kernel.produce(&[Desc::new(0, 60), Desc::new(2048, 1514)]);
		assert_eq!(rx.available(), 2);
		let mut out = Vec::new();
		assert_eq!(rx.consume(1, &mut out), 1);
		assert_eq!(out, vec![Desc::new(0, 60)]);
		assert_eq!(rx.consume(8, &mut out), 1);
		assert_eq!(out[1].len, 1514);
		assert_eq!(kernel.free(), 4);
	}

	#[test]
	fn indices_wrap() {
		let mut mem = backing::<u64>(2);
		let base = mem.as_mut_ptr() as *mut u8;
		kernel_index(&mut mem, 0).store(u32::MAX, Ordering::Relaxed);
		kernel_index(&mut mem, 1).store(u32::MAX, Ordering::Relaxed);
		let mut prod = unsafe { ProdRing::<u64>::from_raw(base, &OFF, 2) };
		let mut cons = unsafe { ConsRing::<u64>::from_raw(base, &OFF, 2) };
		assert_eq!(prod.produce(&[7, 9]), 2);
		let mut out = Vec::new();
		assert_eq!(cons.consume_map(2, &mut out, |a| a * 2), 2);
		assert_eq!(out, vec![14, 18]);
	}

	#[test]
	fn wakeup_flag_is_read_from_the_ring() {
		let mut mem = backing::<Desc>(2);
		let tx = unsafe { ProdRing::<Desc>::from_raw(mem.as_mut_ptr() as *mut u8, &OFF, 2) };
		assert!(!tx.needs_wakeup());
		kernel_index(&mut mem, 2).store(XDP_RING_NEED_WAKEUP, Ordering::Relaxed);
		assert!(tx.needs_wakeup());
	}
}
