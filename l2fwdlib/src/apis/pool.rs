//! The FramePool is the engine's list of UMEM frames that no ring currently owns
//!
//! Both sockets of a pair draw fill descriptors from the same pool and return completed
//! transmits to it, so a frame received on one interface may next be filled on the other.

use super::Desc;

pub struct FramePool {
	free: Vec<Desc>,
	total: usize,
	frame_size: u32,
}

impl FramePool {
	/// Creates a pool in which every frame of the UMEM is free
	pub fn new(num_frames: u32, frame_size: u32) -> Self {
		let free = (0..num_frames as u64)
			.rev()
			.map(|i| Desc::new(i * frame_size as u64, frame_size))
			.collect::<Vec<_>>();
		Self {
			total: free.len(),
			free,
			frame_size,
		}
	}

	/// Number of frames currently free
	#[inline]
	pub fn len(&self) -> usize {
		self.free.len()
	}

	#[inline]
	pub fn is_empty(&self) -> bool {
		self.free.is_empty()
	}

	/// Number of frames in the UMEM
	#[inline]
	pub fn total(&self) -> usize {
		self.total
	}

	/// Moves up to `n` free frames into `out` and returns how many were moved
	pub fn take(&mut self, n: usize, out: &mut Vec<Desc>) -> usize {
		let n = n.min(self.free.len());
		let at = self.free.len() - n;
		out.extend(self.free.drain(at..));
		n
	}

	/// Returns frames to the pool
	///
	/// Length and kernel headroom are reset so the frame comes back whole.
	pub fn put(&mut self, descs: &[Desc]) {
		debug_assert!(
			self.free.len() + descs.len() <= self.total,
			"frame returned to the pool twice"
		);
		let frame_size = self.frame_size;
		self.free
			.extend(descs.iter().map(|d| Desc::new(d.frame_addr(frame_size), frame_size)));
	}

	/// Iterates the free frames
	pub fn iter(&self) -> impl Iterator<Item = &Desc> {
		self.free.iter()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn take_is_bounded_by_free_frames() {
		let mut pool = FramePool::new(8, 2048);
		let mut out = Vec::new();
		assert_eq!(pool.take(5, &mut out), 5);
		assert_eq!(pool.take(5, &mut out), 3);
		assert!(pool.is_empty());
		assert_eq!(out.len(), 8);
		assert_eq!(out[0].addr, 4 * 2048);
	}

	#[test]
	fn put_restores_whole_frames() {
		let mut pool = FramePool::new(2, 2048);
		let mut out = Vec::new();
		pool.take(2, &mut out);
		pool.put(&[Desc::new(2048 + 256, 60)]);
		let back = pool.iter().next().copied().unwrap();
		assert_eq!(back, Desc::new(2048, 2048));
		assert_eq!(pool.len(), 1);
		assert_eq!(pool.total(), 2);
	}
}
