//! The forwarding engine
//!
//! Two sockets share one UMEM. Frames received on either socket get their Ethernet
//! destination rewritten in place and go out the other socket's Transmit ring. Completed
//! transmits come back to a single free list which feeds both Fill rings.
//!
//! Every frame is owned by exactly one of: the free list, a Fill, Receive, Transmit or
//! Completion ring of either socket, or the engine for the length of one dispatch step.

mod mutator;
mod stats;

pub use mutator::*;
pub use stats::*;

use pnet::util::MacAddr;
use std::{io, mem, os::unix::io::RawFd, sync::Arc};
use thiserror::Error;

use crate::apis::{
	Desc, FramePool, FrameMemory, Interest, Link, Readiness, SocketOptions, Steering, Transport, Waiter,
	Wakeup, Xsk, XskError,
};

const INPUT: usize = 0;
const OUTPUT: usize = 1;

#[derive(Error, Debug)]
pub enum ForwardError {
	#[error("setting up {context}")]
	Setup {
		context: String,
		#[source]
		source: XskError,
	},
	#[error("registering the socket on {link}")]
	Registration {
		link: String,
		#[source]
		source: XskError,
	},
	#[error("waiting for socket readiness")]
	Wait(#[source] io::Error),
}

impl ForwardError {
	fn setup(context: impl Into<String>) -> impl FnOnce(XskError) -> Self {
		let context = context.into();
		move |source| ForwardError::Setup { context, source }
	}
}

/// Everything a forwarding pair is built from
#[derive(Clone, Debug)]
pub struct Config {
	pub input: Link,
	/// Written into frames going from input to output
	pub input_dst: MacAddr,
	pub output: Link,
	/// Written into frames going from output to input
	pub output_dst: MacAddr,
	pub options: SocketOptions,
}

/// A redirect program attached to one interface, with a socket maybe registered in its map.
/// Dropping it unregisters the socket and then detaches the program.
pub struct AttachedProgram<P: Steering> {
	program: P,
	link: Link,
	registered: bool,
}

impl<P: Steering> AttachedProgram<P> {
	pub fn attach(mut program: P, link: &Link) -> Result<Self, XskError> {
		program.attach(link.index)?;
		Ok(Self {
			program,
			link: link.clone(),
			registered: false,
		})
	}

	pub fn register(&mut self, fd: RawFd) -> Result<(), XskError> {
		self.program.register(self.link.queue_id, fd)?;
		self.registered = true;
		log::info!("registered socket {} on {}", fd, self.link);
		Ok(())
	}

	#[inline]
	pub fn link(&self) -> &Link {
		&self.link
	}
}

impl<P: Steering> Drop for AttachedProgram<P> {
	fn drop(&mut self) {
		if self.registered {
			if let Err(e) = self.program.unregister(self.link.queue_id) {
				log::error!("failed to unregister socket on {}: {}", self.link, e);
			}
		}
		if let Err(e) = self.program.detach(self.link.index) {
			log::error!("failed to detach program from {}: {}", self.link, e);
		}
	}
}

/// Two sockets, the UMEM they share and the free list of that UMEM
pub struct ForwardingPair<X: Xsk, M: FrameMemory> {
	sockets: [X; 2],
	umem: M,
	pool: FramePool,
	dst: [MacAddr; 2],
	counters: Arc<Counters>,
	batch: Vec<Desc>,
}

impl<X: Xsk, M: FrameMemory> ForwardingPair<X, M> {
	pub fn new(sockets: [X; 2], umem: M, dst: [MacAddr; 2], counters: Arc<Counters>) -> Self {
		let pool = FramePool::new(umem.frame_count(), umem.frame_size());
		Self {
			batch: Vec::with_capacity(pool.total()),
			sockets,
			umem,
			pool,
			dst,
			counters,
		}
	}

	/// Tops up both Fill rings from the free list, input first
	pub fn replenish(&mut self) {
		let mut batch = mem::take(&mut self.batch);
		for socket in self.sockets.iter_mut() {
			let n = socket.num_free_fill_slots().min(self.pool.len());
			if n == 0 {
				continue;
			}
			batch.clear();
			self.pool.take(n, &mut batch);
			let filled = socket.fill(&batch);
			if filled < batch.len() {
				self.pool.put(&batch[filled..]);
			}
		}
		batch.clear();
		self.batch = batch;
	}

	/// Receive readiness always, transmit readiness only while transmits are outstanding
	pub fn interest(&self) -> [Interest; 2] {
		let interest = |s: &X| Interest {
			readable: true,
			writable: s.num_transmitted() > 0,
		};
		[interest(&self.sockets[INPUT]), interest(&self.sockets[OUTPUT])]
	}

	/// Moves everything received on `from` to the Transmit ring of `to`
	pub fn forward(&mut self, from: usize, to: usize) -> usize {
		let n = self.sockets[from].num_received();
		if n == 0 {
			return 0;
		}
		let mut batch = mem::take(&mut self.batch);
		batch.clear();
		let n = self.sockets[from].receive(n, &mut batch);

		// only rewritten frames may reach the Transmit ring
		let dst = self.dst[from];
		let (umem, pool) = (&mut self.umem, &mut self.pool);
		batch.retain(|desc| match umem.frame_mut(desc) {
			Some(frame) => {
				replace_dst_mac(frame, dst);
				true
			}
			None => {
				log::debug!("{:?} lies outside the umem", desc);
				pool.put(std::slice::from_ref(desc));
				false
			}
		});

		let sent = self.sockets[to].transmit(&batch, Wakeup::Defer);
		let bytes = batch[..sent].iter().map(|d| d.len as u64).sum();
		self.counters.add(bytes, sent as u64);
		if sent < batch.len() {
			self.pool.put(&batch[sent..]);
		}
		if sent < n {
			self.counters.add_dropped((n - sent) as u64);
		}
		#[cfg(feature = "debug")]
		println!("forwarded {} of {} frames {} -> {}", sent, n, from, to);

		batch.clear();
		self.batch = batch;
		n
	}

	/// Returns completed transmits of `socket` to the free list
	pub fn reclaim(&mut self, socket: usize) -> usize {
		let n = self.sockets[socket].num_completed();
		if n == 0 {
			return 0;
		}
		let mut batch = mem::take(&mut self.batch);
		batch.clear();
		let n = self.sockets[socket].complete(n, &mut batch);
		self.pool.put(&batch);
		batch.clear();
		self.batch = batch;
		n
	}

	/// Input receive, input completion, output receive, output completion
	pub fn dispatch(&mut self, ready: &[Readiness; 2]) {
		if ready[INPUT].readable {
			self.forward(INPUT, OUTPUT);
		}
		if ready[INPUT].writable {
			self.reclaim(INPUT);
		}
		if ready[OUTPUT].readable {
			self.forward(OUTPUT, INPUT);
		}
		if ready[OUTPUT].writable {
			self.reclaim(OUTPUT);
		}
	}

	#[inline]
	pub fn sockets(&self) -> &[X; 2] {
		&self.sockets
	}

	#[inline]
	pub fn pool(&self) -> &FramePool {
		&self.pool
	}

	#[inline]
	pub fn umem(&self) -> &M {
		&self.umem
	}

	#[inline]
	pub fn counters(&self) -> &Arc<Counters> {
		&self.counters
	}

	pub fn fds(&self) -> [RawFd; 2] {
		[self.sockets[INPUT].fd(), self.sockets[OUTPUT].fd()]
	}
}

/// The outcome of one event loop iteration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
	Dispatched,
	Stopped,
}

/// A forwarding pair attached to both of its interfaces, ready to run
///
/// Fields drop in order, so the output registration and program go first, then the input's,
/// then the sockets and the UMEM.
pub struct Forwarder<T: Transport> {
	output: AttachedProgram<T::Program>,
	input: AttachedProgram<T::Program>,
	pair: ForwardingPair<T::Socket, T::Umem>,
	waiter: T::Waiter,
}

impl<T: Transport> Forwarder<T> {
	/// Builds the UMEM, then for input and output in turn: loads and attaches a program,
	/// opens a socket and registers it. Whatever was acquired is released if a later step fails.
	pub fn setup(transport: &mut T, cfg: &Config, counters: Arc<Counters>) -> Result<Self, ForwardError> {
		cfg.options.check().map_err(ForwardError::setup("socket options"))?;
		let mut umem = transport
			.create_umem(&cfg.options)
			.map_err(ForwardError::setup("umem"))?;

		let (input, input_socket) = Self::bring_up(transport, &mut umem, &cfg.input, &cfg.options)?;
		let (output, output_socket) = Self::bring_up(transport, &mut umem, &cfg.output, &cfg.options)?;

		let pair = ForwardingPair::new(
			[input_socket, output_socket],
			umem,
			[cfg.input_dst, cfg.output_dst],
			counters,
		);
		let waiter = transport
			.waiter(pair.fds())
			.map_err(ForwardError::setup("readiness wait"))?;

		Ok(Self {
			output,
			input,
			pair,
			waiter,
		})
	}

	fn bring_up(
		transport: &mut T,
		umem: &mut T::Umem,
		link: &Link,
		opts: &SocketOptions,
	) -> Result<(AttachedProgram<T::Program>, T::Socket), ForwardError> {
		let program = transport
			.new_program(link, link.queue_id + 1)
			.map_err(ForwardError::setup(format!("program for {}", link)))?;
		let mut program =
			AttachedProgram::attach(program, link).map_err(ForwardError::setup(format!("program for {}", link)))?;
		let socket = transport
			.open_socket(umem, link, opts)
			.map_err(ForwardError::setup(format!("socket on {}", link)))?;
		program
			.register(socket.fd())
			.map_err(|source| ForwardError::Registration {
				link: link.to_string(),
				source,
			})?;
		Ok((program, socket))
	}

	/// One iteration: replenish, wait, dispatch
	pub fn step(&mut self) -> Result<Step, ForwardError> {
		self.pair.replenish();
		let interest = self.pair.interest();
		let ready = loop {
			match self.waiter.wait(&interest) {
				Ok(Some(ready)) => break ready,
				Ok(None) => return Ok(Step::Stopped),
				Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
				Err(e) => return Err(ForwardError::Wait(e)),
			}
		};
		#[cfg(feature = "debug")]
		println!("ready: {:?}", ready);
		self.pair.dispatch(&ready);
		Ok(Step::Dispatched)
	}

	/// Runs until a stop is requested or the wait fails
	pub fn run(&mut self) -> Result<(), ForwardError> {
		log::info!(
			"forwarding between {} and {}",
			self.input.link(),
			self.output.link()
		);
		while self.step()? == Step::Dispatched {}
		log::info!("stop requested");
		Ok(())
	}

	#[inline]
	pub fn pair(&self) -> &ForwardingPair<T::Socket, T::Umem> {
		&self.pair
	}
}

/// Sets up a forwarding pair as `cfg` describes and runs it until stopped.
/// Every program and registration is released before this returns.
pub fn forward_l2<T: Transport>(transport: &mut T, cfg: &Config, counters: Arc<Counters>) -> Result<(), ForwardError> {
	let mut forwarder = Forwarder::setup(transport, cfg, counters)?;
	forwarder.run()
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::VecDeque;

	const FRAME: u32 = 2048;

	/// Heap frames, one of which cannot be resolved
	struct Memory {
		bytes: Vec<u8>,
		unresolvable: u64,
	}

	impl FrameMemory for Memory {
		fn frame_count(&self) -> u32 {
			(self.bytes.len() / FRAME as usize) as u32
		}

		fn frame_size(&self) -> u32 {
			FRAME
		}

		fn frame_mut(&mut self, desc: &Desc) -> Option<&mut [u8]> {
			if desc.frame_addr(FRAME) == self.unresolvable {
				return None;
			}
			let start = desc.addr as usize;
			self.bytes.get_mut(start..start + desc.len as usize)
		}
	}

	/// Every Fill buffer comes straight back as a 64 byte frame on Receive
	struct Socket {
		rx: VecDeque<Desc>,
		tx: Vec<Desc>,
		tx_room: usize,
	}

	impl Socket {
		fn new(tx_room: usize) -> Self {
			Self {
				rx: VecDeque::new(),
				tx: Vec::new(),
				tx_room,
			}
		}
	}

	impl Xsk for Socket {
		fn num_free_fill_slots(&mut self) -> usize {
			8
		}

		fn fill(&mut self, descs: &[Desc]) -> usize {
			self.rx.extend(descs.iter().map(|d| Desc::new(d.addr, 64)));
			descs.len()
		}

		fn num_received(&mut self) -> usize {
			self.rx.len()
		}

		fn receive(&mut self, n: usize, out: &mut Vec<Desc>) -> usize {
			let n = n.min(self.rx.len());
			out.extend(self.rx.drain(..n));
			n
		}

		fn num_transmitted(&self) -> usize {
			self.tx.len()
		}

		fn transmit(&mut self, descs: &[Desc], _wakeup: Wakeup) -> usize {
			let n = descs.len().min(self.tx_room - self.tx.len());
			self.tx.extend_from_slice(&descs[..n]);
			n
		}

		fn num_completed(&mut self) -> usize {
			0
		}

		fn complete(&mut self, _n: usize, _out: &mut Vec<Desc>) -> usize {
			0
		}

		fn fd(&self) -> RawFd {
			-1
		}
	}

	fn pair(tx_room: usize) -> ForwardingPair<Socket, Memory> {
		let memory = Memory {
			bytes: vec![0; 4 * FRAME as usize],
			unresolvable: FRAME as u64,
		};
		let dst = [MacAddr::new(2, 0, 0, 0, 0, 1), MacAddr::new(2, 0, 0, 0, 0, 2)];
		ForwardingPair::new([Socket::new(16), Socket::new(tx_room)], memory, dst, Counters::new())
	}

	#[test]
	fn unresolvable_frames_are_dropped_not_transmitted() {
		let mut pair = pair(16);
		pair.replenish();
		assert_eq!(pair.pool().len(), 0);

		assert_eq!(pair.forward(INPUT, OUTPUT), 4);

		let tx = &pair.sockets()[OUTPUT].tx;
		assert_eq!(tx.len(), 3);
		assert!(tx.iter().all(|d| d.addr != FRAME as u64));
		for d in tx.iter() {
			let start = d.addr as usize;
			assert_eq!(&pair.umem().bytes[start..start + 6], &[2, 0, 0, 0, 0, 1]);
		}
		let freed: Vec<u64> = pair.pool().iter().map(|d| d.addr).collect();
		assert_eq!(freed, vec![FRAME as u64]);

		let s = pair.counters().sample();
		assert_eq!((s.frames, s.bytes, s.dropped), (3, 3 * 64, 1));
	}

	#[test]
	fn unresolvable_and_overflowing_frames_both_return_to_the_pool() {
		let mut pair = pair(2);
		pair.replenish();

		assert_eq!(pair.forward(INPUT, OUTPUT), 4);

		assert_eq!(pair.sockets()[OUTPUT].tx.len(), 2);
		assert_eq!(pair.pool().len(), 2);
		assert!(pair.pool().iter().any(|d| d.addr == FRAME as u64));
		let s = pair.counters().sample();
		assert_eq!((s.frames, s.dropped), (2, 2));
	}
}
