//! An in-memory transport
//!
//! The UMEM is a heap buffer, each socket's four rings are plain queues, and the waiter plays
//! the kernel: on every wait it first transmits whatever sits on the Transmit rings (copying
//! the bytes out to the port's `sent` list and completing the descriptors) and then delivers
//! queued frames into Fill buffers and onto the Receive rings.
//!
//! A `Port` is the test's view of one interface. Everything the engine does through the
//! transport is appended to a shared trace of `Event`s.

use std::{
	cell::{RefCell, UnsafeCell},
	collections::{HashMap, VecDeque},
	io,
	os::unix::io::RawFd,
	rc::Rc,
};

use crate::apis::{
	Desc, FrameMemory, Interest, Link, Readiness, SocketOptions, Steering, Transport, Waiter, Wakeup, Xsk,
	XskError,
};

/// Things the engine did, in the order it did them
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
	ProgramCreated { ifindex: u32, entries: u32 },
	Attached(u32),
	Detached(u32),
	SocketOpened(u32),
	SocketClosed(u32),
	Registered { ifindex: u32, queue_id: u32 },
	Unregistered { ifindex: u32, queue_id: u32 },
	Filled { ifindex: u32, n: usize },
	Received { ifindex: u32, n: usize },
	Transmitted { ifindex: u32, n: usize },
	Completed { ifindex: u32, n: usize },
	Waited([Interest; 2]),
}

/// What the next wait does instead of looking at the rings
#[derive(Debug)]
enum Scripted {
	Fail(io::ErrorKind),
}

#[derive(Default)]
struct Shared {
	trace: Vec<Event>,
	ports: HashMap<u32, Rc<RefCell<PortState>>>,
	region: Option<Rc<Region>>,
	fail_registration: Vec<u32>,
	fail_attach: Vec<u32>,
	script: VecDeque<Scripted>,
	next_fd: RawFd,
}

/// The in-memory transport
#[derive(Clone, Default)]
pub struct Loopback {
	shared: Rc<RefCell<Shared>>,
}

impl Loopback {
	pub fn new() -> Self {
		Self::default()
	}

	/// The interface with index `ifindex`, created on first use
	pub fn port(&self, ifindex: u32) -> Port {
		let state = self
			.shared
			.borrow_mut()
			.ports
			.entry(ifindex)
			.or_insert_with(|| Rc::new(RefCell::new(PortState::new(ifindex))))
			.clone();
		Port { state }
	}

	/// Registering a socket on `ifindex` fails with EBUSY
	pub fn fail_registration_on(&self, ifindex: u32) {
		self.shared.borrow_mut().fail_registration.push(ifindex);
	}

	/// Attaching a program to `ifindex` fails with EOPNOTSUPP
	pub fn fail_attach_on(&self, ifindex: u32) {
		self.shared.borrow_mut().fail_attach.push(ifindex);
	}

	/// The next `times` waits are interrupted by a signal
	pub fn interrupt_waits(&self, times: usize) {
		let mut shared = self.shared.borrow_mut();
		for _ in 0..times {
			shared.script.push_back(Scripted::Fail(io::ErrorKind::Interrupted));
		}
	}

	/// The next wait fails with `kind` after any scripted interrupts
	pub fn fail_wait(&self, kind: io::ErrorKind) {
		self.shared.borrow_mut().script.push_back(Scripted::Fail(kind));
	}

	pub fn trace(&self) -> Vec<Event> {
		self.shared.borrow().trace.clone()
	}

	fn record(&self, event: Event) {
		self.shared.borrow_mut().trace.push(event);
	}
}

/// Heap memory handed out in frame sized pieces. A frame is only ever touched by whichever
/// side owns its descriptor at the time.
struct Region {
	bytes: UnsafeCell<Box<[u8]>>,
}

impl Region {
	fn new(len: usize) -> Self {
		Self {
			bytes: UnsafeCell::new(vec![0u8; len].into_boxed_slice()),
		}
	}

	/// # Safety
	/// No other live slice may overlap `[addr, addr + len)`.
	#[allow(clippy::mut_from_ref)]
	unsafe fn slice(&self, addr: u64, len: usize) -> Option<&mut [u8]> {
		let bytes = &mut *self.bytes.get();
		let start = usize::try_from(addr).ok()?;
		bytes.get_mut(start..start.checked_add(len)?)
	}
}

pub struct LoopbackUmem {
	region: Rc<Region>,
	frame_count: u32,
	frame_size: u32,
}

impl FrameMemory for LoopbackUmem {
	fn frame_count(&self) -> u32 {
		self.frame_count
	}

	fn frame_size(&self) -> u32 {
		self.frame_size
	}

	fn frame_mut(&mut self, desc: &Desc) -> Option<&mut [u8]> {
		unsafe { self.region.slice(desc.addr, desc.len as usize) }
	}
}

struct PortState {
	ifindex: u32,
	bound: Option<RawFd>,
	sizes: SocketOptions,
	fill: VecDeque<Desc>,
	rx: VecDeque<Desc>,
	tx: VecDeque<Desc>,
	completion: VecDeque<Desc>,
	outstanding: usize,
	arriving: VecDeque<Vec<u8>>,
	sent: Vec<Vec<u8>>,
	kicks: usize,
	overfills: usize,
}

impl PortState {
	fn new(ifindex: u32) -> Self {
		Self {
			ifindex,
			bound: None,
			sizes: SocketOptions::default(),
			fill: VecDeque::new(),
			rx: VecDeque::new(),
			tx: VecDeque::new(),
			completion: VecDeque::new(),
			outstanding: 0,
			arriving: VecDeque::new(),
			sent: Vec::new(),
			kicks: 0,
			overfills: 0,
		}
	}

	fn rings(&self) -> impl Iterator<Item = &Desc> {
		self.fill
			.iter()
			.chain(self.rx.iter())
			.chain(self.tx.iter())
			.chain(self.completion.iter())
	}

	/// Transmits the whole Transmit ring, as far as Completion has room
	fn drain_tx(&mut self, region: &Region) {
		while self.completion.len() < self.sizes.completion_ring_num_descs as usize {
			let Some(desc) = self.tx.pop_front() else { break };
			let bytes = unsafe { region.slice(desc.addr, desc.len as usize) }
				.map(|b| b.to_vec())
				.unwrap_or_default();
			self.sent.push(bytes);
			self.completion.push_back(desc);
		}
	}

	/// Delivers arriving frames into Fill buffers, as far as Receive has room
	fn deliver(&mut self, region: &Region, frame_size: u32) {
		while !self.arriving.is_empty() && self.rx.len() < self.sizes.rx_ring_num_descs as usize {
			let Some(buf) = self.fill.pop_front() else { break };
			let Some(frame) = self.arriving.pop_front() else { break };
			let len = frame.len().min(frame_size as usize);
			if let Some(dst) = unsafe { region.slice(buf.addr, len) } {
				dst.copy_from_slice(&frame[..len]);
			}
			self.rx.push_back(Desc::new(buf.addr, len as u32));
		}
	}
}

/// The test's handle on one interface
#[derive(Clone)]
pub struct Port {
	state: Rc<RefCell<PortState>>,
}

impl Port {
	/// Queues a frame to arrive on the interface
	pub fn deliver(&self, frame: &[u8]) {
		self.state.borrow_mut().arriving.push_back(frame.to_vec());
	}

	/// Frames sent out of the interface so far
	pub fn sent(&self) -> Vec<Vec<u8>> {
		self.state.borrow().sent.clone()
	}

	/// Frames queued to arrive that no Fill buffer has taken yet
	pub fn arriving(&self) -> usize {
		self.state.borrow().arriving.len()
	}

	pub fn is_bound(&self) -> bool {
		self.state.borrow().bound.is_some()
	}

	/// Descriptors sitting in any of the socket's four rings
	pub fn in_rings(&self) -> usize {
		self.state.borrow().rings().count()
	}

	/// Frame addresses sitting in any of the socket's four rings
	pub fn addrs_in_rings(&self) -> Vec<u64> {
		let state = self.state.borrow();
		let frame_size = state.sizes.frame_size;
		state.rings().map(|d| d.frame_addr(frame_size)).collect()
	}

	pub fn fill_len(&self) -> usize {
		self.state.borrow().fill.len()
	}

	/// Times the engine offered more Fill descriptors than there was room for
	pub fn overfills(&self) -> usize {
		self.state.borrow().overfills
	}

	pub fn kicks(&self) -> usize {
		self.state.borrow().kicks
	}
}

pub struct LoopbackXsk {
	fd: RawFd,
	port: Rc<RefCell<PortState>>,
	transport: Loopback,
}

impl LoopbackXsk {
	fn ifindex(&self) -> u32 {
		self.port.borrow().ifindex
	}
}

impl Xsk for LoopbackXsk {
	fn num_free_fill_slots(&mut self) -> usize {
		let port = self.port.borrow();
		port.sizes.fill_ring_num_descs as usize - port.fill.len()
	}

	fn fill(&mut self, descs: &[Desc]) -> usize {
		let free = self.num_free_fill_slots();
		let n = descs.len().min(free);
		{
			let mut port = self.port.borrow_mut();
			if descs.len() > free {
				port.overfills += 1;
			}
			port.fill.extend(descs[..n].iter().copied());
		}
		self.transport.record(Event::Filled {
			ifindex: self.ifindex(),
			n,
		});
		n
	}

	fn num_received(&mut self) -> usize {
		self.port.borrow().rx.len()
	}

	fn receive(&mut self, n: usize, out: &mut Vec<Desc>) -> usize {
		let n = {
			let mut port = self.port.borrow_mut();
			let n = n.min(port.rx.len());
			out.extend(port.rx.drain(..n));
			n
		};
		self.transport.record(Event::Received {
			ifindex: self.ifindex(),
			n,
		});
		n
	}

	fn num_transmitted(&self) -> usize {
		self.port.borrow().outstanding
	}

	fn transmit(&mut self, descs: &[Desc], wakeup: Wakeup) -> usize {
		let n = {
			let mut port = self.port.borrow_mut();
			let room = port.sizes.tx_ring_num_descs as usize - port.tx.len();
			let n = descs.len().min(room);
			port.tx.extend(descs[..n].iter().copied());
			port.outstanding += n;
			if wakeup == Wakeup::Kick {
				port.kicks += 1;
			}
			n
		};
		self.transport.record(Event::Transmitted {
			ifindex: self.ifindex(),
			n,
		});
		n
	}

	fn num_completed(&mut self) -> usize {
		self.port.borrow().completion.len()
	}

	fn complete(&mut self, n: usize, out: &mut Vec<Desc>) -> usize {
		let n = {
			let mut port = self.port.borrow_mut();
			let n = n.min(port.completion.len());
			out.extend(port.completion.drain(..n));
			port.outstanding -= n;
			n
		};
		self.transport.record(Event::Completed {
			ifindex: self.ifindex(),
			n,
		});
		n
	}

	fn fd(&self) -> RawFd {
		self.fd
	}
}

impl Drop for LoopbackXsk {
	fn drop(&mut self) {
		self.port.borrow_mut().bound = None;
		self.transport.record(Event::SocketClosed(self.ifindex()));
	}
}

pub struct LoopbackProgram {
	transport: Loopback,
	entries: u32,
	attached: Option<u32>,
	sockets: HashMap<u32, RawFd>,
}

impl Steering for LoopbackProgram {
	fn attach(&mut self, ifindex: u32) -> Result<(), XskError> {
		if self.transport.shared.borrow().fail_attach.contains(&ifindex) {
			return Err(XskError::NoSupport("attach xdp program"));
		}
		if self.attached.is_some() {
			return Err(XskError::Busy("attach xdp program"));
		}
		self.attached = Some(ifindex);
		self.transport.record(Event::Attached(ifindex));
		Ok(())
	}

	fn detach(&mut self, ifindex: u32) -> Result<(), XskError> {
		if self.attached != Some(ifindex) {
			return Err(XskError::Invalid("detach xdp program"));
		}
		self.attached = None;
		self.transport.record(Event::Detached(ifindex));
		Ok(())
	}

	fn register(&mut self, queue_id: u32, fd: RawFd) -> Result<(), XskError> {
		let ifindex = self.attached.ok_or(XskError::Invalid("register socket"))?;
		if self.transport.shared.borrow().fail_registration.contains(&ifindex) {
			return Err(XskError::Busy("register socket"));
		}
		if queue_id >= self.entries {
			return Err(XskError::Invalid("register socket"));
		}
		self.sockets.insert(queue_id, fd);
		self.transport.record(Event::Registered { ifindex, queue_id });
		Ok(())
	}

	fn unregister(&mut self, queue_id: u32) -> Result<(), XskError> {
		let ifindex = self.attached.ok_or(XskError::Invalid("unregister socket"))?;
		self.sockets
			.remove(&queue_id)
			.ok_or(XskError::Invalid("unregister socket"))?;
		self.transport.record(Event::Unregistered { ifindex, queue_id });
		Ok(())
	}
}

/// Plays the kernel on every wait. Reports a stop once nothing could ever become ready.
pub struct LoopbackWaiter {
	ports: [Rc<RefCell<PortState>>; 2],
	region: Rc<Region>,
	frame_size: u32,
	transport: Loopback,
}

impl Waiter for LoopbackWaiter {
	fn wait(&mut self, interest: &[Interest; 2]) -> io::Result<Option<[Readiness; 2]>> {
		self.transport.record(Event::Waited(*interest));
		if let Some(Scripted::Fail(kind)) = self.transport.shared.borrow_mut().script.pop_front() {
			return Err(io::Error::from(kind));
		}

		let mut ready = [Readiness::default(); 2];
		for ((port, want), r) in self.ports.iter().zip(interest.iter()).zip(ready.iter_mut()) {
			let mut port = port.borrow_mut();
			port.drain_tx(&self.region);
			port.deliver(&self.region, self.frame_size);
			r.readable = want.readable && !port.rx.is_empty();
			// POLLOUT: room on the Transmit ring
			r.writable = want.writable && port.tx.len() < port.sizes.tx_ring_num_descs as usize;
		}
		if ready.iter().any(Readiness::any) {
			Ok(Some(ready))
		} else {
			Ok(None)
		}
	}
}

impl Transport for Loopback {
	type Umem = LoopbackUmem;
	type Socket = LoopbackXsk;
	type Program = LoopbackProgram;
	type Waiter = LoopbackWaiter;

	fn create_umem(&mut self, opts: &SocketOptions) -> Result<LoopbackUmem, XskError> {
		opts.check()?;
		let region = Rc::new(Region::new(opts.umem_len()));
		self.shared.borrow_mut().region = Some(region.clone());
		Ok(LoopbackUmem {
			region,
			frame_count: opts.num_frames,
			frame_size: opts.frame_size,
		})
	}

	fn new_program(&mut self, link: &Link, entries: u32) -> Result<LoopbackProgram, XskError> {
		self.record(Event::ProgramCreated {
			ifindex: link.index,
			entries,
		});
		Ok(LoopbackProgram {
			transport: self.clone(),
			entries,
			attached: None,
			sockets: HashMap::new(),
		})
	}

	fn open_socket(
		&mut self,
		_umem: &mut LoopbackUmem,
		link: &Link,
		opts: &SocketOptions,
	) -> Result<LoopbackXsk, XskError> {
		let port = self.port(link.index).state;
		if port.borrow().bound.is_some() {
			return Err(XskError::Busy("bind"));
		}
		let fd = {
			let mut shared = self.shared.borrow_mut();
			shared.next_fd += 1;
			100 + shared.next_fd
		};
		{
			let mut state = port.borrow_mut();
			state.bound = Some(fd);
			state.sizes = *opts;
		}
		self.record(Event::SocketOpened(link.index));
		Ok(LoopbackXsk {
			fd,
			port,
			transport: self.clone(),
		})
	}

	fn waiter(&mut self, fds: [RawFd; 2]) -> Result<LoopbackWaiter, XskError> {
		let shared = self.shared.borrow();
		let region = shared.region.clone().ok_or(XskError::Invalid("waiter before umem"))?;
		let find = |fd: RawFd| {
			shared
				.ports
				.values()
				.find(|p| p.borrow().bound == Some(fd))
				.cloned()
				.ok_or(XskError::Invalid("waiter on an unbound fd"))
		};
		let ports = [find(fds[0])?, find(fds[1])?];
		let frame_size = ports[0].borrow().sizes.frame_size;
		Ok(LoopbackWaiter {
			ports,
			region,
			frame_size,
			transport: self.clone(),
		})
	}
}
