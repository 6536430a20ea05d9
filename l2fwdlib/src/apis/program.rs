//! The XdpProgram struct is the redirect program that steers an interface queue into an
//! AF_XDP socket
//!
//! The program is tiny and assembled in place: look up the receive queue index in an XSKMAP
//! and redirect there, passing the frame up the stack when the queue has no socket. It is
//! loaded and attached with raw `bpf(2)` calls. Attachment goes through a BPF link, so closing
//! the link detaches the program.

use std::{
	fmt, mem,
	os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd},
};

use super::{Steering, XskError};

const BPF_MAP_CREATE: libc::c_long = 0;
const BPF_MAP_UPDATE_ELEM: libc::c_long = 2;
const BPF_MAP_DELETE_ELEM: libc::c_long = 3;
const BPF_PROG_LOAD: libc::c_long = 5;
const BPF_LINK_CREATE: libc::c_long = 28;

const BPF_MAP_TYPE_XSKMAP: u32 = 17;
const BPF_PROG_TYPE_XDP: u32 = 6;
const BPF_XDP: u32 = 37;
const BPF_ANY: u64 = 0;
const BPF_PSEUDO_MAP_FD: u8 = 1;

const XDP_PASS: i32 = 2;
const BPF_FUNC_REDIRECT_MAP: i32 = 51;
/// Offset of `rx_queue_index` in `struct xdp_md`
const XDP_MD_RX_QUEUE_INDEX: i16 = 16;

const LICENSE: &[u8] = b"GPL\0";
const LOG_SIZE: usize = 64 * 1024;

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct BpfInsn {
	code: u8,
	regs: u8,
	off: i16,
	imm: i32,
}

impl BpfInsn {
	const fn new(code: u8, dst: u8, src: u8, off: i16, imm: i32) -> Self {
		Self {
			code,
			regs: (src << 4) | dst,
			off,
			imm,
		}
	}
}

#[repr(C)]
#[derive(Default)]
struct MapCreateAttr {
	map_type: u32,
	key_size: u32,
	value_size: u32,
	max_entries: u32,
	map_flags: u32,
	inner_map_fd: u32,
	numa_node: u32,
	map_name: [u8; 16],
}

#[repr(C)]
#[derive(Default)]
struct MapElemAttr {
	map_fd: u32,
	_pad: u32,
	key: u64,
	value: u64,
	flags: u64,
}

#[repr(C)]
#[derive(Default)]
struct ProgLoadAttr {
	prog_type: u32,
	insn_cnt: u32,
	insns: u64,
	license: u64,
	log_level: u32,
	log_size: u32,
	log_buf: u64,
	kern_version: u32,
	prog_flags: u32,
	prog_name: [u8; 16],
	prog_ifindex: u32,
	expected_attach_type: u32,
}

#[repr(C)]
#[derive(Default)]
struct LinkCreateAttr {
	prog_fd: u32,
	target_ifindex: u32,
	attach_type: u32,
	flags: u32,
}

fn bpf<T>(cmd: libc::c_long, attr: &mut T) -> libc::c_long {
	unsafe {
		libc::syscall(
			libc::SYS_bpf,
			cmd,
			attr as *mut T as *mut libc::c_void,
			mem::size_of::<T>() as libc::c_uint,
		)
	}
}

fn name16(name: &str) -> [u8; 16] {
	let mut out = [0u8; 16];
	let n = name.len().min(15);
	out[..n].copy_from_slice(&name.as_bytes()[..n]);
	out
}

/// Kernels before 5.11 charge maps and programs against RLIMIT_MEMLOCK
fn raise_memlock() {
	let rlim = libc::rlimit {
		rlim_cur: libc::RLIM_INFINITY,
		rlim_max: libc::RLIM_INFINITY,
	};
	if unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) } != 0 {
		log::debug!("could not lift RLIMIT_MEMLOCK: {}", std::io::Error::last_os_error());
	}
}

/// `r2 = ctx->rx_queue_index; return bpf_redirect_map(&xsks_map, r2, XDP_PASS);`
fn redirect_insns(map_fd: RawFd) -> [BpfInsn; 6] {
	[
		BpfInsn::new(0x61, 2, 1, XDP_MD_RX_QUEUE_INDEX, 0), // ldxw r2, [r1 + 16]
		BpfInsn::new(0x18, 1, BPF_PSEUDO_MAP_FD, 0, map_fd), // lddw r1, map
		BpfInsn::default(),
		BpfInsn::new(0xb7, 3, 0, 0, XDP_PASS), // mov64 r3, XDP_PASS
		BpfInsn::new(0x85, 0, 0, 0, BPF_FUNC_REDIRECT_MAP),
		BpfInsn::new(0x95, 0, 0, 0, 0), // exit
	]
}

pub struct XdpProgram {
	link: Option<(u32, OwnedFd)>,
	prog: OwnedFd,
	map: OwnedFd,
	entries: u32,
}

impl XdpProgram {
	/// Creates an XSKMAP of `entries` sockets and loads the redirect program against it
	pub fn new(entries: u32) -> Result<Self, XskError> {
		raise_memlock();

		let mut attr = MapCreateAttr {
			map_type: BPF_MAP_TYPE_XSKMAP,
			key_size: 4,
			value_size: 4,
			max_entries: entries,
			map_name: name16("xsks_map"),
			..Default::default()
		};
		let fd = bpf(BPF_MAP_CREATE, &mut attr);
		if fd < 0 {
			log::error!("failed to create xskmap with {} entries", entries);
			return Err(XskError::new("create xskmap"));
		}
		let map = unsafe { OwnedFd::from_raw_fd(fd as RawFd) };

		let insns = redirect_insns(map.as_raw_fd());
		let mut attr = ProgLoadAttr {
			prog_type: BPF_PROG_TYPE_XDP,
			insn_cnt: insns.len() as u32,
			insns: insns.as_ptr() as u64,
			license: LICENSE.as_ptr() as u64,
			prog_name: name16("xsk_redirect"),
			expected_attach_type: BPF_XDP,
			..Default::default()
		};
		let mut fd = bpf(BPF_PROG_LOAD, &mut attr);
		if fd < 0 {
			let err = XskError::new("load xdp program");
			// load again with the verifier log switched on to say why
			let mut buf = vec![0u8; LOG_SIZE];
			attr.log_level = 1;
			attr.log_size = LOG_SIZE as u32;
			attr.log_buf = buf.as_mut_ptr() as u64;
			fd = bpf(BPF_PROG_LOAD, &mut attr);
			if fd < 0 {
				let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
				log::error!("verifier: {}", String::from_utf8_lossy(&buf[..end]));
				return Err(err);
			}
		}
		let prog = unsafe { OwnedFd::from_raw_fd(fd as RawFd) };
		#[cfg(feature = "debug")]
		println!("loaded xdp program fd {} map fd {}", prog.as_raw_fd(), map.as_raw_fd());

		Ok(Self {
			link: None,
			prog,
			map,
			entries,
		})
	}

	#[inline]
	pub fn entries(&self) -> u32 {
		self.entries
	}

	/// The interface the program is currently attached to
	#[inline]
	pub fn attached(&self) -> Option<u32> {
		self.link.as_ref().map(|(ifindex, _)| *ifindex)
	}

	fn update(&self, cmd: libc::c_long, queue_id: u32, value: u64, op: &'static str) -> Result<(), XskError> {
		let key = queue_id;
		let val = value as u32;
		let mut attr = MapElemAttr {
			map_fd: self.map.as_raw_fd() as u32,
			key: &key as *const u32 as u64,
			value: if cmd == BPF_MAP_UPDATE_ELEM { &val as *const u32 as u64 } else { 0 },
			flags: BPF_ANY,
			..Default::default()
		};
		if bpf(cmd, &mut attr) < 0 {
			return Err(XskError::new(op));
		}
		Ok(())
	}
}

impl Steering for XdpProgram {
	fn attach(&mut self, ifindex: u32) -> Result<(), XskError> {
		if self.link.is_some() {
			return Err(XskError::Busy("attach xdp program"));
		}
		let mut attr = LinkCreateAttr {
			prog_fd: self.prog.as_raw_fd() as u32,
			target_ifindex: ifindex,
			attach_type: BPF_XDP,
			flags: 0,
		};
		let fd = bpf(BPF_LINK_CREATE, &mut attr);
		if fd < 0 {
			return Err(XskError::new("attach xdp program"));
		}
		self.link = Some((ifindex, unsafe { OwnedFd::from_raw_fd(fd as RawFd) }));
		log::info!("attached xdp program to ifindex {}", ifindex);
		Ok(())
	}

	fn detach(&mut self, ifindex: u32) -> Result<(), XskError> {
		match self.link.take() {
			Some((attached, link)) if attached == ifindex => {
				drop(link);
				log::info!("detached xdp program from ifindex {}", ifindex);
				Ok(())
			}
			other => {
				self.link = other;
				Err(XskError::Invalid("detach xdp program"))
			}
		}
	}

	fn register(&mut self, queue_id: u32, fd: RawFd) -> Result<(), XskError> {
		if queue_id >= self.entries {
			return Err(XskError::Invalid("register socket"));
		}
		self.update(BPF_MAP_UPDATE_ELEM, queue_id, fd as u64, "register socket")
	}

	fn unregister(&mut self, queue_id: u32) -> Result<(), XskError> {
		self.update(BPF_MAP_DELETE_ELEM, queue_id, 0, "unregister socket")
	}
}

impl fmt::Debug for XdpProgram {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("XdpProgram")
			.field("prog", &self.prog.as_raw_fd())
			.field("map", &self.map.as_raw_fd())
			.field("entries", &self.entries)
			.field("attached", &self.attached())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn attr_layouts() {
		assert_eq!(mem::size_of::<BpfInsn>(), 8);
		assert_eq!(mem::size_of::<MapElemAttr>(), 32);
		assert_eq!(mem::size_of::<ProgLoadAttr>(), 72);
		assert_eq!(mem::size_of::<LinkCreateAttr>(), 16);
	}

	#[test]
	fn redirect_program_loads_the_map_fd() {
		let insns = redirect_insns(7);
		assert_eq!(insns[1].imm, 7);
		assert_eq!(insns[1].regs, 0x11);
		assert_eq!(insns[0].regs, 0x12);
		assert_eq!(insns[5].code, 0x95);
	}

	#[test]
	fn names_are_nul_terminated() {
		let n = name16("a_name_longer_than_sixteen");
		assert_eq!(n[15], 0);
		assert_eq!(&n[..3], b"a_n");
	}
}
