//! This is the library module that provides structures like
//! Umem, FramePool, ProdRing/ConsRing, XdpSocket, XdpProgram and the forwarding engine
//!
//! These structures and functions let the user drive two AF_XDP sockets that share a single
//! UMEM without having to manually figure out the ring ownership semantics
//!
//! The kernel side is reached through the traits in `apis::transport` so the same engine
//! runs against real sockets (`apis::Kernel`) or the in-memory `loopback` transport.

pub mod apis;
pub mod forwarder;
pub mod loopback;

pub use apis::*;
pub use forwarder::*;
