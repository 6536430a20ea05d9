//! In place rewriting of the Ethernet header of a received frame

use pnet::packet::ethernet::MutableEthernetPacket;
use pnet::util::MacAddr;

/// Overwrites the Ethernet destination of `frame` with `dst`
///
/// Only bytes `[0, 6)` change. A frame too short for a whole Ethernet header still gets as
/// much of the address as fits.
#[inline]
pub fn replace_dst_mac(frame: &mut [u8], dst: MacAddr) {
	if let Some(mut eth) = MutableEthernetPacket::new(frame) {
		eth.set_destination(dst);
		return;
	}
	let octets = dst.octets();
	let n = frame.len().min(octets.len());
	frame[..n].copy_from_slice(&octets[..n]);
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rewrites_only_the_destination() {
		let mut frame: Vec<u8> = (0u8..64).collect();
		let before = frame.clone();
		replace_dst_mac(&mut frame, MacAddr::new(0xde, 0xad, 0xbe, 0xef, 0x00, 0x01));
		assert_eq!(&frame[..6], &[0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]);
		assert_eq!(&frame[6..], &before[6..]);
		assert_eq!(frame.len(), 64);
	}

	#[test]
	fn short_frames_get_a_truncated_address() {
		let mut frame = [0u8; 4];
		replace_dst_mac(&mut frame, MacAddr::new(1, 2, 3, 4, 5, 6));
		assert_eq!(frame, [1, 2, 3, 4]);

		let mut frame = [9u8; 10];
		replace_dst_mac(&mut frame, MacAddr::broadcast());
		assert_eq!(frame, [0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 9, 9, 9, 9]);
	}

	#[test]
	fn empty_frame_is_left_alone() {
		let mut frame: [u8; 0] = [];
		replace_dst_mac(&mut frame, MacAddr::broadcast());
	}
}
