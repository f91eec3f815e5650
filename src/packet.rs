use std::net::IpAddr;
use std::net::Ipv4Addr;

/// Byte-extract variable registers carried through one packet's evaluation.
pub const NUM_VARS: usize = 16;

pub type ByteVars = [u32; NUM_VARS];

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct Timeval {
	pub sec: u64,
	pub usec: u32,
}

impl Timeval {
	pub fn new(sec: u64, usec: u32) -> Self {
		Self { sec, usec }
	}
}

/// Resolved service of the packet's flow, interned at configure time.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ServiceId(pub usize);

/// Selects which packet buffer a cursor walks. Buffer 0 is the payload;
/// inspectors may publish further buffers as sub-ranges of it.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct BufferId(pub u8);

impl BufferId {
	pub const PAYLOAD: Self = Self(0);
}

/// Everything the evaluator may read about one packet. Immutable during
/// evaluation; per-packet mutable state (registers, events, flowbits) lives
/// in the evaluation context instead.
#[derive(Debug)]
pub struct Packet<'buf> {
	pub payload: &'buf [u8],
	pub ts: Timeval,
	/// Monotonic per worker; two `scan_packet` calls with equal (ts,
	/// context_num) describe the same packet identity for memoization.
	pub context_num: u64,
	pub rebuilt_stream: bool,
	pub allow_multiple_detect: bool,
	pub ip_rule_second_pass: bool,
	pub udp_tunneled: bool,
	pub src: IpAddr,
	pub dst: IpAddr,
	pub src_port: u16,
	pub dst_port: u16,
	pub service: Option<ServiceId>,
	/// Additional named buffers as sub-ranges of the payload.
	pub buffers: Vec<(BufferId, (usize, usize))>,
}

impl<'buf> Packet<'buf> {
	pub fn new(payload: &'buf [u8], ts: Timeval, context_num: u64) -> Self {
		Self {
			payload,
			ts,
			context_num,
			rebuilt_stream: false,
			allow_multiple_detect: false,
			ip_rule_second_pass: false,
			udp_tunneled: false,
			src: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
			dst: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
			src_port: 0,
			dst_port: 0,
			service: None,
			buffers: Vec::new(),
		}
	}

	pub fn buffer(&self, id: BufferId) -> Option<&'buf [u8]> {
		if id == BufferId::PAYLOAD {
			return Some(self.payload);
		}
		self.buffers
			.iter()
			.find(|(b, _)| *b == id)
			.and_then(|&(_, (start, end))| self.payload.get(start..end))
	}
}

/// A view into one packet buffer; passed by value so every evaluation level
/// can advance its own copy. Relative options move `pos`.
#[derive(Debug, Clone, Copy)]
pub struct Cursor<'buf> {
	pub buf: &'buf [u8],
	pub pos: usize,
}

impl<'buf> Cursor<'buf> {
	pub fn new(buf: &'buf [u8]) -> Self {
		Self { buf, pos: 0 }
	}

	pub fn remaining(&self) -> usize {
		self.buf.len().saturating_sub(self.pos)
	}
}

/// Per-flow named booleans; rule options set and test them across packets of
/// one flow.
#[derive(Debug, Default, Clone)]
pub struct FlowBits {
	words: Vec<u64>,
}

impl FlowBits {
	pub fn new() -> Self {
		Self::default()
	}

	fn slot(&mut self, bit: usize) -> (&mut u64, u64) {
		let word: usize = bit / 64;
		if word >= self.words.len() {
			self.words.resize(word + 1, 0);
		}
		(&mut self.words[word], 1u64 << (bit % 64))
	}

	pub fn set(&mut self, bit: usize) {
		let (word, mask): (&mut u64, u64) = self.slot(bit);
		*word |= mask;
	}

	pub fn clear(&mut self, bit: usize) {
		let (word, mask): (&mut u64, u64) = self.slot(bit);
		*word &= !mask;
	}

	pub fn toggle(&mut self, bit: usize) {
		let (word, mask): (&mut u64, u64) = self.slot(bit);
		*word ^= mask;
	}

	pub fn get(&self, bit: usize) -> bool {
		self.words
			.get(bit / 64)
			.map(|word| word & (1u64 << (bit % 64)) != 0)
			.unwrap_or(false)
	}
}

#[derive(Debug, Default, Clone)]
pub struct Flow {
	pub bits: FlowBits,
}

/// One rule firing, appended to the packet's event queue in leaf-traversal
/// order.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Event {
	pub gid: u32,
	pub sid: u32,
	pub rev: u32,
}

/// Worker-local tallies of absorbed runtime anomalies. A missed detection is
/// only observable here and in debug traces.
#[derive(Debug, Default, Clone)]
pub struct RuntimeCounters {
	pub timeouts: u64,
	pub suspends: u64,
	pub pattern_not_found: u64,
	pub below_threshold: u64,
	pub cursor_oob: u64,
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn flowbits() {
		let mut bits: FlowBits = FlowBits::new();
		assert!(!bits.get(0));
		assert!(!bits.get(200));
		bits.set(200);
		assert!(bits.get(200));
		bits.toggle(200);
		assert!(!bits.get(200));
		bits.toggle(3);
		assert!(bits.get(3));
		bits.clear(3);
		assert!(!bits.get(3));
	}

	#[test]
	fn packet_buffers() {
		let payload: &[u8] = b"GET /index.html HTTP/1.1";
		let mut packet: Packet<'_> = Packet::new(payload, Timeval::new(1, 0), 1);
		packet.buffers.push((BufferId(1), (4, 15)));

		assert_eq!(packet.buffer(BufferId::PAYLOAD), Some(payload));
		assert_eq!(packet.buffer(BufferId(1)), Some(&payload[4..15]));
		assert_eq!(packet.buffer(BufferId(9)), None);
	}

	#[test]
	fn cursor_remaining() {
		let mut cursor: Cursor<'_> = Cursor::new(b"abcdef");
		assert_eq!(cursor.remaining(), 6);
		cursor.pos = 4;
		assert_eq!(cursor.remaining(), 2);
		cursor.pos = 100;
		assert_eq!(cursor.remaining(), 0);
	}
}
