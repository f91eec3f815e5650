use crate::content::ContentOption;
use crate::intern::hash_words;
use crate::packet::BufferId;
use crate::packet::ByteVars;
use crate::packet::Cursor;
use crate::packet::FlowBits;
use crate::packet::NUM_VARS;
use crate::packet::Packet;
use crate::packet::RuntimeCounters;

/// Outcome of evaluating a single option against a cursor.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum EvalStatus {
	Match,
	NoMatch,
	/// Matched, but leaf alerts below this node are suppressed.
	NoAlert,
	/// A flowbit test failed; invalidates the packet-local cache for the
	/// nodes above it.
	FailedBit,
}

/// Kind discriminator; the evaluator's child-skip rules key on this rather
/// than on the concrete variant.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum OptionKind {
	Leaf,
	Content,
	Flowbit,
	BufferSet,
	Generic,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FlowbitOp {
	Set,
	Unset,
	Toggle,
	IsSet,
	IsNotSet,
	NoAlert,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FlowbitOption {
	pub op: FlowbitOp,
	pub bit: usize,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BufferSetOption {
	pub buffer: BufferId,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Endian {
	Big,
	Little,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ByteExtractOption {
	/// 1, 2 or 4 bytes.
	pub count: u8,
	pub offset: i32,
	pub relative: bool,
	pub endian: Endian,
	pub var: u8,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CmpOp {
	Eq,
	Ne,
	Lt,
	Gt,
	Le,
	Ge,
	/// Bitwise AND is non-zero.
	And,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TestValue {
	Imm(u32),
	Var(u8),
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ByteTestOption {
	pub count: u8,
	pub offset: i32,
	pub relative: bool,
	pub endian: Endian,
	pub op: CmpOp,
	pub value: TestValue,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SdKind {
	UsSocial,
	UsSocialNoDashes,
	CreditCard,
}

/// Sensitive-data predicate: counts PII occurrences in the cursor's buffer
/// and matches once the count reaches `threshold`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SdPatternOption {
	pub kind: SdKind,
	pub threshold: u32,
}

/// An interned, stateless predicate. Dispatch is by variant; the shared
/// capability set is {evaluate, hash, equals, retry, content access}.
/// Leaf nodes carry their rule descriptor on the tree node instead.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RuleOption {
	Content(ContentOption),
	Flowbit(FlowbitOption),
	BufferSet(BufferSetOption),
	ByteExtract(ByteExtractOption),
	ByteTest(ByteTestOption),
	SdPattern(SdPatternOption),
}

impl RuleOption {
	pub fn kind(&self) -> OptionKind {
		match self {
			Self::Content(..) => OptionKind::Content,
			Self::Flowbit(..) => OptionKind::Flowbit,
			Self::BufferSet(..) => OptionKind::BufferSet,
			Self::ByteExtract(..) | Self::ByteTest(..) | Self::SdPattern(..) => OptionKind::Generic,
		}
	}

	pub fn is_relative(&self) -> bool {
		match self {
			Self::Content(c) => c.relative,
			Self::ByteExtract(e) => e.relative,
			Self::ByteTest(t) => t.relative,
			Self::Flowbit(..) | Self::BufferSet(..) | Self::SdPattern(..) => false,
		}
	}

	/// Set-family flowbit operations are deferred by the evaluator until the
	/// subtree confirms a match.
	pub fn is_flowbit_setter(&self) -> bool {
		matches!(
			self,
			Self::Flowbit(FlowbitOption {
				op: FlowbitOp::Set | FlowbitOp::Unset | FlowbitOp::Toggle,
				..
			})
		)
	}

	pub fn content(&self) -> Option<&ContentOption> {
		match self {
			Self::Content(c) => Some(c),
			_ => None,
		}
	}

	pub fn retry(&self, cursor: &Cursor<'_>, orig_cursor: &Cursor<'_>) -> bool {
		match self {
			Self::Content(c) => c.retry(cursor, orig_cursor),
			_ => false,
		}
	}

	pub fn evaluate<'buf>(
		&self,
		cursor: &mut Cursor<'buf>,
		packet: &Packet<'buf>,
		flow: &mut FlowBits,
		vars: &mut ByteVars,
		counters: &mut RuntimeCounters,
		resume: bool,
	) -> EvalStatus {
		match self {
			Self::Content(c) => match c.search(cursor, resume) {
				Some(end) => {
					if c.negated {
						EvalStatus::NoMatch
					} else {
						cursor.pos = end;
						EvalStatus::Match
					}
				},
				None => {
					if c.negated {
						EvalStatus::Match
					} else {
						EvalStatus::NoMatch
					}
				},
			},
			Self::Flowbit(f) => match f.op {
				FlowbitOp::Set => {
					flow.set(f.bit);
					EvalStatus::Match
				},
				FlowbitOp::Unset => {
					flow.clear(f.bit);
					EvalStatus::Match
				},
				FlowbitOp::Toggle => {
					flow.toggle(f.bit);
					EvalStatus::Match
				},
				FlowbitOp::IsSet => {
					if flow.get(f.bit) {
						EvalStatus::Match
					} else {
						EvalStatus::FailedBit
					}
				},
				FlowbitOp::IsNotSet => {
					if flow.get(f.bit) {
						EvalStatus::FailedBit
					} else {
						EvalStatus::Match
					}
				},
				FlowbitOp::NoAlert => EvalStatus::NoAlert,
			},
			Self::BufferSet(b) => match packet.buffer(b.buffer) {
				Some(buf) => {
					*cursor = Cursor::new(buf);
					EvalStatus::Match
				},
				None => EvalStatus::NoMatch,
			},
			Self::ByteExtract(e) => {
				let value: Option<(u32, usize)> = read_bytes(cursor, e.count, e.offset, e.relative, e.endian);
				match value {
					Some((value, end)) => {
						vars[e.var as usize % NUM_VARS] = value;
						cursor.pos = end;
						EvalStatus::Match
					},
					None => {
						counters.cursor_oob += 1;
						EvalStatus::NoMatch
					},
				}
			},
			Self::ByteTest(t) => {
				let value: Option<(u32, usize)> = read_bytes(cursor, t.count, t.offset, t.relative, t.endian);
				match value {
					Some((value, _)) => {
						let rhs: u32 = match t.value {
							TestValue::Imm(v) => v,
							TestValue::Var(i) => vars[i as usize % NUM_VARS],
						};
						let ok: bool = match t.op {
							CmpOp::Eq => value == rhs,
							CmpOp::Ne => value != rhs,
							CmpOp::Lt => value < rhs,
							CmpOp::Gt => value > rhs,
							CmpOp::Le => value <= rhs,
							CmpOp::Ge => value >= rhs,
							CmpOp::And => value & rhs != 0,
						};
						if ok { EvalStatus::Match } else { EvalStatus::NoMatch }
					},
					None => {
						counters.cursor_oob += 1;
						EvalStatus::NoMatch
					},
				}
			},
			Self::SdPattern(sd) => {
				let haystack: &[u8] = cursor.buf.get(cursor.pos..).unwrap_or(&[]);
				let found: u32 = sd_count(sd.kind, haystack, sd.threshold);
				if found >= sd.threshold {
					EvalStatus::Match
				} else {
					if found == 0 {
						counters.pattern_not_found += 1;
					} else {
						counters.below_threshold += 1;
					}
					trace!("sd_pattern {:?}: {found} hit(s), threshold {}", sd.kind, sd.threshold);
					EvalStatus::NoMatch
				}
			},
		}
	}

	/// Domain-specific hash over the variant's identity-bearing fields; used
	/// by the interning table together with structural equality.
	pub fn hash(&self) -> u32 {
		match self {
			Self::Content(c) => {
				let mut words: Vec<u32> = vec![
					c.nocase as u32 | (c.negated as u32) << 1 | (c.relative as u32) << 2,
					c.offset as u32,
					c.depth.map_or(u32::MAX, |d| d),
				];
				words.extend(c.pattern().chunks(4).map(word_of));
				hash_words(1, &words)
			},
			Self::Flowbit(f) => hash_words(2, &[f.op as u32, f.bit as u32]),
			Self::BufferSet(b) => hash_words(3, &[b.buffer.0 as u32]),
			Self::ByteExtract(e) => hash_words(
				4,
				&[
					e.count as u32,
					e.offset as u32,
					e.relative as u32,
					e.endian as u32,
					e.var as u32,
				],
			),
			Self::ByteTest(t) => {
				let (src, rhs): (u32, u32) = match t.value {
					TestValue::Imm(v) => (0, v),
					TestValue::Var(i) => (1, i as u32),
				};
				hash_words(
					5,
					&[
						t.count as u32,
						t.offset as u32,
						t.relative as u32,
						t.endian as u32,
						t.op as u32,
						src,
						rhs,
					],
				)
			},
			Self::SdPattern(sd) => hash_words(6, &[sd.kind as u32, sd.threshold]),
		}
	}
}

fn word_of(chunk: &[u8]) -> u32 {
	chunk.iter().fold(0u32, |word, &b| (word << 8) | b as u32)
}

fn read_bytes(cursor: &Cursor<'_>, count: u8, offset: i32, relative: bool, endian: Endian) -> Option<(u32, usize)> {
	let anchor: i64 = if relative { cursor.pos as i64 } else { 0 };
	let start: i64 = anchor + offset as i64;
	if start < 0 {
		return None;
	}
	let start: usize = start as usize;
	let end: usize = start.checked_add(count as usize)?;
	let bytes: &[u8] = cursor.buf.get(start..end)?;

	let mut value: u32 = 0;
	match endian {
		Endian::Big => {
			for &b in bytes.iter() {
				value = (value << 8) | b as u32;
			}
		},
		Endian::Little => {
			for &b in bytes.iter().rev() {
				value = (value << 8) | b as u32;
			}
		},
	}

	Some((value, end))
}

// ========================================
// Sensitive-data scanners.

fn sd_count(kind: SdKind, buf: &[u8], enough: u32) -> u32 {
	let mut count: u32 = 0;
	let mut i: usize = 0;

	while i < buf.len() {
		match sd_match_at(kind, buf, i) {
			Some(end) => {
				count += 1;
				if count >= enough {
					return count;
				}
				i = end;
			},
			None => i += 1,
		}
	}

	count
}

fn sd_match_at(kind: SdKind, buf: &[u8], i: usize) -> Option<usize> {
	match kind {
		SdKind::UsSocial => sd_social(buf, i, true),
		SdKind::UsSocialNoDashes => sd_social(buf, i, false),
		SdKind::CreditCard => sd_credit(buf, i),
	}
}

/// ddd-dd-dddd, or nine bare digits; neighbours must not extend the run.
fn sd_social(buf: &[u8], i: usize, dashes: bool) -> Option<usize> {
	let shape: &[usize] = if dashes { &[3, 2, 4] } else { &[9] };

	if i > 0 && (buf[i - 1].is_ascii_digit() || buf[i - 1] == b'-') {
		return None;
	}

	let mut pos: usize = i;
	for (g, &group) in shape.iter().enumerate() {
		if g > 0 {
			if buf.get(pos) != Some(&b'-') {
				return None;
			}
			pos += 1;
		}
		for _ in 0..group {
			if !buf.get(pos).is_some_and(|b| b.is_ascii_digit()) {
				return None;
			}
			pos += 1;
		}
	}

	if buf.get(pos).is_some_and(|&b| b.is_ascii_digit() || b == b'-') {
		return None;
	}

	Some(pos)
}

/// 13-16 digits with at most one space/dash between digit groups, validated
/// by the Luhn checksum.
fn sd_credit(buf: &[u8], i: usize) -> Option<usize> {
	if i > 0 && buf[i - 1].is_ascii_digit() {
		return None;
	}
	if !buf.get(i).is_some_and(|b| b.is_ascii_digit()) {
		return None;
	}

	let mut digits: Vec<u8> = Vec::with_capacity(16);
	let mut pos: usize = i;
	let mut pending_separator: bool = false;

	while pos < buf.len() && digits.len() < 16 {
		let b: u8 = buf[pos];
		if b.is_ascii_digit() {
			digits.push(b - b'0');
			pending_separator = false;
			pos += 1;
		} else if (b == b' ' || b == b'-') && !pending_separator {
			pending_separator = true;
			pos += 1;
		} else {
			break;
		}
	}

	if pending_separator {
		pos -= 1;
	}

	if !(13..=16).contains(&digits.len()) {
		return None;
	}
	if buf.get(pos).is_some_and(|b| b.is_ascii_digit()) {
		return None;
	}
	if !luhn(&digits) {
		return None;
	}

	Some(pos)
}

fn luhn(digits: &[u8]) -> bool {
	let mut sum: u32 = 0;
	for (i, &d) in digits.iter().rev().enumerate() {
		let mut d: u32 = d as u32;
		if i % 2 == 1 {
			d *= 2;
			if d > 9 {
				d -= 9;
			}
		}
		sum += d;
	}
	sum % 10 == 0
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::packet::Timeval;

	struct Bench<'buf> {
		packet: Packet<'buf>,
		flow: FlowBits,
		vars: ByteVars,
		counters: RuntimeCounters,
	}

	impl<'buf> Bench<'buf> {
		fn new(payload: &'buf [u8]) -> Self {
			Self {
				packet: Packet::new(payload, Timeval::new(1, 0), 1),
				flow: FlowBits::new(),
				vars: [0; NUM_VARS],
				counters: RuntimeCounters::default(),
			}
		}

		fn eval(&mut self, option: &RuleOption, cursor: &mut Cursor<'buf>) -> EvalStatus {
			option.evaluate(
				cursor,
				&self.packet,
				&mut self.flow,
				&mut self.vars,
				&mut self.counters,
				false,
			)
		}
	}

	#[test]
	fn content_dispatch() {
		let payload: &[u8] = b"GET /index.html";
		let mut bench: Bench<'_> = Bench::new(payload);
		let mut cursor: Cursor<'_> = Cursor::new(payload);

		let option: RuleOption = RuleOption::Content(ContentOption::new(
			b"GET ".to_vec(),
			false,
			false,
			false,
			0,
			None,
		));
		assert_eq!(bench.eval(&option, &mut cursor), EvalStatus::Match);
		assert_eq!(cursor.pos, 4);

		let negated: RuleOption = RuleOption::Content(ContentOption::new(
			b"POST".to_vec(),
			false,
			true,
			false,
			0,
			None,
		));
		let before: usize = cursor.pos;
		assert_eq!(bench.eval(&negated, &mut cursor), EvalStatus::Match);
		assert_eq!(cursor.pos, before);
	}

	#[test]
	fn flowbit_ops() {
		let payload: &[u8] = b"";
		let mut bench: Bench<'_> = Bench::new(payload);
		let mut cursor: Cursor<'_> = Cursor::new(payload);

		let is_set: RuleOption = RuleOption::Flowbit(FlowbitOption {
			op: FlowbitOp::IsSet,
			bit: 5,
		});
		assert_eq!(bench.eval(&is_set, &mut cursor), EvalStatus::FailedBit);

		let set: RuleOption = RuleOption::Flowbit(FlowbitOption {
			op: FlowbitOp::Set,
			bit: 5,
		});
		assert_eq!(bench.eval(&set, &mut cursor), EvalStatus::Match);
		assert_eq!(bench.eval(&is_set, &mut cursor), EvalStatus::Match);

		let noalert: RuleOption = RuleOption::Flowbit(FlowbitOption {
			op: FlowbitOp::NoAlert,
			bit: 0,
		});
		assert_eq!(bench.eval(&noalert, &mut cursor), EvalStatus::NoAlert);

		assert!(set.is_flowbit_setter());
		assert!(!is_set.is_flowbit_setter());
	}

	#[test]
	fn buffer_set() {
		let payload: &[u8] = b"GET /index.html";
		let mut bench: Bench<'_> = Bench::new(payload);
		bench.packet.buffers.push((BufferId(1), (4, 15)));
		let mut cursor: Cursor<'_> = Cursor::new(payload);
		cursor.pos = 7;

		let option: RuleOption = RuleOption::BufferSet(BufferSetOption { buffer: BufferId(1) });
		assert_eq!(bench.eval(&option, &mut cursor), EvalStatus::Match);
		assert_eq!(cursor.buf, &payload[4..15]);
		assert_eq!(cursor.pos, 0);

		let missing: RuleOption = RuleOption::BufferSet(BufferSetOption { buffer: BufferId(2) });
		assert_eq!(bench.eval(&missing, &mut cursor), EvalStatus::NoMatch);
	}

	#[test]
	fn byte_extract_and_test() {
		let payload: &[u8] = &[0x00, 0x10, 0xab, 0xcd];
		let mut bench: Bench<'_> = Bench::new(payload);
		let mut cursor: Cursor<'_> = Cursor::new(payload);

		let extract: RuleOption = RuleOption::ByteExtract(ByteExtractOption {
			count: 2,
			offset: 0,
			relative: false,
			endian: Endian::Big,
			var: 3,
		});
		assert_eq!(bench.eval(&extract, &mut cursor), EvalStatus::Match);
		assert_eq!(bench.vars[3], 0x0010);
		assert_eq!(cursor.pos, 2);

		let test_var: RuleOption = RuleOption::ByteTest(ByteTestOption {
			count: 2,
			offset: 0,
			relative: true,
			endian: Endian::Big,
			op: CmpOp::Gt,
			value: TestValue::Var(3),
		});
		/// Reads 0xabcd at the cursor and compares against var 3 (0x0010).
		assert_eq!(bench.eval(&test_var, &mut cursor), EvalStatus::Match);

		let oob: RuleOption = RuleOption::ByteExtract(ByteExtractOption {
			count: 4,
			offset: 2,
			relative: true,
			endian: Endian::Little,
			var: 0,
		});
		assert_eq!(bench.eval(&oob, &mut cursor), EvalStatus::NoMatch);
		assert_eq!(bench.counters.cursor_oob, 1);
	}

	#[test]
	fn little_endian_read() {
		let payload: &[u8] = &[0x34, 0x12];
		let cursor: Cursor<'_> = Cursor::new(payload);
		assert_eq!(read_bytes(&cursor, 2, 0, false, Endian::Little), Some((0x1234, 2)));
		assert_eq!(read_bytes(&cursor, 2, 0, false, Endian::Big), Some((0x3412, 2)));
		assert_eq!(read_bytes(&cursor, 1, -1, false, Endian::Big), None);
	}

	#[test]
	fn social_shapes() {
		assert_eq!(sd_social(b"x123-45-6789y", 1, true), Some(12));
		assert_eq!(sd_social(b"123-45-67890", 0, true), None);
		assert_eq!(sd_social(b"1123-45-6789", 1, true), None);
		assert_eq!(sd_social(b"123456789", 0, false), Some(9));
		assert_eq!(sd_social(b"1234567890", 0, false), None);
	}

	#[test]
	fn credit_cards() {
		/// 4539 1488 0343 6467 is a classic Luhn-valid test number.
		assert!(sd_credit(b"4539148803436467", 0).is_some());
		assert!(sd_credit(b"4539 1488 0343 6467", 0).is_some());
		assert!(sd_credit(b"4539-1488-0343-6467", 0).is_some());
		/// Same digits with the check digit off by one.
		assert!(sd_credit(b"4539148803436468", 0).is_none());
		assert!(sd_credit(b"539148803436467", 1).is_none());
	}

	#[test]
	fn sd_threshold() {
		let payload: &[u8] = b"ssn 123-45-6789 and 987-65-4320 end";
		let mut bench: Bench<'_> = Bench::new(payload);
		let mut cursor: Cursor<'_> = Cursor::new(payload);

		let two: RuleOption = RuleOption::SdPattern(SdPatternOption {
			kind: SdKind::UsSocial,
			threshold: 2,
		});
		assert_eq!(bench.eval(&two, &mut cursor), EvalStatus::Match);

		let three: RuleOption = RuleOption::SdPattern(SdPatternOption {
			kind: SdKind::UsSocial,
			threshold: 3,
		});
		assert_eq!(bench.eval(&three, &mut cursor), EvalStatus::NoMatch);
		assert_eq!(bench.counters.below_threshold, 1);

		let none: RuleOption = RuleOption::SdPattern(SdPatternOption {
			kind: SdKind::CreditCard,
			threshold: 1,
		});
		assert_eq!(bench.eval(&none, &mut cursor), EvalStatus::NoMatch);
		assert_eq!(bench.counters.pattern_not_found, 1);
	}

	#[test]
	fn hashes_separate_kinds() {
		let a: RuleOption = RuleOption::Flowbit(FlowbitOption {
			op: FlowbitOp::Set,
			bit: 1,
		});
		let b: RuleOption = RuleOption::Flowbit(FlowbitOption {
			op: FlowbitOp::Unset,
			bit: 1,
		});
		assert_ne!(a.hash(), b.hash());
		assert_eq!(a.hash(), a.clone().hash());
	}
}
