use std::str::Chars;

use nom::Err as NomErr;
use nom::IResult;
use nom::error::ErrorKind as NomErrorKind;
use nom::error::ParseError;

use crate::packet::Cursor;
use crate::pattern::fold_byte;
use crate::pattern::fold_bytes;

/// A content predicate: a byte literal plus its search window parameters.
/// `offset`/`depth` anchor at the buffer start; with `relative` set they
/// anchor at the cursor instead (the rule language's distance/within).
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ContentOption {
	pattern: Vec<u8>,
	folded: Vec<u8>,
	pub nocase: bool,
	pub negated: bool,
	pub relative: bool,
	pub offset: i32,
	pub depth: Option<u32>,
}

impl ContentOption {
	pub fn new(pattern: Vec<u8>, nocase: bool, negated: bool, relative: bool, offset: i32, depth: Option<u32>) -> Self {
		assert!(!pattern.is_empty());
		let folded: Vec<u8> = fold_bytes(&pattern);
		Self {
			pattern,
			folded,
			nocase,
			negated,
			relative,
			offset,
			depth,
		}
	}

	pub fn pattern(&self) -> &[u8] {
		&self.pattern
	}

	pub fn folded(&self) -> &[u8] {
		&self.folded
	}

	/// No depth bound: a failed search cannot succeed at another cursor
	/// position, which lets the evaluator skip re-walking this branch.
	pub fn is_unbounded(&self) -> bool {
		self.depth.is_none()
	}

	fn window(&self, buf_len: usize, anchor: usize) -> (usize, usize) {
		let start: i64 = if self.relative {
			anchor as i64 + self.offset as i64
		} else {
			self.offset as i64
		};
		let start: usize = start.clamp(0, buf_len as i64) as usize;
		let end: usize = match self.depth {
			Some(depth) => (start + depth as usize).min(buf_len),
			None => buf_len,
		};
		(start, end)
	}

	/// Find the next occurrence inside the window. `resume` continues from
	/// the cursor (used on retry iterations) so repeated searches always make
	/// forward progress; a fresh evaluation anchors at the window start.
	/// Returns the exclusive end offset of the hit.
	pub fn search(&self, cursor: &Cursor<'_>, resume: bool) -> Option<usize> {
		let (start, end): (usize, usize) = self.window(cursor.buf.len(), cursor.pos);
		let from: usize = if resume { start.max(cursor.pos) } else { start };
		let n: usize = self.pattern.len();

		if end < from + n {
			return None;
		}

		for i in from..=(end - n) {
			if self.matches_at(cursor.buf, i) {
				return Some(i + n);
			}
		}

		None
	}

	/// Whether another match position is plausible: never for a negated
	/// content, otherwise only while the window (anchored at the cursor state
	/// this node was entered with) still has room for the pattern.
	pub fn retry(&self, cursor: &Cursor<'_>, orig_cursor: &Cursor<'_>) -> bool {
		if self.negated {
			return false;
		}
		let (_, end): (usize, usize) = self.window(orig_cursor.buf.len(), orig_cursor.pos);
		cursor.pos + self.pattern.len() <= end
	}

	fn matches_at(&self, buf: &[u8], i: usize) -> bool {
		let n: usize = self.pattern.len();
		if self.nocase {
			self.folded
				.iter()
				.zip(buf[i..i + n].iter())
				.all(|(&p, &b)| p == fold_byte(b))
		} else {
			&buf[i..i + n] == self.pattern.as_slice()
		}
	}
}

// ========================================
// Literal syntax: a quoted byte string with |..| hex runs,
// e.g. `"GET |0D 0A|"`; `\"`, `\\` and `\|` escape the delimiters.

#[derive(Debug, thiserror::Error)]
#[error("bad content literal at byte {pos}: {kind}")]
pub struct LiteralError {
	pub pos: usize,
	pub kind: LiteralErrorKind,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum LiteralErrorKind {
	#[error("expected '{0}'")]
	ExpectedChar(char),
	#[error("unterminated literal")]
	Unterminated,
	#[error("expected a hex digit pair")]
	BadHexDigit,
	#[error("invalid escape character")]
	BadEscape,
	#[error("empty literal")]
	Empty,
	#[error("trailing characters after closing quote")]
	Trailing,
	#[error("parser error")]
	Nom,
}

#[derive(Debug)]
struct LiteralParsingError<'a> {
	input: &'a str,
	kind: LiteralErrorKind,
}

impl<'a> ParseError<&'a str> for LiteralParsingError<'a> {
	fn from_error_kind(input: &'a str, _nom: NomErrorKind) -> Self {
		Self {
			input,
			kind: LiteralErrorKind::Nom,
		}
	}

	fn append(_input: &'a str, _kind: NomErrorKind, other: Self) -> Self {
		other
	}
}

impl LiteralErrorKind {
	fn error(self, input: &str) -> NomErr<LiteralParsingError<'_>> {
		NomErr::Error(LiteralParsingError { input, kind: self })
	}

	/// Unrecoverable variant: `alt` must not fall through to another branch.
	fn failure(self, input: &str) -> NomErr<LiteralParsingError<'_>> {
		NomErr::Failure(LiteralParsingError { input, kind: self })
	}
}

type ParsingResult<'a, T> = IResult<&'a str, T, LiteralParsingError<'a>>;

/// Parse the full quoted form into raw bytes.
pub fn parse_literal(text: &str) -> Result<Vec<u8>, LiteralError> {
	match parse_quoted(text) {
		Ok((remaining, bytes)) => {
			if !remaining.is_empty() {
				return Err(LiteralError {
					pos: text.len() - remaining.len(),
					kind: LiteralErrorKind::Trailing,
				});
			}
			if bytes.is_empty() {
				return Err(LiteralError {
					pos: 0,
					kind: LiteralErrorKind::Empty,
				});
			}
			Ok(bytes)
		},
		Err(NomErr::Incomplete(_)) => {
			panic!("We shouldn't be using anything that can return this!");
		},
		Err(NomErr::Error(err) | NomErr::Failure(err)) => Err(LiteralError {
			pos: text.len() - err.input.len(),
			kind: err.kind,
		}),
	}
}

fn parse_quoted(input: &str) -> ParsingResult<'_, Vec<u8>> {
	use nom::Parser;
	use nom::multi::fold_many0;

	let (input, _): (&str, char) = parse_char::<'"'>(input)?;

	let (input, bytes): (&str, Vec<u8>) = fold_many0(parse_piece, Vec::new, |mut bytes, piece| {
		bytes.extend_from_slice(&piece);
		bytes
	})
	.parse(input)?;

	match parse_char::<'"'>(input) {
		Ok((remaining, _)) => Ok((remaining, bytes)),
		Err(_) => Err(LiteralErrorKind::Unterminated.error(input)),
	}
}

fn parse_piece(input: &str) -> ParsingResult<'_, Vec<u8>> {
	use nom::Parser;
	use nom::branch::alt;

	alt((parse_hex_run, parse_escape, parse_plain)).parse(input)
}

fn parse_plain(input: &str) -> ParsingResult<'_, Vec<u8>> {
	use nom::Parser;
	use nom::bytes::complete::take_while1;

	take_while1(|ch: char| !matches!(ch, '"' | '|' | '\\'))
		.map(|plain: &str| plain.as_bytes().to_vec())
		.parse(input)
}

fn parse_escape(original_input: &str) -> ParsingResult<'_, Vec<u8>> {
	let (input, _): (&str, char) = parse_char::<'\\'>(original_input)?;

	let mut chars: Chars<'_> = input.chars();
	match chars.next() {
		Some(ch @ ('"' | '\\' | '|')) => Ok((chars.as_str(), vec![ch as u8])),
		_ => Err(LiteralErrorKind::BadEscape.failure(original_input)),
	}
}

fn parse_hex_run(original_input: &str) -> ParsingResult<'_, Vec<u8>> {
	let (mut input, _): (&str, char) = parse_char::<'|'>(original_input)?;

	let mut bytes: Vec<u8> = Vec::new();

	loop {
		let mut chars: Chars<'_> = input.chars();
		match chars.next() {
			Some('|') => return Ok((chars.as_str(), bytes)),
			Some(ch) if ch.is_ascii_whitespace() => {
				input = chars.as_str();
			},
			Some(upper) => {
				let lower: char = chars.next().unwrap_or('\0');
				match (upper.to_digit(16), lower.to_digit(16)) {
					(Some(upper), Some(lower)) => {
						bytes.push(((upper << 4) | lower) as u8);
						input = chars.as_str();
					},
					_ => return Err(LiteralErrorKind::BadHexDigit.failure(input)),
				}
			},
			None => return Err(LiteralErrorKind::Unterminated.failure(input)),
		}
	}
}

fn parse_char<const CHAR: char>(input: &str) -> ParsingResult<'_, char> {
	let mut chars: Chars<'_> = input.chars();

	if let Some(ch) = chars.next() {
		if ch == CHAR {
			return Ok((chars.as_str(), ch));
		}
	}

	Err(LiteralErrorKind::ExpectedChar(CHAR).error(input))
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn literal_plain() {
		assert_eq!(parse_literal(r#""GET ""#).unwrap(), b"GET ".to_vec());
	}

	#[test]
	fn literal_hex_runs() {
		assert_eq!(parse_literal(r#""GET |0D 0A|""#).unwrap(), b"GET \r\n".to_vec());
		assert_eq!(parse_literal(r#""|00 01 ff|x""#).unwrap(), vec![0x00, 0x01, 0xff, b'x']);
		assert_eq!(parse_literal(r#""|0d0a|""#).unwrap(), b"\r\n".to_vec());
	}

	#[test]
	fn literal_escapes() {
		assert_eq!(parse_literal(r#""a\"b\\c\|d""#).unwrap(), b"a\"b\\c|d".to_vec());
	}

	#[test]
	fn literal_errors() {
		assert_eq!(parse_literal("GET").unwrap_err().kind, LiteralErrorKind::ExpectedChar('"'));
		assert_eq!(parse_literal(r#""GET"#).unwrap_err().kind, LiteralErrorKind::Unterminated);
		assert_eq!(parse_literal(r#""""#).unwrap_err().kind, LiteralErrorKind::Empty);
		assert_eq!(parse_literal(r#""a"b"#).unwrap_err().kind, LiteralErrorKind::Trailing);

		let err: LiteralError = parse_literal(r#""ab|zz|""#).unwrap_err();
		assert_eq!(err.kind, LiteralErrorKind::BadHexDigit);
		assert_eq!(err.pos, 4);

		assert_eq!(parse_literal(r#""a\n""#).unwrap_err().kind, LiteralErrorKind::BadEscape);
	}

	fn content(pattern: &[u8]) -> ContentOption {
		ContentOption::new(pattern.to_vec(), false, false, false, 0, None)
	}

	#[test]
	fn search_absolute() {
		let c: ContentOption = content(b"GET");
		let cursor: Cursor<'_> = Cursor::new(b"xxGET /");
		assert_eq!(c.search(&cursor, false), Some(5));
	}

	#[test]
	fn search_offset_depth() {
		let mut c: ContentOption = content(b"ab");
		c.offset = 2;
		c.depth = Some(3);

		/// Window is bytes [2, 5): "ab" at 2 fits, at 4 it does not.
		assert_eq!(c.search(&Cursor::new(b"xxabxx"), false), Some(4));
		assert_eq!(c.search(&Cursor::new(b"xxxxab"), false), None);
	}

	#[test]
	fn search_relative() {
		let mut c: ContentOption = content(b"cd");
		c.relative = true;
		c.offset = 1;

		let mut cursor: Cursor<'_> = Cursor::new(b"abxcdxcd");
		cursor.pos = 2;
		/// Anchored one past the cursor: first hit is at byte 3.
		assert_eq!(c.search(&cursor, false), Some(5));

		cursor.pos = 5;
		assert_eq!(c.search(&cursor, false), Some(8));
	}

	#[test]
	fn search_nocase() {
		let c: ContentOption = ContentOption::new(b"AbC".to_vec(), true, false, false, 0, None);
		assert_eq!(c.search(&Cursor::new(b"xaBCx"), false), Some(4));

		let exact: ContentOption = content(b"AbC");
		assert_eq!(exact.search(&Cursor::new(b"xaBCx"), false), None);
	}

	#[test]
	fn search_resume_advances() {
		let c: ContentOption = content(b"ab");
		let mut cursor: Cursor<'_> = Cursor::new(b"abxab");

		assert_eq!(c.search(&cursor, false), Some(2));
		cursor.pos = 2;
		assert_eq!(c.search(&cursor, true), Some(5));
		cursor.pos = 5;
		assert_eq!(c.search(&cursor, true), None);
	}

	#[test]
	fn retry_declines() {
		let c: ContentOption = content(b"ab");
		let orig: Cursor<'_> = Cursor::new(b"abxab");
		let mut cursor: Cursor<'_> = orig;

		cursor.pos = 2;
		assert!(c.retry(&cursor, &orig));
		cursor.pos = 5;
		assert!(!c.retry(&cursor, &orig));

		let negated: ContentOption = ContentOption::new(b"ab".to_vec(), false, true, false, 0, None);
		cursor.pos = 0;
		assert!(!negated.retry(&cursor, &orig));
	}

	#[test]
	fn unbounded() {
		assert!(content(b"x").is_unbounded());
		let mut bounded: ContentOption = content(b"x");
		bounded.depth = Some(10);
		assert!(!bounded.is_unbounded());
	}
}
