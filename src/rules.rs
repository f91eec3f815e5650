use crate::content::LiteralError;
use crate::dfa::BuildError;
use crate::filter::DetectionFilterSpec;
use crate::options::CmpOp;
use crate::options::Endian;
use crate::options::FlowbitOp;
use crate::options::SdKind;
use crate::options::TestValue;
use crate::packet::BufferId;
use crate::packet::Event;
use crate::packet::ServiceId;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("no rules configured")]
	NoRules,
	#[error("at least one worker thread is required")]
	NoWorkers,
	#[error("rule {gid}:{sid} has no options")]
	EmptyRule { gid: u32, sid: u32 },
	#[error("rule {gid}:{sid}: {source}")]
	BadPattern {
		gid: u32,
		sid: u32,
		#[source]
		source: LiteralError,
	},
	#[error("rule {gid}:{sid}: {what}")]
	BadOption { gid: u32, sid: u32, what: &'static str },
	#[error(transparent)]
	Build(#[from] BuildError),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PortRange {
	pub lo: u16,
	pub hi: u16,
}

impl PortRange {
	pub const ANY: Self = Self { lo: 0, hi: u16::MAX };

	pub fn single(port: u16) -> Self {
		Self { lo: port, hi: port }
	}

	pub fn contains(&self, port: u16) -> bool {
		self.lo <= port && port <= self.hi
	}
}

impl Default for PortRange {
	fn default() -> Self {
		Self::ANY
	}
}

/// One rule option as written in the configuration. Order within the rule
/// matters: it is the evaluation order and the tree-construction order.
#[derive(Debug, Clone)]
pub enum OptionSpec {
	Content {
		/// Quoted literal syntax, e.g. `"GET |0D 0A|"`.
		pattern: String,
		nocase: bool,
		negated: bool,
		relative: bool,
		offset: i32,
		depth: Option<u32>,
	},
	Flowbit {
		op: FlowbitOp,
		name: String,
	},
	BufferSet {
		buffer: BufferId,
	},
	ByteExtract {
		count: u8,
		offset: i32,
		relative: bool,
		endian: Endian,
		var: u8,
	},
	ByteTest {
		count: u8,
		offset: i32,
		relative: bool,
		endian: Endian,
		op: CmpOp,
		value: TestValue,
	},
	SdPattern {
		kind: SdKind,
		threshold: u32,
	},
}

impl OptionSpec {
	pub fn content(pattern: &str) -> Self {
		Self::Content {
			pattern: pattern.to_owned(),
			nocase: false,
			negated: false,
			relative: false,
			offset: 0,
			depth: None,
		}
	}

	pub fn content_relative(pattern: &str, distance: i32, within: Option<u32>) -> Self {
		Self::Content {
			pattern: pattern.to_owned(),
			nocase: false,
			negated: false,
			relative: true,
			offset: distance,
			depth: within,
		}
	}

	pub fn content_negated(pattern: &str) -> Self {
		Self::Content {
			pattern: pattern.to_owned(),
			nocase: false,
			negated: true,
			relative: false,
			offset: 0,
			depth: None,
		}
	}

	pub fn flowbit(op: FlowbitOp, name: &str) -> Self {
		Self::Flowbit {
			op,
			name: name.to_owned(),
		}
	}
}

#[derive(Debug, Clone)]
pub struct RuleSpec {
	pub gid: u32,
	pub sid: u32,
	pub rev: u32,
	/// Service names; resolved against the configuration's service table.
	/// A packet whose flow resolved to one of them skips the port check.
	pub services: Vec<String>,
	pub src_ports: PortRange,
	pub dst_ports: PortRange,
	pub detection_filter: Option<DetectionFilterSpec>,
	pub options: Vec<OptionSpec>,
}

impl RuleSpec {
	pub fn new(gid: u32, sid: u32, rev: u32) -> Self {
		Self {
			gid,
			sid,
			rev,
			services: Vec::new(),
			src_ports: PortRange::ANY,
			dst_ports: PortRange::ANY,
			detection_filter: None,
			options: Vec::new(),
		}
	}

	pub fn with_options(mut self, options: Vec<OptionSpec>) -> Self {
		self.options = options;
		self
	}
}

/// Compiled form of a rule's header: what the leaf prefilter and the event
/// queue need at runtime.
#[derive(Debug)]
pub struct RuleInfo {
	pub gid: u32,
	pub sid: u32,
	pub rev: u32,
	pub services: Vec<ServiceId>,
	pub src_ports: PortRange,
	pub dst_ports: PortRange,
	pub filter: Option<DetectionFilterSpec>,
}

impl RuleInfo {
	pub fn event(&self) -> Event {
		Event {
			gid: self.gid,
			sid: self.sid,
			rev: self.rev,
		}
	}
}
