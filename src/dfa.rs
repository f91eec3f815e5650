use crate::pattern::PatternId;
use crate::pattern::PatternStore;
use crate::pattern::UserId;
use crate::pattern::fold_byte;
use crate::trie::GotoTrie;
use crate::trie::StateId;

/// Alphabet of raw bytes. Cells [0] and [1] of every row are metadata
/// (reserved / match flag); [2..258] is the next-state function.
pub const ALPHABET_SIZE: usize = 256;
const STRIDE: usize = ALPHABET_SIZE + 2;

/// Handle to an interned option-tree root, produced by the [`TreeAgent`] and
/// opaque to the matcher.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct TreeHandle(pub usize);

/// Handle to a negated-pattern list, produced by the [`TreeAgent`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct NegHandle(pub usize);

/// Callbacks from the matcher into the detection-tree layer, invoked once per
/// match-list entry at compile time (stage 5) and once per match state with
/// `user = None` to finalize that state's tree.
pub trait TreeAgent {
	fn build_tree(&mut self, user: Option<UserId>, tree: &mut Option<TreeHandle>);
	fn negate_list(&mut self, user: UserId, neg: &mut Option<NegHandle>);
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
	#[error("automaton state count {0} exceeds the 4-byte cell encoding")]
	TooManyStates(usize),
	#[error("internal invariant violated: {0}")]
	Invariant(&'static str),
}

/// One match occurrence, reported at the exclusive end offset of the matched
/// literal: `bytes[end - len .. end]` equals the (folded) pattern.
#[derive(Debug, Clone, Copy)]
pub struct MatchEvent {
	pub pattern: PatternId,
	pub user: UserId,
	pub end: usize,
	pub tree: Option<TreeHandle>,
	pub neg: Option<NegHandle>,
}

pub(crate) trait Cell: Copy {
	const ZERO: Self;

	fn from_usize(v: usize) -> Self;
	fn to_usize(self) -> usize;
}

macro_rules! cell_impl {
	($ty:ty, $($tt:tt)*) => {
		cell_impl!($ty);
		cell_impl!($($tt)*);
	};
	($ty:ty) => {
		impl Cell for $ty {
			const ZERO: Self = 0;

			fn from_usize(v: usize) -> Self {
				v as $ty
			}

			fn to_usize(self) -> usize {
				self as usize
			}
		}
	};
}

cell_impl!(u8, u16, u32);

/// Dense next-state rows. The cell width is chosen from the state count at
/// compile time; row `k` lives at `cells[k * STRIDE .. (k + 1) * STRIDE]`.
#[derive(Debug)]
enum Rows {
	B1(Vec<u8>),
	B2(Vec<u16>),
	B4(Vec<u32>),
}

#[derive(Debug, Default, Clone)]
struct MatchList {
	entries: Vec<PatternId>,
	tree: Option<TreeHandle>,
	neg: Option<NegHandle>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Summary {
	pub num_states: usize,
	pub num_transitions: usize,
	pub num_match_states: usize,
	pub num_patterns: usize,
	pub num_characters: usize,
	pub sizeof_state: usize,
}

/// A compiled Aho-Corasick matcher: immutable after [`Matcher::compile`].
#[derive(Debug)]
pub struct Matcher {
	patterns: PatternStore,
	rows: Rows,
	match_lists: Vec<MatchList>,
	summary: Summary,
}

impl Matcher {
	/// Stages 1-5: goto trie, failure links, DFA lift, dense rows, tree hook.
	/// Deterministic for a given pattern insertion order; state numbering is
	/// trie insertion order.
	#[tracing::instrument(skip_all)]
	pub fn compile(patterns: PatternStore, agent: &mut dyn TreeAgent) -> Result<Self, BuildError> {
		let mut trie: GotoTrie = GotoTrie::new();
		trie.insert_patterns(&patterns);
		trie.build_failure_links();
		trie.lift_to_dfa();

		let num_states: usize = trie.state_count();
		if num_states > u32::MAX as usize {
			return Err(BuildError::TooManyStates(num_states));
		}

		let rows: Rows = if num_states < u8::MAX as usize {
			Rows::B1(fill_rows::<u8>(&trie, num_states))
		} else if num_states < u16::MAX as usize {
			Rows::B2(fill_rows::<u16>(&trie, num_states))
		} else {
			Rows::B4(fill_rows::<u32>(&trie, num_states))
		};

		let mut match_lists: Vec<MatchList> = vec![MatchList::default(); num_states];
		let mut num_match_states: usize = 0;

		for k in 0..num_states {
			let entries: &[PatternId] = trie.matches(StateId(k));
			if entries.is_empty() {
				continue;
			}
			num_match_states += 1;

			let list: &mut MatchList = &mut match_lists[k];
			list.entries = entries.to_owned();

			for &id in list.entries.iter() {
				let user: UserId = patterns[id].user();
				if patterns[id].negated() {
					agent.negate_list(user, &mut list.neg);
				} else {
					agent.build_tree(Some(user), &mut list.tree);
				}
			}
			agent.build_tree(None, &mut list.tree);
		}

		let summary: Summary = Summary {
			num_states,
			num_transitions: trie.transition_count(),
			num_match_states,
			num_patterns: patterns.pattern_count(),
			num_characters: patterns.total_characters(),
			sizeof_state: match &rows {
				Rows::B1(..) => 1,
				Rows::B2(..) => 2,
				Rows::B4(..) => 4,
			},
		};

		debug!(
			"compiled matcher: {} patterns, {} states ({} matching), {} transitions, {}-byte cells",
			summary.num_patterns,
			summary.num_states,
			summary.num_match_states,
			summary.num_transitions,
			summary.sizeof_state
		);

		Ok(Self {
			patterns,
			rows,
			match_lists,
			summary,
		})
	}

	/// Scan `bytes`, folding each input byte, and report every match-list
	/// entry of every match state entered. `on_match` returning `true` stops
	/// the scan. `state` is written back so streaming callers can resume
	/// mid-pattern on the next buffer. Returns the number of entries
	/// reported.
	///
	/// Matches arrive in non-decreasing end-offset order; entries ending at
	/// the same offset follow the match-list order of that state.
	pub fn scan<OnMatch>(&self, bytes: &[u8], state: &mut usize, mut on_match: OnMatch) -> usize
	where
		OnMatch: FnMut(&MatchEvent) -> bool,
	{
		match &self.rows {
			Rows::B1(cells) => self.scan_rows(cells, bytes, state, &mut on_match),
			Rows::B2(cells) => self.scan_rows(cells, bytes, state, &mut on_match),
			Rows::B4(cells) => self.scan_rows(cells, bytes, state, &mut on_match),
		}
	}

	fn scan_rows<C: Cell, OnMatch>(
		&self,
		cells: &[C],
		bytes: &[u8],
		state: &mut usize,
		on_match: &mut OnMatch,
	) -> usize
	where
		OnMatch: FnMut(&MatchEvent) -> bool,
	{
		let mut s: usize = *state;
		let mut nfound: usize = 0;

		for (i, &b) in bytes.iter().enumerate() {
			let c: usize = fold_byte(b) as usize;
			s = cells[s * STRIDE + 2 + c].to_usize();

			if cells[s * STRIDE + 1].to_usize() != 0 {
				let list: &MatchList = &self.match_lists[s];
				for &pattern in list.entries.iter() {
					nfound += 1;
					let event: MatchEvent = MatchEvent {
						pattern,
						user: self.patterns[pattern].user(),
						end: i + 1,
						tree: list.tree,
						neg: list.neg,
					};
					if on_match(&event) {
						*state = s;
						return nfound;
					}
				}
			}
		}

		*state = s;
		nfound
	}
}

// Accessors
impl Matcher {
	pub fn pattern_count(&self) -> usize {
		self.patterns.pattern_count()
	}

	pub fn summary(&self) -> &Summary {
		&self.summary
	}

	pub fn patterns(&self) -> &PatternStore {
		&self.patterns
	}
}

fn fill_rows<C: Cell>(trie: &GotoTrie, num_states: usize) -> Vec<C> {
	/// Missing cells stay zero: at the root that is the implicit self loop,
	/// elsewhere the lift already patched every reachable transition.
	let mut cells: Vec<C> = vec![C::ZERO; num_states * STRIDE];

	for k in 0..num_states {
		let row: &mut [C] = &mut cells[k * STRIDE..(k + 1) * STRIDE];
		row[1] = C::from_usize(if trie.matches(StateId(k)).is_empty() { 0 } else { 1 });
		for b in 0u8..=255 {
			if let Some(target) = trie.edge(StateId(k), b) {
				row[2 + b as usize] = C::from_usize(target.0);
			}
		}
	}

	cells
}

#[cfg(test)]
mod test {
	use super::*;

	/// Stage-5 stub: every pattern-bearing state gets tree handle 0.
	struct NullAgent;

	impl TreeAgent for NullAgent {
		fn build_tree(&mut self, user: Option<UserId>, tree: &mut Option<TreeHandle>) {
			if user.is_some() && tree.is_none() {
				*tree = Some(TreeHandle(0));
			}
		}

		fn negate_list(&mut self, _user: UserId, neg: &mut Option<NegHandle>) {
			if neg.is_none() {
				*neg = Some(NegHandle(0));
			}
		}
	}

	fn compile(patterns: &[&[u8]]) -> Matcher {
		let mut store: PatternStore = PatternStore::new();
		for (i, p) in patterns.iter().enumerate() {
			store.add_pattern(p, false, false, UserId(i));
		}
		Matcher::compile(store, &mut NullAgent).unwrap()
	}

	fn collect(matcher: &Matcher, input: &[u8]) -> Vec<(usize, usize)> {
		let mut state: usize = 0;
		let mut found: Vec<(usize, usize)> = Vec::new();
		matcher.scan(input, &mut state, |event| {
			found.push((event.user.0, event.end));
			false
		});
		found
	}

	#[test]
	fn ushers() {
		let matcher: Matcher = compile(&[b"he", b"she", b"his", b"hers"]);

		/// "she" and "he" both end after byte 3; "she" first because the
		/// state's own pattern precedes its failure-copied one.
		let found: Vec<(usize, usize)> = collect(&matcher, b"ushers");
		assert_eq!(found, vec![(1, 4), (0, 4), (3, 6)]);
	}

	#[test]
	fn nocase_fold() {
		let matcher: Matcher = compile(&[b"AB"]);
		let found: Vec<(usize, usize)> = collect(&matcher, b"xxaBxx");
		assert_eq!(found, vec![(0, 4)]);
	}

	#[test]
	fn every_occurrence_reported_once() {
		let matcher: Matcher = compile(&[b"aa"]);
		/// Overlapping occurrences all count.
		let found: Vec<(usize, usize)> = collect(&matcher, b"aaaa");
		assert_eq!(found, vec![(0, 2), (0, 3), (0, 4)]);
	}

	#[test]
	fn streaming_resume() {
		let matcher: Matcher = compile(&[b"hello"]);
		let mut state: usize = 0;
		let mut found: Vec<usize> = Vec::new();

		matcher.scan(b"xxhel", &mut state, |event| {
			found.push(event.end);
			false
		});
		/// Resumes mid-pattern; end offset is relative to the second buffer.
		matcher.scan(b"loyy", &mut state, |event| {
			found.push(event.end);
			false
		});
		assert_eq!(found, vec![2]);
	}

	#[test]
	fn early_termination() {
		let matcher: Matcher = compile(&[b"a"]);
		let mut state: usize = 0;
		let n: usize = matcher.scan(b"aaaa", &mut state, |_| true);
		assert_eq!(n, 1);
	}

	#[test]
	fn deterministic_rebuild() {
		let a: Matcher = compile(&[b"he", b"she", b"his", b"hers"]);
		let b: Matcher = compile(&[b"he", b"she", b"his", b"hers"]);
		assert_eq!(collect(&a, b"ushers his"), collect(&b, b"ushers his"));
		assert_eq!(a.summary().num_states, b.summary().num_states);
		assert_eq!(a.summary().num_transitions, b.summary().num_transitions);
	}

	#[test]
	fn summary_counts() {
		let matcher: Matcher = compile(&[b"he", b"she", b"his", b"hers"]);
		let summary: &Summary = matcher.summary();
		assert_eq!(summary.num_patterns, 4);
		assert_eq!(summary.num_characters, 12);
		assert_eq!(summary.num_states, 10);
		/// "he", "she", "his" and "hers" each terminate a distinct state.
		assert_eq!(summary.num_match_states, 4);
		assert_eq!(summary.sizeof_state, 1);
	}
}
