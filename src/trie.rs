use std::collections::VecDeque;

use crate::pattern::PatternId;
use crate::pattern::PatternStore;

/// Build-time goto trie for the Aho-Corasick automaton.
///
/// Sparse edge lists only; this structure exists between `insert_patterns`
/// and the dense-row conversion in [`crate::dfa`], after which it is dropped.
#[derive(Debug)]
pub(crate) struct GotoTrie {
	states: Vec<TrieNode>,
	/// Breadth-first visit order recorded while building failure links;
	/// the DFA lift replays it so a state's failure row is always complete
	/// before the state itself is patched.
	bfs: Vec<StateId>,
}

#[derive(Debug, Default)]
pub(crate) struct TrieNode {
	/// Sorted by byte so per-state iteration follows alphabet order,
	/// which keeps state numbering deterministic across builds.
	edges: Vec<(u8, StateId)>,
	fail: StateId,
	matches: Vec<PatternId>,
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub(crate) struct StateId(pub(crate) usize);

pub(crate) const ROOT: StateId = StateId(0);

impl GotoTrie {
	pub(crate) fn new() -> Self {
		Self {
			states: vec![TrieNode::default()],
			bfs: Vec::new(),
		}
	}

	pub(crate) fn state_count(&self) -> usize {
		self.states.len()
	}

	pub(crate) fn transition_count(&self) -> usize {
		self.states.iter().map(|s| s.edges.len()).sum()
	}

	pub(crate) fn matches(&self, s: StateId) -> &[PatternId] {
		&self.states[s.0].matches
	}

	pub(crate) fn edge(&self, s: StateId, byte: u8) -> Option<StateId> {
		let edges: &[(u8, StateId)] = &self.states[s.0].edges;
		edges
			.binary_search_by_key(&byte, |&(b, _)| b)
			.ok()
			.map(|i| edges[i].1)
	}

	fn put_edge(&mut self, s: StateId, byte: u8, target: StateId) {
		let edges: &mut Vec<(u8, StateId)> = &mut self.states[s.0].edges;
		match edges.binary_search_by_key(&byte, |&(b, _)| b) {
			Ok(i) => edges[i].1 = target,
			Err(i) => edges.insert(i, (byte, target)),
		}
	}

	fn new_state(&mut self) -> StateId {
		let id: StateId = StateId(self.states.len());
		self.states.push(TrieNode::default());
		id
	}

	/// Stage 1: extend the trie with one pattern's folded bytes and append
	/// the pattern to the final state's match list.
	pub(crate) fn insert(&mut self, folded: &[u8], pattern: PatternId) {
		let mut state: StateId = ROOT;
		let mut consumed: usize = 0;

		for &b in folded.iter() {
			match self.edge(state, b) {
				Some(next) => {
					state = next;
					consumed += 1;
				},
				None => break,
			}
		}

		for &b in folded[consumed..].iter() {
			let next: StateId = self.new_state();
			self.put_edge(state, b, next);
			state = next;
		}

		self.states[state.0].matches.push(pattern);
	}

	pub(crate) fn insert_patterns(&mut self, store: &PatternStore) {
		for (id, pattern) in store.iter() {
			self.insert(pattern.folded(), id);
		}
	}

	/// Stage 2: breadth-first failure links. Each state's match list absorbs
	/// its failure target's list, so the deepest state reports every pattern
	/// that ends there.
	pub(crate) fn build_failure_links(&mut self) {
		let mut queue: VecDeque<StateId> = VecDeque::new();

		self.bfs.clear();

		for i in 0..self.states[ROOT.0].edges.len() {
			let (_, s): (u8, StateId) = self.states[ROOT.0].edges[i];
			self.states[s.0].fail = ROOT;
			queue.push_back(s);
		}

		while let Some(r) = queue.pop_front() {
			self.bfs.push(r);

			for i in 0..self.states[r.0].edges.len() {
				let (b, s): (u8, StateId) = self.states[r.0].edges[i];
				queue.push_back(s);

				let mut f: StateId = self.states[r.0].fail;
				let target: StateId = loop {
					match self.edge(f, b) {
						Some(t) => break t,
						None => {
							if f == ROOT {
								break ROOT;
							}
							f = self.states[f.0].fail;
						},
					}
				};

				self.states[s.0].fail = target;

				let copied: Vec<PatternId> = self.states[target.0].matches.clone();
				self.states[s.0].matches.extend(copied);
			}
		}
	}

	/// Stage 3: lift to a DFA by filling each state's missing transitions
	/// from its failure target's row. Replaying the stage-2 BFS order means
	/// the failure target (strictly shallower) has already been patched, so a
	/// single lookup suffices; a missing edge at the root is an implicit
	/// transition back to the root. Failure links are dead after this pass.
	pub(crate) fn lift_to_dfa(&mut self) {
		for i in 0..self.bfs.len() {
			let r: StateId = self.bfs[i];
			let f: StateId = self.states[r.0].fail;
			for b in 0u8..=255 {
				if self.edge(r, b).is_none() {
					let target: StateId = self.edge(f, b).unwrap_or(ROOT);
					if target != ROOT {
						self.put_edge(r, b, target);
					}
				}
			}
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::pattern::UserId;

	fn store(patterns: &[&[u8]]) -> PatternStore {
		let mut store: PatternStore = PatternStore::new();
		for (i, p) in patterns.iter().enumerate() {
			store.add_pattern(p, false, false, UserId(i));
		}
		store
	}

	#[test]
	fn goto_construction() {
		let store: PatternStore = store(&[b"HE", b"SHE", b"HIS", b"HERS"]);
		let mut trie: GotoTrie = GotoTrie::new();
		trie.insert_patterns(&store);

		/// "HE" and "HERS" share two states; "HIS" shares one.
		/// 2 + 3 + 2 + 2 new states plus the root.
		assert_eq!(trie.state_count(), 10);

		let h: StateId = trie.edge(ROOT, b'H').unwrap();
		let he: StateId = trie.edge(h, b'E').unwrap();
		assert_eq!(trie.matches(he), &[PatternId(0)]);
	}

	#[test]
	fn failure_links_copy_matches() {
		let store: PatternStore = store(&[b"HE", b"SHE", b"HIS", b"HERS"]);
		let mut trie: GotoTrie = GotoTrie::new();
		trie.insert_patterns(&store);
		trie.build_failure_links();

		/// The state for "SHE" must also report "HE".
		let s: StateId = trie.edge(ROOT, b'S').unwrap();
		let sh: StateId = trie.edge(s, b'H').unwrap();
		let she: StateId = trie.edge(sh, b'E').unwrap();
		assert_eq!(trie.matches(she), &[PatternId(1), PatternId(0)]);
	}

	#[test]
	fn dfa_lift_short_circuits() {
		let store: PatternStore = store(&[b"HE", b"SHE"]);
		let mut trie: GotoTrie = GotoTrie::new();
		trie.insert_patterns(&store);
		trie.build_failure_links();
		trie.lift_to_dfa();

		/// After "SH", seeing 'H' must land on the "H" state directly
		/// instead of requiring failure-link chasing at scan time.
		let s: StateId = trie.edge(ROOT, b'S').unwrap();
		let sh: StateId = trie.edge(s, b'H').unwrap();
		let h: StateId = trie.edge(ROOT, b'H').unwrap();
		assert_eq!(trie.edge(sh, b'H'), Some(h));
		assert_eq!(trie.edge(sh, b'S'), Some(s));
	}
}
