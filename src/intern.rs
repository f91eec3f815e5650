use crate::options::RuleOption;
use crate::tree::Arena;
use crate::tree::NodeId;
use crate::tree::OptionRef;
use crate::tree::RuleId;

/// Fixed rounded bucket counts, sized for large rule sets; chains stay short
/// and the tables are built once per configuration.
const OPTION_BUCKETS: usize = 16 * 1024;
const TREE_BUCKETS: usize = 8 * 1024;

// Bob Jenkins' lookup3 mixer; the recursive tree hash and the per-kind
// option hashes both run their words through it.

macro_rules! rot {
	($x:expr, $k:expr) => {
		$x.rotate_left($k)
	};
}

fn mix(a: &mut u32, b: &mut u32, c: &mut u32) {
	*a = a.wrapping_sub(*c) ^ rot!(*c, 4);
	*c = c.wrapping_add(*b);
	*b = b.wrapping_sub(*a) ^ rot!(*a, 6);
	*a = a.wrapping_add(*c);
	*c = c.wrapping_sub(*b) ^ rot!(*b, 8);
	*b = b.wrapping_add(*a);
	*a = a.wrapping_sub(*c) ^ rot!(*c, 16);
	*c = c.wrapping_add(*b);
	*b = b.wrapping_sub(*a) ^ rot!(*a, 19);
	*a = a.wrapping_add(*c);
	*c = c.wrapping_sub(*b) ^ rot!(*b, 4);
	*b = b.wrapping_add(*a);
}

fn finalize(a: &mut u32, b: &mut u32, c: &mut u32) {
	*c = (*c ^ *b).wrapping_sub(rot!(*b, 14));
	*a = (*a ^ *c).wrapping_sub(rot!(*c, 11));
	*b = (*b ^ *a).wrapping_sub(rot!(*a, 25));
	*c = (*c ^ *b).wrapping_sub(rot!(*b, 16));
	*a = (*a ^ *c).wrapping_sub(rot!(*c, 4));
	*b = (*b ^ *a).wrapping_sub(rot!(*a, 14));
	*c = (*c ^ *b).wrapping_sub(rot!(*b, 24));
}

pub(crate) fn hash_words(seed: u32, words: &[u32]) -> u32 {
	let mut a: u32 = 0x9e37_79b9;
	let mut b: u32 = 0x9e37_79b9;
	let mut c: u32 = seed;

	for chunk in words.chunks(3) {
		a = a.wrapping_add(chunk[0]);
		if let Some(&w) = chunk.get(1) {
			b = b.wrapping_add(w);
		}
		if let Some(&w) = chunk.get(2) {
			c = c.wrapping_add(w);
		}
		mix(&mut a, &mut b, &mut c);
	}

	finalize(&mut a, &mut b, &mut c);
	c
}

/// Identity of an interned option within its configuration's table.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct OptionId(pub usize);

/// Interns rule options by (domain hash, structural equality). The table
/// owns its options; a duplicate handed to [`OptionTable::intern`] is simply
/// dropped in favor of the existing handle.
#[derive(Debug)]
pub struct OptionTable {
	buckets: Vec<Vec<OptionId>>,
	options: Vec<RuleOption>,
}

impl OptionTable {
	pub fn new() -> Self {
		Self {
			buckets: vec![Vec::new(); OPTION_BUCKETS],
			options: Vec::new(),
		}
	}

	pub fn len(&self) -> usize {
		self.options.len()
	}

	pub fn intern(&mut self, option: RuleOption) -> OptionId {
		let bucket: usize = option.hash() as usize & (OPTION_BUCKETS - 1);

		for &id in self.buckets[bucket].iter() {
			if self.options[id.0] == option {
				return id;
			}
		}

		let id: OptionId = OptionId(self.options.len());
		self.options.push(option);
		self.buckets[bucket].push(id);
		id
	}
}

impl Default for OptionTable {
	fn default() -> Self {
		Self::new()
	}
}

impl std::ops::Index<OptionId> for OptionTable {
	type Output = RuleOption;

	fn index(&self, i: OptionId) -> &Self::Output {
		&self.options[i.0]
	}
}

/// Key of an interned subtree. A dedicated type: tree entries never alias an
/// option kind, and the stored hash makes bucket-chain comparisons cheap.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct TreeKey {
	hash: u32,
}

/// Interns whole subtrees by recursive structural equality. Entries are weak
/// indices into the configuration's arena; duplicate subtrees stay allocated
/// there (unreferenced) until the arena retires.
#[derive(Debug)]
pub struct TreeTable {
	buckets: Vec<Vec<(TreeKey, NodeId)>>,
	len: usize,
}

impl TreeTable {
	pub fn new() -> Self {
		Self {
			buckets: vec![Vec::new(); TREE_BUCKETS],
			len: 0,
		}
	}

	pub fn len(&self) -> usize {
		self.len
	}

	pub fn intern(&mut self, arena: &Arena, root: NodeId) -> NodeId {
		let key: TreeKey = TreeKey {
			hash: tree_hash(arena, root),
		};
		let bucket: usize = key.hash as usize & (TREE_BUCKETS - 1);

		for &(existing_key, existing) in self.buckets[bucket].iter() {
			if existing_key == key && arena.subtree_equal(existing, root) {
				return existing;
			}
		}

		self.buckets[bucket].push((key, root));
		self.len += 1;
		root
	}
}

impl Default for TreeTable {
	fn default() -> Self {
		Self::new()
	}
}

/// Recursive hash mixing each child's option identity, subtree hash and
/// child count.
fn tree_hash(arena: &Arena, node: NodeId) -> u32 {
	let mut a: u32 = 0;
	let mut b: u32 = 0;
	let mut c: u32 = 0;

	for &child in arena[node].children.iter() {
		let ident: u64 = option_ident(arena[child].option);
		a = a.wrapping_add((ident >> 32) as u32);
		b = b.wrapping_add(ident as u32);
		c = c.wrapping_add(tree_hash(arena, child));
		mix(&mut a, &mut b, &mut c);
		a = a.wrapping_add(arena[child].children.len() as u32);
		mix(&mut a, &mut b, &mut c);
	}

	finalize(&mut a, &mut b, &mut c);
	c
}

fn option_ident(option: OptionRef) -> u64 {
	match option {
		OptionRef::Leaf(RuleId(rule)) => (1u64 << 32) | rule as u64,
		OptionRef::Opt(OptionId(id)) => (2u64 << 32) | id as u64,
	}
}
