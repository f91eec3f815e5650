use crate::intern::OptionId;

/// Rule descriptor index; leaves point at rules, rules point back at their
/// (gid, sid, rev) identity in the engine's rule table.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct RuleId(pub usize);

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct NodeId(pub usize);

/// What a tree node evaluates: an interned option, or a rule leaf. Interned
/// options compare by table identity, so structural equality of nodes is id
/// equality plus child-list equality.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum OptionRef {
	Leaf(RuleId),
	Opt(OptionId),
}

#[derive(Debug)]
pub struct TreeNode {
	pub option: OptionRef,
	pub children: Vec<NodeId>,
	/// How many children carry cursor-relative options; non-zero enables the
	/// evaluator's retry loop on this node.
	pub relative_children: u32,
	pub is_relative: bool,
	pub rule: Option<RuleId>,
}

impl TreeNode {
	pub fn is_leaf(&self) -> bool {
		self.rule.is_some()
	}
}

/// All nodes of one configuration live in a single arena and drop together
/// when the configuration retires; children are non-owning indices, so the
/// diamond sharing of deduplicated subtrees needs no reference counting.
#[derive(Debug, Default)]
pub struct Arena {
	nodes: Vec<TreeNode>,
}

impl Arena {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn len(&self) -> usize {
		self.nodes.len()
	}

	pub fn new_node(&mut self, option: OptionRef, is_relative: bool, children: Vec<NodeId>) -> NodeId {
		let relative_children: u32 = children.iter().filter(|&&c| self.nodes[c.0].is_relative).count() as u32;
		let rule: Option<RuleId> = match option {
			OptionRef::Leaf(rule) => Some(rule),
			OptionRef::Opt(..) => None,
		};
		let id: NodeId = NodeId(self.nodes.len());
		self.nodes.push(TreeNode {
			option,
			children,
			relative_children,
			is_relative,
			rule,
		});
		id
	}

	pub fn add_child(&mut self, parent: NodeId, child: NodeId) {
		let relative: bool = self.nodes[child.0].is_relative;
		let parent: &mut TreeNode = &mut self.nodes[parent.0];
		parent.children.push(child);
		if relative {
			parent.relative_children += 1;
		}
	}

	/// Recursive structural equality: identical option references and
	/// pairwise-equal child lists.
	pub fn subtree_equal(&self, a: NodeId, b: NodeId) -> bool {
		if a == b {
			return true;
		}
		let (a, b): (&TreeNode, &TreeNode) = (&self.nodes[a.0], &self.nodes[b.0]);
		if a.option != b.option || a.children.len() != b.children.len() {
			return false;
		}
		a.children
			.iter()
			.zip(b.children.iter())
			.all(|(&x, &y)| self.subtree_equal(x, y))
	}

	/// Recursive dump of an interned subtree for debugging.
	pub fn trace_subtree(&self, node: NodeId, level: usize) {
		let n: &TreeNode = &self.nodes[node.0];
		trace!(
			"{}node {} ({} children): {:?}",
			"  ".repeat(level),
			node.0,
			n.children.len(),
			n.option
		);
		for &child in n.children.iter() {
			self.trace_subtree(child, level + 1);
		}
	}
}

impl std::ops::Index<NodeId> for Arena {
	type Output = TreeNode;

	fn index(&self, i: NodeId) -> &Self::Output {
		&self.nodes[i.0]
	}
}

/// One evaluation root per MPM match fan-out set (plus the catch-all root
/// for rules with no usable literal).
#[derive(Debug, Default)]
pub struct TreeRoot {
	pub children: Vec<NodeId>,
}
