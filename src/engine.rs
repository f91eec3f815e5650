use std::sync::Arc;
use std::sync::Mutex;

use crate::content::ContentOption;
use crate::content::parse_literal;
use crate::dfa::Matcher;
use crate::dfa::NegHandle;
use crate::dfa::Summary;
use crate::dfa::TreeAgent;
use crate::dfa::TreeHandle;
use crate::eval::DetectionGraph;
use crate::eval::EvalData;
use crate::eval::WorkerContext;
use crate::eval::eval_root;
use crate::eval::stamp_negated;
use crate::intern::OptionId;
use crate::intern::OptionTable;
use crate::intern::TreeTable;
use crate::latency::LatencySettings;
use crate::options::ByteExtractOption;
use crate::options::ByteTestOption;
use crate::options::BufferSetOption;
use crate::options::FlowbitOption;
use crate::options::RuleOption;
use crate::options::SdPatternOption;
use crate::options::TestValue;
use crate::packet::Event;
use crate::packet::Flow;
use crate::packet::Packet;
use crate::packet::RuntimeCounters;
use crate::packet::ServiceId;
use crate::pattern::PatternStore;
use crate::pattern::UserId;
use crate::rules::ConfigError;
use crate::rules::OptionSpec;
use crate::rules::RuleInfo;
use crate::rules::RuleSpec;
use crate::tree::NodeId;
use crate::tree::OptionRef;
use crate::tree::RuleId;
use crate::tree::TreeRoot;
use crate::tree::Arena;

/// Back-pointer behind each MPM pattern: which rule it fronts, and (for a
/// negated pattern) which content option the scan result settles.
#[derive(Debug, Clone, Copy)]
struct PatternUser {
	rule: RuleId,
	neg_option: Option<OptionId>,
}

/// Everything compiled from one rule set; immutable and shared by workers
/// through an [`Arc`].
#[derive(Debug)]
pub(crate) struct Compiled {
	matcher: Matcher,
	detection: DetectionGraph,
	neg_lists: Vec<Vec<OptionId>>,
	/// Root for rules with no usable literal, evaluated for every packet.
	catch_all: Option<TreeHandle>,
	services: Vec<String>,
	flowbit_names: Vec<String>,
	workers: usize,
}

/// A compiled configuration handle. Cloning is cheap; the underlying graph
/// drops once the last worker lets go of it.
#[derive(Debug, Clone)]
pub struct Config {
	inner: Arc<Compiled>,
}

pub fn configure(rules: Vec<RuleSpec>, workers: usize) -> Result<Config, ConfigError> {
	configure_with_latency(rules, workers, LatencySettings::default())
}

#[tracing::instrument(skip_all, fields(rules = rules.len(), workers))]
pub fn configure_with_latency(
	rules: Vec<RuleSpec>,
	workers: usize,
	latency: LatencySettings,
) -> Result<Config, ConfigError> {
	if workers == 0 {
		return Err(ConfigError::NoWorkers);
	}
	if rules.is_empty() {
		return Err(ConfigError::NoRules);
	}

	let mut options: OptionTable = OptionTable::new();
	/// Relativity per interned option id, for tree-node construction.
	let mut option_relative: Vec<bool> = Vec::new();
	let mut services: Vec<String> = Vec::new();
	let mut flowbit_names: Vec<String> = Vec::new();
	let mut infos: Vec<RuleInfo> = Vec::new();
	let mut chains: Vec<Vec<OptionRef>> = Vec::new();
	let mut store: PatternStore = PatternStore::new();
	let mut users: Vec<PatternUser> = Vec::new();
	let mut catch_all_rules: Vec<RuleId> = Vec::new();

	for (idx, spec) in rules.iter().enumerate() {
		let rule: RuleId = RuleId(idx);
		if spec.options.is_empty() {
			return Err(ConfigError::EmptyRule {
				gid: spec.gid,
				sid: spec.sid,
			});
		}

		let mut chain: Vec<OptionRef> = Vec::new();
		/// (id, content) per content option, for fast-pattern selection and
		/// negated-pattern registration.
		let mut contents: Vec<(OptionId, ContentOption)> = Vec::new();

		for option_spec in spec.options.iter() {
			let option: RuleOption = resolve_option(option_spec, spec, &mut flowbit_names)?;
			let content: Option<ContentOption> = option.content().cloned();
			let relative: bool = option.is_relative();
			let id: OptionId = options.intern(option);
			if id.0 == option_relative.len() {
				option_relative.push(relative);
			}
			if let Some(content) = content {
				contents.push((id, content));
			}
			chain.push(OptionRef::Opt(id));
		}
		chain.push(OptionRef::Leaf(rule));

		/// Fast pattern: the longest non-negated literal; first declared wins
		/// ties. Rules without one fall back to the catch-all root.
		let fast: Option<&(OptionId, ContentOption)> = contents
			.iter()
			.filter(|(_, c)| !c.negated)
			.max_by(|(_, a), (_, b)| {
				// Ties resolve Greater so the first-declared literal wins.
				a.pattern()
					.len()
					.cmp(&b.pattern().len())
					.then(std::cmp::Ordering::Greater)
			});

		match fast {
			Some((_, content)) => {
				let user: UserId = UserId(users.len());
				users.push(PatternUser {
					rule,
					neg_option: None,
				});
				store.add_pattern(content.pattern(), content.nocase, false, user);
			},
			None => catch_all_rules.push(rule),
		}

		/// Negated, position-independent literals also feed the matcher so a
		/// scan hit can settle them without a tree-side search.
		for (id, content) in contents.iter() {
			if content.negated && !content.relative && content.offset == 0 && content.depth.is_none() {
				let user: UserId = UserId(users.len());
				users.push(PatternUser {
					rule,
					neg_option: Some(*id),
				});
				store.add_pattern(content.pattern(), content.nocase, true, user);
			}
		}

		infos.push(RuleInfo {
			gid: spec.gid,
			sid: spec.sid,
			rev: spec.rev,
			services: spec
				.services
				.iter()
				.map(|name| ServiceId(intern_name(&mut services, name)))
				.collect::<Vec<_>>(),
			src_ports: spec.src_ports,
			dst_ports: spec.dst_ports,
			filter: spec.detection_filter,
		});
		chains.push(chain);
	}

	let mut builder: TreeBuilder = TreeBuilder {
		arena: Arena::new(),
		tree_table: Mutex::new(TreeTable::new()),
		roots: Vec::new(),
		neg_lists: Vec::new(),
		chains,
		users,
		option_relative,
	};

	let matcher: Matcher = Matcher::compile(store, &mut builder)?;

	let catch_all: Option<TreeHandle> = builder.build_catch_all(&catch_all_rules);

	debug!(
		"configured {} rules: {} interned options, {} arena nodes, {} interned trees, {} roots",
		infos.len(),
		options.len(),
		builder.arena.len(),
		builder.tree_table.lock().unwrap().len(),
		builder.roots.len()
	);

	Ok(Config {
		inner: Arc::new(Compiled {
			matcher,
			detection: DetectionGraph {
				arena: builder.arena,
				options,
				roots: builder.roots,
				rules: infos,
				latency,
			},
			neg_lists: builder.neg_lists,
			catch_all,
			services,
			flowbit_names,
			workers,
		}),
	})
}

fn intern_name(names: &mut Vec<String>, name: &str) -> usize {
	match names.iter().position(|n| n == name) {
		Some(i) => i,
		None => {
			names.push(name.to_owned());
			names.len() - 1
		},
	}
}

fn resolve_option(
	spec: &OptionSpec,
	rule: &RuleSpec,
	flowbit_names: &mut Vec<String>,
) -> Result<RuleOption, ConfigError> {
	let bad = |what: &'static str| ConfigError::BadOption {
		gid: rule.gid,
		sid: rule.sid,
		what,
	};

	match spec {
		OptionSpec::Content {
			pattern,
			nocase,
			negated,
			relative,
			offset,
			depth,
		} => {
			let bytes: Vec<u8> = parse_literal(pattern).map_err(|source| ConfigError::BadPattern {
				gid: rule.gid,
				sid: rule.sid,
				source,
			})?;
			if let Some(depth) = depth {
				if (*depth as usize) < bytes.len() {
					return Err(bad("content depth shorter than the pattern"));
				}
			}
			Ok(RuleOption::Content(ContentOption::new(
				bytes, *nocase, *negated, *relative, *offset, *depth,
			)))
		},
		OptionSpec::Flowbit { op, name } => Ok(RuleOption::Flowbit(FlowbitOption {
			op: *op,
			bit: intern_name(flowbit_names, name),
		})),
		OptionSpec::BufferSet { buffer } => Ok(RuleOption::BufferSet(BufferSetOption { buffer: *buffer })),
		OptionSpec::ByteExtract {
			count,
			offset,
			relative,
			endian,
			var,
		} => {
			if !matches!(count, 1 | 2 | 4) {
				return Err(bad("byte_extract count must be 1, 2 or 4"));
			}
			if *var as usize >= crate::packet::NUM_VARS {
				return Err(bad("byte_extract variable index out of range"));
			}
			Ok(RuleOption::ByteExtract(ByteExtractOption {
				count: *count,
				offset: *offset,
				relative: *relative,
				endian: *endian,
				var: *var,
			}))
		},
		OptionSpec::ByteTest {
			count,
			offset,
			relative,
			endian,
			op,
			value,
		} => {
			if !matches!(count, 1 | 2 | 4) {
				return Err(bad("byte_test count must be 1, 2 or 4"));
			}
			if let TestValue::Var(i) = value {
				if *i as usize >= crate::packet::NUM_VARS {
					return Err(bad("byte_test variable index out of range"));
				}
			}
			Ok(RuleOption::ByteTest(ByteTestOption {
				count: *count,
				offset: *offset,
				relative: *relative,
				endian: *endian,
				op: *op,
				value: *value,
			}))
		},
		OptionSpec::SdPattern { kind, threshold } => {
			if *threshold == 0 {
				return Err(bad("sd_pattern threshold must be at least 1"));
			}
			Ok(RuleOption::SdPattern(SdPatternOption {
				kind: *kind,
				threshold: *threshold,
			}))
		},
	}
}

/// The tree layer's side of the agent contract: accumulates rule chains into
/// per-state roots during matcher compilation, interning finished subtrees.
struct TreeBuilder {
	arena: Arena,
	/// Serializes subtree interning; rule compilation may run concurrently.
	tree_table: Mutex<TreeTable>,
	roots: Vec<TreeRoot>,
	neg_lists: Vec<Vec<OptionId>>,
	chains: Vec<Vec<OptionRef>>,
	users: Vec<PatternUser>,
	option_relative: Vec<bool>,
}

impl TreeAgent for TreeBuilder {
	fn build_tree(&mut self, user: Option<UserId>, tree: &mut Option<TreeHandle>) {
		match user {
			Some(user) => {
				let rule: RuleId = self.users[user.0].rule;
				let handle: TreeHandle = *tree.get_or_insert_with(|| {
					self.roots.push(TreeRoot::default());
					TreeHandle(self.roots.len() - 1)
				});
				let chain: Vec<OptionRef> = self.chains[rule.0].clone();
				self.merge_chain(handle, &chain);
			},
			None => {
				if let Some(handle) = *tree {
					self.finalize_root(handle);
				}
			},
		}
	}

	fn negate_list(&mut self, user: UserId, neg: &mut Option<NegHandle>) {
		let Some(option) = self.users[user.0].neg_option else {
			return;
		};
		let handle: NegHandle = *neg.get_or_insert_with(|| {
			self.neg_lists.push(Vec::new());
			NegHandle(self.neg_lists.len() - 1)
		});
		let list: &mut Vec<OptionId> = &mut self.neg_lists[handle.0];
		if !list.contains(&option) {
			list.push(option);
		}
	}
}

impl TreeBuilder {
	/// Walk the root's existing children, sharing every node whose interned
	/// option matches the chain prefix; append fresh nodes for the rest.
	/// This is what makes two rules with a common option prefix evaluate the
	/// prefix once per packet.
	fn merge_chain(&mut self, handle: TreeHandle, chain: &[OptionRef]) {
		let mut parent: Option<NodeId> = None;
		let mut index: usize = 0;

		loop {
			let children: &[NodeId] = match parent {
				None => &self.roots[handle.0].children,
				Some(p) => &self.arena[p].children,
			};
			let found: Option<NodeId> = children.iter().copied().find(|&c| self.arena[c].option == chain[index]);

			match found {
				Some(shared) if index + 1 < chain.len() => {
					parent = Some(shared);
					index += 1;
				},
				Some(_) => return,
				None => break,
			}
		}

		let mut tail: Option<NodeId> = None;
		for &option in chain[index..].iter().rev() {
			let children: Vec<NodeId> = tail.map(|t| vec![t]).unwrap_or_default();
			let relative: bool = self.option_is_relative(option);
			tail = Some(self.arena.new_node(option, relative, children));
		}

		let new_node: NodeId = tail.expect("chain is never empty");
		match parent {
			None => self.roots[handle.0].children.push(new_node),
			Some(p) => self.arena.add_child(p, new_node),
		}
	}

	fn option_is_relative(&self, option: OptionRef) -> bool {
		match option {
			OptionRef::Leaf(..) => false,
			OptionRef::Opt(id) => self.option_relative[id.0],
		}
	}

	fn finalize_root(&mut self, handle: TreeHandle) {
		let count: usize = self.roots[handle.0].children.len();
		for i in 0..count {
			let child: NodeId = self.roots[handle.0].children[i];
			let interned: NodeId = self.tree_table.lock().unwrap().intern(&self.arena, child);
			self.roots[handle.0].children[i] = interned;
			self.arena.trace_subtree(interned, 0);
		}
	}

	fn build_catch_all(&mut self, rules: &[RuleId]) -> Option<TreeHandle> {
		if rules.is_empty() {
			return None;
		}
		self.roots.push(TreeRoot::default());
		let handle: TreeHandle = TreeHandle(self.roots.len() - 1);
		for &rule in rules.iter() {
			let chain: Vec<OptionRef> = self.chains[rule.0].clone();
			self.merge_chain(handle, &chain);
		}
		self.finalize_root(handle);
		Some(handle)
	}
}

// Accessors
impl Config {
	pub fn worker(&self, thread_id: usize) -> Worker {
		assert!(thread_id < self.inner.workers);
		Worker {
			ctx: WorkerContext::new(thread_id, &self.inner.detection),
			graph: Arc::clone(&self.inner),
		}
	}

	pub fn workers(&self) -> usize {
		self.inner.workers
	}

	pub fn rule_count(&self) -> usize {
		self.inner.detection.rules.len()
	}

	pub fn summary(&self) -> &Summary {
		self.inner.matcher.summary()
	}

	pub fn service_id(&self, name: &str) -> Option<ServiceId> {
		self.inner.services.iter().position(|n| n == name).map(ServiceId)
	}

	pub fn flowbit_id(&self, name: &str) -> Option<usize> {
		self.inner.flowbit_names.iter().position(|n| n == name)
	}
}

/// One packet-inspection thread's handle: the shared compiled graph plus all
/// thread-local evaluation state.
#[derive(Debug)]
pub struct Worker {
	graph: Arc<Compiled>,
	ctx: WorkerContext,
}

impl Worker {
	/// Run the full per-packet pipeline: MPM scan, match fan-out into tree
	/// roots, the catch-all root, and event collection in leaf order.
	pub fn scan_packet(&mut self, packet: &Packet<'_>, flow: &mut Flow) -> Vec<Event> {
		let graph: Arc<Compiled> = Arc::clone(&self.graph);
		let compiled: &Compiled = &graph;

		self.ctx.packet_latency.start_packet();

		let mut events: Vec<Event> = Vec::new();
		let mut data: EvalData<'_, '_> = EvalData::new(packet, &mut flow.bits, &mut events);
		let mut state: usize = 0;
		let ctx: &mut WorkerContext = &mut self.ctx;

		compiled.matcher.scan(packet.payload, &mut state, |event| {
			if let Some(neg) = event.neg {
				stamp_negated(ctx, packet, &compiled.neg_lists[neg.0]);
			}
			if let Some(tree) = event.tree {
				let _ = eval_root(&compiled.detection, tree, ctx, &mut data);
			}
			// Abort the scan only under latency pressure.
			ctx.packet_latency.fastpath()
		});

		if let Some(catch_all) = compiled.catch_all {
			if !ctx.packet_latency.fastpath() {
				let _ = eval_root(&compiled.detection, catch_all, ctx, &mut data);
			}
		}

		drop(data);
		events
	}

	pub fn thread_id(&self) -> usize {
		self.ctx.thread_id
	}

	pub fn counters(&self) -> &RuntimeCounters {
		&self.ctx.counters
	}

	pub fn rule_matches(&self, rule: usize) -> u64 {
		self.ctx.rule_matches[rule]
	}

	/// Pick up a new configuration (reload handoff). The old graph frees
	/// once every worker has adopted the new one.
	pub fn adopt(&mut self, config: &Config) {
		if Arc::ptr_eq(&self.graph, &config.inner) {
			return;
		}
		self.graph = Arc::clone(&config.inner);
		self.ctx.rebind(&config.inner.detection);
	}
}

/// Holds the live configuration for reloads: workers poll [`Engine::current`]
/// between packets and adopt whatever they find.
#[derive(Debug)]
pub struct Engine {
	current: Mutex<Config>,
}

impl Engine {
	pub fn new(config: Config) -> Self {
		Self {
			current: Mutex::new(config),
		}
	}

	pub fn current(&self) -> Config {
		self.current.lock().unwrap().clone()
	}

	pub fn swap(&self, config: Config) -> Config {
		std::mem::replace(&mut self.current.lock().unwrap(), config)
	}
}
