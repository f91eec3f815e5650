use std::time::Duration;
use std::time::Instant;

use crate::content::ContentOption;
use crate::dfa::TreeHandle;
use crate::filter::FilterState;
use crate::intern::OptionId;
use crate::intern::OptionTable;
use crate::latency::LatencySettings;
use crate::latency::PacketLatency;
use crate::latency::RuleLatencyState;
use crate::latency::RuleTimer;
use crate::latency::check_suspended;
use crate::options::EvalStatus;
use crate::options::OptionKind;
use crate::options::RuleOption;
use crate::packet::ByteVars;
use crate::packet::Cursor;
use crate::packet::Event;
use crate::packet::FlowBits;
use crate::packet::NUM_VARS;
use crate::packet::Packet;
use crate::packet::RuntimeCounters;
use crate::packet::Timeval;
use crate::rules::RuleInfo;
use crate::tree::Arena;
use crate::tree::NodeId;
use crate::tree::OptionRef;
use crate::tree::TreeRoot;

/// The read-only compiled detection state shared by every worker: the arena,
/// the interned options, the evaluation roots and the rule headers.
#[derive(Debug)]
pub struct DetectionGraph {
	pub(crate) arena: Arena,
	pub(crate) options: OptionTable,
	pub(crate) roots: Vec<TreeRoot>,
	pub(crate) rules: Vec<RuleInfo>,
	pub(crate) latency: LatencySettings,
}

/// Packet identity for per-node memoization: a node whose stored fingerprint
/// equals the current packet's has already been evaluated for it.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub(crate) struct Fingerprint {
	ts: Timeval,
	run_num: u32,
	context_num: u64,
	rebuild: bool,
}

impl Fingerprint {
	fn of(packet: &Packet<'_>, run_num: u32) -> Self {
		Self {
			ts: packet.ts,
			run_num,
			context_num: packet.context_num,
			rebuild: packet.rebuilt_stream,
		}
	}
}

#[derive(Debug, Clone, Default)]
struct LastCheck {
	fingerprint: Fingerprint,
	flowbit_failed: bool,
	result: i32,
}

/// Evaluation state of one (node, worker) pair. Owned by the worker, indexed
/// by arena node id; only worker `thread_id` ever touches its table.
#[derive(Debug, Clone, Default)]
pub struct NodeState {
	last_check: LastCheck,
	/// Most recent subtree result, consulted by the parent's retry loop.
	result: i32,
	pub checks: u64,
	pub elapsed: Duration,
	pub elapsed_match: Duration,
	pub elapsed_no_match: Duration,
	pub latency_timeouts: u64,
	pub latency_suspends: u64,
}

/// Everything one worker owns: node states, pattern-match stamps, counters,
/// the detection-filter windows and the latency monitors.
#[derive(Debug)]
pub struct WorkerContext {
	pub thread_id: usize,
	/// Bumped on configuration adoption so stale fingerprints cannot hit.
	pub run_num: u32,
	pub(crate) node_states: Vec<NodeState>,
	pub(crate) root_latency: Vec<RuleLatencyState>,
	/// Per-pattern-match fingerprints, indexed by interned option id; stamped
	/// by the match fan-out for negated patterns the scan already vouched for.
	pmd_stamps: Vec<Fingerprint>,
	pub rule_matches: Vec<u64>,
	pub counters: RuntimeCounters,
	pub(crate) filter: FilterState,
	pub(crate) packet_latency: PacketLatency,
}

impl WorkerContext {
	pub(crate) fn new(thread_id: usize, graph: &DetectionGraph) -> Self {
		Self {
			thread_id,
			run_num: 1,
			node_states: vec![NodeState::default(); graph.arena.len()],
			root_latency: vec![RuleLatencyState::default(); graph.roots.len()],
			pmd_stamps: vec![Fingerprint::default(); graph.options.len()],
			rule_matches: vec![0; graph.rules.len()],
			counters: RuntimeCounters::default(),
			filter: FilterState::new(),
			packet_latency: PacketLatency::new(graph.latency.max_packet_time),
		}
	}

	/// Re-size state tables for a newly adopted configuration and invalidate
	/// every cached fingerprint by advancing the run number.
	pub(crate) fn rebind(&mut self, graph: &DetectionGraph) {
		self.node_states = vec![NodeState::default(); graph.arena.len()];
		self.root_latency = vec![RuleLatencyState::default(); graph.roots.len()];
		self.pmd_stamps = vec![Fingerprint::default(); graph.options.len()];
		self.rule_matches = vec![0; graph.rules.len()];
		self.packet_latency = PacketLatency::new(graph.latency.max_packet_time);
		self.run_num += 1;
	}

	pub(crate) fn stamp_pmd(&mut self, id: OptionId, packet: &Packet<'_>) {
		self.pmd_stamps[id.0] = Fingerprint::of(packet, self.run_num);
	}

	pub fn node_state(&self, node: NodeId) -> &NodeState {
		&self.node_states[node.0]
	}
}

/// Per-packet mutable evaluation state threaded through the tree walk.
#[derive(Debug)]
pub struct EvalData<'a, 'buf> {
	pub packet: &'a Packet<'buf>,
	pub flow: &'a mut FlowBits,
	pub events: &'a mut Vec<Event>,
	pub vars: ByteVars,
	pub flowbit_failed: bool,
	pub flowbit_noalert: bool,
}

impl<'a, 'buf> EvalData<'a, 'buf> {
	pub fn new(packet: &'a Packet<'buf>, flow: &'a mut FlowBits, events: &'a mut Vec<Event>) -> Self {
		Self {
			packet,
			flow,
			events,
			vars: [0; NUM_VARS],
			flowbit_failed: false,
			flowbit_noalert: false,
		}
	}
}

fn node_option<'g>(graph: &'g DetectionGraph, node: NodeId) -> Option<&'g RuleOption> {
	match graph.arena[node].option {
		OptionRef::Opt(id) => Some(&graph.options[id]),
		OptionRef::Leaf(..) => None,
	}
}

fn node_kind(graph: &DetectionGraph, node: NodeId) -> OptionKind {
	match graph.arena[node].option {
		OptionRef::Leaf(..) => OptionKind::Leaf,
		OptionRef::Opt(id) => graph.options[id].kind(),
	}
}

fn node_content<'g>(graph: &'g DetectionGraph, node: NodeId) -> Option<&'g ContentOption> {
	node_option(graph, node).and_then(RuleOption::content)
}

/// Evaluate one tree node against the packet. Returns the number of fully
/// resolved branches below it (a leaf contributes 1); 0 means no match.
///
/// Memoization happens here: a non-relative node already evaluated for this
/// packet identity returns its cached result without touching counters.
pub fn evaluate<'buf>(
	graph: &DetectionGraph,
	node: NodeId,
	ctx: &mut WorkerContext,
	data: &mut EvalData<'_, 'buf>,
	orig_cursor: Cursor<'buf>,
) -> i32 {
	let current: Fingerprint = Fingerprint::of(data.packet, ctx.run_num);

	if !graph.arena[node].is_relative {
		let last: &LastCheck = &ctx.node_states[node.0].last_check;
		if last.fingerprint == current
			&& !data.packet.allow_multiple_detect
			&& !last.flowbit_failed
			&& !data.packet.ip_rule_second_pass
			&& !data.packet.udp_tunneled
		{
			trace!("node {}: evaluated before, cached result {}", node.0, last.result);
			return last.result;
		}
	}

	{
		let state: &mut NodeState = &mut ctx.node_states[node.0];
		state.last_check.fingerprint = current;
		state.last_check.flowbit_failed = false;
	}

	let started: Instant = Instant::now();
	let result: i32 = evaluate_inner(graph, node, ctx, data, orig_cursor, current);
	let elapsed: Duration = started.elapsed();

	let state: &mut NodeState = &mut ctx.node_states[node.0];
	state.checks += 1;
	state.elapsed += elapsed;
	if result != 0 {
		state.elapsed_match += elapsed;
	} else {
		state.elapsed_no_match += elapsed;
	}

	result
}

fn evaluate_inner<'buf>(
	graph: &DetectionGraph,
	node: NodeId,
	ctx: &mut WorkerContext,
	data: &mut EvalData<'_, 'buf>,
	orig_cursor: Cursor<'buf>,
	current: Fingerprint,
) -> i32 {
	let option: Option<&RuleOption> = node_option(graph, node);
	/// Literal contents get the secondary per-pattern-match suppression.
	let pmd: Option<OptionId> = match graph.arena[node].option {
		OptionRef::Opt(id) if graph.options[id].content().is_some() => Some(id),
		_ => None,
	};

	let mut result: i32 = 0;
	let mut cursor: Cursor<'buf> = orig_cursor;
	let mut continue_loop: bool = true;
	let mut flowbits_setop: bool = false;
	let mut loop_count: i32 = 0;
	let mut tmp_noalert: bool = false;

	loop {
		let mut rval: EvalStatus = EvalStatus::NoMatch;

		if let Some(rule) = graph.arena[node].rule {
			let info: &RuleInfo = &graph.rules[rule.0];
			let mut check_ports: bool = true;
			let mut prefilter_failed: bool = false;

			if let Some(service) = data.packet.service {
				if info.services.contains(&service) {
					check_ports = false;
				} else if !info.services.is_empty() {
					debug!("rule {}:{} skipped: service mismatch", info.gid, info.sid);
					prefilter_failed = true;
				}
			}

			if !prefilter_failed
				&& check_ports
				&& !(info.src_ports.contains(data.packet.src_port) && info.dst_ports.contains(data.packet.dst_port))
			{
				prefilter_failed = true;
			}

			if prefilter_failed {
				break;
			}

			let allowed: bool = match &info.filter {
				Some(spec) => ctx
					.filter
					.test(rule, data.packet.src, data.packet.dst, data.packet.ts.sec, spec),
				None => true,
			};

			if allowed {
				ctx.rule_matches[rule.0] += 1;
				if !data.flowbit_noalert {
					debug!("matched rule {}:{}:{}", info.gid, info.sid, info.rev);
					data.events.push(info.event());
				}
				result = 1;
				rval = EvalStatus::Match;
			}
		} else if let Some(option) = option {
			match option.kind() {
				OptionKind::Content => {
					/// The fan-out already proved this (negated, non-relative)
					/// content cannot match differently for this packet.
					let suppressed: bool = pmd.is_some_and(|id| ctx.pmd_stamps[id.0] == current);
					if suppressed {
						rval = EvalStatus::NoMatch;
					} else {
						rval = option.evaluate(
							&mut cursor,
							data.packet,
							data.flow,
							&mut data.vars,
							&mut ctx.counters,
							loop_count > 0,
						);
					}
				},
				OptionKind::Flowbit if option.is_flowbit_setter() => {
					// Treated as a match now; the state change is applied
					// after the subtree confirms (step 7).
					flowbits_setop = true;
					rval = EvalStatus::Match;
				},
				_ => {
					rval = option.evaluate(
						&mut cursor,
						data.packet,
						data.flow,
						&mut data.vars,
						&mut ctx.counters,
						loop_count > 0,
					);
				},
			}
		}

		match rval {
			EvalStatus::NoMatch => {
				ctx.node_states[node.0].last_check.result = result;
				return result;
			},
			EvalStatus::FailedBit => {
				// Failed flowbits invalidate the cache so the node is
				// re-checked if the packet comes around again.
				data.flowbit_failed = true;
				let state: &mut NodeState = &mut ctx.node_states[node.0];
				state.last_check.flowbit_failed = true;
				state.last_check.result = result;
				return 0;
			},
			EvalStatus::NoAlert => {
				tmp_noalert = data.flowbit_noalert;
				data.flowbit_noalert = true;
			},
			EvalStatus::Match => (),
		}

		/// Each child starts from the same register state.
		let saved_vars: ByteVars = data.vars;

		if ctx.packet_latency.fastpath() {
			ctx.node_states[node.0].last_check.result = result;
			return result;
		}

		let num_children: usize = graph.arena[node].children.len();
		if num_children > 0 {
			for i in 0..num_children {
				let child: NodeId = graph.arena[node].children[i];
				data.vars = saved_vars;

				if loop_count > 0 {
					let child_result: i32 = ctx.node_states[child.0].result;
					if child_result == 0 {
						if node_kind(graph, child) == OptionKind::Content {
							if !graph.arena[child].is_relative {
								/// A non-relative content stays failed no
								/// matter where the cursor moved; count its
								/// branch once and skip it.
								if loop_count == 1 {
									result += 1;
								}
								continue;
							} else if node_kind(graph, node) != OptionKind::BufferSet
								&& node_content(graph, child).is_some_and(ContentOption::is_unbounded)
							{
								/// An unbounded relative search that failed
								/// will fail from any later position too.
								if loop_count == 1 {
									result += 1;
								}
								continue;
							}
						}
					} else if graph.arena[child].is_leaf() {
						continue;
					} else if child_result == graph.arena[child].children.len() as i32 {
						/// Branch fully resolved on an earlier iteration.
						continue;
					}
				}

				let child_result: i32 = evaluate(graph, child, ctx, data, cursor);
				ctx.node_states[child.0].result = child_result;

				if graph.arena[child].is_leaf() {
					result += 1;
				} else if child_result == graph.arena[child].children.len() as i32 {
					result += 1;
				}

				if ctx.packet_latency.fastpath() {
					ctx.node_states[node.0].last_check.result = result;
					return result;
				}
			}

			if result == num_children as i32 {
				continue_loop = false;
			}
		}

		if rval == EvalStatus::NoAlert {
			data.flowbit_noalert = tmp_noalert;
		}

		if continue_loop && rval == EvalStatus::Match && graph.arena[node].relative_children > 0 {
			continue_loop = option.is_some_and(|o| o.retry(&cursor, &orig_cursor));
		} else {
			continue_loop = false;
		}

		if continue_loop {
			ctx.node_states[node.0].checks += 1;
		}
		loop_count += 1;

		if !continue_loop {
			break;
		}
	}

	if flowbits_setop && result > 0 {
		/// Apply the deferred flowbit state change now that the subtree
		/// confirmed; exactly once per packet thanks to the node cache.
		if let Some(option) = option {
			let rval: EvalStatus = option.evaluate(
				&mut cursor,
				data.packet,
				data.flow,
				&mut data.vars,
				&mut ctx.counters,
				false,
			);
			if rval != EvalStatus::Match {
				result = 0;
			}
		}
	}

	if data.flowbit_failed {
		ctx.node_states[node.0].last_check.flowbit_failed = true;
	}

	ctx.node_states[node.0].last_check.result = result;
	result
}

/// Match fan-out (and the catch-all path): evaluate every subtree under one
/// root with a fresh cursor at the payload start.
pub fn eval_root<'buf>(
	graph: &DetectionGraph,
	root: TreeHandle,
	ctx: &mut WorkerContext,
	data: &mut EvalData<'_, 'buf>,
) -> i32 {
	let tree: &TreeRoot = &graph.roots[root.0];

	if graph.latency.max_rule_time.is_some() && check_suspended(&mut ctx.root_latency[root.0], &mut ctx.counters) {
		for &child in tree.children.iter() {
			ctx.node_states[child.0].latency_suspends += 1;
		}
		return 0;
	}

	let timer: RuleTimer = RuleTimer::start();
	let cursor: Cursor<'buf> = Cursor::new(data.packet.payload);
	let mut result: i32 = 0;

	for &child in tree.children.iter() {
		result += evaluate(graph, child, ctx, data, cursor);
		if ctx.packet_latency.fastpath() {
			break;
		}
	}

	if timer.finish(&graph.latency, &mut ctx.root_latency[root.0], &mut ctx.counters) {
		for &child in tree.children.iter() {
			ctx.node_states[child.0].latency_timeouts += 1;
		}
	}

	result
}

/// Fan-out helper for negated pattern hits: the scan found the literal, so
/// the corresponding negated contents are settled for this packet.
pub fn stamp_negated(ctx: &mut WorkerContext, packet: &Packet<'_>, options: &[OptionId]) {
	for &id in options.iter() {
		ctx.stamp_pmd(id, packet);
	}
}
