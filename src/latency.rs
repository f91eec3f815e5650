use std::time::Duration;
use std::time::Instant;

use crate::packet::RuntimeCounters;

#[derive(Debug, Clone, Copy)]
pub struct LatencySettings {
	/// Packet deadline; once exceeded the evaluator commits partial results
	/// and unwinds (the fast path).
	pub max_packet_time: Option<Duration>,
	/// Per-root deadline; roots that repeatedly exceed it are suspended.
	pub max_rule_time: Option<Duration>,
	/// Consecutive timeouts before a root suspends.
	pub suspend_threshold: u32,
	pub suspend_for: Duration,
}

impl Default for LatencySettings {
	fn default() -> Self {
		Self {
			max_packet_time: None,
			max_rule_time: None,
			suspend_threshold: 5,
			suspend_for: Duration::from_secs(30),
		}
	}
}

/// Polled monitor for the current packet. Latches once tripped so every
/// caller up the recursion sees the same answer.
#[derive(Debug)]
pub struct PacketLatency {
	max: Option<Duration>,
	start: Instant,
	timed_out: bool,
}

impl PacketLatency {
	pub fn new(max: Option<Duration>) -> Self {
		Self {
			max,
			start: Instant::now(),
			timed_out: false,
		}
	}

	pub fn start_packet(&mut self) {
		self.start = Instant::now();
		self.timed_out = false;
	}

	pub fn fastpath(&mut self) -> bool {
		if self.timed_out {
			return true;
		}
		match self.max {
			Some(max) if self.start.elapsed() >= max => {
				self.timed_out = true;
				true
			},
			_ => false,
		}
	}

	pub fn timed_out(&self) -> bool {
		self.timed_out
	}
}

/// Per-root, per-worker suspension state.
#[derive(Debug, Clone, Default)]
pub struct RuleLatencyState {
	pub timeouts: u32,
	pub suspended: bool,
	pub resume_at: Option<Instant>,
}

/// Gate before evaluating a root: a suspended root is skipped (counted as a
/// suspend) until its cool-down expires.
pub fn check_suspended(state: &mut RuleLatencyState, counters: &mut RuntimeCounters) -> bool {
	if !state.suspended {
		return false;
	}
	match state.resume_at {
		Some(resume_at) if Instant::now() >= resume_at => {
			state.suspended = false;
			state.timeouts = 0;
			state.resume_at = None;
			false
		},
		_ => {
			counters.suspends += 1;
			true
		},
	}
}

#[derive(Debug)]
pub struct RuleTimer {
	start: Instant,
}

impl RuleTimer {
	pub fn start() -> Self {
		Self { start: Instant::now() }
	}

	/// Record the root's elapsed time; returns whether it timed out. Enough
	/// consecutive timeouts suspend the root until `suspend_for` passes.
	pub fn finish(self, settings: &LatencySettings, state: &mut RuleLatencyState, counters: &mut RuntimeCounters) -> bool {
		let Some(max) = settings.max_rule_time else {
			return false;
		};

		if self.start.elapsed() < max {
			state.timeouts = 0;
			return false;
		}

		state.timeouts += 1;
		counters.timeouts += 1;

		if settings.suspend_threshold > 0 && state.timeouts >= settings.suspend_threshold {
			state.suspended = true;
			state.resume_at = Some(Instant::now() + settings.suspend_for);
			counters.suspends += 1;
			debug!("rule root suspended after {} consecutive timeouts", state.timeouts);
		}

		true
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn packet_deadline_latches() {
		let mut latency: PacketLatency = PacketLatency::new(Some(Duration::ZERO));
		assert!(latency.fastpath());
		assert!(latency.fastpath());
		assert!(latency.timed_out());

		latency.start_packet();
		assert!(latency.timed_out() == false || latency.fastpath());
	}

	#[test]
	fn no_deadline_never_trips() {
		let mut latency: PacketLatency = PacketLatency::new(None);
		assert!(!latency.fastpath());
		assert!(!latency.timed_out());
	}

	#[test]
	fn rule_timeouts_suspend() {
		let settings: LatencySettings = LatencySettings {
			max_packet_time: None,
			max_rule_time: Some(Duration::ZERO),
			suspend_threshold: 2,
			suspend_for: Duration::from_secs(3600),
		};
		let mut state: RuleLatencyState = RuleLatencyState::default();
		let mut counters: RuntimeCounters = RuntimeCounters::default();

		assert!(RuleTimer::start().finish(&settings, &mut state, &mut counters));
		assert!(!state.suspended);
		assert!(RuleTimer::start().finish(&settings, &mut state, &mut counters));
		assert!(state.suspended);
		assert_eq!(counters.timeouts, 2);
		assert_eq!(counters.suspends, 1);

		/// Suspended and the cool-down is far away: the gate skips the root.
		assert!(check_suspended(&mut state, &mut counters));
		assert_eq!(counters.suspends, 2);
	}

	#[test]
	fn suspension_expires() {
		let mut state: RuleLatencyState = RuleLatencyState {
			timeouts: 3,
			suspended: true,
			resume_at: Some(Instant::now()),
		};
		let mut counters: RuntimeCounters = RuntimeCounters::default();

		assert!(!check_suspended(&mut state, &mut counters));
		assert!(!state.suspended);
		assert_eq!(state.timeouts, 0);
	}

	#[test]
	fn within_budget_resets_streak() {
		let settings: LatencySettings = LatencySettings {
			max_rule_time: Some(Duration::from_secs(3600)),
			..LatencySettings::default()
		};
		let mut state: RuleLatencyState = RuleLatencyState {
			timeouts: 1,
			..RuleLatencyState::default()
		};
		let mut counters: RuntimeCounters = RuntimeCounters::default();

		assert!(!RuleTimer::start().finish(&settings, &mut state, &mut counters));
		assert_eq!(state.timeouts, 0);
	}
}
