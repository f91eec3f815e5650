use std::collections::HashMap;
use std::net::IpAddr;

use crate::tree::RuleId;

/// Per-rule rate gate: a matched leaf may only queue an event once the rule
/// has matched `count` times within `seconds` for the same address pair.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct DetectionFilterSpec {
	pub count: u32,
	pub seconds: u64,
}

#[derive(Debug, Clone, Copy)]
struct Window {
	start_sec: u64,
	count: u32,
}

/// Worker-local; the only rule state that survives across packets besides
/// flowbits.
#[derive(Debug, Default)]
pub struct FilterState {
	windows: HashMap<(usize, IpAddr, IpAddr), Window>,
}

impl FilterState {
	pub fn new() -> Self {
		Self::default()
	}

	/// Count this match; returns whether the leaf may produce an event.
	pub fn test(&mut self, rule: RuleId, src: IpAddr, dst: IpAddr, now_sec: u64, spec: &DetectionFilterSpec) -> bool {
		let window: &mut Window = self.windows.entry((rule.0, src, dst)).or_insert(Window {
			start_sec: now_sec,
			count: 0,
		});

		if now_sec.saturating_sub(window.start_sec) > spec.seconds {
			window.start_sec = now_sec;
			window.count = 0;
		}

		window.count += 1;
		window.count >= spec.count
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use std::net::Ipv4Addr;

	fn ip(last: u8) -> IpAddr {
		IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
	}

	#[test]
	fn threshold_gate() {
		let mut state: FilterState = FilterState::new();
		let spec: DetectionFilterSpec = DetectionFilterSpec { count: 3, seconds: 60 };

		assert!(!state.test(RuleId(0), ip(1), ip(2), 100, &spec));
		assert!(!state.test(RuleId(0), ip(1), ip(2), 101, &spec));
		assert!(state.test(RuleId(0), ip(1), ip(2), 102, &spec));
		assert!(state.test(RuleId(0), ip(1), ip(2), 103, &spec));
	}

	#[test]
	fn keyed_by_rule_and_addresses() {
		let mut state: FilterState = FilterState::new();
		let spec: DetectionFilterSpec = DetectionFilterSpec { count: 2, seconds: 60 };

		assert!(!state.test(RuleId(0), ip(1), ip(2), 100, &spec));
		/// Different source: separate window.
		assert!(!state.test(RuleId(0), ip(3), ip(2), 100, &spec));
		/// Different rule: separate window.
		assert!(!state.test(RuleId(1), ip(1), ip(2), 100, &spec));
		assert!(state.test(RuleId(0), ip(1), ip(2), 100, &spec));
	}

	#[test]
	fn window_expiry_resets() {
		let mut state: FilterState = FilterState::new();
		let spec: DetectionFilterSpec = DetectionFilterSpec { count: 2, seconds: 10 };

		assert!(!state.test(RuleId(0), ip(1), ip(2), 100, &spec));
		/// 11 seconds later the window restarts; the count begins again.
		assert!(!state.test(RuleId(0), ip(1), ip(2), 111, &spec));
		assert!(state.test(RuleId(0), ip(1), ip(2), 112, &spec));
	}
}
