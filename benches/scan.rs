use criterion::Criterion;
use criterion::criterion_group;
use criterion::criterion_main;

use rand::Rng;
use rand::SeedableRng;
use rand::rngs::SmallRng;

use netsift::engine::Config;
use netsift::engine::Worker;
use netsift::engine::configure;
use netsift::packet::Flow;
use netsift::packet::Packet;
use netsift::packet::Timeval;
use netsift::rules::OptionSpec;
use netsift::rules::RuleSpec;

const KEYWORDS: &[&str] = &[
	"admin", "login", "passwd", "select ", "union ", "script", "eval(", "wget ", "curl ", "shell",
];

fn rule_set() -> Vec<RuleSpec> {
	KEYWORDS
		.iter()
		.enumerate()
		.map(|(i, word)| {
			RuleSpec::new(1, 1000 + i as u32, 1).with_options(vec![OptionSpec::content(&format!("\"{word}\""))])
		})
		.collect::<Vec<_>>()
}

fn random_payload(len: usize, seed: u64) -> Vec<u8> {
	let mut rng: SmallRng = SmallRng::seed_from_u64(seed);
	(0..len).map(|_| rng.gen_range(b'a'..=b'z')).collect::<Vec<_>>()
}

fn bench_clean_traffic(c: &mut Criterion) {
	let config: Config = configure(rule_set(), 1).unwrap();
	let mut worker: Worker = config.worker(0);
	let payload: Vec<u8> = random_payload(64 * 1024, 0x5eed);
	let mut flow: Flow = Flow::default();
	let mut context_num: u64 = 0;

	c.bench_function("scan_64k_clean", |b| {
		b.iter(|| {
			context_num += 1;
			let packet: Packet<'_> = Packet::new(&payload, Timeval::new(1, 0), context_num);
			worker.scan_packet(&packet, &mut flow)
		});
	});
}

fn bench_matching_traffic(c: &mut Criterion) {
	let config: Config = configure(rule_set(), 1).unwrap();
	let mut worker: Worker = config.worker(0);

	// Sprinkle every keyword through the buffer so the tree evaluator runs.
	let mut payload: Vec<u8> = random_payload(64 * 1024, 0xfeed);
	for (i, word) in KEYWORDS.iter().enumerate() {
		let at: usize = (i + 1) * 4096;
		payload[at..at + word.len()].copy_from_slice(word.as_bytes());
	}

	let mut flow: Flow = Flow::default();
	let mut context_num: u64 = 0;

	c.bench_function("scan_64k_matching", |b| {
		b.iter(|| {
			context_num += 1;
			let packet: Packet<'_> = Packet::new(&payload, Timeval::new(1, 0), context_num);
			worker.scan_packet(&packet, &mut flow)
		});
	});
}

criterion_group!(benches, bench_clean_traffic, bench_matching_traffic);
criterion_main!(benches);
