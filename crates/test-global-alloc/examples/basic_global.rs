use std::collections::HashMap;
use std::thread;

use memfacade::report::Snapshot;
use memfacade::{default_alloc, DefaultAlloc, SamplingOptions, GUARDED_ALLOC};

#[global_allocator]
static GLOBAL: DefaultAlloc = default_alloc();

fn churn(rounds: usize) -> usize {
    let mut total = 0;
    for i in 0..rounds {
        let words: Vec<String> = (0..32).map(|n| format!("item-{i}-{n}")).collect();
        let mut index: HashMap<&str, usize> = HashMap::new();
        for (n, word) in words.iter().enumerate() {
            index.insert(word, n);
        }
        let boxed: Box<[u64]> = vec![i as u64; 1 + i % 300].into_boxed_slice();
        total += index.len() + boxed.len();
    }
    total
}

fn main() {
    GUARDED_ALLOC
        .init(&SamplingOptions::new().sample_probability(0.1).slots(256))
        .expect("guarded pool");

    let workers: Vec<_> = (0..4).map(|_| thread::spawn(|| churn(2_000))).collect();
    let worked: usize = workers.into_iter().map(|w| w.join().unwrap()).sum();

    // Nothing else runs now, so the tracker must come back to where it was.
    let before = GLOBAL.tracker().amount();
    let worked = worked + churn(500);
    let after = GLOBAL.tracker().amount();

    let snapshot = Snapshot::capture(&GLOBAL);
    let mut json = serde_json::to_value(&snapshot).unwrap();
    json["net_bytes"] = serde_json::json!(after - before);
    json["worked"] = serde_json::json!(worked);
    println!("{}", serde_json::to_string_pretty(&json).unwrap());
}
