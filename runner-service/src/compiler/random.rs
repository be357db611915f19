// Random Identifiers
// Pluggable id generation for pod, namespace and container names

use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};

const ID_LENGTH: usize = 20;

/// Source of unique lowercase alphanumeric ids
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

/// Random ids, the default outside tests
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIds;

impl IdGenerator for RandomIds {
    fn next_id(&self) -> String {
        // Container names must start with a letter.
        let mut rng = rand::thread_rng();
        let first = rng.gen_range(b'a'..=b'z') as char;
        let rest: String = rng
            .sample_iter(&Alphanumeric)
            .take(ID_LENGTH - 1)
            .map(|c| (c as char).to_ascii_lowercase())
            .collect();
        format!("{}{}", first, rest)
    }
}

/// Deterministic ids for reproducible output
#[derive(Debug, Default)]
pub struct SequentialIds {
    counter: AtomicU64,
}

impl SequentialIds {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdGenerator for SequentialIds {
    fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}{:0>width$}", "x", n, width = ID_LENGTH - 1)
    }
}
