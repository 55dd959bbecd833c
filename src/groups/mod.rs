//! Backup groups: the write-side orchestrator and the read-side catalog.

pub mod complete;
pub mod pending;

pub use complete::CompleteBackupGroup;
pub use pending::BackupGroup;

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::mpsc;

use virtbak_core::error::{Error, Result};

/// Run keyed jobs on up to `parallel` worker threads, never running two
/// jobs with the same key at once. Jobs sharing a key run in submission
/// order; results are collected without short-circuiting.
pub(crate) fn run_serialized_by_key<T, F>(
    items: Vec<(String, T)>,
    parallel: usize,
    worker: F,
) -> Vec<(String, Result<()>)>
where
    T: Send + 'static,
    F: Fn(&mut T) -> Result<()> + Send + Sync + 'static,
{
    let parallel = parallel.max(1);
    let worker = Arc::new(worker);

    // one FIFO queue per key, keys admitted in first-seen order
    let mut queues: BTreeMap<String, VecDeque<T>> = BTreeMap::new();
    let mut key_order: VecDeque<String> = VecDeque::new();
    for (key, item) in items {
        let queue = queues.entry(key.clone()).or_default();
        if queue.is_empty() {
            key_order.push_back(key);
        }
        queue.push_back(item);
    }

    let (tx, rx) = mpsc::channel::<(String, Result<()>)>();
    let spawn = |key: String, mut item: T| {
        let worker = worker.clone();
        let tx = tx.clone();
        std::thread::spawn(move || {
            let result =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| worker(&mut item)))
                    .unwrap_or_else(|_| {
                        Err(Error::Io(std::io::Error::other("backup worker panicked")))
                    });
            // the receiver outlives every worker
            let _ = tx.send((key, result));
        });
    };

    // seed one job per distinct key
    let mut in_flight = 0usize;
    while in_flight < parallel {
        let Some(key) = key_order.pop_front() else {
            break;
        };
        if let Some(item) = queues.get_mut(&key).and_then(VecDeque::pop_front) {
            spawn(key, item);
            in_flight += 1;
        }
    }

    let mut results = Vec::new();
    while in_flight > 0 {
        let Ok((key, result)) = rx.recv() else {
            break;
        };
        in_flight -= 1;
        results.push((key.clone(), result));

        // the key is eligible again: run its next job, or admit a new key
        let next = match queues.get_mut(&key).and_then(VecDeque::pop_front) {
            Some(item) => Some((key, item)),
            None => loop {
                let Some(key) = key_order.pop_front() else {
                    break None;
                };
                if let Some(item) = queues.get_mut(&key).and_then(VecDeque::pop_front) {
                    break Some((key, item));
                }
            },
        };
        if let Some((key, item)) = next {
            spawn(key, item);
            in_flight += 1;
        }
    }

    results
}
