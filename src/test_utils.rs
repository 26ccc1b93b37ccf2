use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::sampler::StackSampler;
use crate::snapshot::StackSnapshot;

/// A sampler that replays scripted snapshots.
///
/// Each capture returns the next snapshot of the script. Once the script is
/// exhausted the last snapshot is repeated, so a single scripted snapshot
/// describes a process whose threads never change.
#[derive(Debug, Default)]
pub struct ScriptedSampler {
    script: Mutex<VecDeque<StackSnapshot>>,
    last: Mutex<StackSnapshot>,
    captures: AtomicUsize,
}

impl ScriptedSampler {
    pub fn new(script: impl IntoIterator<Item = StackSnapshot>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            ..Self::default()
        }
    }

    /// A sampler that returns the same snapshot forever.
    pub fn repeating(snapshot: StackSnapshot) -> Self {
        Self::new([snapshot])
    }

    /// Number of captures taken so far.
    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }
}

impl StackSampler for ScriptedSampler {
    fn capture(&self) -> StackSnapshot {
        self.captures.fetch_add(1, Ordering::SeqCst);
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(next) = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
        {
            *last = next;
        }
        last.clone()
    }
}

/// Builds one dump block the way the thread sampler renders it.
pub fn block(tid: i64, name: &str, frames: &[&str]) -> String {
    format!("thread {tid} \"{name}\":\n{}", frames.join("\n"))
}
