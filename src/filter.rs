//! Noise filtering of raw stack snapshots.
//!
//! Most threads in a test process belong to the machinery around the code
//! under test: the test harness driver, idle runtime pools, allocator
//! helpers, signal plumbing and the sampler itself. [`NoiseFilter`] removes
//! them with a list of [`Suppression`] rules so that only interesting
//! threads are compared between samples.
//!
//! The built-in [`DEFAULT_DENY_LIST`] is best effort. It was derived by
//! looking at real dumps of std, libtest and tokio threads and will need new
//! entries as runtimes change. Callers add their own rules with
//! [`NoiseFilter::with`] or through [`FilterConfig`].

use std::collections::BTreeSet;
use std::collections::btree_set;
use std::fmt;

use regex::Regex;
use serde::Deserialize;

use crate::error::Error;
use crate::snapshot::StackSnapshot;

/// Substrings identifying runtime-internal or harness-internal threads.
pub const DEFAULT_DENY_LIST: &[&str] = &[
    // libtest driver on the main thread.
    "test::test_main",
    "test::console::run_tests_console",
    // Threads unwinding through their exit path.
    "std::sys::thread_local::destructors",
    // Idle tokio pools.
    "tokio::runtime::blocking::pool::Inner::run",
    "tokio::runtime::scheduler::multi_thread::worker::Context::park",
    "tokio::runtime::scheduler::current_thread::Context::park",
    // jemalloc background purging.
    "background_thread_entry",
    // Signal delivery.
    "signal_hook_registry",
    "tokio::signal::unix::",
    // The sampler's own call path, and detectors waiting out their interval
    // on other threads.
    "blockcheck::sampler::enumerate_threads",
    "blockcheck::detector::observation_pause",
    // Threads running code without symbols.
    crate::sampler::FOREIGN_CODE_MARKER,
];

/// A rule that marks a stack body as noise.
#[derive(Debug, Clone)]
pub enum Suppression {
    /// The body contains the substring anywhere.
    Contains(String),
    /// The body starts with the string.
    Prefix(String),
    /// The body matches the regular expression.
    Pattern(Regex),
}

impl Suppression {
    pub fn contains(needle: impl Into<String>) -> Self {
        Self::Contains(needle.into())
    }

    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self::Prefix(prefix.into())
    }

    pub fn pattern(pattern: &str) -> Result<Self, Error> {
        Ok(Self::Pattern(Regex::new(pattern)?))
    }

    pub fn matches(&self, body: &str) -> bool {
        match self {
            Self::Contains(needle) => body.contains(needle.as_str()),
            Self::Prefix(prefix) => body.starts_with(prefix.as_str()),
            Self::Pattern(re) => re.is_match(body),
        }
    }
}

/// Extra suppressions supplied through configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Start from [`DEFAULT_DENY_LIST`].
    pub include_defaults: bool,
    pub contains: Vec<String>,
    pub prefix: Vec<String>,
    pub pattern: Vec<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            include_defaults: true,
            contains: Vec::new(),
            prefix: Vec::new(),
            pattern: Vec::new(),
        }
    }
}

/// One thread that survived filtering: its header line and trimmed body.
///
/// Ordered by body first, so reports group threads stuck at the same place.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadStack {
    pub body: String,
    pub header: String,
}

impl ThreadStack {
    pub fn new(header: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            header: header.into(),
        }
    }
}

impl fmt::Display for ThreadStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\n{}", self.header, self.body)
    }
}

/// Sorted set of threads that survived filtering.
///
/// Threads with byte-identical bodies stay separate entries as long as
/// their headers differ.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilteredSet {
    stacks: BTreeSet<ThreadStack>,
}

impl FilteredSet {
    pub fn insert(&mut self, stack: ThreadStack) -> bool {
        self.stacks.insert(stack)
    }

    /// Whether any thread shows exactly `body`.
    pub fn contains(&self, body: &str) -> bool {
        self.stacks.iter().any(|stack| stack.body == body)
    }

    /// Number of threads.
    pub fn len(&self) -> usize {
        self.stacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }

    /// Threads ordered by body, then header.
    pub fn iter(&self) -> impl Iterator<Item = &ThreadStack> {
        self.stacks.iter()
    }

    /// Distinct bodies in lexicographic order.
    pub fn bodies(&self) -> impl Iterator<Item = &str> {
        let mut last: Option<&str> = None;
        self.stacks.iter().filter_map(move |stack| {
            let body = stack.body.as_str();
            (last.replace(body) != Some(body)).then_some(body)
        })
    }

    /// Threads present in both sets with the same header and the exact
    /// same body text.
    pub fn intersection(&self, other: &FilteredSet) -> FilteredSet {
        FilteredSet {
            stacks: self.stacks.intersection(&other.stacks).cloned().collect(),
        }
    }
}

impl IntoIterator for FilteredSet {
    type Item = ThreadStack;
    type IntoIter = btree_set::IntoIter<ThreadStack>;

    fn into_iter(self) -> Self::IntoIter {
        self.stacks.into_iter()
    }
}

impl FromIterator<ThreadStack> for FilteredSet {
    fn from_iter<I: IntoIterator<Item = ThreadStack>>(iter: I) -> Self {
        FilteredSet {
            stacks: iter.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NoiseFilter {
    rules: Vec<Suppression>,
}

impl Default for NoiseFilter {
    fn default() -> Self {
        Self {
            rules: DEFAULT_DENY_LIST
                .iter()
                .map(|needle| Suppression::contains(*needle))
                .collect(),
        }
    }
}

impl NoiseFilter {
    /// A filter without any suppression rule.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn from_config(config: &FilterConfig) -> Result<Self, Error> {
        let mut filter = if config.include_defaults {
            Self::default()
        } else {
            Self::empty()
        };
        filter.extend(config.contains.iter().map(Suppression::contains));
        filter.extend(config.prefix.iter().map(Suppression::prefix));
        for pattern in &config.pattern {
            filter.rules.push(Suppression::pattern(pattern)?);
        }
        Ok(filter)
    }

    pub fn with(mut self, rule: Suppression) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn extend(&mut self, rules: impl IntoIterator<Item = Suppression>) {
        self.rules.extend(rules);
    }

    pub fn rules(&self) -> &[Suppression] {
        &self.rules
    }

    pub fn is_noise(&self, body: &str) -> bool {
        self.rules.iter().any(|rule| rule.matches(body))
    }

    /// Reduces a snapshot to the set of interesting threads.
    ///
    /// Blocks without a body, blocks with an empty body, bodies starting with
    /// a non-empty `ignore_prefix`, and bodies matching any rule are dropped.
    pub fn filter(&self, snapshot: &StackSnapshot, ignore_prefix: &str) -> FilteredSet {
        snapshot
            .iter()
            .filter_map(split_block)
            .filter(|(_, body)| !body.is_empty())
            .filter(|(_, body)| ignore_prefix.is_empty() || !body.starts_with(ignore_prefix))
            .filter(|(_, body)| !self.is_noise(body))
            .map(|(header, body)| ThreadStack::new(header, body))
            .collect()
    }
}

/// Header line and everything after it, both trimmed. `None` for a block
/// that is only a header.
fn split_block(block: &str) -> Option<(&str, &str)> {
    block
        .split_once('\n')
        .map(|(header, body)| (header.trim(), body.trim()))
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    fn snapshot(blocks: &[&str]) -> StackSnapshot {
        StackSnapshot::from_blocks(blocks.iter().copied())
    }

    fn bodies(set: &FilteredSet) -> Vec<&str> {
        set.iter().map(|stack| stack.body.as_str()).collect()
    }

    #[test]
    fn drops_blocks_without_body() {
        let set = NoiseFilter::empty().filter(&snapshot(&["thread 1 \"main\":"]), "");
        assert!(set.is_empty());
    }

    #[test]
    fn drops_blank_bodies() {
        let set = NoiseFilter::empty().filter(&snapshot(&["thread 1:\n   \n\t"]), "");
        assert!(set.is_empty());
    }

    #[test]
    fn trims_header_and_body() {
        let set = NoiseFilter::empty().filter(&snapshot(&["thread 1: \n  app::run  \n"]), "");
        assert_eq!(set.iter().collect::<Vec<_>>(), [&ThreadStack::new("thread 1:", "app::run")]);
    }

    #[test]
    fn identical_bodies_stay_separate_threads() {
        let snap = snapshot(&[
            "thread 21 \"pool-0\":\napp::pool::acquire",
            "thread 22 \"pool-1\":\napp::pool::acquire",
        ]);
        let set = NoiseFilter::empty().filter(&snap, "");
        assert_eq!(set.len(), 2);
        assert_eq!(set.bodies().collect::<Vec<_>>(), ["app::pool::acquire"]);
        assert!(set.contains("app::pool::acquire"));
    }

    #[test]
    fn ignore_prefix_excludes_matching_bodies() {
        let snap = snapshot(&["thread 1:\nwatchdog::tick\nmain", "thread 2:\napp::run"]);
        let set = NoiseFilter::empty().filter(&snap, "watchdog::");
        assert_eq!(bodies(&set), ["app::run"]);
    }

    #[test]
    fn empty_ignore_prefix_excludes_nothing() {
        let snap = snapshot(&["thread 1:\nwatchdog::tick", "thread 2:\napp::run"]);
        assert_eq!(NoiseFilter::empty().filter(&snap, "").len(), 2);
    }

    #[test]
    fn default_deny_list_removes_runtime_threads() {
        let snap = snapshot(&[
            "thread 1 \"main\":\nstd::sync::mpsc::Receiver<T>::recv_timeout\ntest::console::run_tests_console\ntest::test_main",
            "thread 2 \"tokio-runtime-w\":\ntokio::runtime::blocking::pool::Inner::run",
            "thread 3 \"caller\":\nblockcheck::sampler::enumerate_threads",
            "thread 4 \"ffi\":\n<foreign code>",
            "thread 5 \"app\":\napp::worker::drain",
            "thread 6 \"other-test\":\nstd::thread::sleep\nblockcheck::detector::observation_pause\n<blockcheck::detector::BlockDetector<_>>::observe",
        ]);
        let set = NoiseFilter::default().filter(&snap, "");
        assert_eq!(bodies(&set), ["app::worker::drain"]);
    }

    #[test]
    fn rules_of_every_kind_apply() {
        let filter = NoiseFilter::empty()
            .with(Suppression::contains("pool::idle"))
            .with(Suppression::prefix("metrics::"))
            .with(Suppression::pattern(r"^reaper-\d+").unwrap());
        assert!(filter.is_noise("x\npool::idle\ny"));
        assert!(filter.is_noise("metrics::flush"));
        assert!(!filter.is_noise("app::metrics::flush"));
        assert!(filter.is_noise("reaper-12::loop"));
        assert!(!filter.is_noise("app::run"));
    }

    #[test]
    fn config_adds_rules_and_rejects_bad_patterns() {
        let config = FilterConfig {
            include_defaults: false,
            contains: vec!["noisy".to_string()],
            prefix: vec!["quiet::".to_string()],
            pattern: vec!["^re+$".to_string()],
        };
        let filter = NoiseFilter::from_config(&config).unwrap();
        assert_eq!(filter.rules().len(), 3);
        assert!(!filter.is_noise("test::test_main"));

        let bad = FilterConfig {
            pattern: vec!["(".to_string()],
            ..FilterConfig::default()
        };
        assert!(matches!(
            NoiseFilter::from_config(&bad),
            Err(Error::InvalidPattern(_))
        ));
    }

    #[test]
    fn intersection_needs_same_thread_and_exact_text() {
        let a: FilteredSet = [
            ThreadStack::new("thread 1:", "one"),
            ThreadStack::new("thread 2:", "two"),
            ThreadStack::new("thread 3:", "three"),
        ]
        .into_iter()
        .collect();
        let b: FilteredSet = [
            ThreadStack::new("thread 2:", "two"),
            ThreadStack::new("thread 3:", "three "),
            ThreadStack::new("thread 9:", "one"),
        ]
        .into_iter()
        .collect();
        let both = a.intersection(&b);
        assert_eq!(both.iter().collect::<Vec<_>>(), [&ThreadStack::new("thread 2:", "two")]);
    }

    #[test]
    fn display_includes_header() {
        let stack = ThreadStack::new("thread 4 \"cv\":", "app::wait");
        assert_eq!(stack.to_string(), "thread 4 \"cv\":\napp::wait");
    }

    fn body_strategy() -> impl Strategy<Value = String> {
        "[a-z:_]{1,12}(\n[a-z:_]{1,12}){0,3}"
    }

    proptest! {
        #[test]
        fn output_is_sorted_and_stable(bodies in prop::collection::vec(body_strategy(), 0..16)) {
            let blocks: Vec<String> = bodies
                .iter()
                .enumerate()
                .map(|(i, b)| format!("thread {i}:\n{b}"))
                .collect();
            let mut reversed = blocks.clone();
            reversed.reverse();

            let filter = NoiseFilter::default();
            let first: Vec<ThreadStack> = filter.filter(&StackSnapshot::from_blocks(blocks), "").into_iter().collect();
            let second: Vec<ThreadStack> = filter.filter(&StackSnapshot::from_blocks(reversed), "").into_iter().collect();

            let mut sorted = first.clone();
            sorted.sort();
            prop_assert_eq!(&first, &sorted);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn ignored_prefix_never_survives(
            prefix in "[a-z]{1,6}::",
            bodies in prop::collection::vec(body_strategy(), 1..8),
        ) {
            let blocks: Vec<String> = bodies
                .iter()
                .map(|b| format!("thread 1:\n{prefix}{b}"))
                .chain(bodies.iter().map(|b| format!("thread 2:\n{b}")))
                .collect();
            let set = NoiseFilter::empty().filter(&StackSnapshot::from_blocks(blocks), &prefix);
            prop_assert!(set.iter().all(|stack| !stack.body.starts_with(prefix.as_str())));
        }

        #[test]
        fn deny_listed_bodies_never_survive(
            idx in 0..DEFAULT_DENY_LIST.len(),
            before in body_strategy(),
            after in body_strategy(),
        ) {
            let body = format!("{before}\n{}\n{after}", DEFAULT_DENY_LIST[idx]);
            let snap = StackSnapshot::from_blocks([format!("thread 9:\n{body}")]);
            prop_assert!(NoiseFilter::default().filter(&snap, "").is_empty());
        }
    }
}
