//! The filter store.
//!
//! Manages chains whose names start with [`CHAIN_PREFIX`] in their entirety, plus rules in
//! built-in chains that carry a controller comment. Everything else in the filter table is left
//! alone.

use crate::{ipset::SetReferences, Error, Kernel};
use netpol_controller_core::iptables::{FilterOp, Position, Rule, Tag, CHAIN_PREFIX};
use regex::Regex;
use std::{
    collections::BTreeMap,
    fmt::Write,
    sync::{Arc, LazyLock},
};
use tracing::{debug, error, instrument, trace};

/// Applies filter operations to the kernel.
#[derive(Clone)]
pub struct FilterStore {
    kernel: Arc<dyn Kernel>,
}

/// The kernel's filter table, as far as the store is concerned.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FilterState {
    chains: BTreeMap<String, Chain>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Chain {
    managed: bool,
    rules: Vec<Entry>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub tag: Option<Tag>,
    /// The rule's arguments after `-A <chain>`.
    pub spec: String,
}

/// A point-in-time copy of the managed filter state that may be restored later.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilterSnapshot(FilterState);

static COMMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"--comment (?:"((?:[^"\\]|\\.)*)"|(\S+))"#)
        .expect("comment pattern must compile")
});

// === impl FilterStore ===

impl FilterStore {
    pub fn new(kernel: impl Kernel + 'static) -> Self {
        Self {
            kernel: Arc::new(kernel),
        }
    }

    pub fn state(&self) -> Result<FilterState, Error> {
        FilterState::parse(&self.kernel.save()?)
    }

    /// Returns the kernel's full dump, suitable for persisting to disk.
    pub fn save(&self) -> Result<String, Error> {
        Ok(self.kernel.save()?)
    }

    pub fn snapshot(&self) -> Result<FilterSnapshot, Error> {
        Ok(FilterSnapshot(self.state()?.managed()))
    }

    /// Replaces the managed chains and tagged rules with the snapshot's, atomically.
    #[instrument(skip_all)]
    pub fn restore(&self, snapshot: &FilterSnapshot) -> Result<(), Error> {
        let current = self.state()?;
        if current.managed() == snapshot.0 {
            return Ok(());
        }
        let script = render_restore(&current, &snapshot.0);
        trace!(%script);
        self.kernel.restore(&script).map_err(Into::into)
    }

    pub fn ensure_chain(&self, chain: &str) -> Result<(), Error> {
        self.apply_batch(&[FilterOp::EnsureChain(chain.to_string())])
    }

    pub fn insert_rule(&self, position: Position, rule: Rule) -> Result<(), Error> {
        self.apply_batch(&[FilterOp::Insert { position, rule }])
    }

    pub fn remove_rules_by_tag(&self, tag: &Tag) -> Result<(), Error> {
        self.apply_batch(&[FilterOp::RemoveByTag(tag.clone())])
    }

    /// Applies all operations in a single transaction.
    ///
    /// Rule positions are resolved against the current kernel state, so removing a tag deletes
    /// exactly the rules carrying it regardless of what else shares the chain.
    #[instrument(skip_all, fields(ops = ops.len()))]
    pub fn apply_batch(&self, ops: &[FilterOp]) -> Result<(), Error> {
        if ops.is_empty() {
            return Ok(());
        }

        let before = self.state()?;
        let (script, lines) = render_batch(&before, ops);
        if !lines.iter().any(Option::is_some) {
            return Ok(());
        }
        trace!(%script);

        let source = match self.kernel.restore(&script) {
            Ok(()) => return Ok(()),
            Err(error) => error,
        };

        let index = source
            .line
            .and_then(|l| lines.get(l.wrapping_sub(1)).copied().flatten());
        let op = index.map(|i| format_op(&ops[i]));
        debug!(?index, ?op, %source, "Batch failed");
        if let Err(error) = self.restore(&FilterSnapshot(before.managed())) {
            error!(%error, "Failed to restore filter rules after a failed batch");
        }
        Err(Error::PartialApply { index, op, source })
    }
}

impl std::fmt::Debug for FilterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterStore").finish_non_exhaustive()
    }
}

fn format_op(op: &FilterOp) -> String {
    match op {
        FilterOp::EnsureChain(chain) => format!("ensure chain {chain}"),
        FilterOp::Insert { position, rule } => match position {
            Position::Append => format!("append {rule}"),
            Position::Index(i) => format!("insert at {i} {rule}"),
        },
        FilterOp::RemoveByTag(tag) => format!("remove rules tagged {tag}"),
    }
}

/// Renders a batch against a working copy of the current state, returning the script and the
/// operation index (if any) that produced each line.
fn render_batch(state: &FilterState, ops: &[FilterOp]) -> (String, Vec<Option<usize>>) {
    let mut work = state.clone();
    let mut script = String::from("*filter\n");
    let mut lines = vec![None];

    for (idx, op) in ops.iter().enumerate() {
        let mut emit = |line: String| {
            script.push_str(&line);
            script.push('\n');
            lines.push(Some(idx));
        };

        match op {
            FilterOp::EnsureChain(name) => {
                if work.chains.contains_key(name) {
                    continue;
                }
                emit(format!(":{name} - [0:0]"));
                work.chains.insert(name.clone(), Chain::new(name));
            }
            FilterOp::Insert { position, rule } => {
                let entry = Entry {
                    tag: Some(rule.tag.clone()),
                    spec: rule.render(),
                };
                let chain = work.chains.entry(rule.chain.clone()).or_default();
                match position {
                    Position::Append => {
                        emit(format!("-A {} {}", rule.chain, entry.spec));
                        chain.rules.push(entry);
                    }
                    Position::Index(i) => {
                        let i = (*i).clamp(1, chain.rules.len() + 1);
                        emit(format!("-I {} {i} {}", rule.chain, entry.spec));
                        chain.rules.insert(i - 1, entry);
                    }
                }
            }
            FilterOp::RemoveByTag(tag) => {
                for (name, chain) in work.chains.iter_mut() {
                    for i in (0..chain.rules.len()).rev() {
                        if chain.rules[i].tag.as_ref() == Some(tag) {
                            emit(format!("-D {name} {}", i + 1));
                            chain.rules.remove(i);
                        }
                    }
                }
            }
        }
    }

    script.push_str("COMMIT\n");
    lines.push(None);
    (script, lines)
}

/// Renders a transaction that replaces the managed portion of `current` with `target`.
fn render_restore(current: &FilterState, target: &FilterState) -> String {
    let mut script = String::from("*filter\n");

    // Declaring a user chain flushes it.
    for (name, _) in target.chains.iter().filter(|(_, c)| c.managed) {
        let _ = writeln!(script, ":{name} - [0:0]");
    }
    let stale = current
        .chains
        .iter()
        .filter(|(n, c)| c.managed && !target.chains.contains_key(*n))
        .map(|(n, _)| n)
        .collect::<Vec<_>>();
    for name in &stale {
        let _ = writeln!(script, ":{name} - [0:0]");
    }

    for (name, chain) in current.chains.iter().filter(|(_, c)| !c.managed) {
        for i in (0..chain.rules.len()).rev() {
            if chain.rules[i].tag.is_some() {
                let _ = writeln!(script, "-D {name} {}", i + 1);
            }
        }
    }
    for name in &stale {
        let _ = writeln!(script, "-X {name}");
    }

    for (name, chain) in &target.chains {
        for (i, rule) in chain.rules.iter().enumerate() {
            if chain.managed {
                let _ = writeln!(script, "-A {name} {}", rule.spec);
            } else {
                let _ = writeln!(script, "-I {name} {} {}", i + 1, rule.spec);
            }
        }
    }

    script.push_str("COMMIT\n");
    script
}

// === impl FilterState ===

impl FilterState {
    /// Parses an `iptables-save -t filter` dump.
    pub fn parse(dump: &str) -> Result<Self, Error> {
        let mut chains = BTreeMap::<String, Chain>::new();
        for (i, line) in dump.lines().enumerate() {
            let line = line.trim();
            if let Some(decl) = line.strip_prefix(':') {
                let name = decl.split_whitespace().next().unwrap_or_default();
                chains.insert(name.to_string(), Chain::new(name));
            } else if let Some(rule) = line.strip_prefix("-A ") {
                let (name, spec) = rule.split_once(' ').unwrap_or((rule, ""));
                let chain = chains.get_mut(name).ok_or_else(|| Error::Parse {
                    what: "iptables",
                    line: i + 1,
                    message: format!("chain {name} was not declared"),
                })?;
                chain.rules.push(Entry::parse(spec));
            }
        }
        Ok(Self { chains })
    }

    /// Returns only the state owned by the controller: managed chains, and tagged rules in
    /// built-in chains.
    pub fn managed(&self) -> Self {
        let chains = self
            .chains
            .iter()
            .filter_map(|(name, chain)| {
                if chain.managed {
                    return Some((name.clone(), chain.clone()));
                }
                let rules = chain
                    .rules
                    .iter()
                    .filter(|r| r.tag.is_some())
                    .cloned()
                    .collect::<Vec<_>>();
                if rules.is_empty() {
                    return None;
                }
                Some((
                    name.clone(),
                    Chain {
                        managed: false,
                        rules,
                    },
                ))
            })
            .collect();
        Self { chains }
    }

    pub fn has_chain(&self, chain: &str) -> bool {
        self.chains.contains_key(chain)
    }

    pub fn rules(&self, chain: &str) -> impl Iterator<Item = &Entry> {
        self.chains
            .get(chain)
            .into_iter()
            .flat_map(|c| c.rules.iter())
    }

    /// Tags of all controller-owned rules, in no particular order, with duplicates.
    pub fn tags(&self) -> impl Iterator<Item = &Tag> {
        self.chains
            .values()
            .flat_map(|c| c.rules.iter())
            .filter_map(|r| r.tag.as_ref())
    }

    /// Rules carrying the tag, as `(chain, spec)` in chain order.
    pub fn tagged(&self, tag: &Tag) -> Vec<(&str, &str)> {
        self.chains
            .iter()
            .flat_map(|(name, chain)| {
                chain
                    .rules
                    .iter()
                    .filter(move |r| r.tag.as_ref() == Some(tag))
                    .map(move |r| (name.as_str(), r.spec.as_str()))
            })
            .collect()
    }
}

impl SetReferences for FilterState {
    fn find_reference(&self, set: &str) -> Option<String> {
        self.chains.iter().find_map(|(name, chain)| {
            chain.rules.iter().find_map(|rule| {
                let words = rule.spec.split_whitespace().collect::<Vec<_>>();
                words
                    .windows(2)
                    .any(|w| w[0] == "--match-set" && w[1] == set)
                    .then(|| format!("-A {name} {}", rule.spec))
            })
        })
    }
}

// === impl Chain ===

impl Chain {
    fn new(name: &str) -> Self {
        Self {
            managed: name.starts_with(CHAIN_PREFIX),
            rules: Vec::new(),
        }
    }
}

// === impl Entry ===

impl Entry {
    fn parse(spec: &str) -> Self {
        let tag = COMMENT.captures(spec).and_then(|c| {
            let comment = c.get(1).or_else(|| c.get(2))?.as_str();
            Tag::from_comment(comment)
        });
        Self {
            tag,
            spec: spec.to_string(),
        }
    }
}

// === impl FilterSnapshot ===

impl FilterSnapshot {
    /// Parses a snapshot from a persisted `iptables-save` dump.
    pub fn parse(dump: &str) -> Result<Self, Error> {
        Ok(Self(FilterState::parse(dump)?.managed()))
    }

    pub fn state(&self) -> &FilterState {
        &self.0
    }
}
