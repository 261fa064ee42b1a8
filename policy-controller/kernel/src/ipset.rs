//! The set store.
//!
//! Tracks only sets whose kernel name starts with [`KERNEL_PREFIX`]; any other sets in the
//! kernel's dump are ignored and never modified.

use crate::{Error, Kernel};
use netpol_controller_core::ipset::{Member, SetKind, SetName, SetOp, KERNEL_PREFIX};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Write,
    sync::Arc,
};
use tracing::{debug, error, instrument, trace};

/// Answers whether a kernel set is still used by something outside the set store.
pub trait SetReferences {
    /// Describes a user of the named kernel set, if there is one.
    fn find_reference(&self, set: &str) -> Option<String>;
}

/// Applies set operations to the kernel.
#[derive(Clone)]
pub struct SetStore {
    kernel: Arc<dyn Kernel>,
}

/// The managed portion of the kernel's sets, keyed by kernel name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SetState {
    sets: BTreeMap<String, KernelSet>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KernelSet {
    pub kind: SetKind,
    /// Members in kernel syntax.
    pub members: BTreeSet<String>,
}

/// A point-in-time copy of the managed sets that may be restored later.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetSnapshot(SetState);

/// Used for batches that cannot conflict with filter rules.
impl SetReferences for () {
    fn find_reference(&self, _: &str) -> Option<String> {
        None
    }
}

// === impl SetStore ===

impl SetStore {
    pub fn new(kernel: impl Kernel + 'static) -> Self {
        Self {
            kernel: Arc::new(kernel),
        }
    }

    /// Reads the managed sets from the kernel.
    pub fn state(&self) -> Result<SetState, Error> {
        SetState::parse(&self.kernel.save()?)
    }

    /// Returns the kernel's full dump, suitable for persisting to disk.
    pub fn save(&self) -> Result<String, Error> {
        Ok(self.kernel.save()?)
    }

    pub fn snapshot(&self) -> Result<SetSnapshot, Error> {
        self.state().map(SetSnapshot)
    }

    /// Converges the managed sets to the snapshot, destroying sets that did not exist when it
    /// was taken.
    ///
    /// Sets that are still referenced by filter rules cannot be destroyed, so when filter rules
    /// are restored at the same time, callers should [`SetStore::refill`] first, restore the
    /// filter rules, and then restore the sets.
    #[instrument(skip_all)]
    pub fn restore(&self, snapshot: &SetSnapshot) -> Result<(), Error> {
        self.converge(&snapshot.0, true)
    }

    /// Converges the snapshot's sets without destroying any sets created since it was taken.
    #[instrument(skip_all)]
    pub fn refill(&self, snapshot: &SetSnapshot) -> Result<(), Error> {
        self.converge(&snapshot.0, false)
    }

    pub fn ensure_set(&self, set: &SetName, kind: SetKind) -> Result<(), Error> {
        self.apply_batch(
            &[SetOp::Ensure {
                set: set.clone(),
                kind,
            }],
            &(),
        )
    }

    pub fn add_member(&self, set: &SetName, member: Member) -> Result<(), Error> {
        self.apply_batch(
            &[SetOp::Add {
                set: set.clone(),
                member,
            }],
            &(),
        )
    }

    pub fn remove_member(&self, set: &SetName, member: Member) -> Result<(), Error> {
        self.apply_batch(
            &[SetOp::Remove {
                set: set.clone(),
                member,
            }],
            &(),
        )
    }

    pub fn delete_set(&self, set: &SetName, refs: &dyn SetReferences) -> Result<(), Error> {
        self.apply_batch(&[SetOp::Delete { set: set.clone() }], refs)
    }

    /// Applies all operations or none of them.
    ///
    /// Deleting a set that `refs` reports as used, or that is nested in a list set, fails before
    /// anything is applied. If the kernel rejects an operation, the sets are restored to their
    /// state before the batch.
    #[instrument(skip_all, fields(ops = ops.len()))]
    pub fn apply_batch(&self, ops: &[SetOp], refs: &dyn SetReferences) -> Result<(), Error> {
        if ops.is_empty() {
            return Ok(());
        }

        let before = self.state()?;
        let (script, lines) = render_batch(&before, ops, refs)?;
        if script.is_empty() {
            return Ok(());
        }
        trace!(%script);

        let source = match self.kernel.restore(&script) {
            Ok(()) => return Ok(()),
            Err(error) => error,
        };

        let index = source
            .line
            .and_then(|l| lines.get(l.wrapping_sub(1)).copied());
        let op = index.map(|i| ops[i].to_string());
        debug!(?index, ?op, %source, "Batch failed; restoring sets");
        if let Err(error) = self.converge(&before, true) {
            error!(%error, "Failed to restore sets after a failed batch");
        }
        Err(Error::PartialApply { index, op, source })
    }

    fn converge(&self, target: &SetState, prune: bool) -> Result<(), Error> {
        let current = self.state()?;
        let script = render_restore(&current, target, prune);
        if script.is_empty() {
            return Ok(());
        }
        trace!(%script);
        self.kernel.restore(&script).map_err(Into::into)
    }
}

impl std::fmt::Debug for SetStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SetStore").finish_non_exhaustive()
    }
}

/// Renders a batch against a working copy of the current state, returning the script and the
/// operation index that produced each line.
fn render_batch(
    state: &SetState,
    ops: &[SetOp],
    refs: &dyn SetReferences,
) -> Result<(String, Vec<usize>), Error> {
    let mut work = state.clone();
    let mut script = String::new();
    let mut lines = Vec::new();
    let mut emit = |idx: usize, line: String| {
        script.push_str(&line);
        script.push('\n');
        lines.push(idx);
    };

    for (idx, op) in ops.iter().enumerate() {
        let name = op.set().kernel_name();
        match op {
            SetOp::Ensure { kind, .. } => {
                if work.sets.get(&name).map(|s| s.kind) == Some(*kind) {
                    continue;
                }
                emit(idx, format!("create {name} {kind} {}", kind.create_options()));
                work.sets.insert(
                    name,
                    KernelSet {
                        kind: *kind,
                        members: BTreeSet::new(),
                    },
                );
            }
            SetOp::Add { member, .. } => {
                let member = member.render();
                emit(idx, format!("add {name} {member}"));
                if let Some(set) = work.sets.get_mut(&name) {
                    set.members.insert(member);
                }
            }
            SetOp::Remove { member, .. } => {
                let member = member.render();
                emit(idx, format!("del {name} {}", strip_nomatch(&member)));
                if let Some(set) = work.sets.get_mut(&name) {
                    set.members.remove(strip_nomatch(&member));
                    set.members.remove(&member);
                }
            }
            SetOp::Delete { set } => {
                if !work.sets.contains_key(&name) {
                    continue;
                }
                if let Some(by) = refs.find_reference(&name) {
                    return Err(Error::ReferentialIntegrity {
                        set: set.to_string(),
                        by,
                    });
                }
                if let Some(list) = work.list_containing(&name) {
                    return Err(Error::ReferentialIntegrity {
                        set: set.to_string(),
                        by: format!("list set {list}"),
                    });
                }
                emit(idx, format!("destroy {name}"));
                work.sets.remove(&name);
            }
        }
    }

    Ok((script, lines))
}

/// Renders a script that moves `current` to `target`.
///
/// Hash sets are created before list sets so that list members exist when they are added, and
/// list members are removed before any set is destroyed.
fn render_restore(current: &SetState, target: &SetState, prune: bool) -> String {
    let mut script = String::new();
    let by_kind = |state: &SetState, list: bool| {
        state
            .sets
            .iter()
            .filter(move |(_, s)| (s.kind == SetKind::List) == list)
            .map(|(n, s)| (n.clone(), s.clone()))
            .collect::<Vec<_>>()
    };

    // A set whose kind changed has to be recreated.
    let mismatched = current
        .sets
        .iter()
        .filter(|(n, s)| target.sets.get(*n).is_some_and(|t| t.kind != s.kind))
        .map(|(n, _)| n.clone())
        .collect::<BTreeSet<_>>();
    for name in &mismatched {
        let _ = writeln!(script, "flush {name}");
    }
    for name in &mismatched {
        let _ = writeln!(script, "destroy {name}");
    }

    for list in [false, true] {
        for (name, set) in by_kind(target, list) {
            let existing = current
                .sets
                .get(&name)
                .filter(|_| !mismatched.contains(&name));
            if existing.is_none() {
                let _ = writeln!(
                    script,
                    "create {name} {} {}",
                    set.kind,
                    set.kind.create_options()
                );
            }
            let empty = BTreeSet::new();
            let have = existing.map(|s| &s.members).unwrap_or(&empty);
            for member in have.difference(&set.members) {
                let _ = writeln!(script, "del {name} {}", strip_nomatch(member));
            }
            for member in set.members.difference(have) {
                let _ = writeln!(script, "add {name} {member}");
            }
        }
    }

    if prune {
        let stale = current
            .sets
            .iter()
            .filter(|(n, _)| !target.sets.contains_key(*n))
            .collect::<Vec<_>>();
        for (name, set) in &stale {
            if set.kind == SetKind::List && !set.members.is_empty() {
                let _ = writeln!(script, "flush {name}");
            }
        }
        // Lists first, so that their members are no longer nested when destroyed.
        for list in [true, false] {
            for (name, set) in &stale {
                if (set.kind == SetKind::List) == list {
                    let _ = writeln!(script, "destroy {name}");
                }
            }
        }
    }

    script
}

fn strip_nomatch(member: &str) -> &str {
    member.strip_suffix(" nomatch").unwrap_or(member)
}

// === impl SetState ===

impl SetState {
    /// Parses the managed sets out of an `ipset save` dump.
    pub fn parse(dump: &str) -> Result<Self, Error> {
        let mut sets = BTreeMap::new();
        for (i, line) in dump.lines().enumerate() {
            let parse_error = |message: String| Error::Parse {
                what: "ipset",
                line: i + 1,
                message,
            };

            let mut words = line.split_whitespace();
            match (words.next(), words.next()) {
                (Some("create"), Some(name)) if name.starts_with(KERNEL_PREFIX) => {
                    let kind = words
                        .next()
                        .ok_or_else(|| parse_error(format!("set {name} has no type")))?
                        .parse::<SetKind>()
                        .map_err(|e| parse_error(e.to_string()))?;
                    sets.insert(
                        name.to_string(),
                        KernelSet {
                            kind,
                            members: BTreeSet::new(),
                        },
                    );
                }
                (Some("add"), Some(name)) if name.starts_with(KERNEL_PREFIX) => {
                    let member = words.collect::<Vec<_>>().join(" ");
                    let set = sets
                        .get_mut(name)
                        .ok_or_else(|| parse_error(format!("set {name} was not created")))?;
                    set.members.insert(member);
                }
                _ => {}
            }
        }
        Ok(Self { sets })
    }

    pub fn get(&self, set: &SetName) -> Option<&KernelSet> {
        self.sets.get(&set.kernel_name())
    }

    /// Members of the set in kernel syntax, if the set exists.
    pub fn members(&self, set: &SetName) -> Option<&BTreeSet<String>> {
        self.get(set).map(|s| &s.members)
    }

    pub fn contains(&self, set: &SetName) -> bool {
        self.get(set).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &KernelSet)> {
        self.sets.iter().map(|(n, s)| (n.as_str(), s))
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    fn list_containing(&self, name: &str) -> Option<&str> {
        self.sets
            .iter()
            .find(|(_, s)| s.kind == SetKind::List && s.members.contains(name))
            .map(|(n, _)| n.as_str())
    }
}

impl FromIterator<(String, KernelSet)> for SetState {
    fn from_iter<T: IntoIterator<Item = (String, KernelSet)>>(iter: T) -> Self {
        Self {
            sets: iter.into_iter().collect(),
        }
    }
}

// === impl SetSnapshot ===

impl SetSnapshot {
    /// Parses a snapshot from a persisted `ipset save` dump.
    pub fn parse(dump: &str) -> Result<Self, Error> {
        SetState::parse(dump).map(Self)
    }

    pub fn state(&self) -> &SetState {
        &self.0
    }
}

impl From<SetState> for SetSnapshot {
    fn from(state: SetState) -> Self {
        Self(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeNetfilter;

    fn ip(s: &str) -> Member {
        Member::addr(s.parse().unwrap())
    }

    #[test]
    fn applies_batches() {
        let nf = FakeNetfilter::default();
        let store = SetStore::new(nf.ipset());
        let ns = SetName::namespace("default");
        let all = SetName::AllNamespaces;

        store
            .apply_batch(
                &[
                    SetOp::Ensure {
                        set: ns.clone(),
                        kind: SetKind::HashNet,
                    },
                    SetOp::Add {
                        set: ns.clone(),
                        member: ip("10.0.0.1"),
                    },
                    SetOp::Add {
                        set: ns.clone(),
                        member: ip("10.0.0.2"),
                    },
                    SetOp::Ensure {
                        set: all.clone(),
                        kind: SetKind::List,
                    },
                    SetOp::Add {
                        set: all.clone(),
                        member: Member::Set(ns.clone()),
                    },
                    SetOp::Remove {
                        set: ns.clone(),
                        member: ip("10.0.0.1"),
                    },
                ],
                &(),
            )
            .expect("batch must apply");

        let state = store.state().unwrap();
        assert_eq!(
            state.members(&ns).unwrap(),
            &["10.0.0.2".to_string()].into_iter().collect()
        );
        assert_eq!(
            state.members(&all).unwrap(),
            &[ns.kernel_name()].into_iter().collect()
        );
    }

    #[test]
    fn failed_batch_restores_prior_state() {
        let nf = FakeNetfilter::default();
        let store = SetStore::new(nf.ipset());
        let ns = SetName::namespace("default");
        store.ensure_set(&ns, SetKind::HashNet).unwrap();
        store.add_member(&ns, ip("10.0.0.1")).unwrap();
        let before = store.state().unwrap();

        nf.fail_ipset_on("10.0.0.9");
        let err = store
            .apply_batch(
                &[
                    SetOp::Remove {
                        set: ns.clone(),
                        member: ip("10.0.0.1"),
                    },
                    SetOp::Ensure {
                        set: SetName::pod_label("app", None),
                        kind: SetKind::HashNet,
                    },
                    SetOp::Add {
                        set: ns.clone(),
                        member: ip("10.0.0.9"),
                    },
                ],
                &(),
            )
            .expect_err("batch must fail");
        match err {
            Error::PartialApply { index, .. } => assert_eq!(index, Some(2)),
            e => panic!("unexpected error: {e}"),
        }
        assert_eq!(store.state().unwrap(), before);
    }

    #[test]
    fn refuses_to_delete_referenced_sets() {
        struct Rules(String);
        impl SetReferences for Rules {
            fn find_reference(&self, set: &str) -> Option<String> {
                (set == self.0).then(|| "a rule".to_string())
            }
        }

        let nf = FakeNetfilter::default();
        let store = SetStore::new(nf.ipset());
        let ns = SetName::namespace("default");
        let label = SetName::namespace_label("team", Some("a"));
        store.ensure_set(&ns, SetKind::HashNet).unwrap();
        store.ensure_set(&label, SetKind::List).unwrap();
        store.add_member(&label, Member::Set(ns.clone())).unwrap();

        let err = store.delete_set(&ns, &()).expect_err("nested set");
        assert!(matches!(err, Error::ReferentialIntegrity { .. }), "{err}");

        let err = store
            .delete_set(&label, &Rules(label.kernel_name()))
            .expect_err("referenced set");
        assert!(matches!(err, Error::ReferentialIntegrity { .. }), "{err}");

        store.delete_set(&label, &()).unwrap();
        store.delete_set(&ns, &()).unwrap();
        assert!(store.state().unwrap().is_empty());
    }

    #[test]
    fn snapshot_restore_round_trip() {
        let nf = FakeNetfilter::default();
        let store = SetStore::new(nf.ipset());
        let ns = SetName::namespace("a");
        let all = SetName::AllNamespaces;
        store.ensure_set(&ns, SetKind::HashNet).unwrap();
        store.add_member(&ns, ip("10.0.0.1")).unwrap();
        store.ensure_set(&all, SetKind::List).unwrap();
        store.add_member(&all, Member::Set(ns.clone())).unwrap();
        let snapshot = store.snapshot().unwrap();

        let other = SetName::namespace("b");
        store.remove_member(&all, Member::Set(ns.clone())).unwrap();
        store.delete_set(&ns, &()).unwrap();
        store.ensure_set(&other, SetKind::HashNet).unwrap();
        store.add_member(&all, Member::Set(other.clone())).unwrap();

        store.restore(&snapshot).unwrap();
        assert_eq!(store.state().unwrap(), *snapshot.state());
    }

    #[test]
    fn ignores_unmanaged_sets() {
        let dump = "\
create KUBE-CLUSTER-IP hash:ip,port family inet hashsize 1024 maxelem 65536
add KUBE-CLUSTER-IP 10.96.0.1,tcp:443
create netpol-0000000000000001 hash:net family inet hashsize 1024 maxelem 65536
add netpol-0000000000000001 10.0.0.0/8
add netpol-0000000000000001 10.1.0.0/16 nomatch
";
        let state = SetState::parse(dump).unwrap();
        assert_eq!(state.len(), 1);
        let (_, set) = state.iter().next().unwrap();
        assert_eq!(set.kind, SetKind::HashNet);
        assert!(set.members.contains("10.1.0.0/16 nomatch"));
    }
}
