use netpol_controller_core::ipset::{Member, SetKind, SetName, SetOp};
use netpol_controller_kernel::ipset::{KernelSet, SetState};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace};

/// The desired contents of every membership set, along with what is known to be installed.
///
/// Members are reference counted so that a member contributed by more than one entity (e.g. two
/// pods that briefly share an address) is only retracted when its last contributor goes away. Sets
/// may also be pinned, which keeps them alive while empty: a namespace pins its own set and a
/// policy pins every set its rules reference.
///
/// Changes are journaled until they are either committed (once the kernel has accepted them) or
/// rolled back.
#[derive(Debug, Default)]
pub struct SetIndex {
    desired: BTreeMap<SetName, Desired>,
    installed: BTreeMap<SetName, BTreeSet<Member>>,
    journal: BTreeMap<SetName, Option<Desired>>,
}

/// The kernel operations needed to converge installed sets with desired sets.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SetPlan {
    /// Creates sets and adds or removes members. Applied before filter rules change.
    pub changes: Vec<SetOp>,
    /// Destroys sets that are no longer used. Applied after filter rules change.
    pub deletes: Vec<SetOp>,
}

#[derive(Clone, Debug)]
struct Desired {
    kind: SetKind,
    members: BTreeMap<Member, usize>,
    pins: usize,
    /// The number of list sets this set is a member of.
    nested: usize,
}

// === impl SetIndex ===

impl SetIndex {
    /// Adds a contribution of `member` to `set`, creating the set if needed.
    pub fn add(&mut self, set: &SetName, member: &Member) {
        if let Member::Set(inner) = member {
            self.entry(inner);
        }
        let count = {
            let desired = self.entry(set);
            let count = desired.members.entry(member.clone()).or_default();
            *count += 1;
            *count
        };
        trace!(%set, %member, count, "Added member");
        if count == 1 {
            if let Member::Set(inner) = member {
                self.entry(inner).nested += 1;
            }
        }
    }

    /// Retracts a contribution of `member` from `set`.
    pub fn remove(&mut self, set: &SetName, member: &Member) {
        let Some(count) = self
            .desired
            .get(set)
            .and_then(|d| d.members.get(member))
            .copied()
        else {
            debug!(%set, %member, "Member not present");
            return;
        };
        let desired = self.entry(set);
        if count > 1 {
            desired.members.insert(member.clone(), count - 1);
            return;
        }
        desired.members.remove(member);
        trace!(%set, %member, "Removed member");
        if let Member::Set(inner) = member {
            let inner = self.entry(inner);
            inner.nested = inner.nested.saturating_sub(1);
        }
    }

    /// Keeps the set alive while it is empty.
    pub fn pin(&mut self, set: &SetName) {
        self.entry(set).pins += 1;
    }

    pub fn unpin(&mut self, set: &SetName) {
        if self.desired.contains_key(set) {
            let desired = self.entry(set);
            desired.pins = desired.pins.saturating_sub(1);
        }
    }

    /// Returns the desired members of a set, if it exists.
    pub fn members(&self, set: &SetName) -> Option<BTreeSet<Member>> {
        self.desired
            .get(set)
            .map(|d| d.members.keys().cloned().collect())
    }

    /// Returns the number of contributions of `member` to `set`.
    pub fn count(&self, set: &SetName, member: &Member) -> usize {
        self.desired
            .get(set)
            .and_then(|d| d.members.get(member))
            .copied()
            .unwrap_or(0)
    }

    pub fn contains(&self, set: &SetName) -> bool {
        self.desired.contains_key(set)
    }

    pub fn names(&self) -> impl Iterator<Item = &SetName> {
        self.desired.keys()
    }

    /// Returns true if there are changes that have not been committed or rolled back.
    pub fn is_dirty(&self) -> bool {
        !self.journal.is_empty()
    }

    /// Drops unused sets and computes the kernel operations for all journaled changes.
    ///
    /// A set is unused when it has no members, is not pinned, and is not nested in a list set.
    pub fn plan(&mut self) -> SetPlan {
        self.sweep();

        let mut plan = SetPlan::default();
        let touched = self.journal.keys().cloned().collect::<Vec<_>>();
        let mut ensures = Vec::new();
        let mut removes = Vec::new();
        let mut adds = Vec::new();
        let mut deletes = Vec::new();
        let empty = BTreeSet::new();
        for name in touched {
            let installed = self.installed.get(&name);
            match self.desired.get(&name) {
                Some(desired) => {
                    if installed.is_none() {
                        ensures.push(SetOp::Ensure {
                            set: name.clone(),
                            kind: desired.kind,
                        });
                    }
                    let have = installed.unwrap_or(&empty);
                    for member in have.iter().filter(|m| !desired.members.contains_key(*m)) {
                        removes.push((desired.kind, name.clone(), member.clone()));
                    }
                    for member in desired.members.keys().filter(|m| !have.contains(*m)) {
                        adds.push((desired.kind, name.clone(), member.clone()));
                    }
                }
                None => {
                    if let Some(have) = installed {
                        let kind = name.kind();
                        for member in have {
                            removes.push((kind, name.clone(), member.clone()));
                        }
                        deletes.push((kind, name.clone()));
                    }
                }
            }
        }

        // Hash sets exist before list sets reference them; list memberships are retracted before
        // their member sets are destroyed.
        let is_list = |kind: &SetKind| *kind == SetKind::List;
        ensures.sort_by_key(|op| match op {
            SetOp::Ensure { kind, .. } => is_list(kind),
            _ => false,
        });
        plan.changes.extend(ensures);
        removes.sort_by_key(|(kind, _, _)| !is_list(kind));
        plan.changes
            .extend(removes.into_iter().map(|(_, set, member)| SetOp::Remove { set, member }));
        adds.sort_by_key(|(kind, _, _)| is_list(kind));
        plan.changes
            .extend(adds.into_iter().map(|(_, set, member)| SetOp::Add { set, member }));
        deletes.sort_by_key(|(kind, _)| !is_list(kind));
        plan.deletes
            .extend(deletes.into_iter().map(|(_, set)| SetOp::Delete { set }));
        plan
    }

    /// Records that all journaled changes are installed.
    pub fn commit(&mut self) {
        for (name, _) in std::mem::take(&mut self.journal) {
            match self.desired.get(&name) {
                Some(desired) => {
                    self.installed
                        .insert(name, desired.members.keys().cloned().collect());
                }
                None => {
                    self.installed.remove(&name);
                }
            }
        }
    }

    /// Discards all journaled changes.
    pub fn rollback(&mut self) {
        for (name, prior) in std::mem::take(&mut self.journal) {
            match prior {
                Some(prior) => {
                    self.desired.insert(name, prior);
                }
                None => {
                    self.desired.remove(&name);
                }
            }
        }
    }

    /// Records that the kernel holds exactly the desired sets, e.g. after it was converged
    /// wholesale from [`SetIndex::to_kernel_state`].
    pub fn assume_installed(&mut self) {
        self.journal.clear();
        self.installed = self
            .desired
            .iter()
            .map(|(name, desired)| (name.clone(), desired.members.keys().cloned().collect()))
            .collect();
    }

    /// Renders the desired sets in kernel form.
    pub fn to_kernel_state(&self) -> SetState {
        self.desired
            .iter()
            .map(|(name, desired)| {
                let set = KernelSet {
                    kind: desired.kind,
                    members: desired.members.keys().map(Member::render).collect(),
                };
                (name.kernel_name(), set)
            })
            .collect()
    }

    fn sweep(&mut self) {
        let unused = self
            .desired
            .iter()
            .filter(|(_, d)| d.members.is_empty() && d.pins == 0 && d.nested == 0)
            .map(|(n, _)| n.clone())
            .collect::<Vec<_>>();
        for name in unused {
            debug!(set = %name, "Dropping unused set");
            self.journal(&name);
            self.desired.remove(&name);
        }
    }

    fn journal(&mut self, name: &SetName) {
        if !self.journal.contains_key(name) {
            self.journal
                .insert(name.clone(), self.desired.get(name).cloned());
        }
    }

    fn entry(&mut self, name: &SetName) -> &mut Desired {
        self.journal(name);
        self.desired.entry(name.clone()).or_insert_with(|| Desired {
            kind: name.kind(),
            members: BTreeMap::new(),
            pins: 0,
            nested: 0,
        })
    }
}
