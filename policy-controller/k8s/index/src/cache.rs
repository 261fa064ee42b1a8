use crate::{
    namespace::NamespaceEntry,
    pod::PodEntry,
    policy::{PolicyEntry, ProcessedPolicy},
    sets::{SetIndex, SetPlan},
};
use ahash::AHashMap as HashMap;
use netpol_controller_core::{
    ipset::{Member, SetName},
    ResourceId,
};
use std::collections::BTreeSet;
use tracing::trace;

/// An in-memory mirror of the namespaces, pods, and network policies on this cluster, along with
/// the membership sets derived from them.
///
/// The cache performs no locking; callers serialize access. Mutations are checkpointed: everything
/// derived from an event may be rolled back if the kernel rejects it, while the entities' own
/// attributes keep tracking the cluster.
#[derive(Debug)]
pub struct EntityCache {
    pub(crate) namespaces: HashMap<String, NamespaceEntry>,
    pub(crate) pods: HashMap<ResourceId, PodEntry>,
    pub(crate) policies: HashMap<ResourceId, PolicyEntry>,
    pub(crate) processed: HashMap<ResourceId, ProcessedPolicy>,
    pub(crate) sets: SetIndex,
    checkpoint: Checkpoint,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} {id} already exists")]
    AlreadyExists { kind: &'static str, id: String },
}

/// A single membership: `member` belongs to `set`.
pub type Membership = (SetName, Member);

/// Prior versions of everything touched since the last commit.
#[derive(Debug, Default)]
struct Checkpoint {
    namespaces: HashMap<String, Option<NamespaceEntry>>,
    pods: HashMap<ResourceId, Option<PodEntry>>,
    policies: HashMap<ResourceId, Option<PolicyEntry>>,
    processed: HashMap<ResourceId, Option<ProcessedPolicy>>,
}

// === impl EntityCache ===

impl Default for EntityCache {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityCache {
    /// Creates a cache holding only the set of all namespaces.
    pub fn new() -> Self {
        let mut sets = SetIndex::default();
        sets.pin(&SetName::AllNamespaces);
        Self {
            namespaces: HashMap::default(),
            pods: HashMap::default(),
            policies: HashMap::default(),
            processed: HashMap::default(),
            sets,
            checkpoint: Checkpoint::default(),
        }
    }

    pub fn namespace(&self, name: &str) -> Option<&NamespaceEntry> {
        self.namespaces.get(name)
    }

    pub fn pod(&self, id: &ResourceId) -> Option<&PodEntry> {
        self.pods.get(id)
    }

    pub fn policy(&self, id: &ResourceId) -> Option<&PolicyEntry> {
        self.policies.get(id)
    }

    pub fn processed(&self, id: &ResourceId) -> Option<&ProcessedPolicy> {
        self.processed.get(id)
    }

    pub fn namespace_names(&self) -> impl Iterator<Item = &str> {
        self.namespaces.keys().map(String::as_str)
    }

    pub fn pod_ids(&self) -> impl Iterator<Item = &ResourceId> {
        self.pods.keys()
    }

    pub fn policy_ids(&self) -> impl Iterator<Item = &ResourceId> {
        self.policies.keys()
    }

    pub fn processed_ids(&self) -> impl Iterator<Item = &ResourceId> {
        self.processed.keys()
    }

    /// The desired members of a membership set, if the set exists.
    pub fn set_members(&self, set: &SetName) -> Option<BTreeSet<Member>> {
        self.sets.members(set)
    }

    pub fn sets(&self) -> &SetIndex {
        &self.sets
    }

    /// Drops unused sets and returns the kernel operations needed to install every change since
    /// the last commit.
    pub fn plan(&mut self) -> SetPlan {
        self.sets.plan()
    }

    /// Returns the policies whose installed rules changed since the last commit, sorted.
    pub fn changed_policies(&self) -> Vec<ResourceId> {
        let mut ids = self
            .checkpoint
            .processed
            .iter()
            .filter(|(id, prior)| {
                let prior = prior.as_ref().map(|p| &p.compiled.rules);
                prior != self.processed.get(*id).map(|p| &p.compiled.rules)
            })
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }

    /// Accepts all changes since the last commit.
    pub fn commit(&mut self) {
        self.sets.commit();
        self.checkpoint = Checkpoint::default();
    }

    /// Reverts everything derived since the last commit.
    ///
    /// Entities that were added or updated keep their new attributes, but their recorded
    /// memberships revert, so the next update of such an entity rebuilds its memberships in full.
    /// Entities that were deleted are reinstated.
    pub fn rollback(&mut self) {
        self.sets.rollback();
        let Checkpoint {
            namespaces,
            pods,
            policies,
            processed,
        } = std::mem::take(&mut self.checkpoint);

        for (name, prior) in namespaces {
            trace!(%name, "Rolling back namespace");
            rollback_entity(&mut self.namespaces, name, prior, |e| &mut e.memberships);
        }
        for (id, prior) in pods {
            trace!(%id, "Rolling back pod");
            rollback_entity(&mut self.pods, id, prior, |e| &mut e.memberships);
        }
        for (id, prior) in policies {
            if let (Some(prior), false) = (prior, self.policies.contains_key(&id)) {
                self.policies.insert(id, prior);
            }
        }
        for (id, prior) in processed {
            match prior {
                Some(prior) => self.processed.insert(id, prior),
                None => self.processed.remove(&id),
            };
        }
    }

    /// Applies membership changes for one entity, keeping its record up to date.
    pub(crate) fn retract_and_add(
        sets: &mut SetIndex,
        recorded: &mut BTreeSet<Membership>,
        retract: impl IntoIterator<Item = Membership>,
        add: impl IntoIterator<Item = Membership>,
    ) {
        for (set, member) in retract {
            if recorded.remove(&(set.clone(), member.clone())) {
                sets.remove(&set, &member);
            }
        }
        for (set, member) in add {
            if recorded.insert((set.clone(), member.clone())) {
                sets.add(&set, &member);
            }
        }
    }

    pub(crate) fn touch_namespace(&mut self, name: &str) {
        if !self.checkpoint.namespaces.contains_key(name) {
            let prior = self.namespaces.get(name).cloned();
            self.checkpoint.namespaces.insert(name.to_string(), prior);
        }
    }

    pub(crate) fn touch_pod(&mut self, id: &ResourceId) {
        if !self.checkpoint.pods.contains_key(id) {
            let prior = self.pods.get(id).cloned();
            self.checkpoint.pods.insert(id.clone(), prior);
        }
    }

    pub(crate) fn touch_policy(&mut self, id: &ResourceId) {
        if !self.checkpoint.policies.contains_key(id) {
            let prior = self.policies.get(id).cloned();
            self.checkpoint.policies.insert(id.clone(), prior);
        }
        if !self.checkpoint.processed.contains_key(id) {
            let prior = self.processed.get(id).cloned();
            self.checkpoint.processed.insert(id.clone(), prior);
        }
    }
}

/// Restores an entity's recorded memberships, or reinstates it if it was deleted.
fn rollback_entity<K, E>(
    entities: &mut HashMap<K, E>,
    key: K,
    prior: Option<E>,
    memberships: impl Fn(&mut E) -> &mut BTreeSet<Membership>,
) where
    K: std::hash::Hash + Eq,
{
    match (entities.get_mut(&key), prior) {
        (Some(current), Some(mut prior)) => {
            std::mem::swap(memberships(current), memberships(&mut prior));
        }
        (Some(current), None) => memberships(current).clear(),
        (None, Some(prior)) => {
            entities.insert(key, prior);
        }
        (None, None) => {}
    }
}
