use crate::cache::{CacheError, EntityCache, Membership};
use netpol_controller_core::ipset::{Member, SetName};
use netpol_controller_k8s_api::{self as k8s, Labels, ResourceExt};
use std::collections::BTreeSet;
use tracing::{debug, instrument};

/// Holds the state of an individual namespace.
#[derive(Clone, Debug)]
pub struct NamespaceEntry {
    pub(crate) labels: Labels,

    /// Memberships currently contributed to the set index.
    pub(crate) memberships: BTreeSet<Membership>,
}

// === impl NamespaceEntry ===

impl NamespaceEntry {
    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    pub fn memberships(&self) -> &BTreeSet<Membership> {
        &self.memberships
    }
}

/// The memberships a namespace with the given labels contributes: its pod set is nested in the
/// set of all namespaces and in a set per label key and key/value pair.
pub(crate) fn memberships(name: &str, labels: &Labels) -> BTreeSet<Membership> {
    let member = Member::Set(SetName::namespace(name));
    let mut memberships = BTreeSet::new();
    memberships.insert((SetName::AllNamespaces, member.clone()));
    for (key, value) in labels.iter() {
        memberships.extend(label_memberships(key, value, &member));
    }
    memberships
}

fn label_memberships(key: &str, value: &str, member: &Member) -> [Membership; 2] {
    [
        (SetName::namespace_label(key, None), member.clone()),
        (SetName::namespace_label(key, Some(value)), member.clone()),
    ]
}

// === impl EntityCache ===

impl EntityCache {
    #[instrument(skip_all, fields(name = %ns.name_unchecked()))]
    pub fn add_namespace(&mut self, ns: &k8s::Namespace) -> Result<(), CacheError> {
        let name = ns.name_unchecked();
        if self.namespaces.contains_key(&name) {
            return Err(CacheError::AlreadyExists {
                kind: "namespace",
                id: name,
            });
        }

        self.touch_namespace(&name);
        let labels = Labels::from(ns.metadata.labels.clone());
        let mut memberships = BTreeSet::new();
        Self::retract_and_add(
            &mut self.sets,
            &mut memberships,
            None,
            self::memberships(&name, &labels),
        );
        debug!(memberships = memberships.len(), "Added namespace");
        self.namespaces.insert(
            name,
            NamespaceEntry {
                labels,
                memberships,
            },
        );
        Ok(())
    }

    /// Updates a namespace's labels.
    ///
    /// `old` identifies the namespace; its attributes are taken from the cache. If `new` has a
    /// different name, the old namespace is removed before the new one is added.
    #[instrument(skip_all, fields(name = %new.name_unchecked()))]
    pub fn update_namespace(
        &mut self,
        old: &k8s::Namespace,
        new: &k8s::Namespace,
    ) -> Result<(), CacheError> {
        let old_name = old.name_unchecked();
        let name = new.name_unchecked();
        if old_name != name {
            debug!(%old_name, "Namespace renamed");
            self.delete_namespace(&old_name)?;
            return self.add_namespace(new);
        }

        let labels = Labels::from(new.metadata.labels.clone());
        self.touch_namespace(&name);
        let Self {
            namespaces, sets, ..
        } = self;
        let entry = namespaces.get_mut(&name).ok_or_else(|| CacheError::NotFound {
            kind: "namespace",
            id: name.clone(),
        })?;

        let expected = self::memberships(&name, &entry.labels);
        if entry.memberships == expected {
            let member = Member::Set(SetName::namespace(&*name));
            let delta = entry.labels.delta(&labels);
            let mut retract = Vec::new();
            let mut add = Vec::new();
            for (key, value) in &delta.removed {
                retract.extend(label_memberships(key, value, &member));
            }
            for (key, value) in &delta.added {
                add.extend(label_memberships(key, value, &member));
            }
            for (key, (old, new)) in &delta.changed {
                retract.push((SetName::namespace_label(key, Some(old)), member.clone()));
                add.push((SetName::namespace_label(key, Some(new)), member.clone()));
            }
            debug!(
                added = delta.added.len(),
                removed = delta.removed.len(),
                changed = delta.changed.len(),
                "Updating namespace labels"
            );
            Self::retract_and_add(sets, &mut entry.memberships, retract, add);
        } else {
            debug!("Rebuilding namespace memberships");
            let retract = std::mem::take(&mut entry.memberships);
            for (set, member) in &retract {
                sets.remove(set, member);
            }
            Self::retract_and_add(
                sets,
                &mut entry.memberships,
                None,
                self::memberships(&name, &labels),
            );
        }
        entry.labels = labels;
        Ok(())
    }

    /// Removes a namespace and retracts all of its memberships.
    ///
    /// Pods in the namespace are unaffected.
    #[instrument(skip(self))]
    pub fn delete_namespace(&mut self, name: &str) -> Result<(), CacheError> {
        if !self.namespaces.contains_key(name) {
            return Err(CacheError::NotFound {
                kind: "namespace",
                id: name.to_string(),
            });
        }
        self.touch_namespace(name);
        if let Some(entry) = self.namespaces.remove(name) {
            for (set, member) in &entry.memberships {
                self.sets.remove(set, member);
            }
            debug!(memberships = entry.memberships.len(), "Deleted namespace");
        }
        Ok(())
    }
}
