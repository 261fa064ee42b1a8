use crate::{
    cache::{CacheError, EntityCache},
    compile::Compiled,
};
use netpol_controller_core::ResourceId;
use netpol_controller_k8s_api::{self as k8s, ResourceExt};
use tracing::{debug, instrument};

/// A network policy as received from the cluster.
#[derive(Clone, Debug)]
pub struct PolicyEntry {
    pub(crate) policy: k8s::NetworkPolicy,
}

/// A policy whose compiled form is installed.
#[derive(Clone, Debug, PartialEq)]
pub struct ProcessedPolicy {
    pub(crate) compiled: Compiled,

    /// The spec the rules were compiled from.
    pub(crate) spec: k8s::NetworkPolicySpec,
}

// === impl PolicyEntry ===

impl PolicyEntry {
    pub fn policy(&self) -> &k8s::NetworkPolicy {
        &self.policy
    }

    pub fn spec(&self) -> k8s::NetworkPolicySpec {
        self.policy.spec.clone().unwrap_or_default()
    }
}

// === impl ProcessedPolicy ===

impl ProcessedPolicy {
    pub fn compiled(&self) -> &Compiled {
        &self.compiled
    }

    pub fn spec(&self) -> &k8s::NetworkPolicySpec {
        &self.spec
    }
}

pub(crate) fn policy_id(policy: &k8s::NetworkPolicy) -> ResourceId {
    ResourceId::new(
        policy.namespace().unwrap_or_default(),
        policy.name_unchecked(),
    )
}

// === impl EntityCache ===

impl EntityCache {
    /// Records a policy. Its rules are installed separately, once compiled.
    #[instrument(skip_all, fields(policy = %policy_id(policy)))]
    pub fn add_policy(&mut self, policy: &k8s::NetworkPolicy) -> Result<(), CacheError> {
        let id = policy_id(policy);
        if self.policies.contains_key(&id) {
            return Err(CacheError::AlreadyExists {
                kind: "networkpolicy",
                id: id.to_string(),
            });
        }
        self.touch_policy(&id);
        self.policies.insert(
            id,
            PolicyEntry {
                policy: policy.clone(),
            },
        );
        debug!("Added policy");
        Ok(())
    }

    /// Replaces a policy's spec. If `new` has a different identity, the old policy is removed
    /// (and its rules released) before the new one is added.
    #[instrument(skip_all, fields(policy = %policy_id(new)))]
    pub fn update_policy(
        &mut self,
        old: &k8s::NetworkPolicy,
        new: &k8s::NetworkPolicy,
    ) -> Result<(), CacheError> {
        let old_id = policy_id(old);
        let id = policy_id(new);
        if old_id != id {
            debug!(%old_id, "Policy renamed");
            self.delete_policy(&old_id)?;
            return self.add_policy(new);
        }

        if !self.policies.contains_key(&id) {
            return Err(CacheError::NotFound {
                kind: "networkpolicy",
                id: id.to_string(),
            });
        }
        self.touch_policy(&id);
        self.policies.insert(
            id,
            PolicyEntry {
                policy: new.clone(),
            },
        );
        debug!("Updated policy");
        Ok(())
    }

    /// Removes a policy, releasing the sets its rules referenced.
    #[instrument(skip_all, fields(policy = %id))]
    pub fn delete_policy(&mut self, id: &ResourceId) -> Result<(), CacheError> {
        if !self.policies.contains_key(id) {
            return Err(CacheError::NotFound {
                kind: "networkpolicy",
                id: id.to_string(),
            });
        }
        self.touch_policy(id);
        self.policies.remove(id);
        let installed = self.uninstall(id).is_some();
        debug!(installed, "Deleted policy");
        Ok(())
    }

    /// Records that `compiled` replaces whatever was installed for its policy: the sets it
    /// references are pinned and the members of the sets it owns are contributed.
    ///
    /// Returns false if the installed rules were already identical, in which case only the
    /// recorded spec is updated.
    pub fn install_policy(&mut self, compiled: Compiled, spec: k8s::NetworkPolicySpec) -> bool {
        let id = compiled.id.clone();
        self.touch_policy(&id);
        if let Some(processed) = self.processed.get_mut(&id) {
            if processed.compiled == compiled {
                debug!(policy = %id, "Compiled rules are unchanged");
                processed.spec = spec;
                return false;
            }
        }

        self.uninstall(&id);
        for set in &compiled.sets {
            self.sets.pin(set);
        }
        for (set, members) in &compiled.owned {
            for member in members {
                self.sets.add(set, member);
            }
        }
        debug!(
            policy = %id,
            sets = compiled.sets.len(),
            rules = compiled.rules.len(),
            "Installed policy"
        );
        self.processed.insert(id, ProcessedPolicy { compiled, spec });
        true
    }

    /// Returns the policies whose installed rules do not reflect their current spec, optionally
    /// limited to a namespace. The result is sorted.
    pub fn pending_policies(&self, namespace: Option<&str>) -> Vec<ResourceId> {
        let mut pending = self
            .policies
            .iter()
            .filter(|(id, _)| namespace.map_or(true, |ns| id.namespace == ns))
            .filter(|(id, entry)| !self.is_current(id, entry))
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();
        pending.sort();
        pending
    }

    fn is_current(&self, id: &ResourceId, entry: &PolicyEntry) -> bool {
        self.processed
            .get(id)
            .is_some_and(|p| p.spec == entry.spec())
    }

    fn uninstall(&mut self, id: &ResourceId) -> Option<Compiled> {
        let ProcessedPolicy { compiled, .. } = self.processed.remove(id)?;
        for set in &compiled.sets {
            self.sets.unpin(set);
        }
        for (set, members) in &compiled.owned {
            for member in members {
                self.sets.remove(set, member);
            }
        }
        Some(compiled)
    }
}
