use crate::{pod::pod_id, policy::policy_id, reconcile, Reconciler};
use netpol_controller_core::ResourceId;
use netpol_controller_k8s_api::{self as k8s, ResourceExt};
use parking_lot::Mutex;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::time;
use tracing::{debug, info, warn};

/// Delivers watch events to a [`Reconciler`].
///
/// Events that fail are held, by resource identity, until they are redelivered by
/// [`Dispatch::retry`]. Only the most recent event for an identity is held: a newer watch event
/// supersedes it.
#[derive(Clone, Debug)]
pub struct Dispatch {
    reconciler: Arc<Reconciler>,
    pending: Arc<Mutex<Pending>>,
}

/// Failed events. `None` records a failed deletion.
#[derive(Debug, Default)]
struct Pending {
    namespaces: BTreeMap<String, Option<k8s::Namespace>>,
    pods: BTreeMap<ResourceId, Option<k8s::Pod>>,
    policies: BTreeMap<ResourceId, Option<k8s::NetworkPolicy>>,
}

// === impl Dispatch ===

impl Dispatch {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self {
            reconciler,
            pending: Default::default(),
        }
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// Returns the number of events awaiting redelivery.
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Redelivers all pending events, returning the number that still fail.
    pub fn retry(&self) -> usize {
        // The lock is held throughout so that a watch event cannot be overwritten by an older
        // pending one.
        let mut pending = self.pending.lock();
        let Pending {
            namespaces,
            pods,
            policies,
        } = std::mem::take(&mut *pending);

        for (name, ns) in namespaces {
            let res = match &ns {
                Some(ns) => self.reconciler.apply_namespace(ns),
                None => self.reconciler.delete_namespace(&name),
            };
            if let Some(ns) = failed(res, ns) {
                pending.namespaces.insert(name, ns);
            }
        }
        for (id, pod) in pods {
            let res = match &pod {
                Some(pod) => self.reconciler.apply_pod(pod),
                None => self.reconciler.delete_pod(&id),
            };
            if let Some(pod) = failed(res, pod) {
                pending.pods.insert(id, pod);
            }
        }
        for (id, policy) in policies {
            let res = match &policy {
                Some(policy) => self.reconciler.apply_policy(policy),
                None => self.reconciler.delete_policy(&id),
            };
            if let Some(policy) = failed(res, policy) {
                pending.policies.insert(id, policy);
            }
        }

        let remaining = pending.len();
        if remaining > 0 {
            debug!(remaining, "Events still pending");
        }
        remaining
    }

    /// Redelivers pending events on a fixed interval.
    pub async fn retry_pending(self, interval: Duration) {
        let mut timer = time::interval(interval);
        timer.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            timer.tick().await;
            if self.pending() > 0 {
                self.retry();
            }
        }
    }
}

impl kubert::index::IndexClusterResource<k8s::Namespace> for Dispatch {
    fn apply(&mut self, ns: k8s::Namespace) {
        let name = ns.name_unchecked();
        let mut pending = self.pending.lock();
        pending.namespaces.remove(&name);
        let res = self.reconciler.apply_namespace(&ns);
        if let Some(ns) = failed(res, Some(ns)) {
            pending.namespaces.insert(name, ns);
        }
    }

    fn delete(&mut self, name: String) {
        let mut pending = self.pending.lock();
        pending.namespaces.remove(&name);
        let res = self.reconciler.delete_namespace(&name);
        if let Some(ns) = failed(res, None) {
            pending.namespaces.insert(name, ns);
        }
    }
}

impl kubert::index::IndexNamespacedResource<k8s::Pod> for Dispatch {
    fn apply(&mut self, pod: k8s::Pod) {
        let id = pod_id(&pod);
        let mut pending = self.pending.lock();
        pending.pods.remove(&id);
        let res = self.reconciler.apply_pod(&pod);
        if let Some(pod) = failed(res, Some(pod)) {
            pending.pods.insert(id, pod);
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        let id = ResourceId::new(namespace, name);
        let mut pending = self.pending.lock();
        pending.pods.remove(&id);
        let res = self.reconciler.delete_pod(&id);
        if let Some(pod) = failed(res, None) {
            pending.pods.insert(id, pod);
        }
    }
}

impl kubert::index::IndexNamespacedResource<k8s::NetworkPolicy> for Dispatch {
    fn apply(&mut self, policy: k8s::NetworkPolicy) {
        let id = policy_id(&policy);
        let mut pending = self.pending.lock();
        pending.policies.remove(&id);
        let res = self.reconciler.apply_policy(&policy);
        if let Some(policy) = failed(res, Some(policy)) {
            pending.policies.insert(id, policy);
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        let id = ResourceId::new(namespace, name);
        let mut pending = self.pending.lock();
        pending.policies.remove(&id);
        let res = self.reconciler.delete_policy(&id);
        if let Some(policy) = failed(res, None) {
            pending.policies.insert(id, policy);
        }
    }
}

/// Returns the event if it should be redelivered.
fn failed<T>(res: Result<(), reconcile::Error>, event: Option<T>) -> Option<Option<T>> {
    match res {
        Ok(()) => None,
        Err(error) if error.is_retryable() => {
            warn!(%error, "Event failed; will retry");
            Some(event)
        }
        Err(error) => {
            info!(%error, "Event failed; waiting for an update");
            None
        }
    }
}

// === impl Pending ===

impl Pending {
    fn len(&self) -> usize {
        self.namespaces.len() + self.pods.len() + self.policies.len()
    }
}
