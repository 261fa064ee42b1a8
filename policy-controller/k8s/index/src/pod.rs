use crate::cache::{CacheError, EntityCache, Membership};
use netpol_controller_core::{
    ipset::{Member, SetName},
    Protocol, ResourceId,
};
use netpol_controller_k8s_api::{self as k8s, Labels, ResourceExt};
use std::{collections::BTreeSet, net::IpAddr};
use tracing::{debug, instrument, warn};

/// Holds the state of an individual pod.
#[derive(Clone, Debug)]
pub struct PodEntry {
    pub(crate) attrs: PodAttrs,

    /// Memberships currently contributed to the set index.
    pub(crate) memberships: BTreeSet<Membership>,
}

/// The attributes of a pod that determine its memberships.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct PodAttrs {
    labels: Labels,
    ip: Option<IpAddr>,

    /// Host-network pods and pods that have terminated do not participate in policy.
    active: bool,

    /// Named container ports.
    ports: BTreeSet<NamedPort>,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct NamedPort {
    name: String,
    protocol: Protocol,
    port: u16,
}

// === impl PodEntry ===

impl PodEntry {
    pub fn labels(&self) -> &Labels {
        &self.attrs.labels
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.attrs.ip
    }

    pub fn memberships(&self) -> &BTreeSet<Membership> {
        &self.memberships
    }
}

// === impl PodAttrs ===

impl PodAttrs {
    fn from_pod(pod: &k8s::Pod) -> Self {
        let status = pod.status.as_ref();
        let ip = status
            .and_then(|s| s.pod_ip.as_deref())
            .filter(|ip| !ip.is_empty())
            .and_then(|ip| match ip.parse::<IpAddr>() {
                Ok(ip) => Some(ip),
                Err(error) => {
                    warn!(%ip, %error, "Invalid pod IP");
                    None
                }
            });
        let terminated = matches!(
            status.and_then(|s| s.phase.as_deref()),
            Some("Succeeded" | "Failed")
        );
        let host_network = pod
            .spec
            .as_ref()
            .and_then(|s| s.host_network)
            .unwrap_or(false);

        let ports = pod
            .spec
            .iter()
            .flat_map(|s| s.containers.iter())
            .flat_map(|c| c.ports.iter().flatten())
            .filter_map(named_port)
            .collect();

        Self {
            labels: pod.metadata.labels.clone().into(),
            ip,
            active: !terminated && !host_network,
            ports,
        }
    }

    /// The memberships a pod contributes: its address joins its namespace's set and a set per
    /// label key and key/value pair, and each named port joins that name's port set.
    fn memberships(&self, namespace: &str) -> BTreeSet<Membership> {
        let mut memberships = BTreeSet::new();
        let ip = match self.ip {
            Some(ip @ IpAddr::V4(_)) if self.active => ip,
            _ => return memberships,
        };

        let addr = Member::addr(ip);
        memberships.insert((SetName::namespace(namespace), addr.clone()));
        for (key, value) in self.labels.iter() {
            memberships.extend(label_memberships(key, value, &addr));
        }
        for port in &self.ports {
            memberships.insert((
                SetName::NamedPort(port.name.clone()),
                Member::IpPort {
                    ip,
                    protocol: port.protocol,
                    port: port.port,
                },
            ));
        }
        memberships
    }
}

fn named_port(port: &k8s::ContainerPort) -> Option<NamedPort> {
    let name = port.name.clone().filter(|n| !n.is_empty())?;
    let protocol = match port.protocol.as_deref().unwrap_or("TCP").parse::<Protocol>() {
        Ok(p) => p,
        Err(error) => {
            warn!(%name, %error, "Ignoring named port");
            return None;
        }
    };
    let port = u16::try_from(port.container_port).ok().filter(|p| *p != 0)?;
    Some(NamedPort {
        name,
        protocol,
        port,
    })
}

fn label_memberships(key: &str, value: &str, addr: &Member) -> [Membership; 2] {
    [
        (SetName::pod_label(key, None), addr.clone()),
        (SetName::pod_label(key, Some(value)), addr.clone()),
    ]
}

pub(crate) fn pod_id(pod: &k8s::Pod) -> ResourceId {
    ResourceId::new(pod.namespace().unwrap_or_default(), pod.name_unchecked())
}

// === impl EntityCache ===

impl EntityCache {
    #[instrument(skip_all, fields(pod = %pod_id(pod)))]
    pub fn add_pod(&mut self, pod: &k8s::Pod) -> Result<(), CacheError> {
        let id = pod_id(pod);
        if self.pods.contains_key(&id) {
            return Err(CacheError::AlreadyExists {
                kind: "pod",
                id: id.to_string(),
            });
        }

        self.touch_pod(&id);
        let attrs = PodAttrs::from_pod(pod);
        if matches!(attrs.ip, Some(IpAddr::V6(_))) {
            warn!(ip = ?attrs.ip, "IPv6 pod addresses are not enforced");
        }
        let mut memberships = BTreeSet::new();
        Self::retract_and_add(
            &mut self.sets,
            &mut memberships,
            None,
            attrs.memberships(&id.namespace),
        );
        debug!(memberships = memberships.len(), "Added pod");
        self.pods.insert(id, PodEntry { attrs, memberships });
        Ok(())
    }

    /// Updates a pod's labels, address, or ports.
    ///
    /// `old` identifies the pod; its attributes are taken from the cache. If `new` has a
    /// different identity, the old pod is removed before the new one is added.
    #[instrument(skip_all, fields(pod = %pod_id(new)))]
    pub fn update_pod(&mut self, old: &k8s::Pod, new: &k8s::Pod) -> Result<(), CacheError> {
        let old_id = pod_id(old);
        let id = pod_id(new);
        if old_id != id {
            debug!(%old_id, "Pod renamed");
            self.delete_pod(&old_id)?;
            return self.add_pod(new);
        }

        let attrs = PodAttrs::from_pod(new);
        self.touch_pod(&id);
        let Self { pods, sets, .. } = self;
        let entry = pods.get_mut(&id).ok_or_else(|| CacheError::NotFound {
            kind: "pod",
            id: id.to_string(),
        })?;

        let expected = entry.attrs.memberships(&id.namespace);
        let labels_only = entry.attrs.ip == attrs.ip
            && entry.attrs.active == attrs.active
            && entry.attrs.ports == attrs.ports;
        if labels_only && entry.memberships == expected {
            if let (Some(ip @ IpAddr::V4(_)), true) = (attrs.ip, attrs.active) {
                let addr = Member::addr(ip);
                let delta = entry.attrs.labels.delta(&attrs.labels);
                let mut retract = Vec::new();
                let mut add = Vec::new();
                for (key, value) in &delta.removed {
                    retract.extend(label_memberships(key, value, &addr));
                }
                for (key, value) in &delta.added {
                    add.extend(label_memberships(key, value, &addr));
                }
                for (key, (old, new)) in &delta.changed {
                    retract.push((SetName::pod_label(key, Some(old)), addr.clone()));
                    add.push((SetName::pod_label(key, Some(new)), addr.clone()));
                }
                debug!(
                    added = delta.added.len(),
                    removed = delta.removed.len(),
                    changed = delta.changed.len(),
                    "Updating pod labels"
                );
                Self::retract_and_add(sets, &mut entry.memberships, retract, add);
            }
        } else {
            debug!(ip = ?attrs.ip, active = attrs.active, "Rebuilding pod memberships");
            for (set, member) in std::mem::take(&mut entry.memberships) {
                sets.remove(&set, &member);
            }
            Self::retract_and_add(
                sets,
                &mut entry.memberships,
                None,
                attrs.memberships(&id.namespace),
            );
        }
        entry.attrs = attrs;
        Ok(())
    }

    /// Removes a pod and retracts its address from every set it was added to.
    #[instrument(skip_all, fields(pod = %id))]
    pub fn delete_pod(&mut self, id: &ResourceId) -> Result<(), CacheError> {
        if !self.pods.contains_key(id) {
            return Err(CacheError::NotFound {
                kind: "pod",
                id: id.to_string(),
            });
        }
        self.touch_pod(id);
        if let Some(entry) = self.pods.remove(id) {
            for (set, member) in &entry.memberships {
                self.sets.remove(set, member);
            }
            debug!(memberships = entry.memberships.len(), "Deleted pod");
        }
        Ok(())
    }
}
