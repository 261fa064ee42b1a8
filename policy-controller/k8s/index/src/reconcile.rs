//! Drives the kernel stores from cluster events.
//!
//! Every public entry point acquires the reconciliation lock for its full duration, updates the
//! entity cache, recompiles the policies the event requires, and then converges the kernel:
//!
//! 1. set creations and membership changes;
//! 2. filter rule replacement, per changed policy;
//! 3. destruction of sets no longer referenced.
//!
//! If any step fails, both stores are restored from snapshots taken before the first step and the
//! cache's derived state is rolled back, so the kernel never holds a partial event.

use crate::{
    cache::{CacheError, EntityCache},
    compile::{compile, CompileError},
    pod::pod_id,
    policy::policy_id,
};
use netpol_controller_core::{
    iptables::{self as rules, FilterOp, Position, Tag},
    ResourceId,
};
use netpol_controller_k8s_api::{self as k8s, ResourceExt};
use netpol_controller_kernel::{
    self as kernel, FilterSnapshot, FilterStore, SetSnapshot, SetStore,
};
use parking_lot::Mutex;
use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, error, info, instrument, warn};

/// The name of the set snapshot file in a snapshot directory.
pub const IPSET_SNAPSHOT: &str = "ipset.save";

/// The name of the filter snapshot file in a snapshot directory.
pub const IPTABLES_SNAPSHOT: &str = "iptables.save";

/// Reconciles cluster events into kernel sets and filter rules.
#[derive(Debug)]
pub struct Reconciler {
    state: Mutex<State>,

    /// Where the kernel state is written before each batch, if anywhere.
    snapshot_dir: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to compile policy {id}: {source}")]
    Compile {
        id: ResourceId,
        #[source]
        source: CompileError,
    },

    #[error(transparent)]
    Store(#[from] kernel::Error),

    #[error("failed to access {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug)]
struct State {
    cache: EntityCache,
    sets: SetStore,
    filters: FilterStore,

    /// Policies whose last installation was rejected by the kernel. They are only retried by
    /// events on the policy itself, so that they cannot fail unrelated events.
    failed: BTreeSet<ResourceId>,
}

/// The policies an event may require compiling.
#[derive(Copy, Clone, Debug)]
enum Affected<'a> {
    /// Pending policies in any namespace.
    All,
    /// Pending policies in a namespace.
    Namespace(&'a str),
    /// A single policy, whose compile errors are reported to the caller.
    Policy(&'a ResourceId),
}

// === impl Error ===

impl Error {
    /// Returns true if redelivering the event may succeed.
    ///
    /// Compilation depends only on the policy, so it is pointless to retry until the policy
    /// changes.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Compile { .. })
    }
}

// === impl Reconciler ===

impl Reconciler {
    /// Installs the base chains and rules and returns a reconciler with an empty cache.
    pub fn new(sets: SetStore, filters: FilterStore) -> Result<Self, Error> {
        let mut cache = EntityCache::new();
        let mut ops = rules::chains()
            .into_iter()
            .map(|c| FilterOp::EnsureChain(c.to_string()))
            .collect::<Vec<_>>();
        ops.push(FilterOp::RemoveByTag(Tag::Base));
        for rule in rules::base_rules() {
            let position = if rule.chain == rules::FORWARD {
                Position::Index(1)
            } else {
                Position::Append
            };
            ops.push(FilterOp::Insert { position, rule });
        }
        filters.apply_batch(&ops)?;

        let plan = cache.plan();
        sets.apply_batch(&plan.changes, &())?;
        cache.commit();
        info!("Installed base rules");

        Ok(Self {
            state: Mutex::new(State {
                cache,
                sets,
                filters,
                failed: BTreeSet::new(),
            }),
            snapshot_dir: None,
        })
    }

    /// Seeds the kernel from the snapshot files in `dir`, if there are any, and then installs
    /// the base rules.
    ///
    /// Seeded rules and sets stay in place until they are replaced by reconciliation or removed
    /// by [`Reconciler::prune`]. The returned reconciler rewrites the snapshot files in `dir`
    /// before applying each batch.
    pub fn load(sets: SetStore, filters: FilterStore, dir: &Path) -> Result<Self, Error> {
        if let Some(dump) = read_snapshot(&dir.join(IPSET_SNAPSHOT))? {
            let snapshot = SetSnapshot::parse(&dump)?;
            info!(sets = snapshot.state().len(), "Seeding sets");
            sets.refill(&snapshot)?;
        }
        if let Some(dump) = read_snapshot(&dir.join(IPTABLES_SNAPSHOT))? {
            info!("Seeding filter rules");
            filters.restore(&FilterSnapshot::parse(&dump)?)?;
        }
        let mut reconciler = Self::new(sets, filters)?;
        reconciler.snapshot_dir = Some(dir.to_path_buf());
        Ok(reconciler)
    }

    /// Writes the kernel's current sets and filter rules to snapshot files in `dir`.
    #[instrument(skip(self))]
    pub fn persist(&self, dir: &Path) -> Result<(), Error> {
        let state = self.state.lock();
        write_snapshots(dir, &state.sets, &state.filters)?;
        info!("Persisted kernel state");
        Ok(())
    }

    /// Removes filter rules of policies that are not installed and sets the cache does not know
    /// about, e.g. state left behind by a previous run.
    #[instrument(skip(self))]
    pub fn prune(&self) -> Result<(), Error> {
        let mut state = self.state.lock();
        let State {
            cache,
            sets,
            filters,
            ..
        } = &mut *state;

        let stale = filters
            .state()?
            .tags()
            .filter(|tag| match tag {
                Tag::Base => false,
                Tag::Policy(id) => cache.processed(id).is_none(),
            })
            .cloned()
            .collect::<BTreeSet<_>>();
        if !stale.is_empty() {
            info!(policies = stale.len(), "Removing stale rules");
            let ops = stale
                .into_iter()
                .map(FilterOp::RemoveByTag)
                .collect::<Vec<_>>();
            filters.apply_batch(&ops)?;
        }

        sets.restore(&SetSnapshot::from(cache.sets().to_kernel_state()))?;
        cache.sets.assume_installed();
        debug!("Pruned sets");
        Ok(())
    }

    /// Calls `f` with the entity cache, while holding the reconciliation lock.
    pub fn with_cache<T>(&self, f: impl FnOnce(&EntityCache) -> T) -> T {
        f(&self.state.lock().cache)
    }

    #[instrument(skip_all, fields(namespace = %ns.name_unchecked()))]
    pub fn add_namespace(&self, ns: &k8s::Namespace) -> Result<(), Error> {
        self.reconcile(Affected::All, |cache| match cache.add_namespace(ns) {
            Err(error @ CacheError::AlreadyExists { .. }) => {
                info!(%error, "Resyncing namespace");
                cache.update_namespace(ns, ns)
            }
            res => res,
        })
    }

    #[instrument(skip_all, fields(namespace = %new.name_unchecked()))]
    pub fn update_namespace(
        &self,
        old: &k8s::Namespace,
        new: &k8s::Namespace,
    ) -> Result<(), Error> {
        let name = new.name_unchecked();
        self.reconcile(Affected::All, |cache| {
            match cache.update_namespace(old, new) {
                Err(error @ CacheError::NotFound { .. }) if cache.namespace(&name).is_none() => {
                    info!(%error, "Adding unknown namespace");
                    cache.add_namespace(new)
                }
                res => res,
            }
        })
    }

    /// Adds or updates a namespace.
    pub fn apply_namespace(&self, ns: &k8s::Namespace) -> Result<(), Error> {
        self.update_namespace(ns, ns)
    }

    #[instrument(skip(self))]
    pub fn delete_namespace(&self, name: &str) -> Result<(), Error> {
        self.reconcile(Affected::All, |cache| cache.delete_namespace(name))
    }

    #[instrument(skip_all, fields(pod = %pod_id(pod)))]
    pub fn add_pod(&self, pod: &k8s::Pod) -> Result<(), Error> {
        let id = pod_id(pod);
        self.reconcile(Affected::Namespace(&id.namespace), |cache| {
            match cache.add_pod(pod) {
                Err(error @ CacheError::AlreadyExists { .. }) => {
                    info!(%error, "Resyncing pod");
                    cache.update_pod(pod, pod)
                }
                res => res,
            }
        })
    }

    #[instrument(skip_all, fields(pod = %pod_id(new)))]
    pub fn update_pod(&self, old: &k8s::Pod, new: &k8s::Pod) -> Result<(), Error> {
        let id = pod_id(new);
        self.reconcile(Affected::Namespace(&id.namespace), |cache| {
            match cache.update_pod(old, new) {
                Err(error @ CacheError::NotFound { .. }) if cache.pod(&id).is_none() => {
                    info!(%error, "Adding unknown pod");
                    cache.add_pod(new)
                }
                res => res,
            }
        })
    }

    /// Adds or updates a pod.
    pub fn apply_pod(&self, pod: &k8s::Pod) -> Result<(), Error> {
        self.update_pod(pod, pod)
    }

    #[instrument(skip_all, fields(pod = %id))]
    pub fn delete_pod(&self, id: &ResourceId) -> Result<(), Error> {
        self.reconcile(Affected::Namespace(&id.namespace), |cache| cache.delete_pod(id))
    }

    /// Records a policy and installs its rules.
    ///
    /// If the policy cannot be compiled, it is still recorded but whatever was installed for it
    /// before stays in place, and the compile error is returned.
    #[instrument(skip_all, fields(policy = %policy_id(policy)))]
    pub fn add_policy(&self, policy: &k8s::NetworkPolicy) -> Result<(), Error> {
        let id = policy_id(policy);
        self.reconcile(Affected::Policy(&id), |cache| match cache.add_policy(policy) {
            Err(error @ CacheError::AlreadyExists { .. }) => {
                info!(%error, "Resyncing policy");
                cache.update_policy(policy, policy)
            }
            res => res,
        })
    }

    #[instrument(skip_all, fields(policy = %policy_id(new)))]
    pub fn update_policy(
        &self,
        old: &k8s::NetworkPolicy,
        new: &k8s::NetworkPolicy,
    ) -> Result<(), Error> {
        let id = policy_id(new);
        self.reconcile(Affected::Policy(&id), |cache| {
            match cache.update_policy(old, new) {
                Err(error @ CacheError::NotFound { .. }) if cache.policy(&id).is_none() => {
                    info!(%error, "Adding unknown policy");
                    cache.add_policy(new)
                }
                res => res,
            }
        })
    }

    /// Adds or updates a policy.
    pub fn apply_policy(&self, policy: &k8s::NetworkPolicy) -> Result<(), Error> {
        self.update_policy(policy, policy)
    }

    #[instrument(skip_all, fields(policy = %id))]
    pub fn delete_policy(&self, id: &ResourceId) -> Result<(), Error> {
        self.reconcile(Affected::Policy(id), |cache| cache.delete_policy(id))
    }

    fn reconcile(
        &self,
        affected: Affected<'_>,
        update: impl FnOnce(&mut EntityCache) -> Result<(), CacheError>,
    ) -> Result<(), Error> {
        let mut state = self.state.lock();
        let State {
            cache,
            sets,
            filters,
            failed,
        } = &mut *state;

        if let Err(error) = update(cache) {
            info!(%error, "Ignoring stale event");
        }

        let mut compile_error = None;
        let ids = match affected {
            Affected::All => cache.pending_policies(None),
            Affected::Namespace(ns) => cache.pending_policies(Some(ns)),
            Affected::Policy(id) => {
                failed.remove(id);
                vec![id.clone()]
            }
        };
        for id in ids {
            if failed.contains(&id) {
                debug!(policy = %id, "Skipping policy the kernel rejected");
                continue;
            }
            match recompile(cache, &id) {
                Ok(()) => {}
                Err(error) if matches!(affected, Affected::Policy(_)) => {
                    warn!(%error, "Policy not installed");
                    compile_error = Some(error);
                }
                Err(error) => debug!(%error, "Pending policy still fails to compile"),
            }
        }

        if let Err(error) = converge(cache, sets, filters, self.snapshot_dir.as_deref()) {
            error!(%error, "Failed to reconcile; rolled back");
            cache.rollback();
            if let Affected::Policy(id) = affected {
                if cache.policy(id).is_some() {
                    failed.insert(id.clone());
                }
            }
            return Err(error);
        }
        cache.commit();
        compile_error.map_or(Ok(()), Err)
    }
}

/// Compiles and installs a policy into the cache if its installed rules are missing or stale.
fn recompile(cache: &mut EntityCache, id: &ResourceId) -> Result<(), Error> {
    let Some(entry) = cache.policy(id) else {
        return Ok(());
    };
    let spec = entry.spec();
    if cache.processed(id).is_some_and(|p| *p.spec() == spec) {
        return Ok(());
    }
    let compiled = compile(entry.policy()).map_err(|source| Error::Compile {
        id: id.clone(),
        source,
    })?;
    cache.install_policy(compiled, spec);
    Ok(())
}

/// Applies all uncommitted cache changes to the kernel, restoring both stores on failure.
fn converge(
    cache: &mut EntityCache,
    sets: &SetStore,
    filters: &FilterStore,
    snapshot_dir: Option<&Path>,
) -> Result<(), Error> {
    let plan = cache.plan();
    let changed = cache.changed_policies();
    if plan.changes.is_empty() && plan.deletes.is_empty() && changed.is_empty() {
        debug!("Nothing to apply");
        return Ok(());
    }

    let mut ops = Vec::new();
    for id in &changed {
        ops.push(FilterOp::RemoveByTag(Tag::Policy(id.clone())));
        let rules = cache.processed(id).into_iter().flat_map(|p| &p.compiled().rules);
        for rule in rules {
            ops.push(FilterOp::Insert {
                position: Position::Append,
                rule: rule.clone(),
            });
        }
    }
    debug!(
        sets = plan.changes.len(),
        rules = ops.len(),
        deletes = plan.deletes.len(),
        "Applying"
    );

    let set_snapshot = sets.snapshot()?;
    let filter_snapshot = filters.snapshot()?;
    if let Some(dir) = snapshot_dir {
        if let Err(error) = write_snapshots(dir, sets, filters) {
            warn!(%error, "Failed to write snapshot");
        }
    }
    let apply = || -> Result<(), kernel::Error> {
        sets.apply_batch(&plan.changes, &())?;
        filters.apply_batch(&ops)?;
        sets.apply_batch(&plan.deletes, &filters.state()?)
    };
    if let Err(error) = apply() {
        // Sets are refilled before rules are restored so that restored rules find their sets,
        // and destroyed only once no restored rule references them.
        let restored = sets
            .refill(&set_snapshot)
            .and_then(|()| filters.restore(&filter_snapshot))
            .and_then(|()| sets.restore(&set_snapshot));
        if let Err(error) = restored {
            error!(%error, "Failed to restore kernel state");
        }
        return Err(error.into());
    }
    Ok(())
}

fn read_snapshot(path: &Path) -> Result<Option<String>, Error> {
    match fs::read_to_string(path) {
        Ok(dump) => Ok(Some(dump)),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "No snapshot");
            Ok(None)
        }
        Err(source) => Err(Error::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn write_snapshots(dir: &Path, sets: &SetStore, filters: &FilterStore) -> Result<(), Error> {
    fs::create_dir_all(dir).map_err(|source| Error::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    write_snapshot(&dir.join(IPSET_SNAPSHOT), &sets.save()?)?;
    write_snapshot(&dir.join(IPTABLES_SNAPSHOT), &filters.save()?)
}

fn write_snapshot(path: &Path, dump: &str) -> Result<(), Error> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, dump)
        .and_then(|()| fs::rename(&tmp, path))
        .map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })
}
