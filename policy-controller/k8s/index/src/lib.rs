//! Network Policy Index
//!
//! Mirrors the cluster's namespaces, pods, and network policies and reconciles them into kernel
//! membership sets and filter rules on the local node:
//!
//! - Each `Namespace` nests its pod set in the set of all namespaces and in a set per label.
//! - Each `Pod` adds its address to its namespace's set and to a set per label, and adds an
//!   `ip,proto:port` entry per named container port.
//! - Each `NetworkPolicy` compiles into filter rules that match those sets. Rules never enumerate
//!   pods, so pod churn only changes set memberships.
//!
//! ```text
//! [ Namespace ] -> [ all-namespaces / nslabel-* ] -> [ ns-* ] <- [ Pod ] -> [ podlabel-* ]
//!                                 ^                      ^                       ^
//!                                 +----------------- [ NetworkPolicy rules ] ----+
//! ```
//!
//! The [`Reconciler`] serializes every event behind a single lock and applies it to the kernel
//! atomically, rolling back on failure. [`Dispatch`] adapts watch streams to the reconciler and
//! redelivers failed events.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod cache;
mod compile;
mod dispatch;
mod namespace;
mod pod;
mod policy;
mod reconcile;
mod sets;

#[cfg(test)]
mod tests;

pub use self::{
    cache::{CacheError, EntityCache, Membership},
    compile::{compile, CompileError, Compiled},
    dispatch::Dispatch,
    namespace::NamespaceEntry,
    pod::PodEntry,
    policy::{PolicyEntry, ProcessedPolicy},
    reconcile::{Error, Reconciler, IPSET_SNAPSHOT, IPTABLES_SNAPSHOT},
    sets::{SetIndex, SetPlan},
};
