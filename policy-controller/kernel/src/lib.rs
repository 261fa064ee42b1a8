#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Kernel-facing stores for membership sets and filter rules.
//!
//! Both stores drive their primitive exclusively through native dump/restore text, which is also
//! the format of snapshots and of the files persisted across restarts.

mod error;
mod exec;
pub mod ipset;
pub mod iptables;

#[cfg(any(test, feature = "test-util"))]
pub mod fake;

pub use self::{
    error::{Error, KernelError},
    exec::{Ipset, Iptables, Kernel},
    ipset::{SetReferences, SetSnapshot, SetState, SetStore},
    iptables::{FilterSnapshot, FilterState, FilterStore},
};
