//! Membership sets.
//!
//! Filter rules never enumerate pods. They match against named sets whose members are maintained
//! as pods and namespaces come and go. Each set has a deterministic logical name (derived from the
//! selector it encodes) and a kernel name that fits within the ipset name limit.

use crate::{Direction, Protocol, ResourceId};
use ipnet::IpNet;
use std::{fmt, net::IpAddr};
use xxhash_rust::xxh3::xxh3_64;

/// All kernel sets managed by the controller share this prefix.
pub const KERNEL_PREFIX: &str = "netpol-";

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SetName {
    /// Holds the set of every known namespace.
    AllNamespaces,

    /// Holds the addresses of all pods in a namespace.
    Namespace(String),

    /// Holds the namespace sets of all namespaces carrying a label key (or key=value).
    NamespaceLabel { key: String, value: Option<String> },

    /// Holds the addresses of all pods carrying a label key (or key=value).
    PodLabel { key: String, value: Option<String> },

    /// Holds `ip,proto:port` entries for every container port with the given name.
    NamedPort(String),

    /// Holds an ipBlock's CIDR along with its exceptions. Owned by a single policy.
    Cidr {
        policy: ResourceId,
        direction: Direction,
        rule: usize,
        peer: usize,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SetKind {
    /// `hash:net`
    HashNet,
    /// `hash:ip,port`
    HashIpPort,
    /// `list:set`
    List,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Member {
    Net {
        net: IpNet,
        /// Excludes the network from a broader entry in the same set.
        nomatch: bool,
    },
    IpPort {
        ip: IpAddr,
        protocol: Protocol,
        port: u16,
    },
    Set(SetName),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SetOp {
    Ensure { set: SetName, kind: SetKind },
    Add { set: SetName, member: Member },
    Remove { set: SetName, member: Member },
    Delete { set: SetName },
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown set type {0:?}")]
pub struct UnknownSetKind(pub String);

// === impl SetName ===

impl SetName {
    pub fn namespace(name: impl Into<String>) -> Self {
        Self::Namespace(name.into())
    }

    pub fn namespace_label(key: impl Into<String>, value: Option<&str>) -> Self {
        Self::NamespaceLabel {
            key: key.into(),
            value: value.map(Into::into),
        }
    }

    pub fn pod_label(key: impl Into<String>, value: Option<&str>) -> Self {
        Self::PodLabel {
            key: key.into(),
            value: value.map(Into::into),
        }
    }

    pub fn kind(&self) -> SetKind {
        match self {
            Self::AllNamespaces | Self::NamespaceLabel { .. } => SetKind::List,
            Self::NamedPort(_) => SetKind::HashIpPort,
            Self::Namespace(_) | Self::PodLabel { .. } | Self::Cidr { .. } => SetKind::HashNet,
        }
    }

    /// The name used for the set in the kernel.
    pub fn kernel_name(&self) -> String {
        format!(
            "{}{:016x}",
            KERNEL_PREFIX,
            xxh3_64(self.to_string().as_bytes())
        )
    }
}

impl fmt::Display for SetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllNamespaces => write!(f, "all-namespaces"),
            Self::Namespace(ns) => write!(f, "ns-{ns}"),
            Self::NamespaceLabel { key, value: None } => write!(f, "nslabel-{key}"),
            Self::NamespaceLabel {
                key,
                value: Some(v),
            } => write!(f, "nslabel-{key}:{v}"),
            Self::PodLabel { key, value: None } => write!(f, "podlabel-{key}"),
            Self::PodLabel {
                key,
                value: Some(v),
            } => write!(f, "podlabel-{key}:{v}"),
            Self::NamedPort(name) => write!(f, "namedport:{name}"),
            Self::Cidr {
                policy,
                direction,
                rule,
                peer,
            } => write!(f, "cidr-{policy}-{}-{rule}-{peer}", direction.as_str()),
        }
    }
}

// === impl SetKind ===

impl SetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HashNet => "hash:net",
            Self::HashIpPort => "hash:ip,port",
            Self::List => "list:set",
        }
    }

    /// Options passed when creating a set of this kind.
    pub fn create_options(&self) -> &'static str {
        match self {
            Self::HashNet | Self::HashIpPort => "family inet hashsize 1024 maxelem 65536",
            Self::List => "size 65536",
        }
    }
}

impl std::str::FromStr for SetKind {
    type Err = UnknownSetKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hash:net" => Ok(Self::HashNet),
            "hash:ip,port" => Ok(Self::HashIpPort),
            "list:set" => Ok(Self::List),
            s => Err(UnknownSetKind(s.to_string())),
        }
    }
}

impl fmt::Display for SetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

// === impl Member ===

impl Member {
    pub fn addr(ip: IpAddr) -> Self {
        Self::Net {
            net: IpNet::from(ip),
            nomatch: false,
        }
    }

    pub fn net(net: IpNet) -> Self {
        Self::Net {
            net,
            nomatch: false,
        }
    }

    pub fn nomatch(net: IpNet) -> Self {
        Self::Net { net, nomatch: true }
    }

    /// Renders the member as ipset expects it in `add`/`del` commands.
    ///
    /// Host networks are rendered as bare addresses, matching the kernel's own dump format.
    pub fn render(&self) -> String {
        match self {
            Self::Net { net, nomatch } => {
                let mut s = if net.prefix_len() == net.max_prefix_len() {
                    net.addr().to_string()
                } else {
                    net.trunc().to_string()
                };
                if *nomatch {
                    s.push_str(" nomatch");
                }
                s
            }
            Self::IpPort { ip, protocol, port } => format!("{ip},{protocol}:{port}"),
            Self::Set(set) => set.kernel_name(),
        }
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Set(set) => set.fmt(f),
            m => m.render().fmt(f),
        }
    }
}

// === impl SetOp ===

impl SetOp {
    pub fn set(&self) -> &SetName {
        match self {
            Self::Ensure { set, .. }
            | Self::Add { set, .. }
            | Self::Remove { set, .. }
            | Self::Delete { set } => set,
        }
    }
}

impl fmt::Display for SetOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ensure { set, kind } => write!(f, "ensure {set} ({kind})"),
            Self::Add { set, member } => write!(f, "add {member} to {set}"),
            Self::Remove { set, member } => write!(f, "remove {member} from {set}"),
            Self::Delete { set } => write!(f, "delete {set}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_names_are_stable_and_bounded() {
        let set = SetName::pod_label("app.kubernetes.io/name", Some("a-very-long-label-value"));
        let name = set.kernel_name();
        assert!(name.starts_with(KERNEL_PREFIX));
        assert!(name.len() <= 31, "{name} exceeds the ipset name limit");
        assert_eq!(name, set.clone().kernel_name());
        assert_ne!(name, SetName::pod_label("app.kubernetes.io/name", None).kernel_name());
    }

    #[test]
    fn logical_names() {
        assert_eq!(SetName::AllNamespaces.to_string(), "all-namespaces");
        assert_eq!(SetName::namespace("default").to_string(), "ns-default");
        assert_eq!(
            SetName::namespace_label("team", Some("a")).to_string(),
            "nslabel-team:a"
        );
        assert_eq!(SetName::pod_label("app", None).to_string(), "podlabel-app");
        assert_eq!(
            SetName::Cidr {
                policy: ResourceId::new("ns", "deny"),
                direction: Direction::Egress,
                rule: 0,
                peer: 2,
            }
            .to_string(),
            "cidr-ns/deny-out-0-2"
        );
    }

    #[test]
    fn members_render_in_kernel_syntax() {
        let ip = "10.0.0.1".parse::<IpAddr>().unwrap();
        assert_eq!(Member::addr(ip).render(), "10.0.0.1");
        assert_eq!(
            Member::nomatch("10.1.0.0/16".parse().unwrap()).render(),
            "10.1.0.0/16 nomatch"
        );
        assert_eq!(
            Member::IpPort {
                ip,
                protocol: Protocol::Tcp,
                port: 8080
            }
            .render(),
            "10.0.0.1,tcp:8080"
        );
        assert_eq!(
            Member::Set(SetName::namespace("a")).render(),
            SetName::namespace("a").kernel_name()
        );
    }
}
