//! Filter rules and the chain layout they are installed into.
//!
//! ```text
//! FORWARD -> NETPOL -> NETPOL-INGRESS-ALLOW   (policy allows set the ingress mark)
//!                   -> NETPOL-INGRESS-DROP    (unless marked: drop to selected pods)
//!                   -> NETPOL-EGRESS-ALLOW    (policy allows set the egress mark)
//!                   -> NETPOL-EGRESS-DROP     (unless marked: drop from selected pods)
//! ```
//!
//! Allow rules from different policies union; a pod that no policy selects never matches a drop
//! rule, so its traffic falls through to the host's default.

use crate::{ipset::SetName, Protocol, ResourceId};
use ipnet::IpNet;
use std::fmt;

pub const FORWARD: &str = "FORWARD";
pub const NETPOL: &str = "NETPOL";
pub const INGRESS_ALLOW: &str = "NETPOL-INGRESS-ALLOW";
pub const INGRESS_DROP: &str = "NETPOL-INGRESS-DROP";
pub const EGRESS_ALLOW: &str = "NETPOL-EGRESS-ALLOW";
pub const EGRESS_DROP: &str = "NETPOL-EGRESS-DROP";

/// All chains managed by the controller share this prefix.
pub const CHAIN_PREFIX: &str = "NETPOL";

/// Every managed rule carries a comment with this prefix followed by its tag.
pub const COMMENT_PREFIX: &str = "netpol:";

pub const INGRESS_MARK: u32 = 0x2000;
pub const EGRESS_MARK: u32 = 0x1000;

/// Identifies the origin of a rule so that all rules from one origin can be replaced together.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tag {
    Base,
    Policy(ResourceId),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Addr {
    Src,
    Dst,
}

/// The packet fields a set match is evaluated against.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SetFlags {
    Src,
    Dst,
    /// Destination address and destination port, for `hash:ip,port` sets.
    DstDst,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Match {
    Set {
        set: SetName,
        flags: SetFlags,
        negate: bool,
    },
    Net {
        net: IpNet,
        addr: Addr,
    },
    Protocol(Protocol),
    Port {
        protocol: Protocol,
        start: u16,
        end: Option<u16>,
    },
    Established,
    Mark {
        mark: u32,
        negate: bool,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Target {
    Accept,
    Drop,
    Jump(String),
    SetMark(u32),
    ClearMarks(u32),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Rule {
    pub chain: String,
    pub matches: Vec<Match>,
    pub target: Target,
    pub tag: Tag,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Position {
    Append,
    /// A 1-based index into the chain.
    Index(usize),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FilterOp {
    EnsureChain(String),
    Insert { position: Position, rule: Rule },
    RemoveByTag(Tag),
}

/// Chains that are created at startup, in dependency order.
pub fn chains() -> [&'static str; 5] {
    [NETPOL, INGRESS_ALLOW, INGRESS_DROP, EGRESS_ALLOW, EGRESS_DROP]
}

/// Rules that wire the managed chains together.
pub fn base_rules() -> Vec<Rule> {
    let base = |chain: &str, matches: Vec<Match>, target: Target| Rule {
        chain: chain.to_string(),
        matches,
        target,
        tag: Tag::Base,
    };
    vec![
        base(FORWARD, vec![], Target::Jump(NETPOL.to_string())),
        base(NETPOL, vec![Match::Established], Target::Accept),
        base(NETPOL, vec![], Target::Jump(INGRESS_ALLOW.to_string())),
        base(
            NETPOL,
            vec![Match::Mark {
                mark: INGRESS_MARK,
                negate: true,
            }],
            Target::Jump(INGRESS_DROP.to_string()),
        ),
        base(NETPOL, vec![], Target::Jump(EGRESS_ALLOW.to_string())),
        base(
            NETPOL,
            vec![Match::Mark {
                mark: EGRESS_MARK,
                negate: true,
            }],
            Target::Jump(EGRESS_DROP.to_string()),
        ),
        base(NETPOL, vec![], Target::ClearMarks(INGRESS_MARK | EGRESS_MARK)),
    ]
}

/// Quotes a token for iptables-restore if it contains characters the parser would split on.
pub fn quote(token: &str) -> String {
    if !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_.:/,!".contains(c))
    {
        return token.to_string();
    }
    format!("\"{}\"", token.replace('\\', "\\\\").replace('"', "\\\""))
}

// === impl Tag ===

impl Tag {
    pub fn comment(&self) -> String {
        format!("{COMMENT_PREFIX}{self}")
    }

    /// Recovers a tag from a rule comment, if the comment was written by the controller.
    pub fn from_comment(comment: &str) -> Option<Self> {
        let tag = comment.strip_prefix(COMMENT_PREFIX)?;
        if tag == "base" {
            return Some(Self::Base);
        }
        tag.parse().ok().map(Self::Policy)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Base => "base".fmt(f),
            Self::Policy(id) => id.fmt(f),
        }
    }
}

// === impl Rule ===

impl Rule {
    /// Renders the rule's match and target arguments, i.e. everything after `-A <chain>`.
    pub fn render(&self) -> String {
        let mut args = Vec::new();
        for m in &self.matches {
            m.render(&mut args);
        }
        args.push("-m".to_string());
        args.push("comment".to_string());
        args.push("--comment".to_string());
        args.push(quote(&self.tag.comment()));
        self.target.render(&mut args);
        args.join(" ")
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-A {} {}", self.chain, self.render())
    }
}

// === impl Match ===

impl Match {
    fn render(&self, args: &mut Vec<String>) {
        match self {
            Self::Set { set, flags, negate } => {
                args.extend(["-m".to_string(), "set".to_string()]);
                if *negate {
                    args.push("!".to_string());
                }
                args.extend([
                    "--match-set".to_string(),
                    set.kernel_name(),
                    flags.as_str().to_string(),
                ]);
            }
            Self::Net { net, addr } => {
                let flag = match addr {
                    Addr::Src => "-s",
                    Addr::Dst => "-d",
                };
                args.extend([flag.to_string(), net.trunc().to_string()]);
            }
            Self::Protocol(p) => args.extend(["-p".to_string(), p.to_string()]),
            Self::Port {
                protocol,
                start,
                end,
            } => {
                let ports = match end {
                    Some(end) if end != start => format!("{start}:{end}"),
                    _ => start.to_string(),
                };
                args.extend([
                    "-m".to_string(),
                    protocol.to_string(),
                    "--dport".to_string(),
                    ports,
                ]);
            }
            Self::Established => args.extend([
                "-m".to_string(),
                "conntrack".to_string(),
                "--ctstate".to_string(),
                "RELATED,ESTABLISHED".to_string(),
            ]),
            Self::Mark { mark, negate } => {
                args.extend(["-m".to_string(), "mark".to_string()]);
                if *negate {
                    args.push("!".to_string());
                }
                args.extend(["--mark".to_string(), format!("{mark:#x}/{mark:#x}")]);
            }
        }
    }
}

impl SetFlags {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Src => "src",
            Self::Dst => "dst",
            Self::DstDst => "dst,dst",
        }
    }
}

// === impl Target ===

impl Target {
    fn render(&self, args: &mut Vec<String>) {
        args.push("-j".to_string());
        match self {
            Self::Accept => args.push("ACCEPT".to_string()),
            Self::Drop => args.push("DROP".to_string()),
            Self::Jump(chain) => args.push(chain.clone()),
            Self::SetMark(mark) => args.extend([
                "MARK".to_string(),
                "--set-xmark".to_string(),
                format!("{mark:#x}/{mark:#x}"),
            ]),
            Self::ClearMarks(mask) => args.extend([
                "MARK".to_string(),
                "--set-xmark".to_string(),
                format!("0x0/{mask:#x}"),
            ]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_policy_rule() {
        let set = SetName::pod_label("app", Some("web"));
        let rule = Rule {
            chain: INGRESS_ALLOW.to_string(),
            matches: vec![
                Match::Protocol(Protocol::Tcp),
                Match::Net {
                    net: "10.0.0.0/8".parse().unwrap(),
                    addr: Addr::Src,
                },
                Match::Set {
                    set: set.clone(),
                    flags: SetFlags::Dst,
                    negate: false,
                },
                Match::Port {
                    protocol: Protocol::Tcp,
                    start: 80,
                    end: Some(90),
                },
            ],
            target: Target::SetMark(INGRESS_MARK),
            tag: Tag::Policy(ResourceId::new("default", "web")),
        };
        assert_eq!(
            rule.to_string(),
            format!(
                "-A NETPOL-INGRESS-ALLOW -p tcp -s 10.0.0.0/8 -m set --match-set {} dst \
                 -m tcp --dport 80:90 -m comment --comment netpol:default/web \
                 -j MARK --set-xmark 0x2000/0x2000",
                set.kernel_name()
            )
        );
    }

    #[test]
    fn renders_base_rules() {
        let rendered = base_rules().iter().map(Rule::to_string).collect::<Vec<_>>();
        assert_eq!(
            rendered,
            vec![
                "-A FORWARD -m comment --comment netpol:base -j NETPOL",
                "-A NETPOL -m conntrack --ctstate RELATED,ESTABLISHED -m comment --comment netpol:base -j ACCEPT",
                "-A NETPOL -m comment --comment netpol:base -j NETPOL-INGRESS-ALLOW",
                "-A NETPOL -m mark ! --mark 0x2000/0x2000 -m comment --comment netpol:base -j NETPOL-INGRESS-DROP",
                "-A NETPOL -m comment --comment netpol:base -j NETPOL-EGRESS-ALLOW",
                "-A NETPOL -m mark ! --mark 0x1000/0x1000 -m comment --comment netpol:base -j NETPOL-EGRESS-DROP",
                "-A NETPOL -m comment --comment netpol:base -j MARK --set-xmark 0x0/0x3000",
            ]
        );
    }

    #[test]
    fn tags_round_trip_through_comments() {
        let tag = Tag::Policy(ResourceId::new("ns-0", "allow-web"));
        assert_eq!(Tag::from_comment(&tag.comment()), Some(tag));
        assert_eq!(Tag::from_comment("netpol:base"), Some(Tag::Base));
        assert_eq!(Tag::from_comment("kube-proxy rule"), None);
    }

    #[test]
    fn quotes_when_needed() {
        assert_eq!(quote("netpol:ns/name"), "netpol:ns/name");
        assert_eq!(quote("has space"), "\"has space\"");
    }
}
