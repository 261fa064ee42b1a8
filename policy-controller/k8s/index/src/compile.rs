//! Translates a network policy into filter rules over membership sets.
//!
//! Rules never enumerate pods. Every selector is expressed as matches against label sets, which
//! the entity cache keeps up to date as pods and namespaces change, so a policy's rules only
//! change when the policy itself does.
//!
//! For each direction a policy applies to, it produces:
//!
//! - an allow rule per (target alternative, rule, peer alternative, port) that marks the packet
//!   as allowed in that direction;
//! - a drop rule per target alternative, which only drops packets that no policy marked.
//!
//! Selector requirements with several `In` values are expanded into alternatives, since a single
//! rule can only AND its matches.

use netpol_controller_core::{
    ipset::{Member, SetName},
    iptables::{
        Addr, Match, Rule, SetFlags, Tag, Target, EGRESS_ALLOW, EGRESS_DROP, EGRESS_MARK,
        INGRESS_ALLOW, INGRESS_DROP, INGRESS_MARK,
    },
    Direction, IpNet, Protocol, ResourceId,
};
use netpol_controller_k8s_api::{
    self as k8s,
    labels::{InvalidSelector, Operator, Selector},
    ResourceExt,
};
use std::collections::{BTreeMap, BTreeSet};

/// The translated form of a network policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Compiled {
    pub id: ResourceId,

    /// Every set the rules reference, including owned sets.
    pub sets: BTreeSet<SetName>,

    /// Sets whose members are defined by this policy (ipBlocks with exceptions).
    pub owned: BTreeMap<SetName, Vec<Member>>,

    /// Allow rules followed by drop rules.
    pub rules: Vec<Rule>,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    #[error("invalid selector: {0}")]
    InvalidSelector(#[from] InvalidSelector),

    #[error("unsupported policy: {0}")]
    Unsupported(String),
}

/// Bounds the expansion of multi-valued `In` requirements.
const MAX_ALTERNATIVES: usize = 64;

/// A conjunction of terms.
type Alternative = Vec<Term>;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Term {
    Set { set: SetName, negate: bool },
    Net(IpNet),
}

#[derive(Copy, Clone, Debug)]
enum Scope {
    Pods,
    Namespaces,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum PortMatch {
    Any,
    Protocol(Protocol),
    Range {
        protocol: Protocol,
        start: u16,
        end: Option<u16>,
    },
    Named {
        protocol: Protocol,
        name: String,
    },
}

/// The peers and ports of one ingress or egress rule.
struct RuleSpec<'p> {
    peers: Option<&'p [k8s::NetworkPolicyPeer]>,
    ports: Option<&'p [k8s::NetworkPolicyPort]>,
}

/// Compiles a policy. The output depends only on the policy, so compiling unchanged input
/// always produces identical rules.
pub fn compile(policy: &k8s::NetworkPolicy) -> Result<Compiled, CompileError> {
    let namespace = policy
        .namespace()
        .ok_or_else(|| CompileError::Unsupported("policy must be namespaced".to_string()))?;
    let id = ResourceId::new(namespace, policy.name_unchecked());
    let spec = policy.spec.clone().unwrap_or_default();

    let directions = directions(&spec)?;
    let namespace_set = SetName::namespace(&*id.namespace);
    let pod_selector: Option<k8s::LabelSelector> = spec.pod_selector.clone().into();
    let targets = alternatives(pod_selector.as_ref(), Scope::Pods)?
        .into_iter()
        .map(|mut alt| {
            alt.insert(0, Term::set(namespace_set.clone()));
            alt
        })
        .collect::<Vec<_>>();

    let tag = Tag::Policy(id.clone());
    let mut owned = BTreeMap::new();
    let mut allow = Vec::new();
    let mut deny = Vec::new();
    for direction in directions {
        let (allow_chain, drop_chain, mark, target_addr, peer_addr) = match direction {
            Direction::Ingress => (INGRESS_ALLOW, INGRESS_DROP, INGRESS_MARK, Addr::Dst, Addr::Src),
            Direction::Egress => (EGRESS_ALLOW, EGRESS_DROP, EGRESS_MARK, Addr::Src, Addr::Dst),
        };

        let rules = match direction {
            Direction::Ingress => spec
                .ingress
                .iter()
                .flatten()
                .map(|r| RuleSpec {
                    peers: r.from.as_deref(),
                    ports: r.ports.as_deref(),
                })
                .collect::<Vec<_>>(),
            Direction::Egress => spec
                .egress
                .iter()
                .flatten()
                .map(|r| RuleSpec {
                    peers: r.to.as_deref(),
                    ports: r.ports.as_deref(),
                })
                .collect(),
        };

        // Resolve each rule's peers and ports once; they are shared by all targets.
        let mut resolved = Vec::with_capacity(rules.len());
        for (ri, rule) in rules.iter().enumerate() {
            let peers = match rule.peers {
                Some(peers) if !peers.is_empty() => {
                    let mut alts = Vec::new();
                    for (pi, peer) in peers.iter().enumerate() {
                        alts.extend(peer_alternatives(
                            &id,
                            &namespace_set,
                            peer,
                            direction,
                            ri,
                            pi,
                            &mut owned,
                        )?);
                    }
                    alts
                }
                // An empty or missing peer list matches all peers.
                _ => vec![Vec::new()],
            };
            let ports = match rule.ports {
                Some(ports) if !ports.is_empty() => {
                    ports.iter().map(port_match).collect::<Result<Vec<_>, _>>()?
                }
                _ => vec![PortMatch::Any],
            };
            resolved.push((peers, ports));
        }

        for target in &targets {
            let target_matches = render(target, target_addr);
            for (peers, ports) in &resolved {
                for peer in peers {
                    for port in ports {
                        let mut matches = target_matches.clone();
                        matches.extend(render(peer, peer_addr));
                        matches.extend(port.matches());
                        allow.push(Rule {
                            chain: allow_chain.to_string(),
                            matches,
                            target: Target::SetMark(mark),
                            tag: tag.clone(),
                        });
                    }
                }
            }
            deny.push(Rule {
                chain: drop_chain.to_string(),
                matches: target_matches,
                target: Target::Drop,
                tag: tag.clone(),
            });
        }
    }

    let mut rules = allow;
    rules.extend(deny);
    let sets = rules
        .iter()
        .flat_map(|r| r.matches.iter())
        .filter_map(|m| match m {
            Match::Set { set, .. } => Some(set.clone()),
            _ => None,
        })
        .chain(owned.keys().cloned())
        .collect();

    Ok(Compiled {
        id,
        sets,
        owned,
        rules,
    })
}

/// Ingress always applies unless policy types say otherwise; egress applies when the policy has
/// egress rules.
fn directions(spec: &k8s::NetworkPolicySpec) -> Result<BTreeSet<Direction>, CompileError> {
    match spec.policy_types.as_deref() {
        Some(types) if !types.is_empty() => types
            .iter()
            .map(|t| match t.as_str() {
                "Ingress" => Ok(Direction::Ingress),
                "Egress" => Ok(Direction::Egress),
                t => Err(CompileError::Unsupported(format!("unknown policy type {t:?}"))),
            })
            .collect(),
        _ => {
            let mut directions = BTreeSet::from([Direction::Ingress]);
            if spec.egress.as_ref().is_some_and(|e| !e.is_empty()) {
                directions.insert(Direction::Egress);
            }
            Ok(directions)
        }
    }
}

/// Expands a label selector into alternatives of label-set terms. A missing or empty selector
/// yields a single empty alternative, which matches everything.
fn alternatives(
    selector: Option<&k8s::LabelSelector>,
    scope: Scope,
) -> Result<Vec<Alternative>, CompileError> {
    let selector = match selector {
        Some(s) => Selector::try_from(s)?,
        None => Selector::default(),
    };
    let label = |key: &str, value: Option<&str>| match scope {
        Scope::Pods => SetName::pod_label(key, value),
        Scope::Namespaces => SetName::namespace_label(key, value),
    };

    let mut alts = vec![Alternative::new()];
    let push_all = |alts: &mut Vec<Alternative>, term: Term| {
        for alt in alts.iter_mut() {
            alt.push(term.clone());
        }
    };
    for (key, value) in selector.match_labels() {
        push_all(&mut alts, Term::set(label(key, Some(value))));
    }
    for expr in selector.expressions() {
        let key = expr.key();
        match expr.operator() {
            Operator::In => {
                let mut expanded = Vec::new();
                for alt in &alts {
                    for value in expr.values() {
                        let mut alt = alt.clone();
                        alt.push(Term::set(label(key, Some(value))));
                        expanded.push(alt);
                    }
                }
                if expanded.len() > MAX_ALTERNATIVES {
                    return Err(CompileError::Unsupported(format!(
                        "selector expands to more than {MAX_ALTERNATIVES} alternatives"
                    )));
                }
                alts = expanded;
            }
            Operator::NotIn => {
                for value in expr.values() {
                    push_all(&mut alts, Term::not(label(key, Some(value))));
                }
            }
            Operator::Exists => push_all(&mut alts, Term::set(label(key, None))),
            Operator::DoesNotExist => push_all(&mut alts, Term::not(label(key, None))),
        }
    }
    Ok(alts)
}

fn peer_alternatives(
    id: &ResourceId,
    namespace_set: &SetName,
    peer: &k8s::NetworkPolicyPeer,
    direction: Direction,
    rule: usize,
    index: usize,
    owned: &mut BTreeMap<SetName, Vec<Member>>,
) -> Result<Vec<Alternative>, CompileError> {
    let namespaces = |selector: &k8s::LabelSelector| {
        alternatives(Some(selector), Scope::Namespaces).map(|alts| {
            alts.into_iter()
                .map(|mut alt| {
                    // Negations alone would match addresses outside of any namespace.
                    if !alt.iter().any(Term::is_positive) {
                        alt.insert(0, Term::set(SetName::AllNamespaces));
                    }
                    alt
                })
                .collect::<Vec<_>>()
        })
    };

    match (&peer.ip_block, &peer.namespace_selector, &peer.pod_selector) {
        (Some(block), None, None) => {
            let cidr = parse_v4(&block.cidr)?;
            let except = block
                .except
                .iter()
                .flatten()
                .map(|e| parse_v4(e))
                .collect::<Result<Vec<_>, _>>()?;
            if except.is_empty() {
                return Ok(vec![vec![Term::Net(cidr)]]);
            }

            let set = SetName::Cidr {
                policy: id.clone(),
                direction,
                rule,
                peer: index,
            };
            let members = hash_net_entries(cidr)
                .into_iter()
                .map(Member::net)
                .chain(
                    except
                        .into_iter()
                        .flat_map(hash_net_entries)
                        .map(Member::nomatch),
                )
                .collect();
            owned.insert(set.clone(), members);
            Ok(vec![vec![Term::set(set)]])
        }
        (Some(_), _, _) => Err(CompileError::Unsupported(
            "ipBlock peers cannot be combined with selectors".to_string(),
        )),
        (None, None, None) => Err(CompileError::Unsupported(
            "peer must set a selector or an ipBlock".to_string(),
        )),
        (None, None, Some(pods)) => Ok(alternatives(Some(pods), Scope::Pods)?
            .into_iter()
            .map(|mut alt| {
                alt.insert(0, Term::set(namespace_set.clone()));
                alt
            })
            .collect()),
        (None, Some(ns), None) => namespaces(ns),
        (None, Some(ns), Some(pods)) => {
            let pods = alternatives(Some(pods), Scope::Pods)?;
            let mut alts = Vec::new();
            for ns in namespaces(ns)? {
                for pod in &pods {
                    let mut alt = ns.clone();
                    alt.extend(pod.iter().cloned());
                    alts.push(alt);
                }
            }
            if alts.len() > MAX_ALTERNATIVES {
                return Err(CompileError::Unsupported(format!(
                    "peer expands to more than {MAX_ALTERNATIVES} alternatives"
                )));
            }
            Ok(alts)
        }
    }
}

fn parse_v4(cidr: &str) -> Result<IpNet, CompileError> {
    match cidr.parse::<IpNet>() {
        Ok(net @ IpNet::V4(_)) => Ok(net),
        Ok(IpNet::V6(_)) => Err(CompileError::Unsupported(format!(
            "IPv6 block {cidr} is not supported"
        ))),
        Err(error) => Err(CompileError::Unsupported(format!(
            "invalid CIDR {cidr:?}: {error}"
        ))),
    }
}

/// `hash:net` sets cannot hold a zero-length prefix, so the whole address space is stored as its
/// two halves.
fn hash_net_entries(net: IpNet) -> Vec<IpNet> {
    if net.prefix_len() != 0 {
        return vec![net];
    }
    net.subnets(1)
        .map(|halves| halves.collect())
        .unwrap_or_else(|_| vec![net])
}

fn port_match(port: &k8s::NetworkPolicyPort) -> Result<PortMatch, CompileError> {
    let protocol = port
        .protocol
        .as_deref()
        .unwrap_or("TCP")
        .parse::<Protocol>()
        .map_err(|e| CompileError::Unsupported(e.to_string()))?;

    let number = |n: i32| {
        u16::try_from(n)
            .ok()
            .filter(|n| *n != 0)
            .ok_or_else(|| CompileError::Unsupported(format!("port {n} is out of range")))
    };
    let range = |start: u16| -> Result<PortMatch, CompileError> {
        let end = port.end_port.map(number).transpose()?;
        if let Some(end) = end.filter(|end| *end < start) {
            return Err(CompileError::Unsupported(format!(
                "endPort {end} precedes port {start}"
            )));
        }
        Ok(PortMatch::Range {
            protocol,
            start,
            end,
        })
    };

    match &port.port {
        None if port.end_port.is_some() => Err(CompileError::Unsupported(
            "endPort requires a port".to_string(),
        )),
        None => Ok(PortMatch::Protocol(protocol)),
        Some(k8s::IntOrString::Int(n)) => range(number(*n)?),
        Some(k8s::IntOrString::String(s)) => match s.parse::<i32>() {
            Ok(n) => range(number(n)?),
            Err(_) if port.end_port.is_some() => Err(CompileError::Unsupported(format!(
                "endPort cannot be used with named port {s:?}"
            ))),
            Err(_) => Ok(PortMatch::Named {
                protocol,
                name: s.clone(),
            }),
        },
    }
}

fn render(alt: &[Term], addr: Addr) -> Vec<Match> {
    let flags = match addr {
        Addr::Src => SetFlags::Src,
        Addr::Dst => SetFlags::Dst,
    };
    alt.iter()
        .map(|term| match term {
            Term::Set { set, negate } => Match::Set {
                set: set.clone(),
                flags,
                negate: *negate,
            },
            Term::Net(net) => Match::Net { net: *net, addr },
        })
        .collect()
}

// === impl Term ===

impl Term {
    fn set(set: SetName) -> Self {
        Self::Set { set, negate: false }
    }

    fn not(set: SetName) -> Self {
        Self::Set { set, negate: true }
    }

    fn is_positive(&self) -> bool {
        !matches!(self, Self::Set { negate: true, .. })
    }
}

// === impl PortMatch ===

impl PortMatch {
    fn matches(&self) -> Vec<Match> {
        match self {
            Self::Any => vec![],
            Self::Protocol(p) => vec![Match::Protocol(*p)],
            Self::Range {
                protocol,
                start,
                end,
            } => vec![
                Match::Protocol(*protocol),
                Match::Port {
                    protocol: *protocol,
                    start: *start,
                    end: *end,
                },
            ],
            Self::Named { protocol, name } => vec![
                Match::Protocol(*protocol),
                Match::Set {
                    set: SetName::NamedPort(name.clone()),
                    flags: SetFlags::DstDst,
                    negate: false,
                },
            ],
        }
    }
}
