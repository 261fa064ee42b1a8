use crate::{compile, Reconciler};
use maplit::{btreemap, btreeset};
use netpol_controller_core::{
    ipset::{Member, SetName},
    iptables::{Tag, INGRESS_ALLOW, INGRESS_DROP},
    Direction, ResourceId,
};
use netpol_controller_k8s_api as k8s;
use netpol_controller_kernel::{
    fake::FakeNetfilter, FilterState, FilterStore, SetState, SetStore,
};
use serde_json::json;

/// A fake node kernel shared by a reconciler and the test's assertions.
pub(crate) struct Kernel {
    pub(crate) netfilter: FakeNetfilter,
}

impl Kernel {
    pub(crate) fn new() -> Self {
        Self {
            netfilter: FakeNetfilter::default(),
        }
    }

    pub(crate) fn stores(&self) -> (SetStore, FilterStore) {
        (
            SetStore::new(self.netfilter.ipset()),
            FilterStore::new(self.netfilter.iptables()),
        )
    }

    pub(crate) fn reconciler(&self) -> Reconciler {
        let (sets, filters) = self.stores();
        Reconciler::new(sets, filters).expect("base rules must install")
    }

    pub(crate) fn sets(&self) -> SetState {
        self.stores().0.state().expect("sets must parse")
    }

    pub(crate) fn filters(&self) -> FilterState {
        self.stores().1.state().expect("rules must parse")
    }

    /// Kernel rules tagged with a policy, as `(chain, spec)`.
    fn rules(&self, ns: &str, name: &str) -> Vec<(String, String)> {
        self.filters()
            .tagged(&Tag::Policy(ResourceId::new(ns, name)))
            .into_iter()
            .map(|(c, s)| (c.to_string(), s.to_string()))
            .collect()
    }

    /// Asserts that the kernel holds exactly the sets the cache expects.
    fn assert_converged(&self, reconciler: &Reconciler) {
        let desired = reconciler.with_cache(|c| c.sets().to_kernel_state());
        assert_eq!(self.sets(), desired);
    }
}

pub(crate) fn mk_namespace(
    name: impl ToString,
    labels: impl IntoIterator<Item = (&'static str, &'static str)>,
) -> k8s::Namespace {
    k8s::Namespace {
        metadata: k8s::ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(
                labels
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub(crate) fn mk_pod(
    ns: impl ToString,
    name: impl ToString,
    ip: &str,
    labels: impl IntoIterator<Item = (&'static str, &'static str)>,
) -> k8s::Pod {
    k8s::Pod {
        metadata: k8s::ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            labels: Some(
                labels
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        },
        spec: Some(k8s::PodSpec::default()),
        status: Some(k8s::PodStatus {
            pod_ip: Some(ip.to_string()),
            phase: Some("Running".to_string()),
            ..Default::default()
        }),
    }
}

pub(crate) fn mk_policy(
    ns: impl ToString,
    name: impl ToString,
    spec: serde_json::Value,
) -> k8s::NetworkPolicy {
    serde_json::from_value(json!({
        "apiVersion": "networking.k8s.io/v1",
        "kind": "NetworkPolicy",
        "metadata": { "namespace": ns.to_string(), "name": name.to_string() },
        "spec": spec,
    }))
    .expect("policy must deserialize")
}

fn ip(s: &str) -> Member {
    Member::addr(s.parse().unwrap())
}

fn ns_member(name: &str) -> Member {
    Member::Set(SetName::namespace(name))
}

#[test]
fn renamed_namespace_leaves_no_trace() {
    let kernel = Kernel::new();
    let reconciler = kernel.reconciler();
    let old = mk_namespace("old-test-namespace", Some(("app", "old-test-namespace")));
    let new = mk_namespace("new-test-namespace", Some(("app", "new-test-namespace")));
    reconciler.add_namespace(&old).unwrap();
    reconciler.update_namespace(&old, &new).unwrap();

    reconciler.with_cache(|cache| {
        assert!(cache.namespace("old-test-namespace").is_none());
        let entry = cache
            .namespace("new-test-namespace")
            .expect("namespace must exist");
        assert_eq!(
            *entry.labels(),
            k8s::Labels::from(btreemap! {
                "app".to_string() => "new-test-namespace".to_string(),
            })
        );
        assert_eq!(
            cache.set_members(&SetName::AllNamespaces),
            Some(btreeset! { ns_member("new-test-namespace") })
        );
        assert_eq!(
            cache.set_members(&SetName::namespace_label("app", None)),
            Some(btreeset! { ns_member("new-test-namespace") })
        );
        assert!(!cache
            .sets()
            .contains(&SetName::namespace_label("app", Some("old-test-namespace"))));
        assert!(!cache.sets().contains(&SetName::namespace("old-test-namespace")));
    });
    assert!(!kernel
        .sets()
        .contains(&SetName::namespace("old-test-namespace")));
    kernel.assert_converged(&reconciler);
}

#[test]
fn namespace_label_changes_update_memberships() {
    let kernel = Kernel::new();
    let reconciler = kernel.reconciler();
    let old = mk_namespace("ns-0", [("app", "old"), ("update", "true"), ("group", "test")]);
    let new = mk_namespace("ns-0", [("app", "old"), ("update", "false")]);
    reconciler.add_namespace(&old).unwrap();
    reconciler.update_namespace(&old, &new).unwrap();

    reconciler.with_cache(|cache| {
        let entry = cache.namespace("ns-0").expect("namespace must exist");
        assert_eq!(
            *entry.labels(),
            k8s::Labels::from(btreemap! {
                "app".to_string() => "old".to_string(),
                "update".to_string() => "false".to_string(),
            })
        );
        for gone in [
            SetName::namespace_label("group", None),
            SetName::namespace_label("group", Some("test")),
            SetName::namespace_label("update", Some("true")),
        ] {
            assert!(!cache.sets().contains(&gone), "{gone} must be dropped");
        }
        for set in [
            SetName::namespace_label("app", Some("old")),
            SetName::namespace_label("update", None),
            SetName::namespace_label("update", Some("false")),
        ] {
            assert_eq!(
                cache.set_members(&set),
                Some(btreeset! { ns_member("ns-0") }),
                "{set}"
            );
        }
    });
    kernel.assert_converged(&reconciler);
}

#[test]
fn pod_memberships_track_labels_and_addresses() {
    let kernel = Kernel::new();
    let reconciler = kernel.reconciler();
    reconciler
        .add_namespace(&mk_namespace("ns-0", None))
        .unwrap();
    let pod0 = mk_pod("ns-0", "pod-0", "10.0.0.1", [("app", "web"), ("tier", "a")]);
    let pod1 = mk_pod("ns-0", "pod-1", "10.0.0.2", [("app", "db")]);
    reconciler.add_pod(&pod0).unwrap();
    reconciler.add_pod(&pod1).unwrap();

    let members = |set: SetName| reconciler.with_cache(|c| c.set_members(&set));
    assert_eq!(
        members(SetName::namespace("ns-0")),
        Some(btreeset! { ip("10.0.0.1"), ip("10.0.0.2") })
    );
    assert_eq!(
        members(SetName::pod_label("app", None)),
        Some(btreeset! { ip("10.0.0.1"), ip("10.0.0.2") })
    );
    assert_eq!(
        members(SetName::pod_label("app", Some("web"))),
        Some(btreeset! { ip("10.0.0.1") })
    );
    kernel.assert_converged(&reconciler);

    // Relabel and readdress pod-0.
    let pod0b = mk_pod("ns-0", "pod-0", "10.0.0.3", [("app", "db")]);
    reconciler.update_pod(&pod0, &pod0b).unwrap();
    assert_eq!(
        members(SetName::pod_label("app", Some("db"))),
        Some(btreeset! { ip("10.0.0.2"), ip("10.0.0.3") })
    );
    assert_eq!(members(SetName::pod_label("app", Some("web"))), None);
    assert_eq!(members(SetName::pod_label("tier", None)), None);
    kernel.assert_converged(&reconciler);

    // A terminated pod leaves every set.
    let mut done = pod1.clone();
    done.status.as_mut().unwrap().phase = Some("Succeeded".to_string());
    reconciler.update_pod(&pod1, &done).unwrap();
    assert_eq!(
        members(SetName::namespace("ns-0")),
        Some(btreeset! { ip("10.0.0.3") })
    );
    kernel.assert_converged(&reconciler);
}

#[test]
fn named_ports_join_port_sets() {
    let kernel = Kernel::new();
    let reconciler = kernel.reconciler();
    let mut pod = mk_pod("ns-0", "pod-0", "10.0.0.1", None);
    pod.spec = Some(k8s::PodSpec {
        containers: vec![k8s::Container {
            name: "app".to_string(),
            ports: Some(vec![k8s::ContainerPort {
                name: Some("http".to_string()),
                container_port: 8080,
                ..Default::default()
            }]),
            ..Default::default()
        }],
        ..Default::default()
    });
    reconciler.add_pod(&pod).unwrap();

    let set = SetName::NamedPort("http".to_string());
    assert_eq!(
        kernel.sets().members(&set),
        Some(&btreeset! { "10.0.0.1,tcp:8080".to_string() })
    );
    kernel.assert_converged(&reconciler);
}

#[test]
fn deleting_and_readding_is_idempotent() {
    let kernel = Kernel::new();
    let reconciler = kernel.reconciler();
    let ns = mk_namespace("ns-0", Some(("team", "a")));
    let pod = mk_pod("ns-0", "pod-0", "10.0.0.1", Some(("app", "web")));
    let policy = mk_policy(
        "ns-0",
        "allow-web",
        json!({
            "podSelector": { "matchLabels": { "app": "web" } },
            "ingress": [{
                "from": [{ "namespaceSelector": { "matchLabels": { "team": "a" } } }],
                "ports": [{ "port": 80 }],
            }],
        }),
    );
    reconciler.add_namespace(&ns).unwrap();
    reconciler.add_pod(&pod).unwrap();
    reconciler.add_policy(&policy).unwrap();
    let (sets, filters) = (kernel.sets(), kernel.filters());

    let id = ResourceId::new("ns-0", "allow-web");
    reconciler.delete_policy(&id).unwrap();
    reconciler
        .delete_pod(&ResourceId::new("ns-0", "pod-0"))
        .unwrap();
    reconciler.delete_namespace("ns-0").unwrap();
    assert!(kernel.rules("ns-0", "allow-web").is_empty());
    assert_eq!(
        kernel
            .sets()
            .iter()
            .map(|(name, _)| name.to_string())
            .collect::<Vec<_>>(),
        vec![SetName::AllNamespaces.kernel_name()]
    );
    kernel.assert_converged(&reconciler);

    reconciler.add_namespace(&ns).unwrap();
    reconciler.add_pod(&pod).unwrap();
    reconciler.add_policy(&policy).unwrap();
    assert_eq!(kernel.sets(), sets);
    assert_eq!(kernel.filters(), filters);
}

#[test]
fn stale_events_are_absorbed() {
    let kernel = Kernel::new();
    let reconciler = kernel.reconciler();
    let pod = mk_pod("ns-0", "pod-0", "10.0.0.1", None);
    reconciler.add_pod(&pod).unwrap();
    reconciler.add_pod(&pod).unwrap();
    reconciler
        .delete_pod(&ResourceId::new("ns-0", "pod-1"))
        .unwrap();
    reconciler.delete_namespace("unknown").unwrap();

    // An update of an unknown pod adds it.
    let other = mk_pod("ns-0", "pod-2", "10.0.0.2", None);
    reconciler.update_pod(&other, &other).unwrap();
    assert_eq!(
        reconciler.with_cache(|c| c.set_members(&SetName::namespace("ns-0"))),
        Some(btreeset! { ip("10.0.0.1"), ip("10.0.0.2") })
    );
    kernel.assert_converged(&reconciler);
}

#[test]
fn empty_ingress_rule_allows_all_ingress() {
    let kernel = Kernel::new();
    let reconciler = kernel.reconciler();
    reconciler
        .add_pod(&mk_pod("ns-0", "pod-0", "10.0.0.1", Some(("app", "web"))))
        .unwrap();
    let policy = mk_policy(
        "ns-0",
        "allow-all",
        json!({
            "podSelector": { "matchLabels": { "app": "web" } },
            "ingress": [{}],
        }),
    );
    reconciler.add_policy(&policy).unwrap();

    let rules = kernel.rules("ns-0", "allow-all");
    assert_eq!(rules.len(), 2, "{rules:#?}");
    assert_eq!(rules[0].0, INGRESS_ALLOW);
    assert!(rules[0].1.contains("MARK"), "{}", rules[0].1);
    assert_eq!(rules[1].0, INGRESS_DROP);

    // The rules in the kernel are exactly the compiled rules.
    let compiled = compile(&policy).unwrap();
    assert_eq!(
        rules,
        compiled
            .rules
            .iter()
            .map(|r| (r.chain.clone(), r.render()))
            .collect::<Vec<_>>()
    );
}

#[test]
fn unsupported_update_keeps_prior_rules() {
    let kernel = Kernel::new();
    let reconciler = kernel.reconciler();
    let good = mk_policy(
        "ns-0",
        "policy-0",
        json!({ "podSelector": {}, "ingress": [{ "ports": [{ "port": 443 }] }] }),
    );
    let bad = mk_policy(
        "ns-0",
        "policy-0",
        json!({
            "podSelector": {},
            "ingress": [{ "from": [{ "ipBlock": { "cidr": "fd00::/64" } }] }],
        }),
    );
    reconciler.add_policy(&good).unwrap();
    let before = kernel.rules("ns-0", "policy-0");
    assert!(!before.is_empty());

    let err = reconciler
        .update_policy(&good, &bad)
        .expect_err("policy must be rejected");
    assert!(!err.is_retryable());
    assert_eq!(kernel.rules("ns-0", "policy-0"), before);

    let id = ResourceId::new("ns-0", "policy-0");
    reconciler.with_cache(|cache| {
        assert_eq!(cache.policy(&id).unwrap().spec(), bad.spec.clone().unwrap());
        assert_eq!(
            *cache.processed(&id).unwrap().spec(),
            good.spec.clone().unwrap()
        );
        assert_eq!(cache.pending_policies(Some("ns-0")), vec![id.clone()]);
    });

    // Other policies are unaffected.
    let other = mk_policy("ns-0", "policy-1", json!({ "podSelector": {} }));
    reconciler.add_policy(&other).unwrap();
    assert!(!kernel.rules("ns-0", "policy-1").is_empty());
}

#[test]
fn unchanged_recompilation_is_a_noop() {
    let kernel = Kernel::new();
    let reconciler = kernel.reconciler();
    let policy = mk_policy(
        "ns-0",
        "policy-0",
        json!({
            "podSelector": { "matchLabels": { "app": "web" } },
            "ingress": [{ "from": [{ "podSelector": { "matchLabels": { "app": "api" } } }] }],
        }),
    );
    reconciler.add_policy(&policy).unwrap();
    let restores = kernel.netfilter.restores();

    reconciler.apply_policy(&policy).unwrap();
    assert_eq!(kernel.netfilter.restores(), restores);

    // An explicit policy type that compiles to the same rules changes nothing in the kernel.
    let mut explicit = policy.clone();
    explicit.spec.as_mut().unwrap().policy_types = Some(vec!["Ingress".to_string()]);
    reconciler.update_policy(&policy, &explicit).unwrap();
    assert_eq!(kernel.netfilter.restores(), restores);
    let id = ResourceId::new("ns-0", "policy-0");
    assert!(reconciler.with_cache(|c| c.pending_policies(None).is_empty()));
    assert_eq!(
        reconciler.with_cache(|c| c.processed(&id).unwrap().spec().clone()),
        explicit.spec.unwrap()
    );
}

#[test]
fn failed_filter_batch_rolls_back() {
    let kernel = Kernel::new();
    let reconciler = kernel.reconciler();
    reconciler
        .add_pod(&mk_pod("ns-0", "pod-0", "10.0.0.1", Some(("app", "web"))))
        .unwrap();
    let (sets, filters) = (kernel.sets(), kernel.filters());

    let policy = mk_policy(
        "ns-0",
        "policy-0",
        json!({
            "podSelector": { "matchLabels": { "app": "web" } },
            "ingress": [{ "from": [{ "podSelector": { "matchLabels": { "role": "client" } } }] }],
        }),
    );
    kernel.netfilter.fail_iptables_on("ns-0/policy-0");
    let err = reconciler
        .add_policy(&policy)
        .expect_err("rules must be rejected");
    assert!(err.is_retryable(), "{err}");
    assert_eq!(kernel.sets(), sets);
    assert_eq!(kernel.filters(), filters);
    let id = ResourceId::new("ns-0", "policy-0");
    reconciler.with_cache(|cache| {
        assert!(cache.policy(&id).is_some());
        assert!(cache.processed(&id).is_none());
        assert!(!cache.sets().contains(&SetName::pod_label("role", Some("client"))));
    });
    kernel.assert_converged(&reconciler);

    kernel.netfilter.clear_failures();
    reconciler.apply_policy(&policy).unwrap();
    assert_eq!(kernel.rules("ns-0", "policy-0").len(), 2);
    assert!(kernel
        .sets()
        .contains(&SetName::pod_label("role", Some("client"))));
    kernel.assert_converged(&reconciler);
}

#[test]
fn failed_set_batch_rolls_back() {
    let kernel = Kernel::new();
    let reconciler = kernel.reconciler();
    let pod0 = mk_pod("ns-0", "pod-0", "10.0.0.1", Some(("app", "web")));
    reconciler.add_pod(&pod0).unwrap();
    let sets = kernel.sets();

    kernel.netfilter.fail_ipset_on("10.0.0.2");
    let pod1 = mk_pod("ns-0", "pod-1", "10.0.0.2", Some(("app", "web")));
    reconciler.add_pod(&pod1).expect_err("member must be rejected");
    assert_eq!(kernel.sets(), sets);
    kernel.assert_converged(&reconciler);

    // Once the kernel recovers, redelivering the event rebuilds the pod's memberships.
    kernel.netfilter.clear_failures();
    reconciler.apply_pod(&pod1).unwrap();
    assert_eq!(
        reconciler.with_cache(|c| c.set_members(&SetName::pod_label("app", Some("web")))),
        Some(btreeset! { ip("10.0.0.1"), ip("10.0.0.2") })
    );
    kernel.assert_converged(&reconciler);
}

#[test]
fn failed_delete_reinstates_policy() {
    let kernel = Kernel::new();
    let reconciler = kernel.reconciler();
    let policy = mk_policy(
        "ns-0",
        "policy-0",
        json!({
            "podSelector": {},
            "egress": [{ "to": [{ "ipBlock": { "cidr": "10.0.0.0/8", "except": ["10.1.0.0/16"] } }] }],
        }),
    );
    reconciler.add_policy(&policy).unwrap();
    let rules = kernel.rules("ns-0", "policy-0");

    kernel.netfilter.fail_iptables_on("-D NETPOL-EGRESS");
    let id = ResourceId::new("ns-0", "policy-0");
    reconciler
        .delete_policy(&id)
        .expect_err("deletion must be rejected");
    assert_eq!(kernel.rules("ns-0", "policy-0"), rules);
    assert!(reconciler.with_cache(|c| c.policy(&id).is_some() && c.processed(&id).is_some()));
    kernel.assert_converged(&reconciler);

    kernel.netfilter.clear_failures();
    reconciler.delete_policy(&id).unwrap();
    assert!(kernel.rules("ns-0", "policy-0").is_empty());
    kernel.assert_converged(&reconciler);
}

#[test]
fn ip_block_exceptions_are_owned_sets() {
    let kernel = Kernel::new();
    let reconciler = kernel.reconciler();
    let policy = mk_policy(
        "ns-0",
        "policy-0",
        json!({
            "podSelector": {},
            "egress": [{ "to": [{ "ipBlock": { "cidr": "10.0.0.0/8", "except": ["10.1.0.0/16"] } }] }],
        }),
    );
    reconciler.add_policy(&policy).unwrap();

    let set = SetName::Cidr {
        policy: ResourceId::new("ns-0", "policy-0"),
        direction: Direction::Egress,
        rule: 0,
        peer: 0,
    };
    assert_eq!(
        kernel.sets().members(&set),
        Some(&btreeset! { "10.0.0.0/8".to_string(), "10.1.0.0/16 nomatch".to_string() })
    );

    reconciler
        .delete_policy(&ResourceId::new("ns-0", "policy-0"))
        .unwrap();
    assert!(!kernel.sets().contains(&set));
    kernel.assert_converged(&reconciler);
}

#[test]
fn whole_address_space_block_is_split() {
    let kernel = Kernel::new();
    let reconciler = kernel.reconciler();
    let policy = mk_policy(
        "ns-0",
        "policy-0",
        json!({
            "podSelector": {},
            "egress": [{ "to": [{ "ipBlock": { "cidr": "0.0.0.0/0", "except": ["10.0.0.0/8"] } }] }],
        }),
    );
    reconciler.add_policy(&policy).unwrap();

    let set = SetName::Cidr {
        policy: ResourceId::new("ns-0", "policy-0"),
        direction: Direction::Egress,
        rule: 0,
        peer: 0,
    };
    assert_eq!(
        kernel.sets().members(&set),
        Some(&btreeset! {
            "0.0.0.0/1".to_string(),
            "128.0.0.0/1".to_string(),
            "10.0.0.0/8 nomatch".to_string(),
        })
    );
    assert!(!kernel.rules("ns-0", "policy-0").is_empty());
    kernel.assert_converged(&reconciler);
}

#[test]
fn rejected_policy_does_not_block_other_events() {
    let kernel = Kernel::new();
    let reconciler = kernel.reconciler();
    let set = SetName::Cidr {
        policy: ResourceId::new("ns-0", "egress"),
        direction: Direction::Egress,
        rule: 0,
        peer: 0,
    };
    kernel.netfilter.fail_ipset_on(set.kernel_name());
    let policy = mk_policy(
        "ns-0",
        "egress",
        json!({
            "podSelector": {},
            "egress": [{ "to": [{ "ipBlock": { "cidr": "10.0.0.0/8", "except": ["10.1.0.0/16"] } }] }],
        }),
    );
    reconciler
        .add_policy(&policy)
        .expect_err("set must be rejected");
    assert!(kernel.rules("ns-0", "egress").is_empty());

    // Events that would recompile the rejected policy still converge.
    reconciler
        .add_namespace(&mk_namespace("ns-1", None))
        .unwrap();
    reconciler
        .add_pod(&mk_pod("ns-0", "pod-0", "10.0.0.1", None))
        .unwrap();
    assert!(kernel.sets().contains(&SetName::namespace("ns-1")));
    assert_eq!(
        reconciler.with_cache(|c| c.set_members(&SetName::namespace("ns-0"))),
        Some(btreeset! { ip("10.0.0.1") })
    );
    assert!(kernel.rules("ns-0", "egress").is_empty());
    kernel.assert_converged(&reconciler);

    // Redelivering the policy event retries it.
    kernel.netfilter.clear_failures();
    reconciler.apply_policy(&policy).unwrap();
    assert!(!kernel.rules("ns-0", "egress").is_empty());
    assert!(kernel.sets().contains(&set));
    kernel.assert_converged(&reconciler);
}

#[test]
fn renamed_policy_replaces_rules() {
    let kernel = Kernel::new();
    let reconciler = kernel.reconciler();
    let old = mk_policy("ns-0", "old", json!({ "podSelector": {} }));
    let new = mk_policy("ns-0", "new", json!({ "podSelector": {} }));
    reconciler.add_policy(&old).unwrap();
    reconciler.update_policy(&old, &new).unwrap();
    assert!(kernel.rules("ns-0", "old").is_empty());
    assert_eq!(kernel.rules("ns-0", "new").len(), 1);
    assert_eq!(
        reconciler.with_cache(|c| c.policy_ids().cloned().collect::<Vec<_>>()),
        vec![ResourceId::new("ns-0", "new")]
    );
}

#[test]
fn persisted_state_seeds_a_new_kernel() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = Kernel::new();
    let reconciler = kernel.reconciler();
    reconciler
        .add_namespace(&mk_namespace("ns-0", Some(("team", "a"))))
        .unwrap();
    reconciler
        .add_pod(&mk_pod("ns-0", "pod-0", "10.0.0.1", None))
        .unwrap();
    reconciler
        .add_policy(&mk_policy("ns-0", "policy-0", json!({ "podSelector": {} })))
        .unwrap();
    reconciler.persist(dir.path()).unwrap();
    assert!(dir.path().join(crate::IPSET_SNAPSHOT).exists());

    let restarted = Kernel::new();
    let (sets, filters) = restarted.stores();
    let seeded = Reconciler::load(sets, filters, dir.path()).unwrap();
    assert_eq!(restarted.sets(), kernel.sets());
    assert_eq!(restarted.filters().managed(), kernel.filters().managed());

    // Only the namespace is resynced, so the pod and the policy are pruned.
    seeded
        .add_namespace(&mk_namespace("ns-0", Some(("team", "a"))))
        .unwrap();
    seeded.prune().unwrap();
    assert!(restarted.rules("ns-0", "policy-0").is_empty());
    assert_eq!(
        restarted.sets().members(&SetName::namespace("ns-0")),
        Some(&Default::default())
    );
    restarted.assert_converged(&seeded);
}

#[test]
fn loaded_reconciler_snapshots_before_each_batch() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = Kernel::new();
    let (sets, filters) = kernel.stores();
    let reconciler = Reconciler::load(sets, filters, dir.path()).unwrap();
    let snapshot = || std::fs::read_to_string(dir.path().join(crate::IPSET_SNAPSHOT)).unwrap();
    let ns0 = SetName::namespace("ns-0").kernel_name();
    let ns1 = SetName::namespace("ns-1").kernel_name();

    reconciler
        .add_namespace(&mk_namespace("ns-0", None))
        .unwrap();
    assert!(!snapshot().contains(&ns0));

    reconciler
        .add_namespace(&mk_namespace("ns-1", None))
        .unwrap();
    let dump = snapshot();
    assert!(dump.contains(&ns0), "{dump}");
    assert!(!dump.contains(&ns1), "{dump}");
    assert!(dir.path().join(crate::IPTABLES_SNAPSHOT).exists());
}

#[test]
fn foreign_rules_are_preserved() {
    let kernel = Kernel::new();
    kernel
        .netfilter
        .add_foreign_rule("FORWARD", "-s 192.168.0.0/16 -j ACCEPT");
    let reconciler = kernel.reconciler();
    reconciler
        .add_policy(&mk_policy("ns-0", "policy-0", json!({ "podSelector": {} })))
        .unwrap();
    reconciler
        .delete_policy(&ResourceId::new("ns-0", "policy-0"))
        .unwrap();

    let forward = kernel
        .filters()
        .rules("FORWARD")
        .map(|r| r.spec.clone())
        .collect::<Vec<_>>();
    assert_eq!(forward.len(), 2);
    assert!(forward[0].contains("NETPOL"), "{forward:?}");
    assert_eq!(forward[1], "-s 192.168.0.0/16 -j ACCEPT");
}
