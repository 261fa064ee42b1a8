//! In-memory ipset and iptables primitives for tests.
//!
//! Both primitives share one world so that the kernel's cross-checks hold: a rule may only
//! reference an existing set, and a set referenced by a rule or nested in a list cannot be
//! destroyed.

use crate::{Kernel, KernelError};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Write,
    sync::Arc,
};

/// A shared in-memory netfilter.
#[derive(Clone, Debug, Default)]
pub struct FakeNetfilter(Arc<Mutex<World>>);

/// A view of a [`FakeNetfilter`] that behaves like `ipset -exist restore`: lines are applied one
/// at a time, and lines before a failure stay applied.
#[derive(Clone, Debug)]
pub struct FakeIpset(Arc<Mutex<World>>);

/// A view of a [`FakeNetfilter`] that behaves like `iptables-restore --noflush`: nothing is
/// applied unless the whole transaction commits.
#[derive(Clone, Debug)]
pub struct FakeIptables(Arc<Mutex<World>>);

#[derive(Debug)]
struct World {
    sets: BTreeMap<String, Set>,
    chains: BTreeMap<String, Vec<String>>,
    ipset_failures: Vec<String>,
    iptables_failures: Vec<String>,
    ipset_restores: usize,
    iptables_restores: usize,
}

#[derive(Clone, Debug)]
struct Set {
    kind: String,
    options: String,
    members: BTreeSet<String>,
}

const BUILTIN_CHAINS: [&str; 3] = ["INPUT", "FORWARD", "OUTPUT"];
const BUILTIN_TARGETS: [&str; 6] = ["ACCEPT", "DROP", "RETURN", "REJECT", "MARK", "LOG"];

// === impl FakeNetfilter ===

impl FakeNetfilter {
    pub fn ipset(&self) -> FakeIpset {
        FakeIpset(self.0.clone())
    }

    pub fn iptables(&self) -> FakeIptables {
        FakeIptables(self.0.clone())
    }

    /// Fails any ipset restore line containing `pattern` until failures are cleared.
    pub fn fail_ipset_on(&self, pattern: impl Into<String>) {
        self.0.lock().ipset_failures.push(pattern.into());
    }

    /// Fails any iptables restore line containing `pattern` until failures are cleared.
    pub fn fail_iptables_on(&self, pattern: impl Into<String>) {
        self.0.lock().iptables_failures.push(pattern.into());
    }

    pub fn clear_failures(&self) {
        let mut world = self.0.lock();
        world.ipset_failures.clear();
        world.iptables_failures.clear();
    }

    /// Appends a rule that the controller does not own.
    pub fn add_foreign_rule(&self, chain: &str, spec: &str) {
        self.0
            .lock()
            .chains
            .entry(chain.to_string())
            .or_default()
            .push(spec.to_string());
    }

    /// The number of restore scripts each primitive has been given, `(ipset, iptables)`.
    pub fn restores(&self) -> (usize, usize) {
        let world = self.0.lock();
        (world.ipset_restores, world.iptables_restores)
    }
}

// === impl World ===

impl Default for World {
    fn default() -> Self {
        Self {
            sets: BTreeMap::new(),
            chains: BUILTIN_CHAINS
                .iter()
                .map(|c| (c.to_string(), Vec::new()))
                .collect(),
            ipset_failures: Vec::new(),
            iptables_failures: Vec::new(),
            ipset_restores: 0,
            iptables_restores: 0,
        }
    }
}

impl World {
    fn set_referenced(&self, name: &str) -> bool {
        let by_rule = self.chains.values().flatten().any(|spec| {
            let words = spec.split_whitespace().collect::<Vec<_>>();
            words
                .windows(2)
                .any(|w| w[0] == "--match-set" && w[1] == name)
        });
        let by_list = self
            .sets
            .values()
            .any(|s| s.kind == "list:set" && s.members.contains(name));
        by_rule || by_list
    }

    fn ipset_line(&mut self, line: &str) -> Result<(), String> {
        let words = line.split_whitespace().collect::<Vec<_>>();
        let (cmd, name) = match words.as_slice() {
            [cmd, name, ..] => (*cmd, *name),
            _ => return Err("syntax error".to_string()),
        };
        let rest = words[2..].join(" ");

        match cmd {
            "create" => {
                let kind = words.get(2).ok_or("missing set type")?.to_string();
                if let Some(set) = self.sets.get(name) {
                    if set.kind != kind {
                        return Err(
                            "Set cannot be created: set with the same name already exists"
                                .to_string(),
                        );
                    }
                    return Ok(());
                }
                self.sets.insert(
                    name.to_string(),
                    Set {
                        kind,
                        options: words[3..].join(" "),
                        members: BTreeSet::new(),
                    },
                );
            }
            "add" => {
                let kind = self.set(name)?.kind.as_str();
                if kind == "hash:net" && rest.trim_end_matches(" nomatch").ends_with("/0") {
                    return Err("Zero valued element is not supported".to_string());
                }
                let list = kind == "list:set";
                if list {
                    match self.sets.get(&rest) {
                        None => {
                            return Err(format!(
                                "Set to be added/deleted/tested as element does not exist: {rest}"
                            ))
                        }
                        Some(s) if s.kind == "list:set" => {
                            return Err("Set type list:set cannot be nested".to_string())
                        }
                        Some(_) => {}
                    }
                }
                let key = rest.trim_end_matches(" nomatch").to_string();
                let set = self.set_mut(name)?;
                set.members.retain(|m| m.trim_end_matches(" nomatch") != key);
                set.members.insert(rest);
            }
            "del" => {
                let key = rest.trim_end_matches(" nomatch").to_string();
                self.set_mut(name)?
                    .members
                    .retain(|m| m.trim_end_matches(" nomatch") != key);
            }
            "flush" => self.set_mut(name)?.members.clear(),
            "destroy" => {
                self.set(name)?;
                if self.set_referenced(name) {
                    return Err(
                        "Set cannot be destroyed: it is in use by a kernel component".to_string(),
                    );
                }
                self.sets.remove(name);
            }
            cmd => return Err(format!("unknown command {cmd}")),
        }
        Ok(())
    }

    fn set(&self, name: &str) -> Result<&Set, String> {
        self.sets
            .get(name)
            .ok_or_else(|| "The set with the given name does not exist".to_string())
    }

    fn set_mut(&mut self, name: &str) -> Result<&mut Set, String> {
        self.sets
            .get_mut(name)
            .ok_or_else(|| "The set with the given name does not exist".to_string())
    }

    fn check_rule(&self, chains: &BTreeMap<String, Vec<String>>, spec: &str) -> Result<(), String> {
        let words = spec.split_whitespace().collect::<Vec<_>>();
        for w in words.windows(2) {
            match w[0] {
                "--match-set" if !self.sets.contains_key(w[1]) => {
                    return Err(format!("Set {} doesn't exist.", w[1]));
                }
                "-j" if !BUILTIN_TARGETS.contains(&w[1]) && !chains.contains_key(w[1]) => {
                    return Err(format!("Couldn't load target `{}'", w[1]));
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn iptables_line(
        &self,
        chains: &mut BTreeMap<String, Vec<String>>,
        line: &str,
    ) -> Result<(), String> {
        if let Some(decl) = line.strip_prefix(':') {
            let name = decl.split_whitespace().next().unwrap_or_default();
            if !BUILTIN_CHAINS.contains(&name) {
                chains.insert(name.to_string(), Vec::new());
            }
            return Ok(());
        }

        let (flag, rest) = line.split_once(' ').ok_or("syntax error")?;
        let (chain, args) = rest.split_once(' ').unwrap_or((rest, ""));
        if flag != "-N" && !chains.contains_key(chain) {
            return Err(format!("chain {chain} does not exist"));
        }
        match flag {
            "-A" => {
                self.check_rule(chains, args)?;
                chains.entry(chain.to_string()).or_default().push(args.to_string());
            }
            "-I" => {
                let (index, spec) = match args.split_once(' ') {
                    Some((n, spec)) if n.parse::<usize>().is_ok() => {
                        (n.parse::<usize>().unwrap_or(1), spec)
                    }
                    _ => (1, args),
                };
                self.check_rule(chains, spec)?;
                let rules = chains.entry(chain.to_string()).or_default();
                if index == 0 || index > rules.len() + 1 {
                    return Err("Index of insertion too big".to_string());
                }
                rules.insert(index - 1, spec.to_string());
            }
            "-D" => {
                let rules = chains.entry(chain.to_string()).or_default();
                match args.parse::<usize>() {
                    Ok(n) if n >= 1 && n <= rules.len() => {
                        rules.remove(n - 1);
                    }
                    Ok(_) => return Err("Index of deletion too big".to_string()),
                    Err(_) => {
                        let pos = rules
                            .iter()
                            .position(|r| r == args)
                            .ok_or("Bad rule (does a matching rule exist in that chain?)")?;
                        rules.remove(pos);
                    }
                }
            }
            "-F" => chains.entry(chain.to_string()).or_default().clear(),
            "-N" => {
                if chains.contains_key(chain) {
                    return Err("Chain already exists".to_string());
                }
                chains.insert(chain.to_string(), Vec::new());
            }
            "-X" => {
                if BUILTIN_CHAINS.contains(&chain) {
                    return Err("Can't delete built-in chain".to_string());
                }
                if chains.get(chain).is_some_and(|r| !r.is_empty()) {
                    return Err("Directory not empty".to_string());
                }
                let referenced = chains.values().flatten().any(|spec| {
                    let words = spec.split_whitespace().collect::<Vec<_>>();
                    words.windows(2).any(|w| w[0] == "-j" && w[1] == chain)
                });
                if referenced {
                    return Err("Too many links".to_string());
                }
                chains.remove(chain);
            }
            flag => return Err(format!("unknown option {flag}")),
        }
        Ok(())
    }
}

fn injected(failures: &[String], line: &str) -> bool {
    failures.iter().any(|p| line.contains(p.as_str()))
}

// === impl FakeIpset ===

impl Kernel for FakeIpset {
    fn save(&self) -> Result<String, KernelError> {
        let world = self.0.lock();
        let mut dump = String::new();
        for (name, set) in &world.sets {
            let _ = writeln!(dump, "create {name} {} {}", set.kind, set.options);
            for member in &set.members {
                let _ = writeln!(dump, "add {name} {member}");
            }
        }
        Ok(dump)
    }

    fn restore(&self, script: &str) -> Result<(), KernelError> {
        let mut world = self.0.lock();
        world.ipset_restores += 1;
        for (i, line) in script.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let n = i + 1;
            if injected(&world.ipset_failures, line) {
                return Err(KernelError::at_line(
                    n,
                    format!("ipset: Error in line {n}: injected failure"),
                ));
            }
            world.ipset_line(line).map_err(|message| {
                KernelError::at_line(n, format!("ipset: Error in line {n}: {message}"))
            })?;
        }
        Ok(())
    }
}

// === impl FakeIptables ===

impl Kernel for FakeIptables {
    fn save(&self) -> Result<String, KernelError> {
        let world = self.0.lock();
        let mut dump = String::from("# Generated by a fake iptables-save\n*filter\n");
        let builtin = BUILTIN_CHAINS.iter().map(|c| c.to_string());
        let user = world
            .chains
            .keys()
            .filter(|c| !BUILTIN_CHAINS.contains(&c.as_str()))
            .cloned();
        let order = builtin.chain(user).collect::<Vec<_>>();
        for chain in &order {
            let policy = if BUILTIN_CHAINS.contains(&chain.as_str()) {
                "ACCEPT"
            } else {
                "-"
            };
            let _ = writeln!(dump, ":{chain} {policy} [0:0]");
        }
        for chain in &order {
            for spec in world.chains.get(chain).into_iter().flatten() {
                let _ = writeln!(dump, "-A {chain} {spec}");
            }
        }
        dump.push_str("COMMIT\n");
        Ok(dump)
    }

    fn restore(&self, script: &str) -> Result<(), KernelError> {
        let mut world = self.0.lock();
        world.iptables_restores += 1;
        let mut work = world.chains.clone();
        let mut table = false;
        for (i, line) in script.lines().enumerate() {
            let line = line.trim();
            let n = i + 1;
            let failed = |message: String| {
                KernelError::at_line(n, format!("iptables-restore: line {n} failed: {message}"))
            };
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if injected(&world.iptables_failures, line) {
                return Err(failed("injected failure".to_string()));
            }
            match line {
                "*filter" => table = true,
                "COMMIT" if table => {
                    world.chains = work;
                    return Ok(());
                }
                _ if !table => return Err(failed("no table specified".to_string())),
                line => world.iptables_line(&mut work, line).map_err(failed)?,
            }
        }
        Err(KernelError::from_output(
            "iptables-restore: COMMIT expected at end of input",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipset_is_not_atomic() {
        let nf = FakeNetfilter::default();
        let ipset = nf.ipset();
        let err = ipset
            .restore("create a hash:net family inet\nadd a 10.0.0.1\nadd b 10.0.0.2\n")
            .expect_err("set b does not exist");
        assert_eq!(err.line, Some(3));
        assert_eq!(
            ipset.save().unwrap(),
            "create a hash:net family inet\nadd a 10.0.0.1\n"
        );
    }

    #[test]
    fn iptables_is_atomic() {
        let nf = FakeNetfilter::default();
        let iptables = nf.iptables();
        let before = iptables.save().unwrap();
        let err = iptables
            .restore("*filter\n:NETPOL - [0:0]\n-A FORWARD -j NETPOL\n-A NETPOL -j MISSING\nCOMMIT\n")
            .expect_err("jump target does not exist");
        assert_eq!(err.line, Some(4));
        assert_eq!(iptables.save().unwrap(), before);
    }

    #[test]
    fn hash_net_rejects_zero_prefix() {
        let nf = FakeNetfilter::default();
        let ipset = nf.ipset();
        let err = ipset
            .restore("create a hash:net family inet\nadd a 0.0.0.0/1\nadd a 0.0.0.0/0\n")
            .expect_err("zero prefix");
        assert_eq!(err.line, Some(3));
        assert_eq!(
            ipset.save().unwrap(),
            "create a hash:net family inet\nadd a 0.0.0.0/1\n"
        );
    }

    #[test]
    fn referenced_sets_cannot_be_destroyed() {
        let nf = FakeNetfilter::default();
        let ipset = nf.ipset();
        ipset.restore("create a hash:net family inet\n").unwrap();
        nf.iptables()
            .restore("*filter\n-A FORWARD -m set --match-set a src -j DROP\nCOMMIT\n")
            .unwrap();
        assert!(ipset.restore("destroy a\n").is_err());
    }
}
