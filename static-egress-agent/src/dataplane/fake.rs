//! A simulated dataplane for tests: enough of iptables, ipset, and iproute2
//! to observe what the programmers install, byte for byte.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use super::{CommandOutput, Commander, Result};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FakeKernel {
    /// (table, chain) -> ordered rule specs.
    pub chains: BTreeMap<(String, String), Vec<String>>,
    pub sets: BTreeMap<String, BTreeSet<String>>,
    /// (priority, fwmark, table).
    pub policy_rules: Vec<(u32, u32, String)>,
    /// table id -> ordered (destination, device).
    pub routes: BTreeMap<u32, Vec<(String, String)>>,
    pub links: BTreeSet<String>,
    pub links_up: BTreeSet<String>,
    /// (iface, address, prefixlen) fixture configured before the test.
    pub base_addrs: Vec<(String, String, u8)>,
    /// (iface, address) host addresses added by the code under test.
    pub extra_addrs: Vec<(String, String)>,
}

impl FakeKernel {
    fn with_builtin_chains() -> Self {
        let mut kernel = Self::default();
        for (table, chain) in [
            ("nat", "POSTROUTING"),
            ("nat", "PREROUTING"),
            ("mangle", "PREROUTING"),
            ("filter", "FORWARD"),
            ("filter", "INPUT"),
        ] {
            kernel
                .chains
                .insert((table.into(), chain.into()), Vec::new());
        }
        kernel
    }
}

#[derive(Clone, Default)]
pub struct FakeCommander {
    state: Arc<Mutex<FakeKernel>>,
}

impl FakeCommander {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeKernel::with_builtin_chains())),
        }
    }

    pub fn with_addresses(addrs: &[(&str, &str, u8)]) -> Self {
        let commander = Self::new();
        commander.state.lock().unwrap().base_addrs = addrs
            .iter()
            .map(|(iface, addr, plen)| ((*iface).to_string(), (*addr).to_string(), *plen))
            .collect();
        commander
    }

    pub fn snapshot(&self) -> FakeKernel {
        self.state.lock().unwrap().clone()
    }

    pub fn rules(&self, table: &str, chain: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .chains
            .get(&(table.into(), chain.into()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_members(&self, name: &str) -> Option<BTreeSet<String>> {
        self.state.lock().unwrap().sets.get(name).cloned()
    }

    pub fn routes_in(&self, table: u32) -> Vec<(String, String)> {
        self.state
            .lock()
            .unwrap()
            .routes
            .get(&table)
            .cloned()
            .unwrap_or_default()
    }

    fn handle(&self, program: &str, args: &[String]) -> CommandOutput {
        let mut kernel = self.state.lock().unwrap();
        match program {
            "iptables" => iptables(&mut kernel, args),
            "ipset" => ipset(&mut kernel, args),
            "ip" => ip(&mut kernel, args),
            other => fail(127, &format!("{other}: command not found")),
        }
    }
}

impl Commander for FakeCommander {
    async fn output(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        Ok(self.handle(program, args))
    }
}

fn ok() -> CommandOutput {
    CommandOutput {
        code: Some(0),
        ..Default::default()
    }
}

fn ok_stdout(stdout: String) -> CommandOutput {
    CommandOutput {
        code: Some(0),
        stdout,
        ..Default::default()
    }
}

fn fail(code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        code: Some(code),
        stderr: stderr.into(),
        ..Default::default()
    }
}

fn iptables(kernel: &mut FakeKernel, args: &[String]) -> CommandOutput {
    let [flag_t, table, op, rest @ ..] = args else {
        return fail(2, "iptables: bad arguments");
    };
    if flag_t != "-t" {
        return fail(2, "iptables: bad arguments");
    }
    let key = |chain: &str| (table.clone(), chain.to_string());
    match (op.as_str(), rest) {
        ("-n", [flag_l, chain]) if flag_l == "-L" => {
            if kernel.chains.contains_key(&key(chain)) {
                ok()
            } else {
                fail(1, "iptables: No chain/target/match by that name.")
            }
        }
        ("-N", [chain]) => {
            if kernel.chains.contains_key(&key(chain)) {
                return fail(1, "iptables: Chain already exists.");
            }
            kernel.chains.insert(key(chain), Vec::new());
            ok()
        }
        ("-F", [chain]) => match kernel.chains.get_mut(&key(chain)) {
            Some(rules) => {
                rules.clear();
                ok()
            }
            None => fail(1, "iptables: No chain/target/match by that name."),
        },
        ("-X", [chain]) => {
            if kernel.chains.remove(&key(chain)).is_none() {
                return fail(1, "iptables: No chain/target/match by that name.");
            }
            ok()
        }
        ("-C", [chain, spec @ ..]) => match kernel.chains.get(&key(chain)) {
            Some(rules) if rules.contains(&spec.join(" ")) => ok(),
            Some(_) => fail(1, "iptables: Bad rule (does a matching rule exist in that chain?)."),
            None => fail(1, "iptables: No chain/target/match by that name."),
        },
        ("-I", [chain, position, spec @ ..]) => {
            let Ok(position) = position.parse::<usize>() else {
                return fail(2, "iptables: bad position");
            };
            match kernel.chains.get_mut(&key(chain)) {
                Some(rules) => {
                    let index = (position - 1).min(rules.len());
                    rules.insert(index, spec.join(" "));
                    ok()
                }
                None => fail(1, "iptables: No chain/target/match by that name."),
            }
        }
        ("-A", [chain, spec @ ..]) => match kernel.chains.get_mut(&key(chain)) {
            Some(rules) => {
                rules.push(spec.join(" "));
                ok()
            }
            None => fail(1, "iptables: No chain/target/match by that name."),
        },
        ("-D", [chain, spec @ ..]) => {
            let joined = spec.join(" ");
            match kernel.chains.get_mut(&key(chain)) {
                Some(rules) => match rules.iter().position(|r| *r == joined) {
                    Some(index) => {
                        rules.remove(index);
                        ok()
                    }
                    None => fail(1, "iptables: Bad rule (does a matching rule exist in that chain?)."),
                },
                None => fail(1, "iptables: No chain/target/match by that name."),
            }
        }
        _ => fail(2, "iptables: unsupported invocation"),
    }
}

fn ipset(kernel: &mut FakeKernel, args: &[String]) -> CommandOutput {
    let strs: Vec<&str> = args.iter().map(String::as_str).collect();
    match strs.as_slice() {
        ["list", "-n", name] => {
            if kernel.sets.contains_key(*name) {
                ok_stdout(format!("{name}\n"))
            } else {
                fail(1, &format!("ipset v7.11: The set with the given name does not exist: {name}"))
            }
        }
        ["create", name, "hash:ip"] => {
            if kernel.sets.contains_key(*name) {
                return fail(1, "ipset v7.11: Set cannot be created: set with the same name already exists");
            }
            kernel.sets.insert((*name).into(), BTreeSet::new());
            ok()
        }
        ["save", name] => match kernel.sets.get(*name) {
            Some(members) => {
                let mut out = format!("create {name} hash:ip family inet hashsize 1024 maxelem 65536\n");
                for member in members {
                    out.push_str(&format!("add {name} {member}\n"));
                }
                ok_stdout(out)
            }
            None => fail(1, "ipset v7.11: The set with the given name does not exist"),
        },
        ["add", "-exist", name, ip] => match kernel.sets.get_mut(*name) {
            Some(members) => {
                members.insert((*ip).into());
                ok()
            }
            None => fail(1, "ipset v7.11: The set with the given name does not exist"),
        },
        ["del", "-exist", name, ip] => match kernel.sets.get_mut(*name) {
            Some(members) => {
                members.remove(*ip);
                ok()
            }
            None => fail(1, "ipset v7.11: The set with the given name does not exist"),
        },
        ["destroy", name] => {
            if kernel.sets.remove(*name).is_none() {
                return fail(1, "ipset v7.11: The set with the given name does not exist");
            }
            ok()
        }
        _ => fail(2, "ipset: unsupported invocation"),
    }
}

fn ip(kernel: &mut FakeKernel, args: &[String]) -> CommandOutput {
    let strs: Vec<&str> = args.iter().map(String::as_str).collect();
    match strs.as_slice() {
        ["-j", "rule", "list"] => {
            let entries: Vec<serde_json::Value> = kernel
                .policy_rules
                .iter()
                .map(|(priority, fwmark, table)| {
                    serde_json::json!({
                        "priority": priority,
                        "src": "all",
                        "fwmark": format!("{fwmark:#x}"),
                        "table": table,
                    })
                })
                .collect();
            ok_stdout(serde_json::to_string(&entries).unwrap_or_default())
        }
        ["rule", "add", "prio", priority, "fwmark", fwmark, "table", table] => {
            let (Ok(priority), Ok(fwmark)) = (priority.parse(), fwmark.parse()) else {
                return fail(2, "ip: invalid rule arguments");
            };
            kernel.policy_rules.push((priority, fwmark, (*table).into()));
            ok()
        }
        ["-j", "route", "list", "table", table] => {
            let Ok(table) = table.parse::<u32>() else {
                return fail(2, "ip: invalid table");
            };
            let entries: Vec<serde_json::Value> = kernel
                .routes
                .get(&table)
                .map(|routes| {
                    routes
                        .iter()
                        .map(|(dst, dev)| serde_json::json!({"dst": dst, "dev": dev, "flags": []}))
                        .collect()
                })
                .unwrap_or_default();
            ok_stdout(serde_json::to_string(&entries).unwrap_or_default())
        }
        ["route", op @ ("add" | "replace"), dst, "dev", dev, "table", table] => {
            let Ok(table) = table.parse::<u32>() else {
                return fail(2, "ip: invalid table");
            };
            let routes = kernel.routes.entry(table).or_default();
            let existing = routes.iter().position(|(d, _)| d == dst);
            match (op, existing) {
                (&"add", Some(_)) => fail(2, "RTNETLINK answers: File exists"),
                (_, Some(index)) => {
                    routes[index] = ((*dst).into(), (*dev).into());
                    ok()
                }
                (_, None) => {
                    routes.push(((*dst).into(), (*dev).into()));
                    ok()
                }
            }
        }
        ["route", "del", dst, "table", table] => {
            let Ok(table) = table.parse::<u32>() else {
                return fail(2, "ip: invalid table");
            };
            let routes = kernel.routes.entry(table).or_default();
            match routes.iter().position(|(d, _)| d == dst) {
                Some(index) => {
                    routes.remove(index);
                    ok()
                }
                None => fail(2, "RTNETLINK answers: No such process"),
            }
        }
        ["link", "show", name] => {
            if kernel.links.contains(*name) {
                ok_stdout(format!("4: {name}: <POINTOPOINT,NOARP> mtu 1476\n"))
            } else {
                fail(1, &format!("Device \"{name}\" does not exist."))
            }
        }
        ["tunnel", "add", name, "mode", "gre", "remote", _, "local", _] => {
            if kernel.links.contains(*name) {
                return fail(1, "add tunnel \"gre0\" failed: File exists");
            }
            kernel.links.insert((*name).into());
            ok()
        }
        ["link", "set", "up", name] => {
            if !kernel.links.contains(*name) {
                return fail(1, &format!("Device \"{name}\" does not exist."));
            }
            kernel.links_up.insert((*name).into());
            ok()
        }
        ["-j", "addr", "show"] => {
            let mut by_iface: BTreeMap<String, Vec<serde_json::Value>> = BTreeMap::new();
            for (iface, addr, prefixlen) in &kernel.base_addrs {
                by_iface.entry(iface.clone()).or_default().push(
                    serde_json::json!({"family": "inet", "local": addr, "prefixlen": prefixlen}),
                );
            }
            for (iface, addr) in &kernel.extra_addrs {
                by_iface.entry(iface.clone()).or_default().push(
                    serde_json::json!({"family": "inet", "local": addr, "prefixlen": 32}),
                );
            }
            let entries: Vec<serde_json::Value> = by_iface
                .into_iter()
                .map(|(ifname, addr_info)| serde_json::json!({"ifname": ifname, "addr_info": addr_info}))
                .collect();
            ok_stdout(serde_json::to_string(&entries).unwrap_or_default())
        }
        ["addr", "add", cidr, "dev", iface] => {
            let Some(addr) = cidr.strip_suffix("/32") else {
                return fail(2, "ip: only /32 host addresses are simulated");
            };
            kernel.extra_addrs.push(((*iface).into(), addr.into()));
            ok()
        }
        ["addr", "del", cidr, "dev", iface] => {
            let Some(addr) = cidr.strip_suffix("/32") else {
                return fail(2, "ip: only /32 host addresses are simulated");
            };
            match kernel
                .extra_addrs
                .iter()
                .position(|(i, a)| i == iface && a == addr)
            {
                Some(index) => {
                    kernel.extra_addrs.remove(index);
                    ok()
                }
                None => fail(2, "RTNETLINK answers: Cannot assign requested address"),
            }
        }
        _ => fail(2, "ip: unsupported invocation"),
    }
}
