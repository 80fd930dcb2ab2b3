use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use super::{Commander, DataplaneError, Result, argv, run_checked};

const IPSET_BIN: &str = "ipset";
const SET_TYPE: &str = "hash:ip";

/// Kernel IP set management. One set exists per rule, named by the rule ID,
/// and its membership mirrors the pod IPs behind the rule's service.
#[derive(Clone)]
pub struct IpSet<C> {
    commander: C,
}

impl<C: Commander + Sync> IpSet<C> {
    pub fn new(commander: C) -> Self {
        Self { commander }
    }

    pub async fn set_exists(&self, name: &str) -> Result<bool> {
        let out = self
            .commander
            .output(IPSET_BIN, &argv(&["list", "-n", name]))
            .await?;
        if out.success() {
            return Ok(true);
        }
        match DataplaneError::from_output(&format!("list set {name}"), &out) {
            e @ DataplaneError::Denied(_) => Err(e),
            _ => Ok(false),
        }
    }

    pub async fn ensure_set(&self, name: &str) -> Result<()> {
        if self.set_exists(name).await? {
            return Ok(());
        }
        run_checked(
            &self.commander,
            IPSET_BIN,
            &argv(&["create", name, SET_TYPE]),
            &format!("create set {name}"),
        )
        .await?;
        Ok(())
    }

    pub async fn members(&self, name: &str) -> Result<BTreeSet<Ipv4Addr>> {
        let out = run_checked(
            &self.commander,
            IPSET_BIN,
            &argv(&["save", name]),
            &format!("save set {name}"),
        )
        .await?;
        Ok(parse_saved_members(&out.stdout, name))
    }

    /// Converges the set onto `desired`: creates it when missing, adds new
    /// members, removes stale ones. The set is created even when `desired`
    /// is empty so that deletion stays symmetric.
    pub async fn sync_members(&self, name: &str, desired: &[Ipv4Addr]) -> Result<()> {
        self.ensure_set(name).await?;
        let current = self.members(name).await?;
        let desired: BTreeSet<Ipv4Addr> = desired.iter().copied().collect();

        for ip in desired.difference(&current) {
            run_checked(
                &self.commander,
                IPSET_BIN,
                &argv(&["add", "-exist", name, &ip.to_string()]),
                &format!("add {ip} to set {name}"),
            )
            .await?;
        }
        for ip in current.difference(&desired) {
            run_checked(
                &self.commander,
                IPSET_BIN,
                &argv(&["del", "-exist", name, &ip.to_string()]),
                &format!("remove {ip} from set {name}"),
            )
            .await?;
        }
        Ok(())
    }

    pub async fn destroy_if_present(&self, name: &str) -> Result<()> {
        if !self.set_exists(name).await? {
            return Ok(());
        }
        run_checked(
            &self.commander,
            IPSET_BIN,
            &argv(&["destroy", name]),
            &format!("destroy set {name}"),
        )
        .await?;
        Ok(())
    }
}

// `ipset save` emits one `add <set> <ip>` line per member.
fn parse_saved_members(stdout: &str, name: &str) -> BTreeSet<Ipv4Addr> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next(), parts.next()) {
                (Some("add"), Some(set), Some(ip)) if set == name => ip.parse().ok(),
                _ => None,
            }
        })
        .collect()
}
