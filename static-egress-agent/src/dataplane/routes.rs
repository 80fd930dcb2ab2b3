use std::path::PathBuf;

use serde::Deserialize;

use super::{Commander, DataplaneError, Result, normalize_destination, run_checked};

const IP_BIN: &str = "ip";
const RT_TABLES_PATH: &str = "/etc/iproute2/rt_tables";

/// Policy routing: the alternate routing-table registry, the fwmark rule
/// selecting it, and the routes inside it.
#[derive(Clone)]
pub struct Routes<C> {
    commander: C,
    rt_tables: PathBuf,
}

#[derive(Deserialize)]
struct IpRuleEntry {
    fwmark: Option<String>,
    table: Option<String>,
}

#[derive(Deserialize)]
struct IpRouteEntry {
    dst: Option<String>,
    dev: Option<String>,
}

impl<C: Commander + Sync> Routes<C> {
    pub fn new(commander: C) -> Self {
        Self {
            commander,
            rt_tables: RT_TABLES_PATH.into(),
        }
    }

    #[cfg(test)]
    pub fn with_rt_tables_path(commander: C, rt_tables: PathBuf) -> Self {
        Self {
            commander,
            rt_tables,
        }
    }

    /// Registers `<id> <name>` in the routing-table registry file, once.
    pub async fn ensure_routing_table(&self, id: u32, name: &str) -> Result<()> {
        let contents = match tokio::fs::read_to_string(&self.rt_tables).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        if table_registered(&contents, id, name) {
            return Ok(());
        }
        let mut updated = contents;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str(&format!("{id} {name}\n"));
        tokio::fs::write(&self.rt_tables, updated).await?;
        Ok(())
    }

    /// Ensures the policy rule `fwmark <mark> lookup <table>` at `priority`.
    /// Presence is decided structurally from `ip -j rule list` (matching on
    /// fwmark and table), never by searching for the table name in the
    /// listing text.
    pub async fn ensure_rule(
        &self,
        priority: u32,
        fwmark: u32,
        table_id: u32,
        table_name: &str,
    ) -> Result<()> {
        let out = run_checked(
            &self.commander,
            IP_BIN,
            &["-j".into(), "rule".into(), "list".into()],
            "list policy rules",
        )
        .await?;
        if rule_present(&out.stdout, fwmark, table_id, table_name)? {
            return Ok(());
        }
        run_checked(
            &self.commander,
            IP_BIN,
            &[
                "rule".into(),
                "add".into(),
                "prio".into(),
                priority.to_string(),
                "fwmark".into(),
                fwmark.to_string(),
                "table".into(),
                table_id.to_string(),
            ],
            "add policy rule",
        )
        .await?;
        Ok(())
    }

    pub async fn routes_in_table(&self, table_id: u32) -> Result<Vec<(String, Option<String>)>> {
        let out = run_checked(
            &self.commander,
            IP_BIN,
            &[
                "-j".into(),
                "route".into(),
                "list".into(),
                "table".into(),
                table_id.to_string(),
            ],
            "list routes",
        )
        .await?;
        parse_routes(&out.stdout)
    }

    /// The table's route for `destination`: `None` when absent, else the
    /// device it points at.
    pub async fn route_entry(
        &self,
        table_id: u32,
        destination: &str,
    ) -> Result<Option<Option<String>>> {
        let wanted = normalize_destination(destination)?;
        for (dst, dev) in self.routes_in_table(table_id).await? {
            if normalize_destination(&dst)? == wanted {
                return Ok(Some(dev));
            }
        }
        Ok(None)
    }

    /// Routes `destination` out of `device` in the table; replaces the route
    /// when it currently points at a different device (gateway moved).
    pub async fn ensure_route_dev(
        &self,
        destination: &str,
        device: &str,
        table_id: u32,
    ) -> Result<()> {
        let dest = normalize_destination(destination)?;
        let op = match self.route_entry(table_id, &dest).await? {
            Some(Some(current)) if current == device => return Ok(()),
            Some(_) => "replace",
            None => "add",
        };
        run_checked(
            &self.commander,
            IP_BIN,
            &[
                "route".into(),
                op.into(),
                dest.clone(),
                "dev".into(),
                device.into(),
                "table".into(),
                table_id.to_string(),
            ],
            &format!("{op} route {dest}"),
        )
        .await?;
        Ok(())
    }

    pub async fn delete_route_if_present(&self, destination: &str, table_id: u32) -> Result<()> {
        let dest = normalize_destination(destination)?;
        if self.route_entry(table_id, &dest).await?.is_none() {
            return Ok(());
        }
        run_checked(
            &self.commander,
            IP_BIN,
            &[
                "route".into(),
                "del".into(),
                dest.clone(),
                "table".into(),
                table_id.to_string(),
            ],
            &format!("delete route {dest}"),
        )
        .await?;
        Ok(())
    }
}

fn table_registered(contents: &str, id: u32, name: &str) -> bool {
    contents.lines().any(|line| {
        let mut parts = line.split_whitespace();
        parts.next() == Some(id.to_string().as_str()) && parts.next() == Some(name)
    })
}

fn rule_present(json: &str, fwmark: u32, table_id: u32, table_name: &str) -> Result<bool> {
    if json.trim().is_empty() {
        return Ok(false);
    }
    let entries: Vec<IpRuleEntry> = serde_json::from_str(json)
        .map_err(|e| DataplaneError::Invalid(format!("parse ip rule list: {e}")))?;
    Ok(entries.iter().any(|entry| {
        let mark_matches = entry
            .fwmark
            .as_deref()
            .and_then(parse_fwmark)
            .is_some_and(|mark| mark == fwmark);
        let table_matches = entry
            .table
            .as_deref()
            .is_some_and(|t| t == table_id.to_string() || t == table_name);
        mark_matches && table_matches
    }))
}

// `ip -j rule list` prints fwmarks in hex.
fn parse_fwmark(raw: &str) -> Option<u32> {
    match raw.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => raw.parse().ok(),
    }
}

fn parse_routes(json: &str) -> Result<Vec<(String, Option<String>)>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let entries: Vec<IpRouteEntry> = serde_json::from_str(json)
        .map_err(|e| DataplaneError::Invalid(format!("parse ip route list: {e}")))?;
    Ok(entries
        .into_iter()
        .filter_map(|entry| entry.dst.map(|dst| (dst, entry.dev)))
        .collect())
}
