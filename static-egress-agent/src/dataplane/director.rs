use std::net::Ipv4Addr;

use tracing::{debug, info};

use super::ipset::IpSet;
use super::iptables::Iptables;
use super::routes::Routes;
use super::tunnel::Tunnels;
use super::{
    Commander, Programmer, Result, STATIC_EGRESS_FWMARK, argv, normalize_destination,
};

pub(crate) const ROUTE_TABLE_ID: u32 = 99;
pub(crate) const ROUTE_TABLE_NAME: &str = "kube-static-egress-ip";
const RULE_PRIORITY: u32 = 32764;
const BYPASS_CNI_CHAIN: &str = "STATIC-EGRESS-BYPASS-CNI";

/// Programs a non-gateway node: matching flows are marked, kept clear of
/// the CNI masquerade, and routed through a GRE tunnel to the gateway.
#[derive(Clone)]
pub struct EgressDirector<C> {
    iptables: Iptables<C>,
    ipset: IpSet<C>,
    routes: Routes<C>,
    tunnels: Tunnels<C>,
    node_ip: Ipv4Addr,
}

impl<C: Commander + Clone + Send + Sync> EgressDirector<C> {
    pub fn new(commander: C, node_ip: Ipv4Addr) -> Self {
        Self {
            iptables: Iptables::new(commander.clone()),
            ipset: IpSet::new(commander.clone()),
            routes: Routes::new(commander.clone()),
            tunnels: Tunnels::new(commander),
            node_ip,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_routes(commander: C, node_ip: Ipv4Addr, routes: Routes<C>) -> Self {
        Self {
            iptables: Iptables::new(commander.clone()),
            ipset: IpSet::new(commander.clone()),
            routes,
            tunnels: Tunnels::new(commander),
            node_ip,
        }
    }
}

fn mark_spec(rule_id: &str, destination: &str) -> Vec<String> {
    argv(&[
        "-m",
        "set",
        "--match-set",
        rule_id,
        "src",
        "-d",
        destination,
        "-j",
        "MARK",
        "--set-mark",
        &STATIC_EGRESS_FWMARK.to_string(),
    ])
}

fn bypass_spec(rule_id: &str, destination: &str) -> Vec<String> {
    argv(&[
        "-m",
        "set",
        "--match-set",
        rule_id,
        "src",
        "-d",
        destination,
        "-j",
        "ACCEPT",
    ])
}

impl<C: Commander + Clone + Send + Sync> Programmer for EgressDirector<C> {
    /// One-time node preparation: the custom routing table, the fwmark
    /// policy rule selecting it, and the bypass chain running ahead of any
    /// CNI masquerade in nat/POSTROUTING.
    async fn setup(&self) -> Result<()> {
        self.routes
            .ensure_routing_table(ROUTE_TABLE_ID, ROUTE_TABLE_NAME)
            .await?;
        self.routes
            .ensure_rule(
                RULE_PRIORITY,
                STATIC_EGRESS_FWMARK,
                ROUTE_TABLE_ID,
                ROUTE_TABLE_NAME,
            )
            .await?;
        self.iptables.ensure_chain("nat", BYPASS_CNI_CHAIN).await?;
        self.iptables
            .insert_unique("nat", "POSTROUTING", 1, &argv(&["-j", BYPASS_CNI_CHAIN]))
            .await?;
        info!("node prepared for egress director duty");
        Ok(())
    }

    async fn program(
        &self,
        rule_id: &str,
        source_ips: &[Ipv4Addr],
        destination: &str,
        gateway_ip: Ipv4Addr,
    ) -> Result<()> {
        let destination = normalize_destination(destination)?;

        self.ipset.sync_members(rule_id, source_ips).await?;
        self.iptables
            .insert_unique("mangle", "PREROUTING", 1, &mark_spec(rule_id, &destination))
            .await?;
        self.iptables
            .append_unique("nat", BYPASS_CNI_CHAIN, &bypass_spec(rule_id, &destination))
            .await?;

        let tunnel = self.tunnels.ensure_gre(gateway_ip, self.node_ip).await?;
        self.routes
            .ensure_route_dev(&destination, &tunnel, ROUTE_TABLE_ID)
            .await?;

        debug!(
            "routing {} via {} for rule {}",
            destination, tunnel, rule_id
        );
        Ok(())
    }

    async fn unprogram(
        &self,
        rule_id: &str,
        destination: &str,
        _gateway_ip: Option<Ipv4Addr>,
    ) -> Result<()> {
        let destination = normalize_destination(destination)?;

        // Mirror of program, in reverse; the set goes last. The tunnel is
        // shared across rules and stays.
        self.routes
            .delete_route_if_present(&destination, ROUTE_TABLE_ID)
            .await?;
        self.iptables
            .delete_if_present("nat", BYPASS_CNI_CHAIN, &bypass_spec(rule_id, &destination))
            .await?;
        self.iptables
            .delete_if_present("mangle", "PREROUTING", &mark_spec(rule_id, &destination))
            .await?;
        self.ipset.destroy_if_present(rule_id).await?;

        debug!("removed egress routing for rule {}", rule_id);
        Ok(())
    }

    /// Drops routes in the custom table whose destination no declared rule
    /// covers anymore.
    async fn sweep(&self, live_destinations: &[String]) -> Result<()> {
        let mut live = Vec::with_capacity(live_destinations.len());
        for dest in live_destinations {
            live.push(normalize_destination(dest)?);
        }
        for (dst, _) in self.routes.routes_in_table(ROUTE_TABLE_ID).await? {
            let dst = normalize_destination(&dst)?;
            if !live.contains(&dst) {
                info!("removing stale egress route {}", dst);
                self.routes
                    .delete_route_if_present(&dst, ROUTE_TABLE_ID)
                    .await?;
            }
        }
        Ok(())
    }
}
