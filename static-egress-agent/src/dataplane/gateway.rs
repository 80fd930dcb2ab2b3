use std::net::Ipv4Addr;

use tracing::{debug, info, warn};

use super::addr::Addresses;
use super::ipset::IpSet;
use super::iptables::Iptables;
use super::{
    Commander, Programmer, Result, STATIC_EGRESS_FWMARK, argv, normalize_destination,
};

const FORWARD_CHAIN: &str = "STATIC-EGRESS-FORWARD-CHAIN";
const NAT_CHAIN: &str = "STATIC-EGRESS-NAT-CHAIN";

/// Programs the gateway node: matching flows forwarded from directors are
/// allowed through, SNATed to the egress IP, and the return flow is marked
/// so policy routing keeps it symmetric.
#[derive(Clone)]
pub struct EgressGateway<C> {
    iptables: Iptables<C>,
    ipset: IpSet<C>,
    addresses: Addresses<C>,
}

impl<C: Commander + Clone + Send + Sync> EgressGateway<C> {
    pub fn new(commander: C) -> Self {
        Self {
            iptables: Iptables::new(commander.clone()),
            ipset: IpSet::new(commander.clone()),
            addresses: Addresses::new(commander),
        }
    }
}

fn forward_spec(rule_id: &str, destination: &str) -> Vec<String> {
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

fn snat_spec(rule_id: &str, destination: &str, egress_ip: Ipv4Addr) -> Vec<String> {
    argv(&[
        "-m",
        "set",
        "--match-set",
        rule_id,
        "src",
        "-d",
        destination,
        "-j",
        "SNAT",
        "--to-source",
        &egress_ip.to_string(),
    ])
}

fn return_mark_spec(destination: &str, egress_ip: Ipv4Addr) -> Vec<String> {
    argv(&[
        "-s",
        destination,
        "-d",
        &egress_ip.to_string(),
        "-j",
        "MARK",
        "--set-mark",
        &STATIC_EGRESS_FWMARK.to_string(),
    ])
}

impl<C: Commander + Clone + Send + Sync> Programmer for EgressGateway<C> {
    /// One-time node preparation: the forward-allow chain at the end of
    /// filter/FORWARD and the SNAT chain ahead of everything else in
    /// nat/POSTROUTING.
    async fn setup(&self) -> Result<()> {
        self.iptables.ensure_chain("filter", FORWARD_CHAIN).await?;
        self.iptables
            .append_unique("filter", "FORWARD", &argv(&["-j", FORWARD_CHAIN]))
            .await?;
        self.iptables.ensure_chain("nat", NAT_CHAIN).await?;
        self.iptables
            .insert_unique("nat", "POSTROUTING", 1, &argv(&["-j", NAT_CHAIN]))
            .await?;
        info!("node prepared for egress gateway duty");
        Ok(())
    }

    async fn program(
        &self,
        rule_id: &str,
        source_ips: &[Ipv4Addr],
        destination: &str,
        egress_ip: Ipv4Addr,
    ) -> Result<()> {
        let destination = normalize_destination(destination)?;

        self.ipset.sync_members(rule_id, source_ips).await?;
        self.iptables
            .append_unique("filter", FORWARD_CHAIN, &forward_spec(rule_id, &destination))
            .await?;
        self.iptables
            .insert_unique("nat", NAT_CHAIN, 1, &snat_spec(rule_id, &destination, egress_ip))
            .await?;
        self.iptables
            .insert_unique(
                "mangle",
                "PREROUTING",
                1,
                &return_mark_spec(&destination, egress_ip),
            )
            .await?;

        // Host the egress IP locally when an interface's subnet covers it;
        // otherwise it must already be routed to this node.
        match self.addresses.interface_for_network(egress_ip).await? {
            Some(iface) => self.addresses.ensure_secondary(&iface, egress_ip).await?,
            None => warn!(
                "no local subnet covers egress IP {}; assuming it is routed here",
                egress_ip
            ),
        }

        debug!("snat to {} installed for rule {}", egress_ip, rule_id);
        Ok(())
    }

    async fn unprogram(
        &self,
        rule_id: &str,
        destination: &str,
        egress_ip: Option<Ipv4Addr>,
    ) -> Result<()> {
        let destination = normalize_destination(destination)?;

        if let Some(egress_ip) = egress_ip {
            self.iptables
                .delete_if_present("nat", NAT_CHAIN, &snat_spec(rule_id, &destination, egress_ip))
                .await?;
            self.iptables
                .delete_if_present(
                    "mangle",
                    "PREROUTING",
                    &return_mark_spec(&destination, egress_ip),
                )
                .await?;
            self.addresses.remove_secondary(egress_ip).await?;
        } else {
            warn!(
                "no egress IP recorded for rule {}; leaving SNAT entries for manual cleanup",
                rule_id
            );
        }
        self.iptables
            .delete_if_present("filter", FORWARD_CHAIN, &forward_spec(rule_id, &destination))
            .await?;
        self.ipset.destroy_if_present(rule_id).await?;

        debug!("removed snat programming for rule {}", rule_id);
        Ok(())
    }

    async fn sweep(&self, _live_destinations: &[String]) -> Result<()> {
        Ok(())
    }
}
