use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use serde::Deserialize;

use super::{Commander, DataplaneError, Result, run_checked};

const IP_BIN: &str = "ip";

/// Secondary-address management: hosting an egress IP on the gateway's
/// interface so the kernel answers for it.
#[derive(Clone)]
pub struct Addresses<C> {
    commander: C,
}

#[derive(Deserialize)]
struct IfaceEntry {
    ifname: String,
    #[serde(default)]
    addr_info: Vec<AddrInfo>,
}

#[derive(Deserialize)]
struct AddrInfo {
    family: Option<String>,
    local: Option<String>,
    prefixlen: Option<u8>,
}

impl<C: Commander + Sync> Addresses<C> {
    pub fn new(commander: C) -> Self {
        Self { commander }
    }

    async fn interfaces(&self) -> Result<Vec<IfaceEntry>> {
        let out = run_checked(
            &self.commander,
            IP_BIN,
            &["-j".into(), "addr".into(), "show".into()],
            "list addresses",
        )
        .await?;
        parse_interfaces(&out.stdout)
    }

    /// The interface whose configured subnet contains `ip`, if any.
    pub async fn interface_for_network(&self, ip: Ipv4Addr) -> Result<Option<String>> {
        Ok(find_interface_for_network(&self.interfaces().await?, ip))
    }

    /// The interface already carrying `ip` as one of its addresses, if any.
    pub async fn interface_holding(&self, ip: Ipv4Addr) -> Result<Option<String>> {
        Ok(find_interface_holding(&self.interfaces().await?, ip))
    }

    pub async fn ensure_secondary(&self, iface: &str, ip: Ipv4Addr) -> Result<()> {
        if self.interface_holding(ip).await?.is_some() {
            return Ok(());
        }
        run_checked(
            &self.commander,
            IP_BIN,
            &[
                "addr".into(),
                "add".into(),
                format!("{ip}/32"),
                "dev".into(),
                iface.into(),
            ],
            &format!("add address {ip} to {iface}"),
        )
        .await?;
        Ok(())
    }

    pub async fn remove_secondary(&self, ip: Ipv4Addr) -> Result<()> {
        let Some(iface) = self.interface_holding(ip).await? else {
            return Ok(());
        };
        run_checked(
            &self.commander,
            IP_BIN,
            &[
                "addr".into(),
                "del".into(),
                format!("{ip}/32"),
                "dev".into(),
                iface.clone(),
            ],
            &format!("remove address {ip} from {iface}"),
        )
        .await?;
        Ok(())
    }
}

fn parse_interfaces(json: &str) -> Result<Vec<IfaceEntry>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(json)
        .map_err(|e| DataplaneError::Invalid(format!("parse ip addr show: {e}")))
}

fn find_interface_for_network(interfaces: &[IfaceEntry], ip: Ipv4Addr) -> Option<String> {
    for iface in interfaces {
        if iface.ifname == "lo" {
            continue;
        }
        for addr in &iface.addr_info {
            if addr.family.as_deref() != Some("inet") {
                continue;
            }
            let (Some(local), Some(prefixlen)) = (addr.local.as_deref(), addr.prefixlen) else {
                continue;
            };
            let Ok(local) = local.parse::<Ipv4Addr>() else {
                continue;
            };
            // A host address is not a subnet to join.
            if prefixlen >= 32 {
                continue;
            }
            if let Ok(net) = Ipv4Network::new(local, prefixlen)
                && net.contains(ip)
            {
                return Some(iface.ifname.clone());
            }
        }
    }
    None
}

fn find_interface_holding(interfaces: &[IfaceEntry], ip: Ipv4Addr) -> Option<String> {
    for iface in interfaces {
        for addr in &iface.addr_info {
            if addr.family.as_deref() == Some("inet")
                && addr.local.as_deref() == Some(ip.to_string().as_str())
            {
                return Some(iface.ifname.clone());
            }
        }
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;

    const ADDR_SHOW: &str = r#"[
        {"ifname":"lo","addr_info":[{"family":"inet","local":"127.0.0.1","prefixlen":8}]},
        {"ifname":"eth0","addr_info":[
            {"family":"inet","local":"198.51.100.9","prefixlen":24},
            {"family":"inet6","local":"fe80::1","prefixlen":64}
        ]},
        {"ifname":"eth1","addr_info":[{"family":"inet","local":"10.0.0.9","prefixlen":16}]}
    ]"#;

    #[test]
    fn test_interface_for_network() {
        let interfaces = parse_interfaces(ADDR_SHOW).unwrap();
        assert_eq!(
            find_interface_for_network(&interfaces, "198.51.100.7".parse().unwrap()),
            Some("eth0".into())
        );
        assert_eq!(
            find_interface_for_network(&interfaces, "10.0.42.1".parse().unwrap()),
            Some("eth1".into())
        );
        assert_eq!(
            find_interface_for_network(&interfaces, "192.0.2.1".parse().unwrap()),
            None
        );
    }

    #[test]
    fn test_interface_holding() {
        let interfaces = parse_interfaces(ADDR_SHOW).unwrap();
        assert_eq!(
            find_interface_holding(&interfaces, "10.0.0.9".parse().unwrap()),
            Some("eth1".into())
        );
        assert_eq!(
            find_interface_holding(&interfaces, "198.51.100.7".parse().unwrap()),
            None
        );
    }
}
