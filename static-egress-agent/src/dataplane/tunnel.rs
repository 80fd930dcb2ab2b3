use std::net::Ipv4Addr;

use super::{Commander, DataplaneError, Result, run_checked};

const IP_BIN: &str = "ip";

/// Name a tunnel after its remote endpoint: `10.0.0.9` becomes `tun10009`.
pub fn tunnel_name(remote: Ipv4Addr) -> String {
    format!("tun{}", remote.to_string().replace('.', ""))
}

/// GRE tunnels from a director toward the gateway. One tunnel per gateway,
/// shared by every rule pointing at it.
#[derive(Clone)]
pub struct Tunnels<C> {
    commander: C,
}

impl<C: Commander + Sync> Tunnels<C> {
    pub fn new(commander: C) -> Self {
        Self { commander }
    }

    pub async fn link_exists(&self, name: &str) -> Result<bool> {
        let out = self
            .commander
            .output(IP_BIN, &["link".into(), "show".into(), name.into()])
            .await?;
        if out.success() {
            return Ok(true);
        }
        match DataplaneError::from_output(&format!("show link {name}"), &out) {
            e @ DataplaneError::Denied(_) => Err(e),
            _ => Ok(false),
        }
    }

    /// Creates the GRE tunnel to `remote` when missing and brings it up.
    /// Returns the interface name.
    pub async fn ensure_gre(&self, remote: Ipv4Addr, local: Ipv4Addr) -> Result<String> {
        let name = tunnel_name(remote);
        if !self.link_exists(&name).await? {
            run_checked(
                &self.commander,
                IP_BIN,
                &[
                    "tunnel".into(),
                    "add".into(),
                    name.clone(),
                    "mode".into(),
                    "gre".into(),
                    "remote".into(),
                    remote.to_string(),
                    "local".into(),
                    local.to_string(),
                ],
                &format!("create tunnel {name}"),
            )
            .await?;
        }
        run_checked(
            &self.commander,
            IP_BIN,
            &["link".into(), "set".into(), "up".into(), name.clone()],
            &format!("bring up {name}"),
        )
        .await?;
        Ok(name)
    }
}
