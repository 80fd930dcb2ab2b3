pub mod controllers;

use std::net::Ipv4Addr;

use http::Uri;
use k8s_openapi::api::core::v1::Node;
use kube::config::KubeConfigOptions;
use kube::{Api, Client, ResourceExt};

use crate::config::ControllerArgs;
use crate::{Error, Result};

/// Presence marks the node as the egress gateway; a non-empty value
/// overrides the node's primary IP as the advertised tunnel endpoint.
pub const GATEWAY_ANNOTATION: &str = "nirmata.io/staticegressips-gateway";

/// Role a node plays for egress traffic, derived once at startup from the
/// gateway annotation and fixed for the process lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeRole {
    Director,
    Gateway,
}

pub async fn build_client(args: &ControllerArgs) -> Result<Client> {
    let mut config = if let Some(path) = &args.kubeconfig {
        let kubeconfig = kube::config::Kubeconfig::read_from(path)?;
        kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?
    } else {
        kube::Config::infer().await?
    };
    if let Some(master) = &args.master {
        config.cluster_url = master.parse::<Uri>()?;
    }
    Ok(Client::try_from(config)?)
}

pub async fn get_node(client: Client, name: &str) -> Result<Node> {
    let api: Api<Node> = Api::all(client);
    match api.get(name).await {
        Ok(node) => Ok(node),
        Err(kube::Error::Api(e)) if e.code == 404 => Err(Error::NodeNotFound(name.into())),
        Err(e) => Err(e.into()),
    }
}

pub fn node_role(node: &Node) -> NodeRole {
    if node.annotations().contains_key(GATEWAY_ANNOTATION) {
        NodeRole::Gateway
    } else {
        NodeRole::Director
    }
}

/// Primary IPv4 address of a node: first InternalIP, else first ExternalIP.
pub fn node_ip(node: &Node) -> Option<Ipv4Addr> {
    let addresses = node.status.as_ref()?.addresses.as_ref()?;
    for wanted in ["InternalIP", "ExternalIP"] {
        for addr in addresses {
            if addr.type_ == wanted
                && let Ok(ip) = addr.address.parse()
            {
                return Some(ip);
            }
        }
    }
    None
}

pub fn node_ready(node: &Node) -> bool {
    let Some(conditions) = node.status.as_ref().and_then(|s| s.conditions.as_ref()) else {
        return false;
    };
    conditions
        .iter()
        .any(|c| c.type_ == "Ready" && c.status == "True")
}

/// Scans the cluster for the annotated gateway node: a non-empty annotation
/// value wins, else the node's primary IP.
pub fn lookup_gateway_ip(nodes: &[Node]) -> Option<Ipv4Addr> {
    for node in nodes {
        let Some(value) = node.annotations().get(GATEWAY_ANNOTATION) else {
            continue;
        };
        if !value.is_empty() {
            return value.parse().ok();
        }
        return node_ip(node);
    }
    None
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::{NodeAddress, NodeStatus};
    use kube::api::ObjectMeta;

    use super::*;

    fn make_node(name: &str, annotation: Option<&str>, addresses: &[(&str, &str)]) -> Node {
        let mut annotations = BTreeMap::new();
        if let Some(value) = annotation {
            annotations.insert(GATEWAY_ANNOTATION.into(), value.into());
        }
        Node {
            metadata: ObjectMeta {
                name: Some(name.into()),
                annotations: Some(annotations),
                ..Default::default()
            },
            status: Some(NodeStatus {
                addresses: Some(
                    addresses
                        .iter()
                        .map(|(type_, address)| NodeAddress {
                            type_: (*type_).into(),
                            address: (*address).into(),
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_node_ip_prefers_internal() {
        let node = make_node(
            "n1",
            None,
            &[("ExternalIP", "198.51.100.20"), ("InternalIP", "10.0.0.5")],
        );
        assert_eq!(node_ip(&node), Some("10.0.0.5".parse().unwrap()));
    }

    #[test]
    fn test_node_ip_falls_back_to_external() {
        let node = make_node(
            "n1",
            None,
            &[("Hostname", "n1"), ("ExternalIP", "198.51.100.20")],
        );
        assert_eq!(node_ip(&node), Some("198.51.100.20".parse().unwrap()));
    }

    #[test]
    fn test_node_role_from_annotation() {
        assert_eq!(
            node_role(&make_node("n1", Some(""), &[])),
            NodeRole::Gateway
        );
        assert_eq!(node_role(&make_node("n2", None, &[])), NodeRole::Director);
    }

    #[test]
    fn test_lookup_gateway_ip_annotation_value_wins() {
        let nodes = vec![
            make_node("n1", None, &[("InternalIP", "10.0.0.5")]),
            make_node("n2", Some("192.0.2.44"), &[("InternalIP", "10.0.0.9")]),
        ];
        assert_eq!(lookup_gateway_ip(&nodes), Some("192.0.2.44".parse().unwrap()));
    }

    #[test]
    fn test_lookup_gateway_ip_falls_back_to_node_ip() {
        let nodes = vec![
            make_node("n1", None, &[("InternalIP", "10.0.0.5")]),
            make_node("n2", Some(""), &[("InternalIP", "10.0.0.9")]),
        ];
        assert_eq!(lookup_gateway_ip(&nodes), Some("10.0.0.9".parse().unwrap()));
    }

    #[test]
    fn test_lookup_gateway_ip_none_annotated() {
        let nodes = vec![make_node("n1", None, &[("InternalIP", "10.0.0.5")])];
        assert_eq!(lookup_gateway_ip(&nodes), None);
    }
}
