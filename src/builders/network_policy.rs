//! The NetworkPolicy isolates the workload's pods. Ingress is only allowed from the mesh control
//! plane and from the namespaces the application names. Egress is only allowed to DNS and the mesh,
//! plus whatever the application opts into.
use super::{child_metadata, selector_labels, validate_port, BuildError, BuildSettings};
use crate::application::{Application, ApplicationSpec, NetworkingSpec};

use k8s_openapi::api::networking::v1::{
    IPBlock, NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyIngressRule, NetworkPolicyPeer,
    NetworkPolicyPort, NetworkPolicySpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use std::collections::BTreeMap;

/// Label that the api server puts on every namespace, with the namespace name as the value
pub const NAMESPACE_NAME_LABEL: &str = "kubernetes.io/metadata.name";

pub const DNS_PORT: i32 = 53;
pub const ANY_ADDRESS: &str = "0.0.0.0/0";
pub const PRIVATE_RANGES: [&str; 3] = ["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16"];

pub fn policy_name(app_name: &str) -> String {
    format!("{}-netpol", app_name)
}

pub fn build(
    app: &Application,
    spec: &ApplicationSpec,
    settings: &BuildSettings,
) -> Result<NetworkPolicy, BuildError> {
    let networking = spec.networking.clone().unwrap_or_default();

    let mut ingress = vec![NetworkPolicyIngressRule {
        from: Some(vec![namespace_peer(&settings.mesh_namespace)]),
        ports: None,
    }];
    for namespace in spec.allowed_ingress_namespaces() {
        if namespace == &settings.mesh_namespace {
            continue;
        }
        ingress.push(NetworkPolicyIngressRule {
            from: Some(vec![namespace_peer(namespace)]),
            ports: None,
        });
    }

    let mut egress = vec![
        NetworkPolicyEgressRule {
            to: None,
            ports: Some(vec![port("UDP", DNS_PORT)]),
        },
        NetworkPolicyEgressRule {
            to: Some(vec![namespace_peer(&settings.mesh_namespace)]),
            ports: None,
        },
    ];
    egress.extend(opt_in_egress_rules(&networking)?);

    Ok(NetworkPolicy {
        metadata: child_metadata(app, policy_name(app.name()), settings),
        spec: Some(NetworkPolicySpec {
            pod_selector: LabelSelector {
                match_labels: Some(selector_labels(app.name())),
                match_expressions: None,
            },
            policy_types: Some(vec!["Ingress".to_owned(), "Egress".to_owned()]),
            ingress: Some(ingress),
            egress: Some(egress),
        }),
    })
}

fn opt_in_egress_rules(
    networking: &NetworkingSpec,
) -> Result<Vec<NetworkPolicyEgressRule>, BuildError> {
    let mut rules = Vec::new();

    if !networking.allowed_egress_cidrs.is_empty() {
        let peers = networking
            .allowed_egress_cidrs
            .iter()
            .map(|cidr| ip_block_peer(cidr, None))
            .collect();
        rules.push(NetworkPolicyEgressRule {
            to: Some(peers),
            ports: None,
        });
    }

    if !networking.allowed_egress_ports.is_empty() {
        let ports = networking
            .allowed_egress_ports
            .iter()
            .map(|p| validate_port(*p).map(|p| port("TCP", p)))
            .collect::<Result<Vec<_>, _>>()?;
        rules.push(NetworkPolicyEgressRule {
            to: None,
            ports: Some(ports),
        });
    }

    if networking.allow_internet_egress.unwrap_or(false) {
        let except = PRIVATE_RANGES.iter().map(|r| (*r).to_owned()).collect();
        rules.push(NetworkPolicyEgressRule {
            to: Some(vec![ip_block_peer(ANY_ADDRESS, Some(except))]),
            ports: None,
        });
    }
    Ok(rules)
}

fn namespace_peer(namespace: &str) -> NetworkPolicyPeer {
    let mut match_labels = BTreeMap::new();
    match_labels.insert(NAMESPACE_NAME_LABEL.to_owned(), namespace.to_owned());
    NetworkPolicyPeer {
        namespace_selector: Some(LabelSelector {
            match_labels: Some(match_labels),
            match_expressions: None,
        }),
        ..Default::default()
    }
}

fn ip_block_peer(cidr: &str, except: Option<Vec<String>>) -> NetworkPolicyPeer {
    NetworkPolicyPeer {
        ip_block: Some(IPBlock {
            cidr: cidr.to_owned(),
            except,
        }),
        ..Default::default()
    }
}

fn port(protocol: &str, port: i32) -> NetworkPolicyPort {
    NetworkPolicyPort {
        port: Some(IntOrString::Int(port)),
        protocol: Some(protocol.to_owned()),
        ..Default::default()
    }
}
