//! Service metadata recorded while building the topology, consumed when writing service-mapping
//! rules

use crate::scenario::{EgressService, IngressService, ServicePort};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortInfo {
    pub port: i32,
    pub external_port: Option<i32>,
    pub protocol: String,
}

/// A service instance, backed by a single process
#[derive(Clone, Debug)]
pub struct ServiceInfo {
    pub name: Arc<str>,
    pub node: Arc<str>,
    pub ports: BTreeMap<i32, PortInfo>,
    /// The multi-group service this instance belongs to, if any
    pub group: Option<Arc<str>>,
}

#[derive(Clone, Debug)]
pub struct IngressMapping {
    pub node_port: i32,
    pub service: Arc<str>,
    pub port: i32,
    pub protocol: String,
}

#[derive(Clone, Debug)]
pub struct EgressMapping {
    pub service: Arc<str>,
    pub ip: Arc<str>,
    pub port: i32,
    pub protocol: String,
}

/// Per-pod service state: the instance selected for each group service, plus external mappings
#[derive(Clone, Debug, Default)]
pub struct PodServices {
    pub name: Arc<str>,
    /// Group service name to the name of the selected instance
    pub group_selection: BTreeMap<Arc<str>, Arc<str>>,
    pub ingress: BTreeMap<i32, IngressMapping>,
    pub egress: BTreeMap<Arc<str>, EgressMapping>,
}

/// The load-balancer selection document, stored by the mobility-group manager
#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct LbMapping {
    #[serde(default)]
    pub network_elements: Vec<LbNetworkElement>,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct LbNetworkElement {
    pub name: String,
    #[serde(default)]
    pub service_maps: Vec<LbServiceMap>,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct LbServiceMap {
    pub mg_svc_name: String,
    pub lb_svc_name: String,
}

impl LbMapping {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[derive(Clone, Debug, Default)]
pub struct ServiceRegistry {
    services: BTreeMap<Arc<str>, ServiceInfo>,
    groups: BTreeMap<Arc<str>, BTreeSet<Arc<str>>>,
    pods: BTreeMap<Arc<str>, PodServices>,
}

impl ServiceRegistry {
    pub(crate) fn add_pod(&mut self, name: &Arc<str>) {
        self.pods.insert(
            name.clone(),
            PodServices {
                name: name.clone(),
                ..PodServices::default()
            },
        );
    }

    pub(crate) fn add_service(
        &mut self,
        name: &Arc<str>,
        ports: &[ServicePort],
        group: Option<&Arc<str>>,
        node: &Arc<str>,
    ) {
        let ports = ports
            .iter()
            .map(|p| {
                (
                    p.port,
                    PortInfo {
                        port: p.port,
                        external_port: p.external_port,
                        protocol: p.protocol.clone(),
                    },
                )
            })
            .collect();

        if let Some(group) = group {
            self.groups
                .entry(group.clone())
                .or_default()
                .insert(name.clone());
        }

        self.services.insert(
            name.clone(),
            ServiceInfo {
                name: name.clone(),
                node: node.clone(),
                ports,
                group: group.cloned(),
            },
        );
    }

    pub(crate) fn add_ingress(&mut self, pod: &Arc<str>, service: &IngressService) {
        let Some(pod) = self.pods.get_mut(pod) else {
            return;
        };

        pod.ingress.insert(
            service.external_port,
            IngressMapping {
                node_port: service.external_port,
                service: service.name.clone(),
                port: service.port,
                protocol: service.protocol.clone(),
            },
        );
    }

    /// Records an egress mapping and registers the external service as an instance
    pub(crate) fn add_egress(&mut self, pod: &Arc<str>, service: &EgressService) {
        if let Some(pod_services) = self.pods.get_mut(pod) {
            pod_services.egress.insert(
                service.name.clone(),
                EgressMapping {
                    service: service.name.clone(),
                    ip: service.ip.clone(),
                    port: service.port,
                    protocol: service.protocol.clone(),
                },
            );
        }

        let port = ServicePort {
            protocol: service.protocol.clone(),
            port: service.port,
            external_port: None,
        };
        self.add_service(&service.name, &[port], service.me_svc_name.as_ref(), pod);
    }

    /// Names of every service and group service that needs a cluster address
    pub fn required_addresses(&self) -> impl Iterator<Item = &Arc<str>> {
        self.services.keys().chain(self.groups.keys())
    }

    pub fn service(&self, name: &str) -> Option<&ServiceInfo> {
        self.services.get(name)
    }

    pub fn services(&self) -> impl Iterator<Item = &ServiceInfo> {
        self.services.values()
    }

    /// The instances belonging to a group service, sorted by name
    pub fn group_members(&self, group: &str) -> impl Iterator<Item = &Arc<str>> {
        self.groups.get(group).into_iter().flatten()
    }

    pub fn pod(&self, name: &str) -> Option<&PodServices> {
        self.pods.get(name)
    }

    pub fn pods(&self) -> impl Iterator<Item = &PodServices> {
        self.pods.values()
    }

    /// Records the load-balancer selections, replacing previous selections for the same groups
    pub fn apply_lb_mapping(&mut self, mapping: &LbMapping) {
        for element in &mapping.network_elements {
            let Some(pod) = self.pods.get_mut(element.name.as_str()) else {
                tracing::error!(pod = %element.name, "LB mapping refers to an unknown pod");
                continue;
            };

            for map in &element.service_maps {
                let Some(instance) = self.services.get(map.lb_svc_name.as_str()) else {
                    tracing::warn!(
                        pod = %element.name,
                        service = %map.lb_svc_name,
                        "LB mapping selects an unknown service instance"
                    );
                    continue;
                };

                pod.group_selection
                    .insert(map.mg_svc_name.as_str().into(), instance.name.clone());
            }
        }
    }
}
