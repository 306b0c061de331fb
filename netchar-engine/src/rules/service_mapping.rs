//! Load-balancing rules: which instance answers for a service, as seen from each pod

use super::{RuleError, RuleManager};
use crate::discovery::Discovery;
use crate::store::Fields;
use crate::topology::services::{PodServices, ServiceInfo, ServiceRegistry};
use std::collections::HashSet;
use std::fmt;

const ANY_ADDRESS: &str = "0.0.0.0/0";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceRuleKind {
    /// A multi-group service, resolved to the instance selected for the pod
    MeService,
    Ingress,
    Egress,
}

impl fmt::Display for ServiceRuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceRuleKind::MeService => "ME-SVC",
            ServiceRuleKind::Ingress => "INGRESS-SVC",
            ServiceRuleKind::Egress => "EGRESS-SVC",
        };

        f.write_str(s)
    }
}

/// A single load-balancing rule, as stored for the sidecar of `pod`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceRule {
    pub pod: String,
    pub kind: ServiceRuleKind,
    pub svc_name: String,
    pub svc_ip: String,
    pub svc_protocol: String,
    /// The port the pod connects to, also part of the key
    pub svc_port: i32,
    pub lb_svc_name: String,
    pub lb_svc_ip: String,
    pub lb_svc_port: i32,
}

impl ServiceRule {
    pub fn key(&self, module: &str) -> String {
        format!(
            "{module}:lb:{}:{}:{}",
            self.pod, self.svc_name, self.svc_port
        )
    }

    fn fields(&self) -> Fields {
        Fields::from([
            ("svc-type".to_string(), self.kind.to_string()),
            ("svc-name".to_string(), self.svc_name.clone()),
            ("svc-ip".to_string(), self.svc_ip.clone()),
            ("svc-protocol".to_string(), self.svc_protocol.clone()),
            ("svc-port".to_string(), self.svc_port.to_string()),
            ("lb-svc-name".to_string(), self.lb_svc_name.clone()),
            ("lb-svc-ip".to_string(), self.lb_svc_ip.clone()),
            ("lb-svc-port".to_string(), self.lb_svc_port.to_string()),
        ])
    }
}

/// Computes the load-balancing rules of every pod
pub fn service_rules(services: &ServiceRegistry, discovery: &Discovery) -> Vec<ServiceRule> {
    let address = |name: &str| {
        discovery
            .service_ip(name)
            .map(|ip| ip.to_string())
            .unwrap_or_default()
    };

    let mut rules = Vec::new();
    for pod in services.pods() {
        for (group, instance) in &pod.group_selection {
            let Some(instance) = services.service(instance) else {
                continue;
            };

            for port in instance.ports.values() {
                rules.push(ServiceRule {
                    pod: pod.name.to_string(),
                    kind: ServiceRuleKind::MeService,
                    svc_name: group.to_string(),
                    svc_ip: address(group),
                    svc_protocol: port.protocol.clone(),
                    svc_port: port.port,
                    lb_svc_name: instance.name.to_string(),
                    lb_svc_ip: address(&instance.name),
                    lb_svc_port: port.port,
                });
            }
        }

        for ingress in pod.ingress.values() {
            let Some(instance) = ingress_target(services, pod, &ingress.service) else {
                tracing::warn!(pod = %pod.name, service = %ingress.service, "ingress service has no instance");
                continue;
            };

            rules.push(ServiceRule {
                pod: pod.name.to_string(),
                kind: ServiceRuleKind::Ingress,
                svc_name: ingress.service.to_string(),
                svc_ip: ANY_ADDRESS.to_string(),
                svc_protocol: ingress.protocol.clone(),
                svc_port: ingress.node_port,
                lb_svc_name: instance.name.to_string(),
                lb_svc_ip: address(&instance.name),
                lb_svc_port: ingress.port,
            });
        }

        for egress in pod.egress.values() {
            rules.push(ServiceRule {
                pod: pod.name.to_string(),
                kind: ServiceRuleKind::Egress,
                svc_name: egress.service.to_string(),
                svc_ip: ANY_ADDRESS.to_string(),
                svc_protocol: egress.protocol.clone(),
                svc_port: egress.port,
                lb_svc_name: egress.service.to_string(),
                lb_svc_ip: egress.ip.to_string(),
                lb_svc_port: egress.port,
            });
        }
    }

    rules
}

/// The pod's own group selection wins over a plain service of the same name
fn ingress_target<'a>(
    services: &'a ServiceRegistry,
    pod: &PodServices,
    service: &str,
) -> Option<&'a ServiceInfo> {
    match pod.group_selection.get(service) {
        Some(instance) => services.service(instance),
        None => services.service(service),
    }
}

impl RuleManager {
    /// Rewrites the load-balancing rules of every pod and notifies the sidecars
    ///
    /// Returns the number of rules written.
    pub fn apply_service_mapping(
        &mut self,
        services: &ServiceRegistry,
        discovery: &Discovery,
    ) -> Result<usize, RuleError> {
        let module = self.module().to_string();
        let rules = service_rules(services, discovery);

        let mut written = HashSet::with_capacity(rules.len());
        for rule in &rules {
            let key = rule.key(&module);
            self.store().set_entry(&key, rule.fields())?;
            written.insert(key);
        }

        let mut removed = 0;
        for key in self.store().keys_with_prefix(&format!("{module}:lb:"))? {
            if !written.contains(&key) {
                self.store().del_entry(&key)?;
                removed += 1;
            }
        }

        self.store().publish(self.lb_channel(), "")?;
        tracing::info!(written = written.len(), removed, "service mapping rules applied");
        Ok(written.len())
    }
}
