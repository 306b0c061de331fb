//! Resolution of the pod and service addresses backing the emulated elements
//!
//! Rules can only be written once every address is known, so discovery gates the matrix engine.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DiscoveryState {
    #[default]
    Idle,
    Initializing,
    Ready,
}

impl fmt::Display for DiscoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DiscoveryState::Idle => "idle",
            DiscoveryState::Initializing => "initializing",
            DiscoveryState::Ready => "ready",
        };

        f.write_str(s)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("the orchestration API is unavailable: {0}")]
    Unavailable(String),
}

/// A running pod, identified by the scenario process it hosts
#[derive(Clone, Debug)]
pub struct PodEndpoint {
    pub app: Arc<str>,
    /// Empty while the pod is still being scheduled
    pub ip: Option<Arc<str>>,
}

#[derive(Clone, Debug)]
pub struct ServiceEndpoint {
    pub name: Arc<str>,
    pub cluster_ip: Option<Arc<str>>,
}

/// The orchestration API holding the scenario's pods and services
pub trait PlatformClient: Send + Sync {
    /// Lists the pods labelled as belonging to `scenario`
    fn list_pods(&self, scenario: &str) -> Result<Vec<PodEndpoint>, PlatformError>;
    fn list_services(&self) -> Result<Vec<ServiceEndpoint>, PlatformError>;
}

#[derive(Clone, Debug, Default)]
pub struct Discovery {
    state: DiscoveryState,
    pod_ips: BTreeMap<Arc<str>, Option<Arc<str>>>,
    svc_ips: BTreeMap<Arc<str>, Option<Arc<str>>>,
}

impl Discovery {
    pub fn state(&self) -> DiscoveryState {
        self.state
    }

    /// Requires an address for `name`; ignored once discovery is complete
    pub fn register_pod(&mut self, name: &Arc<str>) {
        if self.state != DiscoveryState::Ready {
            self.pod_ips.entry(name.clone()).or_default();
        }
    }

    /// Requires a cluster address for `name`; ignored once discovery is complete
    pub fn register_service(&mut self, name: &Arc<str>) {
        if self.state != DiscoveryState::Ready {
            self.svc_ips.entry(name.clone()).or_default();
        }
    }

    /// Starts polling, returns false when discovery was already started
    pub fn begin(&mut self) -> bool {
        if self.state != DiscoveryState::Idle {
            return false;
        }

        self.state = DiscoveryState::Initializing;
        true
    }

    /// Fills in the missing addresses from the platform, returns true when discovery completes
    ///
    /// Errors leave the collected addresses untouched, so the next poll picks up where this one
    /// left off.
    pub fn poll(
        &mut self,
        client: &dyn PlatformClient,
        scenario: &str,
    ) -> Result<bool, PlatformError> {
        if self.state != DiscoveryState::Initializing {
            return Ok(false);
        }

        if self.resolved_pods() < self.pod_ips.len() {
            for pod in client.list_pods(scenario)? {
                Self::fill(&mut self.pod_ips, &pod.app, pod.ip);
            }
        }

        if self.resolved_services() < self.svc_ips.len() {
            for svc in client.list_services()? {
                Self::fill(&mut self.svc_ips, &svc.name, svc.cluster_ip);
            }
        }

        if self.is_complete() {
            tracing::info!(
                pods = self.pod_ips.len(),
                services = self.svc_ips.len(),
                "platform discovery complete"
            );
            self.state = DiscoveryState::Ready;
            return Ok(true);
        }

        tracing::debug!(
            pods = self.resolved_pods(),
            pods_required = self.pod_ips.len(),
            services = self.resolved_services(),
            services_required = self.svc_ips.len(),
            "platform discovery in progress"
        );
        Ok(false)
    }

    fn fill(
        addresses: &mut BTreeMap<Arc<str>, Option<Arc<str>>>,
        name: &str,
        ip: Option<Arc<str>>,
    ) {
        let Some(ip) = ip.filter(|ip| !ip.is_empty()) else {
            return;
        };

        match addresses.get_mut(name) {
            Some(slot) if slot.is_none() => {
                tracing::debug!(name, %ip, "address discovered");
                *slot = Some(ip);
            }
            _ => {}
        }
    }

    /// Goes back from ready to initializing, keeping every address collected so far
    ///
    /// The next poll completes again straight away.
    pub fn reopen(&mut self) {
        if self.state == DiscoveryState::Ready {
            self.state = DiscoveryState::Initializing;
        }
    }

    pub fn reset(&mut self) {
        *self = Discovery::default();
    }

    pub fn is_complete(&self) -> bool {
        self.resolved_pods() == self.pod_ips.len()
            && self.resolved_services() == self.svc_ips.len()
    }

    pub fn resolved_pods(&self) -> usize {
        self.pod_ips.values().filter(|ip| ip.is_some()).count()
    }

    pub fn resolved_services(&self) -> usize {
        self.svc_ips.values().filter(|ip| ip.is_some()).count()
    }

    pub fn pod_ip(&self, name: &str) -> Option<&Arc<str>> {
        self.pod_ips.get(name)?.as_ref()
    }

    pub fn service_ip(&self, name: &str) -> Option<&Arc<str>> {
        self.svc_ips.get(name)?.as_ref()
    }

    /// Required pods and their addresses, sorted by name
    pub fn pods(&self) -> impl Iterator<Item = (&Arc<str>, Option<&Arc<str>>)> {
        self.pod_ips.iter().map(|(name, ip)| (name, ip.as_ref()))
    }

    /// Required services and their addresses, sorted by name
    pub fn services(&self) -> impl Iterator<Item = (&Arc<str>, Option<&Arc<str>>)> {
        self.svc_ips.iter().map(|(name, ip)| (name, ip.as_ref()))
    }
}
