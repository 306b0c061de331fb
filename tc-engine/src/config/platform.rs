use fastrand::Rng;
use netchar_engine::discovery::{PlatformClient, PlatformError, PodEndpoint, ServiceEndpoint};
use netchar_engine::topology::Topology;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_with::{DisplayFromStr, serde_as};
use std::net::{IpAddr, Ipv4Addr};

#[derive(Deserialize, Clone, Debug, Default)]
pub struct PlatformJson {
    #[serde(default)]
    pods: Vec<PodJson>,
    #[serde(default)]
    services: Vec<ServiceJson>,
}

#[serde_as]
#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
struct PodJson {
    /// The scenario process hosted by the pod
    app: String,
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default)]
    ip: Option<IpAddr>,
    /// The number of polls during which the pod is still being scheduled (and has no address)
    #[serde(default)]
    pending_polls: u32,
}

#[serde_as]
#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
struct ServiceJson {
    name: String,
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default)]
    cluster_ip: Option<IpAddr>,
}

/// A platform whose inventory is known upfront, with pods that may take a few polls to come up
pub struct JsonPlatform {
    inventory: PlatformJson,
    pod_polls: Mutex<u32>,
}

impl JsonPlatform {
    pub fn new(inventory: PlatformJson) -> Self {
        Self {
            inventory,
            pod_polls: Mutex::new(0),
        }
    }

    /// Gives an address to every pod and service required by `topology`
    pub fn generated(topology: &Topology, rng: &mut Rng) -> Self {
        let pod_subnet = rng.u8(1..=127);
        let svc_subnet = rng.u8(128..=254);

        let pods = topology
            .required_pods()
            .iter()
            .enumerate()
            .map(|(i, app)| PodJson {
                app: app.to_string(),
                ip: Some(host_address(pod_subnet, i)),
                pending_polls: 0,
            })
            .collect();
        let services = topology
            .services()
            .required_addresses()
            .enumerate()
            .map(|(i, name)| ServiceJson {
                name: name.to_string(),
                cluster_ip: Some(host_address(svc_subnet, i)),
            })
            .collect();

        Self::new(PlatformJson { pods, services })
    }

    /// How many times the pods were listed
    pub fn pod_polls(&self) -> u32 {
        *self.pod_polls.lock()
    }
}

fn host_address(subnet: u8, index: usize) -> IpAddr {
    let [_, _, hi, lo] = (index as u32 + 1).to_be_bytes();
    IpAddr::V4(Ipv4Addr::new(10, subnet, hi, lo))
}

impl PlatformClient for JsonPlatform {
    fn list_pods(&self, _scenario: &str) -> Result<Vec<PodEndpoint>, PlatformError> {
        let poll = {
            let mut polls = self.pod_polls.lock();
            *polls += 1;
            *polls
        };

        Ok(self
            .inventory
            .pods
            .iter()
            .map(|pod| PodEndpoint {
                app: pod.app.as_str().into(),
                ip: pod
                    .ip
                    .filter(|_| poll > pod.pending_polls)
                    .map(|ip| ip.to_string().into()),
            })
            .collect())
    }

    fn list_services(&self) -> Result<Vec<ServiceEndpoint>, PlatformError> {
        Ok(self
            .inventory
            .services
            .iter()
            .map(|svc| ServiceEndpoint {
                name: svc.name.as_str().into(),
                cluster_ip: svc.cluster_ip.map(|ip| ip.to_string().into()),
            })
            .collect())
    }
}
