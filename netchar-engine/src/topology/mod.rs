//! The network elements of a scenario, with the impairments of every tier they sit behind
//!
//! Elements are kept in traversal order: distant clouds first, then edges, fogs and UEs. That
//! order fixes the matrix indices and decides which side of a pair picks the impairment tier.

pub mod services;

use crate::discovery::Discovery;
use crate::scenario::{
    Deployment, Domain, NetworkLocation, PhysicalLocation, Process, Scenario, ServicePort, Zone,
};
use crate::{DEFAULT_THROUGHPUT_LINK_MBPS, MAX_THROUGHPUT, THROUGHPUT_UNIT};
use anyhow::bail;
use services::ServiceRegistry;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TopologyError {
    #[error("invalid scenario document: {0}")]
    InvalidDocument(#[from] serde_json::Error),
    #[error("network element `{name}` is defined more than once")]
    DuplicateElement { name: Arc<str> },
}

/// Network characteristics of one tier, or of a whole path
///
/// Throughput is in bps, packet loss in hundredths of a percent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NetChar {
    pub latency: i64,
    pub latency_variation: i64,
    pub throughput: i64,
    pub packet_loss: i64,
}

impl NetChar {
    /// Adds nothing to a path
    pub const UNBOUNDED: NetChar = NetChar {
        latency: 0,
        latency_variation: 0,
        throughput: MAX_THROUGHPUT,
        packet_loss: 0,
    };

    /// Converts scenario units (ms, ms, Mbps, percent) into rule units
    pub fn from_scenario(
        latency: Option<f64>,
        latency_variation: Option<f64>,
        throughput_mbps: Option<f64>,
        packet_loss_percent: Option<f64>,
    ) -> Self {
        Self {
            latency: latency.unwrap_or_default() as i64,
            latency_variation: (latency_variation.unwrap_or_default() as i64).max(0),
            throughput: THROUGHPUT_UNIT * throughput_mbps.unwrap_or_default() as i64,
            packet_loss: (100.0 * packet_loss_percent.unwrap_or_default()) as i64,
        }
    }

    fn with_default_throughput(mut self) -> Self {
        if self.throughput == 0 {
            self.throughput = THROUGHPUT_UNIT * DEFAULT_THROUGHPUT_LINK_MBPS as i64;
        }
        self
    }

    /// Extends `path` with this hop
    ///
    /// Latencies add up, throughput is bounded by the narrowest hop and losses compose as
    /// independent events.
    pub fn chain(&self, path: &NetChar) -> NetChar {
        let surviving = (10_000 - self.packet_loss) as f64 * (path.packet_loss as f64 / 10_000.0);
        NetChar {
            latency: self.latency + path.latency,
            latency_variation: self.latency_variation + path.latency_variation,
            throughput: self.throughput.min(path.throughput),
            packet_loss: self.packet_loss + surviving as i64,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ElementKind {
    Dc,
    Edge,
    Fog,
    Ue,
}

impl FromStr for ElementKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "DC" => ElementKind::Dc,
            "EDGE" => ElementKind::Edge,
            "FOG" => ElementKind::Fog,
            "UE" => ElementKind::Ue,
            _ => bail!("unsupported physical location type `{s}`"),
        };

        Ok(kind)
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ElementKind::Dc => "DC",
            ElementKind::Edge => "EDGE",
            ElementKind::Fog => "FOG",
            ElementKind::Ue => "UE",
        };

        f.write_str(s)
    }
}

#[derive(Clone, Debug)]
pub struct NetworkElement {
    pub name: Arc<str>,
    pub kind: ElementKind,
    /// The edge above a fog, or the fog above a UE
    pub parent: Option<Arc<str>>,
    pub domain: Arc<str>,
    pub zone: Arc<str>,
    pub network_location: Option<Arc<str>>,
    pub physical_location: Option<Arc<str>>,
    /// Placeholder parent, used for matrix computation only
    pub synthetic: bool,
    pub poa: NetChar,
    pub edge_fog: NetChar,
    pub inter_fog: NetChar,
    pub inter_edge: NetChar,
    pub inter_zone: NetChar,
    pub inter_domain: NetChar,
    pub link: NetChar,
    pub app: NetChar,
    /// The pod address, once discovered
    pub ip: Option<Arc<str>>,
}

impl NetworkElement {
    /// Impairments local to the element: its application plus its physical link
    pub fn overhead(&self) -> NetChar {
        self.app.chain(&self.link)
    }
}

/// Backbone characteristics shared by every element of a zone
struct ZoneChars {
    domain: Arc<str>,
    zone: Arc<str>,
    inter_domain: NetChar,
    inter_zone: NetChar,
    inter_fog: NetChar,
    inter_edge: NetChar,
    edge_fog: NetChar,
}

impl ZoneChars {
    fn new(deployment: &Deployment, domain: &Domain, zone: &Zone) -> Self {
        Self {
            domain: domain.name.clone(),
            zone: zone.name.clone(),
            inter_domain: NetChar::from_scenario(
                deployment.inter_domain_latency,
                deployment.inter_domain_latency_variation,
                deployment.inter_domain_throughput,
                deployment.inter_domain_packet_loss,
            ),
            inter_zone: NetChar::from_scenario(
                domain.inter_zone_latency,
                domain.inter_zone_latency_variation,
                domain.inter_zone_throughput,
                domain.inter_zone_packet_loss,
            ),
            inter_fog: NetChar::from_scenario(
                zone.inter_fog_latency,
                zone.inter_fog_latency_variation,
                zone.inter_fog_throughput,
                zone.inter_fog_packet_loss,
            ),
            inter_edge: NetChar::from_scenario(
                zone.inter_edge_latency,
                zone.inter_edge_latency_variation,
                zone.inter_edge_throughput,
                zone.inter_edge_packet_loss,
            ),
            edge_fog: NetChar::from_scenario(
                zone.edge_fog_latency,
                zone.edge_fog_latency_variation,
                zone.edge_fog_throughput,
                zone.edge_fog_packet_loss,
            ),
        }
    }

    fn element(&self, name: Arc<str>, kind: ElementKind, poa: NetChar) -> NetworkElement {
        NetworkElement {
            name,
            kind,
            parent: None,
            domain: self.domain.clone(),
            zone: self.zone.clone(),
            network_location: None,
            physical_location: None,
            synthetic: false,
            poa,
            edge_fog: self.edge_fog,
            inter_fog: self.inter_fog,
            inter_edge: self.inter_edge,
            inter_zone: self.inter_zone,
            inter_domain: self.inter_domain,
            link: NetChar::UNBOUNDED,
            app: NetChar::UNBOUNDED,
            ip: None,
        }
    }
}

#[derive(Default)]
struct ElementLists {
    dc: Vec<NetworkElement>,
    edge: Vec<NetworkElement>,
    fog: Vec<NetworkElement>,
    ue: Vec<NetworkElement>,
}

impl ElementLists {
    fn push(&mut self, element: NetworkElement) {
        match element.kind {
            ElementKind::Dc => self.dc.push(element),
            ElementKind::Edge => self.edge.push(element),
            ElementKind::Fog => self.fog.push(element),
            ElementKind::Ue => self.ue.push(element),
        }
    }

    fn into_traversal_order(self) -> Vec<NetworkElement> {
        let mut elements = self.dc;
        elements.extend(self.edge);
        elements.extend(self.fog);
        elements.extend(self.ue);
        elements
    }
}

#[derive(Clone, Debug, Default)]
pub struct Topology {
    scenario_name: Option<Arc<str>>,
    elements: Vec<NetworkElement>,
    index: HashMap<Arc<str>, usize>,
    services: ServiceRegistry,
    pods: Vec<Arc<str>>,
}

impl Topology {
    pub fn parse(json: &str) -> Result<Scenario, TopologyError> {
        Ok(Scenario::from_json(json)?)
    }

    /// Builds the element set of `scenario` from scratch
    ///
    /// Elements that were part of `previous` keep their resolved addresses.
    pub fn build(scenario: &Scenario, previous: Option<&Topology>) -> Result<Topology, TopologyError> {
        let mut lists = ElementLists::default();
        let mut services = ServiceRegistry::default();
        let mut pods = Vec::new();

        let default_deployment = Deployment::default();
        let deployment = scenario.deployment.as_ref().unwrap_or(&default_deployment);

        for domain in &deployment.domains {
            for zone in &domain.zones {
                let chars = ZoneChars::new(deployment, domain, zone);
                let mut parent_edge = None;
                let mut zone_fogs = Vec::new();

                for nl in &zone.network_locations {
                    let mut parent_fog = None;
                    let mut nl_ues = Vec::new();

                    for pl in &nl.physical_locations {
                        let kind = pl.kind.parse::<ElementKind>().ok();
                        for process in &pl.processes {
                            pods.push(process.name.clone());
                            register_services(&mut services, process);

                            let Some(kind) = kind else {
                                continue;
                            };

                            let element = process_element(&chars, nl, pl, process, kind);
                            match kind {
                                ElementKind::Edge => {
                                    parent_edge = Some(element.name.clone());
                                    lists.push(element);
                                }
                                ElementKind::Fog => {
                                    parent_fog = Some(element.name.clone());
                                    zone_fogs.push(element);
                                }
                                ElementKind::Ue => nl_ues.push(element),
                                ElementKind::Dc => lists.push(element),
                            }
                        }
                    }

                    let parent_fog = match parent_fog {
                        Some(fog) => fog,
                        None => {
                            let mut dummy = chars.element(
                                format!("dummy-fog-{}", nl.name).into(),
                                ElementKind::Fog,
                                NetChar::UNBOUNDED,
                            );
                            dummy.network_location = Some(nl.name.clone());
                            dummy.synthetic = true;
                            let name = dummy.name.clone();
                            zone_fogs.push(dummy);
                            name
                        }
                    };

                    for mut ue in nl_ues {
                        ue.parent = Some(parent_fog.clone());
                        lists.push(ue);
                    }
                }

                let parent_edge = match parent_edge {
                    Some(edge) => edge,
                    None => {
                        let mut dummy = chars.element(
                            format!("dummy-edge-{}", zone.name).into(),
                            ElementKind::Edge,
                            NetChar::UNBOUNDED,
                        );
                        dummy.edge_fog = NetChar::UNBOUNDED;
                        dummy.synthetic = true;
                        let name = dummy.name.clone();
                        lists.push(dummy);
                        name
                    }
                };

                for mut fog in zone_fogs {
                    fog.parent = Some(parent_edge.clone());
                    lists.push(fog);
                }
            }
        }

        let mut elements = lists.into_traversal_order();
        let mut index = HashMap::with_capacity(elements.len());
        for (i, element) in elements.iter_mut().enumerate() {
            if index.insert(element.name.clone(), i).is_some() {
                return Err(TopologyError::DuplicateElement {
                    name: element.name.clone(),
                });
            }

            element.ip = previous
                .and_then(|p| p.element(&element.name))
                .and_then(|e| e.ip.clone());
        }

        let mut seen_pods = HashSet::new();
        if let Some(duplicate) = pods.iter().find(|p| !seen_pods.insert(*p)) {
            return Err(TopologyError::DuplicateElement {
                name: duplicate.clone(),
            });
        }

        Ok(Topology {
            scenario_name: Some(scenario.name.clone()),
            elements,
            index,
            services,
            pods,
        })
    }

    pub fn scenario_name(&self) -> Option<&Arc<str>> {
        self.scenario_name.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// All elements, in traversal order
    pub fn elements(&self) -> &[NetworkElement] {
        &self.elements
    }

    pub fn element(&self, name: &str) -> Option<&NetworkElement> {
        self.index.get(name).map(|&i| &self.elements[i])
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Elements that receive shaping rules, in traversal order
    pub fn rule_targets(&self) -> impl Iterator<Item = &NetworkElement> {
        self.elements.iter().filter(|e| !e.synthetic)
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    pub fn services_mut(&mut self) -> &mut ServiceRegistry {
        &mut self.services
    }

    /// Every process of the scenario, including those without network characteristics
    pub fn required_pods(&self) -> &[Arc<str>] {
        &self.pods
    }

    /// Copies discovered pod addresses into the elements
    pub fn resolve_addresses(&mut self, discovery: &Discovery) {
        for element in &mut self.elements {
            if let Some(ip) = discovery.pod_ip(&element.name) {
                element.ip = Some(ip.clone());
            }
        }
    }
}

fn process_element(
    chars: &ZoneChars,
    nl: &NetworkLocation,
    pl: &PhysicalLocation,
    process: &Process,
    kind: ElementKind,
) -> NetworkElement {
    let poa = NetChar::from_scenario(
        nl.terminal_link_latency,
        nl.terminal_link_latency_variation,
        nl.terminal_link_throughput,
        nl.terminal_link_packet_loss,
    );

    let mut element = chars.element(process.name.clone(), kind, poa);
    element.network_location = Some(nl.name.clone());
    element.physical_location = Some(pl.name.clone());
    element.link = NetChar::from_scenario(
        pl.link_latency,
        pl.link_latency_variation,
        pl.link_throughput,
        pl.link_packet_loss,
    )
    .with_default_throughput();
    element.app = NetChar::from_scenario(
        process.app_latency,
        process.app_latency_variation,
        process.app_throughput,
        process.app_packet_loss,
    )
    .with_default_throughput();
    element
}

fn register_services(services: &mut ServiceRegistry, process: &Process) {
    services.add_pod(&process.name);

    if let Some(config) = &process.service_config {
        services.add_service(
            &config.name,
            &config.ports,
            config.me_svc_name.as_ref(),
            &process.name,
        );
    }

    // Only processes deployed from a user chart declare chart services
    if let (Some(_), Some(group)) = (&process.user_chart_location, &process.user_chart_group) {
        let port = ServicePort {
            protocol: group.protocol.clone(),
            port: group.port,
            external_port: None,
        };
        services.add_service(&group.service, &[port], group.group.as_ref(), &process.name);
    }

    let external = process
        .external_config
        .as_ref()
        .filter(|_| process.is_external);
    if let Some(external) = external {
        for ingress in &external.ingress_service_map {
            services.add_ingress(&process.name, ingress);
        }
        for egress in &external.egress_service_map {
            services.add_egress(&process.name, egress);
        }
    }
}
