//! The declarative scenario document, as stored by the scenario controller
//!
//! Only the parts relevant to network characteristics and service mapping are modelled. Numeric
//! parameters are optional because the controller serializes unset values as `null`.

use crate::util::serde_arc_str;
use anyhow::{Context, bail};
use serde::Deserialize;
use serde_with::{DefaultOnNull, NoneAsEmptyString, serde_as};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Deserialize, Clone, Debug)]
pub struct Scenario {
    #[serde(deserialize_with = "serde_arc_str::deserialize")]
    pub name: Arc<str>,
    pub deployment: Option<Deployment>,
}

impl Scenario {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[serde_as]
#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub inter_domain_latency: Option<f64>,
    pub inter_domain_latency_variation: Option<f64>,
    pub inter_domain_throughput: Option<f64>,
    pub inter_domain_packet_loss: Option<f64>,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    pub domains: Vec<Domain>,
}

#[serde_as]
#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Domain {
    #[serde(deserialize_with = "serde_arc_str::deserialize")]
    pub name: Arc<str>,
    pub inter_zone_latency: Option<f64>,
    pub inter_zone_latency_variation: Option<f64>,
    pub inter_zone_throughput: Option<f64>,
    pub inter_zone_packet_loss: Option<f64>,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    pub zones: Vec<Zone>,
}

#[serde_as]
#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Zone {
    #[serde(deserialize_with = "serde_arc_str::deserialize")]
    pub name: Arc<str>,
    pub inter_fog_latency: Option<f64>,
    pub inter_fog_latency_variation: Option<f64>,
    pub inter_fog_throughput: Option<f64>,
    pub inter_fog_packet_loss: Option<f64>,
    pub inter_edge_latency: Option<f64>,
    pub inter_edge_latency_variation: Option<f64>,
    pub inter_edge_throughput: Option<f64>,
    pub inter_edge_packet_loss: Option<f64>,
    pub edge_fog_latency: Option<f64>,
    pub edge_fog_latency_variation: Option<f64>,
    pub edge_fog_throughput: Option<f64>,
    pub edge_fog_packet_loss: Option<f64>,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    pub network_locations: Vec<NetworkLocation>,
}

#[serde_as]
#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct NetworkLocation {
    #[serde(deserialize_with = "serde_arc_str::deserialize")]
    pub name: Arc<str>,
    pub terminal_link_latency: Option<f64>,
    pub terminal_link_latency_variation: Option<f64>,
    pub terminal_link_throughput: Option<f64>,
    pub terminal_link_packet_loss: Option<f64>,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    pub physical_locations: Vec<PhysicalLocation>,
}

#[serde_as]
#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PhysicalLocation {
    #[serde(deserialize_with = "serde_arc_str::deserialize")]
    pub name: Arc<str>,
    /// One of `DC`, `EDGE`, `FOG` or `UE`; other kinds host no emulated processes
    #[serde(rename = "type")]
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    pub kind: String,
    pub link_latency: Option<f64>,
    pub link_latency_variation: Option<f64>,
    pub link_throughput: Option<f64>,
    pub link_packet_loss: Option<f64>,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    pub processes: Vec<Process>,
}

#[serde_as]
#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    #[serde(deserialize_with = "serde_arc_str::deserialize")]
    pub name: Arc<str>,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    pub is_external: bool,
    pub service_config: Option<ServiceConfig>,
    pub external_config: Option<ExternalConfig>,
    #[serde(default, deserialize_with = "serde_arc_str::deserialize_opt")]
    pub user_chart_location: Option<Arc<str>>,
    #[serde_as(as = "DefaultOnNull<NoneAsEmptyString>")]
    #[serde(default)]
    pub user_chart_group: Option<UserChartGroup>,
    pub app_latency: Option<f64>,
    pub app_latency_variation: Option<f64>,
    pub app_throughput: Option<f64>,
    pub app_packet_loss: Option<f64>,
}

#[serde_as]
#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    #[serde(deserialize_with = "serde_arc_str::deserialize")]
    pub name: Arc<str>,
    #[serde(default, deserialize_with = "serde_arc_str::deserialize_opt")]
    pub me_svc_name: Option<Arc<str>>,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    pub ports: Vec<ServicePort>,
}

#[serde_as]
#[derive(Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    pub protocol: String,
    pub port: i32,
    pub external_port: Option<i32>,
}

#[serde_as]
#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExternalConfig {
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    pub ingress_service_map: Vec<IngressService>,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    pub egress_service_map: Vec<EgressService>,
}

/// An internal service exposed to an external process through a node port
#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct IngressService {
    #[serde(deserialize_with = "serde_arc_str::deserialize")]
    pub name: Arc<str>,
    pub port: i32,
    pub external_port: i32,
    pub protocol: String,
}

/// An external service made reachable from inside the scenario
#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct EgressService {
    #[serde(deserialize_with = "serde_arc_str::deserialize")]
    pub name: Arc<str>,
    #[serde(default, deserialize_with = "serde_arc_str::deserialize_opt")]
    pub me_svc_name: Option<Arc<str>>,
    #[serde(deserialize_with = "serde_arc_str::deserialize")]
    pub ip: Arc<str>,
    pub port: i32,
    pub protocol: String,
}

/// A service declared by a user chart, written as `<service>:<group service>:<port>:<protocol>`
///
/// The group service may be empty when the service does not belong to a mobility group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserChartGroup {
    pub service: Arc<str>,
    pub group: Option<Arc<str>>,
    pub port: i32,
    pub protocol: String,
}

impl FromStr for UserChartGroup {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<_> = s.split(':').collect();
        let &[service, group, port, protocol] = parts.as_slice() else {
            bail!(
                "user chart group must have the form `<service>:<group>:<port>:<protocol>` (got `{s}`)"
            );
        };

        if service.is_empty() {
            bail!("user chart group `{s}` has an empty service name");
        }

        let port = port
            .parse()
            .with_context(|| format!("user chart group `{s}` has an invalid port"))?;

        Ok(Self {
            service: service.into(),
            group: (!group.is_empty()).then(|| group.into()),
            port,
            protocol: protocol.to_string(),
        })
    }
}

impl fmt::Display for UserChartGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let group = self.group.as_deref().unwrap_or("");
        write!(
            f,
            "{}:{group}:{}:{}",
            self.service, self.port, self.protocol
        )
    }
}
