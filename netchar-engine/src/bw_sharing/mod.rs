//! Bandwidth sharing between flows that compete for the same network segments
//!
//! Every ordered pair of elements is a flow. Flows between a UE and a non-UE element follow a path
//! of segments (links, access points, zone and domain backbones) and periodically get a share of
//! each segment, based on measured throughput. The most constrained segment decides the data rate
//! pushed to the flow's shaping rule.

pub mod segment;

use crate::rules::{FlowRateSink, RuleError};
use crate::store::{Fields, Store, StoreError};
use crate::topology::{ElementKind, NetChar, NetworkElement, Topology};
use crate::{DEFAULT_THROUGHPUT_LINK_MBPS, THROUGHPUT_UNIT};
pub use segment::{Allocation, Flow, Segment, SegmentConfig};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_RECALCULATION_PERIOD: Duration = Duration::from_millis(500);

/// Prefix of the hashes holding measured throughput, `metrics:<dst>:throughput`
pub const METRICS_PREFIX: &str = "metrics:";
const METRICS_SUFFIX: &str = ":throughput";

/// What the control hash asks the periodic task to do
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ControlAction {
    Start,
    Stop,
    #[default]
    None,
}

/// Runtime configuration, as last read from the control hash
#[derive(Clone, Debug, PartialEq)]
pub struct BwConfig {
    pub action: ControlAction,
    pub recalculation_period: Duration,
    pub log_verbose: bool,
    pub is_percentage: bool,
    pub tunables: SegmentConfig,
}

impl Default for BwConfig {
    fn default() -> Self {
        Self {
            action: ControlAction::None,
            recalculation_period: DEFAULT_RECALCULATION_PERIOD,
            log_verbose: false,
            is_percentage: false,
            tunables: SegmentConfig::default(),
        }
    }
}

impl BwConfig {
    /// Applies a control hash
    ///
    /// `action`, `recalculationPeriod` and `logVerbose` fall back to their defaults when missing.
    /// Tunables that are missing or fail to parse keep their current value.
    pub fn update(&mut self, fields: &Fields) {
        self.action = match fields.get("action").map(String::as_str) {
            Some("start") => ControlAction::Start,
            Some("stop") => ControlAction::Stop,
            _ => ControlAction::None,
        };
        self.recalculation_period = fields
            .get("recalculationPeriod")
            .and_then(|p| p.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_RECALCULATION_PERIOD);
        self.log_verbose = fields.get("logVerbose").is_some_and(|v| v == "yes");

        if let Some(value) = fields.get("isPercentage") {
            self.is_percentage = value == "yes";
        }

        let tunables = &mut self.tunables;
        for (field, target) in [
            ("maxBwPerInactiveFlow", &mut tunables.max_bw_per_inactive_flow),
            ("minActivityThreshold", &mut tunables.min_activity_threshold),
            ("incrementalStep", &mut tunables.incremental_step),
            (
                "inactivityIncrementalStep",
                &mut tunables.inactivity_incremental_step,
            ),
            ("tolerationThreshold", &mut tunables.toleration_threshold),
            ("actionUpperThreshold", &mut tunables.action_upper_threshold),
        ] {
            let Some(value) = fields.get(field) else {
                continue;
            };

            match value.parse::<f64>() {
                Ok(parsed) => *target = parsed,
                Err(_) => tracing::warn!(field, value = %value, "ignoring unparseable tunable"),
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// From a UE towards the network
    Uplink,
    Downlink,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Direction::Uplink => "uplink",
            Direction::Downlink => "downlink",
        };

        f.write_str(s)
    }
}

impl Direction {
    /// Only UE traffic is shared
    pub fn between(src: ElementKind, dst: ElementKind) -> Option<Self> {
        match (src, dst) {
            (ElementKind::Ue, ElementKind::Ue) => None,
            (ElementKind::Ue, _) => Some(Direction::Uplink),
            (_, ElementKind::Ue) => Some(Direction::Downlink),
            _ => None,
        }
    }
}

/// Counters of one recalculation pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecalculationSummary {
    pub segments_reevaluated: usize,
    pub flows_updated: usize,
    pub transaction_id: Option<u64>,
}

#[derive(Clone, Debug, Default)]
pub struct BandwidthSharing {
    config: BwConfig,
    started: bool,
    flows: Vec<Flow>,
    flow_index: BTreeMap<Arc<str>, usize>,
    segments: BTreeMap<Arc<str>, Segment>,
}

impl BandwidthSharing {
    pub fn new(config: BwConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn from_topology(topology: &Topology, config: &BwConfig) -> Self {
        let mut sharing = Self::new(config.clone());
        sharing.rebuild(topology);
        sharing
    }

    pub fn config(&self) -> &BwConfig {
        &self.config
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Reads a control hash, returning the action the periodic task must take
    ///
    /// Only transitions are reported: starting when already started gives [`ControlAction::None`].
    /// New tunables apply to every segment right away.
    pub fn update_controls(&mut self, fields: &Fields) -> ControlAction {
        self.config.update(fields);

        for segment in self.segments.values_mut() {
            segment.config = self
                .config
                .tunables
                .scaled(self.config.is_percentage, segment.max_throughput);
        }

        match self.config.action {
            ControlAction::Start if !self.started => ControlAction::Start,
            ControlAction::Stop if self.started => ControlAction::Stop,
            _ => ControlAction::None,
        }
    }

    pub fn start(&mut self, topology: &Topology) {
        self.started = true;
        self.rebuild(topology);
        tracing::info!(
            flows = self.flows.len(),
            segments = self.segments.len(),
            "bandwidth sharing started"
        );
    }

    pub fn stop(&mut self) {
        self.started = false;
        self.clear();
        tracing::info!("bandwidth sharing stopped");
    }

    /// Drops every flow and segment
    pub fn clear(&mut self) {
        self.flows.clear();
        self.flow_index.clear();
        self.segments.clear();
    }

    /// Recreates flows and segments from `topology`
    ///
    /// Flows present before and after keep their allocation and last measurement.
    pub fn rebuild(&mut self, topology: &Topology) {
        let mut previous: BTreeMap<_, _> = self
            .flows
            .drain(..)
            .map(|flow| (flow.name.clone(), flow))
            .collect();
        self.clear();

        let elements: Vec<_> = topology.rule_targets().collect();
        for src in &elements {
            for dst in &elements {
                if src.name == dst.name {
                    continue;
                }

                let maximum = capacity(&src.app).min(capacity(&dst.app));
                let mut flow = Flow::new(src.name.clone(), dst.name.clone(), maximum);
                if let Some(old) = previous.remove(&flow.name) {
                    flow.allocated = old.allocated;
                    flow.measured = old.measured;
                }

                let index = self.flows.len();
                self.flow_index.insert(flow.name.clone(), index);
                self.flows.push(flow);
                let path = self.create_path(index, src, dst);
                self.flows[index].path = path;
            }
        }

        if self.config.log_verbose {
            tracing::info!(
                flows = self.flows.len(),
                segments = self.segments.len(),
                "bandwidth sharing rebuilt"
            );
        }
    }

    /// Lays out the segments crossed from `src` to `dst`, tier by tier
    fn create_path(
        &mut self,
        flow: usize,
        src: &NetworkElement,
        dst: &NetworkElement,
    ) -> Option<Vec<Arc<str>>> {
        let direction = Direction::between(src.kind, dst.kind)?;
        let mut path = Vec::new();

        let same_domain = src.domain == dst.domain;
        let same_zone = same_domain && src.zone == dst.zone;
        let same_poa = same_zone && has_poa(src) && src.network_location == dst.network_location;

        // Tier 1: physical links and access points
        self.cross(&mut path, flow, physical_segment(src), direction);
        self.cross(&mut path, flow, poa_segment(src), direction);

        if !same_poa {
            if !same_zone {
                self.cross(&mut path, flow, zone_segment(src), direction);
                if !same_domain {
                    // Tier 4: between domains
                    self.cross(&mut path, flow, domain_segment(src), direction);
                    self.cross(
                        &mut path,
                        flow,
                        Some(("inter-domain".to_string(), capacity(&src.inter_domain))),
                        direction,
                    );
                    self.cross(&mut path, flow, domain_segment(dst), direction);
                } else {
                    // Tier 3: between zones of a domain
                    self.cross(&mut path, flow, domain_segment(src), direction);
                }
                self.cross(&mut path, flow, zone_segment(dst), direction);
            } else {
                // Tier 2: within a zone
                self.cross(&mut path, flow, zone_segment(src), direction);
            }
            self.cross(&mut path, flow, poa_segment(dst), direction);
        }

        self.cross(&mut path, flow, physical_segment(dst), direction);
        Some(path)
    }

    /// Appends a segment to `path`, creating it on first use
    fn cross(
        &mut self,
        path: &mut Vec<Arc<str>>,
        flow: usize,
        segment: Option<(String, f64)>,
        direction: Direction,
    ) {
        let Some((base, max_throughput)) = segment else {
            return;
        };

        let name: Arc<str> = format!("{base}-{direction}").into();
        if path.contains(&name) {
            return;
        }

        let config = &self.config;
        let segment = self.segments.entry(name.clone()).or_insert_with(|| {
            Segment::new(
                name.clone(),
                max_throughput,
                config.tunables.scaled(config.is_percentage, max_throughput),
            )
        });
        segment.flows.push(flow);
        path.push(name);
    }

    /// Loads the measured throughput of every flow, returning how many flows were updated
    pub fn read_measurements(&mut self, store: &dyn Store) -> Result<usize, StoreError> {
        let mut updated = 0;
        for key in store.keys_with_prefix(METRICS_PREFIX)? {
            let Some(dst) = key
                .strip_prefix(METRICS_PREFIX)
                .and_then(|k| k.strip_suffix(METRICS_SUFFIX))
            else {
                continue;
            };

            let Some(fields) = store.get_entry(&key)? else {
                continue;
            };

            for (src, value) in &fields {
                // Unparseable measurements count as silence
                if self.set_measurement(&format!("{src}:{dst}"), value.parse().unwrap_or(0.0)) {
                    updated += 1;
                }
            }
        }

        Ok(updated)
    }

    /// Sets the measured throughput of a flow, returning false for unknown flows
    pub fn set_measurement(&mut self, flow: &str, mbps: f64) -> bool {
        match self.flow_index.get(flow) {
            Some(&i) => {
                self.flows[i].measured = mbps;
                true
            }
            None => false,
        }
    }

    /// Recomputes the share of every flow and pushes changed allocations to `sink`
    ///
    /// Flows whose rule does not exist yet keep their previous allocation and are retried on the
    /// next pass. Store failures abort the pass.
    pub fn recalculate(
        &mut self,
        sink: &mut dyn FlowRateSink,
    ) -> Result<RecalculationSummary, RuleError> {
        let mut summary = RecalculationSummary::default();
        for flow in &mut self.flows {
            flow.max_planned = Allocation::UNPLANNED;
        }

        for segment in self.segments.values_mut() {
            segment.update_fair_share(&self.flows);
            let (unused, reevaluate) = segment.needs_reevaluation(&self.flows);
            if reevaluate.is_empty() {
                continue;
            }

            segment.recalculate(&mut self.flows, &reevaluate, unused);
            summary.segments_reevaluated += 1;

            if self.config.log_verbose {
                tracing::info!(
                    segment = %segment.name,
                    fair_share = segment.fair_share,
                    unused,
                    reevaluated = reevaluate.len(),
                    "segment reevaluated"
                );
            } else {
                tracing::trace!(segment = %segment.name, unused, "segment reevaluated");
            }
        }

        for flow in &mut self.flows {
            let planned = flow.max_planned;
            if planned.throughput == flow.allocated.throughput || planned.throughput.is_infinite() {
                continue;
            }

            match sink.apply_flow_rate(&flow.dst, &flow.src, planned.throughput) {
                Ok(()) => {
                    tracing::debug!(flow = %flow.name, rate = planned.throughput, "allocation updated");
                    flow.allocated = planned;
                    summary.flows_updated += 1;
                }
                Err(RuleError::Store(e)) => return Err(e.into()),
                Err(e) => tracing::debug!(flow = %flow.name, "allocation not applied: {e}"),
            }
        }

        if summary.flows_updated > 0 {
            summary.transaction_id = Some(sink.commit_and_notify()?);
        }

        Ok(summary)
    }

    pub fn flows(&self) -> &[Flow] {
        &self.flows
    }

    pub fn flow(&self, name: &str) -> Option<&Flow> {
        self.flow_index.get(name).map(|&i| &self.flows[i])
    }

    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.values()
    }

    pub fn segment(&self, name: &str) -> Option<&Segment> {
        self.segments.get(name)
    }

    /// The segments crossed by `flow`, in order
    pub fn path(&self, flow: &str) -> Option<&[Arc<str>]> {
        self.flow(flow)?.path.as_deref()
    }
}

/// Segment capacity in Mbps, unset capacities fall back to the default link throughput
fn capacity(nc: &NetChar) -> f64 {
    if nc.throughput <= 0 {
        DEFAULT_THROUGHPUT_LINK_MBPS
    } else {
        nc.throughput as f64 / THROUGHPUT_UNIT as f64
    }
}

fn has_poa(element: &NetworkElement) -> bool {
    matches!(element.kind, ElementKind::Ue | ElementKind::Fog)
}

fn physical_segment(element: &NetworkElement) -> Option<(String, f64)> {
    let location = element.physical_location.as_deref()?;
    Some((location.to_string(), capacity(&element.link)))
}

fn poa_segment(element: &NetworkElement) -> Option<(String, f64)> {
    if !has_poa(element) {
        return None;
    }

    let poa = element.network_location.as_deref()?;
    Some((poa.to_string(), capacity(&element.poa)))
}

fn zone_segment(element: &NetworkElement) -> Option<(String, f64)> {
    Some((
        format!("{}-{}", element.domain, element.zone),
        capacity(&element.edge_fog),
    ))
}

fn domain_segment(element: &NetworkElement) -> Option<(String, f64)> {
    Some((element.domain.to_string(), capacity(&element.inter_zone)))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::topology::test::scenario;

    /// Records allocations instead of writing rules
    #[derive(Default)]
    struct RecordingSink {
        rates: Vec<(String, String, f64)>,
        commits: u64,
        known: Option<Vec<String>>,
    }

    impl FlowRateSink for RecordingSink {
        fn apply_flow_rate(&mut self, dst: &str, src: &str, rate_mbps: f64) -> Result<(), RuleError> {
            if let Some(known) = &self.known {
                if !known.iter().any(|k| k == dst) {
                    return Err(RuleError::UnknownDestination {
                        dst: dst.to_string(),
                    });
                }
            }

            self.rates.push((dst.to_string(), src.to_string(), rate_mbps));
            Ok(())
        }

        fn commit_and_notify(&mut self) -> Result<u64, RuleError> {
            self.commits += 1;
            Ok(self.commits)
        }
    }

    fn fields(pairs: &[(&str, &str)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn two_zones() -> Topology {
        let scenario = scenario()
            .poa_throughput(20)
            .zones(vec![
                (
                    "zone1",
                    vec![
                        ("z1-default", "edge1", "EDGE", "edge1-app"),
                        ("z1-poa1", "fog1", "FOG", "fog1-app"),
                        ("z1-poa1", "ue1", "UE", "ue1-app"),
                        ("z1-poa1", "ue2", "UE", "ue2-app"),
                    ],
                ),
                ("zone2", vec![("z2-default", "edge2", "EDGE", "edge2-app")]),
            ])
            .call();
        Topology::build(&scenario, None).unwrap()
    }

    #[test]
    fn controls_parse_with_fallbacks() {
        let mut config = BwConfig::default();
        config.update(&fields(&[
            ("action", "start"),
            ("recalculationPeriod", "250"),
            ("logVerbose", "yes"),
            ("incrementalStep", "5"),
            ("tolerationThreshold", "many"),
            ("isPercentage", "yes"),
        ]));
        assert_eq!(config.action, ControlAction::Start);
        assert_eq!(config.recalculation_period, Duration::from_millis(250));
        assert!(config.log_verbose);
        assert!(config.is_percentage);
        assert_eq!(config.tunables.incremental_step, 5.0);
        assert_eq!(config.tunables.toleration_threshold, 4.0);

        config.update(&fields(&[("recalculationPeriod", "soon")]));
        assert_eq!(config.action, ControlAction::None);
        assert_eq!(config.recalculation_period, DEFAULT_RECALCULATION_PERIOD);
        assert!(!config.log_verbose);
        // Sticky until set again
        assert!(config.is_percentage);
        assert_eq!(config.tunables.incremental_step, 5.0);
    }

    #[test]
    fn control_actions_are_transitions() {
        let topology = two_zones();
        let mut sharing = BandwidthSharing::default();
        assert_eq!(sharing.update_controls(&fields(&[("action", "stop")])), ControlAction::None);
        assert_eq!(sharing.update_controls(&fields(&[("action", "start")])), ControlAction::Start);

        sharing.start(&topology);
        assert!(sharing.is_started());
        assert_eq!(sharing.update_controls(&fields(&[("action", "start")])), ControlAction::None);
        assert_eq!(sharing.update_controls(&fields(&[("action", "stop")])), ControlAction::Stop);

        sharing.stop();
        assert!(!sharing.is_started());
        assert!(sharing.flows().is_empty());
    }

    #[test]
    fn paths_cross_every_tier_boundary() {
        let sharing = BandwidthSharing::from_topology(&two_zones(), &BwConfig::default());

        // Every ordered pair of the 5 processes is a flow
        assert_eq!(sharing.flows().len(), 20);

        // Same access point
        let path: Vec<_> = sharing.path("ue1-app:fog1-app").unwrap().iter().map(|s| &**s).collect();
        assert_eq!(path, vec!["ue1-uplink", "z1-poa1-uplink", "fog1-uplink"]);

        // Same zone, the edge has no access point
        let path: Vec<_> = sharing.path("edge1-app:ue1-app").unwrap().iter().map(|s| &**s).collect();
        assert_eq!(
            path,
            vec![
                "edge1-downlink",
                "operator1-zone1-downlink",
                "z1-poa1-downlink",
                "ue1-downlink",
            ]
        );

        // Another zone of the same domain
        let path: Vec<_> = sharing.path("ue2-app:edge2-app").unwrap().iter().map(|s| &**s).collect();
        assert_eq!(
            path,
            vec![
                "ue2-uplink",
                "z1-poa1-uplink",
                "operator1-zone1-uplink",
                "operator1-uplink",
                "operator1-zone2-uplink",
                "edge2-uplink",
            ]
        );

        // Only UE traffic is shared
        assert!(sharing.path("edge1-app:edge2-app").is_none());
        assert!(sharing.path("ue1-app:ue2-app").is_none());

        // Both UEs share their access point uplink
        let poa = sharing.segment("z1-poa1-uplink").unwrap();
        assert_eq!(poa.max_throughput, 20.0);
        assert_eq!(poa.flows.len(), 6);
        assert!(sharing.segment("z1-poa1-downlink").is_some());
    }

    #[test]
    fn flow_maximum_is_the_narrowest_endpoint() {
        let sharing = BandwidthSharing::from_topology(&two_zones(), &BwConfig::default());
        let flow = sharing.flow("ue1-app:edge1-app").unwrap();
        assert_eq!(flow.maximum, DEFAULT_THROUGHPUT_LINK_MBPS);
        assert_eq!(&*flow.src, "ue1-app");
        assert_eq!(&*flow.dst, "edge1-app");
    }

    #[test]
    fn measurements_are_read_per_destination() {
        let mut sharing = BandwidthSharing::from_topology(&two_zones(), &BwConfig::default());
        let store = InMemoryStore::new();
        store
            .set_entry(
                "metrics:edge1-app:throughput",
                fields(&[("ue1-app", "12.5"), ("ue2-app", "garbage"), ("gone-app", "3")]),
            )
            .unwrap();
        store
            .set_entry("metrics:edge1-app:latency", fields(&[("ue1-app", "99")]))
            .unwrap();

        assert_eq!(sharing.read_measurements(&store).unwrap(), 2);
        assert_eq!(sharing.flow("ue1-app:edge1-app").unwrap().measured, 12.5);
        assert_eq!(sharing.flow("ue2-app:edge1-app").unwrap().measured, 0.0);
    }

    #[test]
    fn congested_access_point_is_shared_and_pushed() {
        let mut sharing = BandwidthSharing::from_topology(&two_zones(), &BwConfig::default());
        sharing.set_measurement("ue1-app:edge1-app", 15.0);
        sharing.set_measurement("ue2-app:edge1-app", 15.0);

        let mut sink = RecordingSink::default();
        let summary = sharing.recalculate(&mut sink).unwrap();
        assert_eq!(summary.flows_updated, 2);
        assert_eq!(summary.transaction_id, Some(1));
        assert_eq!(sink.commits, 1);

        // The 20 Mbps uplink is the bottleneck of both flows
        for flow in ["ue1-app:edge1-app", "ue2-app:edge1-app"] {
            assert_eq!(sharing.flow(flow).unwrap().allocated.throughput, 10.0);
        }
        assert!(sink.rates.iter().all(|(dst, _, rate)| dst == "edge1-app" && *rate == 10.0));

        let poa = sharing.segment("z1-poa1-uplink").unwrap();
        let total: f64 = poa
            .flows
            .iter()
            .map(|&i| sharing.flows()[i].allocated.throughput)
            .sum();
        assert!(total <= poa.max_throughput + 1e-9);

        // Nothing changed, nothing pushed
        let summary = sharing.recalculate(&mut sink).unwrap();
        assert_eq!(summary.flows_updated, 0);
        assert_eq!(sink.commits, 1);
    }

    #[test]
    fn silent_flow_drops_to_the_inactive_floor() {
        let mut sharing = BandwidthSharing::from_topology(&two_zones(), &BwConfig::default());
        let mut sink = RecordingSink::default();

        sharing.set_measurement("ue1-app:edge1-app", 15.0);
        sharing.set_measurement("ue2-app:edge1-app", 15.0);
        sharing.recalculate(&mut sink).unwrap();
        let previous = sharing.flow("ue1-app:edge1-app").unwrap().allocated.throughput;
        assert_eq!(previous, 10.0);

        // ue1 stops sending, its allocation is handed back to the access point pool
        sharing.set_measurement("ue1-app:edge1-app", 0.0);
        let mut poa = sharing.segment("z1-poa1-uplink").unwrap().clone();
        poa.update_fair_share(sharing.flows());
        let (unused, reevaluate) = poa.needs_reevaluation(sharing.flows());
        assert!(reevaluate.contains(&sharing.flow_index["ue1-app:edge1-app"]));
        assert_eq!(unused, poa.max_throughput + previous);

        sharing.recalculate(&mut sink).unwrap();
        let flow = sharing.flow("ue1-app:edge1-app").unwrap();
        assert_eq!(flow.allocated.throughput, 2.0);
        assert_eq!(flow.allocated.upper, 1.0);
    }

    #[test]
    fn unknown_rules_are_retried() {
        let mut sharing = BandwidthSharing::from_topology(&two_zones(), &BwConfig::default());
        sharing.set_measurement("ue1-app:edge1-app", 15.0);

        let mut sink = RecordingSink {
            known: Some(vec![]),
            ..RecordingSink::default()
        };
        let summary = sharing.recalculate(&mut sink).unwrap();
        assert_eq!(summary.flows_updated, 0);
        assert_eq!(summary.transaction_id, None);
        assert_eq!(sharing.flow("ue1-app:edge1-app").unwrap().allocated, Allocation::ZERO);

        sink.known = None;
        assert_eq!(sharing.recalculate(&mut sink).unwrap().flows_updated, 1);
    }

    #[test]
    fn rebuilds_keep_surviving_allocations() {
        let topology = two_zones();
        let mut sharing = BandwidthSharing::from_topology(&topology, &BwConfig::default());
        sharing.set_measurement("ue1-app:edge1-app", 15.0);
        sharing.recalculate(&mut RecordingSink::default()).unwrap();
        let allocated = sharing.flow("ue1-app:edge1-app").unwrap().allocated;

        sharing.rebuild(&topology);
        let flow = sharing.flow("ue1-app:edge1-app").unwrap();
        assert_eq!(flow.allocated, allocated);
        assert_eq!(flow.measured, 15.0);
        assert_eq!(sharing.segment("z1-poa1-uplink").unwrap().flows.len(), 6);
    }

    #[test]
    fn tunables_follow_the_controls() {
        let mut sharing = BandwidthSharing::from_topology(&two_zones(), &BwConfig::default());
        sharing.update_controls(&fields(&[("isPercentage", "yes"), ("incrementalStep", "10")]));

        let poa = sharing.segment("z1-poa1-uplink").unwrap();
        assert_eq!(poa.config.incremental_step, 2.0);
    }
}
