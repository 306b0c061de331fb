//! Filter and shaping rules for the sidecars
//!
//! Every (destination, source) relationship owns a pair of adjacent slot ids `(2k, 2k + 1)`.
//! A rule whose source identity changes moves to the other id of its pair, so the sidecar can
//! install the new rule before removing the old one.

pub mod service_mapping;

use crate::EngineConfig;
use crate::discovery::Discovery;
use crate::matrix::NetCharMatrix;
use crate::stats_tracker::{RulePassSummary, RuleStatsTracker};
use crate::store::{Fields, Store, StoreError};
use crate::topology::{NetworkElement, Topology};
use crate::{COMMON_CORRELATION, THROUGHPUT_UNIT};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

/// Slot id of the first relationship of every destination
pub const FIRST_SLOT: u32 = 2;

/// Payload published on the rule channels when every rule is removed
pub const DELETE_ALL: &str = "delAll";

#[derive(Error, Debug)]
pub enum RuleError {
    #[error("flow destination `{dst}` has no rules")]
    UnknownDestination { dst: String },
    #[error("flow source `{src}` has no rule at destination `{dst}`")]
    UnknownSource { dst: String, src: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The other id of a slot pair
pub fn adjacent_slot(slot: u32) -> u32 {
    if slot % 2 == 0 { slot + 1 } else { slot - 1 }
}

/// One enforcement rule: traffic from a source into a destination pod, and how to shape it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilterInfo {
    pub pod_name: Arc<str>,
    pub src_ip: Option<Arc<str>>,
    pub src_svc_ip: Option<Arc<str>>,
    pub src_name: Arc<str>,
    pub src_netmask: Arc<str>,
    pub src_port: u16,
    pub dst_port: u16,
    pub slot: u32,
    pub latency: i64,
    pub latency_variation: i64,
    pub latency_correlation: i64,
    pub packet_loss: i64,
    /// In bps
    pub data_rate: i64,
}

impl FilterInfo {
    /// Whether both rules match the same packets
    pub fn same_identity(&self, other: &FilterInfo) -> bool {
        self.pod_name == other.pod_name
            && self.src_ip == other.src_ip
            && self.src_svc_ip == other.src_svc_ip
            && self.src_netmask == other.src_netmask
            && self.src_port == other.src_port
            && self.dst_port == other.dst_port
    }

    pub fn same_shaping(&self, other: &FilterInfo) -> bool {
        self.latency == other.latency
            && self.latency_variation == other.latency_variation
            && self.latency_correlation == other.latency_correlation
            && self.packet_loss == other.packet_loss
            && self.data_rate == other.data_rate
    }

    pub fn filter_key(&self, module: &str) -> String {
        format!("{module}:net:{}:filter:{}", self.pod_name, self.slot)
    }

    /// Keyed by the filter's own slot, which is odd after a first replacement
    pub fn shape_key(&self, module: &str) -> String {
        format!("{module}:net:{}:shape:{}", self.pod_name, self.slot)
    }

    fn filter_fields(&self) -> Fields {
        let slot = self.slot.to_string();
        Fields::from([
            ("PodName".to_string(), self.pod_name.to_string()),
            ("srcIp".to_string(), opt_str(&self.src_ip)),
            ("srcSvcIp".to_string(), opt_str(&self.src_svc_ip)),
            ("srcName".to_string(), self.src_name.to_string()),
            ("srcNetmask".to_string(), self.src_netmask.to_string()),
            ("srcPort".to_string(), self.src_port.to_string()),
            ("dstPort".to_string(), self.dst_port.to_string()),
            ("ifb_uniqueId".to_string(), slot.clone()),
            ("filter_uniqueId".to_string(), slot),
        ])
    }

    fn shape_fields(&self) -> Fields {
        Fields::from([
            ("delay".to_string(), self.latency.to_string()),
            ("delayVariation".to_string(), self.latency_variation.to_string()),
            ("delayCorrelation".to_string(), self.latency_correlation.to_string()),
            ("packetLoss".to_string(), self.packet_loss.to_string()),
            ("dataRate".to_string(), self.data_rate.to_string()),
            ("ifb_uniqueId".to_string(), self.slot.to_string()),
        ])
    }
}

fn opt_str(value: &Option<Arc<str>>) -> String {
    value.as_deref().unwrap_or_default().to_string()
}

/// The rules installed at one destination, keyed by source name
#[derive(Clone, Debug)]
pub struct DestinationRules {
    next_slot: u32,
    filters: BTreeMap<Arc<str>, FilterInfo>,
}

impl Default for DestinationRules {
    fn default() -> Self {
        Self {
            next_slot: FIRST_SLOT,
            filters: BTreeMap::new(),
        }
    }
}

impl DestinationRules {
    pub fn filters(&self) -> impl Iterator<Item = &FilterInfo> {
        self.filters.values()
    }
}

/// Receives bandwidth allocations decided outside of the matrix
pub trait FlowRateSink {
    /// Overrides the data rate of the rule shaping traffic from `src` into `dst`
    fn apply_flow_rate(&mut self, dst: &str, src: &str, rate_mbps: f64) -> Result<(), RuleError>;

    /// Records a new transaction and tells the sidecars to apply it, returning its id
    fn commit_and_notify(&mut self) -> Result<u64, RuleError>;
}

pub struct RuleManager {
    module: Arc<str>,
    net_channel: Arc<str>,
    lb_channel: Arc<str>,
    store: Arc<dyn Store>,
    destinations: BTreeMap<Arc<str>, DestinationRules>,
    next_transaction_id: u64,
    stats: RuleStatsTracker,
}

impl RuleManager {
    pub fn new(config: &EngineConfig, store: Arc<dyn Store>, stats: RuleStatsTracker) -> Self {
        Self {
            module: config.module.clone(),
            net_channel: config.net_rules_channel.clone(),
            lb_channel: config.lb_rules_channel.clone(),
            store,
            destinations: BTreeMap::new(),
            next_transaction_id: 1,
            stats,
        }
    }

    fn db_state_key(&self) -> String {
        format!("{}:net:dbState", self.module)
    }

    /// Brings the stored rules in line with `matrix`
    ///
    /// Only changed rules are written. `overwrite_data_rate` is false while bandwidth sharing
    /// owns the data rates, in which case existing rules keep theirs. In-memory state only moves
    /// forward when every store operation succeeded.
    pub fn apply_matrix(
        &mut self,
        topology: &Topology,
        matrix: &NetCharMatrix,
        discovery: &Discovery,
        overwrite_data_rate: bool,
    ) -> Result<RulePassSummary, RuleError> {
        let module = self.module.clone();
        let mut destinations = self.destinations.clone();
        let mut summary = RulePassSummary::default();
        let mut touched = HashSet::new();

        let targets: Vec<&NetworkElement> = topology.rule_targets().collect();
        let mut sources = targets.clone();
        sources.sort_by(|a, b| a.name.cmp(&b.name));

        for dst in &targets {
            let Some(j) = matrix.index_of(&dst.name) else {
                tracing::warn!(pod = %dst.name, "destination missing from the matrix");
                continue;
            };

            let rules = destinations.entry(dst.name.clone()).or_default();
            let mut seen = HashSet::new();

            for src in &sources {
                if src.name == dst.name {
                    continue;
                }
                let Some(i) = matrix.index_of(&src.name) else {
                    continue;
                };

                let nc = matrix.get(i, j);
                let mut candidate = FilterInfo {
                    pod_name: dst.name.clone(),
                    src_ip: src.ip.clone(),
                    src_svc_ip: discovery.service_ip(&src.name).cloned(),
                    src_name: src.name.clone(),
                    src_netmask: "0".into(),
                    src_port: 0,
                    dst_port: 0,
                    slot: rules.next_slot,
                    latency: nc.latency,
                    latency_variation: nc.latency_variation,
                    latency_correlation: COMMON_CORRELATION,
                    packet_loss: nc.packet_loss,
                    data_rate: nc.throughput,
                };
                seen.insert(src.name.clone());

                match rules.filters.get(&src.name) {
                    None => {
                        self.write_filter(&candidate)?;
                        self.write_shape(&candidate)?;
                        rules.next_slot += 2;
                        summary.created += 1;
                        tracing::debug!(pod = %dst.name, src = %src.name, slot = candidate.slot, "rule created");
                    }
                    Some(existing) if existing.same_identity(&candidate) => {
                        candidate.slot = existing.slot;
                        if !overwrite_data_rate {
                            candidate.data_rate = existing.data_rate;
                        }

                        if !existing.same_shaping(&candidate) {
                            self.write_shape(&candidate)?;
                            summary.updated += 1;
                            tracing::debug!(pod = %dst.name, src = %src.name, slot = candidate.slot, "rule shaping updated");
                        }
                    }
                    Some(existing) => {
                        // The shape key follows the filter onto the adjacent slot, even or odd
                        candidate.slot = adjacent_slot(existing.slot);
                        if !overwrite_data_rate {
                            candidate.data_rate = existing.data_rate;
                        }

                        self.store.del_entry(&existing.shape_key(&module))?;
                        self.store.del_entry(&existing.filter_key(&module))?;
                        self.write_filter(&candidate)?;
                        self.write_shape(&candidate)?;
                        summary.replaced += 1;
                        tracing::debug!(pod = %dst.name, src = %src.name, slot = candidate.slot, "rule replaced");
                    }
                }

                touched.insert(candidate.filter_key(&module));
                touched.insert(candidate.shape_key(&module));
                rules.filters.insert(src.name.clone(), candidate);
            }

            rules.filters.retain(|src, _| seen.contains(src));
        }

        destinations.retain(|dst, _| topology.element(dst).is_some_and(|e| !e.synthetic));

        let db_state = self.db_state_key();
        for key in self.store.keys_with_prefix(&format!("{module}:net:"))? {
            if key != db_state && !touched.contains(&key) {
                self.store.del_entry(&key)?;
                summary.collected += 1;
            }
        }

        self.destinations = destinations;
        self.stats.track_pass(&summary);
        tracing::info!(
            created = summary.created,
            updated = summary.updated,
            replaced = summary.replaced,
            collected = summary.collected,
            "rule pass complete"
        );
        Ok(summary)
    }

    fn write_filter(&self, filter: &FilterInfo) -> Result<(), StoreError> {
        self.store
            .set_entry(&filter.filter_key(&self.module), filter.filter_fields())
    }

    fn write_shape(&self, filter: &FilterInfo) -> Result<(), StoreError> {
        self.store
            .set_entry(&filter.shape_key(&self.module), filter.shape_fields())
    }

    /// Removes every rule of this module and tells the sidecars to do the same
    pub fn flush_all(&mut self) -> Result<(), RuleError> {
        self.destinations.clear();
        self.store.flush(&self.module)?;
        self.store.publish(&self.net_channel, DELETE_ALL)?;
        self.store.publish(&self.lb_channel, DELETE_ALL)?;
        Ok(())
    }

    /// The rules installed at `dst`, sorted by source name
    pub fn filters_for(&self, dst: &str) -> Vec<FilterInfo> {
        self.destinations
            .get(dst)
            .map(|rules| rules.filters().cloned().collect())
            .unwrap_or_default()
    }

    pub fn destinations(&self) -> impl Iterator<Item = (&Arc<str>, &DestinationRules)> {
        self.destinations.iter()
    }

    pub fn next_transaction_id(&self) -> u64 {
        self.next_transaction_id
    }

    pub(crate) fn module(&self) -> &str {
        &self.module
    }

    pub(crate) fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub(crate) fn lb_channel(&self) -> &str {
        &self.lb_channel
    }
}

impl FlowRateSink for RuleManager {
    fn apply_flow_rate(&mut self, dst: &str, src: &str, rate_mbps: f64) -> Result<(), RuleError> {
        let rules = self
            .destinations
            .get_mut(dst)
            .ok_or_else(|| RuleError::UnknownDestination {
                dst: dst.to_string(),
            })?;
        let filter = rules
            .filters
            .get_mut(src)
            .ok_or_else(|| RuleError::UnknownSource {
                dst: dst.to_string(),
                src: src.to_string(),
            })?;

        let mut updated = filter.clone();
        updated.data_rate = (THROUGHPUT_UNIT as f64 * rate_mbps) as i64;
        self.store
            .set_entry(&updated.shape_key(&self.module), updated.shape_fields())?;
        *filter = updated;

        self.stats.track_flow_rate_update();
        Ok(())
    }

    fn commit_and_notify(&mut self) -> Result<u64, RuleError> {
        let id = self.next_transaction_id;
        self.store.set_entry(
            &self.db_state_key(),
            Fields::from([("transactionIdStored".to_string(), id.to_string())]),
        )?;
        self.store.publish(&self.net_channel, &id.to_string())?;

        self.next_transaction_id += 1;
        self.stats.track_transaction(id);
        tracing::debug!(transaction_id = id, "rules committed");
        Ok(id)
    }
}
