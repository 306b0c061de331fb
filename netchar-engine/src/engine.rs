//! Event handling: ties the topology, discovery, rule and bandwidth-sharing state to the store's
//! channels
//!
//! Every handler takes the engine lock for its whole run, so a rebuild always completes before the
//! next event is looked at. Handlers never panic: failures are logged and leave the rules as they
//! were for this cycle.

use crate::bw_sharing::{BandwidthSharing, BwConfig, ControlAction, Flow, RecalculationSummary};
use crate::discovery::{Discovery, DiscoveryState, PlatformClient, PlatformError};
use crate::matrix::NetCharMatrix;
use crate::rules::{FilterInfo, FlowRateSink, RuleError, RuleManager};
use crate::stats_tracker::{RuleStats, RuleStatsTracker};
use crate::store::{Store, StoreError};
use crate::topology::services::LbMapping;
use crate::topology::{Topology, TopologyError};
use futures::{FutureExt, select_biased};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Notify, broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error(transparent)]
    Rule(#[from] RuleError),
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error("invalid LB mapping document: {0}")]
    LbMapping(#[source] serde_json::Error),
}

/// Channel and key names, plus the polling interval
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Namespace of every key written by the engine
    pub module: Arc<str>,
    pub discovery_interval: Duration,
    pub active_channel: Arc<str>,
    pub lb_mapping_channel: Arc<str>,
    pub bw_controls_channel: Arc<str>,
    pub net_rules_channel: Arc<str>,
    pub lb_rules_channel: Arc<str>,
    pub active_scenario_key: Arc<str>,
    pub lb_mapping_key: Arc<str>,
    pub bw_controls_key: Arc<str>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            module: "tc-engine".into(),
            discovery_interval: Duration::from_millis(1000),
            active_channel: "ctrl-engine-active".into(),
            lb_mapping_channel: "mg-manager-lb".into(),
            bw_controls_channel: "bw-sharing-controls".into(),
            net_rules_channel: "tc-engine-net".into(),
            lb_rules_channel: "tc-engine-lb".into(),
            active_scenario_key: "ctrl-engine:active".into(),
            lb_mapping_key: "mg-manager:lb".into(),
            bw_controls_key: "bw-sharing-controls".into(),
        }
    }
}

struct EngineState {
    topology: Topology,
    matrix: NetCharMatrix,
    discovery: Discovery,
    rules: RuleManager,
    bw: BandwidthSharing,
}

struct Shared {
    config: EngineConfig,
    store: Arc<dyn Store>,
    platform: Arc<dyn PlatformClient>,
    state: Mutex<EngineState>,
    recalculating: AtomicBool,
    stats: RuleStatsTracker,
    discovery_tx: watch::Sender<DiscoveryState>,
    /// Restarts the recalculation period
    controls_changed: Notify,
}

/// A handle to the engine, cheap to clone into background tasks
#[derive(Clone)]
pub struct TcEngine {
    shared: Arc<Shared>,
}

impl TcEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn Store>,
        platform: Arc<dyn PlatformClient>,
    ) -> Self {
        let stats = RuleStatsTracker::new();
        let state = EngineState {
            topology: Topology::default(),
            matrix: NetCharMatrix::default(),
            discovery: Discovery::default(),
            rules: RuleManager::new(&config, store.clone(), stats.clone()),
            bw: BandwidthSharing::default(),
        };

        Self {
            shared: Arc::new(Shared {
                config,
                store,
                platform,
                state: Mutex::new(state),
                recalculating: AtomicBool::new(false),
                stats,
                discovery_tx: watch::Sender::new(DiscoveryState::Idle),
                controls_changed: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Starts from a clean slate and picks up whatever is already active
    pub fn initialize(&self) -> Result<(), EngineError> {
        self.shared.store.flush(&self.shared.config.module)?;
        self.process_active_scenario_update()?;
        self.process_bw_controls_update()?;
        Ok(())
    }

    /// Dispatches a message received on one of the engine's channels
    ///
    /// Payloads are only notifications: the current value is always read back from the store.
    pub fn handle_event(&self, channel: &str, payload: &str) {
        let config = &self.shared.config;
        let result = if channel == &*config.active_channel {
            self.process_active_scenario_update()
        } else if channel == &*config.lb_mapping_channel {
            self.process_lb_mapping_update()
        } else if channel == &*config.bw_controls_channel {
            self.process_bw_controls_update()
        } else {
            tracing::trace!(channel, payload, "ignoring message");
            return;
        };

        if let Err(e) = result {
            tracing::error!(channel, "event not processed: {e}");
        }
    }

    /// Reloads the active scenario and brings everything derived from it up to date
    ///
    /// A missing or unnamed scenario clears the engine. Before discovery completes only the
    /// required addresses are registered, after that the rules are recomputed right away.
    pub fn process_active_scenario_update(&self) -> Result<(), EngineError> {
        let shared = &self.shared;
        let Some(json) = shared.store.json_get(&shared.config.active_scenario_key)? else {
            tracing::info!("no active scenario");
            return self.stop_scenario();
        };

        let scenario = match Topology::parse(&json) {
            Ok(scenario) => scenario,
            Err(e) => {
                tracing::error!("failed to parse the active scenario: {e}");
                self.stop_scenario()?;
                return Err(e.into());
            }
        };

        if scenario.name.is_empty() {
            return self.stop_scenario();
        }

        let mut guard = shared.state.lock();
        let topology = match Topology::build(&scenario, Some(&guard.topology)) {
            Ok(topology) => topology,
            Err(e) => {
                drop(guard);
                tracing::error!(scenario = %scenario.name, "invalid active scenario: {e}");
                self.stop_scenario()?;
                return Err(e.into());
            }
        };
        let state = &mut *guard;

        for pod in topology.required_pods() {
            state.discovery.register_pod(pod);
        }
        for service in topology.services().required_addresses() {
            state.discovery.register_service(service);
        }
        state.topology = topology;
        tracing::info!(
            scenario = %scenario.name,
            elements = state.topology.elements().len(),
            "active scenario loaded"
        );

        match state.discovery.state() {
            DiscoveryState::Idle => {
                state.discovery.begin();
                self.publish_discovery_state(state);
            }
            DiscoveryState::Initializing => {
                tracing::debug!("platform discovery already in progress");
            }
            DiscoveryState::Ready => {
                let overwrite_data_rate = !state.bw.is_started();
                self.refresh_rules(state, overwrite_data_rate)?;
                self.refresh_service_mapping(state)?;
                if state.bw.is_started() {
                    state.bw.rebuild(&state.topology);
                }
            }
        }

        Ok(())
    }

    /// Rewrites the load-balancing rules from the stored LB mapping, only once discovery is done
    pub fn process_lb_mapping_update(&self) -> Result<(), EngineError> {
        let mut state = self.shared.state.lock();
        if state.discovery.state() != DiscoveryState::Ready {
            tracing::debug!(state = %state.discovery.state(), "LB mapping update ignored");
            return Ok(());
        }

        self.refresh_service_mapping(&mut state)
    }

    /// Reloads the bandwidth-sharing controls, starting or stopping the recalculation
    ///
    /// The next recalculation happens one (possibly new) period after this call.
    pub fn process_bw_controls_update(&self) -> Result<(), EngineError> {
        let fields = self
            .shared
            .store
            .get_entry(&self.shared.config.bw_controls_key)?
            .unwrap_or_default();

        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        match state.bw.update_controls(&fields) {
            ControlAction::Start => state.bw.start(&state.topology),
            ControlAction::Stop => state.bw.stop(),
            ControlAction::None => {}
        }
        self.shared.controls_changed.notify_one();

        Ok(())
    }

    /// Forgets the scenario and removes every rule written by the engine
    pub fn stop_scenario(&self) -> Result<(), EngineError> {
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        state.topology = Topology::default();
        state.matrix = NetCharMatrix::default();
        state.discovery.reset();
        state.bw.clear();
        self.publish_discovery_state(state);

        state.rules.flush_all()?;
        tracing::info!("scenario stopped, rules cleared");
        Ok(())
    }

    /// Polls the platform once, returns true when this poll completed discovery
    ///
    /// Completing discovery writes the first generation of rules. Discovery only becomes ready
    /// once they are stored, a failed write leaves it initializing for the next poll.
    pub fn poll_platform_once(&self) -> Result<bool, EngineError> {
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        if state.discovery.state() != DiscoveryState::Initializing {
            return Ok(false);
        }

        let scenario = state
            .topology
            .scenario_name()
            .map(|name| name.to_string())
            .unwrap_or_default();
        if !state
            .discovery
            .poll(self.shared.platform.as_ref(), &scenario)?
        {
            return Ok(false);
        }

        let written = self.refresh_rules(state, true).and_then(|()| {
            match self.refresh_service_mapping(state) {
                // Not worth another discovery round, the next mapping update fixes it
                Err(EngineError::LbMapping(e)) => {
                    tracing::error!("stored LB mapping ignored: {e}");
                    Ok(())
                }
                result => result,
            }
        });
        if let Err(e) = written {
            state.discovery.reopen();
            return Err(e);
        }

        self.publish_discovery_state(state);
        if state.bw.is_started() {
            state.bw.rebuild(&state.topology);
        }

        Ok(true)
    }

    /// Runs one bandwidth-sharing pass
    ///
    /// Returns `None` when sharing is stopped, or when another pass is still running.
    pub fn recalculate_bandwidth_once(&self) -> Result<Option<RecalculationSummary>, EngineError> {
        if self.shared.recalculating.swap(true, Ordering::AcqRel) {
            tracing::debug!("recalculation still in progress, skipping tick");
            return Ok(None);
        }

        let result = self.recalculate_bandwidth_locked();
        self.shared.recalculating.store(false, Ordering::Release);
        result
    }

    fn recalculate_bandwidth_locked(&self) -> Result<Option<RecalculationSummary>, EngineError> {
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        if !state.bw.is_started() {
            return Ok(None);
        }

        state.bw.read_measurements(self.shared.store.as_ref())?;
        let sink: &mut dyn FlowRateSink = &mut state.rules;
        Ok(Some(state.bw.recalculate(sink)?))
    }

    /// Spawns the channel listeners, the discovery poller and the bandwidth ticker
    ///
    /// Every task ends when `cancellation_token` is cancelled.
    pub fn spawn_listeners(&self, cancellation_token: CancellationToken) -> Vec<JoinHandle<()>> {
        let config = &self.shared.config;
        let mut tasks = Vec::new();

        for channel in [
            config.active_channel.clone(),
            config.lb_mapping_channel.clone(),
            config.bw_controls_channel.clone(),
        ] {
            let rx = self.shared.store.subscribe();
            tasks.push(tokio::spawn(self.clone().listen(
                channel,
                rx,
                cancellation_token.clone(),
            )));
        }

        let engine = self.clone();
        let token = cancellation_token.clone();
        tasks.push(tokio::spawn(async move {
            let interval = engine.shared.config.discovery_interval;
            loop {
                select_biased! {
                    _ = token.cancelled().fuse() => break,
                    _ = tokio::time::sleep(interval).fuse() => {}
                }

                if let Err(e) = engine.poll_platform_once() {
                    tracing::warn!("platform discovery failed, retrying: {e}");
                }
            }
        }));

        let engine = self.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                let period = engine.bw_config().recalculation_period;
                select_biased! {
                    _ = cancellation_token.cancelled().fuse() => break,
                    _ = engine.shared.controls_changed.notified().fuse() => continue,
                    _ = tokio::time::sleep(period).fuse() => {}
                }

                if let Err(e) = engine.recalculate_bandwidth_once() {
                    tracing::warn!("bandwidth recalculation failed: {e}");
                }
            }
        }));

        tasks
    }

    async fn listen(
        self,
        channel: Arc<str>,
        mut rx: broadcast::Receiver<crate::store::Message>,
        cancellation_token: CancellationToken,
    ) {
        loop {
            let message = select_biased! {
                _ = cancellation_token.cancelled().fuse() => break,
                message = rx.recv().fuse() => message,
            };

            match message {
                Ok(message) if message.channel == channel => {
                    self.handle_event(&message.channel, &message.payload);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    // The store is re-read on every event, so a single catch-up run is enough
                    tracing::warn!(%channel, missed, "listener lagged behind");
                    self.handle_event(&channel, "");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    fn refresh_rules(
        &self,
        state: &mut EngineState,
        overwrite_data_rate: bool,
    ) -> Result<(), EngineError> {
        state.topology.resolve_addresses(&state.discovery);
        state.matrix = NetCharMatrix::compute(&state.topology);

        let summary = state.rules.apply_matrix(
            &state.topology,
            &state.matrix,
            &state.discovery,
            overwrite_data_rate,
        )?;
        let transaction_id = state.rules.commit_and_notify()?;
        tracing::info!(
            created = summary.created,
            updated = summary.updated,
            replaced = summary.replaced,
            collected = summary.collected,
            transaction_id,
            "network characteristics rules applied"
        );
        Ok(())
    }

    fn refresh_service_mapping(&self, state: &mut EngineState) -> Result<(), EngineError> {
        match self.shared.store.json_get(&self.shared.config.lb_mapping_key)? {
            Some(json) => {
                let mapping = LbMapping::from_json(&json).map_err(EngineError::LbMapping)?;
                state.topology.services_mut().apply_lb_mapping(&mapping);
            }
            None => tracing::debug!("no LB mapping stored yet"),
        }

        state
            .rules
            .apply_service_mapping(state.topology.services(), &state.discovery)?;
        Ok(())
    }

    fn publish_discovery_state(&self, state: &EngineState) {
        self.shared.discovery_tx.send_replace(state.discovery.state());
    }

    /// Follows discovery state changes
    pub fn watch_discovery(&self) -> watch::Receiver<DiscoveryState> {
        self.shared.discovery_tx.subscribe()
    }

    pub fn discovery_state(&self) -> DiscoveryState {
        self.shared.state.lock().discovery.state()
    }

    pub fn topology(&self) -> Topology {
        self.shared.state.lock().topology.clone()
    }

    pub fn matrix(&self) -> NetCharMatrix {
        self.shared.state.lock().matrix.clone()
    }

    pub fn discovery(&self) -> Discovery {
        self.shared.state.lock().discovery.clone()
    }

    pub fn flows(&self) -> Vec<Flow> {
        self.shared.state.lock().bw.flows().to_vec()
    }

    pub fn bandwidth_sharing(&self) -> BandwidthSharing {
        self.shared.state.lock().bw.clone()
    }

    pub fn bw_config(&self) -> BwConfig {
        self.shared.state.lock().bw.config().clone()
    }

    /// The rules installed at `dst`, sorted by source name
    pub fn filters_for(&self, dst: &str) -> Vec<FilterInfo> {
        self.shared.state.lock().rules.filters_for(dst)
    }

    pub fn rule_stats(&self) -> RuleStats {
        self.shared.stats.snapshot()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::discovery::test::FakePlatform;
    use crate::store::{Fields, InMemoryStore};

    const SCENARIO: &str = r#"{
        "name": "engine-scenario",
        "deployment": {"domains": [{"name": "operator1", "zones": [{"name": "zone1", "networkLocations": [
            {"name": "z1-default", "physicalLocations": [
                {"name": "edge1", "type": "EDGE", "processes": [
                    {"name": "edge1-app", "serviceConfig": {"name": "edge1-svc", "meSvcName": "svc",
                        "ports": [{"protocol": "TCP", "port": 80}]}}
                ]}
            ]},
            {"name": "z1-poa1", "terminalLinkThroughput": 20, "physicalLocations": [
                {"name": "ue1", "type": "UE", "processes": [{"name": "ue1-app"}]}
            ]}
        ]}]}]}
    }"#;

    const MAPPING: &str = r#"{"networkElements": [
        {"name": "ue1-app", "serviceMaps": [{"mgSvcName": "svc", "lbSvcName": "edge1-svc"}]}
    ]}"#;

    struct Fixture {
        store: InMemoryStore,
        platform: Arc<FakePlatform>,
        engine: TcEngine,
    }

    impl Fixture {
        fn new() -> Self {
            let store = InMemoryStore::new();
            let platform = Arc::new(FakePlatform::with(
                &[("edge1-app", "10.0.0.1")],
                &[("svc", "10.96.0.1"), ("edge1-svc", "10.96.0.2")],
            ));
            let engine = TcEngine::new(
                EngineConfig::default(),
                Arc::new(store.clone()),
                platform.clone(),
            );

            Self {
                store,
                platform,
                engine,
            }
        }

        fn activate(&self, json: &str) {
            self.store
                .json_set("ctrl-engine:active", json.to_string())
                .unwrap();
            self.store.publish("ctrl-engine-active", "").unwrap();
        }

        fn set_controls(&self, pairs: &[(&str, &str)]) {
            let fields: Fields = pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            self.store.set_entry("bw-sharing-controls", fields).unwrap();
            self.store.publish("bw-sharing-controls", "").unwrap();
        }
    }

    #[test]
    fn rules_wait_for_discovery() {
        let fixture = Fixture::new();
        fixture
            .store
            .json_set("ctrl-engine:active", SCENARIO.to_string())
            .unwrap();

        fixture.engine.process_active_scenario_update().unwrap();
        assert_eq!(fixture.engine.discovery_state(), DiscoveryState::Initializing);

        // ue1-app has no address yet
        assert!(!fixture.engine.poll_platform_once().unwrap());
        assert!(fixture.engine.filters_for("edge1-app").is_empty());
        assert!(fixture.store.published_on("tc-engine-net").is_empty());

        fixture.platform.set_pod("ue1-app", "10.0.0.2");
        assert!(fixture.engine.poll_platform_once().unwrap());
        assert_eq!(fixture.engine.discovery_state(), DiscoveryState::Ready);

        let filters = fixture.engine.filters_for("edge1-app");
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].src_ip.as_deref(), Some("10.0.0.2"));
        assert_eq!(fixture.store.published_on("tc-engine-net"), vec!["1"]);
        assert_eq!(fixture.store.published_on("tc-engine-lb"), vec![""]);

        // Nothing left to discover
        assert!(!fixture.engine.poll_platform_once().unwrap());
    }

    #[test]
    fn lb_mapping_is_ignored_until_ready() {
        let fixture = Fixture::new();
        fixture
            .store
            .json_set("mg-manager:lb", MAPPING.to_string())
            .unwrap();

        fixture.engine.process_lb_mapping_update().unwrap();
        assert!(fixture.store.published_on("tc-engine-lb").is_empty());

        fixture.platform.set_pod("ue1-app", "10.0.0.2");
        fixture
            .store
            .json_set("ctrl-engine:active", SCENARIO.to_string())
            .unwrap();
        fixture.engine.process_active_scenario_update().unwrap();
        fixture.engine.poll_platform_once().unwrap();

        let rule = fixture
            .store
            .get_entry("tc-engine:lb:ue1-app:svc:80")
            .unwrap()
            .unwrap();
        assert_eq!(rule["lb-svc-ip"], "10.96.0.2");

        // A topology update keeps the selection
        fixture.engine.process_active_scenario_update().unwrap();
        assert!(
            fixture
                .store
                .get_entry("tc-engine:lb:ue1-app:svc:80")
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn invalid_lb_mapping_is_reported() {
        let fixture = Fixture::new();
        fixture.platform.set_pod("ue1-app", "10.0.0.2");
        fixture
            .store
            .json_set("ctrl-engine:active", SCENARIO.to_string())
            .unwrap();
        fixture.engine.process_active_scenario_update().unwrap();
        fixture.engine.poll_platform_once().unwrap();

        fixture
            .store
            .json_set("mg-manager:lb", "not json".to_string())
            .unwrap();
        assert!(matches!(
            fixture.engine.process_lb_mapping_update(),
            Err(EngineError::LbMapping(_))
        ));
    }

    #[test]
    fn invalid_lb_mapping_does_not_hold_discovery() {
        let fixture = Fixture::new();
        fixture.platform.set_pod("ue1-app", "10.0.0.2");
        fixture
            .store
            .json_set("mg-manager:lb", "not json".to_string())
            .unwrap();
        fixture
            .store
            .json_set("ctrl-engine:active", SCENARIO.to_string())
            .unwrap();
        fixture.engine.process_active_scenario_update().unwrap();

        assert!(fixture.engine.poll_platform_once().unwrap());
        assert_eq!(fixture.engine.discovery_state(), DiscoveryState::Ready);
        assert_eq!(fixture.engine.filters_for("edge1-app").len(), 1);

        fixture
            .store
            .json_set("mg-manager:lb", MAPPING.to_string())
            .unwrap();
        fixture.engine.process_lb_mapping_update().unwrap();
        assert!(
            fixture
                .store
                .get_entry("tc-engine:lb:ue1-app:svc:80")
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn clearing_the_scenario_removes_every_rule() {
        let fixture = Fixture::new();
        fixture.platform.set_pod("ue1-app", "10.0.0.2");
        fixture
            .store
            .json_set("ctrl-engine:active", SCENARIO.to_string())
            .unwrap();
        fixture.engine.process_active_scenario_update().unwrap();
        fixture.engine.poll_platform_once().unwrap();
        assert!(!fixture.store.hashes_with_prefix("tc-engine:").is_empty());

        fixture
            .store
            .json_set("ctrl-engine:active", r#"{"name": ""}"#.to_string())
            .unwrap();
        fixture.engine.process_active_scenario_update().unwrap();

        assert_eq!(fixture.engine.discovery_state(), DiscoveryState::Idle);
        assert!(fixture.engine.topology().is_empty());
        assert!(fixture.store.hashes_with_prefix("tc-engine:").is_empty());
        assert_eq!(
            fixture.store.published_on("tc-engine-net").last().unwrap(),
            "delAll"
        );
        assert_eq!(
            fixture.store.published_on("tc-engine-lb").last().unwrap(),
            "delAll"
        );
    }

    #[test]
    fn malformed_scenario_clears_the_engine() {
        let fixture = Fixture::new();
        fixture
            .store
            .json_set("ctrl-engine:active", "{".to_string())
            .unwrap();

        assert!(matches!(
            fixture.engine.process_active_scenario_update(),
            Err(EngineError::Topology(_))
        ));
        assert_eq!(fixture.engine.discovery_state(), DiscoveryState::Idle);
        assert_eq!(fixture.store.published_on("tc-engine-net"), vec!["delAll"]);
    }

    #[test]
    fn duplicate_names_clear_the_engine() {
        let fixture = Fixture::new();
        fixture.platform.set_pod("ue1-app", "10.0.0.2");
        fixture
            .store
            .json_set("ctrl-engine:active", SCENARIO.to_string())
            .unwrap();
        fixture.engine.process_active_scenario_update().unwrap();
        fixture.engine.poll_platform_once().unwrap();
        assert_eq!(fixture.engine.filters_for("edge1-app").len(), 1);

        let duplicated = SCENARIO.replace("ue1-app", "edge1-app");
        fixture
            .store
            .json_set("ctrl-engine:active", duplicated)
            .unwrap();
        assert!(matches!(
            fixture.engine.process_active_scenario_update(),
            Err(EngineError::Topology(TopologyError::DuplicateElement { .. }))
        ));

        assert_eq!(fixture.engine.discovery_state(), DiscoveryState::Idle);
        assert!(fixture.engine.topology().is_empty());
        assert!(fixture.engine.filters_for("edge1-app").is_empty());
        assert!(fixture.store.hashes_with_prefix("tc-engine:").is_empty());
        assert_eq!(
            fixture.store.published_on("tc-engine-net").last().unwrap(),
            "delAll"
        );
    }

    #[test]
    fn store_outage_during_discovery_is_retried() {
        let fixture = Fixture::new();
        fixture.platform.set_pod("ue1-app", "10.0.0.2");
        fixture
            .store
            .json_set("mg-manager:lb", MAPPING.to_string())
            .unwrap();
        fixture
            .store
            .json_set("ctrl-engine:active", SCENARIO.to_string())
            .unwrap();
        fixture.engine.process_active_scenario_update().unwrap();
        let mut discovery = fixture.engine.watch_discovery();

        fixture.store.set_unavailable(true);
        assert!(fixture.engine.poll_platform_once().is_err());
        assert_eq!(fixture.engine.discovery_state(), DiscoveryState::Initializing);
        assert_eq!(*discovery.borrow_and_update(), DiscoveryState::Initializing);
        assert!(fixture.engine.filters_for("edge1-app").is_empty());

        // Handlers only log
        fixture.engine.handle_event("ctrl-engine-active", "");
        assert_eq!(fixture.engine.discovery_state(), DiscoveryState::Initializing);

        fixture.store.set_unavailable(false);
        assert!(fixture.engine.poll_platform_once().unwrap());
        assert_eq!(fixture.engine.discovery_state(), DiscoveryState::Ready);
        assert_eq!(*discovery.borrow_and_update(), DiscoveryState::Ready);

        let filters = fixture.engine.filters_for("edge1-app");
        assert_eq!(filters.len(), 1);
        assert!(
            fixture
                .store
                .get_entry("tc-engine:net:edge1-app:filter:2")
                .unwrap()
                .is_some()
        );
        assert_eq!(fixture.store.published_on("tc-engine-net"), vec!["1"]);
        let rule = fixture
            .store
            .get_entry("tc-engine:lb:ue1-app:svc:80")
            .unwrap()
            .unwrap();
        assert_eq!(rule["lb-svc-ip"], "10.96.0.2");
    }

    #[tokio::test(start_paused = true)]
    async fn listeners_follow_the_channels() {
        let fixture = Fixture::new();
        let token = CancellationToken::new();
        let tasks = fixture.engine.spawn_listeners(token.clone());
        let mut discovery = fixture.engine.watch_discovery();

        fixture.activate(SCENARIO);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fixture.engine.discovery_state(), DiscoveryState::Initializing);

        // The pod comes up after a few polls
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fixture.engine.discovery_state(), DiscoveryState::Initializing);
        fixture.platform.set_pod("ue1-app", "10.0.0.2");

        discovery
            .wait_for(|state| *state == DiscoveryState::Ready)
            .await
            .unwrap();
        assert_eq!(fixture.engine.filters_for("ue1-app").len(), 1);

        token.cancel();
        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn bandwidth_ticker_pushes_allocations() {
        let fixture = Fixture::new();
        fixture.platform.set_pod("ue1-app", "10.0.0.2");
        let token = CancellationToken::new();
        let _tasks = fixture.engine.spawn_listeners(token.clone());

        fixture.activate(SCENARIO);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(fixture.engine.discovery_state(), DiscoveryState::Ready);
        let published = fixture.store.published_on("tc-engine-net").len();

        fixture
            .store
            .set_entry(
                "metrics:edge1-app:throughput",
                Fields::from([("ue1-app".to_string(), "15".to_string())]),
            )
            .unwrap();
        fixture.set_controls(&[("action", "start"), ("recalculationPeriod", "100")]);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fixture.engine.bw_config().action, ControlAction::Start);

        tokio::time::sleep(Duration::from_secs(1)).await;
        let stats = fixture.engine.rule_stats();
        assert!(stats.flow_rate_updates >= 1);
        assert!(fixture.store.published_on("tc-engine-net").len() > published);

        let flow = fixture
            .engine
            .flows()
            .into_iter()
            .find(|f| &*f.name == "ue1-app:edge1-app")
            .unwrap();
        let rule = &fixture.engine.filters_for("edge1-app")[0];
        assert_eq!(
            rule.data_rate,
            (crate::THROUGHPUT_UNIT as f64 * flow.allocated.throughput) as i64
        );

        // Stopping freezes the allocations
        fixture.set_controls(&[("action", "stop")]);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let updates = fixture.engine.rule_stats().flow_rate_updates;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fixture.engine.rule_stats().flow_rate_updates, updates);
        assert!(fixture.engine.flows().is_empty());

        token.cancel();
    }

    #[test]
    fn overlapping_recalculations_are_skipped() {
        let fixture = Fixture::new();
        fixture.engine.shared.recalculating.store(true, Ordering::Release);
        fixture.set_controls(&[("action", "start")]);
        fixture.engine.process_bw_controls_update().unwrap();

        assert_eq!(fixture.engine.recalculate_bandwidth_once().unwrap(), None);

        fixture.engine.shared.recalculating.store(false, Ordering::Release);
        assert!(fixture.engine.recalculate_bandwidth_once().unwrap().is_some());
    }
}
