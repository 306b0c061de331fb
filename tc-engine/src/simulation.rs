use crate::config::EngineInputs;
use crate::config::cli::{BwSharingOpt, CliOpt, Command};
use crate::config::measurements::{random_measurements, write_measurements};
use crate::config::platform::JsonPlatform;
use crate::util;
use anyhow::{Context, bail};
use fastrand::Rng;
use netchar_engine::discovery::DiscoveryState;
use netchar_engine::topology::Topology;
use netchar_engine::{EngineConfig, InMemoryStore, Store, TcEngine};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Polls after which discovery is considered stuck
const MAX_DISCOVERY_POLLS: u32 = 100;

/// Leaves the listeners time to pick up a published event
const EVENT_SETTLE_TIME: Duration = Duration::from_millis(1);

pub async fn run(options: &CliOpt, inputs: EngineInputs) -> anyhow::Result<()> {
    println!("--- Params ---");
    let rng_seed = if options.non_deterministic {
        fastrand::u64(..)
    } else {
        options.rng_seed
    };
    println!("* Random seed: {rng_seed}");
    println!("* Scenario path: {}", options.scenario.display());
    match &options.platform {
        Some(path) => println!("* Platform inventory path: {}", path.display()),
        None => println!("* Platform inventory: generated"),
    }
    if let Some(path) = &options.lb_mapping {
        println!("* LB mapping path: {}", path.display());
    }
    println!("* Discovery interval: {} ms", options.discovery_interval_ms);

    let mut rng = Rng::with_seed(rng_seed);
    let platform = Arc::new(match inputs.platform.clone() {
        Some(inventory) => JsonPlatform::new(inventory),
        None => {
            let scenario = Topology::parse(&inputs.scenario)?;
            JsonPlatform::generated(&Topology::build(&scenario, None)?, &mut rng)
        }
    });

    let config = EngineConfig {
        discovery_interval: Duration::from_millis(options.discovery_interval_ms),
        ..EngineConfig::default()
    };
    let store = InMemoryStore::new();
    let engine = TcEngine::new(config.clone(), Arc::new(store.clone()), platform.clone());
    engine.initialize().context("failed to initialize the engine")?;

    let cancellation_token = CancellationToken::new();
    let tasks = engine.spawn_listeners(cancellation_token.clone());

    if let Some(mapping) = inputs.lb_mapping.clone() {
        store.json_set(&config.lb_mapping_key, mapping)?;
    }
    store.json_set(&config.active_scenario_key, inputs.scenario.clone())?;
    store.publish(&config.active_channel, "")?;

    println!("--- Discovery ---");
    let start = Instant::now();
    let mut discovery = engine.watch_discovery();
    tokio::time::timeout(
        config.discovery_interval * MAX_DISCOVERY_POLLS,
        discovery.wait_for(|state| *state == DiscoveryState::Ready),
    )
    .await
    .context("platform discovery did not complete")?
    .context("the engine was dropped during discovery")?;
    println!(
        "* Ready after {} ms ({} platform polls)",
        start.elapsed().as_millis(),
        platform.pod_polls()
    );
    util::print_addresses(&engine.discovery());

    match &options.command {
        Command::Matrix => {
            util::print_topology(&engine.topology());
            util::print_matrix(&engine.matrix());
        }
        Command::Rules(_) => {
            util::print_rules(&engine);
            util::print_service_rules(&store, &config);

            if let Some(update) = inputs.scenario_update.clone() {
                println!("--- Scenario update ---");
                let before = engine.rule_stats();
                store.json_set(&config.active_scenario_key, update)?;
                store.publish(&config.active_channel, "")?;
                tokio::time::sleep(EVENT_SETTLE_TIME).await;

                util::print_rule_pass(&before, &engine.rule_stats());
                util::print_rules(&engine);
            }
        }
        Command::BwSharing(opt) => {
            run_bw_sharing(&engine, &store, &config, &inputs, opt, &mut rng).await?;
        }
    }

    util::print_publications(&store, &config);

    cancellation_token.cancel();
    for task in tasks {
        task.await.context("engine task crashed")?;
    }

    Ok(())
}

async fn run_bw_sharing(
    engine: &TcEngine,
    store: &InMemoryStore,
    config: &EngineConfig,
    inputs: &EngineInputs,
    opt: &BwSharingOpt,
    rng: &mut Rng,
) -> anyhow::Result<()> {
    store.set_entry(&config.bw_controls_key, inputs.controls.clone())?;
    store.publish(&config.bw_controls_channel, "")?;
    tokio::time::sleep(EVENT_SETTLE_TIME).await;

    let sharing = engine.bandwidth_sharing();
    util::print_bw_config(sharing.config());
    if !sharing.is_started() {
        bail!("bandwidth sharing did not start, check the `action` control");
    }
    util::print_segments(&sharing);

    // Measurements land halfway through a period, so each period sees exactly one of them
    let period = sharing.config().recalculation_period;
    tokio::time::sleep(period / 2).await;

    println!("--- Allocations ---");
    for index in 0..opt.periods {
        let measurements = match &inputs.measurements {
            Some(json) => json.period(index as usize),
            None => random_measurements(&engine.flows(), rng),
        };
        write_measurements(store, &measurements)?;
        tokio::time::sleep(period).await;

        println!("* Period {index}:");
        util::print_allocations(&engine.flows(), &measurements);
    }

    Ok(())
}
