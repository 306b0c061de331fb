use crate::config::cli::{CliOpt, Command};
use crate::config::measurements::MeasurementsJson;
use crate::config::platform::PlatformJson;
use anyhow::Context;
use netchar_engine::store::Fields;
use netchar_engine::topology::Topology;
use netchar_engine::topology::services::LbMapping;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub mod cli;
pub mod measurements;
pub mod platform;

/// Everything read from disk before the engine starts
pub struct EngineInputs {
    /// Stored as-is, the engine parses it
    pub scenario: String,
    pub scenario_update: Option<String>,
    pub platform: Option<PlatformJson>,
    pub lb_mapping: Option<String>,
    pub controls: Fields,
    pub measurements: Option<MeasurementsJson>,
}

impl EngineInputs {
    pub fn load(options: &CliOpt) -> anyhow::Result<Self> {
        let scenario = read_scenario(&options.scenario)?;
        let platform = options
            .platform
            .as_deref()
            .map(|path| read_json(path, "platform inventory"))
            .transpose()?;

        let lb_mapping = match &options.lb_mapping {
            Some(path) => {
                let json = read(path, "LB mapping")?;
                LbMapping::from_json(&json)
                    .with_context(|| format!("invalid LB mapping in {}", path.display()))?;
                Some(json)
            }
            None => None,
        };

        let mut inputs = Self {
            scenario,
            scenario_update: None,
            platform,
            lb_mapping,
            controls: Fields::from([("action".to_string(), "start".to_string())]),
            measurements: None,
        };

        match &options.command {
            Command::Matrix => {}
            Command::Rules(opt) => {
                inputs.scenario_update = opt
                    .scenario_update
                    .as_deref()
                    .map(read_scenario)
                    .transpose()?;
            }
            Command::BwSharing(opt) => {
                if let Some(path) = &opt.controls {
                    let controls: BTreeMap<String, String> =
                        read_json(path, "bandwidth-sharing controls")?;
                    inputs.controls = controls.into_iter().collect();
                }
                inputs.measurements = opt
                    .measurements
                    .as_deref()
                    .map(|path| read_json(path, "throughput measurements"))
                    .transpose()?;
            }
        }

        Ok(inputs)
    }
}

fn read(path: &Path, what: &str) -> anyhow::Result<String> {
    fs::read_to_string(path)
        .with_context(|| format!("failed to read the {what} from {}", path.display()))
}

fn read_json<T: DeserializeOwned>(path: &Path, what: &str) -> anyhow::Result<T> {
    let json = read(path, what)?;
    serde_json::from_str(&json).with_context(|| format!("invalid {what} in {}", path.display()))
}

/// Reads a scenario, rejecting documents the engine would not be able to load
fn read_scenario(path: &Path) -> anyhow::Result<String> {
    let json = read(path, "scenario")?;
    let scenario = Topology::parse(&json)
        .with_context(|| format!("invalid scenario in {}", path.display()))?;
    Topology::build(&scenario, None)
        .with_context(|| format!("invalid scenario in {}", path.display()))?;
    Ok(json)
}
