use anyhow::{Context, bail};
use fastrand::Rng;
use netchar_engine::bw_sharing::{Flow, METRICS_PREFIX};
use netchar_engine::store::{Fields, Store};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Throughput measured on each flow, in Mbps, keyed by `<src>:<dst>`
pub type FlowMeasurements = BTreeMap<String, f64>;

#[derive(Deserialize, Clone, Debug)]
pub struct MeasurementsJson {
    /// One entry per recalculation period, the last one repeats
    periods: Vec<FlowMeasurements>,
}

impl MeasurementsJson {
    pub fn period(&self, index: usize) -> FlowMeasurements {
        self.periods
            .get(index)
            .or(self.periods.last())
            .cloned()
            .unwrap_or_default()
    }
}

/// Half of the flows are silent, the others use up to their maximum
pub fn random_measurements(flows: &[Flow], rng: &mut Rng) -> FlowMeasurements {
    flows
        .iter()
        .filter(|flow| flow.path.is_some())
        .map(|flow| {
            let mbps = if rng.bool() {
                (rng.f64() * flow.maximum.min(100.0) * 10.0).round() / 10.0
            } else {
                0.0
            };
            (flow.name.to_string(), mbps)
        })
        .collect()
}

/// Replaces the throughput hashes of every destination
pub fn write_measurements(store: &dyn Store, measurements: &FlowMeasurements) -> anyhow::Result<()> {
    let mut by_destination: BTreeMap<&str, Fields> = BTreeMap::new();
    for (flow, mbps) in measurements {
        let Some((src, dst)) = flow.split_once(':') else {
            bail!("invalid flow name `{flow}`, expected `<src>:<dst>`");
        };

        by_destination
            .entry(dst)
            .or_default()
            .insert(src.to_string(), mbps.to_string());
    }

    for key in store.keys_with_prefix(METRICS_PREFIX)? {
        store.del_entry(&key)?;
    }

    for (dst, fields) in by_destination {
        store
            .set_entry(&format!("{METRICS_PREFIX}{dst}:throughput"), fields)
            .with_context(|| format!("failed to store the measurements of {dst}"))?;
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use netchar_engine::InMemoryStore;

    #[test]
    fn measurements_are_grouped_by_destination() {
        let store = InMemoryStore::new();
        let measurements = FlowMeasurements::from([
            ("ue1-app:edge1-app".to_string(), 15.0),
            ("ue2-app:edge1-app".to_string(), 2.5),
        ]);

        write_measurements(&store, &measurements).unwrap();
        let fields = store
            .get_entry("metrics:edge1-app:throughput")
            .unwrap()
            .unwrap();
        assert_eq!(fields["ue1-app"], "15");
        assert_eq!(fields["ue2-app"], "2.5");

        // The next period replaces the previous one
        write_measurements(&store, &FlowMeasurements::new()).unwrap();
        assert!(store.keys_with_prefix("metrics:").unwrap().is_empty());
    }

    #[test]
    fn last_period_repeats() {
        let json: MeasurementsJson =
            serde_json::from_str(r#"{"periods": [{"a:b": 1.0}, {"a:b": 2.0}]}"#).unwrap();
        assert_eq!(json.period(0)["a:b"], 1.0);
        assert_eq!(json.period(5)["a:b"], 2.0);
    }

    fn flows() -> Vec<Flow> {
        let mut shared = Flow::new("ue1-app".into(), "edge1-app".into(), 1000.0);
        shared.path = Some(vec!["ue1-uplink".into()]);
        let mut capped = Flow::new("ue2-app".into(), "edge1-app".into(), 5.0);
        capped.path = Some(vec!["ue2-uplink".into()]);
        let unshared = Flow::new("edge1-app".into(), "edge2-app".into(), 1000.0);
        vec![shared, capped, unshared]
    }

    #[test]
    fn random_measurements_only_cover_shared_flows() {
        let flows = flows();
        for seed in 0..20 {
            let measurements = random_measurements(&flows, &mut Rng::with_seed(seed));
            let names: Vec<_> = measurements.keys().map(String::as_str).collect();
            assert_eq!(names, vec!["ue1-app:edge1-app", "ue2-app:edge1-app"]);

            assert!((0.0..=100.0).contains(&measurements["ue1-app:edge1-app"]));
            assert!((0.0..=5.0).contains(&measurements["ue2-app:edge1-app"]));
        }
    }

    #[test]
    fn random_measurements_follow_the_seed() {
        let flows = flows();
        let first = random_measurements(&flows, &mut Rng::with_seed(7));
        let second = random_measurements(&flows, &mut Rng::with_seed(7));
        assert_eq!(first, second);
    }

    #[test]
    fn flow_names_need_both_ends() {
        let store = InMemoryStore::new();
        let measurements = FlowMeasurements::from([("edge1-app".to_string(), 1.0)]);
        assert!(write_measurements(&store, &measurements).is_err());
    }
}
