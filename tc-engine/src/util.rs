use crate::config::measurements::FlowMeasurements;
use netchar_engine::bw_sharing::{BandwidthSharing, BwConfig, Flow};
use netchar_engine::discovery::Discovery;
use netchar_engine::matrix::NetCharMatrix;
use netchar_engine::stats_tracker::RuleStats;
use netchar_engine::topology::{NetChar, Topology};
use netchar_engine::{EngineConfig, InMemoryStore, MAX_THROUGHPUT, TcEngine, THROUGHPUT_UNIT};

pub fn print_addresses(discovery: &Discovery) {
    println!("* Pods:");
    for (name, ip) in discovery.pods() {
        println!("  * {name}: {}", ip.map(|ip| &**ip).unwrap_or("-"));
    }

    if discovery.services().next().is_some() {
        println!("* Services:");
    }
    for (name, ip) in discovery.services() {
        println!("  * {name}: {}", ip.map(|ip| &**ip).unwrap_or("-"));
    }
}

pub fn print_topology(topology: &Topology) {
    println!("--- Topology ---");
    for element in topology.elements() {
        let placeholder = if element.synthetic { " (placeholder)" } else { "" };
        println!(
            "* {}: {} in {}/{}{placeholder}",
            element.name, element.kind, element.domain, element.zone
        );
        if let Some(parent) = &element.parent {
            println!("  | parent: {parent}");
        }
        if let Some(nl) = &element.network_location {
            println!("  | network location: {nl}");
        }
    }
}

pub fn print_matrix(matrix: &NetCharMatrix) {
    println!("--- Matrix ---");
    let names = matrix.names();
    for i in 0..matrix.size() {
        for j in i + 1..matrix.size() {
            println!(
                "* {} <-> {}: {}",
                names[i],
                names[j],
                describe(matrix.get(i, j))
            );
        }
    }
    println!("* Symmetric: {}", matrix.is_symmetric());
}

fn describe(nc: &NetChar) -> String {
    format!(
        "{} ms (+/- {} ms), {:.2}% loss, {}",
        nc.latency,
        nc.latency_variation,
        nc.packet_loss as f64 / 100.0,
        describe_rate(nc.throughput)
    )
}

fn describe_rate(bps: i64) -> String {
    if bps >= MAX_THROUGHPUT {
        "unlimited".to_string()
    } else {
        format!("{} Mbps", bps as f64 / THROUGHPUT_UNIT as f64)
    }
}

pub fn print_rules(engine: &TcEngine) {
    println!("--- Rules ---");
    let topology = engine.topology();
    for dst in topology.rule_targets() {
        println!(
            "* {} ({})",
            dst.name,
            dst.ip.as_deref().unwrap_or("no address")
        );
        for filter in engine.filters_for(&dst.name) {
            println!(
                "  * slot {}: from {} ({}), {} ms (+/- {} ms), {:.2}% loss, {}",
                filter.slot,
                filter.src_name,
                filter.src_ip.as_deref().unwrap_or("no address"),
                filter.latency,
                filter.latency_variation,
                filter.packet_loss as f64 / 100.0,
                describe_rate(filter.data_rate)
            );
        }
    }
}

pub fn print_service_rules(store: &InMemoryStore, config: &EngineConfig) {
    let rules = store.hashes_with_prefix(&format!("{}:lb:", config.module));
    if rules.is_empty() {
        return;
    }

    println!("--- Service rules ---");
    for (key, fields) in rules {
        let field = |name: &str| fields.get(name).map(String::as_str).unwrap_or("-");
        println!(
            "* {key}: {} {} -> {} ({}:{})",
            field("svc-type"),
            field("svc-name"),
            field("lb-svc-name"),
            field("lb-svc-ip"),
            field("lb-svc-port")
        );
    }
}

/// Prints what the rule passes between two snapshots changed
pub fn print_rule_pass(before: &RuleStats, after: &RuleStats) {
    println!("* Rule passes: {}", after.passes - before.passes);
    println!("  * Created: {}", after.totals.created - before.totals.created);
    println!("  * Updated: {}", after.totals.updated - before.totals.updated);
    println!(
        "  * Replaced: {}",
        after.totals.replaced - before.totals.replaced
    );
    println!(
        "  * Collected: {}",
        after.totals.collected - before.totals.collected
    );
}

pub fn print_publications(store: &InMemoryStore, config: &EngineConfig) {
    println!("--- Publications ---");
    for channel in [&config.net_rules_channel, &config.lb_rules_channel] {
        let payloads: Vec<_> = store
            .published_on(channel)
            .into_iter()
            .map(|payload| format!("{payload:?}"))
            .collect();
        println!("* {channel}: {}", payloads.join(", "));
    }
}

pub fn print_bw_config(config: &BwConfig) {
    println!("--- Bandwidth sharing ---");
    println!(
        "* Recalculation period: {} ms",
        config.recalculation_period.as_millis()
    );
    println!("* Percentage tunables: {}", config.is_percentage);
    let tunables = &config.tunables;
    println!("* Tunables:");
    println!(
        "  * Max bandwidth per inactive flow: {}",
        tunables.max_bw_per_inactive_flow
    );
    println!(
        "  * Min activity threshold: {}",
        tunables.min_activity_threshold
    );
    println!("  * Incremental step: {}", tunables.incremental_step);
    println!(
        "  * Inactivity incremental step: {}",
        tunables.inactivity_incremental_step
    );
    println!(
        "  * Action upper threshold: {}",
        tunables.action_upper_threshold
    );
    println!(
        "  * Toleration threshold: {}",
        tunables.toleration_threshold
    );
}

pub fn print_segments(sharing: &BandwidthSharing) {
    println!("* Segments:");
    for segment in sharing.segments() {
        println!(
            "  * {}: {} Mbps shared by {} flows",
            segment.name,
            segment.max_throughput,
            segment.flows.len()
        );
    }

    println!("* Paths:");
    for flow in sharing.flows() {
        if let Some(path) = &flow.path {
            let path: Vec<_> = path.iter().map(|s| &**s).collect();
            println!("  * {}: {}", flow.name, path.join(" -> "));
        }
    }
}

/// Prints the allocation of every flow that is measured or holds bandwidth
pub fn print_allocations(flows: &[Flow], measurements: &FlowMeasurements) {
    for flow in flows {
        let measured = measurements.get(&*flow.name).copied().unwrap_or(0.0);
        if measured == 0.0 && flow.allocated.throughput == 0.0 {
            continue;
        }

        println!(
            "  * {}: measured {measured:.1} Mbps, allocated {:.1} Mbps",
            flow.name, flow.allocated.throughput
        );
    }
}
