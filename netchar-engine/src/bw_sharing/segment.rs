//! Per-segment fair share computation
//!
//! All throughput values are in Mbps.

use std::sync::Arc;

/// Tunables of the allocation algorithm, applied to each segment
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SegmentConfig {
    pub max_bw_per_inactive_flow: f64,
    pub min_activity_threshold: f64,
    pub incremental_step: f64,
    pub inactivity_incremental_step: f64,
    pub toleration_threshold: f64,
    pub action_upper_threshold: f64,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            max_bw_per_inactive_flow: 2.0,
            min_activity_threshold: 0.3,
            incremental_step: 3.0,
            inactivity_incremental_step: 1.0,
            toleration_threshold: 4.0,
            action_upper_threshold: 1.0,
        }
    }
}

impl SegmentConfig {
    /// Interprets every tunable as a percentage of `max_throughput` when `is_percentage` is set
    pub fn scaled(&self, is_percentage: bool, max_throughput: f64) -> Self {
        if !is_percentage {
            return *self;
        }

        let scale = |value: f64| value * max_throughput / 100.0;
        Self {
            max_bw_per_inactive_flow: scale(self.max_bw_per_inactive_flow),
            min_activity_threshold: scale(self.min_activity_threshold),
            incremental_step: scale(self.incremental_step),
            inactivity_incremental_step: scale(self.inactivity_incremental_step),
            toleration_threshold: scale(self.toleration_threshold),
            action_upper_threshold: scale(self.action_upper_threshold),
        }
    }
}

/// A throughput together with the band in which measurements leave it alone
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Allocation {
    pub throughput: f64,
    pub lower: f64,
    pub upper: f64,
}

impl Allocation {
    pub const ZERO: Allocation = Allocation {
        throughput: 0.0,
        lower: 0.0,
        upper: 0.0,
    };

    pub const UNPLANNED: Allocation = Allocation {
        throughput: f64::INFINITY,
        lower: f64::INFINITY,
        upper: f64::INFINITY,
    };

    pub fn contains(&self, measured: f64) -> bool {
        measured >= self.lower && measured <= self.upper
    }
}

/// Traffic from one element to another
#[derive(Clone, Debug)]
pub struct Flow {
    pub name: Arc<str>,
    pub src: Arc<str>,
    pub dst: Arc<str>,
    /// Ceiling imposed by both endpoints
    pub maximum: f64,
    /// What the shaping rule currently enforces
    pub allocated: Allocation,
    /// The most constrained plan across the flow's segments, in the current pass
    pub max_planned: Allocation,
    /// The plan of the segment being evaluated
    pub planned: Allocation,
    pub measured: f64,
    /// Segment names, from source to destination; flows between two non-UE elements have none
    pub path: Option<Vec<Arc<str>>>,
}

impl Flow {
    pub fn new(src: Arc<str>, dst: Arc<str>, maximum: f64) -> Self {
        Self {
            name: format!("{src}:{dst}").into(),
            src,
            dst,
            maximum,
            allocated: Allocation::ZERO,
            max_planned: Allocation::UNPLANNED,
            planned: Allocation::ZERO,
            measured: 0.0,
            path: None,
        }
    }

    fn clamped(&self, throughput: f64) -> f64 {
        throughput.min(self.maximum)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Category {
    /// Below the fair share even after growing by one step
    Under,
    /// Would reach the fair share
    AtFairShare,
}

/// A choke point shared by every flow crossing it
#[derive(Clone, Debug)]
pub struct Segment {
    pub name: Arc<str>,
    pub max_throughput: f64,
    /// Infinite while no flow is active
    pub fair_share: f64,
    pub config: SegmentConfig,
    /// Indices into the flow arena
    pub flows: Vec<usize>,
}

impl Segment {
    pub fn new(name: Arc<str>, max_throughput: f64, config: SegmentConfig) -> Self {
        Self {
            name,
            max_throughput,
            fair_share: f64::INFINITY,
            config,
            flows: Vec::new(),
        }
    }

    pub fn update_fair_share(&mut self, flows: &[Flow]) {
        let active = self
            .flows
            .iter()
            .filter(|&&i| flows[i].measured >= self.config.min_activity_threshold)
            .count();

        self.fair_share = if active == 0 {
            f64::INFINITY
        } else {
            self.max_throughput / active as f64
        };
    }

    /// Returns the bandwidth not held by stable flows, and the flows that need a new plan
    ///
    /// A flow is stable while its measurement stays inside its allocated band and below the
    /// fair share. Inactive flows give their allocation back to the pool.
    pub fn needs_reevaluation(&self, flows: &[Flow]) -> (f64, Vec<usize>) {
        let mut unused = self.max_throughput;
        let mut reevaluate = Vec::new();

        for &i in &self.flows {
            let flow = &flows[i];
            if !flow.allocated.contains(flow.measured) || flow.measured >= self.fair_share {
                reevaluate.push(i);
            } else {
                unused -= flow.allocated.throughput;
            }

            if flow.measured < self.config.min_activity_threshold {
                unused += flow.allocated.throughput;
            }
        }

        (unused, reevaluate)
    }

    /// Plans the flows in `reevaluate`, sharing `unused` between them
    pub fn recalculate(&self, flows: &mut [Flow], reevaluate: &[usize], mut unused: f64) {
        let config = &self.config;
        let fair_share = self.fair_share;
        let mut left = reevaluate.len();
        let mut categories = Vec::with_capacity(reevaluate.len());

        for &i in reevaluate {
            let flow = &mut flows[i];
            if flow.measured + config.incremental_step > fair_share {
                flow.planned.throughput = fair_share;
                categories.push(Category::AtFairShare);
                continue;
            }

            categories.push(Category::Under);
            if flow.measured <= config.min_activity_threshold {
                flow.planned = Allocation {
                    throughput: config.max_bw_per_inactive_flow,
                    lower: 0.0,
                    upper: config.inactivity_incremental_step,
                };
            } else {
                flow.planned = self.stepped(flow, flow.measured + config.incremental_step);
            }

            left -= 1;
            if flow.planned.throughput != config.max_bw_per_inactive_flow {
                unused -= flow.planned.throughput;
            }
        }

        if left > 0 {
            for (&i, _) in reevaluate
                .iter()
                .zip(&categories)
                .filter(|(_, c)| **c == Category::AtFairShare)
            {
                let flow = &mut flows[i];
                if flow.measured >= fair_share {
                    continue;
                }

                left -= 1;
                if left == 0 {
                    // The last flow takes whatever remains
                    let throughput = flow.clamped(unused);
                    flow.planned = Allocation {
                        throughput,
                        lower: (throughput - config.toleration_threshold)
                            .max(config.min_activity_threshold),
                        upper: throughput,
                    };
                } else {
                    flow.planned = self.stepped(flow, flow.measured + config.incremental_step);
                }
                unused -= flow.planned.throughput;
            }

            if left > 0 {
                let extra = (unused - left as f64 * fair_share) / left as f64;
                for (&i, _) in reevaluate
                    .iter()
                    .zip(&categories)
                    .filter(|(_, c)| **c == Category::AtFairShare)
                {
                    let flow = &mut flows[i];
                    if flow.measured < fair_share {
                        continue;
                    }

                    let throughput = flow.clamped(fair_share + extra);
                    let upper = throughput - config.action_upper_threshold;
                    flow.planned = Allocation {
                        throughput,
                        lower: upper - config.toleration_threshold,
                        upper,
                    };
                    unused -= throughput;
                }
            }
        }

        // Leftovers go to the active flows, up to their fair share
        if unused >= 1.0 {
            for &i in reevaluate {
                let flow = &mut flows[i];
                if flow.measured > config.min_activity_threshold {
                    flow.planned = Allocation {
                        throughput: flow.clamped(fair_share),
                        lower: 0.0,
                        upper: 0.0,
                    };
                }
            }
        }

        for &i in reevaluate {
            let flow = &mut flows[i];
            if flow.planned.throughput < flow.max_planned.throughput {
                flow.max_planned = flow.planned;
            }
        }
    }

    /// A plan of `throughput`, with a band just below it
    fn stepped(&self, flow: &Flow, throughput: f64) -> Allocation {
        let throughput = flow.clamped(throughput);
        let upper = throughput - self.config.action_upper_threshold;
        Allocation {
            throughput,
            lower: (upper - self.config.toleration_threshold)
                .max(self.config.min_activity_threshold),
            upper,
        }
    }
}
