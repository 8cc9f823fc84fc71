//! Runtime profiler
//!
//! Tracks where each dispatch spends its time and which experts the model
//! actually activates. One mutex guards all counters; recording is a few
//! integer updates, so contention stays negligible next to the network
//! round-trips being measured.
//!
//! ## Load balance
//!
//! ```text
//! load_balance = 1 / (1 + sigma/mu)
//! ```
//!
//! over the per-endpoint mean request times. 1.0 means every endpoint
//! takes equally long; values below ~0.7 mean one machine is dragging the
//! step time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use serde::Serialize;

/// Number of entries reported in `top_experts`
const TOP_EXPERTS: usize = 16;

#[derive(Debug, Clone, Copy, Default)]
struct TimingAccum {
    samples: u64,
    total_ns: u64,
    min_ns: u64,
    max_ns: u64,
}

#[derive(Default)]
struct ProfilerInner {
    endpoints: Vec<TimingAccum>,
    activations: HashMap<u32, u64>,
}

/// Per-endpoint and per-expert runtime counters
pub struct Profiler {
    enabled: AtomicBool,
    inner: Mutex<ProfilerInner>,
}

impl Profiler {
    /// A fresh, disabled profiler
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            inner: Mutex::new(ProfilerInner::default()),
        }
    }

    /// The process-wide profiler
    pub fn global() -> Arc<Profiler> {
        static GLOBAL: OnceLock<Arc<Profiler>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Profiler::new())))
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Record one request's wall time against an endpoint
    pub fn record(&self, endpoint: usize, elapsed: Duration) {
        if !self.is_enabled() {
            return;
        }
        let ns = elapsed.as_nanos() as u64;
        let mut inner = self.inner.lock().expect("profiler lock");
        if inner.endpoints.len() <= endpoint {
            inner.endpoints.resize(endpoint + 1, TimingAccum::default());
        }
        let accum = &mut inner.endpoints[endpoint];
        if accum.samples == 0 {
            accum.min_ns = ns;
            accum.max_ns = ns;
        } else {
            accum.min_ns = accum.min_ns.min(ns);
            accum.max_ns = accum.max_ns.max(ns);
        }
        accum.samples += 1;
        accum.total_ns += ns;
    }

    /// Count one activation of an expert
    pub fn record_activation(&self, expert_id: u32) {
        if !self.is_enabled() {
            return;
        }
        let mut inner = self.inner.lock().expect("profiler lock");
        *inner.activations.entry(expert_id).or_insert(0) += 1;
    }

    /// Count activations for every selection in a routing batch
    pub fn record_activations(&self, expert_ids: impl IntoIterator<Item = u32>) {
        if !self.is_enabled() {
            return;
        }
        let mut inner = self.inner.lock().expect("profiler lock");
        for id in expert_ids {
            *inner.activations.entry(id).or_insert(0) += 1;
        }
    }

    /// Drop all counters
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("profiler lock");
        *inner = ProfilerInner::default();
    }

    /// Consistent copy of all counters plus derived metrics
    pub fn snapshot(&self) -> ProfileSnapshot {
        let inner = self.inner.lock().expect("profiler lock");

        let per_endpoint: Vec<EndpointStats> = inner
            .endpoints
            .iter()
            .enumerate()
            .map(|(endpoint, a)| EndpointStats {
                endpoint,
                samples: a.samples,
                total_ns: a.total_ns,
                min_ns: a.min_ns,
                max_ns: a.max_ns,
                avg_ns: if a.samples > 0 { a.total_ns / a.samples } else { 0 },
            })
            .collect();

        let mut top_experts: Vec<ExpertActivation> = inner
            .activations
            .iter()
            .map(|(&expert_id, &count)| ExpertActivation { expert_id, count })
            .collect();
        top_experts.sort_by(|a, b| b.count.cmp(&a.count).then(a.expert_id.cmp(&b.expert_id)));
        top_experts.truncate(TOP_EXPERTS);

        ProfileSnapshot {
            load_balance: load_balance(&per_endpoint),
            per_endpoint,
            top_experts,
        }
    }
}

impl Default for Profiler {
    fn default() -> Self {
        Self::new()
    }
}

/// Timing summary for one endpoint
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStats {
    pub endpoint: usize,
    pub samples: u64,
    pub total_ns: u64,
    pub min_ns: u64,
    pub max_ns: u64,
    pub avg_ns: u64,
}

/// Activation count for one expert
#[derive(Debug, Clone, Serialize)]
pub struct ExpertActivation {
    pub expert_id: u32,
    pub count: u64,
}

/// Point-in-time view of the profiler
#[derive(Debug, Clone, Serialize)]
pub struct ProfileSnapshot {
    pub per_endpoint: Vec<EndpointStats>,
    /// 1.0 = perfectly even endpoint times
    pub load_balance: f64,
    /// Hottest experts, most-activated first
    pub top_experts: Vec<ExpertActivation>,
}

fn load_balance(per_endpoint: &[EndpointStats]) -> f64 {
    let avgs: Vec<f64> = per_endpoint
        .iter()
        .filter(|s| s.samples > 0)
        .map(|s| s.avg_ns as f64)
        .collect();
    if avgs.len() < 2 {
        return 1.0;
    }
    let mean = avgs.iter().sum::<f64>() / avgs.len() as f64;
    if mean <= 0.0 {
        return 1.0;
    }
    let variance = avgs.iter().map(|t| (t - mean) * (t - mean)).sum::<f64>() / avgs.len() as f64;
    let stddev = variance.sqrt();
    1.0 / (1.0 + stddev / mean)
}
