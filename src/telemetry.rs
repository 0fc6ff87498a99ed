//! In-memory telemetry sink.
//!
//! The engine records provider failures and broadcast latencies; the HTTP
//! layer renders the counters in Prometheus text format. Tests construct
//! their own sink and inspect it directly.

use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Debug)]
pub struct Telemetry {
    enabled: bool,
    service_name: String,
    counters: Mutex<BTreeMap<String, u64>>,
    broadcast_latency_ms: Mutex<Option<u64>>,
}

impl Telemetry {
    pub fn new(enabled: bool, service_name: impl Into<String>) -> Self {
        Self {
            enabled,
            service_name: service_name.into(),
            counters: Mutex::new(BTreeMap::new()),
            broadcast_latency_ms: Mutex::new(None),
        }
    }

    pub fn disabled() -> Self {
        Self::new(false, "")
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Count one failed provider interaction. `base` and `price_type` may be
    /// empty when the failure is not tied to a single pair (e.g. a provider
    /// that never initialized).
    pub fn provider_failure(&self, provider: &str, base: &str, reason: &str, price_type: &str) {
        let mut labels = vec![
            ("provider", provider),
            ("reason", reason),
        ];
        if !base.is_empty() {
            labels.push(("base", base));
        }
        if !price_type.is_empty() {
            labels.push(("type", price_type));
        }
        self.incr("price_feeder_provider_failures_total", &labels);
    }

    pub fn observe_broadcast_latency(&self, millis: u64) {
        *self.broadcast_latency_ms.lock().expect("telemetry lock poisoned") = Some(millis);
        self.incr("price_feeder_broadcasts_total", &[]);
    }

    fn incr(&self, name: &str, labels: &[(&str, &str)]) {
        let key = render_key(name, labels);
        let mut counters = self.counters.lock().expect("telemetry lock poisoned");
        *counters.entry(key).or_insert(0) += 1;
    }

    /// Total number of recorded failure events, across all label sets.
    pub fn failure_count(&self) -> u64 {
        self.counters
            .lock()
            .expect("telemetry lock poisoned")
            .iter()
            .filter(|(key, _)| key.starts_with("price_feeder_provider_failures_total"))
            .map(|(_, count)| count)
            .sum()
    }

    /// Whether a failure with exactly these labels has been recorded.
    pub fn has_failure(&self, provider: &str, base: &str, reason: &str, price_type: &str) -> bool {
        let mut labels = vec![("provider", provider), ("reason", reason)];
        if !base.is_empty() {
            labels.push(("base", base));
        }
        if !price_type.is_empty() {
            labels.push(("type", price_type));
        }
        let key = render_key("price_feeder_provider_failures_total", &labels);
        self.counters
            .lock()
            .expect("telemetry lock poisoned")
            .contains_key(&key)
    }

    /// Render all counters in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.service_name.is_empty() {
            out.push_str(&format!("# service: {}\n", self.service_name));
        }
        for (key, value) in self.counters.lock().expect("telemetry lock poisoned").iter() {
            out.push_str(&format!("{key} {value}\n"));
        }
        if let Some(latency) = *self.broadcast_latency_ms.lock().expect("telemetry lock poisoned") {
            out.push_str(&format!("price_feeder_broadcast_latency_ms {latency}\n"));
        }
        out
    }
}

fn render_key(name: &str, labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let mut sorted: Vec<_> = labels.to_vec();
    sorted.sort();
    let rendered: Vec<String> = sorted
        .iter()
        .map(|(name, value)| format!("{name}=\"{value}\""))
        .collect();
    format!("{name}{{{}}}", rendered.join(","))
}
