//! Metrics hooks for the forwarding engine
//!
//! Components receive an `Arc<dyn ProxyMetrics>` at construction and call one
//! method per event. [`MetricsRegistry`] keeps counters in memory and renders
//! them in the Prometheus text exposition format.

use shunt_config::SourceMetrics;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

pub trait ProxyMetrics: Send + Sync {
    /// A port was started or retargeted, killing its existing connections
    fn port_restarted(&self, port: &str);
    fn connection_accepted(&self, port: &str);
    fn backend_connected(&self, port: &str);
    fn dial_failed(&self, port: &str);
    /// Forwarding started on a pair
    fn connection_opened(&self, port: &str);
    /// Forwarding finished on a pair
    fn connection_closed(&self, port: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl ProxyMetrics for NoopMetrics {
    fn port_restarted(&self, _port: &str) {}
    fn connection_accepted(&self, _port: &str) {}
    fn backend_connected(&self, _port: &str) {}
    fn dial_failed(&self, _port: &str) {}
    fn connection_opened(&self, _port: &str) {}
    fn connection_closed(&self, _port: &str) {}
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PortCounters {
    pub restarts: u64,
    pub accepts: u64,
    pub connects: u64,
    pub dial_errors: u64,
    pub live_connections: i64,
}

/// In-memory counters for both the engine and the configuration source
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    ports: Mutex<BTreeMap<String, PortCounters>>,
    config_loads: AtomicU64,
    config_successes: AtomicU64,
    config_read_errors: AtomicU64,
    config_parse_errors: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, port: &str, f: impl FnOnce(&mut PortCounters)) {
        let mut ports = self.ports.lock().unwrap_or_else(PoisonError::into_inner);
        f(ports.entry(port.to_string()).or_default());
    }

    pub fn port(&self, port: &str) -> PortCounters {
        self.ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(port)
            .copied()
            .unwrap_or_default()
    }

    /// Render every counter in Prometheus text format
    pub fn render(&self) -> String {
        let ports = self
            .ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mut out = String::new();

        let per_port: [(&str, &str, &str, fn(&PortCounters) -> i64); 5] = [
            (
                "shunt_restarts_total",
                "counter",
                "Number of times each port has been (re)initialized, killing any existing connections.",
                |c| c.restarts as i64,
            ),
            (
                "shunt_accepts_total",
                "counter",
                "Number of times each port has accepted a connection.",
                |c| c.accepts as i64,
            ),
            (
                "shunt_connects_total",
                "counter",
                "Number of times each port has successfully dialed its backend.",
                |c| c.connects as i64,
            ),
            (
                "shunt_dial_errors_total",
                "counter",
                "Number of times each port has failed to dial its backend.",
                |c| c.dial_errors as i64,
            ),
            (
                "shunt_live_connections",
                "gauge",
                "Number of connections currently being forwarded by each port.",
                |c| c.live_connections,
            ),
        ];

        for (name, kind, help, value) in per_port {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} {}", name, kind);
            for (port, counters) in &ports {
                let _ = writeln!(
                    out,
                    "{}{{port=\"{}\"}} {}",
                    name,
                    escape_label(port),
                    value(counters)
                );
            }
        }

        let global = [
            (
                "shunt_config_loads_total",
                "Number of attempts to load the configuration.",
                &self.config_loads,
            ),
            (
                "shunt_config_successes_total",
                "Number of successful configuration loads.",
                &self.config_successes,
            ),
            (
                "shunt_config_read_errors_total",
                "Number of configuration loads that failed to read the document.",
                &self.config_read_errors,
            ),
            (
                "shunt_config_parse_errors_total",
                "Number of configuration loads that failed to parse the document.",
                &self.config_parse_errors,
            ),
        ];
        for (name, help, counter) in global {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} counter", name);
            let _ = writeln!(out, "{} {}", name, counter.load(Ordering::Relaxed));
        }

        out
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

impl ProxyMetrics for MetricsRegistry {
    fn port_restarted(&self, port: &str) {
        self.update(port, |c| c.restarts += 1);
    }

    fn connection_accepted(&self, port: &str) {
        self.update(port, |c| c.accepts += 1);
    }

    fn backend_connected(&self, port: &str) {
        self.update(port, |c| c.connects += 1);
    }

    fn dial_failed(&self, port: &str) {
        self.update(port, |c| c.dial_errors += 1);
    }

    fn connection_opened(&self, port: &str) {
        self.update(port, |c| c.live_connections += 1);
    }

    fn connection_closed(&self, port: &str) {
        self.update(port, |c| c.live_connections -= 1);
    }
}

impl SourceMetrics for MetricsRegistry {
    fn load_attempted(&self) {
        self.config_loads.fetch_add(1, Ordering::Relaxed);
    }

    fn load_succeeded(&self) {
        self.config_successes.fetch_add(1, Ordering::Relaxed);
    }

    fn read_failed(&self) {
        self.config_read_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn parse_failed(&self) {
        self.config_parse_errors.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_per_port() {
        let registry = MetricsRegistry::new();
        registry.connection_accepted("web");
        registry.connection_accepted("web");
        registry.backend_connected("web");
        registry.connection_opened("web");
        registry.dial_failed("db");

        assert_eq!(
            registry.port("web"),
            PortCounters {
                accepts: 2,
                connects: 1,
                live_connections: 1,
                ..Default::default()
            }
        );
        assert_eq!(registry.port("db").dial_errors, 1);
        assert_eq!(registry.port("missing"), PortCounters::default());
    }

    #[test]
    fn test_render_prometheus_text() {
        let registry = MetricsRegistry::new();
        registry.port_restarted("tcp://:9001");
        registry.connection_opened("tcp://:9001");
        registry.connection_closed("tcp://:9001");
        registry.load_attempted();
        registry.parse_failed();

        let text = registry.render();
        assert!(text.contains("# TYPE shunt_restarts_total counter"));
        assert!(text.contains("shunt_restarts_total{port=\"tcp://:9001\"} 1"));
        assert!(text.contains("shunt_live_connections{port=\"tcp://:9001\"} 0"));
        assert!(text.contains("shunt_config_loads_total 1"));
        assert!(text.contains("shunt_config_parse_errors_total 1"));
        assert!(text.contains("shunt_config_successes_total 0"));
    }

    #[test]
    fn test_label_escaping() {
        assert_eq!(escape_label(r#"a"b\c"#), r#"a\"b\\c"#);
    }
}
