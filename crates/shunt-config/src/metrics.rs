//! Hooks for counting configuration loads

/// Receives one call per configuration load attempt and its outcome
pub trait SourceMetrics: Send + Sync {
    fn load_attempted(&self);
    fn load_succeeded(&self);
    fn read_failed(&self);
    fn parse_failed(&self);
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSourceMetrics;

impl SourceMetrics for NoopSourceMetrics {
    fn load_attempted(&self) {}
    fn load_succeeded(&self) {}
    fn read_failed(&self) {}
    fn parse_failed(&self) {}
}
