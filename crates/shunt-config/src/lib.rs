//! Shunt configuration
//!
//! This crate defines the forwarding-rule data model, the YAML document format,
//! and the sources that supply configuration changes over time to the daemon.

pub mod coordination;
pub mod file;
pub mod metrics;
pub mod model;
pub mod source;

#[cfg(feature = "zookeeper")]
pub mod zookeeper;

pub use coordination::{
    backoff_delay, Action, CoordinationError, CoordinationMachine, CoordinationOptions,
    CoordinationSession, CoordinationSource, Coordinator, Event, FailureKind, Phase, Transition,
    WatchEvent, WatchFuture,
};
pub use file::{FileSource, ReloadTrigger};
pub use metrics::{NoopSourceMetrics, SourceMetrics};
pub use model::{Address, Config, ConfigError, ForwardingRule, DEFAULT_FAMILY};
pub use source::{
    callback, Callback, ManualSource, Source, SourceError, SourceEvent, Subscription, TaskSlot,
    Watchers,
};
