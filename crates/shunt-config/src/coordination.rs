//! Coordination-service configuration source
//!
//! Watches one node of a distributed key-value service (ZooKeeper or similar)
//! and publishes its contents whenever they change. The retry logic lives in
//! [`CoordinationMachine`], a pure state machine: the driver performs the
//! [`Action`] it asks for and feeds the outcome back in as an [`Event`].
//!
//! States:
//! - **Connect**: open a session. Failures other than "no server available" are
//!   reported. Success resets the backoff.
//! - **Exists**: check the node with a watch. A missing node waits for the watch.
//! - **Get**: fetch the data with a watch, publish it, then wait for the watch.
//!   A deleted node goes back to Exists, a change fetches again.
//!
//! A session lost while waiting on a watch goes back to Connect without
//! reporting anything.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::{NoopSourceMetrics, SourceMetrics};
use crate::model::Config;
use crate::source::{Callback, Source, SourceError, Subscription, TaskSlot, Watchers};

/// Backoff delays stop doubling after this many consecutive failures
const MAX_BACKOFF_EXPONENT: u32 = 10;

/// How a coordination-service call failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// No server reachable at all. Retried silently.
    Unavailable,
    /// Connection hiccup within a live session. Retried silently.
    Transient,
    /// The node does not exist
    NoNode,
    /// Anything else. Reported, and the session is re-established.
    Fatal,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct CoordinationError {
    pub kind: FailureKind,
    pub message: String,
}

impl CoordinationError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    fn is_transient(&self) -> bool {
        matches!(self.kind, FailureKind::Unavailable | FailureKind::Transient)
    }
}

/// What a node watch reported when it fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEvent {
    Created,
    Deleted,
    DataChanged,
    SessionLost,
    Other,
}

/// Resolves once when the watched node changes
pub type WatchFuture = BoxFuture<'static, WatchEvent>;

/// Opens sessions against the coordination service
#[async_trait]
pub trait Coordinator: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn CoordinationSession>, CoordinationError>;
}

/// One live session. Dropping it closes the session.
#[async_trait]
pub trait CoordinationSession: Send + Sync {
    /// Whether the node exists, plus a watch that fires on its creation or change
    async fn exists_watch(&self, path: &str) -> Result<(bool, WatchFuture), CoordinationError>;

    /// The node's data, plus a watch that fires on its change or deletion
    async fn get_watch(&self, path: &str) -> Result<(Vec<u8>, WatchFuture), CoordinationError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connect,
    Exists,
    Get,
}

/// Outcome of the last action, fed back into the machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connected,
    ConnectFailed(CoordinationError),
    NodeExists,
    NodeMissing,
    Fetched,
    Failed(CoordinationError),
    Watch(WatchEvent),
}

/// What the driver should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Connect,
    CheckExists,
    Fetch,
    /// Sleep, then run `then`
    Backoff { delay: Duration, then: Phase },
    /// Block on the outstanding watch
    AwaitWatch,
}

impl Action {
    fn run(phase: Phase) -> Self {
        match phase {
            Phase::Connect => Action::Connect,
            Phase::Exists => Action::CheckExists,
            Phase::Get => Action::Fetch,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub action: Action,
    /// Error to hand to subscribers before carrying on
    pub report: Option<CoordinationError>,
    /// The current session is unusable and must be dropped
    pub drop_session: bool,
}

impl Transition {
    fn to(action: Action) -> Self {
        Self {
            action,
            report: None,
            drop_session: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinationMachine {
    phase: Phase,
    attempt: u32,
    unit: Duration,
}

impl CoordinationMachine {
    pub fn new(unit: Duration) -> Self {
        Self {
            phase: Phase::Connect,
            attempt: 0,
            unit,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Consecutive failures since the last success
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn initial(&self) -> Action {
        Action::run(self.phase)
    }

    pub fn on(&mut self, event: Event) -> Transition {
        match (self.phase, event) {
            (Phase::Connect, Event::Connected) => self.succeed(Phase::Exists),
            (Phase::Connect, Event::ConnectFailed(e)) => {
                if e.kind == FailureKind::Unavailable {
                    Transition::to(self.backoff(Phase::Connect))
                } else {
                    Transition {
                        action: self.backoff(Phase::Connect),
                        report: Some(e),
                        drop_session: true,
                    }
                }
            }

            (Phase::Exists, Event::NodeExists) => self.succeed(Phase::Get),
            (Phase::Exists, Event::NodeMissing) => {
                self.attempt = 0;
                Transition::to(Action::AwaitWatch)
            }
            (Phase::Exists, Event::Failed(e)) => {
                if e.is_transient() || e.kind == FailureKind::NoNode {
                    Transition::to(self.backoff(Phase::Exists))
                } else {
                    self.reconnect(e)
                }
            }

            (Phase::Get, Event::Fetched) => {
                self.attempt = 0;
                Transition::to(Action::AwaitWatch)
            }
            (Phase::Get, Event::Failed(e)) => match e.kind {
                FailureKind::Unavailable | FailureKind::Transient => {
                    Transition::to(self.backoff(Phase::Get))
                }
                FailureKind::NoNode => Transition::to(self.backoff(Phase::Exists)),
                FailureKind::Fatal => self.reconnect(e),
            },
            (Phase::Get, Event::Watch(WatchEvent::Deleted)) => {
                self.phase = Phase::Exists;
                Transition::to(Action::CheckExists)
            }

            (Phase::Exists | Phase::Get, Event::Watch(WatchEvent::SessionLost)) => Transition {
                action: self.backoff(Phase::Connect),
                report: None,
                drop_session: true,
            },
            (Phase::Exists, Event::Watch(_)) => Transition::to(Action::CheckExists),
            (Phase::Get, Event::Watch(_)) => Transition::to(Action::Fetch),

            // An event that does not belong to the current phase: run the phase again.
            (phase, event) => {
                warn!(
                    "Ignoring coordination event {:?} in phase {:?}",
                    event, phase
                );
                Transition::to(Action::run(phase))
            }
        }
    }

    fn succeed(&mut self, next: Phase) -> Transition {
        self.attempt = 0;
        self.phase = next;
        Transition::to(Action::run(next))
    }

    fn reconnect(&mut self, error: CoordinationError) -> Transition {
        Transition {
            action: self.backoff(Phase::Connect),
            report: Some(error),
            drop_session: true,
        }
    }

    fn backoff(&mut self, then: Phase) -> Action {
        let delay = backoff_delay(self.unit, self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        self.phase = then;
        Action::Backoff { delay, then }
    }
}

/// `unit * 2^attempt`, with the exponent capped
pub fn backoff_delay(unit: Duration, attempt: u32) -> Duration {
    unit * (1u32 << attempt.min(MAX_BACKOFF_EXPONENT))
}

#[derive(Debug, Clone)]
pub struct CoordinationOptions {
    /// First backoff delay; doubles on every consecutive failure
    pub backoff_unit: Duration,
    /// Limit on establishing a session. Expiry counts as "no server available".
    pub connect_timeout: Duration,
}

impl Default for CoordinationOptions {
    fn default() -> Self {
        Self {
            backoff_unit: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(1),
        }
    }
}

pub struct CoordinationSource {
    inner: Arc<CoordinationInner>,
    task: TaskSlot,
}

struct CoordinationInner {
    coordinator: Arc<dyn Coordinator>,
    path: String,
    options: CoordinationOptions,
    watchers: Watchers,
    metrics: Arc<dyn SourceMetrics>,
}

impl CoordinationSource {
    pub fn new(coordinator: Arc<dyn Coordinator>, path: impl Into<String>) -> Self {
        Self::with_options(
            coordinator,
            path,
            CoordinationOptions::default(),
            Arc::new(NoopSourceMetrics),
        )
    }

    pub fn with_options(
        coordinator: Arc<dyn Coordinator>,
        path: impl Into<String>,
        options: CoordinationOptions,
        metrics: Arc<dyn SourceMetrics>,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinationInner {
                coordinator,
                path: path.into(),
                options,
                watchers: Watchers::new(),
                metrics,
            }),
            task: TaskSlot::new(),
        }
    }

    pub fn current(&self) -> Option<Arc<Config>> {
        self.inner.watchers.current()
    }
}

impl CoordinationInner {
    async fn run(self: Arc<Self>, stop: CancellationToken) {
        info!("Watching coordination node {}", self.path);

        let mut machine = CoordinationMachine::new(self.options.backoff_unit);
        let mut session: Option<Box<dyn CoordinationSession>> = None;
        let mut watch: Option<WatchFuture> = None;
        let mut action = machine.initial();

        loop {
            let event = match action {
                Action::Connect => {
                    session = None;
                    watch = None;
                    let connect = tokio::time::timeout(
                        self.options.connect_timeout,
                        self.coordinator.connect(),
                    );
                    let result = tokio::select! {
                        _ = stop.cancelled() => break,
                        result = connect => result,
                    };
                    match result {
                        Ok(Ok(s)) => {
                            debug!("Coordination session established");
                            session = Some(s);
                            Event::Connected
                        }
                        Ok(Err(e)) => Event::ConnectFailed(e),
                        Err(_) => Event::ConnectFailed(CoordinationError::new(
                            FailureKind::Unavailable,
                            "timed out connecting to coordination service",
                        )),
                    }
                }

                Action::CheckExists => {
                    let Some(s) = session.as_ref() else {
                        action = Action::Connect;
                        continue;
                    };
                    let result = tokio::select! {
                        _ = stop.cancelled() => break,
                        result = s.exists_watch(&self.path) => result,
                    };
                    match result {
                        Ok((true, _)) => Event::NodeExists,
                        Ok((false, w)) => {
                            debug!("Node {} does not exist yet", self.path);
                            watch = Some(w);
                            Event::NodeMissing
                        }
                        Err(e) => Event::Failed(e),
                    }
                }

                Action::Fetch => {
                    let Some(s) = session.as_ref() else {
                        action = Action::Connect;
                        continue;
                    };
                    self.metrics.load_attempted();
                    let result = tokio::select! {
                        _ = stop.cancelled() => break,
                        result = s.get_watch(&self.path) => result,
                    };
                    match result {
                        Ok((data, w)) => {
                            watch = Some(w);
                            let parsed = match Config::parse(&data) {
                                Ok(config) => {
                                    self.metrics.load_succeeded();
                                    Ok(Arc::new(config))
                                }
                                Err(e) => {
                                    self.metrics.parse_failed();
                                    Err(SourceError::from(e))
                                }
                            };
                            if stop.is_cancelled() {
                                break;
                            }
                            self.watchers.publish(parsed).await;
                            Event::Fetched
                        }
                        Err(e) => {
                            self.metrics.read_failed();
                            Event::Failed(e)
                        }
                    }
                }

                Action::AwaitWatch => {
                    let Some(w) = watch.take() else {
                        action = Action::run(machine.phase());
                        continue;
                    };
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        fired = w => Event::Watch(fired),
                    }
                }

                Action::Backoff { delay, then } => {
                    debug!(
                        "Coordination backoff {:?} before {:?} (attempt {})",
                        delay,
                        then,
                        machine.attempt()
                    );
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    action = Action::run(then);
                    continue;
                }
            };

            let transition = machine.on(event);
            if transition.drop_session {
                session = None;
                watch = None;
            }
            if let Some(e) = transition.report {
                if stop.is_cancelled() {
                    break;
                }
                warn!("Coordination service error on {}: {}", self.path, e);
                self.watchers
                    .publish(Err(SourceError::Coordination(e.message)))
                    .await;
            }
            action = transition.action;
        }

        debug!("Stopped watching coordination node {}", self.path);
    }
}

#[async_trait]
impl Source for CoordinationSource {
    fn start(&self) {
        let inner = self.inner.clone();
        self.task.start(move |stop| inner.run(stop));
    }

    async fn stop(&self) {
        self.task.stop().await;
    }

    async fn watch(&self, callback: Callback) -> Subscription {
        self.inner.watchers.subscribe(callback).await
    }

    fn unwatch(&self, subscription: Subscription) {
        self.inner.watchers.unsubscribe(subscription);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn err(kind: FailureKind) -> CoordinationError {
        CoordinationError::new(kind, format!("{:?}", kind))
    }

    fn connected() -> CoordinationMachine {
        let mut m = CoordinationMachine::new(secs(1));
        assert_eq!(m.initial(), Action::Connect);
        assert_eq!(m.on(Event::Connected).action, Action::CheckExists);
        m
    }

    #[test]
    fn test_happy_path() {
        let mut m = connected();
        assert_eq!(m.on(Event::NodeExists).action, Action::Fetch);
        assert_eq!(m.on(Event::Fetched).action, Action::AwaitWatch);
        assert_eq!(
            m.on(Event::Watch(WatchEvent::DataChanged)).action,
            Action::Fetch
        );
        assert_eq!(m.phase(), Phase::Get);
    }

    #[test]
    fn test_no_server_is_silent_and_doubles() {
        let mut m = CoordinationMachine::new(secs(1));
        let mut delays = Vec::new();
        for _ in 0..4 {
            let t = m.on(Event::ConnectFailed(err(FailureKind::Unavailable)));
            assert!(t.report.is_none());
            match t.action {
                Action::Backoff { delay, then } => {
                    assert_eq!(then, Phase::Connect);
                    delays.push(delay);
                }
                other => panic!("unexpected action {:?}", other),
            }
        }
        assert_eq!(delays, vec![secs(1), secs(2), secs(4), secs(8)]);

        assert_eq!(m.on(Event::Connected).action, Action::CheckExists);
        assert_eq!(m.attempt(), 0);
    }

    #[test]
    fn test_connect_error_is_reported() {
        let mut m = CoordinationMachine::new(secs(1));
        let t = m.on(Event::ConnectFailed(err(FailureKind::Fatal)));
        assert_eq!(t.report, Some(err(FailureKind::Fatal)));
        assert_eq!(
            t.action,
            Action::Backoff {
                delay: secs(1),
                then: Phase::Connect
            }
        );
    }

    #[test]
    fn test_missing_node_waits_then_rechecks() {
        let mut m = connected();
        assert_eq!(m.on(Event::NodeMissing).action, Action::AwaitWatch);
        assert_eq!(
            m.on(Event::Watch(WatchEvent::Created)).action,
            Action::CheckExists
        );
        assert_eq!(m.phase(), Phase::Exists);
    }

    #[test]
    fn test_exists_transient_retries_exists() {
        let mut m = connected();
        let t = m.on(Event::Failed(err(FailureKind::Transient)));
        assert!(t.report.is_none());
        assert!(!t.drop_session);
        assert_eq!(
            t.action,
            Action::Backoff {
                delay: secs(1),
                then: Phase::Exists
            }
        );
    }

    #[test]
    fn test_exists_fatal_reconnects() {
        let mut m = connected();
        let t = m.on(Event::Failed(err(FailureKind::Fatal)));
        assert!(t.report.is_some());
        assert!(t.drop_session);
        assert_eq!(m.phase(), Phase::Connect);
    }

    #[test]
    fn test_get_failures() {
        let mut m = connected();
        m.on(Event::NodeExists);

        let t = m.on(Event::Failed(err(FailureKind::Transient)));
        assert_eq!(
            t.action,
            Action::Backoff {
                delay: secs(1),
                then: Phase::Get
            }
        );

        let t = m.on(Event::Failed(err(FailureKind::NoNode)));
        assert!(t.report.is_none());
        assert_eq!(
            t.action,
            Action::Backoff {
                delay: secs(2),
                then: Phase::Exists
            }
        );

        let mut m = connected();
        m.on(Event::NodeExists);
        let t = m.on(Event::Failed(err(FailureKind::Fatal)));
        assert!(t.report.is_some());
        assert!(t.drop_session);
        assert_eq!(m.phase(), Phase::Connect);
    }

    #[test]
    fn test_delete_returns_to_exists() {
        let mut m = connected();
        m.on(Event::NodeExists);
        m.on(Event::Fetched);
        assert_eq!(
            m.on(Event::Watch(WatchEvent::Deleted)).action,
            Action::CheckExists
        );
        assert_eq!(m.phase(), Phase::Exists);
    }

    #[test]
    fn test_session_loss_reconnects_silently() {
        let mut m = connected();
        m.on(Event::NodeExists);
        m.on(Event::Fetched);

        let t = m.on(Event::Watch(WatchEvent::SessionLost));
        assert!(t.report.is_none());
        assert!(t.drop_session);
        assert_eq!(
            t.action,
            Action::Backoff {
                delay: secs(1),
                then: Phase::Connect
            }
        );

        let t = m.on(Event::ConnectFailed(err(FailureKind::Unavailable)));
        assert_eq!(
            t.action,
            Action::Backoff {
                delay: secs(2),
                then: Phase::Connect
            }
        );
        assert_eq!(m.attempt(), 2);

        m.on(Event::Connected);
        m.on(Event::NodeExists);
        m.on(Event::Fetched);
        assert_eq!(m.attempt(), 0);
    }

    #[test]
    fn test_backoff_is_capped() {
        let mut m = CoordinationMachine::new(Duration::from_millis(1));
        let mut last = Duration::ZERO;
        for _ in 0..40 {
            if let Action::Backoff { delay, .. } =
                m.on(Event::ConnectFailed(err(FailureKind::Unavailable))).action
            {
                last = delay;
            }
        }
        assert_eq!(last, Duration::from_millis(1 << MAX_BACKOFF_EXPONENT));
    }
}
