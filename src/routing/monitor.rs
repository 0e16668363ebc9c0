//! Background health monitor and the single writer of the active route.
//!
//! The monitor owns the write side of the [`ActiveRoute`] watch channel and
//! the endpoint registry. Everything else, including explicit user
//! selections, goes through a [`RouteHandle`], whose requests are executed on
//! the monitor task between health ticks. Route writes are therefore
//! serialized and always replace the whole `(endpoint, model)` pair.

use super::probe::{EndpointProbe, ProbeStatus};
use super::registry::{
    ActiveRoute, Endpoint, EndpointRegistry, RouteStatus, Selection, discover, discover_from,
    reachability_of, select_model,
};
use crate::config::{EndpointsConfig, LocalFallbackConfig};
use crate::error::{DeckError, Result};
use crate::runtime::RuntimeEvent;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where generation requests should go right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    pub url: String,
    pub model: String,
    /// `true` when this is the designated local backend.
    pub fallback: bool,
}

/// Remembers the last announced status and reports only real changes.
#[derive(Debug, Default)]
pub struct StatusAnnouncer {
    last: Option<RouteStatus>,
}

impl StatusAnnouncer {
    /// Returns `Some(status)` when it differs from the last announced one.
    pub fn observe(&mut self, status: RouteStatus) -> Option<RouteStatus> {
        if self.last == Some(status) {
            return None;
        }
        self.last = Some(status);
        Some(status)
    }

    pub fn last(&self) -> Option<RouteStatus> {
        self.last
    }
}

/// Derive the user-facing status from the current route.
pub fn route_status(route: Option<&ActiveRoute>, fallback: Option<&LocalFallbackConfig>) -> RouteStatus {
    match (route, fallback) {
        (Some(_), _) => RouteStatus::Connected,
        (None, Some(_)) => RouteStatus::Fallback,
        (None, None) => RouteStatus::Disconnected,
    }
}

enum MonitorCommand {
    SelectEndpoint {
        selection: Selection,
        reply: oneshot::Sender<Result<ActiveRoute>>,
    },
    SelectModel {
        selection: Selection,
        reply: oneshot::Sender<Result<ActiveRoute>>,
    },
    ListModels {
        reply: oneshot::Sender<Result<Vec<String>>>,
    },
    Refresh {
        reply: oneshot::Sender<RouteStatus>,
    },
}

/// Cloneable read/request handle onto the monitor's state.
#[derive(Clone)]
pub struct RouteHandle {
    route_rx: watch::Receiver<Option<ActiveRoute>>,
    registry: Arc<RwLock<EndpointRegistry>>,
    local_fallback: Option<LocalFallbackConfig>,
    commands: mpsc::Sender<MonitorCommand>,
}

impl RouteHandle {
    /// Snapshot of the active remote route.
    pub fn route(&self) -> Option<ActiveRoute> {
        self.route_rx.borrow().clone()
    }

    /// The route to use for the next request, falling back to the local backend.
    pub fn target(&self) -> Option<RouteTarget> {
        if let Some(route) = self.route() {
            return Some(RouteTarget {
                url: route.endpoint,
                model: route.model,
                fallback: false,
            });
        }
        self.local_fallback.as_ref().map(|local| RouteTarget {
            url: local.url.clone(),
            model: local.model.clone(),
            fallback: true,
        })
    }

    pub fn status(&self) -> RouteStatus {
        route_status(self.route_rx.borrow().as_ref(), self.local_fallback.as_ref())
    }

    /// Snapshot of the registry, in priority order.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .endpoints()
            .to_vec()
    }

    /// Watch route changes.
    pub fn subscribe(&self) -> watch::Receiver<Option<ActiveRoute>> {
        self.route_rx.clone()
    }

    /// Route to a specific endpoint after re-validating it.
    ///
    /// # Errors
    ///
    /// Returns [`DeckError::Routing`] when the endpoint is unknown,
    /// unreachable, or lists no models. The active route is unchanged then.
    pub async fn select_endpoint(&self, selection: Selection) -> Result<ActiveRoute> {
        let (reply, rx) = oneshot::channel();
        self.send(MonitorCommand::SelectEndpoint { selection, reply })
            .await?;
        rx.await.map_err(|_| monitor_gone())?
    }

    /// Switch the active endpoint to another model it lists.
    ///
    /// # Errors
    ///
    /// Returns [`DeckError::Routing`] when there is no active endpoint or the
    /// model is not listed.
    pub async fn select_model(&self, selection: Selection) -> Result<ActiveRoute> {
        let (reply, rx) = oneshot::channel();
        self.send(MonitorCommand::SelectModel { selection, reply })
            .await?;
        rx.await.map_err(|_| monitor_gone())?
    }

    /// Fresh model listing from the active endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error when there is no active endpoint or listing fails.
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let (reply, rx) = oneshot::channel();
        self.send(MonitorCommand::ListModels { reply }).await?;
        rx.await.map_err(|_| monitor_gone())?
    }

    /// Run a health tick now instead of waiting for the interval.
    ///
    /// # Errors
    ///
    /// Returns an error if the monitor task has stopped.
    pub async fn refresh(&self) -> Result<RouteStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(MonitorCommand::Refresh { reply }).await?;
        rx.await.map_err(|_| monitor_gone())
    }

    async fn send(&self, command: MonitorCommand) -> Result<()> {
        self.commands.send(command).await.map_err(|_| monitor_gone())
    }
}

fn monitor_gone() -> DeckError {
    DeckError::Channel("route monitor stopped".to_owned())
}

/// Periodic re-probe, failover and recovery for the endpoint registry.
pub struct HealthMonitor {
    prober: Arc<dyn EndpointProbe>,
    registry: Arc<RwLock<EndpointRegistry>>,
    route_tx: watch::Sender<Option<ActiveRoute>>,
    local_fallback: Option<LocalFallbackConfig>,
    preferred_model: String,
    interval: Duration,
    retry_count: u32,
    retry_delay_ms: u64,
    announcer: StatusAnnouncer,
    runtime_tx: Option<broadcast::Sender<RuntimeEvent>>,
    commands: mpsc::Receiver<MonitorCommand>,
}

impl HealthMonitor {
    /// Create the monitor and its handle. Nothing is probed until [`run`](Self::run)
    /// or [`tick`](Self::tick).
    pub fn new(config: &EndpointsConfig, prober: Arc<dyn EndpointProbe>) -> (Self, RouteHandle) {
        let registry = Arc::new(RwLock::new(EndpointRegistry::new(&config.urls)));
        let (route_tx, route_rx) = watch::channel(None);
        let (commands_tx, commands) = mpsc::channel(16);

        let handle = RouteHandle {
            route_rx,
            registry: Arc::clone(&registry),
            local_fallback: config.local_fallback.clone(),
            commands: commands_tx,
        };
        let monitor = Self {
            prober,
            registry,
            route_tx,
            local_fallback: config.local_fallback.clone(),
            preferred_model: config.preferred_model.clone(),
            interval: Duration::from_secs(config.monitor_interval_secs.max(1)),
            retry_count: config.retry_count,
            retry_delay_ms: config.retry_delay_ms,
            announcer: StatusAnnouncer::default(),
            runtime_tx: None,
            commands,
        };
        (monitor, handle)
    }

    /// Announce status changes on the runtime event channel.
    pub fn with_runtime_events(mut self, tx: broadcast::Sender<RuntimeEvent>) -> Self {
        self.runtime_tx = Some(tx);
        self
    }

    /// Override the re-probe interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run discovery immediately, then re-probe on the interval until cancelled.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.tick() => {}
                    }
                }
                command = self.commands.recv() => {
                    let Some(command) = command else { break };
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.handle(command) => {}
                    }
                }
            }
        }
        debug!("route monitor stopped");
    }

    /// One health pass.
    ///
    /// With an active route, its endpoint is re-probed (with retries). A dead
    /// endpoint clears the route and triggers discovery; a live but
    /// lower-priority, unpinned endpoint is upgraded when a higher-priority one
    /// has recovered. Without a route, discovery runs.
    pub async fn tick(&mut self) -> RouteStatus {
        let current = self.route_tx.borrow().clone();
        match current {
            Some(route) => {
                let status = self.probe_with_retry(&route.endpoint).await;
                self.record(route.priority, &status, None);
                if status.is_reachable() {
                    if route.priority > 0 && !route.pinned {
                        self.try_upgrade(&route).await;
                    }
                } else {
                    warn!(endpoint = %route.endpoint, %status, "active endpoint declared dead");
                    self.route_tx.send_replace(None);
                    self.rediscover().await;
                }
            }
            None => self.rediscover().await,
        }
        self.announce()
    }

    /// Current route snapshot.
    pub fn route(&self) -> Option<ActiveRoute> {
        self.route_tx.borrow().clone()
    }

    async fn handle(&mut self, command: MonitorCommand) {
        match command {
            MonitorCommand::SelectEndpoint { selection, reply } => {
                let result = self.select_endpoint(selection).await;
                let _ = reply.send(result);
            }
            MonitorCommand::SelectModel { selection, reply } => {
                let result = self.select_model(selection).await;
                let _ = reply.send(result);
            }
            MonitorCommand::ListModels { reply } => {
                let result = self.list_active_models().await;
                let _ = reply.send(result);
            }
            MonitorCommand::Refresh { reply } => {
                let status = self.tick().await;
                let _ = reply.send(status);
            }
        }
    }

    /// Probe `url`, retrying transient failures with exponential backoff.
    async fn probe_with_retry(&self, url: &str) -> ProbeStatus {
        let max_attempts = self.retry_count.saturating_add(1);
        let mut last_status = ProbeStatus::NotRunning;

        for attempt in 0..max_attempts {
            let status = self.prober.probe(url).await;
            if !status.is_transient() {
                return status;
            }
            last_status = status;
            if attempt + 1 < max_attempts {
                let multiplier = 1u64.checked_shl(attempt.min(63)).unwrap_or(u64::MAX);
                let delay_ms = self.retry_delay_ms.saturating_mul(multiplier);
                debug!(url, attempt, delay_ms, "probe failed, retrying");
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
        }

        last_status
    }

    async fn rediscover(&mut self) {
        let urls = self.urls();
        let discovery = discover(self.prober.as_ref(), &urls, &self.preferred_model).await;
        self.apply_checks(&discovery.checks);
        if let Some(route) = discovery.route {
            self.commit(route);
        }
    }

    async fn try_upgrade(&mut self, current: &ActiveRoute) {
        let urls = self.urls();
        let discovery = discover_from(
            self.prober.as_ref(),
            &urls,
            0,
            current.priority,
            &self.preferred_model,
        )
        .await;
        self.apply_checks(&discovery.checks);
        if let Some(route) = discovery.route {
            info!(from = %current.endpoint, to = %route.endpoint, "higher-priority endpoint recovered");
            self.commit(route);
        }
    }

    async fn select_endpoint(&mut self, selection: Selection) -> Result<ActiveRoute> {
        let url = match &selection {
            Selection::Position(_) => selection
                .resolve(&self.urls())
                .cloned()
                .ok_or_else(|| DeckError::Routing(format!("no endpoint {selection}")))?,
            Selection::Name(url) => url.clone(),
        };

        let status = self.prober.probe(&url).await;
        let index = self
            .registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(&url);
        self.record(index, &status, None);
        if !status.is_reachable() {
            return Err(DeckError::Routing(format!("{url} is {status}")));
        }

        let models = self
            .prober
            .list_models(&url)
            .await
            .map_err(|e| DeckError::Routing(format!("{url}: {e}")))?;
        self.record(index, &status, Some(models.clone()));

        let keep = self.route().map(|r| r.model).unwrap_or_default();
        let model = select_model(&models, &keep)
            .filter(|m| *m == keep)
            .or_else(|| select_model(&models, &self.preferred_model))
            .ok_or_else(|| DeckError::Routing(format!("{url} lists no models")))?;

        let route = ActiveRoute {
            endpoint: url,
            model,
            priority: index,
            pinned: true,
        };
        self.commit(route.clone());
        self.announce();
        Ok(route)
    }

    async fn select_model(&mut self, selection: Selection) -> Result<ActiveRoute> {
        let current = self
            .route()
            .ok_or_else(|| DeckError::Routing("no active endpoint".to_owned()))?;
        let models = self.list_active_models().await?;
        let model = selection
            .resolve(&models)
            .cloned()
            .ok_or_else(|| {
                DeckError::Routing(format!("{} does not list model {selection}", current.endpoint))
            })?;

        self.preferred_model = model.clone();
        let route = ActiveRoute { model, ..current };
        self.commit(route.clone());
        Ok(route)
    }

    async fn list_active_models(&mut self) -> Result<Vec<String>> {
        let current = self
            .route()
            .ok_or_else(|| DeckError::Routing("no active endpoint".to_owned()))?;
        let models = self
            .prober
            .list_models(&current.endpoint)
            .await
            .map_err(|e| DeckError::Connectivity(format!("{}: {e}", current.endpoint)))?;
        self.registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .record(current.priority, super::registry::Reachability::Reachable, Some(models.clone()));
        Ok(models)
    }

    fn commit(&self, route: ActiveRoute) {
        let previous = self.route_tx.send_replace(Some(route.clone()));
        if previous.as_ref() != Some(&route) {
            info!(endpoint = %route.endpoint, model = %route.model, pinned = route.pinned, "active route updated");
        }
    }

    fn announce(&mut self) -> RouteStatus {
        let route = self.route();
        let status = route_status(route.as_ref(), self.local_fallback.as_ref());
        if let Some(changed) = self.announcer.observe(status) {
            info!(status = %changed, "route status changed");
            if let Some(tx) = &self.runtime_tx {
                let _ = tx.send(RuntimeEvent::RouteStatus {
                    status: changed,
                    route,
                });
            }
        }
        status
    }

    fn urls(&self) -> Vec<String> {
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .urls()
    }

    fn record(&self, index: usize, status: &ProbeStatus, models: Option<Vec<String>>) {
        self.registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .record(index, reachability_of(status), models);
    }

    fn apply_checks(&self, checks: &[super::registry::EndpointCheck]) {
        self.registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .apply(checks);
    }
}
