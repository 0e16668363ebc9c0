//! Endpoint registry, model selection and priority-ordered discovery.

use super::probe::{EndpointProbe, ProbeStatus};
use chrono::{DateTime, Local};
use std::fmt;
use tracing::{debug, info};

/// Last known reachability of a candidate endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reachability {
    /// Never probed.
    #[default]
    Unknown,
    Reachable,
    Unreachable,
}

impl fmt::Display for Reachability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Reachable => write!(f, "reachable"),
            Self::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// One candidate inference endpoint. Position in the registry is its priority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: String,
    pub reachability: Reachability,
    pub last_checked: Option<DateTime<Local>>,
    /// Models the endpoint listed the last time it was asked.
    pub models: Vec<String>,
}

impl Endpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reachability: Reachability::Unknown,
            last_checked: None,
            models: Vec::new(),
        }
    }
}

/// A model served by a particular endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelDescriptor {
    pub name: String,
    pub endpoint: String,
}

/// The `(endpoint, model)` pair all generation requests currently use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveRoute {
    pub endpoint: String,
    pub model: String,
    /// Registry index of `endpoint` (0 = highest priority).
    pub priority: usize,
    /// Chosen explicitly by the user; the monitor will not upgrade away from it.
    pub pinned: bool,
}

/// Connection state reported to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteStatus {
    /// A remote endpoint is serving requests.
    Connected,
    /// No remote endpoint; the designated local backend is in use.
    Fallback,
    /// Nothing can serve requests.
    Disconnected,
}

impl fmt::Display for RouteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::Fallback => write!(f, "fallback"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// User-facing way to name an endpoint or model: a 1-based list position or a literal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Position(usize),
    Name(String),
}

impl Selection {
    /// Numbers select by position, everything else by name.
    pub fn parse(arg: &str) -> Self {
        let arg = arg.trim();
        match arg.parse::<usize>() {
            Ok(n) => Self::Position(n),
            Err(_) => Self::Name(arg.to_owned()),
        }
    }

    /// Resolve against a list, returning the matching entry.
    pub fn resolve<'a>(&self, items: &'a [String]) -> Option<&'a String> {
        match self {
            Self::Position(n) => n.checked_sub(1).and_then(|i| items.get(i)),
            Self::Name(name) => items.iter().find(|item| *item == name),
        }
    }
}

impl fmt::Display for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Position(n) => write!(f, "#{n}"),
            Self::Name(name) => write!(f, "{name}"),
        }
    }
}

/// Pick the model to route to: `preferred` when listed, else the first listed model.
pub fn select_model(available: &[String], preferred: &str) -> Option<String> {
    if !preferred.is_empty() && available.iter().any(|m| m == preferred) {
        return Some(preferred.to_owned());
    }
    available.first().cloned()
}

/// Ordered set of candidate endpoints.
#[derive(Debug, Clone, Default)]
pub struct EndpointRegistry {
    endpoints: Vec<Endpoint>,
}

impl EndpointRegistry {
    /// Build a registry from URLs in priority order. Duplicates keep their first position.
    pub fn new(urls: &[String]) -> Self {
        let mut registry = Self::default();
        for url in urls {
            registry.insert(url);
        }
        registry
    }

    /// Append `url` at the lowest priority unless already registered; returns its index.
    pub fn insert(&mut self, url: &str) -> usize {
        if let Some(index) = self.index_of(url) {
            return index;
        }
        self.endpoints.push(Endpoint::new(url));
        self.endpoints.len() - 1
    }

    pub fn index_of(&self, url: &str) -> Option<usize> {
        self.endpoints.iter().position(|e| e.url == url)
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn urls(&self) -> Vec<String> {
        self.endpoints.iter().map(|e| e.url.clone()).collect()
    }

    pub fn get(&self, index: usize) -> Option<&Endpoint> {
        self.endpoints.get(index)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Every model last listed by any endpoint, in priority order.
    pub fn models(&self) -> Vec<ModelDescriptor> {
        self.endpoints
            .iter()
            .flat_map(|e| {
                e.models.iter().map(|name| ModelDescriptor {
                    name: name.clone(),
                    endpoint: e.url.clone(),
                })
            })
            .collect()
    }

    /// Record a probe outcome for the endpoint at `index`.
    pub fn record(&mut self, index: usize, reachability: Reachability, models: Option<Vec<String>>) {
        if let Some(endpoint) = self.endpoints.get_mut(index) {
            endpoint.reachability = reachability;
            endpoint.last_checked = Some(Local::now());
            if let Some(models) = models {
                endpoint.models = models;
            }
        }
    }

    /// Apply every check a discovery pass made.
    pub fn apply(&mut self, checks: &[EndpointCheck]) {
        for check in checks {
            self.record(check.index, check.reachability, check.models.clone());
        }
    }
}

/// What discovery learned about one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointCheck {
    pub index: usize,
    pub reachability: Reachability,
    pub models: Option<Vec<String>>,
}

/// Result of a discovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Discovery {
    pub route: Option<ActiveRoute>,
    /// Endpoints probed, in the order they were probed.
    pub checks: Vec<EndpointCheck>,
}

/// Walk `urls` in priority order and route to the first endpoint that is
/// reachable and lists a usable model.
///
/// Stops at the first success; lower-priority endpoints are not probed.
pub async fn discover(
    prober: &dyn EndpointProbe,
    urls: &[String],
    preferred_model: &str,
) -> Discovery {
    discover_from(prober, urls, 0, urls.len(), preferred_model).await
}

/// Discovery restricted to registry indices `start..end`.
pub(crate) async fn discover_from(
    prober: &dyn EndpointProbe,
    urls: &[String],
    start: usize,
    end: usize,
    preferred_model: &str,
) -> Discovery {
    let mut discovery = Discovery::default();

    for (index, url) in urls.iter().enumerate().take(end).skip(start) {
        let status = prober.probe(url).await;
        if !status.is_reachable() {
            debug!(url, %status, "endpoint not reachable");
            discovery.checks.push(EndpointCheck {
                index,
                reachability: Reachability::Unreachable,
                models: None,
            });
            continue;
        }

        let models = match prober.list_models(url).await {
            Ok(models) => models,
            Err(e) => {
                debug!(url, error = %e, "model listing failed");
                discovery.checks.push(EndpointCheck {
                    index,
                    reachability: Reachability::Reachable,
                    models: None,
                });
                continue;
            }
        };

        let chosen = select_model(&models, preferred_model);
        discovery.checks.push(EndpointCheck {
            index,
            reachability: Reachability::Reachable,
            models: Some(models),
        });

        if let Some(model) = chosen {
            info!(url, model, "route discovered");
            discovery.route = Some(ActiveRoute {
                endpoint: url.clone(),
                model,
                priority: index,
                pinned: false,
            });
            break;
        }
        debug!(url, "endpoint lists no models");
    }

    discovery
}

/// Whether a probe outcome keeps an endpoint in service.
pub(crate) fn reachability_of(status: &ProbeStatus) -> Reachability {
    if status.is_reachable() {
        Reachability::Reachable
    } else {
        Reachability::Unreachable
    }
}
