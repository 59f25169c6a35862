//! Route Preprocessor (section 4.1): turns the `providers`/`routing` config
//! groups into an immutable, validated table of pipeline bindings, built once
//! at startup. Nothing downstream ever mutates this table or falls back to
//! reading config directly.

pub mod credential;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::config::providers::{DialectTag, ProviderConfig};
use crate::config::routing::RouteConfig;
use crate::error::GatewayError;
use credential::{CredentialPool, RotationStrategy};

/// Heuristic compatibility adapter selection (section 4.6), applied when a
/// provider doesn't set `compatibilityAdapter` explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompatAdapter {
    LmStudio,
    ModelScope,
    Generic,
}

impl CompatAdapter {
    fn infer(model: &str, configured: Option<&str>) -> Self {
        match configured {
            Some("lmstudio") => return CompatAdapter::LmStudio,
            Some("modelscope") => return CompatAdapter::ModelScope,
            Some("generic") => return CompatAdapter::Generic,
            Some(_) | None => {}
        }
        if model.contains("gpt-oss") && model.contains("mlx") {
            CompatAdapter::LmStudio
        } else if model.starts_with("ZhipuAI/GLM-") {
            CompatAdapter::ModelScope
        } else {
            CompatAdapter::Generic
        }
    }
}

/// One fully-resolved (route, provider, model) binding: everything Dispatch
/// needs to send a request without consulting config again.
pub struct PipelineBinding {
    pub provider_name: String,
    pub model: String,
    pub dialect: DialectTag,
    pub endpoint: String,
    pub auth_method: crate::config::providers::AuthMethod,
    pub header_name: Option<String>,
    pub compat_adapter: CompatAdapter,
    pub max_retries_per_key: u32,
    /// Section 3's per-binding retry ceiling across the whole request, not
    /// just one credential. Derived at build time rather than read from a
    /// dedicated config field: `maxRetriesPerKey` times the pool size, so a
    /// provider with more keys naturally gets more total attempts.
    pub max_retries: u32,
    pub priority: i32,
    pub credentials: Arc<CredentialPool>,
    pub settings: std::collections::HashMap<String, serde_json::Value>,
}

pub struct RoutingTable {
    routes: HashMap<String, Vec<Arc<PipelineBinding>>>,
}

impl RoutingTable {
    /// Bindings for a virtual route, highest priority first. `None` when the
    /// route name has no configured bindings at all.
    pub fn bindings_for(&self, route: &str) -> Option<&[Arc<PipelineBinding>]> {
        self.routes.get(route).map(|v| v.as_slice())
    }

    pub fn route_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.routes.keys().map(|s| s.as_str()).collect();
        names.sort();
        names
    }

    pub fn has_route(&self, route: &str) -> bool {
        self.routes.contains_key(route)
    }

    /// Ingress's rule table (section 4.2): explicit `metadata.virtualRoute`
    /// always wins when it names a real route; otherwise an exact match
    /// between the requested model and a route name; otherwise the longest
    /// route name that prefixes the requested model; otherwise `default`.
    /// Never silently substitutes `default` for a route the caller named
    /// explicitly but that doesn't exist.
    pub fn resolve_route(&self, requested_model: &str, explicit: Option<&str>) -> Result<String, GatewayError> {
        if let Some(name) = explicit {
            return if self.has_route(name) {
                Ok(name.to_string())
            } else {
                Err(GatewayError::Routing(format!("virtual route '{}' is not configured", name)))
            };
        }

        if self.has_route(requested_model) {
            return Ok(requested_model.to_string());
        }

        let prefix_match = self
            .routes
            .keys()
            .filter(|name| requested_model.starts_with(name.as_str()))
            .max_by_key(|name| name.len());
        if let Some(name) = prefix_match {
            return Ok(name.clone());
        }

        Ok("default".to_string())
    }

    /// Router's binding selection (section 4.3): first binding (already
    /// priority-sorted) whose pool has a non-exhausted credential right now.
    pub fn select_binding(&self, route: &str) -> Result<Arc<PipelineBinding>, GatewayError> {
        let bindings = self
            .bindings_for(route)
            .ok_or_else(|| GatewayError::Routing(format!("virtual route '{}' is not configured", route)))?;
        bindings
            .iter()
            .find(|b| b.credentials.has_healthy())
            .cloned()
            .ok_or_else(|| GatewayError::NoAvailableProvider(route.to_string()))
    }

    /// Read-only dump for `GET /routes`. Never includes a raw credential
    /// value, only the live healthy/total counts for each binding's pool.
    pub fn describe(&self) -> Vec<RouteSummary> {
        let mut out: Vec<RouteSummary> = self
            .routes
            .iter()
            .map(|(name, bindings)| RouteSummary {
                route: name.clone(),
                bindings: bindings.iter().map(|b| b.describe()).collect(),
            })
            .collect();
        out.sort_by(|a, b| a.route.cmp(&b.route));
        out
    }
}

#[derive(Debug, Serialize)]
pub struct RouteSummary {
    pub route: String,
    pub bindings: Vec<BindingSummary>,
}

#[derive(Debug, Serialize)]
pub struct BindingSummary {
    pub provider: String,
    pub model: String,
    pub dialect: DialectTag,
    pub priority: i32,
    pub credentials_healthy: usize,
    pub credentials_total: usize,
}

impl PipelineBinding {
    fn describe(&self) -> BindingSummary {
        let (healthy, total) = self.credentials.health_counts();
        BindingSummary {
            provider: self.provider_name.clone(),
            model: self.model.clone(),
            dialect: self.dialect,
            priority: self.priority,
            credentials_healthy: healthy,
            credentials_total: total,
        }
    }
}

/// Builds a [`RoutingTable`] from the `providers` and `routing` config
/// groups. Fails closed: any route naming a provider that doesn't exist, or a
/// provider with zero usable credentials, aborts the whole build rather than
/// producing a partially-populated table.
pub fn build_routing_table(
    providers: &HashMap<String, ProviderConfig>,
    routes: &HashMap<String, RouteConfig>,
) -> Result<RoutingTable, GatewayError> {
    let mut pools: HashMap<String, Arc<CredentialPool>> = HashMap::new();
    for (name, provider) in providers {
        let keys = provider.authentication.credentials.api_key.clone().into_vec();
        if keys.is_empty() {
            return Err(GatewayError::Config(format!(
                "provider '{}' has no configured credentials",
                name
            )));
        }
        let strategy = if provider.key_rotation.enabled {
            provider.key_rotation.strategy
        } else {
            RotationStrategy::RoundRobin
        };
        let pool = CredentialPool::new(
            keys,
            strategy,
            Duration::from_millis(provider.key_rotation.cooldown_ms),
        );
        pools.insert(name.clone(), Arc::new(pool));
    }

    let mut table: HashMap<String, Vec<Arc<PipelineBinding>>> = HashMap::new();

    for (route_name, route_config) in routes {
        let mut bindings = Vec::new();
        for spec in route_config.clone().into_bindings() {
            let provider = providers.get(&spec.provider).ok_or_else(|| {
                GatewayError::Config(format!(
                    "route '{}' references unknown provider '{}'",
                    route_name, spec.provider
                ))
            })?;
            let pool = pools.get(&spec.provider).expect("pool built above").clone();
            let compat_adapter = CompatAdapter::infer(
                &spec.model,
                provider.compatibility_adapter.as_deref(),
            );
            let max_retries = provider
                .key_rotation
                .max_retries_per_key
                .saturating_mul(pool.len() as u32)
                .max(1);

            bindings.push(Arc::new(PipelineBinding {
                provider_name: spec.provider.clone(),
                model: spec.model.clone(),
                dialect: provider.provider_type,
                endpoint: provider.endpoint.clone(),
                auth_method: provider.authentication.method,
                header_name: provider.authentication.header_name.clone(),
                compat_adapter,
                max_retries_per_key: provider.key_rotation.max_retries_per_key,
                max_retries,
                priority: spec.priority.unwrap_or(0),
                credentials: pool,
                settings: provider.settings.clone(),
            }));
        }

        if bindings.is_empty() {
            return Err(GatewayError::Config(format!(
                "route '{}' has no bindings",
                route_name
            )));
        }

        // Stable sort: equal priorities keep their config-declared order.
        bindings.sort_by(|a, b| b.priority.cmp(&a.priority));
        table.insert(route_name.clone(), bindings);
    }

    if !table.contains_key("default") {
        return Err(GatewayError::Config(
            "routing config must define a 'default' route".to_string(),
        ));
    }

    Ok(RoutingTable { routes: table })
}
