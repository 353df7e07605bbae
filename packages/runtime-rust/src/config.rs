use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;

/// Platform-level configuration for the routing runtime.
///
/// Controls process identity, the trace collector routes, journaling, route
/// aliases and worker-pool recovery timings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Application name reported in pong replies.
    pub app_name: String,
    /// Unique id of this process. Generated at start when empty.
    pub origin: String,
    /// Route that receives span envelopes.
    pub trace_route: String,
    /// Optional downstream route the trace route forwards spans to.
    pub trace_processor_route: String,
    /// Routes whose input/output is attached to their spans.
    pub journal_routes: BTreeSet<String>,
    /// Route aliases: requests to a key are delivered to its value.
    pub route_substitution: BTreeMap<String, String>,
    /// Upper bound for `release` to wait for in-flight work, in milliseconds.
    pub release_grace_ms: u64,
    /// Delay before a crashed worker slot is respawned, in milliseconds.
    pub slot_restart_grace_ms: u64,
    /// Restarts of a single slot beyond which the route is reported as failing.
    pub max_slot_restarts: u32,
    /// Pool size used by `register` when none is given.
    pub default_pool_size: usize,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            app_name: "relay".to_string(),
            origin: String::new(),
            trace_route: "distributed.tracing".to_string(),
            trace_processor_route: "distributed.trace.processor".to_string(),
            journal_routes: BTreeSet::new(),
            route_substitution: BTreeMap::new(),
            release_grace_ms: 5_000,
            slot_restart_grace_ms: 1_000,
            max_slot_restarts: 3,
            default_pool_size: 1,
        }
    }
}

impl PlatformConfig {
    /// Parses a JSON document. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error for malformed input.
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Follows one level of route substitution.
    #[must_use]
    pub fn substitute<'a>(&'a self, route: &'a str) -> &'a str {
        self.route_substitution
            .get(route)
            .map_or(route, String::as_str)
    }
}
