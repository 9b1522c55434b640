//! Subdomain route registry
//!
//! Reads go straight to a sharded map so a lookup never waits on a write to
//! an unrelated subdomain. Each insert/remove is atomic from the reader's
//! perspective: a reader sees either the whole route or nothing.

use burrow_proto::{LocalTarget, TunnelKind};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Route target for one published tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRoute {
    pub tunnel_id: String,
    pub agent_id: String,
    pub subdomain: String,
    pub kind: TunnelKind,
    pub local_target: LocalTarget,
}

/// Route registry errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("Subdomain '{subdomain}' is already claimed by tunnel {claimed_by}")]
    DuplicateSubdomain {
        subdomain: String,
        claimed_by: String,
    },

    #[error("Tunnel {tunnel_id} is already published as '{subdomain}'")]
    AlreadyPublished {
        tunnel_id: String,
        subdomain: String,
    },

    #[error("Route not found: {0}")]
    NotFound(String),
}

/// Concurrent subdomain -> tunnel map
#[derive(Debug, Default)]
pub struct SubdomainRouter {
    routes: Arc<DashMap<String, TunnelRoute>>,
    /// Reverse index used by `unpublish`
    by_tunnel: Arc<DashMap<String, String>>,
}

impl SubdomainRouter {
    pub fn new() -> Self {
        Self {
            routes: Arc::new(DashMap::new()),
            by_tunnel: Arc::new(DashMap::new()),
        }
    }

    /// Publish a route.
    ///
    /// Re-publishing the same tunnel under the same subdomain refreshes the
    /// route. A subdomain held by another tunnel yields `DuplicateSubdomain`.
    pub fn publish(&self, route: TunnelRoute) -> Result<(), RouteError> {
        if let Some(existing) = self.by_tunnel.get(&route.tunnel_id) {
            if *existing != route.subdomain {
                return Err(RouteError::AlreadyPublished {
                    tunnel_id: route.tunnel_id.clone(),
                    subdomain: existing.clone(),
                });
            }
        }

        let subdomain = route.subdomain.clone();
        let tunnel_id = route.tunnel_id.clone();

        match self.routes.entry(subdomain.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().tunnel_id != tunnel_id {
                    let claimed_by = entry.get().tunnel_id.clone();
                    trace!(
                        subdomain = %subdomain,
                        claimed_by = %claimed_by,
                        "Subdomain already claimed"
                    );
                    return Err(RouteError::DuplicateSubdomain {
                        subdomain,
                        claimed_by,
                    });
                }
                entry.insert(route);
            }
            Entry::Vacant(entry) => {
                entry.insert(route);
            }
        }

        self.by_tunnel.insert(tunnel_id.clone(), subdomain.clone());
        debug!(subdomain = %subdomain, tunnel_id = %tunnel_id, "Published route");
        Ok(())
    }

    /// Remove the route of a tunnel. Safe to call for a tunnel that is not published.
    pub fn unpublish(&self, tunnel_id: &str) -> Option<TunnelRoute> {
        let (_, subdomain) = self.by_tunnel.remove(tunnel_id)?;

        match self
            .routes
            .remove_if(&subdomain, |_, route| route.tunnel_id == tunnel_id)
        {
            Some((_, route)) => {
                debug!(subdomain = %subdomain, tunnel_id = %tunnel_id, "Unpublished route");
                Some(route)
            }
            None => {
                warn!(
                    subdomain = %subdomain,
                    tunnel_id = %tunnel_id,
                    "Reverse index pointed at a subdomain owned by another tunnel"
                );
                None
            }
        }
    }

    /// Look up the route for a subdomain (case-insensitive)
    pub fn resolve(&self, subdomain: &str) -> Result<TunnelRoute, RouteError> {
        let key = subdomain.trim().to_ascii_lowercase();
        self.routes
            .get(&key)
            .map(|entry| entry.value().clone())
            .ok_or(RouteError::NotFound(key))
    }

    /// Subdomain currently published for a tunnel
    pub fn subdomain_of(&self, tunnel_id: &str) -> Option<String> {
        self.by_tunnel.get(tunnel_id).map(|entry| entry.value().clone())
    }

    /// Whether a subdomain is claimed
    pub fn is_claimed(&self, subdomain: &str) -> bool {
        self.routes.contains_key(subdomain)
    }

    /// Snapshot of all published routes
    pub fn routes(&self) -> Vec<TunnelRoute> {
        self.routes
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
