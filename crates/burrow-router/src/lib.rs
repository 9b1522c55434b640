//! Subdomain routing for public traffic
//!
//! Maps public subdomains to tunnel routes. Virtual-host matching of the raw
//! `Host` header is reduced to a subdomain label before it reaches the router.

pub mod registry;
pub mod subdomain;

pub use registry::{RouteError, SubdomainRouter, TunnelRoute};
pub use subdomain::{normalize_label, random_label, subdomain_from_host, SubdomainCandidates};
