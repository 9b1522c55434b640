//! Subdomain derivation and host parsing

use rand::Rng;

/// Longest DNS label
pub const MAX_LABEL_LEN: usize = 63;

/// Length of randomly generated labels
const RANDOM_LABEL_LEN: usize = 6;

const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Reduce a tunnel name to a subdomain base: lowercase ASCII letters and digits only
pub fn normalize_label(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .take(MAX_LABEL_LEN)
        .collect()
}

/// Random base36 label, used when a name has no usable characters
pub fn random_label() -> String {
    let mut rng = rand::thread_rng();
    (0..RANDOM_LABEL_LEN)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

/// Candidate subdomains for a base: `base`, `base1`, `base2`, ...
///
/// Bounded by `max_attempts`; suffixes never push a label past 63 characters.
#[derive(Debug, Clone)]
pub struct SubdomainCandidates {
    base: String,
    next: usize,
    max_attempts: usize,
}

impl SubdomainCandidates {
    pub fn new(base: impl Into<String>, max_attempts: usize) -> Self {
        Self {
            base: base.into(),
            next: 0,
            max_attempts,
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }
}

impl Iterator for SubdomainCandidates {
    type Item = String;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.max_attempts {
            return None;
        }
        let attempt = self.next;
        self.next += 1;

        if attempt == 0 {
            return Some(self.base.clone());
        }

        let suffix = attempt.to_string();
        let keep = MAX_LABEL_LEN.saturating_sub(suffix.len()).min(self.base.len());
        Some(format!("{}{}", &self.base[..keep], suffix))
    }
}

/// Extract the tunnel subdomain from a `Host` header value.
///
/// `web.relay.example.com:8080` with base domain `relay.example.com` gives
/// `web`. Hosts outside the base domain, or nested below a single label,
/// give `None`.
pub fn subdomain_from_host(host: &str, base_domain: &str) -> Option<String> {
    // Remove port if present (e.g., "web.example.com:8080" -> "web.example.com")
    let host = host.trim().split(':').next()?.trim_end_matches('.');
    let host = host.to_ascii_lowercase();
    let base = base_domain.trim().trim_end_matches('.').to_ascii_lowercase();

    let label = host.strip_suffix(&base)?.strip_suffix('.')?;
    if label.is_empty() || label.contains('.') {
        return None;
    }
    Some(label.to_string())
}
