//! Origin allow-list gating for WebSocket upgrades.

use globset::{Glob, GlobSet, GlobSetBuilder};

/// Compiled Origin allow-list.
///
/// Patterns use glob syntax where `*` matches any run of characters
/// (`https://*.example.com` admits every subdomain). With no patterns
/// configured, every origin -- including a missing one -- is accepted.
/// With patterns configured, a request must present a matching Origin
/// header; browsers always send one, so an absent or empty header is
/// treated as a non-browser client trying to sidestep the check.
pub struct OriginPolicy {
    allowed: Option<GlobSet>,
}

impl OriginPolicy {
    /// Accept every origin.
    pub fn allow_all() -> Self {
        Self { allowed: None }
    }

    /// Compile an allow-list; an invalid pattern is a configuration error.
    pub fn compile(patterns: &[String]) -> Result<Self, globset::Error> {
        if patterns.is_empty() {
            return Ok(Self::allow_all());
        }
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            builder.add(Glob::new(pattern)?);
        }
        Ok(Self {
            allowed: Some(builder.build()?),
        })
    }

    /// Whether a request with this (trimmed) Origin header may upgrade.
    pub fn allows(&self, origin: Option<&str>) -> bool {
        let Some(allowed) = &self.allowed else {
            return true;
        };
        match origin.map(str::trim) {
            Some(origin) if !origin.is_empty() => allowed.is_match(origin),
            _ => false,
        }
    }
}
