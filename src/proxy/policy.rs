//! Decrypt selection policy.
//!
//! Decides, per CONNECT target, whether a TLS stream should be intercepted
//! or relayed untouched. The policy is a host-pattern list interpreted in one
//! of two modes:
//!
//! - `Include`: only matching targets are decrypted
//! - `Exclude`: everything except matching targets is decrypted
//!
//! Patterns use `*` wildcards and are matched case-insensitively against both
//! the bare hostname and `hostname:port`, so `*.internal` and
//! `example.com:8443` both work as expected.
//!
//! The policy is immutable after construction and shared read-only across
//! connection tasks.

use serde::{Deserialize, Serialize};
use tracing::trace;

/// How the pattern list is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterMode {
    /// Decrypt only targets matching a pattern.
    Include,
    /// Decrypt everything except targets matching a pattern.
    #[default]
    Exclude,
}

/// Per-target decrypt decision rule.
#[derive(Debug, Clone)]
pub struct DecryptPolicy {
    enabled: bool,
    mode: FilterMode,
    patterns: Vec<String>,
}

impl DecryptPolicy {
    /// Build a policy. Patterns are lowercased once, up front.
    pub fn new(
        enabled: bool,
        mode: FilterMode,
        patterns: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            enabled,
            mode,
            patterns: patterns.into_iter().map(|p| p.to_lowercase()).collect(),
        }
    }

    /// A policy that never decrypts.
    pub fn disabled() -> Self {
        Self::new(false, FilterMode::default(), [])
    }

    /// Decrypt only the given patterns.
    pub fn include(patterns: impl IntoIterator<Item = String>) -> Self {
        Self::new(true, FilterMode::Include, patterns)
    }

    /// Decrypt everything except the given patterns.
    pub fn exclude(patterns: impl IntoIterator<Item = String>) -> Self {
        Self::new(true, FilterMode::Exclude, patterns)
    }

    /// Whether interception is enabled at all.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Should a TLS stream to `hostname:port` be intercepted?
    pub fn should_decrypt(&self, hostname: &str, port: u16) -> bool {
        if !self.enabled {
            return false;
        }

        let host = hostname.to_lowercase();
        let host_port = format!("{}:{}", host, port);
        let matched = self
            .patterns
            .iter()
            .any(|p| matches_pattern(p, &host) || matches_pattern(p, &host_port));

        let decrypt = match self.mode {
            FilterMode::Include => matched,
            FilterMode::Exclude => !matched,
        };
        trace!(
            "decrypt policy for {}: matched={}, decrypt={}",
            host_port,
            matched,
            decrypt
        );
        decrypt
    }
}

/// Match a candidate against a pattern where `*` matches any run of
/// characters. Anchored at both ends.
fn matches_pattern(pattern: &str, candidate: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == candidate;
    }

    let segments: Vec<&str> = pattern.split('*').collect();
    let mut remainder = candidate;

    // First segment anchors at the start.
    let first = segments[0];
    if !remainder.starts_with(first) {
        return false;
    }
    remainder = &remainder[first.len()..];

    let last_index = segments.len() - 1;
    for (index, segment) in segments.iter().enumerate().skip(1) {
        if segment.is_empty() {
            continue;
        }
        if index == last_index {
            // Last segment anchors at the end.
            if !remainder.ends_with(segment) {
                return false;
            }
            remainder = "";
        } else {
            match remainder.find(segment) {
                Some(pos) => remainder = &remainder[pos + segment.len()..],
                None => return false,
            }
        }
    }

    true
}
