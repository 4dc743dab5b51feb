//! Broker-wide tunable defaults (spec Section 2.1 ambient stack: "plain
//! constructor structs with `Default` impls for broker tunables", matching
//! `tenor-cli::serve::state`'s `AppState` built from explicit fields rather
//! than a global config singleton).
//!
//! An `AttributeFinderInvocation` always carries its own per-invocation
//! timing fields (spec Section 3); `BrokerConfig` only supplies the values
//! used when a compiled attribute reference does not specify one
//! (currently: every reference produced by `sapl-compile::lower`, which
//! leaves the timing fields at zero/`None` -- see `resolve_timing` below).

use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct BrokerConfig {
    pub default_initial_timeout: Duration,
    pub default_freshness_ttl: Duration,
    pub default_grace_period: Duration,
    pub default_poll_interval: Option<Duration>,
    pub default_backoff_budget: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            default_initial_timeout: Duration::from_secs(10),
            default_freshness_ttl: Duration::from_secs(0),
            default_grace_period: Duration::from_millis(2_000),
            default_poll_interval: None,
            default_backoff_budget: 3,
        }
    }
}

impl BrokerConfig {
    /// Fill in an invocation's zero-valued timing fields with this
    /// config's defaults. `0` means "unset" uniformly across every field,
    /// including `backoff_budget`: `sapl-compile::lower` has no syntax for
    /// a policy to declare its own retry budget, so every compiled
    /// invocation leaves it at zero and always inherits this config's
    /// default. There is currently no way to compile a policy that asks
    /// for zero retries explicitly.
    pub fn resolve_timing(&self, invocation: &mut sapl_compile::AttributeFinderInvocation) {
        if invocation.initial_timeout_millis == 0 {
            invocation.initial_timeout_millis = self.default_initial_timeout.as_millis() as u64;
        }
        if invocation.freshness_ttl_millis == 0 {
            invocation.freshness_ttl_millis = self.default_freshness_ttl.as_millis() as u64;
        }
        if invocation.poll_interval_millis.is_none() {
            invocation.poll_interval_millis =
                self.default_poll_interval.map(|d| d.as_millis() as u64);
        }
        if invocation.backoff_budget == 0 {
            invocation.backoff_budget = self.default_backoff_budget;
        }
    }
}
