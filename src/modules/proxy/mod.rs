//! Proxy rotation and health tracking utilities.
//!
//! Parses `user:pass:host:port` records, tracks failure streaks per proxy,
//! parks unhealthy endpoints for a cooldown and selects the next candidate
//! for an identity based on the configured rotation strategy.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{ConfigError, duration_secs, lists};
use crate::modules::events::{EventDispatcher, PoolFallbackEvent, WireEvent};

/// Shared handle to a loaded proxy.
pub type ProxyRef = Arc<ProxyEndpoint>;

const PLACEHOLDER_DOMAINS: &[&str] = &["example.com", "example.org", "example.net", "proxy.example"];
const LOOPBACK_HOSTS: &[&str] = &["localhost", "0.0.0.0", "::1", "[::1]"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RotationStrategy {
    #[default]
    Sticky,
    RoundRobin,
    Random,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyPoolConfig {
    pub rotation: RotationStrategy,
    pub max_failures: u32,
    #[serde(with = "duration_secs")]
    pub cooldown: Duration,
}

impl Default for ProxyPoolConfig {
    fn default() -> Self {
        Self {
            rotation: RotationStrategy::Sticky,
            max_failures: 3,
            cooldown: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProxyParseError {
    #[error("expected user:pass:host:port, got {0} field(s)")]
    Malformed(usize),
    #[error("missing host")]
    MissingHost,
    #[error("invalid port '{0}'")]
    InvalidPort(String),
    #[error("placeholder or loopback host '{0}'")]
    Placeholder(String),
}

/// Static proxy record loaded from configuration.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ProxyEndpoint {
    pub user: String,
    pub pass: String,
    pub host: String,
    pub port: u16,
}

impl ProxyEndpoint {
    /// Health/routing key, credentials excluded.
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn url(&self) -> String {
        if self.user.is_empty() {
            format!("http://{}:{}", self.host, self.port)
        } else {
            format!("http://{}:{}@{}:{}", self.user, self.pass, self.host, self.port)
        }
    }
}

impl fmt::Debug for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyEndpoint")
            .field("user", &self.user)
            .field("host", &self.host)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl FromStr for ProxyEndpoint {
    type Err = ProxyParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = line.trim().split(':').map(str::trim).collect();
        let [user, pass, host, port] = fields.as_slice() else {
            return Err(ProxyParseError::Malformed(fields.len()));
        };

        if host.is_empty() {
            return Err(ProxyParseError::MissingHost);
        }
        if is_placeholder_host(host) {
            return Err(ProxyParseError::Placeholder(host.to_string()));
        }
        let port = port
            .parse::<u16>()
            .ok()
            .filter(|port| *port != 0)
            .ok_or_else(|| ProxyParseError::InvalidPort(port.to_string()))?;

        Ok(Self {
            user: user.to_string(),
            pass: pass.to_string(),
            host: host.to_string(),
            port,
        })
    }
}

fn is_placeholder_host(host: &str) -> bool {
    let host = host.to_ascii_lowercase();
    if LOOPBACK_HOSTS.contains(&host.as_str()) || host.starts_with("127.") {
        return true;
    }
    PLACEHOLDER_DOMAINS
        .iter()
        .any(|domain| host == *domain || host.ends_with(&format!(".{domain}")))
}

/// Health record for one proxy.
#[derive(Debug, Clone)]
pub struct ProxyHealth {
    pub proxy_key: String,
    pub failure_count: u32,
    pub last_failure_at: Option<Instant>,
    pub last_success_at: Option<Instant>,
    pub healthy: bool,
}

impl ProxyHealth {
    fn new(proxy_key: String) -> Self {
        Self {
            proxy_key,
            failure_count: 0,
            last_failure_at: None,
            last_success_at: None,
            healthy: true,
        }
    }

    /// Lazily promotes an unhealthy proxy once its cooldown has elapsed.
    fn refresh(&mut self, now: Instant, cooldown: Duration) {
        if self.healthy {
            return;
        }
        let expired = self
            .last_failure_at
            .is_none_or(|at| now.saturating_duration_since(at) >= cooldown);
        if expired {
            log::info!("proxy {} cooled down, eligible again", self.proxy_key);
            self.failure_count = 0;
            self.healthy = true;
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyHealthReport {
    pub total_proxies: usize,
    pub healthy_proxies: usize,
    pub unhealthy_proxies: usize,
    pub fallback_selections: u64,
    pub details: Vec<ProxyHealth>,
}

#[derive(Debug, Default)]
struct PoolState {
    proxies: Vec<ProxyRef>,
    health: HashMap<String, ProxyHealth>,
    sticky: HashMap<String, ProxyRef>,
    cursor: usize,
    fallback_selections: u64,
}

impl PoolState {
    fn health_mut(&mut self, proxy: &ProxyEndpoint) -> &mut ProxyHealth {
        let key = proxy.key();
        self.health
            .entry(key.clone())
            .or_insert_with(|| ProxyHealth::new(key))
    }

    /// Eligible set after cooldown promotion; the whole pool when nothing is healthy.
    fn eligible(&mut self, now: Instant, cooldown: Duration) -> (Vec<ProxyRef>, bool) {
        let mut eligible = Vec::with_capacity(self.proxies.len());
        for proxy in &self.proxies {
            let healthy = match self.health.get_mut(&proxy.key()) {
                Some(health) => {
                    health.refresh(now, cooldown);
                    health.healthy
                }
                None => true,
            };
            if healthy {
                eligible.push(proxy.clone());
            }
        }

        if eligible.is_empty() && !self.proxies.is_empty() {
            self.fallback_selections += 1;
            return (self.proxies.clone(), true);
        }
        (eligible, false)
    }

    fn next_round_robin(&mut self, eligible: &[ProxyRef]) -> ProxyRef {
        let proxy = eligible[self.cursor % eligible.len()].clone();
        self.cursor = self.cursor.wrapping_add(1);
        proxy
    }
}

/// Proxy pool with health tracking and per-identity rotation.
#[derive(Default)]
pub struct ProxyPool {
    config: ProxyPoolConfig,
    state: Mutex<PoolState>,
    events: Option<Arc<EventDispatcher>>,
}

impl ProxyPool {
    pub fn new(config: ProxyPoolConfig) -> Self {
        Self {
            config,
            state: Mutex::new(PoolState::default()),
            events: None,
        }
    }

    pub fn with_events(mut self, events: Arc<EventDispatcher>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &ProxyPoolConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the static pool with the valid records from `source`.
    ///
    /// Invalid lines are skipped; an empty result switches the pool to
    /// direct-connection mode. Returns the number of proxies kept.
    pub fn load_proxies<I, S>(&self, source: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut proxies: Vec<ProxyRef> = Vec::new();
        for line in source {
            let line = line.as_ref().trim();
            if line.is_empty() {
                continue;
            }
            match line.parse::<ProxyEndpoint>() {
                Ok(endpoint) => {
                    if proxies.iter().any(|existing| existing.key() == endpoint.key()) {
                        continue;
                    }
                    proxies.push(Arc::new(endpoint));
                }
                Err(err) => log::debug!("skipping proxy record: {err}"),
            }
        }

        let count = proxies.len();
        let mut state = self.state();
        *state = PoolState {
            proxies,
            ..PoolState::default()
        };
        if count == 0 {
            log::info!("no usable proxies loaded, using direct connections");
        } else {
            log::info!("loaded {count} proxies");
        }
        count
    }

    pub fn load_from_path(&self, path: impl AsRef<Path>) -> Result<usize, ConfigError> {
        let lines = lists::load_lines(path)?;
        Ok(self.load_proxies(lines))
    }

    pub fn len(&self) -> usize {
        self.state().proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn proxies(&self) -> Vec<ProxyRef> {
        self.state().proxies.clone()
    }

    /// Returns `None` when the pool is empty: connect directly.
    pub fn select_proxy_for_identity(&self, identity: &str) -> Option<ProxyRef> {
        self.select_proxy_for_identity_at(identity, Instant::now())
    }

    pub fn select_proxy_for_identity_at(&self, identity: &str, now: Instant) -> Option<ProxyRef> {
        let mut state = self.state();
        let (eligible, fell_back) = state.eligible(now, self.config.cooldown);
        if eligible.is_empty() {
            return None;
        }

        let selected = match self.config.rotation {
            RotationStrategy::Sticky => {
                let current = state
                    .sticky
                    .get(identity)
                    .filter(|assigned| eligible.contains(assigned))
                    .cloned();
                match current {
                    Some(proxy) => proxy,
                    None => {
                        let proxy = state.next_round_robin(&eligible);
                        state.sticky.insert(identity.to_string(), proxy.clone());
                        proxy
                    }
                }
            }
            RotationStrategy::RoundRobin => state.next_round_robin(&eligible),
            RotationStrategy::Random => eligible.choose(&mut rand::thread_rng()).cloned()?,
        };
        drop(state);

        if fell_back {
            self.report_pool_fallback(eligible.len());
        }
        Some(selected)
    }

    pub fn select_random_healthy_proxy(&self) -> Option<ProxyRef> {
        self.select_random_healthy_proxy_at(None, Instant::now())
    }

    /// Random pick that avoids `failed` whenever another candidate exists.
    pub fn select_random_healthy_proxy_except(&self, failed: &ProxyEndpoint) -> Option<ProxyRef> {
        self.select_random_healthy_proxy_at(Some(failed), Instant::now())
    }

    pub fn select_random_healthy_proxy_at(
        &self,
        exclude: Option<&ProxyEndpoint>,
        now: Instant,
    ) -> Option<ProxyRef> {
        let (eligible, fell_back) = self.state().eligible(now, self.config.cooldown);
        if fell_back {
            self.report_pool_fallback(eligible.len());
        }

        let others: Vec<ProxyRef> = eligible
            .iter()
            .filter(|proxy| exclude.is_none_or(|failed| proxy.as_ref() != failed))
            .cloned()
            .collect();
        let candidates = if others.is_empty() { &eligible } else { &others };
        candidates.choose(&mut rand::thread_rng()).cloned()
    }

    pub fn report_success(&self, proxy: &ProxyEndpoint) {
        self.report_success_at(proxy, Instant::now());
    }

    pub fn report_success_at(&self, proxy: &ProxyEndpoint, now: Instant) {
        let mut state = self.state();
        let health = state.health_mut(proxy);
        health.failure_count = 0;
        health.healthy = true;
        health.last_success_at = Some(now);
    }

    pub fn report_failure(&self, proxy: &ProxyEndpoint) {
        self.report_failure_at(proxy, Instant::now());
    }

    pub fn report_failure_at(&self, proxy: &ProxyEndpoint, now: Instant) {
        let max_failures = self.config.max_failures.max(1);
        let mut state = self.state();
        let health = state.health_mut(proxy);
        health.failure_count += 1;
        health.last_failure_at = Some(now);
        if health.healthy && health.failure_count >= max_failures {
            health.healthy = false;
            log::warn!(
                "proxy {} marked unhealthy after {} failures",
                health.proxy_key,
                health.failure_count
            );
        }
    }

    /// Snapshot of one proxy's health record, if it has been used.
    pub fn health(&self, proxy: &ProxyEndpoint) -> Option<ProxyHealth> {
        self.state().health.get(&proxy.key()).cloned()
    }

    pub fn health_report(&self) -> ProxyHealthReport {
        let state = self.state();
        let mut healthy = 0;
        let mut details = Vec::with_capacity(state.proxies.len());
        for proxy in &state.proxies {
            let health = state
                .health
                .get(&proxy.key())
                .cloned()
                .unwrap_or_else(|| ProxyHealth::new(proxy.key()));
            if health.healthy {
                healthy += 1;
            }
            details.push(health);
        }

        ProxyHealthReport {
            total_proxies: state.proxies.len(),
            healthy_proxies: healthy,
            unhealthy_proxies: state.proxies.len() - healthy,
            fallback_selections: state.fallback_selections,
            details,
        }
    }

    fn report_pool_fallback(&self, pool_size: usize) {
        log::warn!("no healthy proxies left, selecting from all {pool_size}");
        if let Some(events) = &self.events {
            events.dispatch(WireEvent::PoolFallback(PoolFallbackEvent {
                pool_size,
                timestamp: Utc::now(),
            }));
        }
    }
}

impl fmt::Debug for ProxyPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyPool")
            .field("config", &self.config)
            .field("proxies", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn pool_with(rotation: RotationStrategy, hosts: &[&str]) -> ProxyPool {
        let pool = ProxyPool::new(ProxyPoolConfig {
            rotation,
            ..Default::default()
        });
        pool.load_proxies(hosts.iter().map(|host| format!("user:pass:{host}:8080")));
        pool
    }

    #[test]
    fn filters_placeholder_and_loopback_entries() {
        let pool = ProxyPool::default();
        let loaded = pool.load_proxies([
            "user:pass:example.com:8080",
            "user:pass:realhost.test:8080",
            "user:pass:127.0.0.1:8080",
            "user:pass:localhost:8080",
            "user:pass::8080",
            "user:pass:host.test:",
            "not-a-proxy",
        ]);

        assert_eq!(loaded, 1);
        let proxies = pool.proxies();
        assert_eq!(proxies[0].host, "realhost.test");
        assert_eq!(proxies[0].port, 8080);
    }

    #[test]
    fn empty_pool_selects_direct_connection() {
        let pool = ProxyPool::default();
        assert_eq!(pool.load_proxies(["user:pass:example.com:1"]), 0);
        assert!(pool.select_proxy_for_identity("token-a").is_none());
        assert!(pool.select_random_healthy_proxy().is_none());
    }

    #[test]
    fn sticky_rotation_reuses_assignment() {
        let pool = pool_with(RotationStrategy::Sticky, &["a.test", "b.test", "c.test"]);
        let first = pool.select_proxy_for_identity("token-a").unwrap();
        for _ in 0..5 {
            pool.select_proxy_for_identity("token-b");
            assert_eq!(pool.select_proxy_for_identity("token-a").unwrap(), first);
        }
    }

    #[test]
    fn sticky_rotation_moves_off_unhealthy_proxy() {
        let pool = pool_with(RotationStrategy::Sticky, &["a.test", "b.test"]);
        let now = Instant::now();
        let first = pool.select_proxy_for_identity_at("token-a", now).unwrap();
        for _ in 0..3 {
            pool.report_failure_at(&first, now);
        }

        let second = pool.select_proxy_for_identity_at("token-a", now).unwrap();
        assert_ne!(second, first);
        assert_eq!(pool.select_proxy_for_identity_at("token-a", now).unwrap(), second);
    }

    #[test]
    fn round_robin_visits_every_proxy_before_repeating() {
        let hosts = ["a.test", "b.test", "c.test", "d.test"];
        let pool = pool_with(RotationStrategy::RoundRobin, &hosts);

        let seen: HashSet<String> = (0..hosts.len())
            .map(|i| pool.select_proxy_for_identity(&format!("token-{i}")).unwrap().key())
            .collect();
        assert_eq!(seen.len(), hosts.len());

        let again = pool.select_proxy_for_identity("token-x").unwrap();
        assert_eq!(again.host, "a.test");
    }

    #[test]
    fn random_rotation_stays_within_pool() {
        let pool = pool_with(RotationStrategy::Random, &["a.test", "b.test"]);
        for i in 0..20 {
            let proxy = pool.select_proxy_for_identity(&format!("token-{i}")).unwrap();
            assert!(proxy.host == "a.test" || proxy.host == "b.test");
        }
    }

    #[test]
    fn excludes_proxy_until_cooldown_expires() {
        let pool = pool_with(RotationStrategy::RoundRobin, &["a.test", "b.test"]);
        let now = Instant::now();
        let bad = pool.proxies()[0].clone();

        pool.report_failure_at(&bad, now);
        pool.report_failure_at(&bad, now);
        assert!(pool.health(&bad).unwrap().healthy);
        pool.report_failure_at(&bad, now);
        assert!(!pool.health(&bad).unwrap().healthy);

        let almost = now + Duration::from_secs(299);
        for i in 0..4 {
            let picked = pool
                .select_proxy_for_identity_at(&format!("token-{i}"), almost)
                .unwrap();
            assert_ne!(picked, bad);
        }

        let later = now + Duration::from_secs(300);
        let picked: Vec<ProxyRef> = (0..2)
            .map(|i| pool.select_proxy_for_identity_at(&format!("late-{i}"), later).unwrap())
            .collect();
        assert!(picked.contains(&bad));
        let health = pool.health(&bad).unwrap();
        assert!(health.healthy);
        assert_eq!(health.failure_count, 0);
    }

    #[test]
    fn success_resets_failure_streak() {
        let pool = pool_with(RotationStrategy::RoundRobin, &["a.test"]);
        let proxy = pool.proxies()[0].clone();
        pool.report_failure(&proxy);
        pool.report_failure(&proxy);
        pool.report_success(&proxy);
        pool.report_failure(&proxy);

        let health = pool.health(&proxy).unwrap();
        assert_eq!(health.failure_count, 1);
        assert!(health.healthy);
        assert!(health.last_success_at.is_some());
    }

    #[test]
    fn falls_back_to_whole_pool_when_nothing_is_healthy() {
        let pool = pool_with(RotationStrategy::RoundRobin, &["a.test", "b.test"]);
        let now = Instant::now();
        for proxy in pool.proxies() {
            for _ in 0..3 {
                pool.report_failure_at(&proxy, now);
            }
        }

        assert!(pool.select_proxy_for_identity_at("token-a", now).is_some());
        let report = pool.health_report();
        assert_eq!(report.unhealthy_proxies, 2);
        assert_eq!(report.fallback_selections, 1);
    }

    #[test]
    fn random_healthy_selection_avoids_failed_proxy() {
        let pool = pool_with(RotationStrategy::Sticky, &["a.test", "b.test"]);
        let failed = pool.proxies()[0].clone();
        for _ in 0..10 {
            let next = pool.select_random_healthy_proxy_except(&failed).unwrap();
            assert_ne!(next, failed);
        }
    }
}
