//! Per-tool circuit breaker. State transitions take explicit timestamps so
//! they replay deterministically, and every transition is persisted through
//! the state store so restarts do not forget tripped tools.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use agent_os_config::BreakerSettings;
use agent_os_domain::{BreakerRecord, BreakerState, DateTimeUtc};
use agent_os_state_core::StateStore;
use anyhow::{anyhow, Result};
use time::Duration;

/// Admission decision for one tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Breaker closed; call freely.
    Allowed,
    /// Cooldown elapsed; this call is the single half-open probe.
    Probe,
    /// Breaker open (or a probe is already in flight); skip this tool.
    Blocked,
}

pub struct CircuitBreaker {
    store: Arc<dyn StateStore>,
    settings: BreakerSettings,
    inflight_probes: Mutex<BTreeSet<String>>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>, settings: BreakerSettings) -> Self {
        Self {
            store,
            settings,
            inflight_probes: Mutex::new(BTreeSet::new()),
        }
    }

    fn probes(&self) -> Result<std::sync::MutexGuard<'_, BTreeSet<String>>> {
        self.inflight_probes
            .lock()
            .map_err(|_| anyhow!("breaker probe lock poisoned"))
    }

    /// Decide whether a call to `key` may proceed at `now`, transitioning
    /// open breakers to half-open once the cooldown has elapsed.
    ///
    /// # Errors
    /// Propagates store failures.
    pub fn admit(&self, key: &str, now: DateTimeUtc) -> Result<Admission> {
        let Some(mut record) = self.store.get_breaker(key)? else {
            return Ok(Admission::Allowed);
        };
        match record.state {
            BreakerState::Closed => Ok(Admission::Allowed),
            BreakerState::Open => {
                let opened_at = record.opened_at.unwrap_or(record.updated_at);
                if now - opened_at >= Duration::seconds(self.settings.cooldown_seconds) {
                    record.state = BreakerState::HalfOpen;
                    record.updated_at = now;
                    self.store.upsert_breaker(&record)?;
                    self.probes()?.insert(key.to_string());
                    tracing::info!(key, "breaker cooled down, admitting half-open probe");
                    Ok(Admission::Probe)
                } else {
                    Ok(Admission::Blocked)
                }
            }
            BreakerState::HalfOpen => {
                let mut probes = self.probes()?;
                if probes.contains(key) {
                    Ok(Admission::Blocked)
                } else {
                    probes.insert(key.to_string());
                    Ok(Admission::Probe)
                }
            }
        }
    }

    /// Record a successful call; closes the breaker and clears any probe.
    ///
    /// # Errors
    /// Propagates store failures.
    pub fn record_success(&self, key: &str, now: DateTimeUtc) -> Result<()> {
        self.probes()?.remove(key);
        self.store.upsert_breaker(&BreakerRecord::closed(key, now))?;
        Ok(())
    }

    /// Record a failed call. Consecutive failures inside the window trip the
    /// breaker open; a failed half-open probe reopens it with a fresh
    /// cooldown.
    ///
    /// # Errors
    /// Propagates store failures.
    pub fn record_failure(&self, key: &str, error: &str, now: DateTimeUtc) -> Result<()> {
        self.probes()?.remove(key);
        let mut record = self
            .store
            .get_breaker(key)?
            .unwrap_or_else(|| BreakerRecord::closed(key, now));

        if record.state == BreakerState::HalfOpen {
            record.state = BreakerState::Open;
            record.opened_at = Some(now);
            record.consecutive_failures = self.settings.failure_threshold;
        } else {
            let window = Duration::seconds(self.settings.window_seconds);
            if now - record.updated_at > window {
                record.consecutive_failures = 0;
            }
            record.consecutive_failures = record.consecutive_failures.saturating_add(1);
            if record.consecutive_failures >= self.settings.failure_threshold {
                record.state = BreakerState::Open;
                record.opened_at = Some(now);
                tracing::warn!(
                    key,
                    failures = record.consecutive_failures,
                    "breaker tripped open"
                );
            }
        }
        record.last_error = error.to_string();
        record.updated_at = now;
        self.store.upsert_breaker(&record)?;
        Ok(())
    }

    /// Snapshot of all persisted breaker records.
    ///
    /// # Errors
    /// Propagates store failures.
    pub fn dashboard(&self) -> Result<Vec<BreakerRecord>> {
        self.store.list_breakers()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_os_domain::now_utc;
    use agent_os_state_sqlite::SqliteStateStore;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn breaker(dir: &tempfile::TempDir) -> CircuitBreaker {
        let store = must_ok(SqliteStateStore::open(dir.path()));
        must_ok(store.migrate());
        CircuitBreaker::new(
            Arc::new(store),
            BreakerSettings {
                failure_threshold: 3,
                cooldown_seconds: 300,
                window_seconds: 600,
            },
        )
    }

    #[test]
    fn trips_after_threshold_consecutive_failures() {
        let dir = must_ok(tempfile::tempdir());
        let breaker = breaker(&dir);
        let t0 = now_utc();
        for _ in 0..2 {
            must_ok(breaker.record_failure("fetch/get", "timeout", t0));
            assert_eq!(must_ok(breaker.admit("fetch/get", t0)), Admission::Allowed);
        }
        must_ok(breaker.record_failure("fetch/get", "timeout", t0));
        assert_eq!(must_ok(breaker.admit("fetch/get", t0)), Admission::Blocked);
    }

    #[test]
    fn cooldown_admits_exactly_one_probe() {
        let dir = must_ok(tempfile::tempdir());
        let breaker = breaker(&dir);
        let t0 = now_utc();
        for _ in 0..3 {
            must_ok(breaker.record_failure("fetch/get", "timeout", t0));
        }
        let before_cooldown = t0 + Duration::seconds(299);
        assert_eq!(
            must_ok(breaker.admit("fetch/get", before_cooldown)),
            Admission::Blocked
        );
        let after_cooldown = t0 + Duration::seconds(300);
        assert_eq!(
            must_ok(breaker.admit("fetch/get", after_cooldown)),
            Admission::Probe
        );
        // A second caller while the probe is in flight stays blocked.
        assert_eq!(
            must_ok(breaker.admit("fetch/get", after_cooldown)),
            Admission::Blocked
        );
    }

    #[test]
    fn successful_probe_closes_failed_probe_reopens() {
        let dir = must_ok(tempfile::tempdir());
        let breaker = breaker(&dir);
        let t0 = now_utc();
        for _ in 0..3 {
            must_ok(breaker.record_failure("fetch/get", "timeout", t0));
        }
        let probe_time = t0 + Duration::seconds(301);
        assert_eq!(
            must_ok(breaker.admit("fetch/get", probe_time)),
            Admission::Probe
        );
        must_ok(breaker.record_success("fetch/get", probe_time));
        assert_eq!(
            must_ok(breaker.admit("fetch/get", probe_time)),
            Admission::Allowed
        );

        // Trip again, probe fails: straight back to open with fresh cooldown.
        for _ in 0..3 {
            must_ok(breaker.record_failure("fetch/get", "timeout", probe_time));
        }
        let second_probe = probe_time + Duration::seconds(301);
        assert_eq!(
            must_ok(breaker.admit("fetch/get", second_probe)),
            Admission::Probe
        );
        must_ok(breaker.record_failure("fetch/get", "still down", second_probe));
        assert_eq!(
            must_ok(breaker.admit("fetch/get", second_probe + Duration::seconds(1))),
            Admission::Blocked
        );
    }

    #[test]
    fn stale_failures_outside_window_do_not_accumulate() {
        let dir = must_ok(tempfile::tempdir());
        let breaker = breaker(&dir);
        let t0 = now_utc();
        must_ok(breaker.record_failure("sqlite/query", "locked", t0));
        must_ok(breaker.record_failure("sqlite/query", "locked", t0 + Duration::seconds(1)));
        // Third failure lands outside the window: counter restarts.
        let late = t0 + Duration::seconds(1200);
        must_ok(breaker.record_failure("sqlite/query", "locked", late));
        assert_eq!(must_ok(breaker.admit("sqlite/query", late)), Admission::Allowed);
    }
}
