//! Byte budgets for upload-presign requests.
//!
//! A request is charged against every applicable scope (project, IP and, when known,
//! device) for both the minute and the day window in a single atomic batch, so it is never
//! billed against some scopes and not others.

use crate::config::ByteBudgetConfig;
use crate::errors::QuotaError;
use crate::metrics_defs::{
    BYTE_BUDGET_ACCEPTED_BYTES, BYTE_BUDGET_REJECTED, BYTE_BUDGET_UNAVAILABLE,
    DEVICE_FANOUT_SUSPECT,
};
use chrono::{DateTime, Utc};
use counters::{CounterStore, Increment, RateLimitSpec, Window, bounded};
use shared::clock::Clock;
use shared::{counter, histogram};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

/// An upload about to be presigned.
#[derive(Clone, Debug)]
pub struct BudgetRequest<'a> {
    pub project_id: &'a str,
    pub device_id: Option<&'a str>,
    pub client_ip: &'a str,
    pub bytes: u64,
    /// Label of the calling endpoint, for logs and metrics only.
    pub endpoint: &'a str,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Scope {
    Project,
    Ip,
    Device,
}

impl Scope {
    fn as_str(&self) -> &'static str {
        match self {
            Scope::Project => "project",
            Scope::Ip => "ip",
            Scope::Device => "device",
        }
    }
}

#[derive(Debug)]
struct ScopedSpec {
    scope: Scope,
    spec: RateLimitSpec,
}

impl ScopedSpec {
    fn new(scope: Scope, window: Window, identity: &str, limit: u64) -> Self {
        let key = format!("budget:{}:{}:{}", scope.as_str(), window.as_str(), identity);
        ScopedSpec {
            scope,
            spec: RateLimitSpec::new(key, limit, window),
        }
    }

    fn label(&self) -> String {
        format!("{}:{}", self.scope.as_str(), self.spec.window.as_str())
    }
}

pub struct ByteBudgetEnforcer {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    config: ByteBudgetConfig,
    timeout: Duration,
}

impl ByteBudgetEnforcer {
    pub fn new(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        config: ByteBudgetConfig,
        timeout: Duration,
    ) -> Self {
        ByteBudgetEnforcer {
            store,
            clock,
            config,
            timeout,
        }
    }

    /// Charges `request.bytes` against every applicable budget, or explains why not.
    ///
    /// Size validation happens before any counter is touched. A counter store failure
    /// fails closed with [`QuotaError::BudgetUnavailable`].
    pub async fn enforce(&self, request: &BudgetRequest<'_>) -> Result<(), QuotaError> {
        self.validate_size(request.bytes)?;

        let now = self.clock.now();
        let ip = normalize_ip(request.client_ip);
        let specs = self.budget_specs(request.project_id, request.device_id, &ip);
        let by = request.bytes as i64;
        let ops: Vec<Increment> = specs
            .iter()
            .map(|s| Increment::new(s.spec.bucket_key(now), by, s.spec.window.ttl()))
            .collect();

        let totals = bounded(self.timeout, self.store.incr_batch(&ops))
            .await
            .map_err(|err| {
                tracing::error!(
                    project_id = request.project_id,
                    endpoint = request.endpoint,
                    error = %err,
                    "byte budget check failed closed"
                );
                counter!(BYTE_BUDGET_UNAVAILABLE).increment(1);
                QuotaError::BudgetUnavailable(err)
            })?;

        let violations: Vec<&ScopedSpec> = specs
            .iter()
            .zip(&totals)
            .filter(|(s, total)| (**total).max(0) as u64 > s.spec.limit)
            .map(|(s, _)| s)
            .collect();

        if let Some(first) = violations.first() {
            let retry_after_secs = retry_after(&violations, now);
            let scope = first.label();
            tracing::info!(
                project_id = request.project_id,
                endpoint = request.endpoint,
                scope = %scope,
                violations = violations.len(),
                retry_after_secs,
                "byte budget exceeded"
            );
            counter!(BYTE_BUDGET_REJECTED, "reason" => "budget_exceeded").increment(1);
            return Err(QuotaError::BudgetExceeded {
                scope,
                retry_after_secs,
            });
        }

        if let Some(device_id) = request.device_id {
            self.note_device_fanout(&ip, device_id, now).await;
        }

        histogram!(BYTE_BUDGET_ACCEPTED_BYTES, "endpoint" => request.endpoint.to_string())
            .record(request.bytes as f64);
        Ok(())
    }

    fn validate_size(&self, bytes: u64) -> Result<(), QuotaError> {
        if bytes == 0 {
            counter!(BYTE_BUDGET_REJECTED, "reason" => "invalid_size").increment(1);
            return Err(QuotaError::InvalidSize(
                "byte count must be positive".into(),
            ));
        }
        if bytes > self.config.max_object_bytes {
            counter!(BYTE_BUDGET_REJECTED, "reason" => "payload_too_large").increment(1);
            return Err(QuotaError::PayloadTooLarge {
                bytes,
                max_bytes: self.config.max_object_bytes,
            });
        }
        Ok(())
    }

    fn budget_specs(&self, project_id: &str, device_id: Option<&str>, ip: &str) -> Vec<ScopedSpec> {
        let c = &self.config;
        let mut specs = vec![
            ScopedSpec::new(Scope::Project, Window::Minute, project_id, c.project_minute_bytes),
            ScopedSpec::new(Scope::Project, Window::Day, project_id, c.project_day_bytes),
            ScopedSpec::new(Scope::Ip, Window::Minute, ip, c.ip_minute_bytes),
            ScopedSpec::new(Scope::Ip, Window::Day, ip, c.ip_day_bytes),
        ];
        if let Some(device_id) = device_id {
            specs.push(ScopedSpec::new(
                Scope::Device,
                Window::Minute,
                device_id,
                c.device_minute_bytes,
            ));
            specs.push(ScopedSpec::new(
                Scope::Device,
                Window::Day,
                device_id,
                c.device_day_bytes,
            ));
        }
        specs
    }

    /// Advisory: flags IPs uploading for unusually many devices. Never rejects, and any
    /// store failure is logged and ignored.
    async fn note_device_fanout(&self, ip: &str, device_id: &str, now: DateTime<Utc>) {
        let key = format!("budget:ip_devices:{}:{}", ip, Window::Day.bucket(now));
        let ttl = Window::Day.ttl();

        let distinct = async {
            bounded(self.timeout, self.store.set_add(&key, device_id, ttl)).await?;
            bounded(self.timeout, self.store.set_card(&key)).await
        };

        match distinct.await {
            Ok(devices) if devices > self.config.devices_per_ip_warn_threshold => {
                tracing::warn!(ip, devices, "many distinct devices uploading from one ip");
                counter!(DEVICE_FANOUT_SUSPECT).increment(1);
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(ip, error = %err, "device fan-out check failed open");
            }
        }
    }
}

/// The longest wait until every violated window has rolled over.
fn retry_after(violations: &[&ScopedSpec], now: DateTime<Utc>) -> u64 {
    violations
        .iter()
        .map(|s| s.spec.window.seconds_until_reset(now))
        .max()
        .unwrap_or(1)
}

/// Canonical form of a client IP for use in counter keys. IPv4-mapped IPv6 addresses
/// collapse to their IPv4 form so both spellings share a budget.
pub fn normalize_ip(raw: &str) -> String {
    let trimmed = raw.trim();
    match trimmed.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
        Ok(IpAddr::V4(v4)) => v4.to_string(),
        Err(_) if trimmed.is_empty() => "unknown".to_string(),
        Err(_) => trimmed.to_ascii_lowercase(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use counters::memory::MemoryCounterStore;
    use shared::clock::ManualClock;

    const KIB: u64 = 1024;

    fn config() -> ByteBudgetConfig {
        ByteBudgetConfig {
            max_object_bytes: 100 * KIB,
            project_minute_bytes: 250 * KIB,
            project_day_bytes: 1_000 * KIB,
            device_minute_bytes: 150 * KIB,
            device_day_bytes: 500 * KIB,
            ip_minute_bytes: 300 * KIB,
            ip_day_bytes: 2_000 * KIB,
            devices_per_ip_warn_threshold: 2,
        }
    }

    fn enforcer() -> (Arc<MemoryCounterStore>, Arc<ManualClock>, ByteBudgetEnforcer) {
        let store = Arc::new(MemoryCounterStore::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 3, 14, 20, 15).unwrap(),
        ));
        let enforcer = ByteBudgetEnforcer::new(
            store.clone(),
            clock.clone(),
            config(),
            Duration::from_millis(100),
        );
        (store, clock, enforcer)
    }

    fn request(bytes: u64, device_id: Option<&str>) -> BudgetRequest<'_> {
        BudgetRequest {
            project_id: "proj-1",
            device_id,
            client_ip: "203.0.113.7",
            bytes,
            endpoint: "presign",
        }
    }

    #[tokio::test]
    async fn test_oversized_payloads_never_touch_counters() {
        let (store, _clock, enforcer) = enforcer();

        for bytes in [100 * KIB + 1, 10 * 1024 * KIB, u64::MAX] {
            let err = enforcer.enforce(&request(bytes, Some("dev"))).await.unwrap_err();
            assert!(matches!(err, QuotaError::PayloadTooLarge { .. }));
            assert_eq!(err.retry_after_secs(), None);
        }
        let err = enforcer.enforce(&request(0, None)).await.unwrap_err();
        assert!(matches!(err, QuotaError::InvalidSize(_)));

        assert_eq!(store.call_count(), 0);
    }

    #[tokio::test]
    async fn test_charges_every_scope_by_bytes() {
        let (store, clock, enforcer) = enforcer();
        enforcer
            .enforce(&request(40 * KIB, Some("dev-9")))
            .await
            .unwrap();

        let minute = Window::Minute.bucket(clock.now());
        let day = Window::Day.bucket(clock.now());
        for key in [
            format!("budget:project:minute:proj-1:{minute}"),
            format!("budget:project:day:proj-1:{day}"),
            format!("budget:ip:minute:203.0.113.7:{minute}"),
            format!("budget:ip:day:203.0.113.7:{day}"),
            format!("budget:device:minute:dev-9:{minute}"),
            format!("budget:device:day:dev-9:{day}"),
        ] {
            assert_eq!(store.counter_value(&key), Some(40 * KIB as i64), "{key}");
        }
    }

    #[tokio::test]
    async fn test_device_scopes_only_apply_with_a_device() {
        let (store, _clock, enforcer) = enforcer();
        enforcer.enforce(&request(KIB, None)).await.unwrap();
        assert!(store.keys_with_prefix("budget:device:").is_empty());
        assert_eq!(store.keys_with_prefix("budget:project:").len(), 2);
    }

    #[tokio::test]
    async fn test_reports_first_violation_and_longest_retry() {
        let (_store, _clock, enforcer) = enforcer();

        // The second 80 KiB upload takes the device minute window to 160 KiB (limit 150).
        enforcer.enforce(&request(80 * KIB, Some("d"))).await.unwrap();
        let err = enforcer
            .enforce(&request(80 * KIB, Some("d")))
            .await
            .unwrap_err();
        match err {
            QuotaError::BudgetExceeded {
                scope,
                retry_after_secs,
            } => {
                assert_eq!(scope, "device:minute");
                assert_eq!(retry_after_secs, 45);
            }
            other => panic!("unexpected error {other:?}"),
        }

        // Rejected requests are still counted. Another 100 KiB overflows project:minute
        // and device:minute; project comes first.
        let err = enforcer
            .enforce(&request(100 * KIB, Some("d")))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            QuotaError::BudgetExceeded { ref scope, .. } if scope == "project:minute"
        ));
    }

    #[tokio::test]
    async fn test_retry_after_covers_the_day_window_when_violated() {
        let (_store, clock, enforcer) = enforcer();
        // One upload per minute stays under every minute budget and fills device:day.
        for _ in 0..5 {
            enforcer
                .enforce(&request(100 * KIB, Some("heavy")))
                .await
                .unwrap();
            clock.advance(chrono::Duration::minutes(1));
        }
        let err = enforcer
            .enforce(&request(100 * KIB, Some("heavy")))
            .await
            .unwrap_err();
        match err {
            QuotaError::BudgetExceeded {
                scope,
                retry_after_secs,
            } => {
                assert_eq!(scope, "device:day");
                let expected = Window::Day.seconds_until_reset(clock.now());
                assert_eq!(retry_after_secs, expected);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fails_closed_when_store_is_down() {
        let (store, _clock, enforcer) = enforcer();
        store.set_unavailable(true);
        let err = enforcer.enforce(&request(KIB, None)).await.unwrap_err();
        assert!(matches!(err, QuotaError::BudgetUnavailable(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_fails_closed_on_timeout() {
        let (store, _clock, enforcer) = enforcer();
        store.set_latency(Some(Duration::from_millis(300)));
        let err = enforcer.enforce(&request(KIB, None)).await.unwrap_err();
        assert!(matches!(
            err,
            QuotaError::BudgetUnavailable(counters::StoreError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_mapped_ipv6_shares_the_ipv4_budget() {
        let (store, clock, enforcer) = enforcer();
        let mut req = request(KIB, None);
        req.client_ip = "::ffff:203.0.113.7";
        enforcer.enforce(&req).await.unwrap();
        enforcer.enforce(&request(KIB, None)).await.unwrap();

        let key = format!(
            "budget:ip:minute:203.0.113.7:{}",
            Window::Minute.bucket(clock.now())
        );
        assert_eq!(store.counter_value(&key), Some(2 * KIB as i64));
    }

    #[tokio::test]
    async fn test_device_fanout_is_advisory() {
        let (store, clock, enforcer) = enforcer();
        for device in ["a", "b", "c", "d"] {
            enforcer.enforce(&request(KIB, Some(device))).await.unwrap();
        }
        let key = format!(
            "budget:ip_devices:203.0.113.7:{}",
            Window::Day.bucket(clock.now())
        );
        assert_eq!(store.set_card(&key).await.unwrap(), 4);
    }

    #[test]
    fn test_ip_normalization() {
        assert_eq!(normalize_ip("::ffff:10.1.2.3"), "10.1.2.3");
        assert_eq!(normalize_ip(" 10.1.2.3 "), "10.1.2.3");
        assert_eq!(normalize_ip("2001:DB8::1"), "2001:db8::1");
        assert_eq!(normalize_ip(""), "unknown");
        assert_eq!(normalize_ip("Proxy-Host"), "proxy-host");
    }
}
