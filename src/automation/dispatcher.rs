//! Scheduler/dispatcher: claims due firings under a lease and sends them.
//!
//! Workers cooperate only through the lease columns in storage. Every status
//! transition is a compare-and-set on `(pending, leased_by = self)`, so a worker
//! whose lease expired mid-send cannot overwrite the row's new owner.
//! Rule and lead state are re-checked at claim time only: a rule deactivated
//! while its firing is already mid-send still sends.
//!
//! A send still running at `send_timeout` is not retried. It keeps the lease
//! and a background task records whatever it eventually returns. If it is still
//! running halfway through the remaining lease it is aborted and rescheduled.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::task::JoinError;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::automation::firing::ScheduledFiring;
use crate::automation::rule::{AutomationRule, Channel};
use crate::automation::template::{RenderContext, render};
use crate::channels::{MessageSender, OutboundMessage};
use crate::config::DispatcherConfig;
use crate::error::{DatabaseError, SendError};
use crate::events::{EventBus, LeadEvent};
use crate::store::Database;

/// Tally of one claim-and-process pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub claimed: usize,
    pub sent: usize,
    pub retried: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Sends that outlived `send_timeout`; their outcome is recorded later under the same lease.
    pub in_flight: usize,
    /// Rows whose lease was taken over before we could record the outcome.
    pub lost_lease: usize,
    /// Rows left leased because a storage call failed; they are retried after the lease expires.
    pub errored: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Sent,
    Retried,
    Failed,
    Cancelled,
    InFlight,
    LostLease,
}

pub struct Dispatcher {
    recorder: Recorder,
    sender: Arc<dyn MessageSender>,
}

/// Writes firing outcomes under this worker's lease.
///
/// Cloned into the task that settles a send which outlived `send_timeout`.
#[derive(Clone)]
struct Recorder {
    store: Arc<dyn Database>,
    bus: Arc<EventBus>,
    config: DispatcherConfig,
    worker_id: Arc<str>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn Database>,
        sender: Arc<dyn MessageSender>,
        bus: Arc<EventBus>,
        config: DispatcherConfig,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            recorder: Recorder {
                store,
                bus,
                config,
                worker_id: Arc::from(worker_id.into()),
            },
            sender,
        }
    }

    /// Claim up to one batch of firings due at `now` and process them concurrently.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<DispatchReport, DatabaseError> {
        let config = &self.recorder.config;
        let lease_until = now + chrono_duration(config.lease_duration);
        let claimed = self
            .recorder
            .store
            .claim_due_firings(&self.recorder.worker_id, now, lease_until, config.batch_size)
            .await?;

        let mut report = DispatchReport {
            claimed: claimed.len(),
            ..Default::default()
        };
        if claimed.is_empty() {
            return Ok(report);
        }

        let results = join_all(claimed.iter().map(|f| self.process(f, now))).await;
        for (firing, result) in claimed.iter().zip(results) {
            match result {
                Ok(Outcome::Sent) => report.sent += 1,
                Ok(Outcome::Retried) => report.retried += 1,
                Ok(Outcome::Failed) => report.failed += 1,
                Ok(Outcome::Cancelled) => report.cancelled += 1,
                Ok(Outcome::InFlight) => report.in_flight += 1,
                Ok(Outcome::LostLease) => report.lost_lease += 1,
                Err(e) => {
                    error!(firing_id = %firing.id, error = %e, "Failed to process firing");
                    report.errored += 1;
                }
            }
        }

        info!(
            worker_id = %self.recorder.worker_id,
            claimed = report.claimed,
            sent = report.sent,
            retried = report.retried,
            failed = report.failed,
            cancelled = report.cancelled,
            in_flight = report.in_flight,
            "Dispatch pass complete"
        );
        Ok(report)
    }

    async fn process(
        &self,
        firing: &ScheduledFiring,
        now: DateTime<Utc>,
    ) -> Result<Outcome, DatabaseError> {
        let store = &self.recorder.store;
        let rule = match store.get_rule(firing.automation_id).await? {
            Some(rule) if rule.is_active => rule,
            Some(_) => return self.recorder.cancel(firing, "automation deactivated", now).await,
            None => return self.recorder.cancel(firing, "automation deleted", now).await,
        };

        let Some(lead) = store.get_lead(firing.tenant_id, firing.lead_id).await? else {
            return self.recorder.cancel(firing, "lead deleted", now).await;
        };
        let tenant = store.get_tenant(firing.tenant_id).await?;

        let destination = match rule.channel {
            Channel::Email => lead.email.clone(),
            Channel::Sms => lead.phone.clone(),
        };
        let Some(destination) = destination else {
            let err = SendError::permanent(
                rule.channel.to_string(),
                format!("lead has no destination for {}", rule.channel),
            );
            return self
                .recorder
                .fail(firing, &rule, firing.attempt_count, &err, now)
                .await;
        };

        let ctx = RenderContext::new(&firing.trigger_snapshot.lead, tenant.as_ref());
        let subject = match rule.channel {
            Channel::Email => Some(
                tenant
                    .as_ref()
                    .and_then(|t| t.business_name.clone())
                    .unwrap_or_else(|| rule.name.clone()),
            ),
            Channel::Sms => None,
        };
        let message = OutboundMessage {
            channel: rule.channel,
            destination,
            subject,
            body: render(&rule.template, &ctx),
            idempotency_key: firing.idempotency_key.clone(),
        };

        // Run the send as its own task so a timeout stops waiting without
        // forgetting a provider call that may still deliver.
        let started = Instant::now();
        let sender = Arc::clone(&self.sender);
        let mut send = tokio::spawn(async move { sender.send(&message).await });

        let send_timeout = self.recorder.config.send_timeout;
        let waited = tokio::time::timeout(send_timeout, &mut send).await;
        match waited {
            Ok(joined) => {
                let result = join_result(joined, rule.channel);
                self.recorder.record(firing, &rule, result, now).await
            }
            Err(_) => {
                warn!(
                    firing_id = %firing.id,
                    channel = %rule.channel,
                    timeout = ?send_timeout,
                    "Send still running, settling in background"
                );
                let grace = self.recorder.config.lease_duration.saturating_sub(send_timeout) / 2;
                let recorder = self.recorder.clone();
                let firing = firing.clone();
                tokio::spawn(async move {
                    let waited = tokio::time::timeout(grace, &mut send).await;
                    let result = match waited {
                        Ok(joined) => join_result(joined, rule.channel),
                        Err(_) => {
                            send.abort();
                            Err(SendError::transient(
                                rule.channel.to_string(),
                                format!("send timed out after {:?}", started.elapsed()),
                            ))
                        }
                    };
                    let settled_at = now + chrono_duration(started.elapsed());
                    if let Err(e) = recorder.record(&firing, &rule, result, settled_at).await {
                        error!(firing_id = %firing.id, error = %e, "Failed to record late send outcome");
                    }
                });
                Ok(Outcome::InFlight)
            }
        }
    }
}

impl Recorder {
    /// Store the result of one send attempt.
    async fn record(
        &self,
        firing: &ScheduledFiring,
        rule: &AutomationRule,
        result: Result<(), SendError>,
        now: DateTime<Utc>,
    ) -> Result<Outcome, DatabaseError> {
        let attempts = firing.attempt_count.saturating_add(1);
        match result {
            Ok(()) => {
                if self
                    .store
                    .mark_firing_sent(firing.id, &self.worker_id, now)
                    .await?
                {
                    info!(
                        firing_id = %firing.id,
                        rule = %rule.name,
                        channel = %rule.channel,
                        "Automation message sent"
                    );
                    Ok(Outcome::Sent)
                } else {
                    Ok(self.lost_lease(firing, "sent"))
                }
            }
            Err(e) if e.is_permanent() => self.fail(firing, rule, attempts, &e, now).await,
            Err(e) if attempts >= self.config.max_attempts => {
                self.fail(firing, rule, attempts, &e, now).await
            }
            Err(e) => {
                let delay = backoff_delay(&self.config, firing.attempt_count);
                let next = now + chrono_duration(delay);
                if self
                    .store
                    .reschedule_firing(firing.id, &self.worker_id, attempts, next, &e.to_string(), now)
                    .await?
                {
                    warn!(
                        firing_id = %firing.id,
                        attempt = attempts,
                        retry_in = ?delay,
                        error = %e,
                        "Send failed, retrying"
                    );
                    Ok(Outcome::Retried)
                } else {
                    Ok(self.lost_lease(firing, "rescheduled"))
                }
            }
        }
    }

    async fn cancel(
        &self,
        firing: &ScheduledFiring,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Outcome, DatabaseError> {
        if self
            .store
            .mark_firing_cancelled(firing.id, &self.worker_id, reason, now)
            .await?
        {
            debug!(firing_id = %firing.id, reason, "Firing cancelled");
            Ok(Outcome::Cancelled)
        } else {
            Ok(self.lost_lease(firing, "cancelled"))
        }
    }

    async fn fail(
        &self,
        firing: &ScheduledFiring,
        rule: &AutomationRule,
        attempt_count: u32,
        err: &SendError,
        now: DateTime<Utc>,
    ) -> Result<Outcome, DatabaseError> {
        let message = err.to_string();
        if !self
            .store
            .mark_firing_failed(firing.id, &self.worker_id, attempt_count, &message, now)
            .await?
        {
            return Ok(self.lost_lease(firing, "failed"));
        }

        error!(
            firing_id = %firing.id,
            rule = %rule.name,
            lead_id = %firing.lead_id,
            attempts = attempt_count,
            error = %message,
            "Automation firing failed"
        );
        self.bus.publish(LeadEvent::FiringFailed {
            tenant_id: firing.tenant_id,
            firing_id: firing.id,
            automation_id: firing.automation_id,
            lead_id: firing.lead_id,
            channel: rule.channel,
            attempt_count,
            error: message,
            occurred_at: now,
        });
        Ok(Outcome::Failed)
    }

    fn lost_lease(&self, firing: &ScheduledFiring, transition: &str) -> Outcome {
        warn!(
            firing_id = %firing.id,
            worker_id = %self.worker_id,
            transition,
            "Lease lost before outcome was recorded"
        );
        Outcome::LostLease
    }
}

/// A panicked or aborted send task counts as a transient failure.
fn join_result(
    joined: Result<Result<(), SendError>, JoinError>,
    channel: Channel,
) -> Result<(), SendError> {
    joined.unwrap_or_else(|e| {
        Err(SendError::transient(
            channel.to_string(),
            format!("send task failed: {e}"),
        ))
    })
}

/// Delay before retry number `previous_attempts + 1`: `base * 2^previous_attempts`, capped.
pub fn backoff_delay(config: &DispatcherConfig, previous_attempts: u32) -> Duration {
    2u32.checked_pow(previous_attempts)
        .and_then(|factor| config.backoff_base.checked_mul(factor))
        .map_or(config.backoff_cap, |delay| delay.min(config.backoff_cap))
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}

/// Spawn a polling loop that dispatches until the task is aborted.
///
/// A full batch is followed immediately by another pass; otherwise the loop
/// sleeps for `poll_interval`.
pub fn spawn_dispatcher(dispatcher: Arc<Dispatcher>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let worker_id = Arc::clone(&dispatcher.recorder.worker_id);
        info!(%worker_id, "Dispatcher started");
        let poll_interval = dispatcher.recorder.config.poll_interval;
        let batch_size = dispatcher.recorder.config.batch_size;

        loop {
            match dispatcher.run_once(Utc::now()).await {
                Ok(report) if report.claimed >= batch_size => continue,
                Ok(_) => {}
                Err(e) => {
                    error!(%worker_id, "Dispatch pass failed: {e}");
                }
            }
            tokio::time::sleep(poll_interval).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use uuid::Uuid;

    use super::*;
    use crate::automation::firing::{FiringStatus, LeadSnapshot, TriggerSnapshot};
    use crate::automation::rule::{RuleDraft, TriggerKind};
    use crate::channels::RecordingSender;
    use crate::leads::model::{CustomFields, Lead, LeadStatus};
    use crate::store::LibSqlBackend;
    use crate::tenants::{Tenant, TenantProfile};

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn secs(n: i64) -> ChronoDuration {
        ChronoDuration::seconds(n)
    }

    struct Fixture {
        store: Arc<dyn Database>,
        sender: Arc<RecordingSender>,
        bus: Arc<EventBus>,
        tenant: Tenant,
        lead: Lead,
    }

    impl Fixture {
        async fn new() -> Self {
            let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
            let tenant = Tenant::new(
                TenantProfile {
                    business_name: Some("Acme Roofing".into()),
                    ..Default::default()
                },
                t0(),
            );
            store.create_tenant(&tenant).await.unwrap();

            let lead = Lead {
                id: Uuid::new_v4(),
                tenant_id: tenant.id,
                dedup_key: "k".into(),
                name: "Jane Doe".into(),
                email: Some("jane@x.com".into()),
                phone: None,
                message: Some("need quote".into()),
                source: "website_build".into(),
                status: LeadStatus::New,
                tag: None,
                assigned_to: None,
                notes: None,
                custom_fields: CustomFields::new(),
                created_at: t0(),
                updated_at: t0(),
            };
            store.insert_lead_with_firings(&lead, &[]).await.unwrap();

            Self {
                store,
                sender: RecordingSender::new(),
                bus: EventBus::new(16),
                tenant,
                lead,
            }
        }

        async fn schedule(&self, channel: Channel, template: &str) -> (AutomationRule, ScheduledFiring) {
            let rule = RuleDraft {
                name: "Initial Reply".into(),
                channel,
                trigger: TriggerKind::LeadReceived,
                template: template.into(),
                delay_minutes: 0,
                is_active: true,
            }
            .into_rule(self.tenant.id, t0())
            .unwrap();
            self.store.create_rule(&rule).await.unwrap();

            let firing = ScheduledFiring::plan(
                &rule,
                self.lead.id,
                TriggerSnapshot {
                    trigger: TriggerKind::LeadReceived,
                    occurred_at: t0(),
                    lead: LeadSnapshot::from(&self.lead),
                },
            );
            self.store.insert_firings(&[firing.clone()]).await.unwrap();
            (rule, firing)
        }

        fn dispatcher(&self, worker_id: &str, config: DispatcherConfig) -> Dispatcher {
            Dispatcher::new(
                self.store.clone(),
                self.sender.clone(),
                self.bus.clone(),
                config,
                worker_id,
            )
        }

        async fn firing(&self, id: Uuid) -> ScheduledFiring {
            self.store.get_firing(id).await.unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn due_firing_is_rendered_and_sent() {
        let fx = Fixture::new().await;
        let (_, firing) = fx
            .schedule(Channel::Email, "Hi {{name}}! Call {{business_phone}}.")
            .await;
        let dispatcher = fx.dispatcher("w1", DispatcherConfig::default());

        let report = dispatcher.run_once(t0()).await.unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.sent, 1);

        let sent = fx.sender.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].destination, "jane@x.com");
        assert_eq!(sent[0].body, "Hi Jane Doe! Call .");
        assert_eq!(sent[0].subject.as_deref(), Some("Acme Roofing"));
        assert_eq!(sent[0].idempotency_key, firing.idempotency_key);

        let stored = fx.firing(firing.id).await;
        assert_eq!(stored.status, FiringStatus::Sent);
        assert_eq!(stored.sent_at, Some(t0()));
    }

    #[tokio::test]
    async fn transient_failures_back_off_exponentially() {
        let fx = Fixture::new().await;
        let (_, firing) = fx.schedule(Channel::Email, "Hi {{name}}").await;
        fx.sender.fail_next([
            SendError::transient("email", "421 try later"),
            SendError::transient("email", "421 try later"),
        ]);
        let dispatcher = fx.dispatcher("w1", DispatcherConfig::default());

        assert_eq!(dispatcher.run_once(t0()).await.unwrap().retried, 1);
        let after_first = fx.firing(firing.id).await;
        assert_eq!(after_first.attempt_count, 1);
        assert_eq!(after_first.fire_at, t0() + secs(30));
        assert_eq!(after_first.status, FiringStatus::Pending);

        assert_eq!(dispatcher.run_once(t0() + secs(29)).await.unwrap().claimed, 0);

        assert_eq!(dispatcher.run_once(t0() + secs(30)).await.unwrap().retried, 1);
        let after_second = fx.firing(firing.id).await;
        assert_eq!(after_second.attempt_count, 2);
        assert_eq!(after_second.fire_at, t0() + secs(30) + secs(60));

        let report = dispatcher.run_once(t0() + secs(90)).await.unwrap();
        assert_eq!(report.sent, 1);
        let done = fx.firing(firing.id).await;
        assert_eq!(done.status, FiringStatus::Sent);
        assert_eq!(done.attempt_count, 2);
        assert_eq!(fx.sender.sent().len(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_mark_failed() {
        let fx = Fixture::new().await;
        let (_, firing) = fx.schedule(Channel::Email, "Hi").await;
        fx.sender.fail_next([
            SendError::transient("email", "down"),
            SendError::transient("email", "down"),
        ]);
        let config = DispatcherConfig {
            max_attempts: 2,
            ..Default::default()
        };
        let dispatcher = fx.dispatcher("w1", config);
        let mut feed = fx.bus.subscribe_tenant(fx.tenant.id);

        dispatcher.run_once(t0()).await.unwrap();
        let report = dispatcher.run_once(t0() + secs(30)).await.unwrap();
        assert_eq!(report.failed, 1);

        let stored = fx.firing(firing.id).await;
        assert_eq!(stored.status, FiringStatus::Failed);
        assert_eq!(stored.attempt_count, 2);
        assert!(stored.last_error.unwrap().contains("down"));

        match feed.recv().await.unwrap() {
            LeadEvent::FiringFailed {
                firing_id,
                attempt_count,
                ..
            } => {
                assert_eq!(firing_id, firing.id);
                assert_eq!(attempt_count, 2);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let fx = Fixture::new().await;
        let (_, firing) = fx.schedule(Channel::Email, "Hi").await;
        fx.sender
            .fail_next([SendError::permanent("email", "550 mailbox unavailable")]);
        let dispatcher = fx.dispatcher("w1", DispatcherConfig::default());

        let report = dispatcher.run_once(t0()).await.unwrap();
        assert_eq!(report.failed, 1);
        let stored = fx.firing(firing.id).await;
        assert_eq!(stored.status, FiringStatus::Failed);
        assert_eq!(stored.attempt_count, 1);

        assert_eq!(dispatcher.run_once(t0() + secs(3600)).await.unwrap().claimed, 0);
        assert_eq!(fx.sender.attempts(), 1);
    }

    #[tokio::test]
    async fn deactivated_rule_cancels_without_sending() {
        let fx = Fixture::new().await;
        let (rule, firing) = fx.schedule(Channel::Email, "Hi").await;
        fx.store
            .set_rule_active(fx.tenant.id, rule.id, false)
            .await
            .unwrap();

        let report = fx
            .dispatcher("w1", DispatcherConfig::default())
            .run_once(t0())
            .await
            .unwrap();
        assert_eq!(report.cancelled, 1);
        assert_eq!(fx.firing(firing.id).await.status, FiringStatus::Cancelled);
        assert_eq!(fx.sender.attempts(), 0);
    }

    #[tokio::test]
    async fn deleted_lead_cancels() {
        let fx = Fixture::new().await;
        let (_, firing) = fx.schedule(Channel::Email, "Hi").await;
        fx.store.delete_lead(fx.tenant.id, fx.lead.id).await.unwrap();

        let report = fx
            .dispatcher("w1", DispatcherConfig::default())
            .run_once(t0())
            .await
            .unwrap();
        assert_eq!(report.cancelled, 1);
        let stored = fx.firing(firing.id).await;
        assert_eq!(stored.status, FiringStatus::Cancelled);
        assert_eq!(stored.last_error.as_deref(), Some("lead deleted"));
    }

    #[tokio::test]
    async fn missing_destination_fails_permanently() {
        let fx = Fixture::new().await;
        let (_, firing) = fx.schedule(Channel::Sms, "Hi {{name}}").await;

        let report = fx
            .dispatcher("w1", DispatcherConfig::default())
            .run_once(t0())
            .await
            .unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(fx.firing(firing.id).await.status, FiringStatus::Failed);
        assert_eq!(fx.sender.attempts(), 0);
    }

    #[tokio::test]
    async fn racing_dispatchers_send_once() {
        let fx = Fixture::new().await;
        let (_, firing) = fx.schedule(Channel::Email, "Hi").await;
        let a = fx.dispatcher("w1", DispatcherConfig::default());
        let b = fx.dispatcher("w2", DispatcherConfig::default());

        let (ra, rb) = tokio::join!(a.run_once(t0()), b.run_once(t0()));
        let (ra, rb) = (ra.unwrap(), rb.unwrap());
        assert_eq!(ra.claimed + rb.claimed, 1);
        assert_eq!(ra.sent + rb.sent, 1);
        assert_eq!(fx.sender.attempts(), 1);
        assert_eq!(fx.firing(firing.id).await.status, FiringStatus::Sent);
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed() {
        let fx = Fixture::new().await;
        let (_, firing) = fx.schedule(Channel::Email, "Hi").await;

        // A worker claims the row and then crashes.
        let claimed = fx
            .store
            .claim_due_firings("crashed", t0(), t0() + secs(60), 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);

        let dispatcher = fx.dispatcher("w2", DispatcherConfig::default());
        assert_eq!(dispatcher.run_once(t0() + secs(30)).await.unwrap().claimed, 0);
        assert_eq!(dispatcher.run_once(t0() + secs(60)).await.unwrap().sent, 1);

        // The crashed worker's late write is rejected.
        assert!(!fx
            .store
            .mark_firing_failed(firing.id, "crashed", 1, "late", t0() + secs(61))
            .await
            .unwrap());
        assert_eq!(fx.firing(firing.id).await.status, FiringStatus::Sent);
    }

    struct StallingSender;

    #[async_trait]
    impl MessageSender for StallingSender {
        async fn send(&self, _message: &OutboundMessage) -> Result<(), SendError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }

    /// Waits until the firing leaves its in-flight state, polling real time.
    async fn settled(fx: &Fixture, id: Uuid, attempt_count: u32) -> ScheduledFiring {
        for _ in 0..100 {
            let firing = fx.firing(id).await;
            if firing.status != FiringStatus::Pending || firing.attempt_count >= attempt_count {
                return firing;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("firing {id} never settled");
    }

    #[tokio::test]
    async fn stalled_send_is_aborted_and_retried() {
        let fx = Fixture::new().await;
        let (_, firing) = fx.schedule(Channel::Email, "Hi").await;
        let config = DispatcherConfig {
            send_timeout: Duration::from_millis(50),
            lease_duration: Duration::from_millis(250),
            ..Default::default()
        };
        let dispatcher = Dispatcher::new(
            fx.store.clone(),
            Arc::new(StallingSender),
            fx.bus.clone(),
            config,
            "w1",
        );

        assert_eq!(dispatcher.run_once(t0()).await.unwrap().in_flight, 1);
        let stored = settled(&fx, firing.id, 1).await;
        assert_eq!(stored.status, FiringStatus::Pending);
        assert_eq!(stored.attempt_count, 1);
        assert!(stored.last_error.unwrap().contains("timed out"));
    }

    /// Blocks its thread like the SMTP transport does, counting deliveries.
    struct SlowBlockingSender {
        delivered: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl MessageSender for SlowBlockingSender {
        async fn send(&self, _message: &OutboundMessage) -> Result<(), SendError> {
            let delivered = Arc::clone(&self.delivered);
            tokio::task::spawn_blocking(move || {
                std::thread::sleep(Duration::from_millis(200));
                delivered.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .map_err(|e| SendError::transient("email", e.to_string()))
        }
    }

    #[tokio::test]
    async fn slow_send_past_timeout_is_delivered_once() {
        let fx = Fixture::new().await;
        let (_, firing) = fx.schedule(Channel::Email, "Hi").await;
        let delivered = Arc::new(AtomicUsize::new(0));
        let config = DispatcherConfig {
            send_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let dispatcher = Dispatcher::new(
            fx.store.clone(),
            Arc::new(SlowBlockingSender {
                delivered: Arc::clone(&delivered),
            }),
            fx.bus.clone(),
            config,
            "w1",
        );

        let first = dispatcher.run_once(t0()).await.unwrap();
        assert_eq!(first.in_flight, 1);
        assert_eq!(first.retried, 0);

        // Past the first backoff step but inside the lease: nothing to claim.
        assert_eq!(dispatcher.run_once(t0() + secs(31)).await.unwrap().claimed, 0);

        let stored = settled(&fx, firing.id, 1).await;
        assert_eq!(stored.status, FiringStatus::Sent);
        assert_eq!(stored.attempt_count, 0);

        assert_eq!(dispatcher.run_once(t0() + secs(120)).await.unwrap().claimed, 0);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = DispatcherConfig {
            backoff_base: Duration::from_secs(30),
            backoff_cap: Duration::from_secs(3600),
            ..Default::default()
        };
        assert_eq!(backoff_delay(&config, 0), Duration::from_secs(30));
        assert_eq!(backoff_delay(&config, 1), Duration::from_secs(60));
        assert_eq!(backoff_delay(&config, 3), Duration::from_secs(240));
        assert_eq!(backoff_delay(&config, 10), Duration::from_secs(3600));
        assert_eq!(backoff_delay(&config, 40), Duration::from_secs(3600));
    }
}
