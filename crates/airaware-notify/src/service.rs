//! Notification orchestration: bounded queue, worker pool, severity
//! routing, retry with jittered backoff, idempotency and cooldown ledgers.

use dashmap::DashMap;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use airaware_core::config::{Config, NotifyConfig};
use airaware_core::stats::RuntimeStats;
use airaware_core::types::Severity;
use airaware_core::{Error, Result};
use airaware_store::{PushOutcome, Repository};

use crate::email::EmailNotifier;
use crate::push::PushNotifier;
use crate::rate_limiter::RateLimiterRegistry;
use crate::sms::SmsNotifier;
use crate::types::{channels_for, AlertEvent, DispatchError, NotifyChannel};
use crate::webhook::ChatNotifier;

/// Producer side of the notification queue. The channel is bounded;
/// `enqueue` blocks when the notifier is saturated, which is the
/// backpressure contract with the ingestion pipeline.
#[derive(Clone)]
pub struct NotifierHandle {
    tx: mpsc::Sender<AlertEvent>,
}

impl NotifierHandle {
    pub async fn enqueue(&self, event: AlertEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| Error::Fatal("notifier queue closed".into()))
    }
}

/// Enabled outbound channels
#[derive(Default)]
pub struct ChannelSet {
    pub email: Option<EmailNotifier>,
    pub sms: Option<SmsNotifier>,
    pub chat: Option<ChatNotifier>,
    pub push: Option<PushNotifier>,
}

/// Recipients configured statically (env csv), merged with opted-in users
/// from the repository at dispatch time.
#[derive(Default, Clone)]
pub struct StaticRecipients {
    pub email: Vec<String>,
    pub sms: Vec<String>,
}

enum Admission {
    Send,
    AlreadyDelivered,
    Cooldown,
}

struct RecipientState {
    last_sent: Instant,
    danger_bypass_used: bool,
}

/// Process-local delivery bookkeeping. Keys are (alert, channel,
/// recipient) for idempotency and (alert, recipient) for the cooldown.
struct Ledger {
    delivered: DashMap<(Uuid, NotifyChannel, String), Instant>,
    recipients: DashMap<(Uuid, String), RecipientState>,
    idempotency_window: Duration,
    cooldown: Duration,
}

impl Ledger {
    fn new(idempotency_window: Duration, cooldown: Duration) -> Self {
        Self {
            delivered: DashMap::new(),
            recipients: DashMap::new(),
            idempotency_window,
            cooldown,
        }
    }

    fn admit(
        &self,
        alert_id: Uuid,
        channel: NotifyChannel,
        recipient: &str,
        severity: Severity,
    ) -> Admission {
        let key = (alert_id, channel, recipient.to_string());
        if let Some(at) = self.delivered.get(&key) {
            if at.elapsed() < self.idempotency_window {
                return Admission::AlreadyDelivered;
            }
        }

        if let Some(mut state) = self.recipients.get_mut(&(alert_id, recipient.to_string())) {
            if state.last_sent.elapsed() < self.cooldown {
                if severity == Severity::Danger && !state.danger_bypass_used {
                    state.danger_bypass_used = true;
                    return Admission::Send;
                }
                return Admission::Cooldown;
            }
        }
        Admission::Send
    }

    fn record_delivered(&self, alert_id: Uuid, channel: NotifyChannel, recipient: &str) {
        let now = Instant::now();
        self.delivered
            .insert((alert_id, channel, recipient.to_string()), now);
        self.recipients
            .entry((alert_id, recipient.to_string()))
            .and_modify(|s| s.last_sent = now)
            .or_insert(RecipientState {
                last_sent: now,
                danger_bypass_used: false,
            });
        self.maybe_prune();
    }

    fn maybe_prune(&self) {
        if self.delivered.len() > 10_000 {
            let window = self.idempotency_window;
            self.delivered.retain(|_, at| at.elapsed() < window);
            self.recipients.retain(|_, s| s.last_sent.elapsed() < window);
        }
    }
}

enum AttemptOutcome {
    Delivered { attempts: u32 },
    Gone(String),
    Failed { attempts: u32, error: String },
}

/// Delay before retrying `attempt` (0-based): 2 s, then 4 s, scaled by a
/// ±20 % jitter factor.
fn retry_delay(attempt: u32, jitter: f64) -> Duration {
    let base = 2f64.powi(attempt as i32 + 1);
    Duration::from_secs_f64(base * (1.0 + jitter))
}

fn jitter_factor() -> f64 {
    rand::thread_rng().gen_range(-0.2..=0.2)
}

/// Multi-channel alert dispatcher. Owned by its worker tasks; the rest of
/// the process talks to it through [`NotifierHandle`].
pub struct Notifier {
    channels: ChannelSet,
    static_recipients: StaticRecipients,
    repo: Arc<dyn Repository>,
    limits: RateLimiterRegistry,
    ledger: Ledger,
    stats: Arc<RuntimeStats>,
    max_attempts: u32,
    attempt_timeout: Duration,
}

impl Notifier {
    /// Wire every channel the configuration enables.
    pub fn from_config(
        config: &Config,
        repo: Arc<dyn Repository>,
        stats: Arc<RuntimeStats>,
    ) -> Result<Self> {
        let mut channels = ChannelSet::default();
        if config.email.enabled {
            channels.email = Some(EmailNotifier::new(
                &config.email,
                config.dashboard_url.clone(),
            )?);
        }
        if config.sms.enabled {
            channels.sms = Some(SmsNotifier::new(&config.sms)?);
        }
        if config.chat.enabled() {
            channels.chat = Some(ChatNotifier::new(&config.chat, config.dashboard_url.clone())?);
        }
        if config.push.enabled {
            channels.push = Some(PushNotifier::new(&config.push)?);
        }

        let static_recipients = StaticRecipients {
            email: config.email.recipients.clone(),
            sms: config.sms.recipients.clone(),
        };

        Ok(Self::with_channels(
            channels,
            static_recipients,
            &config.notify,
            repo,
            stats,
        ))
    }

    pub fn with_channels(
        channels: ChannelSet,
        static_recipients: StaticRecipients,
        tuning: &NotifyConfig,
        repo: Arc<dyn Repository>,
        stats: Arc<RuntimeStats>,
    ) -> Self {
        Self {
            channels,
            static_recipients,
            repo,
            limits: RateLimiterRegistry::new(),
            ledger: Ledger::new(
                Duration::from_secs(tuning.idempotency_window_secs),
                Duration::from_secs(tuning.recipient_cooldown_secs),
            ),
            stats,
            max_attempts: tuning.max_attempts.max(1),
            attempt_timeout: Duration::from_secs(tuning.attempt_timeout_secs),
        }
    }

    /// Start the worker pool on a bounded queue. Workers exit when every
    /// handle is dropped and the queue drains.
    pub fn spawn(
        self,
        queue_capacity: usize,
        workers: usize,
    ) -> (NotifierHandle, Vec<JoinHandle<()>>) {
        let (tx, rx) = mpsc::channel(queue_capacity);
        let rx = Arc::new(Mutex::new(rx));
        let this = Arc::new(self);

        let handles = (0..workers.max(1))
            .map(|worker| {
                let this = this.clone();
                let rx = rx.clone();
                tokio::spawn(async move {
                    loop {
                        let event = { rx.lock().await.recv().await };
                        match event {
                            Some(event) => this.process(event).await,
                            None => break,
                        }
                    }
                    debug!(worker, "notify worker drained");
                })
            })
            .collect();

        (NotifierHandle { tx }, handles)
    }

    /// Fan one alert out to every channel its severity routes to.
    pub async fn process(&self, event: AlertEvent) {
        let route = channels_for(event.severity);
        if route.is_empty() {
            info!(
                alert_id = %event.alert_id,
                severity = event.severity.as_str(),
                "info alert, log only"
            );
            return;
        }

        tokio::join!(
            async {
                if route.contains(&NotifyChannel::Chat) {
                    self.dispatch_chat(&event).await;
                }
            },
            async {
                if route.contains(&NotifyChannel::Email) {
                    self.dispatch_email(&event).await;
                }
            },
            async {
                if route.contains(&NotifyChannel::Sms) {
                    self.dispatch_sms(&event).await;
                }
            },
            async {
                if route.contains(&NotifyChannel::Push) {
                    self.dispatch_push(&event).await;
                }
            },
        );
    }

    async fn dispatch_chat(&self, event: &AlertEvent) {
        let Some(chat) = &self.channels.chat else {
            return;
        };
        for target in chat.targets() {
            if !self.admitted(event, NotifyChannel::Chat, target) {
                continue;
            }
            self.limits.acquire(NotifyChannel::Chat).await;
            let outcome = self
                .attempt_loop(NotifyChannel::Chat, || chat.send(event, target))
                .await;
            self.settle(event, NotifyChannel::Chat, target, &outcome);
        }
    }

    async fn dispatch_email(&self, event: &AlertEvent) {
        let Some(email) = &self.channels.email else {
            return;
        };

        let mut recipients = self.static_recipients.email.clone();
        match self.repo.list_notification_recipients().await {
            Ok(users) => {
                recipients.extend(users.into_iter().filter(|u| u.notify_email).map(|u| u.email));
            }
            Err(e) => warn!(error = %e, "operator lookup failed, using static recipients"),
        }
        recipients.dedup();
        recipients.retain(|addr| self.admitted(event, NotifyChannel::Email, addr));
        if recipients.is_empty() {
            return;
        }

        self.limits.acquire(NotifyChannel::Email).await;
        let outcome = self
            .attempt_loop(NotifyChannel::Email, || email.send(event, &recipients))
            .await;
        for addr in &recipients {
            self.settle(event, NotifyChannel::Email, addr, &outcome);
        }
    }

    async fn dispatch_sms(&self, event: &AlertEvent) {
        let Some(sms) = &self.channels.sms else {
            return;
        };

        let mut numbers = self.static_recipients.sms.clone();
        match self.repo.list_notification_recipients().await {
            Ok(users) => {
                numbers.extend(
                    users
                        .into_iter()
                        .filter(|u| u.notify_sms)
                        .filter_map(|u| u.phone),
                );
            }
            Err(e) => warn!(error = %e, "operator lookup failed, using static recipients"),
        }
        numbers.dedup();

        for number in numbers {
            if !self.admitted(event, NotifyChannel::Sms, &number) {
                continue;
            }
            self.limits.acquire(NotifyChannel::Sms).await;
            let outcome = self
                .attempt_loop(NotifyChannel::Sms, || sms.send(event, &number))
                .await;
            self.settle(event, NotifyChannel::Sms, &number, &outcome);
        }
    }

    async fn dispatch_push(&self, event: &AlertEvent) {
        let Some(push) = &self.channels.push else {
            return;
        };
        let subscriptions = match self.repo.list_active_push_subscriptions().await {
            Ok(subs) => subs,
            Err(e) => {
                warn!(error = %e, "push subscription lookup failed");
                return;
            }
        };

        for subscription in subscriptions {
            // DANGER force-pushes to every active subscription; lower
            // severities only to subscriptions tied to a user account.
            if event.severity < Severity::Danger && subscription.user_id.is_none() {
                continue;
            }
            let endpoint = subscription.endpoint.clone();
            if !self.admitted(event, NotifyChannel::Push, &endpoint) {
                continue;
            }
            self.limits.acquire(NotifyChannel::Push).await;
            let outcome = self
                .attempt_loop(NotifyChannel::Push, || push.send(event, &subscription))
                .await;

            let push_outcome = match &outcome {
                AttemptOutcome::Delivered { .. } => PushOutcome::Delivered,
                AttemptOutcome::Gone(_) => PushOutcome::Gone,
                AttemptOutcome::Failed { .. } => PushOutcome::Failed,
            };
            if let Err(e) = self.repo.record_push_attempt(&endpoint, push_outcome).await {
                warn!(endpoint = %endpoint, error = %e, "push attempt accounting failed");
            }
            self.settle(event, NotifyChannel::Push, &endpoint, &outcome);
        }
    }

    fn admitted(&self, event: &AlertEvent, channel: NotifyChannel, recipient: &str) -> bool {
        match self
            .ledger
            .admit(event.alert_id, channel, recipient, event.severity)
        {
            Admission::Send => true,
            Admission::AlreadyDelivered => {
                debug!(
                    alert_id = %event.alert_id,
                    channel = channel.as_str(),
                    recipient,
                    "suppressed: already delivered within idempotency window"
                );
                false
            }
            Admission::Cooldown => {
                debug!(
                    alert_id = %event.alert_id,
                    channel = channel.as_str(),
                    recipient,
                    "suppressed: recipient cooldown"
                );
                false
            }
        }
    }

    async fn attempt_loop<F, Fut>(&self, channel: NotifyChannel, mut op: F) -> AttemptOutcome
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<(), DispatchError>>,
    {
        let mut last_error = String::new();
        for attempt in 0..self.max_attempts {
            match tokio::time::timeout(self.attempt_timeout, op()).await {
                Ok(Ok(())) => {
                    return AttemptOutcome::Delivered {
                        attempts: attempt + 1,
                    }
                }
                Ok(Err(DispatchError::Gone(e))) => return AttemptOutcome::Gone(e),
                Ok(Err(DispatchError::Permanent(e))) => {
                    return AttemptOutcome::Failed {
                        attempts: attempt + 1,
                        error: e,
                    }
                }
                Ok(Err(DispatchError::Transient(e))) => last_error = e,
                Err(_) => last_error = "attempt deadline exceeded".to_string(),
            }
            if attempt + 1 < self.max_attempts {
                metrics::counter!("airaware_notify_retries_total", "channel" => channel.as_str())
                    .increment(1);
                tokio::time::sleep(retry_delay(attempt, jitter_factor())).await;
            }
        }
        AttemptOutcome::Failed {
            attempts: self.max_attempts,
            error: last_error,
        }
    }

    fn settle(
        &self,
        event: &AlertEvent,
        channel: NotifyChannel,
        recipient: &str,
        outcome: &AttemptOutcome,
    ) {
        match outcome {
            AttemptOutcome::Delivered { attempts } => {
                self.ledger.record_delivered(event.alert_id, channel, recipient);
                self.stats.record_delivery(true);
                metrics::counter!("airaware_notify_delivered_total", "channel" => channel.as_str())
                    .increment(1);
                info!(
                    alert_id = %event.alert_id,
                    channel = channel.as_str(),
                    recipient,
                    attempts,
                    "notification delivered"
                );
            }
            AttemptOutcome::Gone(error) => {
                self.stats.record_delivery(false);
                metrics::counter!("airaware_notify_failed_total", "channel" => channel.as_str())
                    .increment(1);
                warn!(
                    alert_id = %event.alert_id,
                    channel = channel.as_str(),
                    recipient,
                    error,
                    "recipient endpoint gone"
                );
            }
            AttemptOutcome::Failed { attempts, error } => {
                self.stats.record_delivery(false);
                metrics::counter!("airaware_notify_failed_total", "channel" => channel.as_str())
                    .increment(1);
                warn!(
                    alert_id = %event.alert_id,
                    channel = channel.as_str(),
                    recipient,
                    attempts,
                    error,
                    "notification failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_doubles_per_attempt() {
        assert_eq!(retry_delay(0, 0.0), Duration::from_secs(2));
        assert_eq!(retry_delay(1, 0.0), Duration::from_secs(4));
    }

    #[test]
    fn retry_delay_jitter_stays_within_20_percent() {
        let lo = retry_delay(0, -0.2);
        let hi = retry_delay(0, 0.2);
        assert!(lo >= Duration::from_millis(1599) && lo <= Duration::from_millis(1601));
        assert!(hi >= Duration::from_millis(2399) && hi <= Duration::from_millis(2401));
        for _ in 0..100 {
            let d = retry_delay(0, jitter_factor());
            assert!(d >= lo && d <= hi);
        }
    }

    #[test]
    fn ledger_suppresses_within_idempotency_window() {
        let ledger = Ledger::new(Duration::from_secs(60), Duration::from_secs(0));
        let alert = Uuid::new_v4();
        assert!(matches!(
            ledger.admit(alert, NotifyChannel::Chat, "slack", Severity::Warning),
            Admission::Send
        ));
        ledger.record_delivered(alert, NotifyChannel::Chat, "slack");
        assert!(matches!(
            ledger.admit(alert, NotifyChannel::Chat, "slack", Severity::Warning),
            Admission::AlreadyDelivered
        ));
        // A different channel for the same recipient id is independent.
        assert!(matches!(
            ledger.admit(alert, NotifyChannel::Email, "slack", Severity::Warning),
            Admission::Send
        ));
    }

    #[test]
    fn ledger_cooldown_blocks_across_severity_upgrades() {
        // Zero idempotency window isolates the cooldown path.
        let ledger = Ledger::new(Duration::from_secs(0), Duration::from_secs(300));
        let alert = Uuid::new_v4();
        ledger.record_delivered(alert, NotifyChannel::Email, "ops@example.com");
        assert!(matches!(
            ledger.admit(alert, NotifyChannel::Email, "ops@example.com", Severity::Critical),
            Admission::Cooldown
        ));
    }

    #[test]
    fn danger_bypasses_cooldown_exactly_once() {
        let ledger = Ledger::new(Duration::from_secs(0), Duration::from_secs(300));
        let alert = Uuid::new_v4();
        ledger.record_delivered(alert, NotifyChannel::Push, "ep");
        assert!(matches!(
            ledger.admit(alert, NotifyChannel::Push, "ep", Severity::Danger),
            Admission::Send
        ));
        assert!(matches!(
            ledger.admit(alert, NotifyChannel::Push, "ep", Severity::Danger),
            Admission::Cooldown
        ));
    }

    #[test]
    fn cooldown_expires() {
        let ledger = Ledger::new(Duration::from_secs(0), Duration::from_millis(1));
        let alert = Uuid::new_v4();
        ledger.record_delivered(alert, NotifyChannel::Email, "ops@example.com");
        std::thread::sleep(Duration::from_millis(5));
        assert!(matches!(
            ledger.admit(alert, NotifyChannel::Email, "ops@example.com", Severity::Warning),
            Admission::Send
        ));
    }
}
