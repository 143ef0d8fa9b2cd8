//! Message-bus subscriber
//!
//! Long-lived MQTT subscription with manual acknowledgements. The broker
//! ack for a message is issued by the pipeline only after persistence and
//! evaluation, so an unacked message survives a crash and is redelivered
//! under the at-least-once contract.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, Publish, QoS};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use airaware_core::config::BusConfig;
use airaware_core::types::BusLinkState;
use airaware_core::{Error, Result};

/// Reconnect schedule: 5 s doubling to a 60 s ceiling.
const BACKOFF_INITIAL: Duration = Duration::from_secs(5);
const BACKOFF_MAX: Duration = Duration::from_secs(60);
/// Attempts per outage window before `BrokerUnavailable` is surfaced.
const MAX_ATTEMPTS_PER_OUTAGE: u32 = 10;

const KEEP_ALIVE: Duration = Duration::from_secs(30);

/// One delivered bus message handed to the pipeline.
pub struct RawMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub token: DeliveryToken,
}

/// Settles the broker acknowledgement. Dropping the token without calling
/// [`DeliveryToken::ack`] leaves the message unacked, so the broker
/// redelivers it.
pub struct DeliveryToken {
    inner: Option<(AsyncClient, Publish)>,
}

impl DeliveryToken {
    /// Token with no broker behind it, for replay and tests.
    pub fn detached() -> Self {
        Self { inner: None }
    }

    pub async fn ack(self) {
        if let Some((client, publish)) = self.inner {
            if let Err(e) = client.ack(&publish).await {
                warn!(error = %e, "broker ack failed; message will be redelivered");
            }
        }
    }
}

fn qos_level(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

fn reconnect_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: BACKOFF_INITIAL,
        randomization_factor: 0.0,
        multiplier: 2.0,
        max_interval: BACKOFF_MAX,
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

/// Single-topic MQTT subscriber feeding the ingestion pipeline.
pub struct BusSubscriber {
    client: AsyncClient,
    eventloop: rumqttc::EventLoop,
    topic: String,
    qos: QoS,
    state_tx: watch::Sender<BusLinkState>,
}

impl BusSubscriber {
    pub fn new(config: &BusConfig) -> Result<(Self, watch::Receiver<BusLinkState>)> {
        let (host, port) = config.broker_addr()?;
        let mut options = MqttOptions::new(config.client_id.clone(), host, port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(false);
        options.set_manual_acks(true);

        let (client, eventloop) = AsyncClient::new(options, 64);
        let (state_tx, state_rx) = watch::channel(BusLinkState::Disconnected);

        Ok((
            Self {
                client,
                eventloop,
                topic: config.topic.clone(),
                qos: qos_level(config.qos),
                state_tx,
            },
            state_rx,
        ))
    }

    /// Drive the connection until cancelled. `ready` fires on the first
    /// subscription acknowledgement; if the initial backoff window is
    /// exhausted before that, the error is returned so the process can
    /// exit with the bus-unreachable code.
    pub async fn run(
        mut self,
        tx: mpsc::Sender<RawMessage>,
        ready: oneshot::Sender<()>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut ready = Some(ready);
        let mut backoff = reconnect_backoff();
        let mut attempts: u32 = 0;
        let mut ever_subscribed = false;

        self.state_tx.send_replace(BusLinkState::Connecting);
        info!(topic = %self.topic, "bus subscriber starting");

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = self.client.disconnect().await;
                    self.state_tx.send_replace(BusLinkState::Stopped);
                    info!("bus subscriber stopped");
                    return Ok(());
                }
                event = self.eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    self.state_tx.send_replace(BusLinkState::Connected);
                    attempts = 0;
                    backoff.reset();
                    info!(topic = %self.topic, "broker connected, subscribing");
                    // Subscription is re-issued on every reconnect; the
                    // broker replays unacked QoS 1 messages afterwards.
                    if let Err(e) = self.client.subscribe(self.topic.clone(), self.qos).await {
                        warn!(error = %e, "subscribe request failed");
                    }
                }
                Ok(Event::Incoming(Packet::SubAck(_))) => {
                    self.state_tx.send_replace(BusLinkState::Subscribed);
                    ever_subscribed = true;
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(());
                    }
                    info!(topic = %self.topic, "subscription acknowledged");
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    metrics::counter!("airaware_bus_messages_total").increment(1);
                    let message = RawMessage {
                        topic: publish.topic.clone(),
                        payload: publish.payload.to_vec(),
                        qos: publish.qos as u8,
                        token: DeliveryToken {
                            inner: Some((self.client.clone(), publish)),
                        },
                    };
                    if tx.send(message).await.is_err() {
                        // Pipeline gone; nothing left to deliver to.
                        self.state_tx.send_replace(BusLinkState::Stopped);
                        return Ok(());
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("broker sent disconnect");
                    self.state_tx.send_replace(BusLinkState::Degraded);
                }
                Ok(_) => {}
                Err(e) => {
                    metrics::counter!("airaware_bus_connection_errors_total").increment(1);
                    let was_subscribed = *self.state_tx.borrow() == BusLinkState::Subscribed;
                    if was_subscribed {
                        // First miss after a healthy subscription: flag
                        // degraded and let the event loop retry at once.
                        self.state_tx.send_replace(BusLinkState::Degraded);
                        warn!(error = %e, "bus connection degraded");
                        continue;
                    }

                    self.state_tx.send_replace(BusLinkState::Disconnected);
                    attempts = attempts.saturating_add(1);
                    if attempts == MAX_ATTEMPTS_PER_OUTAGE {
                        error!(
                            attempts,
                            error = %e,
                            "broker unavailable; retries continue at the backoff ceiling"
                        );
                        if !ever_subscribed {
                            return Err(Error::Transient(format!(
                                "broker unavailable after {attempts} attempts: {e}"
                            )));
                        }
                    }

                    let delay = backoff.next_backoff().unwrap_or(BACKOFF_MAX);
                    debug!(attempt = attempts, delay_secs = delay.as_secs(), error = %e, "reconnect backoff");
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            self.state_tx.send_replace(BusLinkState::Stopped);
                            return Ok(());
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    self.state_tx.send_replace(BusLinkState::Connecting);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_five_to_sixty_seconds() {
        let mut backoff = reconnect_backoff();
        let mut delays = Vec::new();
        for _ in 0..7 {
            delays.push(backoff.next_backoff().unwrap().as_secs());
        }
        assert_eq!(delays, vec![5, 10, 20, 40, 60, 60, 60]);
    }

    #[test]
    fn backoff_resets_after_successful_connect() {
        let mut backoff = reconnect_backoff();
        let _ = backoff.next_backoff();
        let _ = backoff.next_backoff();
        backoff.reset();
        assert_eq!(backoff.next_backoff().unwrap(), Duration::from_secs(5));
    }

    #[test]
    fn qos_levels_map_with_at_least_once_default() {
        assert_eq!(qos_level(0), QoS::AtMostOnce);
        assert_eq!(qos_level(1), QoS::AtLeastOnce);
        assert_eq!(qos_level(2), QoS::ExactlyOnce);
        assert_eq!(qos_level(7), QoS::AtLeastOnce);
    }

    #[tokio::test]
    async fn detached_token_ack_is_a_noop() {
        DeliveryToken::detached().ack().await;
    }
}
