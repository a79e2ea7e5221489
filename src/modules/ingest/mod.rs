pub mod device_state;
pub mod event_log;
pub mod pipeline;
pub mod provisioning;
pub mod registry;

use backoff::backoff::Backoff;
use rumqttc::{Event, EventLoop, Packet, QoS};
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use super::mqtt::mqtt_client::{build_options, MqttClient, Transport};
use super::mqtt::topic::{ingest_filter, INGEST_CHANNELS};
use crate::shared::config::Configs;
use crate::shared::errors::ConfigError;
use crate::shared::retry::{build_exponential_backoff, next_delay, RetryPolicy};
use pipeline::Pipeline;

/// One publish handed from the event loop to the pipeline worker.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Connects to the broker and feeds every ingest channel through `pipeline`
/// until `shutdown` is cancelled.
///
/// Messages are processed one at a time, in arrival order, by a single worker.
pub async fn start_ingestion(
    configs: &Configs,
    pipeline: Arc<Pipeline>,
    shutdown: CancellationToken,
) -> Result<JoinHandle<()>, ConfigError> {
    let client_id = configs
        .mqtt
        .client_id
        .clone()
        .unwrap_or_else(|| format!("rentio-core-{}", uuid::Uuid::new_v4().simple()));
    let options = build_options(&configs.mqtt, &client_id, None)?;
    let (client, eventloop) = MqttClient::new(
        options,
        64,
        Duration::from_millis(configs.mqtt.publish_timeout_ms),
    );
    log::info!(
        "Mqtt ingestion connecting to {}:{} as {}",
        configs.mqtt.broker,
        configs.mqtt.port,
        client_id
    );

    let (tx, rx) = mpsc::channel::<InboundMessage>(configs.ingest.buffer.max(1));
    let worker = tokio::spawn(run_worker(pipeline, rx));
    let reconnect = configs.mqtt.reconnect;

    let task = tokio::spawn(async move {
        poll_loop(client.clone(), eventloop, tx, reconnect, shutdown).await;

        if let Err(e) = client.disconnect().await {
            log::debug!("disconnect after shutdown: {}", e);
        }
        // The sender is gone once poll_loop returns, so the worker drains and exits.
        if let Err(e) = worker.await {
            log::error!("ingestion worker failed: {}", e);
        }
        log::info!("Mqtt ingestion stopped");
    });

    Ok(task)
}

async fn run_worker(pipeline: Arc<Pipeline>, mut rx: mpsc::Receiver<InboundMessage>) {
    while let Some(message) = rx.recv().await {
        pipeline.process(&message.topic, &message.payload).await;
    }
}

async fn poll_loop(
    client: MqttClient,
    mut eventloop: EventLoop,
    tx: mpsc::Sender<InboundMessage>,
    reconnect: RetryPolicy,
    shutdown: CancellationToken,
) {
    let mut backoff = build_exponential_backoff(&reconnect);

    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                log::info!("Connection established with broker.");
                backoff.reset();
                client.set_connected(true);

                for channel in INGEST_CHANNELS {
                    let filter = ingest_filter(channel);
                    match client.subscribe(&filter, QoS::AtLeastOnce).await {
                        Ok(()) => log::info!("Subscribed to {}", filter),
                        Err(e) => log::error!("Failed to subscribe to '{}': {}", filter, e),
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                };
                if !forward(&tx, message).await {
                    log::error!("ingestion worker is gone, stopping event loop");
                    break;
                }
            }
            Ok(_) => {}
            Err(e) => {
                client.set_connected(false);
                let delay = next_delay(&mut backoff, &reconnect);
                log::error!("Mqtt event loop error: {}; retrying in {:?}", e, delay);

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// Hands `message` to the worker. Returns false once the worker has gone away.
///
/// The event loop is not polled while this waits, so a full buffer also delays
/// keep-alive traffic; the warning makes that visible.
async fn forward(tx: &mpsc::Sender<InboundMessage>, message: InboundMessage) -> bool {
    match tx.try_send(message) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Closed(_)) => false,
        Err(mpsc::error::TrySendError::Full(message)) => {
            log::warn!(
                "ingestion buffer full ({} messages), pausing the event loop",
                tx.max_capacity()
            );
            tx.send(message).await.is_ok()
        }
    }
}
