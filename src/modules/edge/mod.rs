pub mod commands;
pub mod dedup;
pub mod journal;
pub mod outbox;
pub mod supervisor;

use backoff::backoff::Backoff;
use rumqttc::{Event, Outgoing, Packet};
use std::time::Duration;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};

use super::mqtt::mqtt_client::{build_options, MqttClient};
use super::mqtt::topic::Location;
use crate::shared::config::EdgeConfigs;
use crate::shared::errors::ConfigError;
use crate::shared::retry::{build_exponential_backoff, next_delay};
use crate::shared::signals::wait_for_shutdown_signal;
use supervisor::{last_will, EdgeSession};

/// The outbox keeps one publish in flight, so the request channel only ever holds
/// that, the command subscription and the final offline status.
const REQUEST_CAPACITY: usize = 16;

/// Runs the edge agent until SIGINT/SIGTERM, then announces offline and
/// disconnects within `shutdown_timeout_ms`.
pub async fn run_edge(configs: EdgeConfigs) -> Result<(), ConfigError> {
    let edge = &configs.edge;
    let location = Location {
        tenant: edge.tenant.clone(),
        building: edge.building.clone(),
        gateway: edge.gateway.clone(),
    };

    let client_id = configs
        .mqtt
        .client_id
        .clone()
        .unwrap_or_else(|| format!("rentio-edge-{}", location.gateway));
    let options = build_options(&configs.mqtt, &client_id, Some(last_will(&location)?))?;

    let (client, mut eventloop) = MqttClient::new(
        options,
        REQUEST_CAPACITY,
        Duration::from_millis(configs.mqtt.publish_timeout_ms),
    );
    let mut session = EdgeSession::open(edge, client.clone()).await;
    log::info!(
        "Edge agent for {} connecting to {}:{}",
        session.base(),
        configs.mqtt.broker,
        configs.mqtt.port
    );

    let heartbeat_period = Duration::from_secs(edge.heartbeat_secs.max(1));
    let mut heartbeat = interval_at(Instant::now() + heartbeat_period, heartbeat_period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut flush_tick = interval(Duration::from_millis(edge.flush_interval_ms.max(10)));
    flush_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let reconnect = configs.mqtt.reconnect;
    let mut reconnect_backoff = build_exponential_backoff(&reconnect);

    let shutdown = wait_for_shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            signal = &mut shutdown => {
                if let Err(e) = signal {
                    log::error!("Signal handler failed: {}", e);
                }
                break;
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    reconnect_backoff.reset();
                    client.set_connected(true);
                    session.on_connected().await;
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    session.on_message(&publish.topic, &publish.payload).await;
                }
                Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                    session.on_publish_written(pkid).await;
                }
                Ok(Event::Incoming(Packet::PubAck(ack))) => {
                    session.on_publish_acked(ack.pkid).await;
                }
                Ok(Event::Incoming(Packet::PubComp(comp))) => {
                    session.on_publish_acked(comp.pkid).await;
                }
                Ok(_) => {}
                Err(e) => {
                    client.set_connected(false);
                    let delay = next_delay(&mut reconnect_backoff, &reconnect);
                    log::error!("Mqtt event loop error: {}; reconnecting in {:?}", e, delay);

                    let stop = tokio::select! {
                        _ = &mut shutdown => true,
                        _ = tokio::time::sleep(delay) => false,
                    };
                    if stop {
                        break;
                    }
                }
            },
            _ = heartbeat.tick() => session.on_heartbeat().await,
            now = flush_tick.tick() => session.on_flush_tick(now).await,
        }
    }

    log::info!("Shutting down edge agent");
    let deadline = Duration::from_millis(edge.shutdown_timeout_ms);
    let graceful = async {
        if let Err(e) = session.shutdown().await {
            log::warn!("Could not announce offline: {}", e);
        }
        if let Err(e) = client.disconnect().await {
            log::warn!("Disconnect request failed: {}", e);
            return;
        }
        // Keep polling until the disconnect is on the wire.
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    };

    if tokio::time::timeout(deadline, graceful).await.is_err() {
        log::warn!("Shutdown did not finish within {:?}", deadline);
    }
    if !session.outbox().is_empty() {
        log::info!(
            "{} messages remain queued in {}",
            session.outbox().len(),
            session.outbox().path().display()
        );
    }
    Ok(())
}
