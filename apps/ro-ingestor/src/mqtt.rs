use crate::config::Config;
use crate::ingest::{Dispatch, TelemetryIngestor};
use anyhow::Result;
use chrono::Utc;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS, Transport};
use tokio_util::sync::CancellationToken;

/// Subscription filters for one topic root: tele fields, state and events.
pub fn topic_filters(root: &str) -> [String; 3] {
    [
        format!("{root}/+/+/tele/#"),
        format!("{root}/+/+/state"),
        format!("{root}/+/+/event"),
    ]
}

fn mqtt_options(config: &Config) -> MqttOptions {
    let mut mqttoptions = MqttOptions::new(
        config.mqtt_client_id.clone(),
        config.mqtt_host.clone(),
        config.mqtt_port,
    );
    mqttoptions.set_keep_alive(config.mqtt_keepalive());
    if let Some(username) = &config.mqtt_username {
        mqttoptions.set_credentials(
            username.clone(),
            config.mqtt_password.clone().unwrap_or_default(),
        );
    }
    if config.mqtt_tls {
        mqttoptions.set_transport(Transport::tls_with_default_config());
    }
    mqttoptions
}

/// Returns `true` when cancelled during the wait.
async fn backoff(config: &Config, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(config.reconnect_backoff()) => false,
    }
}

/// Returns `false` when the disconnect request could not be queued.
async fn disconnect(client: &AsyncClient) -> bool {
    match client.disconnect().await {
        Ok(()) => true,
        Err(err) => {
            tracing::debug!(error = %err, "MQTT disconnect on shutdown failed");
            false
        }
    }
}

/// Runs until `cancel` fires. Connection and subscribe failures reconnect after the backoff,
/// without a retry limit.
pub async fn run_listener(
    config: Config,
    ingestor: TelemetryIngestor,
    cancel: CancellationToken,
) -> Result<()> {
    let filters = topic_filters(ingestor.topic_root());
    let stats = ingestor.stats();

    'connect: loop {
        if cancel.is_cancelled() {
            break;
        }
        let (client, mut eventloop) = AsyncClient::new(mqtt_options(&config), 64);

        for filter in &filters {
            if let Err(err) = client.subscribe(filter.clone(), QoS::AtMostOnce).await {
                tracing::warn!(error = %err, topic = %filter, "failed to subscribe to MQTT; retrying");
                stats.set_mqtt_connected(false);
                if backoff(&config, &cancel).await {
                    break 'connect;
                }
                continue 'connect;
            }
        }

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    disconnect(&client).await;
                    stats.set_mqtt_connected(false);
                    break 'connect;
                }
                event = eventloop.poll() => event,
            };
            match event {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    stats.set_mqtt_connected(true);
                    tracing::info!(
                        host = %config.mqtt_host,
                        port = config.mqtt_port,
                        filters = ?filters,
                        "connected to MQTT broker"
                    );
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    let received_at = Utc::now();
                    let mut payload = publish.payload.to_vec();
                    if let Dispatch::Dropped(reason) =
                        ingestor.handle_message(&publish.topic, &mut payload, received_at).await
                    {
                        tracing::trace!(topic = %publish.topic, ?reason, "MQTT message dropped");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    stats.set_mqtt_connected(false);
                    stats.record_error(format!("mqtt: {err}"));
                    tracing::warn!(error = %err, "MQTT connection dropped; reconnecting");
                    break;
                }
            }
        }

        if backoff(&config, &cancel).await {
            break;
        }
    }

    tracing::info!("MQTT listener stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_cover_every_message_kind() {
        assert_eq!(
            topic_filters("plant"),
            [
                "plant/+/+/tele/#".to_string(),
                "plant/+/+/state".to_string(),
                "plant/+/+/event".to_string(),
            ]
        );
    }

    #[test]
    fn options_carry_broker_and_keepalive() {
        let config = Config {
            mqtt_username: Some("ro".to_string()),
            mqtt_password: None,
            mqtt_keepalive_secs: 45,
            ..Config::default()
        };
        let options = mqtt_options(&config);
        assert_eq!(options.keep_alive(), std::time::Duration::from_secs(45));
        assert_eq!(options.broker_address(), ("localhost".to_string(), 1883));
    }

    #[tokio::test]
    async fn disconnect_reports_a_closed_event_loop() {
        let (client, eventloop) = AsyncClient::new(mqtt_options(&Config::default()), 4);
        drop(eventloop);
        assert!(!disconnect(&client).await);
    }
}
