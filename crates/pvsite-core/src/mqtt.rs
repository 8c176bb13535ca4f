use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::v5 as mqtt5;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::Transport;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::batch::{OutputBatch, Sensor};
use crate::config::MqttConfig;
use crate::sink::{Sink, SinkError};

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

pub fn build_options(config: &MqttConfig) -> mqtt5::MqttOptions {
    let client_id = format!("{}-{}", config.client, Uuid::new_v4());
    let mut opts = mqtt5::MqttOptions::new(client_id, &config.host, config.port);
    opts.set_keep_alive(Duration::from_secs(config.keep_alive_secs.unwrap_or(60)));
    opts.set_clean_start(true);
    if let (Some(u), Some(p)) = (&config.username, &config.password) {
        opts.set_credentials(u.clone(), p.clone());
    }
    if config.port == 8883 {
        opts.set_transport(Transport::tls_with_default_config());
    }
    opts
}

pub fn topic_for(prefix: &str, sensor: &Sensor) -> String {
    format!("{prefix}/{}", sensor.topic)
}

pub fn payload(sensor: &Sensor) -> Result<Vec<u8>, SinkError> {
    Ok(serde_json::to_vec(&sensor.values)?)
}

/// Publishes each sensor of a batch as one QoS 0 message under `{client}/{topic}`.
pub struct MqttSink {
    prefix: String,
    client: mqtt5::AsyncClient,
    eventloop: Mutex<Option<JoinHandle<()>>>,
}

impl MqttSink {
    /// Creates the client and drives its event loop in the background, reconnecting after errors.
    pub fn connect(config: &MqttConfig) -> Self {
        let (client, mut eventloop) = mqtt5::AsyncClient::new(build_options(config), 50);
        let broker = format!("{}:{}", config.host, config.port);

        let handle = tokio::spawn(async move {
            let mut connected = false;
            loop {
                match eventloop.poll().await {
                    Ok(mqtt5::Event::Incoming(mqtt5::Incoming::ConnAck(_))) => {
                        connected = true;
                        info!(broker = %broker, "MQTT connected");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if connected {
                            warn!(broker = %broker, error = %e, "MQTT connection lost");
                        } else {
                            debug!(broker = %broker, error = %e, "MQTT connect failed");
                        }
                        connected = false;
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        });

        Self {
            prefix: config.client.clone(),
            client,
            eventloop: Mutex::new(Some(handle)),
        }
    }
}

#[async_trait]
impl Sink for MqttSink {
    fn name(&self) -> &str {
        "mqtt"
    }

    async fn deliver(&self, batch: &OutputBatch) -> Result<(), SinkError> {
        for sensor in batch.sensors.iter().filter(|s| !s.values.is_empty()) {
            self.client
                .try_publish(topic_for(&self.prefix, sensor), QoS::AtMostOnce, false, payload(sensor)?)
                .map_err(|e| SinkError::Publish(format!("{}: {e}", sensor.topic)))?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        let _ = self.client.try_disconnect();
        if let Some(handle) = self.eventloop.lock().take() {
            handle.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::SensorValue;

    #[test]
    fn payload_is_the_values_map() {
        let sensor = Sensor::new("ac_measurements/power")
            .with("inv1", SensorValue::Number(812.5))
            .with("site", SensorValue::Integer(900));

        let body = payload(&sensor).expect("encodes");

        assert_eq!(
            String::from_utf8(body).expect("utf8"),
            r#"{"inv1":812.5,"site":900}"#
        );
        assert_eq!(topic_for("pvsite", &sensor), "pvsite/ac_measurements/power");
    }
}
