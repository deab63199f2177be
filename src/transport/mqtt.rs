//! MQTT telemetry sink.
//!
//! Enabled only when the configured broker URI starts with `mqtt://`.
//! Publishes the control history on every sampled read tick and engine
//! log lines, both as JSON, under
//! `esp-brew-engine/<hostname>/history` and `.../log`.

use log::{info, warn};

use crate::clock::to_iso8601;

/// Build the history payload published each control cycle.
pub fn history_payload(epoch: i64, temp: f32, target: f32, output: u8) -> String {
    serde_json::json!({
        "time": to_iso8601(epoch),
        "temp": temp,
        "target": target,
        "output": output,
    })
    .to_string()
}

/// Build a log payload for engine events.
pub fn log_payload(epoch: i64, level: &str, message: &str) -> String {
    serde_json::json!({
        "time": to_iso8601(epoch),
        "level": level,
        "message": message,
    })
    .to_string()
}

pub struct MqttSink {
    topic_history: String,
    topic_log: String,
    #[cfg(target_os = "espidf")]
    client: esp_idf_svc::mqtt::client::EspMqttClient<'static>,
    /// Host backend: retained for assertions.
    #[cfg(not(target_os = "espidf"))]
    published: Vec<(String, String)>,
}

impl MqttSink {
    /// Connect when the URI selects MQTT; anything else disables the sink.
    pub fn connect(uri: &str, hostname: &str) -> Option<Self> {
        if !uri.starts_with("mqtt://") {
            return None;
        }
        let topic_history = format!("esp-brew-engine/{hostname}/history");
        let topic_log = format!("esp-brew-engine/{hostname}/log");

        #[cfg(target_os = "espidf")]
        {
            use esp_idf_svc::mqtt::client::{EspMqttClient, MqttClientConfiguration, MqttProtocolVersion};

            let conf = MqttClientConfiguration {
                protocol_version: Some(MqttProtocolVersion::V5),
                disable_clean_session: false,
                ..Default::default()
            };
            match EspMqttClient::new_cb(uri, &conf, |_| {}) {
                Ok(client) => {
                    info!("mqtt connected to {uri}");
                    Some(Self {
                        topic_history,
                        topic_log,
                        client,
                    })
                }
                Err(e) => {
                    warn!("mqtt client creation failed ({e})");
                    None
                }
            }
        }

        #[cfg(not(target_os = "espidf"))]
        {
            info!("mqtt sink (sim) for {uri}");
            Some(Self {
                topic_history,
                topic_log,
                published: Vec::new(),
            })
        }
    }

    pub fn publish_history(&mut self, epoch: i64, temp: f32, target: f32, output: u8) {
        let payload = history_payload(epoch, temp, target, output);
        let topic = self.topic_history.clone();
        self.publish(&topic, &payload);
    }

    pub fn publish_log(&mut self, epoch: i64, level: &str, message: &str) {
        let payload = log_payload(epoch, level, message);
        let topic = self.topic_log.clone();
        self.publish(&topic, &payload);
    }

    fn publish(&mut self, topic: &str, payload: &str) {
        #[cfg(target_os = "espidf")]
        {
            use esp_idf_svc::mqtt::client::QoS;
            if let Err(e) = self
                .client
                .enqueue(topic, QoS::AtLeastOnce, true, payload.as_bytes())
            {
                warn!("mqtt publish to {topic} failed ({e})");
            }
        }

        #[cfg(not(target_os = "espidf"))]
        self.published.push((topic.to_string(), payload.to_string()));
    }

    /// Host-only: messages published so far.
    #[cfg(not(target_os = "espidf"))]
    pub fn published(&self) -> &[(String, String)] {
        &self.published
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_requires_mqtt_uri() {
        assert!(MqttSink::connect("", "brew").is_none());
        assert!(MqttSink::connect("http://broker", "brew").is_none());
        assert!(MqttSink::connect("mqtt://broker.local:1883", "brew").is_some());
    }

    #[test]
    fn history_payload_shape() {
        let v: serde_json::Value =
            serde_json::from_str(&history_payload(1_472_545_131, 63.5, 64.0, 42)).unwrap();
        assert_eq!(v["time"], "2016-08-30T08:18:51");
        assert_eq!(v["temp"], 63.5);
        assert_eq!(v["target"], 64.0);
        assert_eq!(v["output"], 42);
    }

    #[cfg(not(target_os = "espidf"))]
    #[test]
    fn topics_follow_hostname() {
        let mut sink = MqttSink::connect("mqtt://broker", "kettle").unwrap();
        sink.publish_history(0, 20.0, 20.0, 0);
        sink.publish_log(0, "Info", "run started");
        let published = sink.published();
        assert_eq!(published[0].0, "esp-brew-engine/kettle/history");
        assert_eq!(published[1].0, "esp-brew-engine/kettle/log");
        let log: serde_json::Value = serde_json::from_str(&published[1].1).unwrap();
        assert_eq!(log["level"], "Info");
        assert_eq!(log["message"], "run started");
    }
}
