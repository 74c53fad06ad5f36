//! Pure construction of rumqttc connection options

use crate::config::{MqttProtocol, MqttSection};
use rumqttc::v5::MqttOptions;
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;
use uuid::Uuid;

/// Build a unique client id so restarts never collide with a lingering session
pub fn client_id(service_name: &str) -> String {
    format!("{service_name}-{}", Uuid::new_v4().simple())
}

/// Pure function to configure MQTT options from config
pub fn configure_mqtt_options(service_name: &str, config: &MqttSection) -> MqttOptions {
    let mut mqtt_options = MqttOptions::new(client_id(service_name), &config.host, config.port);

    if config.protocol == MqttProtocol::Mqtts {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    // Credentials are resolved from the environment at connect time
    if let Some(username_env) = &config.username_env {
        if let Ok(username) = std::env::var(username_env) {
            let password = config
                .password_env
                .as_ref()
                .and_then(|env_name| std::env::var(env_name).ok())
                .unwrap_or_default();
            mqtt_options.set_credentials(username, password);
        }
    }

    mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(1)));
    mqtt_options.set_max_packet_size(Some(256 * 1024));

    mqtt_options
}
