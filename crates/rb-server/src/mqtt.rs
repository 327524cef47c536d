//! MQTT command adapter
//!
//! Subscribes to `<client_id>/control/state-machine/#` and forwards each
//! message to the engine as a command: the topic segments after the prefix
//! form the command path, the payload is the value.

use crate::settings::MqttSettings;
use rb_engine::{EngineError, EngineHandle};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Topic segment between the client id and the command path
pub const CONTROL_PREFIX: &str = "control/state-machine";

/// Wildcard subscription for a client's commands
pub fn command_topic(client_id: &str) -> String {
    format!("{client_id}/{CONTROL_PREFIX}/#")
}

/// Command path of a topic, or `None` when it is not a command topic
pub fn command_path(topic: &str, client_id: &str) -> Option<Vec<String>> {
    let rest = topic
        .strip_prefix(client_id)?
        .strip_prefix('/')?
        .strip_prefix(CONTROL_PREFIX)?;
    if rest.is_empty() {
        return Some(Vec::new());
    }
    let rest = rest.strip_prefix('/')?;
    Some(
        rest.split('/')
            .filter(|segment| !segment.is_empty())
            .map(str::to_string)
            .collect(),
    )
}

/// Connect to the broker and forward commands until the engine stops
pub fn spawn(settings: MqttSettings, handle: EngineHandle) -> JoinHandle<()> {
    let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
    options.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(options, 100);
    let topic = command_topic(&settings.client_id);
    info!(host = %settings.host, port = settings.port, topic = %topic, "Starting MQTT adapter");

    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("MQTT connected");
                    // Subscriptions do not survive a reconnect
                    if let Err(err) = client.subscribe(topic.as_str(), QoS::AtLeastOnce).await {
                        error!(error = %err, "MQTT subscribe failed");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(message))) => {
                    let Some(path) = command_path(&message.topic, &settings.client_id) else {
                        debug!(topic = %message.topic, "Ignoring non-command topic");
                        continue;
                    };
                    let payload = String::from_utf8_lossy(&message.payload).into_owned();
                    debug!(?path, payload = %payload, "MQTT command");

                    match handle.command(path, payload).await {
                        Ok(Some(report)) => info!(state = %report, "Current state"),
                        Ok(None) => {}
                        Err(EngineError::Closed) => {
                            info!("Engine stopped, closing MQTT adapter");
                            break;
                        }
                        Err(err) => warn!(error = %err, "Command failed"),
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(error = %err, "MQTT connection error");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    })
}
