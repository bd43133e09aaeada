use color_eyre::eyre::Result;
use hc_rules_engine::{
    app_state::{AppState, ConnectionEvent, ConnectionState},
    lifecycle::ReadinessState,
    transport::{MqttClientEvent, Transport},
};

pub async fn handle_mqtt_client_event(event: MqttClientEvent, state: &mut AppState) -> Result<bool> {
    match event {
        MqttClientEvent::Connect => {
            log::debug!("MQTT client connected");
            match state.mqtt_state.change_state(ConnectionState::Connected) {
                Some(ConnectionEvent::Connect) => {
                    state.engine.start()?;
                }
                Some(ConnectionEvent::Reconnect) => {
                    state.mqtt_client.resubscribe()?;
                    // the sync token may have been lost with the old connection
                    if state.engine.state() == ReadinessState::AwaitingMetadataSync {
                        state.mqtt_client.request_sync()?;
                    }
                }
                _ => {}
            }
        }
        MqttClientEvent::Disconnect => {
            log::debug!("MQTT client disconnected");
            state.mqtt_state.change_state(ConnectionState::Disconnected);
        }
        MqttClientEvent::SyncComplete => {
            log::debug!("MQTT retained backlog delivered");
            state.engine.broker_ready()?;
        }
        MqttClientEvent::PublishMessage(publish) => {
            log::trace!("MQTT value received: {} = {}", publish.topic, publish.payload);
            state.engine.deliver(publish)?;
        }
        MqttClientEvent::Stop => {
            log::debug!("MQTT client stopped");
        }
        MqttClientEvent::Error(err) => {
            log::error!("MQTT Client Error: {:?}", err);
        }
    }
    Ok(false)
}
