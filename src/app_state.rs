use tokio::sync::mpsc::Sender;

use crate::{engine::EngineHandle, transport::ManagedMqttClient};

#[derive(Debug)]
pub enum AppEvent {
    Exit,
}

pub struct AppState {
    pub engine: EngineHandle,
    pub mqtt_client: ManagedMqttClient,
    pub app_event_sender: Sender<AppEvent>,
    pub should_exit: bool,
    pub mqtt_state: ConnectionState,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Init,
    Connected,
    Disconnected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connect,
    Disconnect,
    Reconnect,
}

impl ConnectionState {
    pub fn change_state(&mut self, new_state: ConnectionState) -> Option<ConnectionEvent> {
        let event = match (&self, &new_state) {
            (ConnectionState::Init, ConnectionState::Connected) => Some(ConnectionEvent::Connect),
            (ConnectionState::Connected, ConnectionState::Disconnected) => Some(ConnectionEvent::Disconnect),
            (ConnectionState::Disconnected, ConnectionState::Connected) => Some(ConnectionEvent::Reconnect),
            _ => None, // No event if state change is not meaningful
        };

        *self = new_state;
        event
    }
}
