use std::time::Duration;

use color_eyre::eyre::Result;
use hc_rules_engine::{
    app_state::{AppEvent, AppState},
    transport::MqttClientEvent,
};
use mqtt_client::handle_mqtt_client_event;
use tokio::sync::mpsc::Receiver;

mod app;
mod mqtt_client;

pub use app::*;

#[derive(Debug)]
pub enum Event {
    App(AppEvent),
    MqttClientEvent(MqttClientEvent),
    Timeout,
    /// All event sources are closed.
    None,
}

pub struct EventMultiPlexer {
    app: Receiver<AppEvent>,
    mqtt_client_event: Receiver<MqttClientEvent>,
}

impl EventMultiPlexer {
    pub fn new(app: Receiver<AppEvent>, mqtt_client_event: Receiver<MqttClientEvent>) -> Self {
        Self { app, mqtt_client_event }
    }

    pub async fn next(&mut self, timeout_secs: u64) -> Event {
        tokio::select! {
            Some(event) = self.app.recv() => Event::App(event),
            Some(event) = self.mqtt_client_event.recv() => Event::MqttClientEvent(event),
            _ = tokio::time::sleep(Duration::from_secs(timeout_secs)) => Event::Timeout,
            else => Event::None,
        }
    }
}

pub async fn run_event_loop(event_multiplexer: &mut EventMultiPlexer, state: &mut AppState) -> Result<()> {
    loop {
        // timeout is usually 60s, except if we want to exit, we set it to one second, so the
        // application exits as soon as all events are done processing
        let timeout = if state.should_exit { 1 } else { 60 };
        let exit = match event_multiplexer.next(timeout).await {
            Event::App(app_event) => handle_app_event(app_event, state).await?,
            Event::MqttClientEvent(mqtt_event) => handle_mqtt_client_event(mqtt_event, state).await?,
            Event::Timeout => state.should_exit,
            Event::None => true,
        };

        if exit {
            break;
        }
    }
    log::debug!("Exiting application event loop");
    Ok(())
}
