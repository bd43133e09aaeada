use std::{sync::Arc, time::Duration};

use color_eyre::eyre::Result;
use hc_rules_engine::{
    app_state::{AppEvent, AppState, ConnectionState},
    engine::Engine,
    settings::{Settings, CHANNEL_CAPACITY},
    topics::sync_topic,
    transport::{run_mqtt_client, MqttClientHandle},
};
use rumqttc::MqttOptions;
use tokio::sync::mpsc;

use crate::{eventloop::EventMultiPlexer, rules::builtin_rules};

pub async fn initialize_app() -> Result<(EventMultiPlexer, MqttClientHandle, AppState)> {
    let settings = Settings::from_env()?;
    log::debug!("Settings: {:?}", settings.engine);

    let (app_event_sender, app_event_receiver) = mpsc::channel::<AppEvent>(CHANNEL_CAPACITY);

    // Setup MQTT Client
    // ===============================================
    let mut mqtt_options = MqttOptions::new(&settings.mqtt.client_id, &settings.mqtt.hostname, settings.mqtt.port);
    mqtt_options.set_keep_alive(Duration::from_secs(5));
    if !settings.mqtt.username.is_empty() {
        mqtt_options.set_credentials(&settings.mqtt.username, &settings.mqtt.password);
    }

    let (mqtt_client_handle, mqtt_client, mqtt_event_receiver) = run_mqtt_client(
        mqtt_options,
        settings.mqtt.channel_size,
        sync_topic(&settings.engine.device_id, &settings.mqtt.client_id),
    )?;

    // Setup rule engine
    // ===============================================
    let engine = Engine::builder(settings.engine.clone(), Arc::new(mqtt_client.clone()))
        .rules(builtin_rules())
        .spawn();

    // Setup EventMultiPlexer
    // =====================================================
    let event_multiplexer = EventMultiPlexer::new(app_event_receiver, mqtt_event_receiver);

    Ok((
        event_multiplexer,
        mqtt_client_handle,
        AppState {
            engine,
            mqtt_client,
            app_event_sender,
            should_exit: false,
            mqtt_state: ConnectionState::Init,
        },
    ))
}

pub async fn deinitialize_app(mqtt_client_handle: MqttClientHandle, state: AppState) -> Result<()> {
    state.engine.stop().await;

    mqtt_client_handle.stop().await?;
    log::debug!("Deinitialized app...");

    Ok(())
}
