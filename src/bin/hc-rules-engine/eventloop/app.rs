use color_eyre::eyre::Result;
use hc_rules_engine::app_state::{AppEvent, AppState};

pub async fn handle_app_event(event: AppEvent, state: &mut AppState) -> Result<bool> {
    match event {
        AppEvent::Exit => {
            log::info!("Shutting down rule engine");
            // let the lane finish what is queued before the connection goes away
            if let Err(err) = state.engine.sync().await {
                log::warn!("Rule lane did not drain: {}", err);
            }
            state.mqtt_client.disconnect()?;

            // exit
            state.should_exit = true;
        }
    }
    Ok(false)
}
