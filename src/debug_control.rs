use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::{
    error::EngineError,
    settings::EngineSettings,
    topics::{control_meta_topic, control_on_topic, control_topic, device_name_topic},
    transport::{OutgoingMessage, Transport},
};

/// The engine's own settings device with its "Rule debugging" switch.
///
/// The switch gates debug output of rule code. It is published once the engine
/// is ready and follows writes to its `/on` topic.
#[derive(Debug, Clone)]
pub struct DebugControl {
    device_id: String,
    device_name: String,
    control_name: String,
    enabled: Arc<AtomicBool>,
}

impl DebugControl {
    pub fn new(settings: &EngineSettings) -> Self {
        Self {
            device_id: settings.device_id.clone(),
            device_name: settings.device_name.clone(),
            control_name: settings.debug_control.clone(),
            enabled: Arc::new(AtomicBool::new(settings.debug)),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Flag shared with the rule logger.
    pub fn flag(&self) -> Arc<AtomicBool> {
        self.enabled.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn on_topic(&self) -> String {
        control_on_topic(&self.device_id, &self.control_name)
    }

    fn value_payload(&self) -> &'static str {
        if self.is_enabled() {
            "1"
        } else {
            "0"
        }
    }

    /// Publishes the settings device and the switch, then listens for writes.
    pub fn announce(&self, transport: &dyn Transport) -> Result<(), EngineError> {
        transport.publish(OutgoingMessage::retained(
            device_name_topic(&self.device_id),
            self.device_name.as_str(),
        ))?;
        transport.publish(OutgoingMessage::retained(
            control_meta_topic(&self.device_id, &self.control_name, "type"),
            "switch",
        ))?;
        transport.publish(OutgoingMessage::retained(
            control_meta_topic(&self.device_id, &self.control_name, "order"),
            "1",
        ))?;
        self.publish_value(transport)?;
        transport.subscribe(&self.on_topic())?;
        Ok(())
    }

    fn publish_value(&self, transport: &dyn Transport) -> Result<(), EngineError> {
        transport.publish(OutgoingMessage::retained(
            control_topic(&self.device_id, &self.control_name),
            self.value_payload(),
        ))?;
        Ok(())
    }

    /// Applies a write to the switch and confirms the new value. Payloads other
    /// than `1`/`0`/`true`/`false` are ignored.
    pub fn handle_write(&self, payload: &str, transport: &dyn Transport) -> Result<(), EngineError> {
        let enabled = match payload.trim() {
            "1" | "true" => true,
            "0" | "false" => false,
            other => {
                log::warn!("Ignoring invalid value [{}] for {}", other, self.control_name);
                return Ok(());
            }
        };
        self.enabled.store(enabled, Ordering::Relaxed);
        log::info!("Rule debugging {}", if enabled { "enabled" } else { "disabled" });
        self.publish_value(transport)
    }
}
