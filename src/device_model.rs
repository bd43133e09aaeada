use std::{
    collections::{BTreeMap, VecDeque},
    fmt,
    str::FromStr,
};

use crate::{topics::DeviceTopic, transport::IncomingMessage};

/// `(device, control)` pair identifying a control.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ControlRef {
    pub device: String,
    pub control: String,
}

impl ControlRef {
    pub fn new(device: impl Into<String>, control: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            control: control.into(),
        }
    }
}

impl fmt::Display for ControlRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device, self.control)
    }
}

impl FromStr for ControlRef {
    type Err = String;

    /// Parses `device/control`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((device, control)) if !device.is_empty() && !control.is_empty() => {
                Ok(ControlRef::new(device, control))
            }
            _ => Err(format!("Invalid control reference [{}], use 'device/control'", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlType {
    Switch,
    Alarm,
    PushButton,
    Range,
    Rgb,
    Text,
    Value,
    Other(String),
}

impl ControlType {
    pub fn as_str(&self) -> &str {
        match self {
            ControlType::Switch => "switch",
            ControlType::Alarm => "alarm",
            ControlType::PushButton => "pushbutton",
            ControlType::Range => "range",
            ControlType::Rgb => "rgb",
            ControlType::Text => "text",
            ControlType::Value => "value",
            ControlType::Other(s) => s,
        }
    }

    /// Whether the control type accepts writes through its `/on` topic.
    pub fn accepts_writes(&self) -> bool {
        matches!(
            self,
            ControlType::Switch | ControlType::PushButton | ControlType::Range | ControlType::Rgb | ControlType::Text
        )
    }
}

impl From<&str> for ControlType {
    fn from(value: &str) -> Self {
        match value {
            "switch" => ControlType::Switch,
            "alarm" => ControlType::Alarm,
            "pushbutton" => ControlType::PushButton,
            "range" => ControlType::Range,
            "rgb" => ControlType::Rgb,
            "text" => ControlType::Text,
            "value" => ControlType::Value,
            other => ControlType::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ControlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Control {
    pub control_type: Option<ControlType>,
    pub order: Option<u32>,
    pub max: Option<f64>,
    pub readonly: bool,
    pub retained: bool,
    pub value: Option<String>,
}

impl Control {
    /// Type and value are both known.
    pub fn is_complete(&self) -> bool {
        self.control_type.is_some() && self.value.is_some()
    }

    pub fn is_writable(&self) -> bool {
        !self.readonly && self.control_type.as_ref().is_some_and(ControlType::accepts_writes)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Device {
    pub name: Option<String>,
    pub controls: BTreeMap<String, Control>,
}

/// A value change observed on a control.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlChange {
    pub control: ControlRef,
    pub value: String,
    pub previous: Option<String>,
    /// Delivered while the engine was still syncing (retained replay).
    pub initial: bool,
}

/// In-memory mirror of devices and controls seen on the transport.
///
/// Entries are upserted as soon as any topic names them, so metadata arriving
/// before the value (or the other way round) never gets lost. Value changes
/// observed before [`on_broker_ready`](DeviceModel::on_broker_ready) are held
/// back in a backlog and handed over in arrival order.
#[derive(Debug, Default)]
pub struct DeviceModel {
    devices: BTreeMap<String, Device>,
    backlog: VecDeque<ControlChange>,
    synced: bool,
}

impl DeviceModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device(&self, device: &str) -> Option<&Device> {
        self.devices.get(device)
    }

    pub fn control(&self, control: &ControlRef) -> Option<&Control> {
        self.devices.get(&control.device)?.controls.get(&control.control)
    }

    pub fn value(&self, control: &ControlRef) -> Option<&str> {
        self.control(control)?.value.as_deref()
    }

    fn upsert_control(&mut self, device: &str, control: &str) -> &mut Control {
        self.devices
            .entry(device.to_string())
            .or_default()
            .controls
            .entry(control.to_string())
            .or_default()
    }

    /// Applies a transport message. Returns the resulting value change, if any,
    /// once the model is synced; before that changes go to the backlog.
    pub fn apply(&mut self, message: &IncomingMessage) -> Option<ControlChange> {
        let Some(topic) = DeviceTopic::parse(&message.topic) else {
            log::trace!("DeviceModel: ignoring topic {}", message.topic);
            return None;
        };

        match topic {
            DeviceTopic::DeviceMeta { device, meta } => {
                let entry = self.devices.entry(device.to_string()).or_default();
                if meta == "name" {
                    entry.name = Some(message.payload.clone());
                }
                None
            }
            DeviceTopic::ControlMeta { device, control, meta } => {
                let entry = self.upsert_control(device, control);
                let payload = message.payload.as_str();
                match meta {
                    "type" => entry.control_type = Some(ControlType::from(payload)),
                    "order" => entry.order = payload.parse().ok(),
                    "max" => entry.max = payload.parse().ok(),
                    "readonly" => entry.readonly = payload == "1" || payload == "true",
                    _ => log::trace!("DeviceModel: unhandled meta [{}] for {}/{}", meta, device, control),
                }
                None
            }
            DeviceTopic::ControlValue { device, control } => {
                let entry = self.upsert_control(device, control);
                entry.retained = message.retain;
                if entry.value.as_deref() == Some(message.payload.as_str()) {
                    return None;
                }
                let previous = entry.value.replace(message.payload.clone());
                let change = ControlChange {
                    control: ControlRef::new(device, control),
                    value: message.payload.clone(),
                    previous,
                    initial: !self.synced,
                };
                if self.synced {
                    Some(change)
                } else {
                    self.backlog.push_back(change);
                    None
                }
            }
            DeviceTopic::ControlOn { .. } => None,
        }
    }

    /// Marks the model as synced and hands over the buffered changes in the
    /// order they arrived. Later calls return nothing.
    pub fn on_broker_ready(&mut self) -> Vec<ControlChange> {
        if self.synced {
            return Vec::new();
        }
        self.synced = true;
        log::debug!(
            "DeviceModel: synced {} devices, {} buffered changes",
            self.devices.len(),
            self.backlog.len()
        );
        self.backlog.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(topic: &str, payload: &str) -> IncomingMessage {
        IncomingMessage::new(topic, payload).retained()
    }

    #[test]
    fn out_of_order_metadata_is_merged() {
        let mut model = DeviceModel::new();
        model.apply(&msg("/devices/relay/controls/K1/meta/type", "switch"));
        model.apply(&msg("/devices/relay/meta/name", "Relay module"));

        let k1 = ControlRef::new("relay", "K1");
        let control = model.control(&k1).unwrap();
        assert_eq!(control.control_type, Some(ControlType::Switch));
        assert!(!control.is_complete());

        model.apply(&msg("/devices/relay/controls/K1", "1"));
        let control = model.control(&k1).unwrap();
        assert!(control.is_complete());
        assert!(control.is_writable());
        assert!(control.retained);
        assert_eq!(model.device("relay").unwrap().name.as_deref(), Some("Relay module"));
    }

    #[test]
    fn changes_are_buffered_until_ready() {
        let mut model = DeviceModel::new();
        assert_eq!(model.apply(&msg("/devices/a/controls/x", "1")), None);
        assert_eq!(model.apply(&msg("/devices/b/controls/y", "2")), None);
        assert_eq!(model.apply(&msg("/devices/a/controls/x", "3")), None);

        let backlog = model.on_broker_ready();
        let values = backlog
            .iter()
            .map(|c| (c.control.to_string(), c.value.as_str(), c.initial))
            .collect::<Vec<_>>();
        assert_eq!(
            values,
            vec![
                ("a/x".to_string(), "1", true),
                ("b/y".to_string(), "2", true),
                ("a/x".to_string(), "3", true),
            ]
        );
        assert_eq!(backlog[2].previous.as_deref(), Some("1"));
        assert!(model.on_broker_ready().is_empty());

        let change = model.apply(&IncomingMessage::new("/devices/a/controls/x", "4")).unwrap();
        assert!(!change.initial);
        assert_eq!(change.previous.as_deref(), Some("3"));
    }

    #[test]
    fn unchanged_value_is_not_a_change() {
        let mut model = DeviceModel::new();
        model.on_broker_ready();
        assert!(model.apply(&msg("/devices/a/controls/x", "1")).is_some());
        assert!(model.apply(&msg("/devices/a/controls/x", "1")).is_none());
    }

    #[test]
    fn readonly_and_bounds() {
        let mut model = DeviceModel::new();
        model.apply(&msg("/devices/dimmer/controls/level/meta/type", "range"));
        model.apply(&msg("/devices/dimmer/controls/level/meta/max", "255"));
        let level = ControlRef::new("dimmer", "level");
        assert_eq!(model.control(&level).unwrap().max, Some(255.0));
        assert!(model.control(&level).unwrap().is_writable());

        model.apply(&msg("/devices/dimmer/controls/level/meta/readonly", "1"));
        assert!(!model.control(&level).unwrap().is_writable());
    }

    #[test]
    fn control_ref_parsing() {
        let r: ControlRef = "relay/K1".parse().unwrap();
        assert_eq!(r, ControlRef::new("relay", "K1"));
        assert!("relay".parse::<ControlRef>().is_err());
        assert!("/K1".parse::<ControlRef>().is_err());
    }
}
