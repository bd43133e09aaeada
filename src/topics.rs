//! Topic layout of the `/devices/...` convention.

pub const DEVICE_NAME_PATTERN: &str = "/devices/+/meta/name";
pub const CONTROL_PATTERN: &str = "/devices/+/controls/+";
pub const CONTROL_TYPE_PATTERN: &str = "/devices/+/controls/+/meta/type";
pub const CONTROL_MAX_PATTERN: &str = "/devices/+/controls/+/meta/max";

/// The fixed list of patterns that must be subscribed before the device model
/// can be considered synced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSet {
    patterns: Vec<&'static str>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self {
            patterns: vec![
                DEVICE_NAME_PATTERN,
                CONTROL_PATTERN,
                CONTROL_TYPE_PATTERN,
                CONTROL_MAX_PATTERN,
            ],
        }
    }

    pub fn patterns(&self) -> &[&'static str] {
        &self.patterns
    }
}

impl Default for SubscriptionSet {
    fn default() -> Self {
        Self::new()
    }
}

pub fn device_name_topic(device: &str) -> String {
    format!("/devices/{}/meta/name", device)
}

pub fn control_topic(device: &str, control: &str) -> String {
    format!("/devices/{}/controls/{}", device, control)
}

pub fn control_meta_topic(device: &str, control: &str, meta: &str) -> String {
    format!("/devices/{}/controls/{}/meta/{}", device, control, meta)
}

pub fn control_on_topic(device: &str, control: &str) -> String {
    format!("/devices/{}/controls/{}/on", device, control)
}

pub fn rule_log_topic(device: &str, level: &str) -> String {
    format!("/{}/log/{}", device, level)
}

pub fn sync_topic(device: &str, client_id: &str) -> String {
    format!("/{}/sync/{}", device, client_id)
}

/// A parsed topic under `/devices/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceTopic<'a> {
    DeviceMeta { device: &'a str, meta: &'a str },
    ControlValue { device: &'a str, control: &'a str },
    ControlMeta { device: &'a str, control: &'a str, meta: &'a str },
    ControlOn { device: &'a str, control: &'a str },
}

impl<'a> DeviceTopic<'a> {
    pub fn parse(topic: &'a str) -> Option<Self> {
        let rest = topic.strip_prefix("/devices/")?;
        let parts = rest.split('/').collect::<Vec<_>>();
        if parts.iter().any(|p| p.is_empty()) {
            return None;
        }
        match parts[..] {
            [device, "meta", meta] => Some(DeviceTopic::DeviceMeta { device, meta }),
            [device, "controls", control] => Some(DeviceTopic::ControlValue { device, control }),
            [device, "controls", control, "on"] => Some(DeviceTopic::ControlOn { device, control }),
            [device, "controls", control, "meta", meta] => Some(DeviceTopic::ControlMeta { device, control, meta }),
            _ => None,
        }
    }
}
