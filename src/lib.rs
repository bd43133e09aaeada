pub mod app_state;
pub mod clock;
pub mod cron_manager;
pub mod debug_control;
pub mod device_model;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod rules;
pub mod settings;
pub mod timer_manager;
pub mod topics;
pub mod transport;
