pub mod app_state;
pub mod chat;
pub mod provider;
pub mod quota;
pub mod relay;
pub mod usage_recorder;
