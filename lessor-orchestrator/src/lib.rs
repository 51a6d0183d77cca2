//! Instance lifecycle orchestration for rented marketplace compute: acquisition,
//! service exposure, health monitoring, teardown and SSH terminal access.

pub mod api;
pub mod app;
pub mod controller;
pub mod deletion_queue;
pub mod error;
pub mod events;
pub mod migrations;
pub mod monitor;
pub mod ports;
pub mod provider_manager;
pub mod registry;
pub mod services;
pub mod settings;
pub mod ssh;
pub mod state_machine;
pub mod store;
pub mod vpn;
pub mod web_proxy;

pub use app::{AppState, Collaborators};
pub use error::LifecycleError;
pub use settings::Settings;
