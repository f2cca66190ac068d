//! # fanctld
//!
//! A Linux daemon that drives chassis fans and NVIDIA GPU fans from
//! temperature readings, one mode decision engine per fan group.
//!
//! ## Features
//!
//! - **Stepped Modes**: each group escalates through an ordered profile table
//!   after a sustained delay and steps down only after a hold time
//! - **Closed-Loop Actuation**: sysfs PWM channels are nudged until the fan
//!   reaches its target RPM; GPU fans are driven through `nvidia-settings`
//! - **Overrides**: pin any group to a mode at runtime, optionally persisted
//! - **History**: snapshots recorded to a rotating JSON-lines log
//! - **D-Bus Interface**: status, history and override control on the session bus
//! - **Hot Reload**: configuration changes without restart
//!
//! ## Architecture
//!
//! - [`Orchestrator`](orchestrator::Orchestrator) - One control tick over all groups
//! - [`ModeDecisionEngine`](engine::ModeDecisionEngine) - Per-group mode state machine
//! - [`SystemCoordinator`](coordinator::SystemCoordinator) - Service lifecycle manager
//! - [`EventBus`](event::EventBus) - Inter-service communication
//! - [`AppState`](app_context::AppState) - Shared application state
//!
//! ## Example
//!
//! ```no_run
//! use fanctld::{application::Application, config::ConfigManager};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config_manager = ConfigManager::load(None).await?;
//!     Application::builder()
//!         .with_config_manager(config_manager)
//!         .build()
//!         .await?
//!         .run()
//!         .await
//! }
//! ```

pub mod actuators;
pub mod app_context;
pub mod application;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod drivers;
pub mod engine;
pub mod event;
pub mod history;
pub mod interface;
pub mod orchestrator;
pub mod providers;
pub mod sensors;
pub mod task_manager;
pub mod temperature_sensors;
