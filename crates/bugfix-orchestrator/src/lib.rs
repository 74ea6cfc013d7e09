//! Ticket lifecycle coordinator for an automated bug-fix pipeline.
//!
//! The coordinator polls a bug tracker for open tickets, claims each one via
//! a cross-process lease, drives it through plan / implement / verify /
//! communicate stages with a bounded retry loop, and routes unfixable
//! tickets to human review. Stages are black boxes behind the [`stage::Stage`]
//! trait; the default binary wires in command-backed stages speaking JSON.

pub mod analytics;
pub mod config;
pub mod coordinator;
pub mod lock;
pub mod poller;
pub mod run;
pub mod scm;
pub mod stage;
pub mod stages;
pub mod state_machine;
pub mod tracker;
pub mod validation;

pub use config::OrchestratorConfig;
pub use coordinator::{Coordinator, PipelineStages};
pub use poller::PollingDriver;
