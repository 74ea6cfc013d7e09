//! Stage implementations shipped with the orchestrator.
//!
//! The pipeline itself treats stages as black boxes; these are the concrete
//! adapters the binary wires in by default.

mod communicate;
mod exec;

pub use communicate::PullRequestCommunicator;
pub use exec::ExecStage;
