pub mod connection;
pub mod error;
pub mod process;
pub mod resolve;
pub mod run;
pub mod state_machine;
mod stream;

pub use connection::{ConnectionSnapshot, ConnectionSupervisor};
pub use error::SupervisorError;
pub use resolve::resolve_interpreter;
pub use run::{FailureReason, RunHandle, RunRequest, RunState, RunSupervisor, WARNING_FILTER_ARGS};
pub use state_machine::ConnectionState;
