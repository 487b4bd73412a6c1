pub mod config;
pub mod logging;
pub mod output;
pub mod protocol;
pub mod session;
pub mod supervisor;

pub use config::Configuration;
pub use output::{OutputChannel, OutputSink};
pub use session::{ActiveDocument, EditorHost, Session};
pub use supervisor::{
    ConnectionState, ConnectionSupervisor, RunHandle, RunRequest, RunState, RunSupervisor,
    SupervisorError,
};
