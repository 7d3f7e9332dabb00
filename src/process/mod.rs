pub mod runner;
pub mod sink;
pub mod supervisor;

pub use runner::{CommandRunner, ExecOptions};
pub use sink::OutputSink;
pub use supervisor::{LineStream, ManagedProcess, ProcessState};
