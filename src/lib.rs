pub mod abort;
pub mod check;
pub mod cli;
pub mod collector;
pub mod command_check;
pub mod config;
pub mod error;
pub mod local;
pub mod logging;
pub mod process;
pub mod push;
pub mod report;
pub mod state;
pub mod target;

// Re-export key types and functions at the crate root
pub use check::{Check, CheckFuture, Checker, CheckerFn, run_with_test_collector};
pub use collector::TestCollector;
pub use config::Config;
pub use error::{CheckError, ClassifyError, ProcessError, PushError};
pub use local::{OutputFormat, run_local};
pub use logging::init_logging;
pub use process::{ProcessHarness, ProcessResult, SplitPolicy, wait_for_file};
pub use push::{PushTransport, StatePusher};
pub use report::{Report, ResultData, Severity, Vulnerability};
pub use state::{CheckHandle, CheckState, CheckStateMachine, Status};
pub use target::{Target, TargetClassifier};
