//! Nexwatch daemon library - the nexmon wifi watchdog, exposed for the
//! binary and for integration tests.

pub mod commands;
pub mod daemon;
pub mod diagnostics;
pub mod display;
pub mod executor;
pub mod hardware;
pub mod hopper;
pub mod host;
pub mod logs;
pub mod orchestrator;
pub mod scanner;
pub mod watchdog;

pub use executor::{CommandRunner, FakeCommandRunner, FakeReply, SystemCommandRunner};
pub use host::{FakeHost, HostCall, HostControl};
pub use orchestrator::{LogResponse, RecoveryOrchestrator, Trigger};
pub use scanner::{LogExcerpt, LogScanner};
pub use watchdog::{CycleReport, Watchdog};
