pub mod mock;
pub mod system;

pub use mock::MockBackend;
pub use system::SystemBackend;

use std::sync::Arc;

use serde::Serialize;

use crate::dialect::Dialect;
use crate::error::AppError;

pub const TESTED_MODELS: [&str; 1] = ["Raspberry Pi 5 Model B Rev 1.0"];
pub const TESTED_OS: [&str; 2] = ["Bookworm", "Trixie"];
pub const TESTED_TOOL_VERSIONS: [&str; 2] = ["v1.6", "v2.2"];

/// Notifications coming out of a long-lived subprocess.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutput {
    Stdout(String),
    Stderr(String),
    Exited(Option<i32>),
}

pub type OutputSink = Arc<dyn Fn(ProcessOutput) + Send + Sync>;

pub trait ProcessHandle: Send {
    fn pid(&self) -> Option<u32>;
    /// Requests termination. Completion is not awaited.
    fn terminate(&mut self);
    fn is_running(&self) -> bool;
}

pub trait CommandExecutor: Send + Sync {
    /// Runs a program to completion and returns its stdout.
    fn run_sync(&self, program: &str, args: &[String]) -> Result<String, AppError>;
    fn spawn(
        &self,
        program: &str,
        args: &[String],
        sink: OutputSink,
    ) -> Result<Box<dyn ProcessHandle>, AppError>;
}

pub trait FileWriter: Send + Sync {
    fn write_text(&self, path: &str, content: &str) -> Result<(), AppError>;
}

pub trait CapabilityProbe: Send + Sync {
    fn model(&self) -> Option<String>;
    fn os_codename(&self) -> Option<String>;
    fn tool_version(&self) -> Option<String>;
    /// Electrical configuration descriptor of a line, e.g. `pwm0_chan2`.
    fn line_config(&self, line: u32) -> Result<String, AppError>;
}

/// Everything the line manager needs from the outside world.
pub trait LineBackend: CommandExecutor + FileWriter + CapabilityProbe {}

impl<T: CommandExecutor + FileWriter + CapabilityProbe> LineBackend for T {}

#[derive(Debug, Clone, Serialize)]
pub struct SystemReport {
    pub model: Option<String>,
    pub os: Option<String>,
    pub tool_version: Option<String>,
    pub dialect: Option<Dialect>,
    pub tested: bool,
    pub notes: Vec<String>,
}

impl SystemReport {
    pub fn probe<P: CapabilityProbe + ?Sized>(probe: &P) -> Self {
        let model = probe.model();
        let os = probe.os_codename();
        let tool_version = probe.tool_version();
        let dialect = tool_version.as_deref().and_then(Dialect::from_version);

        let mut notes = Vec::new();
        match &model {
            Some(m) if TESTED_MODELS.contains(&m.as_str()) => {}
            Some(m) => notes.push(format!("model not tested: {m}")),
            None => notes.push("not a Raspberry Pi hardware".into()),
        }
        match &os {
            Some(o) if TESTED_OS.contains(&o.as_str()) => {}
            Some(o) => notes.push(format!("OS not tested: {o}")),
            None => notes.push("OS codename unknown".into()),
        }
        match &tool_version {
            Some(v) if TESTED_TOOL_VERSIONS.iter().any(|t| v.starts_with(t)) => {}
            Some(v) => notes.push(format!("libgpiod version not tested: {v}")),
            None => notes.push("libgpiod tools not found".into()),
        }

        Self {
            model,
            os,
            tool_version,
            dialect,
            tested: notes.is_empty(),
            notes,
        }
    }
}
