use log::debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use super::{CapabilityProbe, CommandExecutor, FileWriter, OutputSink, ProcessHandle, ProcessOutput};
use crate::dialect::{GET_PROGRAM, SET_PROGRAM};
use crate::error::AppError;

/// In-memory stand-in for the board. Records every command and file write,
/// keeps line levels for `gpioset`/`gpioget`, and lets callers feed output
/// into spawned monitor processes.
pub struct MockBackend {
    state: Mutex<MockState>,
}

#[derive(Clone)]
pub struct SpawnRecord {
    pub program: String,
    pub args: Vec<String>,
    sink: OutputSink,
    running: Arc<AtomicBool>,
}

impl SpawnRecord {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

struct MockState {
    model: Option<String>,
    os: Option<String>,
    tool_version: Option<String>,
    line_configs: FxHashMap<u32, String>,
    levels: FxHashMap<u32, u8>,
    unreadable: FxHashSet<u32>,
    failing_programs: FxHashSet<String>,
    failing_paths: Vec<String>,
    commands: Vec<(String, Vec<String>)>,
    file_writes: Vec<(String, String)>,
    spawned: Vec<SpawnRecord>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self {
            state: Mutex::new(MockState {
                model: Some("Raspberry Pi 5 Model B Rev 1.0".into()),
                os: Some("Bookworm".into()),
                tool_version: Some("v2.2.1".into()),
                line_configs: FxHashMap::default(),
                levels: FxHashMap::default(),
                unreadable: FxHashSet::default(),
                failing_programs: FxHashSet::default(),
                failing_paths: Vec::new(),
                commands: Vec::new(),
                file_writes: Vec::new(),
                spawned: Vec::new(),
            }),
        }
    }
}

struct MockProcess {
    running: Arc<AtomicBool>,
}

impl ProcessHandle for MockProcess {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn terminate(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

/// Line number from the last tool argument: `17`, `GPIO17`, `17=1` or `GPIO17=1`.
fn target_line(args: &[String]) -> Option<(u32, Option<u8>)> {
    let last = args.last()?;
    let (name, value) = match last.split_once('=') {
        Some((name, value)) => (name, value.parse::<u8>().ok()),
        None => (last.as_str(), None),
    };
    let line = name.strip_prefix("GPIO").unwrap_or(name).parse::<u32>().ok()?;
    Some((line, value))
}

impl MockBackend {
    pub fn set_tool_version(&self, version: Option<&str>) {
        self.state.lock().tool_version = version.map(str::to_string);
    }

    pub fn set_model(&self, model: Option<&str>) {
        self.state.lock().model = model.map(str::to_string);
    }

    pub fn set_line_config(&self, line: u32, descriptor: &str) {
        self.state
            .lock()
            .line_configs
            .insert(line, descriptor.to_string());
    }

    pub fn set_level(&self, line: u32, level: u8) {
        let mut state = self.state.lock();
        state.unreadable.remove(&line);
        state.levels.insert(line, level);
    }

    pub fn level(&self, line: u32) -> Option<u8> {
        self.state.lock().levels.get(&line).copied()
    }

    /// Makes `gpioget` print nothing for this line.
    pub fn set_unreadable(&self, line: u32) {
        self.state.lock().unreadable.insert(line);
    }

    pub fn fail_program(&self, program: &str) {
        self.state.lock().failing_programs.insert(program.to_string());
    }

    /// Fails every write whose path ends with `suffix`.
    pub fn fail_file_write(&self, suffix: &str) {
        self.state.lock().failing_paths.push(suffix.to_string());
    }

    pub fn commands(&self) -> Vec<(String, Vec<String>)> {
        self.state.lock().commands.clone()
    }

    pub fn file_writes(&self) -> Vec<(String, String)> {
        self.state.lock().file_writes.clone()
    }

    pub fn spawned(&self) -> Vec<SpawnRecord> {
        self.state.lock().spawned.clone()
    }

    /// Feeds stdout into the most recently spawned process that still runs.
    pub fn emit(&self, text: &str) -> bool {
        let sink = {
            let state = self.state.lock();
            state
                .spawned
                .iter()
                .rev()
                .find(|p| p.is_running())
                .map(|p| p.sink.clone())
        };
        match sink {
            Some(sink) => {
                sink(ProcessOutput::Stdout(text.to_string()));
                true
            }
            None => false,
        }
    }

    /// Feeds output into a specific process, running or not. `Exited`
    /// also marks the process as gone.
    pub fn emit_to(&self, index: usize, output: ProcessOutput) {
        let sink = {
            let state = self.state.lock();
            state.spawned.get(index).map(|p| {
                if matches!(output, ProcessOutput::Exited(_)) {
                    p.running.store(false, Ordering::Relaxed);
                }
                p.sink.clone()
            })
        };
        if let Some(sink) = sink {
            sink(output);
        }
    }
}

impl CommandExecutor for MockBackend {
    fn run_sync(&self, program: &str, args: &[String]) -> Result<String, AppError> {
        let mut state = self.state.lock();
        state.commands.push((program.to_string(), args.to_vec()));
        debug!("mock exec {program} {}", args.join(" "));

        if state.failing_programs.contains(program) {
            return Err(AppError::ExternalCommandFailed {
                program: program.to_string(),
                line: None,
                reason: "exited with exit status: 1".into(),
            });
        }

        match (program, target_line(args)) {
            (SET_PROGRAM, Some((line, Some(value)))) => {
                state.levels.insert(line, value);
                Ok(String::new())
            }
            (GET_PROGRAM, Some((line, _))) => {
                if state.unreadable.contains(&line) {
                    return Ok(String::new());
                }
                let level = state.levels.get(&line).copied().unwrap_or(0);
                Ok(format!("{level}\n"))
            }
            _ => Ok(String::new()),
        }
    }

    fn spawn(
        &self,
        program: &str,
        args: &[String],
        sink: OutputSink,
    ) -> Result<Box<dyn ProcessHandle>, AppError> {
        let mut state = self.state.lock();
        if state.failing_programs.contains(program) {
            return Err(AppError::ExternalCommandFailed {
                program: program.to_string(),
                line: None,
                reason: "could not start: No such file or directory".into(),
            });
        }

        let running = Arc::new(AtomicBool::new(true));
        state.spawned.push(SpawnRecord {
            program: program.to_string(),
            args: args.to_vec(),
            sink,
            running: running.clone(),
        });
        Ok(Box::new(MockProcess { running }))
    }
}

impl FileWriter for MockBackend {
    fn write_text(&self, path: &str, content: &str) -> Result<(), AppError> {
        let mut state = self.state.lock();
        if state.failing_paths.iter().any(|s| path.ends_with(s.as_str())) {
            return Err(AppError::FileWrite {
                path: path.to_string(),
                reason: "Permission denied (os error 13)".into(),
            });
        }
        state
            .file_writes
            .push((path.to_string(), content.to_string()));
        Ok(())
    }
}

impl CapabilityProbe for MockBackend {
    fn model(&self) -> Option<String> {
        self.state.lock().model.clone()
    }

    fn os_codename(&self) -> Option<String> {
        self.state.lock().os.clone()
    }

    fn tool_version(&self) -> Option<String> {
        self.state.lock().tool_version.clone()
    }

    fn line_config(&self, line: u32) -> Result<String, AppError> {
        Ok(self
            .state
            .lock()
            .line_configs
            .get(&line)
            .cloned()
            .unwrap_or_else(|| "input".into()))
    }
}
