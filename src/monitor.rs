//! Edge monitoring for input lines.
//!
//! A subscription owns exactly one monitoring subprocess. Its raw output is
//! parsed with the active [`Dialect`], debounced, filtered by direction and
//! only then handed to the subscriber's callback.

use log::{debug, info, warn};
use std::fmt;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::backend::{CommandExecutor, OutputSink, ProcessHandle, ProcessOutput};
use crate::config::{Bias, EdgeDetect};
use crate::dialect::{Dialect, MONITOR_PROGRAM};
use crate::error::AppError;

pub const MAX_DEBOUNCE_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Edge {
    Rising,
    Falling,
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Edge::Rising => "rising",
            Edge::Falling => "falling",
        })
    }
}

impl EdgeDetect {
    pub fn accepts(&self, edge: Edge) -> bool {
        match self {
            EdgeDetect::Stop => false,
            EdgeDetect::Rising => edge == Edge::Rising,
            EdgeDetect::Falling => edge == Edge::Falling,
            EdgeDetect::Both => true,
        }
    }
}

pub fn parse_edge(line: u32, edge: &str) -> Result<EdgeDetect, AppError> {
    edge.parse::<EdgeDetect>()
        .map_err(|edge| AppError::UnsupportedEdge { line, edge })
}

#[derive(Debug, Clone, Serialize)]
pub struct EdgeEvent {
    pub line: u32,
    pub edge: Edge,
    /// Wall-clock receipt time.
    pub timestamp_ms: u64,
    /// Time reported by the monitoring tool itself, when it prints one.
    pub tool_timestamp_ms: Option<u64>,
}

pub type EdgeCallback = Arc<dyn Fn(EdgeEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MonitorOptions {
    #[serde(default)]
    pub debounce_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LastEvent {
    /// Milliseconds since the subscription started.
    pub time_ms: u64,
    pub edge: Edge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Bounce { delta_ms: u64 },
}

/// Suppresses same-direction transitions that follow each other within the
/// window. The last event is recorded whatever the verdict.
#[derive(Debug, Clone)]
pub struct Debouncer {
    window_ms: u64,
    last: Option<LastEvent>,
}

impl Debouncer {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms: window_ms.min(MAX_DEBOUNCE_MS),
            last: None,
        }
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    pub fn last(&self) -> Option<LastEvent> {
        self.last
    }

    pub fn observe(&mut self, edge: Edge, now_ms: u64) -> Verdict {
        let verdict = match self.last {
            Some(last) => {
                // at least 1 ms so identical timestamps cannot slip through
                let delta_ms = now_ms.saturating_sub(last.time_ms).max(1);
                if delta_ms <= self.window_ms && edge == last.edge {
                    Verdict::Bounce { delta_ms }
                } else {
                    Verdict::Accept
                }
            }
            None => Verdict::Accept,
        };
        self.last = Some(LastEvent {
            time_ms: now_ms,
            edge,
        });
        verdict
    }
}

/// When a raw transition was read. Debounce runs on the monotonic part so
/// wall-clock steps cannot fake or hide a bounce.
#[derive(Debug, Clone, Copy)]
struct Receipt {
    elapsed_ms: u64,
    epoch_ms: u64,
}

struct SubscriptionState {
    line: u32,
    started: Instant,
    generation: u64,
    filter: EdgeDetect,
    debouncer: Debouncer,
    callback: Option<EdgeCallback>,
    alive: bool,
}

impl SubscriptionState {
    fn new(line: u32) -> Self {
        Self {
            line,
            started: Instant::now(),
            generation: 0,
            filter: EdgeDetect::Stop,
            debouncer: Debouncer::new(0),
            callback: None,
            alive: false,
        }
    }

    /// Runs one raw transition through debounce and direction filtering.
    fn process(
        &mut self,
        edge: Edge,
        tool_timestamp_ms: Option<u64>,
        at: Receipt,
    ) -> Option<EdgeEvent> {
        match self.debouncer.observe(edge, at.elapsed_ms) {
            Verdict::Bounce { delta_ms } => {
                debug!("bounce detected on line {} {edge} {delta_ms}ms", self.line);
                None
            }
            Verdict::Accept if self.filter.accepts(edge) => Some(EdgeEvent {
                line: self.line,
                edge,
                timestamp_ms: at.epoch_ms,
                tool_timestamp_ms,
            }),
            Verdict::Accept => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionInfo {
    pub edge: EdgeDetect,
    pub debounce_ms: u64,
    pub generation: u64,
    pub pid: Option<u32>,
    pub running: bool,
    pub last_event: Option<LastEvent>,
}

/// Per-line monitor. Holds at most one live subprocess.
pub struct EdgeMonitor {
    state: Arc<Mutex<SubscriptionState>>,
    process: Option<Box<dyn ProcessHandle>>,
}

impl EdgeMonitor {
    pub fn new(line: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(SubscriptionState::new(line))),
            process: None,
        }
    }

    /// Replaces any running subscription with a new one.
    #[allow(clippy::too_many_arguments)]
    pub fn subscribe<E: CommandExecutor + ?Sized>(
        &mut self,
        executor: &E,
        dialect: Dialect,
        chip: &str,
        bias: Bias,
        filter: EdgeDetect,
        callback: Option<EdgeCallback>,
        options: MonitorOptions,
    ) -> Result<(), AppError> {
        self.terminate();

        let (line, generation) = {
            let mut state = self.state.lock();
            state.generation += 1;
            state.started = Instant::now();
            state.filter = filter;
            state.debouncer = Debouncer::new(options.debounce_ms);
            state.callback = callback;
            state.alive = true;
            (state.line, state.generation)
        };
        if options.debounce_ms > MAX_DEBOUNCE_MS {
            warn!(
                "debounce {}ms on line {line} clamped to {MAX_DEBOUNCE_MS}ms",
                options.debounce_ms
            );
        }

        let args = dialect.monitor_args(chip, &[line], bias);
        match executor.spawn(MONITOR_PROGRAM, &args, self.sink(generation, dialect)) {
            Ok(process) => {
                info!(
                    "line {line} monitored for {filter:?} edges (generation {generation}, pid {:?})",
                    process.pid()
                );
                self.process = Some(process);
                Ok(())
            }
            Err(e) => {
                self.reset();
                Err(e.on_line(line))
            }
        }
    }

    /// Stops the subscription. Returns false when nothing was running.
    pub fn unsubscribe(&mut self) -> bool {
        if self.process.is_none() {
            return false;
        }
        self.terminate();
        self.reset();
        true
    }

    pub fn info(&self) -> Option<SubscriptionInfo> {
        let process = self.process.as_ref()?;
        let state = self.state.lock();
        Some(SubscriptionInfo {
            edge: state.filter,
            debounce_ms: state.debouncer.window_ms(),
            generation: state.generation,
            pid: process.pid(),
            running: state.alive && process.is_running(),
            last_event: state.debouncer.last(),
        })
    }

    fn terminate(&mut self) {
        if let Some(mut process) = self.process.take() {
            process.terminate();
        }
    }

    fn reset(&mut self) {
        let mut state = self.state.lock();
        state.generation += 1;
        state.filter = EdgeDetect::Stop;
        state.callback = None;
        state.alive = false;
    }

    fn sink(&self, generation: u64, dialect: Dialect) -> OutputSink {
        let state = self.state.clone();
        Arc::new(move |output| handle_output(&state, generation, dialect, output))
    }
}

impl Drop for EdgeMonitor {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn handle_output(
    state: &Mutex<SubscriptionState>,
    generation: u64,
    dialect: Dialect,
    output: ProcessOutput,
) {
    match output {
        ProcessOutput::Stdout(text) => {
            for raw in text.lines().filter(|l| !l.trim().is_empty()) {
                let Some(event) = dialect.parse_event(raw) else {
                    debug!("unparsed monitor output: {raw:?}");
                    continue;
                };

                let delivery = {
                    let mut state = state.lock();
                    if state.generation != generation {
                        debug!(
                            "discarding event from stale monitor generation {generation} on line {}",
                            state.line
                        );
                        return;
                    }
                    if event.line != state.line {
                        continue;
                    }
                    let at = Receipt {
                        elapsed_ms: state.started.elapsed().as_millis() as u64,
                        epoch_ms: epoch_millis(),
                    };
                    state
                        .process(event.edge, event.tool_timestamp_ms, at)
                        .and_then(|evt| state.callback.clone().map(|cb| (cb, evt)))
                };

                if let Some((callback, evt)) = delivery {
                    callback(evt);
                }
            }
        }
        ProcessOutput::Stderr(text) => {
            let line = state.lock().line;
            warn!("gpiomon stderr on line {line}: {}", text.trim());
        }
        ProcessOutput::Exited(code) => {
            let mut state = state.lock();
            if state.generation == generation && state.alive {
                state.alive = false;
                warn!(
                    "monitor process for line {} exited unexpectedly (code {code:?})",
                    state.line
                );
            }
        }
    }
}

pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
