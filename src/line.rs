//! Line resource manager.
//!
//! Every allocation goes through one registry so "already in use" is a map
//! lookup rather than a probe of the hardware. The registry lock is always
//! taken before a line lock, never the other way round.

use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::backend::{CommandExecutor, LineBackend, SystemReport};
use crate::config::{AppConfig, Bias, EdgeDetect, LineMode};
use crate::dialect::{Dialect, GET_PROGRAM, SET_PROGRAM};
use crate::error::AppError;
use crate::events::{EventHandler, EventHub};
use crate::monitor::{
    EdgeCallback, EdgeEvent, EdgeMonitor, MonitorOptions, SubscriptionInfo, parse_edge,
};
use crate::pwm::{PwmChannel, PwmInfo, PwmOptions, PwmTimings, channel_from_config};

pub type LineManager<B> = GenericLineManager<B>;

/// Returned by [`GenericLineManager::read`] when the tool gave no usable sample.
pub const READ_FAILED: i8 = -1;

/// Proof of one allocation. A handle outlives its allocation: once the line
/// is closed the handle stays closed, even if the same id is allocated again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LineHandle {
    pub line: u32,
    pub serial: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LineOptions {
    pub bias: Bias,
    /// Initial level of an output line.
    pub value: u8,
    pub pwm: PwmOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LineStatus {
    Free,
    Allocated,
    Closed,
}

#[derive(Debug, Clone, Serialize)]
pub struct LineDescriptor {
    pub line: u32,
    pub status: LineStatus,
    pub handle: Option<LineHandle>,
    pub mode: Option<LineMode>,
    pub bias: Option<Bias>,
    pub value: Option<u8>,
    pub pwm: Option<PwmInfo>,
    pub monitor: Option<SubscriptionInfo>,
    pub reversal_pending: bool,
}

impl LineDescriptor {
    fn free(line: u32, status: LineStatus) -> Self {
        Self {
            line,
            status,
            handle: None,
            mode: None,
            bias: None,
            value: None,
            pwm: None,
            monitor: None,
            reversal_pending: false,
        }
    }
}

struct Line {
    id: u32,
    serial: u64,
    mode: LineMode,
    status: LineStatus,
    bias: Bias,
    value: Option<u8>,
    pwm: Option<PwmChannel>,
    monitor: Option<EdgeMonitor>,
    reversal: Option<JoinHandle<()>>,
    // bumped by every write so a stale reversal can tell it lost
    write_epoch: u64,
}

impl Line {
    fn ensure(&self, op: &'static str, mode: LineMode) -> Result<(), AppError> {
        if self.status == LineStatus::Closed {
            return Err(AppError::HandleClosed { line: self.id, op });
        }
        if self.mode != mode {
            return Err(AppError::ModeMismatch {
                line: self.id,
                op,
                mode: self.mode,
            });
        }
        Ok(())
    }

    fn cancel_reversal(&mut self) {
        if let Some(task) = self.reversal.take() {
            task.abort();
            debug!("pending reversal on line {} cancelled", self.id);
        }
    }

    fn descriptor(&self) -> LineDescriptor {
        LineDescriptor {
            line: self.id,
            status: self.status,
            handle: Some(LineHandle {
                line: self.id,
                serial: self.serial,
            }),
            mode: Some(self.mode),
            bias: Some(self.bias),
            value: self.value,
            pwm: self.pwm.as_ref().map(PwmChannel::info),
            monitor: self.monitor.as_ref().and_then(EdgeMonitor::info),
            reversal_pending: self.reversal.as_ref().is_some_and(|t| !t.is_finished()),
        }
    }
}

struct Entry {
    serial: u64,
    line: Arc<Mutex<Line>>,
}

#[derive(Default)]
struct Registry {
    lines: FxHashMap<u32, Entry>,
    // ids between the allocation check and the end of their setup
    reserved: FxHashSet<u32>,
    next_serial: u64,
}

/// Holds an id while its allocation is in flight; releases it when dropped
/// unless committed.
struct Reservation<'a> {
    registry: &'a RwLock<Registry>,
    line: u32,
    active: bool,
}

impl Reservation<'_> {
    fn commit(mut self, entry: Entry) {
        let mut registry = self.registry.write();
        registry.reserved.remove(&self.line);
        registry.lines.insert(self.line, entry);
        self.active = false;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.active {
            self.registry.write().reserved.remove(&self.line);
        }
    }
}

fn drive<E: CommandExecutor + ?Sized>(
    executor: &E,
    dialect: Dialect,
    chip: &str,
    line: u32,
    bias: Bias,
    value: u8,
) -> Result<(), AppError> {
    executor
        .run_sync(SET_PROGRAM, &dialect.set_args(chip, line, bias, value))
        .map(|_| ())
        .map_err(|e| e.on_line(line))
}

pub struct GenericLineManager<B: LineBackend> {
    config: Arc<AppConfig>,
    backend: Arc<B>,
    dialect: Dialect,
    registry: RwLock<Registry>,
    events: EventHandler,
}

impl<B: LineBackend + 'static> GenericLineManager<B> {
    pub fn new(config: Arc<AppConfig>, backend: Arc<B>, dialect: Dialect) -> Self {
        let events = Arc::new(EventHub::new(
            config.lines.all(),
            config.broadcast_capacity,
            config.event_history_capacity,
        ));

        Self {
            config,
            backend,
            dialect,
            registry: RwLock::new(Registry::default()),
            events,
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn events(&self) -> &EventHandler {
        &self.events
    }

    pub fn system_report(&self) -> SystemReport {
        let mut report = SystemReport::probe(self.backend.as_ref());
        report.dialect = Some(self.dialect);
        report
    }

    pub fn line_config(&self, id: u32) -> Result<String, AppError> {
        self.ensure_known(id)?;
        self.backend.line_config(id)
    }

    /// Handle of the current allocation of `id`, if any.
    pub fn handle_of(&self, id: u32) -> Option<LineHandle> {
        self.registry
            .read()
            .lines
            .get(&id)
            .map(|e| LineHandle {
                line: id,
                serial: e.serial,
            })
    }

    pub fn status(&self, handle: LineHandle) -> LineStatus {
        match self.registry.read().lines.get(&handle.line) {
            Some(e) if e.serial == handle.serial => LineStatus::Allocated,
            _ => LineStatus::Closed,
        }
    }

    pub async fn allocate(
        &self,
        id: u32,
        mode: LineMode,
        options: LineOptions,
    ) -> Result<LineHandle, AppError> {
        if !self.config.lines.supports(id, mode) {
            warn!("line {id} is not supported in {mode} mode");
            return Err(AppError::UnsupportedLine {
                line: id,
                mode: Some(mode),
            });
        }

        let (reservation, serial) = self.reserve(id)?;
        // an error drops the reservation, leaving the line free
        let line = self.open_line(id, serial, mode, &options).await?;
        reservation.commit(Entry {
            serial,
            line: Arc::new(Mutex::new(line)),
        });

        info!("line {id} allocated in {mode} mode");
        Ok(LineHandle { line: id, serial })
    }

    fn reserve(&self, id: u32) -> Result<(Reservation<'_>, u64), AppError> {
        let mut registry = self.registry.write();
        if registry.lines.contains_key(&id) || registry.reserved.contains(&id) {
            warn!("line {id} is already allocated");
            return Err(AppError::AlreadyAllocated { line: id });
        }
        registry.reserved.insert(id);
        registry.next_serial += 1;
        let serial = registry.next_serial;

        Ok((
            Reservation {
                registry: &self.registry,
                line: id,
                active: true,
            },
            serial,
        ))
    }

    async fn open_line(
        &self,
        id: u32,
        serial: u64,
        mode: LineMode,
        options: &LineOptions,
    ) -> Result<Line, AppError> {
        let mut line = Line {
            id,
            serial,
            mode,
            status: LineStatus::Allocated,
            bias: options.bias,
            value: None,
            pwm: None,
            monitor: None,
            reversal: None,
            write_epoch: 0,
        };

        match mode {
            LineMode::Output => {
                if options.value > 1 {
                    return Err(AppError::InvalidValue {
                        line: id,
                        op: "allocate",
                        value: options.value.to_string(),
                    });
                }
                drive(
                    self.backend.as_ref(),
                    self.dialect,
                    &self.config.chip,
                    id,
                    options.bias,
                    options.value,
                )?;
                line.value = Some(options.value);
            }
            LineMode::Input => {}
            LineMode::Pwm => {
                let timings = PwmTimings::normalize(id, &options.pwm)?;
                let descriptor =
                    self.backend
                        .line_config(id)
                        .map_err(|e| AppError::PwmInitFailed {
                            line: id,
                            reason: format!("cannot read line configuration: {e}"),
                        })?;
                let channel = channel_from_config(id, &descriptor)?;
                let pwm = PwmChannel::start(
                    id,
                    &self.config.pwm_chip_path,
                    channel,
                    timings,
                    options.pwm.export_settle_ms,
                    self.backend.as_ref(),
                )
                .await?;
                line.pwm = Some(pwm);
            }
        }

        Ok(line)
    }

    fn entry(&self, handle: LineHandle, op: &'static str) -> Result<Arc<Mutex<Line>>, AppError> {
        match self.registry.read().lines.get(&handle.line) {
            Some(e) if e.serial == handle.serial => Ok(e.line.clone()),
            _ => Err(AppError::HandleClosed {
                line: handle.line,
                op,
            }),
        }
    }

    fn ensure_known(&self, id: u32) -> Result<(), AppError> {
        if self.config.lines.supports(id, LineMode::Input) {
            Ok(())
        } else {
            Err(AppError::UnsupportedLine {
                line: id,
                mode: None,
            })
        }
    }

    /// Drives an output line. Cancels any pending timed reversal.
    pub async fn write(&self, handle: LineHandle, value: u8) -> Result<(), AppError> {
        let line = self.entry(handle, "write")?;
        let mut line = line.lock();
        self.write_locked(&mut line, value)
    }

    fn write_locked(&self, line: &mut Line, value: u8) -> Result<(), AppError> {
        line.ensure("write", LineMode::Output)?;
        if value > 1 {
            return Err(AppError::InvalidValue {
                line: line.id,
                op: "write",
                value: value.to_string(),
            });
        }

        line.cancel_reversal();
        line.write_epoch += 1;
        drive(
            self.backend.as_ref(),
            self.dialect,
            &self.config.chip,
            line.id,
            line.bias,
            value,
        )
        .inspect_err(|e| warn!("line {} write failed: {e}", line.id))?;
        line.value = Some(value);
        debug!("line {} set to {value}", line.id);
        Ok(())
    }

    /// Writes `value`, then the opposite value once `duration` has elapsed.
    /// The reversal is dropped if the line is written again or closed first.
    pub async fn write_for(
        &self,
        handle: LineHandle,
        value: u8,
        duration: Duration,
    ) -> Result<(), AppError> {
        let line_lock = self.entry(handle, "write")?;
        let mut line = line_lock.lock();
        self.write_locked(&mut line, value)?;

        let epoch = line.write_epoch;
        let backend = self.backend.clone();
        let dialect = self.dialect;
        let chip = self.config.chip.clone();
        let target = line_lock.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(duration).await;

            let mut line = target.lock();
            if line.status != LineStatus::Allocated || line.write_epoch != epoch {
                return;
            }
            line.reversal = None;
            let inverse = 1 - value;
            match drive(backend.as_ref(), dialect, &chip, line.id, line.bias, inverse) {
                Ok(()) => {
                    line.value = Some(inverse);
                    debug!("line {} reverted to {inverse}", line.id);
                }
                Err(e) => warn!("line {} timed reversal failed: {e}", line.id),
            }
        });
        line.reversal = Some(task);
        Ok(())
    }

    /// Samples an input line. Tool failures and unparseable output yield
    /// [`READ_FAILED`] instead of an error.
    pub async fn read(&self, handle: LineHandle) -> Result<i8, AppError> {
        let line = self.entry(handle, "read")?;
        let line = line.lock();
        line.ensure("read", LineMode::Input)?;

        let args = self.dialect.get_args(&self.config.chip, line.id, line.bias);
        let sample = match self.backend.run_sync(GET_PROGRAM, &args) {
            Ok(out) => match out.trim().parse::<i8>() {
                Ok(v @ 0..=1) => v,
                _ => {
                    warn!("line {} read gave no usable output: {out:?}", line.id);
                    READ_FAILED
                }
            },
            Err(e) => {
                warn!("line {} read failed: {e}", line.id);
                READ_FAILED
            }
        };
        debug!("line {} value: {sample}", line.id);
        Ok(sample)
    }

    /// Starts, replaces or stops edge monitoring. Delivered events also land
    /// in the event hub.
    pub async fn monitor(
        &self,
        handle: LineHandle,
        edge: &str,
        callback: Option<EdgeCallback>,
        options: MonitorOptions,
    ) -> Result<(), AppError> {
        let line = self.entry(handle, "monitor")?;
        let mut line = line.lock();
        line.ensure("monitor", LineMode::Input)?;
        let filter = parse_edge(line.id, edge)?;

        if filter == EdgeDetect::Stop {
            match line.monitor.as_mut().map(EdgeMonitor::unsubscribe) {
                Some(true) => info!("line {} is no longer monitored", line.id),
                _ => info!("line {} is not monitored, nothing to stop", line.id),
            }
            return Ok(());
        }

        let (id, bias) = (line.id, line.bias);
        let callback = self.deliver_to(callback);
        line.monitor.get_or_insert_with(|| EdgeMonitor::new(id)).subscribe(
            self.backend.as_ref(),
            self.dialect,
            &self.config.chip,
            bias,
            filter,
            Some(callback),
            options,
        )
    }

    fn deliver_to(&self, user: Option<EdgeCallback>) -> EdgeCallback {
        let events = self.events.clone();
        Arc::new(move |event: EdgeEvent| {
            events.dispatch(event.clone());
            if let Some(callback) = &user {
                callback(event);
            }
        })
    }

    /// Strict percentage update of a PWM line.
    pub async fn set_duty(&self, handle: LineHandle, percent: f64) -> Result<u64, AppError> {
        let line = self.entry(handle, "set duty")?;
        let mut line = line.lock();
        line.ensure("set duty", LineMode::Pwm)?;
        let id = line.id;
        let pwm = line.pwm.as_mut().ok_or(AppError::NotReady {
            line: id,
            op: "set duty",
        })?;
        let duty = pwm.set_duty_percent(percent, self.backend.as_ref())?;
        debug!("line {id} duty {percent}% -> {duty} ns");
        Ok(duty)
    }

    /// Absolute update of a PWM line, clamped to the duty range.
    pub async fn set_duty_nanos(&self, handle: LineHandle, nanos: u64) -> Result<u64, AppError> {
        let line = self.entry(handle, "set duty")?;
        let mut line = line.lock();
        line.ensure("set duty", LineMode::Pwm)?;
        let id = line.id;
        let pwm = line.pwm.as_mut().ok_or(AppError::NotReady {
            line: id,
            op: "set duty",
        })?;
        pwm.set_duty_nanos(nanos, self.backend.as_ref())
    }

    /// Releases the line. Closing an already closed handle only warns.
    pub async fn close(&self, handle: LineHandle) -> Result<(), AppError> {
        let mut registry = self.registry.write();
        let current = registry
            .lines
            .get(&handle.line)
            .is_some_and(|e| e.serial == handle.serial);
        let entry = if current {
            registry.lines.remove(&handle.line)
        } else {
            None
        };
        let Some(entry) = entry else {
            warn!("line {} is already closed", handle.line);
            return Ok(());
        };

        let mut line = entry.line.lock();
        let result = self.teardown(&mut line);
        info!("line {} is closed", line.id);
        result
    }

    fn teardown(&self, line: &mut Line) -> Result<(), AppError> {
        line.cancel_reversal();
        if let Some(mut monitor) = line.monitor.take()
            && monitor.unsubscribe()
        {
            info!("line {} monitoring stopped", line.id);
        }
        let result = match line.pwm.as_mut() {
            Some(pwm) => pwm.stop(self.backend.as_ref()),
            None => Ok(()),
        };
        line.status = LineStatus::Closed;
        result
    }

    /// Closes every allocated line and returns how many were released.
    pub async fn close_all(&self) -> usize {
        let handles: Vec<LineHandle> = self
            .registry
            .read()
            .lines
            .iter()
            .map(|(id, e)| LineHandle {
                line: *id,
                serial: e.serial,
            })
            .collect();

        let count = handles.len();
        for handle in handles {
            if let Err(e) = self.close(handle).await {
                warn!("line {} closed with error: {e}", handle.line);
            }
        }
        info!("{count} line(s) closed");
        count
    }

    pub fn descriptor(&self, id: u32) -> Result<LineDescriptor, AppError> {
        self.ensure_known(id)?;
        let registry = self.registry.read();
        if let Some(entry) = registry.lines.get(&id) {
            return Ok(entry.line.lock().descriptor());
        }
        let status = if registry.reserved.contains(&id) {
            LineStatus::Allocated
        } else {
            LineStatus::Free
        };
        Ok(LineDescriptor::free(id, status))
    }

    /// Descriptors of all allocated lines, by id.
    pub fn list(&self) -> Vec<LineDescriptor> {
        let registry = self.registry.read();
        let mut lines: Vec<LineDescriptor> = registry
            .lines
            .values()
            .map(|e| e.line.lock().descriptor())
            .collect();
        lines.sort_by_key(|d| d.line);
        lines
    }
}
