//! Sysfs PWM channel control.
//!
//! A channel goes through export, configuration and enable exactly once when
//! its line is allocated. Any failure after the export leaves the channel
//! disabled and unexported again before the error is reported.

use log::{info, warn};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::FileWriter;
use crate::error::AppError;

pub const MIN_PERIOD_NS: u64 = 100;
pub const MAX_PERIOD_NS: u64 = 1_000_000_000;
pub const DEFAULT_EXPORT_SETTLE_MS: u64 = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    #[default]
    Micros,
    Nanos,
}

impl TimeUnit {
    pub fn to_nanos(self, value: u64) -> u64 {
        match self {
            TimeUnit::Micros => value.saturating_mul(1000),
            TimeUnit::Nanos => value,
        }
    }
}

/// PWM request as given by the caller, in `unit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PwmOptions {
    pub period: u64,
    pub duty_min: u64,
    pub duty_max: u64,
    pub unit: TimeUnit,
    /// Delay between export and the first write to the channel files.
    /// Slower boards need more.
    pub export_settle_ms: u64,
}

impl Default for PwmOptions {
    fn default() -> Self {
        // 50 Hz, full duty range
        Self {
            period: 20_000,
            duty_min: 0,
            duty_max: 20_000,
            unit: TimeUnit::Micros,
            export_settle_ms: DEFAULT_EXPORT_SETTLE_MS,
        }
    }
}

/// Validated timings in nanoseconds with `floor <= ceiling <= period`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PwmTimings {
    pub period_ns: u64,
    pub floor_ns: u64,
    pub ceiling_ns: u64,
}

impl PwmTimings {
    pub fn normalize(line: u32, opts: &PwmOptions) -> Result<Self, AppError> {
        let period_ns = opts.unit.to_nanos(opts.period);
        if !(MIN_PERIOD_NS..=MAX_PERIOD_NS).contains(&period_ns) {
            return Err(AppError::PeriodOutOfRange {
                line,
                requested: period_ns,
                min: MIN_PERIOD_NS,
                max: MAX_PERIOD_NS,
            });
        }

        let floor_ns = opts.unit.to_nanos(opts.duty_min);
        let ceiling_ns = opts.unit.to_nanos(opts.duty_max).min(period_ns);
        if floor_ns > ceiling_ns {
            return Err(AppError::PwmInitFailed {
                line,
                reason: format!("duty floor {floor_ns} ns is above duty ceiling {ceiling_ns} ns"),
            });
        }

        Ok(Self {
            period_ns,
            floor_ns,
            ceiling_ns,
        })
    }

    /// Duty for a percentage of the floor..ceiling span.
    pub fn duty_for_percent(&self, percent: f64) -> u64 {
        let span = (self.ceiling_ns - self.floor_ns) as f64;
        self.floor_ns + (percent / 100.0 * span).round() as u64
    }
}

/// Extracts the channel index from a descriptor such as `pwm0_chan2`.
pub fn channel_from_config(line: u32, descriptor: &str) -> Result<u8, AppError> {
    if !descriptor.contains("pwm") {
        return Err(AppError::PwmInitFailed {
            line,
            reason: format!("line is not set up as PWM (configuration '{descriptor}')"),
        });
    }
    descriptor
        .chars()
        .last()
        .and_then(|c| c.to_digit(10))
        .map(|d| d as u8)
        .ok_or_else(|| AppError::PwmInitFailed {
            line,
            reason: format!("no channel index in configuration '{descriptor}'"),
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PwmState {
    Unexported,
    Exporting,
    Disabled,
    Enabled,
    Disabling,
}

#[derive(Debug, Clone, Serialize)]
pub struct PwmInfo {
    pub channel: u8,
    pub period_ns: u64,
    pub floor_ns: u64,
    pub ceiling_ns: u64,
    pub duty_ns: u64,
    pub exported: bool,
    pub enabled: bool,
    pub state: PwmState,
}

#[derive(Debug)]
pub struct PwmChannel {
    line: u32,
    chip_path: String,
    channel: u8,
    timings: PwmTimings,
    duty_ns: u64,
    exported: bool,
    enabled: bool,
    state: PwmState,
}

/// An export whose configuration has not happened yet.
struct PendingExport<'a, W: FileWriter + ?Sized> {
    pwm: &'a PwmChannel,
    files: &'a W,
    armed: bool,
}

impl<W: FileWriter + ?Sized> PendingExport<'_, W> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<W: FileWriter + ?Sized> Drop for PendingExport<'_, W> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let pwm = self.pwm;
        warn!(
            "pwm start on line {} abandoned while settling, unexporting channel {}",
            pwm.line, pwm.channel
        );
        if let Err(e) = self
            .files
            .write_text(&pwm.chip_file("unexport"), &pwm.channel.to_string())
        {
            warn!("pwm unexport failed on line {}: {e}", pwm.line);
        }
    }
}

impl PwmChannel {
    /// Exports, configures and enables the channel. Duty starts at the floor.
    pub async fn start<W: FileWriter + ?Sized>(
        line: u32,
        chip_path: &str,
        channel: u8,
        timings: PwmTimings,
        export_settle_ms: u64,
        files: &W,
    ) -> Result<Self, AppError> {
        let mut pwm = Self {
            line,
            chip_path: chip_path.trim_end_matches('/').to_string(),
            channel,
            timings,
            duty_ns: timings.floor_ns,
            exported: false,
            enabled: false,
            state: PwmState::Unexported,
        };
        info!(
            "line {line} pwm channel {channel} (period, floor, ceiling): {} {} {} ns",
            timings.period_ns, timings.floor_ns, timings.ceiling_ns
        );

        pwm.state = PwmState::Exporting;
        if let Err(e) = files.write_text(&pwm.chip_file("export"), &channel.to_string()) {
            pwm.state = PwmState::Unexported;
            return Err(AppError::PwmInitFailed {
                line,
                reason: format!("export failed: {e}"),
            });
        }
        pwm.exported = true;
        pwm.state = PwmState::Disabled;

        if export_settle_ms > 0 {
            // unexports again if this future is dropped while settling
            let pending = PendingExport {
                pwm: &pwm,
                files,
                armed: true,
            };
            tokio::time::sleep(Duration::from_millis(export_settle_ms)).await;
            pending.disarm();
        }

        if let Err(e) = pwm.configure(files) {
            warn!("pwm start error on line {line}: {e}");
            warn!("consider increasing export_settle_ms for this device");
            if let Err(stop_err) = pwm.stop(files) {
                warn!("pwm teardown after failed start on line {line}: {stop_err}");
            }
            return Err(AppError::PwmInitFailed {
                line,
                reason: e.to_string(),
            });
        }

        Ok(pwm)
    }

    fn configure<W: FileWriter + ?Sized>(&mut self, files: &W) -> Result<(), AppError> {
        files.write_text(
            &self.channel_file("period"),
            &self.timings.period_ns.to_string(),
        )?;
        files.write_text(
            &self.channel_file("duty_cycle"),
            &self.timings.floor_ns.to_string(),
        )?;
        self.duty_ns = self.timings.floor_ns;
        files.write_text(&self.channel_file("enable"), "1")?;
        self.enabled = true;
        self.state = PwmState::Enabled;
        Ok(())
    }

    fn ensure_ready(&self, op: &'static str) -> Result<(), AppError> {
        if self.exported && self.enabled {
            Ok(())
        } else {
            Err(AppError::NotReady {
                line: self.line,
                op,
            })
        }
    }

    /// Strict update: rejects anything outside 0..=100.
    pub fn set_duty_percent<W: FileWriter + ?Sized>(
        &mut self,
        percent: f64,
        files: &W,
    ) -> Result<u64, AppError> {
        if !percent.is_finite() || !(0.0..=100.0).contains(&percent) {
            return Err(AppError::InvalidPercent {
                line: self.line,
                requested: percent,
            });
        }
        self.ensure_ready("set duty")?;

        let duty = self.timings.duty_for_percent(percent);
        self.write_duty(duty, files)?;
        Ok(duty)
    }

    /// Permissive update: out-of-range requests are clamped to floor/ceiling.
    pub fn set_duty_nanos<W: FileWriter + ?Sized>(
        &mut self,
        nanos: u64,
        files: &W,
    ) -> Result<u64, AppError> {
        self.ensure_ready("set duty")?;

        let PwmTimings {
            floor_ns,
            ceiling_ns,
            ..
        } = self.timings;
        let duty = nanos.clamp(floor_ns, ceiling_ns);
        if duty != nanos {
            warn!(
                "duty cycle {nanos} ns on line {} forced to {duty} ns (allowed {floor_ns}-{ceiling_ns} ns)",
                self.line
            );
        }
        self.write_duty(duty, files)?;
        Ok(duty)
    }

    fn write_duty<W: FileWriter + ?Sized>(&mut self, duty: u64, files: &W) -> Result<(), AppError> {
        files.write_text(&self.channel_file("duty_cycle"), &duty.to_string())?;
        self.duty_ns = duty;
        Ok(())
    }

    /// Disables then unexports, skipping whichever step is already done.
    /// Both steps are attempted; the first failure is returned.
    pub fn stop<W: FileWriter + ?Sized>(&mut self, files: &W) -> Result<(), AppError> {
        let mut first_err = None;
        self.state = PwmState::Disabling;

        if self.enabled {
            match files.write_text(&self.channel_file("enable"), "0") {
                Ok(()) => self.enabled = false,
                Err(e) => {
                    warn!("pwm disable failed on line {}: {e}", self.line);
                    first_err.get_or_insert(e);
                }
            }
        }

        if self.exported {
            match files.write_text(&self.chip_file("unexport"), &self.channel.to_string()) {
                Ok(()) => {
                    self.exported = false;
                    // the channel files are gone with the export
                    self.enabled = false;
                }
                Err(e) => {
                    warn!("pwm unexport failed on line {}: {e}", self.line);
                    first_err.get_or_insert(e);
                }
            }
        }

        self.state = match (self.exported, self.enabled) {
            (false, _) => PwmState::Unexported,
            (true, false) => PwmState::Disabled,
            (true, true) => PwmState::Enabled,
        };
        first_err.map_or(Ok(()), Err)
    }

    pub fn duty_ns(&self) -> u64 {
        self.duty_ns
    }

    pub fn is_exported(&self) -> bool {
        self.exported
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn state(&self) -> PwmState {
        self.state
    }

    pub fn info(&self) -> PwmInfo {
        PwmInfo {
            channel: self.channel,
            period_ns: self.timings.period_ns,
            floor_ns: self.timings.floor_ns,
            ceiling_ns: self.timings.ceiling_ns,
            duty_ns: self.duty_ns,
            exported: self.exported,
            enabled: self.enabled,
            state: self.state,
        }
    }

    fn chip_file(&self, name: &str) -> String {
        format!("{}/{name}", self.chip_path)
    }

    fn channel_file(&self, name: &str) -> String {
        format!("{}/pwm{}/{name}", self.chip_path, self.channel)
    }
}
