use std::{collections::HashSet, fmt, fs, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::dialect::Dialect;
use crate::error::AppError;

pub const DEFAULT_CHIP: &str = "gpiochip0";
pub const DEFAULT_PWM_CHIP_PATH: &str = "/sys/class/pwm/pwmchip0";

const RPI_STANDARD_LINES: [u32; 13] = [4, 5, 6, 16, 17, 20, 21, 22, 23, 24, 25, 26, 27];
const RPI_PWM_LINES: [u32; 4] = [12, 13, 18, 19];

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HttpConfig {
    pub unix_socket: Option<String>,
    pub host: Option<String>,
    pub path: String,
    pub timeout: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            unix_socket: None,
            host: Some("127.0.0.1:8080".into()),
            path: "/api/v1".into(),
            timeout: 30,
        }
    }
}

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum LineMode {
    Output,
    Input,
    Pwm,
}

impl fmt::Display for LineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LineMode::Output => "output",
            LineMode::Input => "input",
            LineMode::Pwm => "pwm",
        })
    }
}

#[derive(Debug, Default, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Bias {
    #[default]
    Disable,
    PullUp,
    PullDown,
}

impl Bias {
    pub fn as_str(&self) -> &'static str {
        match self {
            Bias::Disable => "disable",
            Bias::PullUp => "pull-up",
            Bias::PullDown => "pull-down",
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeDetect {
    #[default]
    #[serde(alias = "none")]
    Stop,
    Rising,
    Falling,
    Both,
}

impl FromStr for EdgeDetect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stop" | "none" => Ok(EdgeDetect::Stop),
            "rising" => Ok(EdgeDetect::Rising),
            "falling" => Ok(EdgeDetect::Falling),
            "both" => Ok(EdgeDetect::Both),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LineSets {
    pub standard: HashSet<u32>,
    pub pwm: HashSet<u32>,
}

impl Default for LineSets {
    fn default() -> Self {
        Self {
            standard: RPI_STANDARD_LINES.into_iter().collect(),
            pwm: RPI_PWM_LINES.into_iter().collect(),
        }
    }
}

impl LineSets {
    /// PWM mode needs a PWM-capable line, digital modes accept any known line.
    pub fn supports(&self, line: u32, mode: LineMode) -> bool {
        match mode {
            LineMode::Pwm => self.pwm.contains(&line),
            LineMode::Output | LineMode::Input => {
                self.standard.contains(&line) || self.pwm.contains(&line)
            }
        }
    }

    pub fn all(&self) -> impl Iterator<Item = u32> + '_ {
        self.standard.iter().chain(self.pwm.iter()).copied()
    }
}

fn default_chip() -> String {
    DEFAULT_CHIP.into()
}

fn default_pwm_chip_path() -> String {
    DEFAULT_PWM_CHIP_PATH.into()
}

fn default_broadcast_capacity() -> usize {
    256
}

fn default_event_history_capacity() -> usize {
    64
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default = "default_chip")]
    pub chip: String,
    #[serde(default = "default_pwm_chip_path")]
    pub pwm_chip_path: String,
    #[serde(default)]
    pub lines: LineSets,
    /// Forces a tool dialect instead of detecting it from `gpiodetect -v`.
    #[serde(default)]
    pub dialect: Option<Dialect>,
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
    #[serde(default = "default_event_history_capacity")]
    pub event_history_capacity: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            chip: default_chip(),
            pwm_chip_path: default_pwm_chip_path(),
            lines: LineSets::default(),
            dialect: None,
            broadcast_capacity: default_broadcast_capacity(),
            event_history_capacity: default_event_history_capacity(),
        }
    }
}

impl AppConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, AppError> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| AppError::Config(format!("Failed to read config: {e}")))?;
        serde_json::from_str(&contents)
            .map_err(|e| AppError::Config(format!("Invalid config json: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pwm_mode_requires_pwm_capable_line() {
        let sets = LineSets::default();
        assert!(sets.supports(18, LineMode::Pwm));
        assert!(!sets.supports(17, LineMode::Pwm));
        assert!(sets.supports(18, LineMode::Input));
        assert!(sets.supports(17, LineMode::Output));
        assert!(!sets.supports(3, LineMode::Output));
    }

    #[test]
    fn minimal_config_fills_defaults() {
        let cfg: AppConfig = serde_json::from_str(r#"{ "chip": "gpiochip4" }"#).unwrap();
        assert_eq!(cfg.chip, "gpiochip4");
        assert_eq!(cfg.pwm_chip_path, DEFAULT_PWM_CHIP_PATH);
        assert!(cfg.dialect.is_none());
        assert_eq!(cfg.lines.pwm.len(), 4);
    }

    #[test]
    fn edge_parsing_rejects_unknown_names() {
        assert_eq!("both".parse::<EdgeDetect>(), Ok(EdgeDetect::Both));
        assert_eq!("sideways".parse::<EdgeDetect>(), Err("sideways".to_string()));
    }
}
