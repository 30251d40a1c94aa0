//! Argument shapes and output parsing for the two generations of the
//! libgpiod command-line tools.
//!
//! The dialect is resolved once at startup and never re-examined, so every
//! call site works with plain functions instead of version strings.

use serde::{Deserialize, Serialize};

use crate::config::Bias;
use crate::monitor::Edge;

pub const SET_PROGRAM: &str = "gpioset";
pub const GET_PROGRAM: &str = "gpioget";
pub const MONITOR_PROGRAM: &str = "gpiomon";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// libgpiod 1.x: chip plus numeric offsets.
    V1,
    /// libgpiod 2.x: `GPIO<n>` line names.
    V2,
}

/// One transition as reported by the monitoring tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEvent {
    pub line: u32,
    pub edge: Edge,
    pub tool_timestamp_ms: Option<u64>,
}

impl Dialect {
    /// Picks the dialect from a version string such as `v1.6.3` or `2.2.1`.
    pub fn from_version(version: &str) -> Option<Self> {
        let digits = version.trim().trim_start_matches(['v', 'V']);
        let major = digits.split('.').next()?;
        match major.parse::<u32>().ok()? {
            1 => Some(Dialect::V1),
            2 => Some(Dialect::V2),
            _ => None,
        }
    }

    pub fn set_args(self, chip: &str, line: u32, bias: Bias, value: u8) -> Vec<String> {
        let mut args = bias_args(bias);
        match self {
            Dialect::V1 => {
                args.push(chip.to_string());
                args.push(format!("{line}={value}"));
            }
            Dialect::V2 => {
                // -t0 makes gpioset exit right after driving the line
                args.push("-t0".into());
                args.push("-c".into());
                args.push(chip.to_string());
                args.push(format!("{}={value}", line_name(line)));
            }
        }
        args
    }

    pub fn get_args(self, chip: &str, line: u32, bias: Bias) -> Vec<String> {
        let mut args = bias_args(bias);
        match self {
            Dialect::V1 => {
                args.push(chip.to_string());
                args.push(line.to_string());
            }
            Dialect::V2 => {
                args.push("--numeric".into());
                args.push("-c".into());
                args.push(chip.to_string());
                args.push(line_name(line));
            }
        }
        args
    }

    pub fn monitor_args(self, chip: &str, lines: &[u32], bias: Bias) -> Vec<String> {
        let mut args = bias_args(bias);
        match self {
            Dialect::V1 => {
                args.push("-b".into());
                args.push("--format=%o %e %s %n".into());
                args.push(chip.to_string());
                args.extend(lines.iter().map(u32::to_string));
            }
            Dialect::V2 => {
                args.push("-c".into());
                args.push(chip.to_string());
                args.extend(lines.iter().copied().map(line_name));
            }
        }
        args
    }

    /// Parses one output line of the monitoring tool.
    pub fn parse_event(self, text: &str) -> Option<RawEvent> {
        let mut tokens = text.split_whitespace();
        match self {
            Dialect::V1 => {
                let line = tokens.next()?.parse::<u32>().ok()?;
                let edge = parse_edge(tokens.next()?)?;
                let tool_timestamp_ms = match (tokens.next(), tokens.next()) {
                    (Some(sec), Some(nsec)) => {
                        let sec = sec.parse::<u64>().ok()?;
                        let nsec = nsec.parse::<u64>().ok()?;
                        Some(sec.saturating_mul(1000).saturating_add(nsec / 1_000_000))
                    }
                    _ => None,
                };
                Some(RawEvent {
                    line,
                    edge,
                    tool_timestamp_ms,
                })
            }
            Dialect::V2 => {
                let timestamp = tokens.next()?;
                let edge = parse_edge(tokens.next()?)?;
                let line = parse_line_token(tokens.next()?)?;
                Some(RawEvent {
                    line,
                    edge,
                    tool_timestamp_ms: parse_seconds(timestamp),
                })
            }
        }
    }
}

fn bias_args(bias: Bias) -> Vec<String> {
    match bias {
        Bias::Disable => Vec::new(),
        other => vec![format!("--bias={}", other.as_str())],
    }
}

fn line_name(line: u32) -> String {
    format!("GPIO{line}")
}

fn parse_edge(token: &str) -> Option<Edge> {
    match token {
        "1" | "rising" | "RISING" => Some(Edge::Rising),
        "0" | "falling" | "FALLING" => Some(Edge::Falling),
        _ => None,
    }
}

fn parse_line_token(token: &str) -> Option<u32> {
    let token = token.trim_matches('"');
    token
        .strip_prefix("GPIO")
        .unwrap_or(token)
        .parse::<u32>()
        .ok()
}

fn parse_seconds(token: &str) -> Option<u64> {
    let (sec, frac) = token.split_once('.').unwrap_or((token, ""));
    let sec = sec.parse::<u64>().ok()?;
    let millis = frac
        .chars()
        .chain(std::iter::repeat('0'))
        .take(3)
        .collect::<String>()
        .parse::<u64>()
        .ok()?;
    Some(sec.saturating_mul(1000).saturating_add(millis))
}
