use log::{debug, warn};
use std::fs;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::runtime::Handle;
use tokio::sync::oneshot;

use super::{CapabilityProbe, CommandExecutor, FileWriter, OutputSink, ProcessHandle, ProcessOutput};
use crate::error::AppError;

const CPUINFO_PATH: &str = "/proc/cpuinfo";
const OS_RELEASE_PATH: &str = "/etc/os-release";

/// Talks to the real board: libgpiod tools, `pinctrl` and sysfs.
#[derive(Default)]
pub struct SystemBackend {
    cpuinfo: OnceLock<String>,
}

impl SystemBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn cpuinfo(&self) -> &str {
        self.cpuinfo.get_or_init(|| {
            fs::read_to_string(CPUINFO_PATH).unwrap_or_else(|e| {
                warn!("cannot read {CPUINFO_PATH}: {e}");
                String::new()
            })
        })
    }
}

struct ChildProcess {
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    running: Arc<AtomicBool>,
}

impl ProcessHandle for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn terminate(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn forward_lines<R>(reader: R, sink: OutputSink, wrap: fn(String) -> ProcessOutput)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => sink(wrap(line)),
                Ok(None) => break,
                Err(e) => {
                    warn!("subprocess output read error: {e}");
                    break;
                }
            }
        }
    });
}

impl CommandExecutor for SystemBackend {
    fn run_sync(&self, program: &str, args: &[String]) -> Result<String, AppError> {
        debug!("exec {program} {}", args.join(" "));
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| AppError::ExternalCommandFailed {
                program: program.to_string(),
                line: None,
                reason: format!("could not start: {e}"),
            })?;

        if !output.status.success() {
            return Err(AppError::ExternalCommandFailed {
                program: program.to_string(),
                line: None,
                reason: format!(
                    "exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn spawn(
        &self,
        program: &str,
        args: &[String],
        sink: OutputSink,
    ) -> Result<Box<dyn ProcessHandle>, AppError> {
        let spawn_err = |reason: String| AppError::ExternalCommandFailed {
            program: program.to_string(),
            line: None,
            reason,
        };
        Handle::try_current().map_err(|e| spawn_err(format!("no runtime: {e}")))?;

        debug!("spawn {program} {}", args.join(" "));
        let mut child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_err(format!("could not start: {e}")))?;

        let pid = child.id();
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, sink.clone(), ProcessOutput::Stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, sink.clone(), ProcessOutput::Stderr);
        }

        let running = Arc::new(AtomicBool::new(true));
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        {
            let running = running.clone();
            let program = program.to_string();
            tokio::spawn(async move {
                let status = tokio::select! {
                    status = child.wait() => status,
                    _ = kill_rx => {
                        if let Err(e) = child.start_kill() {
                            warn!("cannot signal {program}: {e}");
                        }
                        child.wait().await
                    }
                };
                running.store(false, Ordering::Relaxed);
                let code = match status {
                    Ok(s) => s.code(),
                    Err(e) => {
                        warn!("wait for {program} failed: {e}");
                        None
                    }
                };
                sink(ProcessOutput::Exited(code));
            });
        }

        Ok(Box::new(ChildProcess {
            pid,
            kill_tx: Some(kill_tx),
            running,
        }))
    }
}

impl FileWriter for SystemBackend {
    fn write_text(&self, path: &str, content: &str) -> Result<(), AppError> {
        debug!("write {content:?} to {path}");
        fs::write(path, content).map_err(|e| AppError::FileWrite {
            path: path.to_string(),
            reason: e.to_string(),
        })
    }
}

impl CapabilityProbe for SystemBackend {
    fn model(&self) -> Option<String> {
        let cpuinfo = self.cpuinfo();
        if !cpuinfo.to_lowercase().contains("raspberry pi") {
            return None;
        }
        cpuinfo
            .lines()
            .find(|l| l.starts_with("Model"))
            .and_then(|l| l.split_once(':'))
            .map(|(_, model)| model.trim().to_string())
    }

    fn os_codename(&self) -> Option<String> {
        let release = fs::read_to_string(OS_RELEASE_PATH).ok()?;
        parse_os_codename(&release)
    }

    fn tool_version(&self) -> Option<String> {
        let out = self
            .run_sync("gpiodetect", &["-v".to_string()])
            .map_err(|e| warn!("{e}"))
            .ok()?;
        parse_tool_version(&out)
    }

    fn line_config(&self, line: u32) -> Result<String, AppError> {
        let out = self.run_sync("pinctrl", &["get".to_string(), line.to_string()])?;
        Ok(parse_pinctrl(&out))
    }
}

fn parse_os_codename(release: &str) -> Option<String> {
    let codename = release.lines().find_map(|l| {
        let (key, value) = l.split_once('=')?;
        (key.trim() == "VERSION_CODENAME").then(|| value.trim().trim_matches('"').to_string())
    })?;
    let mut chars = codename.chars();
    let first = chars.next()?;
    Some(first.to_uppercase().chain(chars).collect())
}

/// `gpiodetect (libgpiod) v1.6.3` -> `v1.6.3`
fn parse_tool_version(out: &str) -> Option<String> {
    out.lines()
        .next()?
        .split_whitespace()
        .last()
        .map(str::to_string)
}

/// `18: a3 pd | lo // GPIO18 = PWM0_CHAN2` -> `pwm0_chan2`
fn parse_pinctrl(out: &str) -> String {
    out.split_whitespace()
        .last()
        .unwrap_or_default()
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codename_is_capitalized() {
        let release = "PRETTY_NAME=\"Debian GNU/Linux 12 (bookworm)\"\nVERSION_ID=\"12\"\nVERSION_CODENAME=bookworm\n";
        assert_eq!(parse_os_codename(release).as_deref(), Some("Bookworm"));
        assert_eq!(parse_os_codename("ID=debian\n"), None);
    }

    #[test]
    fn tool_version_is_last_token_of_first_line() {
        let out = "gpiodetect (libgpiod) v2.2.1\nCopyright (C) 2017-2023 Bartosz Golaszewski\n";
        assert_eq!(parse_tool_version(out).as_deref(), Some("v2.2.1"));
    }

    #[test]
    fn pinctrl_descriptor_is_lowercased_last_token() {
        assert_eq!(
            parse_pinctrl("18: a3 pd | lo // GPIO18 = PWM0_CHAN2\n"),
            "pwm0_chan2"
        );
        assert_eq!(parse_pinctrl(""), "");
    }

    #[test]
    fn failing_program_reports_start_error() {
        let backend = SystemBackend::new();
        let err = backend
            .run_sync("riomgr-definitely-missing-program", &[])
            .unwrap_err();
        assert!(matches!(err, AppError::ExternalCommandFailed { .. }));
    }
}
