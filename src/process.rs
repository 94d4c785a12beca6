//! Subprocess plumbing and control of the supervised nginx process
//!
//! Every external call is bounded by a timeout and can be cancelled through a
//! `watch::Receiver<bool>` that flips to `true` on shutdown.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, SystemTime};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::NginxConfig;
use crate::error::{CommandError, ProcessError};

/// A command line with an optional `{config}` placeholder
#[derive(Debug, Clone)]
pub struct CommandTemplate {
    program: String,
    args: Vec<String>,
}

impl CommandTemplate {
    /// Split a command line using shell word rules
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let mut words =
            shell_words::split(line).map_err(|e| CommandError::Template(e.to_string()))?;
        if words.is_empty() {
            return Err(CommandError::Template("command is empty".to_string()));
        }
        let program = words.remove(0);
        Ok(Self {
            program,
            args: words,
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn references_config(&self) -> bool {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .any(|w| w.contains("{config}"))
    }

    /// Build a command with `{config}` replaced by `config`
    pub fn command(&self, config: &Path) -> Command {
        let path = config.to_string_lossy();
        let mut cmd = Command::new(self.program.replace("{config}", &path));
        cmd.args(self.args.iter().map(|a| a.replace("{config}", &path)));
        cmd
    }
}

/// Captured result of a finished subprocess
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// stderr followed by stdout, trimmed. nginx writes its diagnostics to
    /// stderr but wrappers sometimes use stdout.
    pub fn diagnostics(&self) -> String {
        let stderr = self.stderr.trim();
        let stdout = self.stdout.trim();
        let text = match (stderr.is_empty(), stdout.is_empty()) {
            (false, false) => format!("{}\n{}", stderr, stdout),
            (false, true) => stderr.to_string(),
            (true, false) => stdout.to_string(),
            (true, true) => String::new(),
        };
        if text.is_empty() {
            match self.code {
                Some(code) => format!("exited with status {}", code),
                None => "terminated by signal".to_string(),
            }
        } else {
            text
        }
    }
}

/// A receiver that never reports cancellation
pub fn never_cancel() -> watch::Receiver<bool> {
    watch::channel(false).1
}

/// Resolves once `cancel` reads `true`. A dropped sender never cancels.
pub async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Run `cmd` to completion, killing it on timeout or cancellation
pub async fn run_bounded(
    mut cmd: Command,
    program: &str,
    timeout: Duration,
    cancel: &mut watch::Receiver<bool>,
) -> Result<CommandOutput, CommandError> {
    if *cancel.borrow() {
        return Err(CommandError::Cancelled {
            program: program.to_string(),
        });
    }

    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let child = cmd.spawn().map_err(|source| CommandError::Io {
        program: program.to_string(),
        source,
    })?;
    debug!(program, pid = ?child.id(), "Spawned subprocess");

    tokio::select! {
        result = tokio::time::timeout(timeout, child.wait_with_output()) => match result {
            Ok(Ok(output)) => Ok(CommandOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }),
            Ok(Err(source)) => Err(CommandError::Io {
                program: program.to_string(),
                source,
            }),
            Err(_) => Err(CommandError::Timeout {
                program: program.to_string(),
                timeout,
            }),
        },
        _ = cancelled(cancel) => Err(CommandError::Cancelled {
            program: program.to_string(),
        }),
    }
}

/// Counters from nginx's stub_status page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StubStatus {
    pub active_connections: u64,
    pub accepts: u64,
    pub handled: u64,
    pub requests: u64,
    pub reading: u64,
    pub writing: u64,
    pub waiting: u64,
}

/// Operational status of the running nginx
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NginxStatus {
    pub active_connections: u64,
    pub accepts: u64,
    pub handled: u64,
    pub requests: u64,
    pub reading: u64,
    pub writing: u64,
    pub waiting: u64,
    /// Seconds since the master process wrote its pid file
    pub uptime_secs: Option<u64>,
    /// Human form of `uptime_secs`, e.g. "5 days, 3 hours"
    pub uptime: Option<String>,
}

/// Parse the plain-text stub_status format:
///
/// ```text
/// Active connections: 291
/// server accepts handled requests
///  16630948 16630948 31070465
/// Reading: 6 Writing: 179 Waiting: 106
/// ```
pub fn parse_stub_status(body: &str) -> Result<StubStatus, String> {
    let mut status = StubStatus::default();
    let mut lines = body.lines().map(str::trim).filter(|l| !l.is_empty());

    let active = lines.next().ok_or("empty status body")?;
    let active = active
        .strip_prefix("Active connections:")
        .ok_or_else(|| format!("unexpected status line: {}", active))?;
    status.active_connections = parse_counter(active)?;

    let header = lines.next().ok_or("missing counters header")?;
    if header != "server accepts handled requests" {
        return Err(format!("unexpected counters header: {}", header));
    }

    let counters: Vec<&str> = lines
        .next()
        .ok_or("missing counters")?
        .split_whitespace()
        .collect();
    if counters.len() != 3 {
        return Err(format!("expected 3 counters, found {}", counters.len()));
    }
    status.accepts = parse_counter(counters[0])?;
    status.handled = parse_counter(counters[1])?;
    status.requests = parse_counter(counters[2])?;

    let states: Vec<&str> = lines
        .next()
        .ok_or("missing connection states")?
        .split_whitespace()
        .collect();
    if states.len() != 6 {
        return Err("malformed connection states".to_string());
    }
    for pair in states.chunks(2) {
        let value = parse_counter(pair[1])?;
        match pair[0] {
            "Reading:" => status.reading = value,
            "Writing:" => status.writing = value,
            "Waiting:" => status.waiting = value,
            other => return Err(format!("unknown connection state: {}", other)),
        }
    }

    Ok(status)
}

fn parse_counter(raw: &str) -> Result<u64, String> {
    raw.trim()
        .parse()
        .map_err(|_| format!("invalid counter: {}", raw.trim()))
}

/// Format a duration the way operators read it: the two most significant
/// units, e.g. "5 days, 3 hours" or "42 seconds".
pub fn format_uptime(secs: u64) -> String {
    let units = [
        (secs / 86_400, "day"),
        ((secs % 86_400) / 3_600, "hour"),
        ((secs % 3_600) / 60, "minute"),
        (secs % 60, "second"),
    ];

    let parts: Vec<String> = units
        .iter()
        .skip_while(|(n, _)| *n == 0)
        .take(2)
        .filter(|(n, _)| *n > 0)
        .map(|(n, unit)| format!("{} {}{}", n, unit, if *n == 1 { "" } else { "s" }))
        .collect();

    if parts.is_empty() {
        "0 seconds".to_string()
    } else {
        parts.join(", ")
    }
}

#[cfg(unix)]
fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // Signal 0 only checks existence; EPERM still means the process exists
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_alive(_pid: i32) -> bool {
    true
}

/// Sends reload commands to nginx and reads its status surface
pub struct ProcessController {
    reload_command: CommandTemplate,
    config_path: PathBuf,
    pid_file: Option<PathBuf>,
    status_url: Option<String>,
    reload_timeout: Duration,
    poll_interval: Duration,
    client: reqwest::Client,
}

impl ProcessController {
    pub fn new(config: &NginxConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()?;

        Ok(Self {
            reload_command: CommandTemplate::parse(&config.reload_command)?,
            config_path: config.config_path(),
            pid_file: config.pid_file.as_ref().map(PathBuf::from),
            status_url: config.status_url.clone(),
            reload_timeout: config.reload_timeout(),
            poll_interval: config.ack_poll_interval(),
            client,
        })
    }

    /// Issue the reload command and wait for nginx to acknowledge it:
    /// the master process is still alive and the status endpoint answers.
    /// The whole operation is bounded by the reload timeout.
    pub async fn reload(&self, cancel: &mut watch::Receiver<bool>) -> Result<(), ProcessError> {
        let started = Instant::now();
        let deadline = started + self.reload_timeout;

        info!(command = self.reload_command.program(), "Reloading nginx");
        let output = run_bounded(
            self.reload_command.command(&self.config_path),
            self.reload_command.program(),
            self.reload_timeout,
            cancel,
        )
        .await?;

        if !output.success() {
            return Err(ProcessError::ReloadFailed {
                detail: output.diagnostics(),
            });
        }

        self.await_acknowledgement(deadline, cancel).await?;
        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "Reload acknowledged");
        Ok(())
    }

    async fn await_acknowledgement(
        &self,
        deadline: Instant,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), ProcessError> {
        loop {
            let probed = tokio::select! {
                probed = tokio::time::timeout_at(deadline, self.probe()) => probed,
                _ = cancelled(cancel) => {
                    return Err(ProcessError::Command(CommandError::Cancelled {
                        program: "reload acknowledgement".to_string(),
                    }));
                }
            };

            let detail = match probed {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(detail)) => detail,
                Err(_) => "status endpoint did not answer before the deadline".to_string(),
            };

            if Instant::now() + self.poll_interval > deadline {
                warn!(detail = %detail, "nginx did not acknowledge reload");
                return Err(ProcessError::NotAcknowledged {
                    timeout: self.reload_timeout,
                    detail,
                });
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = cancelled(cancel) => {
                    return Err(ProcessError::Command(CommandError::Cancelled {
                        program: "reload acknowledgement".to_string(),
                    }));
                }
            }
        }
    }

    async fn probe(&self) -> Result<(), String> {
        if let Some(pid_file) = &self.pid_file {
            let pid = read_pid(pid_file).await?;
            if !pid_alive(pid) {
                return Err(format!("master process {} is not running", pid));
            }
        }

        if let Some(url) = &self.status_url {
            self.fetch_stub_status(url).await.map_err(|e| e.to_string())?;
        }

        Ok(())
    }

    /// Current connection counters and uptime. Never fabricates values: any
    /// failure to reach or parse the status endpoint is `StatusUnavailable`.
    pub async fn status(&self) -> Result<NginxStatus, ProcessError> {
        let url = self.status_url.as_ref().ok_or_else(|| {
            ProcessError::StatusUnavailable("no status_url configured".to_string())
        })?;

        let stub = self.fetch_stub_status(url).await?;
        let uptime_secs = self.pid_file.as_deref().and_then(pid_file_age);

        Ok(NginxStatus {
            active_connections: stub.active_connections,
            accepts: stub.accepts,
            handled: stub.handled,
            requests: stub.requests,
            reading: stub.reading,
            writing: stub.writing,
            waiting: stub.waiting,
            uptime_secs,
            uptime: uptime_secs.map(format_uptime),
        })
    }

    async fn fetch_stub_status(&self, url: &str) -> Result<StubStatus, ProcessError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ProcessError::StatusUnavailable(format!("{}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(ProcessError::StatusUnavailable(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ProcessError::StatusUnavailable(e.to_string()))?;

        parse_stub_status(&body).map_err(ProcessError::StatusUnavailable)
    }
}

async fn read_pid(path: &Path) -> Result<i32, String> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| format!("cannot read pid file {}: {}", path.display(), e))?;
    raw.trim()
        .parse()
        .map_err(|_| format!("invalid pid in {}", path.display()))
}

fn pid_file_age(path: &Path) -> Option<u64> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    SystemTime::now()
        .duration_since(modified)
        .ok()
        .map(|d| d.as_secs())
}
