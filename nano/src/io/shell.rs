//! Persistent restricted shell bound to one repository.
//!
//! A single `bash` process lives for the whole run so `cd` and exported
//! variables carry over between tool calls. Each command is checked by
//! [`CommandPolicy`] and then written to the shell's stdin followed by sentinel
//! `printf`s that report the exit status and physical working directory on
//! stdout and mark the end of stderr. Reader threads forward output lines over
//! a channel, which lets every command be read with a deadline.
//!
//! On timeout the whole process group is killed and a fresh shell is started
//! lazily in the last known working directory; exported variables are lost.

use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, anyhow};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::command_policy::{CommandPolicy, PolicyViolation};

/// Time given to an idle shell to exit after stdin closes.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Inherited variables that would make the shell or git run extra commands.
const SCRUBBED_ENV: &[&str] = &[
    "BASH_ENV",
    "ENV",
    "GIT_CONFIG_PARAMETERS",
    "GIT_EXTERNAL_DIFF",
    "GIT_SSH_COMMAND",
    "LD_PRELOAD",
    "PROMPT_COMMAND",
];

/// Settings for one shell session.
#[derive(Debug, Clone)]
pub struct ShellOptions {
    pub program: String,
    pub output_limit_bytes: usize,
    pub policy: CommandPolicy,
}

/// Captured result of one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the command was killed on timeout.
    pub exit_code: Option<i32>,
    /// Bytes dropped from stdout and stderr combined.
    pub truncated_bytes: usize,
    pub timed_out: bool,
}

impl ShellOutput {
    pub fn truncated(&self) -> bool {
        self.truncated_bytes > 0
    }

    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Non-fatal shell failures reported back to the model.
#[derive(Debug, Error)]
pub enum ShellError {
    #[error("sandbox violation: {0}")]
    SandboxViolation(String),

    #[error("shell exited unexpectedly; a new shell will be started for the next command")]
    Exited { partial: ShellOutput },

    #[error("shell i/o error: {0}")]
    Io(String),
}

impl From<PolicyViolation> for ShellError {
    fn from(err: PolicyViolation) -> Self {
        ShellError::SandboxViolation(err.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug)]
enum StreamEvent {
    Line(Stream, Vec<u8>),
    Closed(Stream),
}

struct ShellProcess {
    child: Child,
    stdin: ChildStdin,
    events: Receiver<StreamEvent>,
}

/// Output collected for one stream, bounded by the per-call budget.
struct Capture {
    bytes: Vec<u8>,
    truncated: usize,
    limit: usize,
}

impl Capture {
    fn new(limit: usize) -> Self {
        Self {
            bytes: Vec::new(),
            truncated: 0,
            limit,
        }
    }

    fn push(&mut self, line: &[u8]) {
        let remaining = self.limit.saturating_sub(self.bytes.len());
        let keep = line.len().min(remaining);
        self.bytes.extend_from_slice(&line[..keep]);
        self.truncated += line.len() - keep;
    }

    /// Output of a command that ran to its sentinel, minus the newline the
    /// sentinel `printf` adds before its marker.
    fn finish(mut self) -> (String, usize) {
        if self.truncated > 0 {
            self.truncated -= 1;
        } else if self.bytes.last() == Some(&b'\n') {
            self.bytes.pop();
        }
        self.into_parts()
    }

    /// Output of a command cut off before its sentinel, kept as read.
    fn into_parts(self) -> (String, usize) {
        (String::from_utf8_lossy(&self.bytes).into_owned(), self.truncated)
    }
}

/// Long-lived restricted shell rooted at a repository.
pub struct ShellSession {
    repo_root: PathBuf,
    cwd: PathBuf,
    options: ShellOptions,
    process: Option<ShellProcess>,
    commands_run: u64,
}

impl ShellSession {
    /// Start a shell in `repo_root`.
    ///
    /// Fails if the directory does not exist or the shell cannot be spawned.
    #[instrument(skip_all, fields(repo_root = %repo_root.display()))]
    pub fn spawn(repo_root: &Path, options: ShellOptions) -> Result<Self> {
        let repo_root = repo_root
            .canonicalize()
            .with_context(|| format!("resolve repository root {}", repo_root.display()))?;
        if !repo_root.is_dir() {
            return Err(anyhow!("{} is not a directory", repo_root.display()));
        }
        let mut session = Self {
            cwd: repo_root.clone(),
            repo_root,
            options,
            process: None,
            commands_run: 0,
        };
        session.ensure_process()?;
        info!(program = %session.options.program, "shell session started");
        Ok(session)
    }

    /// Working directory after the last command.
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Run one command with a deadline.
    ///
    /// A timed-out command is reported through [`ShellOutput::timed_out`], not
    /// as an error.
    #[instrument(skip_all, fields(timeout_ms = timeout.as_millis() as u64))]
    pub fn execute(&mut self, command: &str, timeout: Duration) -> Result<ShellOutput, ShellError> {
        self.options.policy.check(command)?;
        self.ensure_process()
            .map_err(|e| ShellError::Io(format!("{e:#}")))?;

        let (output, pwd) = self.run_script(command, timeout)?;
        let Some(pwd) = pwd else {
            return Ok(output);
        };
        if pwd.starts_with(&self.repo_root) {
            self.cwd = pwd;
            debug!(cwd = %self.cwd.display(), exit_code = ?output.exit_code, "command finished");
            return Ok(output);
        }

        warn!(pwd = %pwd.display(), "command left the repository, restoring directory");
        let restore = format!("cd -- {}", shell_quote(&self.cwd));
        if let Err(err) = self.run_script(&restore, timeout) {
            warn!(err = %err, "failed to restore working directory");
        }
        Err(ShellError::SandboxViolation(format!(
            "cannot leave the repository; working directory stays at {}",
            self.display_cwd()
        )))
    }

    /// Working directory relative to the repository root (`.` at the root).
    pub fn display_cwd(&self) -> String {
        match self.cwd.strip_prefix(&self.repo_root) {
            Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
            Ok(rel) => rel.display().to_string(),
            Err(_) => self.cwd.display().to_string(),
        }
    }

    /// Stop the shell process. Safe to call more than once.
    pub fn close(&mut self) -> Result<()> {
        let Some(process) = self.process.take() else {
            return Ok(());
        };
        let ShellProcess {
            mut child, stdin, ..
        } = process;
        drop(stdin);
        let exited = child
            .wait_timeout(CLOSE_GRACE)
            .context("wait for shell exit")?
            .is_some();
        if !exited {
            kill_process_group(&mut child);
            child.wait().context("wait for shell after kill")?;
        }
        info!(commands = self.commands_run, "shell session closed");
        Ok(())
    }

    fn ensure_process(&mut self) -> Result<()> {
        if self.process.is_some() {
            return Ok(());
        }
        let mut cmd = Command::new(&self.options.program);
        cmd.args(["--noprofile", "--norc"])
            .current_dir(&self.cwd)
            .env("HOME", &self.repo_root)
            .env("PAGER", "cat")
            .env("GIT_PAGER", "cat")
            .env("TERM", "dumb")
            .env("GIT_CONFIG_NOSYSTEM", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for var in SCRUBBED_ENV {
            cmd.env_remove(var);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn shell {}", self.options.program))?;
        let stdin = child.stdin.take().ok_or_else(|| anyhow!("stdin was not piped"))?;
        let stdout = child.stdout.take().ok_or_else(|| anyhow!("stdout was not piped"))?;
        let stderr = child.stderr.take().ok_or_else(|| anyhow!("stderr was not piped"))?;

        let (tx, rx) = mpsc::channel();
        spawn_reader(stdout, Stream::Stdout, tx.clone());
        spawn_reader(stderr, Stream::Stderr, tx);

        debug!(pid = child.id(), cwd = %self.cwd.display(), "spawned shell process");
        self.process = Some(ShellProcess {
            child,
            stdin,
            events: rx,
        });
        Ok(())
    }

    /// Send `command` plus sentinels and collect output until both sentinels arrive.
    ///
    /// Returns the output and the physical working directory reported by the
    /// shell (`None` on timeout).
    fn run_script(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<(ShellOutput, Option<PathBuf>), ShellError> {
        self.commands_run += 1;
        let marker = sentinel(self.commands_run);
        let script = format!(
            "{{ {command}\n}} </dev/null\n__nano_status=$?\nprintf '\\n%s %d %s\\n' '{marker}' \"$__nano_status\" \"$(pwd -P)\"\nprintf '\\n%s\\n' '{marker}' >&2\n"
        );

        let process = self
            .process
            .as_mut()
            .ok_or_else(|| ShellError::Io("shell is not running".to_string()))?;
        if let Err(err) = process
            .stdin
            .write_all(script.as_bytes())
            .and_then(|()| process.stdin.flush())
        {
            warn!(err = %err, "shell stdin closed");
            self.discard_process();
            return Err(ShellError::Exited {
                partial: ShellOutput::default(),
            });
        }

        let limit = self.options.output_limit_bytes;
        let mut stdout = Capture::new(limit);
        let mut stderr = Capture::new(limit);
        let mut status: Option<(i32, PathBuf)> = None;
        let mut stderr_done = false;
        let deadline = Instant::now() + timeout;

        while status.is_none() || !stderr_done {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let event = match process.events.recv_timeout(remaining) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => {
                    warn!(timeout_ms = timeout.as_millis() as u64, "command timed out, killing shell");
                    self.discard_process();
                    let (stdout, out_cut) = stdout.into_parts();
                    let (stderr, err_cut) = stderr.into_parts();
                    return Ok((
                        ShellOutput {
                            stdout,
                            stderr,
                            exit_code: None,
                            truncated_bytes: out_cut + err_cut,
                            timed_out: true,
                        },
                        None,
                    ));
                }
                Err(RecvTimeoutError::Disconnected) => StreamEvent::Closed(Stream::Stdout),
            };
            match event {
                StreamEvent::Line(Stream::Stdout, line) => {
                    if let Some(parsed) = parse_status_line(&line, &marker) {
                        status = Some(parsed);
                    } else {
                        stdout.push(&line);
                    }
                }
                StreamEvent::Line(Stream::Stderr, line) => {
                    if trim_newline(&line) == marker.as_bytes() {
                        stderr_done = true;
                    } else {
                        stderr.push(&line);
                    }
                }
                StreamEvent::Closed(stream) => {
                    warn!(?stream, "shell output closed before command finished");
                    self.discard_process();
                    let (stdout, out_cut) = stdout.into_parts();
                    let (stderr, err_cut) = stderr.into_parts();
                    return Err(ShellError::Exited {
                        partial: ShellOutput {
                            stdout,
                            stderr,
                            exit_code: None,
                            truncated_bytes: out_cut + err_cut,
                            timed_out: false,
                        },
                    });
                }
            }
        }

        let (exit_code, pwd) = status.unwrap_or((-1, self.cwd.clone()));
        let (stdout, out_cut) = stdout.finish();
        let (stderr, err_cut) = stderr.finish();
        if out_cut + err_cut > 0 {
            debug!(truncated_bytes = out_cut + err_cut, "command output truncated");
        }
        Ok((
            ShellOutput {
                stdout,
                stderr,
                exit_code: Some(exit_code),
                truncated_bytes: out_cut + err_cut,
                timed_out: false,
            },
            Some(pwd),
        ))
    }

    /// Kill the current process group; the next command starts a new shell.
    fn discard_process(&mut self) {
        if let Some(mut process) = self.process.take() {
            kill_process_group(&mut process.child);
            if let Err(err) = process.child.wait() {
                warn!(err = %err, "failed to reap shell process");
            }
        }
    }
}

impl Drop for ShellSession {
    fn drop(&mut self) {
        if self.process.is_some() {
            debug!("dropping live shell session");
            self.discard_process();
        }
    }
}

fn spawn_reader<R: Read + Send + 'static>(reader: R, stream: Stream, tx: Sender<StreamEvent>) {
    thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        loop {
            let mut line = Vec::new();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    if tx.send(StreamEvent::Line(stream, line)).is_err() {
                        return;
                    }
                }
            }
        }
        let _ = tx.send(StreamEvent::Closed(stream));
    });
}

/// Kill the shell and everything it started.
fn kill_process_group(child: &mut Child) {
    #[cfg(unix)]
    {
        let pgid = format!("-{}", child.id());
        match Command::new("kill")
            .args(["-KILL", "--", &pgid])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(status) if status.success() => return,
            Ok(status) => debug!(?status, "process group kill failed, killing shell only"),
            Err(err) => debug!(err = %err, "cannot run kill, killing shell only"),
        }
    }
    if let Err(err) = child.kill() {
        debug!(err = %err, "shell already exited");
    }
}

/// Unique end-of-command marker for this process.
fn sentinel(counter: u64) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or_default();
    format!("__NANO_DONE_{}_{}_{:08x}__", std::process::id(), counter, nanos)
}

fn trim_newline(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\n").unwrap_or(line)
}

/// Parse `<marker> <status> <pwd>`.
fn parse_status_line(line: &[u8], marker: &str) -> Option<(i32, PathBuf)> {
    let line = std::str::from_utf8(trim_newline(line)).ok()?;
    let rest = line.strip_prefix(marker)?.strip_prefix(' ')?;
    let (code, pwd) = rest.split_once(' ')?;
    Some((code.parse().ok()?, PathBuf::from(pwd)))
}

fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.display().to_string().replace('\'', r"'\''"))
}
