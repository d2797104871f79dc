use std::collections::HashMap;
use std::fmt;
use std::process::{ExitStatus, Stdio};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command as Process};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::payload::AmPayload;
use crate::{Error, Result};

/// Kinds of results a launch reports while it runs.
///
/// A launch that exits on its own ends with `Ok` or `Fail`. A launch whose
/// triggering alert resolves first also reports `SigOk`/`SigFail` (or
/// `SkipSig` when it ignores resolution) before its eventual exit result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    Ok,
    Fail,
    SigOk,
    SigFail,
    SkipSig,
}

/// One item on a launch's result channel.
#[derive(Debug)]
pub struct CommandResult {
    pub kind: ResultKind,
    pub err: Option<Error>,
}

impl CommandResult {
    fn new(kind: ResultKind) -> Self {
        Self { kind, err: None }
    }

    fn with_err(kind: ResultKind, err: Error) -> Self {
        Self {
            kind,
            err: Some(err),
        }
    }
}

/// A command that could be run based on what labels match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Command {
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Only execute this command when all of the given labels match the
    /// payload's common labels. Empty means match everything.
    #[serde(default)]
    pub match_labels: HashMap<String, String>,
    /// How many instances of this command can run at the same time for one
    /// fingerprint. Zero or negative means no limit.
    #[serde(default)]
    pub max: i64,
    /// Whether the caller is told about a failed run. Defaults to true; kept
    /// as an Option so an absent YAML key is distinguishable from `false`.
    #[serde(default)]
    pub notify_on_failure: Option<bool>,
    /// Whether the command ignores a resolved notification and keeps running
    /// to completion. Defaults to false.
    #[serde(default)]
    pub ignore_resolved: Option<bool>,
    /// Signal sent when the triggering alert resolves. Empty means terminate
    /// unconditionally; digits are used verbatim; otherwise a SIG* name.
    #[serde(default)]
    pub resolved_signal: String,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.args.is_empty() {
            return f.write_str(&self.cmd);
        }
        write!(f, "{} {}", self.cmd, self.args.join(" "))
    }
}

impl Command {
    /// Returns true if all of the command's labels match the payload's
    /// common labels. No labels defined also matches.
    pub fn matches(&self, payload: &AmPayload) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| payload.common_labels.get(k) == Some(v))
    }

    /// Returns the fingerprint of the first alert whose own labels satisfy
    /// the command's labels, or the first alert's fingerprint when no labels
    /// are defined. `None` means no alert matched; note the returned string
    /// may itself be empty.
    pub fn fingerprint(&self, payload: &AmPayload) -> Option<String> {
        payload
            .alerts
            .iter()
            .find(|alert| {
                self.match_labels
                    .iter()
                    .all(|(k, v)| alert.labels.get(k) == Some(v))
            })
            .map(|alert| alert.fingerprint.clone())
    }

    /// The interpreted value of `notify_on_failure` (defaults to true).
    pub fn should_notify(&self) -> bool {
        self.notify_on_failure.unwrap_or(true)
    }

    /// The interpreted value of `ignore_resolved` (defaults to false).
    pub fn should_ignore_resolved(&self) -> bool {
        self.ignore_resolved.unwrap_or(false)
    }

    /// Resolves `resolved_signal` to a signal number.
    ///
    /// Unknown names are a configuration error and are rejected before the
    /// server starts; see config validation.
    pub fn parse_signal(&self) -> Result<libc::c_int> {
        if self.resolved_signal.is_empty() {
            return Ok(libc::SIGKILL);
        }

        if self.resolved_signal.chars().all(|c| c.is_ascii_digit()) {
            return self.resolved_signal.parse::<libc::c_int>().map_err(|err| {
                Error::Signal(format!(
                    "invalid signal number {}: {err}",
                    self.resolved_signal
                ))
            });
        }

        let want = self.resolved_signal.to_uppercase();
        signal_by_name(&want).ok_or_else(|| Error::Signal(format!("unknown signal {want}")))
    }

    /// Returns true if the command is the same invocation as another:
    /// identical program, argument list, and match labels. Lifecycle policy
    /// fields are deliberately not compared; this is used to union commands
    /// from several configuration sources.
    pub fn equivalent(&self, other: &Command) -> bool {
        self.cmd == other.cmd
            && self.args == other.args
            && self.match_labels == other.match_labels
    }

    /// Executes the command, potentially signalling it if the alert that
    /// triggered it resolves.
    ///
    /// Every outcome is sent on `out`; the channel closes when the launch is
    /// fully finished, which is how the dispatcher joins on it. With a
    /// cancellation signal the launch may emit two items (the signal outcome
    /// followed by the child's exit outcome).
    pub async fn run(
        &self,
        env: &[String],
        cancel: Option<CancellationToken>,
        out: mpsc::UnboundedSender<CommandResult>,
    ) {
        let mut child = match self.spawn(env) {
            Ok(child) => child,
            Err(err) => {
                let _ = out.send(CommandResult::with_err(ResultKind::Fail, err));
                return;
            }
        };

        let cancel = match cancel {
            Some(cancel) => cancel,
            None => {
                let status = child.wait().await;
                let _ = out.send(self.exit_result(status));
                return;
            }
        };

        // Child::wait is cancel safe, so losing the select race does not
        // leak the exit status; it is picked up again below.
        let exited = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };

        match exited {
            Some(status) => {
                let _ = out.send(self.exit_result(status));
            }
            None => {
                if self.should_ignore_resolved() {
                    let _ = out.send(CommandResult::new(ResultKind::SkipSig));
                } else {
                    match self.parse_signal() {
                        Ok(signal) => {
                            let _ = out.send(self.signal_child(&child, signal));
                        }
                        Err(err) => {
                            let _ = out.send(CommandResult::with_err(
                                ResultKind::SigFail,
                                Error::Signal(format!(
                                    "can't use signal {} to notify command {self}: {err}",
                                    self.resolved_signal
                                )),
                            ));
                        }
                    }
                }
                let status = child.wait().await;
                let _ = out.send(self.exit_result(status));
            }
        }
    }

    fn spawn(&self, env: &[String]) -> Result<Child> {
        let mut process = Process::new(&self.cmd);
        process
            .args(&self.args)
            .envs(env.iter().filter_map(|kv| kv.split_once('=')))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = process
            .spawn()
            .map_err(|err| Error::Exec(format!("failed to start command {self}: {err}")))?;

        if let Some(stdout) = child.stdout.take() {
            self.forward_output(stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            self.forward_output(stderr);
        }
        Ok(child)
    }

    /// Copies a child stream to the process log, line by line.
    fn forward_output<R>(&self, stream: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let name = self.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!("{name}: {line}");
            }
        });
    }

    fn exit_result(&self, status: std::io::Result<ExitStatus>) -> CommandResult {
        match status {
            Ok(status) if status.success() => CommandResult::new(ResultKind::Ok),
            Ok(status) => CommandResult::with_err(
                ResultKind::Fail,
                Error::Exec(format!("command {self} failed: {status}")),
            ),
            Err(err) => CommandResult::with_err(
                ResultKind::Fail,
                Error::Exec(format!("failed waiting on command {self}: {err}")),
            ),
        }
    }

    fn signal_child(&self, child: &Child, signal: libc::c_int) -> CommandResult {
        let Some(pid) = child.id() else {
            return CommandResult::with_err(
                ResultKind::SigFail,
                Error::Signal(format!("command {self} has no pid; it already exited")),
            );
        };

        let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
        if rc == 0 {
            CommandResult::new(ResultKind::SigOk)
        } else {
            let err = std::io::Error::last_os_error();
            CommandResult::with_err(
                ResultKind::SigFail,
                Error::Signal(format!(
                    "failed sending signal {signal} to pid {pid} for command {self}: {err}"
                )),
            )
        }
    }
}

/// Case-sensitive lookup of the canonical signal name table. Callers
/// uppercase first.
fn signal_by_name(name: &str) -> Option<libc::c_int> {
    let signal = match name {
        "SIGABRT" => libc::SIGABRT,
        "SIGALRM" => libc::SIGALRM,
        "SIGBUS" => libc::SIGBUS,
        "SIGCHLD" => libc::SIGCHLD,
        "SIGCONT" => libc::SIGCONT,
        "SIGFPE" => libc::SIGFPE,
        "SIGHUP" => libc::SIGHUP,
        "SIGILL" => libc::SIGILL,
        "SIGINT" => libc::SIGINT,
        "SIGIO" => libc::SIGIO,
        "SIGIOT" => libc::SIGIOT,
        "SIGKILL" => libc::SIGKILL,
        "SIGPIPE" => libc::SIGPIPE,
        "SIGPROF" => libc::SIGPROF,
        "SIGQUIT" => libc::SIGQUIT,
        "SIGSEGV" => libc::SIGSEGV,
        "SIGSTOP" => libc::SIGSTOP,
        "SIGSYS" => libc::SIGSYS,
        "SIGTERM" => libc::SIGTERM,
        "SIGTRAP" => libc::SIGTRAP,
        "SIGTSTP" => libc::SIGTSTP,
        "SIGTTIN" => libc::SIGTTIN,
        "SIGTTOU" => libc::SIGTTOU,
        "SIGURG" => libc::SIGURG,
        "SIGUSR1" => libc::SIGUSR1,
        "SIGUSR2" => libc::SIGUSR2,
        "SIGVTALRM" => libc::SIGVTALRM,
        "SIGWINCH" => libc::SIGWINCH,
        "SIGXCPU" => libc::SIGXCPU,
        "SIGXFSZ" => libc::SIGXFSZ,
        _ => return None,
    };
    Some(signal)
}
