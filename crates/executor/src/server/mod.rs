mod routes;

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chanmap::ChannelMap;
use crate::command::{Command, ResultKind};
use crate::config::Config;
use crate::countermap::Counter;
use crate::metrics::{self, Metrics};
use crate::payload::{alert_env, AmPayload, STATUS_FIRING, STATUS_RESOLVED};
use crate::{Error, Result};

/// Why admission allowed or refused a launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunReason {
    NoLabelMatch,
    NoMax,
    NoFinger,
    FingerUnder,
    FingerOver,
}

impl RunReason {
    /// The `skipped_total{reason}` label value.
    pub fn as_label(&self) -> &'static str {
        match self {
            RunReason::NoLabelMatch => metrics::SKIP_NOMATCH,
            RunReason::NoMax => metrics::SKIP_NOMAX,
            RunReason::NoFinger => metrics::SKIP_NOFINGER,
            RunReason::FingerUnder => metrics::SKIP_FINGERUNDER,
            RunReason::FingerOver => metrics::SKIP_FINGEROVER,
        }
    }
}

impl fmt::Display for RunReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RunReason::NoLabelMatch => "no match for alert labels",
            RunReason::NoMax => "no maximum simultaneous command limit defined",
            RunReason::NoFinger => "no fingerprint found for command",
            RunReason::FingerUnder => "command count for fingerprint is under limit",
            RunReason::FingerOver => "command count for fingerprint is over limit",
        };
        f.write_str(text)
    }
}

/// The webhook dispatcher.
///
/// Holds the shared state the request handlers coordinate through: the
/// fingerprint cancellation channels, the per-fingerprint launch counts, and
/// the metric registry. All of it is injected at construction so several
/// servers can coexist in tests.
pub struct Server {
    config: Config,
    tell_fingers: ChannelMap,
    finger_count: Counter,
    metrics: Metrics,
}

impl Server {
    pub fn new(config: Config) -> Result<Self> {
        Ok(Self {
            config,
            tell_fingers: ChannelMap::new(),
            finger_count: Counter::new(),
            metrics: Metrics::new()?,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Builds the HTTP surface: the webhook at `/` (any method, the way
    /// Alertmanager probes allow), liveness, and metrics exposition.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/", any(routes::webhook))
            .route("/_health", get(routes::health))
            .route("/metrics", get(routes::metrics))
            .with_state(Arc::clone(self))
    }

    /// Decodes one webhook body and dispatches it by payload status.
    pub async fn handle_webhook(self: &Arc<Self>, body: &[u8]) -> Response {
        let payload: AmPayload = match serde_json::from_slice(body) {
            Ok(payload) => payload,
            Err(err) => {
                self.metrics
                    .errors
                    .with_label_values(&[metrics::ERR_UNMARSHAL])
                    .inc();
                error!("failed to decode webhook payload: {err}");
                return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
            }
        };
        if self.config.verbose {
            debug!("got: {payload:?}");
        }

        let errors = match payload.status.as_str() {
            STATUS_FIRING => self.dispatch_firing(&payload).await,
            STATUS_RESOLVED => {
                // Kill any active commands dispatched on behalf of the
                // alert, matched through their fingerprints.
                self.dispatch_resolved(&payload).await;
                Vec::new()
            }
            other => vec![Error::UnknownStatus(other.to_string())],
        };

        if errors.is_empty() {
            return StatusCode::OK.into_response();
        }

        self.metrics
            .errors
            .with_label_values(&[metrics::ERR_START])
            .inc_by(errors.len() as f64);
        let text = errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n");
        error!("{text}");
        (StatusCode::INTERNAL_SERVER_ERROR, text).into_response()
    }

    /// Fans a firing payload out across the configured commands and waits
    /// for every launch to finish, collecting surfaced errors.
    async fn dispatch_firing(self: &Arc<Self>, payload: &AmPayload) -> Vec<Error> {
        let env = alert_env(payload);

        let mut launches = JoinSet::new();
        for command in &self.config.commands {
            let (allow, reason) = self.can_run(command, payload).await;
            if !allow {
                self.metrics
                    .skipped
                    .with_label_values(&[reason.as_label()])
                    .inc();
                if self.config.verbose {
                    info!("skipping command due to '{reason}': {command}");
                }
                continue;
            }
            if self.config.verbose {
                info!("executing: {command}");
            }

            let fingerprint = command.fingerprint(payload).unwrap_or_default();
            let cancel = if fingerprint.is_empty() {
                // Untracked: the launch can't be cut short by a resolve.
                if self.config.verbose {
                    info!("command has no fingerprint, so it won't quit early if the alert resolves: {command}");
                }
                None
            } else {
                self.finger_count.inc(&fingerprint);
                Some(self.tell_fingers.acquire(&fingerprint).await)
            };

            launches.spawn(Arc::clone(self).instrument(
                command.clone(),
                env.clone(),
                fingerprint,
                cancel,
            ));
        }

        let mut errors = Vec::new();
        while let Some(joined) = launches.join_next().await {
            match joined {
                Ok(mut launch_errors) => errors.append(&mut launch_errors),
                Err(err) => errors.push(Error::Exec(format!("launch task failed: {err}"))),
            }
        }
        errors
    }

    /// Closes the cancellation channel of every fingerprint the resolved
    /// payload maps to. Launches observe the closure and signal their child.
    async fn dispatch_resolved(&self, payload: &AmPayload) {
        for command in &self.config.commands {
            match command.fingerprint(payload) {
                Some(fingerprint) if !fingerprint.is_empty() => {
                    self.tell_fingers.close(&fingerprint).await;
                }
                _ => continue,
            }
        }
    }

    /// Runs one launch and intercepts its results: metric updates per item,
    /// the duration/current bookkeeping around the whole launch, and the
    /// fingerprint count decrement on the way out.
    ///
    /// Returns the errors that should surface to the HTTP caller. A `Fail`
    /// that lands after the launch was signalled is logged but not surfaced;
    /// the exit was caused by the resolve, not by the command.
    async fn instrument(
        self: Arc<Self>,
        command: Command,
        env: Vec<String>,
        fingerprint: String,
        cancel: Option<CancellationToken>,
    ) -> Vec<Error> {
        self.metrics.processes_current.inc();
        let start = Instant::now();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let runner = {
            let command = command.clone();
            tokio::spawn(async move { command.run(&env, cancel, tx).await })
        };

        let mut errors = Vec::new();
        let mut signalled = false;
        while let Some(result) = rx.recv().await {
            match result.kind {
                ResultKind::Ok => {}
                ResultKind::Fail => {
                    if let Some(err) = result.err {
                        if command.should_notify() && !signalled {
                            errors.push(err);
                        } else {
                            warn!("{err}");
                        }
                    }
                }
                ResultKind::SigOk => {
                    signalled = true;
                    self.metrics
                        .signalled
                        .with_label_values(&[metrics::SIG_OK])
                        .inc();
                }
                ResultKind::SigFail => {
                    signalled = true;
                    self.metrics
                        .signalled
                        .with_label_values(&[metrics::SIG_FAIL])
                        .inc();
                    if let Some(err) = result.err {
                        warn!("{err}");
                    }
                }
                ResultKind::SkipSig => {
                    if self.config.verbose {
                        info!("command ignores resolved alerts, letting it run: {command}");
                    }
                }
            }
        }
        let _ = runner.await;

        if !fingerprint.is_empty() {
            self.finger_count.dec(&fingerprint);
        }
        self.metrics
            .process_duration
            .observe(start.elapsed().as_secs_f64());
        self.metrics.processes_current.dec();

        errors
    }

    /// Returns whether the command is allowed to run for this payload, and
    /// why.
    ///
    /// The check is advisory: nothing holds a lock between reading the
    /// fingerprint count and the launch incrementing it, so concurrent
    /// dispatches may overshoot `max` by at most the number of requests in
    /// flight.
    pub async fn can_run(&self, command: &Command, payload: &AmPayload) -> (bool, RunReason) {
        if !command.matches(payload) {
            return (false, RunReason::NoLabelMatch);
        }

        if command.max <= 0 {
            return (true, RunReason::NoMax);
        }

        let fingerprint = match command.fingerprint(payload) {
            Some(fingerprint) if !fingerprint.is_empty() => fingerprint,
            _ => return (true, RunReason::NoFinger),
        };

        let (count, present) = self.finger_count.get(&fingerprint).await;
        if !present || count < command.max {
            (true, RunReason::FingerUnder)
        } else {
            (false, RunReason::FingerOver)
        }
    }
}
