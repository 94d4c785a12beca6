//! Apply coordinator
//!
//! Sequences render -> validate -> stage -> activate -> reload for one apply
//! intent at a time. Every failure path leaves the last known-good
//! configuration in force: failures before activation never touch the active
//! file, and a failed reload restores the previous bytes and reloads again.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::{Config, RenderOptions};
use crate::error::{CommandError, ProcessError, ValidationError};
use crate::process::{never_cancel, ProcessController};
use crate::render::{render, Fingerprint, RenderedConfig};
use crate::store::{EntityStore, VersionVector};
use crate::validate::Validator;

/// A request to reconcile the running configuration with the store
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplyIntent {
    /// Store logical timestamp the intent was raised at
    pub revision: u64,
    pub reason: String,
    /// Skip the unchanged-fingerprint short-circuit
    pub force: bool,
    pub requested_at: DateTime<Utc>,
}

impl ApplyIntent {
    pub fn new(revision: u64, reason: impl Into<String>) -> Self {
        Self {
            revision,
            reason: reason.into(),
            force: false,
            requested_at: Utc::now(),
        }
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The store could not produce a snapshot
    Store,
    /// The entity set cannot be rendered
    Render,
    /// nginx rejected the candidate
    Syntax,
    /// The syntax check could not run (staging I/O, timeout, spawn failure)
    Validator,
    /// Writing the active file failed
    Activation,
    /// Reload failed or was not acknowledged
    Reload,
    /// The run was cancelled by shutdown
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplyFailure {
    pub kind: FailureKind,
    pub detail: String,
    /// The previous active file was restored after activation
    pub rolled_back: bool,
}

impl ApplyFailure {
    fn new(kind: FailureKind, detail: impl ToString) -> Self {
        Self {
            kind,
            detail: detail.to_string(),
            rolled_back: false,
        }
    }

    fn from_validation(err: ValidationError) -> Self {
        let kind = match &err {
            ValidationError::Rejected { .. } => FailureKind::Syntax,
            ValidationError::Command(CommandError::Cancelled { .. }) => FailureKind::Cancelled,
            ValidationError::Staging(_) | ValidationError::Command(_) => FailureKind::Validator,
        };
        match err {
            ValidationError::Rejected { diagnostics } => Self::new(kind, diagnostics),
            other => Self::new(kind, other),
        }
    }
}

/// Observable coordinator state
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ApplyState {
    Idle,
    Rendering,
    Validating,
    Staged,
    Activating,
    Reloading,
    Settled {
        fingerprint: Fingerprint,
        /// False when the short-circuit found the fingerprint already active
        changed: bool,
    },
    Failed(ApplyFailure),
}

impl ApplyState {
    pub fn name(&self) -> &'static str {
        match self {
            ApplyState::Idle => "idle",
            ApplyState::Rendering => "rendering",
            ApplyState::Validating => "validating",
            ApplyState::Staged => "staged",
            ApplyState::Activating => "activating",
            ApplyState::Reloading => "reloading",
            ApplyState::Settled { .. } => "settled",
            ApplyState::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ApplyOutcome {
    Applied { fingerprint: Fingerprint },
    Unchanged { fingerprint: Fingerprint },
    Failed(ApplyFailure),
}

impl ApplyOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, ApplyOutcome::Failed(_))
    }
}

/// Result of one coordinator run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplyReport {
    pub intent: ApplyIntent,
    /// Logical time of the snapshot the run rendered, when it got that far
    pub snapshot_revision: Option<u64>,
    /// Per-kind store versions of that snapshot
    pub snapshot_versions: Option<VersionVector>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: ApplyOutcome,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplyStats {
    pub runs: u64,
    pub reloads: u64,
    pub rollbacks: u64,
    /// Highest number of runs observed in flight at once
    pub max_concurrent_runs: usize,
}

/// Outcome of a validation-only pass over the current store state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DryRun {
    pub fingerprint: Fingerprint,
    /// Whether this fingerprint is the one currently active
    pub active: bool,
    pub snapshot_revision: u64,
}

pub struct ApplyCoordinator {
    store: Arc<dyn EntityStore>,
    validator: Validator,
    controller: ProcessController,
    options: RenderOptions,
    active_path: PathBuf,

    /// Held for the whole run; only one run may be past this point
    run_gate: Mutex<()>,
    active: RwLock<Option<Fingerprint>>,
    last_report: RwLock<Option<ApplyReport>>,
    state_tx: watch::Sender<ApplyState>,

    in_flight: AtomicUsize,
    max_concurrent: AtomicUsize,
    runs: AtomicU64,
    reloads: AtomicU64,
    rollbacks: AtomicU64,
}

impl ApplyCoordinator {
    pub fn new(
        store: Arc<dyn EntityStore>,
        validator: Validator,
        controller: ProcessController,
        options: RenderOptions,
        active_path: PathBuf,
    ) -> Arc<Self> {
        let active = std::fs::read_to_string(&active_path)
            .ok()
            .and_then(|text| Fingerprint::from_config_text(&text));

        match &active {
            Some(fp) => info!(path = %active_path.display(), fingerprint = %fp.short(), "Found managed configuration"),
            None => info!(path = %active_path.display(), "No managed configuration active yet"),
        }

        let (state_tx, _) = watch::channel(ApplyState::Idle);

        Arc::new(Self {
            store,
            validator,
            controller,
            options,
            active_path,
            run_gate: Mutex::new(()),
            active: RwLock::new(active),
            last_report: RwLock::new(None),
            state_tx,
            in_flight: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
            runs: AtomicU64::new(0),
            reloads: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
        })
    }

    /// Build the coordinator and its collaborators from configuration
    pub fn from_config(store: Arc<dyn EntityStore>, config: &Config) -> anyhow::Result<Arc<Self>> {
        let validator = Validator::new(&config.nginx)?;
        let controller = ProcessController::new(&config.nginx)?;
        Ok(Self::new(
            store,
            validator,
            controller,
            config.render.clone(),
            config.nginx.config_path(),
        ))
    }

    pub fn state(&self) -> ApplyState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ApplyState> {
        self.state_tx.subscribe()
    }

    pub fn active_fingerprint(&self) -> Option<Fingerprint> {
        self.active.read().clone()
    }

    pub fn last_report(&self) -> Option<ApplyReport> {
        self.last_report.read().clone()
    }

    pub fn controller(&self) -> &ProcessController {
        &self.controller
    }

    pub fn stats(&self) -> ApplyStats {
        ApplyStats {
            runs: self.runs.load(Ordering::Relaxed),
            reloads: self.reloads.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            max_concurrent_runs: self.max_concurrent.load(Ordering::Relaxed),
        }
    }

    fn set_state(&self, state: ApplyState) {
        debug!(state = state.name(), "Apply state");
        self.state_tx.send_replace(state);
    }

    /// Run one apply for `intent`. Waits for any run already in progress.
    /// Always returns to `Idle` and records the report.
    pub async fn apply(&self, intent: ApplyIntent, cancel: &mut watch::Receiver<bool>) -> ApplyReport {
        let _gate = self.run_gate.lock().await;

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(running, Ordering::SeqCst);
        self.runs.fetch_add(1, Ordering::Relaxed);

        let started_at = Utc::now();
        debug!(revision = intent.revision, reason = %intent.reason, force = intent.force, "Apply started");

        let mut snapshot_versions = None;
        let outcome = match self.run(&intent, &mut snapshot_versions, cancel).await {
            Ok(outcome) => outcome,
            Err(failure) => ApplyOutcome::Failed(failure),
        };

        match &outcome {
            ApplyOutcome::Applied { fingerprint } => {
                info!(
                    fingerprint = %fingerprint.short(),
                    revision = intent.revision,
                    reason = %intent.reason,
                    "Configuration applied"
                );
                self.set_state(ApplyState::Settled {
                    fingerprint: fingerprint.clone(),
                    changed: true,
                });
            }
            ApplyOutcome::Unchanged { fingerprint } => {
                debug!(fingerprint = %fingerprint.short(), "Configuration already active");
                self.set_state(ApplyState::Settled {
                    fingerprint: fingerprint.clone(),
                    changed: false,
                });
            }
            ApplyOutcome::Failed(failure) => {
                match failure.kind {
                    FailureKind::Reload | FailureKind::Activation => error!(
                        alert = true,
                        kind = ?failure.kind,
                        rolled_back = failure.rolled_back,
                        detail = %failure.detail,
                        "Apply failed"
                    ),
                    _ => warn!(
                        kind = ?failure.kind,
                        revision = intent.revision,
                        detail = %failure.detail,
                        "Apply failed, previous configuration remains active"
                    ),
                }
                self.set_state(ApplyState::Failed(failure.clone()));
            }
        }

        let report = ApplyReport {
            intent,
            snapshot_revision: snapshot_versions.map(|v| v.logical_time()),
            snapshot_versions,
            started_at,
            finished_at: Utc::now(),
            outcome,
        };
        *self.last_report.write() = Some(report.clone());

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.set_state(ApplyState::Idle);
        report
    }

    async fn run(
        &self,
        intent: &ApplyIntent,
        snapshot_versions: &mut Option<VersionVector>,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<ApplyOutcome, ApplyFailure> {
        self.set_state(ApplyState::Rendering);
        let rendered = self.render_current(snapshot_versions)?;

        if !intent.force && self.active_fingerprint().as_ref() == Some(&rendered.fingerprint) {
            return Ok(ApplyOutcome::Unchanged {
                fingerprint: rendered.fingerprint,
            });
        }

        self.set_state(ApplyState::Validating);
        let staged = self
            .validator
            .validate(&rendered, cancel)
            .await
            .map_err(ApplyFailure::from_validation)?;
        self.set_state(ApplyState::Staged);

        self.set_state(ApplyState::Activating);
        let previous = read_optional(&self.active_path)
            .await
            .map_err(|e| ApplyFailure::new(FailureKind::Activation, format!("reading active config: {}", e)))?;
        write_atomic(&self.active_path, rendered.text.clone().into_bytes())
            .await
            .map_err(|e| ApplyFailure::new(FailureKind::Activation, format!("writing active config: {}", e)))?;
        drop(staged);

        self.set_state(ApplyState::Reloading);
        self.reloads.fetch_add(1, Ordering::Relaxed);
        match self.controller.reload(cancel).await {
            Ok(()) => {
                *self.active.write() = Some(rendered.fingerprint.clone());
                Ok(ApplyOutcome::Applied {
                    fingerprint: rendered.fingerprint,
                })
            }
            Err(err) => {
                let kind = match &err {
                    ProcessError::Command(CommandError::Cancelled { .. }) => FailureKind::Cancelled,
                    _ => FailureKind::Reload,
                };
                let mut failure = ApplyFailure::new(kind, &err);
                self.rollback(previous, &mut failure).await;
                Err(failure)
            }
        }
    }

    fn render_current(&self, snapshot_versions: &mut Option<VersionVector>) -> Result<RenderedConfig, ApplyFailure> {
        let snapshot = self
            .store
            .get_snapshot()
            .map_err(|e| ApplyFailure::new(FailureKind::Store, e))?;
        *snapshot_versions = Some(snapshot.versions);

        render(&snapshot, &self.options).map_err(|e| ApplyFailure::new(FailureKind::Render, e))
    }

    /// Restore the previous artifact and reload it. The second reload is not
    /// cancellable: shutdown must not leave the new file in place.
    async fn rollback(&self, previous: Option<Vec<u8>>, failure: &mut ApplyFailure) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
        warn!(path = %self.active_path.display(), "Rolling back active configuration");

        let had_previous = previous.is_some();
        let restored = match previous {
            Some(bytes) => write_atomic(&self.active_path, bytes).await,
            None => match tokio::fs::remove_file(&self.active_path).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
                _ => Ok(()),
            },
        };

        if let Err(e) = restored {
            error!(alert = true, error = %e, "Failed to restore previous configuration");
            failure.detail = format!("{}; restoring previous configuration failed: {}", failure.detail, e);
            return;
        }
        failure.rolled_back = true;

        if !had_previous {
            return;
        }

        if let Err(e) = self.controller.reload(&mut never_cancel()).await {
            error!(alert = true, error = %e, "Reload of restored configuration failed");
            failure.detail = format!("{}; reload after rollback failed: {}", failure.detail, e);
        }
    }

    /// Render and syntax-check the current store state without activating
    /// anything. Does not wait for a run in progress.
    pub async fn dry_run(&self, cancel: &mut watch::Receiver<bool>) -> Result<DryRun, ApplyFailure> {
        let mut snapshot_versions = None;
        let rendered = self.render_current(&mut snapshot_versions)?;
        let staged = self
            .validator
            .validate(&rendered, cancel)
            .await
            .map_err(ApplyFailure::from_validation)?;
        drop(staged);

        Ok(DryRun {
            active: self.active_fingerprint().as_ref() == Some(&rendered.fingerprint),
            fingerprint: rendered.fingerprint,
            snapshot_revision: snapshot_versions.map(|v| v.logical_time()).unwrap_or_default(),
        })
    }
}

async fn read_optional(path: &Path) -> std::io::Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Replace `path` with `contents` via a synced temporary file in the same
/// directory and a rename. Readers see either the old or the new file.
pub async fn write_atomic(path: &Path, contents: Vec<u8>) -> std::io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".balancer-studio-")
            .suffix(".tmp")
            .tempfile_in(&dir)?;
        tmp.write_all(&contents)?;
        tmp.as_file().sync_all()?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o644))?;
        }

        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
}
