//! Syntax check of candidate configurations before they become active

use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::NginxConfig;
use crate::error::{CommandError, ValidationError};
use crate::process::{run_bounded, CommandTemplate};
use crate::render::{Fingerprint, RenderedConfig};

/// A candidate that passed the syntax check. The staged file is removed
/// when this handle is dropped.
#[derive(Debug)]
pub struct StagedConfig {
    path: PathBuf,
    fingerprint: Fingerprint,
}

impl StagedConfig {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagedConfig {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove staged config");
            }
        }
    }
}

pub struct Validator {
    template: CommandTemplate,
    staging_dir: PathBuf,
    timeout: Duration,
}

impl Validator {
    pub fn new(config: &NginxConfig) -> Result<Self, CommandError> {
        Ok(Self {
            template: CommandTemplate::parse(&config.test_command)?,
            staging_dir: config.staging_dir(),
            timeout: config.validate_timeout(),
        })
    }

    /// Write the candidate to a unique staging path and run nginx's check
    /// mode against it. Never touches the active configuration, so it is safe
    /// to call while a reload is in progress.
    pub async fn validate(
        &self,
        rendered: &RenderedConfig,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<StagedConfig, ValidationError> {
        tokio::fs::create_dir_all(&self.staging_dir)
            .await
            .map_err(ValidationError::Staging)?;

        // The guard exists before the first byte is written, so a failed
        // write or a dropped future still removes the file
        let staged = StagedConfig {
            path: self.staging_dir.join(format!(
                "candidate-{}-{}.conf",
                rendered.fingerprint.short(),
                Uuid::new_v4().simple()
            )),
            fingerprint: rendered.fingerprint.clone(),
        };
        tokio::fs::write(&staged.path, rendered.text.as_bytes())
            .await
            .map_err(ValidationError::Staging)?;

        let output = run_bounded(
            self.template.command(&staged.path),
            self.template.program(),
            self.timeout,
            cancel,
        )
        .await?;

        if !output.success() {
            let diagnostics = output.diagnostics();
            debug!(fingerprint = %staged.fingerprint.short(), %diagnostics, "Candidate rejected");
            return Err(ValidationError::Rejected { diagnostics });
        }

        debug!(
            fingerprint = %staged.fingerprint.short(),
            path = %staged.path.display(),
            "Candidate passed syntax check"
        );
        Ok(staged)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::RenderOptions;
    use crate::process::never_cancel;
    use crate::render::render;
    use crate::store::Snapshot;

    const CHECK_SCRIPT: &str = r#"#!/bin/sh
if grep -q reject-me "$1"; then
    echo "nginx: [emerg] unknown directive \"reject-me\" in $1:3" >&2
    exit 1
fi
echo "nginx: configuration file $1 test is successful" >&2
exit 0
"#;

    fn validator(dir: &Path) -> Validator {
        let script = dir.join("check.sh");
        std::fs::write(&script, CHECK_SCRIPT).unwrap();

        let config = NginxConfig {
            config_path: dir.join("nginx.conf").to_string_lossy().into_owned(),
            staging_dir: Some(dir.join("staging").to_string_lossy().into_owned()),
            test_command: format!("/bin/sh {} {{config}}", script.display()),
            ..Default::default()
        };
        Validator::new(&config).unwrap()
    }

    fn candidate() -> RenderedConfig {
        render(&Snapshot::default(), &RenderOptions::default()).unwrap()
    }

    fn staged_files(dir: &Path) -> usize {
        std::fs::read_dir(dir.join("staging"))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn test_valid_candidate_is_staged() {
        let dir = tempfile::tempdir().unwrap();
        let validator = validator(dir.path());
        let rendered = candidate();

        let staged = validator.validate(&rendered, &mut never_cancel()).await.unwrap();
        assert_eq!(std::fs::read_to_string(staged.path()).unwrap(), rendered.text);

        let name = staged.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(&format!("candidate-{}-", rendered.fingerprint.short())));

        drop(staged);
        assert_eq!(staged_files(dir.path()), 0);
        assert!(!dir.path().join("nginx.conf").exists());
    }

    #[tokio::test]
    async fn test_rejected_candidate_carries_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let validator = validator(dir.path());
        let mut rendered = candidate();
        rendered.text.push_str("reject-me;\n");

        match validator.validate(&rendered, &mut never_cancel()).await {
            Err(ValidationError::Rejected { diagnostics }) => {
                assert!(diagnostics.contains("unknown directive \"reject-me\""), "{}", diagnostics);
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(staged_files(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_concurrent_validations_use_distinct_paths() {
        let dir = tempfile::tempdir().unwrap();
        let validator = validator(dir.path());
        let rendered = candidate();

        let mut cancel_a = never_cancel();
        let mut cancel_b = never_cancel();
        let (a, b) = tokio::join!(
            validator.validate(&rendered, &mut cancel_a),
            validator.validate(&rendered, &mut cancel_b)
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_ne!(a.path(), b.path());
        assert_eq!(staged_files(dir.path()), 2);
    }

    #[tokio::test]
    async fn test_abandoned_validation_leaves_no_staged_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = NginxConfig {
            staging_dir: Some(dir.path().join("staging").to_string_lossy().into_owned()),
            test_command: "sh -c 'sleep 5' {config}".to_string(),
            ..Default::default()
        };
        let validator = Validator::new(&config).unwrap();

        let mut cancel = never_cancel();
        let abandoned = tokio::time::timeout(
            Duration::from_millis(200),
            validator.validate(&candidate(), &mut cancel),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(staged_files(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_check_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let config = NginxConfig {
            staging_dir: Some(dir.path().to_string_lossy().into_owned()),
            test_command: "sh -c 'sleep 5' {config}".to_string(),
            validate_timeout_secs: 1,
            ..Default::default()
        };
        let validator = Validator::new(&config).unwrap();

        let err = validator
            .validate(&candidate(), &mut never_cancel())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ValidationError::Command(CommandError::Timeout { .. })
        ));
    }
}
