use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::domain::UploadStatus;
use crate::error::UploaderError;

pub const STATUS_FILE_NAME: &str = "upload_status.json";

/// The sole durable record of a run directory's upload progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatusRecord {
    pub status: UploadStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Server-assigned sequencing-run id, once one exists.
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "runId")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "delayedAt")]
    pub delayed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "delayMinutes")]
    pub delay_minutes: Option<u64>,
    /// Samples the server has fully accepted; resume skips these.
    #[serde(default, rename = "uploadedSamples")]
    pub uploaded_samples: Vec<String>,
}

impl Default for RunStatusRecord {
    fn default() -> Self {
        Self {
            status: UploadStatus::New,
            message: None,
            run_id: None,
            delayed_at: None,
            delay_minutes: None,
            uploaded_samples: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AttemptOptions {
    /// Re-upload from scratch, clearing prior completion markers.
    pub force: bool,
    /// Resume a PARTIAL run instead of rejecting the attempt.
    pub continue_partial: bool,
}

/// Owns the persisted status for one run directory. Every transition is
/// flushed to disk before the corresponding network work starts.
pub struct RunStateMachine {
    status_path: Utf8PathBuf,
    record: RunStatusRecord,
}

impl RunStateMachine {
    pub fn load(run_dir: &Utf8Path) -> Result<Self, UploaderError> {
        let status_path = run_dir.join(STATUS_FILE_NAME);
        let record = if status_path.as_std_path().exists() {
            let content = fs::read_to_string(status_path.as_std_path())
                .map_err(|err| UploaderError::StatusRead(err.to_string()))?;
            serde_json::from_str(&content)
                .map_err(|err| UploaderError::StatusRead(err.to_string()))?
        } else {
            RunStatusRecord::default()
        };
        Ok(Self {
            status_path,
            record,
        })
    }

    pub fn record(&self) -> &RunStatusRecord {
        &self.record
    }

    pub fn status(&self) -> UploadStatus {
        self.record.status
    }

    pub fn run_id(&self) -> Option<&str> {
        self.record.run_id.as_deref()
    }

    pub fn is_sample_uploaded(&self, sample_name: &str) -> bool {
        self.record
            .uploaded_samples
            .iter()
            .any(|name| name == sample_name)
    }

    /// Decides whether an attempt may proceed and, if so, persists the
    /// IN_PROGRESS transition before returning.
    pub fn authorize_attempt(
        &mut self,
        options: AttemptOptions,
        delay_minutes: u64,
    ) -> Result<(), UploaderError> {
        self.authorize_at(options, delay_minutes, Utc::now())
    }

    pub fn authorize_at(
        &mut self,
        options: AttemptOptions,
        delay_minutes: u64,
        now: DateTime<Utc>,
    ) -> Result<(), UploaderError> {
        match self.record.status {
            UploadStatus::New => {
                if delay_minutes > 0 {
                    self.record.status = UploadStatus::Delayed;
                    self.record.delayed_at = Some(now);
                    self.record.delay_minutes = Some(delay_minutes);
                    self.persist()?;
                    let until = now + Duration::minutes(delay_minutes as i64);
                    return Err(UploaderError::RunDelayed(until.to_rfc3339()));
                }
            }
            UploadStatus::Delayed => {
                let stamped_at = self.record.delayed_at.ok_or_else(|| {
                    UploaderError::StatusRead(
                        "DELAYED record has no delayedAt timestamp".to_string(),
                    )
                })?;
                let window = self.record.delay_minutes.unwrap_or(delay_minutes);
                let until = stamped_at + Duration::minutes(window as i64);
                if now < until {
                    return Err(UploaderError::RunDelayed(until.to_rfc3339()));
                }
            }
            UploadStatus::Complete => {
                if !options.force {
                    return Err(UploaderError::AttemptRejected(
                        "run already uploaded (COMPLETE); pass --force to re-upload".to_string(),
                    ));
                }
            }
            UploadStatus::Error => {
                if !options.force {
                    return Err(UploaderError::AttemptRejected(
                        "previous attempt failed (ERROR); pass --force to retry".to_string(),
                    ));
                }
            }
            // IN_PROGRESS on disk at attempt start is a stale marker from a
            // crashed or concurrent attempt; treated like PARTIAL.
            UploadStatus::Partial | UploadStatus::InProgress => {
                if !options.continue_partial && !options.force {
                    return Err(UploaderError::AttemptRejected(format!(
                        "run is {}; pass --continue to resume or --force to restart",
                        self.record.status
                    )));
                }
            }
        }

        if options.force {
            self.record.uploaded_samples.clear();
            self.record.run_id = None;
        }
        self.record.status = UploadStatus::InProgress;
        self.record.message = None;
        self.record.delayed_at = None;
        self.record.delay_minutes = None;
        self.persist()?;
        info!(status = %UploadStatus::InProgress, "run attempt authorized");
        Ok(())
    }

    pub fn set_run_id(&mut self, run_id: String) -> Result<(), UploaderError> {
        self.record.run_id = Some(run_id);
        self.persist()
    }

    pub fn mark_sample_uploaded(&mut self, sample_name: &str) -> Result<(), UploaderError> {
        if !self.is_sample_uploaded(sample_name) {
            self.record.uploaded_samples.push(sample_name.to_string());
        }
        self.persist()
    }

    pub fn complete(&mut self) -> Result<(), UploaderError> {
        self.record.status = UploadStatus::Complete;
        self.record.message = None;
        self.persist()
    }

    pub fn partial(&mut self, message: String) -> Result<(), UploaderError> {
        self.record.status = UploadStatus::Partial;
        self.record.message = Some(message);
        self.persist()
    }

    pub fn fail(&mut self, message: String) -> Result<(), UploaderError> {
        self.record.status = UploadStatus::Error;
        self.record.message = Some(message);
        self.persist()
    }

    // Temp-write-then-rename so a crash never leaves a torn status file.
    fn persist(&self) -> Result<(), UploaderError> {
        let content = serde_json::to_vec_pretty(&self.record)
            .map_err(|err| UploaderError::StatusWrite(err.to_string()))?;
        let tmp_path = self.status_path.with_extension("json.tmp");
        fs::write(tmp_path.as_std_path(), &content)
            .map_err(|err| UploaderError::StatusWrite(err.to_string()))?;
        fs::rename(tmp_path.as_std_path(), self.status_path.as_std_path())
            .map_err(|err| UploaderError::StatusWrite(err.to_string()))?;
        Ok(())
    }
}
