use std::fs;

use camino::Utf8Path;
use serde::Serialize;
use tracing::{info, warn};

use crate::client::{LimsClient, ServerRunStatus};
use crate::domain::{RunProject, Sample, SequencingRun, UploadStatus};
use crate::error::UploaderError;
use crate::progress::{ProgressEvent, SinkSet};
use crate::state::{AttemptOptions, RunStateMachine};
use crate::upload::CancelToken;

pub const MANIFEST_FILE_NAME: &str = "run_manifest.json";

#[derive(Debug, Clone, Copy, Default)]
pub struct UploadOptions {
    pub force: bool,
    pub continue_partial: bool,
    /// Delay window applied to newly discovered runs; 0 disables it.
    pub delay_minutes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedSample {
    pub sample_name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunUploadResult {
    pub run_id: String,
    pub status: UploadStatus,
    pub uploaded_samples: Vec<String>,
    pub skipped_samples: Vec<String>,
    pub failed_samples: Vec<FailedSample>,
    pub message: Option<String>,
}

/// Reads the parser-produced run structure from the run directory. The
/// uploader never parses sample sheets; manifests are its input contract.
pub fn load_run_manifest(run_dir: &Utf8Path) -> Result<SequencingRun, UploaderError> {
    let path = run_dir.join(MANIFEST_FILE_NAME);
    if !path.as_std_path().exists() {
        return Err(UploaderError::MissingManifest(path.into_std_path_buf()));
    }
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| UploaderError::ManifestParse(err.to_string()))?;
    serde_json::from_str(&content).map_err(|err| UploaderError::ManifestParse(err.to_string()))
}

/// Drives one run upload end to end: authorize the attempt, push the
/// project/sample/file tree sequentially, and keep the durable status record
/// ahead of every network step.
pub struct Uploader<C: LimsClient> {
    client: C,
    sinks: SinkSet,
}

impl<C: LimsClient> Uploader<C> {
    pub fn new(client: C, sinks: SinkSet) -> Self {
        Self { client, sinks }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn upload_run(
        &self,
        run: &SequencingRun,
        run_dir: &Utf8Path,
        options: UploadOptions,
        token: &CancelToken,
    ) -> Result<RunUploadResult, UploaderError> {
        run.validate()?;

        let mut machine = RunStateMachine::load(run_dir)?;
        machine.authorize_attempt(
            AttemptOptions {
                force: options.force,
                continue_partial: options.continue_partial,
            },
            options.delay_minutes,
        )?;
        self.emit_status(&machine);

        // A resumed attempt keeps the server-side run; force cleared it.
        let run_id = match machine.run_id() {
            Some(id) => id.to_string(),
            None => {
                let id = self
                    .client
                    .create_sequencing_run(&run.metadata, &run.run_type)
                    .map_err(|err| self.abort(&mut machine, None, err))?;
                machine.set_run_id(id.clone())?;
                id
            }
        };
        info!(run_id = %run_id, samples = run.sample_count(), "run upload started");

        let mut uploaded = Vec::new();
        let mut skipped = Vec::new();
        let mut failed: Vec<FailedSample> = Vec::new();

        for run_project in &run.projects {
            let project_id = self
                .ensure_project(run_project)
                .map_err(|err| self.abort(&mut machine, Some(&run_id), err))?;

            for sample in &run_project.samples {
                if machine.is_sample_uploaded(&sample.sample_name) {
                    skipped.push(sample.sample_name.clone());
                    continue;
                }
                match self.upload_sample(sample, &project_id, &run_id, token) {
                    Ok(()) => {
                        machine.mark_sample_uploaded(&sample.sample_name)?;
                        uploaded.push(sample.sample_name.clone());
                        self.sinks.emit(ProgressEvent::StatusChanged {
                            run_id: Some(run_id.clone()),
                            status: UploadStatus::InProgress,
                            message: Some(format!("sample {} uploaded", sample.sample_name)),
                        });
                    }
                    // Local read failures are sample-scoped; the rest of the
                    // run still goes up and the attempt ends PARTIAL.
                    Err(err @ UploaderError::FileIo { .. }) => {
                        warn!(sample = %sample.sample_name, error = %err, "sample skipped");
                        failed.push(FailedSample {
                            sample_name: sample.sample_name.clone(),
                            reason: err.to_string(),
                        });
                    }
                    Err(err) => {
                        return Err(self.abort(&mut machine, Some(&run_id), err));
                    }
                }
            }
        }

        if failed.is_empty() {
            self.client
                .set_run_upload_status(&run_id, ServerRunStatus::Complete)
                .map_err(|err| self.abort(&mut machine, None, err))?;
            machine.complete()?;
            self.emit_status(&machine);
            Ok(RunUploadResult {
                run_id,
                status: UploadStatus::Complete,
                uploaded_samples: uploaded,
                skipped_samples: skipped,
                failed_samples: failed,
                message: None,
            })
        } else {
            let names: Vec<&str> = failed.iter().map(|f| f.sample_name.as_str()).collect();
            let message = format!("failed samples: {}", names.join(", "));
            // The server must not believe the run finished cleanly.
            if let Err(err) = self
                .client
                .set_run_upload_status(&run_id, ServerRunStatus::Error)
            {
                warn!(error = %err, "could not flag server run status");
            }
            machine.partial(message.clone())?;
            self.emit_status(&machine);
            Ok(RunUploadResult {
                run_id,
                status: UploadStatus::Partial,
                uploaded_samples: uploaded,
                skipped_samples: skipped,
                failed_samples: failed,
                message: Some(message),
            })
        }
    }

    /// Marks the run failed locally and, best effort, on the server, then
    /// hands the original error back.
    fn abort(
        &self,
        machine: &mut RunStateMachine,
        run_id: Option<&str>,
        err: UploaderError,
    ) -> UploaderError {
        if let Some(run_id) = run_id {
            if let Err(server_err) = self
                .client
                .set_run_upload_status(run_id, ServerRunStatus::Error)
            {
                warn!(error = %server_err, "could not flag server run status");
            }
        }
        if let Err(persist_err) = machine.fail(err.to_string()) {
            warn!(error = %persist_err, "could not persist ERROR status");
        }
        self.emit_status(machine);
        err
    }

    fn ensure_project(&self, run_project: &RunProject) -> Result<String, UploaderError> {
        match &run_project.project.identifier {
            Some(id) => {
                if !self.client.project_exists(id)? {
                    return Err(UploaderError::ResourceNotFound(format!(
                        "project {id} ({}) does not exist on the server",
                        run_project.project.name
                    )));
                }
                Ok(id.clone())
            }
            None => {
                let created = self.client.create_project(&run_project.project)?;
                created.identifier.ok_or_else(|| {
                    UploaderError::Contract("created project has no identifier".to_string())
                })
            }
        }
    }

    fn upload_sample(
        &self,
        sample: &Sample,
        project_id: &str,
        run_id: &str,
        token: &CancelToken,
    ) -> Result<(), UploaderError> {
        let sequence_file = sample.sequence_file.as_ref().ok_or_else(|| {
            UploaderError::InvalidSample {
                name: sample.sample_name.clone(),
                message: "sample has no sequence file attached".to_string(),
            }
        })?;
        if !self
            .client
            .sample_exists(&sample.sample_name, project_id)?
        {
            self.client.create_sample(sample, project_id)?;
        }
        self.client.upload_sequence_file(
            sequence_file,
            &sample.sample_name,
            project_id,
            run_id,
            token,
        )?;
        Ok(())
    }

    fn emit_status(&self, machine: &RunStateMachine) {
        let record = machine.record();
        self.sinks.emit(ProgressEvent::StatusChanged {
            run_id: record.run_id.clone(),
            status: record.status,
            message: record.message.clone(),
        });
    }
}
