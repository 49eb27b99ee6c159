use std::collections::BTreeMap;
use std::sync::Mutex;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use serde_json::{Value, json};

use lims_run_uploader::app::{UploadOptions, Uploader};
use lims_run_uploader::client::{LimsClient, ServerRunStatus};
use lims_run_uploader::domain::{
    Project, RunProject, Sample, SequenceFile, SequencingRun, UploadStatus,
};
use lims_run_uploader::error::UploaderError;
use lims_run_uploader::progress::SinkSet;
use lims_run_uploader::state::RunStateMachine;
use lims_run_uploader::upload::{CancelToken, UploadResult};

#[derive(Default)]
struct MockLims {
    /// Sample names whose file upload fails with a local read error.
    unreadable_samples: Vec<String>,
    created_projects: Mutex<Vec<String>>,
    created_samples: Mutex<Vec<String>>,
    uploaded_files: Mutex<Vec<String>>,
    run_statuses: Mutex<Vec<(String, ServerRunStatus)>>,
    created_runs: Mutex<usize>,
}

impl LimsClient for MockLims {
    fn list_projects(&self) -> Result<Vec<Project>, UploaderError> {
        Ok(vec![Project {
            identifier: Some("5".to_string()),
            name: "existing".to_string(),
            description: None,
        }])
    }

    fn list_samples(&self, _project_id: &str) -> Result<Vec<Sample>, UploaderError> {
        Ok(Vec::new())
    }

    fn project_exists(&self, project_id: &str) -> Result<bool, UploaderError> {
        Ok(project_id == "5")
    }

    fn sample_exists(&self, _sample_name: &str, _project_id: &str) -> Result<bool, UploaderError> {
        Ok(false)
    }

    fn create_project(&self, project: &Project) -> Result<Project, UploaderError> {
        self.created_projects.lock().unwrap().push(project.name.clone());
        Ok(Project {
            identifier: Some("99".to_string()),
            name: project.name.clone(),
            description: project.description.clone(),
        })
    }

    fn create_sample(&self, sample: &Sample, _project_id: &str) -> Result<(), UploaderError> {
        self.created_samples
            .lock()
            .unwrap()
            .push(sample.sample_name.clone());
        Ok(())
    }

    fn create_sequencing_run(
        &self,
        _metadata: &BTreeMap<String, Value>,
        _run_type: &str,
    ) -> Result<String, UploaderError> {
        *self.created_runs.lock().unwrap() += 1;
        Ok("run-1".to_string())
    }

    fn list_sequencing_runs(&self) -> Result<Vec<Value>, UploaderError> {
        Ok(Vec::new())
    }

    fn set_run_upload_status(
        &self,
        run_id: &str,
        status: ServerRunStatus,
    ) -> Result<(), UploaderError> {
        self.run_statuses
            .lock()
            .unwrap()
            .push((run_id.to_string(), status));
        Ok(())
    }

    fn upload_sequence_file(
        &self,
        _sequence_file: &SequenceFile,
        sample_name: &str,
        _project_id: &str,
        _run_id: &str,
        token: &CancelToken,
    ) -> Result<UploadResult, UploaderError> {
        if token.is_canceled() {
            return Err(UploaderError::UploadCanceled(sample_name.to_string()));
        }
        if self.unreadable_samples.iter().any(|s| s == sample_name) {
            return Err(UploaderError::FileIo {
                path: format!("{sample_name}.fastq").into(),
                message: "permission denied".to_string(),
            });
        }
        self.uploaded_files.lock().unwrap().push(sample_name.to_string());
        Ok(UploadResult {
            sample_name: sample_name.to_string(),
            paired_end: false,
            bytes_sent: 1024,
        })
    }
}

fn sample(name: &str) -> Sample {
    Sample {
        sample_name: name.to_string(),
        description: None,
        metadata: BTreeMap::new(),
        sort_key: None,
        sequence_file: Some(SequenceFile::single(Utf8PathBuf::from(format!(
            "{name}.fastq"
        )))),
    }
}

fn run(samples: Vec<Sample>) -> SequencingRun {
    let mut metadata = BTreeMap::new();
    metadata.insert("layoutType".to_string(), json!("SINGLE_END"));
    SequencingRun {
        metadata,
        projects: vec![RunProject {
            project: Project {
                identifier: Some("5".to_string()),
                name: "existing".to_string(),
                description: None,
            },
            samples,
        }],
        run_type: "directory".to_string(),
    }
}

fn run_dir() -> (tempfile::TempDir, Utf8PathBuf) {
    let temp = tempfile::tempdir().unwrap();
    let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    (temp, dir)
}

#[test]
fn successful_run_ends_complete() {
    let (_temp, dir) = run_dir();
    let client = MockLims::default();
    let uploader = Uploader::new(client, SinkSet::new());

    let result = uploader
        .upload_run(
            &run(vec![sample("s01"), sample("s02")]),
            &dir,
            UploadOptions::default(),
            &CancelToken::new(),
        )
        .unwrap();

    assert_eq!(result.status, UploadStatus::Complete);
    assert_eq!(result.uploaded_samples, vec!["s01", "s02"]);
    assert!(result.failed_samples.is_empty());

    let machine = RunStateMachine::load(&dir).unwrap();
    assert_eq!(machine.status(), UploadStatus::Complete);
    assert!(machine.is_sample_uploaded("s01"));
    assert!(machine.is_sample_uploaded("s02"));
}

#[test]
fn server_run_marked_complete_once() {
    let (_temp, dir) = run_dir();
    let client = MockLims::default();
    let uploader = Uploader::new(client, SinkSet::new());

    uploader
        .upload_run(
            &run(vec![sample("s01")]),
            &dir,
            UploadOptions::default(),
            &CancelToken::new(),
        )
        .unwrap();

    let statuses = uploader_statuses(&uploader);
    assert_eq!(statuses, vec![("run-1".to_string(), ServerRunStatus::Complete)]);
}

fn uploader_statuses(uploader: &Uploader<MockLims>) -> Vec<(String, ServerRunStatus)> {
    uploader.client().run_statuses.lock().unwrap().clone()
}

#[test]
fn completed_run_rejected_without_force() {
    let (_temp, dir) = run_dir();

    let uploader = Uploader::new(MockLims::default(), SinkSet::new());
    uploader
        .upload_run(
            &run(vec![sample("s01")]),
            &dir,
            UploadOptions::default(),
            &CancelToken::new(),
        )
        .unwrap();

    let err = uploader
        .upload_run(
            &run(vec![sample("s01")]),
            &dir,
            UploadOptions::default(),
            &CancelToken::new(),
        )
        .unwrap_err();
    assert_matches!(err, UploaderError::AttemptRejected(_));

    // Force restarts from scratch and re-uploads.
    let result = uploader
        .upload_run(
            &run(vec![sample("s01")]),
            &dir,
            UploadOptions {
                force: true,
                ..UploadOptions::default()
            },
            &CancelToken::new(),
        )
        .unwrap();
    assert_eq!(result.uploaded_samples, vec!["s01"]);
    assert!(result.skipped_samples.is_empty());
}

#[test]
fn file_error_is_sample_scoped_and_run_ends_partial() {
    let (_temp, dir) = run_dir();
    let client = MockLims {
        unreadable_samples: vec!["s02".to_string()],
        ..MockLims::default()
    };
    let uploader = Uploader::new(client, SinkSet::new());

    let result = uploader
        .upload_run(
            &run(vec![sample("s01"), sample("s02"), sample("s03")]),
            &dir,
            UploadOptions::default(),
            &CancelToken::new(),
        )
        .unwrap();

    assert_eq!(result.status, UploadStatus::Partial);
    assert_eq!(result.uploaded_samples, vec!["s01", "s03"]);
    assert_eq!(result.failed_samples.len(), 1);
    assert_eq!(result.failed_samples[0].sample_name, "s02");

    let machine = RunStateMachine::load(&dir).unwrap();
    assert_eq!(machine.status(), UploadStatus::Partial);
}

#[test]
fn continue_resumes_partial_and_skips_uploaded_samples() {
    let (_temp, dir) = run_dir();

    // First attempt: s02 unreadable, run ends PARTIAL.
    let failing = MockLims {
        unreadable_samples: vec!["s02".to_string()],
        ..MockLims::default()
    };
    Uploader::new(failing, SinkSet::new())
        .upload_run(
            &run(vec![sample("s01"), sample("s02")]),
            &dir,
            UploadOptions::default(),
            &CancelToken::new(),
        )
        .unwrap();

    // Plain retry is rejected.
    let uploader = Uploader::new(MockLims::default(), SinkSet::new());
    let err = uploader
        .upload_run(
            &run(vec![sample("s01"), sample("s02")]),
            &dir,
            UploadOptions::default(),
            &CancelToken::new(),
        )
        .unwrap_err();
    assert_matches!(err, UploaderError::AttemptRejected(_));

    // --continue retries only the failed sample.
    let result = uploader
        .upload_run(
            &run(vec![sample("s01"), sample("s02")]),
            &dir,
            UploadOptions {
                continue_partial: true,
                ..UploadOptions::default()
            },
            &CancelToken::new(),
        )
        .unwrap();
    assert_eq!(result.skipped_samples, vec!["s01"]);
    assert_eq!(result.uploaded_samples, vec!["s02"]);
    assert_eq!(result.status, UploadStatus::Complete);
}

#[test]
fn cancellation_marks_run_error() {
    let (_temp, dir) = run_dir();
    let uploader = Uploader::new(MockLims::default(), SinkSet::new());

    let token = CancelToken::new();
    token.cancel();

    let err = uploader
        .upload_run(
            &run(vec![sample("s01")]),
            &dir,
            UploadOptions::default(),
            &token,
        )
        .unwrap_err();
    assert_matches!(err, UploaderError::UploadCanceled(_));

    let machine = RunStateMachine::load(&dir).unwrap();
    assert_eq!(machine.status(), UploadStatus::Error);
}

#[test]
fn unknown_project_id_is_resource_not_found() {
    let (_temp, dir) = run_dir();
    let uploader = Uploader::new(MockLims::default(), SinkSet::new());

    let mut bad_run = run(vec![sample("s01")]);
    bad_run.projects[0].project.identifier = Some("404".to_string());

    let err = uploader
        .upload_run(&bad_run, &dir, UploadOptions::default(), &CancelToken::new())
        .unwrap_err();
    assert_matches!(err, UploaderError::ResourceNotFound(_));

    let machine = RunStateMachine::load(&dir).unwrap();
    assert_eq!(machine.status(), UploadStatus::Error);
}

#[test]
fn project_without_identifier_gets_created() {
    let (_temp, dir) = run_dir();
    let uploader = Uploader::new(MockLims::default(), SinkSet::new());

    let mut new_project_run = run(vec![sample("s01")]);
    new_project_run.projects[0].project = Project::new("fresh project");

    let result = uploader
        .upload_run(
            &new_project_run,
            &dir,
            UploadOptions::default(),
            &CancelToken::new(),
        )
        .unwrap();
    assert_eq!(result.status, UploadStatus::Complete);
    assert_eq!(
        *uploader.client().created_projects.lock().unwrap(),
        vec!["fresh project".to_string()]
    );
}
