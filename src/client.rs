use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use crate::domain::{Project, Sample, SequenceFile};
use crate::error::UploaderError;
use crate::links::{LinkFilter, LinkResolver};
use crate::progress::SinkSet;
use crate::session::{SessionManager, send_with_retries};
use crate::upload::{CancelToken, UploadPipeline, UploadResult};

const REL_PROJECTS: &str = "projects";
const REL_PROJECT_SAMPLES: &str = "project/samples";
const REL_SEQUENCING_RUNS: &str = "sequencingRuns";
const REL_SELF: &str = "self";

/// Run statuses the server models; a subset of the local state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerRunStatus {
    Uploading,
    Complete,
    Error,
}

impl ServerRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerRunStatus::Uploading => "UPLOADING",
            ServerRunStatus::Complete => "COMPLETE",
            ServerRunStatus::Error => "ERROR",
        }
    }
}

/// Seam between the orchestration layer and the HTTP client, so uploads are
/// testable against mocks.
pub trait LimsClient: Send + Sync {
    fn list_projects(&self) -> Result<Vec<Project>, UploaderError>;
    fn list_samples(&self, project_id: &str) -> Result<Vec<Sample>, UploaderError>;
    fn project_exists(&self, project_id: &str) -> Result<bool, UploaderError>;
    fn sample_exists(&self, sample_name: &str, project_id: &str) -> Result<bool, UploaderError>;
    fn create_project(&self, project: &Project) -> Result<Project, UploaderError>;
    fn create_sample(&self, sample: &Sample, project_id: &str) -> Result<(), UploaderError>;
    fn create_sequencing_run(
        &self,
        metadata: &BTreeMap<String, Value>,
        run_type: &str,
    ) -> Result<String, UploaderError>;
    fn list_sequencing_runs(&self) -> Result<Vec<Value>, UploaderError>;
    fn set_run_upload_status(
        &self,
        run_id: &str,
        status: ServerRunStatus,
    ) -> Result<(), UploaderError>;
    fn upload_sequence_file(
        &self,
        sequence_file: &SequenceFile,
        sample_name: &str,
        project_id: &str,
        run_id: &str,
        token: &CancelToken,
    ) -> Result<UploadResult, UploaderError>;
}

/// Read-through cache for one listing. Populated on first use, dropped whole
/// on any mutating call; the server's identifiers and ordering may shift
/// under writes, so surgical invalidation is not attempted.
pub struct ListCache<T> {
    inner: Mutex<Option<Vec<T>>>,
}

impl<T: Clone> ListCache<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    pub fn get_or_fetch<F>(&self, fetch: F) -> Result<Vec<T>, UploaderError>
    where
        F: FnOnce() -> Result<Vec<T>, UploaderError>,
    {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| UploaderError::Connection("cache lock poisoned".to_string()))?;
        if let Some(cached) = guard.as_ref() {
            return Ok(cached.clone());
        }
        let fresh = fetch()?;
        *guard = Some(fresh.clone());
        Ok(fresh)
    }

    pub fn invalidate(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            *guard = None;
        }
    }
}

impl<T: Clone> Default for ListCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-key variant for sample listings, keyed by project id.
pub struct KeyedCache<T> {
    inner: Mutex<HashMap<String, Vec<T>>>,
}

impl<T: Clone> KeyedCache<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_fetch<F>(&self, key: &str, fetch: F) -> Result<Vec<T>, UploaderError>
    where
        F: FnOnce() -> Result<Vec<T>, UploaderError>,
    {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| UploaderError::Connection("cache lock poisoned".to_string()))?;
        if let Some(cached) = guard.get(key) {
            return Ok(cached.clone());
        }
        let fresh = fetch()?;
        guard.insert(key.to_string(), fresh.clone());
        Ok(fresh)
    }

    pub fn invalidate(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.clear();
        }
    }
}

impl<T: Clone> Default for KeyedCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct ListEnvelope<T> {
    resource: ListBody<T>,
}

#[derive(Debug, Deserialize)]
struct ListBody<T> {
    #[serde(default = "Vec::new")]
    resources: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct ItemEnvelope<T> {
    resource: T,
}

/// Metadata keys the sequencing-run endpoint models. Everything else a
/// parser attaches is dropped, not rejected, before submission.
const RUN_METADATA_ALLOW_LIST: &[&str] = &[
    "layoutType",
    "chemistry",
    "readLengths",
    "sequencerType",
    "workflow",
    "uploadStatus",
    "description",
];

const DEFAULT_WORKFLOW: &str = "default_workflow";

/// Builds the sequencing-run create body: allow-listed metadata with
/// `uploadStatus` forced to UPLOADING and `workflow` defaulted when absent.
pub fn sequencing_run_body(metadata: &BTreeMap<String, Value>, run_type: &str) -> Value {
    let mut body = Map::new();
    for (key, value) in metadata {
        if RUN_METADATA_ALLOW_LIST.contains(&key.as_str()) {
            body.insert(key.clone(), value.clone());
        }
    }
    body.insert("uploadStatus".to_string(), json!("UPLOADING"));
    body.entry("workflow".to_string())
        .or_insert_with(|| json!(DEFAULT_WORKFLOW));
    body.insert("runType".to_string(), json!(run_type));
    Value::Object(body)
}

pub struct LimsHttpClient {
    session: Arc<SessionManager>,
    links: LinkResolver,
    pipeline: UploadPipeline,
    projects_cache: ListCache<Project>,
    samples_cache: KeyedCache<Sample>,
}

impl LimsHttpClient {
    pub fn new(session: Arc<SessionManager>, sinks: SinkSet) -> Self {
        let links = LinkResolver::new(Arc::clone(&session));
        let pipeline = UploadPipeline::new(Arc::clone(&session), sinks);
        Self {
            session,
            links,
            pipeline,
            projects_cache: ListCache::new(),
            samples_cache: KeyedCache::new(),
        }
    }

    /// Drops every cached listing. Called by all mutating operations.
    pub fn invalidate_caches(&self) {
        self.projects_cache.invalidate();
        self.samples_cache.invalidate();
        debug!("listing caches invalidated");
    }

    fn get_list<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<Vec<T>, UploaderError> {
        let session = self.session.get_session()?;
        let response = send_with_retries(|| {
            self.session.client().get(url).bearer_auth(session.token())
        })?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "listing failed".to_string());
            return Err(UploaderError::Status { status, message });
        }
        let envelope: ListEnvelope<T> = response
            .json()
            .map_err(|err| UploaderError::Contract(format!("malformed listing at {url}: {err}")))?;
        Ok(envelope.resource.resources)
    }

    /// POSTs a create body exactly once (no transport retry; a duplicate
    /// create is worse than a reported failure) and requires 201.
    fn post_create(&self, url: &str, body: &Value) -> Result<Value, UploaderError> {
        let session = self.session.get_session()?;
        let response = self
            .session
            .client()
            .post(url)
            .bearer_auth(session.token())
            .json(body)
            .send()
            .map_err(|err| UploaderError::Connection(err.to_string()))?;
        if response.status().as_u16() != 201 {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "create rejected".to_string());
            return Err(UploaderError::Status { status, message });
        }
        let envelope: ItemEnvelope<Value> = response
            .json()
            .map_err(|err| UploaderError::Contract(format!("malformed create response: {err}")))?;
        Ok(envelope.resource)
    }

    fn created_identifier(resource: &Value) -> Result<String, UploaderError> {
        match resource.get("identifier") {
            Some(Value::String(id)) => Ok(id.clone()),
            Some(Value::Number(id)) => Ok(id.to_string()),
            _ => Err(UploaderError::Contract(
                "create response carries no identifier".to_string(),
            )),
        }
    }

    fn projects_url(&self) -> Result<String, UploaderError> {
        let session = self.session.get_session()?;
        self.links
            .resolve_link(session.api_root(), REL_PROJECTS, None)
    }

    fn samples_url(&self, project_id: &str) -> Result<String, UploaderError> {
        let projects_url = self.projects_url()?;
        self.links.resolve_link(
            &projects_url,
            REL_PROJECT_SAMPLES,
            Some(&LinkFilter::new("identifier", project_id)),
        )
    }

    fn sequencing_runs_url(&self) -> Result<String, UploaderError> {
        let session = self.session.get_session()?;
        self.links
            .resolve_link(session.api_root(), REL_SEQUENCING_RUNS, None)
    }
}

impl LimsClient for LimsHttpClient {
    fn list_projects(&self) -> Result<Vec<Project>, UploaderError> {
        self.projects_cache.get_or_fetch(|| {
            let url = self.projects_url()?;
            self.get_list(&url)
        })
    }

    fn list_samples(&self, project_id: &str) -> Result<Vec<Sample>, UploaderError> {
        self.samples_cache.get_or_fetch(project_id, || {
            let url = self.samples_url(project_id)?;
            self.get_list(&url)
        })
    }

    fn project_exists(&self, project_id: &str) -> Result<bool, UploaderError> {
        let projects = self.list_projects()?;
        Ok(projects
            .iter()
            .any(|p| p.identifier.as_deref() == Some(project_id)))
    }

    fn sample_exists(&self, sample_name: &str, project_id: &str) -> Result<bool, UploaderError> {
        let samples = self.list_samples(project_id)?;
        Ok(samples.iter().any(|s| s.sample_name == sample_name))
    }

    fn create_project(&self, project: &Project) -> Result<Project, UploaderError> {
        let url = self.projects_url()?;
        let body = json!({
            "name": project.name,
            "projectDescription": project.description,
        });
        let resource = self.post_create(&url, &body)?;
        self.invalidate_caches();
        let identifier = Self::created_identifier(&resource)?;
        info!(project = %project.name, identifier = %identifier, "project created");
        Ok(Project {
            identifier: Some(identifier),
            name: project.name.clone(),
            description: project.description.clone(),
        })
    }

    fn create_sample(&self, sample: &Sample, project_id: &str) -> Result<(), UploaderError> {
        let url = self.samples_url(project_id)?;
        let mut body = Map::new();
        body.insert("sampleName".to_string(), json!(sample.sample_name));
        if let Some(description) = &sample.description {
            body.insert("description".to_string(), json!(description));
        }
        for (key, value) in &sample.metadata {
            body.insert(key.clone(), value.clone());
        }
        self.post_create(&url, &Value::Object(body))?;
        self.invalidate_caches();
        info!(sample = %sample.sample_name, project_id, "sample created");
        Ok(())
    }

    fn create_sequencing_run(
        &self,
        metadata: &BTreeMap<String, Value>,
        run_type: &str,
    ) -> Result<String, UploaderError> {
        let url = self.sequencing_runs_url()?;
        let body = sequencing_run_body(metadata, run_type);
        let resource = self.post_create(&url, &body)?;
        self.invalidate_caches();
        let identifier = Self::created_identifier(&resource)?;
        info!(identifier = %identifier, "sequencing run created");
        Ok(identifier)
    }

    fn list_sequencing_runs(&self) -> Result<Vec<Value>, UploaderError> {
        let url = self.sequencing_runs_url()?;
        self.get_list(&url)
    }

    fn set_run_upload_status(
        &self,
        run_id: &str,
        status: ServerRunStatus,
    ) -> Result<(), UploaderError> {
        let runs_url = self.sequencing_runs_url()?;
        let run_url = self.links.resolve_link(
            &runs_url,
            REL_SELF,
            Some(&LinkFilter::new("identifier", run_id)),
        )?;
        let session = self.session.get_session()?;
        let response = self
            .session
            .client()
            .patch(&run_url)
            .bearer_auth(session.token())
            .json(&json!({ "uploadStatus": status.as_str() }))
            .send()
            .map_err(|err| UploaderError::Connection(err.to_string()))?;
        if response.status().as_u16() != 200 {
            let status_code = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "status update rejected".to_string());
            return Err(UploaderError::Status {
                status: status_code,
                message,
            });
        }
        self.invalidate_caches();
        info!(run_id, status = status.as_str(), "run upload status updated");
        Ok(())
    }

    fn upload_sequence_file(
        &self,
        sequence_file: &SequenceFile,
        sample_name: &str,
        project_id: &str,
        run_id: &str,
        token: &CancelToken,
    ) -> Result<UploadResult, UploaderError> {
        self.pipeline
            .upload_sequence_file(sequence_file, sample_name, project_id, run_id, token)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn list_cache_fetches_once() {
        let cache: ListCache<String> = ListCache::new();
        let calls = AtomicUsize::new(0);
        for _ in 0..2 {
            let items = cache
                .get_or_fetch(|| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(vec!["a".to_string()])
                })
                .unwrap();
            assert_eq!(items, vec!["a".to_string()]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn list_cache_refetches_after_invalidation() {
        let cache: ListCache<String> = ListCache::new();
        let calls = AtomicUsize::new(0);
        let fetch = || {
            cache.get_or_fetch(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Vec::new())
            })
        };
        fetch().unwrap();
        fetch().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cache.invalidate();
        fetch().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn keyed_cache_is_per_key() {
        let cache: KeyedCache<u32> = KeyedCache::new();
        let calls = AtomicUsize::new(0);
        cache
            .get_or_fetch("5", || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(vec![1])
            })
            .unwrap();
        cache
            .get_or_fetch("7", || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(vec![2])
            })
            .unwrap();
        cache
            .get_or_fetch("5", || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(vec![9])
            })
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn run_body_forces_status_and_defaults_workflow() {
        let mut metadata = BTreeMap::new();
        metadata.insert("layoutType".to_string(), json!("PAIRED_END"));
        metadata.insert("uploadStatus".to_string(), json!("COMPLETE"));
        let body = sequencing_run_body(&metadata, "miseq");

        assert_eq!(body["uploadStatus"], json!("UPLOADING"));
        assert_eq!(body["workflow"], json!(DEFAULT_WORKFLOW));
        assert_eq!(body["runType"], json!("miseq"));
    }

    #[test]
    fn run_body_drops_unknown_keys() {
        let mut metadata = BTreeMap::new();
        metadata.insert("layoutType".to_string(), json!("SINGLE_END"));
        metadata.insert("instrumentSerial".to_string(), json!("M00123"));
        metadata.insert("operator".to_string(), json!("jdoe"));
        let body = sequencing_run_body(&metadata, "directory");

        assert_eq!(body["layoutType"], json!("SINGLE_END"));
        assert!(body.get("instrumentSerial").is_none());
        assert!(body.get("operator").is_none());
    }

    #[test]
    fn run_body_keeps_caller_workflow() {
        let mut metadata = BTreeMap::new();
        metadata.insert("layoutType".to_string(), json!("SINGLE_END"));
        metadata.insert("workflow".to_string(), json!("amplicon_v2"));
        let body = sequencing_run_body(&metadata, "directory");
        assert_eq!(body["workflow"], json!("amplicon_v2"));
    }
}
