use std::fs::{self, File};
use std::io::{self, Read};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use camino::Utf8PathBuf;
use reqwest::blocking::Body;
use reqwest::header::CONTENT_TYPE;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::domain::SequenceFile;
use crate::error::UploaderError;
use crate::links::{LinkFilter, LinkResolver};
use crate::progress::{ProgressEvent, SinkSet};
use crate::session::SessionManager;

pub const CHUNK_SIZE: usize = 32 * 1024;
pub const BOUNDARY: &str = "lims_ru_boundary_0a3f91c2";

const REL_PROJECTS: &str = "projects";
const REL_PROJECT_SAMPLES: &str = "project/samples";
const REL_SAMPLE_FILES: &str = "sample/sequenceFiles";
const REL_SAMPLE_PAIRS: &str = "sample/sequenceFiles/pairs";

/// Cooperative cancellation flag, passed explicitly so concurrent uploads
/// stay independent. Checked between chunks; a cancel requested mid-read
/// takes effect before the next chunk is yielded.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct FileSlot {
    path: Utf8PathBuf,
    part_name: String,
    parameters_name: String,
    parameters: Value,
    size: u64,
}

enum StreamState {
    FileHeader(usize),
    FileBody(usize, File),
    Parameters(usize),
    Terminal,
    Done,
}

/// Pull-based multipart body producer. Yields the body as a sequence of
/// byte chunks: part headers, raw 32 KiB file slices, JSON metadata parts,
/// then the closing boundary. Nothing is materialized in memory.
pub struct MultipartChunks {
    boundary: String,
    slots: Vec<FileSlot>,
    state: StreamState,
    first_part: bool,
    token: CancelToken,
    bytes_total: u64,
    bytes_sent: Arc<AtomicU64>,
    last_percent: u8,
    sample_name: String,
    sinks: SinkSet,
}

impl std::fmt::Debug for MultipartChunks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultipartChunks")
            .field("boundary", &self.boundary)
            .field("sample_name", &self.sample_name)
            .field("bytes_total", &self.bytes_total)
            .finish_non_exhaustive()
    }
}

impl MultipartChunks {
    pub fn new(
        sequence_file: &SequenceFile,
        sample_name: &str,
        run_id: &str,
        token: CancelToken,
        sinks: SinkSet,
    ) -> Result<Self, UploaderError> {
        sequence_file.validate()?;
        let paired = sequence_file.is_paired_end();
        let mut slots = Vec::with_capacity(sequence_file.files.len());
        let mut bytes_total = 0u64;

        for (index, path) in sequence_file.files.iter().enumerate() {
            let size = fs::metadata(path.as_std_path())
                .map_err(|err| UploaderError::FileIo {
                    path: path.clone().into_std_path_buf(),
                    message: err.to_string(),
                })?
                .len();
            bytes_total += size;

            let (part_name, parameters_name) = if paired {
                (format!("file{}", index + 1), format!("parameters{}", index + 1))
            } else {
                ("file".to_string(), "parameters".to_string())
            };

            // Each slot's property map carries the owning run id.
            let mut parameters = sequence_file.metadata.clone();
            parameters.insert("runId".to_string(), json!(run_id));

            slots.push(FileSlot {
                path: path.clone(),
                part_name,
                parameters_name,
                parameters: Value::Object(parameters.into_iter().collect()),
                size,
            });
        }

        Ok(Self {
            boundary: BOUNDARY.to_string(),
            slots,
            state: StreamState::FileHeader(0),
            first_part: true,
            token,
            bytes_total,
            bytes_sent: Arc::new(AtomicU64::new(0)),
            last_percent: 0,
            sample_name: sample_name.to_string(),
            sinks,
        })
    }

    pub fn bytes_total(&self) -> u64 {
        self.bytes_total
    }

    /// Shared counter, readable after the body has been consumed by the
    /// transport.
    pub fn bytes_sent_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.bytes_sent)
    }

    fn boundary_line(&mut self) -> String {
        let prefix = if self.first_part { "" } else { "\r\n" };
        self.first_part = false;
        format!("{prefix}--{}\r\n", self.boundary)
    }

    fn file_header(&mut self, index: usize) -> Vec<u8> {
        let boundary = self.boundary_line();
        let slot = &self.slots[index];
        let filename = slot.path.file_name().unwrap_or(slot.path.as_str());
        format!(
            "{boundary}Content-Disposition: form-data; name=\"{}\"; filename=\"{filename}\"\r\n\r\n",
            slot.part_name
        )
        .into_bytes()
    }

    fn parameters_part(&mut self, index: usize) -> Result<Vec<u8>, UploaderError> {
        let boundary = self.boundary_line();
        let slot = &self.slots[index];
        let body = serde_json::to_string(&slot.parameters)
            .map_err(|err| UploaderError::Contract(format!("unserializable metadata: {err}")))?;
        Ok(format!(
            "{boundary}Content-Disposition: form-data; name=\"{}\"\r\nContent-Type: application/json\r\n\r\n{body}",
            slot.parameters_name
        )
        .into_bytes())
    }

    fn terminal(&mut self) -> Vec<u8> {
        let prefix = if self.first_part { "" } else { "\r\n" };
        format!("{prefix}--{}--\r\n", self.boundary).into_bytes()
    }

    fn report_progress(&mut self) {
        if self.bytes_total == 0 {
            return;
        }
        let sent = self.bytes_sent.load(Ordering::SeqCst);
        let percent = ((sent * 100) / self.bytes_total).min(100) as u8;
        if percent != self.last_percent {
            self.last_percent = percent;
            self.sinks.emit(ProgressEvent::FileProgress {
                sample_name: self.sample_name.clone(),
                percent,
            });
        }
    }
}

impl Iterator for MultipartChunks {
    type Item = Result<Vec<u8>, UploaderError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match std::mem::replace(&mut self.state, StreamState::Done) {
                StreamState::FileHeader(index) => {
                    let slot = &self.slots[index];
                    let path = slot.path.clone();
                    debug!(file = %path, size = slot.size, "streaming sequence file");
                    let file = match File::open(path.as_std_path()) {
                        Ok(file) => file,
                        Err(err) => {
                            return Some(Err(UploaderError::FileIo {
                                path: path.into_std_path_buf(),
                                message: err.to_string(),
                            }));
                        }
                    };
                    let header = self.file_header(index);
                    self.state = StreamState::FileBody(index, file);
                    return Some(Ok(header));
                }
                StreamState::FileBody(index, mut file) => {
                    // Cancellation is observed between chunks; once seen, the
                    // stream ends with no partial chunk and no terminator.
                    if self.token.is_canceled() {
                        debug!("cancel flag observed, truncating multipart stream");
                        return None;
                    }
                    let mut buf = vec![0u8; CHUNK_SIZE];
                    match file.read(&mut buf) {
                        Ok(0) => {
                            self.state = if index + 1 < self.slots.len() {
                                StreamState::FileHeader(index + 1)
                            } else {
                                StreamState::Parameters(0)
                            };
                            continue;
                        }
                        Ok(count) => {
                            buf.truncate(count);
                            self.bytes_sent.fetch_add(count as u64, Ordering::SeqCst);
                            self.report_progress();
                            self.state = StreamState::FileBody(index, file);
                            return Some(Ok(buf));
                        }
                        Err(err) => {
                            return Some(Err(UploaderError::FileIo {
                                path: self.slots[index].path.clone().into_std_path_buf(),
                                message: err.to_string(),
                            }));
                        }
                    }
                }
                StreamState::Parameters(index) => {
                    let part = self.parameters_part(index);
                    self.state = if index + 1 < self.slots.len() {
                        StreamState::Parameters(index + 1)
                    } else {
                        StreamState::Terminal
                    };
                    return Some(part);
                }
                StreamState::Terminal => {
                    self.state = StreamState::Done;
                    return Some(Ok(self.terminal()));
                }
                StreamState::Done => return None,
            }
        }
    }
}

/// `Read` adapter over `MultipartChunks` so the blocking transport can pull
/// the body. Producer-side errors are parked in a shared slot and recovered
/// by the pipeline after the HTTP call unwinds.
pub struct ChunkReader {
    chunks: MultipartChunks,
    pending: Vec<u8>,
    offset: usize,
    error_slot: Arc<Mutex<Option<UploaderError>>>,
}

impl ChunkReader {
    pub fn new(chunks: MultipartChunks, error_slot: Arc<Mutex<Option<UploaderError>>>) -> Self {
        Self {
            chunks,
            pending: Vec::new(),
            offset: 0,
            error_slot,
        }
    }
}

impl Read for ChunkReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.offset >= self.pending.len() {
            match self.chunks.next() {
                Some(Ok(chunk)) => {
                    self.pending = chunk;
                    self.offset = 0;
                }
                Some(Err(err)) => {
                    let message = err.to_string();
                    if let Ok(mut slot) = self.error_slot.lock() {
                        *slot = Some(err);
                    }
                    return Err(io::Error::other(message));
                }
                None => return Ok(0),
            }
        }
        let available = &self.pending[self.offset..];
        let count = available.len().min(buf.len());
        buf[..count].copy_from_slice(&available[..count]);
        self.offset += count;
        Ok(count)
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct UploadResult {
    pub sample_name: String,
    pub paired_end: bool,
    pub bytes_sent: u64,
}

/// Streams one sample's file set to the server, navigating the link graph
/// project → sample → sequence-file collection.
pub struct UploadPipeline {
    session: Arc<SessionManager>,
    links: LinkResolver,
    sinks: SinkSet,
}

impl UploadPipeline {
    pub fn new(session: Arc<SessionManager>, sinks: SinkSet) -> Self {
        let links = LinkResolver::new(Arc::clone(&session));
        Self {
            session,
            links,
            sinks,
        }
    }

    pub fn upload_sequence_file(
        &self,
        sequence_file: &SequenceFile,
        sample_name: &str,
        project_id: &str,
        run_id: &str,
        token: &CancelToken,
    ) -> Result<UploadResult, UploaderError> {
        let session = self.session.get_session()?;
        let paired = sequence_file.is_paired_end();

        let projects_url = self
            .links
            .resolve_link(session.api_root(), REL_PROJECTS, None)?;
        let samples_url = self.links.resolve_link(
            &projects_url,
            REL_PROJECT_SAMPLES,
            Some(&LinkFilter::new("identifier", project_id)),
        )?;
        let rel = if paired { REL_SAMPLE_PAIRS } else { REL_SAMPLE_FILES };
        let target_url = self.links.resolve_link(
            &samples_url,
            rel,
            Some(&LinkFilter::new("sampleName", sample_name)),
        )?;

        let chunks = MultipartChunks::new(
            sequence_file,
            sample_name,
            run_id,
            token.clone(),
            self.sinks.clone(),
        )?;
        let bytes_counter = chunks.bytes_sent_counter();
        let error_slot = Arc::new(Mutex::new(None));
        let reader = ChunkReader::new(chunks, Arc::clone(&error_slot));

        info!(sample = sample_name, paired, url = %target_url, "starting file upload");
        let outcome = self
            .session
            .client()
            .post(&target_url)
            .bearer_auth(session.token())
            .header(
                CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::new(reader))
            .send();

        // The server saw a truncated stream; the caller must mark the run
        // ERROR rather than retry.
        if token.is_canceled() {
            return Err(UploaderError::UploadCanceled(sample_name.to_string()));
        }
        if let Ok(mut slot) = error_slot.lock() {
            if let Some(err) = slot.take() {
                return Err(err);
            }
        }

        let response = outcome.map_err(|err| UploaderError::Connection(err.to_string()))?;
        if response.status().as_u16() != 201 {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "file upload rejected".to_string());
            return Err(UploaderError::Status { status, message });
        }

        let bytes_sent = bytes_counter.load(Ordering::SeqCst);
        info!(sample = sample_name, bytes_sent, "file upload accepted");
        Ok(UploadResult {
            sample_name: sample_name.to_string(),
            paired_end: paired,
            bytes_sent,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::io::Write;

    use assert_matches::assert_matches;

    use super::*;

    fn temp_fastq(dir: &tempfile::TempDir, name: &str, size: usize) -> Utf8PathBuf {
        let path = dir.path().join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(&vec![b'A'; size]).unwrap();
        Utf8PathBuf::from_path_buf(path).unwrap()
    }

    fn collect_body(chunks: MultipartChunks) -> Vec<u8> {
        let mut body = Vec::new();
        for chunk in chunks {
            body.extend(chunk.unwrap());
        }
        body
    }

    #[test]
    fn single_end_body_has_one_file_and_one_parameters_part() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_fastq(&dir, "s01.fastq", 100);
        let file = SequenceFile::single(path);
        let chunks = MultipartChunks::new(
            &file,
            "s01",
            "run-9",
            CancelToken::new(),
            SinkSet::new(),
        )
        .unwrap();
        let body = String::from_utf8(collect_body(chunks)).unwrap();

        assert_eq!(body.matches("name=\"file\"").count(), 1);
        assert_eq!(body.matches("name=\"parameters\"").count(), 1);
        assert!(body.contains("Content-Type: application/json"));
        assert!(body.contains("\"runId\":\"run-9\""));
        assert!(body.ends_with(&format!("--{BOUNDARY}--\r\n")));
    }

    #[test]
    fn paired_end_body_streams_files_back_to_back() {
        let dir = tempfile::tempdir().unwrap();
        let forward = temp_fastq(&dir, "s01_R1.fastq", 10);
        let reverse = temp_fastq(&dir, "s01_R2.fastq", 10);
        let file = SequenceFile::paired(forward, reverse);
        let chunks = MultipartChunks::new(
            &file,
            "s01",
            "run-9",
            CancelToken::new(),
            SinkSet::new(),
        )
        .unwrap();
        let body = String::from_utf8(collect_body(chunks)).unwrap();

        let file1 = body.find("name=\"file1\"").unwrap();
        let file2 = body.find("name=\"file2\"").unwrap();
        let params1 = body.find("name=\"parameters1\"").unwrap();
        let params2 = body.find("name=\"parameters2\"").unwrap();
        assert!(file1 < file2);
        assert!(file2 < params1);
        assert!(params1 < params2);
    }

    #[test]
    fn cancel_after_k_chunks_truncates_stream() {
        let dir = tempfile::tempdir().unwrap();
        // 5 full chunks.
        let path = temp_fastq(&dir, "big.fastq", CHUNK_SIZE * 5);
        let file = SequenceFile::single(path);
        let token = CancelToken::new();
        let mut chunks = MultipartChunks::new(
            &file,
            "s01",
            "run-9",
            token.clone(),
            SinkSet::new(),
        )
        .unwrap();

        // Header part.
        let header = chunks.next().unwrap().unwrap();
        assert!(header.starts_with(format!("--{BOUNDARY}").as_bytes()));

        // Two content chunks, then cancel.
        let mut content_chunks = 0;
        for _ in 0..2 {
            let chunk = chunks.next().unwrap().unwrap();
            assert_eq!(chunk.len(), CHUNK_SIZE);
            content_chunks += 1;
        }
        token.cancel();

        assert!(chunks.next().is_none());
        assert_eq!(content_chunks, 2);
    }

    #[test]
    fn missing_file_is_a_file_error() {
        let file = SequenceFile::single(Utf8PathBuf::from("/nonexistent/x.fastq"));
        let err = MultipartChunks::new(
            &file,
            "s01",
            "run-9",
            CancelToken::new(),
            SinkSet::new(),
        )
        .unwrap_err();
        assert_matches!(err, UploaderError::FileIo { .. });
    }

    #[test]
    fn file_metadata_keys_survive_alongside_run_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_fastq(&dir, "s01.fastq", 10);
        let mut file = SequenceFile::single(path);
        let mut metadata = BTreeMap::new();
        metadata.insert("lane".to_string(), serde_json::json!(3));
        file.metadata = metadata;

        let chunks = MultipartChunks::new(
            &file,
            "s01",
            "run-9",
            CancelToken::new(),
            SinkSet::new(),
        )
        .unwrap();
        let body = String::from_utf8(collect_body(chunks)).unwrap();
        assert!(body.contains("\"lane\":3"));
        assert!(body.contains("\"runId\":\"run-9\""));
    }

    #[test]
    fn chunk_reader_drains_full_body() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_fastq(&dir, "s01.fastq", CHUNK_SIZE + 17);
        let file = SequenceFile::single(path);
        let chunks = MultipartChunks::new(
            &file,
            "s01",
            "run-9",
            CancelToken::new(),
            SinkSet::new(),
        )
        .unwrap();
        let counter = chunks.bytes_sent_counter();

        let mut reader = ChunkReader::new(chunks, Arc::new(Mutex::new(None)));
        let mut body = Vec::new();
        reader.read_to_end(&mut body).unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), (CHUNK_SIZE + 17) as u64);
        let text = String::from_utf8(body).unwrap();
        assert!(text.ends_with(&format!("--{BOUNDARY}--\r\n")));
    }
}
