use std::collections::BTreeMap;
use std::fmt;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::UploaderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LayoutType {
    PairedEnd,
    SingleEnd,
}

impl fmt::Display for LayoutType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayoutType::PairedEnd => write!(f, "PAIRED_END"),
            LayoutType::SingleEnd => write!(f, "SINGLE_END"),
        }
    }
}

/// Persisted per-run upload status. The state machine in `state` is the only
/// writer; everything else reads it through that module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadStatus {
    New,
    InProgress,
    Partial,
    Complete,
    Error,
    Delayed,
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadStatus::New => write!(f, "NEW"),
            UploadStatus::InProgress => write!(f, "IN_PROGRESS"),
            UploadStatus::Partial => write!(f, "PARTIAL"),
            UploadStatus::Complete => write!(f, "COMPLETE"),
            UploadStatus::Error => write!(f, "ERROR"),
            UploadStatus::Delayed => write!(f, "DELAYED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    pub name: String,
    #[serde(default, rename = "projectDescription")]
    pub description: Option<String>,
}

impl Project {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            identifier: None,
            name: name.into(),
            description: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    #[serde(rename = "sampleName")]
    pub sample_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    /// Ordering key used by some instruments (lane/well position).
    #[serde(default, rename = "sortKey")]
    pub sort_key: Option<i64>,
    #[serde(default, rename = "sequenceFile")]
    pub sequence_file: Option<SequenceFile>,
}

impl Sample {
    pub fn validate(&self) -> Result<(), UploaderError> {
        if self.sample_name.chars().count() < 3 {
            return Err(UploaderError::InvalidSample {
                name: self.sample_name.clone(),
                message: "sample name must be at least 3 characters".to_string(),
            });
        }
        let Some(file) = &self.sequence_file else {
            return Err(UploaderError::InvalidSample {
                name: self.sample_name.clone(),
                message: "sample has no sequence file attached".to_string(),
            });
        };
        file.validate().map_err(|err| UploaderError::InvalidSample {
            name: self.sample_name.clone(),
            message: err.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceFile {
    /// 1 path for single-end reads, 2 for paired-end. Anything else is
    /// rejected by `validate`.
    pub files: Vec<Utf8PathBuf>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl SequenceFile {
    pub fn single(path: Utf8PathBuf) -> Self {
        Self {
            files: vec![path],
            metadata: BTreeMap::new(),
        }
    }

    pub fn paired(forward: Utf8PathBuf, reverse: Utf8PathBuf) -> Self {
        Self {
            files: vec![forward, reverse],
            metadata: BTreeMap::new(),
        }
    }

    pub fn is_paired_end(&self) -> bool {
        self.files.len() == 2
    }

    pub fn layout(&self) -> Result<LayoutType, UploaderError> {
        self.validate()?;
        if self.is_paired_end() {
            Ok(LayoutType::PairedEnd)
        } else {
            Ok(LayoutType::SingleEnd)
        }
    }

    pub fn validate(&self) -> Result<(), UploaderError> {
        match self.files.len() {
            1 | 2 => Ok(()),
            count => Err(UploaderError::InvalidRun(format!(
                "sequence file must list 1 or 2 paths, got {count}"
            ))),
        }
    }
}

/// One project's slice of a run: the project plus the samples destined for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunProject {
    pub project: Project,
    pub samples: Vec<Sample>,
}

/// A fully-formed run as produced by an instrument parser. The uploader never
/// reads sample sheets itself; it consumes this structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencingRun {
    /// Run-level metadata. Must contain `layoutType`; unknown keys are
    /// tolerated and filtered against the server allow-list at submission.
    pub metadata: BTreeMap<String, Value>,
    pub projects: Vec<RunProject>,
    /// Discriminator for the originating instrument family ("miseq",
    /// "directory", ...). Opaque to the uploader, forwarded to the server.
    #[serde(rename = "runType")]
    pub run_type: String,
}

impl SequencingRun {
    pub fn layout_type(&self) -> Result<LayoutType, UploaderError> {
        let value = self.metadata.get("layoutType").ok_or_else(|| {
            UploaderError::InvalidRun("run metadata is missing layoutType".to_string())
        })?;
        serde_json::from_value(value.clone())
            .map_err(|_| UploaderError::InvalidRun(format!("unknown layoutType: {value}")))
    }

    /// Full structural validation: non-empty projects, valid samples, and a
    /// homogeneous read layout matching the declared `layoutType`.
    pub fn validate(&self) -> Result<(), UploaderError> {
        let layout = self.layout_type()?;
        if self.projects.is_empty() {
            return Err(UploaderError::InvalidRun(
                "run contains no projects".to_string(),
            ));
        }
        for run_project in &self.projects {
            if run_project.samples.is_empty() {
                return Err(UploaderError::InvalidRun(format!(
                    "project {} contains no samples",
                    run_project.project.name
                )));
            }
            for sample in &run_project.samples {
                sample.validate()?;
                if let Some(file) = &sample.sequence_file {
                    let sample_layout = file.layout()?;
                    if sample_layout != layout {
                        return Err(UploaderError::InvalidRun(format!(
                            "sample {} has {sample_layout} reads but the run declares {layout}",
                            sample.sample_name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn sample_count(&self) -> usize {
        self.projects.iter().map(|p| p.samples.len()).sum()
    }
}
