use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Pipeline stage that aborted an `execute` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    Build,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Init => "init",
            Stage::Build => "build",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum StudyError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("harness exited with status {status}: {detail}")]
    HarnessExit { status: i32, detail: String },

    #[error("run index {index} out of range (study has {len} run(s))")]
    OutOfRange { index: usize, len: usize },

    #[error("study '{0}' has no runs")]
    EmptyStudy(String),

    #[error("{stage} stage failed: {source}")]
    PipelineFatal {
        stage: Stage,
        #[source]
        source: Box<StudyError>,
    },

    #[error("ledger record is locked: {}", .0.display())]
    Locked(PathBuf),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl StudyError {
    pub fn fatal(stage: Stage, source: StudyError) -> Self {
        StudyError::PipelineFatal {
            stage,
            source: Box::new(source),
        }
    }

    /// Stable machine-readable code used by the CLI error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            StudyError::NotFound(_) => "not_found",
            StudyError::AlreadyExists(_) => "already_exists",
            StudyError::InvalidInput(_) => "invalid_input",
            StudyError::Transport(_) => "transport_error",
            StudyError::HarnessExit { .. } => "harness_failed",
            StudyError::OutOfRange { .. } => "out_of_range",
            StudyError::EmptyStudy(_) => "empty_study",
            StudyError::PipelineFatal { .. } => "pipeline_fatal",
            StudyError::Locked(_) => "locked",
            StudyError::Io(_) => "io_error",
            StudyError::Json(_) | StudyError::Yaml(_) => "parse_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, StudyError>;
