//! Remote benchmark orchestration: sessions, blob stores, the study
//! pipeline and the reconciler that pulls artifacts back down.

pub mod blob;
pub mod config;
pub mod pipeline;
pub mod process;
pub mod remote;
pub mod stages;
pub mod sync;

pub use blob::{AwsCliBlobStore, BlobStore, FsBlobStore};
pub use config::{
    collect_configs, discover_configs, ensure_distinct_stems, BenchmarkConfig, HarnessLayout,
    RunnerConfig, RunnerConfigFile, DEFAULT_BUCKET, DEFAULT_RUNNER_CONFIG,
};
pub use pipeline::{request_stop, CancelToken, ExecuteOptions, PipelineRunner, RunOutcome};
pub use remote::{CommandOutput, Connector, RemoteSession, SshConnector, SshSession};
pub use sync::{Reconciler, RunSelector, SyncReport};
