//! Study ledger shared by the runner and the CLI.

pub mod error;
pub mod io;
pub mod ledger;
pub mod model;

pub use error::{Result, Stage, StudyError};
pub use io::{atomic_write_bytes, atomic_write_json_pretty, ensure_dir};
pub use ledger::{validate_study_name, Ledger};
pub use model::{
    config_stem, now_timestamp, BenchmarkResult, BenchmarkSet, BenchmarkStatus, BlobRef, Run,
    Study,
};
