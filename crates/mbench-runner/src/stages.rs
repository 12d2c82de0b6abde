//! Individual pipeline steps against a remote session.
//!
//! These are shared by the study pipeline and the ledger-free `runner`
//! subcommands.

use crate::blob::BlobStore;
use crate::config::HarnessLayout;
use crate::process::{shell_join, shell_quote};
use crate::remote::{run_checked, CommandOutput, RemoteSession};
use chrono::NaiveDateTime;
use mbench_core::{config_stem, BlobRef, Result};
use std::path::Path;

/// Removes the harness checkout, then clones and restores it at the layout's branch.
pub fn init_harness<S: RemoteSession + ?Sized>(session: &mut S, layout: &HarnessLayout) -> Result<()> {
    let home = shell_quote(&layout.home_dir);
    let cleanup = format!(
        "cd {} && rm -rf {}",
        home,
        shell_quote(&layout.checkout_dir)
    );
    let removed = session.run(&cleanup)?;
    if !removed.success() {
        tracing::warn!(exit_code = removed.exit_code, "removing previous checkout failed, continuing");
    }
    let setup = format!(
        "cd {} && git clone --recurse-submodules {} {} && cd {} && git checkout {} && cd {} && {}",
        home,
        shell_quote(&layout.repo_url),
        shell_quote(&layout.checkout_dir),
        shell_quote(&layout.checkout_dir),
        shell_quote(&layout.repo_branch),
        shell_quote(&layout.runner_dir),
        layout.restore_command
    );
    run_checked(session, &setup)?;
    Ok(())
}

/// Checks out `core_version` (`latest` -> default branch) and builds it in release mode.
pub fn build_core<S: RemoteSession + ?Sized>(
    session: &mut S,
    layout: &HarnessLayout,
    core_version: &str,
) -> Result<()> {
    let reference = layout.resolve_core_ref(core_version);
    let command = format!(
        "cd {} && git checkout {} && {}",
        shell_quote(&layout.core_path()),
        shell_quote(&reference),
        layout.build_command
    );
    run_checked(session, &command)?;
    Ok(())
}

/// Remote scratch paths and blob keys for one benchmark execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenchmarkPaths {
    pub remote_config: String,
    pub remote_log: String,
    pub remote_zip: String,
    pub results: BlobRef,
    pub logs: BlobRef,
}

impl BenchmarkPaths {
    /// Keys follow `{study}/{date}/{stem}_{timestamp}_{results.zip|logs.txt}`.
    pub fn new(
        layout: &HarnessLayout,
        bucket: &str,
        study: &str,
        run_date: &str,
        config_name: &str,
        at: NaiveDateTime,
    ) -> Self {
        let stem = config_stem(config_name);
        let stamp = at.format("%Y%m%d_%H%M%S_%6f").to_string();
        let prefix = format!("{}/{}/{}_{}", study, run_date, stem, stamp);
        Self {
            remote_config: layout.scratch_path(config_name),
            remote_log: layout.scratch_path(&format!("{}_logs.txt", stem)),
            remote_zip: layout.scratch_path(&format!("{}_{}_results.zip", stem, stamp)),
            results: BlobRef::new(bucket, format!("{}_results.zip", prefix)),
            logs: BlobRef::new(bucket, format!("{}_logs.txt", prefix)),
        }
    }
}

pub fn render_bench_command(layout: &HarnessLayout, remote_config: &str) -> String {
    layout
        .bench_command
        .replace("{config}", &shell_quote(remote_config))
        .replace("{core_dir}", &shell_quote(&layout.core_path()))
}

/// Runs the harness on an uploaded config. Output is teed to `remote_log`
/// when given; the exit code is the harness's, not `tee`'s.
pub fn run_harness<S: RemoteSession + ?Sized>(
    session: &mut S,
    layout: &HarnessLayout,
    remote_config: &str,
    remote_log: Option<&str>,
) -> Result<CommandOutput> {
    let bench = render_bench_command(layout, remote_config);
    let command = match remote_log {
        Some(log) => format!(
            "set -o pipefail && cd {} && {} 2>&1 | tee {}",
            shell_quote(&layout.runner_path()),
            bench,
            shell_quote(log)
        ),
        None => format!("cd {} && {}", shell_quote(&layout.runner_path()), bench),
    };
    session.run(&command)
}

/// Zips the harness artifacts directory into `remote_zip`.
pub fn package_artifacts<S: RemoteSession + ?Sized>(
    session: &mut S,
    layout: &HarnessLayout,
    remote_zip: &str,
) -> Result<()> {
    let command = format!(
        "cd {} && zip -q -r {} {}",
        shell_quote(&layout.runner_path()),
        shell_quote(remote_zip),
        shell_quote(&layout.artifacts_dir)
    );
    run_checked(session, &command)?;
    Ok(())
}

/// Deletes scratch copies and the artifacts directory so the next config starts clean.
pub fn cleanup_scratch<S: RemoteSession + ?Sized>(
    session: &mut S,
    layout: &HarnessLayout,
    scratch_files: &[&str],
) -> Result<()> {
    let files: Vec<String> = scratch_files.iter().map(|f| f.to_string()).collect();
    run_checked(session, &format!("rm -f {}", shell_join(&files)))?;
    run_checked(
        session,
        &format!(
            "cd {} && rm -rf {}",
            shell_quote(&layout.runner_path()),
            shell_quote(&layout.artifacts_dir)
        ),
    )?;
    Ok(())
}

/// Packages whatever artifacts the harness left behind, stores them under
/// `blob` and fetches them into `output_dir`. Returns the local file.
pub fn retrieve_results<S, B>(
    session: &mut S,
    blobs: &B,
    layout: &HarnessLayout,
    blob: &BlobRef,
    output_dir: &Path,
) -> Result<std::path::PathBuf>
where
    S: RemoteSession + ?Sized,
    B: BlobStore + ?Sized,
{
    let file_name = Path::new(&blob.key)
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("benchmark-artifacts.zip")
        .to_string();
    let remote_zip = layout.scratch_path(&file_name);
    package_artifacts(session, layout, &remote_zip)?;

    let staging = tempfile::Builder::new().prefix("mbench-retrieve-").tempdir()?;
    let staged = staging.path().join(&file_name);
    session.download(&remote_zip, &staged)?;
    blobs.put(&staged, blob)?;

    mbench_core::ensure_dir(output_dir)?;
    let local = output_dir.join(&file_name);
    blobs.get(blob, &local)?;
    tracing::info!(blob = %blob, local = %local.display(), "retrieved results");
    Ok(local)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, 1)
            .unwrap()
            .and_hms_micro_opt(9, 30, 5, 42)
            .unwrap()
    }

    #[test]
    fn benchmark_paths_follow_key_scheme() {
        let layout = HarnessLayout::default();
        let paths = BenchmarkPaths::new(&layout, "bucket", "s1", "2025-06-01", "queue.yaml", at());
        assert_eq!(paths.remote_config, "/tmp/queue.yaml");
        assert_eq!(paths.remote_log, "/tmp/queue_logs.txt");
        assert_eq!(paths.remote_zip, "/tmp/queue_20250601_093005_000042_results.zip");
        assert_eq!(
            paths.results.uri(),
            "s3://bucket/s1/2025-06-01/queue_20250601_093005_000042_results.zip"
        );
        assert_eq!(
            paths.logs.uri(),
            "s3://bucket/s1/2025-06-01/queue_20250601_093005_000042_logs.txt"
        );
    }

    #[test]
    fn bench_command_substitutes_placeholders() {
        let layout = HarnessLayout::default();
        let cmd = render_bench_command(&layout, "/tmp/a.json");
        assert_eq!(
            cmd,
            "dotnet run -c RELEASE --project ./BenchmoniK/BenchmoniK.csproj -- -c /tmp/a.json --armonik-core /home/ubuntu/ArmoniK.Microbench/ArmoniK.Core/"
        );
    }

    #[derive(Default)]
    struct Recorder {
        commands: Vec<String>,
        fail_first: bool,
    }

    impl RemoteSession for Recorder {
        fn run(&mut self, command: &str) -> Result<CommandOutput> {
            let exit_code = if self.fail_first && self.commands.is_empty() { 1 } else { 0 };
            self.commands.push(command.to_string());
            Ok(CommandOutput {
                exit_code,
                stdout: String::new(),
                stderr: String::new(),
            })
        }

        fn upload(&mut self, _local: &Path, _remote: &str) -> Result<()> {
            Ok(())
        }

        fn download(&mut self, remote: &str, local: &Path) -> Result<()> {
            std::fs::write(local, format!("zip of {}", remote))?;
            Ok(())
        }
    }

    #[test]
    fn init_ignores_failed_cleanup() {
        let mut session = Recorder {
            fail_first: true,
            ..Default::default()
        };
        init_harness(&mut session, &HarnessLayout::default()).expect("init");
        assert_eq!(session.commands.len(), 2);
        assert!(session.commands[0].contains("rm -rf ArmoniK.Microbench"));
        assert!(session.commands[1].contains("git clone --recurse-submodules"));
    }

    #[test]
    fn retrieve_results_stores_and_fetches_archive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let blobs = crate::blob::FsBlobStore::new(dir.path().join("blobs"));
        let blob = BlobRef::new("bucket", "manual/benchmark-artifacts.zip");
        let mut session = Recorder::default();

        let local = retrieve_results(&mut session, &blobs, &HarnessLayout::default(), &blob, &dir.path().join("out"))
            .expect("retrieve");
        assert_eq!(local, dir.path().join("out").join("benchmark-artifacts.zip"));
        assert_eq!(
            std::fs::read_to_string(&local).expect("read"),
            "zip of /tmp/benchmark-artifacts.zip"
        );
        assert!(session.commands[0].contains("zip -q -r /tmp/benchmark-artifacts.zip"));
    }
}
