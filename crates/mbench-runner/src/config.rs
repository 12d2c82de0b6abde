use mbench_core::{config_stem, Result, StudyError};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_RUNNER_CONFIG: &str = "./infrastructure/benchmark_configs/runners/benchmark_runner.json";
pub const DEFAULT_BUCKET: &str = "armonik-microbench-results";
pub const CONFIG_EXTENSIONS: &[&str] = &["json", "yaml", "yml"];

/// Where the harness lives on the worker and how it is driven.
///
/// Every field can be overridden from the `harness` section of the runner
/// config file; missing fields keep their defaults.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct HarnessLayout {
    pub home_dir: String,
    pub checkout_dir: String,
    pub repo_url: String,
    pub repo_branch: String,
    pub runner_dir: String,
    pub core_dir: String,
    pub core_default_branch: String,
    pub scratch_dir: String,
    pub artifacts_dir: String,
    pub restore_command: String,
    pub build_command: String,
    /// `{config}` and `{core_dir}` are substituted before running.
    pub bench_command: String,
}

impl Default for HarnessLayout {
    fn default() -> Self {
        Self {
            home_dir: "/home/ubuntu".to_string(),
            checkout_dir: "ArmoniK.Microbench".to_string(),
            repo_url: "https://github.com/aneoconsulting/ArmoniK.Microbench.git".to_string(),
            repo_branch: "main".to_string(),
            runner_dir: "benchmark_runner".to_string(),
            core_dir: "ArmoniK.Core".to_string(),
            core_default_branch: "main".to_string(),
            scratch_dir: "/tmp".to_string(),
            artifacts_dir: "BenchmarkDotNet.Artifacts".to_string(),
            restore_command: "dotnet restore ./BenchmoniK.sln".to_string(),
            build_command: "dotnet restore ArmoniK.Core.sln && dotnet build -c Release".to_string(),
            bench_command: "dotnet run -c RELEASE --project ./BenchmoniK/BenchmoniK.csproj -- -c {config} --armonik-core {core_dir}/".to_string(),
        }
    }
}

impl HarnessLayout {
    pub fn checkout_path(&self) -> String {
        format!("{}/{}", self.home_dir.trim_end_matches('/'), self.checkout_dir)
    }

    pub fn runner_path(&self) -> String {
        format!("{}/{}", self.checkout_path(), self.runner_dir)
    }

    pub fn core_path(&self) -> String {
        format!("{}/{}", self.checkout_path(), self.core_dir)
    }

    pub fn scratch_path(&self, file_name: &str) -> String {
        format!("{}/{}", self.scratch_dir.trim_end_matches('/'), file_name)
    }

    /// `latest` follows the core repository's default branch.
    pub fn resolve_core_ref(&self, core_version: &str) -> String {
        if core_version == "latest" {
            self.core_default_branch.clone()
        } else {
            core_version.to_string()
        }
    }

    pub fn with_repo(mut self, url: Option<&str>, branch: Option<&str>) -> Self {
        if let Some(url) = url {
            self.repo_url = url.to_string();
        }
        if let Some(branch) = branch {
            self.repo_branch = branch.to_string();
        }
        self
    }
}

/// Connection parameters for the worker host.
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerConfig {
    pub host: String,
    pub key: PathBuf,
    pub user: String,
    pub command_timeout: Option<Duration>,
    pub layout: HarnessLayout,
}

impl RunnerConfig {
    pub fn new(host: impl Into<String>, key: impl Into<PathBuf>) -> Result<Self> {
        let host = host.into();
        let key = key.into();
        if host.trim().is_empty() {
            return Err(StudyError::InvalidInput("runner host cannot be empty".into()));
        }
        if key.as_os_str().is_empty() {
            return Err(StudyError::InvalidInput("runner key path cannot be empty".into()));
        }
        Ok(Self {
            host,
            key,
            user: "ubuntu".to_string(),
            command_timeout: None,
            layout: HarnessLayout::default(),
        })
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        let host = value
            .get("host")
            .and_then(|v| v.as_str())
            .ok_or_else(|| StudyError::InvalidInput("runner config is missing 'host'".into()))?;
        let key = value
            .get("key")
            .and_then(|v| v.as_str())
            .ok_or_else(|| StudyError::InvalidInput("runner config is missing 'key'".into()))?;
        let mut config = Self::new(host, key)?;
        if let Some(user) = value.get("user").and_then(|v| v.as_str()) {
            config.user = user.to_string();
        }
        config.command_timeout = value
            .get("command_timeout_secs")
            .and_then(|v| v.as_u64())
            .filter(|s| *s > 0)
            .map(Duration::from_secs);
        if let Some(section) = value.get("harness") {
            config.layout = serde_json::from_value(section.clone())?;
        }
        Ok(config)
    }
}

/// Runner config as loaded from disk, with the raw document kept for the run snapshot.
#[derive(Debug, Clone)]
pub struct RunnerConfigFile {
    pub path: PathBuf,
    pub contents: Value,
    pub config: RunnerConfig,
}

impl RunnerConfigFile {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = load_structured(path)?;
        let config = RunnerConfig::from_value(&contents)?;
        Ok(Self {
            path: path.to_path_buf(),
            contents,
            config,
        })
    }
}

/// Reads a JSON or YAML document into a JSON value.
pub fn load_structured(path: &Path) -> Result<Value> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StudyError::NotFound(format!("file not found: {}", path.display())))
        }
        Err(e) => return Err(e.into()),
    };
    if has_extension(path, &["json"]) {
        return Ok(serde_json::from_str(&raw)?);
    }
    let yaml_value: serde_yaml::Value = serde_yaml::from_str(&raw)?;
    Ok(serde_json::to_value(yaml_value)?)
}

/// One benchmark config, captured verbatim when it is loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkConfig {
    pub name: String,
    pub source: String,
}

impl BenchmarkConfig {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .and_then(|s| s.to_str())
            .ok_or_else(|| {
                StudyError::InvalidInput(format!("invalid config path: {}", path.display()))
            })?
            .to_string();
        let source = match fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StudyError::NotFound(format!(
                    "config file not found: {}",
                    path.display()
                )))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self { name, source })
    }
}

fn has_extension(path: &Path, allowed: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| allowed.iter().any(|a| a.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

/// Config files directly inside `dir` with a recognized extension, sorted by name.
pub fn discover_configs(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(StudyError::NotFound(format!(
            "config directory not found: {}",
            dir.display()
        )));
    }
    let mut found = Vec::new();
    let walker = walkdir::WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name();
    for entry in walker {
        let entry = entry.map_err(|e| StudyError::Io(e.into()))?;
        if entry.file_type().is_file() && has_extension(entry.path(), CONFIG_EXTENSIONS) {
            found.push(entry.into_path());
        }
    }
    Ok(found)
}

/// Explicit files first, then directory contents.
pub fn collect_configs(files: &[PathBuf], dir: Option<&Path>) -> Result<Vec<BenchmarkConfig>> {
    let mut paths: Vec<PathBuf> = files.to_vec();
    if let Some(dir) = dir {
        paths.extend(discover_configs(dir)?);
    }
    let configs = paths
        .iter()
        .map(|p| BenchmarkConfig::from_path(p))
        .collect::<Result<Vec<_>>>()?;
    ensure_distinct_stems(&configs)?;
    Ok(configs)
}

/// Config names key the run's benchmark map and their stems name the synced
/// directories, so both must be unique within a run (`a.json` and `a.yaml`
/// collide).
pub fn ensure_distinct_stems(configs: &[BenchmarkConfig]) -> Result<()> {
    let mut seen: BTreeMap<String, &str> = BTreeMap::new();
    for config in configs {
        let stem = config_stem(&config.name);
        if let Some(first) = seen.insert(stem.clone(), config.name.as_str()) {
            let message = if first == config.name {
                format!("duplicate benchmark config name: {}", config.name)
            } else {
                format!(
                    "benchmark configs {} and {} share the stem '{}'",
                    first, config.name, stem
                )
            };
            return Err(StudyError::InvalidInput(message));
        }
    }
    Ok(())
}
