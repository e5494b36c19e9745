use crate::errors::ReplayError;
use crate::logging::{DEFAULT_BUFFER_LINES, DEFAULT_MAX_PAYLOAD_BYTES};
use crate::retry::ExecuteOptions;
use crate::runtime::FileSystem;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const MAX_CONFIGURED_RETRIES: u32 = 20;

#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub db_path: Option<PathBuf>,
    pub driver_program: Option<String>,
    pub log_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    pub retry: RetryConfig,
    pub injection: InjectionConfig,
    pub replay: ReplayConfig,
    pub logging: LoggingConfig,
    pub storage: StorageConfig,
    pub surface: SurfaceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryConfig {
    pub enabled: bool,
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl RetryConfig {
    pub fn execute_options(&self) -> ExecuteOptions {
        ExecuteOptions {
            retry: self.enabled,
            max_retries: self.max_retries,
            delay: Duration::from_millis(self.base_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InjectionConfig {
    pub case_sensitive: bool,
    pub skip_empty_inputs: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplayConfig {
    pub auto_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub path: Option<PathBuf>,
    pub max_payload_bytes: usize,
    pub buffer_lines: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageConfig {
    pub db_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SurfaceConfig {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig {
                enabled: true,
                max_retries: 3,
                base_delay_ms: 500,
            },
            injection: InjectionConfig {
                case_sensitive: true,
                skip_empty_inputs: false,
            },
            replay: ReplayConfig { auto_run: true },
            logging: LoggingConfig {
                path: None,
                max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
                buffer_lines: DEFAULT_BUFFER_LINES,
            },
            storage: StorageConfig {
                db_path: PathBuf::from(".cache/stepreplay/engine.sqlite"),
            },
            surface: SurfaceConfig {
                program: String::new(),
                args: Vec::new(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialEngineConfig {
    retry: Option<PartialRetryConfig>,
    injection: Option<PartialInjectionConfig>,
    replay: Option<PartialReplayConfig>,
    logging: Option<PartialLoggingConfig>,
    storage: Option<PartialStorageConfig>,
    surface: Option<PartialSurfaceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialRetryConfig {
    enabled: Option<bool>,
    max_retries: Option<u32>,
    base_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialInjectionConfig {
    case_sensitive: Option<bool>,
    skip_empty_inputs: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialReplayConfig {
    auto_run: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialLoggingConfig {
    path: Option<PathBuf>,
    max_payload_bytes: Option<usize>,
    buffer_lines: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialStorageConfig {
    db_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialSurfaceConfig {
    program: Option<String>,
    args: Option<Vec<String>>,
}

pub fn load_config(
    overrides: &CliOverrides,
    process_cwd: &Path,
    fs: &dyn FileSystem,
) -> Result<EngineConfig, ReplayError> {
    let mut cfg = EngineConfig::default();

    if let Some(path) = &overrides.config_path {
        let file_contents = fs.read_to_string(path)?;
        cfg = parse_config_str(&file_contents)?;
    }

    apply_cli_overrides(&mut cfg, overrides);
    resolve_paths(&mut cfg, process_cwd);
    validate_config(&cfg)?;
    Ok(cfg)
}

/// Parses a TOML document on top of the defaults without resolving paths.
pub fn parse_config_str(contents: &str) -> Result<EngineConfig, ReplayError> {
    let partial: PartialEngineConfig =
        toml::from_str(contents).map_err(|e| ReplayError::ConfigParse(e.to_string()))?;
    let mut cfg = EngineConfig::default();
    merge_partial_config(&mut cfg, partial);
    Ok(cfg)
}

fn merge_partial_config(cfg: &mut EngineConfig, partial: PartialEngineConfig) {
    if let Some(retry) = partial.retry {
        if let Some(value) = retry.enabled {
            cfg.retry.enabled = value;
        }
        if let Some(value) = retry.max_retries {
            cfg.retry.max_retries = value;
        }
        if let Some(value) = retry.base_delay_ms {
            cfg.retry.base_delay_ms = value;
        }
    }

    if let Some(injection) = partial.injection {
        if let Some(value) = injection.case_sensitive {
            cfg.injection.case_sensitive = value;
        }
        if let Some(value) = injection.skip_empty_inputs {
            cfg.injection.skip_empty_inputs = value;
        }
    }

    if let Some(replay) = partial.replay {
        if let Some(value) = replay.auto_run {
            cfg.replay.auto_run = value;
        }
    }

    if let Some(logging) = partial.logging {
        if let Some(path) = logging.path {
            cfg.logging.path = Some(path);
        }
        if let Some(value) = logging.max_payload_bytes {
            cfg.logging.max_payload_bytes = value;
        }
        if let Some(value) = logging.buffer_lines {
            cfg.logging.buffer_lines = value;
        }
    }

    if let Some(storage) = partial.storage {
        if let Some(path) = storage.db_path {
            cfg.storage.db_path = path;
        }
    }

    if let Some(surface) = partial.surface {
        if let Some(program) = surface.program {
            cfg.surface.program = program;
        }
        if let Some(args) = surface.args {
            cfg.surface.args = args;
        }
    }
}

fn apply_cli_overrides(cfg: &mut EngineConfig, overrides: &CliOverrides) {
    if let Some(path) = &overrides.db_path {
        cfg.storage.db_path = path.clone();
    }
    if let Some(program) = &overrides.driver_program {
        cfg.surface.program = program.clone();
    }
    if let Some(path) = &overrides.log_path {
        cfg.logging.path = Some(path.clone());
    }
}

fn resolve_paths(cfg: &mut EngineConfig, process_cwd: &Path) {
    cfg.storage.db_path = absolutize_path(process_cwd, &cfg.storage.db_path);
    if let Some(path) = &cfg.logging.path {
        cfg.logging.path = Some(absolutize_path(process_cwd, path));
    }
}

fn absolutize_path(base: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else {
        base.join(value)
    }
}

pub fn validate_config(cfg: &EngineConfig) -> Result<(), ReplayError> {
    if cfg.retry.max_retries > MAX_CONFIGURED_RETRIES {
        return Err(ReplayError::InvalidConfig(format!(
            "retry.max_retries must be at most {MAX_CONFIGURED_RETRIES}"
        )));
    }
    if cfg.logging.max_payload_bytes == 0 {
        return Err(ReplayError::InvalidConfig(
            "logging.max_payload_bytes must be greater than zero".to_string(),
        ));
    }
    if cfg.storage.db_path.as_os_str().is_empty() {
        return Err(ReplayError::InvalidConfig(
            "storage.db_path must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Checked separately so `--print-config` works without a driver.
pub fn require_surface(cfg: &EngineConfig) -> Result<(), ReplayError> {
    if cfg.surface.program.trim().is_empty() {
        return Err(ReplayError::InvalidConfig(
            "surface.program is required to serve the command bus".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::FakeFileSystem;

    #[test]
    fn partial_file_overrides_only_named_fields() {
        let fs = FakeFileSystem::with_file(
            "/cfg/engine.toml",
            "[retry]\nmax_retries = 5\n\n[injection]\ncase_sensitive = false\n",
        );
        let cfg = load_config(
            &CliOverrides {
                config_path: Some(PathBuf::from("/cfg/engine.toml")),
                ..CliOverrides::default()
            },
            Path::new("/work"),
            &fs,
        )
        .expect("config");

        assert_eq!(cfg.retry.max_retries, 5);
        assert_eq!(cfg.retry.base_delay_ms, 500);
        assert!(!cfg.injection.case_sensitive);
        assert!(!cfg.injection.skip_empty_inputs);
        assert_eq!(
            cfg.storage.db_path,
            PathBuf::from("/work/.cache/stepreplay/engine.sqlite")
        );
    }

    #[test]
    fn cli_overrides_win_over_file_values() {
        let fs = FakeFileSystem::with_file(
            "/cfg/engine.toml",
            "[surface]\nprogram = \"from-file\"\n[storage]\ndb_path = \"/data/a.sqlite\"\n",
        );
        let cfg = load_config(
            &CliOverrides {
                config_path: Some(PathBuf::from("/cfg/engine.toml")),
                driver_program: Some("from-cli".to_string()),
                log_path: Some(PathBuf::from("logs/engine.jsonl")),
                ..CliOverrides::default()
            },
            Path::new("/work"),
            &fs,
        )
        .expect("config");
        assert_eq!(cfg.surface.program, "from-cli");
        assert_eq!(cfg.storage.db_path, PathBuf::from("/data/a.sqlite"));
        assert_eq!(
            cfg.logging.path,
            Some(PathBuf::from("/work/logs/engine.jsonl"))
        );
        assert!(require_surface(&cfg).is_ok());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let fs = FakeFileSystem::with_file("/c.toml", "[retry]\nmax_retries = 99\n");
        let err = load_config(
            &CliOverrides {
                config_path: Some(PathBuf::from("/c.toml")),
                ..CliOverrides::default()
            },
            Path::new("/"),
            &fs,
        )
        .expect_err("too many retries");
        assert!(matches!(err, ReplayError::InvalidConfig(_)));

        let err = parse_config_str("[retry\n").expect_err("bad toml");
        assert!(matches!(err, ReplayError::ConfigParse(_)));
        assert!(require_surface(&EngineConfig::default()).is_err());
    }

    #[test]
    fn retry_section_maps_to_execute_options() {
        let options = EngineConfig::default().retry.execute_options();
        assert!(options.retry);
        assert_eq!(options.max_retries, 3);
        assert_eq!(options.delay, Duration::from_millis(500));
    }
}
