use crate::error::{IntelError, Result};
use crate::executor::{ExecutorSet, HttpExecutor, HttpExecutorConfig};
use crate::orchestrator::OrchestratorConfig;
use crate::paths;
use crate::registry::ModuleId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// OrchestratorSettings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    #[serde(default = "default_module_timeout")]
    pub module_timeout_secs: u64,
    #[serde(default = "default_synthesis_timeout")]
    pub synthesis_timeout_secs: u64,
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
}

fn default_module_timeout() -> u64 {
    300
}

fn default_synthesis_timeout() -> u64 {
    480
}

fn default_stale_after() -> u64 {
    600
}

fn default_log_capacity() -> usize {
    100
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            module_timeout_secs: default_module_timeout(),
            synthesis_timeout_secs: default_synthesis_timeout(),
            stale_after_secs: default_stale_after(),
            log_capacity: default_log_capacity(),
        }
    }
}

impl OrchestratorSettings {
    pub fn to_orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            module_timeout: Duration::from_secs(self.module_timeout_secs),
            synthesis_timeout: Duration::from_secs(self.synthesis_timeout_secs),
            stale_after: Duration::from_secs(self.stale_after_secs),
            log_capacity: self.log_capacity,
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutorSettings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutorSettings {
    /// Module `m` is sent to `<base_url>/<m>` unless overridden.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub overrides: BTreeMap<ModuleId, String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout() -> u64 {
    600
}

impl ExecutorSettings {
    pub fn url_for(&self, module: ModuleId) -> Option<String> {
        if let Some(url) = self.overrides.get(&module) {
            return Some(url.clone());
        }
        self.base_url
            .as_deref()
            .map(|base| format!("{}/{}", base.trim_end_matches('/'), module))
    }

    /// Build an `HttpExecutor` for every module. Fails on the first module
    /// without a URL.
    pub fn build_executor_set(&self) -> Result<ExecutorSet> {
        let timeout = Duration::from_secs(self.request_timeout_secs);
        let mut builder = ExecutorSet::builder();
        for module in ModuleId::ALL {
            let url = self
                .url_for(module)
                .ok_or_else(|| IntelError::MissingExecutor(module.to_string()))?;
            let executor = HttpExecutor::new(HttpExecutorConfig {
                url,
                request_timeout: timeout,
            })
            .map_err(|e| IntelError::Config(e.to_string()))?;
            builder = builder.register(module, Arc::new(executor));
        }
        builder.build()
    }
}

// ---------------------------------------------------------------------------
// ServerSettings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    3150
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

// ---------------------------------------------------------------------------
// IntelConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntelConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,
    #[serde(default)]
    pub executors: ExecutorSettings,
    #[serde(default)]
    pub server: ServerSettings,
    /// Database file; relative paths resolve against the project root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<PathBuf>,
}

impl IntelConfig {
    /// Load `.intel/config.yaml`, falling back to defaults when absent.
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: IntelConfig = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        crate::io::atomic_write(&path, self.to_yaml()?.as_bytes())
    }

    pub fn database_path(&self, root: &Path) -> PathBuf {
        match &self.database {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => root.join(p),
            None => paths::db_path(root),
        }
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let o = &self.orchestrator;

        if o.module_timeout_secs == 0 || o.synthesis_timeout_secs == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "module timeouts must be greater than zero".into(),
            });
        }

        // A healthy module that is still inside its timeout must never look stale.
        let longest = o.module_timeout_secs.max(o.synthesis_timeout_secs);
        if o.stale_after_secs <= longest {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "stale_after_secs ({}) should exceed the longest module timeout ({longest})",
                    o.stale_after_secs
                ),
            });
        }

        for module in ModuleId::ALL {
            if self.executors.url_for(module).is_none() {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Error,
                    message: format!("no executor URL for module '{module}'"),
                });
            }
        }

        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = IntelConfig::load(dir.path()).unwrap();
        assert_eq!(cfg, IntelConfig::default());
        assert_eq!(cfg.orchestrator.module_timeout_secs, 300);
        assert_eq!(cfg.orchestrator.synthesis_timeout_secs, 480);
        assert_eq!(cfg.orchestrator.stale_after_secs, 600);
    }

    #[test]
    fn partial_yaml_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".intel")).unwrap();
        std::fs::write(
            dir.path().join(".intel/config.yaml"),
            "executors:\n  base_url: http://workers:8080/\n  overrides:\n    news: http://news:9000/run\n",
        )
        .unwrap();

        let cfg = IntelConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.orchestrator, OrchestratorSettings::default());
        assert_eq!(
            cfg.executors.url_for(ModuleId::Participants).as_deref(),
            Some("http://workers:8080/participants")
        );
        assert_eq!(
            cfg.executors.url_for(ModuleId::News).as_deref(),
            Some("http://news:9000/run")
        );
        assert!(cfg.executors.build_executor_set().is_ok());
    }

    #[test]
    fn executor_set_requires_every_module() {
        let mut settings = ExecutorSettings::default();
        settings
            .overrides
            .insert(ModuleId::News, "http://news".into());
        let err = settings.build_executor_set().err().unwrap();
        assert!(matches!(err, IntelError::MissingExecutor(_)));
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let mut cfg = IntelConfig::default();
        cfg.server.port = 4000;
        cfg.save(dir.path()).unwrap();
        assert_eq!(IntelConfig::load(dir.path()).unwrap(), cfg);
    }

    #[test]
    fn validate_flags_short_staleness_and_missing_urls() {
        let mut cfg = IntelConfig::default();
        cfg.orchestrator.stale_after_secs = 60;
        let warnings = cfg.validate();
        assert!(warnings
            .iter()
            .any(|w| w.level == WarnLevel::Warning && w.message.contains("stale_after_secs")));
        assert_eq!(
            warnings
                .iter()
                .filter(|w| w.message.starts_with("no executor URL"))
                .count(),
            ModuleId::ALL.len()
        );
    }

    #[test]
    fn relative_database_resolves_against_root() {
        let cfg = IntelConfig {
            database: Some(PathBuf::from("data/intel.db")),
            ..Default::default()
        };
        assert_eq!(
            cfg.database_path(Path::new("/srv/app")),
            PathBuf::from("/srv/app/data/intel.db")
        );
    }
}
