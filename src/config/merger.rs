// Configuration merging with priority
//
// Settings come from the project settings file (devlight.toml) and from CLI
// flags. Both are partial; the merger layers them over the defaults.

use super::{ProjectType, ProxyRule, ServerConfig};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the project-level settings file
pub const SETTINGS_FILE_NAME: &str = "devlight.toml";

/// Partial settings for merging
/// Uses Option<T> for all fields to support partial overrides
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PartialSettings {
    pub port: Option<u16>,
    pub host: Option<String>,
    pub https: Option<bool>,
    pub spa: Option<bool>,
    pub show_overlay: Option<bool>,
    pub open_browser: Option<bool>,
    pub watch_patterns: Option<Vec<String>>,
    pub ignore_patterns: Option<Vec<String>>,
    /// Path prefix -> target URL
    pub proxy: Option<BTreeMap<String, String>>,
    pub project_type: Option<ProjectType>,
    pub hmr_timeout_secs: Option<u64>,
    pub collab_max_documents: Option<usize>,
}

impl PartialSettings {
    /// Load settings from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read settings file '{}': {}", path.display(), e))?;

        let settings: PartialSettings = toml::from_str(&contents)
            .map_err(|e| anyhow!("Failed to parse settings file '{}': {}", path.display(), e))?;

        log::debug!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    /// Load `devlight.toml` from the project root if it exists
    pub fn load_from_project(root: &Path) -> Result<Option<Self>> {
        let path = root.join(SETTINGS_FILE_NAME);
        if !path.exists() {
            return Ok(None);
        }
        Self::load(&path).map(Some)
    }
}

/// Configuration merger
/// Priority order: CLI -> Project -> Defaults
pub struct ConfigMerger {
    root: PathBuf,
    project: Option<PartialSettings>,
    cli: Option<PartialSettings>,
}

impl ConfigMerger {
    /// Create a new config merger for a project root
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            project: None,
            cli: None,
        }
    }

    /// Set project settings
    pub fn with_project(mut self, settings: Option<PartialSettings>) -> Self {
        self.project = settings;
        self
    }

    /// Set CLI overrides
    pub fn with_cli(mut self, settings: Option<PartialSettings>) -> Self {
        self.cli = settings;
        self
    }

    /// Merge all layers into an immutable server configuration
    pub fn merge(&self) -> Result<ServerConfig> {
        let root = self
            .root
            .canonicalize()
            .map_err(|e| anyhow!("Root directory '{}' is not usable: {}", self.root.display(), e))?;

        if !root.is_dir() {
            return Err(anyhow!("Root path '{}' is not a directory", root.display()));
        }

        let mut config = ServerConfig::new(root);

        if let Some(ref project) = self.project {
            apply_partial(&mut config, project)?;
        }

        if let Some(ref cli) = self.cli {
            apply_partial(&mut config, cli)?;
        }

        Ok(config)
    }
}

fn apply_partial(config: &mut ServerConfig, partial: &PartialSettings) -> Result<()> {
    if let Some(port) = partial.port {
        config.port = port;
    }
    if let Some(ref host) = partial.host {
        config.host = host.clone();
    }
    if let Some(https) = partial.https {
        config.use_https = https;
    }
    if let Some(spa) = partial.spa {
        config.spa_mode = spa;
    }
    if let Some(show_overlay) = partial.show_overlay {
        config.show_overlay = show_overlay;
    }
    if let Some(open_browser) = partial.open_browser {
        config.open_browser = open_browser;
    }
    if let Some(ref patterns) = partial.watch_patterns {
        config.watch_patterns = patterns.clone();
    }
    if let Some(ref patterns) = partial.ignore_patterns {
        config.watch_ignore_patterns = patterns.clone();
    }
    if let Some(ref proxy) = partial.proxy {
        for (path, target) in proxy {
            url::Url::parse(target)
                .map_err(|e| anyhow!("Invalid proxy target '{}' for '{}': {}", target, path, e))?;
            // Configured rules also forward WebSocket upgrades
            let rule = ProxyRule::new(path.as_str(), target.as_str()).with_ws(true);
            // Later layers replace rules for the same path
            config.proxy_rules.retain(|r| r.path != rule.path);
            config.proxy_rules.push(rule);
        }
    }
    if let Some(project_type) = partial.project_type {
        config.project_type = Some(project_type);
    }
    if let Some(secs) = partial.hmr_timeout_secs {
        config.hmr_ready_timeout = Duration::from_secs(secs);
    }
    if let Some(max) = partial.collab_max_documents {
        config.collab_max_documents = max.max(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_only() {
        let dir = TempDir::new().unwrap();
        let config = ConfigMerger::new(dir.path()).merge().unwrap();
        assert_eq!(config.port, 5500);
        assert_eq!(config.root_path, dir.path().canonicalize().unwrap());
        assert!(config.proxy_rules.is_empty());
    }

    #[test]
    fn test_cli_overrides_project() {
        let dir = TempDir::new().unwrap();
        let project = PartialSettings {
            port: Some(8080),
            spa: Some(true),
            ..Default::default()
        };
        let cli = PartialSettings {
            port: Some(9000),
            ..Default::default()
        };

        let config = ConfigMerger::new(dir.path())
            .with_project(Some(project))
            .with_cli(Some(cli))
            .merge()
            .unwrap();

        assert_eq!(config.port, 9000);
        assert!(config.spa_mode);
    }

    #[test]
    fn test_load_project_settings_file() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join(SETTINGS_FILE_NAME),
            r#"
port = 7000
https = true
project_type = "vite"
ignore_patterns = ["dist/**"]

[proxy]
"/api" = "http://localhost:8000"
"#,
        )
        .unwrap();

        let project = PartialSettings::load_from_project(dir.path()).unwrap();
        let config = ConfigMerger::new(dir.path())
            .with_project(project)
            .merge()
            .unwrap();

        assert_eq!(config.port, 7000);
        assert!(config.use_https);
        assert_eq!(config.project_type, Some(ProjectType::Vite));
        assert_eq!(config.watch_ignore_patterns, vec!["dist/**".to_string()]);
        assert_eq!(config.proxy_rules.len(), 1);
        assert_eq!(config.proxy_rules[0].path, "/api");
    }

    #[test]
    fn test_missing_settings_file_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(PartialSettings::load_from_project(dir.path())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_invalid_proxy_target_rejected() {
        let dir = TempDir::new().unwrap();
        let mut proxy = BTreeMap::new();
        proxy.insert("/api".to_string(), "::nope::".to_string());
        let cli = PartialSettings {
            proxy: Some(proxy),
            ..Default::default()
        };
        assert!(ConfigMerger::new(dir.path())
            .with_cli(Some(cli))
            .merge()
            .is_err());
    }

    #[test]
    fn test_missing_root_rejected() {
        let result = ConfigMerger::new("/definitely/not/a/real/devlight/root").merge();
        assert!(result.is_err());
    }
}
