// Server configuration
//
// A `ServerConfig` is built once per server instance (usually by merging the
// project settings file with CLI flags, see `merger`) and is never mutated
// afterwards. Changing configuration means constructing a new server.

pub mod merger;

pub use merger::{ConfigMerger, PartialSettings};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default listening port
pub const DEFAULT_PORT: u16 = 5500;

/// Default bind address
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default HMR readiness timeout
pub const DEFAULT_HMR_TIMEOUT: Duration = Duration::from_secs(15);

/// Default upper bound on retained collaboration documents
pub const DEFAULT_COLLAB_MAX_DOCUMENTS: usize = 1024;

/// Ignore patterns applied when the user configures none
pub const DEFAULT_IGNORE_PATTERNS: &[&str] = &["node_modules", ".git"];

/// Immutable configuration captured at server construction
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Absolute project directory that is served and watched
    pub root_path: PathBuf,
    /// Bind address
    pub host: String,
    /// Listening port (0 binds an ephemeral port)
    pub port: u16,
    /// Serve over HTTPS using a provisioned certificate
    pub use_https: bool,
    /// Serve the root index.html for unresolved paths
    pub spa_mode: bool,
    /// Render on-page toasts from the injected client
    pub show_overlay: bool,
    /// Presentation flag passed through to the embedding shell
    pub open_browser: bool,
    /// Path prefix to target URL forwarding rules
    pub proxy_rules: Vec<ProxyRule>,
    /// When non-empty, only matching changes trigger a reload
    pub watch_patterns: Vec<String>,
    /// Changes matching any of these never trigger a reload
    pub watch_ignore_patterns: Vec<String>,
    /// Optional external dev-server profile
    pub project_type: Option<ProjectType>,
    /// How long to wait for an HMR dev server to become reachable
    pub hmr_ready_timeout: Duration,
    /// Upper bound on retained collaboration documents
    pub collab_max_documents: usize,
}

impl ServerConfig {
    /// Create a configuration with default settings for the given root
    pub fn new(root_path: impl Into<PathBuf>) -> Self {
        Self {
            root_path: root_path.into(),
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            use_https: false,
            spa_mode: false,
            show_overlay: true,
            open_browser: false,
            proxy_rules: Vec::new(),
            watch_patterns: Vec::new(),
            watch_ignore_patterns: DEFAULT_IGNORE_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
            project_type: None,
            hmr_ready_timeout: DEFAULT_HMR_TIMEOUT,
            collab_max_documents: DEFAULT_COLLAB_MAX_DOCUMENTS,
        }
    }
}

/// A single reverse-proxy rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRule {
    /// Request path prefix, always starting with `/`
    pub path: String,
    /// Target origin (and optional base path), e.g. `http://localhost:8000`
    pub target: String,
    /// Forward WebSocket upgrades as well as plain HTTP
    #[serde(default)]
    pub ws: bool,
}

impl ProxyRule {
    pub fn new(path: impl Into<String>, target: impl Into<String>) -> Self {
        let path = path.into();
        let path = if path.starts_with('/') {
            path
        } else {
            format!("/{}", path)
        };
        Self {
            path,
            target: target.into().trim_end_matches('/').to_string(),
            ws: false,
        }
    }

    pub fn with_ws(mut self, ws: bool) -> Self {
        self.ws = ws;
        self
    }

    /// Whether the rule applies to a request path (segment-aware prefix match)
    pub fn matches(&self, request_path: &str) -> bool {
        if self.path == "/" {
            return true;
        }
        match request_path.strip_prefix(self.path.trim_end_matches('/')) {
            Some(rest) => rest.is_empty() || rest.starts_with('/') || rest.starts_with('?'),
            None => false,
        }
    }
}

/// Parse a `/path=URL` CLI argument into a proxy rule
pub fn parse_proxy_arg(raw: &str) -> Result<ProxyRule, String> {
    let (path, target) = raw
        .split_once('=')
        .ok_or_else(|| format!("Invalid proxy rule '{}': expected /path=URL", raw))?;
    let path = path.trim();
    let target = target.trim();
    if path.is_empty() || target.is_empty() {
        return Err(format!("Invalid proxy rule '{}': expected /path=URL", raw));
    }
    url::Url::parse(target).map_err(|e| format!("Invalid proxy target '{}': {}", target, e))?;
    Ok(ProxyRule::new(path, target))
}

/// Dev-tool profiles the HMR adapter knows how to launch and proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProjectType {
    Vite,
    Next,
    CreateReactApp,
    Angular,
    VueCli,
    Sveltekit,
    Astro,
    /// Detect the profile from the project's package.json
    Auto,
}

impl ProjectType {
    pub const ALL: [ProjectType; 8] = [
        ProjectType::Vite,
        ProjectType::Next,
        ProjectType::CreateReactApp,
        ProjectType::Angular,
        ProjectType::VueCli,
        ProjectType::Sveltekit,
        ProjectType::Astro,
        ProjectType::Auto,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectType::Vite => "vite",
            ProjectType::Next => "next",
            ProjectType::CreateReactApp => "create-react-app",
            ProjectType::Angular => "angular",
            ProjectType::VueCli => "vue-cli",
            ProjectType::Sveltekit => "sveltekit",
            ProjectType::Astro => "astro",
            ProjectType::Auto => "auto",
        }
    }
}

impl fmt::Display for ProjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        let alias = match normalized.as_str() {
            "nextjs" | "next.js" => "next",
            "cra" | "react-scripts" => "create-react-app",
            "vue" => "vue-cli",
            "svelte" | "svelte-kit" => "sveltekit",
            other => other,
        };
        ProjectType::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == alias)
            .ok_or_else(|| {
                let names: Vec<&str> = ProjectType::ALL.iter().map(|p| p.as_str()).collect();
                format!(
                    "Unknown project type '{}' (expected one of: {})",
                    s,
                    names.join(", ")
                )
            })
    }
}
