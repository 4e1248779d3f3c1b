//! HMR dev-server adapter
//!
//! For projects built around their own bundler, the adapter makes sure the
//! tool's dev server is up (probing its port, launching it if needed and
//! polling until reachable) and then hands every request to it through a
//! catch-all proxy rule.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};

use super::error::ServerError;
use crate::config::{ProjectType, ProxyRule};
use crate::shutdown::ShutdownState;

/// Single connect attempt budget while probing
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Pause between readiness attempts
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Launch command and default port of one dev tool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HmrProfile {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub port: u16,
}

impl HmrProfile {
    pub fn new(name: &str, program: &str, args: &[&str], port: u16) -> Self {
        Self {
            name: name.to_string(),
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: Vec::new(),
            port,
        }
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    /// Built-in profile for a project type (`Auto` has none)
    pub fn for_project_type(project_type: ProjectType) -> Option<Self> {
        let npx = node_program("npx");
        let profile = match project_type {
            ProjectType::Vite => Self::new("vite", &npx, &["vite", "--port", "5173"], 5173),
            ProjectType::Next => Self::new("next", &npx, &["next", "dev", "-p", "3000"], 3000),
            ProjectType::CreateReactApp => {
                Self::new("create-react-app", &npx, &["react-scripts", "start"], 3000)
                    .with_env("BROWSER", "none")
                    .with_env("PORT", "3000")
            }
            ProjectType::Angular => {
                Self::new("angular", &npx, &["ng", "serve", "--port", "4200"], 4200)
            }
            ProjectType::VueCli => Self::new(
                "vue-cli",
                &npx,
                &["vue-cli-service", "serve", "--port", "8080"],
                8080,
            ),
            ProjectType::Sveltekit => {
                Self::new("sveltekit", &npx, &["vite", "dev", "--port", "5173"], 5173)
            }
            ProjectType::Astro => {
                Self::new("astro", &npx, &["astro", "dev", "--port", "4321"], 4321)
            }
            ProjectType::Auto => return None,
        };
        Some(profile)
    }

    /// Resolve the configured project type, detecting it for `Auto`.
    /// `None` when detection finds no supported framework.
    pub fn resolve(project_type: ProjectType, root: &Path) -> Option<Self> {
        let resolved = match project_type {
            ProjectType::Auto => detect_project_type(root)?,
            other => other,
        };
        Self::for_project_type(resolved)
    }

    pub fn target_url(&self) -> String {
        format!("http://localhost:{}", self.port)
    }

    pub fn command_line(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

fn node_program(name: &str) -> String {
    if cfg!(windows) {
        format!("{}.cmd", name)
    } else {
        name.to_string()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PackageJson {
    #[serde(default)]
    dependencies: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    dev_dependencies: BTreeMap<String, serde_json::Value>,
}

/// Guess the dev-tool profile from package.json dependencies
pub fn detect_project_type(root: &Path) -> Option<ProjectType> {
    let contents = std::fs::read_to_string(root.join("package.json")).ok()?;
    let package: PackageJson = match serde_json::from_str(&contents) {
        Ok(p) => p,
        Err(e) => {
            log::warn!("Failed to parse package.json in {}: {}", root.display(), e);
            return None;
        }
    };

    let has = |name: &str| {
        package.dependencies.contains_key(name) || package.dev_dependencies.contains_key(name)
    };

    // More specific frameworks first: several of them depend on vite
    let detected = if has("next") {
        Some(ProjectType::Next)
    } else if has("@sveltejs/kit") {
        Some(ProjectType::Sveltekit)
    } else if has("astro") {
        Some(ProjectType::Astro)
    } else if has("@angular/core") {
        Some(ProjectType::Angular)
    } else if has("@vue/cli-service") {
        Some(ProjectType::VueCli)
    } else if has("react-scripts") {
        Some(ProjectType::CreateReactApp)
    } else if has("vite") {
        Some(ProjectType::Vite)
    } else {
        None
    };

    if let Some(ty) = detected {
        log::info!("Detected {} project in {}", ty, root.display());
    }
    detected
}

/// Whether something accepts TCP connections on localhost:port
pub async fn probe_port(port: u16) -> bool {
    matches!(
        tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(("localhost", port))).await,
        Ok(Ok(_))
    )
}

/// Live state of the adapter for one server instance
pub struct HmrAdapter {
    profile: HmrProfile,
    root: PathBuf,
    child: Option<Child>,
    process_group: Option<u32>,
    target_url: Option<String>,
}

impl HmrAdapter {
    pub fn new(profile: HmrProfile, root: impl Into<PathBuf>) -> Self {
        Self {
            profile,
            root: root.into(),
            child: None,
            process_group: None,
            target_url: None,
        }
    }

    pub fn profile(&self) -> &HmrProfile {
        &self.profile
    }

    /// Resolved dev-server URL once the server is reachable
    pub fn target_url(&self) -> Option<&str> {
        self.target_url.as_deref()
    }

    pub fn has_spawned_process(&self) -> bool {
        self.child.is_some()
    }

    /// Catch-all rule routing everything (including upgrades) to the dev server
    pub fn proxy_rule(&self) -> Option<ProxyRule> {
        self.target_url
            .as_ref()
            .map(|url| ProxyRule::new("/", url.as_str()).with_ws(true))
    }

    /// Make sure the dev server is reachable, launching it if necessary
    pub async fn ensure_running(
        &mut self,
        timeout: Duration,
        shutdown: &ShutdownState,
    ) -> Result<String, ServerError> {
        let port = self.profile.port;

        if probe_port(port).await {
            log::info!(
                "Found running '{}' dev server on port {}",
                self.profile.name,
                port
            );
        } else {
            self.spawn()?;
            if let Err(e) = self.wait_until_reachable(timeout, shutdown).await {
                self.shutdown().await;
                return Err(e);
            }
        }

        let url = self.profile.target_url();
        self.target_url = Some(url.clone());
        Ok(url)
    }

    fn spawn(&mut self) -> Result<(), ServerError> {
        log::info!(
            "Starting '{}' dev server: {} (in {})",
            self.profile.name,
            self.profile.command_line(),
            self.root.display()
        );

        let mut command = Command::new(&self.profile.program);
        command
            .args(&self.profile.args)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        // Own process group so shutdown reaches everything npx launches.
        // Background groups are stopped on terminal reads: stdin stays null.
        #[cfg(unix)]
        {
            command.process_group(0);
        }
        for (key, value) in &self.profile.env {
            command.env(key, value);
        }

        let child = command.spawn().map_err(|source| ServerError::HmrSpawn {
            profile: self.profile.name.clone(),
            command: self.profile.command_line(),
            source,
        })?;

        self.process_group = child.id();
        self.child = Some(child);
        Ok(())
    }

    async fn wait_until_reachable(
        &mut self,
        timeout: Duration,
        shutdown: &ShutdownState,
    ) -> Result<(), ServerError> {
        let port = self.profile.port;
        // No deadline when the timeout is too large to represent
        let deadline = Instant::now().checked_add(timeout);
        let mut exit_reported = false;

        loop {
            if shutdown.is_shutdown_requested() {
                return Err(ServerError::Cancelled(self.profile.name.clone()));
            }

            if probe_port(port).await {
                log::info!(
                    "'{}' dev server is reachable on port {}",
                    self.profile.name,
                    port
                );
                return Ok(());
            }

            if !exit_reported {
                if let Some(child) = self.child.as_mut() {
                    if let Ok(Some(status)) = child.try_wait() {
                        log::warn!(
                            "'{}' dev server process exited early ({}); still polling port {}",
                            self.profile.name,
                            status,
                            port
                        );
                        exit_reported = true;
                    }
                }
            }

            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(ServerError::HmrTimeout {
                    profile: self.profile.name.clone(),
                    port,
                    timeout,
                });
            }

            log::debug!("Waiting for port {}...", port);
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Terminate the spawned dev server, if we launched one
    pub async fn shutdown(&mut self) {
        if let Some(pgid) = self.process_group.take() {
            kill_process_group(pgid);
        }

        if let Some(mut child) = self.child.take() {
            match child.kill().await {
                Ok(()) => log::info!("Stopped '{}' dev server", self.profile.name),
                Err(e) => log::warn!(
                    "Failed to stop '{}' dev server process: {}",
                    self.profile.name,
                    e
                ),
            }
        }
        self.target_url = None;
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    // SAFETY: plain syscall; a negative pid addresses the whole group
    let rc = unsafe { libc::kill(-(pgid as i32), libc::SIGKILL) };
    if rc != 0 {
        log::debug!(
            "Failed to signal process group {}: {}",
            pgid,
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[test]
    fn test_builtin_profiles() {
        let vite = HmrProfile::for_project_type(ProjectType::Vite).unwrap();
        assert_eq!(vite.port, 5173);
        assert_eq!(vite.target_url(), "http://localhost:5173");
        assert_eq!(HmrProfile::for_project_type(ProjectType::Next).unwrap().port, 3000);
        assert_eq!(HmrProfile::for_project_type(ProjectType::Angular).unwrap().port, 4200);
        assert!(HmrProfile::for_project_type(ProjectType::Auto).is_none());
    }

    #[test]
    fn test_detect_project_type() {
        let dir = TempDir::new().unwrap();
        assert_eq!(detect_project_type(dir.path()), None);

        std::fs::write(
            dir.path().join("package.json"),
            r#"{"devDependencies":{"vite":"^5.0.0","@sveltejs/kit":"^2.0.0"}}"#,
        )
        .unwrap();
        assert_eq!(detect_project_type(dir.path()), Some(ProjectType::Sveltekit));

        std::fs::write(
            dir.path().join("package.json"),
            r#"{"devDependencies":{"vite":"^5.0.0"}}"#,
        )
        .unwrap();
        assert_eq!(detect_project_type(dir.path()), Some(ProjectType::Vite));
    }

    #[test]
    fn test_resolve_auto_without_package_json() {
        let dir = TempDir::new().unwrap();
        assert!(HmrProfile::resolve(ProjectType::Auto, dir.path()).is_none());
        assert_eq!(
            HmrProfile::resolve(ProjectType::Angular, dir.path()).map(|p| p.port),
            Some(4200)
        );
    }

    #[tokio::test]
    async fn test_existing_server_is_reused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let dir = TempDir::new().unwrap();

        let profile = HmrProfile::new("stub", "definitely-not-a-real-binary", &[], port);
        let mut adapter = HmrAdapter::new(profile, dir.path());
        let url = adapter
            .ensure_running(Duration::from_secs(1), &ShutdownState::new())
            .await
            .unwrap();

        assert_eq!(url, format!("http://localhost:{}", port));
        assert!(!adapter.has_spawned_process());
        let rule = adapter.proxy_rule().unwrap();
        assert_eq!(rule.path, "/");
        assert!(rule.ws);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        let profile = HmrProfile::new("stub", "definitely-not-a-real-binary", &[], free_port());
        let mut adapter = HmrAdapter::new(profile, dir.path());
        let err = adapter
            .ensure_running(Duration::from_secs(1), &ShutdownState::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::HmrSpawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_readiness_timeout() {
        let dir = TempDir::new().unwrap();
        let port = free_port();
        let profile = HmrProfile::new("stub", "sh", &["-c", "sleep 5"], port);
        let mut adapter = HmrAdapter::new(profile, dir.path());

        let started = Instant::now();
        let err = adapter
            .ensure_running(Duration::from_millis(700), &ShutdownState::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ServerError::HmrTimeout { port: p, .. } if p == port));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!adapter.has_spawned_process());
        assert!(adapter.target_url().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unrepresentable_timeout_waits_without_deadline() {
        let dir = TempDir::new().unwrap();
        let profile = HmrProfile::new("stub", "sh", &["-c", "sleep 5"], free_port());
        let mut adapter = HmrAdapter::new(profile, dir.path());
        let shutdown = ShutdownState::new();
        let handle = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            handle.request_shutdown();
        });

        let err = adapter
            .ensure_running(Duration::from_secs(u64::MAX), &shutdown)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Cancelled(_)));
        assert!(!adapter.has_spawned_process());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_shutdown_kills_launched_descendants() {
        let dir = TempDir::new().unwrap();
        let profile = HmrProfile::new(
            "stub",
            "sh",
            &["-c", "sleep 30 & echo $! > grandchild.pid; wait"],
            free_port(),
        );
        let mut adapter = HmrAdapter::new(profile, dir.path());
        let err = adapter
            .ensure_running(Duration::from_secs(1), &ShutdownState::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::HmrTimeout { .. }));

        let pid = std::fs::read_to_string(dir.path().join("grandchild.pid")).unwrap();
        let stat = format!("/proc/{}/stat", pid.trim());
        let mut gone = false;
        for _ in 0..40 {
            // Killed processes may linger as zombies until reaped
            match std::fs::read_to_string(&stat) {
                Err(_) => gone = true,
                Ok(line) => gone = line.split_whitespace().nth(2) == Some("Z"),
            }
            if gone {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(gone, "dev server descendant outlived shutdown");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_readiness_poll_cancelled_by_shutdown() {
        let dir = TempDir::new().unwrap();
        let profile = HmrProfile::new("stub", "sh", &["-c", "sleep 5"], free_port());
        let mut adapter = HmrAdapter::new(profile, dir.path());
        let shutdown = ShutdownState::new();
        shutdown.request_shutdown();

        let err = adapter
            .ensure_running(Duration::from_secs(10), &shutdown)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Cancelled(_)));
    }
}
