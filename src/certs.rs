// TLS certificate provisioning for HTTPS mode
//
// Preference order: a cached pair from a previous run, a pair issued by
// mkcert (trusted by the local machine), then an in-memory self-signed pair.
// Acquisition never fails; every problem degrades to the next option.

use chrono::{Datelike, Duration, Utc};
use rcgen::{CertificateParams, DistinguishedName, DnType, DnValue, KeyPair};
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// File name of the cached private key
pub const KEY_FILE_NAME: &str = "localhost-key.pem";

/// File name of the cached certificate
pub const CERT_FILE_NAME: &str = "localhost.pem";

/// Hosts every provisioned certificate covers
const CERT_HOSTS: &[&str] = &["localhost", "127.0.0.1", "::1"];

const SELF_SIGNED_VALIDITY_DAYS: i64 = 365;

/// PEM-encoded key/certificate pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificatePair {
    pub key: Vec<u8>,
    pub cert: Vec<u8>,
}

impl CertificatePair {
    pub fn is_empty(&self) -> bool {
        self.key.is_empty() || self.cert.is_empty()
    }
}

/// Per-user certificate cache directory (~/.devlight/certs)
pub fn default_cache_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|p| p.join(".devlight").join("certs"))
}

#[derive(Debug, Clone)]
enum CaTool {
    Detect,
    At(PathBuf),
    Disabled,
}

/// Produces the key/certificate pair used by the HTTPS listener
#[derive(Debug, Clone)]
pub struct CertificateProvisioner {
    cache_dir: Option<PathBuf>,
    ca_tool: CaTool,
}

impl CertificateProvisioner {
    /// Provisioner using the per-user cache and mkcert from PATH
    pub fn new() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            ca_tool: CaTool::Detect,
        }
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// Use a specific CA tool binary instead of looking up mkcert
    pub fn with_ca_tool(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_tool = CaTool::At(path.into());
        self
    }

    /// Skip the trusted CA tool entirely
    pub fn without_ca_tool(mut self) -> Self {
        self.ca_tool = CaTool::Disabled;
        self
    }

    fn locate_ca_tool(&self) -> Option<PathBuf> {
        match &self.ca_tool {
            CaTool::Detect => which::which("mkcert").ok(),
            CaTool::At(path) => Some(path.clone()),
            CaTool::Disabled => None,
        }
    }

    /// Obtain a certificate pair; always returns something usable
    pub async fn acquire(&self) -> CertificatePair {
        if let Some(dir) = &self.cache_dir {
            let key_path = dir.join(KEY_FILE_NAME);
            let cert_path = dir.join(CERT_FILE_NAME);

            if let Some(tool) = self.locate_ca_tool() {
                if !(key_path.exists() && cert_path.exists()) {
                    if let Err(e) = issue_with_ca_tool(&tool, dir, &key_path, &cert_path).await {
                        log::warn!("Trusted certificate generation failed: {}", e);
                    }
                }
            } else {
                log::debug!("No trusted CA tool available");
            }

            match read_cached(&key_path, &cert_path).await {
                Some(pair) => {
                    log::info!("Using certificate from {}", dir.display());
                    return pair;
                }
                None => log::debug!("No cached certificate in {}", dir.display()),
            }
        } else {
            log::debug!("No certificate cache directory (home directory unknown)");
        }

        log::info!("Generating self-signed certificate for localhost");
        match generate_self_signed() {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("Self-signed generation with explicit validity failed: {}", e);
                generate_simple().unwrap_or_else(|e| {
                    log::error!("Self-signed certificate generation failed: {}", e);
                    CertificatePair {
                        key: Vec::new(),
                        cert: Vec::new(),
                    }
                })
            }
        }
    }
}

impl Default for CertificateProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

async fn issue_with_ca_tool(
    tool: &Path,
    dir: &Path,
    key_path: &Path,
    cert_path: &Path,
) -> Result<(), String> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| format!("Failed to create '{}': {}", dir.display(), e))?;

    log::info!("Issuing trusted certificate with {}", tool.display());

    let output = Command::new(tool)
        .arg("-key-file")
        .arg(key_path)
        .arg("-cert-file")
        .arg(cert_path)
        .args(CERT_HOSTS)
        .output()
        .await
        .map_err(|e| format!("Failed to run '{}': {}", tool.display(), e))?;

    if !output.status.success() {
        return Err(format!(
            "'{}' exited with {}: {}",
            tool.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(())
}

async fn read_cached(key_path: &Path, cert_path: &Path) -> Option<CertificatePair> {
    let key = tokio::fs::read(key_path).await.ok()?;
    let cert = tokio::fs::read(cert_path).await.ok()?;
    let pair = CertificatePair { key, cert };
    if pair.is_empty() {
        log::warn!("Ignoring empty cached certificate files");
        return None;
    }
    Some(pair)
}

/// Self-signed certificate for CN=localhost, valid for a year from today
pub fn generate_self_signed() -> Result<CertificatePair, rcgen::Error> {
    let hosts: Vec<String> = CERT_HOSTS.iter().map(|h| h.to_string()).collect();
    let mut params = CertificateParams::new(hosts)?;

    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, DnValue::Utf8String("localhost".to_string()));
    name.push(
        DnType::OrganizationName,
        DnValue::Utf8String("Devlight Dev Server".to_string()),
    );
    params.distinguished_name = name;

    let now = Utc::now();
    let end = now + Duration::days(SELF_SIGNED_VALIDITY_DAYS);
    params.not_before = rcgen::date_time_ymd(now.year(), now.month() as u8, now.day() as u8);
    params.not_after = rcgen::date_time_ymd(end.year(), end.month() as u8, end.day() as u8);

    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    Ok(CertificatePair {
        key: key_pair.serialize_pem().into_bytes(),
        cert: cert.pem().into_bytes(),
    })
}

fn generate_simple() -> Result<CertificatePair, rcgen::Error> {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])?;
    Ok(CertificatePair {
        key: certified.key_pair.serialize_pem().into_bytes(),
        cert: certified.cert.pem().into_bytes(),
    })
}
