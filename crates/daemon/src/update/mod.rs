//! Release checking.
//!
//! Queries a GitHub-style "latest release" endpoint and reports a newer
//! version together with at most two download links: the mirror first, then
//! the release's own asset. Background checks never fail; they log and
//! report nothing. Explicit checks surface the error so the caller can tell
//! the user the check did not happen.

pub mod version;

use std::time::Duration;

use alistlite_protocol::UpdateInfo;
use serde::Deserialize;
use thiserror::Error;

use crate::config::UpdateConfig;
pub use version::{strip_v, Version, VersionError};

/// ABI used when the host architecture has no dedicated build.
pub const UNIVERSAL_ABI: &str = "universal";

/// Download ABIs with dedicated builds.
pub const SUPPORTED_ABIS: &[&str] = &["arm64-v8a", "armeabi-v7a", "x86", "x86_64"];

/// Upper bound on advertised download links.
pub const MAX_DOWNLOAD_URLS: usize = 2;

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("update request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("update server returned HTTP {0}")]
    Status(u16),

    #[error("malformed release data: {0}")]
    Malformed(String),
}

/// Subset of a GitHub release object.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ReleaseInfo {
    pub tag_name: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ReleaseAsset {
    pub browser_download_url: String,
}

/// Checks a release endpoint for newer versions.
pub struct UpdateChecker {
    client: reqwest::Client,
    endpoint: String,
    mirror_base: String,
    abi: String,
}

impl UpdateChecker {
    pub fn new(config: &UpdateConfig) -> Result<Self, UpdateError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("alistlite-supervisor/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            mirror_base: config.mirror_base.clone(),
            abi: device_abi().to_string(),
        })
    }

    /// Override the ABI used for mirror links.
    pub fn with_abi(mut self, abi: impl Into<String>) -> Self {
        self.abi = abi.into();
        self
    }

    pub fn abi(&self) -> &str {
        &self.abi
    }

    /// Fetch the latest release description.
    pub async fn fetch_latest(&self) -> Result<ReleaseInfo, UpdateError> {
        let response = self
            .client
            .get(&self.endpoint)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpdateError::Status(status.as_u16()));
        }

        let text = response.text().await?;
        let release: ReleaseInfo =
            serde_json::from_str(&text).map_err(|e| UpdateError::Malformed(e.to_string()))?;
        if strip_v(&release.tag_name).is_empty() {
            return Err(UpdateError::Malformed("empty tag_name".to_string()));
        }
        Ok(release)
    }

    /// Explicit check: errors are returned so the caller can report them.
    pub async fn check(&self, current: &str) -> Result<Option<UpdateInfo>, UpdateError> {
        let release = self.fetch_latest().await?;
        Ok(evaluate(&release, current, &self.abi, &self.mirror_base))
    }

    /// Background check: any failure is logged and reported as no update.
    pub async fn check_for_update(&self, current: &str) -> Option<UpdateInfo> {
        match self.check(current).await {
            Ok(Some(info)) => {
                tracing::info!("New release available: v{} (current v{})", info.version, current);
                Some(info)
            }
            Ok(None) => {
                tracing::debug!("Already on the latest release (v{})", current);
                None
            }
            Err(e) => {
                tracing::warn!("Update check failed: {}", e);
                None
            }
        }
    }
}

/// Decide whether `release` is newer than `current` and build its links.
pub fn evaluate(
    release: &ReleaseInfo,
    current: &str,
    abi: &str,
    mirror_base: &str,
) -> Option<UpdateInfo> {
    let latest_tag = strip_v(&release.tag_name);
    let latest: Version = match latest_tag.parse() {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("Ignoring release with unparseable tag: {}", e);
            return None;
        }
    };
    let installed: Version = match current.parse() {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("Cannot compare against current version: {}", e);
            return None;
        }
    };
    if latest <= installed {
        return None;
    }

    let mut download_urls = vec![mirror_url(mirror_base, latest_tag, abi)];
    if let Some(asset) = release
        .assets
        .iter()
        .find(|a| !a.browser_download_url.is_empty())
    {
        download_urls.push(asset.browser_download_url.clone());
    }
    download_urls.truncate(MAX_DOWNLOAD_URLS);

    Some(UpdateInfo {
        version: latest_tag.to_string(),
        engine_version: release.name.as_deref().and_then(engine_version_from_name),
        changelog: release.body.clone().unwrap_or_default(),
        download_urls,
    })
}

/// Mirror link for a given version and ABI.
pub fn mirror_url(mirror_base: &str, version: &str, abi: &str) -> String {
    format!(
        "{}/AListLite-v{}-{}-release.apk",
        mirror_base.trim_end_matches('/'),
        version,
        abi
    )
}

/// The bundled engine version named in a release title, e.g.
/// `"AListLite v1.3.0 (AList v3.40.0)"` gives `3.40.0`.
pub fn engine_version_from_name(name: &str) -> Option<String> {
    name.split(|c: char| c.is_whitespace() || matches!(c, '(' | ')' | ',' | '|'))
        .filter(|token| !token.is_empty())
        .filter_map(|token| {
            let bare = strip_v(token);
            bare.parse::<Version>().ok().map(|_| bare.to_string())
        })
        .last()
}

/// Download ABI for the host architecture.
pub fn device_abi() -> &'static str {
    abi_for_arch(std::env::consts::ARCH)
}

/// Map a Rust target architecture name to a download ABI.
pub fn abi_for_arch(arch: &str) -> &'static str {
    let abi = match arch {
        "aarch64" => "arm64-v8a",
        "arm" => "armeabi-v7a",
        "x86" => "x86",
        "x86_64" => "x86_64",
        _ => UNIVERSAL_ABI,
    };
    debug_assert!(abi == UNIVERSAL_ABI || SUPPORTED_ABIS.contains(&abi));
    abi
}
