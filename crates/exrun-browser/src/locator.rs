//! Resolves the runtime id of the loaded extension.
//!
//! The id is assigned by the browser at load time. The protocol path watches
//! for the extension's service worker target; the profile path scans the
//! on-disk extension registry for a manifest matching the build.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;

use exrun_core::{read_json_file_as, LogEntry, LogSink};

use crate::error::BrowserError;
use crate::host::BrowserSession;
use crate::launcher::ExtensionManifest;

const EXTENSION_SCHEME: &str = "chrome-extension://";
const SERVICE_WORKER_KIND: &str = "service_worker";
const WELCOME_PAGE: &str = "newtab.html";
const PROTOCOL_DETECT_FAILED: &str = "Failed to detect extension ID via CDP";
const PROFILE_DETECT_FAILED: &str = "Failed to find extension ID in user profile";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocatorConfig {
    pub poll_interval: Duration,
    pub protocol_timeout: Duration,
    pub profile_timeout: Duration,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            protocol_timeout: Duration::from_secs(10),
            profile_timeout: Duration::from_secs(15),
        }
    }
}

/// Extracts the authority of a `chrome-extension://<id>/...` URL.
pub fn extension_id_from_url(url: &str) -> Option<&str> {
    let rest = url.strip_prefix(EXTENSION_SCHEME)?;
    let id = rest.split(['/', '?', '#']).next()?;
    (!id.is_empty()).then_some(id)
}

/// Scans `<profile>/Default/Extensions/<id>/<version>/manifest.json` once.
pub fn scan_profile_extensions(profile_dir: &Path, manifest: &ExtensionManifest) -> Option<String> {
    let registry = profile_dir.join("Default").join("Extensions");
    let mut ids = sorted_subdirectories(&registry);
    ids.retain(|(name, _)| !name.starts_with('.') && name != "Temp");
    for (id, id_dir) in ids {
        for (_, version_dir) in sorted_subdirectories(&id_dir) {
            let Ok(found) = read_json_file_as::<ExtensionManifest>(&version_dir.join("manifest.json"))
            else {
                continue;
            };
            let version_matches = match manifest.version.as_deref() {
                Some(version) => found.version.as_deref() == Some(version),
                None => true,
            };
            if found.name == manifest.name && version_matches {
                return Some(id);
            }
        }
    }
    None
}

fn sorted_subdirectories(dir: &Path) -> Vec<(String, PathBuf)> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut dirs = entries
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().map(|kind| kind.is_dir()).unwrap_or(false))
        .map(|entry| (entry.file_name().to_string_lossy().into_owned(), entry.path()))
        .collect::<Vec<_>>();
    dirs.sort();
    dirs
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExtensionLocator {
    config: LocatorConfig,
}

impl ExtensionLocator {
    pub fn new(config: LocatorConfig) -> Self {
        Self { config }
    }

    /// Resolves the id via the protocol, falling back to a profile scan.
    pub async fn resolve(
        &self,
        session: &dyn BrowserSession,
        profile_dir: &Path,
        manifest: &ExtensionManifest,
        sink: &dyn LogSink,
    ) -> Result<String, BrowserError> {
        match self.find_via_protocol(session).await {
            Ok(id) => {
                sink.emit(LogEntry::info(format!("Extension ID (CDP): {id}")));
                Ok(id)
            }
            Err(error @ BrowserError::SessionFault(_)) => Err(error),
            Err(error) => {
                let reason = match &error {
                    BrowserError::ExtensionNotFound(reason) => reason.clone(),
                    other => other.to_string(),
                };
                sink.emit(LogEntry::warn(format!(
                    "CDP detect failed: {reason}. Fallback to profile scan..."
                )));
                let id = self.find_via_profile(profile_dir, manifest).await?;
                sink.emit(LogEntry::info(format!("Extension ID (FS): {id}")));
                Ok(id)
            }
        }
    }

    pub async fn find_via_protocol(&self, session: &dyn BrowserSession) -> Result<String, BrowserError> {
        let deadline = Instant::now() + self.config.protocol_timeout;
        loop {
            match session.list_targets().await {
                Ok(targets) => {
                    let found = targets
                        .iter()
                        .filter(|target| target.kind == SERVICE_WORKER_KIND)
                        .find_map(|target| extension_id_from_url(&target.url));
                    if let Some(id) = found {
                        return Ok(id.to_string());
                    }
                }
                Err(error @ BrowserError::SessionFault(_)) => return Err(error),
                Err(error) => tracing::debug!(%error, "target listing failed; retrying"),
            }
            if Instant::now() >= deadline {
                return Err(BrowserError::ExtensionNotFound(
                    PROTOCOL_DETECT_FAILED.to_string(),
                ));
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    pub async fn find_via_profile(
        &self,
        profile_dir: &Path,
        manifest: &ExtensionManifest,
    ) -> Result<String, BrowserError> {
        let deadline = Instant::now() + self.config.profile_timeout;
        loop {
            let scan_dir = profile_dir.to_path_buf();
            let wanted = manifest.clone();
            let found =
                tokio::task::spawn_blocking(move || scan_profile_extensions(&scan_dir, &wanted))
                    .await
                    .ok()
                    .flatten();
            if let Some(id) = found {
                return Ok(id);
            }
            if Instant::now() >= deadline {
                return Err(BrowserError::ExtensionNotFound(
                    PROFILE_DETECT_FAILED.to_string(),
                ));
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}

/// Closes the welcome tabs an extension opens on first install. Returns how
/// many pages were closed; individual close failures are ignored.
pub async fn close_welcome_pages(session: &dyn BrowserSession, extension_id: &str) -> usize {
    let prefix = format!("{EXTENSION_SCHEME}{extension_id}/{WELCOME_PAGE}");
    let Ok(pages) = session.pages().await else {
        return 0;
    };
    let mut closed = 0;
    for page in pages.iter().filter(|page| page.url.starts_with(&prefix)) {
        if session.close_page(&page.page_id).await.is_ok() {
            closed += 1;
        }
    }
    closed
}
