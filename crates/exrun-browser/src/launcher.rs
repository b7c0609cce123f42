use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use exrun_core::read_json_file_as;

use crate::error::BrowserError;
use crate::host::{BrowserHost, BrowserSession, LaunchOptions};

pub const EXTENSION_MANIFEST_FILE: &str = "manifest.json";

/// Identity fields of a built extension's `manifest.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionManifest {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

pub fn extension_manifest_path(build_dir: &Path) -> PathBuf {
    build_dir.join(EXTENSION_MANIFEST_FILE)
}

pub fn read_extension_manifest(build_dir: &Path) -> Result<ExtensionManifest, BrowserError> {
    let manifest_path = extension_manifest_path(build_dir);
    if !manifest_path.is_file() {
        return Err(BrowserError::BuildNotFound(format!(
            "Extension build not found. Ensure {} exists",
            build_dir.display()
        )));
    }
    read_json_file_as::<ExtensionManifest>(&manifest_path)
        .map_err(|error| BrowserError::BuildNotFound(format!("{error:#}")))
}

pub fn extension_launch_args(build_dir: &Path, no_sandbox: bool) -> Vec<String> {
    let build_dir = build_dir.display();
    let mut args = vec![
        format!("--disable-extensions-except={build_dir}"),
        format!("--load-extension={build_dir}"),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--disable-session-crashed-bubble".to_string(),
    ];
    if no_sandbox {
        args.push("--no-sandbox".to_string());
    }
    args
}

/// A launched session together with the manifest of the extension it loaded.
#[derive(Clone)]
pub struct LaunchedSession {
    pub session: Arc<dyn BrowserSession>,
    pub manifest: ExtensionManifest,
}

#[derive(Clone)]
pub struct SessionLauncher {
    host: Arc<dyn BrowserHost>,
    no_sandbox: bool,
}

impl SessionLauncher {
    pub fn new(host: Arc<dyn BrowserHost>) -> Self {
        Self {
            host,
            no_sandbox: false,
        }
    }

    pub fn with_no_sandbox(mut self, no_sandbox: bool) -> Self {
        self.no_sandbox = no_sandbox;
        self
    }

    /// Starts a persistent context with the built extension loaded.
    ///
    /// Fails with [`BrowserError::BuildNotFound`] before touching the browser
    /// when the build has no readable manifest.
    pub async fn launch(
        &self,
        build_dir: &Path,
        profile_dir: &Path,
        headless: bool,
    ) -> Result<LaunchedSession, BrowserError> {
        let manifest = read_extension_manifest(build_dir)?;
        let build_dir = tokio::fs::canonicalize(build_dir)
            .await
            .unwrap_or_else(|_| build_dir.to_path_buf());
        tokio::fs::create_dir_all(profile_dir)
            .await
            .map_err(|error| {
                BrowserError::Launch(format!(
                    "failed to create profile directory {}: {error}",
                    profile_dir.display()
                ))
            })?;
        tracing::debug!(
            build_dir = %build_dir.display(),
            profile_dir = %profile_dir.display(),
            headless,
            extension = %manifest.name,
            "launching browser session"
        );
        let session = self
            .host
            .launch(LaunchOptions {
                profile_dir: profile_dir.to_path_buf(),
                args: extension_launch_args(&build_dir, self.no_sandbox),
                extension_dir: build_dir,
                headless,
            })
            .await?;
        Ok(LaunchedSession { session, manifest })
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;

    use super::{extension_launch_args, read_extension_manifest, SessionLauncher};
    use crate::error::BrowserError;
    use crate::scripted::ScriptedBrowserHost;

    fn write_manifest(dir: &Path, body: &str) {
        std::fs::create_dir_all(dir).expect("build dir");
        std::fs::write(dir.join("manifest.json"), body).expect("manifest");
    }

    #[test]
    fn unit_launch_args_restrict_to_the_built_extension() {
        let args = extension_launch_args(Path::new("/opt/build"), false);
        assert_eq!(args[0], "--disable-extensions-except=/opt/build");
        assert_eq!(args[1], "--load-extension=/opt/build");
        assert!(args.contains(&"--disable-session-crashed-bubble".to_string()));
        assert!(!args.contains(&"--no-sandbox".to_string()));
        assert!(extension_launch_args(Path::new("/opt/build"), true)
            .contains(&"--no-sandbox".to_string()));
    }

    #[test]
    fn unit_read_extension_manifest_reports_missing_and_malformed_builds() {
        let temp = tempfile::tempdir().expect("tempdir");
        let error = read_extension_manifest(temp.path()).expect_err("missing");
        assert!(
            matches!(&error, BrowserError::BuildNotFound(message) if message.starts_with("Extension build not found")),
            "{error:?}"
        );
        write_manifest(temp.path(), "{ nope");
        assert!(matches!(
            read_extension_manifest(temp.path()),
            Err(BrowserError::BuildNotFound(_))
        ));
        write_manifest(temp.path(), r#"{"name":"Flow","version":"1.2.0","manifest_version":3}"#);
        let manifest = read_extension_manifest(temp.path()).expect("manifest");
        assert_eq!(manifest.name, "Flow");
        assert_eq!(manifest.version.as_deref(), Some("1.2.0"));
    }

    #[tokio::test]
    async fn functional_launch_fails_fast_without_touching_the_host() {
        let temp = tempfile::tempdir().expect("tempdir");
        let host = Arc::new(ScriptedBrowserHost::new());
        let launcher = SessionLauncher::new(host.clone());
        let result = launcher
            .launch(&temp.path().join("build"), &temp.path().join("profile"), true)
            .await;
        assert!(matches!(result, Err(BrowserError::BuildNotFound(_))));
        assert!(host.launches().is_empty());
    }

    #[tokio::test]
    async fn functional_launch_creates_profile_and_passes_extension_args() {
        let temp = tempfile::tempdir().expect("tempdir");
        let build = temp.path().join("build");
        write_manifest(&build, r#"{"name":"Flow","version":"1.0.0"}"#);
        let host = Arc::new(ScriptedBrowserHost::new());
        let launcher = SessionLauncher::new(host.clone()).with_no_sandbox(true);
        let profile = temp.path().join("profiles").join("run-1");
        let launched = launcher.launch(&build, &profile, false).await.expect("launch");
        assert_eq!(launched.manifest.name, "Flow");
        assert!(profile.is_dir());
        let launches = host.launches();
        assert_eq!(launches.len(), 1);
        assert!(!launches[0].headless);
        assert!(launches[0].args.iter().any(|arg| arg.starts_with("--load-extension=")));
        assert!(launches[0].args.contains(&"--no-sandbox".to_string()));
    }
}
