//! Browser-facing run stages for exrun.
//!
//! Everything here talks to the browser through the [`BrowserHost`] /
//! [`BrowserSession`] seam: launching a context with the built extension,
//! resolving the extension id, dispatching the workflow, watching for network
//! quiescence and adapting the extension's state feed into log entries.

pub mod activity;
pub mod cdp;
pub mod error;
pub mod host;
pub mod launcher;
pub mod locator;
#[cfg(any(test, feature = "test-support"))]
pub mod scripted;
pub mod state_feed;
pub mod trigger;

pub use activity::{ActivityMonitor, IdleOutcome, ACTIVITY_POLL_INTERVAL};
pub use cdp::{ChromiumHost, ChromiumHostConfig};
pub use error::BrowserError;
pub use host::{
    BrowserHost, BrowserSession, LaunchOptions, PageId, PageInfo, SessionEvent, TargetInfo,
};
pub use launcher::{
    extension_manifest_path, read_extension_manifest, ExtensionManifest, LaunchedSession,
    SessionLauncher,
};
pub use locator::{close_welcome_pages, ExtensionLocator, LocatorConfig};
#[cfg(any(test, feature = "test-support"))]
pub use scripted::{ScriptedBrowserHost, ScriptedSession, SCRIPTED_EXTENSION_ID};
pub use state_feed::{
    parse_state_line, session_log_entries, session_log_entry,
    WorkflowStateUpdate, STATE_FEED_PREFIX,
};
pub use trigger::{
    TriggerDispatcher, TriggerOptions, TriggerOutcome, TriggerReport, TRIGGERED_MESSAGE,
};
