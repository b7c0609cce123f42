//! Browser host seam: the control surface the run stages consume.
//!
//! The production implementation lives in [`crate::cdp`]; tests drive the same
//! seam through the scripted host behind the `test-support` feature.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::BrowserError;

/// Identifier of a page inside a session (the protocol target id).
pub type PageId = String;

#[derive(Debug, Clone, PartialEq, Eq)]
/// One debuggable target reported by the browser.
pub struct TargetInfo {
    pub target_id: String,
    pub kind: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageInfo {
    pub page_id: PageId,
    pub url: String,
}

/// Activity observed on any page of a session, including pages opened later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    PageOpened {
        page_id: PageId,
        url: String,
    },
    RequestStarted {
        page_id: PageId,
        request_id: String,
        url: String,
    },
    RequestFinished {
        page_id: PageId,
        request_id: String,
    },
    RequestFailed {
        page_id: PageId,
        request_id: String,
        url: String,
        error_text: String,
    },
    Console {
        page_id: PageId,
        text: String,
    },
    PageError {
        page_id: PageId,
        text: String,
    },
    Navigated {
        page_id: PageId,
        url: String,
    },
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Parameters for starting one persistent automation context.
pub struct LaunchOptions {
    pub profile_dir: PathBuf,
    pub extension_dir: PathBuf,
    pub headless: bool,
    pub args: Vec<String>,
}

/// Starts persistent automation contexts.
#[async_trait]
pub trait BrowserHost: Send + Sync {
    async fn launch(&self, options: LaunchOptions) -> Result<Arc<dyn BrowserSession>, BrowserError>;
}

/// One live automation context and its pages.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn list_targets(&self) -> Result<Vec<TargetInfo>, BrowserError>;

    async fn pages(&self) -> Result<Vec<PageInfo>, BrowserError>;

    /// Opens a new tab at `url` and returns its id without waiting for load.
    async fn open_page(&self, url: &str) -> Result<PageId, BrowserError>;

    /// Evaluates `expression` in the page and returns the result by value.
    async fn evaluate(
        &self,
        page_id: &str,
        expression: &str,
        await_promise: bool,
    ) -> Result<Value, BrowserError>;

    async fn close_page(&self, page_id: &str) -> Result<(), BrowserError>;

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent>;

    /// Closes the context. Idempotent; pending calls fail with `SessionFault`.
    async fn close(&self) -> Result<(), BrowserError>;

    fn is_closed(&self) -> bool;
}
