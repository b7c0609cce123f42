use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::model::IsolationMode;

const SHARED_PROFILE_DIR: &str = ".profile";
const PER_RUN_PROFILE_ROOT: &str = ".profiles";

/// Gate over the browser profile, the one resource runs cannot share.
#[derive(Debug)]
pub struct AdmissionController {
    mode: IsolationMode,
    root: PathBuf,
    shared_busy: Arc<AtomicBool>,
}

impl AdmissionController {
    pub fn new(mode: IsolationMode, root: impl Into<PathBuf>) -> Self {
        Self {
            mode,
            root: root.into(),
            shared_busy: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn mode(&self) -> IsolationMode {
        self.mode
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Admits a run, or returns `None` while the shared profile is held.
    pub fn try_acquire(&self) -> Option<AdmissionPermit> {
        match self.mode {
            IsolationMode::PerRun => Some(AdmissionPermit { held: None }),
            IsolationMode::Shared => self
                .shared_busy
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .ok()
                .map(|_| AdmissionPermit {
                    held: Some(Arc::clone(&self.shared_busy)),
                }),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.mode == IsolationMode::Shared && self.shared_busy.load(Ordering::Acquire)
    }

    pub fn profile_dir(&self, run_id: &str) -> PathBuf {
        match self.mode {
            IsolationMode::Shared => self.root.join(SHARED_PROFILE_DIR),
            IsolationMode::PerRun => self.root.join(PER_RUN_PROFILE_ROOT).join(run_id),
        }
    }
}

/// Held for the lifetime of one admitted run. Releases on drop.
#[derive(Debug)]
pub struct AdmissionPermit {
    held: Option<Arc<AtomicBool>>,
}

impl AdmissionPermit {
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(flag) = self.held.take() {
            flag.store(false, Ordering::Release);
        }
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.release_inner();
    }
}
