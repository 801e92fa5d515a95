//! Per-app build directories
//!
//! Each source build gets `{work_root}/app-{appId}`. The directory is wiped
//! and recreated at the start of every build so nothing left by an earlier
//! job can leak into the next image.

use crate::pipeline::RunnerError;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Root under which per-app build directories live
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Creates a workspace rooted at `root` (created lazily)
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The work root
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory used for `app_id`, without touching the filesystem.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Precondition`] when `app_id` is not a safe
    /// single path segment.
    pub fn app_dir(&self, app_id: &str) -> Result<PathBuf, RunnerError> {
        validate_segment(app_id)?;
        Ok(self.root.join(format!("app-{app_id}")))
    }

    /// Returns a fresh, empty directory for `app_id`.
    ///
    /// # Errors
    ///
    /// Returns an error when the id is unsafe or the directory cannot be
    /// removed or created.
    pub async fn prepare(&self, app_id: &str) -> Result<PathBuf, RunnerError> {
        let dir = self.app_dir(app_id)?;
        recreate_dir(&dir).await?;
        debug!(dir = %dir.display(), "Prepared empty work directory");
        Ok(dir)
    }
}

/// Removes `path` if it exists and creates it again, empty.
///
/// # Errors
///
/// Returns the underlying IO error.
pub async fn recreate_dir(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    tokio::fs::create_dir_all(path).await
}

fn validate_segment(app_id: &str) -> Result<(), RunnerError> {
    let valid = !app_id.is_empty()
        && app_id != "."
        && app_id != ".."
        && app_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(RunnerError::precondition(format!(
            "appId '{app_id}' is not usable as a directory name"
        )))
    }
}

/// State owned by one pipeline run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildContext {
    /// Directory the source was cloned into (`None` for supplied images)
    pub work_dir: Option<PathBuf>,

    /// Image reference that gets deployed
    pub image: String,

    /// Whether this run built (and pushed) the image itself
    pub built_locally: bool,
}

impl BuildContext {
    /// Context for an image supplied by the job payload
    #[must_use]
    pub fn supplied(image: impl Into<String>) -> Self {
        Self {
            work_dir: None,
            image: image.into(),
            built_locally: false,
        }
    }

    /// Context for an image built from source in `work_dir`
    #[must_use]
    pub fn built(work_dir: impl Into<PathBuf>, image: impl Into<String>) -> Self {
        Self {
            work_dir: Some(work_dir.into()),
            image: image.into(),
            built_locally: true,
        }
    }
}
