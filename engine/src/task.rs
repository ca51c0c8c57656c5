//! Upload task descriptions and per-task results.

use std::collections::HashMap;

use ferry_core::error::{FerryError, Result};
use serde::{Deserialize, Serialize};

use crate::reference::ImageReference;

pub use ferry_core::config::Cleanup;

/// One image copy (and optional modification) to perform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadTask {
    /// Repository plus tag, e.g. `mirror/app:1`.
    pub image_name: String,
    /// Source registry host; when absent the source is the local store.
    #[serde(default)]
    pub pull_source: Option<String>,
    /// Destination registry host.
    pub push_destination: String,
    /// Suffix appended to the tag of the modified image.
    #[serde(default)]
    pub append_tag: Option<String>,
    /// Name of the modifier to run after the plain copy.
    #[serde(default)]
    pub modifier: Option<String>,
    #[serde(default)]
    pub modifier_vars: HashMap<String, String>,
    /// Run the modifier only when the pulled image carries all of these
    /// labels; the plain copy happens regardless.
    #[serde(default)]
    pub modify_only_with_labels: HashMap<String, String>,
    #[serde(default)]
    pub cleanup: Cleanup,
    /// Follow manifest lists and copy every platform.
    #[serde(default)]
    pub multi_arch: bool,
}

impl UploadTask {
    /// Where the image is pulled from.
    pub fn source_ref(&self) -> Result<ImageReference> {
        match &self.pull_source {
            Some(host) => ImageReference::parse(&format!("registry://{}/{}", host, self.image_name)),
            None => ImageReference::parse(&format!("local:{}", self.image_name)),
        }
    }

    /// Where the unmodified copy lands: destination host, source tag.
    pub fn target_source_tag_ref(&self) -> Result<ImageReference> {
        ImageReference::parse(&format!(
            "registry://{}/{}",
            self.push_destination, self.image_name
        ))
    }

    /// The final reference at the destination. With a modifier this carries
    /// the appended tag; without one it equals the source-tag reference.
    pub fn target_ref(&self) -> Result<ImageReference> {
        let base = self.target_source_tag_ref()?;
        match (&self.modifier, &self.append_tag) {
            (Some(_), Some(suffix)) => {
                let tag = format!("{}{}", base.tag_or_default(), suffix);
                Ok(base.with_tag(&tag))
            }
            _ => Ok(base),
        }
    }

    /// Validate the fields that parsing alone does not cover.
    pub fn validate(&self) -> Result<()> {
        if self.image_name.is_empty() {
            return Err(FerryError::Config("Task has an empty image name".to_string()));
        }
        if self.push_destination.is_empty() {
            return Err(FerryError::Config(format!(
                "Task {} has no push destination",
                self.image_name
            )));
        }
        if self.modifier.is_some() && self.append_tag.is_none() {
            return Err(FerryError::Config(format!(
                "Task {} sets a modifier but no append tag",
                self.image_name
            )));
        }
        self.source_ref()?;
        self.target_ref()?;
        Ok(())
    }
}

/// Final outcome of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskOutcome {
    Ok,
    Skipped,
    Failed,
}

/// Per-task record collected into the run summary.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task: UploadTask,
    pub outcome: TaskOutcome,
    pub reason: Option<String>,
    /// References written at the destination by this task.
    pub affected_images: Vec<String>,
}

impl TaskResult {
    pub fn ok(task: UploadTask, affected_images: Vec<String>) -> Self {
        Self {
            task,
            outcome: TaskOutcome::Ok,
            reason: None,
            affected_images,
        }
    }

    pub fn skipped(task: UploadTask, reason: impl Into<String>) -> Self {
        Self {
            task,
            outcome: TaskOutcome::Skipped,
            reason: Some(reason.into()),
            affected_images: Vec::new(),
        }
    }

    pub fn failed(task: UploadTask, error: &FerryError) -> Self {
        Self {
            task,
            outcome: TaskOutcome::Failed,
            reason: Some(error.to_string()),
            affected_images: Vec::new(),
        }
    }
}
