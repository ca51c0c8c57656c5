//! Top-level facade: queue tasks, expand prepare entries, run the pool,
//! and expose one-shot registry operations (discover, inspect, delete).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use ferry_core::config::MirrorConfig;
use ferry_core::error::{FerryError, Result};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::copier::{labels_from_config, pick_leaf_entry, Copier};
use crate::dedup::DedupIndex;
use crate::export::FilesystemExporter;
use crate::manifest::Manifest;
use crate::modifier::{ImageModifier, ModifierRegistry};
use crate::planner::UploadPlanner;
use crate::pool::WorkerPool;
use crate::reference::{ImageReference, RefScheme};
use crate::registry::client::{RegistryClient, RegistrySecurity};
use crate::store::{LayerSource, LayerStore};
use crate::task::{TaskOutcome, TaskResult, UploadTask};

/// Aggregate outcome of one [`Manager::run`] call.
#[derive(Debug)]
pub struct RunSummary {
    pub results: Vec<TaskResult>,
    pub ok: usize,
    pub skipped: usize,
    pub failed: usize,
    pub elapsed: Duration,
}

impl RunSummary {
    fn new(results: Vec<TaskResult>, elapsed: Duration) -> Self {
        let mut summary = Self {
            ok: 0,
            skipped: 0,
            failed: 0,
            results,
            elapsed,
        };
        for result in &summary.results {
            match result.outcome {
                TaskOutcome::Ok => summary.ok += 1,
                TaskOutcome::Skipped => summary.skipped += 1,
                TaskOutcome::Failed => summary.failed += 1,
            }
        }
        summary
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

/// Requests cancellation of an in-flight run. Workers stop dequeuing and
/// running tasks stop at their next checkpoint.
#[derive(Clone)]
pub struct CancelHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.sender.send(true);
    }
}

/// Details of one image, resolved from its manifest and config blob.
#[derive(Debug, Clone)]
pub struct ImageDetails {
    pub name: String,
    pub tag: String,
    pub digest: String,
    pub repo_tags: Vec<String>,
    pub created: Option<DateTime<Utc>>,
    pub labels: HashMap<String, String>,
    pub architecture: String,
    pub os: String,
    pub layers: Vec<String>,
}

/// Owns the shared state of a mirroring run.
pub struct Manager {
    config: Arc<MirrorConfig>,
    security: Arc<RegistrySecurity>,
    dedup: Arc<DedupIndex>,
    store: Arc<LayerStore>,
    modifiers: ModifierRegistry,
    tasks: Mutex<Vec<UploadTask>>,
    multi_process: bool,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
}

impl Manager {
    pub fn new(config: MirrorConfig) -> Result<Self> {
        config.validate()?;
        let store_root = config
            .local_store_root
            .clone()
            .unwrap_or_else(default_store_root);
        let store = Arc::new(LayerStore::new(&store_root)?);
        let security = Arc::new(RegistrySecurity::from_config(&config));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Ok(Self {
            config: Arc::new(config),
            security,
            dedup: Arc::new(DedupIndex::new()),
            store,
            modifiers: ModifierRegistry::new(),
            tasks: Mutex::new(Vec::new()),
            multi_process: false,
            cancel_tx: Arc::new(cancel_tx),
            cancel_rx,
        })
    }

    /// Use the fixed worker count for runs coordinated across processes.
    pub fn set_multi_process(&mut self, multi_process: bool) {
        self.multi_process = multi_process;
    }

    pub fn register_modifier(&mut self, name: &str, modifier: Arc<dyn ImageModifier>) {
        self.modifiers.register(name, modifier);
    }

    pub fn add_task(&self, task: UploadTask) {
        self.tasks.lock().push(task);
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            sender: Arc::clone(&self.cancel_tx),
        }
    }

    /// Expand the configured prepare entries and append their tasks to the
    /// queue. Returns the per-image parameter map.
    pub fn add_prepared(&self) -> Result<HashMap<String, HashMap<String, String>>> {
        let plan = UploadPlanner::new(Arc::clone(&self.config)).plan()?;
        self.tasks.lock().extend(plan.tasks);
        Ok(plan.parameters)
    }

    /// Run every queued task to completion. Individual task failures are
    /// collected into the summary, never escalated.
    pub async fn run(&self) -> RunSummary {
        let started = Instant::now();
        let tasks: Vec<UploadTask> = self.tasks.lock().drain(..).collect();
        let copier = Arc::new(Copier::new(
            Arc::clone(&self.config),
            Arc::clone(&self.security),
            Arc::clone(&self.dedup),
            Arc::clone(&self.store),
            Arc::new(self.modifiers.clone()),
            self.cancel_rx.clone(),
        ));
        let pool = WorkerPool::new(self.config.workers, self.multi_process);
        let results = pool.run(copier, tasks, self.cancel_rx.clone()).await;
        let summary = RunSummary::new(results, started.elapsed());
        tracing::info!(
            ok = summary.ok,
            skipped = summary.skipped,
            failed = summary.failed,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "Run finished"
        );
        summary
    }

    /// Read the tag to mirror from an image label. The reference names the
    /// image whose config carries the label (typically `repo:latest`).
    pub async fn discover_tag(
        &self,
        image: &str,
        label: &str,
        fallback: Option<&str>,
    ) -> Result<String> {
        let reference = ImageReference::parse(image)?;
        let labels = match reference.scheme {
            RefScheme::Registry => {
                let client = self.connect(&reference.host).await?;
                let (manifest, _) = self
                    .leaf_manifest(&client, &reference.repository, reference.manifest_reference())
                    .await?;
                self.fetch_labels(&client, &reference.repository, &manifest)
                    .await?
            }
            RefScheme::Local => {
                self.store
                    .read_image(&reference.repository, reference.tag_or_default())?
                    .labels
            }
        };
        if let Some(tag) = labels.get(label) {
            return Ok(tag.clone());
        }
        match fallback {
            Some(tag) => {
                tracing::debug!(image, label, tag, "Label missing; using fallback tag");
                Ok(tag.to_string())
            }
            None => Err(FerryError::NotFound(format!(
                "{} carries no '{}' label",
                image, label
            ))),
        }
    }

    /// Resolve an image to its manifest digest, config metadata, and tag
    /// list at the source.
    pub async fn inspect(&self, image: &str) -> Result<ImageDetails> {
        let reference = ImageReference::parse(image)?;
        match reference.scheme {
            RefScheme::Registry => self.inspect_remote(&reference).await,
            RefScheme::Local => self.inspect_local(&reference),
        }
    }

    /// Remove one tag at the destination. Push-mode deletes the manifest by
    /// resolved digest; export-mode prunes the filesystem tree.
    pub async fn delete(&self, image: &str) -> Result<()> {
        let reference = ImageReference::parse(image)?;
        match reference.scheme {
            RefScheme::Registry => {
                let client = self.connect(&reference.host).await?;
                if client.supports_blob_upload(&reference.repository).await? {
                    let digest = client
                        .resolve_digest(&reference.repository, reference.tag_or_default())
                        .await?;
                    return client.delete_manifest(&reference.repository, &digest).await;
                }
                let export_dir = self.config.export_dir.as_ref().ok_or_else(|| {
                    FerryError::Config(format!(
                        "Destination {} does not accept uploads and no export_dir is configured",
                        reference.host
                    ))
                })?;
                FilesystemExporter::new(export_dir)?
                    .delete_image(&reference.repository, reference.tag_or_default())
            }
            RefScheme::Local => self
                .store
                .remove_image(&reference.repository, reference.tag_or_default()),
        }
    }

    async fn connect(&self, host: &str) -> Result<Arc<RegistryClient>> {
        Ok(Arc::new(
            RegistryClient::connect(host, &self.config, Arc::clone(&self.security)).await?,
        ))
    }

    /// Fetch a manifest and follow a list down to a single-platform leaf.
    /// Returns the leaf manifest and the digest of the originally
    /// referenced manifest.
    async fn leaf_manifest(
        &self,
        client: &RegistryClient,
        repository: &str,
        reference: &str,
    ) -> Result<(Manifest, String)> {
        let (manifest, digest) = client.get_manifest(repository, reference).await?;
        if !manifest.kind().is_list() {
            return Ok((manifest, digest));
        }
        let entries = manifest.entries()?;
        let leaf = pick_leaf_entry(&entries)?;
        let (leaf_manifest, _) = client.get_manifest(repository, &leaf.digest).await?;
        Ok((leaf_manifest, digest))
    }

    async fn fetch_labels(
        &self,
        client: &RegistryClient,
        repository: &str,
        manifest: &Manifest,
    ) -> Result<HashMap<String, String>> {
        match manifest.config()? {
            Some(config) => {
                let bytes = client.get_blob_bytes(repository, &config.digest).await?;
                Ok(labels_from_config(&bytes))
            }
            None => Ok(HashMap::new()),
        }
    }

    async fn inspect_remote(&self, reference: &ImageReference) -> Result<ImageDetails> {
        let client = self.connect(&reference.host).await?;
        let (manifest, digest) = self
            .leaf_manifest(&client, &reference.repository, reference.manifest_reference())
            .await?;

        let mut details = ImageDetails {
            name: reference.repository.clone(),
            tag: reference.tag_or_default().to_string(),
            digest,
            repo_tags: Vec::new(),
            created: None,
            labels: HashMap::new(),
            architecture: String::new(),
            os: String::new(),
            layers: manifest.layers()?.into_iter().map(|l| l.digest).collect(),
        };

        if let Some(config) = manifest.config()? {
            let bytes = client
                .get_blob_bytes(&reference.repository, &config.digest)
                .await?;
            let value: serde_json::Value = serde_json::from_slice(&bytes)?;
            details.labels = labels_from_config(&bytes);
            details.architecture = string_field(&value, "architecture");
            details.os = string_field(&value, "os");
            details.created = value
                .get("created")
                .and_then(serde_json::Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc));
        }

        // The tag list is informative; a registry denying the tags endpoint
        // must not fail the inspect.
        match client.list_tags(&reference.repository).await {
            Ok(tags) => details.repo_tags = tags,
            Err(e) => {
                tracing::debug!(repository = %reference.repository, error = %e, "Tag listing failed")
            }
        }
        Ok(details)
    }

    fn inspect_local(&self, reference: &ImageReference) -> Result<ImageDetails> {
        let record = self
            .store
            .read_image(&reference.repository, reference.tag_or_default())?;
        let layers = record
            .layers
            .iter()
            .map(|layer| match layer {
                LayerSource::Blob { digest } => digest.clone(),
                LayerSource::Diff { layer_id } => format!("diff:{}", layer_id),
            })
            .collect();
        Ok(ImageDetails {
            name: record.repository,
            tag: record.tag,
            digest: record.manifest_digest,
            repo_tags: Vec::new(),
            created: None,
            labels: record.labels,
            architecture: String::new(),
            os: String::new(),
            layers,
        })
    }
}

fn default_store_root() -> PathBuf {
    std::env::temp_dir().join("ferry-store")
}

fn string_field(value: &serde_json::Value, key: &str) -> String {
    value
        .get(key)
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
        .to_string()
}
