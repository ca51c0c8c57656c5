//! The copy pipeline: probe, fetch, dedup, stream, write, modify.
//!
//! One [`Copier`] is shared by all workers of a run. Per task it opens its
//! own registry sessions, decides between push-mode (registry upload API)
//! and export-mode (static filesystem tree), copies layers with bounded
//! parallelism under dedup leases, writes manifests leaves-first, and runs
//! the optional modifier step through the local store.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use ferry_core::config::MirrorConfig;
use ferry_core::error::{FerryError, Result};
use parking_lot::Mutex;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use crate::dedup::{DedupEntry, DedupIndex, DedupScope};
use crate::digest::StreamingDigest;
use crate::export::{ExportBlobWriter, FilesystemExporter};
use crate::manifest::{Manifest, ManifestEntry, CONFIG_V1, LAYER_TAR_GZIP, MANIFEST_V2};
use crate::modifier::{ModifierRegistry, ModifyRequest, StoreImageBuilder};
use crate::reference::{ImageReference, RefScheme};
use crate::registry::client::{MountOutcome, RegistryClient, RegistrySecurity};
use crate::store::{LayerSource, LayerStore, LayerStream, LocalImage};
use crate::task::{Cleanup, TaskResult, UploadTask};

/// Layer copies in flight per image.
const MAX_LAYER_CONCURRENCY: usize = 4;

/// Bytes buffered before a PATCH chunk is sent.
const UPLOAD_CHUNK_SIZE: usize = 2 * 1024 * 1024;

/// Where a task's writes go.
#[derive(Clone)]
enum Destination {
    Push(Arc<RegistryClient>),
    Export(Arc<FilesystemExporter>),
}

impl Destination {
    /// Key for the per-destination mount-hint map.
    fn host_key(&self) -> String {
        match self {
            Destination::Push(client) => client.host().to_string(),
            Destination::Export(exporter) => {
                format!("export:{}", exporter.root().display())
            }
        }
    }
}

/// Where a layer's bytes come from.
#[derive(Clone)]
enum BlobOrigin {
    Remote {
        client: Arc<RegistryClient>,
        repository: String,
    },
    StoreBlob {
        store: Arc<LayerStore>,
    },
    StoreDiff {
        store: Arc<LayerStore>,
        layer_id: String,
    },
}

impl BlobOrigin {
    async fn open(&self, digest: &str) -> Result<ChunkStream> {
        match self {
            BlobOrigin::Remote { client, repository } => {
                let response = client.get_blob(repository, digest).await?;
                Ok(ChunkStream::Http(response))
            }
            BlobOrigin::StoreBlob { store } => {
                Ok(ChunkStream::Local(store.open_blob_stream(digest)?))
            }
            BlobOrigin::StoreDiff { store, layer_id } => {
                Ok(ChunkStream::Local(store.open_layer_stream(layer_id)?))
            }
        }
    }
}

/// Unified chunk-wise reader over HTTP bodies and local streams.
enum ChunkStream {
    Http(reqwest::Response),
    Local(LayerStream),
}

impl ChunkStream {
    async fn next(&mut self) -> Option<Result<Bytes>> {
        match self {
            ChunkStream::Http(response) => response
                .chunk()
                .await
                .map_err(|e| FerryError::Transient(format!("Blob stream failed: {}", e)))
                .transpose(),
            ChunkStream::Local(stream) => stream
                .next_chunk()
                .await
                .map(|chunk| chunk.map_err(FerryError::Io)),
        }
    }
}

/// One layer (or config blob) to place at the destination.
#[derive(Clone)]
struct LayerPlan {
    /// Declared digest; for diff layers a provisional lease key.
    digest: String,
    /// Declared size; 0 when unknown.
    size: u64,
    /// Whether the blob gets a `.gz` name in export trees.
    gzipped: bool,
    /// Fail on digest mismatch (`true`), or accept the computed digest as
    /// authoritative (`false`, local-origin layers).
    verify: bool,
    origin: BlobOrigin,
}

/// Digest and size of a blob confirmed present at the destination.
#[derive(Debug, Clone)]
struct CopiedLayer {
    digest: String,
    size: u64,
}

/// Write side of one blob transfer.
enum BlobSink {
    Push {
        client: Arc<RegistryClient>,
        repository: String,
        location: String,
        offset: u64,
        buffer: BytesMut,
    },
    Export {
        writer: ExportBlobWriter,
        exporter: Arc<FilesystemExporter>,
        repository: String,
        provisional: String,
        gzipped: bool,
    },
}

impl BlobSink {
    async fn open(dest: &Destination, repository: &str, plan: &LayerPlan, session: Option<String>) -> Result<Self> {
        match dest {
            Destination::Push(client) => {
                let location = match session {
                    Some(location) => location,
                    None => client.start_upload(repository).await?,
                };
                Ok(BlobSink::Push {
                    client: Arc::clone(client),
                    repository: repository.to_string(),
                    location,
                    offset: 0,
                    buffer: BytesMut::with_capacity(UPLOAD_CHUNK_SIZE),
                })
            }
            Destination::Export(exporter) => Ok(BlobSink::Export {
                writer: exporter.blob_writer(repository, &plan.digest, plan.gzipped)?,
                exporter: Arc::clone(exporter),
                repository: repository.to_string(),
                provisional: plan.digest.clone(),
                gzipped: plan.gzipped,
            }),
        }
    }

    async fn write(&mut self, chunk: Bytes) -> Result<()> {
        match self {
            BlobSink::Push {
                client,
                repository,
                location,
                offset,
                buffer,
            } => {
                buffer.extend_from_slice(&chunk);
                if buffer.len() >= UPLOAD_CHUNK_SIZE {
                    let part = buffer.split().freeze();
                    let next = client
                        .upload_chunk(repository, location, *offset, part.clone())
                        .await?;
                    *offset += part.len() as u64;
                    *location = next;
                }
                Ok(())
            }
            BlobSink::Export { writer, .. } => writer.write_chunk(&chunk),
        }
    }

    /// Flush, finalize under `digest`, and return the blob's known path.
    async fn finish(self, digest: &str) -> Result<String> {
        match self {
            BlobSink::Push {
                client,
                repository,
                mut location,
                mut offset,
                mut buffer,
            } => {
                if !buffer.is_empty() {
                    let part = buffer.split().freeze();
                    location = client
                        .upload_chunk(&repository, &location, offset, part.clone())
                        .await?;
                    offset += part.len() as u64;
                }
                let _ = offset;
                client.finalize_upload(&repository, &location, digest).await?;
                Ok(client.blob_url(&repository, digest))
            }
            BlobSink::Export {
                writer,
                exporter,
                repository,
                provisional,
                gzipped,
            } => {
                let mut path = writer.commit()?;
                if provisional != digest {
                    path = exporter.rename_blob(&repository, &provisional, digest)?;
                }
                let _ = gzipped;
                Ok(path.to_string_lossy().into_owned())
            }
        }
    }

    async fn abort(self) {
        match self {
            BlobSink::Push {
                client,
                repository,
                location,
                ..
            } => {
                let _ = client.cancel_upload(&repository, &location).await;
            }
            BlobSink::Export { writer, .. } => writer.abort(),
        }
    }

    fn scope(&self) -> DedupScope {
        match self {
            BlobSink::Push { .. } => DedupScope::Remote,
            BlobSink::Export { .. } => DedupScope::Local,
        }
    }
}

/// Outcome of [`Copier::execute`] before it is folded into a [`TaskResult`].
enum ExecOutcome {
    Done(Vec<String>),
    Skipped(String),
}

/// Shared copy engine.
pub struct Copier {
    config: Arc<MirrorConfig>,
    security: Arc<RegistrySecurity>,
    dedup: Arc<DedupIndex>,
    store: Arc<LayerStore>,
    modifiers: Arc<ModifierRegistry>,
    /// (destination key, digest) → repository that uploaded the blob there;
    /// source of `?mount=&from=` hints.
    image_layers: Mutex<HashMap<(String, String), String>>,
    cancel: watch::Receiver<bool>,
}

impl Copier {
    pub fn new(
        config: Arc<MirrorConfig>,
        security: Arc<RegistrySecurity>,
        dedup: Arc<DedupIndex>,
        store: Arc<LayerStore>,
        modifiers: Arc<ModifierRegistry>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            security,
            dedup,
            store,
            modifiers,
            image_layers: Mutex::new(HashMap::new()),
            cancel,
        }
    }

    /// Run one task to completion and fold the outcome into a result record.
    pub async fn run(self: &Arc<Self>, task: &UploadTask) -> TaskResult {
        match self.execute(task).await {
            Ok(ExecOutcome::Done(affected)) => {
                tracing::info!(image = %task.image_name, "Task completed");
                TaskResult::ok(task.clone(), affected)
            }
            Ok(ExecOutcome::Skipped(reason)) => {
                tracing::info!(image = %task.image_name, reason = %reason, "Task skipped");
                TaskResult::skipped(task.clone(), reason)
            }
            Err(e) => {
                tracing::error!(image = %task.image_name, error = %e, "Task failed");
                TaskResult::failed(task.clone(), &e)
            }
        }
    }

    async fn execute(self: &Arc<Self>, task: &UploadTask) -> Result<ExecOutcome> {
        task.validate()?;
        self.ensure_live()?;

        let source_ref = task.source_ref()?;
        let target = task.target_source_tag_ref()?;
        let final_ref = task.target_ref()?;
        let dest = self.resolve_destination(&final_ref.host, &target.repository).await?;

        // Modifier tasks short-circuit when the modified tag already exists.
        if task.modifier.is_some() && self.tag_exists(&dest, &final_ref).await {
            return Ok(ExecOutcome::Skipped(format!(
                "{} already present at destination",
                final_ref
            )));
        }

        let mut affected = Vec::new();
        match source_ref.scheme {
            RefScheme::Registry => {
                let source = self.connect(&source_ref.host).await?;
                self.copy_image(
                    &source,
                    &source_ref.repository,
                    &dest,
                    &target.repository,
                    source_ref.manifest_reference(),
                    Some(target.tag_or_default()),
                    task.multi_arch,
                )
                .await?;
                affected.push(target.full_reference());

                if let Some(ref modifier_name) = task.modifier {
                    let labels = self
                        .pull_to_local(
                            &source,
                            &source_ref.repository,
                            &target.repository,
                            target.tag_or_default(),
                        )
                        .await?;
                    if labels_match(&task.modify_only_with_labels, &labels) {
                        self.modify_and_push(task, modifier_name, &dest, &target, &final_ref)
                            .await?;
                        affected.push(final_ref.full_reference());
                    } else {
                        tracing::info!(
                            image = %task.image_name,
                            "Labels do not match the modifier filter; copy only"
                        );
                    }
                    if task.cleanup != Cleanup::None {
                        let _ = self
                            .store
                            .remove_image(&target.repository, target.tag_or_default());
                    }
                }
            }
            RefScheme::Local => {
                self.push_local(
                    &dest,
                    &source_ref.repository,
                    source_ref.tag_or_default(),
                    &target.repository,
                    target.tag_or_default(),
                )
                .await?;
                affected.push(target.full_reference());

                if let Some(ref modifier_name) = task.modifier {
                    let record = self
                        .store
                        .read_image(&source_ref.repository, source_ref.tag_or_default())?;
                    if labels_match(&task.modify_only_with_labels, &record.labels) {
                        let local =
                            ImageReference::local(&source_ref.repository, source_ref.tag_or_default());
                        self.run_modifier(task, modifier_name, &local, &final_ref).await?;
                        self.push_local(
                            &dest,
                            &source_ref.repository,
                            source_ref.tag_or_default(),
                            &final_ref.repository,
                            final_ref.tag_or_default(),
                        )
                        .await?;
                        affected.push(final_ref.full_reference());
                    }
                    if task.cleanup == Cleanup::Full {
                        let _ = self
                            .store
                            .remove_image(&source_ref.repository, source_ref.tag_or_default());
                    }
                }
            }
        }

        Ok(ExecOutcome::Done(affected))
    }

    /// Pull the copied image into the local store, run the modifier in
    /// place, and push the result under the appended tag.
    async fn modify_and_push(
        self: &Arc<Self>,
        task: &UploadTask,
        modifier_name: &str,
        dest: &Destination,
        target: &ImageReference,
        final_ref: &ImageReference,
    ) -> Result<()> {
        let local = ImageReference::local(&target.repository, target.tag_or_default());
        self.run_modifier(task, modifier_name, &local, final_ref).await?;
        self.push_local(
            dest,
            &target.repository,
            target.tag_or_default(),
            &final_ref.repository,
            final_ref.tag_or_default(),
        )
        .await?;
        Ok(())
    }

    async fn run_modifier(
        &self,
        task: &UploadTask,
        modifier_name: &str,
        local: &ImageReference,
        final_ref: &ImageReference,
    ) -> Result<()> {
        let modifier = self.modifiers.get(modifier_name)?;
        let builder = StoreImageBuilder::new(Arc::clone(&self.store));
        let request = ModifyRequest {
            name: modifier_name.to_string(),
            source: local.clone(),
            destination: local.clone(),
            append_tag: task.append_tag.clone().unwrap_or_default(),
            vars: task.modifier_vars.clone(),
        };
        tracing::info!(
            modifier = modifier_name,
            image = %local,
            target = %final_ref,
            "Running modifier"
        );
        modifier.modify(&builder, &request).await
    }

    // --- Destination handling ---

    async fn connect(&self, host: &str) -> Result<Arc<RegistryClient>> {
        Ok(Arc::new(
            RegistryClient::connect(host, &self.config, Arc::clone(&self.security)).await?,
        ))
    }

    /// Connect to the destination and pick push-mode or export-mode from
    /// the upload-endpoint probe.
    async fn resolve_destination(&self, host: &str, repository: &str) -> Result<Destination> {
        let client = self.connect(host).await?;
        if client.supports_blob_upload(repository).await? {
            return Ok(Destination::Push(client));
        }
        let export_dir = self.config.export_dir.as_ref().ok_or_else(|| {
            FerryError::Config(format!(
                "Destination {} does not accept uploads and no export_dir is configured",
                host
            ))
        })?;
        tracing::info!(host, "Destination is export-mode; writing a filesystem tree");
        Ok(Destination::Export(Arc::new(FilesystemExporter::new(
            export_dir,
        )?)))
    }

    async fn tag_exists(&self, dest: &Destination, reference: &ImageReference) -> bool {
        match dest {
            Destination::Push(client) => client
                .resolve_digest(&reference.repository, reference.tag_or_default())
                .await
                .is_ok(),
            Destination::Export(exporter) => {
                exporter.has_tag(&reference.repository, reference.tag_or_default())
            }
        }
    }

    // --- Image copy ---

    /// Copy one manifest reference from a source registry. Lists recurse
    /// into their leaves (written by digest) before the list itself is
    /// written under the tag. Returns the digest written at the destination.
    async fn copy_image(
        self: &Arc<Self>,
        source: &Arc<RegistryClient>,
        src_repo: &str,
        dest: &Destination,
        dst_repo: &str,
        reference: &str,
        tag: Option<&str>,
        multi_arch: bool,
    ) -> Result<String> {
        self.ensure_live()?;
        let (manifest, source_digest) = source.get_manifest(src_repo, reference).await?;
        tracing::debug!(
            repository = src_repo,
            reference,
            digest = %source_digest,
            kind = ?manifest.kind(),
            "Fetched source manifest"
        );

        if manifest.kind().is_list() {
            let entries = manifest.entries()?;
            if !multi_arch {
                let entry = pick_leaf_entry(&entries)?;
                return Box::pin(self.copy_image(
                    source, src_repo, dest, dst_repo, &entry.digest, tag, false,
                ))
                .await;
            }

            let mut digest_map = Vec::new();
            for entry in &entries {
                let written = Box::pin(self.copy_image(
                    source,
                    src_repo,
                    dest,
                    dst_repo,
                    &entry.digest,
                    None,
                    false,
                ))
                .await?;
                if written != entry.digest {
                    digest_map.push((entry.digest.clone(), written));
                }
            }

            let mut normalized = manifest.normalized_for_push()?;
            if !digest_map.is_empty() {
                normalized = normalized.with_rewritten_entries(&digest_map)?;
            }
            return self.write_manifest(dest, dst_repo, tag, &normalized).await;
        }

        let layers = manifest.layers()?;
        let plans: Vec<LayerPlan> = layers
            .iter()
            .map(|layer| LayerPlan {
                digest: layer.digest.clone(),
                size: layer.size,
                gzipped: !layer.media_type.ends_with("tar"),
                verify: true,
                origin: BlobOrigin::Remote {
                    client: Arc::clone(source),
                    repository: src_repo.to_string(),
                },
            })
            .collect();
        self.copy_layers(plans, dest, dst_repo).await?;

        if let Some(config) = manifest.config()? {
            let plan = LayerPlan {
                digest: config.digest.clone(),
                size: config.size,
                gzipped: false,
                verify: true,
                origin: BlobOrigin::Remote {
                    client: Arc::clone(source),
                    repository: src_repo.to_string(),
                },
            };
            Arc::clone(self)
                .copy_layer(plan, dest.clone(), dst_repo.to_string())
                .await?;
        }

        let normalized = manifest.normalized_for_push()?;
        self.write_manifest(dest, dst_repo, tag, &normalized).await
    }

    async fn write_manifest(
        &self,
        dest: &Destination,
        repository: &str,
        tag: Option<&str>,
        manifest: &Manifest,
    ) -> Result<String> {
        match dest {
            Destination::Push(client) => {
                let reference = match tag {
                    Some(tag) => tag.to_string(),
                    None => manifest.digest(),
                };
                client
                    .put_manifest(
                        repository,
                        &reference,
                        manifest.media_type(),
                        manifest.bytes().to_vec(),
                    )
                    .await?;
                tracing::info!(
                    repository,
                    reference = %reference,
                    digest = %manifest.digest(),
                    "Wrote manifest"
                );
                Ok(manifest.digest())
            }
            Destination::Export(exporter) => exporter.write_manifest(repository, tag, manifest),
        }
    }

    // --- Layer copy ---

    /// Copy a batch of layers with bounded parallelism; results come back
    /// in plan order.
    async fn copy_layers(
        self: &Arc<Self>,
        plans: Vec<LayerPlan>,
        dest: &Destination,
        dst_repo: &str,
    ) -> Result<Vec<CopiedLayer>> {
        let total = plans.len();
        let semaphore = Arc::new(Semaphore::new(MAX_LAYER_CONCURRENCY));
        let mut join_set = JoinSet::new();
        for (index, plan) in plans.into_iter().enumerate() {
            let copier = Arc::clone(self);
            let dest = dest.clone();
            let repository = dst_repo.to_string();
            let semaphore = Arc::clone(&semaphore);
            join_set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| FerryError::Cancelled)?;
                let copied = copier.copy_layer(plan, dest, repository).await?;
                Ok::<(usize, CopiedLayer), FerryError>((index, copied))
            });
        }

        let mut results: Vec<Option<CopiedLayer>> = vec![None; total];
        while let Some(joined) = join_set.join_next().await {
            let (index, copied) = joined
                .map_err(|e| FerryError::Transient(format!("Layer copy task died: {}", e)))??;
            results[index] = Some(copied);
        }
        results
            .into_iter()
            .map(|r| {
                r.ok_or_else(|| FerryError::Protocol("Layer copy produced no result".to_string()))
            })
            .collect()
    }

    /// Copy one blob under its dedup lease.
    async fn copy_layer(
        self: Arc<Self>,
        plan: LayerPlan,
        dest: Destination,
        dst_repo: String,
    ) -> Result<CopiedLayer> {
        self.ensure_live()?;
        let _lease = self.dedup.acquire_with_backoff(&plan.digest).await?;
        let result = self.copy_layer_locked(&plan, &dest, &dst_repo).await;
        if let Err(ref e) = result {
            self.dedup.forget(&plan.digest);
            tracing::warn!(digest = %plan.digest, error = %e, "Layer copy failed");
        }
        result
    }

    async fn copy_layer_locked(
        &self,
        plan: &LayerPlan,
        dest: &Destination,
        dst_repo: &str,
    ) -> Result<CopiedLayer> {
        let host_key = dest.host_key();
        let mut session = None;

        // Shortcuts only apply when the digest is known up front.
        if plan.verify {
            match dest {
                Destination::Push(client) => {
                    if client.blob_exists(dst_repo, &plan.digest).await? {
                        self.record_present(dest, dst_repo, &plan.digest, DedupScope::Remote, client.blob_url(dst_repo, &plan.digest));
                        return Ok(CopiedLayer {
                            digest: plan.digest.clone(),
                            size: plan.size,
                        });
                    }
                    if let Some(from_repo) = self.mount_hint(client, &host_key, &plan.digest, dst_repo) {
                        match client.mount_blob(dst_repo, &plan.digest, &from_repo).await {
                            Ok(MountOutcome::Mounted) => {
                                tracing::debug!(
                                    digest = %plan.digest,
                                    from = %from_repo,
                                    to = dst_repo,
                                    "Cross-repo mounted blob"
                                );
                                self.record_present(dest, dst_repo, &plan.digest, DedupScope::Remote, client.blob_url(dst_repo, &plan.digest));
                                return Ok(CopiedLayer {
                                    digest: plan.digest.clone(),
                                    size: plan.size,
                                });
                            }
                            Ok(MountOutcome::Session(location)) => session = Some(location),
                            Err(e) => {
                                tracing::debug!(
                                    digest = %plan.digest,
                                    error = %e,
                                    "Mount attempt failed; uploading instead"
                                );
                            }
                        }
                    }
                }
                Destination::Export(exporter) => {
                    if exporter.has_blob(dst_repo, &plan.digest) {
                        let path = exporter
                            .find_blob(dst_repo, &plan.digest)
                            .map(|p| p.to_string_lossy().into_owned())
                            .unwrap_or_default();
                        self.record_present(dest, dst_repo, &plan.digest, DedupScope::Local, path);
                        return Ok(CopiedLayer {
                            digest: plan.digest.clone(),
                            size: plan.size,
                        });
                    }
                    if let Some(entry) = self.dedup.probe(&plan.digest) {
                        if entry.scope == DedupScope::Local {
                            let path = exporter.link_blob(
                                dst_repo,
                                &plan.digest,
                                Path::new(&entry.known_path),
                            )?;
                            self.record_present(
                                dest,
                                dst_repo,
                                &plan.digest,
                                DedupScope::Local,
                                path.to_string_lossy().into_owned(),
                            );
                            return Ok(CopiedLayer {
                                digest: plan.digest.clone(),
                                size: plan.size,
                            });
                        }
                    }
                }
            }
        }

        // Stream source to destination with a rolling digest.
        let mut stream = plan.origin.open(&plan.digest).await?;
        let mut sink = BlobSink::open(dest, dst_repo, plan, session).await?;
        let scope = sink.scope();
        let mut rolling = StreamingDigest::new();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    sink.abort().await;
                    return Err(e);
                }
            };
            rolling.update(&chunk);
            if let Err(e) = sink.write(chunk).await {
                sink.abort().await;
                return Err(e);
            }
        }

        let size = rolling.bytes_seen();
        let computed = rolling.finalize();
        if plan.verify && computed != plan.digest {
            sink.abort().await;
            return Err(FerryError::DigestMismatch {
                expected: plan.digest.clone(),
                actual: computed,
            });
        }
        let final_digest = if plan.verify {
            plan.digest.clone()
        } else {
            computed
        };
        let known_path = sink.finish(&final_digest).await?;

        self.record_present(dest, dst_repo, &final_digest, scope, known_path);
        tracing::debug!(
            digest = %final_digest,
            size,
            repository = dst_repo,
            "Copied blob"
        );
        Ok(CopiedLayer {
            digest: final_digest,
            size,
        })
    }

    /// Record a blob as present at the destination and as a mount hint.
    fn record_present(
        &self,
        dest: &Destination,
        dst_repo: &str,
        digest: &str,
        scope: DedupScope,
        known_path: String,
    ) {
        self.dedup.insert(
            digest,
            DedupEntry {
                scope,
                known_path,
                image_ref: dst_repo.to_string(),
            },
        );
        self.image_layers
            .lock()
            .entry((dest.host_key(), digest.to_string()))
            .or_insert_with(|| dst_repo.to_string());
    }

    /// A repository on the same destination known to hold the blob.
    fn mount_hint(
        &self,
        client: &RegistryClient,
        host_key: &str,
        digest: &str,
        dst_repo: &str,
    ) -> Option<String> {
        if let Some(repo) = self
            .image_layers
            .lock()
            .get(&(host_key.to_string(), digest.to_string()))
        {
            if repo != dst_repo {
                return Some(repo.clone());
            }
        }
        let entry = self.dedup.probe(digest)?;
        if entry.scope == DedupScope::Remote
            && entry.known_path.starts_with(client.base_url())
            && entry.image_ref != dst_repo
        {
            return Some(entry.image_ref);
        }
        None
    }

    // --- Local store transfer ---

    /// Pull a single-platform image into the local store, returning the
    /// config labels. Lists resolve to their preferred leaf first.
    async fn pull_to_local(
        self: &Arc<Self>,
        source: &Arc<RegistryClient>,
        src_repo: &str,
        record_repo: &str,
        tag: &str,
    ) -> Result<HashMap<String, String>> {
        let (mut manifest, mut digest) = source.get_manifest(src_repo, tag).await?;
        if manifest.kind().is_list() {
            let entries = manifest.entries()?;
            let entry = pick_leaf_entry(&entries)?;
            let (leaf, leaf_digest) = source.get_manifest(src_repo, &entry.digest).await?;
            manifest = leaf;
            digest = leaf_digest;
        }

        let layers = manifest.layers()?;
        for layer in &layers {
            if self.store.has_blob(&layer.digest) {
                continue;
            }
            self.fetch_blob_to_store(source, src_repo, &layer.digest).await?;
        }

        let config = manifest.config()?.ok_or_else(|| {
            FerryError::Protocol(format!(
                "Cannot store {} locally: manifest has no config blob",
                src_repo
            ))
        })?;
        let config_bytes = source.get_blob_bytes(src_repo, &config.digest).await?;
        if !self.store.has_blob(&config.digest) {
            let mut writer = self.store.blob_writer(&config.digest)?;
            writer.write_chunk(&config_bytes)?;
            writer.commit()?;
        }

        let labels = labels_from_config(&config_bytes);
        let record = LocalImage {
            repository: record_repo.to_string(),
            tag: tag.to_string(),
            manifest_digest: digest.clone(),
            manifest_media_type: manifest.media_type().to_string(),
            config_digest: config.digest.clone(),
            layers: layers
                .iter()
                .map(|layer| LayerSource::Blob {
                    digest: layer.digest.clone(),
                })
                .collect(),
            labels: labels.clone(),
        };
        self.store.write_image(&record, manifest.bytes())?;
        tracing::info!(
            repository = record_repo,
            tag,
            digest = %digest,
            "Pulled image into local store"
        );
        Ok(labels)
    }

    /// Fetch one blob into the local store under its dedup lease, so a
    /// layer shared by several images downloads once per run.
    async fn fetch_blob_to_store(
        &self,
        source: &Arc<RegistryClient>,
        src_repo: &str,
        digest: &str,
    ) -> Result<()> {
        self.ensure_live()?;
        let _lease = self.dedup.acquire_with_backoff(digest).await?;
        if self.store.has_blob(digest) {
            return Ok(());
        }
        let response = source.get_blob(src_repo, digest).await?;
        let mut stream = ChunkStream::Http(response);
        let mut writer = self.store.blob_writer(digest)?;
        let mut rolling = StreamingDigest::new();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    writer.abort();
                    return Err(e);
                }
            };
            rolling.update(&chunk);
            if let Err(e) = writer.write_chunk(&chunk) {
                writer.abort();
                return Err(e);
            }
        }
        let computed = rolling.finalize();
        if computed != digest {
            writer.abort();
            return Err(FerryError::DigestMismatch {
                expected: digest.to_string(),
                actual: computed,
            });
        }
        writer.commit()
    }

    /// Push a local-store image to the destination. Diff layers stream as
    /// freshly built gzip tars; their digests become known only here, so the
    /// manifest is rebuilt rather than reused.
    async fn push_local(
        self: &Arc<Self>,
        dest: &Destination,
        record_repo: &str,
        record_tag: &str,
        dst_repo: &str,
        push_tag: &str,
    ) -> Result<String> {
        let record = self.store.read_image(record_repo, record_tag)?;

        let mut plans = Vec::new();
        for layer in &record.layers {
            let plan = match layer {
                LayerSource::Blob { digest } => LayerPlan {
                    digest: digest.clone(),
                    size: blob_size(&self.store, digest)?,
                    gzipped: true,
                    verify: true,
                    origin: BlobOrigin::StoreBlob {
                        store: Arc::clone(&self.store),
                    },
                },
                LayerSource::Diff { layer_id } => LayerPlan {
                    digest: format!("pending:{}", layer_id),
                    size: 0,
                    gzipped: true,
                    verify: false,
                    origin: BlobOrigin::StoreDiff {
                        store: Arc::clone(&self.store),
                        layer_id: layer_id.clone(),
                    },
                },
            };
            plans.push(plan);
        }
        let copied = self.copy_layers(plans, dest, dst_repo).await?;

        let config_bytes = std::fs::read(self.store.blob_path(&record.config_digest))
            .map_err(|_| {
                FerryError::NotFound(format!(
                    "Config blob {} missing from local store",
                    record.config_digest
                ))
            })?;
        let config_plan = LayerPlan {
            digest: record.config_digest.clone(),
            size: config_bytes.len() as u64,
            gzipped: false,
            verify: true,
            origin: BlobOrigin::StoreBlob {
                store: Arc::clone(&self.store),
            },
        };
        Arc::clone(self)
            .copy_layer(config_plan, dest.clone(), dst_repo.to_string())
            .await?;

        let manifest = build_v2_manifest(&record.config_digest, config_bytes.len() as u64, &copied)?;
        self.write_manifest(dest, dst_repo, Some(push_tag), &manifest).await
    }

    fn ensure_live(&self) -> Result<()> {
        if *self.cancel.borrow() {
            return Err(FerryError::Cancelled);
        }
        Ok(())
    }
}

/// Size of a blob stored locally.
fn blob_size(store: &LayerStore, digest: &str) -> Result<u64> {
    Ok(std::fs::metadata(store.blob_path(digest))
        .map_err(|_| FerryError::NotFound(format!("Blob {} missing from local store", digest)))?
        .len())
}

/// Build a fresh Docker V2 manifest for a local image being pushed.
fn build_v2_manifest(config_digest: &str, config_size: u64, layers: &[CopiedLayer]) -> Result<Manifest> {
    let layer_values: Vec<serde_json::Value> = layers
        .iter()
        .map(|layer| {
            serde_json::json!({
                "mediaType": LAYER_TAR_GZIP,
                "size": layer.size,
                "digest": layer.digest,
            })
        })
        .collect();
    let value = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": MANIFEST_V2,
        "config": {
            "mediaType": CONFIG_V1,
            "size": config_size,
            "digest": config_digest,
        },
        "layers": layer_values,
    });
    Manifest::parse(&serde_json::to_vec(&value)?, None)
}

/// Single-platform leaf choice for `multi_arch = false`: prefer
/// linux/amd64, fall back to the first entry.
pub(crate) fn pick_leaf_entry(entries: &[ManifestEntry]) -> Result<&ManifestEntry> {
    if entries.is_empty() {
        return Err(FerryError::Protocol("Manifest list has no entries".to_string()));
    }
    Ok(entries
        .iter()
        .find(|entry| {
            entry
                .platform
                .as_ref()
                .map(|p| p.architecture == "amd64" && p.os == "linux")
                .unwrap_or(false)
        })
        .unwrap_or(&entries[0]))
}

/// Whether an image's labels satisfy a required subset.
fn labels_match(required: &HashMap<String, String>, actual: &HashMap<String, String>) -> bool {
    required
        .iter()
        .all(|(key, value)| actual.get(key) == Some(value))
}

/// Extract `config.Labels` from an image config blob.
pub(crate) fn labels_from_config(bytes: &[u8]) -> HashMap<String, String> {
    let value: serde_json::Value = match serde_json::from_slice(bytes) {
        Ok(value) => value,
        Err(_) => return HashMap::new(),
    };
    value
        .get("config")
        .and_then(|c| c.get("Labels"))
        .and_then(serde_json::Value::as_object)
        .map(|labels| {
            labels
                .iter()
                .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::sha256_digest;
    use crate::manifest::Platform;
    use tempfile::TempDir;

    fn test_copier(store_dir: &TempDir) -> Arc<Copier> {
        let (_, cancel) = watch::channel(false);
        Arc::new(Copier::new(
            Arc::new(MirrorConfig::default()),
            Arc::new(RegistrySecurity::default()),
            Arc::new(DedupIndex::new()),
            Arc::new(LayerStore::new(store_dir.path()).unwrap()),
            Arc::new(ModifierRegistry::new()),
            cancel,
        ))
    }

    fn cancelled_copier(store_dir: &TempDir) -> Arc<Copier> {
        let (_tx, cancel) = watch::channel(true);
        Arc::new(Copier::new(
            Arc::new(MirrorConfig::default()),
            Arc::new(RegistrySecurity::default()),
            Arc::new(DedupIndex::new()),
            Arc::new(LayerStore::new(store_dir.path()).unwrap()),
            Arc::new(ModifierRegistry::new()),
            cancel,
        ))
    }

    fn seed_local_image(
        copier: &Arc<Copier>,
        repository: &str,
        tag: &str,
        layer_bytes: &[u8],
        diff_files: Option<&[(&str, &[u8])]>,
    ) -> (String, String) {
        let layer_digest = sha256_digest(layer_bytes);
        let mut writer = copier.store.blob_writer(&layer_digest).unwrap();
        writer.write_chunk(layer_bytes).unwrap();
        writer.commit().unwrap();

        let config_bytes = br#"{"architecture":"amd64","os":"linux","config":{"Labels":{"build":"7"}}}"#;
        let config_digest = sha256_digest(config_bytes);
        let mut writer = copier.store.blob_writer(&config_digest).unwrap();
        writer.write_chunk(config_bytes).unwrap();
        writer.commit().unwrap();

        let mut layers = vec![LayerSource::Blob {
            digest: layer_digest.clone(),
        }];
        if let Some(files) = diff_files {
            let layer_id = "diff-layer-1".to_string();
            let diff = copier.store.diff_dir(&layer_id);
            for (name, contents) in files {
                let path = diff.join(name);
                std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                std::fs::write(path, contents).unwrap();
            }
            layers.push(LayerSource::Diff { layer_id });
        }

        let record = LocalImage {
            repository: repository.to_string(),
            tag: tag.to_string(),
            manifest_digest: "sha256:0000000000000000000000000000000000000000000000000000000000000000".to_string(),
            manifest_media_type: MANIFEST_V2.to_string(),
            config_digest: config_digest.clone(),
            layers,
            labels: HashMap::from([("build".to_string(), "7".to_string())]),
        };
        copier.store.write_image(&record, b"{}").unwrap();
        (layer_digest, config_digest)
    }

    #[test]
    fn test_pick_leaf_prefers_amd64() {
        let entries = vec![
            ManifestEntry {
                digest: "sha256:arm".to_string(),
                size: 1,
                media_type: MANIFEST_V2.to_string(),
                platform: Some(Platform {
                    architecture: "arm64".to_string(),
                    os: "linux".to_string(),
                }),
            },
            ManifestEntry {
                digest: "sha256:amd".to_string(),
                size: 1,
                media_type: MANIFEST_V2.to_string(),
                platform: Some(Platform {
                    architecture: "amd64".to_string(),
                    os: "linux".to_string(),
                }),
            },
        ];
        assert_eq!(pick_leaf_entry(&entries).unwrap().digest, "sha256:amd");
    }

    #[test]
    fn test_pick_leaf_falls_back_to_first() {
        let entries = vec![ManifestEntry {
            digest: "sha256:only".to_string(),
            size: 1,
            media_type: MANIFEST_V2.to_string(),
            platform: None,
        }];
        assert_eq!(pick_leaf_entry(&entries).unwrap().digest, "sha256:only");
        assert!(pick_leaf_entry(&[]).is_err());
    }

    #[test]
    fn test_labels_match_subset() {
        let actual = HashMap::from([
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
        ]);
        assert!(labels_match(&HashMap::new(), &actual));
        assert!(labels_match(
            &HashMap::from([("a".to_string(), "1".to_string())]),
            &actual
        ));
        assert!(!labels_match(
            &HashMap::from([("a".to_string(), "other".to_string())]),
            &actual
        ));
        assert!(!labels_match(
            &HashMap::from([("missing".to_string(), "1".to_string())]),
            &actual
        ));
    }

    #[test]
    fn test_labels_from_config() {
        let config = br#"{"config":{"Labels":{"version":"3.11","build":"42"}}}"#;
        let labels = labels_from_config(config);
        assert_eq!(labels.get("version").map(String::as_str), Some("3.11"));
        assert_eq!(labels.len(), 2);
        assert!(labels_from_config(b"not json").is_empty());
        assert!(labels_from_config(b"{}").is_empty());
    }

    #[test]
    fn test_build_v2_manifest_shape() {
        let layers = vec![CopiedLayer {
            digest: "sha256:aaaa".to_string(),
            size: 123,
        }];
        let manifest = build_v2_manifest("sha256:cfg", 42, &layers).unwrap();
        assert_eq!(manifest.media_type(), MANIFEST_V2);
        let parsed_layers = manifest.layers().unwrap();
        assert_eq!(parsed_layers[0].digest, "sha256:aaaa");
        assert_eq!(parsed_layers[0].size, 123);
        let config = manifest.config().unwrap().unwrap();
        assert_eq!(config.digest, "sha256:cfg");
        assert_eq!(config.size, 42);
    }

    #[tokio::test]
    async fn test_push_local_to_export_tree() {
        let store_dir = TempDir::new().unwrap();
        let export_dir = TempDir::new().unwrap();
        let copier = test_copier(&store_dir);
        let (layer_digest, config_digest) =
            seed_local_image(&copier, "mirror/app", "1", b"layer-bytes", None);

        let exporter = Arc::new(FilesystemExporter::new(export_dir.path()).unwrap());
        let dest = Destination::Export(Arc::clone(&exporter));
        let digest = copier
            .push_local(&dest, "mirror/app", "1", "mirror/app", "1")
            .await
            .unwrap();

        assert!(exporter.has_blob("mirror/app", &layer_digest));
        assert!(exporter.has_blob("mirror/app", &config_digest));
        assert!(exporter.has_tag("mirror/app", "1"));
        let index = export_dir
            .path()
            .join("v2/mirror/app/manifests")
            .join(&digest)
            .join("index.json");
        let written = Manifest::parse(&std::fs::read(index).unwrap(), None).unwrap();
        assert_eq!(written.digest(), digest);
        assert_eq!(written.layers().unwrap()[0].digest, layer_digest);
        // The dedup index learned both blobs.
        assert!(copier.dedup.probe(&layer_digest).is_some());
        assert!(copier.dedup.probe(&config_digest).is_some());
    }

    #[tokio::test]
    async fn test_push_local_diff_layer_gets_computed_digest() {
        let store_dir = TempDir::new().unwrap();
        let export_dir = TempDir::new().unwrap();
        let copier = test_copier(&store_dir);
        seed_local_image(
            &copier,
            "mirror/app",
            "1",
            b"layer-bytes",
            Some(&[("opt/foo", b"payload")]),
        );

        let exporter = Arc::new(FilesystemExporter::new(export_dir.path()).unwrap());
        let dest = Destination::Export(Arc::clone(&exporter));
        let digest = copier
            .push_local(&dest, "mirror/app", "1", "mirror/app", "1-mod1")
            .await
            .unwrap();

        let index = export_dir
            .path()
            .join("v2/mirror/app/manifests")
            .join(&digest)
            .join("index.json");
        let manifest = Manifest::parse(&std::fs::read(index).unwrap(), None).unwrap();
        let layers = manifest.layers().unwrap();
        assert_eq!(layers.len(), 2);
        // The diff layer's digest was computed from the streamed bytes and
        // the blob was renamed to match it.
        assert!(crate::digest::is_sha256_digest(&layers[1].digest));
        assert!(layers[1].size > 0);
        assert!(exporter.has_blob("mirror/app", &layers[1].digest));
        // No blob was left behind under the provisional name.
        assert!(!exporter.has_blob("mirror/app", "pending:diff-layer-1"));
    }

    #[tokio::test]
    async fn test_cross_repo_export_uses_hard_link() {
        let store_dir = TempDir::new().unwrap();
        let export_dir = TempDir::new().unwrap();
        let copier = test_copier(&store_dir);
        let (layer_digest, _) = seed_local_image(&copier, "mirror/base", "1", b"shared", None);
        seed_local_image(&copier, "mirror/app", "1", b"shared", None);

        let exporter = Arc::new(FilesystemExporter::new(export_dir.path()).unwrap());
        let dest = Destination::Export(Arc::clone(&exporter));
        copier
            .push_local(&dest, "mirror/base", "1", "mirror/base", "1")
            .await
            .unwrap();
        copier
            .push_local(&dest, "mirror/app", "1", "mirror/app", "1")
            .await
            .unwrap();

        // Both repositories hold the blob; the second copy was a hard link
        // from the first, not a second upload.
        assert!(exporter.has_blob("mirror/base", &layer_digest));
        assert!(exporter.has_blob("mirror/app", &layer_digest));
        let entry = copier.dedup.probe(&layer_digest).unwrap();
        assert_eq!(entry.scope, DedupScope::Local);
    }

    #[tokio::test]
    async fn test_corrupt_local_blob_fails_with_digest_mismatch() {
        let store_dir = TempDir::new().unwrap();
        let export_dir = TempDir::new().unwrap();
        let copier = test_copier(&store_dir);
        seed_local_image(&copier, "mirror/app", "1", b"good-bytes", None);

        // Corrupt the stored layer after the record was written.
        let record = copier.store.read_image("mirror/app", "1").unwrap();
        let declared = match &record.layers[0] {
            LayerSource::Blob { digest } => digest.clone(),
            _ => unreachable!(),
        };
        std::fs::write(copier.store.blob_path(&declared), b"tampered").unwrap();

        let exporter = Arc::new(FilesystemExporter::new(export_dir.path()).unwrap());
        let dest = Destination::Export(Arc::clone(&exporter));
        let result = copier
            .push_local(&dest, "mirror/app", "1", "mirror/app", "1")
            .await;
        assert!(matches!(result, Err(FerryError::DigestMismatch { .. })));
        // No partial blob and no dedup entry remain for the bad digest.
        assert!(!exporter.has_blob("mirror/app", &declared));
        assert!(copier.dedup.probe(&declared).is_none());
    }

    #[tokio::test]
    async fn test_cancelled_copier_refuses_work() {
        let store_dir = TempDir::new().unwrap();
        let export_dir = TempDir::new().unwrap();
        let copier = cancelled_copier(&store_dir);
        seed_local_image(&copier, "mirror/app", "1", b"layer", None);
        let exporter = Arc::new(FilesystemExporter::new(export_dir.path()).unwrap());
        let dest = Destination::Export(exporter);
        let result = copier
            .push_local(&dest, "mirror/app", "1", "mirror/app", "1")
            .await;
        assert!(matches!(result, Err(FerryError::Cancelled)));
    }
}
