//! Static registry export: mirrors push-mode writes as filesystem
//! operations under an export root servable by a plain HTTP server.
//!
//! Layout per image:
//!
//! ```text
//! v2/<ns>/<name>/blobs/<digest>.gz
//! v2/<ns>/<name>/manifests/<digest>/index.json
//! v2/<ns>/<name>/manifests/<digest>/.htaccess
//! v2/<ns>/<name>/manifests/.htaccess
//! v2/<ns>/<name>/manifests/<tag>.type-map
//! v2/<ns>/<name>/tags/list
//! v2/_catalog
//! ```
//!
//! Tag resolution relies on Apache mod_negotiation: the per-directory
//! `.htaccess` registers the `.type-map` handler, and each tag's type-map
//! points at `<digest>/index.json` with the manifest's Content-Type.
//! Cross-repo dedup is a hard link between two images' `blobs/`
//! directories, so each image keeps an independent deletion lifecycle.

use std::collections::HashSet;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use ferry_core::error::{FerryError, Result};

use crate::manifest::Manifest;

/// `.htaccess` dropped once into every `manifests/` directory.
const TYPE_MAP_HANDLER: &str = "AddHandler type-map .type-map\n";

/// Atomic blob write into an export tree: temp file, rename on commit.
pub struct ExportBlobWriter {
    tmp_path: PathBuf,
    final_path: PathBuf,
    file: Option<File>,
}

impl ExportBlobWriter {
    pub fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        if let Some(ref mut file) = self.file {
            file.write_all(chunk)?;
        }
        Ok(())
    }

    pub fn commit(mut self) -> Result<PathBuf> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        std::fs::rename(&self.tmp_path, &self.final_path)?;
        Ok(self.final_path.clone())
    }

    pub fn abort(mut self) {
        self.file.take();
        let _ = std::fs::remove_file(&self.tmp_path);
    }
}

/// Writes registry content as a static filesystem tree.
pub struct FilesystemExporter {
    root: PathBuf,
}

impl FilesystemExporter {
    pub fn new(export_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(export_dir.join("v2"))?;
        Ok(Self {
            root: export_dir.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn image_dir(&self, repository: &str) -> PathBuf {
        self.root.join("v2").join(repository)
    }

    fn blobs_dir(&self, repository: &str) -> PathBuf {
        self.image_dir(repository).join("blobs")
    }

    fn manifests_dir(&self, repository: &str) -> PathBuf {
        self.image_dir(repository).join("manifests")
    }

    /// Path of a blob file. Layers carry a `.gz` suffix, configs do not.
    pub fn blob_path(&self, repository: &str, digest: &str, gzipped: bool) -> PathBuf {
        let name = if gzipped {
            format!("{}.gz", digest)
        } else {
            digest.to_string()
        };
        self.blobs_dir(repository).join(name)
    }

    /// Whether a tag is already exported for this image.
    pub fn has_tag(&self, repository: &str, tag: &str) -> bool {
        self.manifests_dir(repository)
            .join(format!("{}.type-map", tag))
            .is_file()
    }

    /// Whether the blob exists under this image, either form.
    pub fn has_blob(&self, repository: &str, digest: &str) -> bool {
        self.blob_path(repository, digest, true).is_file()
            || self.blob_path(repository, digest, false).is_file()
    }

    /// Resolve the stored path of an existing blob.
    pub fn find_blob(&self, repository: &str, digest: &str) -> Option<PathBuf> {
        let gz = self.blob_path(repository, digest, true);
        if gz.is_file() {
            return Some(gz);
        }
        let plain = self.blob_path(repository, digest, false);
        plain.is_file().then_some(plain)
    }

    /// Begin an atomic blob write.
    pub fn blob_writer(&self, repository: &str, digest: &str, gzipped: bool) -> Result<ExportBlobWriter> {
        let final_path = self.blob_path(repository, digest, gzipped);
        std::fs::create_dir_all(self.blobs_dir(repository))?;
        let tmp_path = final_path.with_extension("tmp");
        let file = File::create(&tmp_path)?;
        Ok(ExportBlobWriter {
            tmp_path,
            final_path,
            file: Some(file),
        })
    }

    /// A blob written under the wrong name (unverified local-origin layer):
    /// rename to the digest the bytes actually hash to.
    pub fn rename_blob(&self, repository: &str, from_digest: &str, to_digest: &str) -> Result<PathBuf> {
        let from = self.find_blob(repository, from_digest).ok_or_else(|| {
            FerryError::NotFound(format!("Blob {} not exported", from_digest))
        })?;
        let gzipped = from.extension().and_then(|e| e.to_str()) == Some("gz");
        let to = self.blob_path(repository, to_digest, gzipped);
        std::fs::rename(&from, &to)?;
        Ok(to)
    }

    /// Cross-repo mount: hard-link a blob already present elsewhere in the
    /// export tree into this image's `blobs/`.
    pub fn link_blob(&self, repository: &str, digest: &str, existing: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(self.blobs_dir(repository))?;
        let gzipped = existing.extension().and_then(|e| e.to_str()) == Some("gz");
        let target = self.blob_path(repository, digest, gzipped);
        if target.is_file() {
            return Ok(target);
        }
        std::fs::hard_link(existing, &target)?;
        tracing::debug!(repository, digest, "Hard-linked blob across repositories");
        Ok(target)
    }

    /// Write a manifest under its digest, and when `tag` is given, a
    /// type-map making the tag negotiable. Rebuilds `tags/list` and the
    /// catalog afterwards.
    pub fn write_manifest(
        &self,
        repository: &str,
        tag: Option<&str>,
        manifest: &Manifest,
    ) -> Result<String> {
        let digest = manifest.digest();
        let manifests_dir = self.manifests_dir(repository);
        let digest_dir = manifests_dir.join(&digest);
        std::fs::create_dir_all(&digest_dir)?;

        std::fs::write(digest_dir.join("index.json"), manifest.bytes())?;
        std::fs::write(
            digest_dir.join(".htaccess"),
            manifest_headers(manifest.media_type(), &digest),
        )?;
        std::fs::write(manifests_dir.join(".htaccess"), TYPE_MAP_HANDLER)?;

        if let Some(tag) = tag {
            std::fs::write(
                manifests_dir.join(format!("{}.type-map", tag)),
                type_map(tag, &digest, manifest.media_type()),
            )?;
        }

        self.rebuild_tag_list(repository)?;
        self.rebuild_catalog()?;

        tracing::info!(repository, ?tag, digest = %digest, "Exported manifest");
        Ok(digest)
    }

    /// Regenerate `tags/list` from the type-map files, migrating any legacy
    /// tag symlinks it encounters into type-maps.
    pub fn rebuild_tag_list(&self, repository: &str) -> Result<()> {
        let manifests_dir = self.manifests_dir(repository);
        let mut tags = Vec::new();
        if manifests_dir.is_dir() {
            for entry in std::fs::read_dir(&manifests_dir)? {
                let entry = entry?;
                let path = entry.path();
                let name = entry.file_name().to_string_lossy().into_owned();
                if let Some(tag) = name.strip_suffix(".type-map") {
                    tags.push(tag.to_string());
                } else if path.is_symlink() {
                    self.migrate_tag_symlink(repository, &name, &path)?;
                    tags.push(name);
                }
            }
        }
        tags.sort();
        tags.dedup();

        let tags_dir = self.image_dir(repository).join("tags");
        std::fs::create_dir_all(&tags_dir)?;
        let body = serde_json::json!({ "name": repository, "tags": tags });
        std::fs::write(tags_dir.join("list"), serde_json::to_vec(&body)?)?;
        Ok(())
    }

    /// Replace a legacy `manifests/<tag>` symlink with a type-map.
    fn migrate_tag_symlink(&self, repository: &str, tag: &str, link: &Path) -> Result<()> {
        let target = std::fs::read_link(link)?;
        let digest = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                FerryError::Protocol(format!("Unreadable tag symlink for {}", tag))
            })?;
        let index = self.manifests_dir(repository).join(&digest).join("index.json");
        let media_type = match std::fs::read(&index) {
            Ok(bytes) => Manifest::parse(&bytes, None)?.media_type().to_string(),
            Err(_) => crate::manifest::MANIFEST_V2.to_string(),
        };
        std::fs::write(
            self.manifests_dir(repository).join(format!("{}.type-map", tag)),
            type_map(tag, &digest, &media_type),
        )?;
        std::fs::remove_file(link)?;
        tracing::debug!(repository, tag, "Migrated legacy tag symlink to type-map");
        Ok(())
    }

    /// Regenerate `v2/_catalog` from the directory tree.
    pub fn rebuild_catalog(&self) -> Result<()> {
        let v2 = self.root.join("v2");
        let mut repositories = Vec::new();
        let mut stack = vec![v2.clone()];
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                if !path.is_dir() {
                    continue;
                }
                // A directory containing manifests/ is an image root; anything
                // else is a namespace level.
                if path.join("manifests").is_dir() {
                    if let Ok(relative) = path.strip_prefix(&v2) {
                        repositories.push(relative.to_string_lossy().into_owned());
                    }
                } else {
                    stack.push(path);
                }
            }
        }
        repositories.sort();
        let body = serde_json::json!({ "repositories": repositories });
        std::fs::write(v2.join("_catalog"), serde_json::to_vec(&body)?)?;
        Ok(())
    }

    /// Delete one tag of an image and garbage-collect everything it alone
    /// referenced: orphaned manifest directories, then orphaned blobs, then
    /// the image directory itself when nothing remains.
    pub fn delete_image(&self, repository: &str, tag: &str) -> Result<()> {
        let manifests_dir = self.manifests_dir(repository);
        let type_map_path = manifests_dir.join(format!("{}.type-map", tag));
        let symlink_path = manifests_dir.join(tag);

        let mut removed = false;
        if type_map_path.is_file() {
            std::fs::remove_file(&type_map_path)?;
            removed = true;
        }
        if symlink_path.is_symlink() {
            std::fs::remove_file(&symlink_path)?;
            removed = true;
        }
        if !removed {
            return Err(FerryError::NotFound(format!(
                "Tag {} not exported for {}",
                tag, repository
            )));
        }

        let referenced = self.referenced_manifest_digests(repository)?;
        if manifests_dir.is_dir() {
            for entry in std::fs::read_dir(&manifests_dir)? {
                let path = entry?.path();
                if path.is_dir() {
                    let name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    if !referenced.contains(&name) {
                        std::fs::remove_dir_all(&path)?;
                    }
                }
            }
        }

        let reffed_blobs = self.referenced_blob_digests(repository)?;
        let blobs_dir = self.blobs_dir(repository);
        if blobs_dir.is_dir() {
            for entry in std::fs::read_dir(&blobs_dir)? {
                let path = entry?.path();
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let digest = name.strip_suffix(".gz").unwrap_or(&name);
                if !reffed_blobs.contains(digest) {
                    std::fs::remove_file(&path)?;
                }
            }
        }

        if referenced.is_empty() {
            std::fs::remove_dir_all(self.image_dir(repository))?;
            tracing::info!(repository, "Removed image directory; no manifests remain");
        } else {
            self.rebuild_tag_list(repository)?;
        }
        self.rebuild_catalog()?;
        Ok(())
    }

    /// Manifest digests still reachable from the remaining type-maps,
    /// following manifest-list entries to their leaves.
    fn referenced_manifest_digests(&self, repository: &str) -> Result<HashSet<String>> {
        let manifests_dir = self.manifests_dir(repository);
        let mut referenced = HashSet::new();
        if !manifests_dir.is_dir() {
            return Ok(referenced);
        }
        let mut pending = Vec::new();
        for entry in std::fs::read_dir(&manifests_dir)? {
            let path = entry?.path();
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if name.ends_with(".type-map") {
                if let Some(digest) = type_map_digest(&std::fs::read_to_string(&path)?) {
                    pending.push(digest);
                }
            }
        }
        while let Some(digest) = pending.pop() {
            if !referenced.insert(digest.clone()) {
                continue;
            }
            let index = manifests_dir.join(&digest).join("index.json");
            if let Ok(bytes) = std::fs::read(&index) {
                let manifest = Manifest::parse(&bytes, None)?;
                if manifest.kind().is_list() {
                    for entry in manifest.entries()? {
                        pending.push(entry.digest);
                    }
                }
            }
        }
        Ok(referenced)
    }

    /// Blob digests referenced by the remaining manifests of one image,
    /// covering both `fsLayers` (v1) and `layers` + config (v2/OCI).
    fn referenced_blob_digests(&self, repository: &str) -> Result<HashSet<String>> {
        let manifests_dir = self.manifests_dir(repository);
        let mut referenced = HashSet::new();
        if !manifests_dir.is_dir() {
            return Ok(referenced);
        }
        for entry in std::fs::read_dir(&manifests_dir)? {
            let path = entry?.path();
            let index = path.join("index.json");
            if !index.is_file() {
                continue;
            }
            let manifest = Manifest::parse(&std::fs::read(&index)?, None)?;
            if manifest.kind().is_list() {
                continue;
            }
            for layer in manifest.layers()? {
                referenced.insert(layer.digest);
            }
            if let Some(config) = manifest.config()? {
                referenced.insert(config.digest);
            }
        }
        Ok(referenced)
    }
}

/// `.htaccess` contents for one manifest directory.
fn manifest_headers(media_type: &str, digest: &str) -> String {
    format!(
        "Header set Content-Type \"{}\"\n\
         Header set Docker-Content-Digest \"{}\"\n\
         Header set ETag \"{}\"\n",
        media_type, digest, digest
    )
}

/// Apache type-map resolving a tag URI to the digest's index.json.
fn type_map(tag: &str, digest: &str, media_type: &str) -> String {
    format!(
        "URI: {}\n\nURI: {}/index.json\nContent-Type: {}\n",
        tag, digest, media_type
    )
}

/// Digest a type-map points at.
fn type_map_digest(contents: &str) -> Option<String> {
    contents
        .lines()
        .filter_map(|line| line.strip_prefix("URI: "))
        .find_map(|uri| uri.strip_suffix("/index.json"))
        .map(|digest| digest.to_string())
}
