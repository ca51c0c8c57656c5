//! Image modification seam.
//!
//! A modifier rewrites an image that has been pulled into the local store,
//! in place: it may add layers (as diff directories), change labels, or
//! adjust the config. Ferry then pushes the modified image back under the
//! appended tag. Modifiers are external to the engine and plug in through
//! [`ImageModifier`]; the [`ImageBuilder`] collaborator is how they
//! materialize new layers into the store.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use ferry_core::error::{FerryError, Result};

use crate::manifest::Manifest;
use crate::reference::ImageReference;
use crate::store::{LayerSource, LayerStore};

/// Everything a modifier invocation receives.
#[derive(Debug, Clone)]
pub struct ModifyRequest {
    /// Modifier name as configured on the task.
    pub name: String,
    /// Local-store image to read; identical to `destination` (in-place).
    pub source: ImageReference,
    /// Local-store image to write.
    pub destination: ImageReference,
    /// Tag suffix the modified image will be pushed under.
    pub append_tag: String,
    /// Free-form parameters from the task.
    pub vars: HashMap<String, String>,
}

/// A pluggable image modifier.
#[async_trait]
pub trait ImageModifier: Send + Sync {
    /// Rewrite the image named by the request in the local store. Any error
    /// fails the owning task; prior uploads are not rolled back.
    async fn modify(&self, builder: &dyn ImageBuilder, request: &ModifyRequest) -> Result<()>;
}

/// Store-side operations a modifier composes its changes from.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Import a diff directory as a new layer of a local image, returning
    /// the generated layer id.
    async fn append_layer(&self, image: &ImageReference, diff_dir: &Path) -> Result<String>;

    /// Replace the config blob of a local image.
    async fn replace_config(&self, image: &ImageReference, config: Vec<u8>) -> Result<()>;
}

/// [`ImageBuilder`] backed by the local [`LayerStore`].
pub struct StoreImageBuilder {
    store: Arc<LayerStore>,
}

impl StoreImageBuilder {
    pub fn new(store: Arc<LayerStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ImageBuilder for StoreImageBuilder {
    async fn append_layer(&self, image: &ImageReference, diff_dir: &Path) -> Result<String> {
        let layer_id = format!("{:032x}", rand::random::<u128>());
        let target = self.store.diff_dir(&layer_id);
        copy_dir(diff_dir, &target)?;

        let mut record = self
            .store
            .read_image(&image.repository, image.tag_or_default())?;
        record.layers.push(LayerSource::Diff {
            layer_id: layer_id.clone(),
        });
        let manifest = self.store.read_manifest(&record.manifest_digest)?;
        self.store.write_image(&record, &manifest)?;

        tracing::debug!(
            image = %image,
            layer_id = %layer_id,
            "Appended modifier layer"
        );
        Ok(layer_id)
    }

    async fn replace_config(&self, image: &ImageReference, config: Vec<u8>) -> Result<()> {
        let mut record = self
            .store
            .read_image(&image.repository, image.tag_or_default())?;
        let digest = crate::digest::sha256_digest(&config);
        let size = config.len() as u64;
        let mut writer = self.store.blob_writer(&digest)?;
        writer.write_chunk(&config)?;
        writer.commit()?;

        // Rewrite the stored manifest's config descriptor; the record's
        // manifest digest follows the rewritten bytes.
        let old_bytes = self.store.read_manifest(&record.manifest_digest)?;
        let manifest = Manifest::parse(&old_bytes, Some(&record.manifest_media_type))?
            .with_config(&digest, size)?;
        record.config_digest = digest;
        record.manifest_digest = manifest.digest();
        record.manifest_media_type = manifest.media_type().to_string();
        self.store.write_image(&record, manifest.bytes())?;
        Ok(())
    }
}

/// Named modifier lookup, populated by the embedding application.
#[derive(Default, Clone)]
pub struct ModifierRegistry {
    modifiers: HashMap<String, Arc<dyn ImageModifier>>,
}

impl ModifierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, modifier: Arc<dyn ImageModifier>) {
        self.modifiers.insert(name.to_string(), modifier);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn ImageModifier>> {
        self.modifiers.get(name).cloned().ok_or_else(|| {
            FerryError::ModifierFailed(format!("No modifier registered under '{}'", name))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.modifiers.is_empty()
    }
}

/// Recursive copy preserving the directory shape; modifiers hand over
/// regular files and directories only.
fn copy_dir(from: &Path, to: &Path) -> Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let source = entry.path();
        let target = to.join(entry.file_name());
        if source.is_dir() {
            copy_dir(&source, &target)?;
        } else {
            std::fs::copy(&source, &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::MANIFEST_V2;
    use crate::store::LocalImage;
    use tempfile::TempDir;

    struct NoopModifier;

    #[async_trait]
    impl ImageModifier for NoopModifier {
        async fn modify(&self, _: &dyn ImageBuilder, _: &ModifyRequest) -> Result<()> {
            Ok(())
        }
    }

    fn seeded_store(dir: &TempDir) -> Arc<LayerStore> {
        let store = Arc::new(LayerStore::new(dir.path()).unwrap());
        let config_digest =
            "sha256:2222222222222222222222222222222222222222222222222222222222222222";
        let manifest_bytes = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MANIFEST_V2,
            "config": {
                "mediaType": "application/vnd.docker.container.image.v1+json",
                "size": 2,
                "digest": config_digest,
            },
            "layers": [],
        }))
        .unwrap();
        let image = LocalImage {
            repository: "mirror/app".to_string(),
            tag: "1".to_string(),
            manifest_digest: crate::digest::sha256_digest(&manifest_bytes),
            manifest_media_type: MANIFEST_V2.to_string(),
            config_digest: config_digest.to_string(),
            layers: Vec::new(),
            labels: HashMap::new(),
        };
        store.write_image(&image, &manifest_bytes).unwrap();
        store
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = ModifierRegistry::new();
        assert!(registry.is_empty());
        registry.register("add-foo", Arc::new(NoopModifier));
        assert!(registry.get("add-foo").is_ok());
        assert!(matches!(
            registry.get("missing"),
            Err(FerryError::ModifierFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_append_layer_records_diff() {
        let dir = TempDir::new().unwrap();
        let store = seeded_store(&dir);
        let builder = StoreImageBuilder::new(Arc::clone(&store));

        let src = TempDir::new().unwrap();
        std::fs::create_dir_all(src.path().join("opt/plugin")).unwrap();
        std::fs::write(src.path().join("opt/plugin/foo"), b"v1.0.1").unwrap();

        let image = ImageReference::local("mirror/app", "1");
        let layer_id = builder.append_layer(&image, src.path()).await.unwrap();

        let record = store.read_image("mirror/app", "1").unwrap();
        assert_eq!(
            record.layers,
            vec![LayerSource::Diff {
                layer_id: layer_id.clone()
            }]
        );
        assert!(store
            .diff_dir(&layer_id)
            .join("opt/plugin/foo")
            .is_file());
    }

    #[tokio::test]
    async fn test_replace_config_updates_digest() {
        let dir = TempDir::new().unwrap();
        let store = seeded_store(&dir);
        let builder = StoreImageBuilder::new(Arc::clone(&store));
        let image = ImageReference::local("mirror/app", "1");

        let old_manifest_digest = store
            .read_image("mirror/app", "1")
            .unwrap()
            .manifest_digest;

        let config = br#"{"architecture":"amd64"}"#.to_vec();
        let config_len = config.len() as u64;
        let expected = crate::digest::sha256_digest(&config);
        builder.replace_config(&image, config).await.unwrap();

        let record = store.read_image("mirror/app", "1").unwrap();
        assert_eq!(record.config_digest, expected);
        assert!(store.has_blob(&expected));

        // The stored manifest was rewritten to point at the new config.
        assert_ne!(record.manifest_digest, old_manifest_digest);
        let manifest_bytes = store.read_manifest(&record.manifest_digest).unwrap();
        let manifest = Manifest::parse(&manifest_bytes, None).unwrap();
        let descriptor = manifest.config().unwrap().unwrap();
        assert_eq!(descriptor.digest, expected);
        assert_eq!(descriptor.size, config_len);
        assert_eq!(manifest.digest(), record.manifest_digest);
    }
}
