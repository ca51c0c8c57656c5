//! Local content-addressed image store.
//!
//! Layout under the store root:
//!
//! ```text
//! blobs/sha256/<hex>            compressed blobs deposited by pulls
//! layers/<layer-id>/diff/       layer contents produced by modifiers
//! images/<ns>/<name>/<tag>.json image records (manifest digest + layer list)
//! manifests/<hex>               raw manifest bytes by digest
//! ```
//!
//! Pulled layers are kept as their exact compressed bytes, so their digests
//! are stable. Modifier-produced layers exist only as `diff` directories;
//! [`LayerStore::open_layer_stream`] rebuilds them as a gzip-compressed tar
//! of unknown length, and the consumer computes the digest as bytes flow.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use ferry_core::error::{FerryError, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Stream chunk size for blob and layer reads.
const CHUNK_SIZE: usize = 64 * 1024;

/// Where a local image's layer bytes come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerSource {
    /// A stored compressed blob with a known digest.
    Blob { digest: String },
    /// A diff directory to be streamed as gzip tar; digest unknown until
    /// the stream is consumed.
    Diff { layer_id: String },
}

/// Persistent record of one locally stored image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalImage {
    pub repository: String,
    pub tag: String,
    pub manifest_digest: String,
    pub manifest_media_type: String,
    pub config_digest: String,
    pub layers: Vec<LayerSource>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// A bounded stream of compressed layer bytes.
pub struct LayerStream {
    rx: mpsc::Receiver<std::io::Result<Bytes>>,
}

impl LayerStream {
    /// Next chunk, or `None` at end of stream.
    pub async fn next_chunk(&mut self) -> Option<std::io::Result<Bytes>> {
        self.rx.recv().await
    }
}

/// `io::Write` adapter that pushes chunks into a bounded channel,
/// backpressuring the producer thread.
struct ChannelWriter {
    tx: mpsc::Sender<std::io::Result<Bytes>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.tx
            .blocking_send(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stream consumer dropped")
            })?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Handle for writing a blob atomically: bytes land in a temp file and are
/// renamed into place on commit, removed on abort.
pub struct BlobWriter {
    tmp_path: PathBuf,
    final_path: PathBuf,
    file: Option<File>,
}

impl BlobWriter {
    /// Append a chunk.
    pub fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        if let Some(ref mut file) = self.file {
            file.write_all(chunk)?;
        }
        Ok(())
    }

    /// Finalize: fsync and rename into place.
    pub fn commit(mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        std::fs::rename(&self.tmp_path, &self.final_path)?;
        Ok(())
    }

    /// Discard the partial blob.
    pub fn abort(mut self) {
        self.file.take();
        let _ = std::fs::remove_file(&self.tmp_path);
    }
}

/// Local content-addressed store for images, blobs, and layer diffs.
pub struct LayerStore {
    root: PathBuf,
}

impl LayerStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn new(root: &Path) -> Result<Self> {
        for sub in ["blobs/sha256", "layers", "images", "manifests"] {
            std::fs::create_dir_all(root.join(sub))?;
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem path of a stored compressed blob.
    pub fn blob_path(&self, digest: &str) -> PathBuf {
        let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
        self.root.join("blobs").join("sha256").join(hex)
    }

    pub fn has_blob(&self, digest: &str) -> bool {
        self.blob_path(digest).is_file()
    }

    /// Begin an atomic blob write. Each writer gets its own temp file, so
    /// concurrent writers for one digest cannot truncate each other's
    /// partial bytes; whoever commits last owns the final name.
    pub fn blob_writer(&self, digest: &str) -> Result<BlobWriter> {
        let final_path = self.blob_path(digest);
        let tmp_path = final_path.with_extension(format!("{:016x}.tmp", rand::random::<u64>()));
        let file = File::create(&tmp_path)?;
        Ok(BlobWriter {
            tmp_path,
            final_path,
            file: Some(file),
        })
    }

    /// Rename a blob whose digest turned out different than the name it was
    /// stored under (unverified local-origin layers).
    pub fn rename_blob(&self, from_digest: &str, to_digest: &str) -> Result<()> {
        std::fs::rename(self.blob_path(from_digest), self.blob_path(to_digest))?;
        Ok(())
    }

    /// Stream a stored compressed blob.
    pub fn open_blob_stream(&self, digest: &str) -> Result<LayerStream> {
        let path = self.blob_path(digest);
        if !path.is_file() {
            return Err(FerryError::NotFound(format!(
                "Blob {} not in local store",
                digest
            )));
        }
        let (tx, rx) = mpsc::channel(8);
        tokio::task::spawn_blocking(move || stream_file(path, tx));
        Ok(LayerStream { rx })
    }

    /// Diff directory of a modifier-produced layer.
    pub fn diff_dir(&self, layer_id: &str) -> PathBuf {
        self.root.join("layers").join(layer_id).join("diff")
    }

    /// Stream a layer reconstructed from its diff directory as a
    /// gzip-compressed tar. The length is unknown in advance.
    pub fn open_layer_stream(&self, layer_id: &str) -> Result<LayerStream> {
        let diff = self.diff_dir(layer_id);
        if !diff.is_dir() {
            return Err(FerryError::NotFound(format!(
                "Layer {} has no diff directory",
                layer_id
            )));
        }
        let (tx, rx) = mpsc::channel(8);
        tokio::task::spawn_blocking(move || {
            let writer = ChannelWriter { tx: tx.clone() };
            let encoder = GzEncoder::new(writer, Compression::default());
            let mut builder = tar::Builder::new(encoder);
            let result = builder
                .append_dir_all("", &diff)
                .and_then(|_| builder.into_inner())
                .and_then(|encoder| encoder.finish())
                .map(|_| ());
            if let Err(e) = result {
                let _ = tx.blocking_send(Err(e));
            }
        });
        Ok(LayerStream { rx })
    }

    // --- Image records ---

    fn image_record_path(&self, repository: &str, tag: &str) -> PathBuf {
        self.root
            .join("images")
            .join(repository)
            .join(format!("{}.json", tag))
    }

    fn manifest_path(&self, digest: &str) -> PathBuf {
        let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
        self.root.join("manifests").join(hex)
    }

    /// Store an image record plus its raw manifest bytes.
    pub fn write_image(&self, image: &LocalImage, manifest_bytes: &[u8]) -> Result<()> {
        std::fs::write(self.manifest_path(&image.manifest_digest), manifest_bytes)?;

        let record_path = self.image_record_path(&image.repository, &image.tag);
        if let Some(parent) = record_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = record_path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(image)?)?;
        std::fs::rename(&tmp, &record_path)?;

        tracing::debug!(
            repository = %image.repository,
            tag = %image.tag,
            digest = %image.manifest_digest,
            "Stored local image record"
        );
        Ok(())
    }

    /// Load an image record.
    pub fn read_image(&self, repository: &str, tag: &str) -> Result<LocalImage> {
        let path = self.image_record_path(repository, tag);
        let bytes = std::fs::read(&path).map_err(|_| {
            FerryError::NotFound(format!("Local image {}:{} not found", repository, tag))
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Raw manifest bytes of a stored image.
    pub fn read_manifest(&self, digest: &str) -> Result<Vec<u8>> {
        std::fs::read(self.manifest_path(digest))
            .map_err(|_| FerryError::NotFound(format!("Manifest {} not in local store", digest)))
    }

    /// Remove an image record. Blobs still referenced by other records are
    /// kept; the rest are unlinked.
    pub fn remove_image(&self, repository: &str, tag: &str) -> Result<()> {
        let image = self.read_image(repository, tag)?;
        std::fs::remove_file(self.image_record_path(repository, tag))?;

        let still_referenced = self.referenced_blobs()?;
        for layer in &image.layers {
            if let LayerSource::Blob { digest } = layer {
                if !still_referenced.contains(digest) {
                    let _ = std::fs::remove_file(self.blob_path(digest));
                }
            }
        }
        if !still_referenced.contains(&image.config_digest) {
            let _ = std::fs::remove_file(self.blob_path(&image.config_digest));
        }
        let _ = std::fs::remove_file(self.manifest_path(&image.manifest_digest));
        Ok(())
    }

    /// Every blob digest referenced by any remaining image record.
    fn referenced_blobs(&self) -> Result<std::collections::HashSet<String>> {
        let mut referenced = std::collections::HashSet::new();
        let images_root = self.root.join("images");
        for record in walk_json_records(&images_root)? {
            let bytes = std::fs::read(&record)?;
            let image: LocalImage = serde_json::from_slice(&bytes)?;
            referenced.insert(image.config_digest.clone());
            for layer in &image.layers {
                if let LayerSource::Blob { digest } = layer {
                    referenced.insert(digest.clone());
                }
            }
        }
        Ok(referenced)
    }
}

fn stream_file(path: PathBuf, tx: mpsc::Sender<std::io::Result<Bytes>>) {
    let mut file = match File::open(&path) {
        Ok(file) => file,
        Err(e) => {
            let _ = tx.blocking_send(Err(e));
            return;
        }
    };
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        match file.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => {
                if tx
                    .blocking_send(Ok(Bytes::copy_from_slice(&buf[..n])))
                    .is_err()
                {
                    return;
                }
            }
            Err(e) => {
                let _ = tx.blocking_send(Err(e));
                return;
            }
        }
    }
}

/// Recursively collect `*.json` image records.
fn walk_json_records(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut records = Vec::new();
    if !dir.is_dir() {
        return Ok(records);
    }
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current)? {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().and_then(|e| e.to_str()) == Some("json") {
                records.push(path);
            }
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::StreamingDigest;
    use flate2::read::GzDecoder;
    use tempfile::TempDir;

    const BLOB: &str = "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const CONFIG: &str = "sha256:cccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccc";

    fn test_image(repository: &str, tag: &str) -> LocalImage {
        LocalImage {
            repository: repository.to_string(),
            tag: tag.to_string(),
            manifest_digest: "sha256:1111111111111111111111111111111111111111111111111111111111111111".to_string(),
            manifest_media_type: crate::manifest::MANIFEST_V2.to_string(),
            config_digest: CONFIG.to_string(),
            layers: vec![LayerSource::Blob {
                digest: BLOB.to_string(),
            }],
            labels: HashMap::new(),
        }
    }

    #[test]
    fn test_blob_writer_commit() {
        let dir = TempDir::new().unwrap();
        let store = LayerStore::new(dir.path()).unwrap();
        let mut writer = store.blob_writer(BLOB).unwrap();
        writer.write_chunk(b"hello ").unwrap();
        writer.write_chunk(b"world").unwrap();
        writer.commit().unwrap();
        assert!(store.has_blob(BLOB));
        assert_eq!(std::fs::read(store.blob_path(BLOB)).unwrap(), b"hello world");
    }

    #[test]
    fn test_blob_writer_abort_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let store = LayerStore::new(dir.path()).unwrap();
        let mut writer = store.blob_writer(BLOB).unwrap();
        writer.write_chunk(b"partial").unwrap();
        writer.abort();
        assert!(!store.has_blob(BLOB));
    }

    #[test]
    fn test_concurrent_writers_keep_their_own_bytes() {
        let dir = TempDir::new().unwrap();
        let store = LayerStore::new(dir.path()).unwrap();

        // Two in-flight writers for the same digest: opening the second
        // must not truncate the first's partial bytes.
        let mut first = store.blob_writer(BLOB).unwrap();
        first.write_chunk(b"AAAA").unwrap();
        let mut second = store.blob_writer(BLOB).unwrap();
        second.write_chunk(b"BB").unwrap();

        first.commit().unwrap();
        assert_eq!(std::fs::read(store.blob_path(BLOB)).unwrap(), b"AAAA");

        // The later commit publishes its own complete bytes, never a blend.
        second.commit().unwrap();
        assert_eq!(std::fs::read(store.blob_path(BLOB)).unwrap(), b"BB");
    }

    #[test]
    fn test_rename_blob() {
        let dir = TempDir::new().unwrap();
        let store = LayerStore::new(dir.path()).unwrap();
        let mut writer = store.blob_writer("sha256:wrongname").unwrap();
        writer.write_chunk(b"data").unwrap();
        writer.commit().unwrap();
        store.rename_blob("sha256:wrongname", BLOB).unwrap();
        assert!(store.has_blob(BLOB));
        assert!(!store.has_blob("sha256:wrongname"));
    }

    #[tokio::test]
    async fn test_open_blob_stream() {
        let dir = TempDir::new().unwrap();
        let store = LayerStore::new(dir.path()).unwrap();
        let payload = vec![7u8; 200_000];
        let mut writer = store.blob_writer(BLOB).unwrap();
        writer.write_chunk(&payload).unwrap();
        writer.commit().unwrap();

        let mut stream = store.open_blob_stream(BLOB).unwrap();
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next_chunk().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, payload);
    }

    #[tokio::test]
    async fn test_open_layer_stream_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = LayerStore::new(dir.path()).unwrap();
        let diff = store.diff_dir("layer-1");
        std::fs::create_dir_all(diff.join("etc")).unwrap();
        std::fs::write(diff.join("etc").join("hosts"), b"127.0.0.1 localhost\n").unwrap();

        let mut stream = store.open_layer_stream("layer-1").unwrap();
        let mut compressed = Vec::new();
        let mut digest = StreamingDigest::new();
        while let Some(chunk) = stream.next_chunk().await {
            let chunk = chunk.unwrap();
            digest.update(&chunk);
            compressed.extend_from_slice(&chunk);
        }
        assert!(digest.bytes_seen() > 0);

        // The stream is a valid gzip tar containing the diff contents.
        let mut archive = tar::Archive::new(GzDecoder::new(&compressed[..]));
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().any(|n| n.contains("hosts")));
    }

    #[test]
    fn test_open_layer_stream_missing() {
        let dir = TempDir::new().unwrap();
        let store = LayerStore::new(dir.path()).unwrap();
        assert!(matches!(
            store.open_layer_stream("nope"),
            Err(FerryError::NotFound(_))
        ));
    }

    #[test]
    fn test_image_record_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = LayerStore::new(dir.path()).unwrap();
        let image = test_image("mirror/app", "1");
        store.write_image(&image, b"{\"schemaVersion\":2}").unwrap();

        let loaded = store.read_image("mirror/app", "1").unwrap();
        assert_eq!(loaded.manifest_digest, image.manifest_digest);
        assert_eq!(loaded.layers, image.layers);
        assert_eq!(
            store.read_manifest(&image.manifest_digest).unwrap(),
            b"{\"schemaVersion\":2}"
        );
    }

    #[test]
    fn test_remove_image_keeps_shared_blobs() {
        let dir = TempDir::new().unwrap();
        let store = LayerStore::new(dir.path()).unwrap();

        // Two images share the same layer blob.
        let mut writer = store.blob_writer(BLOB).unwrap();
        writer.write_chunk(b"layer").unwrap();
        writer.commit().unwrap();
        let mut writer = store.blob_writer(CONFIG).unwrap();
        writer.write_chunk(b"config").unwrap();
        writer.commit().unwrap();

        store.write_image(&test_image("mirror/app", "1"), b"{}").unwrap();
        store.write_image(&test_image("mirror/other", "2"), b"{}").unwrap();

        store.remove_image("mirror/app", "1").unwrap();
        // Shared blob and config survive because mirror/other still references them.
        assert!(store.has_blob(BLOB));
        assert!(store.has_blob(CONFIG));

        store.remove_image("mirror/other", "2").unwrap();
        assert!(!store.has_blob(BLOB));
        assert!(!store.has_blob(CONFIG));
    }

    #[test]
    fn test_read_missing_image() {
        let dir = TempDir::new().unwrap();
        let store = LayerStore::new(dir.path()).unwrap();
        assert!(matches!(
            store.read_image("mirror/app", "missing"),
            Err(FerryError::NotFound(_))
        ));
    }
}
