//! Manifest parsing, digesting and media-type normalization.
//!
//! Supports the six manifest flavors of the distribution ecosystem
//! (Docker v1, v1-signed, v2, v2-list, OCI manifest, OCI index). A parsed
//! [`Manifest`] keeps the exact byte sequence it was built from; the stored
//! digest is always the SHA-256 of those bytes. Normalization for push
//! rewrites OCI media types to their Docker equivalents and re-serializes
//! exactly once, so the advertised digest and the uploaded bytes agree.

use ferry_core::error::{FerryError, Result};
use serde_json::Value;

use crate::digest::sha256_digest;

/// `application/vnd.docker.distribution.manifest.v1+json`
pub const MANIFEST_V1: &str = "application/vnd.docker.distribution.manifest.v1+json";
/// `application/vnd.docker.distribution.manifest.v1+prettyjws`
pub const MANIFEST_V1_SIGNED: &str = "application/vnd.docker.distribution.manifest.v1+prettyjws";
/// `application/vnd.docker.distribution.manifest.v2+json`
pub const MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
/// `application/vnd.docker.distribution.manifest.list.v2+json`
pub const MANIFEST_LIST_V2: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
/// `application/vnd.oci.image.manifest.v1+json`
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
/// `application/vnd.oci.image.index.v1+json`
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
/// `application/vnd.docker.container.image.v1+json`
pub const CONFIG_V1: &str = "application/vnd.docker.container.image.v1+json";
/// `application/vnd.docker.image.rootfs.diff.tar`
pub const LAYER_TAR: &str = "application/vnd.docker.image.rootfs.diff.tar";
/// `application/vnd.docker.image.rootfs.diff.tar.gzip`
pub const LAYER_TAR_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// OCI layer/config media types, rewritten on push.
const OCI_LAYER_TAR: &str = "application/vnd.oci.image.layer.v1.tar";
const OCI_LAYER_TAR_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";

/// Accept header value covering every manifest flavor we can read.
pub const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v1+json, \
     application/vnd.docker.distribution.manifest.v1+prettyjws, \
     application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.oci.image.index.v1+json";

/// Manifest flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    V1,
    V1Signed,
    V2,
    V2List,
    OciManifest,
    OciIndex,
}

impl ManifestKind {
    /// The exact media-type string for this flavor.
    pub fn media_type(&self) -> &'static str {
        match self {
            ManifestKind::V1 => MANIFEST_V1,
            ManifestKind::V1Signed => MANIFEST_V1_SIGNED,
            ManifestKind::V2 => MANIFEST_V2,
            ManifestKind::V2List => MANIFEST_LIST_V2,
            ManifestKind::OciManifest => OCI_MANIFEST,
            ManifestKind::OciIndex => OCI_INDEX,
        }
    }

    /// Whether this flavor lists per-platform leaf manifests.
    pub fn is_list(&self) -> bool {
        matches!(self, ManifestKind::V2List | ManifestKind::OciIndex)
    }

    /// Map a media-type string to a flavor.
    pub fn from_media_type(media_type: &str) -> Option<Self> {
        match media_type {
            MANIFEST_V1 => Some(ManifestKind::V1),
            MANIFEST_V1_SIGNED => Some(ManifestKind::V1Signed),
            MANIFEST_V2 => Some(ManifestKind::V2),
            MANIFEST_LIST_V2 => Some(ManifestKind::V2List),
            OCI_MANIFEST => Some(ManifestKind::OciManifest),
            OCI_INDEX => Some(ManifestKind::OciIndex),
            _ => None,
        }
    }
}

/// A layer (or config) reference extracted from a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerRef {
    /// Canonical `sha256:<hex>` digest of the compressed blob.
    pub digest: String,
    /// Size in bytes; 0 when the manifest flavor does not record sizes (v1).
    pub size: u64,
    /// Declared media type.
    pub media_type: String,
}

/// Platform selector on a manifest-list entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
}

/// One leaf entry of a manifest list / OCI index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub digest: String,
    pub size: u64,
    pub media_type: String,
    pub platform: Option<Platform>,
}

/// A parsed manifest plus the exact bytes it was parsed from.
#[derive(Debug, Clone)]
pub struct Manifest {
    kind: ManifestKind,
    bytes: Vec<u8>,
    value: Value,
}

impl Manifest {
    /// Parse a manifest blob.
    ///
    /// `schemaVersion: 1` selects V1 (signed when a `signatures` field is
    /// present); otherwise the embedded `mediaType` field decides, falling
    /// back to the media type the transport declared. Anything else is a
    /// protocol error.
    pub fn parse(bytes: &[u8], declared_media_type: Option<&str>) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| FerryError::Protocol(format!("Manifest is not valid JSON: {}", e)))?;

        let kind = if value.get("schemaVersion").and_then(Value::as_u64) == Some(1) {
            if value.get("signatures").is_some() {
                ManifestKind::V1Signed
            } else {
                ManifestKind::V1
            }
        } else {
            let embedded = value.get("mediaType").and_then(Value::as_str);
            let media_type = embedded.or(declared_media_type).ok_or_else(|| {
                FerryError::Protocol("Manifest declares no media type".to_string())
            })?;
            ManifestKind::from_media_type(media_type).ok_or_else(|| {
                FerryError::Protocol(format!("Unknown manifest media type: {}", media_type))
            })?
        };

        Ok(Self {
            kind,
            bytes: bytes.to_vec(),
            value,
        })
    }

    pub fn kind(&self) -> ManifestKind {
        self.kind
    }

    /// Media type to send as Content-Type when writing these bytes.
    pub fn media_type(&self) -> &'static str {
        self.kind.media_type()
    }

    /// The exact bytes whose digest is advertised.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// SHA-256 of the exact stored bytes.
    pub fn digest(&self) -> String {
        sha256_digest(&self.bytes)
    }

    /// Ordered layer references of a leaf manifest.
    ///
    /// V1 manifests list `fsLayers` without sizes; those come back with
    /// `size: 0` and the gzip layer media type.
    pub fn layers(&self) -> Result<Vec<LayerRef>> {
        match self.kind {
            ManifestKind::V1 | ManifestKind::V1Signed => {
                let fs_layers = self.array("fsLayers")?;
                fs_layers
                    .iter()
                    .map(|entry| {
                        let digest = entry
                            .get("blobSum")
                            .and_then(Value::as_str)
                            .ok_or_else(|| {
                                FerryError::Protocol("fsLayers entry missing blobSum".to_string())
                            })?;
                        Ok(LayerRef {
                            digest: digest.to_string(),
                            size: 0,
                            media_type: LAYER_TAR_GZIP.to_string(),
                        })
                    })
                    .collect()
            }
            ManifestKind::V2 | ManifestKind::OciManifest => {
                let layers = self.array("layers")?;
                layers.iter().map(descriptor_to_layer).collect()
            }
            ManifestKind::V2List | ManifestKind::OciIndex => Err(FerryError::Protocol(
                "Manifest list has no layers; resolve its entries first".to_string(),
            )),
        }
    }

    /// Config blob reference for V2/OCI manifests; `None` for other flavors.
    pub fn config(&self) -> Result<Option<LayerRef>> {
        match self.kind {
            ManifestKind::V2 | ManifestKind::OciManifest => {
                let config = self.value.get("config").ok_or_else(|| {
                    FerryError::Protocol("Manifest missing config descriptor".to_string())
                })?;
                Ok(Some(descriptor_to_layer(config)?))
            }
            _ => Ok(None),
        }
    }

    /// Leaf entries of a manifest list / OCI index.
    pub fn entries(&self) -> Result<Vec<ManifestEntry>> {
        if !self.kind.is_list() {
            return Err(FerryError::Protocol(
                "Not a manifest list".to_string(),
            ));
        }
        let manifests = self.array("manifests")?;
        manifests
            .iter()
            .map(|entry| {
                let layer = descriptor_to_layer(entry)?;
                let platform = entry.get("platform").and_then(|p| {
                    Some(Platform {
                        architecture: p.get("architecture")?.as_str()?.to_string(),
                        os: p.get("os")?.as_str()?.to_string(),
                    })
                });
                Ok(ManifestEntry {
                    digest: layer.digest,
                    size: layer.size,
                    media_type: layer.media_type,
                    platform,
                })
            })
            .collect()
    }

    /// Rewrite for push: OCI flavors become their Docker equivalents.
    ///
    /// Docker-flavored manifests pass through byte-identical, preserving
    /// their digest. An OCI manifest/index is re-serialized exactly once
    /// with the media-type strings rewritten; the returned manifest's
    /// `bytes()` are the bytes to upload and to digest.
    pub fn normalized_for_push(&self) -> Result<Manifest> {
        match self.kind {
            ManifestKind::OciManifest => {
                let mut value = self.value.clone();
                value["mediaType"] = Value::String(MANIFEST_V2.to_string());
                if let Some(config) = value.get_mut("config") {
                    config["mediaType"] = Value::String(CONFIG_V1.to_string());
                }
                if let Some(layers) = value.get_mut("layers").and_then(Value::as_array_mut) {
                    for layer in layers {
                        if let Some(media_type) = layer.get("mediaType").and_then(Value::as_str) {
                            let rewritten = rewrite_layer_media_type(media_type);
                            layer["mediaType"] = Value::String(rewritten.to_string());
                        }
                    }
                }
                Self::from_value(ManifestKind::V2, value)
            }
            ManifestKind::OciIndex => {
                let mut value = self.value.clone();
                value["mediaType"] = Value::String(MANIFEST_LIST_V2.to_string());
                if let Some(manifests) = value.get_mut("manifests").and_then(Value::as_array_mut) {
                    for entry in manifests {
                        if entry.get("mediaType").and_then(Value::as_str) == Some(OCI_MANIFEST) {
                            entry["mediaType"] = Value::String(MANIFEST_V2.to_string());
                        } else if entry.get("mediaType").and_then(Value::as_str) == Some(OCI_INDEX)
                        {
                            entry["mediaType"] = Value::String(MANIFEST_LIST_V2.to_string());
                        }
                    }
                }
                Self::from_value(ManifestKind::V2List, value)
            }
            _ => Ok(self.clone()),
        }
    }

    /// Replace the config descriptor's size (and optionally digest) after
    /// writing the config blob, re-serializing once.
    ///
    /// The written config's length must equal the size recorded here.
    pub fn with_config(&self, digest: &str, size: u64) -> Result<Manifest> {
        if !matches!(self.kind, ManifestKind::V2 | ManifestKind::OciManifest) {
            return Err(FerryError::Protocol(
                "Only V2/OCI manifests carry a config descriptor".to_string(),
            ));
        }
        let mut value = self.value.clone();
        value["config"]["digest"] = Value::String(digest.to_string());
        value["config"]["size"] = Value::Number(size.into());
        Self::from_value(self.kind, value)
    }

    /// Rebuild a leaf-list entry digest map, used after leaf manifests were
    /// renormalized and their digests changed.
    pub fn with_rewritten_entries(&self, digest_map: &[(String, String)]) -> Result<Manifest> {
        if !self.kind.is_list() {
            return Err(FerryError::Protocol("Not a manifest list".to_string()));
        }
        let mut value = self.value.clone();
        if let Some(manifests) = value.get_mut("manifests").and_then(Value::as_array_mut) {
            for entry in manifests {
                if let Some(old) = entry.get("digest").and_then(Value::as_str) {
                    if let Some((_, new)) = digest_map.iter().find(|(from, _)| from == old) {
                        entry["digest"] = Value::String(new.clone());
                    }
                }
            }
        }
        Self::from_value(self.kind, value)
    }

    fn from_value(kind: ManifestKind, value: Value) -> Result<Manifest> {
        let bytes = serde_json::to_vec(&value)?;
        Ok(Manifest { kind, bytes, value })
    }

    fn array(&self, field: &str) -> Result<&Vec<Value>> {
        self.value
            .get(field)
            .and_then(Value::as_array)
            .ok_or_else(|| FerryError::Protocol(format!("Manifest missing {} array", field)))
    }
}

fn descriptor_to_layer(descriptor: &Value) -> Result<LayerRef> {
    let digest = descriptor
        .get("digest")
        .and_then(Value::as_str)
        .ok_or_else(|| FerryError::Protocol("Descriptor missing digest".to_string()))?;
    let size = descriptor.get("size").and_then(Value::as_u64).unwrap_or(0);
    let media_type = descriptor
        .get("mediaType")
        .and_then(Value::as_str)
        .unwrap_or(LAYER_TAR_GZIP);
    Ok(LayerRef {
        digest: digest.to_string(),
        size,
        media_type: media_type.to_string(),
    })
}

/// Map OCI layer media types to Docker layer media types.
fn rewrite_layer_media_type(media_type: &str) -> &str {
    match media_type {
        OCI_LAYER_TAR_GZIP => LAYER_TAR_GZIP,
        OCI_LAYER_TAR => LAYER_TAR,
        OCI_CONFIG => CONFIG_V1,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAYER_A: &str = "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const LAYER_B: &str = "sha256:bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
    const CONFIG_D: &str = "sha256:dddddddddddddddddddddddddddddddddddddddddddddddddddddddddddddddd";

    fn v2_manifest_bytes() -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MANIFEST_V2,
            "config": { "mediaType": CONFIG_V1, "digest": CONFIG_D, "size": 1469 },
            "layers": [
                { "mediaType": LAYER_TAR_GZIP, "digest": LAYER_A, "size": 100 },
                { "mediaType": LAYER_TAR_GZIP, "digest": LAYER_B, "size": 200 }
            ]
        }))
        .unwrap()
    }

    fn oci_manifest_bytes() -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": OCI_MANIFEST,
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": CONFIG_D,
                "size": 1469
            },
            "layers": [
                {
                    "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                    "digest": LAYER_A,
                    "size": 100
                }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_parse_v2() {
        let manifest = Manifest::parse(&v2_manifest_bytes(), None).unwrap();
        assert_eq!(manifest.kind(), ManifestKind::V2);
        assert_eq!(manifest.media_type(), MANIFEST_V2);
        let layers = manifest.layers().unwrap();
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[0].digest, LAYER_A);
        assert_eq!(layers[1].size, 200);
        let config = manifest.config().unwrap().unwrap();
        assert_eq!(config.digest, CONFIG_D);
    }

    #[test]
    fn test_parse_v1_by_schema_version() {
        let bytes = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 1,
            "name": "mirror/app",
            "tag": "1",
            "fsLayers": [ { "blobSum": LAYER_A }, { "blobSum": LAYER_B } ]
        }))
        .unwrap();
        let manifest = Manifest::parse(&bytes, None).unwrap();
        assert_eq!(manifest.kind(), ManifestKind::V1);
        let layers = manifest.layers().unwrap();
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[0].size, 0);
        assert!(manifest.config().unwrap().is_none());
    }

    #[test]
    fn test_parse_v1_signed() {
        let bytes = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 1,
            "fsLayers": [ { "blobSum": LAYER_A } ],
            "signatures": [ { "protected": "..." } ]
        }))
        .unwrap();
        let manifest = Manifest::parse(&bytes, None).unwrap();
        assert_eq!(manifest.kind(), ManifestKind::V1Signed);
        assert_eq!(manifest.media_type(), MANIFEST_V1_SIGNED);
    }

    #[test]
    fn test_parse_list_with_declared_type_only() {
        // No embedded mediaType; the transport's Content-Type decides.
        let bytes = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "manifests": [
                {
                    "mediaType": MANIFEST_V2,
                    "digest": LAYER_A,
                    "size": 428,
                    "platform": { "architecture": "amd64", "os": "linux" }
                },
                {
                    "mediaType": MANIFEST_V2,
                    "digest": LAYER_B,
                    "size": 428,
                    "platform": { "architecture": "arm64", "os": "linux" }
                }
            ]
        }))
        .unwrap();
        let manifest = Manifest::parse(&bytes, Some(MANIFEST_LIST_V2)).unwrap();
        assert_eq!(manifest.kind(), ManifestKind::V2List);
        let entries = manifest.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].platform.as_ref().unwrap().architecture, "amd64");
        assert_eq!(entries[1].platform.as_ref().unwrap().os, "linux");
    }

    #[test]
    fn test_parse_unknown_media_type() {
        let bytes = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.example.unknown+json"
        }))
        .unwrap();
        let result = Manifest::parse(&bytes, None);
        assert!(matches!(result, Err(FerryError::Protocol(_))));
    }

    #[test]
    fn test_parse_garbage() {
        assert!(matches!(
            Manifest::parse(b"not json", None),
            Err(FerryError::Protocol(_))
        ));
    }

    #[test]
    fn test_digest_is_sha256_of_bytes() {
        let bytes = v2_manifest_bytes();
        let manifest = Manifest::parse(&bytes, None).unwrap();
        assert_eq!(manifest.digest(), sha256_digest(&bytes));
        assert_eq!(manifest.bytes(), &bytes[..]);
    }

    #[test]
    fn test_docker_manifest_passes_through_unchanged() {
        let bytes = v2_manifest_bytes();
        let manifest = Manifest::parse(&bytes, None).unwrap();
        let normalized = manifest.normalized_for_push().unwrap();
        assert_eq!(normalized.bytes(), manifest.bytes());
        assert_eq!(normalized.digest(), manifest.digest());
    }

    #[test]
    fn test_oci_manifest_normalizes_to_v2() {
        let manifest = Manifest::parse(&oci_manifest_bytes(), None).unwrap();
        assert_eq!(manifest.kind(), ManifestKind::OciManifest);
        let normalized = manifest.normalized_for_push().unwrap();
        assert_eq!(normalized.kind(), ManifestKind::V2);
        assert_eq!(normalized.media_type(), MANIFEST_V2);
        let config = normalized.config().unwrap().unwrap();
        assert_eq!(config.media_type, CONFIG_V1);
        let layers = normalized.layers().unwrap();
        assert_eq!(layers[0].media_type, LAYER_TAR_GZIP);
        // Layer digests are untouched by normalization.
        assert_eq!(layers[0].digest, LAYER_A);
        // Digest is the SHA-256 of the renormalized bytes.
        assert_eq!(normalized.digest(), sha256_digest(normalized.bytes()));
        assert_ne!(normalized.digest(), manifest.digest());
    }

    #[test]
    fn test_oci_index_normalizes_to_v2_list() {
        let bytes = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": OCI_INDEX,
            "manifests": [
                {
                    "mediaType": OCI_MANIFEST,
                    "digest": LAYER_A,
                    "size": 428,
                    "platform": { "architecture": "amd64", "os": "linux" }
                }
            ]
        }))
        .unwrap();
        let manifest = Manifest::parse(&bytes, None).unwrap();
        let normalized = manifest.normalized_for_push().unwrap();
        assert_eq!(normalized.kind(), ManifestKind::V2List);
        let entries = normalized.entries().unwrap();
        assert_eq!(entries[0].media_type, MANIFEST_V2);
    }

    #[test]
    fn test_with_config_updates_size() {
        let manifest = Manifest::parse(&v2_manifest_bytes(), None).unwrap();
        let updated = manifest.with_config(CONFIG_D, 2048).unwrap();
        let config = updated.config().unwrap().unwrap();
        assert_eq!(config.size, 2048);
        assert_eq!(updated.digest(), sha256_digest(updated.bytes()));
    }

    #[test]
    fn test_with_rewritten_entries() {
        let bytes = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MANIFEST_LIST_V2,
            "manifests": [
                { "mediaType": MANIFEST_V2, "digest": LAYER_A, "size": 428 }
            ]
        }))
        .unwrap();
        let manifest = Manifest::parse(&bytes, None).unwrap();
        let rewritten = manifest
            .with_rewritten_entries(&[(LAYER_A.to_string(), LAYER_B.to_string())])
            .unwrap();
        assert_eq!(rewritten.entries().unwrap()[0].digest, LAYER_B);
    }

    #[test]
    fn test_layers_on_list_rejected() {
        let bytes = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MANIFEST_LIST_V2,
            "manifests": []
        }))
        .unwrap();
        let manifest = Manifest::parse(&bytes, None).unwrap();
        assert!(manifest.layers().is_err());
    }

    #[test]
    fn test_media_type_constants_exact() {
        // The wire strings are part of the protocol contract.
        assert_eq!(MANIFEST_V2, "application/vnd.docker.distribution.manifest.v2+json");
        assert_eq!(
            MANIFEST_LIST_V2,
            "application/vnd.docker.distribution.manifest.list.v2+json"
        );
        assert_eq!(OCI_MANIFEST, "application/vnd.oci.image.manifest.v1+json");
        assert_eq!(OCI_INDEX, "application/vnd.oci.image.index.v1+json");
        assert_eq!(CONFIG_V1, "application/vnd.docker.container.image.v1+json");
        assert_eq!(LAYER_TAR_GZIP, "application/vnd.docker.image.rootfs.diff.tar.gzip");
    }
}
