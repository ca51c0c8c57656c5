//! Image reference parsing.
//!
//! Ferry addresses images through two textual forms:
//!
//! - `registry://host/ns/name[:tag|@digest]` — an image in a remote registry
//! - `local:ns/name:tag` — an image in the local content-addressed store
//!
//! A reference carries at most one of tag and digest.

use ferry_core::error::{FerryError, Result};

/// Default tag when none is specified.
const DEFAULT_TAG: &str = "latest";

/// Where a reference points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefScheme {
    /// A remote registry reachable over the distribution HTTP API.
    Registry,
    /// The local content-addressed store.
    Local,
}

/// Parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    /// Registry or local store.
    pub scheme: RefScheme,
    /// Registry hostname with optional port; empty for local references.
    pub host: String,
    /// Repository path (e.g. `mirror/base/python`).
    pub repository: String,
    /// Tag (e.g. `latest`, `3.11`).
    pub tag: Option<String>,
    /// Digest (e.g. `sha256:abc...`).
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse an image reference string in either textual form.
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(FerryError::Config("Empty image reference".to_string()));
        }

        if let Some(rest) = reference.strip_prefix("registry://") {
            Self::parse_registry(rest)
        } else if let Some(rest) = reference.strip_prefix("local:") {
            Self::parse_local(rest)
        } else {
            Err(FerryError::Config(format!(
                "Image reference '{}' must start with registry:// or local:",
                reference
            )))
        }
    }

    /// Build a registry reference from parts, tagged.
    pub fn registry(host: &str, repository: &str, tag: &str) -> Self {
        Self {
            scheme: RefScheme::Registry,
            host: host.to_string(),
            repository: repository.to_string(),
            tag: Some(tag.to_string()),
            digest: None,
        }
    }

    /// Build a local-store reference from parts, tagged.
    pub fn local(repository: &str, tag: &str) -> Self {
        Self {
            scheme: RefScheme::Local,
            host: String::new(),
            repository: repository.to_string(),
            tag: Some(tag.to_string()),
            digest: None,
        }
    }

    fn parse_registry(rest: &str) -> Result<Self> {
        let slash_pos = rest.find('/').ok_or_else(|| {
            FerryError::Config(format!("Registry reference '{}' has no repository", rest))
        })?;
        let host = &rest[..slash_pos];
        if host.is_empty() {
            return Err(FerryError::Config(format!(
                "Registry reference '{}' has an empty host",
                rest
            )));
        }
        let (repository, tag, digest) = split_repo_tag_digest(&rest[slash_pos + 1..])?;
        Ok(Self {
            scheme: RefScheme::Registry,
            host: host.to_string(),
            repository,
            tag,
            digest,
        })
    }

    fn parse_local(rest: &str) -> Result<Self> {
        let (repository, tag, digest) = split_repo_tag_digest(rest)?;
        if digest.is_some() {
            return Err(FerryError::Config(format!(
                "Local reference '{}' cannot carry a digest",
                rest
            )));
        }
        Ok(Self {
            scheme: RefScheme::Local,
            host: String::new(),
            repository,
            tag,
            digest: None,
        })
    }

    /// Replace the tag, clearing any digest.
    pub fn with_tag(&self, tag: &str) -> Self {
        Self {
            tag: Some(tag.to_string()),
            digest: None,
            ..self.clone()
        }
    }

    /// Replace the repository, keeping tag/digest.
    pub fn with_repository(&self, repository: &str) -> Self {
        Self {
            repository: repository.to_string(),
            ..self.clone()
        }
    }

    /// The `<reference>` component used in manifest URLs: digest when
    /// present, else tag, else `latest`.
    pub fn manifest_reference(&self) -> &str {
        if let Some(ref digest) = self.digest {
            digest
        } else {
            self.tag.as_deref().unwrap_or(DEFAULT_TAG)
        }
    }

    /// Tag, or the default when neither tag nor digest is set.
    pub fn tag_or_default(&self) -> &str {
        self.tag.as_deref().unwrap_or(DEFAULT_TAG)
    }

    /// Full textual form.
    pub fn full_reference(&self) -> String {
        let mut s = match self.scheme {
            RefScheme::Registry => format!("registry://{}/{}", self.host, self.repository),
            RefScheme::Local => format!("local:{}", self.repository),
        };
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }
}

/// Split `ns/name[:tag][@digest]`, rejecting both tag and digest at once.
fn split_repo_tag_digest(s: &str) -> Result<(String, Option<String>, Option<String>)> {
    let (name_tag, digest) = if let Some(at_pos) = s.rfind('@') {
        let digest_part = &s[at_pos + 1..];
        if !digest_part.contains(':') {
            return Err(FerryError::Config(format!(
                "Invalid digest in reference '{}': expected algorithm:hex",
                s
            )));
        }
        (&s[..at_pos], Some(digest_part.to_string()))
    } else {
        (s, None)
    };

    // Tag is after the last colon, but a colon before the last slash
    // belongs to a port and never appears here (hosts are split earlier).
    let (repository, tag) = match name_tag.rfind(':') {
        Some(colon_pos) if colon_pos > name_tag.rfind('/').unwrap_or(0) => (
            name_tag[..colon_pos].to_string(),
            Some(name_tag[colon_pos + 1..].to_string()),
        ),
        _ => (name_tag.to_string(), None),
    };

    if repository.is_empty() {
        return Err(FerryError::Config(format!(
            "Empty repository in reference '{}'",
            s
        )));
    }
    if tag.is_some() && digest.is_some() {
        return Err(FerryError::Config(format!(
            "Reference '{}' carries both a tag and a digest",
            s
        )));
    }

    Ok((repository, tag, digest))
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_registry_with_tag() {
        let r = ImageReference::parse("registry://registry.example/base/python:3.11").unwrap();
        assert_eq!(r.scheme, RefScheme::Registry);
        assert_eq!(r.host, "registry.example");
        assert_eq!(r.repository, "base/python");
        assert_eq!(r.tag, Some("3.11".to_string()));
        assert_eq!(r.digest, None);
    }

    #[test]
    fn test_parse_registry_with_digest() {
        let r = ImageReference::parse(
            "registry://registry.example/app@sha256:abcdef1234567890abcdef1234567890abcdef1234567890abcdef1234567890",
        )
        .unwrap();
        assert_eq!(r.tag, None);
        assert!(r.digest.unwrap().starts_with("sha256:"));
    }

    #[test]
    fn test_parse_registry_with_port() {
        let r = ImageReference::parse("registry://local-reg:8787/mirror/app:1").unwrap();
        assert_eq!(r.host, "local-reg:8787");
        assert_eq!(r.repository, "mirror/app");
        assert_eq!(r.tag, Some("1".to_string()));
    }

    #[test]
    fn test_parse_registry_no_tag() {
        let r = ImageReference::parse("registry://registry.example/app").unwrap();
        assert_eq!(r.tag, None);
        assert_eq!(r.manifest_reference(), "latest");
    }

    #[test]
    fn test_parse_local() {
        let r = ImageReference::parse("local:mirror/app:1").unwrap();
        assert_eq!(r.scheme, RefScheme::Local);
        assert_eq!(r.host, "");
        assert_eq!(r.repository, "mirror/app");
        assert_eq!(r.tag, Some("1".to_string()));
    }

    #[test]
    fn test_parse_local_digest_rejected() {
        assert!(ImageReference::parse("local:mirror/app@sha256:abc123").is_err());
    }

    #[test]
    fn test_parse_tag_and_digest_rejected() {
        assert!(ImageReference::parse(
            "registry://registry.example/app:1@sha256:abcdef"
        )
        .is_err());
    }

    #[test]
    fn test_parse_empty() {
        assert!(ImageReference::parse("").is_err());
        assert!(ImageReference::parse("   ").is_err());
    }

    #[test]
    fn test_parse_unknown_scheme() {
        assert!(ImageReference::parse("docker://registry.example/app").is_err());
    }

    #[test]
    fn test_parse_missing_repository() {
        assert!(ImageReference::parse("registry://registry.example").is_err());
        assert!(ImageReference::parse("registry:///app").is_err());
    }

    #[test]
    fn test_manifest_reference_prefers_digest() {
        let r = ImageReference {
            scheme: RefScheme::Registry,
            host: "registry.example".to_string(),
            repository: "app".to_string(),
            tag: None,
            digest: Some("sha256:abc".to_string()),
        };
        assert_eq!(r.manifest_reference(), "sha256:abc");
    }

    #[test]
    fn test_full_reference_roundtrip() {
        for text in [
            "registry://registry.example/base/python:3.11",
            "registry://local-reg:8787/mirror/app:1",
            "local:mirror/app:1",
        ] {
            let r = ImageReference::parse(text).unwrap();
            assert_eq!(r.full_reference(), text);
            assert_eq!(ImageReference::parse(&r.full_reference()).unwrap(), r);
        }
    }

    #[test]
    fn test_with_tag_clears_digest() {
        let r = ImageReference::parse(
            "registry://registry.example/app@sha256:abcdef1234567890abcdef1234567890abcdef1234567890abcdef1234567890",
        )
        .unwrap();
        let tagged = r.with_tag("1-mod1");
        assert_eq!(tagged.tag, Some("1-mod1".to_string()));
        assert_eq!(tagged.digest, None);
    }

    #[test]
    fn test_display() {
        let r = ImageReference::registry("registry.example", "app", "1");
        assert_eq!(format!("{}", r), "registry://registry.example/app:1");
    }
}
