//! Configuration model for the mirroring engine.
//!
//! The engine receives an already-parsed [`MirrorConfig`]; the helpers here
//! only cover deserialization from YAML/JSON and docker-style credential
//! files. Credential *discovery* (keychains, helpers) is out of scope.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{FerryError, Result};

/// Username/password pair for one registry host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
}

/// How much local state a task removes once it finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cleanup {
    /// Remove both the pulled image and the modified image from the local
    /// store.
    Full,
    /// Remove only the pulled image.
    Partial,
    /// Keep everything.
    #[default]
    None,
}

/// One declarative prepare entry: a set of images to mirror plus how to
/// rewrite their names and whether to run a modifier over them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrepareEntry {
    /// Template substitution map applied to image names and tags
    /// (e.g. `namespace`, `name_prefix`, `name_suffix`, `tag`).
    #[serde(default)]
    pub substitutions: HashMap<String, String>,

    /// Regexes an image name must match to be included (empty = all).
    #[serde(default)]
    pub includes: Vec<String>,

    /// Regexes that exclude an image name even when included.
    #[serde(default)]
    pub excludes: Vec<String>,

    /// Image names this entry covers.
    #[serde(default)]
    pub images: Vec<String>,

    /// Push destination: a literal registry host, or unset to only prepare
    /// parameters. `discover_local` selects the configured local registry.
    #[serde(default)]
    pub push_destination: Option<String>,

    /// When true, resolve the push destination from `MirrorConfig::local_registry`.
    #[serde(default)]
    pub discover_local: bool,

    /// Pull-through source registry override.
    #[serde(default)]
    pub pull_source: Option<String>,

    /// Name of the modifier to run over matched images.
    #[serde(default)]
    pub modifier: Option<String>,

    /// Variable bag handed to the modifier.
    #[serde(default)]
    pub modifier_vars: HashMap<String, String>,

    /// Tag suffix appended to modified images (e.g. `-mod1`).
    #[serde(default)]
    pub modifier_append_tag: Option<String>,

    /// Only modify images that carry all of these labels.
    #[serde(default)]
    pub modify_only_with_labels: HashMap<String, String>,

    /// Only modify images pulled from this source.
    #[serde(default)]
    pub modify_only_with_source: Option<String>,

    /// Label name used to discover the tag to mirror.
    #[serde(default)]
    pub tag_from_label: Option<String>,

    /// Copy all platforms of a manifest list instead of a single leaf.
    #[serde(default)]
    pub multi_arch: bool,

    /// Local-store cleanup policy applied to the entry's tasks.
    #[serde(default)]
    pub cleanup: Cleanup,
}

/// Top-level configuration for a mirroring run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Pull-through cache mapping: registry host → URL prefix.
    #[serde(default)]
    pub mirrors: HashMap<String, String>,

    /// Hosts reachable only over plain HTTP.
    #[serde(default)]
    pub insecure_registries: HashSet<String>,

    /// HTTPS hosts whose certificates are not verified.
    #[serde(default)]
    pub no_verify_registries: HashSet<String>,

    /// Hosts that must always use verified HTTPS (never downgraded by probes).
    #[serde(default)]
    pub secure_registries: HashSet<String>,

    /// Hosts trusted to receive the Authorization header across redirects.
    #[serde(default)]
    pub trusted_hosts: HashSet<String>,

    /// Per-host credentials.
    #[serde(default)]
    pub credentials: HashMap<String, RegistryCredentials>,

    /// Local registry used when a prepare entry asks to discover one.
    #[serde(default)]
    pub local_registry: Option<String>,

    /// Root of the local content-addressed image store.
    #[serde(default)]
    pub local_store_root: Option<PathBuf>,

    /// Export directory; when set, export-mode writes land here.
    #[serde(default)]
    pub export_dir: Option<PathBuf>,

    /// Default for task-level `multi_arch`.
    #[serde(default)]
    pub multi_arch: bool,

    /// Worker count override; `None` selects the CPU-based default.
    #[serde(default)]
    pub workers: Option<usize>,

    /// Per-request HTTP timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Declarative image sets to expand into upload tasks.
    #[serde(default)]
    pub prepare: Vec<PrepareEntry>,
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            mirrors: HashMap::new(),
            insecure_registries: HashSet::new(),
            no_verify_registries: HashSet::new(),
            secure_registries: HashSet::new(),
            trusted_hosts: HashSet::new(),
            credentials: HashMap::new(),
            local_registry: None,
            local_store_root: None,
            export_dir: None,
            multi_arch: false,
            workers: None,
            timeout_secs: default_timeout_secs(),
            prepare: Vec::new(),
        }
    }
}

/// Docker-style credential file entry (`auths` map value).
#[derive(Debug, Deserialize)]
struct DockerAuthEntry {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    /// base64("user:pass"), takes precedence over the split fields.
    #[serde(default)]
    auth: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DockerConfigFile {
    #[serde(default)]
    auths: HashMap<String, DockerAuthEntry>,
}

impl MirrorConfig {
    /// Parse a configuration from YAML.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a configuration from JSON.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Merge credentials from a docker-style `config.json` auths map.
    ///
    /// Entries already present in `credentials` win over the file.
    pub fn merge_docker_auths(&mut self, text: &str) -> Result<()> {
        use base64::Engine;

        let file: DockerConfigFile = serde_json::from_str(text)?;
        for (host, entry) in file.auths {
            if self.credentials.contains_key(&host) {
                continue;
            }
            let credentials = if let Some(auth) = entry.auth {
                let decoded = base64::engine::general_purpose::STANDARD
                    .decode(auth.as_bytes())
                    .map_err(|e| {
                        FerryError::Config(format!("Invalid auth field for {}: {}", host, e))
                    })?;
                let decoded = String::from_utf8(decoded).map_err(|e| {
                    FerryError::Config(format!("Invalid auth field for {}: {}", host, e))
                })?;
                let (username, password) = decoded.split_once(':').ok_or_else(|| {
                    FerryError::Config(format!("Auth field for {} is not user:pass", host))
                })?;
                RegistryCredentials {
                    username: username.to_string(),
                    password: password.to_string(),
                }
            } else if let (Some(username), Some(password)) = (entry.username, entry.password) {
                RegistryCredentials { username, password }
            } else {
                continue;
            };
            self.credentials.insert(host, credentials);
        }
        Ok(())
    }

    /// Validate cross-field constraints; fatal at plan time.
    pub fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 {
            return Err(FerryError::Config(
                "timeout_secs must be greater than 0".to_string(),
            ));
        }
        if let Some(workers) = self.workers {
            if workers == 0 {
                return Err(FerryError::Config(
                    "workers must be greater than 0".to_string(),
                ));
            }
        }
        for entry in &self.prepare {
            if entry.discover_local && self.local_registry.is_none() {
                return Err(FerryError::Config(
                    "prepare entry discovers a local registry but local_registry is unset"
                        .to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Look up credentials for a host.
    pub fn credentials_for(&self, host: &str) -> Option<&RegistryCredentials> {
        self.credentials.get(host)
    }
}
