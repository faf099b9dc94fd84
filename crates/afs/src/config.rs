//! TOML configuration for composing a file system from local modules.
//!
//! ```toml
//! namespace = "afs"
//! metadata_path = ".afs/metadata.db"
//! wait = "fallback"
//!
//! [[mounts]]
//! path = "/modules/docs"
//! kind = "document"
//! root = "./docs"
//!
//! [[mounts]]
//! path = "/history"
//! kind = "history"
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::driver::{DriverRegistry, EngineOptions, InvocationContext};
use crate::entry::WaitStrategy;
use crate::error::{AfsError, Result};
use crate::metadata::MetadataStore;
use crate::modules::{DocumentModule, HistoryModule, MemoryModule};
use crate::path;
use crate::policy::{GuardedModule, ReadOnlyPolicy};
use crate::router::Afs;
use crate::slots::DEFAULT_NAMESPACE;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AfsConfig {
    /// Namespace of intent-addressed asset paths
    pub namespace: String,
    /// SQLite file shared by document modules; in-memory per module when unset
    pub metadata_path: Option<PathBuf>,
    /// Default wait strategy of view-qualified reads
    pub wait: WaitStrategy,
    /// Poll interval of strict readers, in milliseconds
    pub poll_interval_ms: u64,
    /// Bound on one generation, in milliseconds
    pub generation_timeout_ms: u64,
    /// Modules to mount
    pub mounts: Vec<MountConfig>,
}

impl Default for AfsConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            metadata_path: None,
            wait: WaitStrategy::Strict,
            poll_interval_ms: 50,
            generation_timeout_ms: 120_000,
            mounts: Vec::new(),
        }
    }
}

/// Kind of a configured module.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountKind {
    /// Directory-backed documents with views and slots
    #[default]
    Document,
    /// In-memory entry tree
    Memory,
    /// Append-only log
    History,
}

/// One mount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MountConfig {
    /// Mount path
    pub path: String,
    /// Module kind
    #[serde(default)]
    pub kind: MountKind,
    /// Backing directory (document modules)
    #[serde(default)]
    pub root: Option<PathBuf>,
    /// Module name; defaults to the last mount segment
    #[serde(default)]
    pub name: Option<String>,
    /// Reject mutations
    #[serde(default)]
    pub read_only: bool,
    /// Description shown in mount listings
    #[serde(default)]
    pub description: Option<String>,
}

impl MountConfig {
    /// Effective module name.
    pub fn module_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        match path::file_name(&self.path) {
            "" => "root".to_string(),
            last => last.to_string(),
        }
    }
}

impl AfsConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        toml::from_str(input).map_err(|err| AfsError::Serialization(err.to_string()))
    }

    /// Read and parse a TOML file.
    ///
    /// Relative `root` and `metadata_path` values are resolved against the
    /// file's directory.
    pub fn load(file: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(file)?;
        let mut config = Self::from_toml_str(&text)?;
        if let Some(base) = file.parent() {
            config.resolve_relative(base);
        }
        tracing::debug!(file = %file.display(), mounts = config.mounts.len(), "loaded config");
        Ok(config)
    }

    fn resolve_relative(&mut self, base: &Path) {
        let absolute = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        if let Some(p) = self.metadata_path.as_mut() {
            absolute(p);
        }
        for mount in &mut self.mounts {
            if let Some(p) = mount.root.as_mut() {
                absolute(p);
            }
        }
    }

    /// Poll interval as a duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Generation timeout as a duration.
    pub fn generation_timeout(&self) -> Duration {
        Duration::from_millis(self.generation_timeout_ms)
    }

    /// Projection engine options.
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            poll_interval: self.poll_interval(),
            generation_timeout: self.generation_timeout(),
            default_wait: self.wait,
        }
    }

    /// Open the configured metadata store.
    pub fn open_store(&self) -> Result<MetadataStore> {
        match &self.metadata_path {
            Some(file) => {
                if let Some(parent) = file.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                MetadataStore::open(file)
            }
            None => MetadataStore::open_in_memory(),
        }
    }

    /// Compose the configured modules.
    ///
    /// `context` becomes the default invocation context of document
    /// modules.
    pub fn build(&self, context: Option<InvocationContext>) -> Result<Arc<Afs>> {
        let shared = match self.metadata_path {
            Some(_) => Some(self.open_store()?),
            None => None,
        };

        let mut builder = Afs::builder();
        for mount in &self.mounts {
            let name = mount.module_name();
            builder = match mount.kind {
                MountKind::Document => {
                    let root = mount.root.clone().ok_or_else(|| {
                        AfsError::Validation(format!("document mount {} needs a root", mount.path))
                    })?;
                    let mut module = DocumentModule::builder(name, root)
                        .read_only(mount.read_only)
                        .namespace(self.namespace.clone())
                        .drivers(DriverRegistry::with_builtin())
                        .engine_options(self.engine_options());
                    if let Some(store) = &shared {
                        module = module.store(store.clone());
                    }
                    if let Some(context) = &context {
                        module = module.context(context.clone());
                    }
                    if let Some(description) = &mount.description {
                        module = module.description(description.clone());
                    }
                    builder.mount(&mount.path, module.build()?)
                }
                MountKind::Memory => {
                    let mut module = MemoryModule::new(name);
                    if mount.read_only {
                        module = module.read_only();
                    }
                    if let Some(description) = &mount.description {
                        module = module.with_description(description.clone());
                    }
                    builder.mount(&mount.path, module)
                }
                MountKind::History => {
                    let mut module = HistoryModule::new(name);
                    if let Some(description) = &mount.description {
                        module = module.with_description(description.clone());
                    }
                    if mount.read_only {
                        builder.mount(
                            &mount.path,
                            GuardedModule::new(Arc::new(module), Arc::new(ReadOnlyPolicy)),
                        )
                    } else {
                        builder.mount(&mount.path, module)
                    }
                }
            };
        }
        builder.build()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::module::AccessMode;

    #[test]
    fn test_defaults() {
        let config = AfsConfig::from_toml_str("").unwrap();
        assert_eq!(config, AfsConfig::default());
        assert_eq!(config.namespace, "afs");
        assert_eq!(config.engine_options(), EngineOptions::default());
    }

    #[test]
    fn test_parse_mounts() {
        let config = AfsConfig::from_toml_str(
            r#"
            wait = "fallback"
            poll_interval_ms = 10

            [[mounts]]
            path = "/modules/docs"
            root = "/srv/docs"
            read_only = true

            [[mounts]]
            path = "/history"
            kind = "history"
            name = "turns"
            "#,
        )
        .unwrap();
        assert_eq!(config.wait, WaitStrategy::Fallback);
        assert_eq!(config.poll_interval(), Duration::from_millis(10));
        assert_eq!(config.mounts[0].kind, MountKind::Document);
        assert_eq!(config.mounts[0].module_name(), "docs");
        assert_eq!(config.mounts[1].module_name(), "turns");
    }

    #[test]
    fn test_unknown_fields_rejected() {
        assert!(matches!(
            AfsConfig::from_toml_str("namespce = \"x\""),
            Err(AfsError::Serialization(_))
        ));
    }

    #[test]
    fn test_load_resolves_relative_paths() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("afs.toml");
        std::fs::write(
            &file,
            "metadata_path = \"meta/afs.db\"\n[[mounts]]\npath = \"/docs\"\nroot = \"docs\"\n",
        )
        .unwrap();
        let config = AfsConfig::load(&file).unwrap();
        assert_eq!(config.metadata_path, Some(dir.path().join("meta/afs.db")));
        assert_eq!(config.mounts[0].root, Some(dir.path().join("docs")));
    }

    #[tokio::test]
    async fn test_build_mounts_modules() {
        let dir = TempDir::new().unwrap();
        let config = AfsConfig {
            metadata_path: Some(dir.path().join("afs.db")),
            mounts: vec![
                MountConfig {
                    path: "/modules/docs".to_string(),
                    kind: MountKind::Document,
                    root: Some(dir.path().join("docs")),
                    name: None,
                    read_only: false,
                    description: None,
                },
                MountConfig {
                    path: "/scratch".to_string(),
                    kind: MountKind::Memory,
                    root: None,
                    name: None,
                    read_only: true,
                    description: Some("scratch space".to_string()),
                },
            ],
            ..AfsConfig::default()
        };
        let afs = config.build(None).unwrap();
        let mounts = afs.mounts();
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0].module, "docs");
        assert_eq!(mounts[1].access_mode, AccessMode::ReadOnly);
        assert!(dir.path().join("afs.db").exists());
    }

    #[test]
    fn test_document_mount_needs_root() {
        let config = AfsConfig {
            mounts: vec![MountConfig {
                path: "/docs".to_string(),
                kind: MountKind::Document,
                root: None,
                name: None,
                read_only: false,
                description: None,
            }],
            ..AfsConfig::default()
        };
        assert!(matches!(config.build(None), Err(AfsError::Validation(_))));
    }
}
