//! Manifest-driven plugin auto-mount.
//!
//! A manifest is a JSON list of plugin descriptors:
//!
//! ```json
//! { "plugins": [
//!     { "name": "library", "path": "plugins/library", "version": "1.2.0", "autoMount": true }
//! ] }
//! ```
//!
//! For every `autoMount` descriptor not yet mounted, a [`ModuleLoader`]
//! resolves the plugin module. A module must provide both a sequence and a
//! handler table; one missing either is skipped with a warning.
//!
//! [`FsModuleLoader`] reads sequence definitions from disk and takes handler
//! tables from an in-process catalog keyed by plugin name, since callbacks
//! cannot be loaded from JSON. Parsed manifests and modules are cached by
//! path until invalidated.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{ManifestError, MountError};
use crate::plugin::HandlerTable;
use crate::sequence::{Dynamics, Sequence};

/// Plugin id used for the built-in fallback sequence.
pub const FALLBACK_PLUGIN_ID: &str = "conductor-fallback";

/// Declarative plugin list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    #[serde(default)]
    pub plugins: Vec<PluginDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginDescriptor {
    /// Also the plugin id used when mounting.
    pub name: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub auto_mount: bool,
}

/// What a plugin module provides.
#[derive(Default)]
pub struct PluginModule {
    pub sequence: Option<Sequence>,
    pub handlers: Option<HandlerTable>,
}

/// Resolves manifests and plugin modules.
#[async_trait]
pub trait ModuleLoader: Send + Sync {
    async fn load_manifest(&self, path: &Path) -> Result<PluginManifest, ManifestError>;

    async fn load_module(&self, descriptor: &PluginDescriptor) -> Result<PluginModule, ManifestError>;
}

/// Builds a handler table for a loaded sequence.
pub type HandlerFactory = Arc<dyn Fn(&Sequence) -> HandlerTable + Send + Sync>;

/// Filesystem loader with an in-process handler catalog.
pub struct FsModuleLoader {
    root: PathBuf,
    catalog: HashMap<String, HandlerFactory>,
    default_factory: Option<HandlerFactory>,
    manifests: DashMap<PathBuf, Arc<PluginManifest>>,
    modules: DashMap<PathBuf, Arc<Option<Sequence>>>,
}

impl FsModuleLoader {
    /// Module paths in descriptors resolve against `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            catalog: HashMap::new(),
            default_factory: None,
            manifests: DashMap::new(),
            modules: DashMap::new(),
        }
    }

    /// Provide the handler table for the plugin named `name`.
    pub fn with_handlers<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&Sequence) -> HandlerTable + Send + Sync + 'static,
    {
        self.catalog.insert(name.into(), Arc::new(factory));
        self
    }

    /// Handler table for plugins without a catalog entry.
    pub fn with_default_handlers<F>(mut self, factory: F) -> Self
    where
        F: Fn(&Sequence) -> HandlerTable + Send + Sync + 'static,
    {
        self.default_factory = Some(Arc::new(factory));
        self
    }

    /// Candidate module files for a descriptor path, in probe order.
    pub fn candidates(&self, path: &str) -> Vec<PathBuf> {
        let base = self.root.join(path);
        vec![
            base.join("dist").join("sequence.json"),
            base.join("sequence.json"),
            self.root.join(format!("{path}.json")),
            base,
        ]
    }

    /// Drop cached entries for `path` (manifest or module file).
    pub fn invalidate(&self, path: &Path) {
        self.manifests.remove(path);
        self.modules.remove(path);
    }

    pub fn invalidate_all(&self) {
        self.manifests.clear();
        self.modules.clear();
    }

    pub fn cached_modules(&self) -> usize {
        self.modules.len()
    }

    async fn resolve(&self, descriptor: &PluginDescriptor) -> Result<PathBuf, ManifestError> {
        let tried = self.candidates(&descriptor.path);
        for candidate in &tried {
            let is_file = tokio::fs::metadata(candidate)
                .await
                .map(|m| m.is_file())
                .unwrap_or(false);
            if is_file {
                return Ok(candidate.clone());
            }
        }
        Err(ManifestError::ModuleNotFound {
            name: descriptor.name.clone(),
            tried,
        })
    }

    async fn read_json(path: &Path) -> Result<Value, ManifestError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ManifestError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        serde_json::from_str(&raw).map_err(|source| ManifestError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// A module file is either `{ "sequence": { .. } }` or a bare sequence.
fn module_sequence(path: &Path, value: Value) -> Result<Option<Sequence>, ManifestError> {
    let candidate = match value {
        Value::Object(mut map) => match map.remove("sequence") {
            Some(sequence) => sequence,
            None if map.contains_key("movements") => Value::Object(map),
            None => return Ok(None),
        },
        _ => return Ok(None),
    };
    serde_json::from_value(candidate)
        .map(Some)
        .map_err(|source| ManifestError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

#[async_trait]
impl ModuleLoader for FsModuleLoader {
    async fn load_manifest(&self, path: &Path) -> Result<PluginManifest, ManifestError> {
        if let Some(cached) = self.manifests.get(path) {
            return Ok(PluginManifest::clone(&cached));
        }

        let value = Self::read_json(path).await?;
        let manifest: PluginManifest =
            serde_json::from_value(value).map_err(|source| ManifestError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        debug!(path = %path.display(), plugins = manifest.plugins.len(), "manifest loaded");

        self.manifests
            .insert(path.to_path_buf(), Arc::new(manifest.clone()));
        Ok(manifest)
    }

    async fn load_module(&self, descriptor: &PluginDescriptor) -> Result<PluginModule, ManifestError> {
        let path = self.resolve(descriptor).await?;

        let cached = self.modules.get(&path).map(|entry| entry.value().clone());
        let sequence = match cached {
            Some(sequence) => sequence,
            None => {
                let value = Self::read_json(&path).await?;
                let sequence = Arc::new(module_sequence(&path, value)?);
                self.modules.insert(path.clone(), sequence.clone());
                debug!(plugin = %descriptor.name, path = %path.display(), "module loaded");
                sequence
            }
        };

        let sequence: Option<Sequence> = (*sequence).clone();
        let factory = self
            .catalog
            .get(&descriptor.name)
            .or(self.default_factory.as_ref());
        let handlers = match (&sequence, factory) {
            (Some(sequence), Some(factory)) => Some(factory(sequence)),
            _ => None,
        };

        Ok(PluginModule { sequence, handlers })
    }
}

/// Why a descriptor did not end up mounted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedPlugin {
    pub name: String,
    pub reason: String,
}

/// Outcome of `Conductor::mount_from_manifest`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManifestReport {
    pub mounted: Vec<String>,
    pub already_mounted: Vec<String>,
    /// Descriptors with `autoMount: false`.
    pub manual: Vec<String>,
    pub skipped: Vec<SkippedPlugin>,
    pub failed: Vec<(String, MountError)>,
    pub warnings: Vec<String>,
    /// The manifest could not be loaded and the fallback sequence was mounted.
    pub fallback_used: bool,
}

/// Minimal sequence mounted when no manifest could be loaded.
pub fn fallback_sequence() -> Sequence {
    Sequence::builder("conductor-fallback", "Conductor.fallback")
        .description("Placeholder mounted when the plugin manifest is unavailable")
        .version("1.0.0")
        .category("system")
        .movement("fallback", |m| m.beat(1, "fallback:ready", Dynamics::Piano))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::handler;
    use serde_json::json;

    fn write(path: &Path, value: Value) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, serde_json::to_string(&value).unwrap()).unwrap();
    }

    fn sequence_json(id: &str) -> Value {
        json!({
            "id": id,
            "name": "Library.load",
            "movements": [{ "name": "load", "beats": [
                { "beat": 1, "event": "library:fetch", "dynamics": "p" }
            ] }]
        })
    }

    fn descriptor(name: &str, path: &str) -> PluginDescriptor {
        PluginDescriptor {
            name: name.into(),
            path: path.into(),
            version: None,
            auto_mount: true,
        }
    }

    fn handlers(sequence: &Sequence) -> HandlerTable {
        sequence
            .event_names()
            .into_iter()
            .map(|event| (event.to_string(), handler(|_| Ok(()))))
            .collect()
    }

    #[tokio::test]
    async fn test_manifest_parses_camel_case_descriptors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        write(
            &path,
            json!({ "plugins": [
                { "name": "library", "path": "library", "version": "1.0.0", "autoMount": true },
                { "name": "manual", "path": "manual" }
            ] }),
        );

        let loader = FsModuleLoader::new(dir.path());
        let manifest = loader.load_manifest(&path).await.unwrap();

        assert_eq!(manifest.plugins.len(), 2);
        assert!(manifest.plugins[0].auto_mount);
        assert!(!manifest.plugins[1].auto_mount);
        assert_eq!(manifest.plugins[0].version.as_deref(), Some("1.0.0"));
    }

    #[tokio::test]
    async fn test_dist_artifact_wins_over_fallback_paths() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("library/dist/sequence.json"), sequence_json("from-dist"));
        write(&dir.path().join("library/sequence.json"), sequence_json("from-source"));

        let loader = FsModuleLoader::new(dir.path()).with_handlers("library", handlers);
        let module = loader.load_module(&descriptor("library", "library")).await.unwrap();

        assert_eq!(module.sequence.unwrap().id, "from-dist");
        assert_eq!(module.handlers.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_flat_json_fallback_and_wrapped_shape() {
        let dir = tempfile::tempdir().unwrap();
        write(
            &dir.path().join("canvas.json"),
            json!({ "sequence": sequence_json("canvas-seq"), "extra": true }),
        );

        let loader = FsModuleLoader::new(dir.path());
        let module = loader.load_module(&descriptor("canvas", "canvas")).await.unwrap();

        assert_eq!(module.sequence.unwrap().id, "canvas-seq");
        // No catalog entry and no default factory.
        assert!(module.handlers.is_none());
    }

    #[tokio::test]
    async fn test_missing_module_lists_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let loader = FsModuleLoader::new(dir.path());

        match loader.load_module(&descriptor("ghost", "ghost")).await {
            Err(ManifestError::ModuleNotFound { name, tried }) => {
                assert_eq!(name, "ghost");
                assert_eq!(tried.len(), 4);
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected ModuleNotFound"),
        }
    }

    #[tokio::test]
    async fn test_module_without_sequence_export() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("empty.json"), json!({ "handlers": ["x"] }));

        let loader = FsModuleLoader::new(dir.path()).with_default_handlers(handlers);
        let module = loader.load_module(&descriptor("empty", "empty")).await.unwrap();

        assert!(module.sequence.is_none());
        assert!(module.handlers.is_none());
    }

    #[tokio::test]
    async fn test_modules_are_cached_until_invalidated() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("library.json");
        write(&file, sequence_json("v1"));

        let loader = FsModuleLoader::new(dir.path());
        let desc = descriptor("library", "library");
        assert_eq!(loader.load_module(&desc).await.unwrap().sequence.unwrap().id, "v1");

        write(&file, sequence_json("v2"));
        assert_eq!(loader.load_module(&desc).await.unwrap().sequence.unwrap().id, "v1");
        assert_eq!(loader.cached_modules(), 1);

        loader.invalidate(&file);
        assert_eq!(loader.load_module(&desc).await.unwrap().sequence.unwrap().id, "v2");

        loader.invalidate_all();
        assert_eq!(loader.cached_modules(), 0);
    }

    #[test]
    fn test_fallback_sequence_is_valid() {
        assert!(fallback_sequence().validate().is_valid());
    }
}
