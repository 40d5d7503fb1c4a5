//! Agent templates and installed plugin archives.
//!
//! Templates live under `<templates_root>/<id>/template.yaml` and describe how
//! to launch a bundled agent. Installed plugins live under
//! `<plugins_root>/<name>/plugin.yaml`; installing and removing archives is
//! the job of an external installer, so the filesystem registry here only
//! answers metadata queries.

use crate::config::AgentConfig;
use crate::error::{DroverError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const TEMPLATE_MANIFEST: &str = "template.yaml";
pub const PLUGIN_MANIFEST: &str = "plugin.yaml";

/// Contents of a `template.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateManifest {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Entry point relative to the template directory.
    pub executable: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval_s: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_flush_interval_s: Option<f64>,

    /// Opaque widget description handed to UIs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub widget: Option<Value>,
}

/// A template plus the id (directory name) it was found under.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentTemplate {
    pub id: String,
    pub manifest: TemplateManifest,
}

impl AgentTemplate {
    /// Agent config for a new instance of this template.
    pub fn to_agent_config(&self) -> AgentConfig {
        let defaults = AgentConfig::default();
        AgentConfig {
            enabled: true,
            template_id: Some(self.id.clone()),
            executable: format!("{}/{}", self.id, self.manifest.executable),
            interpreter: self.manifest.interpreter.clone(),
            args: self.manifest.args.clone(),
            env: self.manifest.env.clone(),
            heartbeat_interval_s: self
                .manifest
                .heartbeat_interval_s
                .unwrap_or(defaults.heartbeat_interval_s),
            agent_flush_interval_s: self
                .manifest
                .agent_flush_interval_s
                .unwrap_or(defaults.agent_flush_interval_s),
        }
    }

    pub fn describe(&self) -> Value {
        json!({
            "id": self.id,
            "name": self.manifest.name,
            "description": self.manifest.description,
            "executable": self.manifest.executable,
            "has_widget": self.manifest.widget.is_some(),
        })
    }
}

/// Bundled agent templates, read from disk on demand.
#[derive(Debug, Clone)]
pub struct TemplateCatalog {
    root: PathBuf,
}

impl TemplateCatalog {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// All readable templates, sorted by id. Broken manifests are logged and
    /// skipped.
    pub fn list(&self) -> Vec<AgentTemplate> {
        manifest_dirs(&self.root, TEMPLATE_MANIFEST)
            .into_iter()
            .filter_map(|(id, path)| match read_manifest::<TemplateManifest>(&path) {
                Ok(manifest) => Some(AgentTemplate { id, manifest }),
                Err(e) => {
                    warn!(template = %id, error = %e, "skipping unreadable template");
                    None
                }
            })
            .collect()
    }

    pub fn get(&self, id: &str) -> Result<AgentTemplate> {
        if id.is_empty() || id.contains(['/', '\\']) || id == ".." || id == "." {
            return Err(DroverError::UserError(format!("invalid template id '{}'", id)));
        }
        let path = self.root.join(id).join(TEMPLATE_MANIFEST);
        if !path.is_file() {
            return Err(DroverError::UserError(format!("unknown template '{}'", id)));
        }
        Ok(AgentTemplate {
            id: id.to_string(),
            manifest: read_manifest(&path)?,
        })
    }

    /// Widget for an agent created from `template_id`, or the default stub.
    pub fn render_widget(&self, label: &str, template_id: Option<&str>) -> Value {
        let widget = template_id
            .and_then(|id| self.get(id).ok())
            .and_then(|t| t.manifest.widget);

        match widget {
            Some(widget) => json!({"label": label, "supported": true, "widget": widget}),
            None => json!({"label": label, "supported": false, "widget": null}),
        }
    }
}

/// Contents of a `plugin.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    /// Entry point relative to the plugin directory.
    pub entry: String,
}

/// Installed plugin archives, as seen by the control plane.
pub trait PluginArchiveRegistry: Send {
    fn list_installed(&self) -> Result<Vec<Value>>;

    fn plugin_info(&self, name: &str) -> Result<Value>;

    fn install_archive(&mut self, path: &Path) -> Result<Value>;

    fn uninstall(&mut self, name: &str) -> Result<Value>;
}

/// Read-only registry over `<plugins_root>/*/plugin.yaml`.
#[derive(Debug, Clone)]
pub struct FsPluginRegistry {
    root: PathBuf,
}

impl FsPluginRegistry {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn describe(&self, dir_name: &str, manifest: &PluginManifest) -> Value {
        json!({
            "name": manifest.name,
            "version": manifest.version,
            "description": manifest.description,
            "entry": format!("{}/{}", dir_name, manifest.entry),
            "path": self.root.join(dir_name).display().to_string(),
        })
    }
}

impl PluginArchiveRegistry for FsPluginRegistry {
    fn list_installed(&self) -> Result<Vec<Value>> {
        Ok(manifest_dirs(&self.root, PLUGIN_MANIFEST)
            .into_iter()
            .filter_map(|(dir, path)| match read_manifest::<PluginManifest>(&path) {
                Ok(manifest) => Some(self.describe(&dir, &manifest)),
                Err(e) => {
                    warn!(plugin = %dir, error = %e, "skipping unreadable plugin manifest");
                    None
                }
            })
            .collect())
    }

    fn plugin_info(&self, name: &str) -> Result<Value> {
        for (dir, path) in manifest_dirs(&self.root, PLUGIN_MANIFEST) {
            let Ok(manifest) = read_manifest::<PluginManifest>(&path) else {
                continue;
            };
            if manifest.name == name || dir == name {
                return Ok(self.describe(&dir, &manifest));
            }
        }
        Err(DroverError::UserError(format!("plugin '{}' is not installed", name)))
    }

    fn install_archive(&mut self, path: &Path) -> Result<Value> {
        Err(DroverError::UserError(format!(
            "installing plugin archives is not supported by this registry (archive '{}')",
            path.display()
        )))
    }

    fn uninstall(&mut self, name: &str) -> Result<Value> {
        Err(DroverError::UserError(format!(
            "uninstalling plugins is not supported by this registry (plugin '{}')",
            name
        )))
    }
}

/// `(directory name, manifest path)` for every subdirectory holding `manifest`.
fn manifest_dirs(root: &Path, manifest: &str) -> Vec<(String, PathBuf)> {
    let Ok(entries) = fs::read_dir(root) else {
        return Vec::new();
    };
    let mut found: Vec<(String, PathBuf)> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| {
            let name = entry.file_name().to_str()?.to_string();
            let path = entry.path().join(manifest);
            path.is_file().then_some((name, path))
        })
        .collect();
    found.sort();
    found
}

fn read_manifest<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path).map_err(|e| {
        DroverError::UserError(format!("failed to read '{}': {}", path.display(), e))
    })?;
    serde_yaml::from_str(&content).map_err(|e| {
        DroverError::UserError(format!("failed to parse '{}': {}", path.display(), e))
    })
}
