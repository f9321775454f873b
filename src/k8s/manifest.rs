//! Manifest loading
//!
//! Reads multi-document YAML (or JSON) files into [`KubernetesResource`]s so the
//! control plane can run against a directory of manifests instead of a live
//! API server. Unknown kinds are skipped with a warning.

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use super::KubernetesResource;
use crate::errors::{EdgeplaneError, Result};

/// Parse every document in a YAML string.
pub fn parse_documents(contents: &str) -> Result<Vec<KubernetesResource>> {
    let mut resources = Vec::new();
    for document in serde_yaml::Deserializer::from_str(contents) {
        let value = serde_yaml::Value::deserialize(document)?;
        collect(value, &mut resources)?;
    }
    Ok(resources)
}

fn collect(value: serde_yaml::Value, out: &mut Vec<KubernetesResource>) -> Result<()> {
    if value.is_null() {
        return Ok(());
    }
    let field = |name: &str| value.get(name).and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let api_version = field("apiVersion");
    let kind = field("kind");
    let kind = kind.as_str();

    if kind.ends_with("List") {
        if let serde_yaml::Value::Mapping(mut mapping) = value {
            if let Some(serde_yaml::Value::Sequence(items)) = mapping.remove("items") {
                for item in items {
                    collect(item, out)?;
                }
            }
        }
        return Ok(());
    }

    let group = api_version.rsplit_once('/').map(|(group, _)| group).unwrap_or("");
    let resource = match (group, kind) {
        ("", "Service") => KubernetesResource::Service(decode(value, kind)?),
        ("", "Endpoints") => KubernetesResource::Endpoints(decode(value, kind)?),
        ("", "Secret") => KubernetesResource::Secret(decode(value, kind)?),
        ("networking.k8s.io", "Ingress") => KubernetesResource::Ingress(decode(value, kind)?),
        ("projectcontour.io", "HTTPProxy") => KubernetesResource::HTTPProxy(decode(value, kind)?),
        ("projectcontour.io", "ExtensionService") => {
            KubernetesResource::ExtensionService(decode(value, kind)?)
        }
        ("projectcontour.io", "TLSCertificateDelegation") => {
            KubernetesResource::TLSCertificateDelegation(decode(value, kind)?)
        }
        ("gateway.networking.k8s.io", "Gateway") => {
            KubernetesResource::Gateway(decode(value, kind)?)
        }
        ("gateway.networking.k8s.io", "HTTPRoute") => {
            KubernetesResource::HTTPRoute(decode(value, kind)?)
        }
        ("gateway.networking.k8s.io", "TLSRoute") => {
            KubernetesResource::TLSRoute(decode(value, kind)?)
        }
        _ => {
            warn!(api_version = %api_version, kind = %kind, "Skipping unsupported manifest kind");
            return Ok(());
        }
    };
    out.push(resource);
    Ok(())
}

fn decode<T: DeserializeOwned>(value: serde_yaml::Value, kind: &str) -> Result<T> {
    serde_yaml::from_value(value)
        .map_err(|e| EdgeplaneError::manifest(format!("invalid {} manifest: {}", kind, e)))
}

/// Load a single manifest file.
pub fn load_file(path: &Path) -> Result<Vec<KubernetesResource>> {
    let contents = fs::read_to_string(path)
        .map_err(|e| EdgeplaneError::from(e).with_context(format!("reading {}", path.display())))?;
    parse_documents(&contents).map_err(|e| match e {
        EdgeplaneError::Manifest { message, .. } => {
            EdgeplaneError::manifest_at(message, path.display().to_string())
        }
        other => other,
    })
}

/// Load every `.yaml`, `.yml` and `.json` file under `path`, in file name order.
///
/// A plain file path is loaded on its own.
pub fn load_path(path: &Path) -> Result<Vec<KubernetesResource>> {
    if path.is_file() {
        return load_file(path);
    }

    let mut files: Vec<PathBuf> = fs::read_dir(path)
        .map_err(|e| EdgeplaneError::from(e).with_context(format!("listing {}", path.display())))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file()
                && matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("yaml") | Some("yml") | Some("json")
                )
        })
        .collect();
    files.sort();

    let mut resources = Vec::new();
    for file in files {
        let loaded = load_file(&file)?;
        debug!(path = %file.display(), count = loaded.len(), "Loaded manifest file");
        resources.extend(loaded);
    }
    Ok(resources)
}
