//! Offline rendering of a profile's children
//!
//! `performance-operator render --profile <file>` runs the same version gate
//! and rendering as the controller, without a cluster, and prints or writes
//! the resulting manifests.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context as _;

use pao_common::Error;
use pao_profile::{manifests, render, ChildKey, VersionRegistry};

/// Normalize a profile document (YAML or JSON) and render its children
pub fn render_document(
    registry: &VersionRegistry,
    document: &str,
) -> Result<Vec<(ChildKey, serde_json::Value)>, Error> {
    let raw: serde_json::Value = serde_yaml::from_str(document)
        .map_err(|e| Error::serialization_for_kind("PerformanceProfile", e.to_string()))?;
    let canonical = registry.normalize(raw)?;
    manifests(&render(&canonical)?)
}

/// File name of a rendered child: `<kind>_<name>.yaml`, lowercase kind
pub fn manifest_file_name(key: &ChildKey) -> String {
    format!("{}_{}.yaml", key.kind.as_str().to_lowercase(), key.name)
}

/// Write manifests as one file per child into `dir`
pub fn write_manifests(
    dir: &Path,
    documents: &[(ChildKey, serde_json::Value)],
) -> anyhow::Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create output directory {}", dir.display()))?;

    let mut written = Vec::with_capacity(documents.len());
    for (key, document) in documents {
        let path = dir.join(manifest_file_name(key));
        let yaml = serde_yaml::to_string(document)?;
        std::fs::write(&path, yaml)
            .with_context(|| format!("failed to write {}", path.display()))?;
        tracing::debug!(child = %key, path = %path.display(), "Wrote manifest");
        written.push(path);
    }
    Ok(written)
}

/// Print manifests as a multi-document YAML stream
pub fn print_manifests(
    out: &mut impl Write,
    documents: &[(ChildKey, serde_json::Value)],
) -> anyhow::Result<()> {
    for (_, document) in documents {
        writeln!(out, "---")?;
        write!(out, "{}", serde_yaml::to_string(document)?)?;
    }
    Ok(())
}
