//! Plugin archive inspection.
//!
//! A JAR is only accepted when it is a readable zip archive carrying one of the
//! recognized manifest entries. The first entry found in [`MANIFEST_ENTRIES`]
//! order wins.

use crate::error::PluginError;
use serde::{Deserialize, Serialize};
use std::io::{Read, Seek};
use std::path::Path;

/// Manifest entries recognized inside a plugin archive, in lookup order.
pub const MANIFEST_ENTRIES: [(&str, ManifestKind); 4] = [
    ("plugin.yml", ManifestKind::Bukkit),
    ("paper-plugin.yml", ManifestKind::Paper),
    ("bungee.yml", ManifestKind::Bungee),
    ("velocity-plugin.json", ManifestKind::Velocity),
];

/// Upper bound on manifest entry size, anything larger is not a real manifest.
const MAX_MANIFEST_BYTES: u64 = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestKind {
    Bukkit,
    Paper,
    Bungee,
    Velocity,
}

/// Metadata extracted from a plugin archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    pub authors: Vec<String>,
    pub kind: ManifestKind,
}

#[derive(Debug, Deserialize)]
struct YamlManifest {
    name: Option<String>,
    version: Option<serde_yaml::Value>,
    description: Option<String>,
    author: Option<String>,
    #[serde(default)]
    authors: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct VelocityManifest {
    id: Option<String>,
    name: Option<String>,
    version: Option<String>,
    description: Option<String>,
    #[serde(default)]
    authors: Vec<String>,
}

/// Reads and validates the manifest of the archive at `path`.
///
/// Runs the zip parsing on the blocking pool.
pub async fn read_manifest(path: &Path) -> Result<PluginManifest, PluginError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::open(&path).map_err(|e| PluginError::io(&path, e))?;
        parse_archive(file)
    })
    .await
    .map_err(|e| PluginError::InvalidPluginFile(format!("manifest reader failed: {}", e)))?
}

/// Parses a plugin archive from any seekable reader.
pub fn parse_archive<R: Read + Seek>(reader: R) -> Result<PluginManifest, PluginError> {
    let mut archive = zip::ZipArchive::new(reader)
        .map_err(|e| PluginError::InvalidPluginFile(format!("not a valid JAR archive: {}", e)))?;

    for (entry, kind) in MANIFEST_ENTRIES {
        let mut file = match archive.by_name(entry) {
            Ok(file) => file,
            Err(zip::result::ZipError::FileNotFound) => continue,
            Err(e) => {
                return Err(PluginError::InvalidPluginFile(format!(
                    "unreadable {} entry: {}",
                    entry, e
                )))
            }
        };
        if file.size() > MAX_MANIFEST_BYTES {
            return Err(PluginError::InvalidPluginFile(format!(
                "{} is too large ({} bytes)",
                entry,
                file.size()
            )));
        }
        let mut contents = String::new();
        file.read_to_string(&mut contents).map_err(|e| {
            PluginError::InvalidPluginFile(format!("{} is not valid UTF-8: {}", entry, e))
        })?;
        return parse_manifest(kind, &contents);
    }

    Err(PluginError::InvalidPluginFile(
        "archive does not contain plugin.yml, paper-plugin.yml, bungee.yml or velocity-plugin.json"
            .to_string(),
    ))
}

/// Parses the text of a manifest entry.
pub fn parse_manifest(kind: ManifestKind, contents: &str) -> Result<PluginManifest, PluginError> {
    let (name, version, description, authors) = match kind {
        ManifestKind::Velocity => {
            let raw: VelocityManifest = serde_json::from_str(contents).map_err(|e| {
                PluginError::InvalidPluginFile(format!("malformed velocity-plugin.json: {}", e))
            })?;
            (raw.name.or(raw.id), raw.version, raw.description, raw.authors)
        }
        _ => {
            let raw: YamlManifest = serde_yaml::from_str(contents).map_err(|e| {
                PluginError::InvalidPluginFile(format!("malformed plugin manifest: {}", e))
            })?;
            let mut authors = raw.authors;
            if let Some(author) = raw.author {
                authors.insert(0, author);
            }
            // `version: 1.10` is a YAML float, keep the literal text
            let version = raw.version.and_then(|v| match v {
                serde_yaml::Value::String(s) => Some(s),
                serde_yaml::Value::Number(n) => {
                    Some(raw_scalar(contents, "version").unwrap_or_else(|| n.to_string()))
                }
                _ => None,
            });
            (raw.name, version, raw.description, authors)
        }
    };

    let name = name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| PluginError::InvalidPluginFile("manifest has no plugin name".into()))?;
    let version = version
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| PluginError::InvalidPluginFile("manifest has no plugin version".into()))?;

    Ok(PluginManifest {
        name,
        version,
        description,
        authors,
        kind,
    })
}

/// Literal text of a top-level `key: value` line.
fn raw_scalar(contents: &str, key: &str) -> Option<String> {
    contents.lines().find_map(|line| {
        let rest = line.strip_prefix(key)?.trim_start().strip_prefix(':')?;
        let value = rest.split(" #").next()?.trim().trim_matches(['"', '\'']);
        (!value.is_empty()).then(|| value.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{build_jar, build_plugin_jar};
    use std::io::Cursor;

    #[test]
    fn test_bukkit_manifest() {
        let jar = build_plugin_jar("Essentials", "2.20.1");
        let manifest = parse_archive(Cursor::new(jar)).unwrap();
        assert_eq!(manifest.name, "Essentials");
        assert_eq!(manifest.version, "2.20.1");
        assert_eq!(manifest.kind, ManifestKind::Bukkit);
    }

    #[test]
    fn test_float_version_keeps_text() {
        let m = parse_manifest(ManifestKind::Bukkit, "name: Foo\nversion: 1.10\nauthor: steve\n").unwrap();
        assert_eq!(m.version, "1.10");
        assert_eq!(m.authors, vec!["steve".to_string()]);
    }

    #[test]
    fn test_velocity_manifest() {
        let jar = build_jar(&[(
            "velocity-plugin.json",
            r#"{"id":"proxyhelper","version":"0.3.0","authors":["a","b"]}"#,
        )]);
        let m = parse_archive(Cursor::new(jar)).unwrap();
        assert_eq!(m.name, "proxyhelper");
        assert_eq!(m.kind, ManifestKind::Velocity);
        assert_eq!(m.authors.len(), 2);
    }

    #[test]
    fn test_missing_manifest_rejected() {
        let jar = build_jar(&[("com/example/Main.class", "cafebabe")]);
        let err = parse_archive(Cursor::new(jar)).unwrap_err();
        assert_eq!(err.kind(), "invalid_plugin_file");
    }

    #[test]
    fn test_not_a_zip_rejected() {
        let err = parse_archive(Cursor::new(b"<html>404</html>".to_vec())).unwrap_err();
        assert!(matches!(err, PluginError::InvalidPluginFile(_)));
    }

    #[test]
    fn test_manifest_without_version_rejected() {
        let err = parse_manifest(ManifestKind::Bukkit, "name: Foo\nmain: a.b.C\n").unwrap_err();
        assert!(err.to_string().contains("no plugin version"));
    }
}
