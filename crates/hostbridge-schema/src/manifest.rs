use crate::types::{validate_bundle_id, BundleId, Checksum, Version};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse manifest: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("unsupported manifest_version: {0}, expected 1")]
    UnsupportedVersion(u32),
    #[error("manifest declares no bundles")]
    NoBundles,
    #[error("invalid bundle identifier {0}")]
    InvalidBundleId(String),
    #[error("invalid semantic version: '{0}'")]
    InvalidVersion(String),
    #[error("invalid checksum '{0}': expected 64 hex characters, optionally prefixed 'blake3:'")]
    InvalidChecksum(String),
    #[error("bundle '{bundle}': url must not be empty")]
    EmptyUrl { bundle: String },
    #[error("bundle '{bundle}': unsupported url scheme in '{url}' (expected http, https or file)")]
    UnsupportedScheme { bundle: String, url: String },
    #[error("bundle '{bundle}': path '{path}' must be relative and stay inside the bundle")]
    EscapingPath { bundle: String, path: String },
    #[error("bundle not found in manifest: {0}")]
    UnknownBundle(String),
}

/// Archive container format of a bundle download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArchiveFormat {
    #[serde(rename = "tar")]
    Tar,
    #[serde(rename = "tar.gz")]
    TarGz,
}

impl std::fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArchiveFormat::Tar => write!(f, "tar"),
            ArchiveFormat::TarGz => write!(f, "tar.gz"),
        }
    }
}

/// Provisioning manifest: bundle identifier → what to download and how to verify it.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ProvisioningManifest {
    pub manifest_version: u32,
    #[serde(default)]
    pub bundles: BTreeMap<String, BundleSection>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BundleSection {
    pub version: Version,
    pub url: String,
    pub checksum: Checksum,
    /// Expected total uncompressed size of the extracted tree, in bytes.
    pub size: u64,
    #[serde(default)]
    pub format: Option<ArchiveFormat>,
    #[serde(default)]
    pub tree_checksum: Option<String>,
    #[serde(default)]
    pub libraries: Vec<String>,
    #[serde(default)]
    pub entry_point: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

/// One validated manifest entry, the unit the provisioning manager works on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub id: BundleId,
    pub version: Version,
    pub url: String,
    pub checksum: Checksum,
    pub size: u64,
    pub format: Option<ArchiveFormat>,
    pub tree_checksum: Option<String>,
    pub libraries: Vec<String>,
    pub entry_point: Option<String>,
    pub args: Vec<String>,
}

impl ProvisioningManifest {
    /// Validate the manifest and return its entries sorted by identifier.
    pub fn entries(&self) -> Result<Vec<ManifestEntry>, ManifestError> {
        if self.manifest_version != 1 {
            return Err(ManifestError::UnsupportedVersion(self.manifest_version));
        }
        if self.bundles.is_empty() {
            return Err(ManifestError::NoBundles);
        }
        self.bundles
            .iter()
            .map(|(id, section)| section.to_entry(id))
            .collect()
    }

    pub fn entry(&self, id: &str) -> Result<ManifestEntry, ManifestError> {
        if self.manifest_version != 1 {
            return Err(ManifestError::UnsupportedVersion(self.manifest_version));
        }
        let section = self
            .bundles
            .get(id)
            .ok_or_else(|| ManifestError::UnknownBundle(id.to_owned()))?;
        section.to_entry(id)
    }
}

impl BundleSection {
    fn to_entry(&self, id: &str) -> Result<ManifestEntry, ManifestError> {
        validate_bundle_id(id)?;

        let url = self.url.trim();
        if url.is_empty() {
            return Err(ManifestError::EmptyUrl {
                bundle: id.to_owned(),
            });
        }
        if !(url.starts_with("http://") || url.starts_with("https://") || url.starts_with("file://"))
        {
            return Err(ManifestError::UnsupportedScheme {
                bundle: id.to_owned(),
                url: url.to_owned(),
            });
        }

        let relative = self.libraries.iter().chain(self.entry_point.iter());
        for path in relative {
            if !is_contained_relative(path) {
                return Err(ManifestError::EscapingPath {
                    bundle: id.to_owned(),
                    path: path.clone(),
                });
            }
        }

        let tree_checksum = match self.tree_checksum {
            Some(ref t) => Some(t.parse::<Checksum>()?.as_hex().to_owned()),
            None => None,
        };

        let mut libraries = self.libraries.clone();
        libraries.sort();
        libraries.dedup();

        Ok(ManifestEntry {
            id: BundleId::new(id),
            version: self.version.clone(),
            url: url.to_owned(),
            checksum: self.checksum.clone(),
            size: self.size,
            format: self.format,
            tree_checksum,
            libraries,
            entry_point: self.entry_point.clone(),
            args: self.args.clone(),
        })
    }
}

fn is_contained_relative(path: &str) -> bool {
    let p = Path::new(path);
    !path.is_empty()
        && p.components()
            .all(|c| matches!(c, std::path::Component::Normal(_)))
}

pub fn parse_manifest_str(input: &str) -> Result<ProvisioningManifest, ManifestError> {
    Ok(toml::from_str(input)?)
}

pub fn parse_manifest_file(path: impl AsRef<Path>) -> Result<ProvisioningManifest, ManifestError> {
    let content = fs::read_to_string(path)?;
    parse_manifest_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(c: char) -> String {
        std::iter::repeat(c).take(64).collect()
    }

    fn full_manifest() -> String {
        format!(
            r#"
manifest_version = 1

[bundles.jre]
version = "17.0.8"
url = "https://mirror.example/jre-17.0.8.tar.gz"
checksum = "blake3:{a}"
size = 4096
format = "tar.gz"
libraries = ["lib/server/libjvm.so", "lib/libjava.so", "lib/libjava.so"]
entry_point = "bin/java"
args = ["-Xmx2G", "-jar", "game.jar"]

[bundles.fmod]
version = "2.2.0"
url = "file:///sdcard/fmod.tar"
checksum = "{b}"
size = 100
"#,
            a = hex('a'),
            b = hex('b')
        )
    }

    #[test]
    fn parses_full_manifest() {
        let manifest = parse_manifest_str(&full_manifest()).expect("should parse");
        let entries = manifest.entries().unwrap();
        assert_eq!(entries.len(), 2);
        // BTreeMap order: fmod before jre
        assert_eq!(entries[0].id.as_str(), "fmod");
        let jre = &entries[1];
        assert_eq!(jre.version.to_string(), "17.0.8");
        assert_eq!(jre.format, Some(ArchiveFormat::TarGz));
        assert_eq!(jre.libraries, vec!["lib/libjava.so", "lib/server/libjvm.so"]);
        assert_eq!(jre.entry_point.as_deref(), Some("bin/java"));
        assert_eq!(jre.args.len(), 3);
    }

    #[test]
    fn entry_lookup() {
        let manifest = parse_manifest_str(&full_manifest()).unwrap();
        assert_eq!(manifest.entry("fmod").unwrap().size, 100);
        assert!(matches!(
            manifest.entry("missing"),
            Err(ManifestError::UnknownBundle(_))
        ));
    }

    #[test]
    fn rejects_unknown_fields() {
        let input = format!(
            r#"
manifest_version = 1
[bundles.jre]
version = "1.0.0"
url = "https://x/y"
checksum = "{}"
size = 1
mystery = true
"#,
            hex('c')
        );
        assert!(parse_manifest_str(&input).is_err());
    }

    #[test]
    fn rejects_bad_version_at_parse_time() {
        let input = format!(
            r#"
manifest_version = 1
[bundles.jre]
version = "seventeen"
url = "https://x/y"
checksum = "{}"
size = 1
"#,
            hex('c')
        );
        assert!(parse_manifest_str(&input).is_err());
    }

    #[test]
    fn rejects_unsupported_manifest_version() {
        let input = format!(
            r#"
manifest_version = 2
[bundles.jre]
version = "1.0.0"
url = "https://x/y"
checksum = "{}"
size = 1
"#,
            hex('c')
        );
        let manifest = parse_manifest_str(&input).unwrap();
        assert!(matches!(
            manifest.entries(),
            Err(ManifestError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn rejects_empty_manifest() {
        let manifest = parse_manifest_str("manifest_version = 1\n").unwrap();
        assert!(matches!(manifest.entries(), Err(ManifestError::NoBundles)));
    }

    #[test]
    fn rejects_unsupported_scheme() {
        let input = format!(
            r#"
manifest_version = 1
[bundles.jre]
version = "1.0.0"
url = "ftp://x/y"
checksum = "{}"
size = 1
"#,
            hex('c')
        );
        let manifest = parse_manifest_str(&input).unwrap();
        assert!(matches!(
            manifest.entries(),
            Err(ManifestError::UnsupportedScheme { .. })
        ));
    }

    #[test]
    fn rejects_escaping_library_path() {
        let input = format!(
            r#"
manifest_version = 1
[bundles.jre]
version = "1.0.0"
url = "https://x/y"
checksum = "{}"
size = 1
libraries = ["../../etc/passwd"]
"#,
            hex('c')
        );
        let manifest = parse_manifest_str(&input).unwrap();
        assert!(matches!(
            manifest.entries(),
            Err(ManifestError::EscapingPath { .. })
        ));
    }

    #[test]
    fn rejects_invalid_bundle_id() {
        let input = format!(
            r#"
manifest_version = 1
[bundles."bad/id"]
version = "1.0.0"
url = "https://x/y"
checksum = "{}"
size = 1
"#,
            hex('c')
        );
        let manifest = parse_manifest_str(&input).unwrap();
        assert!(matches!(
            manifest.entries(),
            Err(ManifestError::InvalidBundleId(_))
        ));
    }
}
