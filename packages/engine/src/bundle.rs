use crate::types::{EngineError, EngineResult};
use serde_json::Value;
use std::collections::BTreeMap;
use std::collections::HashMap;
use tracing::debug;

/// Entry-command preference order. A bundle with none of these still gets
/// `start`; the missing script surfaces as a launch failure through the
/// normal process exit path rather than a separate error.
const START_SCRIPT_PREFERENCE: [&str; 3] = ["dev", "start", "serve"];

/// Full set of files constituting the app to preview.
///
/// Mapping from relative path to file content, immutable once loaded into a
/// session. The session owns its bundle exclusively for its lifetime.
#[derive(Debug, Clone, Default)]
pub struct SourceBundle {
    files: BTreeMap<String, Vec<u8>>,
}

/// Validate a bundle-relative path to keep guest writes confined to the
/// mounted root.
fn validate_bundle_path(path: &str) -> EngineResult<()> {
    if path.is_empty() {
        return Err(EngineError::InvalidBundlePath {
            path: path.to_string(),
            reason: "Path cannot be empty".to_string(),
        });
    }

    if path.starts_with('/') || path.starts_with('\\') || path.contains(':') {
        return Err(EngineError::InvalidBundlePath {
            path: path.to_string(),
            reason: "Path must be relative".to_string(),
        });
    }

    if path.split(['/', '\\']).any(|seg| seg == ".." || seg.is_empty()) {
        return Err(EngineError::InvalidBundlePath {
            path: path.to_string(),
            reason: "Path cannot contain traversal or empty segments".to_string(),
        });
    }

    Ok(())
}

impl SourceBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a bundle from whatever path/content pairs the loader
    /// collaborator supplied. Later duplicates overwrite earlier ones.
    pub fn from_files<I, P, C>(files: I) -> EngineResult<Self>
    where
        I: IntoIterator<Item = (P, C)>,
        P: Into<String>,
        C: Into<Vec<u8>>,
    {
        let mut bundle = Self::new();
        for (path, content) in files {
            bundle.insert(path.into(), content.into())?;
        }
        Ok(bundle)
    }

    pub fn insert(&mut self, path: String, content: Vec<u8>) -> EngineResult<()> {
        validate_bundle_path(&path)?;
        self.files.insert(path, content);
        Ok(())
    }

    pub fn get(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(|c| c.as_slice())
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.files.iter().map(|(p, c)| (p.as_str(), c.as_slice()))
    }
}

/// Parsed subset of the bundle's package descriptor: the named scripts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub scripts: HashMap<String, String>,
}

impl Manifest {
    /// Read and parse `package.json` out of the bundle.
    ///
    /// A missing or unparsable manifest is an error; the supervisor converts
    /// it to a launch failure.
    pub fn from_bundle(bundle: &SourceBundle) -> EngineResult<Self> {
        let raw = bundle
            .get("package.json")
            .ok_or_else(|| EngineError::ManifestUnreadable {
                reason: "package.json not found in bundle".to_string(),
            })?;

        let text =
            std::str::from_utf8(raw).map_err(|e| EngineError::ManifestUnreadable {
                reason: format!("package.json is not valid UTF-8: {}", e),
            })?;

        let package_json: Value =
            serde_json::from_str(text).map_err(|e| EngineError::ManifestUnreadable {
                reason: format!("Invalid package.json: {}", e),
            })?;

        let scripts = package_json
            .get("scripts")
            .and_then(|s| s.as_object())
            .map(|scripts_obj| {
                scripts_obj
                    .iter()
                    .map(|(k, v)| (k.clone(), v.as_str().unwrap_or("").to_string()))
                    .collect::<HashMap<String, String>>()
            })
            .unwrap_or_default();

        debug!("Parsed manifest with {} scripts", scripts.len());

        Ok(Self { scripts })
    }

    /// Pick the script name used to start the app: `dev`, then `start`,
    /// then `serve`, defaulting to `start` even when absent.
    pub fn resolve_start_script(&self) -> &str {
        for name in START_SCRIPT_PREFERENCE {
            if self.scripts.contains_key(name) {
                return name;
            }
        }
        "start"
    }
}

/// Resolved install and start invocations for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryCommands {
    pub install: (String, Vec<String>),
    pub start: (String, Vec<String>),
}

impl EntryCommands {
    pub fn resolve(manifest: &Manifest) -> Self {
        let script = manifest.resolve_start_script();
        Self {
            install: ("npm".to_string(), vec!["install".to_string()]),
            start: (
                "npm".to_string(),
                vec!["run".to_string(), script.to_string()],
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle_with_manifest(manifest: &str) -> SourceBundle {
        SourceBundle::from_files([("package.json", manifest.as_bytes().to_vec())]).unwrap()
    }

    #[test]
    fn test_bundle_path_validation() {
        assert!(validate_bundle_path("src/index.js").is_ok());
        assert!(validate_bundle_path("package.json").is_ok());
        assert!(validate_bundle_path("../../../etc/passwd").is_err());
        assert!(validate_bundle_path("/etc/passwd").is_err());
        assert!(validate_bundle_path("src/../../escape").is_err());
        assert!(validate_bundle_path("").is_err());
        assert!(validate_bundle_path("src//index.js").is_err());
    }

    #[test]
    fn test_manifest_missing() {
        let bundle = SourceBundle::new();
        assert!(matches!(
            Manifest::from_bundle(&bundle),
            Err(EngineError::ManifestUnreadable { .. })
        ));
    }

    #[test]
    fn test_manifest_invalid_json() {
        let bundle = bundle_with_manifest("{not json");
        assert!(matches!(
            Manifest::from_bundle(&bundle),
            Err(EngineError::ManifestUnreadable { .. })
        ));
    }

    #[test]
    fn test_start_script_preference_order() {
        let manifest = Manifest::from_bundle(&bundle_with_manifest(
            r#"{"scripts":{"serve":"x","start":"y","dev":"z"}}"#,
        ))
        .unwrap();
        assert_eq!(manifest.resolve_start_script(), "dev");

        let manifest = Manifest::from_bundle(&bundle_with_manifest(
            r#"{"scripts":{"serve":"x","start":"y"}}"#,
        ))
        .unwrap();
        assert_eq!(manifest.resolve_start_script(), "start");

        let manifest =
            Manifest::from_bundle(&bundle_with_manifest(r#"{"scripts":{"serve":"x"}}"#)).unwrap();
        assert_eq!(manifest.resolve_start_script(), "serve");
    }

    #[test]
    fn test_start_script_defaults_to_start() {
        let manifest = Manifest::from_bundle(&bundle_with_manifest(r#"{"scripts":{}}"#)).unwrap();
        assert_eq!(manifest.resolve_start_script(), "start");

        let manifest = Manifest::from_bundle(&bundle_with_manifest(r#"{"name":"app"}"#)).unwrap();
        assert_eq!(manifest.resolve_start_script(), "start");
    }

    #[test]
    fn test_entry_commands() {
        let manifest =
            Manifest::from_bundle(&bundle_with_manifest(r#"{"scripts":{"dev":"vite"}}"#)).unwrap();
        let commands = EntryCommands::resolve(&manifest);
        assert_eq!(commands.install.0, "npm");
        assert_eq!(commands.install.1, vec!["install"]);
        assert_eq!(commands.start.1, vec!["run", "dev"]);
    }
}
