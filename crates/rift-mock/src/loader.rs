//! Rule sources.
//!
//! A [`RuleSource`] produces rule definitions plus the per-file errors met
//! along the way. Bad files are reported and skipped; they never abort a
//! load.

use crate::config::RuleDefinition;
use crate::error::LoadError;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const RULE_EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

/// Output of one full load.
#[derive(Debug, Default)]
pub struct LoadedRules {
    /// Definitions in load order, tagged with the file they came from
    pub definitions: Vec<(Option<PathBuf>, RuleDefinition)>,
    pub errors: Vec<LoadError>,
}

pub trait RuleSource: Send + Sync {
    fn load_all(&self) -> LoadedRules;

    /// Directories the source reads from, if any. Used to set up watching.
    fn roots(&self) -> Vec<PathBuf> {
        Vec::new()
    }
}

/// Shapes a rule file may take.
#[derive(Deserialize)]
#[serde(untagged)]
enum RuleFile {
    Wrapped { rules: Vec<RuleDefinition> },
    List(Vec<RuleDefinition>),
    Single(Box<RuleDefinition>),
}

impl RuleFile {
    fn into_rules(self) -> Vec<RuleDefinition> {
        match self {
            RuleFile::Wrapped { rules } | RuleFile::List(rules) => rules,
            RuleFile::Single(rule) => vec![*rule],
        }
    }
}

/// Reads `*.yaml`, `*.yml` and `*.json` files under each root, recursively,
/// in path order.
#[derive(Debug, Clone)]
pub struct YamlDirectorySource {
    roots: Vec<PathBuf>,
}

impl YamlDirectorySource {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    fn collect_files(dir: &Path, files: &mut Vec<PathBuf>, errors: &mut Vec<LoadError>) {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(source) => {
                errors.push(LoadError::Io {
                    path: dir.to_path_buf(),
                    source,
                });
                return;
            }
        };
        let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
        paths.sort();
        for path in paths {
            if path.is_dir() {
                Self::collect_files(&path, files, errors);
            } else if is_rule_file(&path) {
                files.push(path);
            }
        }
    }
}

pub fn is_rule_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| RULE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Parse one rule file. JSON is a subset of YAML, so one parser serves both.
pub fn parse_rule_file(path: &Path) -> Result<Vec<RuleDefinition>, LoadError> {
    let content = fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    let file: RuleFile = serde_yaml::from_str(&content).map_err(|e| LoadError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    Ok(file.into_rules())
}

impl RuleSource for YamlDirectorySource {
    fn load_all(&self) -> LoadedRules {
        let mut loaded = LoadedRules::default();
        let mut files = Vec::new();
        for root in &self.roots {
            Self::collect_files(root, &mut files, &mut loaded.errors);
        }

        for file in files {
            match parse_rule_file(&file) {
                Ok(rules) => {
                    debug!("Read {} rules from {}", rules.len(), file.display());
                    loaded
                        .definitions
                        .extend(rules.into_iter().map(|r| (Some(file.clone()), r)));
                }
                Err(e) => loaded.errors.push(e),
            }
        }
        loaded
    }

    fn roots(&self) -> Vec<PathBuf> {
        self.roots.clone()
    }
}

/// Fixed, in-memory definitions.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    definitions: Vec<RuleDefinition>,
}

impl StaticSource {
    pub fn new(definitions: Vec<RuleDefinition>) -> Self {
        Self { definitions }
    }
}

impl RuleSource for StaticSource {
    fn load_all(&self) -> LoadedRules {
        LoadedRules {
            definitions: self.definitions.iter().cloned().map(|d| (None, d)).collect(),
            errors: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, content: &str) {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    fn names(loaded: &LoadedRules) -> Vec<String> {
        loaded.definitions.iter().map(|(_, d)| d.name.clone()).collect()
    }

    #[test]
    fn test_loads_every_file_shape_recursively() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a.yaml", "rules:\n  - name: wrapped-1\n  - name: wrapped-2\n");
        write(dir.path(), "b.yml", "- name: listed\n");
        write(dir.path(), "nested/c.json", r#"{"name": "single"}"#);
        write(dir.path(), "notes.txt", "ignored");
        write(dir.path(), "empty.yaml", "");

        let loaded = YamlDirectorySource::new(vec![dir.path().to_path_buf()]).load_all();
        assert!(loaded.errors.is_empty(), "{:?}", loaded.errors);
        assert_eq!(names(&loaded), vec!["wrapped-1", "wrapped-2", "listed", "single"]);
        assert!(loaded.definitions[3]
            .0
            .as_ref()
            .unwrap()
            .ends_with("nested/c.json"));
    }

    #[test]
    fn test_bad_file_is_reported_and_skipped() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "good.yaml", "- name: good\n");
        write(dir.path(), "bad.yaml", "- name: [unclosed\n");

        let loaded = YamlDirectorySource::new(vec![dir.path().to_path_buf()]).load_all();
        assert_eq!(names(&loaded), vec!["good"]);
        assert_eq!(loaded.errors.len(), 1);
        assert!(loaded.errors[0].path().ends_with("bad.yaml"));
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let loaded =
            YamlDirectorySource::new(vec![PathBuf::from("/nonexistent/rift-mock-rules")]).load_all();
        assert!(loaded.definitions.is_empty());
        assert!(matches!(loaded.errors[0], LoadError::Io { .. }));
    }

    #[test]
    fn test_static_source() {
        let def: RuleDefinition = serde_yaml::from_str("name: inline").unwrap();
        let loaded = StaticSource::new(vec![def]).load_all();
        assert_eq!(names(&loaded), vec!["inline"]);
        assert!(loaded.definitions[0].0.is_none());
    }
}
