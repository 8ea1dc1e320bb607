//! Stacked INI configuration sources.
//!
//! Multiple configuration files may be given on the command line; later
//! files take precedence. Lookups walk the stack in precedence order, and
//! values remember which file they came from so relative paths can resolve
//! against it.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ini::Ini;

/// A configuration value together with the file that provided it.
#[derive(Debug, Clone)]
pub struct ConfigValue {
    pub value: String,
    pub file: PathBuf,
}

/// A stack of parsed INI files, highest precedence first.
#[derive(Debug, Default)]
pub struct ConfigSource {
    files: Vec<SourceFile>,
}

#[derive(Debug)]
struct SourceFile {
    path: PathBuf,
    ini: Ini,
}

impl ConfigSource {
    /// Loads the given files; later paths take precedence over earlier ones.
    pub fn load(paths: &[PathBuf]) -> Result<Self> {
        let mut files = Vec::new();
        for path in paths.iter().rev() {
            let ini = Ini::load_from_file(path)
                .with_context(|| format!("read config file {}", path.display()))?;
            files.push(SourceFile {
                path: path.clone(),
                ini,
            });
        }
        Ok(Self { files })
    }

    /// Parses a single in-memory document as if it had been read from
    /// `path`.
    pub fn load_str(content: &str, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let ini = Ini::load_from_str(content)
            .with_context(|| format!("parse config {}", path.display()))?;
        Ok(Self {
            files: vec![SourceFile { path, ini }],
        })
    }

    /// Stacks sources given in command-line order: later sources take
    /// precedence over earlier ones.
    pub fn stack(sources: impl IntoIterator<Item = Self>) -> Self {
        let mut files = Vec::new();
        for source in sources {
            let mut next = source.files;
            next.extend(files);
            files = next;
        }
        Self { files }
    }

    /// First value for `key`, searching files in precedence order. `None`
    /// section is the root section.
    pub fn get(&self, section: Option<&str>, key: &str) -> Option<&str> {
        self.files
            .iter()
            .find_map(|f| f.ini.section(section).and_then(|props| props.get(key)))
    }

    /// Like [`get`](Self::get), but also reports the originating file.
    pub fn value(&self, section: Option<&str>, key: &str) -> Option<ConfigValue> {
        self.files.iter().find_map(|f| {
            f.ini
                .section(section)
                .and_then(|props| props.get(key))
                .map(|v| ConfigValue {
                    value: v.to_string(),
                    file: f.path.clone(),
                })
        })
    }

    /// Every value of a repeated key, taken from the highest-precedence file
    /// that defines the key at all.
    pub fn find_all(&self, section: Option<&str>, key: &str) -> Vec<String> {
        for f in &self.files {
            if let Some(props) = f.ini.section(section) {
                let values: Vec<String> = props.get_all(key).map(str::to_string).collect();
                if !values.is_empty() {
                    return values;
                }
            }
        }
        Vec::new()
    }

    /// The union of named sections across all files.
    pub fn sections(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for f in &self.files {
            for (name, _props) in f.ini.iter() {
                if let Some(name) = name {
                    out.insert(name.to_string());
                }
            }
        }
        out
    }

    /// Resolves a possibly-relative path against the directory of the file
    /// the value came from.
    pub fn resolve_path(value: &ConfigValue) -> PathBuf {
        let p = Path::new(&value.value);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            value
                .file
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join(p)
        }
    }
}
