use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// Manifest field holding the build-system label.
pub const LABEL_FIELD: &str = "label";
pub const PACKAGE_FIELD: &str = "package";
/// Manifest field holding the fuzzer binary name.
pub const FUZZER_FIELD: &str = "fuzzer";

/// Errors raised while loading a fuzzer manifest.
///
/// Any of these aborts the whole load; a registry is only ever produced from a
/// manifest in which every entry is valid.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to parse {path:?}: entry {index} missing label")]
    MissingLabel { path: PathBuf, index: usize },
    #[error("failed to parse {path:?}: no {field} for {label:?}")]
    MissingField {
        path: PathBuf,
        label: String,
        field: &'static str,
    },
    #[error(transparent)]
    Path(#[from] crate::paths::PathError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    #[error("no such fuzzer: {name}")]
    NoSuchFuzzer { name: String },
}

/// One fuzz target, merged from every manifest entry that shares its label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuzzerRecord {
    label: String,
    package: String,
    binary: String,
    metadata: BTreeMap<String, String>,
}

impl FuzzerRecord {
    /// External name, `package/binary`.
    pub fn name(&self) -> String {
        format!("{}/{}", self.package, self.binary)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Any merged metadata field, including `label`, `package` and `fuzzer`.
    pub fn get(&self, field: &str) -> Option<&str> {
        self.metadata.get(field).map(String::as_str)
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }
}

type RawEntry = HashMap<String, String>;

/// Folds raw entries into one field map per label.
///
/// Labels keep the order of their first appearance. Within a label, a
/// non-empty value replaces any earlier one and an empty value never does.
fn merge_by_label(
    path: &Path,
    entries: Vec<RawEntry>,
) -> Result<Vec<(String, BTreeMap<String, String>)>, LoadError> {
    let mut merged: Vec<(String, BTreeMap<String, String>)> = Vec::new();
    let mut index_of: HashMap<String, usize> = HashMap::new();

    for (index, entry) in entries.into_iter().enumerate() {
        let label = match entry.get(LABEL_FIELD) {
            Some(label) if !label.is_empty() => label.clone(),
            _ => {
                return Err(LoadError::MissingLabel {
                    path: path.to_path_buf(),
                    index,
                });
            }
        };

        let slot = *index_of.entry(label.clone()).or_insert_with(|| {
            merged.push((label, BTreeMap::new()));
            merged.len() - 1
        });
        let fields = &mut merged[slot].1;
        for (key, value) in entry {
            if !value.is_empty() {
                fields.insert(key, value);
            }
        }
    }
    Ok(merged)
}

fn required_field(
    path: &Path,
    label: &str,
    fields: &BTreeMap<String, String>,
    field: &'static str,
) -> Result<String, LoadError> {
    fields
        .get(field)
        .cloned()
        .ok_or_else(|| LoadError::MissingField {
            path: path.to_path_buf(),
            label: label.to_string(),
            field,
        })
}

/// Fuzzers available in a build, keyed by `package/binary`.
///
/// A registry is built in one piece from a manifest and never edited
/// afterwards; reloading means building a new one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FuzzerRegistry {
    fuzzers: BTreeMap<String, FuzzerRecord>,
}

impl FuzzerRegistry {
    /// Reads and parses the manifest at `path`.
    pub fn load(path: &Path) -> Result<Self, LoadError> {
        info!("Loading fuzzers from {:?}", path);
        let contents = std::fs::read_to_string(path).map_err(|source| LoadError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(path, &contents)
    }

    /// Parses manifest `contents`; `path` is only used in error messages.
    pub fn from_json_str(path: &Path, contents: &str) -> Result<Self, LoadError> {
        let entries: Vec<RawEntry> =
            serde_json::from_str(contents).map_err(|source| LoadError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        let mut fuzzers = BTreeMap::new();
        for (label, fields) in merge_by_label(path, entries)? {
            let package = required_field(path, &label, &fields, PACKAGE_FIELD)?;
            let binary = required_field(path, &label, &fields, FUZZER_FIELD)?;
            let record = FuzzerRecord {
                label,
                package,
                binary,
                metadata: fields,
            };
            if let Some(previous) = fuzzers.insert(record.name(), record.clone()) {
                warn!(
                    "Fuzzer {} from label {:?} replaces the one from label {:?}",
                    record.name(),
                    record.label,
                    previous.label
                );
            }
        }

        info!("Loaded {} fuzzers from {:?}", fuzzers.len(), path);
        Ok(Self { fuzzers })
    }

    pub fn lookup(&self, name: &str) -> Result<&FuzzerRecord, LookupError> {
        self.fuzzers
            .get(name)
            .ok_or_else(|| LookupError::NoSuchFuzzer {
                name: name.to_string(),
            })
    }

    /// Names of every registered fuzzer.
    pub fn list(&self) -> Vec<String> {
        self.fuzzers.keys().cloned().collect()
    }

    pub fn records(&self) -> impl Iterator<Item = &FuzzerRecord> {
        self.fuzzers.values()
    }

    pub fn len(&self) -> usize {
        self.fuzzers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fuzzers.is_empty()
    }
}
