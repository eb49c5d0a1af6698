use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Well-known resource keys shared by every build layout.
pub mod keys {
    /// Bootable Zircon image.
    pub const ZBI: &str = "zbi";
    /// Host tool that builds and extends FVM images.
    pub const FVM: &str = "fvm";
    /// Host tool that edits ZBI images.
    pub const ZBITOOL: &str = "zbitool";
    /// Block image holding the FVM disk.
    pub const BLK: &str = "blk";
    /// Emulator binary for the target architecture.
    pub const QEMU: &str = "qemu";
    /// Kernel image handed to the emulator.
    pub const KERNEL: &str = "kernel";
    /// Markup symbolizer.
    pub const SYMBOLIZE: &str = "symbolize";
    pub const LLVM_SYMBOLIZER: &str = "llvm-symbolizer";
    /// Fuzzer metadata manifest emitted by the build.
    pub const FUZZERS_JSON: &str = "fuzzers.json";
    pub const AUTHKEYS: &str = "authkeys";
    pub const SSHID: &str = "sshid";

    /// Every key a complete layout provides.
    pub const ALL: [&str; 11] = [
        ZBI,
        FVM,
        ZBITOOL,
        BLK,
        QEMU,
        KERNEL,
        SYMBOLIZE,
        LLVM_SYMBOLIZER,
        FUZZERS_JSON,
        AUTHKEYS,
        SSHID,
    ];
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    /// No path is registered for the requested resource key.
    #[error("no path for {key:?}")]
    NotFound { key: String },
}

/// Immutable mapping from logical resource keys to host paths, plus the
/// ordered list of build-id directories used for symbolization.
///
/// A table is assembled once by a [`PathTableBuilder`] and never mutated
/// afterwards, so shared references can be handed to any number of readers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathTable {
    paths: BTreeMap<String, PathBuf>,
    build_id_dirs: Vec<PathBuf>,
}

impl PathTable {
    pub fn builder() -> PathTableBuilder {
        PathTableBuilder::default()
    }

    /// Resolves each key to its path, preserving the order of `keys`.
    ///
    /// The first key without an entry aborts resolution; no partial result
    /// is returned.
    pub fn resolve<S: AsRef<str>>(&self, keys: &[S]) -> Result<Vec<PathBuf>, PathError> {
        keys.iter()
            .map(|key| {
                let key = key.as_ref();
                self.paths
                    .get(key)
                    .cloned()
                    .ok_or_else(|| PathError::NotFound {
                        key: key.to_string(),
                    })
            })
            .collect()
    }

    /// Single-key convenience over [`PathTable::resolve`].
    pub fn get(&self, key: &str) -> Result<&Path, PathError> {
        self.paths
            .get(key)
            .map(PathBuf::as_path)
            .ok_or_else(|| PathError::NotFound {
                key: key.to_string(),
            })
    }

    pub fn build_id_dirs(&self) -> &[PathBuf] {
        &self.build_id_dirs
    }

    /// Returns the table with `dirs` searched after the existing build-id
    /// directories.
    pub fn with_extra_build_id_dirs(mut self, dirs: &[PathBuf]) -> Self {
        self.build_id_dirs.extend_from_slice(dirs);
        self
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.paths.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct PathTableBuilder {
    paths: BTreeMap<String, PathBuf>,
    build_id_dirs: Vec<PathBuf>,
}

impl PathTableBuilder {
    /// Registers `path` under `key`. A later insert for the same key replaces
    /// the earlier one.
    pub fn path(mut self, key: &str, path: impl Into<PathBuf>) -> Self {
        self.paths.insert(key.to_string(), path.into());
        self
    }

    /// Appends a build-id directory; lookup order follows insertion order.
    pub fn build_id_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.build_id_dirs.push(dir.into());
        self
    }

    pub fn build(self) -> PathTable {
        PathTable {
            paths: self.paths,
            build_id_dirs: self.build_id_dirs,
        }
    }
}
