use crate::config::FuzzBuildConfig;
use crate::detect::{DetectedLayout, DetectionError, Detector, Layout};
use crate::host::HostEnv;
use crate::paths::{PathError, PathTable, keys};
use crate::registry::{FuzzerRecord, FuzzerRegistry, LoadError, LookupError};
use crate::symbolize::{SymbolizeError, Symbolizer};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Everything a fuzzing harness needs from a build: fuzzer metadata, the
/// location of images and tools, and log symbolization.
pub trait Build: Send + Sync {
    /// Ensures every resource the build provides is ready for use. Calling it
    /// more than once has no further effect.
    fn prepare(&self) -> Result<(), DetectionError>;

    /// Returns the fuzzer with the given `package/binary` name.
    fn fuzzer(&self, name: &str) -> Result<FuzzerRecord, LookupError>;

    /// Names of every fuzzer in the build, in no particular order.
    fn list_fuzzers(&self) -> Vec<String>;

    /// Absolute host paths for each resource key, in the order requested.
    fn path(&self, keys: &[&str]) -> Result<Vec<PathBuf>, PathError>;

    /// Symbolizes `input` line by line into `output`.
    ///
    /// Returns once `input` is exhausted. `output` is left open; see
    /// [`Symbolizer::symbolize`].
    fn symbolize(&self, input: &mut (dyn Read + Send), output: &mut dyn Write)
    -> Result<(), SymbolizeError>;
}

/// The detected build: its layout, path table and fuzzer registry.
///
/// Paths never change after detection. The registry can be reloaded; a reload
/// swaps in a complete new registry or leaves the current one in place.
#[derive(Debug)]
pub struct BuildEnvironment {
    layout: Layout,
    paths: PathTable,
    fuzzers: RwLock<Arc<FuzzerRegistry>>,
}

impl BuildEnvironment {
    /// Detects the build from the live process environment with default
    /// settings.
    pub fn detect() -> Result<Self, DetectionError> {
        Self::detect_with(&FuzzBuildConfig::default(), HostEnv::from_process())
    }

    pub fn detect_with(config: &FuzzBuildConfig, host: HostEnv) -> Result<Self, DetectionError> {
        let DetectedLayout { layout, paths } =
            Detector::new(config.detect.clone(), host).detect()?;
        let paths = paths.with_extra_build_id_dirs(&config.symbolizer.extra_build_id_dirs);
        Self::from_paths(layout, paths)
    }

    /// Builds the environment over an existing path table, loading its
    /// fuzzer manifest.
    pub fn from_paths(layout: Layout, paths: PathTable) -> Result<Self, DetectionError> {
        let registry = Self::load_registry(&paths)?;
        Ok(Self {
            layout,
            paths,
            fuzzers: RwLock::new(Arc::new(registry)),
        })
    }

    fn load_registry(paths: &PathTable) -> Result<FuzzerRegistry, LoadError> {
        let manifest = paths.get(keys::FUZZERS_JSON)?;
        FuzzerRegistry::load(manifest)
    }

    /// Re-reads the fuzzer manifest. On error the previously loaded fuzzers
    /// stay in place.
    pub fn reload_fuzzers(&self) -> Result<(), LoadError> {
        let registry = Self::load_registry(&self.paths)?;
        *self.fuzzers.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(registry);
        Ok(())
    }

    /// Snapshot of the current registry. Later reloads do not affect it.
    pub fn fuzzers(&self) -> Arc<FuzzerRegistry> {
        self.fuzzers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn paths(&self) -> &PathTable {
        &self.paths
    }

    pub fn build_id_dirs(&self) -> &[PathBuf] {
        self.paths.build_id_dirs()
    }

    pub fn symbolizer(&self) -> Result<Symbolizer, SymbolizeError> {
        Symbolizer::from_paths(&self.paths)
    }
}

impl Build for BuildEnvironment {
    /// Detected builds carry nothing to fetch.
    fn prepare(&self) -> Result<(), DetectionError> {
        Ok(())
    }

    fn fuzzer(&self, name: &str) -> Result<FuzzerRecord, LookupError> {
        self.fuzzers().lookup(name).cloned()
    }

    fn list_fuzzers(&self) -> Vec<String> {
        self.fuzzers().list()
    }

    fn path(&self, keys: &[&str]) -> Result<Vec<PathBuf>, PathError> {
        let paths = self.paths.resolve(keys)?;
        debug!(?keys, ?paths, "Resolved build paths");
        Ok(paths)
    }

    fn symbolize(
        &self,
        input: &mut (dyn Read + Send),
        output: &mut dyn Write,
    ) -> Result<(), SymbolizeError> {
        self.symbolizer()?.symbolize(input, output)
    }
}
