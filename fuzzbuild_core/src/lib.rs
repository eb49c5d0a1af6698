pub mod config;
pub mod detect;
pub mod environment;
pub mod fxconfig;
pub mod host;
pub mod paths;
pub mod registry;
pub mod symbolize;

pub use config::{ConfigError, FuzzBuildConfig, LayoutSelection};
pub use detect::{DetectedLayout, DetectionError, Detector, Layout};
pub use environment::{Build, BuildEnvironment};
pub use host::HostEnv;
pub use paths::{PathError, PathTable, keys};
pub use registry::{FuzzerRecord, FuzzerRegistry, LoadError, LookupError};
pub use symbolize::{SymbolizeError, Symbolizer, strip_log_prefix};
