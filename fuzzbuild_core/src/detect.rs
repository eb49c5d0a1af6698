use crate::config::{DetectSettings, LayoutSelection};
use crate::fxconfig::{self, SSH_MANIFEST_LINES};
use crate::host::{self, ARCHS, HOST_TOOL_DIRS, HostEnv, PLATFORMS};
use crate::paths::{PathTable, keys};
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Pointer file at the checkout root naming the active build directory.
pub const BUILD_DIR_POINTER: &str = ".fx-build-dir";
/// Build configuration inside the active build directory.
pub const BUILD_CONFIG: &str = "fx.config";
/// SSH manifest at the checkout root.
pub const SSH_MANIFEST: &str = ".fx-ssh-path";
pub const ARCH_PROPERTY: &str = "FUCHSIA_ARCH";
/// The only architecture prepackaged bundles are built for.
pub const BUNDLE_ARCH: &str = "x64";

#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("{var} not set")]
    MissingEnvVar { var: String },
    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot make {path:?} absolute: {source}")]
    Absolute {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no {key} in {path:?}")]
    MissingProperty { key: String, path: PathBuf },
    #[error("unsupported arch: {arch} (supported: {})", .supported.join(", "))]
    UnsupportedArch { arch: String, supported: Vec<String> },
    #[error("unsupported os: {os} (supported: {})", .supported.join(", "))]
    UnsupportedPlatform { os: String, supported: Vec<String> },
    #[error("unsupported host cpu: {cpu} (supported: {})", .supported.join(", "))]
    UnsupportedHostCpu { cpu: String, supported: Vec<String> },
    #[error("expected {expected} lines in {path:?}, found {found}")]
    SshManifestTooShort {
        path: PathBuf,
        expected: usize,
        found: usize,
    },
    #[error(transparent)]
    Path(#[from] crate::paths::PathError),
    #[error(transparent)]
    Registry(#[from] crate::registry::LoadError),
}

/// The build layouts this crate knows how to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// Self-contained bundle unpacked by automated fuzzing infrastructure.
    PrepackagedBundle,
    /// Build output inside a developer's local checkout.
    LocalCheckout,
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layout::PrepackagedBundle => f.write_str("prepackaged bundle"),
            Layout::LocalCheckout => f.write_str("local checkout"),
        }
    }
}

/// Outcome of detection: which layout is active and where its files live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedLayout {
    pub layout: Layout,
    pub paths: PathTable,
}

fn read_file(path: &Path) -> Result<String, DetectionError> {
    std::fs::read_to_string(path).map_err(|source| DetectionError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn absolute(path: &Path) -> Result<PathBuf, DetectionError> {
    std::path::absolute(path).map_err(|source| DetectionError::Absolute {
        path: path.to_path_buf(),
        source,
    })
}

/// `path` with `suffix` appended to its final component.
fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw: OsString = path.as_os_str().to_owned();
    raw.push(suffix);
    PathBuf::from(raw)
}

/// Path table of a prepackaged bundle rooted at `bundle_dir`.
pub fn bundle_layout(bundle_dir: &Path) -> PathTable {
    let build_dir = bundle_dir.join("build");
    let target_dir = bundle_dir.join("target").join(BUNDLE_ARCH);
    let clang_dir = build_dir.join("buildtools").join("linux-x64").join("clang");
    let out_dir = build_dir.join("out").join("default");
    let host_dir = out_dir.join("host_x64");

    PathTable::builder()
        .path(keys::ZBI, target_dir.join("fuchsia.zbi"))
        .path(keys::FVM, host_dir.join("fvm"))
        .path(keys::ZBITOOL, host_dir.join("zbi"))
        .path(keys::BLK, target_dir.join("fvm.blk"))
        .path(
            keys::QEMU,
            bundle_dir
                .join("qemu-for-fuchsia")
                .join("bin")
                .join("qemu-system-x86_64"),
        )
        .path(keys::KERNEL, target_dir.join("multiboot.bin"))
        .path(
            keys::SYMBOLIZE,
            build_dir
                .join("zircon")
                .join("prebuilt")
                .join("downloads")
                .join("symbolize")
                .join("linux-x64")
                .join("symbolize"),
        )
        .path(
            keys::LLVM_SYMBOLIZER,
            clang_dir.join("bin").join("llvm-symbolizer"),
        )
        .path(keys::FUZZERS_JSON, out_dir.join("fuzzers.json"))
        .path(
            keys::AUTHKEYS,
            bundle_dir.join(".ssh").join("authorized_keys"),
        )
        .path(keys::SSHID, bundle_dir.join(".ssh").join("pkey"))
        .build_id_dir(clang_dir.join("lib").join("debug").join(".build_id"))
        .build_id_dir(out_dir.join(".build-id"))
        .build()
}

/// Inputs to a local checkout's path table, gathered from its config files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalCheckout {
    pub root: PathBuf,
    pub build_dir: PathBuf,
    /// `<platform>-<arch>`, e.g. `linux-x64`.
    pub platform: String,
    pub arch: host::ArchInfo,
    pub host_tool_dir: &'static str,
    pub ssh_key: PathBuf,
    pub authorized_keys: PathBuf,
}

impl LocalCheckout {
    pub fn path_table(&self) -> PathTable {
        let build_dir = &self.build_dir;
        let zircon_dir = with_suffix(build_dir, ".zircon");
        let prebuilt_dir = self.root.join("prebuilt");
        let clang_dir = prebuilt_dir
            .join("third_party")
            .join("clang")
            .join(&self.platform);
        let qemu_dir = prebuilt_dir
            .join("third_party")
            .join("qemu")
            .join(&self.platform);
        let host_dir = build_dir.join(self.host_tool_dir);

        PathTable::builder()
            .path(keys::ZBI, build_dir.join("fuchsia.zbi"))
            .path(keys::FVM, host_dir.join("fvm"))
            .path(keys::ZBITOOL, zircon_dir.join("tools").join("zbi"))
            .path(
                keys::BLK,
                build_dir
                    .join("obj")
                    .join("build")
                    .join("images")
                    .join("fvm.blk"),
            )
            .path(keys::QEMU, qemu_dir.join("bin").join(self.arch.emulator))
            .path(keys::KERNEL, zircon_dir.join(self.arch.kernel))
            .path(keys::SYMBOLIZE, host_dir.join("symbolize"))
            .path(
                keys::LLVM_SYMBOLIZER,
                clang_dir.join("bin").join("llvm-symbolizer"),
            )
            .path(keys::FUZZERS_JSON, build_dir.join("fuzzers.json"))
            .path(keys::AUTHKEYS, &self.authorized_keys)
            .path(keys::SSHID, &self.ssh_key)
            .build_id_dir(clang_dir.join("lib").join("debug").join(".build-id"))
            .build_id_dir(build_dir.join(".build-id"))
            .build_id_dir(zircon_dir.join(".build-id"))
            .build()
    }
}

/// Decides which layout is active from a [`HostEnv`] snapshot and the files
/// it points at.
#[derive(Debug, Clone)]
pub struct Detector {
    settings: DetectSettings,
    host: HostEnv,
}

impl Detector {
    pub fn new(settings: DetectSettings, host: HostEnv) -> Self {
        Self { settings, host }
    }

    pub fn detect(&self) -> Result<DetectedLayout, DetectionError> {
        let bundle_requested = self.host.var(&self.settings.bundle_dir_var).is_some();
        let detected = match self.settings.layout {
            LayoutSelection::Bundle => self.detect_bundle()?,
            LayoutSelection::Local => self.detect_local()?,
            LayoutSelection::Auto if bundle_requested => self.detect_bundle()?,
            LayoutSelection::Auto => self.detect_local()?,
        };
        info!(layout = %detected.layout, "Detected build layout");
        Ok(detected)
    }

    pub fn detect_bundle(&self) -> Result<DetectedLayout, DetectionError> {
        let var = &self.settings.bundle_dir_var;
        let bundle_dir = self
            .host
            .var(var)
            .ok_or_else(|| DetectionError::MissingEnvVar { var: var.clone() })?;
        let bundle_dir = absolute(Path::new(bundle_dir))?;
        debug!(bundle_dir = ?bundle_dir, "Using prepackaged bundle");
        Ok(DetectedLayout {
            layout: Layout::PrepackagedBundle,
            paths: bundle_layout(&bundle_dir),
        })
    }

    pub fn detect_local(&self) -> Result<DetectedLayout, DetectionError> {
        let checkout = self.local_checkout()?;
        debug!(root = ?checkout.root, build_dir = ?checkout.build_dir, "Using local checkout");
        Ok(DetectedLayout {
            layout: Layout::LocalCheckout,
            paths: checkout.path_table(),
        })
    }

    fn checkout_root(&self) -> Result<PathBuf, DetectionError> {
        let root = match self.host.var(&self.settings.root_dir_var) {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => self.settings.default_root.clone(),
        };
        absolute(&root)
    }

    /// Reads the checkout's pointer, config and SSH files.
    pub fn local_checkout(&self) -> Result<LocalCheckout, DetectionError> {
        let root = self.checkout_root()?;

        let pointer = root.join(BUILD_DIR_POINTER);
        let build_dir = root.join(read_file(&pointer)?.trim());

        let os = self.host.os();
        let platform =
            host::platform_for(os).ok_or_else(|| DetectionError::UnsupportedPlatform {
                os: os.to_string(),
                supported: host::supported(PLATFORMS),
            })?;
        let cpu = self.host.cpu();
        let host_tool_dir =
            host::host_tool_dir(cpu).ok_or_else(|| DetectionError::UnsupportedHostCpu {
                cpu: cpu.to_string(),
                supported: host::supported(HOST_TOOL_DIRS),
            })?;

        let config_path = build_dir.join(BUILD_CONFIG);
        let properties = fxconfig::parse_properties(&read_file(&config_path)?);
        let arch_name =
            properties
                .get(ARCH_PROPERTY)
                .ok_or_else(|| DetectionError::MissingProperty {
                    key: ARCH_PROPERTY.to_string(),
                    path: config_path.clone(),
                })?;
        let arch =
            host::arch_info(arch_name).ok_or_else(|| DetectionError::UnsupportedArch {
                arch: arch_name.clone(),
                supported: host::supported(ARCHS),
            })?;

        let ssh_manifest = root.join(SSH_MANIFEST);
        let ssh = fxconfig::parse_ssh_manifest(&read_file(&ssh_manifest)?).map_err(|e| {
            DetectionError::SshManifestTooShort {
                path: ssh_manifest.clone(),
                expected: SSH_MANIFEST_LINES,
                found: e.found,
            }
        })?;

        Ok(LocalCheckout {
            platform: format!("{platform}-{arch_name}"),
            arch,
            host_tool_dir,
            ssh_key: root.join(ssh.private_key),
            authorized_keys: root.join(ssh.authorized_keys),
            build_dir,
            root,
        })
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use std::fs;
    use std::path::Path;

    /// Lays out the minimum set of files a local checkout needs under `root`,
    /// with `out/default` as the build directory.
    pub(crate) fn write_checkout(root: &Path, fx_config: &str, fuzzers_json: &str) {
        let build_dir = root.join("out").join("default");
        fs::create_dir_all(&build_dir).unwrap();
        fs::write(root.join(".fx-build-dir"), "out/default\n").unwrap();
        fs::write(build_dir.join("fx.config"), fx_config).unwrap();
        fs::write(build_dir.join("fuzzers.json"), fuzzers_json).unwrap();
        fs::write(
            root.join(".fx-ssh-path"),
            "/keys/pkey\n/keys/authorized_keys\n",
        )
        .unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::test_utils::write_checkout;
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn host_for(root: &Path) -> HostEnv {
        HostEnv::new("linux", "x86_64").with_var("FUCHSIA_DIR", root.to_str().unwrap())
    }

    fn detector(host: HostEnv) -> Detector {
        Detector::new(DetectSettings::default(), host)
    }

    #[test]
    fn bundle_variable_selects_bundle_layout() -> Result<(), DetectionError> {
        let host = HostEnv::new("linux", "x86_64")
            .with_var("FUCHSIA_RESOURCES_DIR", "/bundle")
            .with_var("FUCHSIA_DIR", "/ignored");
        let detected = detector(host).detect()?;
        assert_eq!(detected.layout, Layout::PrepackagedBundle);

        let paths = detected.paths;
        assert_eq!(
            paths.get(keys::QEMU).unwrap(),
            Path::new("/bundle/qemu-for-fuchsia/bin/qemu-system-x86_64")
        );
        assert_eq!(
            paths.get(keys::KERNEL).unwrap(),
            Path::new("/bundle/target/x64/multiboot.bin")
        );
        assert_eq!(
            paths.get(keys::FUZZERS_JSON).unwrap(),
            Path::new("/bundle/build/out/default/fuzzers.json")
        );
        assert_eq!(
            paths.get(keys::SSHID).unwrap(),
            Path::new("/bundle/.ssh/pkey")
        );
        assert_eq!(
            paths.build_id_dirs(),
            &[
                PathBuf::from("/bundle/build/buildtools/linux-x64/clang/lib/debug/.build_id"),
                PathBuf::from("/bundle/build/out/default/.build-id"),
            ]
        );
        Ok(())
    }

    #[test]
    fn bundle_layout_provides_every_key() {
        let table = bundle_layout(Path::new("/bundle"));
        assert!(table.resolve(&keys::ALL).is_ok());
    }

    #[test]
    fn forced_bundle_without_variable_names_it() {
        let settings = DetectSettings {
            layout: LayoutSelection::Bundle,
            ..DetectSettings::default()
        };
        let err = Detector::new(settings, HostEnv::new("linux", "x86_64"))
            .detect()
            .unwrap_err();
        assert_eq!(err.to_string(), "FUCHSIA_RESOURCES_DIR not set");
    }

    #[test]
    fn local_checkout_layout() -> Result<(), DetectionError> {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write_checkout(root, "FUCHSIA_ARCH='arm64'\n", "[]");

        let detected = detector(host_for(root)).detect()?;
        assert_eq!(detected.layout, Layout::LocalCheckout);

        let build_dir = root.join("out").join("default");
        let zircon_dir = root.join("out").join("default.zircon");
        let paths = detected.paths;
        assert_eq!(
            paths.get(keys::QEMU)?,
            root.join("prebuilt/third_party/qemu/linux-arm64/bin/qemu-system-aarch64")
        );
        assert_eq!(
            paths.get(keys::KERNEL)?,
            zircon_dir.join("qemu-boot-shim.bin")
        );
        assert_eq!(paths.get(keys::ZBITOOL)?, zircon_dir.join("tools/zbi"));
        assert_eq!(paths.get(keys::SYMBOLIZE)?, build_dir.join("host_x64/symbolize"));
        assert_eq!(
            paths.get(keys::LLVM_SYMBOLIZER)?,
            root.join("prebuilt/third_party/clang/linux-arm64/bin/llvm-symbolizer")
        );
        assert_eq!(paths.get(keys::FUZZERS_JSON)?, build_dir.join("fuzzers.json"));
        assert_eq!(paths.get(keys::SSHID)?, Path::new("/keys/pkey"));
        assert_eq!(
            paths.get(keys::AUTHKEYS)?,
            Path::new("/keys/authorized_keys")
        );
        assert_eq!(
            paths.build_id_dirs(),
            &[
                root.join("prebuilt/third_party/clang/linux-arm64/lib/debug/.build-id"),
                build_dir.join(".build-id"),
                zircon_dir.join(".build-id"),
            ]
        );
        assert!(paths.resolve(&keys::ALL).is_ok());
        Ok(())
    }

    #[test]
    fn host_platform_and_cpu_select_tool_names() -> Result<(), DetectionError> {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write_checkout(root, "FUCHSIA_ARCH=x64\n", "[]");

        let host = HostEnv::new("macos", "aarch64").with_var("FUCHSIA_DIR", root.to_str().unwrap());
        let checkout = detector(host).local_checkout()?;
        assert_eq!(checkout.platform, "mac-x64");
        assert_eq!(checkout.host_tool_dir, "host_arm64");
        assert_eq!(checkout.arch.emulator, "qemu-system-x86_64");
        Ok(())
    }

    #[test]
    fn relative_ssh_paths_resolve_against_root() -> Result<(), DetectionError> {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write_checkout(root, "FUCHSIA_ARCH=x64\n", "[]");
        fs::write(root.join(".fx-ssh-path"), ".ssh/pkey\n.ssh/authorized_keys\n").unwrap();

        let checkout = detector(host_for(root)).local_checkout()?;
        assert_eq!(checkout.ssh_key, root.join(".ssh/pkey"));
        assert_eq!(checkout.authorized_keys, root.join(".ssh/authorized_keys"));
        Ok(())
    }

    #[test]
    fn default_root_is_used_without_variable() -> Result<(), DetectionError> {
        let dir = tempdir().unwrap();
        write_checkout(dir.path(), "FUCHSIA_ARCH=x64\n", "[]");
        let settings = DetectSettings {
            default_root: dir.path().to_path_buf(),
            ..DetectSettings::default()
        };
        let checkout = Detector::new(settings, HostEnv::new("linux", "x86_64")).local_checkout()?;
        assert_eq!(checkout.root, dir.path());
        Ok(())
    }

    #[test]
    fn missing_build_dir_pointer_names_the_file() {
        let dir = tempdir().unwrap();
        let err = detector(host_for(dir.path())).detect().unwrap_err();
        match &err {
            DetectionError::Read { path, .. } => {
                assert_eq!(path, &dir.path().join(BUILD_DIR_POINTER))
            }
            other => panic!("Expected Read error, got {other:?}"),
        }
        assert!(err.to_string().contains(".fx-build-dir"));
    }

    #[test]
    fn missing_arch_property_names_key_and_file() {
        let dir = tempdir().unwrap();
        write_checkout(dir.path(), "FUCHSIA_BUILD_DIR=out/default\n", "[]");
        let err = detector(host_for(dir.path())).detect().unwrap_err();
        match &err {
            DetectionError::MissingProperty { key, path } => {
                assert_eq!(key, ARCH_PROPERTY);
                assert!(path.ends_with("out/default/fx.config"));
            }
            other => panic!("Expected MissingProperty, got {other:?}"),
        }
    }

    #[test]
    fn unsupported_arch_lists_supported_set() {
        let dir = tempdir().unwrap();
        write_checkout(dir.path(), "FUCHSIA_ARCH='riscv64'\n", "[]");
        let err = detector(host_for(dir.path())).detect().unwrap_err();
        match &err {
            DetectionError::UnsupportedArch { arch, supported } => {
                assert_eq!(arch, "riscv64");
                assert_eq!(supported, &vec!["arm64".to_string(), "x64".to_string()]);
            }
            other => panic!("Expected UnsupportedArch, got {other:?}"),
        }
        assert_eq!(
            err.to_string(),
            "unsupported arch: riscv64 (supported: arm64, x64)"
        );
    }

    #[test]
    fn unsupported_os_lists_supported_set() {
        let dir = tempdir().unwrap();
        write_checkout(dir.path(), "FUCHSIA_ARCH=x64\n", "[]");
        let host =
            HostEnv::new("windows", "x86_64").with_var("FUCHSIA_DIR", dir.path().to_str().unwrap());
        let err = detector(host).detect().unwrap_err();
        assert_eq!(
            err.to_string(),
            "unsupported os: windows (supported: linux, macos)"
        );
    }

    #[test]
    fn unsupported_host_cpu_is_rejected() {
        let dir = tempdir().unwrap();
        write_checkout(dir.path(), "FUCHSIA_ARCH=x64\n", "[]");
        let host =
            HostEnv::new("linux", "powerpc64").with_var("FUCHSIA_DIR", dir.path().to_str().unwrap());
        match detector(host).detect() {
            Err(DetectionError::UnsupportedHostCpu { cpu, supported }) => {
                assert_eq!(cpu, "powerpc64");
                assert_eq!(supported, vec!["aarch64", "x86_64"]);
            }
            other => panic!("Expected UnsupportedHostCpu, got {other:?}"),
        }
    }

    #[test]
    fn short_ssh_manifest_reports_line_counts() {
        let dir = tempdir().unwrap();
        write_checkout(dir.path(), "FUCHSIA_ARCH=x64\n", "[]");
        fs::write(dir.path().join(".fx-ssh-path"), "/keys/pkey\n").unwrap();
        let err = detector(host_for(dir.path())).detect().unwrap_err();
        match &err {
            DetectionError::SshManifestTooShort {
                expected, found, ..
            } => {
                assert_eq!(*expected, 2);
                assert_eq!(*found, 1);
            }
            other => panic!("Expected SshManifestTooShort, got {other:?}"),
        }
        assert!(err.to_string().contains("found 1"));
    }

    #[test]
    fn empty_ssh_manifest_reports_zero_lines() {
        let dir = tempdir().unwrap();
        write_checkout(dir.path(), "FUCHSIA_ARCH=x64\n", "[]");
        fs::write(dir.path().join(".fx-ssh-path"), "").unwrap();
        let err = detector(host_for(dir.path())).detect().unwrap_err();
        assert!(
            err.to_string().contains("expected 2 lines") && err.to_string().contains("found 0"),
            "Unexpected message: {err}"
        );
    }

    #[test]
    fn missing_ssh_manifest_names_the_file() {
        let dir = tempdir().unwrap();
        write_checkout(dir.path(), "FUCHSIA_ARCH=x64\n", "[]");
        fs::remove_file(dir.path().join(".fx-ssh-path")).unwrap();
        let err = detector(host_for(dir.path())).detect().unwrap_err();
        assert!(err.to_string().contains(".fx-ssh-path"), "Unexpected message: {err}");
    }

    #[test]
    fn with_suffix_extends_last_component() {
        assert_eq!(
            with_suffix(Path::new("/src/out/default"), ".zircon"),
            PathBuf::from("/src/out/default.zircon")
        );
    }
}
