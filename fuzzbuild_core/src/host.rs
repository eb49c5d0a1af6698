use std::collections::HashMap;
use std::env;

/// Emulator and kernel image names for one target architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchInfo {
    pub emulator: &'static str,
    pub kernel: &'static str,
}

/// Host OS name (as reported by `std::env::consts::OS`) to the platform
/// component used in prebuilt directory names.
pub const PLATFORMS: &[(&str, &str)] = &[("linux", "linux"), ("macos", "mac")];

/// Target architectures a local checkout may be configured for.
pub const ARCHS: &[(&str, ArchInfo)] = &[
    (
        "x64",
        ArchInfo {
            emulator: "qemu-system-x86_64",
            kernel: "multiboot.bin",
        },
    ),
    (
        "arm64",
        ArchInfo {
            emulator: "qemu-system-aarch64",
            kernel: "qemu-boot-shim.bin",
        },
    ),
];

/// Host CPU (as reported by `std::env::consts::ARCH`) to the build output
/// directory holding host tools.
pub const HOST_TOOL_DIRS: &[(&str, &str)] = &[("x86_64", "host_x64"), ("aarch64", "host_arm64")];

fn lookup<V: Copy>(table: &[(&'static str, V)], key: &str) -> Option<V> {
    table.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

/// Sorted key list of a static table, for error messages.
pub fn supported<V>(table: &[(&'static str, V)]) -> Vec<String> {
    let mut keys: Vec<String> = table.iter().map(|(k, _)| k.to_string()).collect();
    keys.sort();
    keys
}

pub fn platform_for(os: &str) -> Option<&'static str> {
    lookup(PLATFORMS, os)
}

pub fn arch_info(arch: &str) -> Option<ArchInfo> {
    lookup(ARCHS, arch)
}

pub fn host_tool_dir(cpu: &str) -> Option<&'static str> {
    lookup(HOST_TOOL_DIRS, cpu)
}

/// Snapshot of everything detection reads from the running process: the
/// environment variables plus the host OS and CPU names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEnv {
    vars: HashMap<String, String>,
    os: String,
    cpu: String,
}

impl HostEnv {
    pub fn new(os: impl Into<String>, cpu: impl Into<String>) -> Self {
        Self {
            vars: HashMap::new(),
            os: os.into(),
            cpu: cpu.into(),
        }
    }

    /// Captures the live process environment. Variables whose name or value
    /// is not valid UTF-8 are skipped.
    pub fn from_process() -> Self {
        Self {
            vars: env::vars_os()
                .filter_map(|(name, value)| {
                    Some((name.into_string().ok()?, value.into_string().ok()?))
                })
                .collect(),
            os: env::consts::OS.to_string(),
            cpu: env::consts::ARCH.to_string(),
        }
    }

    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    /// Returns the variable's value if it is set, even when empty.
    pub fn var(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn os(&self) -> &str {
        &self.os
    }

    pub fn cpu(&self) -> &str {
        &self.cpu
    }
}
