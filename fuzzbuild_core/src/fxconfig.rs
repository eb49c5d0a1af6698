//! Parsers for the small text files a local checkout leaves behind:
//! `fx.config` (shell-style `KEY=value` assignments) and `.fx-ssh-path`
//! (private key path, then authorized keys path).

use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;
use thiserror::Error;

/// Number of lines an SSH manifest must carry.
pub const SSH_MANIFEST_LINES: usize = 2;

fn property_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([^=]+)=(?:'([^']*)'|(.*))$").expect("fx.config property regex")
    })
}

/// Parses `KEY=value` and `KEY='value'` lines into a property table.
///
/// Lines that are not assignments are skipped. When a key repeats, the last
/// assignment wins.
pub fn parse_properties(contents: &str) -> HashMap<String, String> {
    let re = property_regex();
    let mut properties = HashMap::new();
    for line in contents.lines() {
        let Some(caps) = re.captures(line) else {
            continue;
        };
        let value = caps
            .get(2)
            .or_else(|| caps.get(3))
            .map_or("", |m| m.as_str());
        properties.insert(caps[1].to_string(), value.to_string());
    }
    properties
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("expected {expected} lines, found {found}")]
pub struct ManifestTooShort {
    pub expected: usize,
    pub found: usize,
}

/// The two entries of an SSH manifest, in file order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshKeyPaths {
    pub private_key: String,
    pub authorized_keys: String,
}

pub fn parse_ssh_manifest(contents: &str) -> Result<SshKeyPaths, ManifestTooShort> {
    let mut lines = contents.lines();
    match (lines.next(), lines.next()) {
        (Some(private_key), Some(authorized_keys)) => Ok(SshKeyPaths {
            private_key: private_key.to_string(),
            authorized_keys: authorized_keys.to_string(),
        }),
        (found_first, _) => Err(ManifestTooShort {
            expected: SSH_MANIFEST_LINES,
            found: usize::from(found_first.is_some()),
        }),
    }
}
