// Package Set Domain Model

use crate::domain::error::{DomainError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Requested change for a single package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PackageMode {
    Install,
    Remove,
    Purge,
    Upgrade,
    Reinstall,
    Downgrade,
    Keep,
}

impl std::fmt::Display for PackageMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PackageMode::Install => "INSTALL",
            PackageMode::Remove => "REMOVE",
            PackageMode::Purge => "PURGE",
            PackageMode::Upgrade => "UPGRADE",
            PackageMode::Reinstall => "REINSTALL",
            PackageMode::Downgrade => "DOWNGRADE",
            PackageMode::Keep => "KEEP",
        };
        f.write_str(s)
    }
}

/// Package name -> requested mode.
///
/// Keys are unique and iteration order is by name. The set cannot be
/// changed once built; every constructor validates package names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<String, PackageMode>",
    into = "BTreeMap<String, PackageMode>"
)]
pub struct PackageSet(BTreeMap<String, PackageMode>);

impl PackageSet {
    /// Empty set (cache refresh transactions)
    pub fn empty() -> Self {
        Self(BTreeMap::new())
    }

    pub fn new(entries: BTreeMap<String, PackageMode>) -> Result<Self> {
        for name in entries.keys() {
            validate_name(name)?;
        }
        Ok(Self(entries))
    }

    /// Build a set where every package shares the same mode
    pub fn with_mode<I, S>(names: I, mode: PackageMode) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entries = names.into_iter().map(|n| (n.into(), mode)).collect();
        Self::new(entries)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn mode(&self, name: &str) -> Option<PackageMode> {
        self.0.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, PackageMode)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn as_map(&self) -> &BTreeMap<String, PackageMode> {
        &self.0
    }
}

impl TryFrom<BTreeMap<String, PackageMode>> for PackageSet {
    type Error = DomainError;

    fn try_from(entries: BTreeMap<String, PackageMode>) -> Result<Self> {
        Self::new(entries)
    }
}

impl From<PackageSet> for BTreeMap<String, PackageMode> {
    fn from(set: PackageSet) -> Self {
        set.0
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(DomainError::ValidationError(
            "package name cannot be empty".to_string(),
        ));
    }
    if name.chars().any(char::is_whitespace) {
        return Err(DomainError::ValidationError(format!(
            "package name contains whitespace: {:?}",
            name
        )));
    }
    Ok(())
}
