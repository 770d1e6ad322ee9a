use std::fmt;
use std::str::FromStr;

use camino::Utf8PathBuf;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::PrepError;
use crate::nerdm::strip_ark_prefix;

/// Version label meaning "no known version".
pub const NO_VERSION: &str = "0";

/// Identifier of a dataset's archival package lineage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AipId(String);

impl AipId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form used to label log spans.
    pub fn short(&self) -> String {
        match self.0.char_indices().nth(8) {
            Some((end, _)) => format!("{}...", &self.0[..end]),
            None => self.0.clone(),
        }
    }
}

impl fmt::Display for AipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AipId {
    type Err = PrepError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = strip_ark_prefix(value.trim());
        let is_valid = !normalized.is_empty()
            && normalized != "."
            && normalized != ".."
            && !normalized
                .chars()
                .any(|ch| ch == '/' || ch == '\\' || ch.is_whitespace());
        if !is_valid {
            return Err(PrepError::InvalidAipId(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

/// A place the latest version of a dataset can be learned from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum VersionSource {
    /// the public metadata service
    Repo,
    /// the long-term bag storage directory
    BagStore,
    /// the serialized head-bag cache
    BagCache,
    /// the local copy of published NERDm records
    NerdmCache,
}

impl fmt::Display for VersionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionSource::Repo => write!(f, "repo"),
            VersionSource::BagStore => write!(f, "bag-store"),
            VersionSource::BagCache => write!(f, "bag-cache"),
            VersionSource::NerdmCache => write!(f, "nerdm-cache"),
        }
    }
}

impl FromStr for VersionSource {
    type Err = PrepError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "repo" => Ok(VersionSource::Repo),
            "bag-store" => Ok(VersionSource::BagStore),
            "bag-cache" => Ok(VersionSource::BagCache),
            "nerdm-cache" => Ok(VersionSource::NerdmCache),
            other => Err(PrepError::UnknownVersionSource(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChecksumAlgorithm {
    Tag(String),
    Described { tag: String },
}

impl ChecksumAlgorithm {
    pub fn tag(&self) -> &str {
        match self {
            ChecksumAlgorithm::Tag(tag) => tag,
            ChecksumAlgorithm::Described { tag } => tag,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    pub algorithm: ChecksumAlgorithm,
    pub hash: String,
}

impl Checksum {
    pub fn sha256(hash: impl Into<String>) -> Self {
        Self {
            algorithm: ChecksumAlgorithm::Tag("sha256".to_string()),
            hash: hash.into(),
        }
    }
}

/// Description of one serialized head bag as reported by the distribution
/// service and remembered in the local head-bag index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeadBagInfo {
    pub name: String,
    pub aipid: String,
    #[serde(default)]
    pub since_version: String,
    pub checksum: Checksum,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// How a working metadata bag came to be (or why it did not).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrepOutcome {
    FromHeadBag(Utf8PathBuf),
    FromRecord(Utf8PathBuf),
    NoPriorVersion,
}

impl PrepOutcome {
    pub fn is_prepared(&self) -> bool {
        !matches!(self, PrepOutcome::NoPriorVersion)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_aipid_strips_ark_prefix() {
        let id: AipId = "ark:/88434/mds2-2106".parse().unwrap();
        assert_eq!(id.as_str(), "mds2-2106");
    }

    #[test]
    fn parse_aipid_invalid() {
        let err = "../etc".parse::<AipId>().unwrap_err();
        assert_matches!(err, PrepError::InvalidAipId(_));
        assert!("".parse::<AipId>().is_err());
    }

    #[test]
    fn short_label() {
        let id: AipId = "ABCDEF0123456789".parse().unwrap();
        assert_eq!(id.short(), "ABCDEF01...");
    }

    #[test]
    fn short_label_keeps_whole_characters() {
        let id: AipId = "aaaäääöööü".parse().unwrap();
        assert_eq!(id.short(), "aaaäääöö...");
        let id: AipId = "aaaäää".parse().unwrap();
        assert_eq!(id.short(), "aaaäää");
    }

    #[test]
    fn version_source_labels() {
        for label in ["repo", "bag-store", "bag-cache", "nerdm-cache"] {
            let source: VersionSource = label.parse().unwrap();
            assert_eq!(source.to_string(), label);
        }
        assert_matches!(
            "bogus".parse::<VersionSource>(),
            Err(PrepError::UnknownVersionSource(_))
        );
    }

    #[test]
    fn headbag_info_reads_described_algorithm() {
        let raw = r#"{
            "name": "mds2-2106.1_0_0.mbag0_4-0.zip",
            "aipid": "mds2-2106",
            "sinceVersion": "1.0.0",
            "contentLength": 9841,
            "checksum": {"algorithm": {"@type": "Thing", "tag": "sha256"}, "hash": "abc"}
        }"#;
        let info: HeadBagInfo = serde_json::from_str(raw).unwrap();
        assert_eq!(info.checksum.algorithm.tag(), "sha256");
        assert_eq!(info.since_version, "1.0.0");
        assert_eq!(info.extra.get("contentLength"), Some(&Value::from(9841)));
    }
}
