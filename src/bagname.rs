//! The naming convention for stored and cached head bags:
//! `<aipid>.<version>.<mbag profile>-<sequence>[.<ext>]`, e.g.
//! `mds2-2106.1_2_0.mbag0_4-3.zip`. Legacy bags omit the version segment
//! (`mds2-2106.mbag0_2-0.zip`) and stand for the first release.

use std::sync::LazyLock;

use regex::Regex;

/// Suffix of the checksum sidecar file that sits next to a stored bag.
pub const CHECKSUM_SIDECAR_EXT: &str = ".sha256";

static BAG_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\w[\w\-]*)\.(\d+(?:_\d+)*)\.(mbag\d+_\d+)-(\d+)(\..+)?$").unwrap()
});
static LEGACY_BAG_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\w[\w\-]*)\.(mbag\d+_\d+)-(\d+)(\..+)?$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BagName {
    pub aipid: String,
    /// version segment as it appears in the name (`1_2_0`); empty for legacy names
    pub version: String,
    pub profile: String,
    pub sequence: u64,
    pub extension: Option<String>,
}

impl BagName {
    /// The version segment with its separators normalized to dots.
    pub fn dotted_version(&self) -> String {
        self.version.replace('_', ".")
    }
}

pub fn parse_bag_name(name: &str) -> Option<BagName> {
    if let Some(caps) = BAG_NAME_RE.captures(name) {
        return Some(BagName {
            aipid: caps[1].to_string(),
            version: caps[2].to_string(),
            profile: caps[3].to_string(),
            sequence: caps[4].parse().ok()?,
            extension: caps.get(5).map(|m| m.as_str().to_string()),
        });
    }
    let caps = LEGACY_BAG_NAME_RE.captures(name)?;
    Some(BagName {
        aipid: caps[1].to_string(),
        version: String::new(),
        profile: caps[2].to_string(),
        sequence: caps[3].parse().ok()?,
        extension: caps.get(4).map(|m| m.as_str().to_string()),
    })
}

pub fn is_checksum_sidecar(name: &str) -> bool {
    name.ends_with(CHECKSUM_SIDECAR_EXT)
}

/// Names that belong to the given dataset, sidecars excluded.
pub fn bags_for_aipid<'a, I>(names: I, aipid: &str) -> Vec<String>
where
    I: IntoIterator<Item = &'a String>,
{
    let prefix = format!("{aipid}.");
    names
        .into_iter()
        .filter(|name| name.starts_with(&prefix) && !is_checksum_sidecar(name))
        .cloned()
        .collect()
}

/// Restrict `names` to the bags for one version. An unknown version ("0" or
/// empty) selects everything; legacy un-versioned bags answer for version 1.
pub fn select_version(names: &[String], version: &str) -> Vec<String> {
    let wanted = normalize_version(version);
    if wanted.is_empty() || wanted == "0" {
        return names.to_vec();
    }
    let selected: Vec<String> = names
        .iter()
        .filter(|name| {
            parse_bag_name(name)
                .map(|parsed| normalize_version(&parsed.version) == wanted)
                .unwrap_or(false)
        })
        .cloned()
        .collect();
    if !selected.is_empty() || wanted != "1" {
        return selected;
    }
    names
        .iter()
        .filter(|name| {
            parse_bag_name(name)
                .map(|parsed| parsed.version.is_empty())
                .unwrap_or(false)
        })
        .cloned()
        .collect()
}

/// The head bag is the one with the highest multibag sequence number.
pub fn find_latest_head_bag(names: &[String]) -> Option<&str> {
    names
        .iter()
        .filter_map(|name| parse_bag_name(name).map(|parsed| (parsed.sequence, name)))
        .max_by_key(|(sequence, _)| *sequence)
        .map(|(_, name)| name.as_str())
}

fn normalize_version(version: &str) -> String {
    let mut parts: Vec<&str> = version
        .split(['.', '_'])
        .filter(|part| !part.is_empty())
        .collect();
    while parts.len() > 1 && parts.last() == Some(&"0") {
        parts.pop();
    }
    parts.join(".")
}
