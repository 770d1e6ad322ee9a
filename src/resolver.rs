use std::fs;

use camino::Utf8Path;
use serde_json::Value;

use crate::bagname::{bags_for_aipid, find_latest_head_bag, parse_bag_name};
use crate::domain::{NO_VERSION, VersionSource};
use crate::error::PrepError;
use crate::nerdm::{read_nerd, str_field};
use crate::rmm::{MetadataClient, RecordCache};

/// Version assumed for a head bag whose name predates versioned names.
const UNVERSIONED_BAG_VERSION: &str = "1.0.0";

/// Answers "what is the latest known version of this dataset?" from one or
/// more sources, consulted in the order the caller gives.
pub struct VersionResolver<'a, M: MetadataClient> {
    aipid: &'a str,
    prev_aipid: Option<&'a str>,
    store_dir: Option<&'a Utf8Path>,
    cache_dir: &'a Utf8Path,
    records: &'a RecordCache<M>,
}

impl<'a, M: MetadataClient> VersionResolver<'a, M> {
    pub fn new(
        aipid: &'a str,
        prev_aipid: Option<&'a str>,
        store_dir: Option<&'a Utf8Path>,
        cache_dir: &'a Utf8Path,
        records: &'a RecordCache<M>,
    ) -> Self {
        Self {
            aipid,
            prev_aipid: prev_aipid.filter(|prev| *prev != aipid),
            store_dir,
            cache_dir,
            records,
        }
    }

    /// The first answer other than "0" from `sources`, or "0" if none has one.
    pub fn latest_version(&self, sources: &[VersionSource]) -> Result<String, PrepError> {
        for source in sources {
            let version = match source {
                VersionSource::Repo => self.from_repo()?,
                VersionSource::BagStore => match self.store_dir {
                    Some(dir) => self.from_dir(dir)?,
                    None => NO_VERSION.to_string(),
                },
                VersionSource::BagCache => self.from_dir(self.cache_dir)?,
                VersionSource::NerdmCache => self.from_record_cache()?,
            };
            tracing::debug!(aipid = self.aipid, %source, %version, "version lookup");
            if version != NO_VERSION {
                return Ok(version);
            }
        }
        Ok(NO_VERSION.to_string())
    }

    fn candidates(&self) -> impl Iterator<Item = &'a str> {
        std::iter::once(self.aipid).chain(self.prev_aipid)
    }

    fn from_repo(&self) -> Result<String, PrepError> {
        for aipid in self.candidates() {
            if let Some(record) = self.records.refresh(aipid)? {
                return Ok(version_of(&record));
            }
        }
        Ok(NO_VERSION.to_string())
    }

    fn from_record_cache(&self) -> Result<String, PrepError> {
        for aipid in self.candidates() {
            if let Some(path) = self.records.cached(aipid) {
                return Ok(version_of(&read_nerd(&path)?));
            }
        }
        Ok(NO_VERSION.to_string())
    }

    fn from_dir(&self, dir: &Utf8Path) -> Result<String, PrepError> {
        if !dir.as_std_path().is_dir() {
            tracing::warn!(%dir, "bag directory not found");
            return Ok(NO_VERSION.to_string());
        }
        let names = list_file_names(dir)?;
        let mut bags = Vec::new();
        for aipid in self.candidates() {
            bags = bags_for_aipid(&names, aipid);
            if !bags.is_empty() {
                break;
            }
        }
        let Some(latest) = find_latest_head_bag(&bags) else {
            return Ok(NO_VERSION.to_string());
        };
        let version = parse_bag_name(latest)
            .map(|parsed| parsed.dotted_version())
            .unwrap_or_default();
        if version.is_empty() {
            return Ok(UNVERSIONED_BAG_VERSION.to_string());
        }
        Ok(version)
    }
}

fn version_of(record: &Value) -> String {
    str_field(record, "version").unwrap_or(NO_VERSION).to_string()
}

pub(crate) fn list_file_names(dir: &Utf8Path) -> Result<Vec<String>, PrepError> {
    let entries =
        fs::read_dir(dir.as_std_path()).map_err(|err| PrepError::fs(format!("read dir {dir}"), err))?;
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| PrepError::fs(format!("read dir {dir}"), err))?;
        if let Ok(name) = entry.file_name().into_string() {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}
