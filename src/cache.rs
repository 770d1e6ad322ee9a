use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;

use crate::distrib::DistribClient;
use crate::domain::HeadBagInfo;
use crate::error::PrepError;
use crate::fs_util::{HashAlgorithm, checksum_of, ensure_dir, remove_file_if_exists, write_bytes_atomic};

/// Name of the index subdirectory created under the cache root by default.
pub const INFO_DIR_NAME: &str = "_info";

/// Per-dataset record of known head bags, keyed by version label in the
/// order they were learned.
pub type HeadBagIndex = IndexMap<String, HeadBagInfo>;

/// A local cache of serialized head bags pulled from the distribution
/// service, with an index of what each cached file should hash to.
pub struct HeadBagCache<D: DistribClient> {
    distrib: D,
    cache_dir: Utf8PathBuf,
    info_dir: Utf8PathBuf,
}

impl<D: DistribClient> HeadBagCache<D> {
    pub fn new(
        distrib: D,
        cache_dir: &Utf8Path,
        info_dir: Option<&Utf8Path>,
    ) -> Result<Self, PrepError> {
        let info_dir = info_dir
            .map(Utf8Path::to_path_buf)
            .unwrap_or_else(|| cache_dir.join(INFO_DIR_NAME));
        ensure_dir(cache_dir, "HeadBagCache")?;
        ensure_dir(&info_dir, "HeadBagCache")?;
        Ok(Self {
            distrib,
            cache_dir: cache_dir.to_path_buf(),
            info_dir,
        })
    }

    pub fn cache_dir(&self) -> &Utf8Path {
        &self.cache_dir
    }

    pub fn info_dir(&self) -> &Utf8Path {
        &self.info_dir
    }

    pub fn distrib(&self) -> &D {
        &self.distrib
    }

    /// Ensure a copy of the serialized head bag for a version of a dataset is
    /// in the cache and return its path, or `None` if no such bag was ever
    /// preserved. A version of `None` or `"latest"` asks for the newest.
    pub fn cache_headbag(
        &self,
        aipid: &str,
        version: Option<&str>,
        confirm: bool,
    ) -> Result<Option<Utf8PathBuf>, PrepError> {
        let version = version.filter(|v| !v.is_empty() && *v != "latest");

        let mut info = None;
        if let Some(version) = version {
            let index = self.recall_head_info(aipid)?;
            info = index
                .get(version)
                .filter(|entry| !entry.name.is_empty())
                .cloned();
        }

        let info = match info {
            Some(info) => info,
            None => {
                let Some(info) = self.distrib.describe_head_for_version(aipid, version)? else {
                    tracing::debug!(aipid, ?version, "no head bag known to distribution service");
                    return Ok(None);
                };
                let resolved = match version {
                    Some(version) => version.to_string(),
                    None => info.since_version.clone(),
                };
                self.cache_head_info(aipid, &resolved, &info)?;
                info
            }
        };

        let bagfile = self.bag_path(&info)?;
        if !bagfile.as_std_path().exists() {
            tracing::info!(aipid, name = %info.name, "caching head bag");
            self.distrib.save_bag(&info.name, &self.cache_dir)?;
        }
        if confirm {
            self.confirm_for(aipid, &info, true)?;
        }
        Ok(Some(bagfile))
    }

    /// Check a cached bag against the checksum recorded for it. Any mismatch
    /// or read failure is reported as corruption; with `purge_on_error` the
    /// file and its index entry are removed first.
    pub fn confirm_bagfile(&self, info: &HeadBagInfo, purge_on_error: bool) -> Result<(), PrepError> {
        self.confirm_for(&info.aipid, info, purge_on_error)
    }

    fn confirm_for(
        &self,
        aipid: &str,
        info: &HeadBagInfo,
        purge_on_error: bool,
    ) -> Result<(), PrepError> {
        let bagfile = self.bag_path(info)?;
        let tag = info.checksum.algorithm.tag();
        let algorithm = HashAlgorithm::from_tag(tag).ok_or_else(|| PrepError::UnsupportedChecksum {
            name: info.name.clone(),
            algorithm: tag.to_string(),
        })?;

        let reason = match checksum_of(bagfile.as_std_path(), algorithm) {
            Ok(hash) if hash.eq_ignore_ascii_case(info.checksum.hash.trim()) => return Ok(()),
            Ok(_) => "checksum failure".to_string(),
            Err(err) => format!("failure reading bag file: {err}"),
        };

        tracing::warn!(aipid, path = %bagfile, %reason, "cached head bag looks corrupted");
        if purge_on_error {
            self.clear_from_cache(aipid, &bagfile, Some(info))?;
        }
        Err(PrepError::CorruptedBag {
            aipid: aipid.to_string(),
            path: bagfile,
            reason,
        })
    }

    /// Remove a cached bag file and, if described, its index entries.
    pub fn clear_from_cache(
        &self,
        aipid: &str,
        bagfile: &Utf8Path,
        info: Option<&HeadBagInfo>,
    ) -> Result<(), PrepError> {
        remove_file_if_exists(bagfile)?;
        if let Some(info) = info {
            let mut index = self.recall_head_info(aipid)?;
            let before = index.len();
            index.retain(|version, entry| {
                entry.name != info.name && version.as_str() != info.since_version
            });
            if index.len() != before {
                self.save_head_info(aipid, &index)?;
            }
        }
        Ok(())
    }

    pub fn head_info_file(&self, aipid: &str) -> Utf8PathBuf {
        self.info_dir.join(aipid)
    }

    pub fn recall_head_info(&self, aipid: &str) -> Result<HeadBagIndex, PrepError> {
        let path = self.head_info_file(aipid);
        if !path.as_std_path().exists() {
            return Ok(HeadBagIndex::new());
        }
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| PrepError::fs(format!("read {path}"), err))?;
        serde_json::from_str(&content).map_err(|err| PrepError::json(&path, err))
    }

    pub fn cache_head_info(&self, aipid: &str, version: &str, info: &HeadBagInfo) -> Result<(), PrepError> {
        let mut index = self.recall_head_info(aipid)?;
        index.insert(version.to_string(), info.clone());
        self.save_head_info(aipid, &index)
    }

    fn save_head_info(&self, aipid: &str, index: &HeadBagIndex) -> Result<(), PrepError> {
        let path = self.head_info_file(aipid);
        let content = serde_json::to_vec_pretty(index).map_err(|err| PrepError::json(&path, err))?;
        write_bytes_atomic(&path, &content)
    }

    fn bag_path(&self, info: &HeadBagInfo) -> Result<Utf8PathBuf, PrepError> {
        let name = info.name.as_str();
        if name.is_empty() || name.contains('/') || name.contains('\\') || name == "." || name == ".." {
            return Err(PrepError::State(format!(
                "unusable head bag name for id={}: {name:?}",
                info.aipid
            )));
        }
        Ok(self.cache_dir.join(name))
    }
}
