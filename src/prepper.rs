//! Per-dataset update preparation sessions.
//!
//! An [`UpdatePrepService`] holds what all sessions share (the head bag cache,
//! the metadata service, the long-term store); [`UpdatePrepService::prepper_for`]
//! binds those to one dataset identifier, yielding an [`UpdatePrepper`].

use std::fs;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::{Map, Value, json};
use tracing::Span;

use crate::bag::{BagBuilderFactory, NerdmBagBuilderFactory};
use crate::bagname::{bags_for_aipid, find_latest_head_bag, select_version};
use crate::cache::HeadBagCache;
use crate::config::PrepConfig;
use crate::distrib::{DistribClient, DistribHttpClient};
use crate::domain::{AipId, NO_VERSION, PrepOutcome, VersionSource};
use crate::error::PrepError;
use crate::nerdm::{merge_json, read_nerd, str_field, strip_ark_prefix, write_json};
use crate::resolver::{VersionResolver, list_file_names};
use crate::rmm::{MetadataClient, MetadataHttpClient, RecordCache};
use crate::transform::BagTransformer;

/// Subdirectory of the head bag cache holding published NERDm records.
pub const RECORD_CACHE_DIR: &str = "_nerd";

pub struct UpdatePrepService<D: DistribClient, M: MetadataClient> {
    config: PrepConfig,
    cacher: Arc<HeadBagCache<D>>,
    metadata: Option<Arc<M>>,
    builder: Arc<dyn BagBuilderFactory>,
    interrupt: Option<Arc<AtomicBool>>,
}

impl UpdatePrepService<DistribHttpClient, MetadataHttpClient> {
    /// Build the service with HTTP clients for the configured endpoints.
    pub fn from_config(config: PrepConfig) -> Result<Self, PrepError> {
        let endpoint = config.distrib_endpoint.as_deref().ok_or_else(|| {
            PrepError::Config("missing property: distrib_service.service_endpoint".to_string())
        })?;
        let distrib = DistribHttpClient::new(endpoint, config.http_timeout)?;
        let metadata = config
            .metadata_endpoint
            .as_deref()
            .map(|endpoint| MetadataHttpClient::new(endpoint, config.http_timeout))
            .transpose()?;
        Self::new(config, distrib, metadata)
    }
}

impl<D: DistribClient, M: MetadataClient> UpdatePrepService<D, M> {
    pub fn new(config: PrepConfig, distrib: D, metadata: Option<M>) -> Result<Self, PrepError> {
        let cacher = HeadBagCache::new(distrib, &config.headbag_cache, None)?;
        Ok(Self {
            config,
            cacher: Arc::new(cacher),
            metadata: metadata.map(Arc::new),
            builder: Arc::new(NerdmBagBuilderFactory),
            interrupt: None,
        })
    }

    /// Use a different bag construction engine for the sessions created.
    pub fn with_builder(mut self, builder: Arc<dyn BagBuilderFactory>) -> Self {
        self.builder = builder;
        self
    }

    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }

    pub fn config(&self) -> &PrepConfig {
        &self.config
    }

    pub fn cacher(&self) -> &HeadBagCache<D> {
        &self.cacher
    }

    /// Create a session for one dataset. `version` pins the version to build
    /// from; `replaces` names the identifier the dataset was published under
    /// before, if it changed. Without a `span`, the session logs under
    /// `prepupd` tagged with a shortened identifier.
    pub fn prepper_for(
        &self,
        aipid: &str,
        version: Option<&str>,
        replaces: Option<&str>,
        span: Option<Span>,
    ) -> Result<UpdatePrepper<D, M>, PrepError> {
        let aipid: AipId = aipid.parse()?;
        let prev_aipid = replaces
            .filter(|prev| !prev.is_empty())
            .map(str::parse::<AipId>)
            .transpose()?
            .filter(|prev| prev != &aipid);
        let span = span.unwrap_or_else(|| tracing::info_span!("prepupd", aipid = %aipid.short()));

        let records = RecordCache::new(
            &self.config.headbag_cache.join(RECORD_CACHE_DIR),
            self.metadata.clone(),
        )?;
        let mut transformer = BagTransformer::new(self.builder.clone())
            .with_ark_naan(self.config.ark_naan.clone())
            .with_pdr_server(self.config.pdr_server.clone());
        if let Some(flag) = &self.interrupt {
            transformer = transformer.with_interrupt(flag.clone());
        }

        Ok(UpdatePrepper {
            aipid,
            prev_aipid,
            version: version.filter(|v| !v.is_empty()).map(str::to_string),
            cacher: self.cacher.clone(),
            records,
            store_dir: self.config.store_dir.clone(),
            transformer,
            bagger_md_file: self.config.bagger_metadata_file.clone(),
            span,
        })
    }
}

/// Where a session found the prior state of its dataset.
struct PriorVersion {
    record: Option<Utf8PathBuf>,
    latest_aipid: String,
    headbag: Option<Utf8PathBuf>,
}

/// Restores the latest preserved state of one dataset and turns it into a
/// working bag for the next version.
pub struct UpdatePrepper<D: DistribClient, M: MetadataClient> {
    aipid: AipId,
    prev_aipid: Option<AipId>,
    version: Option<String>,
    cacher: Arc<HeadBagCache<D>>,
    records: RecordCache<M>,
    store_dir: Option<Utf8PathBuf>,
    transformer: BagTransformer,
    bagger_md_file: Utf8PathBuf,
    span: Span,
}

impl<D: DistribClient, M: MetadataClient> UpdatePrepper<D, M> {
    pub fn aipid(&self) -> &str {
        self.aipid.as_str()
    }

    pub fn prev_aipid(&self) -> Option<&str> {
        self.prev_aipid.as_ref().map(AipId::as_str)
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Ensure the head bag for this dataset is in the cache and return its
    /// path. Falls back to the latest head bag of the predecessor identifier.
    pub fn cache_headbag(&self) -> Result<Option<Utf8PathBuf>, PrepError> {
        let _entered = self.span.enter();
        if let Some(path) = self.cache_headbag_for(self.aipid(), self.version.as_deref())? {
            return Ok(Some(path));
        }
        match self.prev_aipid() {
            Some(prev) => self.cache_headbag_for(prev, None),
            None => Ok(None),
        }
    }

    /// A corrupted download is purged by the cache; fetch it once more
    /// before giving up.
    fn cache_headbag_for(&self, aipid: &str, version: Option<&str>) -> Result<Option<Utf8PathBuf>, PrepError> {
        match self.cacher.cache_headbag(aipid, version, true) {
            Err(PrepError::CorruptedBag { path, reason, .. }) => {
                tracing::warn!(aipid, %path, %reason, "retrying head bag fetch");
                self.cacher.cache_headbag(aipid, version, true)
            }
            other => other,
        }
    }

    /// Ensure a cached copy of the published NERDm record and return its
    /// path. Unless `shallow`, a dataset that was never published under its
    /// own identifier falls back to its predecessor's record.
    pub fn cache_nerdm_rec(&self, shallow: bool) -> Result<Option<Utf8PathBuf>, PrepError> {
        let _entered = self.span.enter();
        if let Some(path) = self.records.cache_record(self.aipid())? {
            return Ok(Some(path));
        }
        match self.prev_aipid() {
            Some(prev) if !shallow => self.records.cache_record(prev),
            _ => Ok(None),
        }
    }

    /// The latest head bag for a version of `aipid` in the long-term bag
    /// store, if a store is configured and holds one.
    pub fn find_bag_in_store(&self, aipid: &str, version: &str) -> Result<Option<Utf8PathBuf>, PrepError> {
        let Some(store) = &self.store_dir else {
            return Ok(None);
        };
        if !store.as_std_path().is_dir() {
            tracing::warn!(%store, "bag store directory not found");
            return Ok(None);
        }
        let names = list_file_names(store)?;
        let candidates = select_version(&bags_for_aipid(&names, aipid), version);
        Ok(find_latest_head_bag(&candidates).map(|name| store.join(name)))
    }

    /// True if the dataset has a published record. With `deep`, a record
    /// under the predecessor identifier also counts.
    pub fn aip_exists(&self, deep: bool) -> Result<bool, PrepError> {
        Ok(self.cache_nerdm_rec(!deep)?.is_some())
    }

    pub fn version_resolver(&self) -> VersionResolver<'_, M> {
        VersionResolver::new(
            self.aipid(),
            self.prev_aipid(),
            self.store_dir.as_deref(),
            self.cacher.cache_dir(),
            &self.records,
        )
    }

    pub fn latest_version(&self, sources: &[VersionSource]) -> Result<String, PrepError> {
        let _entered = self.span.enter();
        self.version_resolver().latest_version(sources)
    }

    /// Build a working bag at `destbag` for the next version of the dataset,
    /// from its latest head bag if one was preserved and otherwise from its
    /// published record. A bag already at `destbag` is taken to be left over
    /// from an earlier attempt and is replaced.
    pub fn create_new_update(&self, destbag: &Utf8Path) -> Result<PrepOutcome, PrepError> {
        let _entered = self.span.enter();
        if destbag.as_std_path().exists() {
            tracing::warn!(%destbag, "removing existing metadata bag (may indicate earlier failure)");
            remove_tree(destbag)?;
        }

        let prior = self.find_prior_version()?;
        let for_aip = (prior.latest_aipid != self.aipid()).then(|| self.aipid());
        if for_aip.is_some() {
            tracing::info!(
                latest_aipid = %prior.latest_aipid,
                "previously published dataset being revised with new EDI ID"
            );
            let stale = destbag
                .parent()
                .map(|parent| parent.join(&prior.latest_aipid))
                .filter(|stale| stale.as_std_path().exists());
            if let Some(stale) = stale {
                tracing::warn!(%stale, "removing existing metadata bag for previous id");
                remove_tree(&stale)?;
            }
        }

        let outcome = if let Some(headbag) = &prior.headbag {
            tracing::info!(
                headbag = headbag.file_name().unwrap_or(headbag.as_str()),
                "preparing update based on previous head preservation bag"
            );
            self.transformer.create_from_headbag(headbag, destbag, for_aip)?;
            PrepOutcome::FromHeadBag(destbag.to_path_buf())
        } else if let Some(record) = &prior.record {
            tracing::info!("no previous bag available; preparing based on published NERDm record");
            self.transformer.create_from_nerdm(record, destbag, for_aip)?;
            PrepOutcome::FromRecord(destbag.to_path_buf())
        } else {
            tracing::info!("ID not published previously; will start afresh");
            return Ok(PrepOutcome::NoPriorVersion);
        };

        if for_aip.is_some() {
            self.update_bagger_metadata(destbag, &json!({"replacedEDI": prior.latest_aipid}))?;
        }
        Ok(outcome)
    }

    /// Copy the multibag control files of the latest head bag into the
    /// existing bag at `destbag`. Returns false, leaving the bag unchanged,
    /// when no head bag exists.
    pub fn set_multibag_info(&self, destbag: &Utf8Path) -> Result<bool, PrepError> {
        let _entered = self.span.enter();
        let prior = self.find_prior_version()?;
        let Some(headbag) = prior.headbag else {
            tracing::info!("no previous bag available; multibag info not initialized");
            return Ok(false);
        };
        tracing::info!(%headbag, "updating multibag info from previous head preservation bag");
        self.transformer.update_multibag_info(&headbag, destbag)?;
        Ok(true)
    }

    /// The published record, the identifier it was published under, and the
    /// head bag to build from: the store first, then the cache.
    fn find_prior_version(&self) -> Result<PriorVersion, PrepError> {
        let record = self.cache_nerdm_rec(false)?;
        let (latest_aipid, version) = match &record {
            Some(path) => {
                let nerd = read_nerd(path)?;
                let latest_aipid = str_field(&nerd, "ediid")
                    .map(strip_ark_prefix)
                    .unwrap_or(self.aipid())
                    .to_string();
                let version = self
                    .version
                    .clone()
                    .or_else(|| str_field(&nerd, "version").map(str::to_string))
                    .unwrap_or_else(|| NO_VERSION.to_string());
                (latest_aipid, version)
            }
            None => (
                self.aipid().to_string(),
                self.version.clone().unwrap_or_else(|| NO_VERSION.to_string()),
            ),
        };

        let headbag = match self.find_bag_in_store(&latest_aipid, &version)? {
            Some(found) => Some(found),
            None => self.cache_headbag()?,
        };
        Ok(PriorVersion {
            record,
            latest_aipid,
            headbag,
        })
    }

    fn update_bagger_metadata(&self, bagdir: &Utf8Path, update: &Value) -> Result<(), PrepError> {
        let path = bagdir.join(&self.bagger_md_file);
        let mut mdata = if path.as_std_path().exists() {
            read_nerd(&path)?
        } else {
            Value::Object(Map::new())
        };
        merge_json(update, &mut mdata);
        write_json(&path, &mdata)
    }
}

fn remove_tree(path: &Utf8Path) -> Result<(), PrepError> {
    let result = if path.as_std_path().is_dir() {
        fs::remove_dir_all(path.as_std_path())
    } else {
        fs::remove_file(path.as_std_path())
    };
    result.map_err(|err| PrepError::fs(format!("remove {path}"), err))
}
