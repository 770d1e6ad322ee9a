//! Turns a previously preserved head bag, or a published NERDm record, into
//! an editable metadata bag for the next version of a dataset.

use std::fs;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use camino::Utf8Path;
use serde_json::{Value, json};

use crate::bag::{
    BAG_INFO_FILE, BagBuilderFactory, BuilderGuard, BuilderOptions, DATA_DIR,
    DEPRECATED_INFO_FILE, MULTIBAG_DIR, NistBag,
};
use crate::error::PrepError;
use crate::fs_util::{
    StagingDir, check_interrupt, copy_dir_recursive, extract_zip, extract_zip_entries,
    remove_file_if_exists, zip_entry_names,
};
use crate::nerdm::{
    DEFAULT_ARK_NAAN, is_initial_version, read_nerd, rewrite_ediid, str_field,
    strip_version_suffix, update_nerdm_schema, version_token, write_json,
};

/// Marker appended to a released version while its successor is edited.
pub const EDIT_VERSION_MARKER: &str = "+ (in edit)";
pub const DEFAULT_PDR_SERVER: &str = "data.nist.gov";

/// Bag control files that are regenerated when the bag is finalized.
const REGENERATED_FILES: &[&str] = &["bagit.txt", BAG_INFO_FILE, "about.txt"];

pub struct BagTransformer {
    builder: Arc<dyn BagBuilderFactory>,
    ark_naan: String,
    pdr_server: String,
    interrupt: Option<Arc<AtomicBool>>,
}

impl BagTransformer {
    pub fn new(builder: Arc<dyn BagBuilderFactory>) -> Self {
        Self {
            builder,
            ark_naan: DEFAULT_ARK_NAAN.to_string(),
            pdr_server: DEFAULT_PDR_SERVER.to_string(),
            interrupt: None,
        }
    }

    pub fn with_ark_naan(mut self, naan: impl Into<String>) -> Self {
        self.ark_naan = naan.into();
        self
    }

    pub fn with_pdr_server(mut self, server: impl Into<String>) -> Self {
        self.pdr_server = server.into();
        self
    }

    /// Abort long copies and unpacks between files once `flag` is raised.
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }

    fn interrupt(&self) -> Option<&AtomicBool> {
        self.interrupt.as_deref()
    }

    /// Create an editable metadata bag at `mdbag` from a head bag, either
    /// unpacked (a directory) or serialized (a zip file). `for_aip` names
    /// the dataset identifier the new bag is for when it differs from the
    /// head bag's.
    ///
    /// `mdbag` must not exist; its parent must. Nothing appears at `mdbag`
    /// unless the whole construction succeeds.
    pub fn create_from_headbag(
        &self,
        headbag: &Utf8Path,
        mdbag: &Utf8Path,
        for_aip: Option<&str>,
    ) -> Result<(), PrepError> {
        let (parent, name) = check_destination(mdbag)?;
        if !headbag.as_std_path().exists() {
            return Err(PrepError::State(format!("head bag does not exist: {headbag}")));
        }

        let staging = StagingDir::new_in(parent)?;
        let work = staging.path().join(name);
        if headbag.as_std_path().is_dir() {
            copy_dir_recursive(headbag, &work, self.interrupt())?;
        } else {
            self.unpack_bag_as(headbag, &work, staging.path())?;
        }
        check_interrupt(self.interrupt(), mdbag)?;
        let bag = NistBag::open(&work)?;
        strip_for_update(&bag)?;

        let mut nerdm = bag.nerdm_record()?;
        update_nerdm_schema(&mut nerdm);
        let id = require_id(&nerdm, &bag.nerdm_file_for(""))?;
        if let Some(for_aip) = for_aip {
            self.rewrite_identity(&mut nerdm, for_aip);
        }

        self.build(staging.path(), name, &id, &nerdm)?;
        self.update_version_for_edit(&work)?;
        staging.commit(name, mdbag)?;
        tracing::info!(%headbag, %mdbag, "metadata bag created from head bag");
        Ok(())
    }

    /// Create an editable metadata bag at `mdbag` from a cached NERDm record
    /// for a dataset that has no preserved head bag.
    pub fn create_from_nerdm(
        &self,
        nerdfile: &Utf8Path,
        mdbag: &Utf8Path,
        for_aip: Option<&str>,
    ) -> Result<(), PrepError> {
        let (parent, name) = check_destination(mdbag)?;
        if !nerdfile.as_std_path().is_file() {
            return Err(PrepError::State(format!(
                "cached NERDm record not found: {nerdfile}"
            )));
        }

        let mut nerd = read_nerd(nerdfile)?;
        let id = require_id(&nerd, nerdfile)?;
        update_nerdm_schema(&mut nerd);
        if let Some(for_aip) = for_aip {
            self.rewrite_identity(&mut nerd, for_aip);
        }

        let staging = StagingDir::new_in(parent)?;
        self.build(staging.path(), name, &id, &nerd)?;
        self.update_version_for_edit(&staging.path().join(name))?;
        staging.commit(name, mdbag)?;
        tracing::info!(%nerdfile, %mdbag, "metadata bag created from NERDm record");
        Ok(())
    }

    /// Set the bag's version to its edit-mode form and, the first time a
    /// released version goes into edit, record that release in the
    /// release history. Changes go to the annotations, leaving the base
    /// record as the last published state.
    pub fn update_version_for_edit(&self, bagdir: &Utf8Path) -> Result<(), PrepError> {
        let bag = NistBag::open(bagdir)?;
        let mdata = bag.nerd_metadata_for("", true)?;
        let id = require_id(&mdata, &bag.nerdm_file_for(""))?;
        let oldvers = str_field(&mdata, "version").unwrap_or("1.0.0").to_string();
        let edit_vers = make_edit_version(&oldvers);
        tracing::debug!(%edit_vers, "setting edit version");

        let mut adata = bag.annotations_for("")?;
        let Some(annots) = adata.as_object_mut() else {
            return Err(PrepError::InvalidRecord {
                path: bag.annotations_file_for(""),
                reason: "annotations are not a JSON object".to_string(),
            });
        };
        annots.insert("version".to_string(), json!(edit_vers));

        let issued = str_field(&mdata, "modified")
            .filter(|date| !date.is_empty())
            .or_else(|| str_field(&mdata, "issued"));
        if oldvers != edit_vers
            && let Some(issued) = issued
        {
            let mut relhist = release_history(&mdata, &id);
            let releases = relhist["hasRelease"].as_array_mut();
            if let Some(releases) = releases
                && !releases
                    .iter()
                    .any(|release| str_field(release, "version") == Some(oldvers.as_str()))
            {
                releases.push(self.release_entry(&id, &oldvers, issued));
                annots.insert("releaseHistory".to_string(), relhist);
            }
        }

        write_json(&bag.annotations_file_for(""), &adata)
    }

    /// Copy the multibag control files of `headbag` into the existing bag at
    /// `destbag`. Files already in the destination's multibag directory are
    /// kept unless the head bag has a file of the same name.
    pub fn update_multibag_info(&self, headbag: &Utf8Path, destbag: &Utf8Path) -> Result<(), PrepError> {
        if !destbag.as_std_path().is_dir() {
            return Err(PrepError::State(format!("destination bag not found: {destbag}")));
        }
        let mbdir = destbag.join(MULTIBAG_DIR);
        fs::create_dir_all(mbdir.as_std_path())
            .map_err(|err| PrepError::fs(format!("create {mbdir}"), err))?;

        if headbag.as_std_path().is_dir() {
            let source_mbdir = headbag.join(MULTIBAG_DIR);
            if source_mbdir.as_std_path().is_dir() {
                copy_dir_recursive(&source_mbdir, &mbdir, self.interrupt())?;
            }
            // the head bag's own bag-info.txt supersedes any older deprecated-info.txt
            let baginfo = headbag.join(BAG_INFO_FILE);
            if baginfo.as_std_path().is_file() {
                copy_file(&baginfo, &mbdir.join(DEPRECATED_INFO_FILE))?;
            }
            return Ok(());
        }
        if !headbag.as_std_path().is_file() {
            return Err(PrepError::State(format!("head bag does not exist: {headbag}")));
        }
        require_zip(headbag)?;

        let names = zip_entry_names(headbag)?;
        let first = names
            .iter()
            .find(|name| name.contains("/multibag/"))
            .ok_or_else(|| {
                PrepError::State(format!("no multibag files found in head bag: {headbag}"))
            })?;
        let root = first.split('/').next().unwrap_or_default();
        let baginfo = format!("{root}/{BAG_INFO_FILE}");
        let prefix = format!("{root}/{MULTIBAG_DIR}/");

        let written = extract_zip_entries(headbag, |name| {
            if name == baginfo {
                return Some(mbdir.join(DEPRECATED_INFO_FILE).into_std_path_buf());
            }
            let relative = name.strip_prefix(&prefix)?;
            if relative.is_empty() || relative == DEPRECATED_INFO_FILE {
                return None;
            }
            Some(mbdir.join(relative).into_std_path_buf())
        })?;
        tracing::debug!(%headbag, written, "multibag info propagated");
        Ok(())
    }

    fn unpack_bag_as(
        &self,
        bagfile: &Utf8Path,
        destbag: &Utf8Path,
        scratch: &Utf8Path,
    ) -> Result<(), PrepError> {
        require_zip(bagfile)?;
        let unpack_dir = scratch.join(".unpack");
        fs::create_dir_all(unpack_dir.as_std_path())
            .map_err(|err| PrepError::fs(format!("create {unpack_dir}"), err))?;
        let root = extract_zip(bagfile, &unpack_dir, self.interrupt())?;
        let unpacked = unpack_dir.join(&root);
        if !unpacked.as_std_path().is_dir() {
            return Err(PrepError::State(format!(
                "apparent bag unpack failure; root not created: {unpacked}"
            )));
        }
        fs::rename(unpacked.as_std_path(), destbag.as_std_path())
            .map_err(|err| PrepError::fs(format!("move {unpacked} to {destbag}"), err))
    }

    fn rewrite_identity(&self, record: &mut Value, for_aip: &str) {
        tracing::info!(for_aip, "rewriting EDI identifier for new dataset id");
        let now = chrono::Utc::now().to_rfc3339();
        rewrite_ediid(record, for_aip, &self.ark_naan, &now);
    }

    fn build(&self, parent: &Utf8Path, name: &str, id: &str, record: &Value) -> Result<(), PrepError> {
        let builder = self
            .builder
            .open(parent, name, BuilderOptions { validate_id: false }, id)?;
        let mut builder = BuilderGuard::new(builder);
        builder.add_res_nerd(record, true)?;
        tracing::debug!(bag = %builder.bag_dir(), id, "resource metadata saved");
        Ok(())
    }

    fn release_entry(&self, id: &str, version: &str, issued: &str) -> Value {
        let release_id = format!("{}.v{}", strip_version_suffix(id), version_token(version));
        let mut entry = json!({
            "version": version,
            "issued": issued,
            "@id": release_id,
            "location": format!("https://{}/od/id/{release_id}", self.pdr_server),
        });
        if is_initial_version(version) {
            entry["description"] = json!("initial release");
        }
        entry
    }
}

/// The version label shown while a new release is being edited.
pub fn make_edit_version(prev_vers: &str) -> String {
    if prev_vers.ends_with(EDIT_VERSION_MARKER) {
        prev_vers.to_string()
    } else {
        format!("{prev_vers}{EDIT_VERSION_MARKER}")
    }
}

fn release_history(mdata: &Value, id: &str) -> Value {
    let mut relhist = match mdata.get("releaseHistory") {
        Some(existing) if existing.is_object() => existing.clone(),
        _ => json!({
            "@id": format!("{id}.rel"),
            "@type": ["nrdr:ReleaseHistory"],
            "hasRelease": mdata.get("versionHistory").cloned().unwrap_or_else(|| json!([])),
        }),
    };
    if !relhist["hasRelease"].is_array() {
        relhist["hasRelease"] = json!([]);
    }
    relhist
}

fn check_destination(mdbag: &Utf8Path) -> Result<(&Utf8Path, &str), PrepError> {
    if mdbag.as_std_path().exists() {
        return Err(PrepError::State(format!("metadata bag already exists: {mdbag}")));
    }
    let name = mdbag
        .file_name()
        .ok_or_else(|| PrepError::State(format!("not a usable bag path: {mdbag}")))?;
    let parent = mdbag
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or(Utf8Path::new("."));
    if !parent.as_std_path().is_dir() {
        return Err(PrepError::State(format!(
            "metadata bag working space does not exist: {parent}"
        )));
    }
    Ok((parent, name))
}

fn require_id(record: &Value, path: &Utf8Path) -> Result<String, PrepError> {
    match str_field(record, "@id") {
        Some(id) if !id.is_empty() => Ok(id.to_string()),
        _ => Err(PrepError::InvalidRecord {
            path: path.to_path_buf(),
            reason: "missing @id".to_string(),
        }),
    }
}

fn require_zip(bagfile: &Utf8Path) -> Result<(), PrepError> {
    if bagfile.extension() != Some("zip") {
        return Err(PrepError::State(format!(
            "don't know how to unpack serialized bag: {}",
            bagfile.file_name().unwrap_or(bagfile.as_str())
        )));
    }
    Ok(())
}

/// Keep the old bag-info.txt as multibag/deprecated-info.txt, then clear the
/// payload and the control files the builder will regenerate.
fn strip_for_update(bag: &NistBag) -> Result<(), PrepError> {
    let bagdir = bag.dir();
    let mbdir = bagdir.join(MULTIBAG_DIR);
    fs::create_dir_all(mbdir.as_std_path())
        .map_err(|err| PrepError::fs(format!("create {mbdir}"), err))?;
    let baginfo = bag.bag_info_file();
    if baginfo.as_std_path().is_file() {
        copy_file(&baginfo, &mbdir.join(DEPRECATED_INFO_FILE))?;
    } else {
        tracing::warn!(%bagdir, "head bag has no bag-info.txt");
    }

    let datadir = bagdir.join(DATA_DIR);
    if datadir.as_std_path().exists() {
        fs::remove_dir_all(datadir.as_std_path())
            .map_err(|err| PrepError::fs(format!("remove {datadir}"), err))?;
    }
    fs::create_dir(datadir.as_std_path())
        .map_err(|err| PrepError::fs(format!("create {datadir}"), err))?;

    let entries = fs::read_dir(bagdir.as_std_path())
        .map_err(|err| PrepError::fs(format!("read dir {bagdir}"), err))?;
    for entry in entries {
        let entry = entry.map_err(|err| PrepError::fs(format!("read dir {bagdir}"), err))?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        let is_manifest = (name.starts_with("manifest-") || name.starts_with("tagmanifest-"))
            && name.ends_with(".txt");
        if is_manifest || REGENERATED_FILES.contains(&name.as_str()) {
            remove_file_if_exists(&bagdir.join(&name))?;
        }
    }
    Ok(())
}

fn copy_file(source: &Utf8Path, dest: &Utf8Path) -> Result<(), PrepError> {
    fs::copy(source.as_std_path(), dest.as_std_path())
        .map(|_| ())
        .map_err(|err| PrepError::fs(format!("copy {source} to {dest}"), err))
}
