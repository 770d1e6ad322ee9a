//! Access to the on-disk structure of a NIST preservation bag: a reader for
//! the NERDm metadata it embeds, and the builder interface used to write
//! metadata into a working bag.
//!
//! Layout:
//! ```text
//! <bag>/bag-info.txt
//! <bag>/data/...
//! <bag>/metadata/nerdm.json            resource-level record
//! <bag>/metadata/annot.json            resource-level annotations
//! <bag>/metadata/<filepath>/nerdm.json per-component records
//! <bag>/multibag/...
//! ```

use std::fs::{self, File};
use std::io::Write;
use std::ops::{Deref, DerefMut};
use std::sync::LazyLock;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde_json::{Map, Value};

use crate::error::PrepError;
use crate::nerdm::{merge_annotations, read_nerd, write_json};

pub const METADATA_DIR: &str = "metadata";
pub const DATA_DIR: &str = "data";
pub const MULTIBAG_DIR: &str = "multibag";
pub const NERDM_FILE: &str = "nerdm.json";
pub const ANNOTATIONS_FILE: &str = "annot.json";
pub const BAG_INFO_FILE: &str = "bag-info.txt";
pub const DEPRECATED_INFO_FILE: &str = "deprecated-info.txt";
pub const BUILDER_LOG_FILE: &str = "preserv.log";

static ARK_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^ark:/\d+/[\w\-]+(\.v\d+(_\d+)*)?$").unwrap());

/// Read-only view of an unpacked bag.
#[derive(Debug, Clone)]
pub struct NistBag {
    dir: Utf8PathBuf,
}

impl NistBag {
    pub fn open(dir: &Utf8Path) -> Result<Self, PrepError> {
        if !dir.as_std_path().is_dir() {
            return Err(PrepError::State(format!("bag directory not found: {dir}")));
        }
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    pub fn bag_info_file(&self) -> Utf8PathBuf {
        self.dir.join(BAG_INFO_FILE)
    }

    pub fn metadata_dir_for(&self, filepath: &str) -> Utf8PathBuf {
        let base = self.dir.join(METADATA_DIR);
        if filepath.is_empty() {
            base
        } else {
            base.join(filepath)
        }
    }

    pub fn nerdm_file_for(&self, filepath: &str) -> Utf8PathBuf {
        self.metadata_dir_for(filepath).join(NERDM_FILE)
    }

    pub fn annotations_file_for(&self, filepath: &str) -> Utf8PathBuf {
        self.metadata_dir_for(filepath).join(ANNOTATIONS_FILE)
    }

    /// Annotations for one node; an absent file reads as an empty object.
    pub fn annotations_for(&self, filepath: &str) -> Result<Value, PrepError> {
        let path = self.annotations_file_for(filepath);
        if !path.as_std_path().exists() {
            return Ok(Value::Object(Map::new()));
        }
        read_nerd(&path)
    }

    pub fn nerd_metadata_for(&self, filepath: &str, merge_annots: bool) -> Result<Value, PrepError> {
        let path = self.nerdm_file_for(filepath);
        if !path.as_std_path().exists() {
            return Err(PrepError::State(format!("no NERDm metadata in bag: {path}")));
        }
        let base = read_nerd(&path)?;
        if !merge_annots {
            return Ok(base);
        }
        Ok(merge_annotations(&base, &self.annotations_for(filepath)?))
    }

    /// The full resource record: resource-level metadata plus every
    /// component saved under the metadata tree.
    pub fn nerdm_record(&self) -> Result<Value, PrepError> {
        let mut record = self.nerd_metadata_for("", false)?;
        let mut components = record
            .get("components")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let metadata_root = self.metadata_dir_for("");
        let mut found = Vec::new();
        collect_component_files(&metadata_root, &mut found)?;
        found.sort();
        for path in found {
            let component = read_nerd(&path)?;
            let filepath = component.get("filepath").cloned();
            let known = filepath.is_some()
                && components
                    .iter()
                    .any(|existing| existing.get("filepath") == filepath.as_ref());
            if !known {
                components.push(component);
            }
        }

        if let Some(obj) = record.as_object_mut() {
            if !components.is_empty() {
                obj.insert("components".to_string(), Value::Array(components));
            }
        }
        Ok(record)
    }
}

fn collect_component_files(dir: &Utf8Path, out: &mut Vec<Utf8PathBuf>) -> Result<(), PrepError> {
    let entries =
        fs::read_dir(dir.as_std_path()).map_err(|err| PrepError::fs(format!("read dir {dir}"), err))?;
    for entry in entries {
        let entry = entry.map_err(|err| PrepError::fs(format!("read dir {dir}"), err))?;
        let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
            continue;
        };
        if path.as_std_path().is_dir() {
            let nerd = path.join(NERDM_FILE);
            if nerd.as_std_path().is_file() {
                out.push(nerd);
            }
            collect_component_files(&path, out)?;
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub struct BuilderOptions {
    /// reject records whose `@id` is not an ARK for this bag
    pub validate_id: bool,
}

impl Default for BuilderOptions {
    fn default() -> Self {
        Self { validate_id: true }
    }
}

/// Writes metadata into a bag under construction.
pub trait BagBuilder {
    fn bag_dir(&self) -> &Utf8Path;
    fn add_res_nerd(&mut self, record: &Value, save_file_md: bool) -> Result<(), PrepError>;
    /// Release the builder's held resources (e.g. its log file).
    fn disconnect(&mut self);
}

pub trait BagBuilderFactory: Send + Sync {
    fn open(
        &self,
        parent: &Utf8Path,
        name: &str,
        options: BuilderOptions,
        id: &str,
    ) -> Result<Box<dyn BagBuilder>, PrepError>;
}

/// Owns a builder and disconnects it when dropped, whatever the exit path.
pub struct BuilderGuard(Box<dyn BagBuilder>);

impl BuilderGuard {
    pub fn new(builder: Box<dyn BagBuilder>) -> Self {
        Self(builder)
    }
}

impl Deref for BuilderGuard {
    type Target = dyn BagBuilder;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl DerefMut for BuilderGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0.as_mut()
    }
}

impl Drop for BuilderGuard {
    fn drop(&mut self) {
        self.0.disconnect();
    }
}

/// Filesystem builder that saves a NERDm record into the metadata tree.
pub struct NerdmBagBuilder {
    dir: Utf8PathBuf,
    id: String,
    options: BuilderOptions,
    log: Option<File>,
}

impl NerdmBagBuilder {
    pub fn new(
        parent: &Utf8Path,
        name: &str,
        options: BuilderOptions,
        id: &str,
    ) -> Result<Self, PrepError> {
        if !parent.as_std_path().is_dir() {
            return Err(PrepError::State(format!(
                "bag working space does not exist: {parent}"
            )));
        }
        if options.validate_id && !ARK_ID_RE.is_match(id) {
            return Err(PrepError::InvalidRecord {
                path: parent.join(name),
                reason: format!("not an ARK identifier: {id}"),
            });
        }
        let dir = parent.join(name);
        for sub in [METADATA_DIR, DATA_DIR] {
            let path = dir.join(sub);
            fs::create_dir_all(path.as_std_path())
                .map_err(|err| PrepError::fs(format!("create {path}"), err))?;
        }
        let log_path = dir.join(BUILDER_LOG_FILE);
        let log = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path.as_std_path())
            .map_err(|err| PrepError::fs(format!("open {log_path}"), err))?;
        Ok(Self {
            dir,
            id: id.to_string(),
            options,
            log: Some(log),
        })
    }

    fn record(&mut self, message: &str) {
        if let Some(log) = self.log.as_mut() {
            let stamp = chrono::Utc::now().to_rfc3339();
            // the builder log is advisory
            let _ = writeln!(log, "{stamp} {message}");
        }
    }
}

/// A component filepath as a path relative to the bag's metadata directory,
/// or `None` if it is absolute or climbs out of it.
fn enclosed_filepath(filepath: &str) -> Option<&Utf8Path> {
    let path = Utf8Path::new(filepath);
    path.components()
        .all(|part| matches!(part, Utf8Component::Normal(_) | Utf8Component::CurDir))
        .then_some(path)
}

impl BagBuilder for NerdmBagBuilder {
    fn bag_dir(&self) -> &Utf8Path {
        &self.dir
    }

    fn add_res_nerd(&mut self, record: &Value, save_file_md: bool) -> Result<(), PrepError> {
        let path = self.dir.join(METADATA_DIR).join(NERDM_FILE);
        let Some(obj) = record.as_object() else {
            return Err(PrepError::InvalidRecord {
                path,
                reason: "not a JSON object".to_string(),
            });
        };
        let record_id = obj.get("@id").and_then(Value::as_str).unwrap_or_default();
        if self.options.validate_id && record_id != self.id {
            return Err(PrepError::InvalidRecord {
                path,
                reason: format!("@id {record_id} does not match bag id {}", self.id),
            });
        }

        let mut resource = obj.clone();
        let mut kept = Vec::new();
        let components = resource
            .remove("components")
            .and_then(|value| value.as_array().cloned())
            .unwrap_or_default();
        for component in components {
            let filepath = component
                .get("filepath")
                .and_then(Value::as_str)
                .map(str::to_string);
            match filepath {
                Some(filepath) if save_file_md && !filepath.is_empty() => {
                    let relative = enclosed_filepath(&filepath).ok_or_else(|| {
                        PrepError::InvalidRecord {
                            path: path.clone(),
                            reason: format!("component filepath escapes the bag: {filepath}"),
                        }
                    })?;
                    let target = self.dir.join(METADATA_DIR).join(relative).join(NERDM_FILE);
                    write_json(&target, &component)?;
                    self.record(&format!("saved file metadata for {filepath}"));
                }
                _ => kept.push(component),
            }
        }
        if !kept.is_empty() {
            resource.insert("components".to_string(), Value::Array(kept));
        }
        write_json(&path, &Value::Object(resource))?;
        self.record(&format!("saved resource metadata for {record_id}"));
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(mut log) = self.log.take() {
            let _ = log.flush();
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NerdmBagBuilderFactory;

impl BagBuilderFactory for NerdmBagBuilderFactory {
    fn open(
        &self,
        parent: &Utf8Path,
        name: &str,
        options: BuilderOptions,
        id: &str,
    ) -> Result<Box<dyn BagBuilder>, PrepError> {
        Ok(Box::new(NerdmBagBuilder::new(parent, name, options, id)?))
    }
}
