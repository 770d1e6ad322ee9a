#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::{Map, Value, json};
use zip::write::SimpleFileOptions;

use pdr_update_prep::distrib::DistribClient;
use pdr_update_prep::domain::{Checksum, HeadBagInfo};
use pdr_update_prep::error::PrepError;
use pdr_update_prep::fs_util::{HashAlgorithm, checksum_of};
use pdr_update_prep::rmm::MetadataClient;

pub const ZIP_TIME: (u16, u8, u8, u8, u8, u8) = (2020, 1, 15, 10, 30, 0);

pub fn utf8_tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
    let temp = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    (temp, path)
}

/// A published record with one downloadable file.
pub fn sample_record(aipid: &str, version: &str) -> Value {
    json!({
        "$schema": "https://data.nist.gov/od/dm/nerdm-schema/v0.2#",
        "_extensionSchemas": [
            "https://data.nist.gov/od/dm/nerdm-schema/pub/v0.2#/definitions/PublicDataResource"
        ],
        "@id": format!("ark:/88434/{aipid}"),
        "ediid": format!("ark:/88434/{aipid}"),
        "doi": "doi:10.18434/M32106",
        "title": "Temperature trials",
        "version": version,
        "issued": "2019-03-02T00:00:00",
        "modified": "2019-04-11T10:23:00",
        "components": [
            {
                "@id": "cmps/trial1.json",
                "@type": ["nrdp:DataFile"],
                "filepath": "trial1.json"
            }
        ]
    })
}

/// The files of an unpacked head bag, relative to its root.
pub fn headbag_files(record: &Value) -> Vec<(String, Vec<u8>)> {
    let mut resource = record.as_object().cloned().unwrap_or_default();
    let components = resource
        .remove("components")
        .and_then(|value| value.as_array().cloned())
        .unwrap_or_default();

    let mut files = vec![
        ("bagit.txt".to_string(), b"BagIt-Version: 0.97\n".to_vec()),
        (
            "bag-info.txt".to_string(),
            b"Bag-Software-Agent: preserv\nMultibag-Version: 0.4\n".to_vec(),
        ),
        ("manifest-sha256.txt".to_string(), b"abc  data/trial1.json\n".to_vec()),
        ("tagmanifest-sha256.txt".to_string(), b"def  bagit.txt\n".to_vec()),
        ("about.txt".to_string(), b"about this bag\n".to_vec()),
        ("data/trial1.json".to_string(), b"{\"temp\": 21}\n".to_vec()),
        (
            "metadata/nerdm.json".to_string(),
            serde_json::to_vec_pretty(&Value::Object(resource)).unwrap(),
        ),
        (
            "multibag/member-bags.tsv".to_string(),
            b"mds2-2106.1_0_0.mbag0_4-0\n".to_vec(),
        ),
        (
            "multibag/file-lookup.tsv".to_string(),
            b"data/trial1.json\tmds2-2106.1_0_0.mbag0_4-0\n".to_vec(),
        ),
    ];
    for component in components {
        if let Some(filepath) = component.get("filepath").and_then(Value::as_str) {
            files.push((
                format!("metadata/{filepath}/nerdm.json"),
                serde_json::to_vec_pretty(&component).unwrap(),
            ));
        }
    }
    files
}

/// Write a serialized head bag whose entries all carry [`ZIP_TIME`].
pub fn write_headbag_zip(path: &Utf8Path, root: &str, record: &Value) {
    write_headbag_zip_with(path, root, record, &[], &[]);
}

/// Like [`write_headbag_zip`], with extra directory entries (named with a
/// trailing `/`) and extra files, all relative to the bag root.
pub fn write_headbag_zip_with(
    path: &Utf8Path,
    root: &str,
    record: &Value,
    dirs: &[&str],
    extra: &[(&str, &[u8])],
) {
    let (year, month, day, hour, minute, second) = ZIP_TIME;
    let stamp = zip::DateTime::from_date_and_time(year, month, day, hour, minute, second).unwrap();
    let options = SimpleFileOptions::default().last_modified_time(stamp);

    let file = fs::File::create(path.as_std_path()).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    zip.add_directory(format!("{root}/"), options).unwrap();
    for dir in dirs {
        zip.add_directory(format!("{root}/{dir}"), options).unwrap();
    }
    let mut files = headbag_files(record);
    files.extend(extra.iter().map(|(name, content)| (name.to_string(), content.to_vec())));
    for (name, content) in files {
        zip.start_file(format!("{root}/{name}"), options).unwrap();
        zip.write_all(&content).unwrap();
    }
    zip.finish().unwrap();
}

pub fn write_headbag_dir(dir: &Utf8Path, record: &Value) {
    for (name, content) in headbag_files(record) {
        let path = dir.join(name);
        fs::create_dir_all(path.parent().unwrap().as_std_path()).unwrap();
        fs::write(path.as_std_path(), content).unwrap();
    }
}

/// The local-time instant [`ZIP_TIME`] denotes, as Unix seconds.
pub fn zip_time_seconds() -> i64 {
    use chrono::TimeZone;
    let (year, month, day, hour, minute, second) = ZIP_TIME;
    chrono::Local
        .with_ymd_and_hms(
            i32::from(year),
            u32::from(month),
            u32::from(day),
            u32::from(hour),
            u32::from(minute),
            u32::from(second),
        )
        .earliest()
        .unwrap()
        .timestamp()
}

pub fn sha256_of(path: &Utf8Path) -> String {
    checksum_of(path.as_std_path(), HashAlgorithm::Sha256).unwrap()
}

pub fn head_info(name: &str, aipid: &str, since_version: &str, hash: &str) -> HeadBagInfo {
    HeadBagInfo {
        name: name.to_string(),
        aipid: aipid.to_string(),
        since_version: since_version.to_string(),
        checksum: Checksum::sha256(hash),
        extra: Map::new(),
    }
}

/// Distribution service double serving bags from memory.
#[derive(Default)]
pub struct MockDistrib {
    bags: Vec<(HeadBagInfo, Vec<u8>)>,
    pub describe_calls: Mutex<usize>,
    pub save_calls: Mutex<usize>,
    /// number of upcoming downloads to deliver damaged
    pub corrupt_saves: Mutex<usize>,
}

impl MockDistrib {
    /// Serve the serialized bag at `source` as the head bag for
    /// `since_version`; bags added later count as newer.
    pub fn with_bag(mut self, source: &Utf8Path, aipid: &str, since_version: &str) -> Self {
        let name = source.file_name().unwrap().to_string();
        let content = fs::read(source.as_std_path()).unwrap();
        let info = head_info(&name, aipid, since_version, &sha256_of(source));
        self.bags.push((info, content));
        self
    }

    pub fn corrupting(self, count: usize) -> Self {
        *self.corrupt_saves.lock().unwrap() = count;
        self
    }

    pub fn saves(&self) -> usize {
        *self.save_calls.lock().unwrap()
    }

    pub fn describes(&self) -> usize {
        *self.describe_calls.lock().unwrap()
    }
}

impl DistribClient for MockDistrib {
    fn describe_head_for_version(
        &self,
        aipid: &str,
        version: Option<&str>,
    ) -> Result<Option<HeadBagInfo>, PrepError> {
        *self.describe_calls.lock().unwrap() += 1;
        let mut matching = self.bags.iter().filter(|(info, _)| info.aipid == aipid);
        let found = match version {
            Some(version) => matching.find(|(info, _)| info.since_version == version),
            None => matching.last(),
        };
        Ok(found.map(|(info, _)| info.clone()))
    }

    fn save_bag(&self, name: &str, dest_dir: &Utf8Path) -> Result<(), PrepError> {
        *self.save_calls.lock().unwrap() += 1;
        let Some((_, content)) = self.bags.iter().find(|(info, _)| info.name == name) else {
            return Err(PrepError::DistribStatus {
                status: 404,
                message: format!("no such bag: {name}"),
            });
        };
        let mut corrupt = self.corrupt_saves.lock().unwrap();
        let payload = if *corrupt > 0 {
            *corrupt -= 1;
            b"truncated".to_vec()
        } else {
            content.clone()
        };
        fs::write(dest_dir.join(name).as_std_path(), payload).unwrap();
        Ok(())
    }
}

/// Metadata service double answering from a fixed set of records.
#[derive(Default)]
pub struct MockMetadata {
    records: HashMap<String, Value>,
    pub calls: Mutex<usize>,
}

impl MockMetadata {
    pub fn with_record(mut self, aipid: &str, record: Value) -> Self {
        self.records.insert(aipid.to_string(), record);
        self
    }

    pub fn call_count(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

impl MetadataClient for MockMetadata {
    fn describe(&self, aipid: &str) -> Result<Option<Value>, PrepError> {
        *self.calls.lock().unwrap() += 1;
        Ok(self.records.get(aipid).cloned())
    }
}
