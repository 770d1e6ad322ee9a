//! Helpers for reading and revising NERDm metadata records.

use std::fs;
use std::sync::LazyLock;

use camino::Utf8Path;
use regex::Regex;
use serde_json::{Map, Value, json};

use crate::error::PrepError;
use crate::fs_util::write_bytes_atomic;

/// Current NERDm schema version that records are upgraded to.
pub const NERDM_SCHEMA_VERSION: &str = "v0.7";
pub const DEFAULT_ARK_NAAN: &str = "88434";

static ARK_PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^ark:/\d+/").unwrap());
static VERSION_SUFFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.v\d+(_\d+)*$").unwrap());
static SCHEMA_URI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(https?://data\.nist\.gov/od/dm/nerdm-schema/(?:[\w\-]+/)?)v\d+\.\d+(#.*)?$")
        .unwrap()
});

pub fn strip_ark_prefix(id: &str) -> &str {
    match ARK_PREFIX_RE.find(id) {
        Some(found) => &id[found.end()..],
        None => id,
    }
}

/// Drop a trailing release suffix (`.v1_0_0`) from a record identifier.
pub fn strip_version_suffix(id: &str) -> &str {
    match VERSION_SUFFIX_RE.find(id) {
        Some(found) => &id[..found.start()],
        None => id,
    }
}

/// The `ediid` value for an AIP identifier: short (non-EDI) identifiers are
/// qualified as ARKs.
pub fn ediid_for(aipid: &str, naan: &str) -> String {
    let local = strip_ark_prefix(aipid);
    if local.len() < 30 {
        format!("ark:/{naan}/{local}")
    } else {
        local.to_string()
    }
}

/// `1.2.0` becomes `1_2_0`, as used in release identifiers and bag names.
pub fn version_token(version: &str) -> String {
    version.replace('.', "_")
}

pub fn is_initial_version(version: &str) -> bool {
    matches!(version, "1.0.0" | "1.0" | "1")
}

pub fn read_nerd(path: &Utf8Path) -> Result<Value, PrepError> {
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| PrepError::fs(format!("read {path}"), err))?;
    let value: Value = serde_json::from_str(&content).map_err(|err| PrepError::json(path, err))?;
    if !value.is_object() {
        return Err(PrepError::InvalidRecord {
            path: path.to_path_buf(),
            reason: "not a JSON object".to_string(),
        });
    }
    Ok(value)
}

pub fn write_json(path: &Utf8Path, value: &Value) -> Result<(), PrepError> {
    let content = serde_json::to_vec_pretty(value).map_err(|err| PrepError::json(path, err))?;
    write_bytes_atomic(path, &content)
}

pub fn str_field<'a>(record: &'a Value, key: &str) -> Option<&'a str> {
    record.get(key).and_then(Value::as_str)
}

/// Move the record's schema URIs (and those of its components) to the
/// current NERDm version. Older records are assumed forward compatible.
pub fn update_nerdm_schema(record: &mut Value) {
    upgrade_schema_refs(record);
    if let Some(components) = record.get_mut("components").and_then(Value::as_array_mut) {
        for component in components {
            upgrade_schema_refs(component);
        }
    }
}

fn upgrade_schema_refs(node: &mut Value) {
    let Some(obj) = node.as_object_mut() else {
        return;
    };
    if let Some(Value::String(schema)) = obj.get_mut("$schema") {
        *schema = upgrade_schema_uri(schema);
    }
    if let Some(Value::Array(exts)) = obj.get_mut("_extensionSchemas") {
        for ext in exts.iter_mut() {
            if let Value::String(uri) = ext {
                *uri = upgrade_schema_uri(uri);
            }
        }
    }
}

fn upgrade_schema_uri(uri: &str) -> String {
    SCHEMA_URI_RE
        .replace(uri, format!("${{1}}{NERDM_SCHEMA_VERSION}${{2}}").as_str())
        .into_owned()
}

/// Point the record at a new EDI identifier and, when the record carries one,
/// append a `replaces` entry describing the identity being superseded.
pub fn rewrite_ediid(record: &mut Value, for_aip: &str, naan: &str, now: &str) {
    let old_ediid = str_field(record, "ediid").map(str::to_string);
    let new_ediid = ediid_for(for_aip, naan);
    if old_ediid.as_deref() == Some(new_ediid.as_str()) {
        return;
    }

    let mut entry = Map::new();
    let replaced_id = str_field(record, "doi").or_else(|| str_field(record, "@id"));
    if let Some(id) = replaced_id {
        entry.insert("@id".to_string(), json!(id));
    }
    if let Some(old) = &old_ediid {
        entry.insert("ediid".to_string(), json!(old));
    }
    let issued = str_field(record, "modified")
        .or_else(|| str_field(record, "issued"))
        .unwrap_or(now);
    entry.insert("issued".to_string(), json!(issued));
    if let Some(version) = record.get("version").cloned() {
        entry.insert("version".to_string(), version);
    }
    if let Some(title) = record.get("title").cloned() {
        entry.insert("title".to_string(), title);
    }

    let Some(obj) = record.as_object_mut() else {
        return;
    };
    obj.insert("ediid".to_string(), json!(new_ediid));
    let replaces = obj
        .entry("replaces")
        .or_insert_with(|| Value::Array(Vec::new()));
    if !replaces.is_array() {
        *replaces = Value::Array(Vec::new());
    }
    if let Value::Array(list) = replaces {
        list.push(Value::Object(entry));
    }
}

/// Overlay annotation properties onto a base record (top-level replace).
pub fn merge_annotations(base: &Value, annotations: &Value) -> Value {
    let mut merged = base.clone();
    if let (Some(target), Some(overlay)) = (merged.as_object_mut(), annotations.as_object()) {
        for (key, value) in overlay {
            target.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// Recursively merge `update` into `base`; objects merge, everything else
/// is replaced.
pub fn merge_json(update: &Value, base: &mut Value) {
    match (base, update) {
        (Value::Object(target), Value::Object(source)) => {
            for (key, value) in source {
                let nested = value.is_object() && target.get(key).is_some_and(Value::is_object);
                match target.get_mut(key) {
                    Some(existing) if nested => merge_json(value, existing),
                    _ => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (slot, value) => *slot = value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ark_prefix_handling() {
        assert_eq!(strip_ark_prefix("ark:/88434/mds2-2106"), "mds2-2106");
        assert_eq!(strip_ark_prefix("mds2-2106"), "mds2-2106");
        assert_eq!(ediid_for("mds2-2106", "88434"), "ark:/88434/mds2-2106");
        let edi = "3A1EE2F169DD3B8CE0531A570681DB5D1491";
        assert_eq!(ediid_for(edi, "88434"), edi);
    }

    #[test]
    fn version_suffix() {
        assert_eq!(strip_version_suffix("ark:/88434/mds2-2106.v1_0_0"), "ark:/88434/mds2-2106");
        assert_eq!(strip_version_suffix("ark:/88434/mds2-2106"), "ark:/88434/mds2-2106");
    }

    #[test]
    fn schema_upgrade() {
        let mut rec = json!({
            "$schema": "https://data.nist.gov/od/dm/nerdm-schema/v0.2#",
            "_extensionSchemas": ["https://data.nist.gov/od/dm/nerdm-schema/pub/v0.3#/definitions/PublicDataResource"],
            "components": [{"$schema": "https://data.nist.gov/od/dm/nerdm-schema/v0.1#"}]
        });
        update_nerdm_schema(&mut rec);
        assert_eq!(rec["$schema"], "https://data.nist.gov/od/dm/nerdm-schema/v0.7#");
        assert_eq!(
            rec["_extensionSchemas"][0],
            "https://data.nist.gov/od/dm/nerdm-schema/pub/v0.7#/definitions/PublicDataResource"
        );
        assert_eq!(rec["components"][0]["$schema"], "https://data.nist.gov/od/dm/nerdm-schema/v0.7#");
    }

    #[test]
    fn rewrite_appends_replaces() {
        let mut rec = json!({
            "@id": "ark:/88434/mds2-2106",
            "ediid": "ark:/88434/mds2-2106",
            "doi": "doi:10.18434/M32106",
            "issued": "2019-03-01",
            "modified": "2019-06-01",
            "version": "1.0.1",
            "title": "Cool data"
        });
        rewrite_ediid(&mut rec, "mds2-7777", "88434", "2026-01-01T00:00:00Z");
        assert_eq!(rec["ediid"], "ark:/88434/mds2-7777");
        let entry = &rec["replaces"][0];
        assert_eq!(entry["@id"], "doi:10.18434/M32106");
        assert_eq!(entry["ediid"], "ark:/88434/mds2-2106");
        assert_eq!(entry["issued"], "2019-06-01");
        assert_eq!(entry["version"], "1.0.1");
        assert_eq!(entry["title"], "Cool data");
    }

    #[test]
    fn merge_is_deep_for_objects() {
        let mut base = json!({"a": {"x": 1}, "b": 2});
        merge_json(&json!({"a": {"y": 3}, "b": 4}), &mut base);
        assert_eq!(base, json!({"a": {"x": 1, "y": 3}, "b": 4}));
    }
}
