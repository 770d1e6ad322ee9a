mod common;

use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};
use filetime::FileTime;
use serde_json::{Value, json};

use pdr_update_prep::bag::{
    BagBuilder, BagBuilderFactory, BuilderOptions, NerdmBagBuilderFactory, NistBag,
};
use pdr_update_prep::error::PrepError;
use pdr_update_prep::nerdm::{read_nerd, write_json};
use pdr_update_prep::transform::{BagTransformer, make_edit_version};

use common::{
    sample_record, utf8_tempdir, write_headbag_dir, write_headbag_zip, write_headbag_zip_with,
    zip_time_seconds,
};

fn transformer() -> BagTransformer {
    BagTransformer::new(Arc::new(NerdmBagBuilderFactory))
}

fn dir_entries(dir: &Utf8Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir.as_std_path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().into_string().unwrap())
        .collect();
    names.sort();
    names
}

fn mtime_seconds(path: &Utf8Path) -> i64 {
    let meta = fs::metadata(path.as_std_path()).unwrap();
    FileTime::from_last_modification_time(&meta).unix_seconds()
}

/// A serialized head bag in `<root>/store` and an empty `<root>/work`.
fn zip_fixture(root: &Utf8Path, record: &Value) -> (Utf8PathBuf, Utf8PathBuf) {
    let store = root.join("store");
    let work = root.join("work");
    fs::create_dir_all(store.as_std_path()).unwrap();
    fs::create_dir_all(work.as_std_path()).unwrap();
    let headbag = store.join("mds2-2106.1_0_0.mbag0_4-0.zip");
    write_headbag_zip(&headbag, "mds2-2106.1_0_0.mbag0_4-0", record);
    (headbag, work)
}

#[test]
fn serialized_head_bag_becomes_editable_bag() {
    let (_temp, root) = utf8_tempdir();
    let (headbag, work) = zip_fixture(&root, &sample_record("mds2-2106", "1.0.0"));
    let dest = work.join("mds2-2106");

    transformer().create_from_headbag(&headbag, &dest, None).unwrap();

    assert_eq!(dir_entries(&work), vec!["mds2-2106"]);
    for gone in [
        "bagit.txt",
        "bag-info.txt",
        "about.txt",
        "manifest-sha256.txt",
        "tagmanifest-sha256.txt",
    ] {
        assert!(!dest.join(gone).as_std_path().exists(), "{gone} should be removed");
    }
    assert!(dir_entries(&dest.join("data")).is_empty());
    let deprecated = fs::read_to_string(dest.join("multibag/deprecated-info.txt")).unwrap();
    assert!(deprecated.contains("Multibag-Version: 0.4"));

    let bag = NistBag::open(&dest).unwrap();
    let base = bag.nerd_metadata_for("", false).unwrap();
    assert_eq!(base["version"], "1.0.0");
    assert_eq!(
        base["$schema"],
        "https://data.nist.gov/od/dm/nerdm-schema/v0.7#"
    );
    assert!(dest.join("metadata/trial1.json/nerdm.json").as_std_path().is_file());

    let annots = bag.annotations_for("").unwrap();
    assert_eq!(annots["version"], "1.0.0+ (in edit)");
    let history = &annots["releaseHistory"];
    assert_eq!(history["@id"], "ark:/88434/mds2-2106.rel");
    let releases = history["hasRelease"].as_array().unwrap();
    assert_eq!(releases.len(), 1);
    assert_eq!(releases[0]["version"], "1.0.0");
    assert_eq!(releases[0]["issued"], "2019-04-11T10:23:00");
    assert_eq!(releases[0]["@id"], "ark:/88434/mds2-2106.v1_0_0");
    assert_eq!(
        releases[0]["location"],
        "https://data.nist.gov/od/id/ark:/88434/mds2-2106.v1_0_0"
    );
    assert_eq!(releases[0]["description"], "initial release");
}

#[test]
fn unpacking_restores_entry_timestamps() {
    let (_temp, root) = utf8_tempdir();
    let (headbag, work) = zip_fixture(&root, &sample_record("mds2-2106", "1.0.0"));
    let dest = work.join("mds2-2106");

    transformer().create_from_headbag(&headbag, &dest, None).unwrap();

    let expected = zip_time_seconds();
    assert_eq!(mtime_seconds(&dest.join("multibag/member-bags.tsv")), expected);
    assert_eq!(mtime_seconds(&dest.join("multibag/file-lookup.tsv")), expected);
}

#[test]
fn unpacking_restores_nested_directory_timestamps() {
    let (_temp, root) = utf8_tempdir();
    let store = root.join("store");
    let work = root.join("work");
    fs::create_dir_all(store.as_std_path()).unwrap();
    fs::create_dir_all(work.as_std_path()).unwrap();
    let headbag = store.join("mds2-2106.1_1_0.mbag0_4-1.zip");
    write_headbag_zip_with(
        &headbag,
        "mds2-2106.1_1_0.mbag0_4-1",
        &sample_record("mds2-2106", "1.1.0"),
        &["multibag/history/"],
        &[("multibag/history/1.0.0-info.txt", b"Multibag-Version: 0.4\n")],
    );
    let dest = work.join("mds2-2106");

    transformer().create_from_headbag(&headbag, &dest, None).unwrap();

    let expected = zip_time_seconds();
    assert_eq!(mtime_seconds(&dest.join("multibag/history")), expected);
    assert_eq!(mtime_seconds(&dest.join("multibag/history/1.0.0-info.txt")), expected);
}

#[test]
fn unpacked_head_bag_is_copied_not_moved() {
    let (_temp, root) = utf8_tempdir();
    let headbag = root.join("store/mds2-2106.1_1_0.mbag0_4-2");
    write_headbag_dir(&headbag, &sample_record("mds2-2106", "1.1.0"));
    let work = root.join("work");
    fs::create_dir_all(work.as_std_path()).unwrap();
    let dest = work.join("mds2-2106");

    transformer()
        .with_pdr_server("testdata.nist.gov")
        .create_from_headbag(&headbag, &dest, None)
        .unwrap();

    assert!(headbag.join("bag-info.txt").as_std_path().is_file());
    assert!(headbag.join("data/trial1.json").as_std_path().is_file());
    let annots = NistBag::open(&dest).unwrap().annotations_for("").unwrap();
    assert_eq!(annots["version"], "1.1.0+ (in edit)");
    let release = &annots["releaseHistory"]["hasRelease"][0];
    assert_eq!(
        release["location"],
        "https://testdata.nist.gov/od/id/ark:/88434/mds2-2106.v1_1_0"
    );
    assert!(release.get("description").is_none());
}

#[test]
fn existing_destination_is_refused_and_left_alone() {
    let (_temp, root) = utf8_tempdir();
    let (headbag, work) = zip_fixture(&root, &sample_record("mds2-2106", "1.0.0"));
    let dest = work.join("mds2-2106");
    fs::create_dir_all(dest.as_std_path()).unwrap();
    fs::write(dest.join("marker"), b"keep").unwrap();

    let err = transformer().create_from_headbag(&headbag, &dest, None).unwrap_err();
    assert_matches!(err, PrepError::State(_));

    let record = work.join("mds2-2106.json");
    write_json(&record, &sample_record("mds2-2106", "1.0.0")).unwrap();
    let err = transformer().create_from_nerdm(&record, &dest, None).unwrap_err();
    assert_matches!(err, PrepError::State(_));

    assert_eq!(dir_entries(&dest), vec!["marker"]);
    assert_eq!(dir_entries(&work), vec!["mds2-2106", "mds2-2106.json"]);
}

#[test]
fn record_without_identifier_is_rejected() {
    let (_temp, root) = utf8_tempdir();
    let mut record = sample_record("mds2-2106", "1.0.0");
    record.as_object_mut().unwrap().remove("@id");
    let (headbag, work) = zip_fixture(&root, &record);
    let dest = work.join("mds2-2106");

    let err = transformer().create_from_headbag(&headbag, &dest, None).unwrap_err();
    assert_matches!(err, PrepError::InvalidRecord { ref reason, .. } if reason.contains("@id"));
    assert!(dir_entries(&work).is_empty());

    let nerdfile = root.join("store/mds2-2106.json");
    write_json(&nerdfile, &record).unwrap();
    let err = transformer().create_from_nerdm(&nerdfile, &dest, None).unwrap_err();
    assert_matches!(err, PrepError::InvalidRecord { .. });
    assert!(dir_entries(&work).is_empty());
}

fn contains_name(dir: &Utf8Path, name: &str) -> bool {
    fs::read_dir(dir.as_std_path()).unwrap().any(|entry| {
        let entry = entry.unwrap();
        let path = Utf8PathBuf::from_path_buf(entry.path()).unwrap();
        entry.file_name() == name || (path.as_std_path().is_dir() && contains_name(&path, name))
    })
}

#[test]
fn component_filepath_may_not_leave_the_bag() {
    let (_temp, root) = utf8_tempdir();
    let work = root.join("a/b/work");
    fs::create_dir_all(work.as_std_path()).unwrap();
    let dest = work.join("mds2-2106");

    for filepath in ["../../../../escaped", "/tmp/escaped", "sub/../../escaped"] {
        let mut record = sample_record("mds2-2106", "1.0.0");
        record["components"] = json!([{"@id": "cmps/bad", "filepath": filepath}]);
        let nerdfile = root.join("mds2-2106.json");
        write_json(&nerdfile, &record).unwrap();

        let err = transformer().create_from_nerdm(&nerdfile, &dest, None).unwrap_err();
        assert_matches!(
            err,
            PrepError::InvalidRecord { ref reason, .. } if reason.contains("escapes")
        );
        assert!(dir_entries(&work).is_empty(), "{filepath} left files in the work area");
        assert!(!contains_name(&root, "escaped"), "{filepath} was written outside the bag");
    }
}

#[test]
fn record_path_rewrites_identifier_in_built_bag() {
    let (_temp, root) = utf8_tempdir();
    let nerdfile = root.join("mds2-2106.json");
    write_json(&nerdfile, &sample_record("mds2-2106", "1.2.0")).unwrap();
    let dest = root.join("mds2-3001");

    transformer()
        .create_from_nerdm(&nerdfile, &dest, Some("mds2-3001"))
        .unwrap();

    let base = NistBag::open(&dest).unwrap().nerd_metadata_for("", false).unwrap();
    assert_eq!(base["ediid"], "ark:/88434/mds2-3001");
    let replaces = base["replaces"].as_array().unwrap();
    assert_eq!(replaces.len(), 1);
    assert_eq!(replaces[0]["ediid"], "ark:/88434/mds2-2106");
    assert_eq!(replaces[0]["@id"], "doi:10.18434/M32106");
    assert_eq!(replaces[0]["issued"], "2019-04-11T10:23:00");
    assert_eq!(replaces[0]["version"], "1.2.0");
    assert_eq!(replaces[0]["title"], "Temperature trials");

    let source = read_nerd(&nerdfile).unwrap();
    assert_eq!(source["ediid"], "ark:/88434/mds2-2106", "cached record is not modified");
}

#[test]
fn head_bag_path_rewrites_identifier_too() {
    let (_temp, root) = utf8_tempdir();
    let (headbag, work) = zip_fixture(&root, &sample_record("mds2-2106", "1.0.0"));
    let dest = work.join("mds2-3001");

    transformer()
        .with_ark_naan("99999")
        .create_from_headbag(&headbag, &dest, Some("mds2-3001"))
        .unwrap();

    let base = NistBag::open(&dest).unwrap().nerd_metadata_for("", false).unwrap();
    assert_eq!(base["ediid"], "ark:/99999/mds2-3001");
    assert_eq!(base["replaces"][0]["ediid"], "ark:/88434/mds2-2106");
}

#[test]
fn missing_cached_record_is_a_state_error() {
    let (_temp, root) = utf8_tempdir();
    let err = transformer()
        .create_from_nerdm(&root.join("absent.json"), &root.join("bag"), None)
        .unwrap_err();
    assert_matches!(err, PrepError::State(_));
}

#[test]
fn edit_version_update_is_idempotent() {
    let (_temp, root) = utf8_tempdir();
    let nerdfile = root.join("mds2-2106.json");
    write_json(&nerdfile, &sample_record("mds2-2106", "1.0.0")).unwrap();
    let dest = root.join("mds2-2106");
    let transformer = transformer();
    transformer.create_from_nerdm(&nerdfile, &dest, None).unwrap();

    transformer.update_version_for_edit(&dest).unwrap();
    transformer.update_version_for_edit(&dest).unwrap();

    let annots = NistBag::open(&dest).unwrap().annotations_for("").unwrap();
    assert_eq!(annots["version"], "1.0.0+ (in edit)");
    assert_eq!(annots["releaseHistory"]["hasRelease"].as_array().unwrap().len(), 1);
    assert_eq!(make_edit_version("1.0.0+ (in edit)"), "1.0.0+ (in edit)");
}

#[test]
fn existing_release_history_is_extended_not_replaced() {
    let (_temp, root) = utf8_tempdir();
    let mut record = sample_record("mds2-2106", "1.1.0");
    record["releaseHistory"] = json!({
        "@id": "ark:/88434/mds2-2106.rel",
        "@type": ["nrdr:ReleaseHistory"],
        "hasRelease": [{"version": "1.0.0", "issued": "2019-03-02T00:00:00"}]
    });
    let nerdfile = root.join("mds2-2106.json");
    write_json(&nerdfile, &record).unwrap();
    let dest = root.join("mds2-2106");

    transformer().create_from_nerdm(&nerdfile, &dest, None).unwrap();

    let annots = NistBag::open(&dest).unwrap().annotations_for("").unwrap();
    let releases = annots["releaseHistory"]["hasRelease"].as_array().unwrap();
    let versions: Vec<&str> = releases.iter().map(|r| r["version"].as_str().unwrap()).collect();
    assert_eq!(versions, vec!["1.0.0", "1.1.0"]);
}

#[test]
fn undated_record_gets_no_release_entry() {
    let (_temp, root) = utf8_tempdir();
    let mut record = sample_record("mds2-2106", "1.0.0");
    let obj = record.as_object_mut().unwrap();
    obj.remove("issued");
    obj.remove("modified");
    let nerdfile = root.join("mds2-2106.json");
    write_json(&nerdfile, &record).unwrap();
    let dest = root.join("mds2-2106");

    transformer().create_from_nerdm(&nerdfile, &dest, None).unwrap();

    let annots = NistBag::open(&dest).unwrap().annotations_for("").unwrap();
    assert_eq!(annots["version"], "1.0.0+ (in edit)");
    assert!(annots.get("releaseHistory").is_none());
}

struct FailingBuilder {
    dir: Utf8PathBuf,
    disconnects: Arc<AtomicUsize>,
}

impl BagBuilder for FailingBuilder {
    fn bag_dir(&self) -> &Utf8Path {
        &self.dir
    }

    fn add_res_nerd(&mut self, _record: &Value, _save_file_md: bool) -> Result<(), PrepError> {
        fs::create_dir_all(self.dir.join("metadata")).unwrap();
        Err(PrepError::State("builder refused record".to_string()))
    }

    fn disconnect(&mut self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

struct FailingFactory {
    disconnects: Arc<AtomicUsize>,
}

impl BagBuilderFactory for FailingFactory {
    fn open(
        &self,
        parent: &Utf8Path,
        name: &str,
        options: BuilderOptions,
        _id: &str,
    ) -> Result<Box<dyn BagBuilder>, PrepError> {
        assert!(!options.validate_id);
        Ok(Box::new(FailingBuilder {
            dir: parent.join(name),
            disconnects: self.disconnects.clone(),
        }))
    }
}

#[test]
fn builder_is_released_when_construction_fails() {
    let (_temp, root) = utf8_tempdir();
    let (headbag, work) = zip_fixture(&root, &sample_record("mds2-2106", "1.0.0"));
    let disconnects = Arc::new(AtomicUsize::new(0));
    let transformer = BagTransformer::new(Arc::new(FailingFactory {
        disconnects: disconnects.clone(),
    }));

    let err = transformer
        .create_from_headbag(&headbag, &work.join("mds2-2106"), None)
        .unwrap_err();

    assert_matches!(err, PrepError::State(ref msg) if msg.contains("refused"));
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    assert!(dir_entries(&work).is_empty());
}

#[test]
fn interrupted_unpack_leaves_nothing_behind() {
    let (_temp, root) = utf8_tempdir();
    let (headbag, work) = zip_fixture(&root, &sample_record("mds2-2106", "1.0.0"));
    let flag = Arc::new(AtomicBool::new(true));

    let err = transformer()
        .with_interrupt(flag)
        .create_from_headbag(&headbag, &work.join("mds2-2106"), None)
        .unwrap_err();

    assert_matches!(err, PrepError::Interrupted(_));
    assert!(dir_entries(&work).is_empty());
}

#[test]
fn multibag_info_propagates_from_serialized_bag() {
    let (_temp, root) = utf8_tempdir();
    let (headbag, work) = zip_fixture(&root, &sample_record("mds2-2106", "1.0.0"));
    let dest = work.join("mds2-2106");
    fs::create_dir_all(dest.join("multibag")).unwrap();
    fs::write(dest.join("multibag/keep.txt"), b"mine").unwrap();
    fs::write(dest.join("multibag/member-bags.tsv"), b"stale").unwrap();

    transformer().update_multibag_info(&headbag, &dest).unwrap();

    assert_eq!(
        dir_entries(&dest.join("multibag")),
        vec!["deprecated-info.txt", "file-lookup.tsv", "keep.txt", "member-bags.tsv"]
    );
    let members = fs::read_to_string(dest.join("multibag/member-bags.tsv")).unwrap();
    assert!(members.starts_with("mds2-2106.1_0_0"));
    assert_eq!(mtime_seconds(&dest.join("multibag/file-lookup.tsv")), zip_time_seconds());
}

#[test]
fn multibag_info_propagates_from_unpacked_bag() {
    let (_temp, root) = utf8_tempdir();
    let headbag = root.join("store/mds2-2106.1_0_0.mbag0_4-0");
    write_headbag_dir(&headbag, &sample_record("mds2-2106", "1.0.0"));
    let dest = root.join("work/mds2-2106");
    fs::create_dir_all(dest.as_std_path()).unwrap();

    transformer().update_multibag_info(&headbag, &dest).unwrap();

    let deprecated = fs::read_to_string(dest.join("multibag/deprecated-info.txt")).unwrap();
    assert!(deprecated.contains("Bag-Software-Agent"));
    assert!(dest.join("multibag/file-lookup.tsv").as_std_path().is_file());
}

#[test]
fn head_bag_info_supersedes_older_deprecated_info() {
    let (_temp, root) = utf8_tempdir();
    let record = sample_record("mds2-2106", "1.1.0");
    let stale: &[u8] = b"OLD-1.0.0-INFO\n";

    let unpacked = root.join("store/mds2-2106.1_1_0.mbag0_4-1");
    write_headbag_dir(&unpacked, &record);
    fs::write(unpacked.join("multibag/deprecated-info.txt"), stale).unwrap();
    let serialized = root.join("store/mds2-2106.1_1_0.mbag0_4-1.zip");
    write_headbag_zip_with(
        &serialized,
        "mds2-2106.1_1_0.mbag0_4-1",
        &record,
        &[],
        &[("multibag/deprecated-info.txt", stale)],
    );

    for (label, headbag) in [("unpacked", &unpacked), ("serialized", &serialized)] {
        let dest = root.join(format!("work-{label}/mds2-2106"));
        fs::create_dir_all(dest.as_std_path()).unwrap();

        transformer().update_multibag_info(headbag, &dest).unwrap();

        let deprecated = fs::read_to_string(dest.join("multibag/deprecated-info.txt")).unwrap();
        assert!(deprecated.contains("Bag-Software-Agent"), "{label}: {deprecated}");
        assert!(!deprecated.contains("OLD-1.0.0-INFO"), "{label}: {deprecated}");
        assert!(dest.join("multibag/member-bags.tsv").as_std_path().is_file());
    }
}

#[test]
fn serialized_bag_without_multibag_files_is_rejected() {
    let (_temp, root) = utf8_tempdir();
    let headbag = root.join("plain.zip");
    let file = fs::File::create(headbag.as_std_path()).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    zip.start_file("plain/bagit.txt", zip::write::SimpleFileOptions::default())
        .unwrap();
    std::io::Write::write_all(&mut zip, b"BagIt-Version: 0.97\n").unwrap();
    zip.finish().unwrap();
    let dest = root.join("bag");
    fs::create_dir_all(dest.as_std_path()).unwrap();

    let err = transformer().update_multibag_info(&headbag, &dest).unwrap_err();
    assert_matches!(err, PrepError::State(ref msg) if msg.contains("multibag"));
}
