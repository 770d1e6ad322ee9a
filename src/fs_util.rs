use std::fs;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{Local, NaiveDate, TimeZone};
use filetime::FileTime;
use sha2::{Digest, Sha256, Sha512};
use tempfile::{Builder, TempDir};
use zip::ZipArchive;

use crate::error::PrepError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().replace('-', "").as_str() {
            "sha256" => Some(HashAlgorithm::Sha256),
            "sha512" => Some(HashAlgorithm::Sha512),
            _ => None,
        }
    }
}

/// Hex digest of a file's content.
pub fn checksum_of(path: &Path, algorithm: HashAlgorithm) -> io::Result<String> {
    let file = fs::File::open(path)?;
    let mut reader = BufReader::with_capacity(64 * 1024, file);
    let digest = match algorithm {
        HashAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            io::copy(&mut reader, &mut hasher)?;
            hex::encode(hasher.finalize())
        }
        HashAlgorithm::Sha512 => {
            let mut hasher = Sha512::new();
            io::copy(&mut reader, &mut hasher)?;
            hex::encode(hasher.finalize())
        }
    };
    Ok(digest)
}

/// Create `path` if needed; fail if something other than a directory is there.
pub fn ensure_dir(path: &Utf8Path, owner: &str) -> Result<(), PrepError> {
    if !path.as_std_path().exists() {
        fs::create_dir_all(path.as_std_path())
            .map_err(|err| PrepError::fs(format!("create {path}"), err))?;
    }
    if !path.as_std_path().is_dir() {
        return Err(PrepError::State(format!("{owner}: not a directory: {path}")));
    }
    Ok(())
}

pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), PrepError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| PrepError::fs(format!("create {parent}"), err))?;
    }
    let tmp_path = Utf8PathBuf::from(format!("{path}.tmp"));
    fs::write(tmp_path.as_std_path(), content)
        .map_err(|err| PrepError::fs(format!("write {tmp_path}"), err))?;
    fs::rename(tmp_path.as_std_path(), path.as_std_path())
        .map_err(|err| PrepError::fs(format!("rename {tmp_path}"), err))?;
    Ok(())
}

pub fn remove_file_if_exists(path: &Utf8Path) -> Result<(), PrepError> {
    match fs::remove_file(path.as_std_path()) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(PrepError::fs(format!("remove {path}"), err)),
    }
}

pub fn check_interrupt(interrupt: Option<&AtomicBool>, target: &Utf8Path) -> Result<(), PrepError> {
    if interrupt.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
        return Err(PrepError::Interrupted(target.to_path_buf()));
    }
    Ok(())
}

/// A scratch directory next to a final destination. Work is assembled inside
/// it and renamed into place by [`StagingDir::commit`]; dropping it without
/// committing discards everything.
pub struct StagingDir {
    dir: TempDir,
    root: Utf8PathBuf,
}

impl StagingDir {
    pub fn new_in(parent: &Utf8Path) -> Result<Self, PrepError> {
        let dir = Builder::new()
            .prefix(".prepupd-")
            .tempdir_in(parent.as_std_path())
            .map_err(|err| PrepError::fs(format!("create staging area in {parent}"), err))?;
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
            .map_err(|_| PrepError::Filesystem("non-utf8 staging path".to_string()))?;
        Ok(Self { dir, root })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.root
    }

    /// Move `self.path()/name` to `dest`, which must not exist.
    pub fn commit(self, name: &str, dest: &Utf8Path) -> Result<(), PrepError> {
        let built = self.root.join(name);
        if dest.as_std_path().exists() {
            return Err(PrepError::State(format!(
                "destination appeared while building: {dest}"
            )));
        }
        fs::rename(built.as_std_path(), dest.as_std_path())
            .map_err(|err| PrepError::fs(format!("move {built} to {dest}"), err))?;
        drop(self.dir);
        Ok(())
    }
}

/// Copy a directory tree, carrying file modification times along.
pub fn copy_dir_recursive(
    source: &Utf8Path,
    dest: &Utf8Path,
    interrupt: Option<&AtomicBool>,
) -> Result<(), PrepError> {
    fs::create_dir_all(dest.as_std_path())
        .map_err(|err| PrepError::fs(format!("create {dest}"), err))?;
    let mut dirs = Vec::new();
    for entry in walk_dir(source.as_std_path())? {
        check_interrupt(interrupt, dest)?;
        let relative = entry
            .strip_prefix(source.as_std_path())
            .map_err(|_| PrepError::Filesystem(format!("{} escapes {source}", entry.display())))?;
        let target = dest.as_std_path().join(relative);
        let meta = fs::metadata(&entry)
            .map_err(|err| PrepError::fs(format!("stat {}", entry.display()), err))?;
        let mtime = FileTime::from_last_modification_time(&meta);
        if meta.is_dir() {
            fs::create_dir_all(&target)
                .map_err(|err| PrepError::fs(format!("create {}", target.display()), err))?;
            dirs.push((target, mtime));
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .map_err(|err| PrepError::fs(format!("create {}", parent.display()), err))?;
            }
            fs::copy(&entry, &target)
                .map_err(|err| PrepError::fs(format!("copy {}", entry.display()), err))?;
            set_times(&target, mtime)?;
        }
    }
    restore_dir_times(dirs)
}

/// Unpack a zip archive into `target_dir`, restoring each entry's recorded
/// modification time. Directory times are set last since writing their
/// contents would otherwise refresh them. Returns the archive's top-level
/// directory name.
pub fn extract_zip(
    zip_path: &Utf8Path,
    target_dir: &Utf8Path,
    interrupt: Option<&AtomicBool>,
) -> Result<String, PrepError> {
    let mut archive = open_zip(zip_path)?;
    let root = zip_root(&archive)
        .ok_or_else(|| PrepError::State(format!("bag appears to be empty: {zip_path}")))?;

    let mut dirs = Vec::new();
    for i in 0..archive.len() {
        check_interrupt(interrupt, target_dir)?;
        let mut entry = archive
            .by_index(i)
            .map_err(|err| PrepError::Filesystem(format!("read {zip_path}: {err}")))?;
        let entry_path = match entry.enclosed_name() {
            Some(path) => target_dir.as_std_path().join(path),
            None => {
                return Err(PrepError::Filesystem(format!(
                    "zip entry path traversal detected in {zip_path}"
                )));
            }
        };
        let mtime = entry.last_modified().and_then(zip_mtime);

        if entry.is_dir() {
            fs::create_dir_all(&entry_path)
                .map_err(|err| PrepError::fs(format!("create {}", entry_path.display()), err))?;
            if let Some(mtime) = mtime {
                dirs.push((entry_path, mtime));
            }
            continue;
        }
        write_entry(&mut entry, &entry_path)?;
        if let Some(mtime) = mtime {
            set_times(&entry_path, mtime)?;
        }
    }
    restore_dir_times(dirs)?;
    Ok(root)
}

/// Extract selected entries of a zip archive. `map` turns an entry name into
/// a destination path, or `None` to skip it. Returns the number of files
/// written.
pub fn extract_zip_entries<F>(zip_path: &Utf8Path, mut map: F) -> Result<usize, PrepError>
where
    F: FnMut(&str) -> Option<PathBuf>,
{
    let mut archive = open_zip(zip_path)?;
    let mut written = 0;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| PrepError::Filesystem(format!("read {zip_path}: {err}")))?;
        if entry.enclosed_name().is_none() {
            return Err(PrepError::Filesystem(format!(
                "zip entry path traversal detected in {zip_path}"
            )));
        }
        let Some(target) = map(entry.name()) else {
            continue;
        };
        if entry.is_dir() {
            fs::create_dir_all(&target)
                .map_err(|err| PrepError::fs(format!("create {}", target.display()), err))?;
            continue;
        }
        write_entry(&mut entry, &target)?;
        if let Some(mtime) = entry.last_modified().and_then(zip_mtime) {
            set_times(&target, mtime)?;
        }
        written += 1;
    }
    Ok(written)
}

pub fn zip_entry_names(zip_path: &Utf8Path) -> Result<Vec<String>, PrepError> {
    let archive = open_zip(zip_path)?;
    Ok(archive.file_names().map(str::to_string).collect())
}

fn open_zip(zip_path: &Utf8Path) -> Result<ZipArchive<fs::File>, PrepError> {
    let file = fs::File::open(zip_path.as_std_path())
        .map_err(|err| PrepError::fs(format!("open zip {zip_path}"), err))?;
    ZipArchive::new(file).map_err(|err| PrepError::Filesystem(format!("open zip {zip_path}: {err}")))
}

fn zip_root(archive: &ZipArchive<fs::File>) -> Option<String> {
    archive
        .file_names()
        .filter_map(|name| name.split('/').next())
        .find(|root| !root.is_empty())
        .map(str::to_string)
}

fn write_entry<R: io::Read>(entry: &mut R, target: &Path) -> Result<(), PrepError> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| PrepError::fs(format!("create {}", parent.display()), err))?;
    }
    let mut outfile = fs::File::create(target)
        .map_err(|err| PrepError::fs(format!("create {}", target.display()), err))?;
    io::copy(entry, &mut outfile)
        .map_err(|err| PrepError::fs(format!("write {}", target.display()), err))?;
    Ok(())
}

/// Zip timestamps carry no zone; they are read as local time.
fn zip_mtime(stamp: zip::DateTime) -> Option<FileTime> {
    let naive = NaiveDate::from_ymd_opt(
        i32::from(stamp.year()),
        u32::from(stamp.month()),
        u32::from(stamp.day()),
    )?
    .and_hms_opt(
        u32::from(stamp.hour()),
        u32::from(stamp.minute()),
        u32::from(stamp.second()),
    )?;
    let local = Local.from_local_datetime(&naive).earliest()?;
    Some(FileTime::from_unix_time(local.timestamp(), 0))
}

fn set_times(path: &Path, mtime: FileTime) -> Result<(), PrepError> {
    filetime::set_file_times(path, mtime, mtime)
        .map_err(|err| PrepError::fs(format!("set times on {}", path.display()), err))
}

fn restore_dir_times(mut dirs: Vec<(PathBuf, FileTime)>) -> Result<(), PrepError> {
    // deepest first
    dirs.sort_by_key(|(path, _)| std::cmp::Reverse(path.components().count()));
    for (path, mtime) in dirs {
        set_times(&path, mtime)?;
    }
    Ok(())
}

fn walk_dir(root: &Path) -> Result<Vec<PathBuf>, PrepError> {
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries = fs::read_dir(&path)
            .map_err(|err| PrepError::fs(format!("read dir {}", path.display()), err))?;
        for entry in entries {
            let entry =
                entry.map_err(|err| PrepError::fs(format!("read dir {}", path.display()), err))?;
            let file_type = entry
                .file_type()
                .map_err(|err| PrepError::fs(format!("stat {}", entry.path().display()), err))?;
            let path = entry.path();
            if file_type.is_dir() {
                stack.push(path.clone());
            }
            items.push(path);
        }
    }
    Ok(items)
}
