use std::io::{self, Write};

use camino::Utf8PathBuf;
use serde::Serialize;

use crate::domain::{PrepOutcome, VersionSource};

#[derive(Debug, Clone, Serialize)]
pub struct LatestVersionResult {
    pub aipid: String,
    pub sources: Vec<VersionSource>,
    pub version: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HeadBagResult {
    pub aipid: String,
    pub headbag: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PrepareResult {
    pub aipid: String,
    pub outcome: &'static str,
    pub path: Option<Utf8PathBuf>,
}

impl PrepareResult {
    pub fn new(aipid: &str, outcome: PrepOutcome) -> Self {
        let (label, path) = match outcome {
            PrepOutcome::FromHeadBag(path) => ("from-head-bag", Some(path)),
            PrepOutcome::FromRecord(path) => ("from-record", Some(path)),
            PrepOutcome::NoPriorVersion => ("no-prior-version", None),
        };
        Self {
            aipid: aipid.to_string(),
            outcome: label,
            path,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MultibagResult {
    pub aipid: String,
    pub destination: Utf8PathBuf,
    pub updated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExistsResult {
    pub aipid: String,
    pub deep: bool,
    pub exists: bool,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_latest_version(result: &LatestVersionResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_headbag(result: &HeadBagResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_prepare(result: &PrepareResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_multibag(result: &MultibagResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_exists(result: &ExistsResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}
