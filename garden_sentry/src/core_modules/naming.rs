// THEORY:
// Artifact names must be readable at a glance (when did this happen, how sure was the
// detector?) and must never collide, even when two episodes start within the same
// second. Formatting is a pure function; the `ArtifactNamer` adds the only state
// needed to disambiguate: the last key it issued and the files already on disk.

use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};

pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Renders `<prefix>_<timestamp>[_<tag>][_<n>].<extension>`.
///
/// `disambiguator` values below 2 are omitted, so the first artifact of a second
/// keeps the plain name and later ones become `_2`, `_3`, ...
pub fn artifact_file_name(
    prefix: &str,
    started_at: &DateTime<Local>,
    tag: Option<&str>,
    disambiguator: u32,
    extension: &str,
) -> String {
    let mut name = format!("{}_{}", prefix, started_at.format(TIMESTAMP_FORMAT));
    if let Some(tag) = tag.filter(|t| !t.is_empty()) {
        name.push('_');
        name.push_str(tag);
    }
    if disambiguator >= 2 {
        name.push_str(&format!("_{disambiguator}"));
    }
    name.push('.');
    name.push_str(extension.trim_start_matches('.'));
    name
}

/// Issues collision-free artifact paths inside one output directory.
#[derive(Debug)]
pub struct ArtifactNamer {
    dir: PathBuf,
    prefix: String,
    extension: String,
    last_second: Option<String>,
    issued_this_second: u32,
    /// Counter state before the last `next_path`, for `rollback`.
    before_last: Option<(Option<String>, u32)>,
}

impl ArtifactNamer {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>, extension: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            extension: extension.into(),
            last_second: None,
            issued_this_second: 0,
            before_last: None,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the next unused path for an episode starting at `started_at`.
    pub fn next_path(&mut self, started_at: &DateTime<Local>, tag: Option<&str>) -> PathBuf {
        let second = started_at.format(TIMESTAMP_FORMAT).to_string();
        self.before_last = Some((self.last_second.clone(), self.issued_this_second));
        if self.last_second.as_deref() == Some(second.as_str()) {
            self.issued_this_second += 1;
        } else {
            self.last_second = Some(second);
            self.issued_this_second = 1;
        }

        let mut disambiguator = self.issued_this_second;
        loop {
            let name = artifact_file_name(&self.prefix, started_at, tag, disambiguator, &self.extension);
            let candidate = self.dir.join(name);
            if !candidate.exists() {
                self.issued_this_second = disambiguator;
                return candidate;
            }
            disambiguator = disambiguator.max(1) + 1;
        }
    }

    /// Returns the last issued path to the pool when nothing was written to it.
    pub fn rollback(&mut self) {
        if let Some((second, issued)) = self.before_last.take() {
            self.last_second = second;
            self.issued_this_second = issued;
        }
    }
}
