// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};

/// Suffix for files that are still being written
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Extension of the completion record written next to each download
pub const RECORD_EXTENSION: &str = "json";

/// Default audio extension for downloaded files
pub const DEFAULT_EXTENSION: &str = "mp3";

/// Resolves where downloads live on disk.
///
/// Every job maps to a single file named after its id, so concurrent
/// workers never write to the same path.
pub trait PathResolver: Send + Sync {
    /// Directory holding all downloads, or None if it cannot be resolved
    fn destination_directory(&self) -> Option<PathBuf>;

    /// Extension (without dot) used for downloaded files
    fn extension(&self) -> &str;

    /// Final path of the downloaded file for a job
    fn path_for(&self, job_id: &str) -> Option<PathBuf> {
        let stem = file_stem(job_id);
        self.destination_directory()
            .map(|dir| dir.join(format!("{}.{}", stem, self.extension())))
    }

    /// Path the worker streams into before the final move
    fn partial_path_for(&self, job_id: &str) -> Option<PathBuf> {
        let stem = file_stem(job_id);
        self.destination_directory().map(|dir| {
            dir.join(format!("{}.{}{}", stem, self.extension(), PARTIAL_SUFFIX))
        })
    }

    /// Path of the completion record for a job
    fn record_path_for(&self, job_id: &str) -> Option<PathBuf> {
        let stem = file_stem(job_id);
        self.destination_directory()
            .map(|dir| dir.join(format!("{}.{}", stem, RECORD_EXTENSION)))
    }
}

/// A shared reference to a path resolver
pub type SharedPathResolver = Arc<dyn PathResolver>;

/// Separates a sanitized stem from the hash of the id it came from
const STEM_HASH_SEPARATOR: char = '~';

/// Turn a job id into a safe file stem.
///
/// Ids that are already safe file names are used as is. Any other id is
/// sanitized and suffixed with a hash of the raw id, so two different ids
/// never share a stem.
pub fn file_stem(job_id: &str) -> String {
    let sanitized = sanitize_filename::sanitize(job_id);
    if !sanitized.is_empty()
        && sanitized == job_id
        && !job_id.contains(STEM_HASH_SEPARATOR)
    {
        return sanitized;
    }

    let readable: String = sanitized
        .chars()
        .filter(|c| *c != STEM_HASH_SEPARATOR)
        .collect();
    let readable = if readable.is_empty() {
        "unnamed".to_string()
    } else {
        readable
    };

    let digest = format!("{:x}", Sha256::digest(job_id.as_bytes()));
    format!("{readable}{STEM_HASH_SEPARATOR}{}", &digest[..16])
}

/// Path resolver backed by a fixed directory
#[derive(Debug, Clone)]
pub struct DownloadDirectory {
    root: Option<PathBuf>,
    extension: String,
}

impl DownloadDirectory {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: Some(root.as_ref().to_path_buf()),
            extension: DEFAULT_EXTENSION.to_string(),
        }
    }

    /// A resolver whose directory cannot be resolved, e.g. when the
    /// platform refuses to hand out a storage location
    pub fn unresolved() -> Self {
        Self {
            root: None,
            extension: DEFAULT_EXTENSION.to_string(),
        }
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        let extension: String = extension.into();
        self.extension = extension.trim_start_matches('.').to_string();
        self
    }

    pub fn shared(self) -> SharedPathResolver {
        Arc::new(self)
    }
}

impl PathResolver for DownloadDirectory {
    fn destination_directory(&self) -> Option<PathBuf> {
        self.root.clone()
    }

    fn extension(&self) -> &str {
        &self.extension
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_named_by_id() {
        let dir = DownloadDirectory::new("/downloads");

        assert_eq!(
            dir.path_for("ep1"),
            Some(PathBuf::from("/downloads/ep1.mp3"))
        );
        assert_eq!(
            dir.partial_path_for("ep1"),
            Some(PathBuf::from("/downloads/ep1.mp3.partial"))
        );
        assert_eq!(
            dir.record_path_for("ep1"),
            Some(PathBuf::from("/downloads/ep1.json"))
        );
    }

    #[test]
    fn ids_cannot_escape_the_directory() {
        let dir = DownloadDirectory::new("/downloads");
        let path = dir.path_for("../../etc/passwd").unwrap();

        assert_eq!(path.parent(), Some(Path::new("/downloads")));
    }

    #[test]
    fn empty_id_gets_a_placeholder_stem() {
        assert!(file_stem("").starts_with("unnamed~"));
    }

    #[test]
    fn safe_ids_are_used_verbatim() {
        assert_eq!(file_stem("ep1"), "ep1");
        assert_eq!(file_stem("Episode 12 - Pilot"), "Episode 12 - Pilot");
    }

    #[test]
    fn ids_that_sanitize_alike_get_distinct_paths() {
        let dir = DownloadDirectory::new("/downloads");

        let plain = dir.path_for("ab").unwrap();
        let slashed = dir.path_for("a/b").unwrap();
        let colon = dir.path_for("a:b").unwrap();

        assert_eq!(plain, PathBuf::from("/downloads/ab.mp3"));
        assert_ne!(slashed, plain);
        assert_ne!(colon, plain);
        assert_ne!(colon, slashed);
        assert_ne!(dir.partial_path_for("a/b"), dir.partial_path_for("ab"));
        assert_eq!(slashed.parent(), Some(Path::new("/downloads")));
    }

    #[test]
    fn ids_mimicking_hashed_stems_do_not_collide() {
        let hashed = file_stem("a/b");
        assert_ne!(file_stem(&hashed), hashed);
    }

    #[test]
    fn custom_extension_drops_leading_dot() {
        let dir = DownloadDirectory::new("/downloads").with_extension(".m4a");
        assert_eq!(
            dir.path_for("ep1"),
            Some(PathBuf::from("/downloads/ep1.m4a"))
        );
    }

    #[test]
    fn unresolved_directory_yields_no_paths() {
        let dir = DownloadDirectory::unresolved();

        assert!(dir.destination_directory().is_none());
        assert!(dir.path_for("ep1").is_none());
        assert!(dir.partial_path_for("ep1").is_none());
    }
}
