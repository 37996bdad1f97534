use crate::config::ConfigErrors;
use globset::GlobBuilder;
use ignore::{DirEntry, WalkBuilder};
use itertools::Itertools;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// An instance still under consideration
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Candidate {
    /// instance id, the file name up to `.mps`
    pub instance: String,
    pub path: PathBuf,
}

impl Candidate {
    pub fn from_path(path: impl Into<PathBuf>) -> Option<Self> {
        let path = path.into();
        let file_name = path.file_name()?.to_str()?;
        let instance = file_name.split(".mps").next()?;

        if instance.is_empty() {
            return None;
        }

        Some(Self {
            instance: instance.to_owned(),
            path,
        })
    }
}

/// All instance files directly inside `dir` matching `glob`, sorted by file name
pub fn collect_instances(dir: &Path, glob: &str) -> Result<Vec<Candidate>, ConfigErrors> {
    let matcher = GlobBuilder::new(glob)
        .literal_separator(true)
        .build()?
        .compile_matcher();

    debug!("Collecting instances in {dir:?} with glob: {glob}");

    let candidates = WalkBuilder::new(dir)
        .max_depth(Some(1))
        .standard_filters(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .build()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Failed to search for instances: {e}");
                None
            }
        })
        .filter(|entry| entry.file_type().map_or(false, |kind| kind.is_file()))
        .filter(|entry| matcher.is_match(entry.file_name()))
        .map(DirEntry::into_path)
        .filter_map(|path| {
            let candidate = Candidate::from_path(&path);
            if candidate.is_none() {
                warn!(path = ?path, "Skipping instance without a usable file name");
            }
            candidate
        })
        .collect_vec();

    let duplicates = candidates
        .iter()
        .map(|candidate| candidate.instance.as_str())
        .duplicates()
        .collect_vec();
    if !duplicates.is_empty() {
        warn!("Multiple files map to the same instance: {}", duplicates.join(", "));
    }

    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn instance_name_is_cut_at_mps() {
        let candidate = Candidate::from_path("/data/air03.mps.gz").unwrap();

        assert_eq!(candidate.instance, "air03");
        assert_eq!(candidate.path, Path::new("/data/air03.mps.gz"));
        assert_eq!(Candidate::from_path("/data/.mps"), None);
    }

    #[test]
    fn collects_sorted_matching_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["neos-5.mps", "air03.mps.gz", "notes.txt", "b.mps"] {
            fs::write(dir.path().join(name), "").unwrap();
        }
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested").join("c.mps"), "").unwrap();

        let instances = collect_instances(dir.path(), "*.mps*").unwrap();

        assert_eq!(
            instances
                .iter()
                .map(|candidate| candidate.instance.as_str())
                .collect_vec(),
            vec!["air03", "b", "neos-5"]
        );
    }
}
