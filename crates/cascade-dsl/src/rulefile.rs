//! Loading rule files from disk.

use std::fs;
use std::path::{Path, PathBuf};

use hcl::{Body, Structure};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::DslError;

/// File extension of rule files.
pub const RULE_FILE_EXT: &str = "hops";

/// One loaded rule file.
#[derive(Debug, Clone)]
pub struct FileContent {
    pub path: PathBuf,
    pub content: String,
}

/// Parsed rule files with a content hash for change detection.
#[derive(Debug)]
pub struct RuleFiles {
    /// Hex SHA-256 of the concatenated file contents, in path order.
    pub hash: String,
    /// All files merged into one body.
    pub body: Body,
    pub files: Vec<FileContent>,
}

/// Load rule files from a single file or from every `.hops` file under a
/// directory, in sorted path order so the merged body is deterministic.
pub fn read_rule_files(path: impl AsRef<Path>) -> Result<RuleFiles, DslError> {
    let paths = collect_paths(path.as_ref())?;

    let mut hasher = Sha256::new();
    let mut structures: Vec<Structure> = Vec::new();
    let mut files = Vec::with_capacity(paths.len());

    for path in paths {
        let content = fs::read_to_string(&path)?;
        hasher.update(content.as_bytes());

        let body = hcl::parse(&content).map_err(|err| DslError::Parse {
            file: path.display().to_string(),
            message: err.to_string(),
        })?;
        structures.extend(body);

        files.push(FileContent { path, content });
    }

    Ok(RuleFiles {
        hash: hex::encode(hasher.finalize()),
        body: Body::from(structures),
        files,
    })
}

fn collect_paths(path: &Path) -> Result<Vec<PathBuf>, DslError> {
    let metadata = fs::metadata(path)?;
    if !metadata.is_dir() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut paths = Vec::new();
    // ConfigMap-style mounts create `..`-prefixed symlinked directories
    // shadowing the real files; skip them.
    let walker = WalkDir::new(path).into_iter().filter_entry(|entry| {
        !(entry.file_type().is_dir() && entry.file_name().to_string_lossy().starts_with(".."))
    });

    for entry in walker {
        let entry = entry.map_err(|err| DslError::Io(err.into()))?;
        if entry.file_type().is_file()
            && entry.path().extension().is_some_and(|ext| ext == RULE_FILE_EXT)
        {
            paths.push(entry.into_path());
        }
    }

    paths.sort();
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_read_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main.hops");
        fs::write(&path, "on push {}\n").unwrap();

        let rules = read_rule_files(&path).unwrap();
        assert_eq!(rules.files.len(), 1);
        assert_eq!(rules.body.blocks().count(), 1);
        assert_eq!(rules.hash.len(), 64);
    }

    #[test]
    fn test_read_directory_merges_sorted() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.hops"), "on deploy {}\n").unwrap();
        fs::write(dir.path().join("a.hops"), "on push {}\n").unwrap();
        fs::write(dir.path().join("ignored.txt"), "not rules").unwrap();

        let rules = read_rule_files(dir.path()).unwrap();
        assert_eq!(rules.files.len(), 2);
        assert!(rules.files[0].path.ends_with("a.hops"));
        assert!(rules.files[1].path.ends_with("b.hops"));
        assert_eq!(rules.body.blocks().count(), 2);
    }

    #[test]
    fn test_read_skips_mount_artifact_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let hidden = dir.path().join("..2024_data");
        fs::create_dir(&hidden).unwrap();
        fs::write(hidden.join("shadow.hops"), "on push {}\n").unwrap();
        fs::write(dir.path().join("real.hops"), "on push {}\n").unwrap();

        let rules = read_rule_files(dir.path()).unwrap();
        assert_eq!(rules.files.len(), 1);
        assert!(rules.files[0].path.ends_with("real.hops"));
    }

    #[test]
    fn test_hash_tracks_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main.hops");

        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "on push {{}}").unwrap();
        let first = read_rule_files(&path).unwrap().hash;

        writeln!(file, "on deploy {{}}").unwrap();
        let second = read_rule_files(&path).unwrap().hash;

        assert_ne!(first, second);
    }

    #[test]
    fn test_invalid_hcl_is_reported_with_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.hops");
        fs::write(&path, "on push {").unwrap();

        let err = read_rule_files(&path).unwrap_err();
        assert!(matches!(err, DslError::Parse { .. }));
        assert!(err.to_string().contains("broken.hops"));
    }
}
