//! Filesystem tool bodies. Every path is resolved against the working directory.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use glob::Pattern;
use regex::Regex;
use tracing::{debug, instrument};
use walkdir::{DirEntry, WalkDir};

use crate::core::diff::{apply_blocks, parse_blocks};

pub const NO_MATCHES: &str = "No matches found";
pub const NO_FILES: &str = "No files found";

/// Resolve a tool-supplied path. Absolute paths are taken as-is.
pub fn resolve(workdir: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workdir.join(path)
    }
}

/// Path shown to the model: relative to the working directory when inside it.
fn display_path(workdir: &Path, path: &Path) -> String {
    path.strip_prefix(workdir)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}

pub fn read_file(workdir: &Path, path: &str) -> Result<String> {
    let full = resolve(workdir, path);
    fs::read_to_string(&full).with_context(|| format!("read {}", full.display()))
}

/// Write `content`, creating parent directories. Returns the character count.
#[instrument(skip(workdir, content))]
pub fn write_file(workdir: &Path, path: &str, content: &str) -> Result<usize> {
    let full = resolve(workdir, path);
    if let Some(parent) = full.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(&full, content).with_context(|| format!("write {}", full.display()))?;
    let chars = content.chars().count();
    debug!(chars, "file written");
    Ok(chars)
}

/// Apply SEARCH/REPLACE blocks. The file is untouched unless every block applies.
#[instrument(skip(workdir, diff))]
pub fn replace_in_file(workdir: &Path, path: &str, diff: &str) -> Result<usize> {
    let full = resolve(workdir, path);
    let original =
        fs::read_to_string(&full).with_context(|| format!("read {}", full.display()))?;
    let blocks = parse_blocks(diff)?;
    let updated = apply_blocks(&original, &blocks)?;
    fs::write(&full, updated).with_context(|| format!("write {}", full.display()))?;
    Ok(blocks.len())
}

/// Regex search over files under `path`, optionally filtered by a file-name glob.
///
/// Returns `<relpath>:<line>: <text>` lines. Files that are not valid UTF-8 are skipped.
#[instrument(skip(workdir))]
pub fn search_files(
    workdir: &Path,
    path: &str,
    regex: &str,
    file_pattern: Option<&str>,
) -> Result<Vec<String>> {
    let re = Regex::new(regex).with_context(|| format!("invalid regex {regex:?}"))?;
    let pattern = file_pattern
        .map(|p| Pattern::new(p).with_context(|| format!("invalid file pattern {p:?}")))
        .transpose()?;
    let root = resolve(workdir, path);
    if !root.exists() {
        return Err(anyhow!("{} does not exist", root.display()));
    }

    let mut matches = Vec::new();
    for entry in WalkDir::new(&root).sort_by_file_name() {
        let Some(entry) = readable(entry) else {
            continue;
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if pattern.as_ref().is_some_and(|p| !p.matches(&name)) {
            continue;
        }
        let Ok(text) = fs::read_to_string(entry.path()) else {
            debug!(file = %entry.path().display(), "skipping unreadable or binary file");
            continue;
        };
        let shown = display_path(workdir, entry.path());
        for (idx, line) in text.lines().enumerate() {
            if re.is_match(line) {
                matches.push(format!("{shown}:{}: {line}", idx + 1));
            }
        }
    }
    debug!(count = matches.len(), "search finished");
    Ok(matches)
}

/// Keep walk entries that could be read; log and drop the rest.
fn readable(entry: walkdir::Result<DirEntry>) -> Option<DirEntry> {
    match entry {
        Ok(entry) => Some(entry),
        Err(err) => {
            debug!(err = %err, "skipping unreadable entry");
            None
        }
    }
}

/// Sorted entries under `path`; directories carry a trailing `/`.
#[instrument(skip(workdir))]
pub fn list_files(workdir: &Path, path: &str, recursive: bool) -> Result<Vec<String>> {
    let root = resolve(workdir, path);
    if !root.is_dir() {
        return Err(anyhow!("{} is not a directory", root.display()));
    }
    let max_depth = if recursive { usize::MAX } else { 1 };

    let mut entries = Vec::new();
    for entry in WalkDir::new(&root).min_depth(1).max_depth(max_depth) {
        let Some(entry) = readable(entry) else {
            continue;
        };
        let mut shown = display_path(workdir, entry.path());
        if entry.file_type().is_dir() {
            shown.push('/');
        }
        entries.push(shown);
    }
    entries.sort();
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> tempfile::TempDir {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("src/nested")).expect("mkdir");
        fs::write(temp.path().join("README.md"), "hello\nTODO: docs\n").expect("write");
        fs::write(temp.path().join("src/main.py"), "print('hi')\n# TODO: tests\n").expect("write");
        fs::write(temp.path().join("src/nested/util.py"), "x = 1\n").expect("write");
        temp
    }

    #[test]
    fn write_creates_parent_dirs_and_counts_characters() {
        let temp = tempfile::tempdir().expect("tempdir");
        let count = write_file(temp.path(), "a/b/c.txt", "héllo").expect("write");
        assert_eq!(count, 5);
        assert_eq!(
            fs::read_to_string(temp.path().join("a/b/c.txt")).expect("read"),
            "héllo"
        );
    }

    #[test]
    fn read_missing_file_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = read_file(temp.path(), "nope.txt").unwrap_err();
        assert!(format!("{err:#}").contains("nope.txt"));
    }

    #[test]
    fn replace_applies_all_blocks_or_none() {
        let temp = workspace();
        let diff = "<<<<<<< SEARCH\nx = 1\n=======\nx = 2\n>>>>>>> REPLACE\n";
        assert_eq!(replace_in_file(temp.path(), "src/nested/util.py", diff).expect("replace"), 1);
        assert_eq!(
            fs::read_to_string(temp.path().join("src/nested/util.py")).expect("read"),
            "x = 2\n"
        );

        let bad = "<<<<<<< SEARCH\nx = 2\n=======\nx = 3\n>>>>>>> REPLACE\n<<<<<<< SEARCH\nmissing\n=======\ny\n>>>>>>> REPLACE\n";
        assert!(replace_in_file(temp.path(), "src/nested/util.py", bad).is_err());
        assert_eq!(
            fs::read_to_string(temp.path().join("src/nested/util.py")).expect("read"),
            "x = 2\n"
        );
    }

    #[test]
    fn search_reports_relative_paths_and_line_numbers() {
        let temp = workspace();
        let hits = search_files(temp.path(), ".", "TODO", None).expect("search");
        assert_eq!(
            hits,
            vec!["README.md:2: TODO: docs", "src/main.py:2: # TODO: tests"]
        );

        let py_only = search_files(temp.path(), ".", "TODO", Some("*.py")).expect("search");
        assert_eq!(py_only, vec!["src/main.py:2: # TODO: tests"]);
    }

    #[test]
    fn search_rejects_invalid_regex() {
        let temp = workspace();
        let err = search_files(temp.path(), ".", "(unclosed", None).unwrap_err();
        assert!(err.to_string().contains("invalid regex"));
    }

    #[test]
    fn list_is_sorted_with_directory_suffix() {
        let temp = workspace();
        assert_eq!(
            list_files(temp.path(), ".", false).expect("list"),
            vec!["README.md", "src/"]
        );
        assert_eq!(
            list_files(temp.path(), ".", true).expect("list"),
            vec![
                "README.md",
                "src/",
                "src/main.py",
                "src/nested/",
                "src/nested/util.py"
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_subdirectory_does_not_fail_search_or_listing() {
        use std::os::unix::fs::PermissionsExt;

        let temp = workspace();
        let locked = temp.path().join("locked");
        fs::create_dir(&locked).expect("mkdir");
        fs::write(locked.join("secret.py"), "TODO\n").expect("write");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).expect("chmod");

        let hits = search_files(temp.path(), ".", "TODO", None);
        let listing = list_files(temp.path(), ".", true);

        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).expect("chmod back");
        let hits = hits.expect("search");
        assert!(hits.contains(&"src/main.py:2: # TODO: tests".to_string()));
        let listing = listing.expect("list");
        assert!(listing.contains(&"locked/".to_string()));
        assert!(listing.contains(&"src/nested/util.py".to_string()));
    }

    #[test]
    fn list_empty_directory_is_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(list_files(temp.path(), ".", true).expect("list").is_empty());
    }
}
