//! Per-turn snapshot of the working directory sent with every user message.

use std::path::Path;

use tracing::debug;
use walkdir::WalkDir;

/// Render the `<environment_details>` block for `cwd`.
///
/// Recomputed on every call; the listing holds regular files only, sorted.
/// Entries that cannot be read are left out.
pub fn environment_details(cwd: &Path) -> String {
    let files = recursive_files(cwd);
    format!(
        "<environment_details>\nCurrent Working Directory: {}\n\n# Working Directory Files (Recursive)\n{}\n</environment_details>",
        cwd.display(),
        files.join("\n")
    )
}

fn recursive_files(cwd: &Path) -> Vec<String> {
    let mut files = Vec::new();
    for entry in WalkDir::new(cwd).min_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                debug!(err = %err, "skipping unreadable entry in snapshot");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(cwd).unwrap_or(entry.path());
        files.push(rel.to_string_lossy().into_owned());
    }
    files.sort();
    files
}
