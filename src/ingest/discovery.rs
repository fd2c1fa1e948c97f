//! Enumerates session files from the external source directory layout
//! (spec.md §4.4): a flat history file plus a two-levels-deep
//! `projects/<encoded-project>/<file>.jsonl` subtree.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

/// `$HOME/.claude` — the conventional session source directory
/// (spec.md §6). `None` if the home directory can't be resolved;
/// callers fall back to an explicit path in that case.
pub fn default_session_source_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".claude"))
}

#[derive(Debug, Clone)]
pub struct DiscoveredFile {
    pub path: PathBuf,
    pub modified: SystemTime,
}

/// Enumerates the flat history file (if present) and every
/// `.jsonl` file exactly two levels under `source_root/projects`,
/// sorted descending by modification time.
///
/// `project_filter`, if given, keeps only directories whose encoded
/// name plausibly matches (coarse — finer filtering happens per
/// entry via `ProjectContext::scopes`).
pub fn discover(source_root: &Path, project_filter: Option<&str>) -> anyhow::Result<Vec<DiscoveredFile>> {
    let mut files = Vec::new();

    let history_file = source_root.join("history.jsonl");
    if let Ok(meta) = fs::metadata(&history_file) {
        files.push(DiscoveredFile {
            path: history_file,
            modified: meta.modified()?,
        });
    }

    let projects_dir = source_root.join("projects");
    if projects_dir.is_dir() {
        let encoded_filter = project_filter.map(|f| f.replace('/', "-"));

        for entry in WalkDir::new(&projects_dir).min_depth(1).max_depth(1) {
            let entry = entry?;
            if !entry.file_type().is_dir() {
                continue;
            }
            if let Some(filter) = &encoded_filter {
                let dir_name = entry.file_name().to_string_lossy();
                if !dir_name.contains(filter.as_str()) && !filter.contains(dir_name.as_ref()) {
                    continue;
                }
            }

            for file_entry in WalkDir::new(entry.path()).min_depth(1).max_depth(1) {
                let file_entry = file_entry?;
                if !file_entry.file_type().is_file() {
                    continue;
                }
                if file_entry.path().extension().and_then(|e| e.to_str()) != Some("jsonl") {
                    continue;
                }
                let modified = file_entry.metadata()?.modified()?;
                files.push(DiscoveredFile {
                    path: file_entry.path().to_path_buf(),
                    modified,
                });
            }
        }
    }

    files.sort_by(|a, b| b.modified.cmp(&a.modified));
    Ok(files)
}

/// Same as [`discover`] but keeps only files whose modification time
/// is strictly newer than `since`, for incremental ingestion
/// (spec.md §4.4 `parse_new_entries`).
pub fn discover_since(
    source_root: &Path,
    project_filter: Option<&str>,
    since: SystemTime,
) -> anyhow::Result<Vec<DiscoveredFile>> {
    Ok(discover(source_root, project_filter)?
        .into_iter()
        .filter(|f| f.modified > since)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut f = File::create(path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
    }

    #[test]
    fn discovers_history_file_and_nested_project_files() {
        let dir = TempDir::new().unwrap();
        write_file(&dir.path().join("history.jsonl"), "{}");
        write_file(
            &dir.path().join("projects/-home-me-project/abc.jsonl"),
            "{}",
        );
        write_file(
            &dir.path().join("projects/-home-me-project/def.txt"),
            "ignored",
        );

        let files = discover(dir.path(), None).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|f| f.path.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert!(names.contains(&"history.jsonl".to_string()));
        assert!(names.contains(&"abc.jsonl".to_string()));
        assert!(!names.contains(&"def.txt".to_string()));
    }

    #[test]
    fn project_filter_keeps_only_matching_directories() {
        let dir = TempDir::new().unwrap();
        write_file(&dir.path().join("projects/-home-me-alpha/a.jsonl"), "{}");
        write_file(&dir.path().join("projects/-home-me-beta/b.jsonl"), "{}");

        let files = discover(dir.path(), Some("/home/me/alpha")).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path.file_name().unwrap(), "a.jsonl");
    }
}
