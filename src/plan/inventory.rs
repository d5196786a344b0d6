//! Repository inventory: the file listing shown to the planning service.

use std::path::Path;

use ignore::WalkBuilder;

use super::types::RepoInventory;

/// Default cap on listed files.
pub const MAX_INVENTORY_FILES: usize = 250;

const SKIP_DIRS: &[&str] = &[
    ".git",
    ".venv",
    ".mypy_cache",
    ".pytest_cache",
    "node_modules",
    "dist",
    "build",
    "target",
    ".idea",
    ".vscode",
];

const INCLUDE_SUFFIXES: &[&str] = &[
    ".py", ".ts", ".js", ".java", ".rs", ".go", ".md", ".yml", ".yaml", ".toml", ".json", ".xml",
    ".gradle",
];

/// Walk `root` and list relevant files, relative to `root`, in name order.
///
/// Hidden entries and tooling/build directories are skipped, `.gitignore`
/// is respected. Stops after `max_files` entries.
pub fn scan_repo(root: &Path, max_files: usize) -> RepoInventory {
    let mut builder = WalkBuilder::new(root);
    builder
        .hidden(true)
        .filter_entry(|entry| {
            if entry.file_type().is_some_and(|ft| ft.is_dir()) {
                let name = entry.file_name().to_string_lossy();
                if SKIP_DIRS.iter().any(|s| *s == name.as_ref()) {
                    return false;
                }
            }
            true
        })
        .sort_by_file_name(Ord::cmp);

    let mut inventory = RepoInventory::default();

    for entry in builder.build().flatten() {
        if !entry.file_type().is_some_and(|ft| ft.is_file()) {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if !INCLUDE_SUFFIXES.iter().any(|s| name.ends_with(s)) {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        if inventory.files.len() >= max_files {
            inventory.truncated = true;
            break;
        }
        inventory
            .files
            .push(relative.to_string_lossy().replace('\\', "/"));
    }

    inventory
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "x").unwrap();
    }

    #[test]
    fn test_scan_lists_relevant_files() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "app/main.py");
        touch(dir.path(), "README.md");
        touch(dir.path(), "logo.png");
        touch(dir.path(), "node_modules/lib/index.js");
        touch(dir.path(), ".github/workflows/ci.yml");

        let inventory = scan_repo(dir.path(), MAX_INVENTORY_FILES);
        assert_eq!(inventory.files, vec!["README.md", "app/main.py"]);
        assert!(!inventory.truncated);
        assert_eq!(inventory.listing(), "README.md\napp/main.py");
    }

    #[test]
    fn test_scan_stops_at_limit() {
        let dir = TempDir::new().unwrap();
        for i in 0..5 {
            touch(dir.path(), &format!("m{i}.py"));
        }
        let inventory = scan_repo(dir.path(), 3);
        assert_eq!(inventory.files.len(), 3);
        assert!(inventory.truncated);
    }
}
