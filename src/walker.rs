use std::path::{Path, PathBuf};

use globset::GlobMatcher;

use crate::{
    error::{Error, Result},
    extract::TextExtractor,
};

/// A file found under an ingestion root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    /// Path relative to the directory that was walked.
    pub relative_path: PathBuf,
    /// Fully resolved absolute path.
    pub absolute_path: PathBuf,
}

pub fn compile_glob(pattern: &str) -> Result<GlobMatcher> {
    Ok(globset::Glob::new(pattern)
        .map_err(|e| Error::Config(format!("invalid glob pattern: {e}")))?
        .compile_matcher())
}

/// Recursively walk a directory for files the extractor supports.
///
/// Skips hidden files and directories (names starting with `.`). When a
/// glob is given, only files whose relative path matches it are returned.
/// Results are sorted by relative path.
pub fn discover_files(
    root: &Path,
    extractor: &dyn TextExtractor,
    glob: Option<&GlobMatcher>,
) -> Result<Vec<DiscoveredFile>> {
    let canonical_root = root.canonicalize()?;
    let mut results = Vec::new();
    walk_dir(&canonical_root, &canonical_root, extractor, &mut results)?;
    if let Some(glob) = glob {
        results.retain(|f| glob.is_match(&f.relative_path));
    }
    results.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(results)
}

/// Expand command-line inputs into the files to ingest.
///
/// Files are taken as given (the extractor decides later whether it can
/// read them); directories are walked with [`discover_files`].
pub fn collect_inputs(
    inputs: &[PathBuf],
    extractor: &dyn TextExtractor,
    glob: Option<&GlobMatcher>,
) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_dir() {
            files.extend(
                discover_files(input, extractor, glob)?
                    .into_iter()
                    .map(|f| f.absolute_path),
            );
        } else if input.is_file() {
            files.push(input.clone());
        } else {
            return Err(Error::NotFound {
                kind: "path",
                name: input.display().to_string(),
            });
        }
    }
    Ok(files)
}

fn walk_dir(
    root: &Path,
    current: &Path,
    extractor: &dyn TextExtractor,
    results: &mut Vec<DiscoveredFile>,
) -> Result<()> {
    for entry in std::fs::read_dir(current)? {
        let entry = entry?;
        let file_name = entry.file_name();

        if file_name.to_string_lossy().starts_with('.') {
            continue;
        }

        let path = entry.path();
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            walk_dir(root, &path, extractor, results)?;
        } else if file_type.is_symlink() {
            let Ok(resolved) = path.canonicalize() else {
                continue; // broken symlink
            };
            // Directory links are not followed, to avoid cycles.
            if resolved.is_file() && extractor.supports(&resolved) {
                results.push(discovered(root, &path, resolved));
            }
        } else if file_type.is_file() && extractor.supports(&path) {
            let resolved = path.canonicalize()?;
            results.push(discovered(root, &path, resolved));
        }
    }

    Ok(())
}

fn discovered(root: &Path, path: &Path, absolute_path: PathBuf) -> DiscoveredFile {
    DiscoveredFile {
        relative_path: path.strip_prefix(root).unwrap_or(path).to_path_buf(),
        absolute_path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::PlainTextExtractor;

    fn names(files: &[DiscoveredFile]) -> Vec<String> {
        files
            .iter()
            .map(|f| f.relative_path.to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn discovers_supported_files() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("note.md"), "# Hello").unwrap();
        std::fs::write(tmp.path().join("readme.txt"), "Hello").unwrap();
        std::fs::write(tmp.path().join("image.png"), "binary").unwrap();

        let files = discover_files(tmp.path(), &PlainTextExtractor, None).unwrap();
        assert_eq!(names(&files), vec!["note.md", "readme.txt"]);
    }

    #[test]
    fn skips_hidden_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let hidden = tmp.path().join(".git");
        std::fs::create_dir(&hidden).unwrap();
        std::fs::write(hidden.join("config.md"), "git config").unwrap();
        std::fs::write(tmp.path().join(".hidden.md"), "secret").unwrap();
        std::fs::write(tmp.path().join("notes.md"), "notes").unwrap();

        let files = discover_files(tmp.path(), &PlainTextExtractor, None).unwrap();
        assert_eq!(names(&files), vec!["notes.md"]);
    }

    #[test]
    fn recurses_and_sorts() {
        let tmp = tempfile::tempdir().unwrap();
        let sub = tmp.path().join("b");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(sub.join("deep.md"), "deep").unwrap();
        std::fs::write(tmp.path().join("z.md"), "z").unwrap();
        std::fs::write(tmp.path().join("a.md"), "a").unwrap();

        let files = discover_files(tmp.path(), &PlainTextExtractor, None).unwrap();
        assert_eq!(names(&files), vec!["a.md", "b/deep.md", "z.md"]);
        assert!(files.iter().all(|f| f.absolute_path.is_absolute()));
    }

    #[test]
    fn glob_filters_relative_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let sub = tmp.path().join("guides");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(sub.join("setup.md"), "setup").unwrap();
        std::fs::write(tmp.path().join("todo.txt"), "todo").unwrap();

        let glob = compile_glob("guides/*.md").unwrap();
        let files =
            discover_files(tmp.path(), &PlainTextExtractor, Some(&glob)).unwrap();
        assert_eq!(names(&files), vec!["guides/setup.md"]);

        assert!(compile_glob("[").is_err());
    }

    #[test]
    fn collect_inputs_mixes_files_and_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("docs");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join("one.md"), "one").unwrap();
        let single = tmp.path().join("two.txt");
        std::fs::write(&single, "two").unwrap();

        let files = collect_inputs(
            &[single.clone(), dir.clone()],
            &PlainTextExtractor,
            None,
        )
        .unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0], single);
        assert!(files[1].ends_with("docs/one.md"));

        let missing = tmp.path().join("missing");
        assert!(matches!(
            collect_inputs(&[missing], &PlainTextExtractor, None),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn empty_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let files = discover_files(tmp.path(), &PlainTextExtractor, None).unwrap();
        assert!(files.is_empty());
    }
}
