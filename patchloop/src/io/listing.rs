//! Recursive project listing honoring `.llmignore` and `.nocontents`.
//!
//! Both files use gitignore syntax. Ignored paths are left out entirely; no-contents paths
//! are listed by path only.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use tracing::{debug, instrument, warn};
use walkdir::WalkDir;

use crate::io::paths::AgentPaths;

/// Always excluded, in addition to `.llmignore`. Dotenv files hold provider credentials.
pub const DEFAULT_IGNORES: &[&str] = &[
    ".git/",
    ".patchloop/",
    "node_modules/",
    ".env",
    ".env.*",
];

/// Compiled ignore and no-contents matchers for one root.
#[derive(Debug)]
pub struct IgnoreRules {
    ignore: Gitignore,
    no_contents: Gitignore,
}

impl IgnoreRules {
    /// Load `.llmignore` and `.nocontents` from the root (both optional).
    pub fn load(paths: &AgentPaths) -> Result<Self> {
        let mut ignore = GitignoreBuilder::new(&paths.root);
        add_defaults(&mut ignore)?;
        add_file(&mut ignore, &paths.llmignore_path)?;
        let mut no_contents = GitignoreBuilder::new(&paths.root);
        add_file(&mut no_contents, &paths.nocontents_path)?;
        Ok(Self {
            ignore: ignore.build().context("build ignore matcher")?,
            no_contents: no_contents.build().context("build no-contents matcher")?,
        })
    }

    pub fn from_patterns(root: &Path, ignore: &[&str], no_contents: &[&str]) -> Result<Self> {
        let mut ignore_builder = GitignoreBuilder::new(root);
        add_defaults(&mut ignore_builder)?;
        for line in ignore {
            ignore_builder
                .add_line(None, line)
                .with_context(|| format!("ignore pattern '{line}'"))?;
        }
        let mut no_contents_builder = GitignoreBuilder::new(root);
        for line in no_contents {
            no_contents_builder
                .add_line(None, line)
                .with_context(|| format!("no-contents pattern '{line}'"))?;
        }
        Ok(Self {
            ignore: ignore_builder.build().context("build ignore matcher")?,
            no_contents: no_contents_builder
                .build()
                .context("build no-contents matcher")?,
        })
    }

    /// True if `rel` (relative to the root) or any of its parents is ignored.
    pub fn is_excluded(&self, rel: &Path, is_dir: bool) -> bool {
        self.ignore
            .matched_path_or_any_parents(rel, is_dir)
            .is_ignore()
    }

    pub fn contents_hidden(&self, rel: &Path) -> bool {
        self.no_contents
            .matched_path_or_any_parents(rel, false)
            .is_ignore()
    }
}

fn add_defaults(builder: &mut GitignoreBuilder) -> Result<()> {
    for line in DEFAULT_IGNORES {
        builder
            .add_line(None, line)
            .with_context(|| format!("default ignore pattern '{line}'"))?;
    }
    Ok(())
}

fn add_file(builder: &mut GitignoreBuilder, path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    if let Some(err) = builder.add(path) {
        return Err(err).with_context(|| format!("parse {}", path.display()));
    }
    debug!(path = %path.display(), "loaded ignore patterns");
    Ok(())
}

/// One listed file. `contents` is `None` when only the path is shown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedFile {
    /// Relative path with `/` separators.
    pub path: String,
    pub contents: Option<String>,
    pub omitted_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileListing {
    /// Sorted by path.
    pub files: Vec<ListedFile>,
}

impl FileListing {
    pub fn paths(&self) -> Vec<&str> {
        self.files.iter().map(|f| f.path.as_str()).collect()
    }

    pub fn render(&self) -> String {
        let mut buf = String::new();
        for file in &self.files {
            match (&file.contents, &file.omitted_reason) {
                (Some(contents), _) => {
                    buf.push_str(&format!("--- {} ---\n", file.path));
                    buf.push_str(contents);
                    if !contents.ends_with('\n') {
                        buf.push('\n');
                    }
                }
                (None, Some(reason)) => {
                    buf.push_str(&format!("--- {} ({reason}) ---\n", file.path));
                }
                (None, None) => buf.push_str(&format!("--- {} ---\n", file.path)),
            }
        }
        buf
    }
}

/// Walk `root` and list every non-ignored file, sorted by relative path.
#[instrument(skip_all, fields(root = %root.display()))]
pub fn list_files(root: &Path, rules: &IgnoreRules, max_file_bytes: u64) -> Result<FileListing> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| match entry.path().strip_prefix(root) {
            Ok(rel) => !rules.is_excluded(rel, entry.file_type().is_dir()),
            Err(_) => false,
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(%err, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("strip root from {}", entry.path().display()))?;
        files.push(describe_file(entry.path(), rel, rules, max_file_bytes));
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    debug!(count = files.len(), "listed files");
    Ok(FileListing { files })
}

fn describe_file(abs: &Path, rel: &Path, rules: &IgnoreRules, max_file_bytes: u64) -> ListedFile {
    let path = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    let path_only = |reason: String| ListedFile {
        path: path.clone(),
        contents: None,
        omitted_reason: Some(reason),
    };

    if rules.contents_hidden(rel) {
        return path_only("contents omitted".to_string());
    }
    match fs::metadata(abs) {
        Ok(meta) if meta.len() > max_file_bytes => {
            return path_only(format!("larger than {max_file_bytes} bytes"));
        }
        Ok(_) => {}
        Err(err) => return path_only(format!("unreadable: {err}")),
    }
    match fs::read(abs) {
        Ok(bytes) => match String::from_utf8(bytes) {
            Ok(contents) => ListedFile {
                path: path.clone(),
                contents: Some(contents),
                omitted_reason: None,
            },
            Err(_) => path_only("binary".to_string()),
        },
        Err(err) => path_only(format!("unreadable: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, contents).expect("write");
    }

    const TREE: &[&str] = &[
        "src/app.js",
        "src/routes/health.js",
        "src/generated/big.js",
        "dist/bundle.js",
        "logs/debug.log",
        "notes.log",
        "package.json",
        "README.md",
        ".patchloop/lastresponse.json",
        "node_modules/express/index.js",
    ];

    /// The pruned walk must agree with a per-file check of every file on disk.
    #[test]
    fn excludes_exactly_the_ignored_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        for rel in TREE {
            write(temp.path(), rel, "x");
        }
        let rules = IgnoreRules::from_patterns(
            temp.path(),
            &["# build output", "dist/", "*.log", "!notes.log", "src/generated"],
            &[],
        )
        .expect("rules");

        let listing = list_files(temp.path(), &rules, 1_000).expect("list");
        let listed: BTreeSet<&str> = listing.paths().into_iter().collect();
        let expected: BTreeSet<&str> = TREE
            .iter()
            .copied()
            .filter(|rel| !rules.is_excluded(Path::new(rel), false))
            .collect();

        assert_eq!(listed, expected);
        assert_eq!(
            listed,
            BTreeSet::from([
                "README.md",
                "notes.log",
                "package.json",
                "src/app.js",
                "src/routes/health.js"
            ])
        );
    }

    #[test]
    fn result_does_not_depend_on_creation_order() {
        let first = tempfile::tempdir().expect("tempdir");
        let second = tempfile::tempdir().expect("tempdir");
        for rel in TREE {
            write(first.path(), rel, rel);
        }
        for rel in TREE.iter().rev() {
            write(second.path(), rel, rel);
        }
        let list = |root: &Path| {
            let rules = IgnoreRules::from_patterns(root, &["*.log"], &["package.json"])
                .expect("rules");
            list_files(root, &rules, 1_000).expect("list").render()
        };
        assert_eq!(list(first.path()), list(second.path()));
    }

    #[test]
    fn no_contents_and_large_files_are_listed_by_path() {
        let temp = tempfile::tempdir().expect("tempdir");
        write(temp.path(), "package-lock.json", "{}");
        write(temp.path(), "big.txt", &"b".repeat(50));
        write(temp.path(), "small.txt", "hello");
        let rules =
            IgnoreRules::from_patterns(temp.path(), &[], &["package-lock.json"]).expect("rules");

        let listing = list_files(temp.path(), &rules, 10).expect("list");
        let rendered = listing.render();
        assert!(rendered.contains("--- big.txt (larger than 10 bytes) ---"));
        assert!(rendered.contains("--- package-lock.json (contents omitted) ---"));
        assert!(rendered.contains("--- small.txt ---\nhello\n"));
    }

    #[test]
    fn dotenv_files_are_never_listed() {
        let temp = tempfile::tempdir().expect("tempdir");
        write(temp.path(), ".env", "MISTRAL_API_KEY=sk-super-secret");
        write(temp.path(), ".env.local", "GROQ_API_KEY=gsk-secret");
        write(temp.path(), "config/.env", "OPENAI_API_KEY=sk-nested");
        write(temp.path(), "src/env.js", "module.exports = process.env;");
        let rules = IgnoreRules::from_patterns(temp.path(), &[], &[]).expect("rules");

        let listing = list_files(temp.path(), &rules, 1_000).expect("list");
        assert_eq!(listing.paths(), vec!["src/env.js"]);
        assert!(!listing.render().contains("secret"));
    }

    #[test]
    fn load_reads_ignore_files_from_root() {
        let temp = tempfile::tempdir().expect("tempdir");
        write(temp.path(), ".llmignore", "# comment\nsecret.txt\n");
        write(temp.path(), ".nocontents", "data/\n");
        write(temp.path(), "secret.txt", "s");
        write(temp.path(), "data/rows.csv", "1,2");
        let rules = IgnoreRules::load(&AgentPaths::new(temp.path())).expect("rules");

        let listing = list_files(temp.path(), &rules, 1_000).expect("list");
        assert_eq!(
            listing.paths(),
            vec![".llmignore", ".nocontents", "data/rows.csv"]
        );
        assert_eq!(listing.files[2].contents, None);
    }
}
