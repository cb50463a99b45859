//! Content-addressed keys for build contexts
//!
//! A context is a set of `(archive path, content)` entries. Entries are kept
//! sorted by path, so the digest never depends on insertion or filesystem
//! order. Each entry is framed as path bytes, a NUL, the content length as
//! little-endian u64, then the content.

use crate::error::{Result, TaskgraphError};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

const ARG_DIRECTIVE: &str = "# %ARG ";
const INCLUDE_DIRECTIVE: &str = "# %include ";

#[derive(Debug, Clone, Default)]
pub struct ContextHasher {
    entries: BTreeMap<String, Vec<u8>>,
}

/// Archive path for `rel` under `prefix`, always `/`-separated
fn archive_path(prefix: &str, rel: &Path) -> String {
    let mut parts: Vec<String> = Vec::new();
    if !prefix.is_empty() {
        parts.push(prefix.trim_end_matches('/').to_string());
    }
    for component in rel.components() {
        if let Component::Normal(part) = component {
            parts.push(part.to_string_lossy().into_owned());
        }
    }
    parts.join("/")
}

impl ContextHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or overwrite one entry
    pub fn add(&mut self, path: impl Into<String>, content: impl Into<Vec<u8>>) -> &mut Self {
        self.entries.insert(path.into(), content.into());
        self
    }

    pub fn add_file(&mut self, path: impl Into<String>, source: impl AsRef<Path>) -> Result<&mut Self> {
        let content = std::fs::read(source)?;
        Ok(self.add(path, content))
    }

    /// Add every file below `root`, as `prefix/<relative path>`
    pub fn add_dir(&mut self, root: impl AsRef<Path>, prefix: &str) -> Result<&mut Self> {
        let root = root.as_ref();
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = entry.map_err(|e| {
                TaskgraphError::config(format!("cannot walk {}: {}", root.display(), e))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry.path().strip_prefix(root).map_err(|e| {
                TaskgraphError::config(format!("{}: {}", entry.path().display(), e))
            })?;
            let content = std::fs::read(entry.path())?;
            self.add(archive_path(prefix, rel), content);
        }
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Hex sha256 over every entry, in path order
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for (path, content) in &self.entries {
            hasher.update(path.as_bytes());
            hasher.update([0u8]);
            hasher.update((content.len() as u64).to_le_bytes());
            hasher.update(content);
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Hash a docker image context directory.
///
/// Every file of `context_dir` is added under `prefix`. The Dockerfile may
/// carry directives:
///
/// - `# %ARG NAME` makes `$NAME` in later lines expand to `args["NAME"]`
/// - `# %include path` adds `path` (file or directory, relative to
///   `topsrcdir`) under `prefix/topsrcdir/path`
///
/// The Dockerfile is hashed after `%ARG` expansion.
pub fn generate_context_hash(
    topsrcdir: &Path,
    context_dir: &Path,
    prefix: &str,
    args: &HashMap<String, String>,
) -> Result<String> {
    let mut hasher = ContextHasher::new();
    hasher.add_dir(context_dir, prefix)?;

    let dockerfile = std::fs::read_to_string(context_dir.join("Dockerfile"))?;
    let mut replacements: Vec<(Regex, String)> = Vec::new();
    let mut content = String::with_capacity(dockerfile.len());

    for line in dockerfile.split_inclusive('\n') {
        if let Some(name) = line.strip_prefix(ARG_DIRECTIVE) {
            let name = name.trim();
            let value = args
                .get(name)
                .ok_or_else(|| TaskgraphError::config(format!("missing argument: {}", name)))?;
            let pattern = Regex::new(&format!(r"\${}\b", regex::escape(name)))
                .map_err(TaskgraphError::config)?;
            replacements.push((pattern, value.clone()));
            continue;
        }

        let mut line = line.to_string();
        for (pattern, value) in &replacements {
            line = pattern.replace_all(&line, value.as_str()).into_owned();
        }
        content.push_str(&line);

        if let Some(include) = line.strip_prefix(INCLUDE_DIRECTIVE) {
            add_include(&mut hasher, topsrcdir, include.trim(), prefix)?;
        }
    }

    hasher.add(archive_path(prefix, Path::new("Dockerfile")), content);
    let digest = hasher.digest();
    debug!(
        "Context hash for {} ({} entries): {}",
        context_dir.display(),
        hasher.len(),
        digest
    );
    Ok(digest)
}

fn add_include(hasher: &mut ContextHasher, topsrcdir: &Path, include: &str, prefix: &str) -> Result<()> {
    let rel = Path::new(include);
    if rel.is_absolute() {
        return Err(TaskgraphError::config(format!(
            "extra include path cannot be absolute: {}",
            include
        )));
    }
    if rel.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(TaskgraphError::config(format!(
            "extra include path outside topsrcdir: {}",
            include
        )));
    }

    let source: PathBuf = topsrcdir.join(rel);
    if !source.exists() {
        return Err(TaskgraphError::config(format!(
            "extra include path does not exist: {}",
            include
        )));
    }

    let include_prefix = archive_path(prefix, &Path::new("topsrcdir").join(rel));
    if source.is_dir() {
        hasher.add_dir(&source, &include_prefix)?;
    } else {
        hasher.add_file(include_prefix, &source)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_digest_known_inputs() {
        let mut a = ContextHasher::new();
        a.add("b.txt", "two").add("a.txt", "one");
        let mut b = ContextHasher::new();
        b.add("a.txt", "one").add("b.txt", "two");
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.digest().len(), 64);

        let mut c = ContextHasher::new();
        c.add("a.txt", "one").add("b.txt", "twO");
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn test_framing_separates_path_and_content() {
        let mut a = ContextHasher::new();
        a.add("ab", "c");
        let mut b = ContextHasher::new();
        b.add("a", "bc");
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn test_add_dir_normalises_paths() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("top.sh"), "echo").unwrap();
        fs::write(dir.path().join("sub").join("inner.txt"), "x").unwrap();

        let mut hasher = ContextHasher::new();
        hasher.add_dir(dir.path(), "image").unwrap();
        let paths: Vec<_> = hasher.paths().collect();
        assert_eq!(paths, vec!["image/sub/inner.txt", "image/top.sh"]);
    }

    #[test]
    fn test_docker_context_args_and_includes() {
        let top = TempDir::new().unwrap();
        let context = top.path().join("images").join("base");
        fs::create_dir_all(&context).unwrap();
        fs::create_dir_all(top.path().join("scripts")).unwrap();
        fs::write(top.path().join("scripts").join("setup.sh"), "setup").unwrap();
        fs::write(
            context.join("Dockerfile"),
            "# %ARG BASE\nFROM $BASE\n# %include scripts\n",
        )
        .unwrap();

        let mut args = HashMap::new();
        args.insert("BASE".to_string(), "debian:12".to_string());
        let first = generate_context_hash(top.path(), &context, "base", &args).unwrap();

        args.insert("BASE".to_string(), "debian:11".to_string());
        let second = generate_context_hash(top.path(), &context, "base", &args).unwrap();
        assert_ne!(first, second);

        fs::write(top.path().join("scripts").join("setup.sh"), "changed").unwrap();
        let third = generate_context_hash(top.path(), &context, "base", &args).unwrap();
        assert_ne!(second, third);

        let err = generate_context_hash(top.path(), &context, "base", &HashMap::new()).unwrap_err();
        assert!(err.to_string().contains("missing argument: BASE"));
    }

    #[test]
    fn test_include_outside_topsrcdir() {
        let top = TempDir::new().unwrap();
        fs::write(top.path().join("Dockerfile"), "# %include ../etc\n").unwrap();
        let err = generate_context_hash(top.path(), top.path(), "x", &HashMap::new()).unwrap_err();
        assert!(err.to_string().contains("outside topsrcdir"));
    }

    proptest! {
        #[test]
        fn test_digest_is_order_independent(
            entries in prop::collection::btree_map("[a-z]{1,8}(/[a-z]{1,8}){0,2}", prop::collection::vec(any::<u8>(), 0..32), 0..12),
            seed in any::<u64>(),
        ) {
            let mut forward = ContextHasher::new();
            for (path, content) in &entries {
                forward.add(path.clone(), content.clone());
            }

            let mut shuffled: Vec<_> = entries.iter().collect();
            let len = shuffled.len().max(1);
            shuffled.rotate_left((seed as usize) % len);
            shuffled.reverse();
            let mut backward = ContextHasher::new();
            for (path, content) in shuffled {
                backward.add(path.clone(), content.clone());
            }

            prop_assert_eq!(forward.digest(), backward.digest());
        }
    }
}
