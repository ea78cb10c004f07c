//! Resolution of `include "path"` directives.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Source text returned for one include directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncludedSource {
    /// Name used for diagnostics and for resolving nested includes.
    pub name: String,
    pub source: String,
}

/// Supplies the text of included files.
///
/// `requested` is the path as written, `including` the name of the file
/// containing the directive (`None` for text passed to the compiler
/// directly) and `namespace` the namespace the rules are compiled into.
/// Returning `None` makes the directive a syntax error.
pub trait IncludeResolver: Send + Sync {
    fn resolve(
        &self,
        requested: &str,
        including: Option<&str>,
        namespace: &str,
    ) -> Option<IncludedSource>;
}

/// Reads includes from disk, relative to the including file's directory.
#[derive(Debug, Clone, Default)]
pub struct FileIncludeResolver {
    base_dir: Option<PathBuf>,
}

impl FileIncludeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory used for includes found in sources that are not files.
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: Some(base_dir.into()),
        }
    }

    fn candidate(&self, requested: &str, including: Option<&str>) -> PathBuf {
        let requested = Path::new(requested);
        if requested.is_absolute() {
            return requested.to_path_buf();
        }
        let parent = including
            .and_then(|file| Path::new(file).parent())
            .map(Path::to_path_buf)
            .or_else(|| self.base_dir.clone());
        match parent {
            Some(dir) => dir.join(requested),
            None => requested.to_path_buf(),
        }
    }
}

impl IncludeResolver for FileIncludeResolver {
    fn resolve(
        &self,
        requested: &str,
        including: Option<&str>,
        namespace: &str,
    ) -> Option<IncludedSource> {
        let path = self.candidate(requested, including);
        debug!(path = %path.display(), namespace, "resolving include");
        let source = fs::read_to_string(&path).ok()?;
        Some(IncludedSource {
            name: path.to_string_lossy().into_owned(),
            source,
        })
    }
}

impl<F> IncludeResolver for F
where
    F: Fn(&str, Option<&str>, &str) -> Option<String> + Send + Sync,
{
    fn resolve(
        &self,
        requested: &str,
        including: Option<&str>,
        namespace: &str,
    ) -> Option<IncludedSource> {
        self(requested, including, namespace).map(|source| IncludedSource {
            name: requested.to_string(),
            source,
        })
    }
}
