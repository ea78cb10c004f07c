//! The compiled, immutable rule set.

use crate::compiler::Diagnostic;
use crate::error::Result;
use crate::ir::{CompiledPattern, CompiledRule, ExternalDecl};
use crate::scanner::prefilter::{AtomPrefilter, PrefilterStats};
use crate::scanner::{RuleInfo, ScanResults, Scanner};
use crate::serialize;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Rules produced by [`Compiler::compile`](crate::Compiler::compile).
///
/// `Rules` is immutable and `Sync`; one set can serve any number of
/// concurrent scans.
///
/// # Examples
///
/// ```rust
/// use yara_engine::Compiler;
///
/// let mut compiler = Compiler::new();
/// compiler.add_source("rule always { condition: true }")?;
/// let rules = compiler.compile()?;
///
/// let results = rules.scan(b"any data")?;
/// assert_eq!(results.identifiers(), vec!["always"]);
/// # Ok::<(), yara_engine::YaraError>(())
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rules {
    pub(crate) rules: Vec<CompiledRule>,
    pub(crate) patterns: Vec<CompiledPattern>,
    pub(crate) externals: Vec<ExternalDecl>,
    /// Every module imported by any source.
    pub(crate) imports: Vec<String>,
    pub(crate) warnings: Vec<Diagnostic>,
    #[serde(skip)]
    pub(crate) prefilter: AtomPrefilter,
    #[serde(skip)]
    pub(crate) needs_entrypoint: bool,
}

impl Rules {
    pub(crate) fn new(
        rules: Vec<CompiledRule>,
        patterns: Vec<CompiledPattern>,
        externals: Vec<ExternalDecl>,
        imports: Vec<String>,
        warnings: Vec<Diagnostic>,
    ) -> Result<Self> {
        let mut set = Self {
            rules,
            patterns,
            externals,
            imports,
            warnings,
            prefilter: AtomPrefilter::default(),
            needs_entrypoint: false,
        };
        set.rebuild_indexes()?;
        Ok(set)
    }

    /// Recompute the state that is derived rather than stored.
    pub(crate) fn rebuild_indexes(&mut self) -> Result<()> {
        self.prefilter = AtomPrefilter::build(&self.patterns)?;
        self.needs_entrypoint = self.rules.iter().any(|r| r.condition.uses_entrypoint());
        Ok(())
    }

    /// Scan with the default configuration.
    pub fn scan(&self, data: &[u8]) -> Result<ScanResults> {
        self.scanner().scan(data)
    }

    /// A scanner for binding variables, modules and limits.
    pub fn scanner(&self) -> Scanner<'_> {
        Scanner::new(self)
    }

    /// Scan several buffers in parallel with the default configuration.
    pub fn scan_batch(&self, buffers: &[&[u8]]) -> Vec<Result<ScanResults>> {
        buffers.par_iter().map(|data| self.scan(data)).collect()
    }

    /// Every rule, private ones included, in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = RuleInfo<'_>> {
        self.rules.iter().map(RuleInfo::from)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Warnings raised while compiling.
    pub fn warnings(&self) -> &[Diagnostic] {
        &self.warnings
    }

    /// Modules the rules import, for hosts that only load what is needed.
    pub fn imports(&self) -> &[String] {
        &self.imports
    }

    pub fn prefilter_stats(&self) -> PrefilterStats {
        self.prefilter.stats()
    }

    /// Encode into a self-describing binary image.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize::to_bytes(self)
    }

    /// Decode an image produced by [`serialize`](Self::serialize).
    ///
    /// # Errors
    /// [`YaraError::IncompatibleImage`](crate::YaraError::IncompatibleImage)
    /// for images written by a different format version,
    /// [`YaraError::InvalidImage`](crate::YaraError::InvalidImage) for
    /// anything that is not an image.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        serialize::from_bytes(bytes)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.serialize()?)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::deserialize(&std::fs::read(path)?)
    }
}

impl<'r> IntoIterator for &'r Rules {
    type Item = RuleInfo<'r>;
    type IntoIter =
        std::iter::Map<std::slice::Iter<'r, CompiledRule>, fn(&'r CompiledRule) -> RuleInfo<'r>>;

    fn into_iter(self) -> Self::IntoIter {
        self.rules
            .iter()
            .map(RuleInfo::from as fn(&'r CompiledRule) -> RuleInfo<'r>)
    }
}

#[cfg(test)]
mod tests {
    use crate::Compiler;

    #[test]
    fn test_iter_includes_private_rules() {
        let mut compiler = Compiler::new();
        compiler
            .add_source(
                "private rule helper : internal { meta: author = \"x\" condition: true }\n\
                 global rule gate { condition: helper }",
            )
            .unwrap();
        let rules = compiler.compile().unwrap();
        let infos: Vec<_> = rules.iter().collect();
        assert_eq!(infos.len(), 2);
        assert!(infos[0].is_private);
        assert_eq!(infos[0].tags, ["internal".to_string()]);
        assert!(infos[1].is_global);
        assert_eq!((&rules).into_iter().count(), 2);
    }

    #[test]
    fn test_prefilter_stats() {
        let mut compiler = Compiler::new();
        compiler
            .add_source(
                "rule r { strings: $a = \"abcdef\" $b = /x.*y/ $c = \"abcdef\" wide \
                 condition: any of them }",
            )
            .unwrap();
        let rules = compiler.compile().unwrap();
        let stats = rules.prefilter_stats();
        assert_eq!(stats.atom_count, 3);
        assert_eq!(stats.unanchored_forms, 0);
    }

    #[test]
    fn test_batch_scan() {
        let mut compiler = Compiler::new();
        compiler
            .add_source("rule r { strings: $a = \"needle\" condition: $a }")
            .unwrap();
        let rules = compiler.compile().unwrap();
        let buffers: Vec<&[u8]> = vec![&b"hay needle hay"[..], b"only hay", b"needle"];
        let matched: Vec<bool> = rules
            .scan_batch(&buffers)
            .into_iter()
            .map(|r| r.unwrap().matched("r"))
            .collect();
        assert_eq!(matched, vec![true, false, true]);
    }
}
