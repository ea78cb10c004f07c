//! Rule compiler.
//!
//! Turns rule source text into an immutable [`Rules`] set. The compiler is
//! organized into several sub-modules:
//! - [`lexer`] and [`parser`] - tokenization and parsing into a syntax tree
//! - [`patterns`] and [`hex`] - lowering of text, hex and regex patterns into
//!   searchable forms with atoms
//! - [`codegen`] - name resolution and type checking of conditions
//! - [`diagnostics`] - the warning channel
//! - [`include`] - `include` directive resolution
//!
//! # Examples
//!
//! ```rust
//! use yara_engine::Compiler;
//!
//! let mut compiler = Compiler::new();
//! compiler.add_source(r#"
//!     rule mz_header {
//!         strings:
//!             $mz = "This program"
//!         condition:
//!             $mz at 0
//!     }
//! "#)?;
//! let rules = compiler.compile()?;
//! assert_eq!(rules.iter().count(), 1);
//! # Ok::<(), yara_engine::YaraError>(())
//! ```

mod ast;
pub(crate) mod codegen;
pub mod diagnostics;
pub(crate) mod hex;
pub mod include;
pub(crate) mod lexer;
pub(crate) mod parser;
pub(crate) mod patterns;

pub use diagnostics::{Diagnostic, Diagnostics, WarningKind};
pub use include::{FileIncludeResolver, IncludeResolver, IncludedSource};

use crate::config::CompilerConfig;
use crate::error::{Result, YaraError};
use crate::ir::{CompiledPattern, CompiledRule, ExternalDecl, ExternalValue, RuleId};
use crate::rules::Rules;
use codegen::{compile_condition, RuleScope};
use parser::{parse_source, IncludeState};
use patterns::lower_pattern;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

pub const DEFAULT_NAMESPACE: &str = "default";

/// Compiles rule sources into a [`Rules`] set.
///
/// Sources are added one at a time; each one is either accepted entirely or
/// rejected with the first error it contains, leaving the compiler as it was
/// before the call.
pub struct Compiler {
    config: CompilerConfig,
    include_resolver: Option<Box<dyn IncludeResolver>>,
    externals: Vec<ExternalDecl>,
    rules: Vec<CompiledRule>,
    patterns: Vec<CompiledPattern>,
    /// Rule identifiers per namespace.
    namespaces: HashMap<String, HashMap<String, RuleId>>,
    imports: Vec<String>,
    diagnostics: Diagnostics,
}

/// Rules and patterns of one source, committed only once it compiled cleanly.
struct Staged {
    rules: Vec<CompiledRule>,
    patterns: Vec<CompiledPattern>,
    names: HashMap<String, RuleId>,
    imports: Vec<String>,
}

impl std::fmt::Debug for Compiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compiler")
            .field("config", &self.config)
            .field("rules", &self.rules.len())
            .field("patterns", &self.patterns.len())
            .field("imports", &self.imports)
            .finish_non_exhaustive()
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Compiler {
    /// Create a compiler with the default configuration and a filesystem
    /// include resolver.
    pub fn new() -> Self {
        Self::with_config(CompilerConfig::default())
    }

    /// Create a compiler with a custom configuration.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use yara_engine::{Compiler, CompilerConfig};
    ///
    /// let mut compiler = Compiler::with_config(CompilerConfig::sandboxed());
    /// assert!(compiler.add_source("include \"other.yar\"").is_err());
    /// ```
    pub fn with_config(config: CompilerConfig) -> Self {
        Self {
            config,
            include_resolver: Some(Box::new(FileIncludeResolver::new())),
            externals: Vec::new(),
            rules: Vec::new(),
            patterns: Vec::new(),
            namespaces: HashMap::new(),
            imports: Vec::new(),
            diagnostics: Diagnostics::default(),
        }
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    /// Replace the include resolver.
    pub fn set_include_resolver(&mut self, resolver: impl IncludeResolver + 'static) -> &mut Self {
        self.include_resolver = Some(Box::new(resolver));
        self
    }

    /// Reject every `include` directive from now on.
    pub fn disable_includes(&mut self) -> &mut Self {
        self.config.includes_enabled = false;
        self
    }

    /// Declare an external variable; its type is fixed by `default`.
    ///
    /// Only sources added after the declaration can reference it.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use yara_engine::Compiler;
    ///
    /// let mut compiler = Compiler::new();
    /// compiler.define_variable("max_size", 1024)?;
    /// compiler.add_source("rule small { condition: filesize < max_size }")?;
    /// # Ok::<(), yara_engine::YaraError>(())
    /// ```
    pub fn define_variable(
        &mut self,
        name: &str,
        default: impl Into<ExternalValue>,
    ) -> Result<&mut Self> {
        if self.externals.iter().any(|e| e.name == name) {
            return Err(YaraError::Compilation(format!(
                "external variable \"{name}\" is already defined"
            )));
        }
        self.externals.push(ExternalDecl {
            name: name.to_string(),
            default: default.into(),
        });
        Ok(self)
    }

    /// Add rules to the `default` namespace.
    pub fn add_source(&mut self, source: &str) -> Result<&mut Self> {
        self.add_source_with_namespace(source, DEFAULT_NAMESPACE)
    }

    pub fn add_source_with_namespace(&mut self, source: &str, namespace: &str) -> Result<&mut Self> {
        self.add(source, None, namespace)?;
        Ok(self)
    }

    /// Add the rules of a file to the `default` namespace. Includes inside it
    /// resolve relative to the file.
    pub fn add_file(&mut self, path: impl AsRef<Path>) -> Result<&mut Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)?;
        let name = path.display().to_string();
        self.add(&source, Some(&name), DEFAULT_NAMESPACE)?;
        Ok(self)
    }

    /// Warnings accumulated so far.
    pub fn warnings(&self) -> &[Diagnostic] {
        self.diagnostics.warnings()
    }

    /// Finish compilation.
    ///
    /// # Errors
    /// Returns [`YaraError::Warnings`] with every accumulated warning when
    /// `error_on_warning` is set and any warning was raised.
    pub fn compile(self) -> Result<Rules> {
        let warnings = self.diagnostics.finish(self.config.error_on_warning)?;
        info!(
            rules = self.rules.len(),
            patterns = self.patterns.len(),
            warnings = warnings.len(),
            "compiled rule set"
        );
        Rules::new(
            self.rules,
            self.patterns,
            self.externals,
            self.imports,
            warnings,
        )
    }

    fn add(&mut self, source: &str, file: Option<&str>, namespace: &str) -> Result<()> {
        let mut diagnostics = std::mem::take(&mut self.diagnostics);
        let mark = diagnostics.len();
        let staged = self.stage(source, file, namespace, &mut diagnostics);
        if staged.is_err() {
            diagnostics.truncate(mark);
        }
        self.diagnostics = diagnostics;
        let staged = staged?;

        debug!(
            namespace,
            rules = staged.rules.len(),
            patterns = staged.patterns.len(),
            "source added"
        );
        self.rules.extend(staged.rules);
        self.patterns.extend(staged.patterns);
        self.namespaces.insert(namespace.to_string(), staged.names);
        for module in staged.imports {
            if !self.imports.contains(&module) {
                self.imports.push(module);
            }
        }
        Ok(())
    }

    fn stage(
        &self,
        source: &str,
        file: Option<&str>,
        namespace: &str,
        diagnostics: &mut Diagnostics,
    ) -> Result<Staged> {
        let mut includes = IncludeState::new(
            self.include_resolver.as_deref(),
            self.config.includes_enabled,
            namespace,
        );
        let unit = parse_source(source, file, &mut includes)?;

        let mut staged = Staged {
            rules: Vec::with_capacity(unit.rules.len()),
            patterns: Vec::new(),
            names: self.namespaces.get(namespace).cloned().unwrap_or_default(),
            imports: unit.imports,
        };

        for decl in &unit.rules {
            if staged.names.contains_key(&decl.name) {
                return Err(YaraError::syntax(
                    decl.location.clone(),
                    format!("duplicated identifier \"{}\"", decl.name),
                ));
            }
            if decl.patterns.len() > self.config.max_strings_per_rule {
                return Err(YaraError::syntax(
                    decl.location.clone(),
                    format!(
                        "rule \"{}\" has too many strings (limit {})",
                        decl.name, self.config.max_strings_per_rule
                    ),
                ));
            }

            let rule_id = self.rules.len() + staged.rules.len();
            let mut ids = Vec::with_capacity(decl.patterns.len());
            let mut pattern_ids = Vec::with_capacity(decl.patterns.len());
            for pattern in &decl.patterns {
                let lowered = lower_pattern(pattern, self.config.max_program_size)?;
                let identifier = format!("${}", pattern.name);
                if lowered.slow {
                    diagnostics.warn(Diagnostic::new(
                        WarningKind::SlowPattern,
                        pattern.location.clone(),
                        format!("string \"{identifier}\" may slow down scanning"),
                    ));
                }
                let id = self.patterns.len() + staged.patterns.len();
                staged.patterns.push(CompiledPattern {
                    identifier,
                    rule: rule_id,
                    kind: lowered.kind,
                    fullword: pattern.modifiers.fullword,
                    private: pattern.modifiers.private,
                    forms: lowered.forms,
                    line: pattern.location.line,
                });
                ids.push((pattern.name.clone(), id));
                pattern_ids.push(id);
            }

            let scope = RuleScope {
                file: decl.location.file.as_deref(),
                externals: &self.externals,
                rules: &staged.names,
                imports: &decl.imports,
                patterns: &ids,
            };
            let condition = compile_condition(scope, &decl.condition, diagnostics)?;

            for (pattern, (name, id)) in decl.patterns.iter().zip(&ids) {
                if !name.is_empty()
                    && !name.starts_with('_')
                    && !condition.used_patterns.contains(id)
                {
                    return Err(YaraError::syntax(
                        pattern.location.clone(),
                        format!("unreferenced string \"${name}\""),
                    ));
                }
            }

            staged.rules.push(CompiledRule {
                identifier: decl.name.clone(),
                namespace: namespace.to_string(),
                tags: decl.tags.clone(),
                metadata: decl.metadata.clone(),
                is_global: decl.is_global,
                is_private: decl.is_private,
                patterns: pattern_ids,
                condition: condition.expr,
                variable_slots: condition.variable_slots,
                imports: decl.imports.clone(),
                line: decl.location.line,
            });
            staged.names.insert(decl.name.clone(), rule_id);
        }
        Ok(staged)
    }
}
