//! Unified configuration for the YARA engine.
//!
//! Configuration is split by lifecycle phase: [`CompilerConfig`] controls how
//! rule source is turned into a [`Rules`](crate::Rules) set, [`ScanConfig`]
//! controls the per-scan resource limits and reporting. [`EngineConfig`]
//! bundles both and can be loaded from YAML.

use crate::error::{Result, YaraError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which rule results are delivered to a scan callback.
///
/// # Examples
///
/// ```rust
/// use yara_engine::CallbackFilter;
///
/// assert!(CallbackFilter::All.wants(true));
/// assert!(CallbackFilter::All.wants(false));
/// assert!(!CallbackFilter::Matches.wants(false));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackFilter {
    /// Only rules whose condition held.
    #[default]
    Matches,
    /// Only rules whose condition did not hold.
    NonMatches,
    /// Every non-private rule.
    All,
}

impl CallbackFilter {
    pub fn wants(self, matched: bool) -> bool {
        match self {
            CallbackFilter::Matches => matched,
            CallbackFilter::NonMatches => !matched,
            CallbackFilter::All => true,
        }
    }
}

/// Compile-time limits and behavior switches.
///
/// # Examples
///
/// ```rust
/// use yara_engine::CompilerConfig;
///
/// let config = CompilerConfig::strict();
/// assert!(config.error_on_warning);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// Maximum number of patterns a single rule may declare.
    ///
    /// Exceeding it is a syntax error on the offending rule.
    pub max_strings_per_rule: usize,

    /// Promote every compiler warning to a fatal error when `compile` runs.
    pub error_on_warning: bool,

    /// Whether `include` directives are honored at all.
    ///
    /// When disabled, any `include` is a syntax error.
    pub includes_enabled: bool,

    /// Upper bound on the instruction count of a single regex or hex program.
    pub max_program_size: usize,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            max_strings_per_rule: 10_000,
            error_on_warning: false,
            includes_enabled: true,
            max_program_size: 1 << 20,
        }
    }
}

impl CompilerConfig {
    /// Treat every warning as an error.
    pub fn strict() -> Self {
        Self {
            error_on_warning: true,
            ..Self::default()
        }
    }

    /// Builds for untrusted rule sources: no includes and small programs.
    pub fn sandboxed() -> Self {
        Self {
            includes_enabled: false,
            max_strings_per_rule: 1_000,
            max_program_size: 1 << 16,
            ..Self::default()
        }
    }
}

/// Per-scan limits and reporting options.
///
/// Resource limits degrade results predictably rather than failing the scan:
/// patterns that hit [`max_matches_per_pattern`](Self::max_matches_per_pattern)
/// or [`max_verification_steps`](Self::max_verification_steps) raise a scan
/// warning and stop collecting. Only the [`timeout`](Self::timeout) aborts.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use yara_engine::ScanConfig;
///
/// let config = ScanConfig::default().with_timeout(Duration::from_secs(5));
/// assert_eq!(config.timeout, Some(Duration::from_secs(5)));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Occurrences stored per pattern before the "too many matches" warning.
    pub max_matches_per_pattern: usize,

    /// Bytes of matched data copied into each reported occurrence.
    pub max_match_data: usize,

    /// Wall-clock budget for one scan.
    #[serde(with = "duration_ms")]
    pub timeout: Option<Duration>,

    /// Backtracking steps allowed while verifying one candidate occurrence.
    pub max_verification_steps: u64,

    /// Ceiling on the bytes an unbounded hex jump (`[n-]`) may skip.
    pub max_unbounded_gap: Option<usize>,

    /// Which rule results reach the scan callback.
    pub callbacks: CallbackFilter,

    /// Report every value of duplicated metadata keys instead of the last one.
    pub allow_duplicate_metadata: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_matches_per_pattern: 1_000_000,
            max_match_data: 512,
            timeout: None,
            max_verification_steps: 1_000_000,
            max_unbounded_gap: None,
            callbacks: CallbackFilter::Matches,
            allow_duplicate_metadata: false,
        }
    }
}

impl ScanConfig {
    /// Tight limits for scanning large volumes of data.
    pub fn high_throughput() -> Self {
        Self {
            max_matches_per_pattern: 1_000,
            max_match_data: 64,
            timeout: Some(Duration::from_secs(10)),
            max_verification_steps: 100_000,
            max_unbounded_gap: Some(1 << 20),
            ..Self::default()
        }
    }

    /// Generous limits and full callback reporting for rule development.
    pub fn development() -> Self {
        Self {
            callbacks: CallbackFilter::All,
            allow_duplicate_metadata: true,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_callbacks(mut self, callbacks: CallbackFilter) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn with_max_matches_per_pattern(mut self, max: usize) -> Self {
        self.max_matches_per_pattern = max;
        self
    }
}

/// Both configuration halves in one document.
///
/// # Examples
///
/// ```rust
/// use yara_engine::EngineConfig;
///
/// let config = EngineConfig::from_yaml_str(
///     "compiler:\n  error_on_warning: true\nscan:\n  timeout: 2500\n",
/// )?;
/// assert!(config.compiler.error_on_warning);
/// assert_eq!(config.scan.timeout.map(|t| t.as_millis()), Some(2500));
/// # Ok::<(), yara_engine::YaraError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub compiler: CompilerConfig,
    pub scan: ScanConfig,
}

impl EngineConfig {
    pub fn strict() -> Self {
        Self {
            compiler: CompilerConfig::strict(),
            scan: ScanConfig::default(),
        }
    }

    pub fn high_throughput() -> Self {
        Self {
            compiler: CompilerConfig::default(),
            scan: ScanConfig::high_throughput(),
        }
    }

    pub fn development() -> Self {
        Self {
            compiler: CompilerConfig::default(),
            scan: ScanConfig::development(),
        }
    }

    /// Parse a YAML document; missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`YaraError::Io`] describing the YAML problem.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| YaraError::Io(format!("invalid configuration: {e}")))
    }
}

/// `Option<Duration>` as an optional millisecond count.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        value
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compiler_defaults() {
        let config = CompilerConfig::default();
        assert_eq!(config.max_strings_per_rule, 10_000);
        assert!(!config.error_on_warning);
        assert!(config.includes_enabled);
    }

    #[test]
    fn test_compiler_presets() {
        assert!(CompilerConfig::strict().error_on_warning);
        let sandboxed = CompilerConfig::sandboxed();
        assert!(!sandboxed.includes_enabled);
        assert!(sandboxed.max_program_size < CompilerConfig::default().max_program_size);
    }

    #[test]
    fn test_scan_defaults() {
        let config = ScanConfig::default();
        assert_eq!(config.max_matches_per_pattern, 1_000_000);
        assert_eq!(config.timeout, None);
        assert_eq!(config.callbacks, CallbackFilter::Matches);
        assert!(!config.allow_duplicate_metadata);
    }

    #[test]
    fn test_scan_presets() {
        let fast = ScanConfig::high_throughput();
        assert!(fast.timeout.is_some());
        assert!(fast.max_matches_per_pattern < ScanConfig::default().max_matches_per_pattern);

        let dev = ScanConfig::development();
        assert_eq!(dev.callbacks, CallbackFilter::All);
        assert!(dev.allow_duplicate_metadata);
    }

    #[test]
    fn test_scan_builders() {
        let config = ScanConfig::default()
            .with_timeout(Duration::from_millis(10))
            .with_callbacks(CallbackFilter::NonMatches)
            .with_max_matches_per_pattern(7);
        assert_eq!(config.timeout, Some(Duration::from_millis(10)));
        assert_eq!(config.callbacks, CallbackFilter::NonMatches);
        assert_eq!(config.max_matches_per_pattern, 7);
    }

    #[test]
    fn test_callback_filter() {
        assert!(CallbackFilter::Matches.wants(true));
        assert!(!CallbackFilter::Matches.wants(false));
        assert!(CallbackFilter::NonMatches.wants(false));
        assert!(!CallbackFilter::NonMatches.wants(true));
    }

    #[test]
    fn test_engine_presets() {
        assert!(EngineConfig::strict().compiler.error_on_warning);
        assert!(EngineConfig::high_throughput().scan.timeout.is_some());
        assert_eq!(
            EngineConfig::development().scan.callbacks,
            CallbackFilter::All
        );
    }

    #[test]
    fn test_yaml_partial_document() {
        let config = EngineConfig::from_yaml_str(
            "scan:\n  max_matches_per_pattern: 5\n  callbacks: non_matches\n",
        )
        .unwrap();
        assert_eq!(config.scan.max_matches_per_pattern, 5);
        assert_eq!(config.scan.callbacks, CallbackFilter::NonMatches);
        assert_eq!(config.compiler, CompilerConfig::default());
    }

    #[test]
    fn test_yaml_round_trip() {
        let config = EngineConfig::high_throughput();
        let yaml = serde_yaml::to_string(&config).unwrap();
        assert_eq!(EngineConfig::from_yaml_str(&yaml).unwrap(), config);
    }

    #[test]
    fn test_yaml_invalid() {
        let err = EngineConfig::from_yaml_str("scan: [1, 2").unwrap_err();
        assert!(err.to_string().contains("invalid configuration"));
    }
}
