//! Binary images of compiled rule sets.
//!
//! An image is a fixed header followed by a MessagePack body:
//!
//! ```text
//! +--------+-----------------+---------------------------+
//! | "YRLE" | version u32 LE  | rmp-serde encoded `Rules` |
//! +--------+-----------------+---------------------------+
//! ```
//!
//! The atom automaton and other derived indexes are not stored; they are
//! rebuilt on load.

use crate::error::{Result, YaraError};
use crate::rules::Rules;
use tracing::debug;

const MAGIC: [u8; 4] = *b"YRLE";
const HEADER_LEN: usize = 8;

/// Bumped whenever the encoded layout of `Rules` changes.
pub(crate) const FORMAT_VERSION: u32 = 1;

pub(crate) fn to_bytes(rules: &Rules) -> Result<Vec<u8>> {
    let body = rmp_serde::to_vec_named(rules)
        .map_err(|e| YaraError::InvalidImage(format!("encoding failed: {e}")))?;
    let mut image = Vec::with_capacity(HEADER_LEN + body.len());
    image.extend_from_slice(&MAGIC);
    image.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    image.extend_from_slice(&body);
    debug!(bytes = image.len(), rules = rules.len(), "rules serialized");
    Ok(image)
}

pub(crate) fn from_bytes(image: &[u8]) -> Result<Rules> {
    if image.len() < HEADER_LEN || image[..4] != MAGIC {
        return Err(YaraError::InvalidImage("missing image header".to_string()));
    }
    let mut version = [0u8; 4];
    version.copy_from_slice(&image[4..HEADER_LEN]);
    let found = u32::from_le_bytes(version);
    if found != FORMAT_VERSION {
        return Err(YaraError::IncompatibleImage {
            found,
            expected: FORMAT_VERSION,
        });
    }
    let mut rules: Rules = rmp_serde::from_slice(&image[HEADER_LEN..])
        .map_err(|e| YaraError::InvalidImage(e.to_string()))?;
    rules.rebuild_indexes()?;
    debug!(rules = rules.len(), "rules deserialized");
    Ok(rules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::MetaValue;
    use crate::{Compiler, ScanConfig};

    fn compiled() -> Rules {
        let mut compiler = Compiler::new();
        compiler
            .add_source(
                "private rule helper { strings: $h = { 4D 5A } condition: $h at 0 }\n\
                 rule first : pe { meta: v = 1 v = 2 strings: $a = \"abc\" nocase \
                 condition: helper and $a }",
            )
            .unwrap();
        compiler
            .add_source_with_namespace("global rule gate { condition: filesize > 2 }", "other")
            .unwrap();
        compiler.compile().unwrap()
    }

    #[test]
    fn test_image_preserves_rules() {
        let rules = compiled();
        let loaded = Rules::deserialize(&rules.serialize().unwrap()).unwrap();

        let before: Vec<_> = rules.iter().collect();
        let after: Vec<_> = loaded.iter().collect();
        assert_eq!(before, after);
        assert_eq!(after[2].namespace, "other");
        assert!(after[2].is_global);
        assert!(after[0].is_private);
        assert_eq!(
            after[1].metadata,
            [
                ("v".to_string(), MetaValue::Integer(1)),
                ("v".to_string(), MetaValue::Integer(2)),
            ]
        );
        assert_eq!(loaded.prefilter_stats(), rules.prefilter_stats());
    }

    #[test]
    fn test_loaded_rules_scan() {
        let loaded = Rules::deserialize(&compiled().serialize().unwrap()).unwrap();
        let results = loaded.scan(b"MZ..ABC").unwrap();
        assert_eq!(results.identifiers(), vec!["first", "gate"]);

        let mut scanner = loaded.scanner();
        scanner.set_config(ScanConfig {
            allow_duplicate_metadata: true,
            ..ScanConfig::default()
        });
        let results = scanner.scan(b"MZ..ABC").unwrap();
        assert_eq!(results.get("first").unwrap().metadata.len(), 2);
    }

    #[test]
    fn test_version_mismatch() {
        let mut image = compiled().serialize().unwrap();
        image[4..8].copy_from_slice(&(FORMAT_VERSION + 1).to_le_bytes());
        assert_eq!(
            Rules::deserialize(&image).unwrap_err(),
            YaraError::IncompatibleImage {
                found: FORMAT_VERSION + 1,
                expected: FORMAT_VERSION,
            }
        );
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            Rules::deserialize(b"not an image"),
            Err(YaraError::InvalidImage(_))
        ));
        assert!(matches!(
            Rules::deserialize(b"YRL"),
            Err(YaraError::InvalidImage(_))
        ));
        let mut truncated = compiled().serialize().unwrap();
        truncated.truncate(truncated.len() / 2);
        assert!(matches!(
            Rules::deserialize(&truncated),
            Err(YaraError::InvalidImage(_))
        ));
    }
}
