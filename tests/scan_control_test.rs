//! Integration tests for scan control: resource limits, interrupts,
//! callbacks, global and private rules, namespaces and compiled images.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use yara_engine::{
    CallbackAction, CallbackFilter, Compiler, EngineConfig, Rules, ScanConfig, ScanEvent,
    ScanWarning, YaraError,
};

fn compile(source: &str) -> Rules {
    let mut compiler = Compiler::new();
    compiler.add_source(source).unwrap();
    compiler.compile().unwrap()
}

const ENDLESS: &str = "rule endless { condition: for all i in (0..1000000000000) : (i >= 0) }";

#[test]
fn test_timeout() {
    let rules = compile(ENDLESS);
    let mut scanner = rules.scanner();
    scanner.set_timeout(Duration::from_millis(20));
    assert_eq!(scanner.scan(b"data").unwrap_err(), YaraError::Timeout);
}

#[test]
fn test_cancelled_before_scan() {
    let rules = compile("rule r { strings: $a = \"abcd\" condition: $a }");
    let flag = Arc::new(AtomicBool::new(true));
    let mut scanner = rules.scanner();
    scanner.set_cancellation(flag);
    assert_eq!(scanner.scan(b"abcd").unwrap_err(), YaraError::Cancelled);
}

#[test]
fn test_cancelled_from_another_thread() {
    let rules = compile(ENDLESS);
    let flag = Arc::new(AtomicBool::new(false));
    let mut scanner = rules.scanner();
    scanner.set_cancellation(Arc::clone(&flag));

    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        flag.store(true, Ordering::Relaxed);
    });
    assert_eq!(scanner.scan(b"data").unwrap_err(), YaraError::Cancelled);
    canceller.join().unwrap();
}

#[test]
fn test_too_many_matches() {
    let rules = compile("rule r { strings: $a = \"aa\" condition: #a == 3 }");
    let mut scanner = rules.scanner();
    scanner.set_config(ScanConfig::default().with_max_matches_per_pattern(3));
    let results = scanner.scan(b"aaaaaa").unwrap();
    assert!(results.matched("r"));
    assert_eq!(
        results.warnings,
        vec![ScanWarning::TooManyMatches {
            namespace: "default".to_string(),
            rule: "r".to_string(),
            pattern: "$a".to_string(),
        }]
    );

    let unlimited = rules.scan(b"aaaaaa").unwrap();
    assert!(!unlimited.matched("r"));
    assert!(unlimited.warnings.is_empty());
}

#[test]
fn test_verification_budget() {
    let rules = compile("rule r { strings: $a = /a(b|bb)*c/ condition: $a }");
    let mut scanner = rules.scanner();
    scanner.set_config(ScanConfig {
        max_verification_steps: 10,
        ..ScanConfig::default()
    });
    let data = [b"a".as_slice(), &[b'b'; 64], b"d"].concat();
    let results = scanner.scan(&data).unwrap();
    assert!(!results.matched("r"));
    assert!(matches!(
        results.warnings.as_slice(),
        [ScanWarning::VerificationBudget { .. }]
    ));
}

const THREE_RULES: &str = r#"
    rule first { strings: $a = "first" condition: $a }
    private rule hidden { condition: true }
    rule second { condition: filesize > 100 }
    rule third { strings: $a = "third" condition: $a }
"#;

#[test]
fn test_callback_filters() {
    let rules = compile(THREE_RULES);
    let mut scanner = rules.scanner();

    let mut matching = Vec::new();
    scanner
        .scan_with_callback(b"first third", |event| {
            if let ScanEvent::RuleMatching(rule) = event {
                matching.push(rule.identifier.clone());
            }
            CallbackAction::Continue
        })
        .unwrap();
    assert_eq!(matching, vec!["first", "third"]);

    scanner.set_config(ScanConfig::default().with_callbacks(CallbackFilter::All));
    let mut events = Vec::new();
    scanner
        .scan_with_callback(b"first third", |event| {
            events.push(match event {
                ScanEvent::RuleMatching(rule) => format!("+{}", rule.identifier),
                ScanEvent::RuleNotMatching(info) => format!("-{}", info.identifier),
            });
            CallbackAction::Continue
        })
        .unwrap();
    assert_eq!(events, vec!["+first", "-second", "+third"]);

    scanner.set_config(ScanConfig::default().with_callbacks(CallbackFilter::NonMatches));
    let mut missing = Vec::new();
    scanner
        .scan_with_callback(b"first third", |event| {
            if let ScanEvent::RuleNotMatching(info) = event {
                missing.push(info.identifier.to_string());
            }
            CallbackAction::Continue
        })
        .unwrap();
    assert_eq!(missing, vec!["second"]);
}

#[test]
fn test_callback_abort() {
    let rules = compile(THREE_RULES);
    let results = rules
        .scanner()
        .scan_with_callback(b"first third", |_| CallbackAction::Abort)
        .unwrap();
    assert!(results.aborted);
    assert_eq!(results.identifiers(), vec!["first"]);
}

#[test]
fn test_global_rules_gate_their_namespace() {
    let mut compiler = Compiler::new();
    compiler
        .add_source_with_namespace(
            "global rule big_enough { condition: filesize > 10 }\n\
             rule gated { condition: true }",
            "gated_ns",
        )
        .unwrap()
        .add_source_with_namespace("rule free { condition: true }", "other")
        .unwrap();
    let rules = compiler.compile().unwrap();

    let results = rules.scan(b"tiny").unwrap();
    assert_eq!(results.identifiers(), vec!["free"]);

    let results = rules.scan(b"long enough data").unwrap();
    assert_eq!(results.identifiers(), vec!["big_enough", "gated", "free"]);
    assert_eq!(results.get("gated").unwrap().namespace, "gated_ns");
}

#[test]
fn test_private_global_rule() {
    let rules = compile(
        "global private rule has_mz { condition: uint16(0) == 0x5A4D }\n\
         rule pe { condition: true }",
    );
    assert_eq!(rules.scan(b"MZ..").unwrap().identifiers(), vec!["pe"]);
    assert!(rules.scan(b"ELF.").unwrap().matching_rules.is_empty());
}

#[test]
fn test_metadata_and_tags() {
    let rules = compile(
        r#"rule tagged : malware banker {
            meta:
                author = "first"
                score = 75
                active = true
                author = "second"
            condition: true
        }"#,
    );
    let results = rules.scan(b"").unwrap();
    let rule = results.get("tagged").unwrap();
    assert_eq!(rule.tags, vec!["malware", "banker"]);
    assert_eq!(rule.metadata.len(), 3);
    assert_eq!(
        rule.meta("author"),
        Some(&yara_engine::MetaValue::String("second".to_string()))
    );

    let mut scanner = rules.scanner();
    scanner.set_config(ScanConfig::development());
    let results = scanner.scan(b"").unwrap();
    assert_eq!(results.get("tagged").unwrap().metadata.len(), 4);
}

#[test]
fn test_save_and_load() {
    let mut compiler = Compiler::new();
    compiler.define_variable("min", 2).unwrap();
    compiler
        .add_source("rule r { strings: $a = { 4D 5A } condition: #a >= min }")
        .unwrap();
    let rules = compiler.compile().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rules.bin");
    rules.save(&path).unwrap();
    let loaded = Rules::load(&path).unwrap();

    assert!(loaded.scan(b"MZ MZ").unwrap().matched("r"));
    let mut scanner = loaded.scanner();
    scanner.set_variable("min", 3).unwrap();
    assert!(!scanner.scan(b"MZ MZ").unwrap().matched("r"));

    assert!(matches!(
        Rules::load(dir.path().join("missing.bin")),
        Err(YaraError::Io(_))
    ));
}

#[test]
fn test_parallel_scans_share_rules() {
    let rules = Arc::new(compile("rule r { strings: $a = \"needle\" condition: $a }"));
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let rules = Arc::clone(&rules);
            thread::spawn(move || {
                let data = if i % 2 == 0 { "hay needle" } else { "hay" };
                rules.scan(data.as_bytes()).unwrap().matched("r")
            })
        })
        .collect();
    let matched: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(matched, vec![true, false, true, false]);

    let buffers: Vec<&[u8]> = vec![&b"needle"[..], b"nothing"];
    let results = rules.scanner().scan_batch(&buffers);
    assert!(results[0].as_ref().unwrap().matched("r"));
    assert!(!results[1].as_ref().unwrap().matched("r"));
}

#[test]
fn test_engine_config_from_yaml() {
    let config = EngineConfig::from_yaml_str(
        "compiler:\n  max_strings_per_rule: 1\nscan:\n  max_matches_per_pattern: 1\n",
    )
    .unwrap();

    let mut compiler = Compiler::with_config(config.compiler.clone());
    assert!(compiler
        .add_source("rule r { strings: $a = \"abcd\" $b = \"efgh\" condition: any of them }")
        .is_err());
    compiler
        .add_source("rule r { strings: $a = \"abcd\" condition: $a }")
        .unwrap();
    let rules = compiler.compile().unwrap();

    let mut scanner = rules.scanner();
    scanner.set_config(config.scan);
    let results = scanner.scan(b"abcd abcd").unwrap();
    assert_eq!(results.get("r").unwrap().patterns[0].occurrences.len(), 1);
    assert_eq!(results.warnings.len(), 1);
}

#[cfg(feature = "metrics")]
#[test]
fn test_scan_statistics() {
    let rules = compile(THREE_RULES);
    let results = rules.scan(b"first third").unwrap();
    assert_eq!(results.statistics.rules_evaluated, 4);
    assert!(results.statistics.atom_hits >= 2);
}
