//! Integration tests for condition semantics: pattern operators,
//! quantifiers, loops, arithmetic, undefined values, rule references,
//! external variables and module data.

use serde_json::json;
use std::collections::BTreeMap;
use yara_engine::{
    Compiler, ModuleFunction, ModuleValue, Rules, StaticModules, WarningKind, YaraError,
};

fn compile(source: &str) -> Rules {
    let mut compiler = Compiler::new();
    compiler.add_source(source).unwrap();
    compiler.compile().unwrap()
}

/// Evaluates a bare condition against `data`.
fn holds(condition: &str, data: &[u8]) -> bool {
    let rules = compile(&format!("rule t {{ condition: {condition} }}"));
    rules.scan(data).unwrap().matched("t")
}

/// Evaluates a condition over `$a = "abc"`, `$b = "zzz"` and `$c = " abc"`.
/// The trailing `any of them` keeps every pattern referenced.
fn holds_with_patterns(condition: &str, data: &[u8]) -> bool {
    let rules = compile(&format!(
        "rule t {{ strings: $a = \"abc\" $b = \"zzz\" $c = \" abc\" \
         condition: ({condition}) and (any of them or true) }}"
    ));
    rules.scan(data).unwrap().matched("t")
}

const DATA: &[u8] = b"abc abc abc";

#[test]
fn test_pattern_operators() {
    assert!(holds_with_patterns("#a == 3 and #c == 2", DATA));
    assert!(holds_with_patterns("@a[1] == 0 and @a[3] == 8", DATA));
    assert!(holds_with_patterns("!a[2] == 3", DATA));
    assert!(holds_with_patterns("not defined @a[4]", DATA));
    assert!(holds_with_patterns("$a at 4 and not $a at 5", DATA));
    assert!(holds_with_patterns("$a in (5..10)", DATA));
    assert!(holds_with_patterns("#a in (1..8) == 2", DATA));
    assert!(!holds_with_patterns("$b or $a at 1", DATA));
}

#[test]
fn test_set_quantifiers() {
    assert!(holds_with_patterns("2 of ($a, $b, $c)", DATA));
    assert!(!holds_with_patterns("all of them", DATA));
    assert!(holds_with_patterns("50% of them", DATA));
    assert!(!holds_with_patterns("70% of them", DATA));
    assert!(holds_with_patterns("none of ($b*)", DATA));
    assert!(holds_with_patterns("any of ($a, $c) in (0..2)", DATA));
    assert!(!holds_with_patterns("any of ($b, $c) at 0", DATA));
    assert!(holds_with_patterns("for all of ($a, $c) : ($ in (0..10))", DATA));
    assert!(holds_with_patterns("for 1 of them : (# == 3)", DATA));
}

#[test]
fn test_loops() {
    assert!(holds_with_patterns(
        "for all i in (1..#a) : (@a[i] % 4 == 0)",
        DATA
    ));
    assert!(!holds_with_patterns(
        "for any i in (1..#a) : (@a[i] == 5)",
        DATA
    ));
    assert!(holds("for 2 x in (1, 5, 9) : (x > 4)", b""));
    assert!(holds("for all i in (3..1) : (false)", b""));
    assert!(holds(
        "for all i in (1..3) : (for any j in (1..3) : (i == j))",
        b""
    ));
}

#[test]
fn test_integer_readers() {
    let data = b"MZ\x90\x00\xff\xff\xff\xff";
    assert!(holds("uint16(0) == 0x5A4D", data));
    assert!(holds("uint32be(0) == 0x4D5A9000", data));
    assert!(holds("int32(4) == -1 and uint32(4) == 0xFFFFFFFF", data));
    assert!(holds("int8(2) == -112", data));
    assert!(holds("not defined uint8(100)", data));
}

#[test]
fn test_arithmetic() {
    assert!(holds("7 \\ 2 == 3 and -7 \\ 2 == -3 and 7 % 3 == 1", b""));
    assert!(holds("(1 << 3) == 8 and (0xF0 & 0x3C) == 0x30 and (5 ^ 1) == 4", b""));
    assert!(holds("1.5 + 1 == 2.5 and 7 \\ 2.0 == 3.5", b""));
    assert!(holds("0x7FFFFFFFFFFFFFFF + 1 < 0", b""));
    assert!(holds("filesize == 4", b"abcd"));
}

#[test]
fn test_undefined_values() {
    assert!(!holds("1 \\ 0 == 0", b""));
    assert!(!holds("not (1 \\ 0 == 0)", b""));
    assert!(holds("(1 \\ 0 == 0) or true", b""));
    assert!(holds("not defined (1 \\ 0)", b""));
    assert!(!holds("uint32(0) != 5", b"ab"));
}

#[test]
fn test_string_operators() {
    assert!(holds("\"Hello World\" icontains \"WORLD\"", b""));
    assert!(holds("\"Hello\" iequals \"hELLO\" and \"Hello\" startswith \"He\"", b""));
    assert!(holds("\"report.pdf\" iendswith \".PDF\"", b""));
    assert!(holds("\"abc\" matches /B/i and not (\"abc\" matches /B/)", b""));
    assert!(holds("\"abc\" < \"abd\"", b""));
}

#[test]
fn test_rule_references() {
    let rules = compile(
        "private rule mz { condition: uint16(0) == 0x5A4D }\n\
         rule small_pe { condition: mz and filesize < 100 }\n\
         rule not_pe { condition: not mz }",
    );
    let results = rules.scan(b"MZ\x90\x00").unwrap();
    assert_eq!(results.identifiers(), vec!["small_pe"]);
    let results = rules.scan(b"ELF").unwrap();
    assert_eq!(results.identifiers(), vec!["not_pe"]);
}

#[test]
fn test_external_variables() {
    let mut compiler = Compiler::new();
    compiler
        .define_variable("file_name", "invoice.exe")
        .unwrap()
        .define_variable("score", 10)
        .unwrap()
        .define_variable("enabled", true)
        .unwrap();
    compiler
        .add_source(
            "rule r { condition: enabled and score > 5 and file_name endswith \".exe\" }",
        )
        .unwrap();
    let rules = compiler.compile().unwrap();
    assert!(rules.scan(b"").unwrap().matched("r"));

    let mut scanner = rules.scanner();
    scanner.set_variable("file_name", "notes.txt").unwrap();
    assert!(!scanner.scan(b"").unwrap().matched("r"));
    scanner.set_variable("file_name", "a.exe").unwrap();
    scanner.set_variable("score", 1).unwrap();
    assert!(!scanner.scan(b"").unwrap().matched("r"));

    assert!(matches!(
        scanner.set_variable("missing", 1),
        Err(YaraError::UndefinedVariable(_))
    ));
    assert!(matches!(
        scanner.set_variable("score", "ten"),
        Err(YaraError::VariableType { .. })
    ));
}

#[test]
fn test_type_errors_at_compile_time() {
    for condition in ["\"a\" + 1 == 2", "1 contains \"a\"", "true > false", "$a"] {
        let mut compiler = Compiler::new();
        let source = format!("rule t {{ condition: {condition} }}");
        assert!(compiler.add_source(&source).is_err(), "{condition}");
    }
}

#[test]
fn test_unsatisfiable_quantifier_is_a_warning() {
    let mut compiler = Compiler::new();
    compiler
        .add_source("rule t { strings: $a = \"abcd\" $b = \"efgh\" condition: 3 of ($a, $b) }")
        .unwrap();
    assert!(compiler
        .warnings()
        .iter()
        .any(|w| w.kind == WarningKind::UnsatisfiableQuantifier));
    let rules = compiler.compile().unwrap();
    assert!(!rules.scan(b"abcd efgh").unwrap().matched("t"));
}

fn pe_module() -> StaticModules {
    let mut exports = BTreeMap::new();
    exports.insert("CreateFileW".to_string(), ModuleValue::Integer(1));
    exports.insert("ReadFile".to_string(), ModuleValue::Integer(2));

    let mut pe = ModuleValue::from(json!({
        "number_of_sections": 2,
        "is_dll": false,
        "sections": [
            {"name": ".text", "raw_size": 512},
            {"name": ".data", "raw_size": 0},
        ],
    }));
    if let ModuleValue::Struct(fields) = &mut pe {
        fields.insert("exports".to_string(), ModuleValue::Dictionary(exports));
        fields.insert(
            "section_index".to_string(),
            ModuleFunction::new(|args| match args.first().and_then(|a| a.as_bytes()) {
                Some(b".text") => ModuleValue::Integer(0),
                Some(b".data") => ModuleValue::Integer(1),
                _ => ModuleValue::Undefined,
            })
            .into(),
        );
    }
    StaticModules::new().with_module("pe", pe)
}

fn module_holds(condition: &str, modules: StaticModules) -> bool {
    let rules = compile(&format!("import \"pe\"\nrule t {{ condition: {condition} }}"));
    let mut scanner = rules.scanner();
    scanner.set_module_provider(modules);
    scanner.scan(b"MZ").unwrap().matched("t")
}

#[test]
fn test_module_fields() {
    assert!(module_holds("pe.number_of_sections == 2", pe_module()));
    assert!(module_holds("pe.sections[0].name == \".text\"", pe_module()));
    assert!(module_holds("not pe.is_dll", pe_module()));
    assert!(module_holds("pe.exports[\"ReadFile\"] == 2", pe_module()));
    assert!(module_holds("not defined pe.sections[5].name", pe_module()));
    assert!(module_holds("pe.section_index(\".data\") == 1", pe_module()));
}

#[test]
fn test_module_iteration() {
    assert!(module_holds(
        "for any section in pe.sections : (section.name == \".data\" and section.raw_size == 0)",
        pe_module()
    ));
    assert!(module_holds(
        "for all name, ordinal in pe.exports : (ordinal > 0)",
        pe_module()
    ));
    assert!(!module_holds(
        "for any name, ordinal in pe.sections : (true)",
        pe_module()
    ));
}

#[test]
fn test_dictionaries_from_json() {
    let tree = || ModuleValue::from(json!({"d": {"k": 1, "j": 2}}));
    let keyed = || StaticModules::new().with_module("pe", tree().dictionary_at("d"));

    assert!(module_holds("pe.d[\"k\"] == 1", keyed()));
    assert!(module_holds("not defined pe.d[\"missing\"]", keyed()));
    assert!(module_holds("for all key, value in pe.d : (value > 0)", keyed()));
    assert!(module_holds("for 1 key, value in pe.d : (key == \"j\")", keyed()));

    // Plain JSON objects are structs: fields, not keys.
    let plain = StaticModules::new().with_module("pe", tree());
    assert!(module_holds("pe.d.k == 1", plain.clone()));
    assert!(!module_holds("pe.d[\"k\"] == 1", plain));
}

#[test]
fn test_missing_module_is_undefined() {
    assert!(!module_holds("pe.number_of_sections == 2", StaticModules::new()));
    assert!(module_holds("not defined pe.number_of_sections", StaticModules::new()));
}

#[test]
fn test_closure_module_provider() {
    let rules = compile("import \"magic\"\nrule t { condition: magic.size == filesize }");
    let mut scanner = rules.scanner();
    scanner.set_module_provider(|module: &str, data: &[u8]| {
        (module == "magic")
            .then(|| ModuleValue::structure([("size", ModuleValue::Integer(data.len() as i64))]))
    });
    assert!(scanner.scan(b"12345").unwrap().matched("t"));
}

#[test]
fn test_entrypoint() {
    let mut elf = vec![0u8; 0x80];
    elf[0..4].copy_from_slice(b"\x7fELF");
    elf[4] = 1;
    elf[5] = 1;
    elf[6] = 1;
    elf[16..18].copy_from_slice(&2u16.to_le_bytes());
    elf[18..20].copy_from_slice(&3u16.to_le_bytes());
    elf[20..24].copy_from_slice(&1u32.to_le_bytes());
    elf[40..42].copy_from_slice(&52u16.to_le_bytes());
    elf[24..28].copy_from_slice(&0x0804_8060u32.to_le_bytes());
    elf[28..32].copy_from_slice(&52u32.to_le_bytes());
    elf[42..44].copy_from_slice(&32u16.to_le_bytes());
    elf[44..46].copy_from_slice(&1u16.to_le_bytes());
    elf[52..56].copy_from_slice(&1u32.to_le_bytes());
    elf[60..64].copy_from_slice(&0x0804_8000u32.to_le_bytes());
    elf[68..72].copy_from_slice(&0x80u32.to_le_bytes());
    elf[72..76].copy_from_slice(&0x80u32.to_le_bytes());
    elf[0x60] = 0xC3;

    assert!(holds("entrypoint == 0x60 and uint8(entrypoint) == 0xC3", &elf));
    assert!(holds("not defined entrypoint", b"plain text"));
}

#[test]
fn test_entrypoint_of_truncated_pe_is_undefined() {
    // No sections and no optional header, with stray bytes where
    // AddressOfEntryPoint would sit.
    let mut pe = vec![0u8; 0x80];
    pe[0..2].copy_from_slice(b"MZ");
    pe[0x3c..0x40].copy_from_slice(&0x40u32.to_le_bytes());
    pe[0x40..0x44].copy_from_slice(b"PE\0\0");
    pe[0x68..0x6c].copy_from_slice(&0x1234u32.to_le_bytes());

    assert!(holds("not defined entrypoint", &pe));
    assert_eq!(yara_engine::entry_point_offset(&pe), None);
}
