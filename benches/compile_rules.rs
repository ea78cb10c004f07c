//! Rule compilation benchmarks.
//!
//! Measures parsing and code generation for growing rule sets, and the cost
//! of saving and loading compiled images.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use yara_engine::{Compiler, Rules};

fn rule_source(count: usize) -> String {
    (0..count)
        .map(|i| {
            format!(
                r#"
rule generated_{i} : bench {{
    meta:
        author = "bench"
        index = {i}
    strings:
        $text = "needle_{i:06}" nocase
        $wide = "wide_{i:06}" wide ascii
        $hex = {{ 4D 5A [0-4] {:02X} ?? 00 }}
        $re = /id=[0-9]{{{}}}/
    condition:
        2 of them and filesize < 10MB
}}
"#,
                i % 256,
                4 + i % 8
            )
        })
        .collect()
}

fn compile(source: &str) -> Rules {
    let mut compiler = Compiler::new();
    compiler.add_source(source).expect("benchmark rules compile");
    compiler.compile().expect("benchmark rules compile")
}

fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile_rules");
    group.sample_size(20);
    for count in [10, 100, 1000] {
        let source = rule_source(count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &source, |b, source| {
            b.iter(|| compile(black_box(source)))
        });
    }
    group.finish();
}

fn bench_image_round_trip(c: &mut Criterion) {
    let rules = compile(&rule_source(500));
    let image = rules.serialize().expect("serialize");
    c.bench_function("serialize_500_rules", |b| {
        b.iter(|| black_box(&rules).serialize().expect("serialize"))
    });
    c.bench_function("deserialize_500_rules", |b| {
        b.iter(|| Rules::deserialize(black_box(&image)).expect("deserialize"))
    });
}

criterion_group!(benches, bench_compile, bench_image_round_trip);
criterion_main!(benches);
