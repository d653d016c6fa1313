use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use gazelle::{Config, Grammar, NullEvents, ParseState};

const GRAMMAR: &str = r#"
start expr;
expr -> num +("+");
num -> /[0-9]+/;
WS -> /[ \t]+/;
allow WS in expr;
"#;

fn bench_compile(c: &mut Criterion) {
    let config = Config::default();
    c.bench_function("compile_arithmetic_grammar", |b| {
        b.iter(|| Grammar::compile(black_box(GRAMMAR), &config).unwrap())
    });
}

fn bench_parse(c: &mut Criterion) {
    let grammar = Arc::new(Grammar::compile(GRAMMAR, &Config::default()).unwrap());
    let input = (0..1000).map(|i| i.to_string()).collect::<Vec<_>>().join(" + ");
    c.bench_function("parse_arithmetic_1000_terms", |b| {
        b.iter(|| {
            let mut state = ParseState::new(Arc::clone(&grammar));
            let mut events = NullEvents;
            state.parse(black_box(input.as_bytes()), &mut events).unwrap();
            state.finish_parse(&mut events).unwrap();
        })
    });
}

fn bench_load(c: &mut Criterion) {
    let grammar = Grammar::compile(GRAMMAR, &Config::default()).unwrap();
    let image = grammar.to_bytes();
    c.bench_function("load_arithmetic_image", |b| {
        b.iter(|| Grammar::from_bytes(black_box(&image)).unwrap())
    });
}

criterion_group!(benches, bench_compile, bench_parse, bench_load);
criterion_main!(benches);
