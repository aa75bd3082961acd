use criterion::{Criterion, black_box, criterion_group, criterion_main};

use mythos::builtins::{Console, Registry};
use mythos::vm::Vm;
use mythos::{emitter, lexer, parser};

const FIB: &str = "\
function fib(n) {
    if n < 2 {
        return n
    }
    return fib(n - 1) + fib(n - 2)
}
print(fib(18))
";

fn bench_pipeline(c: &mut Criterion) {
    c.bench_function("frontend_tokenize", |b| {
        b.iter(|| {
            let tokens = lexer::tokenize(black_box(FIB)).expect("tokenize");
            black_box(tokens);
        })
    });

    c.bench_function("frontend_parse", |b| {
        let tokens = lexer::tokenize(FIB).expect("tokenize");
        b.iter(|| {
            let program = parser::parse_tokens(black_box(tokens.clone())).expect("parse");
            black_box(program);
        })
    });

    c.bench_function("emitter_compile_only", |b| {
        let program = parser::parse_source(FIB).expect("parse");
        b.iter(|| {
            let code = emitter::compile(black_box(&program)).expect("compile");
            black_box(code);
        })
    });

    c.bench_function("vm_execute_prepared", |b| {
        let code = mythos::compile(FIB).expect("compile");
        b.iter(|| {
            let console = Console::capture();
            let mut vm = Vm::new(Registry::standard(&console));
            let value = vm.run(black_box(&code)).expect("run");
            black_box(value);
        })
    });

    c.bench_function("pipeline_total", |b| {
        b.iter(|| {
            let code = mythos::compile(black_box(FIB)).expect("compile");
            let console = Console::capture();
            let mut vm = Vm::new(Registry::standard(&console));
            let value = vm.run(&code).expect("run");
            black_box(value);
        })
    });
}

criterion_group!(benches, bench_pipeline);
criterion_main!(benches);
