use criterion::{black_box, criterion_group, criterion_main, Criterion};
use gdbridge_core::gdb::mock::MockLauncher;
use gdbridge_core::gdb::response;
use gdbridge_core::{Engine, EngineConfig, PassCount};
use std::sync::Arc;

fn bench_pass_count_arithmetic(c: &mut Criterion) {
    let policies = [PassCount::None, PassCount::Equal(7), PassCount::EqualOrGreater(7), PassCount::Modulo(7)];
    c.bench_function("pass_count_ignore", |b| {
        b.iter(|| {
            for policy in policies {
                for hits in 0..64 {
                    black_box(policy.ignore_count(black_box(hits)));
                    black_box(policy.is_satisfied(hits));
                }
            }
        })
    });
}

fn bench_thread_info_parse(c: &mut Criterion) {
    let mut text = String::from("1");
    for id in 1..=64 {
        text.push_str(&format!("#{id};Thread 0x{id:x};stopped;10;worker-{id};worker.c;{}", id * 3));
    }
    c.bench_function("parse_thread_info_64", |b| {
        b.iter(|| {
            let _ = black_box(response::parse_thread_info(black_box(&text)));
        })
    });
}

fn bench_thread_diff(c: &mut Criterion) {
    let (launcher, gdb) = MockLauncher::new();
    for id in 2..=32 {
        gdb.add_thread(id, &format!("worker-{id}"), "worker.c", id);
    }
    let engine = Engine::new(EngineConfig::default(), Arc::new(launcher));
    if engine.launch_suspended("exe=/tmp/app").is_err() {
        return;
    }
    c.bench_function("enum_threads_unchanged_32", |b| {
        b.iter(|| {
            let _ = black_box(engine.enum_threads());
        })
    });
}

criterion_group!(benches, bench_pass_count_arithmetic, bench_thread_info_parse, bench_thread_diff);
criterion_main!(benches);
