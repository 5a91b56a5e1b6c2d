use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use shmtable::{layout, ShmTable};

fn lcg(mut s: u64) -> impl Iterator<Item = u64> {
    std::iter::from_fn(move || {
        s = s.wrapping_mul(6364136223846793005).wrapping_add(1);
        Some(s)
    })
}

fn key(n: u64) -> String {
    format!("k{:016x}", n)
}

fn bench_put_2k(c: &mut Criterion) {
    c.bench_function("table::put_2k_of_4096", |b| {
        b.iter_batched(
            || vec![0u8; layout::region_size(4096)],
            |mut mem| {
                let mut table = ShmTable::create(&mut mem).unwrap();
                for (i, x) in lcg(1).take(2000).enumerate() {
                    table.put(key(x).as_bytes(), &i.to_ne_bytes()).unwrap();
                }
                black_box(table.len());
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_get_2k(c: &mut Criterion) {
    c.bench_function("table::get_2k_of_4096", |b| {
        b.iter_batched(
            || {
                let mut mem = vec![0u8; layout::region_size(4096)];
                {
                    let mut table = ShmTable::create(&mut mem).unwrap();
                    for (i, x) in lcg(2).take(2000).enumerate() {
                        table.put(key(x).as_bytes(), &i.to_ne_bytes()).unwrap();
                    }
                }
                mem
            },
            |mut mem| {
                let table = ShmTable::open(&mut mem).unwrap();
                for x in lcg(2).take(2000) {
                    black_box(table.get(key(x).as_bytes()).unwrap());
                }
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_remove_1k(c: &mut Criterion) {
    c.bench_function("table::remove_1k_of_4096", |b| {
        b.iter_batched(
            || {
                let mut mem = vec![0u8; layout::region_size(4096)];
                {
                    let mut table = ShmTable::create(&mut mem).unwrap();
                    for (i, x) in lcg(3).take(1000).enumerate() {
                        table.put(key(x).as_bytes(), &i.to_ne_bytes()).unwrap();
                    }
                }
                mem
            },
            |mut mem| {
                let mut table = ShmTable::open(&mut mem).unwrap();
                for x in lcg(3).take(1000) {
                    table.remove(key(x).as_bytes()).unwrap();
                }
                black_box(table.len());
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_put_2k, bench_get_2k, bench_remove_1k);
criterion_main!(benches);
