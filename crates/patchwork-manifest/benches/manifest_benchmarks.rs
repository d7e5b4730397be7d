//! Manifest benchmarks.
//!
//! Measures the costs paid on every patch check: parsing a large aggregate
//! manifest, diffing two releases, and deriving storage keys.
//!
//! Run with: `cargo bench --bench manifest_benchmarks`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use patchwork_manifest::prelude::*;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Build a release with `count` bundles, each depending on up to two earlier
/// bundles. `revision` perturbs every tenth checksum.
fn build_manifest(count: usize, revision: u32) -> PatchManifest {
    let entries = (0..count).map(|i| {
        let checksum = if i % 10 == 0 {
            format!("{:032x}", (i as u128) << 8 | u128::from(revision))
        } else {
            format!("{:032x}", i)
        };
        BundleManifestEntry {
            file_name: format!("bundles/group_{:03}/bundle_{:06}", i % 97, i),
            size: 1024 + i as u64,
            checksum,
            last_modified_utc: None,
            dependencies: (1..=2)
                .filter(|d| i >= *d)
                .map(|d| format!("bundles/group_{:03}/bundle_{:06}", (i - d) % 97, i - d))
                .collect(),
        }
    });
    PatchManifest::from_entries(revision, entries).expect("generated manifest is valid")
}

// ---------------------------------------------------------------------------
// Benchmarks
// ---------------------------------------------------------------------------

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("manifest_parse");
    for count in [1_000usize, 10_000] {
        let json = build_manifest(count, 1).to_json_pretty().unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(count), &json, |b, json| {
            b.iter(|| PatchManifest::parse(black_box(json.as_bytes())).unwrap());
        });
    }
    group.finish();
}

fn bench_diff(c: &mut Criterion) {
    let mut group = c.benchmark_group("manifest_diff");
    for count in [1_000usize, 10_000] {
        let local = build_manifest(count, 1);
        let remote = build_manifest(count, 2);
        group.bench_with_input(
            BenchmarkId::from_parameter(count),
            &(local, remote),
            |b, (local, remote)| {
                b.iter(|| ManifestDiff::between(black_box(local), black_box(remote)));
            },
        );
    }
    group.finish();
}

fn bench_keys(c: &mut Criterion) {
    let names: Vec<String> = (0..10_000)
        .map(|i| format!("Bundles/Group_{:03}/Bundle_{:06}", i % 97, i))
        .collect();
    c.bench_function("name_to_key_10k", |b| {
        b.iter(|| {
            for name in &names {
                black_box(name_to_key(name));
            }
        });
    });
    c.bench_function("check_key_collisions_10k", |b| {
        b.iter(|| check_key_collisions(names.iter().map(String::as_str)).unwrap());
    });
}

criterion_group!(benches, bench_parse, bench_diff, bench_keys);
criterion_main!(benches);
