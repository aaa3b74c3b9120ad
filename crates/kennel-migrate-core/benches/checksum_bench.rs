use criterion::{criterion_group, criterion_main, Criterion};
use kennel_migrate_core::{build_manifest, checksum_entries, merkle_root, Module};
use serde_json::{json, Value};

fn mk_customer(index: usize) -> Value {
    json!({
        "id": format!("00000000-0000-5000-8000-{index:012}"),
        "code": format!("CUS-{index}"),
        "schemaVersion": 1,
        "version": 0,
        "createdAt": "2024-01-01T00:00:00",
        "updatedAt": "2024-01-01T00:00:00",
        "legacyId": index.to_string(),
        "firstName": "Bench",
        "lastName": format!("Customer {index}"),
        "email": format!("customer{index}@example.org"),
        "phone": "+491701234567",
        "street": "Hauptstrasse 1",
        "zip": "10115",
        "city": "Berlin",
        "status": "active",
        "newsletter": index % 2 == 0,
    })
}

fn bench_checksums(c: &mut Criterion) {
    let entities = (0..5_000).map(mk_customer).collect::<Vec<_>>();

    c.bench_function("checksum_entries_5000_customers", |b| {
        b.iter(|| {
            if let Err(err) = checksum_entries(&entities) {
                panic!("checksum benchmark failed: {err}");
            }
        });
    });

    c.bench_function("manifest_5000_customers", |b| {
        b.iter(|| {
            if let Err(err) = build_manifest(Module::Customers, &entities) {
                panic!("manifest benchmark failed: {err}");
            }
        });
    });
}

fn bench_merkle(c: &mut Criterion) {
    let leaves = (0..10_001).map(|index| format!("{index:064x}")).collect::<Vec<_>>();

    c.bench_function("merkle_root_10001_leaves", |b| {
        b.iter(|| merkle_root(&leaves));
    });
}

criterion_group!(checksum_benches, bench_checksums, bench_merkle);
criterion_main!(checksum_benches);
