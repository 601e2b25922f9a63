//! Query benchmarks over in-memory and memdisk trees.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;
use tempfile::tempdir;

use neurospatial::{
    BoundingBoxGeometry, ExactGeometry, IndexTree, MemDiskOptions, MemDiskTree, Point3D, Shape,
    Sphere,
};
use neurospatial_bench::{generate_morphologies, generate_spheres, DOMAIN};

fn probe(radius: f32) -> Shape {
    Shape::Sphere(Sphere::new(
        Point3D::new(
            (DOMAIN / 2.0) as _,
            (DOMAIN / 2.0) as _,
            (DOMAIN / 2.0) as _,
        ),
        radius as _,
    ))
}

fn bench_sphere_queries(c: &mut Criterion) {
    let mut group = c.benchmark_group("IndexTree Query");

    for size in [1_000, 10_000, 100_000].iter() {
        let tree = IndexTree::bulk_load(generate_spheres(*size, 42));
        let shape = probe(50.0);

        group.bench_with_input(BenchmarkId::new("bbox", size), size, |b, _| {
            b.iter(|| black_box(tree.find_intersecting::<BoundingBoxGeometry>(&shape)));
        });
        group.bench_with_input(BenchmarkId::new("exact", size), size, |b, _| {
            b.iter(|| black_box(tree.find_intersecting::<ExactGeometry>(&shape)));
        });
    }

    group.finish();
}

fn bench_morphology_exact(c: &mut Criterion) {
    let mut group = c.benchmark_group("Morphology Exact Query");

    let tree = IndexTree::bulk_load(generate_morphologies(25_000, 7));
    let shape = probe(30.0);

    group.bench_function("find_intersecting_100k", |b| {
        b.iter(|| black_box(tree.find_intersecting::<ExactGeometry>(&shape)));
    });
    group.bench_function("is_intersecting_100k", |b| {
        b.iter(|| black_box(tree.is_intersecting::<ExactGeometry>(&shape)));
    });

    group.finish();
}

fn bench_nearest(c: &mut Criterion) {
    let mut group = c.benchmark_group("Nearest Neighbours");

    let tree = IndexTree::bulk_load(generate_spheres(100_000, 3));
    let point = Point3D::new(
        (DOMAIN / 2.0) as _,
        (DOMAIN / 2.0) as _,
        (DOMAIN / 2.0) as _,
    );

    for k in [1usize, 10, 100].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(k), k, |b, &k| {
            b.iter(|| black_box(tree.find_nearest(&point, k)));
        });
    }

    group.finish();
}

fn bench_memdisk_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("MemDisk Query");

    let dir = tempdir().unwrap();
    let path = dir.path().join("bench.msi");
    let mut tree: MemDiskTree<neurospatial::IndexedSphere> = MemDiskTree::create(
        &path,
        MemDiskOptions {
            size_mb: 64,
            close_shrink: false,
            cache_pages: 256,
        },
    )
    .unwrap();
    tree.insert_bulk(generate_spheres(10_000, 42)).unwrap();
    let shape = probe(50.0);

    group.bench_function("find_intersecting_10k", |b| {
        b.iter(|| black_box(tree.find_intersecting::<ExactGeometry>(&shape).unwrap()));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_sphere_queries,
    bench_morphology_exact,
    bench_nearest,
    bench_memdisk_query
);
criterion_main!(benches);
