//! Distributed build plus out-of-core querying of a multi-index.

use neurospatial::{
    BoundingBoxGeometry, Box3D, CancelToken, Communicator, ExactGeometry, IndexVariant,
    LocalCluster, MorphoEntry, MultiIndexBuildOptions, MultiIndexBulkBuilder, MultiIndexTree,
    NativeStorage, Point3D, Segment, Shape, Soma, SpatialValue, Sphere, UsageRateCacheParams,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::tempdir;

fn p(x: f32, y: f32, z: f32) -> Point3D {
    Point3D::new(x as _, y as _, z as _)
}

/// One soma plus a short neurite per gid, scattered over a cube.
fn morphology(rank: usize, n_neurons: usize) -> Vec<MorphoEntry> {
    let mut rng = StdRng::seed_from_u64(rank as u64 * 7919);
    let mut entries = Vec::new();
    for i in 0..n_neurons {
        let gid = ((rank as u64) << 32) | i as u64;
        let center = p(
            rng.gen_range(0.0..200.0),
            rng.gen_range(0.0..200.0),
            rng.gen_range(0.0..200.0),
        );
        entries.push(Soma::new(gid, center, 1.5).into());
        let tip = Point3D::new(center.x + 4.0, center.y, center.z);
        entries.push(Segment::new(gid, 0, 0, center, tip, 0.5).into());
    }
    entries
}

fn build(output: &std::path::Path, n_ranks: usize, n_neurons: usize) -> Vec<MorphoEntry> {
    let options = MultiIndexBuildOptions {
        max_elements_per_part: 64,
        cancel: CancelToken::default(),
    };
    let output = output.to_path_buf();
    LocalCluster::run(n_ranks, move |comm| {
        let mut builder: MultiIndexBulkBuilder<MorphoEntry> =
            MultiIndexBulkBuilder::with_options(&output, options.clone())?;
        builder.insert_bulk(morphology(comm.rank(), n_neurons));
        builder.finalize(Some(comm))?;
        assert_eq!(builder.size()?, (n_ranks * n_neurons * 2) as u64);
        Ok(())
    })
    .unwrap();

    (0..n_ranks).flat_map(|rank| morphology(rank, n_neurons)).collect()
}

#[test]
fn multi_index_round_trip_matches_linear_scan() {
    let dir = tempdir().unwrap();
    let output = dir.path().join("morph_index");
    let all_values = build(&output, 2, 250);

    let meta = NativeStorage::open(&output).unwrap().read_meta().unwrap();
    assert_eq!(meta.element_type, "morphology");
    assert_eq!(meta.variant().unwrap(), IndexVariant::MultiIndex);

    let mut index: MultiIndexTree<MorphoEntry> =
        MultiIndexTree::open(&output, 64 * 1024 * 1024).unwrap();
    assert_eq!(index.len(), all_values.len());

    for probe in [
        Shape::Sphere(Sphere::new(p(100.0, 100.0, 100.0), 30.0)),
        Shape::Box(Box3D::new(p(0.0, 0.0, 0.0), p(50.0, 50.0, 50.0))),
        Shape::Sphere(Sphere::new(p(-100.0, -100.0, -100.0), 1.0)),
    ] {
        let mut expected: Vec<u64> = all_values
            .iter()
            .filter(|v| probe.intersects(&v.shape()))
            .map(|v| v.gid())
            .collect();
        expected.sort_unstable();

        let mut found = index.find_intersecting::<ExactGeometry>(&probe).unwrap();
        found.sort_unstable();
        assert_eq!(found, expected);

        let is_hit = index.is_intersecting(&probe).unwrap();
        assert_eq!(is_hit, !expected.is_empty());
    }
}

#[test]
fn tight_cache_budget_still_answers_correctly() {
    let dir = tempdir().unwrap();
    let output = dir.path().join("tight_index");
    let all_values = build(&output, 2, 150);

    // Room for roughly one sub-tree at a time, two evictions per miss.
    let params = UsageRateCacheParams::new(80).with_max_evict(2);
    let mut index: MultiIndexTree<MorphoEntry> =
        MultiIndexTree::with_params(&output, params).unwrap();

    let mut rng = StdRng::seed_from_u64(1);
    for _ in 0..20 {
        let center = p(
            rng.gen_range(0.0..200.0),
            rng.gen_range(0.0..200.0),
            rng.gen_range(0.0..200.0),
        );
        let probe = Shape::Sphere(Sphere::new(center, 25.0));

        let mut expected: Vec<u64> = all_values
            .iter()
            .filter(|v| v.bounding_box().intersects(&probe.bounding_box()))
            .map(|v| v.gid())
            .collect();
        expected.sort_unstable();

        let mut found = index
            .find_intersecting::<BoundingBoxGeometry>(&probe)
            .unwrap();
        found.sort_unstable();
        assert_eq!(found, expected);
    }
}
