//! Data generators for benchmarks

use neurospatial::{IndexedSphere, MorphoEntry, Point3D, Segment, Soma};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Side length of the cube benchmark data is scattered over.
pub const DOMAIN: f32 = 1000.0;

fn random_point(rng: &mut StdRng) -> Point3D {
    Point3D::new(
        rng.gen_range(0.0..DOMAIN) as _,
        rng.gen_range(0.0..DOMAIN) as _,
        rng.gen_range(0.0..DOMAIN) as _,
    )
}

/// Generate spheres with ids 0..count scattered over the domain.
pub fn generate_spheres(count: usize, seed: u64) -> Vec<IndexedSphere> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count as u64)
        .map(|i| {
            let radius = rng.gen_range(0.5..5.0) as _;
            IndexedSphere::new(i, random_point(&mut rng), radius)
        })
        .collect()
}

/// Generate morphology entries: one soma and a short three-segment
/// neurite per gid.
pub fn generate_morphologies(n_neurons: usize, seed: u64) -> Vec<MorphoEntry> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut entries = Vec::with_capacity(n_neurons * 4);
    for gid in 0..n_neurons as u64 {
        let center = random_point(&mut rng);
        entries.push(Soma::new(gid, center, 3.0).into());

        let mut previous = center;
        for segment_id in 0..3u32 {
            let next = Point3D::new(
                previous.x + rng.gen_range(-10.0..10.0),
                previous.y + rng.gen_range(-10.0..10.0),
                previous.z + rng.gen_range(-10.0..10.0),
            );
            entries.push(Segment::new(gid, 0, segment_id, previous, next, 1.0).into());
            previous = next;
        }
    }
    entries
}
