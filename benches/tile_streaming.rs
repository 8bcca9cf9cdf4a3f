//! Benchmarks for tile planning and patch extraction.
//!
//! Run with: `cargo bench`

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use patchserve::execution::extractor::PatchExtractor;
use patchserve::execution::splitter::{plan_tiles, split};
use patchserve::prelude::*;
use std::hint::black_box;
use std::sync::Arc;

/// Benchmark splitting a large output region at several tile sizes
fn bench_split(c: &mut Criterion) {
    let full = ImageRegion::new(0, 0, 20_000, 15_000);
    let mut group = c.benchmark_group("split");

    for side in [64, 256, 1024] {
        group.bench_with_input(BenchmarkId::new("tile", side), &side, |b, &side| {
            b.iter(|| split(black_box(full), side))
        });
    }
    group.bench_function("plan_untiled", |b| b.iter(|| plan_tiles(black_box(full), None)));

    group.finish();
}

/// Benchmark mapping and batching one tile at several patch sizes
fn bench_extraction(c: &mut Criterion) {
    let image: Arc<dyn RasterSource> = Arc::new(MemoryRaster::from_fn(512, 512, 4, |x, y, band| {
        (x + y) as f32 + band as f32
    }));
    let mut group = c.benchmark_group("extraction");

    for patch in [8, 16, 32] {
        let sources = SourceSet::new().with_source(SourceBundle::new(image.clone(), Size2D::square(patch), "x"));
        let mapper = RegionMapper::new(&sources, &OutputSpec::new(["y"])).unwrap();
        let mapping = mapper.map(ImageRegion::new(0, 0, 64, 64)).unwrap();
        let extractor = PatchExtractor::new(&sources);

        group.bench_with_input(BenchmarkId::new("patch", patch), &mapping, |b, mapping| {
            b.iter(|| extractor.extract(black_box(mapping)).unwrap())
        });
    }

    group.finish();
}

criterion_group!(benches, bench_split, bench_extraction);
criterion_main!(benches);
