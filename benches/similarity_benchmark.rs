use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use kinmap::network::{SimilarityEngine, prepare_entities, threshold};
use kinmap::onto::{AnnotationCorpus, HierarchyBuilder, Term, TermHierarchy, specificity};

fn term_id(i: usize) -> String {
    format!("GO:{i:07}")
}

// Layered DAG: every term below the root has one or two parents in earlier layers.
fn layered_hierarchy(rng: &mut StdRng, terms: usize) -> TermHierarchy {
    let mut builder = HierarchyBuilder::new();
    builder.add(Term::new(term_id(0))).unwrap();
    for i in 1..terms {
        let earlier: Vec<usize> = (0..i).collect();
        let parent_count = rng.gen_range(1..=2.min(i));
        let parents: Vec<String> = earlier
            .choose_multiple(rng, parent_count)
            .map(|&p| term_id(p))
            .collect();
        builder.add(Term::new(term_id(i)).with_parents(parents)).unwrap();
    }
    builder.build().unwrap()
}

fn random_corpus(rng: &mut StdRng, entities: usize, terms: usize) -> AnnotationCorpus {
    let pairs: Vec<(String, String)> = (0..entities)
        .flat_map(|e| {
            let count = rng.gen_range(10..=30);
            (0..count)
                .map(|_| (format!("KIN{e:04}"), term_id(rng.gen_range(1..terms))))
                .collect::<Vec<_>>()
        })
        .collect();
    AnnotationCorpus::from_pairs(pairs)
}

fn benchmark_similarity(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(0x6B1A);
    let hierarchy = layered_hierarchy(&mut rng, 2_000);

    let mut group = c.benchmark_group("similarity_matrix");
    group.sample_size(10);
    for &entities in &[50_usize, 100, 200] {
        let corpus = random_corpus(&mut rng, entities, hierarchy.len());
        let table = specificity(&corpus, &hierarchy);
        let names: Vec<String> = corpus.entities().map(str::to_string).collect();
        let prepared = prepare_entities(&corpus, &hierarchy, names.iter().map(String::as_str), 1);

        group.throughput(Throughput::Elements((entities * (entities - 1) / 2) as u64));
        group.bench_with_input(BenchmarkId::new("bma", entities), &prepared, |b, input| {
            b.iter(|| {
                let engine = SimilarityEngine::new(&table);
                black_box(engine.build_matrix(black_box(input), false));
            });
        });

        let matrix = SimilarityEngine::new(&table).build_matrix(&prepared, false);
        group.bench_with_input(BenchmarkId::new("threshold", entities), &matrix, |b, input| {
            b.iter(|| black_box(threshold(black_box(input), None)));
        });
    }
    group.finish();
}

criterion_group!(similarity, benchmark_similarity);
criterion_main!(similarity);
