use criterion::{black_box, criterion_group, criterion_main, Criterion};
use flipbook_capture::{
    page_count_from_anchors, parse_css_url, sanitize_title, update_page_param,
    validate_flipbook_url, Config, EventContext, EventKind, OutcomeReporter,
};
use std::time::Duration;

// Fast settings for all benchmarks
fn configure_fast_group(group: &mut criterion::BenchmarkGroup<criterion::measurement::WallTime>) {
    group.warm_up_time(Duration::from_millis(500));
    group.measurement_time(Duration::from_millis(500));
    group.sample_size(20);
}

fn benchmark_config(c: &mut Criterion) {
    let mut group = c.benchmark_group("config");
    configure_fast_group(&mut group);

    group.bench_function("creation", |b| {
        b.iter(|| black_box(Config::default()));
    });

    let config = Config::default();
    group.bench_function("validate", |b| {
        b.iter(|| black_box(config.validate().is_ok()));
    });

    group.finish();
}

fn benchmark_title_sanitization(c: &mut Criterion) {
    let mut group = c.benchmark_group("title_sanitization");
    configure_fast_group(&mut group);

    let titles = [
        "Plain Title",
        "What? Now: A \"Story\" <Vol 1>",
        "path/to\\book|name*",
    ];

    group.bench_function("sanitize", |b| {
        b.iter(|| {
            for title in &titles {
                black_box(sanitize_title(title));
            }
        });
    });

    group.finish();
}

fn benchmark_url_handling(c: &mut Criterion) {
    let mut group = c.benchmark_group("url_handling");
    configure_fast_group(&mut group);

    let urls = [
        "https://online.fliphtml5.com/abcde/fghij/",
        "https://online.fliphtml5.com/abcde/fghij/#p=4",
        "https://online.fliphtml5.com/abcde/fghij/#",
    ];

    group.bench_function("update_page_param", |b| {
        b.iter(|| {
            for url in &urls {
                black_box(update_page_param(url, 999));
            }
        });
    });

    group.bench_function("validate", |b| {
        b.iter(|| {
            for url in &urls {
                let _ = black_box(validate_flipbook_url(url, "https://online.fliphtml5.com/"));
            }
        });
    });

    let css = r#"url("https://static.fliphtml5.com/resources/bg%20image.jpg")"#;
    group.bench_function("parse_css_url", |b| {
        b.iter(|| black_box(parse_css_url(css)));
    });

    group.finish();
}

fn benchmark_structure_detection(c: &mut Criterion) {
    let mut group = c.benchmark_group("structure_detection");
    configure_fast_group(&mut group);

    let anchors: Vec<String> = (0..300).map(|i| format!("scalePage{i}")).collect();

    group.bench_function("page_count_300", |b| {
        b.iter(|| black_box(page_count_from_anchors(&anchors)));
    });

    group.finish();
}

fn benchmark_event_emit(c: &mut Criterion) {
    let mut group = c.benchmark_group("events");
    configure_fast_group(&mut group);

    let reporter = OutcomeReporter::new(1024);
    let _events = reporter.subscribe();

    group.bench_function("emit_page_captured", |b| {
        b.iter(|| {
            reporter.info(
                EventKind::PageCaptured,
                "Captured page 1/12",
                EventContext::new()
                    .url("https://online.fliphtml5.com/abcde/fghij/")
                    .title("Book")
                    .with("retry", 0),
            );
        });
    });

    group.finish();
}

criterion_group!(
    unit_benches,
    benchmark_config,
    benchmark_title_sanitization,
    benchmark_url_handling,
    benchmark_structure_detection,
    benchmark_event_emit
);
criterion_main!(unit_benches);
