use criterion::{criterion_group, criterion_main, Criterion};
use proxy_core::headers::Headers;

fn build_typical_headers() -> Headers {
    let mut headers = Headers::new();
    headers.append("Host", "example.com");
    headers.append("User-Agent", "bench-client/1.0");
    headers.append("Accept", "text/html,application/xhtml+xml");
    headers.append("Accept-Encoding", "gzip, deflate");
    headers.append("Connection", "keep-alive");
    headers.append("Cookie", "session=abc123; theme=dark");
    headers.append("X-Forwarded-For", "203.0.113.7");
    headers
}

fn bench_append(c: &mut Criterion) {
    c.bench_function("headers_append", |b| {
        b.iter(|| {
            let headers = build_typical_headers();
            std::hint::black_box(headers);
        })
    });
}

fn bench_get_first(c: &mut Criterion) {
    let headers = build_typical_headers();
    c.bench_function("headers_get_first_hit", |b| {
        b.iter(|| std::hint::black_box(headers.get_first("cookie")))
    });
    c.bench_function("headers_get_first_miss", |b| {
        b.iter(|| std::hint::black_box(headers.get_first("x-not-present")))
    });
}

fn bench_display(c: &mut Criterion) {
    let headers = build_typical_headers();
    c.bench_function("headers_display", |b| {
        b.iter(|| std::hint::black_box(headers.to_string()))
    });
}

criterion_group!(benches, bench_append, bench_get_first, bench_display);
criterion_main!(benches);
