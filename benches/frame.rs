use coapbench::{Frame, Method, TargetUri};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn request_mid(c: &mut Criterion) {
    let uri = TargetUri::parse("coap://127.0.0.1:5683/sensors/temperature").unwrap();
    let mut frame = Frame::request_template(Method::Get, &uri, None, true).unwrap();
    c.bench_function("request next_mid", |b| {
        b.iter(|| black_box(frame.next_mid().len()))
    });
}

fn notification_sequence(c: &mut Criterion) {
    c.bench_function("notification next_notification", |b| {
        let mut frame = Frame::notification_template(&[0xCA, 0xFE], 0, true).unwrap();
        b.iter(|| {
            if frame.next_notification().is_err() {
                frame = Frame::notification_template(&[0xCA, 0xFE], 0, true).unwrap();
            }
            black_box(frame.len())
        })
    });
}

fn templates(c: &mut Criterion) {
    let uri = TargetUri::parse("coap://[::1]:5683/benchmark?kind=observe").unwrap();
    c.bench_function("request_template", |b| {
        b.iter(|| {
            let payload: &[u8] = b"coap://[::1]:40000/benchmark";
            Frame::request_template(Method::Post, black_box(&uri), Some(payload), true)
        })
    });
}

criterion_group!(benches, request_mid, notification_sequence, templates);
criterion_main!(benches);
