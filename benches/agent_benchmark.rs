use criterion::{black_box, criterion_group, criterion_main, Criterion};
use outpost::capture::{Frame, GzipTranscoder};
use outpost::config::{merge_update, AgentConfig, ConfigUpdate};
use outpost::controller::{encode_payload, UploadMetadata};
use outpost::recorder::{parse_rms_level, SilenceGate};
use outpost::status::AgentStatus;

/// Benchmark decoding and merging inbound config datagrams
fn bench_datagram_decode_and_merge(c: &mut Criterion) {
    let config = AgentConfig::default();
    let partial = br#"{"CLIENT_SCREENSHOT_INTERVAL": 30000}"#;
    let snapshot = br#"{
        "SERVER_IP_ADDRESS": "10.20.30.40",
        "CLIENT_API_PORT": 8080,
        "CLIENT_SCREENSHOT_INTERVAL": 30000,
        "CLIENT_APP_VERSION": "0.1.0",
        "freeLaptops": ["aa:bb:cc:dd:ee:ff", "11:22:33:44:55:66"]
    }"#;

    c.bench_function("decode_partial_datagram", |b| {
        b.iter(|| {
            let update = ConfigUpdate::decode(black_box(partial)).unwrap();
            black_box(merge_update(&config, &update));
        });
    });

    c.bench_function("decode_full_snapshot", |b| {
        b.iter(|| {
            let update = ConfigUpdate::decode(black_box(snapshot)).unwrap();
            black_box(merge_update(&config, &update));
        });
    });
}

fn bench_metadata() -> UploadMetadata {
    UploadMetadata {
        device_id: "aa:bb:cc:dd:ee:ff".to_string(),
        user_id: String::new(),
        username: "bench".to_string(),
        local_ip: "192.168.1.20".to_string(),
        active: true,
        registered: true,
        captured_at: "2026-01-01T00:00:00Z".to_string(),
    }
}

/// Benchmark transcoding a frame into an upload payload
fn bench_payload_encoding(c: &mut Criterion) {
    let frames = vec![Frame {
        display_id: "display-0".to_string(),
        data: vec![0x5a; 256 * 1024],
    }];

    let fast = GzipTranscoder::new(1);
    c.bench_function("encode_payload_level_1", |b| {
        b.iter(|| {
            black_box(encode_payload(&frames, &fast, bench_metadata()).unwrap());
        });
    });

    let default = GzipTranscoder::default();
    c.bench_function("encode_payload_level_6", |b| {
        b.iter(|| {
            black_box(encode_payload(&frames, &default, bench_metadata()).unwrap());
        });
    });
}

/// Benchmark status updates on the capture outcome path
fn bench_status_updates(c: &mut Criterion) {
    let status = AgentStatus::new();
    let mut success = false;

    c.bench_function("record_outcome", |b| {
        b.iter(|| {
            success = !success;
            status.record_outcome(black_box(success));
            black_box(status.indicator());
        });
    });
}

/// Benchmark the per-line microphone monitor path
fn bench_monitor_line_parsing(c: &mut Criterion) {
    c.bench_function("parse_rms_level", |b| {
        b.iter(|| {
            black_box(parse_rms_level(black_box("RMS level dB: -37.25")));
            black_box(parse_rms_level(black_box("size= 1024kB time=00:00:01")));
        });
    });

    c.bench_function("silence_gate_observe", |b| {
        let mut gate = SilenceGate::new(-50.0, 5);
        let mut level = -30.0;
        b.iter(|| {
            level = if level > -60.0 { level - 1.0 } else { -30.0 };
            black_box(gate.observe(black_box(level), true));
        });
    });
}

criterion_group!(
    benches,
    bench_datagram_decode_and_merge,
    bench_payload_encoding,
    bench_status_updates,
    bench_monitor_line_parsing
);
criterion_main!(benches);
