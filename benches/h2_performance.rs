//! HTTP/2 transport performance benchmarks
//!
//! This benchmark suite measures the hot paths of the write and read loops:
//! - Frame header encoding/decoding
//! - DATA frame serialization and parsing
//! - Message framing (5-byte prefix) in both directions
//! - Header block compression and CONTINUATION splitting
//! - Stream queue draining
//! - Flow control accounting
//!
//! Run with: cargo bench --bench h2_performance

use bytes::{Bytes, BytesMut};
use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};
use h2rpc::http::h2::{
    codec::{FrameCodec, FrameHeader, FRAME_HEADER_SIZE},
    flow_control::{ConnectionFlowControl, StreamFlowControl, DEFAULT_LAZY_THRESHOLD},
    frames::{DataFrame, Frame, FrameFlags, FrameType, SettingsFrame},
    header_assembler::{HeaderAssembler, HeaderDisassembler},
    header_codec::{HeaderDecoder, HeaderEncoder, HpackDecoder, HpackEncoder},
    message::{Message, MessageAssembler, MessageDisassembler},
    settings::SettingsBuilder,
    stream_data_queue::StreamDataQueue,
    DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE,
};
use h2rpc::http::Metadata;
use std::time::Duration;

fn request_metadata() -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert(":method", "POST");
    metadata.insert(":scheme", "http");
    metadata.insert(":path", "/helloworld.Greeter/SayHello");
    metadata.insert(":authority", "localhost:50051");
    metadata.insert("content-type", "application/grpc");
    metadata.insert("te", "trailers");
    metadata.insert("grpc-timeout", "1S");
    metadata.insert("user-agent", "h2rpc/0.1");
    metadata
}

// ========== Frame Encoding/Decoding Benchmarks ==========

fn bench_frame_header(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_header");

    let data = FrameHeader::new(FrameType::Data, FrameFlags::from_u8(0x01), 1, 1024);
    let headers = FrameHeader::new(FrameType::Headers, FrameFlags::from_u8(0x05), 3, 4096);

    group.bench_function("encode_data_header", |b| {
        b.iter(|| black_box(FrameCodec::encode_header(black_box(&data))));
    });

    group.bench_function("encode_headers_header", |b| {
        b.iter(|| black_box(FrameCodec::encode_header(black_box(&headers))));
    });

    let raw = FrameCodec::encode_header(&data);
    group.bench_function("decode_data_header", |b| {
        b.iter(|| black_box(FrameCodec::decode_header(black_box(&raw))));
    });

    group.finish();
}

fn bench_data_frames(c: &mut Criterion) {
    let mut group = c.benchmark_group("data_frames");

    for size in [64usize, 1024, 16384] {
        let payload = Bytes::from(vec![0u8; size]);
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("encode", size), &payload, |b, payload| {
            let mut out = BytesMut::with_capacity(size + FRAME_HEADER_SIZE);
            b.iter(|| {
                out.clear();
                let frame = DataFrame::new(1, payload.clone(), false);
                FrameCodec::encode_data_frame(black_box(frame), &mut out);
                black_box(&out);
            });
        });

        let mut encoded = BytesMut::new();
        FrameCodec::encode_data_frame(DataFrame::new(1, payload.clone(), true), &mut encoded);
        let encoded = encoded.freeze();
        group.bench_with_input(BenchmarkId::new("parse", size), &encoded, |b, encoded| {
            b.iter(|| {
                let mut raw = [0u8; FRAME_HEADER_SIZE];
                raw.copy_from_slice(&encoded[..FRAME_HEADER_SIZE]);
                let header = FrameCodec::decode_header(&raw);
                let frame =
                    FrameCodec::parse_frame_payload(&header, encoded.slice(FRAME_HEADER_SIZE..));
                black_box(frame)
            });
        });
    }

    group.finish();
}

fn bench_settings_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("settings_frame");

    let settings = SettingsBuilder::new()
        .header_table_size(4096)
        .enable_push(false)
        .max_concurrent_streams(100)
        .initial_window_size(1 << 20)
        .max_frame_size(DEFAULT_MAX_FRAME_SIZE)
        .max_header_list_size(16 * 1024)
        .allow_true_binary_metadata(true)
        .build()
        .unwrap();

    group.bench_function("encode", |b| {
        let mut out = BytesMut::new();
        b.iter(|| {
            out.clear();
            let frame = SettingsFrame::new(black_box(&settings).to_params());
            FrameCodec::encode_settings_frame(&frame, &mut out);
            black_box(&out);
        });
    });

    group.finish();
}

// ========== Message Framing Benchmarks ==========

fn bench_message_framing(c: &mut Criterion) {
    let mut group = c.benchmark_group("message_framing");

    for size in [128usize, 64 * 1024, 1024 * 1024] {
        let message = Message::new(Bytes::from(vec![0x5Au8; size]));
        group.throughput(Throughput::Bytes(message.wire_len() as u64));

        group.bench_with_input(BenchmarkId::new("disassemble", size), &message, |b, message| {
            b.iter(|| {
                let mut disassembler = MessageDisassembler::new();
                disassembler.append(message).unwrap();
                let mut frames = 0;
                while let Some(chunk) = disassembler.get_next_frame(DEFAULT_MAX_FRAME_SIZE as usize) {
                    black_box(chunk);
                    frames += 1;
                }
                black_box(frames)
            });
        });

        let encoded = message.encode().unwrap();
        let chunks: Vec<Bytes> = encoded
            .chunks(DEFAULT_MAX_FRAME_SIZE as usize)
            .map(Bytes::copy_from_slice)
            .collect();
        group.bench_with_input(BenchmarkId::new("assemble", size), &chunks, |b, chunks| {
            b.iter(|| {
                let mut assembler = MessageAssembler::new(1);
                for chunk in chunks {
                    assembler.append_new_data_frame(chunk.clone(), false).unwrap();
                }
                black_box(assembler.extract_message().unwrap())
            });
        });
    }

    group.finish();
}

// ========== Header Block Benchmarks ==========

fn bench_header_blocks(c: &mut Criterion) {
    let mut group = c.benchmark_group("header_blocks");
    let metadata = request_metadata();

    group.bench_function("compress", |b| {
        let mut encoder = HpackEncoder::new();
        b.iter(|| black_box(encoder.compress(black_box(&metadata))));
    });

    let block = HpackEncoder::new().compress(&metadata);
    group.bench_function("decompress", |b| {
        b.iter(|| {
            let mut decoder = HpackDecoder::new();
            black_box(decoder.decompress(black_box(&block)).unwrap())
        });
    });

    group.bench_function("split_and_reassemble", |b| {
        b.iter(|| {
            let frames = HeaderDisassembler::new(1).frames(block.clone(), false, 16);
            let mut assembler = HeaderAssembler::new(1, 16 * 1024, 32 * 1024);
            for frame in &frames {
                match frame {
                    Frame::Headers(f) => assembler.append_header_frame(f).unwrap(),
                    Frame::Continuation(f) => assembler.append_continuation_frame(f).unwrap(),
                    _ => unreachable!(),
                }
            }
            let mut decoder = HpackDecoder::new();
            black_box(assembler.read_metadata(&mut decoder).unwrap())
        });
    });

    group.finish();
}

// ========== Stream Queue Benchmarks ==========

fn bench_stream_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("stream_queue");
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();

    for messages in [1usize, 16, 128] {
        group.bench_with_input(
            BenchmarkId::new("drain_call", messages),
            &messages,
            |b, &messages| {
                let mut encoder = HpackEncoder::new();
                b.iter_batched(
                    || {
                        let queue = StreamDataQueue::new(1 << 30);
                        queue.set_stream_id(1);
                        queue.enqueue_initial_metadata(request_metadata()).unwrap();
                        runtime.block_on(async {
                            for _ in 0..messages {
                                queue
                                    .enqueue_message(Message::new(Bytes::from(vec![1u8; 512])))
                                    .await
                                    .unwrap();
                            }
                        });
                        queue.enqueue_half_closed().unwrap();
                        queue
                    },
                    |queue| {
                        let result = queue.dequeue_frames(
                            DEFAULT_INITIAL_WINDOW_SIZE as usize,
                            DEFAULT_MAX_FRAME_SIZE as usize,
                            true,
                            &mut encoder,
                        );
                        let mut out = BytesMut::new();
                        FrameCodec::serialize(result.frames, &mut out);
                        black_box(out)
                    },
                    BatchSize::SmallInput,
                );
            },
        );
    }

    group.finish();
}

// ========== Flow Control Benchmarks ==========

fn bench_flow_control(c: &mut Criterion) {
    let mut group = c.benchmark_group("flow_control");

    group.bench_function("send_and_update", |b| {
        b.iter(|| {
            let mut connection =
                ConnectionFlowControl::new(DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_LAZY_THRESHOLD);
            let mut stream = StreamFlowControl::new(
                1,
                DEFAULT_INITIAL_WINDOW_SIZE,
                DEFAULT_INITIAL_WINDOW_SIZE,
                DEFAULT_LAZY_THRESHOLD,
            );
            for _ in 0..4 {
                black_box(connection.sent_data(black_box(16384)));
                black_box(stream.sent_data(black_box(16384)));
            }
            black_box(connection.recv_update(65535).unwrap());
            black_box(stream.recv_update(65535).unwrap());
        });
    });

    group.bench_function("receive_with_lazy_updates", |b| {
        b.iter(|| {
            let mut stream = StreamFlowControl::new(
                1,
                DEFAULT_INITIAL_WINDOW_SIZE,
                DEFAULT_INITIAL_WINDOW_SIZE,
                DEFAULT_LAZY_THRESHOLD,
            );
            for _ in 0..64 {
                stream.recv_data(black_box(1024)).unwrap();
                if let Some(increment) = stream.make_action() {
                    stream.on_update_sent(increment);
                }
            }
            black_box(stream.announced_window())
        });
    });

    group.finish();
}

// ========== Benchmark Groups ==========

criterion_group! {
    name = frame_encoding;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(10))
        .sample_size(1000);
    targets =
        bench_frame_header,
        bench_data_frames,
        bench_settings_frame
}

criterion_group! {
    name = messages;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(10))
        .sample_size(200);
    targets =
        bench_message_framing,
        bench_stream_queue
}

criterion_group! {
    name = headers;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(10))
        .sample_size(1000);
    targets = bench_header_blocks
}

criterion_group! {
    name = flow_control_benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(10))
        .sample_size(1000);
    targets = bench_flow_control
}

criterion_main!(frame_encoding, messages, headers, flow_control_benches);
