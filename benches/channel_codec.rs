use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use tokio_util::codec::{Decoder, Encoder};

use attested_inference::attestation::dcap::DcapVerifier;
use attested_inference::crypto::seal::{OpeningContext, SealingContext};
use attested_inference::frame::codec::FrameCodec;
use attested_inference::frame::{Frame, FrameType, HEADER_SIZE};
use attested_inference::mock::{PlatformConfig, SyntheticPlatform};
use attested_inference::{AttestationVerifier, DType, TcbPolicy, Tensor};

fn bench_frame_codec(c: &mut Criterion) {
    let frame = Frame::sealed(FrameType::Data, 7, Bytes::from(vec![0xABu8; 4096]));
    let mut wire = BytesMut::new();
    FrameCodec::new().encode(frame.clone(), &mut wire).unwrap();
    let wire = wire.freeze();

    let mut group = c.benchmark_group("frame_codec");
    group.throughput(Throughput::Bytes(wire.len() as u64));

    group.bench_function("encode_4k", |b| {
        let mut codec = FrameCodec::new();
        b.iter(|| {
            let mut buf = BytesMut::with_capacity(HEADER_SIZE + frame.payload.len());
            codec.encode(frame.clone(), &mut buf).unwrap();
            black_box(buf)
        })
    });

    group.bench_function("decode_4k", |b| {
        let mut codec = FrameCodec::new();
        b.iter(|| {
            let mut buf = BytesMut::from(&wire[..]);
            black_box(codec.decode(&mut buf).unwrap().unwrap())
        })
    });

    group.finish();
}

fn bench_tensor_encode_decode(c: &mut Criterion) {
    let tensor = Tensor::new("hidden", DType::F32, vec![128, 768], vec![0u8; 128 * 768 * 4]);
    let encoded = tensor.to_bytes().unwrap();

    let mut group = c.benchmark_group("tensor_codec");
    group.throughput(Throughput::Bytes(encoded.len() as u64));

    group.bench_function("encode_128x768_f32", |b| {
        b.iter(|| black_box(tensor.to_bytes().unwrap()))
    });

    group.bench_function("decode_128x768_f32", |b| {
        b.iter(|| black_box(Tensor::decode(encoded.clone()).unwrap()))
    });

    group.finish();
}

fn bench_seal_open(c: &mut Criterion) {
    let key = [0x42u8; 32];
    let session_id = [0xAA; 32];
    let plaintext = vec![0xBBu8; 4096];

    let mut group = c.benchmark_group("sealing");
    group.throughput(Throughput::Bytes(plaintext.len() as u64));

    group.bench_function("seal_4k", |b| {
        let mut sealer = SealingContext::new(&key, session_id, 2);
        b.iter(|| black_box(sealer.seal(FrameType::Data, &plaintext).unwrap()))
    });

    // Each frame opens once, so every iteration gets a fresh opener.
    group.bench_function("open_4k", |b| {
        let frame = SealingContext::new(&key, session_id, 2)
            .seal(FrameType::Data, &plaintext)
            .unwrap();
        b.iter_batched(
            || OpeningContext::new(&key, session_id),
            |mut opener| black_box(opener.open(&frame).unwrap()),
            BatchSize::SmallInput,
        )
    });

    group.finish();
}

fn bench_quote_verification(c: &mut Criterion) {
    let platform = SyntheticPlatform::new(PlatformConfig::default()).unwrap();
    let (evidence, collateral) = platform.generate(&[0x11; 64]).unwrap();
    let verifier = DcapVerifier::new(&platform.root_pem(), TcbPolicy::default()).unwrap();

    c.bench_function("dcap_verify", |b| {
        b.iter(|| black_box(verifier.verify(&evidence, &collateral).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_frame_codec,
    bench_tensor_encode_decode,
    bench_seal_open,
    bench_quote_verification,
);
criterion_main!(benches);
