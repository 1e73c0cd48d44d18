// Handshake benchmarks for blind pairing.
//
// Covers invite creation, building a candidate request, the member opening
// and confirming it, the candidate opening the response, and the raw
// namespace hash at various input sizes.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use blind_pairing::crypto::blake3_hash;
use blind_pairing::pairing::{
    create_invite, CandidateRequest, Confirmation, InviteOptions, MemberRequest,
};

const KEY: [u8; 32] = [7u8; 32];

fn bench_create_invite(c: &mut Criterion) {
    c.bench_function("pairing/create_invite", |b| {
        b.iter(|| create_invite(&KEY, InviteOptions::default()));
    });
}

fn bench_candidate_request(c: &mut Criterion) {
    let created = create_invite(&KEY, InviteOptions::default());

    c.bench_function("pairing/candidate_request", |b| {
        b.iter(|| {
            let request = CandidateRequest::from_invite_bytes(&created.invite, b"laptop").unwrap();
            request.encode().unwrap().len()
        });
    });
}

fn bench_member_open_confirm(c: &mut Criterion) {
    let created = create_invite(&KEY, InviteOptions::default());
    let request = CandidateRequest::from_invite_bytes(&created.invite, b"laptop").unwrap();
    let encoded = request.encode().unwrap().to_vec();

    c.bench_function("pairing/member_open_confirm", |b| {
        b.iter(|| {
            let mut member = MemberRequest::from_bytes(&encoded).unwrap();
            member.open(&created.public_key).unwrap();
            member.confirm(Confirmation::new(KEY)).unwrap();
        });
    });
}

fn bench_candidate_open_response(c: &mut Criterion) {
    let created = create_invite(&KEY, InviteOptions::default());
    let request = CandidateRequest::from_invite_bytes(&created.invite, b"laptop").unwrap();
    let mut member = MemberRequest::from_bytes(request.encode().unwrap()).unwrap();
    member.open(&created.public_key).unwrap();
    member.confirm(Confirmation::new(KEY)).unwrap();
    let response = member.response().unwrap().to_vec();

    c.bench_function("pairing/candidate_open_response", |b| {
        b.iter(|| {
            let mut request =
                CandidateRequest::from_invite_bytes(&created.invite, b"laptop").unwrap();
            request.handle_response(&response)
        });
    });
}

fn bench_hash(c: &mut Criterion) {
    let mut group = c.benchmark_group("blake3/hash");

    for size in [32, 256, 4096] {
        let data = vec![0xabu8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| blake3_hash(data));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_create_invite,
    bench_candidate_request,
    bench_member_open_confirm,
    bench_candidate_open_response,
    bench_hash,
);
criterion_main!(benches);
