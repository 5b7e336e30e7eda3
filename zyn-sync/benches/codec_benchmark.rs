use criterion::{black_box, criterion_group, criterion_main, Criterion};
use zyn_sync::edit::diff_operations;
use zyn_sync::framer::Framer;
use zyn_sync::protocol::{Block, EditKind, Notification, Request, Response, ResponseBody, ResponseKind};
use zyn_sync::reader::plan_blocks;

fn read_response(size: usize) -> Vec<u8> {
    Response::ok(
        7,
        ResponseBody::Read { revision: 3, block: Block::new(0, size as u64), data: vec![b'x'; size] },
    )
    .encode()
}

fn bench_request_encode(c: &mut Criterion) {
    let request = Request::InsertPreamble { node_id: 42, revision: 17, block: Block::new(1024, 64) };

    c.bench_function("insert_preamble_encode", |b| {
        b.iter(|| black_box(black_box(&request).encode(black_box(9))))
    });
}

fn bench_response_decode(c: &mut Criterion) {
    let bytes = read_response(0);

    c.bench_function("read_header_decode", |b| {
        b.iter(|| black_box(Response::decode(black_box(&bytes), ResponseKind::Read).unwrap()))
    });
}

fn bench_framer_read_4k(c: &mut Criterion) {
    let bytes = read_response(4096);

    c.bench_function("framer_read_4KB_in_256B_chunks", |b| {
        b.iter(|| {
            let mut framer = Framer::new(4096);
            let mut frame = None;
            for chunk in bytes.chunks(256) {
                if let Some(done) = framer.feed(chunk, Some(ResponseKind::Read)).unwrap() {
                    frame = Some(done);
                }
            }
            black_box(frame.unwrap());
        })
    });
}

fn bench_framer_notifications(c: &mut Criterion) {
    let mut stream = Vec::new();
    for revision in 0..100 {
        let notification = Notification::Edit {
            kind: EditKind::Insert,
            node_id: 5,
            revision,
            block: Block::new(revision, 1),
        };
        stream.extend(notification.encode());
    }

    c.bench_function("framer_100_notifications", |b| {
        b.iter(|| {
            let mut framer = Framer::new(4096);
            framer.push(black_box(&stream));
            let mut count = 0;
            while framer.next_frame(None).unwrap().is_some() {
                count += 1;
            }
            assert_eq!(count, 100);
        })
    });
}

fn bench_plan_blocks(c: &mut Criterion) {
    c.bench_function("plan_blocks_1MB_4KB_pages", |b| {
        b.iter(|| black_box(plan_blocks(black_box(0), black_box(1 << 20), black_box(4096))))
    });
}

fn bench_diff_operations(c: &mut Criterion) {
    let old: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
    let mut new = old.clone();
    new.splice(32_000..32_010, b"replacement text".iter().copied());

    c.bench_function("diff_operations_64KB_middle_edit", |b| {
        b.iter(|| black_box(diff_operations(black_box(&old), black_box(&new))))
    });
}

criterion_group!(
    benches,
    bench_request_encode,
    bench_response_decode,
    bench_framer_read_4k,
    bench_framer_notifications,
    bench_plan_blocks,
    bench_diff_operations,
);
criterion_main!(benches);
