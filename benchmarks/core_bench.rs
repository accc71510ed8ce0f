use criterion::{black_box, criterion_group, criterion_main, Criterion};
use troll_core::gdb_remote;
use troll_core::MemoryImage;

fn bench_packet_framing(c: &mut Criterion) {
    let payload: Vec<u8> = (0..=255u8).cycle().take(0x400).collect();
    let packet = gdb_remote::make_packet(&payload);
    c.bench_function("make_packet_1k", |b| {
        b.iter(|| {
            let _ = black_box(gdb_remote::make_packet(black_box(&payload)));
        })
    });
    c.bench_function("validate_packet_1k", |b| {
        b.iter(|| {
            let _ = black_box(gdb_remote::is_valid_packet(black_box(&packet)));
        })
    });
}

fn bench_image_assembly(c: &mut Criterion) {
    let chunk = vec![0xa5u8; 0x100];
    c.bench_function("memory_image_add_range", |b| {
        b.iter(|| {
            let mut image = MemoryImage::new();
            for i in 0..64u32 {
                image.add_range(0x0800_0000 + i * 0x100, &chunk);
            }
            black_box(image)
        })
    });
}

criterion_group!(benches, bench_packet_framing, bench_image_assembly);
criterion_main!(benches);
