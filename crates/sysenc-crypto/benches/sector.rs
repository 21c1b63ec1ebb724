use sysenc_core::{ChainingMode, EncryptionAlgorithm};
use sysenc_crypto::{CryptoContext, LoaderFingerprint, SectorStream};

fn make_data(size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| (i.wrapping_mul(7) ^ (i >> 3)) as u8)
        .collect()
}

#[divan::bench(args = [512, 4096])]
fn bench_encrypt_sector(bencher: divan::Bencher, sector_size: usize) {
    let ctx = CryptoContext::generate(EncryptionAlgorithm::Aes, ChainingMode::Xts).unwrap();
    let stream = SectorStream::new(&ctx, sector_size).unwrap();
    let mut data = make_data(sector_size);
    bencher
        .counter(divan::counter::BytesCount::new(sector_size))
        .bench_local(|| {
            stream
                .encrypt_sector_in_place(divan::black_box(42), divan::black_box(&mut data))
                .unwrap()
        });
}

#[divan::bench(args = [64, 256, 2048])]
fn bench_encrypt_batch(bencher: divan::Bencher, sectors: usize) {
    let ctx = CryptoContext::generate(EncryptionAlgorithm::Aes, ChainingMode::Xts).unwrap();
    let stream = SectorStream::new(&ctx, 512).unwrap();
    let mut data = make_data(sectors * 512);
    bencher
        .counter(divan::counter::BytesCount::new(sectors * 512))
        .bench_local(|| {
            stream
                .encrypt_sectors(divan::black_box(0), divan::black_box(&mut data))
                .unwrap()
        });
}

#[divan::bench(args = [512, 31744])]
fn bench_loader_fingerprint(bencher: divan::Bencher, size: usize) {
    let data = make_data(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| LoaderFingerprint::compute(divan::black_box(&data)));
}

fn main() {
    divan::main();
}
