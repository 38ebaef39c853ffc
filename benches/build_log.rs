use divan::Bencher;
use std::io::Write;

fn main() {
    divan::main();
}

fn generate_log(lines: usize, unique: usize) -> Vec<u8> {
    let mut buf: Vec<u8> = Vec::new();
    write!(buf, "# ninja log v4\n").unwrap();
    for i in 0..lines {
        write!(
            buf,
            "{}\t{}\t0\tout/obj/file{}.o\tcc -c src/file{}.c -o out/obj/file{}.o\n",
            i,
            i + 1,
            i % unique,
            i % unique,
            i % unique,
        )
        .unwrap();
    }
    buf
}

#[divan::bench]
fn load_synthetic(bencher: Bencher) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("log").to_str().unwrap().to_owned();
    std::fs::write(&path, generate_log(100_000, 5_000)).unwrap();

    bencher.bench_local(|| {
        let mut log = kiln::build_log::BuildLog::new();
        log.load(&path).unwrap();
        divan::black_box(log.num_entries())
    });
}
