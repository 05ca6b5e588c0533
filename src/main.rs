use c3bt::bench;

fn main() {
    bench::bench_main();
}
