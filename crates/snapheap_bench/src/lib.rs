//! Criterion benchmarks for `snapheap_core` live under `benches/`.
