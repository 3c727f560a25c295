#![no_main]

use brkalloc_fuzzing::Ops;
use libfuzzer_sys::{fuzz_mutator, fuzz_target, fuzzer_mutate};
use mutatis::Session;

/// Cap on live requested bytes per heap variant.
const ALLOCATION_LIMIT: usize = 1 << 20;

fuzz_mutator!(|data: &mut [u8], size: usize, max_size: usize, seed: u32| {
    let _ = env_logger::try_init();

    // About one time in eight, let libFuzzer flip raw bytes instead.
    if seed.count_ones() % 8 == 0 {
        return fuzzer_mutate(data, size, max_size);
    }

    let mut ops = Ops::decode(&data[..size]).unwrap_or_default();
    let mut session = Session::new().seed(seed.into()).shrink(max_size < size);
    if session.mutate(&mut ops).is_ok() {
        if let Some(len) = ops.encode_into(data) {
            return len;
        }
    }

    fuzzer_mutate(data, size, max_size)
});

fuzz_target!(|data: &[u8]| {
    let _ = env_logger::try_init();
    if let Some(ops) = Ops::decode(data) {
        if let Err(e) = ops.run(ALLOCATION_LIMIT) {
            panic!("{} ops failed: {e}", ops.len());
        }
    }
});
