#![no_main]

use libfuzzer_sys::fuzz_target;
use patterndb::codec::decode_blob;

fuzz_target!(|data: &[u8]| {
    let _ = decode_blob(data);
});
