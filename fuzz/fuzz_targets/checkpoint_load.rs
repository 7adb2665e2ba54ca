#![no_main]

use std::fs;

use libfuzzer_sys::fuzz_target;
use tempfile::tempdir;
use vmforge_checkpoint::Checkpoint;

fuzz_target!(|data: &[u8]| {
    let td = match tempdir() {
        Ok(v) => v,
        Err(_) => return,
    };

    let path = td.path().join("vm.checkpoint");
    if fs::write(&path, data).is_ok() {
        let _ = Checkpoint::load(&path);
    }
});
