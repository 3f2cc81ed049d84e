#![no_main]

use std::fs;

use libfuzzer_sys::fuzz_target;
use tempfile::tempdir;
use xdd::NullReporter;
use xdd::changelog::{changelog_path, load_current};

fuzz_target!(|data: &[u8]| {
    let td = match tempdir() {
        Ok(v) => v,
        Err(_) => return,
    };

    let root = td.path().join(".xdd");
    let path = changelog_path(&root);
    if let Some(parent) = path.parent() {
        if fs::create_dir_all(parent).is_err() {
            return;
        }
    }
    if fs::write(path, data).is_ok() {
        let _ = load_current(&root, &mut NullReporter);
    }
});
