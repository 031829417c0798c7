#![no_main]

use libfuzzer_sys::fuzz_target;
use peimage::Image;

fuzz_target!(|data: &[u8]| {
    if let Ok(mut image) = Image::from_mem(data.to_vec()) {
        let entry = image.entry_point();
        let _ = image.overlay();

        let mut stream = image.stream();
        if stream.seek_rva(entry) {
            let _ = stream.read_ansi_string();
        }
    }
    let _ = Image::from_mapped_mem(data.to_vec());
});
