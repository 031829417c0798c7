//! End-to-end tests of loading, translation, the cursor stream and overlays through the public
//! API.

mod common;

use std::fs;

use common::{pattern, write_temp, PeBuilder};
use peimage::{
    DiagnosticCategory, DirectoryParsers, Error, Image, ImageBits, LoadConfig, Overlay, Source,
    SourceKind,
};

fn minimal_image() -> Vec<u8> {
    PeBuilder::pe32()
        .image_base(0x40_0000)
        .raw_start(0x400)
        .section(".text", 0x1000, 0x200, 0x200)
        .build()
}

#[test]
fn minimal_image_end_to_end() {
    let data = minimal_image();
    let mut image = Image::from_mem(data.clone()).unwrap();

    assert_eq!(image.header_offset(), 0x80);
    assert_eq!(image.bits(), ImageBits::Bits32);
    assert_eq!(image.sections().len(), 1);

    let text = image.sections().get(0).unwrap();
    assert_eq!(text.name, ".text");
    assert_eq!(text.pointer_to_raw_data, 0x400);
    assert_eq!(text.data(), Some(&data[0x400..0x600]));

    assert_eq!(image.rva_to_va(0x1000), 0x40_1000);
    assert_eq!(image.rva_to_offset(0x1000), Some(0x400));

    let mut stream = image.stream();
    assert!(stream.seek_rva(0x1000));
    let mut buffer = [0u8; 4];
    assert!(stream.read_exact(&mut buffer));
    assert_eq!(&buffer, &data[0x400..0x404]);
    assert_eq!(stream.rva(), 0x1004);

    assert!(!image.diagnostics().has_warnings());
}

#[test]
fn translation_round_trips() {
    let image = Image::from_mem(
        PeBuilder::pe64()
            .section(".text", 0x1000, 0x1800, 0x1800)
            .section(".rdata", 0x3000, 0x400, 0x400)
            .virtual_section(".bss", 0x4000, 0x2000)
            .build(),
    )
    .unwrap();

    for rva in (0x1000..0x2800).step_by(0x1FF).chain(0x3000..0x3400) {
        let section = image.rva_to_section(rva).unwrap();
        let expected = u64::from(section.pointer_to_raw_data) + u64::from(rva - section.virtual_address);

        assert_eq!(image.va_to_rva(image.rva_to_va(rva)), rva);
        assert_eq!(image.rva_to_offset(rva), Some(expected));
        assert_eq!(image.offset_to_rva(expected), Some(rva));
        assert_eq!(image.va_to_offset(image.rva_to_va(rva)), Some(expected));
    }

    // Virtual-only section: mapped, but without a file offset
    assert!(image.rva_to_section(0x4100).is_some());
    assert_eq!(image.rva_to_offset(0x4100), None);
    assert_eq!(image.rva_to_section(0x9000), None);
}

#[test]
fn misaligned_header_offset_fails() {
    let data = PeBuilder::pe32()
        .header_offset(0x84)
        .section(".text", 0x1000, 0x200, 0x200)
        .build();

    let mut image = Image::new();
    let result = image.load(Source::buffer(data.clone()), &LoadConfig::default(), &DirectoryParsers::new());

    assert!(matches!(result, Err(Error::MisalignedHeaderOffset(0x84))));
    assert!(image.sections().is_empty());
    assert!(matches!(Image::from_mem(data), Err(Error::MisalignedHeaderOffset(_))));
}

#[test]
fn truncated_section_table() {
    let builder = PeBuilder::pe32()
        .declared_sections(5)
        .virtual_section(".a", 0x1000, 0x100)
        .virtual_section(".b", 0x2000, 0x100)
        .virtual_section(".c", 0x3000, 0x100);
    let mut data = builder.build();
    data.truncate(builder.section_table_end());

    let image = Image::from_mem(data).unwrap();
    assert_eq!(image.file_header().number_of_sections, 5);
    assert_eq!(image.sections().len(), 3);

    let names: Vec<_> = image.sections().iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, [".a", ".b", ".c"]);
    assert!(image
        .diagnostics()
        .by_category(DiagnosticCategory::Section)
        .iter()
        .any(|d| d.message.contains("3 of 5")));
}

#[test]
fn long_section_names() {
    let data = PeBuilder::pe32()
        .section("/4", 0x1000, 0x200, 0x200)
        .section("/999", 0x2000, 0x200, 0x200)
        .string_table(&["data1"])
        .build();

    let image = Image::from_mem(data).unwrap();
    let first = image.sections().get(0).unwrap();
    assert_eq!(first.name, "data1");
    assert_eq!(&first.raw_name[..2], b"/4");
    assert_eq!(image.sections().get(1).map(|s| s.name.as_str()), Some("/999"));
    assert_eq!(image.section_by_name("data1").map(|s| s.virtual_address), Some(0x1000));
    assert_eq!(image.coff_strings().get(4), Some("data1"));

    // Without resolution the short names stay
    let data = PeBuilder::pe32()
        .section("/4", 0x1000, 0x200, 0x200)
        .string_table(&["data1"])
        .build();
    let mut image = Image::new();
    image
        .load(Source::buffer(data), &LoadConfig::minimal(), &DirectoryParsers::new())
        .unwrap();
    assert_eq!(image.sections().get(0).map(|s| s.name.as_str()), Some("/4"));
    assert!(image.coff_strings().is_empty());
}

#[test]
fn overlay_lifecycle_on_disk() {
    let trailing = pattern(0x40, 0x33);
    let data = PeBuilder::pe32()
        .section(".text", 0x1000, 0x200, 0x200)
        .section(".data", 0x2000, 0x200, 0x200)
        .overlay(&trailing)
        .build();
    let (dir, path) = write_temp("overlay.exe", &data);
    let original_size = fs::metadata(&path).unwrap().len();

    let mut image = Image::from_file(&path).unwrap();
    assert_eq!(image.source_kind(), SourceKind::Disk);
    assert_eq!(image.overlay(), Some(Overlay { offset: 0x600, size: 0x40 }));

    let saved = dir.path().join("overlay.bin");
    image.save_overlay_to_file(&saved, false).unwrap();
    assert_eq!(fs::read(&saved).unwrap(), trailing);

    image.remove_overlay().unwrap();
    assert_eq!(fs::metadata(&path).unwrap().len(), original_size - 0x40);
    assert_eq!(image.overlay(), None);

    // Put it back from the saved copy
    image.load_overlay_from_file(&saved, 0, 0).unwrap();
    assert_eq!(fs::read(&path).unwrap(), data);
    assert_eq!(image.overlay_data().unwrap(), trailing);
}

#[test]
fn unmapped_cursor_is_safe() {
    let mut image = Image::from_mem(minimal_image()).unwrap();
    let mut stream = image.stream();

    assert!(stream.seek_rva(0x1100));
    assert!(!stream.seek_rva(0x8000));
    assert_eq!(stream.rva(), 0x1100);

    stream.skip(0x7000);
    let mut buffer = [0xAAu8; 8];
    assert_eq!(stream.read(&mut buffer), 0);
    assert_eq!(stream.write(&buffer), 0);
    assert_eq!(stream.rva(), 0x8100);
    assert!(stream.try_read_le::<u32>().is_none());
}

#[test]
fn native_width_reads() {
    let contents = 0x1122_3344_5566_7788_u64.to_le_bytes();

    for (builder, expected, width) in [
        (PeBuilder::pe32(), 0x5566_7788_u64, 4),
        (PeBuilder::pe64(), 0x1122_3344_5566_7788_u64, 8),
    ] {
        let mut image = Image::from_mem(builder.section_with_data(".data", 0x1000, 0x10, &contents).build()).unwrap();
        let mut stream = image.stream();
        assert!(stream.seek_rva(0x1000));
        assert_eq!(stream.read_native().unwrap(), expected);
        assert_eq!(stream.rva(), 0x1000 + width);
    }

    let mut unknown = Image::from_mem(
        PeBuilder::pe32()
            .magic(0x0107)
            .section_with_data(".data", 0x1000, 0x10, &contents)
            .build(),
    )
    .unwrap();
    assert_eq!(unknown.bits(), ImageBits::Unknown);
    assert!(unknown.diagnostics().by_category(DiagnosticCategory::Header).len() == 1);

    let mut stream = unknown.stream();
    assert!(stream.seek_rva(0x1000));
    assert!(matches!(stream.read_native(), Err(Error::NotSupported)));
}

#[test]
fn mapped_images() {
    let builder = PeBuilder::pe64()
        .section(".text", 0x1000, 0x300, 0x200)
        .section(".data", 0x2000, 0x100, 0x100);
    let dump = builder.build_mapped();
    let disk = builder.build();

    let mut image = Image::from_mapped_mem(dump.clone()).unwrap();
    assert_eq!(image.source_kind(), SourceKind::MappedMemory);
    assert_eq!(image.overlay(), None);
    assert!(matches!(image.remove_overlay(), Err(Error::MappedImage)));

    // Mapped sections cover the full virtual size, zero tail included
    let text = image.sections().get(0).unwrap();
    assert_eq!(text.data().map(<[u8]>::len), Some(0x300));
    assert_eq!(&text.data().unwrap()[..0x200], &disk[0x200..0x400]);
    assert!(text.data().unwrap()[0x200..].iter().all(|&b| b == 0));

    let mut stream = image.stream();
    assert!(stream.seek_rva(0x2000));
    assert_eq!(stream.read_bytes(4), disk[0x400..0x404].to_vec());

    let (_dir, path) = write_temp("dump.bin", &dump);
    let from_file = Image::from_mapped_file(&path).unwrap();
    assert_eq!(from_file.sections().len(), 2);
    assert_eq!(from_file.read_bytes_at(0x1000, 8), disk[0x200..0x208].to_vec());
}

#[test]
fn rejects_non_pe_input() {
    assert!(matches!(Image::from_mem(Vec::new()), Err(Error::Empty)));
    assert!(matches!(Image::from_mem(vec![0u8; 0x100]), Err(Error::InvalidDosSignature(0))));
    assert!(matches!(
        Image::from_file("/nonexistent/peimage/input.exe"),
        Err(Error::FileError(_))
    ));

    let mut not_pe = minimal_image();
    not_pe[0x80..0x84].copy_from_slice(b"NE\0\0");
    assert!(matches!(Image::from_mem(not_pe), Err(Error::InvalidPeSignature(0x0000_454E))));
}

#[test]
fn directory_parsers_see_the_loaded_image() {
    use goblin::pe::data_directories::DataDirectoryType;
    use peimage::{ParseOutcome, ParseStage};

    let mut contents = vec![0u8; 0x40];
    contents[0x10..0x16].copy_from_slice(b"hello\0");
    let data = PeBuilder::pe32()
        .section_with_data(".rdata", 0x2000, 0x40, &contents)
        .directory(DataDirectoryType::ExportTable, 0x2010, 6)
        .build();

    let mut parsers = DirectoryParsers::new();
    parsers.register(ParseStage::Exports, |image: &mut Image| {
        let Some((rva, _)) = image.data_directory(DataDirectoryType::ExportTable) else {
            return ParseOutcome::Error;
        };

        let mut stream = image.stream();
        if !stream.seek_rva(rva) {
            return ParseOutcome::Error;
        }
        match stream.read_ansi_string().as_slice() {
            b"hello" => ParseOutcome::Ok,
            _ => ParseOutcome::Suspicious,
        }
    });
    parsers.register(ParseStage::Resources, |image: &mut Image| {
        match image.data_directory(DataDirectoryType::ResourceTable) {
            Some(_) => ParseOutcome::Ok,
            None => ParseOutcome::Suspicious,
        }
    });

    let mut image = Image::new();
    image
        .load(Source::buffer(data.clone()), &LoadConfig::default(), &parsers)
        .unwrap();
    let directory = image.diagnostics().by_category(DiagnosticCategory::Directory);
    assert_eq!(directory.len(), 1);
    assert!(directory[0].message.contains("resources"));

    // Only the export parser requested
    let config = LoadConfig::default().with_stages(&[ParseStage::Exports]);
    image.load(Source::buffer(data), &config, &parsers).unwrap();
    assert!(!image.diagnostics().has_any());
}
