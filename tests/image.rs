use std::sync::Once;

use peview::{constants::*, *};

static INIT_LOGGER: Once = Once::new();
fn init_logger() {
    INIT_LOGGER.call_once(|| {
        env_logger::builder()
            .is_test(false)
            .filter_level(log::LevelFilter::Info)
            .format_timestamp(None)
            .format_module_path(false)
            .format_level(true)
            .format_target(false)
            .write_style(env_logger::WriteStyle::Auto)
            .init();
    });
}

static COMPILED_STRING: &str = " * a 'compiled' PE\n";
static DOS_STUB: &[u8] = b"This program cannot be run in DOS mode.\r\r\n$";

const FILE_SIZE: usize = 0xa00;
const IMAGE_SIZE: usize = 0x4000;

struct Section {
    name:            &'static [u8],
    virtual_address: u32,
    virtual_size:    u32,
    raw_pointer:     u32,
    raw_size:        u32,
    characteristics: u32,
}

static SECTIONS: [Section; 3] = [
    Section {
        name:            b".text",
        virtual_address: 0x1000,
        virtual_size:    0x100,
        raw_pointer:     0x400,
        raw_size:        0x200,
        characteristics: IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_MEM_READ,
    },
    Section {
        name:            b".edata",
        virtual_address: 0x2000,
        virtual_size:    0x80,
        raw_pointer:     0x600,
        raw_size:        0x200,
        characteristics: IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ,
    },
    Section {
        name:            b".rdata",
        virtual_address: 0x3000,
        virtual_size:    0x100,
        raw_pointer:     0x800,
        raw_size:        0x200,
        characteristics: IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ,
    },
];

fn put(data: &mut [u8], at: usize, bytes: &[u8]) { data[at..at + bytes.len()].copy_from_slice(bytes); }

fn put16(data: &mut [u8], at: usize, value: u16) { put(data, at, &value.to_le_bytes()); }

fn put32(data: &mut [u8], at: usize, value: u32) { put(data, at, &value.to_le_bytes()); }

fn put64(data: &mut [u8], at: usize, value: u64) { put(data, at, &value.to_le_bytes()); }

/// Assemble a small dll with code, exports and read-only data, laid out as on disk.
fn build_image(machine: u16, pe64: bool) -> Vec<u8> {
    let mut data = vec![0u8; FILE_SIZE];

    put16(&mut data, 0x00, PE_DOS_MAGIC);
    put32(&mut data, PE_PTR_OFFSET as usize, 0x80);
    put(&mut data, 0x40, DOS_STUB);
    put32(&mut data, 0x80, PE_NT_SIGNATURE);

    let size_of_optional_header: u16 = if pe64 { 240 } else { 224 };
    put16(&mut data, 0x84, machine);
    put16(&mut data, 0x86, SECTIONS.len() as u16);
    put16(&mut data, 0x94, size_of_optional_header);
    put16(&mut data, 0x96, IMAGE_FILE_EXECUTABLE_IMAGE | IMAGE_FILE_DLL);

    put16(&mut data, 0x98, if pe64 { PE_64_MAGIC } else { PE_32_MAGIC });
    put32(&mut data, 0xa8, 0x1000);
    let data_directories = if pe64 {
        put64(&mut data, 0xb0, 0x1_4000_0000);
        put32(&mut data, 0x104, IMAGE_NUMBEROF_DIRECTORY_ENTRIES as u32);
        0x108
    } else {
        put32(&mut data, 0xb4, 0x40_0000);
        put32(&mut data, 0xf4, IMAGE_NUMBEROF_DIRECTORY_ENTRIES as u32);
        0xf8
    };
    put32(&mut data, 0xb8, 0x1000);
    put32(&mut data, 0xbc, 0x200);
    put32(&mut data, 0xd0, IMAGE_SIZE as u32);
    put32(&mut data, 0xd4, 0x400);
    put16(&mut data, 0xdc, IMAGE_SUBSYSTEM_WINDOWS_CUI);

    put32(&mut data, data_directories, 0x2000);
    put32(&mut data, data_directories + 4, 0x80);

    let section_table = 0x98 + size_of_optional_header as usize;
    for (index, section) in SECTIONS.iter().enumerate() {
        let at = section_table + index * 40;
        put(&mut data, at, section.name);
        put32(&mut data, at + 8, section.virtual_size);
        put32(&mut data, at + 12, section.virtual_address);
        put32(&mut data, at + 16, section.raw_size);
        put32(&mut data, at + 20, section.raw_pointer);
        put32(&mut data, at + 36, section.characteristics);
    }

    // .text
    put(&mut data, 0x400, &[0x31, 0xc0, 0xc3]);

    // .edata
    put32(&mut data, 0x600 + 12, 0x2050);
    put32(&mut data, 0x600 + 16, 1);
    put32(&mut data, 0x600 + 20, 2);
    put32(&mut data, 0x600 + 24, 2);
    put32(&mut data, 0x600 + 28, 0x2028);
    put32(&mut data, 0x600 + 32, 0x2030);
    put32(&mut data, 0x600 + 36, 0x2038);
    put32(&mut data, 0x628, 0x1000);
    put32(&mut data, 0x62c, 0x2060);
    put32(&mut data, 0x630, 0x2040);
    put32(&mut data, 0x634, 0x2048);
    put16(&mut data, 0x638, 0);
    put16(&mut data, 0x63a, 1);
    put(&mut data, 0x640, b"alpha\0");
    put(&mut data, 0x648, b"beta\0");
    put(&mut data, 0x650, b"test.dll\0");
    put(&mut data, 0x660, b"other.func\0");

    // .rdata
    put(&mut data, 0x800, COMPILED_STRING.as_bytes());
    put(&mut data, 0x840, &[b'w', 0, b'i', 0, b'd', 0, b'e', 0, 0, 0]);

    data
}

/// Lay out a disk image the way the loader maps it.
fn map_image(disk: &[u8]) -> Vec<u8> {
    let mut mapped = vec![0u8; IMAGE_SIZE];
    mapped[..0x400].copy_from_slice(&disk[..0x400]);
    for section in SECTIONS.iter() {
        let size = section.virtual_size.min(section.raw_size) as usize;
        let source = section.raw_pointer as usize;
        let target = section.virtual_address as usize;
        mapped[target..target + size].copy_from_slice(&disk[source..source + size]);
    }
    mapped
}

#[test]
fn parse_image() {
    init_logger();

    let registry = Registry::new();
    let data = build_image(IMAGE_FILE_MACHINE_I386, false);
    let image = Image::from_bytes(&registry, &data).unwrap();

    assert_eq!(image.e_lfanew(), 0x80);
    assert_eq!(image.pe_signature(), PE_NT_SIGNATURE);
    assert_eq!(image.machine(), IMAGE_FILE_MACHINE_I386);
    assert_eq!(image.arch(), Arch::I386);
    assert_eq!(image.entrypoint(), Rva(0x1000));
    assert_eq!(image.subsystem(), IMAGE_SUBSYSTEM_WINDOWS_CUI);
    assert!(image.windows_header().is_32());
    assert_eq!(image.image_base(), 0x40_0000);
    assert_eq!(image.file_alignment(), 0x200);
    assert_eq!(image.section_alignment(), 0x1000);
    assert_eq!(image.size(), FILE_SIZE);
    assert_eq!(image.image_size(), IMAGE_SIZE as u32);

    let stub = image.dos_stub().unwrap();
    assert_eq!(stub.len(), 0x40);
    assert_eq!(&stub.as_bytes().unwrap()[..DOS_STUB.len()], DOS_STUB);

    assert_eq!(image.data_directories().len(), IMAGE_NUMBEROF_DIRECTORY_ENTRIES);
    assert!(image.has_directory(DataDirectoryType::ExportTable));
    assert!(!image.has_directory(DataDirectoryType::ImportTable));
    let section = image.section_header_for_data_directory(DataDirectoryType::ExportTable).unwrap();
    assert_eq!(section.name().unwrap(), ".edata");

    let table = image.section_table_view().unwrap();
    assert_eq!(table.len(), 3);
    assert_eq!(table.get(2).unwrap().name().unwrap(), ".rdata");
    assert_eq!(image.section_header(0usize).unwrap().name_size(), 5);
    assert!(image.section_header(0usize).unwrap().name_is_string());
}

#[test]
fn parse_image_64() {
    init_logger();

    let registry = Registry::new();
    let data = build_image(IMAGE_FILE_MACHINE_AMD64, true);
    let image = Image::from_bytes(&registry, &data).unwrap();

    assert!(image.windows_header().is_64());
    assert_eq!(image.arch(), Arch::Amd64);
    assert_eq!(image.image_base(), 0x1_4000_0000);
    assert_eq!(image.image_size(), IMAGE_SIZE as u32);
    assert_eq!(image.section_table().len(), 3);
    let text = *image.section_by_name(".text").unwrap();
    assert_eq!({ text.virtual_address }, 0x1000);
}

#[test]
fn section_lookup() {
    init_logger();

    let registry = Registry::new();
    let data = build_image(IMAGE_FILE_MACHINE_I386, false);
    let image = Image::from_bytes(&registry, &data).unwrap();

    let edata = *image.section_by_name(".edata").unwrap();
    assert_eq!({ edata.pointer_to_raw_data }, 0x600);
    assert_eq!(image.section_by_offset(Offset(0x650)).unwrap(), &edata);
    assert_eq!(image.section_by_rva(Rva(0x2010)).unwrap(), &edata);

    assert!(matches!(image.section_by_name(".bss"), Err(AddressError::SectionNotFound)));
    assert!(matches!(image.section_by_name(".edat"), Err(AddressError::SectionNotFound)));
    assert!(matches!(image.section_by_offset(Offset(0x100)), Err(AddressError::SectionNotFound)));
    assert!(matches!(image.section_by_offset(Offset(0x2000)), Err(AddressError::SectionNotFound)));
    assert!(matches!(image.section_by_rva(Rva(0x3800)), Err(AddressError::SectionNotFound)));
}

#[test]
fn reject_invalid_headers() {
    init_logger();

    let registry = Registry::new();

    let mut data = build_image(IMAGE_FILE_MACHINE_I386, false);
    data[0] = 0;
    assert!(matches!(
        Image::from_bytes(&registry, &data),
        Err(ImageReadError::InvalidDosSignature(0x5a00))
    ));

    let mut data = build_image(IMAGE_FILE_MACHINE_I386, false);
    data[0x80] = 0;
    assert!(matches!(
        Image::from_bytes(&registry, &data),
        Err(ImageReadError::InvalidNtSignature(0x4500))
    ));

    let mut data = build_image(IMAGE_FILE_MACHINE_I386, false);
    put16(&mut data, 0x98, 0x107);
    assert!(matches!(
        Image::from_bytes(&registry, &data),
        Err(ImageReadError::UnexpectedOptionalMagic(0x107))
    ));

    let mut data = build_image(IMAGE_FILE_MACHINE_I386, false);
    put16(&mut data, 0x94, 0x10);
    assert!(matches!(Image::from_bytes(&registry, &data), Err(ImageReadError::InvalidHeader(_))));

    let data = build_image(IMAGE_FILE_MACHINE_I386, false);
    assert!(matches!(
        Image::from_bytes(&registry, &data[..16]),
        Err(ImageReadError::Memory(MemoryError::OutOfBounds { .. }))
    ));
}

#[test]
fn section_round_trip() {
    init_logger();

    let registry = Registry::new();
    let data = build_image(IMAGE_FILE_MACHINE_I386, false);
    let image = Image::from_bytes(&registry, &data).unwrap();

    for section in image.section_table() {
        let (virtual_address, virtual_size) = (section.virtual_address, section.virtual_size);
        let (raw_pointer, raw_size) = (section.pointer_to_raw_data, section.size_of_raw_data);
        for delta in (0..virtual_size.min(raw_size)).step_by(0x10) {
            let offset = Offset(raw_pointer + delta);
            let rva = image.offset_to_rva(offset).unwrap();
            assert_eq!(rva, Rva(virtual_address + delta));
            assert_eq!(image.rva_to_offset(rva).unwrap(), offset);
        }
    }

    // headers are identical on disk and in memory
    assert_eq!(image.offset_to_rva(Offset(0x80)).unwrap(), Rva(0x80));
    assert_eq!(image.rva_to_offset(Rva(0x80)).unwrap(), Offset(0x80));
}

#[test]
fn compiled_string() {
    init_logger();

    let registry = Registry::new();
    let data = build_image(IMAGE_FILE_MACHINE_I386, false);
    let image = Image::from_bytes(&registry, &data).unwrap();

    let offset = Rva(0x3000).as_offset(&image).unwrap();
    assert_eq!(offset, Offset(0x800));
    assert_eq!(image.cstring(Rva(0x3000)).unwrap(), COMPILED_STRING);
    assert_eq!(image.cstring_at(0x800).unwrap().len(), COMPILED_STRING.len() + 1);
    assert_eq!(image.wstring(Rva(0x3040)).unwrap(), "wide");

    assert_eq!(image.rva_to_offset(Rva(0x4000)), Err(AddressError::InvalidRva(Rva(0x4000))));
    assert_eq!(image.offset_to_rva(Offset(0xa00)), Err(AddressError::InvalidOffset(Offset(0xa00))));
    // raw padding past the virtual size of .text has no rva
    assert_eq!(image.offset_to_rva(Offset(0x500)), Err(AddressError::InvalidRva(Rva(0x1100))));
}

#[test]
fn virtual_address_width() {
    init_logger();

    let registry = Registry::new();

    let data = build_image(IMAGE_FILE_MACHINE_I386, false);
    let image = Image::from_bytes(&registry, &data).unwrap();
    let va = image.rva_to_va(Rva(0x1000)).unwrap();
    assert_eq!(va, Va::Va32(Va32(0x40_1000)));
    assert_eq!(image.va_to_rva(va).unwrap(), Rva(0x1000));
    assert_eq!(Va32(0x40_3000).as_offset(&image).unwrap(), Offset(0x800));
    assert_eq!(image.va_to_rva(Va::Va32(Va32(0x40_4000))), Err(AddressError::InvalidVa(Va::Va32(Va32(0x40_4000)))));

    let data = build_image(IMAGE_FILE_MACHINE_AMD64, true);
    let image = Image::from_bytes(&registry, &data).unwrap();
    let va = Offset(0x800).as_va(&image).unwrap();
    assert_eq!(va, Va::Va64(Va64(0x1_4000_3000)));
    assert_eq!(va.as_rva(&image).unwrap(), Rva(0x3000));

    let data = build_image(IMAGE_FILE_MACHINE_ARM, false);
    let image = Image::from_bytes(&registry, &data).unwrap();
    assert!(image.rva_to_va(Rva(0x1000)).unwrap().is_32());

    let data = build_image(0x1234, false);
    let image = Image::from_bytes(&registry, &data).unwrap();
    assert_eq!(image.arch(), Arch::Unsupported(0x1234));
    assert_eq!(image.rva_to_va(Rva(0x1000)), Err(AddressError::UnsupportedArchitecture(0x1234)));
}

#[test]
fn address_arithmetic() {
    let mut rva = Rva(0x1000) + 0x20;
    rva -= Rva(0x10);
    assert_eq!(rva, Rva(0x1010));
    assert_eq!(Rva(0) - 1, Rva(u32::MAX));
    assert_eq!(Offset(0x10) * 2 / 4 % 3, Offset(2));
    assert_eq!(Va64(0xff) ^ 0x0f, Va64(0xf0));
    assert_eq!(Rva(0x1010).to_string(), "0x1010");
    assert_eq!(Va::Va32(Va32(0x40_1000)).to_string(), "0x401000");
    assert_eq!(u32::from(Offset(7)), 7);
}

#[test]
fn memory_address_by_image_type() {
    init_logger();

    let registry = Registry::new();
    let disk = build_image(IMAGE_FILE_MACHINE_I386, false);

    let image = Image::from_bytes(&registry, &disk).unwrap();
    assert_eq!(image.memory_address(Rva(0x3000).into()).unwrap(), 0x800);
    assert_eq!(image.memory_address(Offset(0x800).into()).unwrap(), 0x800);
    assert_eq!(image.memory_address(Va32(0x40_3000).into()).unwrap(), 0x800);
    let rdata = image.section_by_name(".rdata").unwrap();
    assert_eq!(image.section_data(rdata).unwrap().len(), 0x200);

    let view = TypedView::from_vec(&registry, map_image(&disk));
    let image = Image::parse(view, ImageType::Memory).unwrap();
    assert_eq!(image.image_type(), ImageType::Memory);
    assert_eq!(image.memory_address(Rva(0x3000).into()).unwrap(), 0x3000);
    assert_eq!(image.memory_address(Offset(0x800).into()).unwrap(), 0x3000);
    assert_eq!(image.cstring(Offset(0x800)).unwrap(), COMPILED_STRING);
    let rdata = image.section_by_name(".rdata").unwrap();
    assert_eq!(image.section_data(rdata).unwrap().len(), 0x100);
    assert_eq!(image.memory_address(Rva(0x4000).into()), Err(AddressError::InvalidRva(Rva(0x4000))));
}

#[test]
fn checksum() {
    init_logger();

    let registry = Registry::new();
    let data = build_image(IMAGE_FILE_MACHINE_I386, false);

    let mut image = Image::from_bytes(&registry, &data).unwrap();
    let calculated = image.calculate_checksum().unwrap();
    assert!(!image.validate_checksum().unwrap());
    assert!(matches!(image.update_checksum(), Err(MemoryError::ReadOnly)));

    let mut image = Image::parse(TypedView::from_slice(&registry, &data[..]), ImageType::Disk).unwrap();
    assert_eq!(image.update_checksum().unwrap(), 0);
    assert_eq!(image.windows_header().check_sum(), calculated);
    assert_eq!(image.calculate_checksum().unwrap(), calculated);
    assert!(image.validate_checksum().unwrap());

    let stored = image.view().read::<u32>(image.optional_header_offset() + 64, 1).unwrap();
    assert_eq!(stored, vec![calculated]);
}

#[test]
fn exports() {
    init_logger();

    let registry = Registry::new();
    let data = build_image(IMAGE_FILE_MACHINE_I386, false);
    let image = Image::from_bytes(&registry, &data).unwrap();

    let exports = image.export_directory().unwrap();
    assert_eq!(exports.name(), "test.dll");
    assert_eq!(exports.base(), 1);
    assert_eq!(exports.functions().len(), 2);
    assert_eq!(exports.names().len(), 2);
    assert_eq!(exports.name_ordinals().to_vec().unwrap(), vec![0, 1]);

    let map = exports.export_map(&image).unwrap();
    assert_eq!(map.len(), 2);
    assert_eq!(map.get_index(0), Some((&"alpha".to_string(), &Export::Function(Rva(0x1000)))));
    assert_eq!(map.get("beta"), Some(&Export::Forwarder("other.func".to_string())));

    let mut data = build_image(IMAGE_FILE_MACHINE_I386, false);
    put32(&mut data, 0xf8 + 4, 0);
    let image = Image::from_bytes(&registry, &data).unwrap();
    assert!(matches!(image.export_directory(), Err(ImageReadError::DirectoryUnavailable(0))));
}

#[test]
fn exports_outlive_image_data() {
    init_logger();

    let registry = Registry::new();
    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join("test.dll");
    std::fs::write(&path, build_image(IMAGE_FILE_MACHINE_I386, false)).unwrap();

    let image = Image::parse_file(&registry, &path).unwrap();
    let exports = image.export_directory().unwrap();
    assert_eq!(exports.functions().get(0).unwrap(), Rva(0x1000));

    drop(image);
    assert!(!exports.functions().is_valid());
    assert!(matches!(exports.functions().get(0), Err(MemoryError::InvalidPointer { .. })));
}

#[test]
fn write_image() {
    init_logger();

    let registry = Registry::new();
    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join("copy.dll");

    let data = build_image(IMAGE_FILE_MACHINE_AMD64, true);
    let image = Image::from_bytes(&registry, &data).unwrap();
    image.write_file(&path).unwrap();

    let written = Image::parse_file(&registry, &path).unwrap();
    assert_eq!(&written.data().unwrap()[..], &data[..]);
    assert_eq!(written.coff_header(), image.coff_header());
    assert_eq!(written.windows_header(), image.windows_header());
    assert_eq!(written.section_table(), image.section_table());

    let cloned = image.cloned().unwrap();
    assert!(cloned.view().is_owned());
    assert_eq!(cloned.entrypoint(), image.entrypoint());
}
