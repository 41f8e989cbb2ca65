//! Portable executable data types.
//!
//! These types are a one-to-one mapping of the data described in <https://docs.microsoft.com/en-us/windows/win32/debug/pe-format>

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::address::{Offset, Rva};

#[repr(C, packed)]
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Default,
)]
pub struct VersionU8 {
    pub major: u8,
    pub minor: u8,
}
#[repr(C, packed)]
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Default,
)]
pub struct VersionU16 {
    pub major: u16,
    pub minor: u16,
}

#[repr(C, packed)]
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Default,
)]
pub struct DosHeader {
    pub e_magic:    u16,
    pub e_cblp:     u16,
    pub e_cp:       u16,
    pub e_crlc:     u16,
    pub e_cparhdr:  u16,
    pub e_minalloc: u16,
    pub e_maxalloc: u16,
    pub e_ss:       u16,
    pub e_sp:       u16,
    pub e_csum:     u16,
    pub e_ip:       u16,
    pub e_cs:       u16,
    pub e_lfarlc:   u16,
    pub e_ovno:     u16,
    pub e_res:      [u16; 4],
    pub e_oemid:    u16,
    pub e_oeminfo:  u16,
    pub e_res2:     [u16; 10],
    pub e_lfanew:   u32,
}

#[repr(C, packed)]
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Default,
)]
pub struct CoffHeader {
    pub machine:                 u16,
    pub number_of_sections:      u16,
    pub time_date_stamp:         u32,
    pub pointer_to_symbol_table: u32,
    pub number_of_symbols:       u32,
    pub size_of_optional_header: u16,
    pub characteristics:         u16,
}
#[repr(C, packed)]
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Default,
)]
pub struct StandardHeader {
    pub magic:                      u16,
    pub linker_version:             VersionU8,
    pub size_of_code:               u32,
    pub size_of_initialized_data:   u32,
    pub size_of_uninitialized_data: u32,
    pub address_of_entry_point:     u32,
    pub base_of_code:               u32,
}

/// Windows-specific optional header fields, generic over the width of the address fields.
///
/// `BaseOfData` of PE32 images is part of the [`StandardHeader`] region and skipped when
/// reading this header.
#[repr(C)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, FromBytes, Default)]
pub struct WindowsHeader<UXX> {
    pub image_base:               UXX,
    pub section_alignment:        u32,
    pub file_alignment:           u32,
    pub operating_system_version: VersionU16,
    pub image_version:            VersionU16,
    pub subsystem_version:        VersionU16,
    pub win32_version_value:      u32,
    pub size_of_image:            u32,
    pub size_of_headers:          u32,
    pub check_sum:                u32,
    pub subsystem:                u16,
    pub dll_characteristics:      u16,
    pub size_of_stack_reserve:    UXX,
    pub size_of_stack_commit:     UXX,
    pub size_of_heap_reserve:     UXX,
    pub size_of_heap_commit:      UXX,
    pub loader_flags:             u32,
    pub number_of_rva_and_sizes:  u32,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub enum GenericWindowsHeader {
    WindowsHeader32(WindowsHeader<u32>),
    WindowsHeader64(WindowsHeader<u64>),
}

macro_rules! windows_header_fields {
    ($($field:ident: $ty:ty),* $(,)?) => {
        impl GenericWindowsHeader {
            $(
                pub const fn $field(&self) -> $ty {
                    match self {
                        GenericWindowsHeader::WindowsHeader32(header) => header.$field,
                        GenericWindowsHeader::WindowsHeader64(header) => header.$field,
                    }
                }
            )*
        }
    };
}

windows_header_fields! {
    section_alignment: u32,
    file_alignment: u32,
    operating_system_version: VersionU16,
    image_version: VersionU16,
    subsystem_version: VersionU16,
    win32_version_value: u32,
    size_of_image: u32,
    size_of_headers: u32,
    check_sum: u32,
    subsystem: u16,
    dll_characteristics: u16,
    loader_flags: u32,
    number_of_rva_and_sizes: u32,
}

impl GenericWindowsHeader {
    /// Returns the preferred load address, widened to 64 bits.
    pub const fn image_base(&self) -> u64 {
        match self {
            GenericWindowsHeader::WindowsHeader32(header) => header.image_base as u64,
            GenericWindowsHeader::WindowsHeader64(header) => header.image_base,
        }
    }

    pub const fn is_32(&self) -> bool { matches!(self, GenericWindowsHeader::WindowsHeader32(_)) }

    pub const fn is_64(&self) -> bool { matches!(self, GenericWindowsHeader::WindowsHeader64(_)) }
}

#[repr(C, packed)]
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Default,
)]
pub struct ImageDataDirectory {
    pub virtual_address: u32,
    pub size:            u32,
}
impl ImageDataDirectory {
    /// Whether the directory points anywhere.
    pub const fn is_present(&self) -> bool { self.virtual_address != 0 && self.size != 0 }

    /// Whether `rva` lies inside the directory.
    pub fn contains(&self, rva: Rva) -> bool {
        let start = self.virtual_address as u64;
        let end = start + self.size as u64;
        (start..end).contains(&(rva.0 as u64))
    }
}

#[repr(C, packed)]
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Default,
)]
pub struct SectionHeader {
    pub name:                   [u8; 8],
    pub virtual_size:           u32,
    pub virtual_address:        u32,
    pub size_of_raw_data:       u32,
    pub pointer_to_raw_data:    u32,
    pub pointer_to_relocations: u32,
    pub pointer_to_linenumbers: u32,
    pub number_of_relocations:  u16,
    pub number_of_linenumbers:  u16,
    pub characteristics:        u32,
}

impl SectionHeader {
    /// Length of the name without trailing NUL padding.
    pub fn name_size(&self) -> usize {
        self.name.iter().rposition(|&c| c != b'\0').map_or(0, |last| last + 1)
    }

    /// Whether every byte of the name is printable ASCII.
    pub fn name_is_string(&self) -> bool {
        self.name[..self.name_size()].iter().all(|&c| (0x20..0x7f).contains(&c))
    }

    /// Returns the name as a string, if it is valid UTF-8.
    pub fn name(&self) -> Option<String> {
        core::str::from_utf8(&self.name[..self.name_size()]).ok().map(str::to_string)
    }

    /// Returns all 8 bytes of the name field, including padding.
    pub fn name_bytes(&self) -> [u8; 8] { self.name }

    /// Whether the raw data of the section covers `offset`.
    pub fn has_offset(&self, offset: Offset) -> bool {
        let start = self.pointer_to_raw_data as u64;
        (start..start + self.size_of_raw_data as u64).contains(&(offset.0 as u64))
    }

    /// Whether the virtual extent of the section covers `rva`.
    pub fn has_rva(&self, rva: Rva) -> bool {
        let start = self.virtual_address as u64;
        (start..start + self.virtual_size as u64).contains(&(rva.0 as u64))
    }
}

#[repr(C, packed)]
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Default,
)]
pub struct ExportDirectoryTable {
    pub characteristics:          u32,
    pub time_date_stamp:          u32,
    pub version:                  VersionU16,
    pub name:                     u32,
    pub base:                     u32,
    pub number_of_functions:      u32,
    pub number_of_names:          u32,
    pub address_of_functions:     u32,
    pub address_of_names:         u32,
    pub address_of_name_ordinals: u32,
}
