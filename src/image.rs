//! Portable executable image representation.
//!
//! See <https://learn.microsoft.com/en-us/windows/win32/debug/pe-format> for more information.

use std::path::Path;

use ahash::RandomState;
use debug_ignore::DebugIgnore;
use indexmap::IndexMap;
use log::{debug, warn};

use crate::{address::*, constants::*, errors::*, exports::*, memory::*, registry::*, types::*};

/// Image data directory type enumeration.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum DataDirectoryType {
    ExportTable,
    ImportTable,
    ResourceTable,
    ExceptionTable,
    CertificateTable,
    BaseRelocationTable,
    Debug,
    Architecture,
    GlobalPtr,
    TLSTable,
    LoadConfigTable,
    BoundImport,
    IAT,
    DelayImportDescriptor,
    CLRRuntimeHeader,
    Reserved,
}
impl DataDirectoryType {
    /// All directory types in the order they appear in the optional header.
    pub const ALL: [DataDirectoryType; IMAGE_NUMBEROF_DIRECTORY_ENTRIES] = {
        use DataDirectoryType::*;
        [
            ExportTable,
            ImportTable,
            ResourceTable,
            ExceptionTable,
            CertificateTable,
            BaseRelocationTable,
            Debug,
            Architecture,
            GlobalPtr,
            TLSTable,
            LoadConfigTable,
            BoundImport,
            IAT,
            DelayImportDescriptor,
            CLRRuntimeHeader,
            Reserved,
        ]
    };

    /// Returns the position of the directory in the optional header.
    pub const fn index(&self) -> usize { *self as usize }
}

/// Portable executable image representation.
///
/// This struct is the main entry point for parsing and querying a portable executable image.
/// Headers are validated and cached when parsing; everything else is read through the
/// underlying [`TypedView`] on demand.
#[derive(Debug)]
pub struct Image<'a> {
    view:       DebugIgnore<TypedView<'a, u8>>,
    image_type: ImageType,

    dos_header:            DosHeader,
    pe_signature:          u32,
    coff_header:           CoffHeader,
    standard_header:       StandardHeader,
    windows_header:        GenericWindowsHeader,
    header_data_directory: IndexMap<DataDirectoryType, ImageDataDirectory, RandomState>,
    section_table:         Vec<SectionHeader>,

    coff_header_offset:     usize,
    optional_header_offset: usize,
    section_table_offset:   usize,
}

impl<'a> Image<'a> {
    /// Parse a portable executable image from a view of its bytes.
    ///
    /// # Returns
    /// Returns the `Image`, or an error if the view is not a valid portable executable image or is missing required headers.
    pub fn parse(view: TypedView<'a, u8>, image_type: ImageType) -> Result<Self, ImageReadError> {
        let dos_header = view.cast_bytes::<DosHeader>(0)?;
        debug!("{:#x?}", dos_header);
        if dos_header.e_magic != PE_DOS_MAGIC {
            return Err(ImageReadError::InvalidDosSignature(dos_header.e_magic));
        }

        let pe_signature_offset = dos_header.e_lfanew as usize;
        let pe_signature = view.cast_bytes::<u32>(pe_signature_offset)?;
        debug!("{:#x?}: pe_signature: {:#x?}", pe_signature_offset, pe_signature);
        if pe_signature != PE_NT_SIGNATURE {
            return Err(ImageReadError::InvalidNtSignature(pe_signature));
        }

        let coff_header_offset = pe_signature_offset + 4;
        let coff_header = view.cast_bytes::<CoffHeader>(coff_header_offset)?;
        debug!("{:#x?}: {:#x?}", coff_header_offset, coff_header);
        if coff_header.size_of_optional_header < 24 {
            return Err(ImageReadError::InvalidHeader("optional header too small".into()));
        }

        let optional_header_offset = coff_header_offset + 20;
        let standard_header = view.cast_bytes::<StandardHeader>(optional_header_offset)?;
        debug!("{:#x?}: {:#x?}", optional_header_offset, standard_header);

        let size_of_optional_header = coff_header.size_of_optional_header as usize;
        let magic = standard_header.magic;
        let (windows_header, data_directory_offset) = match magic {
            PE_32_MAGIC if size_of_optional_header >= 96 => (
                GenericWindowsHeader::WindowsHeader32(
                    view.cast_bytes::<WindowsHeader<u32>>(optional_header_offset + 28)?,
                ),
                optional_header_offset + 96,
            ),
            PE_64_MAGIC if size_of_optional_header >= 112 => (
                GenericWindowsHeader::WindowsHeader64(
                    view.cast_bytes::<WindowsHeader<u64>>(optional_header_offset + 24)?,
                ),
                optional_header_offset + 112,
            ),
            PE_32_MAGIC | PE_64_MAGIC => {
                return Err(ImageReadError::InvalidHeader("optional header truncated".into()));
            }
            _ => return Err(ImageReadError::UnexpectedOptionalMagic(magic)),
        };
        debug!("{:#x?}", windows_header);

        let section_table_offset = optional_header_offset + size_of_optional_header;
        let available = (section_table_offset - data_directory_offset) / 8;
        let mut number_of_rva_and_sizes = windows_header.number_of_rva_and_sizes() as usize;
        if number_of_rva_and_sizes > available.min(IMAGE_NUMBEROF_DIRECTORY_ENTRIES) {
            warn!(
                "number of data directories {} exceeds optional header, reading {}",
                number_of_rva_and_sizes,
                available.min(IMAGE_NUMBEROF_DIRECTORY_ENTRIES)
            );
            number_of_rva_and_sizes = available.min(IMAGE_NUMBEROF_DIRECTORY_ENTRIES);
        }

        let mut header_data_directory =
            IndexMap::<DataDirectoryType, ImageDataDirectory, _>::with_hasher(RandomState::new());
        let directories = view.read::<ImageDataDirectory>(data_directory_offset, number_of_rva_and_sizes)?;
        for (&header, data) in DataDirectoryType::ALL.iter().zip(directories) {
            debug!("{:?}: {:#x?}", header, data);
            header_data_directory.insert(header, data);
        }

        let section_table = view.read::<SectionHeader>(section_table_offset, coff_header.number_of_sections as usize)?;
        for section_header in section_table.iter() {
            debug!("{}: {:#x?}", section_header.name().unwrap_or("?".to_string()), section_header);
        }

        Ok(Self {
            view: DebugIgnore(view),
            image_type,
            dos_header,
            pe_signature,
            coff_header,
            standard_header,
            windows_header,
            header_data_directory,
            section_table,
            coff_header_offset,
            optional_header_offset,
            section_table_offset,
        })
    }

    /// Parse a portable executable image from a byte slice laid out as on disk.
    pub fn from_bytes(registry: &Registry, data: &'a [u8]) -> Result<Self, ImageReadError> {
        Self::parse(TypedView::borrowed(registry, data), ImageType::Disk)
    }

    /// Returns the `Image` with all data copied into owned memory.
    pub fn cloned(&self) -> Result<Image<'static>, ImageReadError> {
        let view = TypedView::from_slice(self.view.registry(), &self.view.as_bytes()?[..]);
        Image::parse(view, self.image_type)
    }

    /// Write the image data to a file.
    ///
    /// # Returns
    /// Returns an error if the data is no longer valid or the file could not be written.
    pub fn write_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ImageWriteError> {
        std::fs::write(path, &*self.view.as_bytes()?).map_err(|e| e.into())
    }

    /// Returns the raw image data.
    pub fn data(&self) -> Result<ViewRef<'_, [u8]>, MemoryError> { self.view.as_bytes() }

    /// Returns the view over the image data.
    pub fn view(&self) -> &TypedView<'a, u8> { &self.view }

    /// Returns the parsed dos header.
    pub fn dos_header(&self) -> &DosHeader { &self.dos_header }

    /// Returns the offset of the pe signature.
    pub fn e_lfanew(&self) -> u32 { self.dos_header.e_lfanew }

    /// Returns a view over the data between the dos header and the pe signature.
    pub fn dos_stub(&self) -> Result<TypedView<'a, u8>, MemoryError> {
        let start = core::mem::size_of::<DosHeader>();
        let end = (self.e_lfanew() as usize).max(start);
        self.view.subsection(start, end - start)
    }

    /// Returns the pe signature.
    pub fn pe_signature(&self) -> u32 { self.pe_signature }

    /// Returns the parsed coff header.
    pub fn coff_header(&self) -> &CoffHeader { &self.coff_header }

    /// Returns the parsed standard header.
    pub fn standard_header(&self) -> &StandardHeader { &self.standard_header }

    /// Returns the parsed windows header.
    pub fn windows_header(&self) -> &GenericWindowsHeader { &self.windows_header }

    /// Returns the machine type of the coff header.
    pub fn machine(&self) -> u16 { self.coff_header.machine }

    /// Returns the address of the entrypoint.
    pub fn entrypoint(&self) -> Rva { Rva(self.standard_header.address_of_entry_point) }

    /// Returns the subsystem running the image.
    pub fn subsystem(&self) -> WORD { self.windows_header.subsystem() }

    /// Returns the data directory for the requested header.
    pub fn data_directory(&self, directory: DataDirectoryType) -> Option<&ImageDataDirectory> {
        self.header_data_directory.get(&directory)
    }

    /// Returns all data directories existing in the image.
    pub fn data_directories(&self) -> Vec<DataDirectoryType> {
        self.header_data_directory.keys().copied().collect::<Vec<_>>()
    }

    /// Whether the data directory exists and points to data.
    pub fn has_directory(&self, directory: DataDirectoryType) -> bool {
        self.data_directory(directory).is_some_and(ImageDataDirectory::is_present)
    }

    /// Returns the section header for the section at the index.
    pub fn section_header<Index: Into<usize>>(&self, index: Index) -> Option<&SectionHeader> {
        self.section_table.get(index.into())
    }

    /// Returns a view over the section table in the image data.
    pub fn section_table_view(&self) -> Result<TypedView<'a, SectionHeader>, MemoryError> {
        self.view.subsection::<SectionHeader>(self.section_table_offset, self.section_table.len())
    }

    /// Returns the section header containing the data directory.
    pub fn section_header_for_data_directory(&self, directory: DataDirectoryType) -> Option<&SectionHeader> {
        let data_directory = self.data_directory(directory)?;
        self.section_by_rva(Rva(data_directory.virtual_address)).ok()
    }

    /// Returns a view over the data of the section.
    ///
    /// Disk images cover the raw data of the section, memory images its virtual extent.
    pub fn section_data(&self, section: &SectionHeader) -> Result<TypedView<'a, u8>, ImageReadError> {
        let (address, size) = match self.image_type {
            ImageType::Disk => (Address::Offset(Offset(section.pointer_to_raw_data)), section.size_of_raw_data),
            ImageType::Memory | ImageType::Virtual => {
                (Address::Rva(Rva(section.virtual_address)), section.virtual_size)
            }
        };
        let start = self.memory_address(address)?;
        Ok(self.view.subsection(start, size as usize)?)
    }

    /// Returns a view over the NUL-terminated string at `memory_offset`, including the terminator.
    pub fn cstring_at(&self, memory_offset: usize) -> Result<TypedView<'a, u8>, ImageReadError> {
        let data = self.view.as_bytes()?;
        let tail = data.get(memory_offset..).ok_or(MemoryError::OutOfBounds {
            offset: memory_offset,
            size:   data.len(),
        })?;
        let length = tail.iter().position(|&c| c == 0).ok_or(MemoryError::OutOfBounds {
            offset: data.len(),
            size:   data.len(),
        })?;
        Ok(self.view.subsection(memory_offset, length + 1)?)
    }

    /// Read the NUL-terminated string at `address`.
    pub fn cstring<A: Into<Address>>(&self, address: A) -> Result<String, ImageReadError> {
        let view = self.cstring_at(self.memory_address(address.into())?)?;
        let bytes = view.as_bytes()?;
        Ok(core::str::from_utf8(&bytes[..bytes.len() - 1])?.to_string())
    }

    /// Returns a view over the NUL-terminated UTF-16 string at `memory_offset`, including the terminator.
    pub fn wstring_at(&self, memory_offset: usize) -> Result<TypedView<'a, u16>, ImageReadError> {
        let data = self.view.as_bytes()?;
        let tail = data.get(memory_offset..).ok_or(MemoryError::OutOfBounds {
            offset: memory_offset,
            size:   data.len(),
        })?;
        let length = tail
            .chunks_exact(2)
            .position(|c| c == [0, 0])
            .ok_or(MemoryError::OutOfBounds {
                offset: data.len(),
                size:   data.len(),
            })?;
        Ok(self.view.subsection::<u16>(memory_offset, length + 1)?)
    }

    /// Read the NUL-terminated UTF-16 string at `address`.
    /// Invalid code units are replaced.
    pub fn wstring<A: Into<Address>>(&self, address: A) -> Result<String, ImageReadError> {
        let view = self.wstring_at(self.memory_address(address.into())?)?;
        let units = view.to_vec()?;
        Ok(String::from_utf16_lossy(&units[..units.len() - 1]))
    }

    /// Offset of the checksum field in the image data.
    fn checksum_offset(&self) -> usize { self.optional_header_offset + PE_CHECKSUM_OFFSET }

    /// Calculate the checksum of the image data, skipping the stored checksum.
    pub fn calculate_checksum(&self) -> Result<u32, MemoryError> {
        let data = self.view.as_bytes()?;
        let checksum_offset = self.checksum_offset();
        let mut checksum: u64 = 0;
        for (index, chunk) in data.chunks(4).enumerate() {
            if index * 4 == checksum_offset {
                continue;
            }
            let mut value = [0u8; 4];
            value[..chunk.len()].copy_from_slice(chunk);
            checksum = (checksum & 0xffffffff) + u32::from_le_bytes(value) as u64 + (checksum >> 32);
            if checksum > 0xffffffff {
                checksum = (checksum & 0xffffffff) + (checksum >> 32);
            }
        }
        checksum = (checksum & 0xffff) + (checksum >> 16);
        checksum += checksum >> 16;
        checksum &= 0xffff;
        checksum += data.len() as u64;
        Ok(checksum as u32)
    }

    /// Whether the stored checksum matches the calculated one.
    pub fn validate_checksum(&self) -> Result<bool, MemoryError> {
        let calculated = self.calculate_checksum()?;
        let stored = self.windows_header.check_sum();
        if calculated != stored {
            warn!("checksum mismatch: stored {:#x?}, calculated {:#x?}", stored, calculated);
        }
        Ok(calculated == stored)
    }

    /// Calculate the checksum and store it in the windows header.
    ///
    /// # Returns
    /// Returns the previous checksum, or an error if the image data is read-only.
    pub fn update_checksum(&mut self) -> Result<u32, MemoryError> {
        let checksum = self.calculate_checksum()?;
        let offset = self.checksum_offset();
        self.view.write::<u32>(offset, &[checksum])?;
        let previous = self.windows_header.check_sum();
        match self.windows_header {
            GenericWindowsHeader::WindowsHeader32(ref mut header) => header.check_sum = checksum,
            GenericWindowsHeader::WindowsHeader64(ref mut header) => header.check_sum = checksum,
        }
        debug!("updated checksum at {:#x?}: {:#x?}", offset, checksum);
        Ok(previous)
    }

    /// Returns the export directory of the image.
    ///
    /// # Returns
    /// Returns an error if the image has no export directory or it points outside of the image.
    pub fn export_directory(&self) -> Result<ExportDirectory<'a>, ImageReadError> { ExportDirectory::parse(self) }

    /// Returns the offset of the coff header in the image data.
    pub fn coff_header_offset(&self) -> usize { self.coff_header_offset }

    /// Returns the offset of the optional header in the image data.
    pub fn optional_header_offset(&self) -> usize { self.optional_header_offset }
}

impl Image<'static> {
    /// Parse a portable executable image from a file laid out as on disk.
    ///
    /// # Returns
    /// Returns the `Image`, or an error if the file could not be read, is not a valid portable executable image or is missing required headers.
    pub fn parse_file<P: AsRef<Path>>(registry: &Registry, path: P) -> Result<Self, ImageReadError> {
        let view = TypedView::load_file(registry, path)?;
        Self::parse(view, ImageType::Disk)
    }
}

impl AddressSpace for Image<'_> {
    fn section_table(&self) -> &[SectionHeader] { &self.section_table }

    fn image_base(&self) -> u64 {
        match self.image_type {
            ImageType::Virtual => self.view.as_ptr() as u64,
            ImageType::Disk | ImageType::Memory => self.windows_header.image_base(),
        }
    }

    fn file_alignment(&self) -> u32 { self.windows_header.file_alignment() }

    fn section_alignment(&self) -> u32 { self.windows_header.section_alignment() }

    fn arch(&self) -> Arch { Arch::from_machine(self.coff_header.machine) }

    fn image_type(&self) -> ImageType { self.image_type }

    fn size(&self) -> usize { self.view.byte_len() }

    fn image_size(&self) -> u32 { self.windows_header.size_of_image() }
}
