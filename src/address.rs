//! Address value types and translation between file offsets, RVAs and VAs.

use core::{
    fmt,
    ops::{Add, AddAssign, BitXor, BitXorAssign, Div, DivAssign, Mul, MulAssign, Rem, RemAssign, Sub, SubAssign},
};

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{constants::*, errors::AddressError, types::SectionHeader, util::align};

macro_rules! wrapping_op {
    ($name:ident, $base:ty, $op:ident, $method:ident, $assign:ident, $assign_method:ident, $wrapping:ident) => {
        impl $op<$base> for $name {
            type Output = $name;
            fn $method(self, rhs: $base) -> $name { $name(self.0.$wrapping(rhs)) }
        }
        impl $op for $name {
            type Output = $name;
            fn $method(self, rhs: $name) -> $name { $name(self.0.$wrapping(rhs.0)) }
        }
        impl $assign<$base> for $name {
            fn $assign_method(&mut self, rhs: $base) { self.0 = self.0.$wrapping(rhs); }
        }
        impl $assign for $name {
            fn $assign_method(&mut self, rhs: $name) { self.0 = self.0.$wrapping(rhs.0); }
        }
    };
}

macro_rules! address_type {
    ($(#[$meta:meta])* $name:ident($base:ty)) => {
        $(#[$meta])*
        #[repr(transparent)]
        #[derive(
            Debug, Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash, FromBytes, IntoBytes, Immutable, KnownLayout,
        )]
        pub struct $name(pub $base);

        impl $name {
            pub const fn new(value: $base) -> Self { Self(value) }

            pub const fn value(&self) -> $base { self.0 }
        }

        wrapping_op!($name, $base, Add, add, AddAssign, add_assign, wrapping_add);
        wrapping_op!($name, $base, Sub, sub, SubAssign, sub_assign, wrapping_sub);
        wrapping_op!($name, $base, Mul, mul, MulAssign, mul_assign, wrapping_mul);
        wrapping_op!($name, $base, Div, div, DivAssign, div_assign, wrapping_div);
        wrapping_op!($name, $base, Rem, rem, RemAssign, rem_assign, wrapping_rem);

        impl BitXor<$base> for $name {
            type Output = $name;
            fn bitxor(self, rhs: $base) -> $name { $name(self.0 ^ rhs) }
        }
        impl BitXorAssign<$base> for $name {
            fn bitxor_assign(&mut self, rhs: $base) { self.0 ^= rhs; }
        }

        impl From<$base> for $name {
            fn from(value: $base) -> Self { Self(value) }
        }
        impl From<$name> for $base {
            fn from(value: $name) -> Self { value.0 }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{:#x}", self.0) }
        }
        impl fmt::LowerHex for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { fmt::LowerHex::fmt(&self.0, f) }
        }
    };
}

address_type!(
    /// Position relative to the start of the image as it is stored on disk.
    Offset(u32)
);
address_type!(
    /// Relative virtual address: position relative to the image base once the image is loaded.
    Rva(u32)
);
address_type!(
    /// Absolute virtual address of a 32-bit image.
    Va32(u32)
);
address_type!(
    /// Absolute virtual address of a 64-bit image.
    Va64(u64)
);

/// Absolute virtual address of either width.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Va {
    Va32(Va32),
    Va64(Va64),
}
impl Va {
    /// Returns the address widened to 64 bits.
    pub const fn value(&self) -> u64 {
        match self {
            Va::Va32(va) => va.0 as u64,
            Va::Va64(va) => va.0,
        }
    }

    pub const fn is_32(&self) -> bool { matches!(self, Va::Va32(_)) }

    pub const fn is_64(&self) -> bool { matches!(self, Va::Va64(_)) }
}
impl From<Va32> for Va {
    fn from(va: Va32) -> Self { Va::Va32(va) }
}
impl From<Va64> for Va {
    fn from(va: Va64) -> Self { Va::Va64(va) }
}
impl fmt::Display for Va {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Va::Va32(va) => fmt::Display::fmt(va, f),
            Va::Va64(va) => fmt::Display::fmt(va, f),
        }
    }
}

/// Any address that can be resolved to a position in the image data.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Address {
    Offset(Offset),
    Rva(Rva),
    Va(Va),
}
impl From<Offset> for Address {
    fn from(offset: Offset) -> Self { Address::Offset(offset) }
}
impl From<Rva> for Address {
    fn from(rva: Rva) -> Self { Address::Rva(rva) }
}
impl From<Va> for Address {
    fn from(va: Va) -> Self { Address::Va(va) }
}
impl From<Va32> for Address {
    fn from(va: Va32) -> Self { Address::Va(va.into()) }
}
impl From<Va64> for Address {
    fn from(va: Va64) -> Self { Address::Va(va.into()) }
}

/// Machine architecture of an image.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Arch {
    I386,
    Amd64,
    Arm,
    Arm64,
    Unsupported(u16),
}
impl Arch {
    pub const fn from_machine(machine: u16) -> Self {
        match machine {
            IMAGE_FILE_MACHINE_I386 => Arch::I386,
            IMAGE_FILE_MACHINE_AMD64 => Arch::Amd64,
            IMAGE_FILE_MACHINE_ARM => Arch::Arm,
            IMAGE_FILE_MACHINE_ARM64 => Arch::Arm64,
            other => Arch::Unsupported(other),
        }
    }

    pub const fn machine(&self) -> u16 {
        match self {
            Arch::I386 => IMAGE_FILE_MACHINE_I386,
            Arch::Amd64 => IMAGE_FILE_MACHINE_AMD64,
            Arch::Arm => IMAGE_FILE_MACHINE_ARM,
            Arch::Arm64 => IMAGE_FILE_MACHINE_ARM64,
            Arch::Unsupported(machine) => *machine,
        }
    }

    /// Whether virtual addresses of this architecture are 32 bits wide.
    pub const fn is_32(&self) -> bool { matches!(self, Arch::I386 | Arch::Arm) }
}

/// Layout of the image data backing an [`AddressSpace`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Default)]
pub enum ImageType {
    /// Sections are at their file offsets.
    #[default]
    Disk,
    /// Sections are mapped at their RVAs.
    Memory,
    /// Sections are mapped at their RVAs and the data lives at its actual load address.
    Virtual,
}

/// Context required to translate addresses of a portable executable image.
pub trait AddressSpace {
    fn section_table(&self) -> &[SectionHeader];
    fn image_base(&self) -> u64;
    fn file_alignment(&self) -> u32;
    fn section_alignment(&self) -> u32;
    fn arch(&self) -> Arch;
    fn image_type(&self) -> ImageType;
    /// Number of bytes backing the image.
    fn size(&self) -> usize;
    /// Size of the loaded image as declared by the optional header.
    fn image_size(&self) -> u32;

    fn validate_offset(&self, offset: Offset) -> bool { (offset.0 as usize) < self.size() }

    fn validate_rva(&self, rva: Rva) -> bool { rva.0 < self.image_size() }

    fn validate_va(&self, va: Va) -> bool {
        let (start, value) = match va {
            Va::Va32(va) => (self.image_base() as u32 as u64, va.0 as u64),
            Va::Va64(va) => (self.image_base(), va.0),
        };
        start <= value && value - start < self.image_size() as u64
    }

    fn is_aligned_to_file(&self, value: u32) -> bool { align(value, self.file_alignment()) == value }

    fn is_aligned_to_section(&self, value: u32) -> bool { align(value, self.section_alignment()) == value }

    fn align_to_file(&self, value: u32) -> u32 { align(value, self.file_alignment()) }

    fn align_to_section(&self, value: u32) -> u32 { align(value, self.section_alignment()) }

    fn section_by_offset(&self, offset: Offset) -> Result<&SectionHeader, AddressError> {
        self.section_table()
            .iter()
            .find(|section| section.has_offset(offset))
            .ok_or(AddressError::SectionNotFound)
    }

    fn section_by_rva(&self, rva: Rva) -> Result<&SectionHeader, AddressError> {
        self.section_table()
            .iter()
            .find(|section| section.has_rva(rva))
            .ok_or(AddressError::SectionNotFound)
    }

    fn section_by_name(&self, name: &str) -> Result<&SectionHeader, AddressError> {
        self.section_table()
            .iter()
            .find(|section| &section.name[..section.name_size()] == name.as_bytes())
            .ok_or(AddressError::SectionNotFound)
    }

    /// Translate a file offset to an RVA.
    /// Offsets outside of every section (such as headers) map to the identical RVA.
    fn offset_to_rva(&self, offset: Offset) -> Result<Rva, AddressError> {
        if !self.validate_offset(offset) {
            return Err(AddressError::InvalidOffset(offset));
        }
        let Ok(section) = self.section_by_offset(offset) else {
            let rva = Rva(offset.0);
            return if self.validate_rva(rva) { Ok(rva) } else { Err(AddressError::InvalidRva(rva)) };
        };
        let rva = Rva(offset.0) - section.pointer_to_raw_data + section.virtual_address;
        if !self.validate_rva(rva) || !section.has_rva(rva) {
            return Err(AddressError::InvalidRva(rva));
        }
        Ok(rva)
    }

    /// Translate an RVA to a file offset.
    /// RVAs outside of every section map to the identical offset.
    fn rva_to_offset(&self, rva: Rva) -> Result<Offset, AddressError> {
        if !self.validate_rva(rva) {
            return Err(AddressError::InvalidRva(rva));
        }
        let Ok(section) = self.section_by_rva(rva) else {
            let offset = Offset(rva.0);
            return if self.validate_offset(offset) { Ok(offset) } else { Err(AddressError::InvalidOffset(offset)) };
        };
        let offset = Offset(rva.0) - section.virtual_address + section.pointer_to_raw_data;
        if !self.validate_offset(offset) || !section.has_offset(offset) {
            return Err(AddressError::InvalidOffset(offset));
        }
        Ok(offset)
    }

    /// Translate an RVA to a VA of the width matching the architecture.
    fn rva_to_va(&self, rva: Rva) -> Result<Va, AddressError> {
        if !self.validate_rva(rva) {
            return Err(AddressError::InvalidRva(rva));
        }
        let image_base = self.image_base();
        let va = match self.arch() {
            Arch::Unsupported(machine) => return Err(AddressError::UnsupportedArchitecture(machine)),
            arch if arch.is_32() => Va::Va32(Va32(image_base as u32) + rva.0),
            _ => Va::Va64(Va64(image_base) + rva.0 as u64),
        };
        if !self.validate_va(va) {
            return Err(AddressError::InvalidVa(va));
        }
        Ok(va)
    }

    fn va_to_rva(&self, va: Va) -> Result<Rva, AddressError> {
        if !self.validate_va(va) {
            return Err(AddressError::InvalidVa(va));
        }
        let rva = match va {
            Va::Va32(va) => Rva((va - self.image_base() as u32).0),
            Va::Va64(va) => Rva((va - self.image_base()).0 as u32),
        };
        if !self.validate_rva(rva) {
            return Err(AddressError::InvalidRva(rva));
        }
        Ok(rva)
    }

    fn offset_to_va(&self, offset: Offset) -> Result<Va, AddressError> {
        self.rva_to_va(self.offset_to_rva(offset)?)
    }

    fn va_to_offset(&self, va: Va) -> Result<Offset, AddressError> {
        self.rva_to_offset(self.va_to_rva(va)?)
    }

    /// Resolve an address to a position in the image data.
    ///
    /// Disk images are indexed by file offsets, memory and virtual images by RVAs.
    fn memory_address(&self, address: Address) -> Result<usize, AddressError> {
        let disk = self.image_type() == ImageType::Disk;
        match address {
            Address::Offset(offset) if disk => {
                if !self.validate_offset(offset) {
                    return Err(AddressError::InvalidOffset(offset));
                }
                Ok(offset.0 as usize)
            }
            Address::Offset(offset) => Ok(self.offset_to_rva(offset)?.0 as usize),
            Address::Rva(rva) if disk => Ok(self.rva_to_offset(rva)?.0 as usize),
            Address::Rva(rva) => {
                if !self.validate_rva(rva) {
                    return Err(AddressError::InvalidRva(rva));
                }
                Ok(rva.0 as usize)
            }
            Address::Va(va) => self.memory_address(Address::Rva(self.va_to_rva(va)?)),
        }
    }
}

impl Offset {
    pub fn as_rva<S: AddressSpace + ?Sized>(self, space: &S) -> Result<Rva, AddressError> { space.offset_to_rva(self) }

    pub fn as_va<S: AddressSpace + ?Sized>(self, space: &S) -> Result<Va, AddressError> { space.offset_to_va(self) }

    pub fn as_memory<S: AddressSpace + ?Sized>(self, space: &S) -> Result<usize, AddressError> {
        space.memory_address(self.into())
    }
}

impl Rva {
    pub fn as_offset<S: AddressSpace + ?Sized>(self, space: &S) -> Result<Offset, AddressError> {
        space.rva_to_offset(self)
    }

    pub fn as_va<S: AddressSpace + ?Sized>(self, space: &S) -> Result<Va, AddressError> { space.rva_to_va(self) }

    pub fn as_memory<S: AddressSpace + ?Sized>(self, space: &S) -> Result<usize, AddressError> {
        space.memory_address(self.into())
    }
}

macro_rules! va_conversions {
    ($($name:ty),*) => {
        $(
            impl $name {
                pub fn as_offset<S: AddressSpace + ?Sized>(self, space: &S) -> Result<Offset, AddressError> {
                    space.va_to_offset(self.into())
                }

                pub fn as_rva<S: AddressSpace + ?Sized>(self, space: &S) -> Result<Rva, AddressError> {
                    space.va_to_rva(self.into())
                }

                pub fn as_memory<S: AddressSpace + ?Sized>(self, space: &S) -> Result<usize, AddressError> {
                    space.memory_address(Address::Va(self.into()))
                }
            }
        )*
    };
}

va_conversions!(Va32, Va64);

impl Va {
    pub fn as_offset<S: AddressSpace + ?Sized>(self, space: &S) -> Result<Offset, AddressError> {
        space.va_to_offset(self)
    }

    pub fn as_rva<S: AddressSpace + ?Sized>(self, space: &S) -> Result<Rva, AddressError> { space.va_to_rva(self) }

    pub fn as_memory<S: AddressSpace + ?Sized>(self, space: &S) -> Result<usize, AddressError> {
        space.memory_address(self.into())
    }
}
