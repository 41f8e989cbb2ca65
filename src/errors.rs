//! Errors specific to accessing memory views, translating addresses or reading a PE image.

use core::str::Utf8Error;
use std::{io::Error as IOError, path::PathBuf};

use crate::address::{Offset, Rva, Va};

/// Errors that can occur when accessing or modifying a memory view.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("offset out of bounds: got offset {offset}, but size is {size}")]
    OutOfBounds { offset: usize, size: usize },
    #[error("types {left} (size {left_size}) and {right} (size {right_size}) do not align")]
    Alignment {
        left:       &'static str,
        left_size:  usize,
        right:      &'static str,
        right_size: usize,
    },
    #[error("byte offset {offset} does not align with {ty} (size {size})")]
    UnalignedOffset {
        offset: usize,
        ty:     &'static str,
        size:   usize,
    },
    #[error("insufficient data: got {got} units of {unit}, but needed a multiple of {needed}")]
    InsufficientData {
        got:    usize,
        needed: usize,
        unit:   &'static str,
        data:   Vec<u8>,
    },
    #[error("unexpected null pointer")]
    NullPointer,
    #[error("memory is not allocated")]
    NotAllocated,
    #[error("allocation failed")]
    BadAllocation,
    #[error("memory is borrowed read-only")]
    ReadOnly,
    #[error("memory is already borrowed by another view of the region {address:#x}")]
    AlreadyBorrowed { address: usize },
    #[error("invalid pointer: region {address:#x} with size {size} is no longer valid")]
    InvalidPointer { address: usize, size: usize },
    #[error("search term too broad: search terms cannot be all wildcards")]
    SearchTooBroad,
    #[error("insufficient allocation: attempted {attempted} bytes, but needed at least {needed}")]
    InsufficientAllocation { attempted: usize, needed: usize },
    #[error("failed to open file {}: {source}", path.display())]
    OpenFileFailure { path: PathBuf, source: IOError },
}

/// Errors that can occur when translating between address spaces of a PE image.
#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum AddressError {
    #[error("invalid offset: {0}")]
    InvalidOffset(Offset),
    #[error("invalid rva: {0}")]
    InvalidRva(Rva),
    #[error("invalid va: {0}")]
    InvalidVa(Va),
    #[error("unsupported architecture: {0:#x}")]
    UnsupportedArchitecture(u16),
    #[error("section not found")]
    SectionNotFound,
}

/// Errors that can occur when reading a PE image.
#[derive(Debug, thiserror::Error)]
pub enum ImageReadError {
    #[error("invalid utf8: {0}")]
    Utf8Error(Utf8Error),
    #[error("invalid memory access: {0}")]
    Memory(MemoryError),
    #[error("invalid address: {0}")]
    Address(AddressError),
    #[error("invalid dos signature: {0:#x}")]
    InvalidDosSignature(u16),
    #[error("invalid nt signature: {0:#x}")]
    InvalidNtSignature(u32),
    #[error("unexpected optional header magic: {0:#x}")]
    UnexpectedOptionalMagic(u16),
    #[error("invalid header: {0}")]
    InvalidHeader(String),
    #[error("data directory {0} unavailable")]
    DirectoryUnavailable(usize),
}
impl From<Utf8Error> for ImageReadError {
    fn from(error: Utf8Error) -> Self { ImageReadError::Utf8Error(error) }
}
impl From<MemoryError> for ImageReadError {
    fn from(error: MemoryError) -> Self { ImageReadError::Memory(error) }
}
impl From<AddressError> for ImageReadError {
    fn from(error: AddressError) -> Self { ImageReadError::Address(error) }
}

/// Errors that can occur when writing a PE image.
#[derive(Debug, thiserror::Error)]
pub enum ImageWriteError {
    #[error("invalid memory access: {0}")]
    Memory(MemoryError),
    #[error("io error: {0}")]
    IOError(IOError),
}
impl From<MemoryError> for ImageWriteError {
    fn from(error: MemoryError) -> Self { ImageWriteError::Memory(error) }
}
impl From<IOError> for ImageWriteError {
    fn from(error: IOError) -> Self { ImageWriteError::IOError(error) }
}
