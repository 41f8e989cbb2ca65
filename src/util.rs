use core::{
    any::type_name,
    ops::{Add, Rem, Sub},
};

use crate::MemoryError;

/// Round `value` up to the next multiple of `alignment`.
pub fn align<T: Add<Output = T> + Sub<Output = T> + Rem<Output = T> + Eq + Copy + Default>(
    value: T, alignment: T,
) -> T {
    if alignment == T::default() || value % alignment == T::default() {
        return value;
    }
    value + alignment - (value % alignment)
}

/// Whether two element sizes can be reinterpreted into one another.
pub(crate) const fn sizes_align(a: usize, b: usize) -> bool {
    let (smaller, bigger) = if a < b { (a, b) } else { (b, a) };
    smaller != 0 && bigger % smaller == 0
}

pub(crate) fn alignment_error<T, U>(left_size: usize) -> MemoryError {
    MemoryError::Alignment {
        left: type_name::<T>(),
        left_size,
        right: type_name::<U>(),
        right_size: core::mem::size_of::<U>(),
    }
}

/// Decode a byte slice into a sequence of `U`, ignoring a trailing partial element.
pub(crate) fn decode<U: zerocopy::FromBytes>(bytes: &[u8]) -> Vec<U> {
    let size = core::mem::size_of::<U>();
    if size == 0 {
        return Vec::new();
    }
    bytes
        .chunks_exact(size)
        .filter_map(|chunk| U::read_from_bytes(chunk).ok())
        .collect()
}
