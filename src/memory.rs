//! Bounds-checked typed views over borrowed or owned memory.
//!
//! A [`TypedView`] is a pointer/length pair interpreted as a sequence of elements of type `T`.
//! Views either borrow external memory or own a heap buffer. Every access validates the view
//! against its [`Registry`], so a view derived from a buffer that has since been freed or
//! reallocated reports [`MemoryError::InvalidPointer`] instead of reading stale memory.
//!
//! References into a view are handed out as [`ViewRef`] and [`ViewMut`] guards. All views of
//! the same region share one borrow flag, so a guard from one view excludes writers through
//! any other, and an owned buffer stays allocated until the last view into it is dropped.

use core::{
    any::type_name,
    cell::{Ref, RefCell, RefMut},
    fmt,
    marker::PhantomData,
    mem::size_of,
    ops::{Deref, DerefMut, Range},
    ptr::{self, NonNull},
    slice,
};
use std::{path::Path, rc::Rc};

use log::{debug, trace};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{errors::*, registry::*, util::*};

/// Element types that can be viewed through a [`TypedView`].
///
/// Any plain-old-data type qualifies. Equality is used for searching, so types with custom
/// [`PartialEq`] implementations are compared by value rather than by their raw bytes.
pub trait Element: FromBytes + IntoBytes + Immutable + Copy + PartialEq {}
impl<T: FromBytes + IntoBytes + Immutable + Copy + PartialEq> Element for T {}

/// How the bytes of a view map to elements.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ElementMode {
    /// Array semantics with elements of the given size in bytes.
    FixedSize(usize),
    /// A header type followed by a variable-length tail.
    /// The view holds a single element spanning all of its bytes, or none if it is empty.
    FlexibleTail,
}

/// Memory shared by a root view and every view derived from it.
struct Backing {
    /// Heap buffer allocated as a boxed slice, freed with the last view into it.
    buffer: Option<(NonNull<u8>, usize)>,
    borrow: RefCell<()>,
}

impl Backing {
    fn external() -> Rc<Self> {
        Rc::new(Self {
            buffer: None,
            borrow: RefCell::new(()),
        })
    }

    fn heap(pointer: NonNull<u8>, length: usize) -> Rc<Self> {
        Rc::new(Self {
            buffer: Some((pointer, length)),
            borrow: RefCell::new(()),
        })
    }
}

impl Drop for Backing {
    fn drop(&mut self) {
        if let Some((pointer, length)) = self.buffer.take() {
            debug!("freed {} bytes at {:#x?}", length, pointer.as_ptr());
            // SAFETY: the pointer was created from a boxed slice of `length` bytes
            drop(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(pointer.as_ptr(), length)) });
        }
    }
}

enum Storage {
    Null,
    Borrowed {
        pointer:  NonNull<u8>,
        writable: bool,
        backing:  Rc<Backing>,
    },
    Owned {
        pointer: NonNull<u8>,
        backing: Rc<Backing>,
    },
}

/// Shared reference into the memory of a [`TypedView`].
///
/// While it exists, no view of the same region can be borrowed for writing.
pub struct ViewRef<'v, U: ?Sized> {
    value:   &'v U,
    _borrow: Ref<'v, ()>,
}

impl<'v, U: ?Sized> ViewRef<'v, U> {
    fn try_map<V: ?Sized, E>(self, f: impl FnOnce(&'v U) -> Result<&'v V, E>) -> Result<ViewRef<'v, V>, E> {
        Ok(ViewRef {
            value:   f(self.value)?,
            _borrow: self._borrow,
        })
    }
}

impl<U: ?Sized> Deref for ViewRef<'_, U> {
    type Target = U;

    fn deref(&self) -> &U { self.value }
}

impl<U: ?Sized + fmt::Debug> fmt::Debug for ViewRef<'_, U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { fmt::Debug::fmt(self.value, f) }
}

/// Exclusive reference into the memory of a [`TypedView`].
///
/// While it exists, no other view of the same region can be borrowed.
pub struct ViewMut<'v, U: ?Sized> {
    value:   &'v mut U,
    _borrow: RefMut<'v, ()>,
}

impl<'v, U: ?Sized> ViewMut<'v, U> {
    fn try_map<V: ?Sized, E>(
        self, f: impl FnOnce(&'v mut U) -> Result<&'v mut V, E>,
    ) -> Result<ViewMut<'v, V>, E> {
        Ok(ViewMut {
            value:   f(self.value)?,
            _borrow: self._borrow,
        })
    }
}

impl<U: ?Sized> Deref for ViewMut<'_, U> {
    type Target = U;

    fn deref(&self) -> &U { &*self.value }
}

impl<U: ?Sized> DerefMut for ViewMut<'_, U> {
    fn deref_mut(&mut self) -> &mut U { &mut *self.value }
}

impl<U: ?Sized + fmt::Debug> fmt::Debug for ViewMut<'_, U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { fmt::Debug::fmt(&*self.value, f) }
}

/// Typed, bounds-checked view over a region of memory.
///
/// The `'a` lifetime binds views created from Rust slices to their source. Owned views and
/// views derived from them are checked at runtime through the registry instead, and their
/// buffer stays allocated until the last view into it is dropped.
pub struct TypedView<'a, T> {
    registry:   Registry,
    storage:    Storage,
    generation: Generation,
    length:     usize,
    mode:       ElementMode,
    _marker:    PhantomData<(&'a [u8], T)>,
}

impl<'a, T: Element> TypedView<'a, T> {
    fn with_storage(registry: &Registry, storage: Storage, length: usize, mode: ElementMode) -> Self {
        let mut view = Self {
            registry: registry.clone(),
            storage,
            generation: 0,
            length,
            mode,
            _marker: PhantomData,
        };
        if !view.is_null() {
            view.generation = registry.acquire(view.key());
        }
        view
    }

    fn borrowed_storage(pointer: NonNull<u8>, writable: bool) -> Storage {
        Storage::Borrowed {
            pointer,
            writable,
            backing: Backing::external(),
        }
    }

    fn owned_from_bytes(registry: &Registry, bytes: Vec<u8>) -> Self {
        if bytes.is_empty() {
            return Self::null(registry);
        }
        let length = bytes.len();
        let pointer = Box::into_raw(bytes.into_boxed_slice()) as *mut u8;
        // a boxed slice pointer is never null
        let pointer = NonNull::new(pointer).unwrap_or(NonNull::dangling());
        debug!("allocated {} bytes at {:#x?}", length, pointer.as_ptr());
        let storage = Storage::Owned {
            pointer,
            backing: Backing::heap(pointer, length),
        };
        Self::with_storage(registry, storage, length, Self::fixed_mode())
    }

    const fn fixed_mode() -> ElementMode { ElementMode::FixedSize(size_of::<T>()) }

    /// Create an empty view that points nowhere.
    /// A null view can be grown with the owned mutators.
    pub fn null(registry: &Registry) -> Self {
        Self {
            registry:   registry.clone(),
            storage:    Storage::Null,
            generation: 0,
            length:     0,
            mode:       Self::fixed_mode(),
            _marker:    PhantomData,
        }
    }

    /// Create a read-only view over `count` elements at `pointer`.
    ///
    /// # Returns
    /// Returns an error if the pointer is null.
    ///
    /// # Safety
    /// The memory must stay readable for as long as the returned view or any view derived from
    /// it exists.
    pub unsafe fn from_raw_parts(
        registry: &Registry, pointer: *const T, count: usize,
    ) -> Result<Self, MemoryError> {
        let pointer = NonNull::new(pointer as *mut u8).ok_or(MemoryError::NullPointer)?;
        Ok(Self::with_storage(
            registry,
            Self::borrowed_storage(pointer, false),
            count * size_of::<T>(),
            Self::fixed_mode(),
        ))
    }

    /// Create a writable view over `count` elements at `pointer`.
    ///
    /// # Returns
    /// Returns an error if the pointer is null.
    ///
    /// # Safety
    /// The memory must stay readable and writable and must not be accessed other than through
    /// the returned view for as long as it or any view derived from it exists.
    pub unsafe fn from_raw_parts_mut(
        registry: &Registry, pointer: *mut T, count: usize,
    ) -> Result<Self, MemoryError> {
        let pointer = NonNull::new(pointer as *mut u8).ok_or(MemoryError::NullPointer)?;
        Ok(Self::with_storage(
            registry,
            Self::borrowed_storage(pointer, true),
            count * size_of::<T>(),
            Self::fixed_mode(),
        ))
    }

    /// Create a read-only view borrowing `data`.
    pub fn borrowed(registry: &Registry, data: &'a [T]) -> Self {
        let pointer = NonNull::from(data.as_bytes()).cast::<u8>();
        Self::with_storage(
            registry,
            Self::borrowed_storage(pointer, false),
            data.len() * size_of::<T>(),
            Self::fixed_mode(),
        )
    }

    /// Create a writable view borrowing `data`.
    pub fn borrowed_mut(registry: &Registry, data: &'a mut [T]) -> Self {
        let length = data.len() * size_of::<T>();
        let pointer = NonNull::from(data).cast::<u8>();
        Self::with_storage(
            registry,
            Self::borrowed_storage(pointer, true),
            length,
            Self::fixed_mode(),
        )
    }

    /// Create an owned view holding a copy of `data`.
    pub fn from_slice(registry: &Registry, data: &[T]) -> Self {
        Self::owned_from_bytes(registry, data.as_bytes().to_vec())
    }

    /// Create an owned view holding the elements of `data`.
    pub fn from_vec(registry: &Registry, data: Vec<T>) -> Self { Self::from_slice(registry, &data) }

    /// Allocate an owned view of `count` elements, each initialized to `fill` or zeroed.
    ///
    /// # Returns
    /// Returns an error if the allocation would be smaller than a single element.
    pub fn allocate(registry: &Registry, count: usize, fill: Option<T>) -> Result<Self, MemoryError> {
        let attempted = count.checked_mul(size_of::<T>()).ok_or(MemoryError::BadAllocation)?;
        if attempted < size_of::<T>() || attempted == 0 {
            return Err(MemoryError::InsufficientAllocation {
                attempted,
                needed: size_of::<T>(),
            });
        }
        let bytes = match fill {
            Some(value) => value.as_bytes().repeat(count),
            None => vec![0; attempted],
        };
        Ok(Self::owned_from_bytes(registry, bytes))
    }

    /// Read the file at `path` into an owned view.
    ///
    /// # Returns
    /// Returns an error if the file could not be read or does not hold a whole number of elements.
    pub fn load_file<P: AsRef<Path>>(registry: &Registry, path: P) -> Result<Self, MemoryError> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|source| MemoryError::OpenFileFailure {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("loaded {} bytes from {}", data.len(), path.display());
        let size = size_of::<T>();
        if size == 0 || data.len() % size != 0 {
            return Err(MemoryError::InsufficientData {
                got: data.len(),
                needed: size,
                unit: type_name::<u8>(),
                data,
            });
        }
        Ok(Self::owned_from_bytes(registry, data))
    }

    /// Write the bytes of this view to the file at `path`.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), MemoryError> {
        let path = path.as_ref();
        std::fs::write(path, &*self.as_bytes()?).map_err(|source| MemoryError::OpenFileFailure {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Convert this view into a flexible-tail view over the same region.
    pub fn flexible(mut self) -> Self {
        self.mode = ElementMode::FlexibleTail;
        self
    }
}

impl<'a, T> TypedView<'a, T> {
    /// Returns the registry tracking this view.
    pub fn registry(&self) -> &Registry { &self.registry }

    /// Returns the start of the region, or a null pointer for null views.
    pub fn as_ptr(&self) -> *const u8 {
        match self.storage {
            Storage::Null => ptr::null(),
            Storage::Borrowed { pointer, .. } | Storage::Owned { pointer, .. } => pointer.as_ptr(),
        }
    }

    fn backing(&self) -> Option<&Rc<Backing>> {
        match &self.storage {
            Storage::Null => None,
            Storage::Borrowed { backing, .. } | Storage::Owned { backing, .. } => Some(backing),
        }
    }

    /// Returns the registry key of the region.
    pub fn key(&self) -> RegionKey { RegionKey::new(self.as_ptr() as usize, self.length) }

    /// Returns the registry generation the view was registered in, or 0 for null views.
    pub fn generation(&self) -> Generation { self.generation }

    /// Returns the element mode.
    pub fn mode(&self) -> ElementMode { self.mode }

    /// Returns the size of the region in bytes.
    pub fn byte_len(&self) -> usize { self.length }

    /// Returns the size of a single element in bytes.
    /// For flexible-tail views this is the size of the whole region.
    pub fn element_size(&self) -> usize {
        match self.mode {
            ElementMode::FixedSize(size) => size,
            ElementMode::FlexibleTail => self.length,
        }
    }

    /// Returns the number of elements.
    pub fn len(&self) -> usize {
        match self.mode {
            ElementMode::FixedSize(0) => 0,
            ElementMode::FixedSize(size) => self.length / size,
            ElementMode::FlexibleTail => usize::from(self.length > 0),
        }
    }

    pub fn is_empty(&self) -> bool { self.length == 0 }

    pub fn is_null(&self) -> bool { matches!(self.storage, Storage::Null) }

    pub fn is_owned(&self) -> bool { matches!(self.storage, Storage::Owned { .. }) }

    pub fn is_borrowed(&self) -> bool { matches!(self.storage, Storage::Borrowed { .. }) }

    pub fn is_writable(&self) -> bool {
        match self.storage {
            Storage::Null => false,
            Storage::Borrowed { writable, .. } => writable,
            Storage::Owned { .. } => true,
        }
    }

    /// Returns whether the region is still alive according to the registry.
    pub fn is_valid(&self) -> bool { !self.is_null() && self.registry.is_current(self.key(), self.generation) }

    /// Byte granularity of element offsets; flexible-tail views are byte addressed.
    pub(crate) fn unit(&self) -> usize {
        match self.mode {
            ElementMode::FixedSize(size) => size.max(1),
            ElementMode::FlexibleTail => 1,
        }
    }

    /// Number of addressable offsets: elements, or bytes for flexible-tail views.
    fn extent(&self) -> usize { self.length / self.unit() }

    /// Check whether elements of this view can be reinterpreted as elements of `size` bytes.
    pub fn aligns_with(&self, size: usize) -> bool {
        match self.mode {
            ElementMode::FixedSize(element) => sizes_align(element, size),
            ElementMode::FlexibleTail => true,
        }
    }

    /// Check whether elements of this view can be reinterpreted as `U`.
    pub fn aligns_with_type<U>(&self) -> bool { self.aligns_with(size_of::<U>()) }

    fn out_of_bounds(&self, byte_offset: usize) -> MemoryError {
        MemoryError::OutOfBounds {
            offset: byte_offset / self.unit(),
            size:   self.len(),
        }
    }

    fn check_alive(&self) -> Result<(), MemoryError> {
        if self.is_null() {
            return Err(MemoryError::NullPointer);
        }
        if !self.registry.is_current(self.key(), self.generation) {
            return Err(MemoryError::InvalidPointer {
                address: self.as_ptr() as usize,
                size:    self.length,
            });
        }
        Ok(())
    }

    fn already_borrowed(&self) -> MemoryError {
        MemoryError::AlreadyBorrowed {
            address: self.as_ptr() as usize,
        }
    }

    /// Returns the bytes of this view.
    ///
    /// # Returns
    /// Returns an error if the view is null or no longer valid, or if another view of the same
    /// region is borrowed for writing.
    pub fn as_bytes(&self) -> Result<ViewRef<'_, [u8]>, MemoryError> {
        self.check_alive()?;
        let backing = self.backing().ok_or(MemoryError::NullPointer)?;
        let borrow = backing.borrow.try_borrow().map_err(|_| self.already_borrowed())?;
        // SAFETY: the region is live, its memory is kept alive by the backing and the borrow
        // flag excludes writers through every view of the region
        let value = unsafe { slice::from_raw_parts(self.as_ptr(), self.length) };
        Ok(ViewRef { value, _borrow: borrow })
    }

    /// Returns the bytes of this view for writing.
    ///
    /// # Returns
    /// Returns an error if the view is read-only or if any view of the same region is borrowed.
    pub fn as_bytes_mut(&mut self) -> Result<ViewMut<'_, [u8]>, MemoryError> {
        self.check_alive()?;
        if !self.is_writable() {
            return Err(MemoryError::ReadOnly);
        }
        let backing = self.backing().ok_or(MemoryError::NullPointer)?;
        let borrow = backing.borrow.try_borrow_mut().map_err(|_| self.already_borrowed())?;
        // SAFETY: the region is live, writable and kept alive by the backing, and the borrow
        // flag excludes every other reference through views of the region
        let value = unsafe { slice::from_raw_parts_mut(self.as_ptr() as *mut u8, self.length) };
        Ok(ViewMut { value, _borrow: borrow })
    }

    /// Validate an access of `byte_len` bytes as `U` at `byte_offset`.
    pub(crate) fn check_span<U>(
        &self, byte_offset: usize, byte_len: usize, offset_in_bytes: bool,
    ) -> Result<(), MemoryError> {
        self.check_alive()?;
        if byte_offset >= self.length {
            return Err(self.out_of_bounds(byte_offset));
        }
        if !self.aligns_with_type::<U>() {
            return Err(alignment_error::<T, U>(self.element_size()));
        }
        if offset_in_bytes && byte_offset % self.unit() != 0 {
            return Err(MemoryError::UnalignedOffset {
                offset: byte_offset,
                ty:     type_name::<T>(),
                size:   self.element_size(),
            });
        }
        let end = byte_offset.checked_add(byte_len).ok_or(MemoryError::OutOfBounds {
            offset: usize::MAX,
            size:   self.len(),
        })?;
        if end > self.length {
            return Err(self.out_of_bounds(end));
        }
        Ok(())
    }

    /// Drop the registry reference, leaving a null view.
    /// Owned storage invalidates its region; the buffer is freed with the last view into it.
    fn release(&mut self) {
        let key = self.key();
        match core::mem::replace(&mut self.storage, Storage::Null) {
            Storage::Null => {}
            Storage::Borrowed { .. } => {
                self.registry.release(key, self.generation);
            }
            Storage::Owned { .. } => {
                self.registry.invalidate_generation(key, self.generation);
            }
        }
        self.generation = 0;
        self.length = 0;
    }

    /// Create a view of `U` over `byte_len` bytes starting at `byte_offset`, registered as a
    /// child of this view.
    fn derive<U>(
        &self, byte_offset: usize, byte_len: usize, mode: ElementMode,
    ) -> Result<TypedView<'a, U>, MemoryError> {
        let base = NonNull::new(self.as_ptr() as *mut u8).ok_or(MemoryError::NullPointer)?;
        let backing = self.backing().ok_or(MemoryError::NullPointer)?;
        // SAFETY: callers checked that the derived range lies within this region
        let pointer = unsafe { base.add(byte_offset) };
        let mut child = TypedView {
            registry: self.registry.clone(),
            storage: Storage::Borrowed {
                pointer,
                writable: self.is_writable(),
                backing: Rc::clone(backing),
            },
            generation: 0,
            length: byte_len,
            mode,
            _marker: PhantomData,
        };
        self.registry.relationship(self.key(), child.key());
        child.generation = self.registry.acquire(child.key());
        trace!("derived {} from {}", child.key(), self.key());
        Ok(child)
    }
}

impl<'a, T: Element> TypedView<'a, T> {
    /// Returns the element at `index`.
    ///
    /// # Returns
    /// Returns an error if the view is null or no longer valid, or if the index is out of bounds.
    pub fn get(&self, index: usize) -> Result<T, MemoryError> {
        let bytes = self.as_bytes()?;
        if index >= self.len() {
            return Err(MemoryError::OutOfBounds {
                offset: index,
                size:   self.len(),
            });
        }
        let start = index * self.unit();
        T::read_from_prefix(&bytes[start..])
            .map(|(value, _)| value)
            .map_err(|_| self.out_of_bounds(start + size_of::<T>()))
    }

    /// Replace the element at `index`.
    pub fn set(&mut self, index: usize, value: T) -> Result<(), MemoryError> {
        if index >= self.len() {
            return Err(MemoryError::OutOfBounds {
                offset: index,
                size:   self.len(),
            });
        }
        self.write(index, &[value])
    }

    pub fn first(&self) -> Result<T, MemoryError> { self.get(0) }

    pub fn last(&self) -> Result<T, MemoryError> { self.get(self.len().saturating_sub(1)) }

    /// Returns a copy of all elements.
    pub fn to_vec(&self) -> Result<Vec<T>, MemoryError> {
        let bytes = self.as_bytes()?;
        Ok(match self.mode {
            ElementMode::FixedSize(_) => decode(&bytes),
            ElementMode::FlexibleTail => T::read_from_prefix(&bytes).map(|(value, _)| value).into_iter().collect(),
        })
    }

    /// Read a `U` at element `index`.
    ///
    /// # Returns
    /// Returns an error if the types do not align or the value does not fit inside the view.
    pub fn cast<U: FromBytes>(&self, index: usize) -> Result<U, MemoryError> {
        self.cast_bytes(index.saturating_mul(self.unit()))
    }

    /// Read a `U` at `byte_offset`, which has to fall on an element boundary.
    pub fn cast_bytes<U: FromBytes>(&self, byte_offset: usize) -> Result<U, MemoryError> {
        self.check_span::<U>(byte_offset, size_of::<U>(), true)?;
        let bytes = self.as_bytes()?;
        U::read_from_prefix(&bytes[byte_offset..])
            .map(|(value, _)| value)
            .map_err(|_| self.out_of_bounds(byte_offset + size_of::<U>()))
    }

    /// Borrow a `U` at element `index`.
    pub fn cast_ref<U: FromBytes + KnownLayout + Immutable + Unaligned>(
        &self, index: usize,
    ) -> Result<ViewRef<'_, U>, MemoryError> {
        let byte_offset = index.saturating_mul(self.unit());
        self.check_span::<U>(byte_offset, size_of::<U>(), false)?;
        let element_size = self.element_size();
        self.as_bytes()?.try_map(|bytes| {
            U::ref_from_bytes(&bytes[byte_offset..byte_offset + size_of::<U>()])
                .map_err(|_| alignment_error::<T, U>(element_size))
        })
    }

    /// Mutably borrow a `U` at element `index`.
    pub fn cast_mut<U: FromBytes + IntoBytes + KnownLayout + Unaligned>(
        &mut self, index: usize,
    ) -> Result<ViewMut<'_, U>, MemoryError> {
        let byte_offset = index.saturating_mul(self.unit());
        self.check_span::<U>(byte_offset, size_of::<U>(), false)?;
        let element_size = self.element_size();
        self.as_bytes_mut()?.try_map(|bytes| {
            U::mut_from_bytes(&mut bytes[byte_offset..byte_offset + size_of::<U>()])
                .map_err(|_| alignment_error::<T, U>(element_size))
        })
    }

    /// Create a view of `count` elements of `U` starting at element `offset`.
    ///
    /// # Returns
    /// Returns an error if the types do not align or the range does not fit inside the view.
    pub fn subsection<U: Element>(
        &self, offset: usize, count: usize,
    ) -> Result<TypedView<'a, U>, MemoryError> {
        let byte_offset = offset.saturating_mul(self.unit());
        let byte_len = count.saturating_mul(size_of::<U>());
        self.subsection_bytes(byte_offset, byte_len)
    }

    /// Create a view of `U` over `byte_len` bytes starting at `byte_offset`.
    pub fn subsection_bytes<U: Element>(
        &self, byte_offset: usize, byte_len: usize,
    ) -> Result<TypedView<'a, U>, MemoryError> {
        self.check_subsection::<U>(byte_offset, byte_len, true)?;
        if byte_len % size_of::<U>().max(1) != 0 {
            return Err(MemoryError::UnalignedOffset {
                offset: byte_len,
                ty:     type_name::<U>(),
                size:   size_of::<U>(),
            });
        }
        self.derive(byte_offset, byte_len, ElementMode::FixedSize(size_of::<U>()))
    }

    /// Create a flexible-tail view of `U` over `byte_len` bytes starting at `byte_offset`.
    pub fn subsection_flexible<U: Element>(
        &self, byte_offset: usize, byte_len: usize,
    ) -> Result<TypedView<'a, U>, MemoryError> {
        self.check_alive()?;
        let end = byte_offset.checked_add(byte_len).ok_or(self.out_of_bounds(usize::MAX))?;
        if byte_offset > self.length || end > self.length {
            return Err(self.out_of_bounds(end));
        }
        self.derive(byte_offset, byte_len, ElementMode::FlexibleTail)
    }

    /// Like [`TypedView::check_span`], but a zero-length range at the very end is allowed.
    fn check_subsection<U>(
        &self, byte_offset: usize, byte_len: usize, offset_in_bytes: bool,
    ) -> Result<(), MemoryError> {
        if byte_len == 0 && byte_offset == self.length {
            self.check_alive()?;
            if !self.aligns_with_type::<U>() {
                return Err(alignment_error::<T, U>(self.element_size()));
            }
            return Ok(());
        }
        self.check_span::<U>(byte_offset, byte_len, offset_in_bytes)
    }

    fn insufficient_data<U>(&self, got: usize, needed: usize) -> MemoryError {
        MemoryError::InsufficientData {
            got,
            needed,
            unit: type_name::<U>(),
            data: self.as_bytes().map(|bytes| bytes.to_vec()).unwrap_or_default(),
        }
    }

    /// Reinterpret the whole view as elements of `U`.
    ///
    /// # Returns
    /// Returns an error if the types do not align or the view does not hold a whole number of
    /// `U` elements.
    pub fn reinterpret<U: Element>(&self) -> Result<TypedView<'a, U>, MemoryError> {
        if !self.aligns_with_type::<U>() {
            return Err(alignment_error::<T, U>(self.element_size()));
        }
        let unit = self.unit();
        let size = size_of::<U>();
        let got = self.length / unit;
        let needed = (size / unit).max(1);
        if got % needed != 0 || self.length % size != 0 {
            return Err(self.insufficient_data::<T>(got, needed));
        }
        if self.is_empty() {
            self.check_alive()?;
            return self.derive(0, 0, ElementMode::FixedSize(size));
        }
        self.subsection_bytes(0, self.length)
    }

    /// Reinterpret the whole view as a single flexible-tail `U`.
    pub fn reinterpret_flexible<U: Element>(&self) -> Result<TypedView<'a, U>, MemoryError> {
        self.subsection_flexible(0, self.length)
    }

    /// Read `count` elements of `U` starting at element `offset`.
    pub fn read<U: FromBytes>(&self, offset: usize, count: usize) -> Result<Vec<U>, MemoryError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let byte_offset = offset.saturating_mul(self.unit());
        let byte_len = count.saturating_mul(size_of::<U>());
        self.check_span::<U>(byte_offset, byte_len, false)?;
        let bytes = self.as_bytes()?;
        Ok(decode(&bytes[byte_offset..byte_offset + byte_len]))
    }

    /// Copy `data` into the view starting at element `offset`.
    /// Writing never grows the view.
    pub fn write<U: Element>(&mut self, offset: usize, data: &[U]) -> Result<(), MemoryError> {
        if data.is_empty() {
            return Ok(());
        }
        let byte_offset = offset.saturating_mul(self.unit());
        let data = data.as_bytes();
        self.check_span::<U>(byte_offset, data.len(), false)?;
        self.as_bytes_mut()?[byte_offset..byte_offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Copy raw bytes into the view starting at `byte_offset`, which has to fall on an element
    /// boundary.
    pub fn write_bytes(&mut self, byte_offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        if data.is_empty() {
            return Ok(());
        }
        self.check_span::<u8>(byte_offset, data.len(), true)?;
        self.as_bytes_mut()?[byte_offset..byte_offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Split the view into two views at element `midpoint`.
    pub fn split_at(&self, midpoint: usize) -> Result<(TypedView<'a, T>, TypedView<'a, T>), MemoryError> {
        if midpoint > self.extent() {
            return Err(MemoryError::OutOfBounds {
                offset: midpoint,
                size:   self.extent(),
            });
        }
        self.check_alive()?;
        let byte_offset = midpoint * self.unit();
        let left = self.derive(0, byte_offset, self.mode)?;
        let right = self.derive(byte_offset, self.length - byte_offset, self.mode)?;
        Ok((left, right))
    }

    /// Swap the elements at `left` and `right`.
    pub fn swap(&mut self, left: usize, right: usize) -> Result<(), MemoryError> {
        let left_value = self.get(left)?;
        let right_value = self.get(right)?;
        if left == right {
            return Ok(());
        }
        self.write(left, &[right_value])?;
        self.write(right, &[left_value])
    }

    /// Reverse the order of the elements in place.
    pub fn reverse(&mut self) -> Result<(), MemoryError> {
        let count = self.len();
        for index in 0..count / 2 {
            self.swap(index, count - index - 1)?;
        }
        Ok(())
    }

    fn require_allocatable(&self) -> Result<(), MemoryError> {
        match self.storage {
            Storage::Borrowed { .. } => Err(MemoryError::NotAllocated),
            Storage::Null | Storage::Owned { .. } => Ok(()),
        }
    }

    /// Copy the bytes of an owned or null view into a new buffer.
    fn owned_bytes(&self) -> Result<Vec<u8>, MemoryError> {
        self.require_allocatable()?;
        if self.is_null() {
            return Ok(Vec::new());
        }
        Ok(self.as_bytes()?.to_vec())
    }

    /// Replace the owned buffer, invalidating every view derived from the previous one.
    fn replace_owned(&mut self, bytes: Vec<u8>) {
        let previous = self.key();
        self.release();
        let registry = self.registry.clone();
        let mode = self.mode;
        *self = Self::owned_from_bytes(&registry, bytes);
        self.mode = match mode {
            ElementMode::FlexibleTail => ElementMode::FlexibleTail,
            ElementMode::FixedSize(_) => Self::fixed_mode(),
        };
        debug!("reallocated {} as {}", previous, self.key());
    }

    /// Resize an owned view to `count` elements, filling new elements with `fill` or zeroes.
    /// Resizing to zero elements deallocates the view.
    ///
    /// # Returns
    /// Returns an error if the view is borrowed.
    pub fn resize(&mut self, count: usize, fill: Option<T>) -> Result<(), MemoryError> {
        let mut bytes = self.owned_bytes()?;
        let new_length = count.checked_mul(self.unit()).ok_or(MemoryError::BadAllocation)?;
        if new_length == self.length && !self.is_null() {
            return Ok(());
        }
        if new_length < bytes.len() {
            bytes.truncate(new_length);
        } else {
            match fill {
                Some(value) => {
                    let value = value.as_bytes();
                    while bytes.len() < new_length {
                        let take = value.len().min(new_length - bytes.len());
                        bytes.extend_from_slice(&value[..take]);
                    }
                }
                None => bytes.resize(new_length, 0),
            }
        }
        self.replace_owned(bytes);
        Ok(())
    }

    /// Check that `data` covers a whole number of elements of this view.
    fn coerce<'d, U: Element>(&self, data: &'d [U]) -> Result<&'d [u8], MemoryError> {
        if !self.aligns_with_type::<U>() {
            return Err(alignment_error::<T, U>(self.element_size()));
        }
        let bytes = data.as_bytes();
        let unit = self.unit();
        if bytes.len() % unit != 0 {
            return Err(MemoryError::InsufficientData {
                got:    data.len(),
                needed: (unit / size_of::<U>().max(1)).max(1),
                unit:   type_name::<U>(),
                data:   bytes.to_vec(),
            });
        }
        Ok(bytes)
    }

    /// Append `data` to the end of an owned view.
    pub fn append<U: Element>(&mut self, data: &[U]) -> Result<(), MemoryError> {
        let data = self.coerce(data)?;
        let mut bytes = self.owned_bytes()?;
        if data.is_empty() {
            return Ok(());
        }
        bytes.extend_from_slice(data);
        self.replace_owned(bytes);
        Ok(())
    }

    /// Append a single element to the end of an owned view.
    pub fn push(&mut self, value: T) -> Result<(), MemoryError> { self.append(&[value]) }

    /// Insert `data` before element `offset` of an owned view.
    /// Offsets into flexible-tail views are in bytes.
    pub fn insert<U: Element>(&mut self, offset: usize, data: &[U]) -> Result<(), MemoryError> {
        let data = self.coerce(data)?;
        let mut bytes = self.owned_bytes()?;
        if offset > self.extent() {
            return Err(MemoryError::OutOfBounds {
                offset,
                size: self.extent(),
            });
        }
        if data.is_empty() {
            return Ok(());
        }
        let tail = bytes.split_off(offset * self.unit());
        bytes.extend_from_slice(data);
        bytes.extend_from_slice(&tail);
        self.replace_owned(bytes);
        Ok(())
    }

    /// Remove the elements in `range` from an owned view.
    /// Ranges in flexible-tail views are in bytes.
    pub fn erase(&mut self, range: Range<usize>) -> Result<(), MemoryError> {
        let mut bytes = self.owned_bytes()?;
        if range.end > self.extent() || range.start > range.end {
            return Err(MemoryError::OutOfBounds {
                offset: range.end,
                size:   self.extent(),
            });
        }
        if range.is_empty() {
            return Ok(());
        }
        let unit = self.unit();
        bytes.drain(range.start * unit..range.end * unit);
        self.replace_owned(bytes);
        Ok(())
    }

    /// Remove and return the element at `index` of an owned view.
    pub fn remove(&mut self, index: usize) -> Result<T, MemoryError> {
        self.require_allocatable()?;
        let value = self.get(index)?;
        self.erase(index..index + 1)?;
        Ok(value)
    }

    /// Remove and return the last element of an owned view, or `None` if it is empty.
    pub fn pop(&mut self) -> Result<Option<T>, MemoryError> {
        self.require_allocatable()?;
        let count = self.len();
        if count == 0 {
            return Ok(None);
        }
        let value = self.get(count - 1)?;
        self.resize(count - 1, None)?;
        Ok(Some(value))
    }

    /// Split an owned view at element `midpoint`, keeping the front and returning the tail as
    /// a new owned view.
    pub fn split_off(&mut self, midpoint: usize) -> Result<TypedView<'static, T>, MemoryError> {
        self.require_allocatable()?;
        if midpoint > self.extent() {
            return Err(MemoryError::OutOfBounds {
                offset: midpoint,
                size:   self.extent(),
            });
        }
        let tail = if midpoint == self.extent() {
            Vec::new()
        } else {
            self.as_bytes()?[midpoint * self.unit()..].to_vec()
        };
        let tail = TypedView::owned_from_bytes(&self.registry, tail);
        self.resize(midpoint, None)?;
        Ok(tail)
    }

    /// Remove all elements from an owned view.
    pub fn clear(&mut self) -> Result<(), MemoryError> { self.deallocate() }

    /// Free the buffer of an owned view, invalidating every view derived from it.
    pub fn deallocate(&mut self) -> Result<(), MemoryError> {
        self.require_allocatable()?;
        self.release();
        Ok(())
    }
}

impl<T> Drop for TypedView<'_, T> {
    fn drop(&mut self) { self.release(); }
}

impl<'a, T: Element> Clone for TypedView<'a, T> {
    /// Owned views are copied into a new buffer, borrowed views share their region.
    fn clone(&self) -> Self {
        match &self.storage {
            Storage::Null => Self::null(&self.registry),
            Storage::Owned { .. } => {
                let bytes = self.as_bytes().map(|bytes| bytes.to_vec()).unwrap_or_default();
                let mut view = Self::owned_from_bytes(&self.registry, bytes);
                view.mode = self.mode;
                view
            }
            Storage::Borrowed {
                pointer,
                writable,
                backing,
            } => {
                // a stale clone keeps the old generation and stays invalid
                self.registry.retain(self.key(), self.generation);
                Self {
                    registry:   self.registry.clone(),
                    storage:    Storage::Borrowed {
                        pointer:  *pointer,
                        writable: *writable,
                        backing:  Rc::clone(backing),
                    },
                    generation: self.generation,
                    length:     self.length,
                    mode:       self.mode,
                    _marker:    PhantomData,
                }
            }
        }
    }
}

impl<T> fmt::Debug for TypedView<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let storage = match self.storage {
            Storage::Null => "null",
            Storage::Borrowed { writable: false, .. } => "borrowed",
            Storage::Borrowed { writable: true, .. } => "borrowed mut",
            Storage::Owned { .. } => "owned",
        };
        f.debug_struct("TypedView")
            .field("type", &type_name::<T>())
            .field("address", &self.as_ptr())
            .field("length", &self.length)
            .field("generation", &self.generation)
            .field("mode", &self.mode)
            .field("storage", &storage)
            .finish()
    }
}
