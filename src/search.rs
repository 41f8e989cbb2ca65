//! Exact and wildcard pattern search over typed views.

use log::trace;
use zerocopy::IntoBytes;

use crate::{errors::*, memory::*, util::*};

impl<'a, T: Element> TypedView<'a, T> {
    /// Convert a pattern of `U` into elements of this view.
    fn pattern_elements<U: Element>(&self, pattern: &[U]) -> Result<Vec<T>, MemoryError> {
        if !self.aligns_with_type::<U>() {
            return Err(alignment_error::<T, U>(self.element_size()));
        }
        let bytes = pattern.as_bytes();
        let size = core::mem::size_of::<T>();
        if size == 0 || bytes.len() % size != 0 {
            return Err(MemoryError::InsufficientData {
                got:    pattern.len(),
                needed: (size / core::mem::size_of::<U>().max(1)).max(1),
                unit:   core::any::type_name::<U>(),
                data:   bytes.to_vec(),
            });
        }
        Ok(decode(bytes))
    }

    /// Find every element offset at which `pattern` occurs. Matches may overlap.
    ///
    /// The pattern is reinterpreted as elements of this view and compared by value.
    ///
    /// # Returns
    /// Returns an error if the pattern type does not align with the view or if the pattern is
    /// longer than the view. An empty pattern has no matches.
    pub fn search<U: Element>(&self, pattern: &[U]) -> Result<Vec<usize>, MemoryError> {
        self.search_with(pattern, |left, right| left == right)
    }

    /// Find every element offset at which `pattern` occurs, comparing elements with `eq`.
    pub fn search_with<U: Element, F: Fn(&T, &T) -> bool>(
        &self, pattern: &[U], eq: F,
    ) -> Result<Vec<usize>, MemoryError> {
        let pattern = self.pattern_elements(pattern)?;
        let haystack = self.to_vec()?;
        if pattern.is_empty() {
            return Ok(Vec::new());
        }
        if pattern.len() > haystack.len() {
            return Err(MemoryError::OutOfBounds {
                offset: pattern.len(),
                size:   haystack.len(),
            });
        }
        let found: Vec<usize> = haystack
            .windows(pattern.len())
            .enumerate()
            .filter(|(_, window)| window.iter().zip(&pattern).all(|(left, right)| eq(left, right)))
            .map(|(offset, _)| offset)
            .collect();
        trace!("search for {} elements found {} matches", pattern.len(), found.len());
        Ok(found)
    }

    /// Check whether `pattern` occurs anywhere in the view.
    pub fn contains<U: Element>(&self, pattern: &[U]) -> Result<bool, MemoryError> {
        Ok(!self.search(pattern)?.is_empty())
    }

    /// Find every occurrence of a pattern where `None` matches any element.
    ///
    /// # Returns
    /// Returns the element offset and the matched elements of every occurrence, or an error if
    /// the pattern consists only of wildcards or is longer than the view.
    pub fn search_dynamic(&self, pattern: &[Option<T>]) -> Result<Vec<(usize, Vec<T>)>, MemoryError> {
        self.search_dynamic_with(pattern, |left, right| left == right)
    }

    /// Wildcard search comparing elements with `eq`.
    pub fn search_dynamic_with<F: Fn(&T, &T) -> bool>(
        &self, pattern: &[Option<T>], eq: F,
    ) -> Result<Vec<(usize, Vec<T>)>, MemoryError> {
        let haystack = self.to_vec()?;
        if pattern.len() > haystack.len() {
            return Err(MemoryError::OutOfBounds {
                offset: pattern.len(),
                size:   haystack.len(),
            });
        }
        // the first concrete element anchors the scan
        let shift = pattern
            .iter()
            .position(Option::is_some)
            .ok_or(MemoryError::SearchTooBroad)?;

        let mut found = Vec::new();
        for index in shift..=haystack.len() - (pattern.len() - shift) {
            let start = index - shift;
            let window = &haystack[start..start + pattern.len()];
            let matched = window.iter().zip(pattern).all(|(value, expected)| match expected {
                Some(expected) => eq(value, expected),
                None => true,
            });
            if matched {
                found.push((start, window.to_vec()));
            }
        }
        trace!("wildcard search for {} elements found {} matches", pattern.len(), found.len());
        Ok(found)
    }
}
