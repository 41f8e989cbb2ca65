//! Safe inspection of **p**ortable **e**xecutables through bounds-checked typed **view**s.
//!
//! Supports:
//! * Typed, alignment-checked views over borrowed or owned memory
//! * Validity tracking of derived views through a shared [`Registry`]
//! * Translation between file offsets, RVAs and VAs using the section table
//! * Parsing and introspection of portable executable headers and exports
//!
//! See [`TypedView`] for the memory primitive and [`Image`] for the main entry point for parsing a
//! portable executable image.
//!
//! # Examples
//!
//! ### Searching a view
//! ```
//! use peview::{Registry, TypedView};
//!
//! let registry = Registry::new();
//! let data = [0xde, 0xad, 0xbe, 0xef, 0xde, 0xfa, 0xce, 0xd1];
//! let view = TypedView::borrowed(&registry, &data[..]);
//!
//! // find every offset of the little-endian dword
//! let offsets = view.search::<u32>(&[0xd1cefade])?;
//! assert_eq!(offsets, vec![4]);
//! ```
//!
//! ### Address translation
//! ```
//! use peview::{AddressSpace, Image, Registry, Rva};
//!
//! let registry = Registry::new();
//! let image = Image::parse_file(&registry, BINARY_PATH)?;
//!
//! // resolve the entrypoint to its position in the file
//! let offset = image.entrypoint().as_offset(&image)?;
//! let va = image.rva_to_va(image.entrypoint())?;
//! ```

#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg_hide))]
#![cfg_attr(docsrs, doc(cfg_hide(doc)))]

pub(crate) mod address;
pub(crate) mod errors;
pub(crate) mod exports;
pub(crate) mod image;
pub(crate) mod memory;
pub(crate) mod registry;
pub(crate) mod search;
pub(crate) mod util;

pub mod constants;
pub mod types;

pub use crate::{address::*, errors::*, exports::*, image::*, memory::*, registry::*, util::align};
