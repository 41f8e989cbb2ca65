//! Export directory parsing and export resolution.

use ahash::RandomState;
use indexmap::IndexMap;
use log::{debug, trace};

use crate::{address::*, constants::*, errors::*, image::*, memory::*, types::*};

/// Target of an exported symbol.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum Export {
    /// Address of the exported code or data.
    Function(Rva),
    /// Export forwarded to another module, as `module.symbol` or `module.#ordinal`.
    Forwarder(String),
}

/// Export directory of an image.
///
/// The address tables are views into the image data and are only valid as long as the image data is.
#[derive(Debug, Clone)]
pub struct ExportDirectory<'a> {
    directory:     ImageDataDirectory,
    table:         ExportDirectoryTable,
    name:          String,
    functions:     TypedView<'a, Rva>,
    names:         TypedView<'a, Rva>,
    name_ordinals: TypedView<'a, u16>,
}

impl<'a> ExportDirectory<'a> {
    pub(crate) fn parse(image: &Image<'a>) -> Result<Self, ImageReadError> {
        let directory = image
            .data_directory(DataDirectoryType::ExportTable)
            .copied()
            .filter(ImageDataDirectory::is_present)
            .ok_or(ImageReadError::DirectoryUnavailable(IMAGE_DIRECTORY_ENTRY_EXPORT))?;
        let view = image.view();

        let table_address = image.memory_address(Rva(directory.virtual_address).into())?;
        let table = view.cast_bytes::<ExportDirectoryTable>(table_address)?;
        debug!("{:#x?}: {:#x?}", table_address, table);

        let name = image.cstring(Rva(table.name))?;
        let functions = view.subsection::<Rva>(
            image.memory_address(Rva(table.address_of_functions).into())?,
            table.number_of_functions as usize,
        )?;
        let names = view.subsection::<Rva>(
            image.memory_address(Rva(table.address_of_names).into())?,
            table.number_of_names as usize,
        )?;
        let name_ordinals = view.subsection::<u16>(
            image.memory_address(Rva(table.address_of_name_ordinals).into())?,
            table.number_of_names as usize,
        )?;

        Ok(Self {
            directory,
            table,
            name,
            functions,
            names,
            name_ordinals,
        })
    }

    /// Returns the name of the module as recorded in the export directory.
    pub fn name(&self) -> &str { &self.name }

    /// Returns the export directory table.
    pub fn table(&self) -> &ExportDirectoryTable { &self.table }

    /// Returns the data directory entry pointing to the export directory.
    pub fn directory(&self) -> &ImageDataDirectory { &self.directory }

    /// Returns the ordinal base.
    pub fn base(&self) -> u32 { self.table.base }

    /// Returns the export address table.
    pub fn functions(&self) -> &TypedView<'a, Rva> { &self.functions }

    /// Returns the export name pointer table.
    pub fn names(&self) -> &TypedView<'a, Rva> { &self.names }

    /// Returns the export ordinal table, indexing into [`ExportDirectory::functions`].
    pub fn name_ordinals(&self) -> &TypedView<'a, u16> { &self.name_ordinals }

    /// Resolve every named export.
    ///
    /// Function addresses pointing inside the export directory are forwarders.
    ///
    /// # Returns
    /// Returns the exports by name, in the order of the name pointer table.
    pub fn export_map(&self, image: &Image<'_>) -> Result<IndexMap<String, Export, RandomState>, ImageReadError> {
        let mut exports = IndexMap::with_hasher(RandomState::new());
        let names = self.names.to_vec()?;
        let ordinals = self.name_ordinals.to_vec()?;
        for (&name, &ordinal) in names.iter().zip(ordinals.iter()) {
            let name = image.cstring(name)?;
            let function = self.functions.get(ordinal as usize)?;
            let export = if self.directory.contains(function) {
                Export::Forwarder(image.cstring(function)?)
            } else {
                Export::Function(function)
            };
            trace!("{}: {:?}", name, export);
            exports.insert(name, export);
        }
        Ok(exports)
    }
}
