//! State shared by the two layouts: the section-name string table, the debug-symbol string table
//! and the bookkeeping for whether those two happen to be the same underlying section (in which
//! case they are rebuilt together and must never be removed twice).

use crate::error::Result;
use crate::model::Binary;
use crate::strtab::StringTable;
use object::elf;

pub(crate) struct LayoutCommon {
    /// Section header names, plus static symbol names when the tables are shared.
    pub(crate) shstrtab: StringTable,
    /// Static (debug) symbol names. Unused when shared with the section-name table.
    pub(crate) strtab: StringTable,
    /// True when `.strtab` and `.shstrtab` are one underlying section.
    pub(crate) shared: bool,
    pub(crate) relocate_shstrtab: bool,
    pub(crate) relocate_strtab: bool,
    /// Index of the static string table section, when the model has one.
    pub(crate) strtab_index: Option<usize>,
}

impl LayoutCommon {
    pub(crate) fn new(binary: &Binary) -> Self {
        let strtab_index = binary
            .section_index_by_type(elf::SHT_SYMTAB)
            .map(|symtab| binary.sections[symtab].link as usize)
            .filter(|&index| index < binary.sections.len());
        let shared =
            strtab_index.is_some_and(|index| {
                index == binary.header.section_name_table_index as usize
            });
        Self {
            shstrtab: StringTable::new(),
            strtab: StringTable::new(),
            shared,
            relocate_shstrtab: false,
            relocate_strtab: false,
            strtab_index,
        }
    }

    /// Builds both string tables from the current model state. `extra_section_names` holds names
    /// of sections the relocation pass may add (e.g. fresh `.symtab`, synthesized note sections)
    /// so that the rebuilt name table already contains them.
    pub(crate) fn build_string_tables(
        &mut self,
        binary: &Binary,
        extra_section_names: &[String],
        force: bool,
    ) -> Result {
        for section in &binary.sections {
            self.shstrtab.insert(&section.name);
        }
        for name in extra_section_names {
            self.shstrtab.insert(name);
        }

        let symbol_names = binary.static_symbols.iter().map(|s| s.name.as_str());
        if self.shared {
            self.shstrtab.insert_all(symbol_names);
        } else {
            self.strtab.insert_all(symbol_names);
        }

        let shstrndx = binary.header.section_name_table_index as usize;
        let shstrtab_on_disk = binary
            .sections
            .get(shstrndx)
            .map_or(0, |section| section.original_size);
        self.relocate_shstrtab =
            !binary.sections.is_empty() && (force || self.shstrtab.len() != shstrtab_on_disk);

        if !self.shared && !binary.static_symbols.is_empty() {
            let strtab_on_disk = self
                .strtab_index
                .map_or(0, |index| binary.sections[index].original_size);
            self.relocate_strtab = force || self.strtab.len() != strtab_on_disk;
        }
        Ok(())
    }

    /// Offset of a static symbol's name in whichever table holds it.
    pub(crate) fn static_name_offset(&self, name: &str) -> u64 {
        if self.shared {
            self.shstrtab.offset_of(name).unwrap_or(0)
        } else {
            self.strtab.offset_of(name).unwrap_or(0)
        }
    }

    pub(crate) fn strtab_bytes(&self) -> &[u8] {
        if self.shared {
            self.shstrtab.as_bytes()
        } else {
            self.strtab.as_bytes()
        }
    }
}

/// The two concrete layouts. Selected once at builder construction; no third variant is
/// expected.
pub(crate) enum LayoutKind {
    Exe(crate::exe_layout::ExeLayout),
    Object(crate::object_layout::ObjectFileLayout),
}
