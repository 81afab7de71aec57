//! Layout for relocatable objects. No segments exist, so nothing is packed into regions: each
//! section whose rebuilt size differs from its on-disk size is appended past the placed extent
//! of the file, the section header table slides down by the inserted bytes, and the hole tracker
//! records every insertion so offsets held by the caller can be shifted.

use std::collections::BTreeMap;

use crate::alignment::Alignment;
use crate::elf::ElfClass;
use crate::error::Result;
use crate::layout::LayoutCommon;
use crate::model::Binary;
use crate::model::RelocationPurpose;
use crate::model::Section;
use object::elf;
use tracing::debug;

pub(crate) struct ObjectFileLayout {
    pub(crate) common: LayoutCommon,
    /// Sections that must move, keyed by index so the relocation pass walks them in file order.
    section_sizes: BTreeMap<usize, u64>,
    /// Non-zero when static symbols exist but the object has no symbol table section yet.
    new_symtab_size: u64,
}

impl ObjectFileLayout {
    pub(crate) fn new(binary: &Binary) -> Self {
        Self {
            common: LayoutCommon::new(binary),
            section_sizes: BTreeMap::new(),
            new_symtab_size: 0,
        }
    }

    /// Number of relocations serialized into the given REL/RELA section.
    fn relocation_count(binary: &Binary, section_index: usize) -> usize {
        let target = binary.sections[section_index].info as usize;
        binary
            .section_relocations
            .iter()
            .filter(|r| r.purpose == RelocationPurpose::Section(target))
            .count()
    }

    pub(crate) fn compute_sizes<C: ElfClass>(
        &mut self,
        binary: &mut Binary,
        force: bool,
    ) -> Result {
        let symtab_index = binary.section_index_by_type(elf::SHT_SYMTAB);
        if !binary.static_symbols.is_empty() || symtab_index.is_some() {
            let size = (binary.static_symbols.len() * size_of::<C::Sym>()) as u64;
            match symtab_index {
                Some(index) => {
                    if force || size != binary.sections[index].original_size {
                        self.section_sizes.insert(index, size);
                    }
                }
                None => self.new_symtab_size = size,
            }
        }

        for index in 0..binary.sections.len() {
            let (kind, original) = {
                let section = &binary.sections[index];
                (section.kind, section.original_size)
            };
            if kind != elf::SHT_REL && kind != elf::SHT_RELA {
                continue;
            }
            let entsize = if kind == elf::SHT_RELA {
                size_of::<C::Rela>()
            } else {
                size_of::<C::Rel>()
            };
            let size = (Self::relocation_count(binary, index) * entsize) as u64;
            if force || size != original {
                self.section_sizes.insert(index, size);
            }
        }

        let mut extra_names = Vec::new();
        if self.new_symtab_size > 0 {
            extra_names.push(".symtab".to_owned());
            if !self.common.shared {
                extra_names.push(".strtab".to_owned());
            }
        }
        if binary.header.section_name_table_index == 0 && !binary.sections.is_empty() {
            extra_names.push(".shstrtab".to_owned());
        }
        self.common.build_string_tables(binary, &extra_names, force)?;

        if self.common.relocate_shstrtab {
            let shstrndx = binary.header.section_name_table_index as usize;
            if shstrndx != 0 && shstrndx < binary.sections.len() {
                self.section_sizes.insert(shstrndx, self.common.shstrtab.len());
            }
        }
        if self.common.relocate_strtab && !self.common.shared {
            if let Some(index) = self.common.strtab_index {
                self.section_sizes.insert(index, self.common.strtab.len());
            }
        }
        Ok(())
    }

    /// Moves every flagged section past the placed extent and shifts the section header table by
    /// the inserted bytes. Sections keep their indices; only offsets and sizes change.
    pub(crate) fn relocate<C: ElfClass>(&mut self, binary: &mut Binary) -> Result {
        let mut last_offset = binary.file_end().max(size_of::<C::FileHeader>() as u64);

        if self.new_symtab_size > 0 {
            let strtab_index = self.add_missing_string_tables::<C>(binary);
            let mut section = Section::new(".symtab", elf::SHT_SYMTAB);
            section.size = self.new_symtab_size;
            section.entsize = size_of::<C::Sym>() as u64;
            section.addralign = crate::alignment::TABLE_ENTRY.value();
            section.link = strtab_index as u32;
            section.info = binary
                .static_symbols
                .iter()
                .position(|symbol| !symbol.is_local())
                .unwrap_or(binary.static_symbols.len()) as u32;
            section.content = Some(binary.arena.alloc_zeroed(self.new_symtab_size as usize));
            let index = binary.add_section(section);
            self.section_sizes.insert(index, self.new_symtab_size);
        }

        for (&index, &size) in &self.section_sizes {
            let align = match binary.sections[index].addralign {
                0 | 1 => 1,
                raw => Alignment::new(raw)?.value(),
            };
            let aligned = last_offset.next_multiple_of(align);
            debug!(
                "section {} moves to {aligned:#x} ({size} bytes)",
                binary.sections[index].name
            );
            binary.holes.insert(last_offset, aligned - last_offset + size);
            let section = &mut binary.sections[index];
            section.offset = aligned;
            section.size = size;
            binary.header.section_header_offset += aligned - last_offset + size;
            last_offset = aligned + size;
        }
        if binary.header.section_header_offset < last_offset {
            binary.header.section_header_offset =
                crate::alignment::TABLE_ENTRY.align_up(last_offset);
        }
        Ok(())
    }

    /// Creates the string table sections a fresh `.symtab` needs. Returns the index of the
    /// section that will hold the symbol names.
    fn add_missing_string_tables<C: ElfClass>(&mut self, binary: &mut Binary) -> usize {
        if self.common.shared {
            return binary.header.section_name_table_index as usize;
        }
        if let Some(index) = self.common.strtab_index {
            return index;
        }
        let mut strtab = Section::new(".strtab", elf::SHT_STRTAB);
        strtab.size = self.common.strtab.len();
        strtab.content = Some(binary.arena.alloc(self.common.strtab.as_bytes().to_vec()));
        let index = binary.add_section(strtab);
        self.section_sizes.insert(index, self.common.strtab.len());
        self.common.strtab_index = Some(index);
        index
    }
}
