//! Layout for loadable images (executables, shared objects, cores). The size pass computes the
//! byte footprint of every rebuilt structure and keeps only those whose footprint no longer
//! matches the on-disk one. The relocation pass packs the movers into at most two fresh PT_LOAD
//! regions, cursor-style with no gaps, and patches every dynamic tag, section header and program
//! header that referenced an old location.

use std::collections::HashMap;

use crate::alignment;
use crate::elf::ElfClass;
use crate::error::BuildError;
use crate::error::Result;
use crate::error::is_not_found;
use crate::hash_table;
use crate::layout::LayoutCommon;
use crate::model::Binary;
use crate::model::DynamicEntry;
use crate::model::Note;
use crate::model::Section;
use crate::model::Segment;
use crate::model::SegmentFlags;
use crate::sink::OutputSink;
use crate::strtab::StringTable;
use crate::symbol_order::SymbolPartition;
use crate::symbol_order::partition_dynamic_symbols;
use object::Endianness;
use object::elf;
use tracing::debug;
use tracing::warn;

fn dt(tag: u32) -> i64 {
    i64::from(tag)
}

pub(crate) struct ExeLayout {
    pub(crate) common: LayoutCommon,
    pub(crate) partition: SymbolPartition,
    /// The rebuilt dynamic string table. Serialized whether or not it moves; equal-size rebuilds
    /// are overwritten in place.
    pub(crate) dynstr: StringTable,
    /// The rebuilt `.gnu.hash` bytes, cached because sizing it requires building it.
    pub(crate) gnu_hash: Vec<u8>,
    /// All note records packed into one blob, plus each record's offset within it.
    pub(crate) notes: Vec<u8>,
    pub(crate) note_offsets: Vec<u64>,

    // Sizes of the structures that must move. Zero means the structure either does not exist or
    // still fits where it is.
    relocate_dynstr: bool,
    relocate_gnu_hash: bool,
    relocate_notes: bool,
    dynamic_size: u64,
    dynsym_size: u64,
    sysv_size: u64,
    dyn_reloc_size: u64,
    plt_reloc_size: u64,
    versym_size: u64,
    verdef_size: u64,
    verneed_size: u64,
    init_size: u64,
    preinit_size: u64,
    fini_size: u64,
    interp_size: u64,
    symtab_size: u64,
}

impl ExeLayout {
    pub(crate) fn new(binary: &Binary) -> Self {
        Self {
            common: LayoutCommon::new(binary),
            partition: SymbolPartition {
                first_non_local: 0,
                first_undefined: 0,
            },
            dynstr: StringTable::new(),
            gnu_hash: Vec::new(),
            notes: Vec::new(),
            note_offsets: Vec::new(),
            relocate_dynstr: false,
            relocate_gnu_hash: false,
            relocate_notes: false,
            dynamic_size: 0,
            dynsym_size: 0,
            sysv_size: 0,
            dyn_reloc_size: 0,
            plt_reloc_size: 0,
            versym_size: 0,
            verdef_size: 0,
            verneed_size: 0,
            init_size: 0,
            preinit_size: 0,
            fini_size: 0,
            interp_size: 0,
            symtab_size: 0,
        }
    }

    /// Original file size of the section a dynamic tag points at, 0 when the tag has no value or
    /// no section covers it. A zero here forces the structure to relocate, which is the right
    /// outcome for structures that are new.
    fn tagged_section_size(binary: &Binary, tag: i64) -> u64 {
        binary
            .dynamic_value(tag)
            .and_then(|addr| binary.section_index_from_virtual_address(addr).ok())
            .map_or(0, |index| binary.sections[index].original_size)
    }

    pub(crate) fn compute_sizes<C: ElfClass>(
        &mut self,
        binary: &mut Binary,
        force: bool,
    ) -> Result {
        let endian = binary.header.endianness;

        if (binary.gnu_hash.is_some() || binary.sysv_hash.is_some())
            && binary.dynamic_entries.is_empty()
        {
            return Err(BuildError::NotFound(
                "dynamic table required to rebuild a hash table".into(),
            )
            .into());
        }
        let has_version_data = !binary.version_definitions.is_empty()
            || !binary.version_requirements.is_empty()
            || !binary.versym.is_empty();
        if has_version_data && binary.dynamic_symbols.is_empty() {
            return Err(BuildError::NotFound(
                "dynamic symbol table required by the version tables".into(),
            )
            .into());
        }

        if !binary.dynamic_symbols.is_empty() {
            self.partition = partition_dynamic_symbols(binary);
            debug!(
                "dynamic symbols: {} local, {} defined, {} undefined",
                self.partition.first_non_local,
                self.partition.first_undefined - self.partition.first_non_local,
                binary.dynamic_symbols.len() as u32 - self.partition.first_undefined
            );
        }

        // .gnu.hash is built up front: its size depends on the bucket sort it performs.
        if binary.has_dynamic(dt(elf::DT_GNU_HASH)) {
            let on_disk = Self::tagged_section_size(binary, dt(elf::DT_GNU_HASH));
            let bytes = if binary.gnu_hash.is_some() {
                let bytes = hash_table::build_gnu_hash(binary, self.partition.first_non_local)?;
                debug_assert_eq!(
                    bytes.len() as u64,
                    hash_table::gnu_hash_size(binary, self.partition.first_non_local)?,
                );
                bytes
            } else {
                // No parameters survived in the model; a degenerate table keeps the loader on
                // the SysV path without moving anything.
                debug!("no .gnu.hash parameters, writing a degenerate table");
                hash_table::build_empty_gnu_hash(binary, on_disk)
            };
            self.relocate_gnu_hash = force || bytes.len() as u64 != on_disk;
            self.gnu_hash = bytes;
        }

        if binary.has_dynamic(dt(elf::DT_HASH)) {
            let size = hash_table::sysv_hash_size(binary)?;
            if force || size != Self::tagged_section_size(binary, dt(elf::DT_HASH)) {
                self.sysv_size = size;
            }
        }

        if !binary.dynamic_entries.is_empty() {
            let size = (binary.dynamic_entries.len() * size_of::<C::Dyn>()) as u64;
            let on_disk = binary
                .section_index_by_type(elf::SHT_DYNAMIC)
                .map(|index| binary.sections[index].original_size)
                .or_else(|| binary.segment(elf::PT_DYNAMIC).map(|s| s.filesz))
                .unwrap_or(0);
            if force || size != on_disk {
                self.dynamic_size = size;
            }
        }

        // Dynamic string table: tag names first in table order, then symbol names, then the
        // names referenced by the version tables.
        for entry in &binary.dynamic_entries {
            match entry {
                DynamicEntry::Needed { name } | DynamicEntry::SharedObject { name } => {
                    self.dynstr.insert(name);
                }
                DynamicEntry::RunPath { path, .. } => {
                    self.dynstr.insert(path);
                }
                _ => {}
            }
        }
        self.dynstr
            .insert_all(binary.dynamic_symbols.iter().map(|s| s.name.as_str()));
        for definition in &binary.version_definitions {
            self.dynstr.insert_all(definition.names.iter().map(String::as_str));
        }
        for requirement in &binary.version_requirements {
            self.dynstr.insert(&requirement.name);
            self.dynstr
                .insert_all(requirement.entries.iter().map(|aux| aux.name.as_str()));
        }
        if binary.has_dynamic(dt(elf::DT_STRTAB)) {
            let on_disk = Self::tagged_section_size(binary, dt(elf::DT_STRTAB));
            self.relocate_dynstr = force || self.dynstr.len() != on_disk;
        }

        if binary.has_dynamic(dt(elf::DT_SYMTAB)) {
            let size = (binary.dynamic_symbols.len() * size_of::<C::Sym>()) as u64;
            if force || size != Self::tagged_section_size(binary, dt(elf::DT_SYMTAB)) {
                self.dynsym_size = size;
            }
        }

        if binary.has_dynamic(dt(elf::DT_VERSYM)) {
            let size = (binary.versym.len() * 2) as u64;
            if force || size != Self::tagged_section_size(binary, dt(elf::DT_VERSYM)) {
                self.versym_size = size;
            }
        }
        if binary.has_dynamic(dt(elf::DT_VERDEF)) {
            let aux_count: usize = binary
                .version_definitions
                .iter()
                .map(|d| d.names.len())
                .sum();
            let size = (binary.version_definitions.len()
                * size_of::<elf::Verdef<Endianness>>()
                + aux_count * size_of::<elf::Verdaux<Endianness>>()) as u64;
            if force || size != Self::tagged_section_size(binary, dt(elf::DT_VERDEF)) {
                self.verdef_size = size;
            }
        }
        if binary.has_dynamic(dt(elf::DT_VERNEED)) {
            let aux_count: usize = binary
                .version_requirements
                .iter()
                .map(|r| r.entries.len())
                .sum();
            let size = (binary.version_requirements.len()
                * size_of::<elf::Verneed<Endianness>>()
                + aux_count * size_of::<elf::Vernaux<Endianness>>()) as u64;
            if force || size != Self::tagged_section_size(binary, dt(elf::DT_VERNEED)) {
                self.verneed_size = size;
            }
        }

        if binary.has_dynamic(dt(elf::DT_RELA)) || binary.has_dynamic(dt(elf::DT_REL)) {
            let (entsize, size_tag) = if binary.has_dynamic(dt(elf::DT_RELA)) {
                (size_of::<C::Rela>(), dt(elf::DT_RELASZ))
            } else {
                (size_of::<C::Rel>(), dt(elf::DT_RELSZ))
            };
            let size = (binary.dynamic_relocations.len() * entsize) as u64;
            if force || size != binary.dynamic_value(size_tag).unwrap_or(0) {
                self.dyn_reloc_size = size;
            }
        }
        if binary.has_dynamic(dt(elf::DT_JMPREL)) {
            let entsize = if binary.dynamic_value(dt(elf::DT_PLTREL))
                == Some(u64::from(elf::DT_RELA))
            {
                size_of::<C::Rela>()
            } else {
                size_of::<C::Rel>()
            };
            let size = (binary.plt_relocations.len() * entsize) as u64;
            if force || size != binary.dynamic_value(dt(elf::DT_PLTRELSZ)).unwrap_or(0) {
                self.plt_reloc_size = size;
            }
        }

        self.init_size =
            self.array_relocation_size::<C>(binary, elf::DT_INIT_ARRAY, elf::DT_INIT_ARRAYSZ, force);
        self.preinit_size = self.array_relocation_size::<C>(
            binary,
            elf::DT_PREINIT_ARRAY,
            elf::DT_PREINIT_ARRAYSZ,
            force,
        );
        self.fini_size =
            self.array_relocation_size::<C>(binary, elf::DT_FINI_ARRAY, elf::DT_FINI_ARRAYSZ, force);

        if let Some(interpreter) = &binary.interpreter {
            let size = interpreter.len() as u64 + 1;
            let on_disk = binary.segment(elf::PT_INTERP).map_or(0, |s| s.filesz);
            if force || size != on_disk {
                self.interp_size = size;
            }
        }

        if !binary.notes.is_empty() {
            let mut sink = OutputSink::new(endian);
            for note in &binary.notes {
                self.note_offsets.push(sink.position() as u64);
                sink.write_u32(note.name.len() as u32 + 1);
                sink.write_u32(note.description.len() as u32);
                sink.write_u32(note.kind);
                sink.write_cstr(&note.name);
                sink.align(alignment::NOTE.value() as usize, 0);
                sink.write_bytes(&note.description);
                sink.align(alignment::NOTE.value() as usize, 0);
            }
            self.notes = sink.into_bytes();
            let on_disk: u64 = binary
                .segments
                .iter()
                .filter(|s| s.kind == elf::PT_NOTE)
                .map(|s| s.filesz)
                .sum();
            self.relocate_notes = force || self.notes.len() as u64 != on_disk;
        }

        if !binary.static_symbols.is_empty() {
            let size = (binary.static_symbols.len() * size_of::<C::Sym>()) as u64;
            let on_disk = binary
                .section_index_by_type(elf::SHT_SYMTAB)
                .map_or(0, |index| binary.sections[index].original_size);
            if force || size != on_disk {
                self.symtab_size = size;
            }
        }

        let mut extra_names = Vec::new();
        if binary.header.section_name_table_index == 0 && !binary.sections.is_empty() {
            extra_names.push(".shstrtab".to_owned());
        }
        if self.symtab_size > 0 && binary.section_index_by_type(elf::SHT_SYMTAB).is_none() {
            extra_names.push(".symtab".to_owned());
            if !self.common.shared {
                extra_names.push(".strtab".to_owned());
            }
        }
        for note in &binary.notes {
            let name = note_section_name(note);
            if binary.section_index_by_name(&name).is_none() {
                extra_names.push(name);
            }
        }
        self.common.build_string_tables(binary, &extra_names, force)?;
        Ok(())
    }

    fn array_relocation_size<C: ElfClass>(
        &self,
        binary: &Binary,
        addr_tag: u32,
        size_tag: u32,
        force: bool,
    ) -> u64 {
        let Some(DynamicEntry::Array { entries, .. }) = binary.dynamic_entry(dt(addr_tag)) else {
            return 0;
        };
        let size = (entries.len() * C::WORD_SIZE) as u64;
        if force || size != binary.dynamic_value(dt(size_tag)).unwrap_or(0) {
            size
        } else {
            0
        }
    }

    pub(crate) fn relocate<C: ElfClass>(&mut self, binary: &mut Binary) -> Result {
        let is_pie = binary.header.file_type == elf::ET_DYN;

        if self.interp_size > 0 && !binary.has_segment(elf::PT_INTERP) {
            let content = binary.arena.alloc_zeroed(self.interp_size as usize);
            let mut segment = Segment::new(elf::PT_INTERP);
            segment.flags = SegmentFlags::R;
            segment.filesz = self.interp_size;
            segment.memsz = self.interp_size;
            segment.align = alignment::INTERP.value();
            segment.content = Some(content);
            binary.segments.push(segment);
            debug!("added a PT_INTERP segment for the new interpreter");
        }

        if self.relocate_notes && !binary.has_segment(elf::PT_NOTE) {
            let size = self.notes.len() as u64;
            let mut segment = Segment::new(elf::PT_NOTE);
            segment.flags = SegmentFlags::R;
            segment.filesz = size;
            segment.memsz = size;
            segment.align = alignment::NOTE.value();
            binary.segments.push(segment);
            debug!("added a PT_NOTE segment for the new notes");
        }

        let notes_size = if self.relocate_notes {
            self.notes.len() as u64
        } else {
            0
        };
        let dynstr_size = if self.relocate_dynstr {
            self.dynstr.len()
        } else {
            0
        };
        let gnu_size = if self.relocate_gnu_hash {
            self.gnu_hash.len() as u64
        } else {
            0
        };

        let ro_structs = self.interp_size
            + notes_size
            + self.sysv_size
            + self.dynsym_size
            + dynstr_size
            + self.versym_size
            + self.verdef_size
            + self.verneed_size
            + self.dyn_reloc_size
            + self.plt_reloc_size
            + gnu_size;
        let rw_structs = self.init_size + self.preinit_size + self.fini_size + self.dynamic_size;

        if ro_structs > 0 || rw_structs > 0 {
            // The program header table gains entries for the new regions, so it cannot stay
            // where it is. It moves to the front of the read-only region and PT_PHDR follows.
            let added = 1 + usize::from(rw_structs > 0);
            let phdr_size =
                ((binary.segments.len() + added) * size_of::<C::ProgramHeader>()) as u64;

            let ro_index = binary.add_load_segment(
                SegmentFlags::R,
                phdr_size + ro_structs,
                alignment::LOAD_REGION,
            );
            let mut va_ro = binary.segments[ro_index].vaddr;
            let mut va_rw = 0;
            if rw_structs > 0 {
                let rw_index = binary.add_load_segment(
                    SegmentFlags::R | SegmentFlags::W,
                    rw_structs,
                    alignment::LOAD_REGION,
                );
                va_rw = binary.segments[rw_index].vaddr;
            }
            debug!(
                "read-only region at {va_ro:#x} ({} bytes), read-write region at {va_rw:#x} \
                 ({rw_structs} bytes)",
                phdr_size + ro_structs
            );

            let phoff = binary.virtual_address_to_offset(va_ro)?;
            binary.header.program_header_offset = phoff;
            if let Some(phdr) = binary.segment_mut(elf::PT_PHDR) {
                phdr.offset = phoff;
                phdr.vaddr = va_ro;
                phdr.paddr = va_ro;
                phdr.filesz = phdr_size;
                phdr.memsz = phdr_size;
            }
            va_ro += phdr_size;

            if self.interp_size > 0 {
                va_ro = self.place_interp(binary, va_ro)?;
            }
            if notes_size > 0 {
                va_ro = self.place_notes(binary, va_ro)?;
            }
            if self.sysv_size > 0 {
                va_ro = place_tagged(binary, dt(elf::DT_HASH), None, self.sysv_size, va_ro)?;
            }
            if self.dynsym_size > 0 {
                va_ro = place_tagged(binary, dt(elf::DT_SYMTAB), None, self.dynsym_size, va_ro)?;
            }
            if dynstr_size > 0 {
                va_ro = place_tagged(
                    binary,
                    dt(elf::DT_STRTAB),
                    Some(dt(elf::DT_STRSZ)),
                    dynstr_size,
                    va_ro,
                )?;
            }
            if self.versym_size > 0 {
                va_ro = place_tagged(binary, dt(elf::DT_VERSYM), None, self.versym_size, va_ro)?;
            }
            if self.verdef_size > 0 {
                va_ro = place_tagged(binary, dt(elf::DT_VERDEF), None, self.verdef_size, va_ro)?;
            }
            if self.verneed_size > 0 {
                va_ro = place_tagged(binary, dt(elf::DT_VERNEED), None, self.verneed_size, va_ro)?;
            }
            if self.dyn_reloc_size > 0 {
                let (addr_tag, size_tag) = if binary.has_dynamic(dt(elf::DT_RELA)) {
                    (dt(elf::DT_RELA), dt(elf::DT_RELASZ))
                } else {
                    (dt(elf::DT_REL), dt(elf::DT_RELSZ))
                };
                va_ro = place_tagged(binary, addr_tag, Some(size_tag), self.dyn_reloc_size, va_ro)?;
            }
            if self.plt_reloc_size > 0 {
                va_ro = place_tagged(
                    binary,
                    dt(elf::DT_JMPREL),
                    Some(dt(elf::DT_PLTRELSZ)),
                    self.plt_reloc_size,
                    va_ro,
                )?;
            }
            if gnu_size > 0 {
                va_ro = place_tagged(binary, dt(elf::DT_GNU_HASH), None, gnu_size, va_ro)?;
            }
            debug_assert_eq!(
                va_ro,
                binary.segments[ro_index].vaddr + phdr_size + ro_structs
            );

            // Read-write region: the three pointer arrays, then the dynamic table.
            let reloc_index = relocation_index(binary);
            if self.init_size > 0 {
                va_rw = place_array::<C>(
                    binary,
                    elf::DT_INIT_ARRAY,
                    elf::DT_INIT_ARRAYSZ,
                    self.init_size,
                    va_rw,
                    is_pie,
                    &reloc_index,
                )?;
            }
            if self.preinit_size > 0 {
                va_rw = place_array::<C>(
                    binary,
                    elf::DT_PREINIT_ARRAY,
                    elf::DT_PREINIT_ARRAYSZ,
                    self.preinit_size,
                    va_rw,
                    is_pie,
                    &reloc_index,
                )?;
            }
            if self.fini_size > 0 {
                va_rw = place_array::<C>(
                    binary,
                    elf::DT_FINI_ARRAY,
                    elf::DT_FINI_ARRAYSZ,
                    self.fini_size,
                    va_rw,
                    is_pie,
                    &reloc_index,
                )?;
            }
            if self.dynamic_size > 0 {
                self.place_dynamic(binary, va_rw)?;
            }
        }

        if self.relocate_notes {
            self.sync_note_sections(binary)?;
        }
        let appended = self.refresh_unloaded_tables::<C>(binary)?;

        // Unloaded sections land past everything else; the section header table goes last.
        let mut end = binary.file_end();
        for index in appended {
            let section = &mut binary.sections[index];
            end = end.next_multiple_of(section.addralign.max(1));
            section.offset = end;
            end += section.size;
        }
        binary.header.section_header_offset = if binary.sections.is_empty() {
            0
        } else {
            alignment::TABLE_ENTRY.align_up(binary.file_end())
        };
        Ok(())
    }

    fn place_interp(&self, binary: &mut Binary, va: u64) -> Result<u64> {
        let offset = binary.virtual_address_to_offset(va)?;
        if let Some(index) = binary.section_index_by_name(".interp") {
            let section = &mut binary.sections[index];
            section.addr = va;
            section.offset = offset;
            section.size = self.interp_size;
        }
        if let Some(segment) = binary.segment_mut(elf::PT_INTERP) {
            segment.offset = offset;
            segment.vaddr = va;
            segment.paddr = va;
            segment.filesz = self.interp_size;
            segment.memsz = self.interp_size;
        }
        Ok(va + self.interp_size)
    }

    fn place_notes(&self, binary: &mut Binary, va: u64) -> Result<u64> {
        let size = self.notes.len() as u64;
        let offset = binary.virtual_address_to_offset(va)?;
        if let Some(segment) = binary.segment_mut(elf::PT_NOTE) {
            segment.offset = offset;
            segment.vaddr = va;
            segment.paddr = va;
            segment.filesz = size;
            segment.memsz = size;
        }
        Ok(va + size)
    }

    fn place_dynamic(&self, binary: &mut Binary, va: u64) -> Result<u64> {
        let offset = binary.virtual_address_to_offset(va)?;
        if let Some(index) = binary.section_index_by_type(elf::SHT_DYNAMIC) {
            let section = &mut binary.sections[index];
            section.addr = va;
            section.offset = offset;
            section.size = self.dynamic_size;
        }
        if let Some(segment) = binary.segment_mut(elf::PT_DYNAMIC) {
            segment.offset = offset;
            segment.vaddr = va;
            segment.paddr = va;
            segment.filesz = self.dynamic_size;
            segment.memsz = self.dynamic_size;
        }
        Ok(va + self.dynamic_size)
    }

    /// Re-places every note-alias section inside the moved PT_NOTE blob, creating sections for
    /// new notes and dropping sections whose note is gone. Also keeps PT_GNU_PROPERTY pointed at
    /// the property note's record.
    fn sync_note_sections(&self, binary: &mut Binary) -> Result {
        let Some(segment) = binary.segment(elf::PT_NOTE) else {
            return Ok(());
        };
        let (segment_offset, segment_vaddr) = (segment.offset, segment.vaddr);

        let records: Vec<(String, u64, u64, bool)> = binary
            .notes
            .iter()
            .enumerate()
            .map(|(position, note)| {
                (
                    note_section_name(note),
                    self.note_offsets[position],
                    note.record_size(),
                    note.kind == elf::NT_GNU_PROPERTY_TYPE_0 && note.name == "GNU",
                )
            })
            .collect();

        let mut live_names = Vec::with_capacity(records.len());
        for (name, record_offset, record_size, is_property) in records {
            let index = match binary.section_index_by_name(&name) {
                Some(index) => index,
                None => {
                    let mut section = Section::new(name.clone(), elf::SHT_NOTE);
                    section.flags = u64::from(elf::SHF_ALLOC);
                    section.addralign = alignment::NOTE.value();
                    binary.add_section(section)
                }
            };
            let section = &mut binary.sections[index];
            section.offset = segment_offset + record_offset;
            section.addr = segment_vaddr + record_offset;
            section.size = record_size;

            if is_property {
                if let Some(property) = binary.segment_mut(elf::PT_GNU_PROPERTY) {
                    property.offset = segment_offset + record_offset;
                    property.vaddr = segment_vaddr + record_offset;
                    property.paddr = segment_vaddr + record_offset;
                    property.filesz = record_size;
                    property.memsz = record_size;
                }
            }
            live_names.push(name);
        }

        let stale: Vec<usize> = binary
            .sections
            .iter()
            .enumerate()
            .filter(|(_, section)| {
                section.kind == elf::SHT_NOTE && !live_names.contains(&section.name)
            })
            .map(|(index, _)| index)
            .collect();
        for index in stale.into_iter().rev() {
            debug!("removing stale note section {}", binary.sections[index].name);
            binary.remove_section(index);
        }
        Ok(())
    }

    /// Replaces the unloaded tables (section names, static symbols, static strings) whose size
    /// changed. Returns the indices of the sections added, which still need file offsets.
    fn refresh_unloaded_tables<C: ElfClass>(&mut self, binary: &mut Binary) -> Result<Vec<usize>> {
        let mut appended = Vec::new();

        // Index 0 means the file never had a section name table; never remove the null section.
        let shstrndx = binary.header.section_name_table_index as usize;
        let shstrtab_name = if shstrndx == 0 {
            ".shstrtab".to_owned()
        } else {
            binary
                .sections
                .get(shstrndx)
                .map_or_else(|| ".shstrtab".to_owned(), |s| s.name.clone())
        };
        let symtab_index = binary.section_index_by_type(elf::SHT_SYMTAB);
        let mut strtab_index = symtab_index
            .map(|index| binary.sections[index].link as usize)
            .filter(|&index| index < binary.sections.len());

        let mut to_remove = Vec::new();
        if self.common.relocate_shstrtab && shstrndx != 0 && shstrndx < binary.sections.len() {
            to_remove.push(shstrndx);
        }
        if self.common.relocate_strtab && !self.common.shared {
            if let Some(index) = strtab_index {
                to_remove.push(index);
            }
        }
        if self.symtab_size > 0 {
            if let Some(index) = symtab_index {
                to_remove.push(index);
            }
        }
        to_remove.sort_unstable();
        to_remove.dedup();
        for &index in to_remove.iter().rev() {
            binary.remove_section(index);
        }
        // `to_remove` holds pre-removal indices; surviving indices shift down by the number of
        // removed slots below them.
        let adjust = |index: usize| index - to_remove.iter().filter(|&&r| r < index).count();
        if !self.common.relocate_strtab {
            strtab_index = strtab_index
                .filter(|index| !to_remove.contains(index))
                .map(adjust);
        }

        if self.common.relocate_shstrtab {
            let mut section = Section::new(shstrtab_name, elf::SHT_STRTAB);
            section.size = self.common.shstrtab.len();
            section.content = Some(binary.arena.alloc(self.common.shstrtab.as_bytes().to_vec()));
            let index = binary.add_section(section);
            binary.header.section_name_table_index = index as u16;
            appended.push(index);
            if self.common.shared {
                strtab_index = Some(index);
            }
        }
        if self.common.relocate_strtab && !self.common.shared {
            let mut section = Section::new(".strtab", elf::SHT_STRTAB);
            section.size = self.common.strtab.len();
            section.content = Some(binary.arena.alloc(self.common.strtab.as_bytes().to_vec()));
            let index = binary.add_section(section);
            appended.push(index);
            strtab_index = Some(index);
        }

        if self.symtab_size > 0 {
            let mut section = Section::new(".symtab", elf::SHT_SYMTAB);
            section.size = self.symtab_size;
            section.entsize = size_of::<C::Sym>() as u64;
            section.addralign = alignment::TABLE_ENTRY.value();
            section.link = strtab_index.unwrap_or(0) as u32;
            section.info = binary
                .static_symbols
                .iter()
                .position(|symbol| !symbol.is_local())
                .unwrap_or(binary.static_symbols.len()) as u32;
            section.content = Some(binary.arena.alloc_zeroed(self.symtab_size as usize));
            appended.push(binary.add_section(section));
        } else if let Some(new_strtab) = strtab_index {
            // Symtab stayed put but its string table moved.
            if let Some(index) = binary.section_index_by_type(elf::SHT_SYMTAB) {
                binary.sections[index].link = new_strtab as u32;
            }
        }
        Ok(appended)
    }
}

/// Moves the structure behind a dynamic tag to `va`: the section covering the tag's old value is
/// re-addressed and resized, the tag itself (and its size companion, when there is one) is
/// patched. Files stripped of section headers simply have no section to update.
fn place_tagged(
    binary: &mut Binary,
    addr_tag: i64,
    size_tag: Option<i64>,
    size: u64,
    va: u64,
) -> Result<u64> {
    let offset = binary.virtual_address_to_offset(va)?;
    if let Some(old) = binary.dynamic_value(addr_tag) {
        match binary.section_index_from_virtual_address(old) {
            Ok(index) => {
                let section = &mut binary.sections[index];
                section.addr = va;
                section.offset = offset;
                section.size = size;
            }
            Err(error) if is_not_found(&error) => {
                debug!("no section behind dynamic tag {addr_tag:#x}");
            }
            Err(error) => return Err(error),
        }
    }
    binary.set_dynamic_value(addr_tag, va)?;
    if let Some(tag) = size_tag {
        binary.set_dynamic_value(tag, size)?;
    }
    Ok(va + size)
}

/// Address-keyed index over the loadable relocations. `true` marks a PLT relocation.
fn relocation_index(binary: &Binary) -> HashMap<u64, (bool, usize)> {
    let mut index = HashMap::new();
    for (position, relocation) in binary.dynamic_relocations.iter().enumerate() {
        index.insert(relocation.address, (false, position));
    }
    for (position, relocation) in binary.plt_relocations.iter().enumerate() {
        index.insert(relocation.address, (true, position));
    }
    index
}

/// Moves a pointer array (init/preinit/fini). Position-independent images carry a relocation per
/// slot; each one is retargeted to the slot's new address so the loader keeps fixing up the right
/// words.
fn place_array<C: ElfClass>(
    binary: &mut Binary,
    addr_tag: u32,
    size_tag: u32,
    size: u64,
    va: u64,
    is_pie: bool,
    reloc_index: &HashMap<u64, (bool, usize)>,
) -> Result<u64> {
    let old_base = binary.dynamic_value(dt(addr_tag)).unwrap_or(0);
    if is_pie {
        warn!(
            "relocating the array behind dynamic tag {addr_tag:#x}; \
             the loader will apply its relocations at the new address"
        );
        let word = C::WORD_SIZE as u64;
        let count = size / word;
        for slot in 0..count {
            match reloc_index.get(&(old_base + slot * word)) {
                Some(&(true, position)) => {
                    binary.plt_relocations[position].address = va + slot * word;
                }
                Some(&(false, position)) => {
                    binary.dynamic_relocations[position].address = va + slot * word;
                }
                None => warn!(
                    "missing relocation for slot {slot} of the array behind tag {addr_tag:#x}"
                ),
            }
        }
    }
    place_tagged(binary, dt(addr_tag), Some(dt(size_tag)), size, va)
}

fn note_section_name(note: &Note) -> String {
    if note.name == "GNU" {
        match note.kind {
            elf::NT_GNU_ABI_TAG => return ".note.ABI-tag".to_owned(),
            elf::NT_GNU_HWCAP => return ".note.gnu.hwcap".to_owned(),
            elf::NT_GNU_BUILD_ID => return ".note.gnu.build-id".to_owned(),
            elf::NT_GNU_GOLD_VERSION => return ".note.gnu.gold-version".to_owned(),
            elf::NT_GNU_PROPERTY_TYPE_0 => return ".note.gnu.property".to_owned(),
            _ => {}
        }
    }
    // Unknown note kinds get a name derived from the numeric type.
    format!(".note.{:#x}", note.kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::Class64;
    use crate::model::Class;
    use crate::model::Header;
    use crate::model::Symbol;

    fn dynamic_binary() -> Binary {
        let mut binary = Binary::new(Header::new(
            Class::Elf64,
            Endianness::Little,
            elf::ET_DYN,
            elf::EM_X86_64,
        ));
        let mut load = Segment::new(elf::PT_LOAD);
        load.flags = SegmentFlags::R | SegmentFlags::X;
        load.filesz = 0x400;
        load.memsz = 0x400;
        load.align = 0x1000;
        binary.segments.push(load);
        let mut dynamic = Segment::new(elf::PT_DYNAMIC);
        // Four 16-byte Dyn64 entries, so the table itself stays in place.
        dynamic.filesz = 64;
        dynamic.memsz = 64;
        binary.segments.push(dynamic);

        let mut dynstr = Section::new(".dynstr", elf::SHT_STRTAB);
        dynstr.addr = 0x200;
        dynstr.offset = 0x200;
        dynstr.size = 0x10;
        dynstr.original_size = 0x10;
        binary.sections.push(Section::new("", elf::SHT_NULL));
        binary.sections.push(dynstr);

        binary.dynamic_entries = vec![
            DynamicEntry::Needed {
                name: "libm.so.6".to_owned(),
            },
            DynamicEntry::Scalar {
                tag: dt(elf::DT_STRTAB),
                value: 0x200,
            },
            DynamicEntry::Scalar {
                tag: dt(elf::DT_STRSZ),
                value: 0x10,
            },
            DynamicEntry::Scalar {
                tag: dt(elf::DT_NULL),
                value: 0,
            },
        ];
        binary.dynamic_symbols.push(Symbol {
            binding: elf::STB_LOCAL,
            ..Symbol::new("")
        });
        binary
    }

    #[test]
    fn grown_dynstr_moves_and_patches_its_tags() {
        let mut binary = dynamic_binary();
        binary.dynamic_entries.insert(
            1,
            DynamicEntry::Needed {
                name: "libsomething.so.1".to_owned(),
            },
        );
        // Keep the dynamic table in place: five entries match the on-disk size.
        binary.segment_mut(elf::PT_DYNAMIC).unwrap().filesz = 80;
        binary.segment_mut(elf::PT_DYNAMIC).unwrap().memsz = 80;
        let mut layout = ExeLayout::new(&binary);
        layout.compute_sizes::<Class64>(&mut binary, false).unwrap();
        layout.relocate::<Class64>(&mut binary).unwrap();

        let strtab = binary.dynamic_value(dt(elf::DT_STRTAB)).unwrap();
        assert!(strtab >= 0x1000, "dynstr should move to a fresh region");
        assert_eq!(
            binary.dynamic_value(dt(elf::DT_STRSZ)).unwrap(),
            layout.dynstr.len()
        );
        let section = &binary.sections[binary.section_index_by_name(".dynstr").unwrap()];
        assert_eq!(section.addr, strtab);
        assert_eq!(
            section.offset,
            binary.virtual_address_to_offset(strtab).unwrap()
        );

        // Only read-only structures moved, so exactly one region was added.
        let loads = binary.segments.iter().filter(|s| s.is_load()).count();
        assert_eq!(loads, 2);
    }

    #[test]
    fn unchanged_image_stays_in_place() {
        let mut binary = dynamic_binary();
        // Make the rebuilt dynstr exactly as large as the original one was:
        // 1 (NUL) + "libm.so.6\0" = 11 bytes, so claim 11 on disk.
        binary.sections[1].original_size = 11;
        binary.sections[1].size = 11;
        if let Some(DynamicEntry::Scalar { value, .. }) =
            binary.dynamic_entry_mut(dt(elf::DT_STRSZ))
        {
            *value = 11;
        }
        let mut layout = ExeLayout::new(&binary);
        layout.compute_sizes::<Class64>(&mut binary, false).unwrap();
        let segments_before = binary.segments.len();
        layout.relocate::<Class64>(&mut binary).unwrap();
        assert_eq!(binary.segments.len(), segments_before);
        assert_eq!(binary.dynamic_value(dt(elf::DT_STRTAB)).unwrap(), 0x200);
    }

    #[test]
    fn note_blob_packs_records_with_padding() {
        let mut binary = dynamic_binary();
        binary.notes.push(Note {
            name: "GNU".to_owned(),
            kind: elf::NT_GNU_BUILD_ID,
            description: vec![0xaa; 20],
        });
        binary.notes.push(Note {
            name: "GNU".to_owned(),
            kind: elf::NT_GNU_ABI_TAG,
            description: vec![0; 16],
        });
        let mut layout = ExeLayout::new(&binary);
        layout.compute_sizes::<Class64>(&mut binary, false).unwrap();

        assert_eq!(layout.note_offsets, vec![0, 36]);
        assert_eq!(layout.notes.len() as u64, 36 + 32);
        // namesz includes the NUL, the name itself is padded to 4 bytes.
        assert_eq!(&layout.notes[0..4], &4u32.to_le_bytes());
        assert_eq!(&layout.notes[12..16], b"GNU\0");
    }

    #[test]
    fn relocated_notes_get_a_segment_and_alias_sections() {
        let mut binary = dynamic_binary();
        binary.notes.push(Note {
            name: "GNU".to_owned(),
            kind: elf::NT_GNU_BUILD_ID,
            description: vec![0xaa; 20],
        });
        binary.notes.push(Note {
            name: "GNU".to_owned(),
            kind: elf::NT_GNU_PROPERTY_TYPE_0,
            description: vec![0; 16],
        });
        binary.segments.push(Segment::new(elf::PT_GNU_PROPERTY));

        let mut layout = ExeLayout::new(&binary);
        layout.compute_sizes::<Class64>(&mut binary, false).unwrap();
        layout.relocate::<Class64>(&mut binary).unwrap();

        let segment = binary.segment(elf::PT_NOTE).expect("a note segment");
        assert!(segment.vaddr >= 0x1000, "notes land in a fresh region");
        assert_eq!(segment.filesz, layout.notes.len() as u64);
        let (segment_offset, segment_vaddr) = (segment.offset, segment.vaddr);

        let build_id = binary
            .section_index_by_name(".note.gnu.build-id")
            .expect("a build-id section");
        assert_eq!(binary.sections[build_id].offset, segment_offset);
        assert_eq!(binary.sections[build_id].size, 36);
        let property = binary
            .section_index_by_name(".note.gnu.property")
            .expect("a property section");
        assert_eq!(binary.sections[property].addr, segment_vaddr + 36);

        let property = binary.segment(elf::PT_GNU_PROPERTY).unwrap();
        assert_eq!(property.vaddr, segment_vaddr + 36);
        assert_eq!(property.filesz, 32);
    }
}
