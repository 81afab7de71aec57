//! The build pipeline: size pass, relocation pass, serialize pass. One `Builder` performs one
//! build over one mutable model; relocation mutates the model in place, so a failed build leaves
//! the model partially updated and the caller should discard it.
//!
//! Serialization writes every section's and segment's raw content at its (possibly new) offset
//! first, then seeks back and overwrites the ranges that hold rebuilt structures with freshly
//! encoded bytes, finishing with the headers and the overlay tail.

use std::path::Path;

use anyhow::Context;

use crate::elf::Class32;
use crate::elf::Class64;
use crate::elf::ElfClass;
use crate::elf::FileHeaderValues;
use crate::elf::ProgramHeaderValues;
use crate::elf::SectionHeaderValues;
use crate::error::BuildError;
use crate::error::Result;
use crate::exe_layout::ExeLayout;
use crate::hash_table;
use crate::layout::LayoutCommon;
use crate::layout::LayoutKind;
use crate::model::Binary;
use crate::model::Class;
use crate::model::DynamicEntry;
use crate::model::RelocationPurpose;
use crate::object_layout::ObjectFileLayout;
use crate::sink::OutputSink;
use object::Endianness;
use object::U16;
use object::U32;
use object::bytes_of;
use object::elf;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default)]
pub struct Config {
    /// Rebuild and relocate every structure even when its size did not change.
    pub force_relocations: bool,
}

pub struct Builder<'data> {
    binary: &'data mut Binary,
    config: Config,
    layout: LayoutKind,
    output: Option<Vec<u8>>,
}

impl<'data> Builder<'data> {
    pub fn new(binary: &'data mut Binary) -> Self {
        let layout = if binary.header.file_type == elf::ET_REL {
            LayoutKind::Object(ObjectFileLayout::new(binary))
        } else {
            LayoutKind::Exe(ExeLayout::new(binary))
        };
        Self {
            binary,
            config: Config::default(),
            layout,
            output: None,
        }
    }

    pub fn set_config(&mut self, config: Config) {
        self.config = config;
    }

    /// Runs the full pipeline. The bound model is mutated in place: relocated offsets and
    /// addresses stay applied whether or not the build succeeds.
    pub fn build(&mut self) -> Result {
        match self.binary.header.class {
            Class::Elf32 => self.build_for::<Class32>(),
            Class::Elf64 => self.build_for::<Class64>(),
        }
    }

    fn build_for<C: ElfClass>(&mut self) -> Result {
        let force = self.config.force_relocations;
        let file_type = self.binary.header.file_type;
        let bytes = match (&mut self.layout, file_type) {
            (LayoutKind::Exe(layout), elf::ET_EXEC | elf::ET_DYN | elf::ET_CORE) => {
                debug!("building a loadable image (type {file_type:#x})");
                layout.compute_sizes::<C>(self.binary, force)?;
                layout.relocate::<C>(self.binary)?;
                serialize_image::<C>(self.binary, layout)?
            }
            (LayoutKind::Object(layout), elf::ET_REL) => {
                debug!("building a relocatable object");
                layout.compute_sizes::<C>(self.binary, force)?;
                layout.relocate::<C>(self.binary)?;
                serialize_object::<C>(self.binary, layout)?
            }
            _ => return Err(BuildError::UnsupportedFileType(file_type).into()),
        };
        self.output = Some(bytes);
        Ok(())
    }

    /// The built bytes. `None` until `build` has completed successfully.
    pub fn get_build(&self) -> Option<&[u8]> {
        self.output.as_deref()
    }

    /// Persists the result. An unwritable destination is an error, but the in-memory bytes
    /// stay available through `get_build`.
    pub fn write(&self, path: impl AsRef<Path>) -> Result {
        let bytes = self
            .output
            .as_deref()
            .ok_or_else(|| BuildError::NotFound("build output".to_owned()))?;
        std::fs::write(path.as_ref(), bytes)
            .with_context(|| format!("Failed to write `{}`", path.as_ref().display()))
    }
}

fn dt(tag: u32) -> i64 {
    i64::from(tag)
}

/// File offset of the structure a dynamic tag points at, through the segment that maps it.
fn tagged_offset(binary: &Binary, tag: u32) -> Option<u64> {
    let addr = binary.dynamic_value(dt(tag))?;
    binary.virtual_address_to_offset(addr).ok()
}

fn write_raw_contents(binary: &Binary, sink: &mut OutputSink) {
    for segment in &binary.segments {
        if let Some(content) = segment.content {
            let bytes = binary.arena.get(content);
            let take = bytes.len().min(segment.filesz as usize);
            sink.seek(segment.offset as usize);
            sink.write_bytes(&bytes[..take]);
        }
    }
    for section in &binary.sections {
        if !section.occupies_file_space() {
            continue;
        }
        let Some(content) = section.content else {
            continue;
        };
        let bytes = binary.arena.get(content);
        let take = bytes.len().min(section.size as usize);
        sink.seek(section.offset as usize);
        sink.write_bytes(&bytes[..take]);
    }
}

fn serialize_image<C: ElfClass>(binary: &Binary, layout: &ExeLayout) -> Result<Vec<u8>> {
    let mut sink =
        OutputSink::with_capacity(binary.header.endianness, binary.file_end() as usize);

    write_raw_contents(binary, &mut sink);
    write_program_headers::<C>(binary, &mut sink);
    write_dynamic_table::<C>(binary, layout, &mut sink);
    write_dynamic_symbols::<C>(binary, layout, &mut sink);
    write_dynamic_strings(binary, layout, &mut sink);
    write_hash_tables(binary, layout, &mut sink)?;
    write_version_tables(binary, layout, &mut sink);
    write_loadable_relocations::<C>(binary, &mut sink);
    write_pointer_arrays::<C>(binary, &mut sink);
    write_interpreter(binary, &mut sink);
    write_notes(binary, layout, &mut sink);
    write_static_symbols::<C>(binary, &layout.common, &mut sink);
    write_string_table_sections(binary, &layout.common, &mut sink);
    write_section_headers::<C>(binary, &layout.common, &mut sink);
    write_file_header::<C>(binary, &mut sink);
    write_overlay(binary, &mut sink);
    Ok(sink.into_bytes())
}

fn serialize_object<C: ElfClass>(binary: &Binary, layout: &ObjectFileLayout) -> Result<Vec<u8>> {
    let mut sink =
        OutputSink::with_capacity(binary.header.endianness, binary.file_end() as usize);

    write_raw_contents(binary, &mut sink);
    write_section_relocations::<C>(binary, &mut sink);
    write_static_symbols::<C>(binary, &layout.common, &mut sink);
    write_string_table_sections(binary, &layout.common, &mut sink);
    write_section_headers::<C>(binary, &layout.common, &mut sink);
    write_file_header::<C>(binary, &mut sink);
    write_overlay(binary, &mut sink);
    Ok(sink.into_bytes())
}

fn write_file_header<C: ElfClass>(binary: &Binary, sink: &mut OutputSink) {
    let header = &binary.header;
    let values = FileHeaderValues {
        file_type: header.file_type,
        machine: header.machine,
        os_abi: header.os_abi,
        abi_version: header.abi_version,
        entry: header.entry,
        phoff: if binary.segments.is_empty() {
            0
        } else {
            header.program_header_offset
        },
        shoff: if binary.sections.is_empty() {
            0
        } else {
            header.section_header_offset
        },
        flags: header.flags,
        phnum: binary.segments.len() as u16,
        shnum: binary.sections.len() as u16,
        shstrndx: header.section_name_table_index,
    };
    sink.seek(0);
    sink.write_bytes(bytes_of(&C::make_file_header(sink.endian(), &values)));
}

fn write_program_headers<C: ElfClass>(binary: &Binary, sink: &mut OutputSink) {
    if binary.segments.is_empty() {
        return;
    }
    sink.seek(binary.header.program_header_offset as usize);
    for segment in &binary.segments {
        let values = ProgramHeaderValues {
            kind: segment.kind,
            flags: segment.flags.bits(),
            offset: segment.offset,
            vaddr: segment.vaddr,
            paddr: segment.paddr,
            filesz: segment.filesz,
            memsz: segment.memsz,
            align: segment.align,
        };
        sink.write_bytes(bytes_of(&C::make_program_header(sink.endian(), &values)));
    }
}

fn write_section_headers<C: ElfClass>(
    binary: &Binary,
    common: &LayoutCommon,
    sink: &mut OutputSink,
) {
    if binary.sections.is_empty() {
        return;
    }
    sink.seek(binary.header.section_header_offset as usize);
    for section in &binary.sections {
        let values = SectionHeaderValues {
            name: common.shstrtab.offset_of(&section.name).unwrap_or(0) as u32,
            kind: section.kind,
            flags: section.flags,
            addr: section.addr,
            offset: section.offset,
            size: section.size,
            link: section.link,
            info: section.info,
            addralign: section.addralign,
            entsize: section.entsize,
        };
        sink.write_bytes(bytes_of(&C::make_section_header(sink.endian(), &values)));
    }
}

fn write_dynamic_table<C: ElfClass>(binary: &Binary, layout: &ExeLayout, sink: &mut OutputSink) {
    if binary.dynamic_entries.is_empty() {
        return;
    }
    let Some(offset) = binary
        .section_index_by_type(elf::SHT_DYNAMIC)
        .map(|index| binary.sections[index].offset)
        .or_else(|| binary.segment(elf::PT_DYNAMIC).map(|s| s.offset))
    else {
        return;
    };
    sink.seek(offset as usize);
    for entry in &binary.dynamic_entries {
        let value = match entry {
            DynamicEntry::Scalar { value, .. } => *value,
            DynamicEntry::Array { address, .. } => *address,
            DynamicEntry::Needed { name } | DynamicEntry::SharedObject { name } => {
                layout.dynstr.offset_of(name).unwrap_or(0)
            }
            DynamicEntry::RunPath { path, .. } => layout.dynstr.offset_of(path).unwrap_or(0),
        };
        sink.write_bytes(bytes_of(&C::make_dyn(sink.endian(), entry.tag(), value)));
    }
}

fn write_dynamic_symbols<C: ElfClass>(binary: &Binary, layout: &ExeLayout, sink: &mut OutputSink) {
    let Some(offset) = tagged_offset(binary, elf::DT_SYMTAB) else {
        return;
    };
    sink.seek(offset as usize);
    for symbol in &binary.dynamic_symbols {
        let name = layout.dynstr.offset_of(&symbol.name).unwrap_or(0) as u32;
        let sym = C::make_sym(
            sink.endian(),
            name,
            symbol.st_info(),
            symbol.other,
            symbol.section_index,
            symbol.value,
            symbol.size,
        );
        sink.write_bytes(bytes_of(&sym));
    }
}

fn write_dynamic_strings(binary: &Binary, layout: &ExeLayout, sink: &mut OutputSink) {
    if let Some(offset) = tagged_offset(binary, elf::DT_STRTAB) {
        sink.seek(offset as usize);
        sink.write_bytes(layout.dynstr.as_bytes());
    }
}

fn write_hash_tables(binary: &Binary, layout: &ExeLayout, sink: &mut OutputSink) -> Result {
    if let Some(offset) = tagged_offset(binary, elf::DT_HASH) {
        if binary.sysv_hash.is_some() {
            let bytes = hash_table::build_sysv_hash(binary)?;
            sink.seek(offset as usize);
            sink.write_bytes(&bytes);
        }
    }
    if let Some(offset) = tagged_offset(binary, elf::DT_GNU_HASH) {
        if !layout.gnu_hash.is_empty() {
            sink.seek(offset as usize);
            sink.write_bytes(&layout.gnu_hash);
        }
    }
    Ok(())
}

fn write_version_tables(binary: &Binary, layout: &ExeLayout, sink: &mut OutputSink) {
    let e = sink.endian();
    if let Some(offset) = tagged_offset(binary, elf::DT_VERSYM) {
        sink.seek(offset as usize);
        for &version in &binary.versym {
            sink.write_u16(version);
        }
    }

    if let Some(offset) = tagged_offset(binary, elf::DT_VERDEF) {
        sink.seek(offset as usize);
        let definitions = &binary.version_definitions;
        for (index, definition) in definitions.iter().enumerate() {
            let aux_bytes = definition.names.len() * size_of::<elf::Verdaux<Endianness>>();
            let next = if index + 1 == definitions.len() {
                0
            } else {
                (size_of::<elf::Verdef<Endianness>>() + aux_bytes) as u32
            };
            let hash = definition
                .names
                .first()
                .map_or(0, |name| elf::hash(name.as_bytes()));
            let record = elf::Verdef {
                vd_version: U16::new(e, elf::VER_DEF_CURRENT),
                vd_flags: U16::new(e, definition.flags),
                vd_ndx: U16::new(e, definition.index),
                vd_cnt: U16::new(e, definition.names.len() as u16),
                vd_hash: U32::new(e, hash),
                vd_aux: U32::new(e, size_of::<elf::Verdef<Endianness>>() as u32),
                vd_next: U32::new(e, next),
            };
            sink.write_bytes(bytes_of(&record));
            for (position, name) in definition.names.iter().enumerate() {
                let aux_next = if position + 1 == definition.names.len() {
                    0
                } else {
                    size_of::<elf::Verdaux<Endianness>>() as u32
                };
                let aux = elf::Verdaux {
                    vda_name: U32::new(e, layout.dynstr.offset_of(name).unwrap_or(0) as u32),
                    vda_next: U32::new(e, aux_next),
                };
                sink.write_bytes(bytes_of(&aux));
            }
        }
    }

    if let Some(offset) = tagged_offset(binary, elf::DT_VERNEED) {
        sink.seek(offset as usize);
        let requirements = &binary.version_requirements;
        for (index, requirement) in requirements.iter().enumerate() {
            let aux_bytes = requirement.entries.len() * size_of::<elf::Vernaux<Endianness>>();
            let next = if index + 1 == requirements.len() {
                0
            } else {
                (size_of::<elf::Verneed<Endianness>>() + aux_bytes) as u32
            };
            let record = elf::Verneed {
                vn_version: U16::new(e, elf::VER_NEED_CURRENT),
                vn_cnt: U16::new(e, requirement.entries.len() as u16),
                vn_file: U32::new(e, layout.dynstr.offset_of(&requirement.name).unwrap_or(0) as u32),
                vn_aux: U32::new(e, size_of::<elf::Verneed<Endianness>>() as u32),
                vn_next: U32::new(e, next),
            };
            sink.write_bytes(bytes_of(&record));
            for (position, aux) in requirement.entries.iter().enumerate() {
                let aux_next = if position + 1 == requirement.entries.len() {
                    0
                } else {
                    size_of::<elf::Vernaux<Endianness>>() as u32
                };
                let record = elf::Vernaux {
                    vna_hash: U32::new(e, elf::hash(aux.name.as_bytes())),
                    vna_flags: U16::new(e, aux.flags),
                    vna_other: U16::new(e, aux.other),
                    vna_name: U32::new(e, layout.dynstr.offset_of(&aux.name).unwrap_or(0) as u32),
                    vna_next: U32::new(e, aux_next),
                };
                sink.write_bytes(bytes_of(&record));
            }
        }
    }
}

fn write_loadable_relocations<C: ElfClass>(binary: &Binary, sink: &mut OutputSink) {
    let rela = binary.has_dynamic(dt(elf::DT_RELA));
    let offset = if rela {
        tagged_offset(binary, elf::DT_RELA)
    } else {
        tagged_offset(binary, elf::DT_REL)
    };
    if let Some(offset) = offset {
        sink.seek(offset as usize);
        for relocation in &binary.dynamic_relocations {
            write_relocation::<C>(sink, relocation, rela);
        }
    }

    if let Some(offset) = tagged_offset(binary, elf::DT_JMPREL) {
        let plt_rela =
            binary.dynamic_value(dt(elf::DT_PLTREL)) == Some(u64::from(elf::DT_RELA));
        sink.seek(offset as usize);
        for relocation in &binary.plt_relocations {
            write_relocation::<C>(sink, relocation, plt_rela);
        }
    }
}

fn write_relocation<C: ElfClass>(
    sink: &mut OutputSink,
    relocation: &crate::model::Relocation,
    rela: bool,
) {
    if rela {
        let record = C::make_rela(
            sink.endian(),
            relocation.address,
            relocation.symbol,
            relocation.rtype,
            relocation.addend.unwrap_or(0),
        );
        sink.write_bytes(bytes_of(&record));
    } else {
        let record = C::make_rel(
            sink.endian(),
            relocation.address,
            relocation.symbol,
            relocation.rtype,
        );
        sink.write_bytes(bytes_of(&record));
    }
}

fn write_pointer_arrays<C: ElfClass>(binary: &Binary, sink: &mut OutputSink) {
    for tag in [elf::DT_INIT_ARRAY, elf::DT_PREINIT_ARRAY, elf::DT_FINI_ARRAY] {
        let Some(DynamicEntry::Array {
            address, entries, ..
        }) = binary.dynamic_entry(dt(tag))
        else {
            continue;
        };
        let Ok(offset) = binary.virtual_address_to_offset(*address) else {
            continue;
        };
        sink.seek(offset as usize);
        for &entry in entries {
            match C::WORD_SIZE {
                4 => sink.write_u32(entry as u32),
                _ => sink.write_u64(entry),
            }
        }
    }
}

fn write_interpreter(binary: &Binary, sink: &mut OutputSink) {
    if let (Some(interpreter), Some(segment)) =
        (&binary.interpreter, binary.segment(elf::PT_INTERP))
    {
        sink.seek(segment.offset as usize);
        sink.write_cstr(interpreter);
    }
}

fn write_notes(binary: &Binary, layout: &ExeLayout, sink: &mut OutputSink) {
    if binary.notes.is_empty() {
        return;
    }
    if let Some(segment) = binary.segment(elf::PT_NOTE) {
        sink.seek(segment.offset as usize);
        sink.write_bytes(&layout.notes);
    }
}

fn write_static_symbols<C: ElfClass>(
    binary: &Binary,
    common: &LayoutCommon,
    sink: &mut OutputSink,
) {
    let Some(index) = binary.section_index_by_type(elf::SHT_SYMTAB) else {
        return;
    };
    sink.seek(binary.sections[index].offset as usize);
    for symbol in &binary.static_symbols {
        let name = common.static_name_offset(&symbol.name) as u32;
        let sym = C::make_sym(
            sink.endian(),
            name,
            symbol.st_info(),
            symbol.other,
            symbol.section_index,
            symbol.value,
            symbol.size,
        );
        sink.write_bytes(bytes_of(&sym));
    }
}

fn write_string_table_sections(binary: &Binary, common: &LayoutCommon, sink: &mut OutputSink) {
    let shstrndx = binary.header.section_name_table_index as usize;
    if shstrndx != 0 && shstrndx < binary.sections.len() {
        sink.seek(binary.sections[shstrndx].offset as usize);
        sink.write_bytes(common.shstrtab.as_bytes());
    }
    if common.shared || binary.static_symbols.is_empty() {
        return;
    }
    if let Some(symtab) = binary.section_index_by_type(elf::SHT_SYMTAB) {
        let link = binary.sections[symtab].link as usize;
        if link != 0 && link != shstrndx && link < binary.sections.len() {
            sink.seek(binary.sections[link].offset as usize);
            sink.write_bytes(common.strtab_bytes());
        }
    }
}

fn write_section_relocations<C: ElfClass>(binary: &Binary, sink: &mut OutputSink) {
    for section in &binary.sections {
        if section.kind != elf::SHT_REL && section.kind != elf::SHT_RELA {
            continue;
        }
        let target = section.info as usize;
        sink.seek(section.offset as usize);
        for relocation in &binary.section_relocations {
            if relocation.purpose != RelocationPurpose::Section(target) {
                continue;
            }
            write_relocation::<C>(sink, relocation, section.kind == elf::SHT_RELA);
        }
    }
}

fn write_overlay(binary: &Binary, sink: &mut OutputSink) {
    if binary.overlay.is_empty() {
        return;
    }
    let end = sink.len().max(binary.file_end() as usize);
    sink.pad_to(end);
    sink.seek(end);
    sink.write_bytes(&binary.overlay);
}
