//! The mutable object graph the builder consumes. Entities are created by a parser or directly by
//! callers; the builder only mutates offsets/addresses and inserts the segments and sections it
//! needs to hold relocated structures.
//!
//! Section and segment contents live in a single owned arena and are referred to by `ContentId`
//! indices, so adding or removing entities during relocation can never dangle.

use crate::alignment;
use crate::error::BuildError;
use crate::error::Result;
use bitflags::bitflags;
use object::Endianness;
use object::elf;

/// The file's word size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
    Elf32,
    Elf64,
}

impl Class {
    pub fn word_size(self) -> u64 {
        match self {
            Class::Elf32 => 4,
            Class::Elf64 => 8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Header {
    pub class: Class,
    pub endianness: Endianness,
    /// One of `object::elf::ET_*`.
    pub file_type: u16,
    pub machine: u16,
    pub os_abi: u8,
    pub abi_version: u8,
    pub entry: u64,
    pub flags: u32,
    pub program_header_offset: u64,
    pub section_header_offset: u64,
    /// Index of the section-name string table in `sections`.
    pub section_name_table_index: u16,
}

impl Header {
    pub fn new(class: Class, endianness: Endianness, file_type: u16, machine: u16) -> Self {
        Self {
            class,
            endianness,
            file_type,
            machine,
            os_abi: 0,
            abi_version: 0,
            entry: 0,
            flags: 0,
            program_header_offset: 0,
            section_header_offset: 0,
            section_name_table_index: 0,
        }
    }
}

/// Handle into the content arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentId(usize);

#[derive(Debug, Default)]
pub struct ContentArena {
    chunks: Vec<Vec<u8>>,
}

impl ContentArena {
    pub fn alloc(&mut self, bytes: Vec<u8>) -> ContentId {
        self.chunks.push(bytes);
        ContentId(self.chunks.len() - 1)
    }

    pub fn alloc_zeroed(&mut self, size: usize) -> ContentId {
        self.alloc(vec![0; size])
    }

    pub fn get(&self, id: ContentId) -> &[u8] {
        &self.chunks[id.0]
    }

    pub fn get_mut(&mut self, id: ContentId) -> &mut Vec<u8> {
        &mut self.chunks[id.0]
    }
}

#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    /// One of `object::elf::SHT_*`.
    pub kind: u32,
    pub flags: u64,
    pub addr: u64,
    pub offset: u64,
    pub size: u64,
    pub link: u32,
    pub info: u32,
    pub addralign: u64,
    pub entsize: u64,
    pub content: Option<ContentId>,
    /// Size the section had on disk when the model was created. The size pass compares freshly
    /// computed sizes against this to decide what must move.
    pub original_size: u64,
}

impl Section {
    pub fn new(name: impl Into<String>, kind: u32) -> Self {
        Self {
            name: name.into(),
            kind,
            flags: 0,
            addr: 0,
            offset: 0,
            size: 0,
            link: 0,
            info: 0,
            addralign: 1,
            entsize: 0,
            content: None,
            original_size: 0,
        }
    }

    pub fn is_nobits(&self) -> bool {
        self.kind == elf::SHT_NOBITS
    }

    /// NOBITS and NULL sections occupy no file bytes.
    pub(crate) fn occupies_file_space(&self) -> bool {
        self.kind != elf::SHT_NOBITS && self.kind != elf::SHT_NULL
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentFlags: u32 {
        const X = elf::PF_X;
        const W = elf::PF_W;
        const R = elf::PF_R;
    }
}

#[derive(Debug, Clone)]
pub struct Segment {
    /// One of `object::elf::PT_*`.
    pub kind: u32,
    pub flags: SegmentFlags,
    pub offset: u64,
    pub vaddr: u64,
    pub paddr: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub align: u64,
    pub content: Option<ContentId>,
}

impl Segment {
    pub fn new(kind: u32) -> Self {
        Self {
            kind,
            flags: SegmentFlags::empty(),
            offset: 0,
            vaddr: 0,
            paddr: 0,
            filesz: 0,
            memsz: 0,
            align: 0,
            content: None,
        }
    }

    pub fn is_load(&self) -> bool {
        self.kind == elf::PT_LOAD
    }
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    /// One of `object::elf::STB_*`.
    pub binding: u8,
    /// One of `object::elf::STT_*`.
    pub kind: u8,
    /// Raw `st_other` byte (visibility).
    pub other: u8,
    /// Raw `st_shndx`; `SHN_UNDEF` for undefined symbols.
    pub section_index: u16,
    pub value: u64,
    pub size: u64,
}

impl Symbol {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            binding: elf::STB_GLOBAL,
            kind: elf::STT_NOTYPE,
            other: 0,
            section_index: elf::SHN_UNDEF,
            value: 0,
            size: 0,
        }
    }

    pub fn is_local(&self) -> bool {
        self.binding == elf::STB_LOCAL
    }

    pub fn is_undefined(&self) -> bool {
        self.section_index == elf::SHN_UNDEF
    }

    pub(crate) fn st_info(&self) -> u8 {
        (self.binding << 4) | (self.kind & 0xf)
    }
}

/// An entry of the dynamic table. String-valued entries carry the name itself; the value written
/// to disk is the name's offset in the rebuilt dynamic string table.
#[derive(Debug, Clone)]
pub enum DynamicEntry {
    Scalar {
        tag: i64,
        value: u64,
    },
    /// `DT_INIT_ARRAY` / `DT_FINI_ARRAY` / `DT_PREINIT_ARRAY`: the address of a pointer array
    /// plus the array's elements.
    Array {
        tag: i64,
        address: u64,
        entries: Vec<u64>,
    },
    /// `DT_NEEDED`.
    Needed { name: String },
    /// `DT_SONAME`.
    SharedObject { name: String },
    /// `DT_RPATH` or `DT_RUNPATH`.
    RunPath { tag: i64, path: String },
}

impl DynamicEntry {
    pub fn tag(&self) -> i64 {
        match self {
            DynamicEntry::Scalar { tag, .. } => *tag,
            DynamicEntry::Array { tag, .. } => *tag,
            DynamicEntry::Needed { .. } => i64::from(elf::DT_NEEDED),
            DynamicEntry::SharedObject { .. } => i64::from(elf::DT_SONAME),
            DynamicEntry::RunPath { tag, .. } => *tag,
        }
    }

    /// The scalar value, for entries that have one independent of the string table.
    pub fn value(&self) -> Option<u64> {
        match self {
            DynamicEntry::Scalar { value, .. } => Some(*value),
            DynamicEntry::Array { address, .. } => Some(*address),
            _ => None,
        }
    }
}

/// What a relocation belongs to. Loadable images carry dynamic and PLT relocations; relocatable
/// objects carry per-section relocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationPurpose {
    Dynamic,
    PltGot,
    /// Applies to the section with this index; serialized into that section's `SHT_REL(A)`
    /// companion.
    Section(usize),
}

#[derive(Debug, Clone)]
pub struct Relocation {
    pub address: u64,
    pub rtype: u32,
    pub symbol: u32,
    /// `Some` for RELA-style relocations.
    pub addend: Option<i64>,
    pub purpose: RelocationPurpose,
}

#[derive(Debug, Clone)]
pub struct Note {
    pub name: String,
    /// Raw note type (`object::elf::NT_*` for well-known ones).
    pub kind: u32,
    pub description: Vec<u8>,
}

impl Note {
    /// On-disk size of the packed record: three u32 header words, NUL-terminated name padded to
    /// 4 bytes, description handled in 4-byte chunks with the final partial chunk zero-padded.
    pub fn record_size(&self) -> u64 {
        let name_size = alignment::NOTE.align_up(self.name.len() as u64 + 1);
        let desc_size = alignment::NOTE.align_up(self.description.len() as u64);
        12 + name_size + desc_size
    }
}

#[derive(Debug, Clone)]
pub struct VersionDefinition {
    pub flags: u16,
    /// The versym index this definition defines.
    pub index: u16,
    /// First name is the version itself; the rest are parents.
    pub names: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct VersionRequirementAux {
    pub name: String,
    pub flags: u16,
    /// The versym index this requirement occupies.
    pub other: u16,
}

#[derive(Debug, Clone)]
pub struct VersionRequirement {
    /// Name of the library file the versions are required from.
    pub name: String,
    pub entries: Vec<VersionRequirementAux>,
}

/// Parameters of the pre-existing `.gnu.hash` table. Everything except `symbol_base` is reused
/// as-is when the table is rebuilt; `symbol_base` is re-derived from the fresh partition.
#[derive(Debug, Clone, Copy)]
pub struct GnuHashParams {
    pub bucket_count: u32,
    pub bloom_count: u32,
    pub bloom_shift: u32,
    pub symbol_base: u32,
}

/// Parameters of the pre-existing `.hash` table.
#[derive(Debug, Clone, Copy)]
pub struct SysvHashParams {
    pub bucket_count: u32,
    pub chain_count: u32,
}

/// Tracks byte ranges inserted into the single growing buffer of a relocatable object. The
/// builder only reports insertions; consumers that keep their own offsets into the file use the
/// record to shift them.
#[derive(Debug, Default)]
pub struct HoleTracker {
    inserted: Vec<(u64, u64)>,
}

impl HoleTracker {
    pub fn insert(&mut self, offset: u64, size: u64) {
        self.inserted.push((offset, size));
    }

    pub fn inserted_ranges(&self) -> &[(u64, u64)] {
        &self.inserted
    }
}

#[derive(Debug)]
pub struct Binary {
    pub header: Header,
    pub sections: Vec<Section>,
    pub segments: Vec<Segment>,
    pub dynamic_entries: Vec<DynamicEntry>,
    pub dynamic_symbols: Vec<Symbol>,
    pub static_symbols: Vec<Symbol>,
    pub dynamic_relocations: Vec<Relocation>,
    pub plt_relocations: Vec<Relocation>,
    /// Relocations of a relocatable object, each tied to a target section.
    pub section_relocations: Vec<Relocation>,
    /// One entry per dynamic symbol when the file uses symbol versioning, else empty.
    pub versym: Vec<u16>,
    pub version_definitions: Vec<VersionDefinition>,
    pub version_requirements: Vec<VersionRequirement>,
    pub notes: Vec<Note>,
    pub interpreter: Option<String>,
    pub gnu_hash: Option<GnuHashParams>,
    pub sysv_hash: Option<SysvHashParams>,
    pub arena: ContentArena,
    /// Unmapped bytes past every section and segment in the original file, copied verbatim to
    /// the output tail.
    pub overlay: Vec<u8>,
    pub holes: HoleTracker,
}

impl Binary {
    pub fn new(header: Header) -> Self {
        Self {
            header,
            sections: Vec::new(),
            segments: Vec::new(),
            dynamic_entries: Vec::new(),
            dynamic_symbols: Vec::new(),
            static_symbols: Vec::new(),
            dynamic_relocations: Vec::new(),
            plt_relocations: Vec::new(),
            section_relocations: Vec::new(),
            versym: Vec::new(),
            version_definitions: Vec::new(),
            version_requirements: Vec::new(),
            notes: Vec::new(),
            interpreter: None,
            gnu_hash: None,
            sysv_hash: None,
            arena: ContentArena::default(),
            overlay: Vec::new(),
            holes: HoleTracker::default(),
        }
    }

    pub fn dynamic_entry(&self, tag: i64) -> Option<&DynamicEntry> {
        self.dynamic_entries.iter().find(|entry| entry.tag() == tag)
    }

    pub fn dynamic_entry_mut(&mut self, tag: i64) -> Option<&mut DynamicEntry> {
        self.dynamic_entries
            .iter_mut()
            .find(|entry| entry.tag() == tag)
    }

    pub fn has_dynamic(&self, tag: i64) -> bool {
        self.dynamic_entry(tag).is_some()
    }

    pub fn dynamic_value(&self, tag: i64) -> Option<u64> {
        self.dynamic_entry(tag).and_then(DynamicEntry::value)
    }

    /// Patches the value of a scalar or array dynamic entry.
    pub(crate) fn set_dynamic_value(&mut self, tag: i64, new_value: u64) -> Result {
        match self.dynamic_entry_mut(tag) {
            Some(DynamicEntry::Scalar { value, .. }) => {
                *value = new_value;
                Ok(())
            }
            Some(DynamicEntry::Array { address, .. }) => {
                *address = new_value;
                Ok(())
            }
            _ => Err(BuildError::NotFound(format!("dynamic tag {tag:#x}")).into()),
        }
    }

    pub fn section_index_by_name(&self, name: &str) -> Option<usize> {
        self.sections.iter().position(|section| section.name == name)
    }

    pub fn section_index_by_type(&self, kind: u32) -> Option<usize> {
        self.sections.iter().position(|section| section.kind == kind)
    }

    /// Finds the section whose mapped range contains `addr`.
    pub(crate) fn section_index_from_virtual_address(&self, addr: u64) -> Result<usize> {
        self.sections
            .iter()
            .position(|section| {
                section.addr != 0 && addr >= section.addr && addr < section.addr + section.size
            })
            .ok_or_else(|| BuildError::NotFound(format!("section at address {addr:#x}")).into())
    }

    pub fn segment(&self, kind: u32) -> Option<&Segment> {
        self.segments.iter().find(|segment| segment.kind == kind)
    }

    pub fn segment_mut(&mut self, kind: u32) -> Option<&mut Segment> {
        self.segments.iter_mut().find(|segment| segment.kind == kind)
    }

    pub fn has_segment(&self, kind: u32) -> bool {
        self.segment(kind).is_some()
    }

    /// Translates a virtual address to a file offset via the loadable segment that maps it.
    pub(crate) fn virtual_address_to_offset(&self, addr: u64) -> Result<u64> {
        self.segments
            .iter()
            .find(|segment| {
                segment.is_load() && addr >= segment.vaddr && addr < segment.vaddr + segment.memsz
            })
            .map(|segment| addr - segment.vaddr + segment.offset)
            .ok_or_else(|| {
                BuildError::NotFound(format!("loadable segment mapping {addr:#x}")).into()
            })
    }

    /// End of the occupied file range: past every segment and every section that has file bytes.
    pub(crate) fn file_end(&self) -> u64 {
        let segments_end = self
            .segments
            .iter()
            .map(|segment| segment.offset + segment.filesz)
            .max()
            .unwrap_or(0);
        let sections_end = self
            .sections
            .iter()
            .filter(|section| section.occupies_file_space())
            .map(|section| section.offset + section.size)
            .max()
            .unwrap_or(0);
        segments_end.max(sections_end)
    }

    /// End of the mapped virtual address space.
    pub(crate) fn virtual_end(&self) -> u64 {
        self.segments
            .iter()
            .filter(|segment| segment.is_load())
            .map(|segment| segment.vaddr + segment.memsz)
            .max()
            .unwrap_or(0)
    }

    /// Appends a fresh PT_LOAD segment of `size` zeroed bytes past both the mapped address space
    /// and the file, keeping offset and address congruent modulo the alignment. Returns the new
    /// segment's index.
    pub(crate) fn add_load_segment(
        &mut self,
        flags: SegmentFlags,
        size: u64,
        align: crate::alignment::Alignment,
    ) -> usize {
        let vaddr = align.align_up(self.virtual_end());
        let offset = align.align_modulo(vaddr, self.file_end());
        let content = self.arena.alloc_zeroed(size as usize);
        self.segments.push(Segment {
            kind: elf::PT_LOAD,
            flags,
            offset,
            vaddr,
            paddr: vaddr,
            filesz: size,
            memsz: size,
            align: align.value(),
            content: Some(content),
        });
        self.segments.len() - 1
    }

    /// Appends an unloaded section (no address); its file offset is assigned by the relocation
    /// pass. Returns the new section's index.
    pub(crate) fn add_section(&mut self, section: Section) -> usize {
        self.sections.push(section);
        self.sections.len() - 1
    }

    /// Removes a section and fixes every stored index that pointed past it: section links,
    /// REL/RELA `info` fields, symbol section indices and the header's name-table index.
    pub(crate) fn remove_section(&mut self, index: usize) {
        self.sections.remove(index);
        let fix = |value: u32| {
            if value as usize > index {
                value - 1
            } else {
                value
            }
        };
        for section in &mut self.sections {
            section.link = fix(section.link);
            if section.kind == elf::SHT_REL || section.kind == elf::SHT_RELA {
                section.info = fix(section.info);
            }
        }
        for symbol in self.static_symbols.iter_mut().chain(&mut self.dynamic_symbols) {
            if symbol.section_index != elf::SHN_UNDEF
                && symbol.section_index < elf::SHN_LORESERVE
                && symbol.section_index as usize > index
            {
                symbol.section_index -= 1;
            }
        }
        if self.header.section_name_table_index as usize > index {
            self.header.section_name_table_index -= 1;
        }
    }
}
