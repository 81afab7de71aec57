//! Word-size abstraction over the on-disk ELF structures. The size and serialize passes are
//! written once, generic over `ElfClass`, and instantiated for `Class32` and `Class64`. The
//! structure definitions come from the `object` crate so the byte layout is exactly what loaders
//! expect.

use object::Endianness;
use object::U16;
use object::U32;
use object::U64;
use object::elf;
use object::pod::Pod;

/// Field values for the ELF file header, independent of word size.
pub(crate) struct FileHeaderValues {
    pub(crate) file_type: u16,
    pub(crate) machine: u16,
    pub(crate) os_abi: u8,
    pub(crate) abi_version: u8,
    pub(crate) entry: u64,
    pub(crate) phoff: u64,
    pub(crate) shoff: u64,
    pub(crate) flags: u32,
    pub(crate) phnum: u16,
    pub(crate) shnum: u16,
    pub(crate) shstrndx: u16,
}

pub(crate) struct SectionHeaderValues {
    pub(crate) name: u32,
    pub(crate) kind: u32,
    pub(crate) flags: u64,
    pub(crate) addr: u64,
    pub(crate) offset: u64,
    pub(crate) size: u64,
    pub(crate) link: u32,
    pub(crate) info: u32,
    pub(crate) addralign: u64,
    pub(crate) entsize: u64,
}

pub(crate) struct ProgramHeaderValues {
    pub(crate) kind: u32,
    pub(crate) flags: u32,
    pub(crate) offset: u64,
    pub(crate) vaddr: u64,
    pub(crate) paddr: u64,
    pub(crate) filesz: u64,
    pub(crate) memsz: u64,
    pub(crate) align: u64,
}

pub(crate) trait ElfClass {
    const CLASS: u8;
    /// Size in bytes of a pointer-width word.
    const WORD_SIZE: usize;

    type FileHeader: Pod;
    type ProgramHeader: Pod;
    type SectionHeader: Pod;
    type Sym: Pod;
    type Dyn: Pod;
    type Rel: Pod;
    type Rela: Pod;

    fn make_file_header(e: Endianness, values: &FileHeaderValues) -> Self::FileHeader;
    fn make_program_header(e: Endianness, values: &ProgramHeaderValues) -> Self::ProgramHeader;
    fn make_section_header(e: Endianness, values: &SectionHeaderValues) -> Self::SectionHeader;
    fn make_sym(
        e: Endianness,
        name: u32,
        info: u8,
        other: u8,
        shndx: u16,
        value: u64,
        size: u64,
    ) -> Self::Sym;
    fn make_dyn(e: Endianness, tag: i64, value: u64) -> Self::Dyn;
    fn make_rel(e: Endianness, offset: u64, sym: u32, rtype: u32) -> Self::Rel;
    fn make_rela(e: Endianness, offset: u64, sym: u32, rtype: u32, addend: i64) -> Self::Rela;
}

fn ident(e: Endianness, class: u8, os_abi: u8, abi_version: u8) -> elf::Ident {
    elf::Ident {
        magic: elf::ELFMAG,
        class,
        data: match e {
            Endianness::Little => elf::ELFDATA2LSB,
            Endianness::Big => elf::ELFDATA2MSB,
        },
        version: elf::EV_CURRENT,
        os_abi,
        abi_version,
        padding: [0; 7],
    }
}

pub(crate) struct Class32;
pub(crate) struct Class64;

impl ElfClass for Class32 {
    const CLASS: u8 = elf::ELFCLASS32;
    const WORD_SIZE: usize = 4;

    type FileHeader = elf::FileHeader32<Endianness>;
    type ProgramHeader = elf::ProgramHeader32<Endianness>;
    type SectionHeader = elf::SectionHeader32<Endianness>;
    type Sym = elf::Sym32<Endianness>;
    type Dyn = elf::Dyn32<Endianness>;
    type Rel = elf::Rel32<Endianness>;
    type Rela = elf::Rela32<Endianness>;

    fn make_file_header(e: Endianness, values: &FileHeaderValues) -> Self::FileHeader {
        elf::FileHeader32 {
            e_ident: ident(e, Self::CLASS, values.os_abi, values.abi_version),
            e_type: U16::new(e, values.file_type),
            e_machine: U16::new(e, values.machine),
            e_version: U32::new(e, u32::from(elf::EV_CURRENT)),
            e_entry: U32::new(e, values.entry as u32),
            e_phoff: U32::new(e, values.phoff as u32),
            e_shoff: U32::new(e, values.shoff as u32),
            e_flags: U32::new(e, values.flags),
            e_ehsize: U16::new(e, size_of::<Self::FileHeader>() as u16),
            e_phentsize: U16::new(e, size_of::<Self::ProgramHeader>() as u16),
            e_phnum: U16::new(e, values.phnum),
            e_shentsize: U16::new(e, size_of::<Self::SectionHeader>() as u16),
            e_shnum: U16::new(e, values.shnum),
            e_shstrndx: U16::new(e, values.shstrndx),
        }
    }

    fn make_program_header(e: Endianness, values: &ProgramHeaderValues) -> Self::ProgramHeader {
        elf::ProgramHeader32 {
            p_type: U32::new(e, values.kind),
            p_offset: U32::new(e, values.offset as u32),
            p_vaddr: U32::new(e, values.vaddr as u32),
            p_paddr: U32::new(e, values.paddr as u32),
            p_filesz: U32::new(e, values.filesz as u32),
            p_memsz: U32::new(e, values.memsz as u32),
            p_flags: U32::new(e, values.flags),
            p_align: U32::new(e, values.align as u32),
        }
    }

    fn make_section_header(e: Endianness, values: &SectionHeaderValues) -> Self::SectionHeader {
        elf::SectionHeader32 {
            sh_name: U32::new(e, values.name),
            sh_type: U32::new(e, values.kind),
            sh_flags: U32::new(e, values.flags as u32),
            sh_addr: U32::new(e, values.addr as u32),
            sh_offset: U32::new(e, values.offset as u32),
            sh_size: U32::new(e, values.size as u32),
            sh_link: U32::new(e, values.link),
            sh_info: U32::new(e, values.info),
            sh_addralign: U32::new(e, values.addralign as u32),
            sh_entsize: U32::new(e, values.entsize as u32),
        }
    }

    fn make_sym(
        e: Endianness,
        name: u32,
        info: u8,
        other: u8,
        shndx: u16,
        value: u64,
        size: u64,
    ) -> Self::Sym {
        elf::Sym32 {
            st_name: U32::new(e, name),
            st_value: U32::new(e, value as u32),
            st_size: U32::new(e, size as u32),
            st_info: info,
            st_other: other,
            st_shndx: U16::new(e, shndx),
        }
    }

    fn make_dyn(e: Endianness, tag: i64, value: u64) -> Self::Dyn {
        elf::Dyn32 {
            d_tag: U32::new(e, tag as u32),
            d_val: U32::new(e, value as u32),
        }
    }

    fn make_rel(e: Endianness, offset: u64, sym: u32, rtype: u32) -> Self::Rel {
        elf::Rel32 {
            r_offset: U32::new(e, offset as u32),
            r_info: U32::new(e, (sym << 8) | (rtype & 0xff)),
        }
    }

    fn make_rela(e: Endianness, offset: u64, sym: u32, rtype: u32, addend: i64) -> Self::Rela {
        elf::Rela32 {
            r_offset: U32::new(e, offset as u32),
            r_info: U32::new(e, (sym << 8) | (rtype & 0xff)),
            r_addend: object::I32::new(e, addend as i32),
        }
    }
}

impl ElfClass for Class64 {
    const CLASS: u8 = elf::ELFCLASS64;
    const WORD_SIZE: usize = 8;

    type FileHeader = elf::FileHeader64<Endianness>;
    type ProgramHeader = elf::ProgramHeader64<Endianness>;
    type SectionHeader = elf::SectionHeader64<Endianness>;
    type Sym = elf::Sym64<Endianness>;
    type Dyn = elf::Dyn64<Endianness>;
    type Rel = elf::Rel64<Endianness>;
    type Rela = elf::Rela64<Endianness>;

    fn make_file_header(e: Endianness, values: &FileHeaderValues) -> Self::FileHeader {
        elf::FileHeader64 {
            e_ident: ident(e, Self::CLASS, values.os_abi, values.abi_version),
            e_type: U16::new(e, values.file_type),
            e_machine: U16::new(e, values.machine),
            e_version: U32::new(e, u32::from(elf::EV_CURRENT)),
            e_entry: U64::new(e, values.entry),
            e_phoff: U64::new(e, values.phoff),
            e_shoff: U64::new(e, values.shoff),
            e_flags: U32::new(e, values.flags),
            e_ehsize: U16::new(e, size_of::<Self::FileHeader>() as u16),
            e_phentsize: U16::new(e, size_of::<Self::ProgramHeader>() as u16),
            e_phnum: U16::new(e, values.phnum),
            e_shentsize: U16::new(e, size_of::<Self::SectionHeader>() as u16),
            e_shnum: U16::new(e, values.shnum),
            e_shstrndx: U16::new(e, values.shstrndx),
        }
    }

    fn make_program_header(e: Endianness, values: &ProgramHeaderValues) -> Self::ProgramHeader {
        elf::ProgramHeader64 {
            p_type: U32::new(e, values.kind),
            p_flags: U32::new(e, values.flags),
            p_offset: U64::new(e, values.offset),
            p_vaddr: U64::new(e, values.vaddr),
            p_paddr: U64::new(e, values.paddr),
            p_filesz: U64::new(e, values.filesz),
            p_memsz: U64::new(e, values.memsz),
            p_align: U64::new(e, values.align),
        }
    }

    fn make_section_header(e: Endianness, values: &SectionHeaderValues) -> Self::SectionHeader {
        elf::SectionHeader64 {
            sh_name: U32::new(e, values.name),
            sh_type: U32::new(e, values.kind),
            sh_flags: U64::new(e, values.flags),
            sh_addr: U64::new(e, values.addr),
            sh_offset: U64::new(e, values.offset),
            sh_size: U64::new(e, values.size),
            sh_link: U32::new(e, values.link),
            sh_info: U32::new(e, values.info),
            sh_addralign: U64::new(e, values.addralign),
            sh_entsize: U64::new(e, values.entsize),
        }
    }

    fn make_sym(
        e: Endianness,
        name: u32,
        info: u8,
        other: u8,
        shndx: u16,
        value: u64,
        size: u64,
    ) -> Self::Sym {
        elf::Sym64 {
            st_name: U32::new(e, name),
            st_info: info,
            st_other: other,
            st_shndx: U16::new(e, shndx),
            st_value: U64::new(e, value),
            st_size: U64::new(e, size),
        }
    }

    fn make_dyn(e: Endianness, tag: i64, value: u64) -> Self::Dyn {
        elf::Dyn64 {
            d_tag: U64::new(e, tag as u64),
            d_val: U64::new(e, value),
        }
    }

    fn make_rel(e: Endianness, offset: u64, sym: u32, rtype: u32) -> Self::Rel {
        elf::Rel64 {
            r_offset: U64::new(e, offset),
            r_info: U64::new(e, (u64::from(sym) << 32) | u64::from(rtype)),
        }
    }

    fn make_rela(e: Endianness, offset: u64, sym: u32, rtype: u32, addend: i64) -> Self::Rela {
        elf::Rela64 {
            r_offset: U64::new(e, offset),
            r_info: U64::new(e, (u64::from(sym) << 32) | u64::from(rtype)),
            r_addend: object::I64::new(e, addend),
        }
    }
}
