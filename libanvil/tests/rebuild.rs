//! End-to-end rebuild scenarios over hand-built models: a dynamically linked image whose
//! structures grow and move, pointer-array retargeting, and the relocatable-object append path.

use libanvil::BuildError;
use libanvil::Builder;
use libanvil::Config;
use libanvil::model::Binary;
use libanvil::model::Class;
use libanvil::model::DynamicEntry;
use libanvil::model::GnuHashParams;
use libanvil::model::Header;
use libanvil::model::Note;
use libanvil::model::Relocation;
use libanvil::model::RelocationPurpose;
use libanvil::model::Section;
use libanvil::model::Segment;
use libanvil::model::SegmentFlags;
use libanvil::model::Symbol;
use object::Endianness;
use object::elf;

fn dt(tag: u32) -> i64 {
    i64::from(tag)
}

/// Makes relocation-pass tracing visible under `--nocapture` with `RUST_LOG` set.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn local(name: &str) -> Symbol {
    Symbol {
        binding: elf::STB_LOCAL,
        ..Symbol::new(name)
    }
}

fn defined(name: &str) -> Symbol {
    Symbol {
        section_index: 2,
        ..Symbol::new(name)
    }
}

/// A minimal self-consistent shared object: one RX load segment, dynamic symbols
/// ["", "init", "malloc"], a GNU hash table and a section-name table. Every on-disk size matches
/// the rebuilt size, so a plain build moves nothing.
fn shared_object() -> Binary {
    init_tracing();
    let mut binary = Binary::new(Header::new(
        Class::Elf64,
        Endianness::Little,
        elf::ET_DYN,
        elf::EM_X86_64,
    ));
    binary.header.entry = 0x100;
    binary.header.section_header_offset = 0xf40;
    binary.header.program_header_offset = 0x40;
    binary.header.section_name_table_index = 5;

    let mut phdr = Segment::new(elf::PT_PHDR);
    phdr.offset = 0x40;
    phdr.vaddr = 0x40;
    phdr.paddr = 0x40;
    phdr.filesz = 3 * 56;
    phdr.memsz = 3 * 56;
    phdr.flags = SegmentFlags::R;
    binary.segments.push(phdr);

    let mut load = Segment::new(elf::PT_LOAD);
    load.flags = SegmentFlags::R | SegmentFlags::X;
    load.filesz = 0x1000;
    load.memsz = 0x1000;
    load.align = 0x1000;
    binary.segments.push(load);

    let mut dynamic = Segment::new(elf::PT_DYNAMIC);
    dynamic.offset = 0xe00;
    dynamic.vaddr = 0xe00;
    dynamic.paddr = 0xe00;
    dynamic.filesz = 96;
    dynamic.memsz = 96;
    dynamic.flags = SegmentFlags::R;
    binary.segments.push(dynamic);

    binary.sections.push(Section::new("", elf::SHT_NULL));

    let mut gnu_hash = Section::new(".gnu.hash", elf::SHT_GNU_HASH);
    gnu_hash.addr = 0x200;
    gnu_hash.offset = 0x200;
    // 4 header words + 1 bloom word + 2 buckets + 2 hashed symbols.
    gnu_hash.size = 40;
    gnu_hash.original_size = 40;
    gnu_hash.flags = u64::from(elf::SHF_ALLOC);
    binary.sections.push(gnu_hash);

    let mut dynsym = Section::new(".dynsym", elf::SHT_DYNSYM);
    dynsym.addr = 0x300;
    dynsym.offset = 0x300;
    dynsym.size = 72;
    dynsym.original_size = 72;
    dynsym.link = 3;
    dynsym.entsize = 24;
    dynsym.flags = u64::from(elf::SHF_ALLOC);
    binary.sections.push(dynsym);

    let mut dynstr = Section::new(".dynstr", elf::SHT_STRTAB);
    dynstr.addr = 0x400;
    dynstr.offset = 0x400;
    // NUL + "init\0" + "malloc\0".
    dynstr.size = 13;
    dynstr.original_size = 13;
    dynstr.flags = u64::from(elf::SHF_ALLOC);
    binary.sections.push(dynstr);

    let mut dynamic_section = Section::new(".dynamic", elf::SHT_DYNAMIC);
    dynamic_section.addr = 0xe00;
    dynamic_section.offset = 0xe00;
    dynamic_section.size = 96;
    dynamic_section.original_size = 96;
    dynamic_section.link = 3;
    dynamic_section.entsize = 16;
    binary.sections.push(dynamic_section);

    let mut shstrtab = Section::new(".shstrtab", elf::SHT_STRTAB);
    shstrtab.offset = 0xf00;
    // "" + ".gnu.hash" + ".dynsym" + ".dynstr" + ".dynamic" + ".shstrtab".
    shstrtab.size = 46;
    shstrtab.original_size = 46;
    binary.sections.push(shstrtab);

    binary.dynamic_entries = vec![
        DynamicEntry::Scalar {
            tag: dt(elf::DT_GNU_HASH),
            value: 0x200,
        },
        DynamicEntry::Scalar {
            tag: dt(elf::DT_SYMTAB),
            value: 0x300,
        },
        DynamicEntry::Scalar {
            tag: dt(elf::DT_SYMENT),
            value: 24,
        },
        DynamicEntry::Scalar {
            tag: dt(elf::DT_STRTAB),
            value: 0x400,
        },
        DynamicEntry::Scalar {
            tag: dt(elf::DT_STRSZ),
            value: 13,
        },
        DynamicEntry::Scalar {
            tag: dt(elf::DT_NULL),
            value: 0,
        },
    ];

    binary.dynamic_symbols = vec![local(""), defined("init"), Symbol::new("malloc")];
    binary.gnu_hash = Some(GnuHashParams {
        bucket_count: 2,
        bloom_count: 1,
        bloom_shift: 6,
        symbol_base: 1,
    });
    binary
}

/// Translates a virtual address of a built model to its file offset via the load segments.
fn to_offset(binary: &Binary, addr: u64) -> usize {
    binary
        .segments
        .iter()
        .find(|s| s.is_load() && addr >= s.vaddr && addr < s.vaddr + s.memsz)
        .map(|s| (addr - s.vaddr + s.offset) as usize)
        .expect("address must be mapped")
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

fn force_build(binary: &mut Binary) -> Vec<u8> {
    let mut builder = Builder::new(binary);
    builder.set_config(Config {
        force_relocations: true,
    });
    builder.build().unwrap();
    builder.get_build().unwrap().to_vec()
}

#[test]
fn forced_round_trip_reorders_symbols_and_rebuilds_the_hash() {
    let mut binary = shared_object();
    let bytes = force_build(&mut binary);

    let names: Vec<&str> = binary
        .dynamic_symbols
        .iter()
        .map(|s| s.name.as_str())
        .collect();
    assert_eq!(names, ["", "init", "malloc"]);

    let gnu = to_offset(&binary, binary.dynamic_value(dt(elf::DT_GNU_HASH)).unwrap());
    assert!(gnu >= 0x1000, "forced build must move the table");
    assert_eq!(read_u32(&bytes, gnu), 2, "bucket count is input-derived");
    assert_eq!(read_u32(&bytes, gnu + 4), 1, "symndx is the first non-local");
}

#[test]
fn partition_orders_local_defined_undefined() {
    let mut binary = shared_object();
    binary.dynamic_symbols = vec![
        local(""),
        Symbol::new("puts"),
        defined("setup"),
        Symbol::new("abort"),
        local("internal"),
        defined("teardown"),
    ];
    // Keep the degenerate hash table: the real one re-sorts the non-local
    // range by bucket, which is exercised separately.
    binary.gnu_hash = None;
    force_build(&mut binary);

    let zone = |s: &Symbol| {
        if s.binding == elf::STB_LOCAL {
            0
        } else if s.section_index != elf::SHN_UNDEF {
            1
        } else {
            2
        }
    };
    let zones: Vec<u8> = binary.dynamic_symbols.iter().map(zone).collect();
    let mut sorted = zones.clone();
    sorted.sort_unstable();
    assert_eq!(zones, sorted, "zones must be contiguous and ordered");
    assert_eq!(zones, [0, 0, 1, 1, 2, 2]);
}

#[test]
fn relocated_structures_pack_gap_free() {
    let mut binary = shared_object();
    force_build(&mut binary);

    let symtab = binary.dynamic_value(dt(elf::DT_SYMTAB)).unwrap();
    let strtab = binary.dynamic_value(dt(elf::DT_STRTAB)).unwrap();
    let strsz = binary.dynamic_value(dt(elf::DT_STRSZ)).unwrap();
    let gnu = binary.dynamic_value(dt(elf::DT_GNU_HASH)).unwrap();

    // Region order with a running cursor: dynsym, dynstr, gnu hash.
    assert_eq!(symtab + 72, strtab);
    assert_eq!(strtab + strsz, gnu);

    // The region itself is mapped by exactly one of the fresh segments.
    let region = binary
        .segments
        .iter()
        .filter(|s| s.is_load())
        .find(|s| symtab >= s.vaddr && symtab < s.vaddr + s.memsz)
        .unwrap();
    assert_eq!(region.vaddr % 0x1000, 0);
    assert_eq!(region.vaddr + region.memsz, gnu + 40);
}

#[test]
fn identical_builds_are_byte_identical() {
    let build = |force: bool| {
        let mut binary = shared_object();
        let mut builder = Builder::new(&mut binary);
        builder.set_config(Config {
            force_relocations: force,
        });
        builder.build().unwrap();
        builder.get_build().unwrap().to_vec()
    };
    assert_eq!(build(false), build(false));
    assert_eq!(build(true), build(true));
}

#[test]
fn walking_the_rebuilt_hash_chains_finds_every_symbol() {
    let mut binary = shared_object();
    binary
        .dynamic_symbols
        .splice(2..2, [defined("calloc"), defined("realloc"), defined("free")]);
    let bytes = force_build(&mut binary);

    let gnu = to_offset(&binary, binary.dynamic_value(dt(elf::DT_GNU_HASH)).unwrap());
    let bucket_count = read_u32(&bytes, gnu);
    let symndx = read_u32(&bytes, gnu + 4) as usize;
    let bloom_count = read_u32(&bytes, gnu + 8) as usize;
    let buckets = gnu + 16 + bloom_count * 8;
    let chains = buckets + bucket_count as usize * 4;

    assert_eq!(symndx, 1);
    for (expected, symbol) in binary.dynamic_symbols.iter().enumerate().skip(symndx) {
        let hash = elf::gnu_hash(symbol.name.as_bytes());
        let bucket = (hash % bucket_count) as usize;
        let mut index = read_u32(&bytes, buckets + bucket * 4) as usize;
        assert_ne!(index, 0, "empty bucket for {}", symbol.name);
        loop {
            let entry = read_u32(&bytes, chains + (index - symndx) * 4);
            if index == expected {
                assert_eq!(entry & !1, hash & !1);
                break;
            }
            assert_eq!(entry & 1, 0, "chain ended before {}", symbol.name);
            index += 1;
        }
    }
}

#[test]
fn appending_a_long_name_grows_dynstr_by_name_plus_nul() {
    let mut binary = shared_object();
    let long_name = "x".repeat(200);
    binary.dynamic_symbols.push(Symbol::new(&long_name));

    let mut builder = Builder::new(&mut binary);
    builder.build().unwrap();
    let bytes = builder.get_build().unwrap().to_vec();

    let strsz = binary.dynamic_value(dt(elf::DT_STRSZ)).unwrap();
    assert_eq!(strsz, 13 + 201);
    let strtab = to_offset(&binary, binary.dynamic_value(dt(elf::DT_STRTAB)).unwrap());
    assert_eq!(bytes[strtab], 0, "string tables start with a NUL byte");
    let written = &bytes[strtab..strtab + strsz as usize];
    assert!(
        written
            .windows(long_name.len())
            .any(|window| window == long_name.as_bytes())
    );
}

#[test]
fn moved_initializer_array_retargets_its_relocations() {
    let mut binary = shared_object();
    binary.dynamic_entries.insert(
        5,
        DynamicEntry::Array {
            tag: dt(elf::DT_INIT_ARRAY),
            address: 0x500,
            entries: vec![0x111, 0x222, 0x333, 0x444],
        },
    );
    binary.dynamic_entries.insert(
        6,
        DynamicEntry::Scalar {
            tag: dt(elf::DT_INIT_ARRAYSZ),
            value: 0, // stale, forces the array to move
        },
    );
    binary.dynamic_relocations.push(Relocation {
        address: 0x500 + 2 * 8,
        rtype: elf::R_X86_64_RELATIVE,
        symbol: 0,
        addend: Some(0x333),
        purpose: RelocationPurpose::Dynamic,
    });

    let mut builder = Builder::new(&mut binary);
    builder.build().unwrap();
    builder.get_build().unwrap();

    let base = binary.dynamic_value(dt(elf::DT_INIT_ARRAY)).unwrap();
    assert!(base >= 0x1000, "the array must have moved");
    assert_eq!(binary.dynamic_value(dt(elf::DT_INIT_ARRAYSZ)).unwrap(), 32);
    assert_eq!(binary.dynamic_relocations[0].address, base + 2 * 8);
}

#[test]
fn added_notes_gain_a_segment_and_land_in_the_output() {
    let mut binary = shared_object();
    let payload: Vec<u8> = (0..20).collect();
    binary.notes.push(Note {
        name: "GNU".to_owned(),
        kind: elf::NT_GNU_BUILD_ID,
        description: payload.clone(),
    });

    let bytes = {
        let mut builder = Builder::new(&mut binary);
        builder.build().unwrap();
        builder.get_build().unwrap().to_vec()
    };

    let segment = binary.segment(elf::PT_NOTE).expect("a note segment");
    let offset = segment.offset as usize;
    assert_eq!(read_u32(&bytes, offset + 8), elf::NT_GNU_BUILD_ID);
    assert_eq!(&bytes[offset + 12..offset + 16], b"GNU\0");
    assert_eq!(&bytes[offset + 16..offset + 36], payload.as_slice());
    assert!(
        binary.section_index_by_name(".note.gnu.build-id").is_some(),
        "the note record gains an alias section"
    );
}

#[test]
fn dynamic_strings_are_written_without_a_symbol_table() {
    init_tracing();
    let mut binary = Binary::new(Header::new(
        Class::Elf64,
        Endianness::Little,
        elf::ET_DYN,
        elf::EM_X86_64,
    ));
    binary.header.program_header_offset = 0x40;
    binary.header.section_header_offset = 0xf40;
    binary.header.section_name_table_index = 3;

    let mut load = Segment::new(elf::PT_LOAD);
    load.flags = SegmentFlags::R;
    load.filesz = 0x1000;
    load.memsz = 0x1000;
    load.align = 0x1000;
    binary.segments.push(load);
    let mut dynamic = Segment::new(elf::PT_DYNAMIC);
    dynamic.offset = 0xe00;
    dynamic.vaddr = 0xe00;
    dynamic.paddr = 0xe00;
    dynamic.filesz = 64;
    dynamic.memsz = 64;
    dynamic.flags = SegmentFlags::R;
    binary.segments.push(dynamic);

    binary.sections.push(Section::new("", elf::SHT_NULL));
    let mut dynstr = Section::new(".dynstr", elf::SHT_STRTAB);
    dynstr.addr = 0x200;
    dynstr.offset = 0x200;
    // NUL + "libm.so.6\0".
    dynstr.size = 11;
    dynstr.original_size = 11;
    dynstr.flags = u64::from(elf::SHF_ALLOC);
    binary.sections.push(dynstr);
    let mut dynamic_section = Section::new(".dynamic", elf::SHT_DYNAMIC);
    dynamic_section.addr = 0xe00;
    dynamic_section.offset = 0xe00;
    dynamic_section.size = 64;
    dynamic_section.original_size = 64;
    dynamic_section.entsize = 16;
    binary.sections.push(dynamic_section);
    let mut shstrtab = Section::new(".shstrtab", elf::SHT_STRTAB);
    shstrtab.offset = 0xf00;
    // "" + ".dynstr" + ".dynamic" + ".shstrtab".
    shstrtab.size = 28;
    shstrtab.original_size = 28;
    binary.sections.push(shstrtab);

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
            value: 11,
        },
        DynamicEntry::Scalar {
            tag: dt(elf::DT_NULL),
            value: 0,
        },
    ];

    let bytes = {
        let mut builder = Builder::new(&mut binary);
        builder.build().unwrap();
        builder.get_build().unwrap().to_vec()
    };
    assert_eq!(&bytes[0x200..0x20b], b"\0libm.so.6\0");
}

fn relocatable_object() -> Binary {
    init_tracing();
    let mut binary = Binary::new(Header::new(
        Class::Elf64,
        Endianness::Little,
        elf::ET_REL,
        elf::EM_X86_64,
    ));
    binary.header.section_header_offset = 0x190;
    binary.header.section_name_table_index = 3;

    binary.sections.push(Section::new("", elf::SHT_NULL));

    let mut text = Section::new(".text", elf::SHT_PROGBITS);
    text.offset = 0x40;
    text.size = 0x100;
    text.original_size = 0x100;
    binary.sections.push(text);

    let mut rela = Section::new(".rela.text", elf::SHT_RELA);
    rela.offset = 0x140;
    rela.size = 48;
    rela.original_size = 48;
    rela.link = 0;
    rela.info = 1;
    rela.entsize = 24;
    binary.sections.push(rela);

    let mut shstrtab = Section::new(".shstrtab", elf::SHT_STRTAB);
    shstrtab.offset = 0x170;
    // "" + ".text" + ".rela.text" + ".shstrtab".
    shstrtab.size = 28;
    shstrtab.original_size = 28;
    binary.sections.push(shstrtab);

    for slot in 0..2u64 {
        binary.section_relocations.push(Relocation {
            address: slot * 8,
            rtype: elf::R_X86_64_64,
            symbol: 1,
            addend: Some(0),
            purpose: RelocationPurpose::Section(1),
        });
    }
    binary
}

#[test]
fn shrunk_relocation_section_shifts_the_header_table_by_the_inserted_bytes() {
    let mut binary = relocatable_object();
    binary.section_relocations.pop();

    let mut builder = Builder::new(&mut binary);
    builder.build().unwrap();
    let bytes = builder.get_build().unwrap().to_vec();

    // One 24-byte record is appended at the placed extent (0x170 + 28 = 0x18c).
    assert_eq!(binary.sections[2].offset, 0x18c);
    assert_eq!(binary.sections[2].size, 24);
    assert_eq!(binary.header.section_header_offset, 0x190 + 24);
    assert_eq!(binary.holes.inserted_ranges().to_vec(), vec![(0x18c, 24)]);

    // No segment structures for relocatable objects: e_phoff and e_phnum are zero.
    assert_eq!(u64::from_le_bytes(bytes[32..40].try_into().unwrap()), 0);
    assert_eq!(u16::from_le_bytes(bytes[56..58].try_into().unwrap()), 0);
    // e_shoff reflects the shift.
    assert_eq!(
        u64::from_le_bytes(bytes[40..48].try_into().unwrap()),
        0x190 + 24
    );
}

#[test]
fn unchanged_relocatable_object_is_stable() {
    let mut binary = relocatable_object();
    let mut builder = Builder::new(&mut binary);
    builder.build().unwrap();
    builder.get_build().unwrap();

    assert_eq!(binary.sections[2].offset, 0x140);
    assert_eq!(binary.header.section_header_offset, 0x190);
    assert!(binary.holes.inserted_ranges().is_empty());
}

#[test]
fn version_tables_without_dynamic_symbols_are_rejected() {
    let mut binary = shared_object();
    binary.dynamic_symbols.clear();
    binary.versym = vec![0, 1, 1];

    let mut builder = Builder::new(&mut binary);
    let error = builder.build().unwrap_err();
    assert!(matches!(
        error.downcast_ref::<BuildError>(),
        Some(BuildError::NotFound(_))
    ));
}
