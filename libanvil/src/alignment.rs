use crate::error::Result;
use anyhow::bail;

/// An alignment. Always a power of two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Alignment {
    pub(crate) exponent: u8,
}

/// Alignment of the new loadable regions (both the read-only and the read-write one).
pub(crate) const LOAD_REGION: Alignment = Alignment { exponent: 12 };

/// Alignment of the PT_INTERP segment.
pub(crate) const INTERP: Alignment = Alignment { exponent: 3 };

/// Alignment of note records and of note alias sections.
pub(crate) const NOTE: Alignment = Alignment { exponent: 2 };

/// Alignment of symbol table entries and of the section header table.
pub(crate) const TABLE_ENTRY: Alignment = Alignment { exponent: 3 };

impl Alignment {
    pub(crate) fn new(raw: u64) -> Result<Self> {
        if !raw.is_power_of_two() {
            bail!("Invalid alignment 0x{raw:x}");
        }
        Ok(Alignment {
            exponent: raw.trailing_zeros() as u8,
        })
    }

    pub(crate) fn value(self) -> u64 {
        1 << self.exponent
    }

    pub(crate) fn mask(self) -> u64 {
        self.value() - 1
    }

    pub(crate) fn align_up(self, value: u64) -> u64 {
        value.next_multiple_of(self.value())
    }

    /// Returns `offset`, adjusted up so that it is >= `align_up(offset)` and congruent with
    /// `ref_offset` modulo the alignment. Loadable segments need file offset and virtual address
    /// to share a modulus.
    pub(crate) fn align_modulo(self, ref_offset: u64, mut offset: u64) -> u64 {
        let mask = self.mask();
        offset = self.align_up(offset);
        if offset & mask == ref_offset & mask {
            return offset;
        }
        let mut adjustment = (ref_offset & mask) + self.value() - (offset & mask);
        if adjustment > self.value() {
            adjustment -= self.value();
        }
        offset + adjustment
    }
}

#[test]
fn test_align_up() {
    assert_eq!(Alignment::new(16).unwrap().align_up(16), 16);
    assert_eq!(Alignment::new(16).unwrap().align_up(15), 16);
    assert_eq!(Alignment::new(16).unwrap().align_up(0), 0);
    assert_eq!(LOAD_REGION.align_up(0x1001), 0x2000);
}

#[test]
fn test_align_modulo() {
    assert_eq!(LOAD_REGION.align_modulo(0x123456, 0x987456), 0x988456);
    assert_eq!(LOAD_REGION.align_modulo(0x123456, 0x987555), 0x988456);
    assert_eq!(LOAD_REGION.align_modulo(0x123456, 0x987000), 0x987456);
}

#[test]
fn test_invalid_alignment() {
    assert!(Alignment::new(24).is_err());
}
