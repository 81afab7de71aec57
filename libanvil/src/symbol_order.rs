//! Dynamic symbol ordering. Both hash-table formats assume local symbols come first and that
//! lookups only scan from the first non-local index, so before either table is sized the dynamic
//! symbol list is stably partitioned into three zones: local bindings, then symbols defined in
//! some section, then undefined symbols.

use crate::model::Binary;
use crate::model::Symbol;
use tracing::debug;

const DYNSYM_SECTION_NAME: &str = ".dynsym";

#[derive(Debug, Clone, Copy)]
pub(crate) struct SymbolPartition {
    /// Index of the first symbol with a non-local binding.
    pub(crate) first_non_local: u32,
    /// Index of the first undefined symbol.
    pub(crate) first_undefined: u32,
}

fn zone(symbol: &Symbol) -> u8 {
    if symbol.is_local() {
        0
    } else if symbol.is_undefined() {
        2
    } else {
        1
    }
}

/// Reorders `binary.dynamic_symbols` (and the versym table with it, keeping each symbol's version
/// attached) and reports the zone boundaries. Also maintains the `.dynsym` section's `info`
/// field, which loaders expect to hold the first non-local index.
pub(crate) fn partition_dynamic_symbols(binary: &mut Binary) -> SymbolPartition {
    let count = binary.dynamic_symbols.len();
    let mut order: Vec<usize> = (0..count).collect();
    order.sort_by_key(|&index| zone(&binary.dynamic_symbols[index]));

    apply_permutation(&mut binary.dynamic_symbols, &order);
    if binary.versym.len() == count {
        apply_permutation(&mut binary.versym, &order);
    }

    let first_non_local = binary
        .dynamic_symbols
        .iter()
        .position(|symbol| !symbol.is_local())
        .unwrap_or(count) as u32;
    let first_undefined = binary
        .dynamic_symbols
        .iter()
        .position(|symbol| !symbol.is_local() && symbol.is_undefined())
        .unwrap_or(count) as u32;

    if let Some(index) = binary.section_index_by_name(DYNSYM_SECTION_NAME) {
        let section = &mut binary.sections[index];
        if section.info != first_non_local {
            debug!(
                "info of {} section changes from {} to {}",
                DYNSYM_SECTION_NAME, section.info, first_non_local
            );
            section.info = first_non_local;
        }
    }

    SymbolPartition {
        first_non_local,
        first_undefined,
    }
}

/// Reorders `values` so that element `i` of the result is the old element `order[i]`.
pub(crate) fn apply_permutation<T>(values: &mut Vec<T>, order: &[usize]) {
    debug_assert_eq!(values.len(), order.len());
    let mut reordered = Vec::with_capacity(values.len());
    let mut taken: Vec<Option<T>> = values.drain(..).map(Some).collect();
    for &index in order {
        reordered.push(taken[index].take().expect("permutation must not repeat"));
    }
    *values = reordered;
}
