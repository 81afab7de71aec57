//! The two symbol lookup tables. Both are derived entirely from the current dynamic symbol order;
//! neither is ever hand-edited. The SysV table is a plain chained hash; the GNU table combines a
//! bloom pre-filter with bucketed hash chains and requires the symbols in `[symndx, end)` to be
//! physically sorted by bucket.
//!
//! The hash functions are the reference ones loaders replicate (`object::elf::hash` and
//! `object::elf::gnu_hash`), so they match bit-for-bit.

use crate::error::BuildError;
use crate::error::Result;
use crate::model::Binary;
use crate::model::Class;
use crate::sink::OutputSink;
use crate::symbol_order;
use object::elf;
use tracing::debug;
use tracing::warn;

/// Chain count of the SysV table after widening (loaders require at least one chain entry per
/// symbol). The original count is kept when it is already large enough: it is input-derived
/// state, not re-derived.
pub(crate) fn sysv_chain_count(binary: &Binary) -> Result<u32> {
    let params = binary
        .sysv_hash
        .ok_or_else(|| BuildError::NotFound(".hash parameters".to_owned()))?;
    let symbol_count = binary.dynamic_symbols.len() as u32;
    if params.chain_count < symbol_count {
        warn!(
            "nchain of .hash section changes from {} to {}",
            params.chain_count, symbol_count
        );
        return Ok(symbol_count);
    }
    Ok(params.chain_count)
}

/// Byte size of the rebuilt SysV table: two header words plus buckets plus chains.
pub(crate) fn sysv_hash_size(binary: &Binary) -> Result<u64> {
    let params = binary
        .sysv_hash
        .ok_or_else(|| BuildError::NotFound(".hash parameters".to_owned()))?;
    Ok(u64::from(params.bucket_count + sysv_chain_count(binary)? + 2) * 4)
}

/// Serializes the SysV chained hash table from the current symbol order.
pub(crate) fn build_sysv_hash(binary: &Binary) -> Result<Vec<u8>> {
    let params = binary
        .sysv_hash
        .ok_or_else(|| BuildError::NotFound(".hash parameters".to_owned()))?;
    let bucket_count = params.bucket_count as usize;
    if bucket_count == 0 {
        return Err(BuildError::Corrupted(".hash bucket count is zero".to_owned()).into());
    }
    let chain_count = sysv_chain_count(binary)? as usize;

    let mut buckets = vec![0u32; bucket_count];
    let mut chains = vec![0u32; chain_count];

    // Index 0 is the reserved null symbol; it never participates in lookups.
    for (index, symbol) in binary.dynamic_symbols.iter().enumerate().skip(1) {
        let bucket = (elf::hash(symbol.name.as_bytes()) as usize) % bucket_count;
        if buckets[bucket] == 0 {
            buckets[bucket] = index as u32;
        } else {
            let mut cursor = buckets[bucket] as usize;
            while chains[cursor] != 0 {
                cursor = chains[cursor] as usize;
            }
            chains[cursor] = index as u32;
        }
    }

    let mut sink = OutputSink::with_capacity(
        binary.header.endianness,
        (2 + bucket_count + chain_count) * 4,
    );
    sink.write_u32(bucket_count as u32);
    sink.write_u32(chain_count as u32);
    for value in buckets.iter().chain(&chains) {
        sink.write_u32(*value);
    }
    Ok(sink.into_bytes())
}

/// Byte size of the rebuilt GNU table for the given partition origin.
pub(crate) fn gnu_hash_size(binary: &Binary, symndx: u32) -> Result<u64> {
    let params = binary
        .gnu_hash
        .ok_or_else(|| BuildError::NotFound(".gnu.hash parameters".to_owned()))?;
    let hashed = binary.dynamic_symbols.len() as u64 - u64::from(symndx);
    Ok(16
        + u64::from(params.bloom_count) * binary.header.class.word_size()
        + u64::from(params.bucket_count) * 4
        + hashed * 4)
}

/// Builds the GNU hash table. Sorts `binary.dynamic_symbols[symndx..]` (and versym with it) by
/// bucket as a side effect; the table's bucket walk depends on that physical order.
pub(crate) fn build_gnu_hash(binary: &mut Binary, symndx: u32) -> Result<Vec<u8>> {
    let params = binary
        .gnu_hash
        .ok_or_else(|| BuildError::NotFound(".gnu.hash parameters".to_owned()))?;
    let bucket_count = params.bucket_count;
    let bloom_count = params.bloom_count;
    let shift = params.bloom_shift;
    if bucket_count == 0 || bloom_count == 0 {
        return Err(
            BuildError::Corrupted(".gnu.hash bucket or bloom count is zero".to_owned()).into(),
        );
    }

    debug!(
        "gnu hash: buckets={:#x} symndx={:#x} maskwords={:#x} shift={:#x}",
        bucket_count, symndx, bloom_count, shift
    );

    let origin = symndx as usize;
    let count = binary.dynamic_symbols.len();

    // Mandatory: lookups walk a bucket's chain as a contiguous symbol range.
    let mut order: Vec<usize> = (origin..count).collect();
    order.sort_by_key(|&index| {
        elf::gnu_hash(binary.dynamic_symbols[index].name.as_bytes()) % bucket_count
    });
    let mut tail: Vec<_> = binary.dynamic_symbols.drain(origin..).collect();
    let shifted: Vec<usize> = order.iter().map(|&index| index - origin).collect();
    symbol_order::apply_permutation(&mut tail, &shifted);
    binary.dynamic_symbols.extend(tail);
    if binary.versym.len() == count {
        let mut tail: Vec<_> = binary.versym.drain(origin..).collect();
        symbol_order::apply_permutation(&mut tail, &shifted);
        binary.versym.extend(tail);
    }

    let hashes: Vec<u32> = binary.dynamic_symbols[origin..]
        .iter()
        .map(|symbol| elf::gnu_hash(symbol.name.as_bytes()))
        .collect();

    // Bloom filter: two bits per symbol, word width matching the file class.
    let word_bits = binary.header.class.word_size() as u32 * 8;
    let mut bloom = vec![0u64; bloom_count as usize];
    for &hash in &hashes {
        let position = ((hash / word_bits) % bloom_count) as usize;
        let bits = (1u64 << (hash % word_bits)) | (1u64 << ((hash >> shift) % word_bits));
        bloom[position] |= bits;
    }

    let mut buckets = vec![0u32; bucket_count as usize];
    let mut chain = vec![0u32; hashes.len()];
    let mut previous_bucket: Option<u32> = None;
    for (position, &hash) in hashes.iter().enumerate() {
        let bucket = hash % bucket_count;
        if let Some(previous) = previous_bucket {
            if bucket < previous {
                return Err(BuildError::Corrupted(format!(
                    "previous bucket is greater than the current one ({bucket} < {previous})"
                ))
                .into());
            }
            if bucket != previous && position > 0 {
                // End of the previous chain.
                chain[position - 1] |= 1;
            }
        }
        if previous_bucket != Some(bucket) {
            buckets[bucket as usize] = origin as u32 + position as u32;
            previous_bucket = Some(bucket);
        }
        chain[position] = hash & !1;
    }
    if let Some(last) = chain.last_mut() {
        *last |= 1;
    }

    let mut sink = OutputSink::new(binary.header.endianness);
    sink.write_u32(bucket_count);
    sink.write_u32(symndx);
    sink.write_u32(bloom_count);
    sink.write_u32(shift);
    for &word in &bloom {
        match binary.header.class {
            Class::Elf32 => sink.write_u32(word as u32),
            Class::Elf64 => sink.write_u64(word),
        }
    }
    for value in buckets.iter().chain(&chain) {
        sink.write_u32(*value);
    }
    Ok(sink.into_bytes())
}

/// A degenerate GNU table that makes every lookup miss: one empty bucket, one zero mask word.
/// Padded with zeroes to the section's existing size so nothing else has to move.
pub(crate) fn build_empty_gnu_hash(binary: &Binary, section_size: u64) -> Vec<u8> {
    let mut sink = OutputSink::new(binary.header.endianness);
    sink.write_u32(1); // bucket count
    sink.write_u32(1); // symndx, 0 is reserved
    sink.write_u32(1); // mask words
    sink.write_u32(0); // shift
    sink.pad_to(section_size as usize);
    sink.into_bytes()
}
