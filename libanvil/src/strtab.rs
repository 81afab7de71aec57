//! Packed string table construction. Rebuilding a string table tries to keep it small two ways:
//! exact duplicates map to the existing offset, and a name that is a trailing suffix of an
//! already-emitted name points inside the earlier bytes instead of being written again (the
//! classic `printf` inside `vfprintf` trick). Strings are considered in caller order and the
//! first writer owns its byte range.

use std::collections::HashMap;

pub(crate) struct StringTable {
    bytes: Vec<u8>,
    offsets: HashMap<String, u64>,
}

impl StringTable {
    /// A string table always begins with a NUL byte so that offset 0 is the empty string.
    pub(crate) fn new() -> Self {
        let mut offsets = HashMap::new();
        offsets.insert(String::new(), 0);
        Self {
            bytes: vec![0],
            offsets,
        }
    }

    /// Returns the offset of `name`, inserting it if necessary.
    pub(crate) fn insert(&mut self, name: &str) -> u64 {
        if let Some(&offset) = self.offsets.get(name) {
            return offset;
        }
        let offset = match find_terminated(&self.bytes, name.as_bytes()) {
            Some(existing) => existing as u64,
            None => {
                let offset = self.bytes.len() as u64;
                self.bytes.extend_from_slice(name.as_bytes());
                self.bytes.push(0);
                offset
            }
        };
        self.offsets.insert(name.to_owned(), offset);
        offset
    }

    pub(crate) fn insert_all<'a>(&mut self, names: impl IntoIterator<Item = &'a str>) {
        for name in names {
            self.insert(name);
        }
    }

    pub(crate) fn offset_of(&self, name: &str) -> Option<u64> {
        self.offsets.get(name).copied()
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub(crate) fn len(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Finds `needle` immediately followed by a NUL terminator inside `haystack`.
fn find_terminated(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    let window = needle.len() + 1;
    haystack
        .windows(window)
        .position(|candidate| &candidate[..needle.len()] == needle && candidate[needle.len()] == 0)
}
