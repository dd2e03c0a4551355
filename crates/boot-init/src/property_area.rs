//! The shared system property area the guest's C library maps at startup.
//!
//! Layout (native endian, 32-bit words):
//!
//! ```text
//! 0    bytes_used   bytes of `data` handed out, starting with the root node
//! 4    serial       bumped by writers
//! 8    magic        "PROP"
//! 12   version
//! 16   reserved[28]
//! 128  data         property trie, root node first
//! ```
//!
//! A fresh area holds only the empty root node of the trie.

use std::fs::{OpenOptions, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;

/// Size of the area file.
pub const AREA_SIZE: u64 = 128 * 1024;
pub const AREA_MAGIC: u32 = 0x504f_5250;
pub const AREA_VERSION: u32 = 0xfc6e_d0ab;
/// Header bytes before the trie data.
pub const HEADER_SIZE: usize = 4 * 4 + 28 * 4;
/// Root trie node: name length plus the prop, left, right and children
/// offsets, with an empty name.
pub const ROOT_NODE_SIZE: u32 = 5 * 4;

const AREA_MODE: u32 = 0o444;

/// Header plus empty root node, the initialized prefix of a fresh area.
pub fn initial_contents() -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + ROOT_NODE_SIZE as usize);
    for word in [ROOT_NODE_SIZE, 0, AREA_MAGIC, AREA_VERSION] {
        buf.extend_from_slice(&word.to_ne_bytes());
    }
    buf.resize(HEADER_SIZE + ROOT_NODE_SIZE as usize, 0);
    buf
}

/// Creates the area at `path`: sized to [`AREA_SIZE`], header and empty
/// root node written, the rest zero.
pub fn initialize(path: &Path) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(AREA_MODE)
        .open(path)?;
    file.set_len(AREA_SIZE)?;
    file.write_all(&initial_contents())?;
    file.set_permissions(Permissions::from_mode(AREA_MODE))
}
