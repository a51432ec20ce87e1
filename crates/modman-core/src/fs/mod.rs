//! Filesystem primitives shared across features.

pub mod checksum;

pub use checksum::{CHUNK_SIZE, checksum_file, checksum_reader, copy_with_checksum};
