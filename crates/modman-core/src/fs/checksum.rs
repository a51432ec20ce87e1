//! Content checksums for bundle archives
//!
//! Every node must compute the same digest for the same bytes, so the
//! format is fixed:
//! - Algorithm: blake3 over the full byte stream
//! - Input read in fixed 8 KiB chunks, never buffered whole
//! - Output: lower-case hex string (64 chars)

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use anyhow::Context;

/// Read size used while hashing.
pub const CHUNK_SIZE: usize = 8 * 1024;

/// Compute the checksum of a file.
///
/// # Example
/// ```no_run
/// use modman_core::fs::checksum::checksum_file;
/// use std::path::Path;
///
/// let digest = checksum_file(Path::new("/var/lib/modman/runtime/bundle1/bundle.jar"))?;
/// assert_eq!(digest.len(), 64);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn checksum_file(path: &Path) -> anyhow::Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to open file: {}", path.display()))?;
    checksum_reader(&mut file).with_context(|| format!("Failed to read file: {}", path.display()))
}

/// Compute the checksum of everything `reader` yields.
pub fn checksum_reader(reader: &mut dyn Read) -> io::Result<String> {
    copy_with_checksum(reader, &mut io::sink()).map(|(digest, _)| digest)
}

/// Copy `reader` into `writer` chunk by chunk, hashing on the way.
/// Returns the digest and the number of bytes copied.
pub fn copy_with_checksum(reader: &mut dyn Read, writer: &mut dyn Write) -> io::Result<(String, u64)> {
    let mut hasher = blake3::Hasher::new();
    let mut buf = [0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let read = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        hasher.update(&buf[..read]);
        writer.write_all(&buf[..read])?;
        total += read as u64;
    }
    writer.flush()?;
    Ok((hasher.finalize().to_hex().to_string(), total))
}
