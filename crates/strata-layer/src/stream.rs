//! Logical stream storage: chunk a byte stream under a path key.
//!
//! A stream is identified by its logical path, not a filesystem inode;
//! the index keeps the ordered digest list that reconstructs it. This is
//! the direct write path next to the archive pipeline, and what the
//! dedup invariants are stated against.

use crate::{read_full, Result};
use std::io::Read;
use strata_cas::{ChunkStore, CHUNK_SIZE};
use strata_index::{ChunkIndex, ChunkMeta};
use tracing::debug;

/// Chunk `reader` into fixed windows, store each chunk once, and record
/// the stream under `path`. Returns the ordered chunk list.
pub fn write_stream<R: Read>(
    store: &ChunkStore,
    index: &ChunkIndex,
    path: &str,
    mut reader: R,
) -> Result<Vec<ChunkMeta>> {
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut chunks = Vec::new();

    loop {
        let n = read_full(&mut reader, &mut buffer)?;
        if n == 0 {
            break;
        }
        let window = &buffer[..n];
        let digest = strata_cas::digest_bytes(window);

        if !store.exists(&digest) {
            store.put(&digest, window, false)?;
        }
        chunks.push(ChunkMeta {
            digest,
            size: n as u64,
        });

        if n < CHUNK_SIZE {
            break;
        }
    }

    index.index_file(path, &chunks)?;
    debug!(path, chunks = chunks.len(), "stream written");
    Ok(chunks)
}

/// Reassemble a stream from its recorded chunk sequence.
pub fn read_stream(store: &ChunkStore, index: &ChunkIndex, path: &str) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    for digest in index.file_chunks(path)? {
        data.extend(store.read_verified(&digest)?);
    }
    Ok(data)
}
