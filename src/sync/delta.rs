//! Block-level retransfer for large files.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{IoContext, SyncResult};
use crate::sync::checksum::{read_full, BlockChecksum, ChecksumCalculator};

/// What a patch actually wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatchOutcome {
    pub blocks_rewritten: usize,
    pub bytes_written: u64,
}

/// Bring `dest` in line with `source` by rewriting only the blocks whose
/// digests differ. The destination is resized to the source length first.
pub fn patch_file(
    calculator: &ChecksumCalculator,
    source: &Path,
    dest: &Path,
    block_size: u64,
) -> SyncResult<PatchOutcome> {
    let source_blocks = calculator.block_checksums(source, block_size)?;
    let dest_blocks = calculator.block_checksums(dest, block_size)?;
    apply_blocks(source, dest, &source_blocks, &dest_blocks)
}

pub(crate) fn apply_blocks(
    source: &Path,
    dest: &Path,
    source_blocks: &BlockChecksum,
    dest_blocks: &BlockChecksum,
) -> SyncResult<PatchOutcome> {
    let differing = source_blocks.differing_blocks(dest_blocks);

    let mut out = OpenOptions::new()
        .write(true)
        .open(dest)
        .with_path("opening", dest)?;
    out.set_len(source_blocks.file_len)
        .with_path("resizing", dest)?;

    if differing.is_empty() {
        return Ok(PatchOutcome::default());
    }

    let mut input = File::open(source).with_path("opening", source)?;
    let mut buffer = vec![0u8; source_blocks.block_size as usize];
    let mut outcome = PatchOutcome::default();

    for index in differing {
        let range = source_blocks.block_range(index);
        let len = (range.end - range.start) as usize;

        input
            .seek(SeekFrom::Start(range.start))
            .with_path("seeking", source)?;
        let n = read_full(&mut input, &mut buffer[..len]).with_path("reading", source)?;

        out.seek(SeekFrom::Start(range.start))
            .with_path("seeking", dest)?;
        out.write_all(&buffer[..n]).with_path("writing", dest)?;

        outcome.blocks_rewritten += 1;
        outcome.bytes_written += n as u64;
    }

    out.flush().with_path("flushing", dest)?;
    Ok(outcome)
}
