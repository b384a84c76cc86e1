//! block-parallel gzip
//!
//! input is cut into fixed-size blocks and every block is compressed into
//! its own gzip member. a batch of blocks is compressed at once and the
//! members are written in input order, so the output is a valid multi-member
//! gzip stream that any conforming decoder reads back in full.

use std::io::{self, Read, Write};

use flate2::write::GzEncoder;
use rayon::prelude::*;

/// compress everything from `input` into `output`, returning bytes consumed
pub fn compress_blocks<R: Read, W: Write>(
    input: &mut R,
    output: &mut W,
    block_size: usize,
    concurrency: usize,
    level: flate2::Compression,
) -> io::Result<u64> {
    let block_size = block_size.max(1);
    let concurrency = concurrency.max(1);
    let mut total = 0u64;

    loop {
        let mut batch = Vec::with_capacity(concurrency);
        let mut exhausted = false;
        while batch.len() < concurrency {
            let block = read_block(input, block_size)?;
            if block.len() < block_size {
                exhausted = true;
            }
            if !block.is_empty() {
                total += block.len() as u64;
                batch.push(block);
            }
            if exhausted {
                break;
            }
        }

        let members = batch
            .par_iter()
            .map(|block| gzip_member(block, level))
            .collect::<io::Result<Vec<_>>>()?;
        for member in &members {
            output.write_all(member)?;
        }

        if exhausted {
            break;
        }
    }

    if total == 0 {
        // an empty input still yields a valid gzip stream
        output.write_all(&gzip_member(&[], level)?)?;
    }
    output.flush()?;
    Ok(total)
}

/// fill a buffer of up to `size` bytes, short only at EOF
fn read_block<R: Read>(input: &mut R, size: usize) -> io::Result<Vec<u8>> {
    let mut block = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        match input.read(&mut block[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    block.truncate(filled);
    Ok(block)
}

fn gzip_member(block: &[u8], level: flate2::Compression) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(block.len() / 2 + 64), level);
    encoder.write_all(block)?;
    encoder.finish()
}
