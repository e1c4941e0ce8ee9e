// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Block-diff codec for sparse snapshot files.
//!
//! A sparse file stores only the blocks of a source that differ from a base.
//! The base is either another file (the image root filesystem, for disks) or
//! implicit zeros (for guest memory). Layout, little-endian:
//!
//! ```text
//! magic "SVSPARSE" | total_len u64 | block_size u32 | base u8
//! { block_index u64 | block bytes }*
//! ```
//!
//! Every block record carries `min(block_size, total_len - offset)` bytes.
//! All functions are blocking and meant to run on a blocking thread.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

const MAGIC: &[u8; 8] = b"SVSPARSE";
pub const BLOCK_SIZE: u32 = 4096;

const BASE_ZERO: u8 = 0;
const BASE_FILE: u8 = 1;

/// What the sparse file is a diff against.
#[derive(Debug, Clone, Copy)]
pub enum Base<'a> {
    Zeros,
    File(&'a Path),
}

/// Summary of an encode pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeStats {
    pub total_len: u64,
    pub blocks_total: u64,
    pub blocks_stored: u64,
}

fn invalid(reason: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, reason.into())
}

/// Read up to `buf.len()` bytes, stopping only at EOF.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// Encode `src` as a diff against `base`, writing to `dst`.
pub fn encode(src: &Path, base: Base<'_>, dst: &Path) -> io::Result<EncodeStats> {
    let total_len = std::fs::metadata(src)?.len();
    let mut reader = BufReader::new(File::open(src)?);
    let mut base_reader = match base {
        Base::Zeros => None,
        Base::File(path) => Some(BufReader::new(File::open(path)?)),
    };
    let mut out = BufWriter::new(File::create(dst)?);

    out.write_all(MAGIC)?;
    out.write_all(&total_len.to_le_bytes())?;
    out.write_all(&BLOCK_SIZE.to_le_bytes())?;
    out.write_all(&[if base_reader.is_some() { BASE_FILE } else { BASE_ZERO }])?;

    let mut block = vec![0u8; BLOCK_SIZE as usize];
    let mut base_block = vec![0u8; BLOCK_SIZE as usize];
    let mut stats = EncodeStats {
        total_len,
        blocks_total: 0,
        blocks_stored: 0,
    };

    let mut index = 0u64;
    loop {
        let n = read_full(&mut reader, &mut block)?;
        if n == 0 {
            break;
        }

        // A short or missing base block reads as zeros past its end.
        base_block[..n].fill(0);
        if let Some(base_reader) = base_reader.as_mut() {
            read_full(base_reader, &mut base_block[..n])?;
        }

        stats.blocks_total += 1;
        if block[..n] != base_block[..n] {
            out.write_all(&index.to_le_bytes())?;
            out.write_all(&block[..n])?;
            stats.blocks_stored += 1;
        }

        index += 1;
        if n < block.len() {
            break;
        }
    }

    out.flush()?;
    out.get_ref().sync_all()?;
    Ok(stats)
}

/// Reconstruct the full file described by `sparse` into `dst`.
pub fn decode(sparse: &Path, base: Base<'_>, dst: &Path) -> io::Result<u64> {
    let mut reader = BufReader::new(File::open(sparse)?);

    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(invalid("bad sparse file magic"));
    }

    let mut u64_buf = [0u8; 8];
    let mut u32_buf = [0u8; 4];
    let mut u8_buf = [0u8; 1];

    reader.read_exact(&mut u64_buf)?;
    let total_len = u64::from_le_bytes(u64_buf);
    reader.read_exact(&mut u32_buf)?;
    let block_size = u32::from_le_bytes(u32_buf) as u64;
    reader.read_exact(&mut u8_buf)?;
    let base_kind = u8_buf[0];

    if block_size == 0 {
        return Err(invalid("zero block size"));
    }

    match (base_kind, base) {
        (BASE_ZERO, _) => {
            File::create(dst)?;
        }
        (BASE_FILE, Base::File(path)) => {
            std::fs::copy(path, dst)?;
        }
        (BASE_FILE, Base::Zeros) => return Err(invalid("sparse file requires a base file")),
        (other, _) => return Err(invalid(format!("unknown base kind {}", other))),
    }

    let mut out = OpenOptions::new().write(true).open(dst)?;
    out.set_len(total_len)?;

    let mut block = vec![0u8; block_size as usize];
    loop {
        match reader.read_exact(&mut u64_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
        let offset = u64::from_le_bytes(u64_buf)
            .checked_mul(block_size)
            .filter(|offset| *offset < total_len)
            .ok_or_else(|| invalid("block index out of range"))?;

        let len = block_size.min(total_len - offset) as usize;
        reader
            .read_exact(&mut block[..len])
            .map_err(|_| invalid("truncated block record"))?;

        out.seek(SeekFrom::Start(offset))?;
        out.write_all(&block[..len])?;
    }

    out.sync_all()?;
    Ok(total_len)
}
