//! Persistent lease storage.
//!
//! Leases are flat fixed-size records: 8 bytes little-endian start time
//! (Unix seconds), 8 bytes little-endian hardware address, 4 bytes
//! little-endian IPv4 address. The record width is part of the file
//! format; a partial trailing record is treated as end of file and a
//! record with a zero start time is a deleted slot.

use std::fs;
use std::io;
use std::path::Path;

use crate::addr::{HwAddr, Ipv4};
use crate::pool::Lease;

pub const RECORD_LEN: usize = 20;

fn read_i64(bytes: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    i64::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

/// Reads every lease record from `path`.
///
/// A missing file is an empty lease set, not an error.
pub fn load(path: &Path) -> io::Result<Vec<Lease>> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };

    let mut leases = Vec::new();
    for record in data.chunks_exact(RECORD_LEN) {
        let lease = Lease {
            start_time: read_i64(&record[0..8]),
            hw: HwAddr(read_u64(&record[8..16])),
            ip: Ipv4(read_u32(&record[16..20])),
        };
        if lease.is_valid() {
            leases.push(lease);
        }
    }

    Ok(leases)
}

/// Rewrites `path` with the given lease set.
pub fn save(path: &Path, leases: &[Lease]) -> io::Result<()> {
    let mut data = Vec::with_capacity(leases.len() * RECORD_LEN);
    for lease in leases {
        data.extend_from_slice(&lease.start_time.to_le_bytes());
        data.extend_from_slice(&lease.hw.0.to_le_bytes());
        data.extend_from_slice(&lease.ip.0.to_le_bytes());
    }
    fs::write(path, data)
}
