use std::{
    convert::TryInto,
    fs,
    io::{self, Read, Seek, Write},
};

use crc::{Crc, CRC_64_XZ};

const CHECKSUM: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

use crate::error::{Error, Result};

/// Read exactly `n` bytes starting at `fpos`, failing with
/// `CorruptLog` (not `Io`) on a short read — a short read here means
/// the file ends before the length prefix promised, which is a format
/// violation rather than a transient I/O failure.
pub(crate) fn read_buffer(fd: &mut fs::File, fpos: u64, n: u64, msg: &str) -> Result<Vec<u8>> {
    fd.seek(io::SeekFrom::Start(fpos))?;
    let mut buf = vec![0u8; n.try_into().unwrap()];
    let got = fd.read(&mut buf)?;
    if got as u64 == n {
        Ok(buf)
    } else {
        Err(Error::CorruptLog(format!(
            "{}: short read at {}, wanted {} got {}",
            msg, fpos, n, got
        )))
    }
}

/// Append a length-prefixed blob at the current end of file and return
/// the offset of the length prefix. `fd` must already be positioned (or
/// opened in append mode) at end-of-file.
pub(crate) fn append_blob(fd: &mut fs::File, bytes: &[u8]) -> Result<u64> {
    let fpos = fd.seek(io::SeekFrom::End(0))?;
    let mut header = [0u8; 8];
    header.copy_from_slice(&(bytes.len() as u64).to_le_bytes());
    fd.write_all(&header)?;
    fd.write_all(bytes)?;
    Ok(fpos)
}

/// Read the length-prefixed blob whose prefix starts at `address`.
pub(crate) fn read_blob(fd: &mut fs::File, address: u64, file_len: u64) -> Result<Vec<u8>> {
    if address.checked_add(8).map_or(true, |end| end > file_len) {
        return Err(Error::CorruptLog(format!(
            "length prefix at {} runs past end of file ({})",
            address, file_len
        )));
    }
    let header = read_buffer(fd, address, 8, "blob length prefix")?;
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&header);
    let length = u64::from_le_bytes(arr);
    let payload_start = address + 8;
    if payload_start.checked_add(length).map_or(true, |end| end > file_len) {
        return Err(Error::CorruptLog(format!(
            "blob at {} claims length {}, runs past end of file ({})",
            address, length, file_len
        )));
    }
    read_buffer(fd, payload_start, length, "blob payload")
}

/// Non-cryptographic checksum used by the superblock slots.
pub(crate) fn checksum64(fields: &[u64]) -> u64 {
    let mut digest = CHECKSUM.digest();
    for field in fields {
        digest.update(&field.to_le_bytes());
    }
    digest.finalize()
}

#[cfg(test)]
#[path = "util_test.rs"]
mod util_test;
