//! PKZIP records: local entries, central directory and end-of-directory, with
//! the ZIP64 extensions needed for large members.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{NpzError, NpzResult};

const LOCAL_SIG: u32 = 0x0403_4b50;
const CENTRAL_SIG: u32 = 0x0201_4b50;
const EOCD_SIG: u32 = 0x0605_4b50;
const ZIP64_EOCD_SIG: u32 = 0x0606_4b50;
const ZIP64_LOCATOR_SIG: u32 = 0x0706_4b50;
const ZIP64_EXTRA_ID: u16 = 0x0001;

const LOCAL_HEADER_LEN: u64 = 30;
const CENTRAL_HEADER_LEN: u64 = 46;
const EOCD_LEN: usize = 22;
const ZIP64_EOCD_LEN: u64 = 56;
const ZIP64_LOCATOR_LEN: usize = 20;

const VERSION_DEFAULT: u16 = 20;
const VERSION_ZIP64: u16 = 45;
const FLAG_ENCRYPTED: u16 = 1;
const FLAG_UTF8: u16 = 1 << 11;
/// 1980-01-01 00:00:00 in MS-DOS format.
const DOS_DATE: u16 = 0x0021;
const DOS_TIME: u16 = 0;
/// `-rw-------` in the high half, as written by Python's zipfile.
const EXTERNAL_ATTR: u32 = 0o600 << 16;

const U32_MAX: u64 = u32::MAX as u64;

/// One member ready to be written: compressed bytes plus the metadata the
/// directory needs.
#[derive(Debug, Clone)]
pub(crate) struct EncodedEntry {
    pub name: String,
    pub method: u16,
    pub crc: u32,
    pub uncompressed_size: u64,
    pub data: Vec<u8>,
}

/// A central-directory record, offsets already corrected for any content
/// that precedes the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DirectoryEntry {
    pub name: String,
    pub method: u16,
    pub flags: u16,
    pub crc: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub local_offset: u64,
}

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

fn name_flags(name: &str) -> u16 {
    if name.is_ascii() { 0 } else { FLAG_UTF8 }
}

fn clamp32(v: u64) -> u32 {
    v.min(U32_MAX) as u32
}

/// Assemble a complete archive from entries in the order given.
pub(crate) fn write_archive(entries: &[EncodedEntry]) -> NpzResult<Vec<u8>> {
    let mut out = Vec::with_capacity(
        entries
            .iter()
            .map(|e| e.data.len() + 2 * e.name.len() + 128)
            .sum::<usize>()
            + 128,
    );
    let mut offsets = Vec::with_capacity(entries.len());

    for entry in entries {
        let name_len = u16::try_from(entry.name.len()).map_err(|_| NpzError::MalformedMemberName {
            name: entry.name.clone(),
            reason: "name is longer than 65535 bytes".into(),
        })?;
        let offset = out.len() as u64;
        offsets.push(offset);
        let compressed_size = entry.data.len() as u64;
        let zip64 = compressed_size >= U32_MAX || entry.uncompressed_size >= U32_MAX;

        out.write_u32::<LittleEndian>(LOCAL_SIG)?;
        out.write_u16::<LittleEndian>(if zip64 { VERSION_ZIP64 } else { VERSION_DEFAULT })?;
        out.write_u16::<LittleEndian>(name_flags(&entry.name))?;
        out.write_u16::<LittleEndian>(entry.method)?;
        out.write_u16::<LittleEndian>(DOS_TIME)?;
        out.write_u16::<LittleEndian>(DOS_DATE)?;
        out.write_u32::<LittleEndian>(entry.crc)?;
        if zip64 {
            out.write_u32::<LittleEndian>(u32::MAX)?;
            out.write_u32::<LittleEndian>(u32::MAX)?;
        } else {
            out.write_u32::<LittleEndian>(compressed_size as u32)?;
            out.write_u32::<LittleEndian>(entry.uncompressed_size as u32)?;
        }
        out.write_u16::<LittleEndian>(name_len)?;
        out.write_u16::<LittleEndian>(if zip64 { 20 } else { 0 })?;
        out.extend_from_slice(entry.name.as_bytes());
        if zip64 {
            out.write_u16::<LittleEndian>(ZIP64_EXTRA_ID)?;
            out.write_u16::<LittleEndian>(16)?;
            out.write_u64::<LittleEndian>(entry.uncompressed_size)?;
            out.write_u64::<LittleEndian>(compressed_size)?;
        }
        out.extend_from_slice(&entry.data);
    }

    let cd_offset = out.len() as u64;
    for (entry, &offset) in entries.iter().zip(&offsets) {
        let compressed_size = entry.data.len() as u64;
        let mut extra = Vec::new();
        if entry.uncompressed_size >= U32_MAX {
            extra.write_u64::<LittleEndian>(entry.uncompressed_size)?;
        }
        if compressed_size >= U32_MAX {
            extra.write_u64::<LittleEndian>(compressed_size)?;
        }
        if offset >= U32_MAX {
            extra.write_u64::<LittleEndian>(offset)?;
        }
        let version = if extra.is_empty() { VERSION_DEFAULT } else { VERSION_ZIP64 };

        out.write_u32::<LittleEndian>(CENTRAL_SIG)?;
        out.write_u16::<LittleEndian>(version)?;
        out.write_u16::<LittleEndian>(version)?;
        out.write_u16::<LittleEndian>(name_flags(&entry.name))?;
        out.write_u16::<LittleEndian>(entry.method)?;
        out.write_u16::<LittleEndian>(DOS_TIME)?;
        out.write_u16::<LittleEndian>(DOS_DATE)?;
        out.write_u32::<LittleEndian>(entry.crc)?;
        out.write_u32::<LittleEndian>(clamp32(compressed_size))?;
        out.write_u32::<LittleEndian>(clamp32(entry.uncompressed_size))?;
        out.write_u16::<LittleEndian>(entry.name.len() as u16)?;
        out.write_u16::<LittleEndian>(if extra.is_empty() { 0 } else { extra.len() as u16 + 4 })?;
        out.write_u16::<LittleEndian>(0)?; // comment
        out.write_u16::<LittleEndian>(0)?; // disk
        out.write_u16::<LittleEndian>(0)?; // internal attributes
        out.write_u32::<LittleEndian>(EXTERNAL_ATTR)?;
        out.write_u32::<LittleEndian>(clamp32(offset))?;
        out.extend_from_slice(entry.name.as_bytes());
        if !extra.is_empty() {
            out.write_u16::<LittleEndian>(ZIP64_EXTRA_ID)?;
            out.write_u16::<LittleEndian>(extra.len() as u16)?;
            out.extend_from_slice(&extra);
        }
    }

    let cd_end = out.len() as u64;
    let cd_size = cd_end - cd_offset;
    let count = entries.len() as u64;
    let zip64 = count >= u16::MAX as u64 || cd_size >= U32_MAX || cd_offset >= U32_MAX;
    if zip64 {
        out.write_u32::<LittleEndian>(ZIP64_EOCD_SIG)?;
        out.write_u64::<LittleEndian>(ZIP64_EOCD_LEN - 12)?;
        out.write_u16::<LittleEndian>(VERSION_ZIP64)?;
        out.write_u16::<LittleEndian>(VERSION_ZIP64)?;
        out.write_u32::<LittleEndian>(0)?;
        out.write_u32::<LittleEndian>(0)?;
        out.write_u64::<LittleEndian>(count)?;
        out.write_u64::<LittleEndian>(count)?;
        out.write_u64::<LittleEndian>(cd_size)?;
        out.write_u64::<LittleEndian>(cd_offset)?;

        out.write_u32::<LittleEndian>(ZIP64_LOCATOR_SIG)?;
        out.write_u32::<LittleEndian>(0)?;
        out.write_u64::<LittleEndian>(cd_end)?;
        out.write_u32::<LittleEndian>(1)?;
    }

    let count16 = count.min(u16::MAX as u64) as u16;
    out.write_u32::<LittleEndian>(EOCD_SIG)?;
    out.write_u16::<LittleEndian>(0)?;
    out.write_u16::<LittleEndian>(0)?;
    out.write_u16::<LittleEndian>(count16)?;
    out.write_u16::<LittleEndian>(count16)?;
    out.write_u32::<LittleEndian>(clamp32(cd_size))?;
    out.write_u32::<LittleEndian>(clamp32(cd_offset))?;
    out.write_u16::<LittleEndian>(0)?;

    tracing::debug!(entries = entries.len(), bytes = out.len(), zip64, "wrote archive");
    Ok(out)
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

fn slice<'a>(bytes: &'a [u8], start: u64, len: u64, what: &str) -> NpzResult<&'a [u8]> {
    let end = start.checked_add(len);
    match end {
        Some(end) if end <= bytes.len() as u64 => Ok(&bytes[start as usize..end as usize]),
        _ => Err(NpzError::archive(
            start,
            format!("{what} of {len} bytes runs past the end of the archive"),
        )),
    }
}

/// Map a short read inside a record to a [`NpzError::MalformedArchive`].
fn short(offset: u64, what: &'static str) -> impl Fn(std::io::Error) -> NpzError {
    move |_| NpzError::archive(offset, format!("truncated {what}"))
}

fn find_eocd(bytes: &[u8]) -> NpzResult<usize> {
    if bytes.len() < EOCD_LEN {
        return Err(NpzError::archive(
            0,
            format!("{} bytes is too short for an archive", bytes.len()),
        ));
    }
    let last = bytes.len() - EOCD_LEN;
    let first = last.saturating_sub(u16::MAX as usize);
    for pos in (first..=last).rev() {
        if bytes[pos..pos + 4] == EOCD_SIG.to_le_bytes() {
            let comment_len = u16::from_le_bytes([bytes[pos + 20], bytes[pos + 21]]) as usize;
            if pos + EOCD_LEN + comment_len == bytes.len() {
                return Ok(pos);
            }
        }
    }
    Err(NpzError::archive(
        bytes.len() as u64,
        "end of central directory record not found",
    ))
}

/// Read the central directory. Content before the archive (for instance an
/// executable stub) is allowed and skipped.
pub(crate) fn read_directory(bytes: &[u8]) -> NpzResult<Vec<DirectoryEntry>> {
    let eocd = find_eocd(bytes)?;
    let eocd_off = eocd as u64;
    let mut cur = Cursor::new(&bytes[eocd + 4..]);
    let err = short(eocd_off, "end of central directory");
    let disk = cur.read_u16::<LittleEndian>().map_err(&err)?;
    let cd_disk = cur.read_u16::<LittleEndian>().map_err(&err)?;
    let _entries_on_disk = cur.read_u16::<LittleEndian>().map_err(&err)?;
    let mut count = cur.read_u16::<LittleEndian>().map_err(&err)? as u64;
    let mut cd_size = cur.read_u32::<LittleEndian>().map_err(&err)? as u64;
    let mut cd_offset = cur.read_u32::<LittleEndian>().map_err(&err)? as u64;
    if disk != 0 || cd_disk != 0 {
        return Err(NpzError::archive(eocd_off, "multi-disk archives are not supported"));
    }

    // The central directory ends where the end records begin.
    let mut cd_end = eocd_off;
    let locator = eocd.checked_sub(ZIP64_LOCATOR_LEN);
    let has_locator = locator
        .is_some_and(|at| bytes[at..at + 4] == ZIP64_LOCATOR_SIG.to_le_bytes());
    if has_locator {
        let record = (eocd - ZIP64_LOCATOR_LEN) as u64;
        let start = record.checked_sub(ZIP64_EOCD_LEN).ok_or_else(|| {
            NpzError::archive(record, "ZIP64 locator without a ZIP64 end record")
        })?;
        let mut cur = Cursor::new(slice(bytes, start, ZIP64_EOCD_LEN, "ZIP64 end record")?);
        let err = short(start, "ZIP64 end record");
        if cur.read_u32::<LittleEndian>().map_err(&err)? != ZIP64_EOCD_SIG {
            return Err(NpzError::archive(start, "bad ZIP64 end record signature"));
        }
        cur.set_position(24);
        let _entries_on_disk = cur.read_u64::<LittleEndian>().map_err(&err)?;
        count = cur.read_u64::<LittleEndian>().map_err(&err)?;
        cd_size = cur.read_u64::<LittleEndian>().map_err(&err)?;
        cd_offset = cur.read_u64::<LittleEndian>().map_err(&err)?;
        cd_end = start;
    }

    let cd_start = cd_end.checked_sub(cd_size).ok_or_else(|| {
        NpzError::archive(cd_end, format!("central directory size {cd_size} exceeds the archive"))
    })?;
    let prefix = cd_start.checked_sub(cd_offset).ok_or_else(|| {
        let reason = format!("central directory offset {cd_offset} is past its position");
        NpzError::archive(cd_start, reason)
    })?;
    if prefix > 0 {
        tracing::warn!(prefix, "archive is preceded by {prefix} bytes of other content");
    }

    let directory = slice(bytes, cd_start, cd_size, "central directory")?;
    let mut entries = Vec::with_capacity(count.min(cd_size / CENTRAL_HEADER_LEN) as usize);
    let mut cur = Cursor::new(directory);
    for _ in 0..count {
        let at = cd_start + cur.position();
        entries.push(read_central_entry(&mut cur, at, prefix)?);
    }
    tracing::debug!(entries = entries.len(), prefix, "read central directory");
    Ok(entries)
}

fn read_central_entry(cur: &mut Cursor<&[u8]>, at: u64, prefix: u64) -> NpzResult<DirectoryEntry> {
    let err = short(at, "central directory entry");
    if cur.read_u32::<LittleEndian>().map_err(&err)? != CENTRAL_SIG {
        return Err(NpzError::archive(at, "bad central directory entry signature"));
    }
    let _made_by = cur.read_u16::<LittleEndian>().map_err(&err)?;
    let _needed = cur.read_u16::<LittleEndian>().map_err(&err)?;
    let flags = cur.read_u16::<LittleEndian>().map_err(&err)?;
    let method = cur.read_u16::<LittleEndian>().map_err(&err)?;
    let _time = cur.read_u16::<LittleEndian>().map_err(&err)?;
    let _date = cur.read_u16::<LittleEndian>().map_err(&err)?;
    let crc = cur.read_u32::<LittleEndian>().map_err(&err)?;
    let mut compressed_size = cur.read_u32::<LittleEndian>().map_err(&err)? as u64;
    let mut uncompressed_size = cur.read_u32::<LittleEndian>().map_err(&err)? as u64;
    let name_len = cur.read_u16::<LittleEndian>().map_err(&err)? as usize;
    let extra_len = cur.read_u16::<LittleEndian>().map_err(&err)? as usize;
    let comment_len = cur.read_u16::<LittleEndian>().map_err(&err)? as u64;
    let _disk = cur.read_u16::<LittleEndian>().map_err(&err)?;
    let _internal = cur.read_u16::<LittleEndian>().map_err(&err)?;
    let _external = cur.read_u32::<LittleEndian>().map_err(&err)?;
    let mut local_offset = cur.read_u32::<LittleEndian>().map_err(&err)? as u64;

    let mut name = vec![0u8; name_len];
    cur.read_exact(&mut name).map_err(&err)?;
    let mut extra = vec![0u8; extra_len];
    cur.read_exact(&mut extra).map_err(&err)?;
    cur.set_position(cur.position() + comment_len);

    // ZIP64 extra: only the fields saturated in the fixed record are present,
    // in this order.
    let mut ex = Cursor::new(extra.as_slice());
    while let (Ok(id), Ok(size)) = (ex.read_u16::<LittleEndian>(), ex.read_u16::<LittleEndian>()) {
        let body_start = ex.position();
        if id == ZIP64_EXTRA_ID {
            let zerr = short(at, "ZIP64 extra field");
            if uncompressed_size == U32_MAX {
                uncompressed_size = ex.read_u64::<LittleEndian>().map_err(&zerr)?;
            }
            if compressed_size == U32_MAX {
                compressed_size = ex.read_u64::<LittleEndian>().map_err(&zerr)?;
            }
            if local_offset == U32_MAX {
                local_offset = ex.read_u64::<LittleEndian>().map_err(&zerr)?;
            }
        }
        ex.set_position(body_start + size as u64);
    }

    let name = if flags & FLAG_UTF8 != 0 {
        String::from_utf8(name)
            .map_err(|_| NpzError::archive(at, "member name is not valid UTF-8"))?
    } else {
        match String::from_utf8(name) {
            Ok(s) => s,
            Err(e) => e.into_bytes().into_iter().map(char::from).collect(),
        }
    };

    let local_offset = local_offset
        .checked_add(prefix)
        .ok_or_else(|| NpzError::archive(at, "member offset overflows"))?;
    Ok(DirectoryEntry {
        name,
        method,
        flags,
        crc,
        compressed_size,
        uncompressed_size,
        local_offset,
    })
}

/// The stored (possibly compressed) bytes of `entry`.
pub(crate) fn entry_data<'a>(bytes: &'a [u8], entry: &DirectoryEntry) -> NpzResult<&'a [u8]> {
    let at = entry.local_offset;
    if entry.flags & FLAG_ENCRYPTED != 0 {
        return Err(NpzError::archive(at, format!("member {:?} is encrypted", entry.name)));
    }
    let header = slice(bytes, at, LOCAL_HEADER_LEN, "local header")?;
    let mut cur = Cursor::new(header);
    let err = short(at, "local header");
    if cur.read_u32::<LittleEndian>().map_err(&err)? != LOCAL_SIG {
        return Err(NpzError::archive(at, "bad local header signature"));
    }
    cur.set_position(26);
    let name_len = cur.read_u16::<LittleEndian>().map_err(&err)? as u64;
    let extra_len = cur.read_u16::<LittleEndian>().map_err(&err)? as u64;
    let start = at + LOCAL_HEADER_LEN + name_len + extra_len;
    slice(bytes, start, entry.compressed_size, "member data")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, data: &[u8]) -> EncodedEntry {
        let mut crc = flate2::Crc::new();
        crc.update(data);
        EncodedEntry {
            name: name.into(),
            method: 0,
            crc: crc.sum(),
            uncompressed_size: data.len() as u64,
            data: data.to_vec(),
        }
    }

    #[test]
    fn test_directory_round_trip() {
        let bytes = write_archive(&[entry("a.npy", b"hello"), entry("b.npy", b"")]).unwrap();
        // local headers (30 + 5 + 5, 30 + 5), then central directory
        assert_eq!(&bytes[..4], b"PK\x03\x04");
        let dir = read_directory(&bytes).unwrap();
        assert_eq!(dir.len(), 2);
        assert_eq!(dir[0].name, "a.npy");
        assert_eq!(dir[1].local_offset, 40);
        assert_eq!(entry_data(&bytes, &dir[0]).unwrap(), b"hello");
        assert_eq!(entry_data(&bytes, &dir[1]).unwrap(), b"");
    }

    #[test]
    fn test_leading_content_is_skipped() {
        let archive = write_archive(&[entry("x.npy", b"abc")]).unwrap();
        let mut bytes = b"#!/bin/sh\nexit 0\n".to_vec();
        bytes.extend_from_slice(&archive);
        let dir = read_directory(&bytes).unwrap();
        assert_eq!(dir[0].local_offset, 17);
        assert_eq!(entry_data(&bytes, &dir[0]).unwrap(), b"abc");
    }

    /// A central entry named "z" whose saturated fields are resolved by a
    /// ZIP64 extra field carrying `extra`.
    fn zip64_central_entry(sizes: u32, offset: u32, extra: &[u64]) -> Vec<u8> {
        let mut rec = Vec::new();
        rec.write_u32::<LittleEndian>(CENTRAL_SIG).unwrap();
        for v in [45u16, 45, 0, 0, 0, 0x21] {
            rec.write_u16::<LittleEndian>(v).unwrap();
        }
        rec.write_u32::<LittleEndian>(0).unwrap();
        rec.write_u32::<LittleEndian>(sizes).unwrap();
        rec.write_u32::<LittleEndian>(sizes).unwrap();
        for v in [1u16, 4 + 8 * extra.len() as u16, 0, 0, 0] {
            rec.write_u16::<LittleEndian>(v).unwrap();
        }
        rec.write_u32::<LittleEndian>(0).unwrap();
        rec.write_u32::<LittleEndian>(offset).unwrap();
        rec.push(b'z');
        rec.write_u16::<LittleEndian>(ZIP64_EXTRA_ID).unwrap();
        rec.write_u16::<LittleEndian>(8 * extra.len() as u16).unwrap();
        for &v in extra {
            rec.write_u64::<LittleEndian>(v).unwrap();
        }
        rec
    }

    #[test]
    fn test_zip64_extra_is_read() {
        let rec = zip64_central_entry(u32::MAX, 7, &[5_000_000_000, 4_500_000_000]);
        let mut cur = Cursor::new(rec.as_slice());
        let e = read_central_entry(&mut cur, 0, 3).unwrap();
        assert_eq!(e.name, "z");
        assert_eq!(e.uncompressed_size, 5_000_000_000);
        assert_eq!(e.compressed_size, 4_500_000_000);
        assert_eq!(e.local_offset, 10);
    }

    #[test]
    fn test_zip64_offset_overflow_is_an_error() {
        let rec = zip64_central_entry(0, u32::MAX, &[u64::MAX]);
        let cd_size = rec.len() as u32;

        // One byte of leading content, then the directory, then the end record.
        let mut bytes = vec![b'#'];
        bytes.extend_from_slice(&rec);
        bytes.write_u32::<LittleEndian>(EOCD_SIG).unwrap();
        for v in [0u16, 0, 1, 1] {
            bytes.write_u16::<LittleEndian>(v).unwrap();
        }
        bytes.write_u32::<LittleEndian>(cd_size).unwrap();
        bytes.write_u32::<LittleEndian>(0).unwrap();
        bytes.write_u16::<LittleEndian>(0).unwrap();

        let err = read_directory(&bytes).unwrap_err();
        assert!(matches!(err, NpzError::MalformedArchive { offset: 1, .. }));
    }

    #[test]
    fn test_missing_end_record() {
        let err = read_directory(&[0u8; 64]).unwrap_err();
        assert!(matches!(err, NpzError::MalformedArchive { offset: 64, .. }));
    }

    #[test]
    fn test_truncated_directory() {
        let bytes = write_archive(&[entry("a.npy", b"hello")]).unwrap();
        let cut = bytes[..20].iter().chain(&bytes[bytes.len() - 22..]).copied().collect::<Vec<_>>();
        assert!(matches!(read_directory(&cut), Err(NpzError::MalformedArchive { .. })));
    }
}
