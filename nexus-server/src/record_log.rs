//! Minimal implementation of the CRC-checked, block-oriented framed-log
//! format consumed by [`crate::store::Store`]. This implements exactly the
//! documented byte contract (header + length-prefixed, CRC32-checked
//! records capped at 32 KiB each) — it is not a general-purpose log
//! library.

use std::io::{self, Read, Write};

pub const FILE_MAGIC: [u8; 4] = *b":W&B";
pub const FILE_TYPE_MAGIC: u16 = 0xBEE1;
pub const FILE_VERSION: u8 = 0;

/// Maximum size of a single logical record's payload per write.
pub const MAX_RECORD_LEN: usize = 32 * 1024;

pub fn write_header<W: Write>(w: &mut W) -> io::Result<()> {
    w.write_all(&FILE_MAGIC)?;
    w.write_all(&FILE_TYPE_MAGIC.to_le_bytes())?;
    w.write_all(&[FILE_VERSION])?;
    Ok(())
}

pub fn read_header<R: Read>(r: &mut R) -> io::Result<()> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if magic != FILE_MAGIC {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad record log magic"));
    }
    let mut ty = [0u8; 2];
    r.read_exact(&mut ty)?;
    if u16::from_le_bytes(ty) != FILE_TYPE_MAGIC {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad record log type magic"));
    }
    let mut version = [0u8; 1];
    r.read_exact(&mut version)?;
    Ok(())
}

/// Writes one logical record as a length-prefixed, CRC32-checked block.
/// `payload` must be no longer than [`MAX_RECORD_LEN`].
pub fn write_record<W: Write>(w: &mut W, payload: &[u8]) -> io::Result<()> {
    if payload.len() > MAX_RECORD_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("record too large: {} bytes (max {MAX_RECORD_LEN})", payload.len()),
        ));
    }

    let crc = crc32fast::hash(payload);
    w.write_all(&(payload.len() as u32).to_le_bytes())?;
    w.write_all(&crc.to_le_bytes())?;
    w.write_all(payload)?;
    Ok(())
}

/// Reads one logical record, verifying its CRC. Returns `Ok(None)` on clean
/// EOF (no partial block started).
pub fn read_record<R: Read>(r: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match r.read(&mut len_buf)? {
        0 => return Ok(None),
        n if n < 4 => {
            r.read_exact(&mut len_buf[n..])?;
        }
        _ => {}
    }
    let len = u32::from_le_bytes(len_buf) as usize;

    let mut crc_buf = [0u8; 4];
    r.read_exact(&mut crc_buf)?;
    let expected_crc = u32::from_le_bytes(crc_buf);

    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;

    let actual_crc = crc32fast::hash(&payload);
    if actual_crc != expected_crc {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("CRC mismatch: expected {expected_crc:#x}, got {actual_crc:#x}"),
        ));
    }

    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn round_trips_header_and_records() {
        let mut buf = Vec::new();
        write_header(&mut buf).unwrap();
        write_record(&mut buf, b"hello").unwrap();
        write_record(&mut buf, b"world").unwrap();

        let mut cursor = Cursor::new(buf);
        read_header(&mut cursor).unwrap();
        assert_eq!(read_record(&mut cursor).unwrap().unwrap(), b"hello");
        assert_eq!(read_record(&mut cursor).unwrap().unwrap(), b"world");
        assert!(read_record(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn detects_corruption() {
        let mut buf = Vec::new();
        write_record(&mut buf, b"hello").unwrap();
        // Flip a bit in the payload without updating the CRC.
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;

        let mut cursor = Cursor::new(buf);
        let err = read_record(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn rejects_oversized_record() {
        let mut buf = Vec::new();
        let oversized = vec![0u8; MAX_RECORD_LEN + 1];
        assert!(write_record(&mut buf, &oversized).is_err());
    }
}
