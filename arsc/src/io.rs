use anyhow::{ensure, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Seek, Write};

/// All chunk boundaries in the format are aligned to this many bytes.
pub const PAD_BOUNDARY: u64 = 4;

/// Emits zero bytes until the writer sits on a 4-byte boundary.
pub fn write_padding(w: &mut (impl Write + Seek)) -> Result<()> {
    let pos = w.stream_position()?;
    if pos % PAD_BOUNDARY != 0 {
        for _ in pos % PAD_BOUNDARY..PAD_BOUNDARY {
            w.write_u8(0)?;
        }
    }
    Ok(())
}

/// Reads a UTF-8 length prefix: one byte, or two when the high bit of the
/// first byte is set (`len = (b0 & 0x7f) << 8 | b1`).
pub fn read_utf8_length(r: &mut impl Read) -> Result<usize> {
    let b0 = r.read_u8()? as usize;
    if b0 & 0x80 != 0 {
        let b1 = r.read_u8()? as usize;
        Ok((b0 & 0x7f) << 8 | b1)
    } else {
        Ok(b0)
    }
}

pub fn write_utf8_length(w: &mut impl Write, len: usize) -> Result<()> {
    ensure!(len <= 0x7fff, "string length {} exceeds encodable maximum", len);
    if len > 0x7f {
        w.write_u8(0x80 | (len >> 8) as u8)?;
    }
    w.write_u8(len as u8)?;
    Ok(())
}

/// Reads a UTF-16 length prefix: one 16-bit word, or two when the high bit
/// of the first word is set.
pub fn read_utf16_length(r: &mut impl Read) -> Result<usize> {
    let w0 = r.read_u16::<LittleEndian>()? as usize;
    if w0 & 0x8000 != 0 {
        let w1 = r.read_u16::<LittleEndian>()? as usize;
        Ok((w0 & 0x7fff) << 16 | w1)
    } else {
        Ok(w0)
    }
}

pub fn write_utf16_length(w: &mut impl Write, len: usize) -> Result<()> {
    ensure!(
        len <= 0x7fff_ffff,
        "string length {} exceeds encodable maximum",
        len
    );
    if len > 0x7fff {
        w.write_u16::<LittleEndian>(0x8000 | (len >> 16) as u16)?;
    }
    w.write_u16::<LittleEndian>(len as u16)?;
    Ok(())
}

/// Reads one pool string. UTF-8 strings carry two length prefixes (character
/// count, then byte count) and a NUL byte terminator; UTF-16LE strings carry
/// a single length prefix counting 16-bit units and a NUL word terminator.
/// Terminators are not included in the prefixed lengths.
pub fn read_string(r: &mut impl Read, utf8: bool) -> Result<String> {
    if utf8 {
        let _chars = read_utf8_length(r)?;
        let bytes = read_utf8_length(r)?;
        let mut buf = vec![0; bytes];
        r.read_exact(&mut buf)?;
        let s = String::from_utf8(buf).map_err(|e| anyhow::anyhow!("invalid utf-8 string: {e}"))?;
        let nul = r.read_u8()?;
        debug_assert_eq!(nul, 0, "utf-8 pool string missing NUL terminator");
        Ok(s)
    } else {
        let units = read_utf16_length(r)?;
        let mut buf = Vec::with_capacity(units);
        for _ in 0..units {
            buf.push(r.read_u16::<LittleEndian>()?);
        }
        let s = String::from_utf16(&buf)?;
        let nul = r.read_u16::<LittleEndian>()?;
        debug_assert_eq!(nul, 0, "utf-16 pool string missing NUL terminator");
        Ok(s)
    }
}

pub fn write_string(w: &mut impl Write, s: &str, utf8: bool) -> Result<()> {
    if utf8 {
        write_utf8_length(w, s.chars().count())?;
        write_utf8_length(w, s.len())?;
        w.write_all(s.as_bytes())?;
        w.write_u8(0)?;
    } else {
        let units = s.encode_utf16().collect::<Vec<_>>();
        write_utf16_length(w, units.len())?;
        for unit in units {
            w.write_u16::<LittleEndian>(unit)?;
        }
        w.write_u16::<LittleEndian>(0)?;
    }
    Ok(())
}
