use anyhow::Result;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};
use std::num::NonZeroU8;

/// An 8-byte tagged scalar value. The interpretation of `data` depends on
/// `data_type`; the bits are carried through untouched either way.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResValue {
    /// Number of bytes in this structure, always 8 in practice.
    pub size: u16,
    /// Must be 0.
    pub res0: u8,
    /// Raw type tag; see [`ResValueType`]. Unrecognized tags round-trip.
    pub data_type: u8,
    pub data: u32,
}

impl ResValue {
    pub const SIZE: u16 = 8;

    pub fn new(data_type: ResValueType, data: u32) -> Self {
        Self {
            size: Self::SIZE,
            res0: 0,
            data_type: data_type as u8,
            data,
        }
    }

    pub fn read(r: &mut impl Read) -> Result<Self> {
        let size = r.read_u16::<LittleEndian>()?;
        debug_assert_eq!(size, Self::SIZE);
        let res0 = r.read_u8()?;
        debug_assert_eq!(res0, 0, "ResValue reserved field 0 should be 0");
        let data_type = r.read_u8()?;
        let data = r.read_u32::<LittleEndian>()?;
        Ok(Self {
            size,
            res0,
            data_type,
            data,
        })
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_u16::<LittleEndian>(self.size)?;
        w.write_u8(self.res0)?;
        w.write_u8(self.data_type)?;
        w.write_u32::<LittleEndian>(self.data)?;
        Ok(())
    }

    pub fn value_type(&self) -> Option<ResValueType> {
        ResValueType::from_u8(self.data_type)
    }

    pub fn is_reference(&self) -> bool {
        self.data_type == ResValueType::Reference as u8
    }

    pub fn is_string(&self) -> bool {
        self.data_type == ResValueType::String as u8
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ResValueType {
    Null = 0x00,
    Reference = 0x01,
    Attribute = 0x02,
    String = 0x03,
    Float = 0x04,
    Dimension = 0x05,
    Fraction = 0x06,
    DynamicReference = 0x07,
    DynamicAttribute = 0x08,
    IntDec = 0x10,
    IntHex = 0x11,
    IntBoolean = 0x12,
    IntColorArgb8 = 0x1c,
    IntColorRgb8 = 0x1d,
    IntColorArgb4 = 0x1e,
    IntColorRgb4 = 0x1f,
}

impl ResValueType {
    pub fn from_u8(ty: u8) -> Option<Self> {
        Some(match ty {
            x if x == Self::Null as u8 => Self::Null,
            x if x == Self::Reference as u8 => Self::Reference,
            x if x == Self::Attribute as u8 => Self::Attribute,
            x if x == Self::String as u8 => Self::String,
            x if x == Self::Float as u8 => Self::Float,
            x if x == Self::Dimension as u8 => Self::Dimension,
            x if x == Self::Fraction as u8 => Self::Fraction,
            x if x == Self::DynamicReference as u8 => Self::DynamicReference,
            x if x == Self::DynamicAttribute as u8 => Self::DynamicAttribute,
            x if x == Self::IntDec as u8 => Self::IntDec,
            x if x == Self::IntHex as u8 => Self::IntHex,
            x if x == Self::IntBoolean as u8 => Self::IntBoolean,
            x if x == Self::IntColorArgb8 as u8 => Self::IntColorArgb8,
            x if x == Self::IntColorRgb8 as u8 => Self::IntColorRgb8,
            x if x == Self::IntColorArgb4 as u8 => Self::IntColorArgb4,
            x if x == Self::IntColorRgb4 as u8 => Self::IntColorRgb4,
            _ => return None,
        })
    }
}

/// A packed `0xPPTTEEEE` resource identifier: package id, type id and entry
/// index in one 32-bit word.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct ResTableRef(u32);

impl ResTableRef {
    pub fn new(package: u8, ty: NonZeroU8, entry: u16) -> Self {
        let package = (package as u32) << 24;
        let ty = (ty.get() as u32) << 16;
        Self(package | ty | entry as u32)
    }

    pub fn package(self) -> u8 {
        (self.0 >> 24) as u8
    }

    pub fn ty(self) -> u8 {
        (self.0 >> 16) as u8
    }

    pub fn entry(self) -> u16 {
        self.0 as u16
    }
}

impl From<u32> for ResTableRef {
    fn from(r: u32) -> Self {
        Self(r)
    }
}

impl From<ResTableRef> for u32 {
    fn from(r: ResTableRef) -> u32 {
        r.0
    }
}

impl std::fmt::Debug for ResTableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "ResTableRef({self})")
    }
}

impl std::fmt::Display for ResTableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_ref_packs_and_unpacks() {
        let r = ResTableRef::new(0x7f, NonZeroU8::new(0x01).unwrap(), 0x0099);
        assert_eq!(u32::from(r), 0x7f01_0099);
        assert_eq!(r.package(), 0x7f);
        assert_eq!(r.ty(), 0x01);
        assert_eq!(r.entry(), 0x0099);
        assert_eq!(r.to_string(), "0x7f010099");
    }

    #[test]
    fn value_type_lookup() {
        assert_eq!(ResValueType::from_u8(0x03), Some(ResValueType::String));
        assert_eq!(
            ResValueType::from_u8(0x07),
            Some(ResValueType::DynamicReference)
        );
        assert_eq!(ResValueType::from_u8(0x13), None);
    }

    #[test]
    fn value_roundtrip() {
        let v = ResValue::new(ResValueType::IntColorArgb8, 0xff00_88ff);
        let mut buf = std::io::Cursor::new(Vec::new());
        v.write(&mut buf).unwrap();
        assert_eq!(buf.get_ref().len(), ResValue::SIZE as usize);
        buf.set_position(0);
        assert_eq!(ResValue::read(&mut buf).unwrap(), v);
    }
}
