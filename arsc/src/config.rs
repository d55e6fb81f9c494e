use anyhow::{ensure, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Seek, Write};

/// The device configuration a set of resource entries applies to.
///
/// The record is size-prefixed and has grown over the format's lifetime; each
/// size tier appends more qualifier axes. Fields beyond the declared size are
/// absent, and trailing bytes not covered by any known tier are preserved
/// verbatim in `unknown` so newer records round-trip.
#[derive(Clone, Debug)]
pub struct ResTableConfig {
    /// Declared size of the record on disk. Not part of equality.
    pub size: u32,
    pub mcc: u16,
    pub mnc: u16,
    /// Two-letter language code, or a packed three-letter code when the high
    /// bit of the first byte is set. `[0, 0]` means any.
    pub language: [u8; 2],
    pub region: [u8; 2],
    pub orientation: u8,
    pub touchscreen: u8,
    pub density: u16,
    pub keyboard: u8,
    pub navigation: u8,
    pub input_flags: u8,
    pub input_pad0: u8,
    pub screen_width: u16,
    pub screen_height: u16,
    pub sdk_version: u16,
    pub minor_version: u16,
    // size >= 32
    pub screen_layout: u8,
    pub ui_mode: u8,
    pub smallest_screen_width_dp: u16,
    // size >= 36
    pub screen_width_dp: u16,
    pub screen_height_dp: u16,
    // size >= 48
    pub locale_script: [u8; 4],
    pub locale_variant: [u8; 8],
    // size >= 52
    pub screen_layout2: u8,
    pub color_mode: u8,
    pub screen_config_pad2: u16,
    /// Trailing bytes beyond the last known tier. Not part of equality.
    pub unknown: Vec<u8>,
}

impl ResTableConfig {
    /// Size of the smallest record the format has ever shipped.
    pub const MIN_SIZE: u32 = 28;

    pub const MASK_LAYOUTDIR: u8 = 0xc0;
    pub const LAYOUTDIR_LTR: u8 = 0x40;
    pub const LAYOUTDIR_RTL: u8 = 0x80;
    pub const MASK_SCREENSIZE: u8 = 0x0f;
    pub const MASK_SCREENLONG: u8 = 0x30;
    pub const MASK_UI_MODE_TYPE: u8 = 0x0f;
    pub const MASK_UI_MODE_NIGHT: u8 = 0x30;
    pub const MASK_SCREENROUND: u8 = 0x03;
    pub const MASK_WIDE_COLOR_GAMUT: u8 = 0x03;
    pub const MASK_HDR: u8 = 0x0c;
    pub const MASK_KEYSHIDDEN: u8 = 0x03;
    pub const MASK_NAVHIDDEN: u8 = 0x0c;

    pub const DENSITY_ANY: u16 = 0xfffe;
    pub const DENSITY_NONE: u16 = 0xffff;

    pub fn read(r: &mut (impl Read + Seek)) -> Result<Self> {
        let start = r.stream_position()?;
        let size = r.read_u32::<LittleEndian>()?;
        ensure!(
            size >= Self::MIN_SIZE,
            "configuration record of {} bytes is below the {}-byte minimum",
            size,
            Self::MIN_SIZE
        );
        let mut config = Self {
            size,
            mcc: r.read_u16::<LittleEndian>()?,
            mnc: r.read_u16::<LittleEndian>()?,
            ..Self::default()
        };
        r.read_exact(&mut config.language)?;
        r.read_exact(&mut config.region)?;
        config.orientation = r.read_u8()?;
        config.touchscreen = r.read_u8()?;
        config.density = r.read_u16::<LittleEndian>()?;
        config.keyboard = r.read_u8()?;
        config.navigation = r.read_u8()?;
        config.input_flags = r.read_u8()?;
        config.input_pad0 = r.read_u8()?;
        config.screen_width = r.read_u16::<LittleEndian>()?;
        config.screen_height = r.read_u16::<LittleEndian>()?;
        config.sdk_version = r.read_u16::<LittleEndian>()?;
        config.minor_version = r.read_u16::<LittleEndian>()?;
        if size >= 32 {
            config.screen_layout = r.read_u8()?;
            config.ui_mode = r.read_u8()?;
            config.smallest_screen_width_dp = r.read_u16::<LittleEndian>()?;
        }
        if size >= 36 {
            config.screen_width_dp = r.read_u16::<LittleEndian>()?;
            config.screen_height_dp = r.read_u16::<LittleEndian>()?;
        }
        if size >= 48 {
            r.read_exact(&mut config.locale_script)?;
            r.read_exact(&mut config.locale_variant)?;
        }
        if size >= 52 {
            config.screen_layout2 = r.read_u8()?;
            config.color_mode = r.read_u8()?;
            config.screen_config_pad2 = r.read_u16::<LittleEndian>()?;
        }
        let known = r.stream_position()? - start;
        config.unknown = vec![0; size as usize - known as usize];
        r.read_exact(&mut config.unknown)?;
        Ok(config)
    }

    pub fn write(&self, w: &mut (impl Write + Seek)) -> Result<()> {
        let start = w.stream_position()?;
        w.write_u32::<LittleEndian>(self.size)?;
        w.write_u16::<LittleEndian>(self.mcc)?;
        w.write_u16::<LittleEndian>(self.mnc)?;
        w.write_all(&self.language)?;
        w.write_all(&self.region)?;
        w.write_u8(self.orientation)?;
        w.write_u8(self.touchscreen)?;
        w.write_u16::<LittleEndian>(self.density)?;
        w.write_u8(self.keyboard)?;
        w.write_u8(self.navigation)?;
        w.write_u8(self.input_flags)?;
        w.write_u8(self.input_pad0)?;
        w.write_u16::<LittleEndian>(self.screen_width)?;
        w.write_u16::<LittleEndian>(self.screen_height)?;
        w.write_u16::<LittleEndian>(self.sdk_version)?;
        w.write_u16::<LittleEndian>(self.minor_version)?;
        if self.size >= 32 {
            w.write_u8(self.screen_layout)?;
            w.write_u8(self.ui_mode)?;
            w.write_u16::<LittleEndian>(self.smallest_screen_width_dp)?;
        }
        if self.size >= 36 {
            w.write_u16::<LittleEndian>(self.screen_width_dp)?;
            w.write_u16::<LittleEndian>(self.screen_height_dp)?;
        }
        if self.size >= 48 {
            w.write_all(&self.locale_script)?;
            w.write_all(&self.locale_variant)?;
        }
        if self.size >= 52 {
            w.write_u8(self.screen_layout2)?;
            w.write_u8(self.color_mode)?;
            w.write_u16::<LittleEndian>(self.screen_config_pad2)?;
        }
        w.write_all(&self.unknown)?;
        debug_assert_eq!(self.size as u64, w.stream_position()? - start);
        Ok(())
    }

    /// Packs a lower-case ISO language code of length 2 or 3 into the
    /// two-byte wire form. Three-letter codes set the high bit and store each
    /// letter in 5 bits.
    pub fn pack_language(language: &str) -> [u8; 2] {
        pack_locale_part(language, b'a')
    }

    pub fn pack_region(region: &str) -> [u8; 2] {
        pack_locale_part(region, b'0')
    }

    pub fn language(&self) -> Option<String> {
        unpack_locale_part(self.language, b'a')
    }

    pub fn region(&self) -> Option<String> {
        unpack_locale_part(self.region, b'0')
    }

    fn locale_script(&self) -> Option<&str> {
        trimmed_str(&self.locale_script)
    }

    fn locale_variant(&self) -> Option<&str> {
        trimmed_str(&self.locale_variant)
    }

    fn locale_qualifier(&self) -> Option<String> {
        let language = self.language()?;
        if self.locale_script().is_none() && self.locale_variant().is_none() {
            return Some(match self.region() {
                Some(region) => format!("{}-r{}", language, region.to_uppercase()),
                None => language,
            });
        }
        // Script or variant present: BCP 47 style qualifier.
        let mut out = format!("b+{language}");
        if let Some(script) = self.locale_script() {
            out.push('+');
            out.push_str(script);
        }
        if let Some(region) = self.region() {
            out.push('+');
            out.push_str(&region.to_uppercase());
        }
        if let Some(variant) = self.locale_variant() {
            out.push('+');
            out.push_str(variant);
        }
        Some(out)
    }
}

impl Default for ResTableConfig {
    fn default() -> Self {
        Self {
            size: Self::MIN_SIZE,
            mcc: 0,
            mnc: 0,
            language: [0; 2],
            region: [0; 2],
            orientation: 0,
            touchscreen: 0,
            density: 0,
            keyboard: 0,
            navigation: 0,
            input_flags: 0,
            input_pad0: 0,
            screen_width: 0,
            screen_height: 0,
            sdk_version: 0,
            minor_version: 0,
            screen_layout: 0,
            ui_mode: 0,
            smallest_screen_width_dp: 0,
            screen_width_dp: 0,
            screen_height_dp: 0,
            locale_script: [0; 4],
            locale_variant: [0; 8],
            screen_layout2: 0,
            color_mode: 0,
            screen_config_pad2: 0,
            unknown: Vec::new(),
        }
    }
}

/// Equality covers the qualifier axes only; the declared `size` and the
/// opaque `unknown` tail differ across format versions for otherwise
/// identical configurations.
impl PartialEq for ResTableConfig {
    fn eq(&self, other: &Self) -> bool {
        self.mcc == other.mcc
            && self.mnc == other.mnc
            && self.language == other.language
            && self.region == other.region
            && self.orientation == other.orientation
            && self.touchscreen == other.touchscreen
            && self.density == other.density
            && self.keyboard == other.keyboard
            && self.navigation == other.navigation
            && self.input_flags == other.input_flags
            && self.input_pad0 == other.input_pad0
            && self.screen_width == other.screen_width
            && self.screen_height == other.screen_height
            && self.sdk_version == other.sdk_version
            && self.minor_version == other.minor_version
            && self.screen_layout == other.screen_layout
            && self.ui_mode == other.ui_mode
            && self.smallest_screen_width_dp == other.smallest_screen_width_dp
            && self.screen_width_dp == other.screen_width_dp
            && self.screen_height_dp == other.screen_height_dp
            && self.locale_script == other.locale_script
            && self.locale_variant == other.locale_variant
            && self.screen_layout2 == other.screen_layout2
            && self.color_mode == other.color_mode
            && self.screen_config_pad2 == other.screen_config_pad2
    }
}

impl Eq for ResTableConfig {}

impl std::fmt::Display for ResTableConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut parts: Vec<String> = Vec::new();
        if self.mcc != 0 {
            parts.push(format!("mcc{}", self.mcc));
        }
        if self.mnc != 0 {
            parts.push(format!("mnc{}", self.mnc));
        }
        if let Some(locale) = self.locale_qualifier() {
            parts.push(locale);
        }
        match self.screen_layout & Self::MASK_LAYOUTDIR {
            Self::LAYOUTDIR_LTR => parts.push("ldltr".into()),
            Self::LAYOUTDIR_RTL => parts.push("ldrtl".into()),
            _ => {}
        }
        if self.smallest_screen_width_dp != 0 {
            parts.push(format!("sw{}dp", self.smallest_screen_width_dp));
        }
        if self.screen_width_dp != 0 {
            parts.push(format!("w{}dp", self.screen_width_dp));
        }
        if self.screen_height_dp != 0 {
            parts.push(format!("h{}dp", self.screen_height_dp));
        }
        match self.screen_layout & Self::MASK_SCREENSIZE {
            0x01 => parts.push("small".into()),
            0x02 => parts.push("normal".into()),
            0x03 => parts.push("large".into()),
            0x04 => parts.push("xlarge".into()),
            _ => {}
        }
        match self.screen_layout & Self::MASK_SCREENLONG {
            0x10 => parts.push("notlong".into()),
            0x20 => parts.push("long".into()),
            _ => {}
        }
        match self.screen_layout2 & Self::MASK_SCREENROUND {
            0x01 => parts.push("notround".into()),
            0x02 => parts.push("round".into()),
            _ => {}
        }
        match self.color_mode & Self::MASK_WIDE_COLOR_GAMUT {
            0x01 => parts.push("nowidecg".into()),
            0x02 => parts.push("widecg".into()),
            _ => {}
        }
        match self.color_mode & Self::MASK_HDR {
            0x04 => parts.push("lowdr".into()),
            0x08 => parts.push("highdr".into()),
            _ => {}
        }
        match self.orientation {
            0x01 => parts.push("port".into()),
            0x02 => parts.push("land".into()),
            0x03 => parts.push("square".into()),
            _ => {}
        }
        match self.ui_mode & Self::MASK_UI_MODE_TYPE {
            0x02 => parts.push("desk".into()),
            0x03 => parts.push("car".into()),
            0x04 => parts.push("television".into()),
            0x05 => parts.push("appliance".into()),
            0x06 => parts.push("watch".into()),
            0x07 => parts.push("vrheadset".into()),
            _ => {}
        }
        match self.ui_mode & Self::MASK_UI_MODE_NIGHT {
            0x10 => parts.push("notnight".into()),
            0x20 => parts.push("night".into()),
            _ => {}
        }
        match self.density {
            0 => {}
            120 => parts.push("ldpi".into()),
            160 => parts.push("mdpi".into()),
            213 => parts.push("tvdpi".into()),
            240 => parts.push("hdpi".into()),
            320 => parts.push("xhdpi".into()),
            480 => parts.push("xxhdpi".into()),
            640 => parts.push("xxxhdpi".into()),
            Self::DENSITY_ANY => parts.push("anydpi".into()),
            Self::DENSITY_NONE => parts.push("nodpi".into()),
            d => parts.push(format!("{d}dpi")),
        }
        match self.touchscreen {
            0x01 => parts.push("notouch".into()),
            0x02 => parts.push("stylus".into()),
            0x03 => parts.push("finger".into()),
            _ => {}
        }
        match self.input_flags & Self::MASK_KEYSHIDDEN {
            0x01 => parts.push("keysexposed".into()),
            0x02 => parts.push("keyshidden".into()),
            0x03 => parts.push("keyssoft".into()),
            _ => {}
        }
        match self.keyboard {
            0x01 => parts.push("nokeys".into()),
            0x02 => parts.push("qwerty".into()),
            0x03 => parts.push("12key".into()),
            _ => {}
        }
        match self.input_flags & Self::MASK_NAVHIDDEN {
            0x04 => parts.push("navexposed".into()),
            0x08 => parts.push("navhidden".into()),
            _ => {}
        }
        match self.navigation {
            0x01 => parts.push("nonav".into()),
            0x02 => parts.push("dpad".into()),
            0x03 => parts.push("trackball".into()),
            0x04 => parts.push("wheel".into()),
            _ => {}
        }
        if self.screen_width != 0 || self.screen_height != 0 {
            parts.push(format!("{}x{}", self.screen_width, self.screen_height));
        }
        if self.sdk_version != 0 {
            parts.push(format!("v{}", self.sdk_version));
        }
        if parts.is_empty() {
            f.write_str("default")
        } else {
            f.write_str(&parts.join("-"))
        }
    }
}

fn pack_locale_part(part: &str, base: u8) -> [u8; 2] {
    let bytes = part.as_bytes();
    match bytes.len() {
        0 => [0, 0],
        2 => [bytes[0], bytes[1]],
        3 => {
            let first = (bytes[0] - base) & 0x7f;
            let second = (bytes[1] - base) & 0x7f;
            let third = (bytes[2] - base) & 0x7f;
            [0x80 | third << 2 | second >> 3, (second & 0x07) << 5 | first]
        }
        _ => panic!("locale component must be 0, 2 or 3 characters: {part:?}"),
    }
}

fn unpack_locale_part(packed: [u8; 2], base: u8) -> Option<String> {
    if packed == [0, 0] {
        return None;
    }
    if packed[0] & 0x80 != 0 {
        let first = packed[1] & 0x1f;
        let second = (packed[1] & 0xe0) >> 5 | (packed[0] & 0x03) << 3;
        let third = (packed[0] & 0x7c) >> 2;
        let bytes = [first + base, second + base, third + base];
        Some(String::from_utf8_lossy(&bytes).into_owned())
    } else {
        Some(String::from_utf8_lossy(&packed).into_owned())
    }
}

fn trimmed_str(bytes: &[u8]) -> Option<&str> {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    if end == 0 {
        None
    } else {
        std::str::from_utf8(&bytes[..end]).ok()
    }
}
