//! Client character sets known to the driver.
//!
//! Each entry maps a charset name to the collation id sent in the handshake
//! and records whether its multibyte sequences can contain `\` or `'` as a
//! trail byte, which changes how escaping must walk the input.

/// Multibyte layout relevant to escaping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Multibyte {
    /// Single-byte charsets, and multibyte charsets whose trail bytes are all
    /// >= 0x80 (utf8, ujis, euckr, ...). Escaping can work byte by byte.
    Safe,
    /// Lead 0xA1-0xF9, trail 0x40-0x7E | 0xA1-0xFE.
    Big5,
    /// Lead 0x81-0xFE, trail 0x40-0x7E | 0x80-0xFE.
    Gbk,
    /// GBK two-byte form plus four-byte form (lead, 0x30-0x39, 0x81-0xFE, 0x30-0x39).
    Gb18030,
    /// Lead 0x81-0x9F | 0xE0-0xFC, trail 0x40-0x7E | 0x80-0xFC. Also cp932.
    Sjis,
}

/// A client character set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Charset {
    pub name: &'static str,
    /// Default collation id.
    pub id: u8,
    pub multibyte: Multibyte,
}

const fn cs(name: &'static str, id: u8, multibyte: Multibyte) -> Charset {
    Charset { name, id, multibyte }
}

static CHARSETS: &[Charset] = &[
    cs("big5", 1, Multibyte::Big5),
    cs("dec8", 3, Multibyte::Safe),
    cs("cp850", 4, Multibyte::Safe),
    cs("hp8", 6, Multibyte::Safe),
    cs("koi8r", 7, Multibyte::Safe),
    cs("latin1", 8, Multibyte::Safe),
    cs("latin2", 9, Multibyte::Safe),
    cs("swe7", 10, Multibyte::Safe),
    cs("ascii", 11, Multibyte::Safe),
    cs("ujis", 12, Multibyte::Safe),
    cs("sjis", 13, Multibyte::Sjis),
    cs("hebrew", 16, Multibyte::Safe),
    cs("tis620", 18, Multibyte::Safe),
    cs("euckr", 19, Multibyte::Safe),
    cs("koi8u", 22, Multibyte::Safe),
    cs("gb2312", 24, Multibyte::Safe),
    cs("greek", 25, Multibyte::Safe),
    cs("cp1250", 26, Multibyte::Safe),
    cs("gbk", 28, Multibyte::Gbk),
    cs("latin5", 30, Multibyte::Safe),
    cs("armscii8", 32, Multibyte::Safe),
    cs("utf8", 33, Multibyte::Safe),
    cs("utf8mb3", 33, Multibyte::Safe),
    cs("cp866", 36, Multibyte::Safe),
    cs("keybcs2", 37, Multibyte::Safe),
    cs("macce", 38, Multibyte::Safe),
    cs("macroman", 39, Multibyte::Safe),
    cs("cp852", 40, Multibyte::Safe),
    cs("latin7", 41, Multibyte::Safe),
    cs("utf8mb4", 45, Multibyte::Safe),
    cs("cp1251", 51, Multibyte::Safe),
    cs("cp1256", 57, Multibyte::Safe),
    cs("cp1257", 59, Multibyte::Safe),
    cs("binary", 63, Multibyte::Safe),
    cs("geostd8", 92, Multibyte::Safe),
    cs("cp932", 95, Multibyte::Sjis),
    cs("eucjpms", 97, Multibyte::Safe),
    cs("gb18030", 248, Multibyte::Gb18030),
];

/// Charset used when the caller does not pick one.
pub const DEFAULT_CHARSET: &str = "utf8mb4";

impl Charset {
    /// Look up a charset by name (case-insensitive).
    pub fn by_name(name: &str) -> Option<&'static Charset> {
        CHARSETS.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Look up a charset by its default collation id.
    pub fn by_id(id: u8) -> Option<&'static Charset> {
        CHARSETS.iter().find(|c| c.id == id)
    }

    pub fn default_charset() -> &'static Charset {
        // DEFAULT_CHARSET is in the table
        Self::by_name(DEFAULT_CHARSET).unwrap_or(&CHARSETS[0])
    }

    /// Length of the valid multibyte character starting at `bytes[0]`, if any.
    ///
    /// Returns `None` for single bytes and for broken sequences.
    pub fn mb_char_len(&self, bytes: &[u8]) -> Option<usize> {
        let lead = *bytes.first()?;
        let second = bytes.get(1).copied();
        match self.multibyte {
            Multibyte::Safe => None,
            Multibyte::Big5 => match (lead, second?) {
                (0xA1..=0xF9, 0x40..=0x7E | 0xA1..=0xFE) => Some(2),
                _ => None,
            },
            Multibyte::Gbk => match (lead, second?) {
                (0x81..=0xFE, 0x40..=0x7E | 0x80..=0xFE) => Some(2),
                _ => None,
            },
            Multibyte::Gb18030 => match (lead, second?) {
                (0x81..=0xFE, 0x40..=0x7E | 0x80..=0xFE) => Some(2),
                (0x81..=0xFE, 0x30..=0x39) => match (bytes.get(2).copied()?, bytes.get(3).copied()?) {
                    (0x81..=0xFE, 0x30..=0x39) => Some(4),
                    _ => None,
                },
                _ => None,
            },
            Multibyte::Sjis => match (lead, second?) {
                (0x81..=0x9F | 0xE0..=0xFC, 0x40..=0x7E | 0x80..=0xFC) => Some(2),
                _ => None,
            },
        }
    }

    /// Whether `byte` would start a multibyte character in this charset.
    pub fn is_lead_byte(&self, byte: u8) -> bool {
        match self.multibyte {
            Multibyte::Safe => false,
            Multibyte::Big5 => (0xA1..=0xF9).contains(&byte),
            Multibyte::Gbk | Multibyte::Gb18030 => (0x81..=0xFE).contains(&byte),
            Multibyte::Sjis => matches!(byte, 0x81..=0x9F | 0xE0..=0xFC),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        assert_eq!(Charset::by_name("UTF8MB4").map(|c| c.id), Some(45));
        assert_eq!(Charset::by_name("latin1").map(|c| c.id), Some(8));
        assert!(Charset::by_name("klingon").is_none());
        assert_eq!(Charset::by_id(28).map(|c| c.name), Some("gbk"));
        assert_eq!(Charset::default_charset().name, "utf8mb4");
    }

    #[test]
    fn test_gbk_sequences() {
        let gbk = Charset::by_name("gbk").unwrap();
        // 0xBF 0x5C is a valid GBK character whose trail byte is a backslash
        assert_eq!(gbk.mb_char_len(&[0xBF, 0x5C]), Some(2));
        assert_eq!(gbk.mb_char_len(&[0xBF, 0x27]), None);
        assert_eq!(gbk.mb_char_len(&[0xBF]), None);
        assert!(gbk.is_lead_byte(0xBF));
        assert!(!gbk.is_lead_byte(b'a'));
    }

    #[test]
    fn test_gb18030_four_byte() {
        let gb = Charset::by_name("gb18030").unwrap();
        assert_eq!(gb.mb_char_len(&[0x81, 0x30, 0x81, 0x30]), Some(4));
        assert_eq!(gb.mb_char_len(&[0x81, 0x30, 0x27]), None);
    }

    #[test]
    fn test_utf8_is_bytewise() {
        let utf8 = Charset::by_name("utf8mb4").unwrap();
        assert_eq!(utf8.mb_char_len("é".as_bytes()), None);
        assert!(!utf8.is_lead_byte(0xC3));
    }
}
