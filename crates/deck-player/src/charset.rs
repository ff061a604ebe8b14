//! Text decoding for decoder-supplied metadata.

/// Character set a decoder declares for its metadata fields.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Charset {
    Iso8859_1,
    /// Decoded as ISO-8859-1 except for the eight code points that differ.
    Iso8859_15,
    Utf8,
    Utf16Be,
    Utf16Le,
    /// UTF-16 with a leading byte order mark (big endian if missing).
    Utf16Bom,
    #[default]
    AutoDetect,
}

/// Decode `bytes` to a `String`, stopping at the first NUL.
///
/// Never fails: undecodable input falls back to Latin-1 (or lossy UTF-16), which maps
/// every byte to some character.
pub fn decode_text(bytes: &[u8], charset: Charset) -> String {
    match charset {
        Charset::Iso8859_1 => latin1(until_nul(bytes)),
        Charset::Iso8859_15 => latin9(until_nul(bytes)),
        Charset::Utf8 => String::from_utf8_lossy(until_nul(bytes)).into_owned(),
        Charset::Utf16Be => utf16(bytes, true),
        Charset::Utf16Le => utf16(bytes, false),
        Charset::Utf16Bom => utf16_bom(bytes).unwrap_or_else(|| utf16(bytes, true)),
        Charset::AutoDetect => autodetect(bytes),
    }
}

fn autodetect(bytes: &[u8]) -> String {
    if let Some(text) = utf16_bom(bytes) {
        return text;
    }
    let bytes = until_nul(bytes);
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => latin1(bytes),
    }
}

fn until_nul(bytes: &[u8]) -> &[u8] {
    match bytes.iter().position(|b| *b == 0) {
        Some(end) => &bytes[..end],
        None => bytes,
    }
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|b| *b as char).collect()
}

fn latin9(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| match b {
            0xA4 => '\u{20AC}',
            0xA6 => '\u{0160}',
            0xA8 => '\u{0161}',
            0xB4 => '\u{017D}',
            0xB8 => '\u{017E}',
            0xBC => '\u{0152}',
            0xBD => '\u{0153}',
            0xBE => '\u{0178}',
            other => *other as char,
        })
        .collect()
}

fn utf16_bom(bytes: &[u8]) -> Option<String> {
    match bytes {
        [0xFE, 0xFF, rest @ ..] => Some(utf16(rest, true)),
        [0xFF, 0xFE, rest @ ..] => Some(utf16(rest, false)),
        _ => None,
    }
}

fn utf16(bytes: &[u8], big_endian: bool) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| {
            if big_endian {
                u16::from_be_bytes([c[0], c[1]])
            } else {
                u16::from_le_bytes([c[0], c[1]])
            }
        })
        .take_while(|u| *u != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latin1_maps_high_bytes() {
        assert_eq!(decode_text(b"Caf\xe9", Charset::Iso8859_1), "Café");
    }

    #[test]
    fn latin9_has_euro_sign() {
        assert_eq!(decode_text(b"5 \xa4", Charset::Iso8859_15), "5 €");
        assert_eq!(decode_text(b"5 \xa4", Charset::Iso8859_1), "5 \u{a4}");
    }

    #[test]
    fn utf16_variants() {
        let be = [0x00, b'h', 0x00, b'i'];
        let le = [b'h', 0x00, b'i', 0x00];
        assert_eq!(decode_text(&be, Charset::Utf16Be), "hi");
        assert_eq!(decode_text(&le, Charset::Utf16Le), "hi");
        let bom_le = [0xFF, 0xFE, b'o', 0x00, b'k', 0x00];
        assert_eq!(decode_text(&bom_le, Charset::Utf16Bom), "ok");
    }

    #[test]
    fn autodetect_prefers_utf8_then_bom_then_latin1() {
        assert_eq!(decode_text("Ünïcode".as_bytes(), Charset::AutoDetect), "Ünïcode");
        let bom_be = [0xFE, 0xFF, 0x00, b'A'];
        assert_eq!(decode_text(&bom_be, Charset::AutoDetect), "A");
        assert_eq!(decode_text(b"Bj\xf6rk", Charset::AutoDetect), "Björk");
    }

    #[test]
    fn stops_at_nul() {
        assert_eq!(decode_text(b"title\0garbage", Charset::Utf8), "title");
    }
}
