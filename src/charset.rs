//! IBIS 7-bit charset transliteration (component A).
//!
//! The wire protocol only carries 7-bit bytes. German umlauts are folded
//! onto the unused punctuation bytes in that range, matching the legacy
//! pyIBIS mapping: ä/ö/ü/ß/Ä/Ö/Ü -> { | } ~ [ \ ].

const FORWARD: [(char, u8); 7] = [
    ('\u{00e4}', b'{'), // ä
    ('\u{00f6}', b'|'), // ö
    ('\u{00fc}', b'}'), // ü
    ('\u{00df}', b'~'), // ß
    ('\u{00c4}', b'['), // Ä
    ('\u{00d6}', b'\\'), // Ö
    ('\u{00dc}', b']'), // Ü
];

fn forward_byte(c: char) -> Option<u8> {
    FORWARD.iter().find(|(uc, _)| *uc == c).map(|(_, b)| *b)
}

fn reverse_char(b: u8) -> Option<char> {
    FORWARD.iter().find(|(_, ub)| *ub == b).map(|(uc, _)| *uc)
}

/// True if `c` survives the ASCII filter applied before storage: plain
/// 7-bit ASCII, or one of the seven transliterable umlauts.
pub fn is_storable(c: char) -> bool {
    (c as u32) <= 0x7F || forward_byte(c).is_some()
}

/// Filters a string down to bytes the wire protocol can carry: ASCII
/// characters are kept as-is, the seven umlauts are kept (transliterated
/// later, at encode time), everything else is dropped.
pub fn ascii_filter(s: &str) -> String {
    s.chars().filter(|c| is_storable(*c)).collect()
}

/// Transliterates a string to the bytes that go on the wire: each umlaut
/// becomes its single-byte punctuation stand-in, everything else passes
/// through as its ASCII byte. Characters outside ASCII + the seven umlauts
/// are dropped (they should have already been removed by `ascii_filter`,
/// this is a defensive second pass).
pub fn transliterate(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len());
    for c in s.chars() {
        if let Some(b) = forward_byte(c) {
            out.push(b);
        } else if (c as u32) <= 0x7F {
            out.push(c as u8);
        }
    }
    out
}

/// Defensive entry point mirroring the original's `prepare_text`, which
/// accepted either a `str` or raw bytes from callers that weren't always
/// sure which they had. Decodes as UTF-8 first; if that fails, retries the
/// decode once more (matching the legacy double-decode dance) and, failing
/// that, transliterates nothing and returns the bytes untouched.
pub fn transliterate_bytes(input: &[u8]) -> Vec<u8> {
    match std::str::from_utf8(input) {
        Ok(s) => transliterate(s),
        Err(_) => match String::from_utf8(input.to_vec()) {
            Ok(s) => transliterate(&s),
            Err(_) => input.to_vec(),
        },
    }
}

/// Reverses transliteration: maps the single-byte punctuation stand-ins
/// back to their umlauts, producing the canonical Unicode form stored as
/// `current_text`. Non-ASCII bytes (shouldn't occur; the wire is 7-bit) are
/// replaced with the Unicode replacement character.
pub fn reverse_transliterate(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| reverse_char(b).unwrap_or(b as char))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transliterates_all_seven_umlauts() {
        let translit = transliterate("\u{00e4}\u{00f6}\u{00fc}\u{00df}\u{00c4}\u{00d6}\u{00dc}");
        assert_eq!(translit, b"{|}~[\\]");
    }

    #[test]
    fn transliterate_passes_through_ascii() {
        assert_eq!(transliterate("Hallo"), b"Hallo");
    }

    #[test]
    fn transliterate_drops_non_ascii_non_umlaut() {
        assert_eq!(transliterate("Caf\u{00e9}"), b"Caf");
    }

    #[test]
    fn ascii_filter_keeps_umlauts_but_drops_other_unicode() {
        assert_eq!(ascii_filter("Caf\u{00e9} m\u{00fc}de"), "Caf m\u{00fc}de");
    }

    #[test]
    fn reverse_transliterate_round_trips() {
        let text = "Hallo \u{00e4}";
        let bytes = transliterate(text);
        assert_eq!(reverse_transliterate(&bytes), text);
    }

    #[test]
    fn transliterate_bytes_handles_raw_utf8_input() {
        let input = "Gr\u{00fc}\u{00df}e".as_bytes();
        assert_eq!(transliterate_bytes(input), transliterate("Gr\u{00fc}\u{00df}e"));
    }
}
