//! IBIS telegram composition (component B).
//!
//! A telegram is `prefix + payload + CR`, followed by a single check byte:
//! the XOR of every preceding byte, seeded with `0x7F`. The check byte is
//! appended raw and may have its high bit set; the serial link carries it
//! as 7 data bits + even parity (component C), not as a 7-bit-clean value.

use crate::charset::transliterate;

const CR: u8 = 0x0D;
const CHECKSUM_SEED: u8 = 0x7F;

/// XORs the checksum seed with every byte in `bytes`.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(CHECKSUM_SEED, |acc, &b| acc ^ b)
}

/// Appends a CR and the XOR check byte to `command`, returning the full
/// telegram ready for the wire.
pub fn finish_telegram(mut command: Vec<u8>) -> Vec<u8> {
    command.push(CR);
    let check = checksum(&command);
    command.push(check);
    command
}

fn pad_to_multiple(mut payload: Vec<u8>, block: usize) -> Vec<u8> {
    let remainder = payload.len() % block;
    if remainder != 0 {
        payload.extend(std::iter::repeat(b' ').take(block - remainder));
    }
    payload
}

/// `zI<blocks><payload>` — "next stop", short form. `<blocks>` is the
/// 4-byte block count as a single ASCII digit; text is transliterated,
/// uppercased, and space-padded to a multiple of 4 bytes. This is the only
/// command the controller's refresh loop actually emits.
pub fn next_stop_short(text: &str) -> Vec<u8> {
    next_stop_short_from_bytes(&transliterate(text))
}

/// Same as `next_stop_short`, but takes bytes that have already been
/// transliterated (and, by the controller, truncated to 36 bytes) rather
/// than transliterating `text` itself. The controller truncates on
/// already-transliterated bytes (spec: truncation is post-transliteration),
/// so encoding has to take that exact byte sequence rather than re-deriving
/// it from the original string.
pub fn next_stop_short_from_bytes(translit: &[u8]) -> Vec<u8> {
    let upper: Vec<u8> = translit.iter().map(|b| b.to_ascii_uppercase()).collect();
    let payload = pad_to_multiple(upper, 4);
    let blocks = (payload.len() / 4) as u8;
    let mut command = Vec::with_capacity(3 + payload.len());
    command.push(b'z');
    command.push(b'I');
    command.push(b'0' + blocks);
    command.extend_from_slice(&payload);
    finish_telegram(command)
}

/// `l<NNN>` — set line number (3-digit, zero-padded).
pub fn line_number(line_number: u16) -> Vec<u8> {
    let mut command = vec![b'l'];
    command.extend(format!("{:03}", line_number).into_bytes());
    finish_telegram(command)
}

/// `lE<NN>` — set special character (2-digit).
pub fn special_character(character: u8) -> Vec<u8> {
    let mut command = vec![b'l', b'E'];
    command.extend(format!("{:02}", character).into_bytes());
    finish_telegram(command)
}

/// `z<NNN>` — set target/route number (3-digit).
pub fn target_number(target_number: u16) -> Vec<u8> {
    let mut command = vec![b'z'];
    command.extend(format!("{:03}", target_number).into_bytes());
    finish_telegram(command)
}

/// `u<HHMM>` — set the device's onboard clock.
pub fn set_time(hours: u8, minutes: u8) -> Vec<u8> {
    let mut command = vec![b'u'];
    command.extend(format!("{:02}{:02}", hours, minutes).into_bytes());
    finish_telegram(command)
}

/// `d<DDMMYYYY>` — set the device's onboard date.
pub fn set_date(day: u8, month: u8, year: u16) -> Vec<u8> {
    let mut command = vec![b'd'];
    command.extend(format!("{:02}{:02}{}", day, month, year).into_bytes());
    finish_telegram(command)
}

/// `zA<blocks><payload>` — target text, 16-byte block padding.
pub fn target_text_16(text: &str) -> Vec<u8> {
    let translit = transliterate(text);
    let upper: Vec<u8> = translit.iter().map(|b| b.to_ascii_uppercase()).collect();
    let payload = pad_to_multiple(upper, 16);
    let blocks = (payload.len() / 16) as u8;
    let mut command = vec![b'z', b'A', b'0' + blocks];
    command.extend_from_slice(&payload);
    finish_telegram(command)
}

/// `aA<id><blocks><payload>` — target text addressed by numeric target id.
pub fn target_text_addressed(id: u8, text: &str) -> Vec<u8> {
    let translit = transliterate(text);
    let upper: Vec<u8> = translit.iter().map(|b| b.to_ascii_uppercase()).collect();
    let payload = pad_to_multiple(upper, 16);
    let blocks = (payload.len() / 16) as u8;
    let mut command = vec![b'a', b'A'];
    command.extend(id.to_string().into_bytes());
    command.push(b'0' + blocks);
    command.extend_from_slice(&payload);
    finish_telegram(command)
}

/// `v<payload>` — next-stop, fixed-width form, space-padded to `length`
/// (16 by default).
pub fn next_stop_fixed(text: &str, length: usize) -> Vec<u8> {
    let translit = transliterate(text);
    let mut upper: Vec<u8> = translit.iter().map(|b| b.to_ascii_uppercase()).collect();
    if upper.len() < length {
        upper.extend(std::iter::repeat(b' ').take(length - upper.len()));
    }
    let mut command = vec![b'v'];
    command.extend_from_slice(&upper);
    finish_telegram(command)
}
