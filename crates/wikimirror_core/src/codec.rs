//! Reversible mapping between wiki titles and filesystem-safe file names.
//!
//! Every character that is unsafe in a path component, plus the escape character `%`
//! itself, is written as `%XX` (upper-case hex of its single UTF-8 byte). All other
//! characters pass through untouched, so `Main Page` stays readable on disk. Because `%`
//! is always escaped, every `%` in an encoded name starts exactly one escape token and the
//! decoder never has to guess.

use crate::error::CodecError;

pub const PAGE_EXTENSION: &str = ".html";

const ESCAPE: char = '%';

fn must_escape(ch: char) -> bool {
    matches!(
        ch,
        '%' | '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|'
    ) || ch.is_ascii_control()
}

/// Encode a title without adding the page extension.
pub fn encode_title(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    for ch in title.chars() {
        if must_escape(ch) {
            // must_escape only admits ASCII, so the char is a single byte
            out.push(ESCAPE);
            out.push_str(&format!("{:02X}", ch as u32));
        } else {
            out.push(ch);
        }
    }
    out
}

/// Exact inverse of [`encode_title`]. Rejects escapes that the encoder would never emit.
pub fn decode_title(encoded: &str) -> Result<String, CodecError> {
    let mut out = String::with_capacity(encoded.len());
    let mut rest = encoded;
    let mut offset = 0usize;

    while let Some(position) = rest.find(ESCAPE) {
        out.push_str(&rest[..position]);
        let token_start = offset + position;
        let after = &rest[position + 1..];
        let sequence = after.get(..2).ok_or(CodecError::TruncatedEscape {
            offset: token_start,
        })?;
        let value = u8::from_str_radix(sequence, 16)
            .ok()
            .filter(|_| sequence.bytes().all(|b| b.is_ascii_hexdigit()))
            .ok_or_else(|| CodecError::InvalidEscape {
                offset: token_start,
                sequence: sequence.to_string(),
            })?;
        let ch = char::from(value);
        if !value.is_ascii() || !must_escape(ch) || sequence != format!("{value:02X}") {
            return Err(CodecError::NonCanonicalEscape {
                sequence: sequence.to_string(),
            });
        }
        out.push(ch);
        let consumed = position + 1 + 2;
        offset += consumed;
        rest = &rest[consumed..];
    }
    out.push_str(rest);
    Ok(out)
}

pub fn title_to_filename(title: &str) -> String {
    format!("{}{PAGE_EXTENSION}", encode_title(title))
}

pub fn filename_to_title(filename: &str) -> Result<String, CodecError> {
    let stem = filename
        .strip_suffix(PAGE_EXTENSION)
        .ok_or_else(|| CodecError::MissingExtension {
            filename: filename.to_string(),
            expected: PAGE_EXTENSION,
        })?;
    decode_title(stem)
}

/// Escape an on-disk file name for use inside an `href` attribute. Browsers decode the
/// attribute once, so the codec's own `%` has to survive as `%25`.
pub fn filename_to_href(filename: &str) -> String {
    let mut out = String::with_capacity(filename.len());
    for byte in filename.bytes() {
        let unreserved = matches!(
            byte,
            b'-' | b'_' | b'.' | b'~' | b'(' | b')' | b',' | b'\'' | b'!'
        );
        if byte.is_ascii_alphanumeric() || unreserved {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

/// Decode `%XX` sequences in a URL path segment. Invalid sequences are kept verbatim.
pub fn percent_decode_url(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut index = 0usize;
    while index < bytes.len() {
        if bytes[index] == b'%'
            && let Some(hex) = value.get(index + 1..index + 3)
            && let Ok(decoded) = u8::from_str_radix(hex, 16)
        {
            out.push(decoded);
            index += 3;
            continue;
        }
        out.push(bytes[index]);
        index += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
