//! Static discovery of derivation references inside expression bodies.
//!
//! The scan is lexical: it collects identifier tokens outside string
//! literals and keeps those that name another derivation. It over-approximates:
//! a keyword argument spelled like a derivation counts as a reference. The
//! language itself is never parsed.
//!
//! Shell inputs are bound as environment variables, so in shell bodies only
//! `$name` and `${name}` expansions count.

use crate::language::Language;

/// Collect identifier tokens from `source` that may refer to other
/// derivations, in order of first appearance and without duplicates.
pub(crate) fn scan_identifiers(source: &str, language: Language) -> Vec<&str> {
    let mut found: Vec<&str> = Vec::new();
    let bytes = source.as_bytes();
    let mut pos = 0;
    let mut previous: Option<u8> = None;

    while let Some(&byte) = bytes.get(pos) {
        if is_quote(byte, language) {
            pos = skip_string(bytes, pos, byte, language != Language::Shell);
            previous = Some(byte);
            continue;
        }
        if is_comment_start(bytes, pos, language) {
            pos = skip_line(bytes, pos);
            previous = None;
            continue;
        }
        if byte.is_ascii_digit() {
            pos = skip_word(bytes, pos);
            previous = Some(byte);
            continue;
        }
        if is_ident_start(byte) {
            let end = skip_word(bytes, pos);
            if !is_member_access(previous, language)
                && (language != Language::Shell || is_expansion(bytes, pos))
                && let Some(ident) = source.get(pos..end)
                && !found.contains(&ident)
            {
                found.push(ident);
            }
            previous = bytes.get(end.saturating_sub(1)).copied();
            pos = end;
            continue;
        }
        previous = Some(byte);
        pos += 1;
    }
    found
}

/// Whether `name` is a valid derivation identifier.
pub(crate) fn is_identifier(name: &str) -> bool {
    let mut bytes = name.bytes();
    bytes.next().is_some_and(is_ident_start) && bytes.all(is_ident_continue)
}

const fn is_ident_start(byte: u8) -> bool {
    byte.is_ascii_alphabetic() || byte == b'_'
}

const fn is_ident_continue(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_'
}

const fn is_quote(byte: u8, language: Language) -> bool {
    match language {
        // Double quotes in shell still expand `$name`, so only single quotes
        // hide references.
        Language::Shell => byte == b'\'',
        Language::Jinja | Language::Python | Language::R => byte == b'\'' || byte == b'"',
    }
}

fn is_comment_start(bytes: &[u8], pos: usize, language: Language) -> bool {
    match language {
        Language::Shell | Language::Python | Language::R => bytes.get(pos) == Some(&b'#'),
        Language::Jinja => bytes.get(pos) == Some(&b'{') && bytes.get(pos + 1) == Some(&b'#'),
    }
}

const fn is_member_access(previous: Option<u8>, language: Language) -> bool {
    match (previous, language) {
        (Some(b'.'), Language::Jinja | Language::Python | Language::R) => true,
        (Some(b'$' | b'@'), Language::R) => true,
        _ => false,
    }
}

fn is_expansion(bytes: &[u8], pos: usize) -> bool {
    let before = |back: usize| pos.checked_sub(back).and_then(|at| bytes.get(at)).copied();
    match before(1) {
        Some(b'$') => true,
        Some(b'{') => before(2) == Some(b'$'),
        _ => false,
    }
}

fn skip_word(bytes: &[u8], start: usize) -> usize {
    let mut pos = start;
    while bytes.get(pos).copied().is_some_and(is_ident_continue) {
        pos += 1;
    }
    pos
}

fn skip_string(bytes: &[u8], start: usize, quote: u8, escapes: bool) -> usize {
    let mut pos = start + 1;
    while let Some(&byte) = bytes.get(pos) {
        if escapes && byte == b'\\' {
            pos += 2;
            continue;
        }
        pos += 1;
        if byte == quote {
            break;
        }
    }
    pos
}

fn skip_line(bytes: &[u8], start: usize) -> usize {
    let mut pos = start;
    while bytes.get(pos).is_some_and(|&b| b != b'\n') {
        pos += 1;
    }
    pos
}
