//! Dangerous character detection.

use unicode_normalization::UnicodeNormalization;

/// Characters with meaning to a POSIX shell.
const SHELL_METACHARACTERS: &[char] = &[';', '|', '&', '$', '`', '"', '\'', '(', ')', '<', '>'];

/// Zero-width and bidirectional formatting characters. They are invisible in
/// a terminal and can make a path read differently from what it is.
const INVISIBLE_CHARACTERS: &[char] = &[
    '\u{200B}', '\u{200C}', '\u{200D}', '\u{200E}', '\u{200F}', '\u{202A}', '\u{202B}',
    '\u{202C}', '\u{202D}', '\u{202E}', '\u{2066}', '\u{2067}', '\u{2068}', '\u{2069}',
    '\u{FEFF}',
];

/// Returns true if `c` may never appear in a mount path.
#[must_use]
pub fn is_dangerous_character(c: char) -> bool {
    c == '\0'
        || c.is_control()
        || SHELL_METACHARACTERS.contains(&c)
        || INVISIBLE_CHARACTERS.contains(&c)
        || c == char::REPLACEMENT_CHARACTER
}

/// Finds the first dangerous character in `input`.
///
/// The input is checked as given and again after NFKC normalisation, so
/// compatibility forms such as the fullwidth semicolon (`U+FF1B`) or the
/// small dollar sign (`U+FE69`) are caught. The character reported is the
/// one from the original input.
#[must_use]
pub fn find_dangerous_character(input: &str) -> Option<char> {
    if let Some(c) = input.chars().find(|&c| is_dangerous_character(c)) {
        return Some(c);
    }

    for c in input.chars() {
        let mut buf = [0u8; 4];
        if c.encode_utf8(&mut buf).nfkc().any(is_dangerous_character) {
            return Some(c);
        }
    }

    None
}
