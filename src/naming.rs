//! Title normalization and filename derivation.
//!
//! The resolved filename is a pure function of `(title, original extension)`:
//! `slug(title) + '.' + extension(original_filename)`. There is no other
//! mutation path for it.

/// Placeholder used when normalization strips a title down to nothing.
const FALLBACK_TITLE: &str = "Untitled Asset";

/// Placeholder used when slugging strips a title down to nothing.
const FALLBACK_SLUG: &str = "untitled";

/// Normalize a raw title (usually a filename) into a display title.
///
/// Trim, drop the extension when the input looks like a filename, turn
/// separators into spaces, strip everything that is not alphanumeric or a
/// space, collapse runs of whitespace, then title-case each word. Never
/// returns an empty string.
pub fn normalize_title(raw: &str) -> String {
    let raw = raw.trim();
    let stem = match raw.rsplit_once('.') {
        // Only treat the suffix as an extension if it looks like one.
        Some((stem, ext)) if !stem.is_empty() && is_extension(ext) => stem,
        _ => raw,
    };

    let spaced: String = stem
        .chars()
        .map(|c| if matches!(c, '_' | '-' | '.') { ' ' } else { c })
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect();

    let title = spaced
        .split_whitespace()
        .map(title_case_word)
        .collect::<Vec<_>>()
        .join(" ");

    if title.is_empty() {
        FALLBACK_TITLE.to_string()
    } else {
        title
    }
}

/// Lowercase ASCII slug of a title: `[a-z0-9-]` only. Separators become
/// hyphens, runs of hyphens collapse, non-ASCII letters are dropped
/// outright rather than turned into separators. Never empty.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut last_was_hyphen = true; // suppress a leading hyphen

    for c in title.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_was_hyphen = false;
        } else if c.is_alphanumeric() {
            continue;
        } else if !last_was_hyphen {
            slug.push('-');
            last_was_hyphen = true;
        }
    }

    while slug.ends_with('-') {
        slug.pop();
    }

    if slug.is_empty() {
        FALLBACK_SLUG.to_string()
    } else {
        slug
    }
}

/// Derive the stored filename from a title and the original filename.
///
/// The extension always comes from the original filename, lowercased;
/// originals without an extension resolve to the bare slug.
pub fn resolved_filename(title: &str, original_filename: &str) -> String {
    let slug = slugify(title);
    match file_extension(original_filename) {
        Some(ext) => format!("{}.{}", slug, ext),
        None => slug,
    }
}

/// Lowercased extension of a filename, if it has one.
pub fn file_extension(filename: &str) -> Option<String> {
    match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && is_extension(ext) => Some(ext.to_lowercase()),
        _ => None,
    }
}

fn is_extension(candidate: &str) -> bool {
    !candidate.is_empty()
        && candidate.len() <= 8
        && candidate.chars().all(|c| c.is_ascii_alphanumeric())
}

fn title_case_word(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(|c| c.to_lowercase())).collect(),
        None => String::new(),
    }
}
