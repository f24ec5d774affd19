//! Filename canonicalization for comparison.
//!
//! All string folding used by the matcher lives here; no other module
//! mutates strings for comparison. Two profiles: `Strict` decides whether a
//! rename is needed at all, `Loose` is what name similarity runs on.

use unicode_normalization::UnicodeNormalization;

/// Normalization profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    /// NFC only. Used for exact-equality checks.
    Strict,
    /// NFKC, zero-width stripping, whitespace collapse, lowercase.
    /// NFKC also unifies CJK half-width and full-width forms.
    Loose,
}

/// Zero-width and BOM-like characters that drift between sites.
const ZERO_WIDTH: [char; 7] = [
    '\u{200B}', '\u{200C}', '\u{200D}', '\u{200E}', '\u{200F}', '\u{2060}', '\u{FEFF}',
];

/// Canonicalize a string under the given profile.
///
/// Idempotent: `normalize(normalize(s, p), p) == normalize(s, p)`.
pub fn normalize(s: &str, profile: Profile) -> String {
    match profile {
        Profile::Strict => s.nfc().collect(),
        Profile::Loose => {
            let folded: String = s
                .nfkc()
                .filter(|c| !ZERO_WIDTH.contains(c))
                .collect::<String>()
                .to_lowercase();
            folded.split_whitespace().collect::<Vec<_>>().join(" ")
        }
    }
}

/// Normalize a relative path per-component under the given profile.
///
/// Separators are unified to `/` so client- and site-reported paths compare.
pub fn normalize_path(path: &str, profile: Profile) -> String {
    path.split(['/', '\\'])
        .map(|part| normalize(part, profile))
        .collect::<Vec<_>>()
        .join("/")
}

/// Basename of a torrent-relative path.
pub fn basename(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// Similarity of two names under loose normalization, in `0.0..=1.0`.
///
/// Bigram overlap (Sørensen–Dice) over the loose forms; symmetric and
/// deterministic, so pairing never depends on argument order.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a = normalize(a, Profile::Loose);
    let b = normalize(b, Profile::Loose);
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    strsim::sorensen_dice(&a, &b)
}

/// Build a search query from a filename.
///
/// Keeps only the basename, replaces punctuation, garbled replacement
/// characters and invisible codepoints with spaces, and collapses runs of
/// whitespace. Gazelle filelist search matches on substrings, so the shape
/// of the words matters more than the separators.
pub fn search_query(filename: &str) -> String {
    let base = basename(filename);
    let replaced: String = base
        .chars()
        .map(|c| if is_query_junk(c) { ' ' } else { c })
        .collect();
    replaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_query_junk(c: char) -> bool {
    if c.is_control() {
        return true;
    }
    if ZERO_WIDTH.contains(&c) {
        return true;
    }
    matches!(
        c,
        '?' | '？'
            | '�'
            | '_'
            | '-'
            | '.'
            | '·'
            | '~'
            | '`'
            | '!'
            | '@'
            | '#'
            | '$'
            | '%'
            | '^'
            | '&'
            | '*'
            | '+'
            | '='
            | '|'
            | '\\'
            | ':'
            | '"'
            | ';'
            | '\''
            | '<'
            | '>'
            | ','
            | '/'
            | '\u{00A0}'
            | '\u{3000}'
    ) || ('\u{2000}'..='\u{200A}').contains(&c)
}

/// Audio extensions the gate and the matcher treat as essential content.
pub const AUDIO_EXTENSIONS: [&str; 10] = [
    "flac", "mp3", "m4a", "aac", "ogg", "opus", "wav", "ape", "wv", "dsf",
];

/// Lowercased extension of a path, empty if none.
pub fn extension(path: &str) -> String {
    basename(path)
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default()
}

/// Whether the path names an audio file.
pub fn is_audio(path: &str) -> bool {
    let ext = extension(path);
    AUDIO_EXTENSIONS.iter().any(|e| *e == ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_is_nfc_only() {
        // U+0041 U+030A (A + combining ring) composes to U+00C5
        let decomposed = "A\u{030A}lbum";
        assert_eq!(normalize(decomposed, Profile::Strict), "Ålbum");
        // Case and width are untouched
        assert_eq!(normalize("ＡＢＣ", Profile::Strict), "ＡＢＣ");
    }

    #[test]
    fn loose_strips_zero_width() {
        let s = "01\u{200B} - Track\u{FEFF}.flac";
        assert_eq!(normalize(s, Profile::Loose), "01 - track.flac");
    }

    #[test]
    fn loose_folds_fullwidth() {
        assert_eq!(normalize("ＡＢＣ　ＤＥＦ", Profile::Loose), "abc def");
        assert_eq!(normalize("ｶﾀｶﾅ", Profile::Loose), "カタカナ");
    }

    #[test]
    fn loose_collapses_whitespace() {
        assert_eq!(normalize("a   b\t c", Profile::Loose), "a b c");
    }

    #[test]
    fn normalize_is_idempotent() {
        for s in ["01\u{200B} - Ｔrack.flac", "A\u{030A} b  c", "plain"] {
            for p in [Profile::Strict, Profile::Loose] {
                let once = normalize(s, p);
                assert_eq!(normalize(&once, p), once, "{s:?} under {p:?}");
            }
        }
    }

    #[test]
    fn path_components_normalized_separately() {
        let p = "Album\\01\u{200B}.flac";
        assert_eq!(normalize_path(p, Profile::Loose), "album/01.flac");
    }

    #[test]
    fn similarity_pairs_zero_width_variants() {
        let a = "01 - Come\u{200B} Together.flac";
        let b = "01 - Come Together.flac";
        assert!(similarity(a, b) > 0.99);
    }

    #[test]
    fn similarity_separates_different_tracks() {
        let a = "01 - Come Together.flac";
        let b = "07 - Here Comes the Sun.flac";
        assert!(similarity(a, b) < 0.6);
    }

    #[test]
    fn search_query_sanitizes() {
        assert_eq!(
            search_query("Album/01_-_Track?Name.flac"),
            "01 Track Name flac"
        );
        assert_eq!(search_query("�乱码？file.mp3"), "乱码 file mp3");
    }

    #[test]
    fn audio_detection() {
        assert!(is_audio("cd1/01 - a.FLAC"));
        assert!(is_audio("b.mp3"));
        assert!(!is_audio("cover.jpg"));
        assert!(!is_audio("noext"));
    }
}
