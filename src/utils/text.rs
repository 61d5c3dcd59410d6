/// Collapses every run of whitespace into a single space and trims the ends.
pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn word_count(s: &str) -> usize {
    s.split_whitespace().count()
}

pub fn truncate_words(s: &str, max_words: usize) -> String {
    s.split_whitespace()
        .take(max_words)
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn starts_with_uppercase(s: &str) -> bool {
    s.chars().next().is_some_and(|c| c.is_uppercase())
}

/// Lowercases and replaces anything that is not a letter with a space.
pub fn letters_only_lowercase(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_alphabetic() {
                c.to_lowercase().next().unwrap_or(c)
            } else {
                ' '
            }
        })
        .collect()
}

/// Keeps letters, digits, apostrophes and hyphens; everything else becomes a space.
pub fn strip_punctuation(s: &str) -> String {
    let kept: String = s
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '\'' || c == '-' {
                c
            } else {
                ' '
            }
        })
        .collect();
    collapse_whitespace(&kept)
}

pub fn trim_trailing_punctuation(s: &str) -> &str {
    s.trim()
        .trim_end_matches(|c: char| matches!(c, '.' | ',' | ';' | ':' | '!' | '?'))
        .trim_end()
}

pub fn has_article(s: &str) -> bool {
    let lower = s.trim_start().to_lowercase();
    ["a ", "an ", "the ", "his ", "her ", "their ", "its "]
        .iter()
        .any(|a| lower.starts_with(a))
}

/// Prefixes `a`/`an` unless the phrase already opens with an article or possessive.
pub fn with_article(s: &str) -> String {
    let s = s.trim();
    if s.is_empty() || has_article(s) {
        return s.to_string();
    }
    let article = match s.chars().next().map(|c| c.to_ascii_lowercase()) {
        Some('a' | 'e' | 'i' | 'o' | 'u') => "an",
        _ => "a",
    };
    format!("{} {}", article, s)
}

/// A phrase like "curious eyes" or "rosy cheeks" reads as plural.
pub fn looks_plural(s: &str) -> bool {
    s.split_whitespace()
        .last()
        .map(|w| {
            let w = w.to_lowercase();
            w.len() > 3 && w.ends_with('s') && !w.ends_with("ss") && !w.ends_with("us")
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collapse_and_truncate() {
        assert_eq!(collapse_whitespace("  a \t b\n\nc  "), "a b c");
        assert_eq!(truncate_words("one two three four", 2), "one two");
        assert_eq!(word_count("Luna - small orange fox"), 5);
    }

    #[test]
    fn test_letters_only() {
        assert_eq!(letters_only_lowercase("Luna's 2 Foxes!"), "luna s   foxes ");
        assert_eq!(strip_punctuation("**Luna**, the fox!"), "Luna the fox");
    }

    #[test]
    fn test_articles() {
        assert_eq!(with_article("small orange fox"), "a small orange fox");
        assert_eq!(with_article("old owl"), "an old owl");
        assert_eq!(with_article("a brave knight"), "a brave knight");
        assert!(looks_plural("curious eyes"));
        assert!(!looks_plural("green scarf"));
        assert!(!looks_plural("glass"));
    }
}
