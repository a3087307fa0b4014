//! Text helpers shared by the chunking strategies, the fingerprint and the
//! diff scorer. All functions are pure.

use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

/// Unicode letter/digit runs
static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\p{L}\p{N}]+").expect("token regex"));

/// Numeric literals: space-grouped thousands first, then plain runs with separators
static NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"-?\d{1,3}(?:[ \x{00A0}]\d{3})+(?:[.,]\d+)*|-?\d+(?:[.,]\d+)*").expect("number regex")
});

/// `[P001]` paragraph markers at line starts
static PARAGRAPH_MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\[P\d{3,}\] ?").expect("paragraph marker regex"));

/// `[Pnnn]` marker for paragraph `n` (1-based)
pub fn paragraph_marker(n: usize) -> String
{
    format!("[P{n:03}]")
}

/// Text with paragraph markers removed; they carry layout, not content
pub fn strip_paragraph_markers(text: &str) -> Cow<'_, str>
{
    PARAGRAPH_MARKER_RE.replace_all(text, "")
}

/// Collapse every whitespace run to one space and trim
pub fn normalize_whitespace(s: &str) -> String
{
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// CRLF/CR to LF, trailing whitespace trimmed per line, whole text trimmed
pub fn canonical_text(raw: &str) -> String
{
    let unified = raw
        .replace("\r\n", "\n")
        .replace('\r', "\n");

    unified
        .split('\n')
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// One entry of the line list the chunking strategies work on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkLine
{
    pub text: String,
    /// A blank line separated this line from the previous one
    pub after_break: bool,
}

/// Line list of already canonical text.
///
/// Blank lines are dropped and remembered as paragraph breaks. Texts of at
/// most two lines are cut into pseudo-lines at `|` separators and sentence
/// ends. Lines longer than `max_line_chars` (0 = unbounded) are split into
/// pieces of at most that many characters, preferring whitespace.
pub fn chunk_lines(
    canonical: &str,
    max_line_chars: usize,
) -> Vec<ChunkLine>
{
    let raw: Vec<&str> = canonical
        .split('\n')
        .collect();
    let pseudo = raw.len() <= 2;

    let mut out = Vec::new();
    let mut pending_break = false;

    for line in raw
    {
        if line
            .trim()
            .is_empty()
        {
            pending_break = !out.is_empty();
            continue;
        }

        if pseudo
        {
            let pieces = line
                .split('|')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .flat_map(split_sentences);
            for piece in pieces
            {
                push_bounded(&mut out, &piece, pending_break, max_line_chars);
                pending_break = false;
            }
        }
        else
        {
            push_bounded(&mut out, line, pending_break, max_line_chars);
        }

        pending_break = false;
    }

    out
}

/// Text of `chunk_lines`
pub fn normalized_lines(
    canonical: &str,
    max_line_chars: usize,
) -> Vec<String>
{
    chunk_lines(canonical, max_line_chars)
        .into_iter()
        .map(|l| l.text)
        .collect()
}

fn push_bounded(
    out: &mut Vec<ChunkLine>,
    line: &str,
    after_break: bool,
    max_chars: usize,
)
{
    let mut rest = line;
    let mut after_break = after_break;

    while max_chars > 0
        && rest
            .chars()
            .count()
            > max_chars
    {
        let head = truncate_chars(rest, max_chars);
        // Break on whitespace in the second half of the piece, else hard cut
        let cut = head
            .rfind(char::is_whitespace)
            .filter(|&at| at > head.len() / 2)
            .unwrap_or(head.len());

        out.push(ChunkLine { text: rest[..cut].trim_end().to_string(), after_break });
        rest = rest[cut..].trim_start();
        after_break = false;
    }

    if !rest
        .trim()
        .is_empty()
    {
        out.push(ChunkLine { text: rest.to_string(), after_break });
    }
}

/// Lowercase alphanumeric tokens, purely numeric tokens dropped
pub fn tokens(text: &str) -> Vec<String>
{
    let lower = strip_paragraph_markers(text).to_lowercase();

    TOKEN_RE
        .find_iter(&lower)
        .map(|m| m.as_str())
        .filter(|t| !t.chars().all(char::is_numeric))
        .map(str::to_string)
        .collect()
}

/// Distinct tokens of `text`
pub fn token_set(text: &str) -> HashSet<String>
{
    tokens(text)
        .into_iter()
        .collect()
}

/// Alphanumeric runs of an anchor phrase, original case kept
pub fn phrase_tokens(phrase: &str) -> Vec<&str>
{
    TOKEN_RE
        .find_iter(phrase)
        .map(|m| m.as_str())
        .collect()
}

/// Set Jaccard similarity; two empty sets are identical
pub fn jaccard(
    a: &HashSet<String>,
    b: &HashSet<String>,
) -> f64
{
    if a.is_empty() && b.is_empty()
    {
        return 1.0;
    }

    let inter = a
        .intersection(b)
        .count();
    let union = a.len() + b.len() - inter;

    if union == 0 { 0.0 } else { inter as f64 / union as f64 }
}

/// Extract numeric values, sorted ascending.
///
/// Spaces and NBSP between 3-digit groups are grouping. With both `.` and `,`
/// present the last one is the decimal separator. With a single kind, one
/// occurrence is a decimal separator and several are grouping.
pub fn extract_numbers(text: &str) -> Vec<f64>
{
    let text = strip_paragraph_markers(text);
    let mut out: Vec<f64> = NUMBER_RE
        .find_iter(&text)
        .filter_map(|m| parse_number(m.as_str()))
        .collect();

    out.sort_by(f64::total_cmp);
    out
}

/// Parse one numeric literal matched by the number pattern
pub fn parse_number(raw: &str) -> Option<f64>
{
    // Drop space grouping
    let compact: String = raw
        .chars()
        .filter(|c| *c != ' ' && *c != '\u{00A0}')
        .collect();

    let last_dot = compact.rfind('.');
    let last_comma = compact.rfind(',');

    let normalized = match (last_dot, last_comma)
    {
        (Some(d), Some(c)) =>
        {
            // Last separator is the decimal point
            let dec = d.max(c);
            let int_part: String = compact[..dec]
                .chars()
                .filter(|ch| *ch != '.' && *ch != ',')
                .collect();
            format!("{}.{}", int_part, &compact[dec + 1..])
        }
        (Some(_), None) => single_separator(&compact, '.'),
        (None, Some(_)) => single_separator(&compact, ','),
        (None, None) => compact,
    };

    normalized
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

fn single_separator(
    s: &str,
    sep: char,
) -> String
{
    let count = s
        .chars()
        .filter(|c| *c == sep)
        .count();

    if count == 1
    {
        s.replace(sep, ".")
    }
    else
    {
        s.replace(sep, "")
    }
}

/// First `max_chars` characters of the whitespace-normalized text
pub fn excerpt(
    s: &str,
    max_chars: usize,
) -> String
{
    truncate_chars(&normalize_whitespace(s), max_chars).to_string()
}

/// Prefix of at most `max_chars` characters, on a char boundary
pub fn truncate_chars(
    s: &str,
    max_chars: usize,
) -> &str
{
    match s
        .char_indices()
        .nth(max_chars)
    {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Verbatim prefix of `s` covering its first `words` whitespace-separated
/// words, shortened to whole words within `max_chars`
pub fn opening_words(
    s: &str,
    words: usize,
    max_chars: usize,
) -> &str
{
    let s = s.trim_start();

    // (byte end, chars before it) of each word
    let mut ends: Vec<(usize, usize)> = Vec::new();
    let mut in_word = false;
    let mut seen = 0usize;

    for (idx, ch) in s.char_indices()
    {
        if ch.is_whitespace()
        {
            if in_word
            {
                ends.push((idx, seen));
                in_word = false;

                if ends.len() >= words
                {
                    break;
                }
            }
        }
        else
        {
            in_word = true;
        }
        seen += 1;
    }

    if in_word && ends.len() < words
    {
        ends.push((s.len(), seen));
    }

    match ends
        .iter()
        .rev()
        .find(|(_, chars)| *chars <= max_chars)
    {
        Some((end, _)) => &s[..*end],
        None => truncate_chars(s, max_chars),
    }
}

/// Stable lowercase key: alphanumeric runs joined with '-'
pub fn slugify_key(
    value: &str,
    max_len: usize,
) -> String
{
    let lower = normalize_whitespace(value).to_lowercase();
    let slug = TOKEN_RE
        .find_iter(&lower)
        .map(|m| m.as_str())
        .collect::<Vec<_>>()
        .join("-");

    if slug.is_empty()
    {
        return "chunk".to_string();
    }

    truncate_chars(&slug, max_len)
        .trim_end_matches('-')
        .to_string()
}

/// blake3 hex digest of the text
pub fn content_hash(text: &str) -> String
{
    blake3::hash(text.as_bytes())
        .to_hex()
        .to_string()
}

/// Split after '.', '!' or '?' followed by whitespace
pub fn split_sentences(text: &str) -> Vec<String>
{
    let mut out = Vec::new();
    let mut start = 0usize;
    let mut prev_terminal = false;

    for (idx, ch) in text.char_indices()
    {
        if prev_terminal && ch.is_whitespace()
        {
            let piece = text[start..idx].trim();
            if !piece.is_empty()
            {
                out.push(piece.to_string());
            }
            start = idx;
        }
        prev_terminal = matches!(ch, '.' | '!' | '?');
    }

    let tail = text[start..].trim();
    if !tail.is_empty()
    {
        out.push(tail.to_string());
    }

    out
}

/// Byte index of the char boundary right after `idx`
pub fn next_char_boundary(
    s: &str,
    idx: usize,
) -> usize
{
    if idx >= s.len()
    {
        return s.len();
    }

    s[idx..]
        .chars()
        .next()
        .map(|c| idx + c.len_utf8())
        .unwrap_or(s.len())
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn tokens_drop_numbers_and_lowercase()
    {
        assert_eq!(tokens("Cena: 100 PLN, Żółw 2x"), vec!["cena", "pln", "żółw", "2x"]);
    }

    #[test]
    fn paragraph_markers_are_not_content()
    {
        let marked = format!("{} Price 100 PLN\n{} Reviews", paragraph_marker(7), paragraph_marker(1234));

        assert_eq!(marked, "[P007] Price 100 PLN\n[P1234] Reviews");
        assert_eq!(extract_numbers(&marked), vec![100.0]);
        assert_eq!(tokens(&marked), vec!["price", "pln", "reviews"]);
        // Only line-leading markers are stripped
        assert_eq!(extract_numbers("see [P002] above"), vec![2.0]);
    }

    #[test]
    fn canonical_text_unifies_newlines()
    {
        assert_eq!(canonical_text("  a  \r\nb\t\r\rc  \n\n"), "a\nb\n\nc");
        assert_eq!(normalized_lines("a\n\n b\nc", 0), vec!["a", " b", "c"]);
    }

    #[test]
    fn chunk_lines_mark_paragraph_breaks()
    {
        let lines = chunk_lines("a\n\n\nb\nc", 0);

        let breaks: Vec<_> = lines
            .iter()
            .map(|l| (l.text.as_str(), l.after_break))
            .collect();
        assert_eq!(breaks, vec![("a", false), ("b", true), ("c", false)]);
    }

    #[test]
    fn short_texts_become_pseudo_lines()
    {
        assert_eq!(
            normalized_lines("Home | Shop | Price 100 PLN. In stock now! Order today", 0),
            vec!["Home", "Shop", "Price 100 PLN.", "In stock now!", "Order today"]
        );
        // Three raw lines keep their structure
        assert_eq!(normalized_lines("a | b\nc. d\ne", 0), vec!["a | b", "c. d", "e"]);
    }

    #[test]
    fn very_long_lines_are_split_to_the_budget()
    {
        let long = format!("{} tail", "word ".repeat(30).trim_end());
        let lines = normalized_lines(&format!("intro\n{long}\nend"), 40);

        assert!(lines.len() > 3);
        assert!(lines.iter().all(|l| l.chars().count() <= 40));
        assert_eq!(lines.concat().replace(' ', ""), format!("intro{long}end").replace(' ', ""));

        // No whitespace to break on
        let solid = normalized_lines(&"x".repeat(25), 10);
        assert_eq!(solid, vec!["x".repeat(10), "x".repeat(10), "x".repeat(5)]);
    }

    #[test]
    fn numbers_infer_decimal_separator()
    {
        assert_eq!(extract_numbers("1.234,56 zł"), vec![1234.56]);
        assert_eq!(extract_numbers("1,234.56 USD"), vec![1234.56]);
        assert_eq!(extract_numbers("cena 12,99"), vec![12.99]);
        assert_eq!(extract_numbers("1.234.567 views"), vec![1_234_567.0]);
        assert_eq!(extract_numbers("2 499 zł"), vec![2499.0]);
        assert_eq!(extract_numbers("rating 4.5 of 5, -3"), vec![-3.0, 4.5, 5.0]);
    }

    #[test]
    fn jaccard_handles_empty_sets()
    {
        let empty = HashSet::new();
        let one: HashSet<String> = ["a".to_string()].into_iter().collect();

        assert_eq!(jaccard(&empty, &empty), 1.0);
        assert_eq!(jaccard(&empty, &one), 0.0);
        assert_eq!(jaccard(&one, &one), 1.0);
    }

    #[test]
    fn slug_and_excerpt_are_char_safe()
    {
        assert_eq!(slugify_key("  Opinie klientów! ", 48), "opinie-klientów");
        assert_eq!(slugify_key("???", 48), "chunk");
        assert_eq!(excerpt("ąę  ść\nx", 3), "ąę ");
    }

    #[test]
    fn opening_words_keep_source_spacing()
    {
        assert_eq!(opening_words("  Price  of\nthe product is", 3, 96), "Price  of\nthe");
        assert_eq!(opening_words("alpha beta gamma", 5, 12), "alpha beta");
        assert_eq!(opening_words("abcdefghijkl more", 2, 5), "abcde");
        assert_eq!(opening_words("", 3, 10), "");
    }

    #[test]
    fn sentences_split_on_terminal_punctuation()
    {
        assert_eq!(split_sentences("One. Two! Three? four"), vec!["One.", "Two!", "Three?", "four"]);
        assert_eq!(split_sentences("v1.2 stays"), vec!["v1.2 stays"]);
    }
}
