//! String similarity scores
//!
//! All scores are integers in 0-100.

use crate::config::ScoreAlgorithm;

/// Substitutions for characters OCR commonly confuses with letters
const OCR_CONFUSIONS: [(char, char); 7] = [
    ('0', 'o'),
    ('1', 'i'),
    ('3', 'e'),
    ('4', 'a'),
    ('5', 's'),
    ('7', 't'),
    ('8', 'b'),
];

/// Lowercase and fold OCR digit confusions into letters
///
/// Works character by character; whitespace is left untouched.
pub fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| {
            OCR_CONFUSIONS
                .iter()
                .find(|(from, _)| *from == c)
                .map(|(_, to)| *to)
                .unwrap_or(c)
        })
        .collect()
}

/// Score two strings with the selected algorithm
pub fn score(algorithm: ScoreAlgorithm, a: &str, b: &str) -> u8 {
    match algorithm {
        ScoreAlgorithm::RatcliffObershelp => ratio(a, b),
        ScoreAlgorithm::Levenshtein => to_percent(strsim::normalized_levenshtein(a, b)),
        ScoreAlgorithm::JaroWinkler => to_percent(strsim::jaro_winkler(a, b)),
    }
}

fn to_percent(similarity: f64) -> u8 {
    (similarity * 100.0).round_ties_even().clamp(0.0, 100.0) as u8
}

/// Ratcliff/Obershelp similarity: twice the matched characters over the
/// total length, 0 if either side is empty
pub fn ratio(a: &str, b: &str) -> u8 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    if a.is_empty() || b.is_empty() {
        return 0;
    }

    let matched = matching_characters(&a, &b);
    to_percent(2.0 * matched as f64 / (a.len() + b.len()) as f64)
}

/// Total size of the matching blocks found by recursively taking the
/// longest common substring and recursing on both sides of it
fn matching_characters(a: &[char], b: &[char]) -> usize {
    let mut total = 0;
    let mut pending = vec![(0, a.len(), 0, b.len())];

    while let Some((alo, ahi, blo, bhi)) = pending.pop() {
        let (i, j, size) = longest_match(a, b, alo, ahi, blo, bhi);
        if size == 0 {
            continue;
        }

        total += size;
        if alo < i && blo < j {
            pending.push((alo, i, blo, j));
        }
        if i + size < ahi && j + size < bhi {
            pending.push((i + size, ahi, j + size, bhi));
        }
    }

    total
}

/// Longest common run of `a[alo..ahi]` and `b[blo..bhi]`
///
/// Ties go to the run starting earliest in `a`, then earliest in `b`.
fn longest_match(
    a: &[char],
    b: &[char],
    alo: usize,
    ahi: usize,
    blo: usize,
    bhi: usize,
) -> (usize, usize, usize) {
    let (mut best_i, mut best_j, mut best_size) = (alo, blo, 0);

    // Run lengths ending at each position of b for the previous row of a
    let mut previous = vec![0usize; bhi - blo + 1];
    let mut current = vec![0usize; bhi - blo + 1];

    for i in alo..ahi {
        for j in blo..bhi {
            let k = j - blo + 1;
            current[k] = if a[i] == b[j] { previous[k - 1] + 1 } else { 0 };

            if current[k] > best_size {
                best_size = current[k];
                best_i = i + 1 - best_size;
                best_j = j + 1 - best_size;
            }
        }
        std::mem::swap(&mut previous, &mut current);
    }

    (best_i, best_j, best_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("ZER0"), "zero");
        assert_eq!(normalize("C0CA-C0LA 1.5L"), "coca-cola i.sl");
        assert_eq!(normalize("  B1T8URGER 7 "), "  bitburger t ");
        assert_eq!(normalize("Größe 3"), "größe e");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        for s in ["", "ZER0", "0123456789", "Coca Cola Zero", "  mixed 4 Case  ", "ÄÖÜ 8"] {
            let once = normalize(s);
            assert_eq!(normalize(&once), once);
        }
    }

    #[test]
    fn test_ratio_identical_and_disjoint() {
        assert_eq!(ratio("coca cola zero", "coca cola zero"), 100);
        assert_eq!(ratio("abc", "xyz"), 0);
        assert_eq!(ratio("", "abc"), 0);
        assert_eq!(ratio("abc", ""), 0);
    }

    #[test]
    fn test_ratio_known_values() {
        // 2 * 3 / 7 = 0.857
        assert_eq!(ratio("abcd", "bcd"), 86);
        // "fanta" vs "fanta zero": 2 * 5 / 15
        assert_eq!(ratio("fanta", "fanta zero"), 67);
        // matching blocks "a" + "b": 2 * 2 / 6
        assert_eq!(ratio("axb", "ayb"), 67);
        assert_eq!(ratio("abcd", "aefg"), 25);
        // 2 * 1 / 16 = 12.5, rounded half to even
        assert_eq!(ratio("abcdefgh", "aijklmno"), 12);
    }

    #[test]
    fn test_ratio_is_order_sensitive_like_blocks() {
        // Only one of the transposed characters can be matched
        assert_eq!(ratio("ab", "ba"), 50);
    }

    #[test]
    fn test_longest_match_prefers_earliest() {
        let a: Vec<char> = "abxab".chars().collect();
        let b: Vec<char> = "ab".chars().collect();
        assert_eq!(longest_match(&a, &b, 0, a.len(), 0, b.len()), (0, 0, 2));
    }

    #[test]
    fn test_score_algorithms() {
        assert_eq!(score(ScoreAlgorithm::RatcliffObershelp, "abc", "abc"), 100);
        assert_eq!(score(ScoreAlgorithm::Levenshtein, "abc", "abc"), 100);
        assert_eq!(score(ScoreAlgorithm::JaroWinkler, "abc", "abc"), 100);
        assert_eq!(score(ScoreAlgorithm::Levenshtein, "abcd", "abce"), 75);
        assert_eq!(score(ScoreAlgorithm::JaroWinkler, "abc", "xyz"), 0);
    }
}
