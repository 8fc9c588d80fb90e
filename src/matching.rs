//! Best-effort title similarity, used only to flag human-reviewable
//! mismatch ledger entries. Never consulted by the merge logic.

use regex::Regex;
use std::collections::HashMap;
use strsim::normalized_levenshtein;

/// Decides whether a catalog title and a source-matched title refer to
/// the same game. Implementations are heuristics, not guarantees.
pub trait NameMatcher: Send + Sync {
    fn matches(&self, a: &str, b: &str) -> bool;
}

/// Normalize-then-compare matcher: lowercase, fold roman numerals,
/// strip edition suffixes and punctuation, then require either
/// containment or a high normalized-levenshtein score.
pub struct DefaultMatcher {
    threshold: f64,
    editions: Regex,
    numerals: HashMap<&'static str, &'static str>,
}

impl Default for DefaultMatcher {
    fn default() -> Self {
        Self::new(0.85)
    }
}

impl DefaultMatcher {
    pub fn new(threshold: f64) -> Self {
        let editions = Regex::new(
            r"\b(game of the year edition|goty edition|goty|definitive edition|complete edition|deluxe edition|enhanced edition|anniversary edition|ultimate edition|gold edition|legendary edition|directors cut|director s cut|remastered|remaster|hd)\b",
        )
        .expect("edition suffix regex");
        let numerals = HashMap::from([
            ("ii", "2"),
            ("iii", "3"),
            ("iv", "4"),
            ("v", "5"),
            ("vi", "6"),
            ("vii", "7"),
            ("viii", "8"),
            ("ix", "9"),
            ("x", "10"),
            ("xi", "11"),
            ("xii", "12"),
            ("xiii", "13"),
        ]);
        Self {
            threshold,
            editions,
            numerals,
        }
    }

    fn normalize(&self, name: &str) -> String {
        // Punctuation is removed outright (not spaced) so dotted acronyms
        // like "S.T.A.L.K.E.R." collapse to one token.
        let lowered: String = name
            .to_lowercase()
            .replace('&', " and ")
            .chars()
            .filter_map(|c| {
                if c.is_alphanumeric() {
                    Some(c)
                } else if c.is_whitespace() {
                    Some(' ')
                } else {
                    None
                }
            })
            .collect();
        let collapsed = lowered.split_whitespace().collect::<Vec<_>>().join(" ");
        // Edition suffixes go first, while "the" is still present.
        let stripped = self.editions.replace_all(&collapsed, "");
        let folded: Vec<&str> = stripped
            .split_whitespace()
            .map(|tok| self.numerals.get(tok).copied().unwrap_or(tok))
            .filter(|tok| *tok != "the")
            .collect();
        folded.join(" ")
    }
}

impl NameMatcher for DefaultMatcher {
    fn matches(&self, a: &str, b: &str) -> bool {
        let na = self.normalize(a);
        let nb = self.normalize(b);
        if na.is_empty() || nb.is_empty() {
            return false;
        }
        if na == nb || na.contains(&nb) || nb.contains(&na) {
            return true;
        }
        normalized_levenshtein(&na, &nb) >= self.threshold
    }
}
