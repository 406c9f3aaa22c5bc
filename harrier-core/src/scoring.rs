//! Proximity and phrase scoring over in-document term positions.
//!
//! The intersect merge hands each matched document's per-term position
//! lists to `proximity_score`, which plane-sweeps minimal covering
//! intervals across the lists and weights each cover by the region it
//! falls in. Quoted phrases add an exact-adjacency predicate checked by
//! `check_quote`.

/// Positions below this offset are treated as the title region.
pub const TITLE_WINDOW: u32 = 16;

/// Weight of a cover that ends inside the title window.
pub const TITLE_WEIGHT: f64 = 4.0;

/// Weight of a cover in the document body.
pub const DESCRIPTION_WEIGHT: f64 = 1.0;

/// Extra multiplier for inlink records.
pub const LINK_WEIGHT: f64 = 2.0;

/// Final per-document score: rank x relevance x proximity-derived weight.
#[inline]
pub fn combined_score(doc_rank: f64, relevance: f64, proximity: f64) -> f64 {
    doc_rank * relevance * proximity
}

// ── Proximity ────────────────────────────────────────────────────────────

/// Plane-sweep proximity over one position list per query term.
///
/// Walks covering intervals (one position from every list) in ascending
/// order of their left edge, scoring each cover by its span and region.
/// Any term with no occurrence in the document contributes a zero score
/// for the whole document.
pub fn proximity_score(lists: &[Vec<u32>], is_doc: bool) -> f64 {
    if lists.is_empty() || lists.iter().any(|l| l.is_empty()) {
        return 0.0;
    }

    if lists.len() == 1 {
        return lists[0]
            .iter()
            .map(|&p| cover_weight(p, p, is_doc))
            .sum();
    }

    let mut cursor = vec![0usize; lists.len()];
    let mut total = 0.0;
    loop {
        let mut lo = u32::MAX;
        let mut hi = 0u32;
        let mut lo_list = 0usize;
        for (i, list) in lists.iter().enumerate() {
            let p = list[cursor[i]];
            if p < lo {
                lo = p;
                lo_list = i;
            }
            if p > hi {
                hi = p;
            }
        }
        total += cover_weight(lo, hi, is_doc);

        // Slide the left edge; the sweep ends when any list drains.
        cursor[lo_list] += 1;
        if cursor[lo_list] >= lists[lo_list].len() {
            break;
        }
    }
    total
}

#[inline]
fn cover_weight(lo: u32, hi: u32, is_doc: bool) -> f64 {
    let span = (hi - lo + 1) as f64;
    let region = if hi < TITLE_WINDOW {
        TITLE_WEIGHT
    } else {
        DESCRIPTION_WEIGHT
    };
    let link = if is_doc { 1.0 } else { LINK_WEIGHT };
    region * link / span
}

// ── Quoted phrases ───────────────────────────────────────────────────────

/// One slot of a quoted-phrase constraint: a query term (by its position
/// in the query's term list) or a wildcard matching any number of terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuoteSlot {
    Term(usize),
    Wildcard,
}

/// A quoted phrase as a sequence of slots.
pub type PhraseConstraint = Vec<QuoteSlot>;

/// Backtracking phrase match: consecutive `Term` slots must occupy
/// consecutive positions; a `Wildcard` relaxes the next step to any
/// strictly later position.
pub fn check_quote(lists: &[Vec<u32>], phrase: &[QuoteSlot]) -> bool {
    quote_match(lists, phrase, None, false)
}

fn quote_match(
    lists: &[Vec<u32>],
    slots: &[QuoteSlot],
    prev: Option<u32>,
    gap_ok: bool,
) -> bool {
    match slots.first() {
        None => true,
        Some(QuoteSlot::Wildcard) => quote_match(lists, &slots[1..], prev, true),
        Some(QuoteSlot::Term(i)) => {
            let Some(positions) = lists.get(*i) else {
                return false;
            };
            for &p in positions {
                let step_ok = match prev {
                    None => true,
                    Some(q) if gap_ok => p > q,
                    Some(q) => p == q + 1,
                };
                if step_ok && quote_match(lists, &slots[1..], Some(p), false) {
                    return true;
                }
            }
            false
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proximity_adjacent_beats_spread() {
        let tight = proximity_score(&[vec![100], vec![101]], true);
        let loose = proximity_score(&[vec![100], vec![140]], true);
        assert!(tight > loose);
    }

    #[test]
    fn test_proximity_title_window_boost() {
        let title = proximity_score(&[vec![2], vec![3]], true);
        let body = proximity_score(&[vec![102], vec![103]], true);
        assert!((title / body - TITLE_WEIGHT).abs() < 1e-9);
    }

    #[test]
    fn test_proximity_link_weight() {
        let page = proximity_score(&[vec![100], vec![101]], true);
        let link = proximity_score(&[vec![100], vec![101]], false);
        assert!((link / page - LINK_WEIGHT).abs() < 1e-9);
    }

    #[test]
    fn test_proximity_missing_term_is_zero() {
        assert_eq!(proximity_score(&[vec![1, 2], vec![]], true), 0.0);
        assert_eq!(proximity_score(&[], true), 0.0);
    }

    #[test]
    fn test_proximity_single_term() {
        // Two body occurrences, span 1 each
        let s = proximity_score(&[vec![100, 200]], true);
        assert!((s - 2.0 * DESCRIPTION_WEIGHT).abs() < 1e-9);
    }

    #[test]
    fn test_check_quote_exact_adjacency() {
        // "quick brown fox" at positions 5,6,7
        let lists = vec![vec![5], vec![6], vec![7]];
        let phrase = vec![QuoteSlot::Term(0), QuoteSlot::Term(1), QuoteSlot::Term(2)];
        assert!(check_quote(&lists, &phrase));

        let gapped = vec![vec![5], vec![6], vec![9]];
        assert!(!check_quote(&gapped, &phrase));
    }

    #[test]
    fn test_check_quote_backtracks_over_candidates() {
        // First term occurs twice; only the second occurrence lines up.
        let lists = vec![vec![2, 10], vec![11]];
        let phrase = vec![QuoteSlot::Term(0), QuoteSlot::Term(1)];
        assert!(check_quote(&lists, &phrase));
    }

    #[test]
    fn test_check_quote_wildcard() {
        // "quick * fox": any gap allowed between the two terms
        let lists = vec![vec![5], vec![20]];
        let phrase = vec![QuoteSlot::Term(0), QuoteSlot::Wildcard, QuoteSlot::Term(1)];
        assert!(check_quote(&lists, &phrase));

        // But the wildcard still requires strictly later positions
        let backwards = vec![vec![20], vec![5]];
        assert!(!check_quote(&backwards, &phrase));
    }

    #[test]
    fn test_combined_score() {
        assert_eq!(combined_score(2.0, 3.0, 0.5), 3.0);
    }
}
