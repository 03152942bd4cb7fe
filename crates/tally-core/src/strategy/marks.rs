//! Marking-rule evaluation shared by the adapters.
//!
//! Backends report raw marks next to candidates; this module decides what
//! those marks mean under the contest's [`MarkingRule`].

use crate::domain::{MarkingRule, Selection};

/// A single mark a backend saw next to a candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mark {
    Cross,
    Rank(u32),
    /// Anything that is neither a cross nor a preference number.
    Unknown(String),
}

impl Mark {
    /// Interpret a recognized symbol. Empty input means "no mark".
    pub fn parse(symbol: &str) -> Option<Mark> {
        let s = symbol.trim();
        if s.is_empty() {
            return None;
        }
        let cross = s.eq_ignore_ascii_case("x") || s.eq_ignore_ascii_case("cross");
        if cross || s == "✗" || s == "✓" {
            return Some(Mark::Cross);
        }
        match s.parse::<u32>() {
            Ok(n) if n > 0 => Some(Mark::Rank(n)),
            _ => Some(Mark::Unknown(s.to_string())),
        }
    }

    /// First mark-like character in free text, skipping noise.
    pub fn scan(text: &str) -> Option<Mark> {
        text.chars().find_map(|c| match c {
            'x' | 'X' => Some(Mark::Cross),
            '1'..='9' => c.to_digit(10).map(Mark::Rank),
            _ => None,
        })
    }
}

/// Evaluate the marks of one contest.
///
/// `marks` pairs candidate ids with what was seen next to them.
pub fn interpret(rule: MarkingRule, marks: &[(String, Mark)]) -> Selection {
    if marks.is_empty() {
        return Selection::Blank;
    }
    if marks.iter().any(|(_, m)| matches!(m, Mark::Unknown(_))) {
        return Selection::Invalid;
    }

    let crosses: Vec<&str> = marks
        .iter()
        .filter(|(_, m)| *m == Mark::Cross)
        .map(|(c, _)| c.as_str())
        .collect();

    if !crosses.is_empty() {
        let cross_allowed = match rule {
            MarkingRule::Cross => true,
            MarkingRule::Ranked { accept_cross, .. } => accept_cross,
        };
        if cross_allowed && crosses.len() == 1 && marks.len() == 1 {
            return Selection::candidate(crosses[0]);
        }
        return Selection::Invalid;
    }

    let MarkingRule::Ranked { max_rank, .. } = rule else {
        return Selection::Invalid;
    };

    let mut ranks: Vec<u32> = marks
        .iter()
        .filter_map(|(_, m)| match m {
            Mark::Rank(n) => Some(*n),
            _ => None,
        })
        .collect();
    ranks.sort_unstable();
    if ranks != (1..=max_rank).collect::<Vec<_>>() {
        return Selection::Invalid;
    }

    marks
        .iter()
        .find(|(_, m)| *m == Mark::Rank(1))
        .map(|(c, _)| Selection::candidate(c.as_str()))
        .unwrap_or(Selection::Invalid)
}
