//! Ballot templates: contest layout and the marking rule of each contest.
//!
//! Templates are authored as TOML:
//!
//! ```toml
//! id = "general-2024"
//! frame = { width = 850, height = 1100 }
//! min_source_width = 600
//! min_source_height = 800
//!
//! [[contests]]
//! id = "mayor"
//! title = "Mayor"
//! rule = { kind = "cross" }
//! candidates = [
//!   { id = "alice", name = "Alice Archer", position = 1 },
//!   { id = "bob", name = "Bob Baker", position = 2 },
//! ]
//! ```

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::ballot::Frame;
use crate::config::ConfigError;

/// Pixel rectangle in the template frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// The grammar of valid marks for one contest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MarkingRule {
    /// Exactly one cross, nothing else.
    #[default]
    Cross,
    /// A complete preference numbering `1..=max_rank`, each number once.
    Ranked {
        max_rank: u32,
        /// Treat a lone cross as a first preference.
        #[serde(default)]
        accept_cross: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateTemplate {
    pub id: String,
    /// Name as printed on the sheet.
    pub name: String,
    /// 1-based position on the sheet, unique across the whole template.
    pub position: u32,
    #[serde(default)]
    pub region: Option<Region>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContestTemplate {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub rule: MarkingRule,
    pub candidates: Vec<CandidateTemplate>,
}

impl ContestTemplate {
    pub fn candidate(&self, id: &str) -> Option<&CandidateTemplate> {
        self.candidates.iter().find(|c| c.id == id)
    }

    pub fn candidate_at(&self, position: u32) -> Option<&CandidateTemplate> {
        self.candidates.iter().find(|c| c.position == position)
    }

    /// Look up a candidate by printed name, ignoring case and whitespace.
    pub fn candidate_named(&self, name: &str) -> Option<&CandidateTemplate> {
        let wanted = normalize_name(name);
        if wanted.is_empty() {
            return None;
        }
        self.candidates
            .iter()
            .find(|c| normalize_name(&c.name) == wanted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BallotTemplate {
    pub id: String,
    pub frame: Frame,
    #[serde(default)]
    pub min_source_width: u32,
    #[serde(default)]
    pub min_source_height: u32,
    pub contests: Vec<ContestTemplate>,
}

impl BallotTemplate {
    /// Parse and validate a template from TOML.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let template: Self = toml::from_str(s)?;
        template.validate()?;
        Ok(template)
    }

    /// Read, parse and validate a template file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn contest(&self, id: &str) -> Option<&ContestTemplate> {
        self.contests.iter().find(|c| c.id == id)
    }

    /// Find the candidate printed at a sheet position, with its contest.
    pub fn candidate_at(&self, position: u32) -> Option<(&ContestTemplate, &CandidateTemplate)> {
        self.contests
            .iter()
            .find_map(|contest| contest.candidate_at(position).map(|c| (contest, c)))
    }

    /// Check structural consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidTemplate {
            template: self.id.clone(),
            reason,
        };

        if self.id.trim().is_empty() {
            return Err(invalid("template id is empty".to_string()));
        }
        if self.frame.width == 0 || self.frame.height == 0 {
            return Err(invalid("frame must be non-empty".to_string()));
        }
        if self.contests.is_empty() {
            return Err(invalid("template has no contests".to_string()));
        }

        let mut contest_ids = HashSet::new();
        let mut positions = HashSet::new();
        for contest in &self.contests {
            if !contest_ids.insert(contest.id.as_str()) {
                return Err(invalid(format!("duplicate contest id '{}'", contest.id)));
            }
            if contest.candidates.is_empty() {
                return Err(invalid(format!("contest '{}' has no candidates", contest.id)));
            }

            let mut candidate_ids = HashSet::new();
            for candidate in &contest.candidates {
                if !candidate_ids.insert(candidate.id.as_str()) {
                    return Err(invalid(format!(
                        "duplicate candidate id '{}' in contest '{}'",
                        candidate.id, contest.id
                    )));
                }
                if candidate.position == 0 || !positions.insert(candidate.position) {
                    return Err(invalid(format!(
                        "candidate '{}' has an invalid or repeated position {}",
                        candidate.id, candidate.position
                    )));
                }
            }

            if let MarkingRule::Ranked { max_rank, .. } = contest.rule {
                if max_rank == 0 || max_rank as usize > contest.candidates.len() {
                    return Err(invalid(format!(
                        "contest '{}' ranks {} of {} candidates",
                        contest.id,
                        max_rank,
                        contest.candidates.len()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Lowercase with all whitespace removed.
pub(crate) fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// Two contests: a cross-marked mayoral race and a ranked council race.
    pub fn general_template() -> BallotTemplate {
        BallotTemplate {
            id: "general-2024".to_string(),
            frame: Frame::new(200, 300),
            min_source_width: 100,
            min_source_height: 150,
            contests: vec![
                ContestTemplate {
                    id: "mayor".to_string(),
                    title: "Mayor".to_string(),
                    rule: MarkingRule::Cross,
                    candidates: vec![
                        candidate("alice", "Alice Archer", 1),
                        candidate("bob", "Bob Baker", 2),
                    ],
                },
                ContestTemplate {
                    id: "council".to_string(),
                    title: "Council".to_string(),
                    rule: MarkingRule::Ranked {
                        max_rank: 3,
                        accept_cross: true,
                    },
                    candidates: vec![
                        candidate("carol", "Carol Chen", 3),
                        candidate("dan", "Dan Diaz", 4),
                        candidate("erin", "Erin Eze", 5),
                    ],
                },
            ],
        }
    }

    fn candidate(id: &str, name: &str, position: u32) -> CandidateTemplate {
        CandidateTemplate {
            id: id.to_string(),
            name: name.to_string(),
            position,
            region: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::general_template;
    use super::*;

    #[test]
    fn test_parse_template_toml() {
        let toml = r#"
            id = "t1"
            frame = { width = 100, height = 200 }

            [[contests]]
            id = "mayor"
            candidates = [
              { id = "alice", name = "Alice Archer", position = 1 },
              { id = "bob", name = "Bob Baker", position = 2 },
            ]

            [[contests]]
            id = "council"
            rule = { kind = "ranked", max_rank = 2 }
            candidates = [
              { id = "carol", name = "Carol", position = 3 },
              { id = "dan", name = "Dan", position = 4 },
            ]
        "#;
        let template = BallotTemplate::from_toml_str(toml).unwrap();
        assert_eq!(template.contests.len(), 2);
        assert_eq!(template.contests[0].rule, MarkingRule::Cross);
        assert_eq!(
            template.contests[1].rule,
            MarkingRule::Ranked {
                max_rank: 2,
                accept_cross: false
            }
        );
    }

    #[test]
    fn test_duplicate_contest_rejected() {
        let mut template = general_template();
        template.contests[1].id = "mayor".to_string();
        let err = template.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate contest id"));
    }

    #[test]
    fn test_duplicate_candidate_rejected() {
        let mut template = general_template();
        template.contests[0].candidates[1].id = "alice".to_string();
        assert!(template.validate().is_err());
    }

    #[test]
    fn test_repeated_position_rejected() {
        let mut template = general_template();
        template.contests[1].candidates[0].position = 1;
        assert!(template.validate().is_err());
    }

    #[test]
    fn test_ranked_beyond_candidates_rejected() {
        let mut template = general_template();
        template.contests[1].rule = MarkingRule::Ranked {
            max_rank: 4,
            accept_cross: false,
        };
        assert!(template.validate().is_err());
    }

    #[test]
    fn test_lookup_by_position_and_name() {
        let template = general_template();
        let (contest, candidate) = template.candidate_at(4).unwrap();
        assert_eq!(contest.id, "council");
        assert_eq!(candidate.id, "dan");

        let mayor = template.contest("mayor").unwrap();
        assert_eq!(mayor.candidate_named("  alice   ARCHER").unwrap().id, "alice");
        assert!(mayor.candidate_named("").is_none());
        assert!(template.candidate_at(99).is_none());
    }
}
