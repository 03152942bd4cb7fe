//! Engine configuration and templates loaded from disk.

mod common;

use std::fs;

use tally_core::{
    BallotTemplate, ConfigError, EngineConfig, MarkingRule, StrategyKind, MAX_RETRIES,
};

#[test]
fn config_and_template_load_from_files() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("tally.toml");
    fs::write(
        &config_path,
        r#"
        quorum = 2
        majority_fraction = 0.65
        min_confidence = 0.6

        [adapters]
        ocr_name_column = 24

        [[strategies]]
        kind = "vision_model"
        weight = 1.5
        retries = 2

        [[strategies]]
        kind = "classical_cv"
        timeout_ms = 800
        "#,
    )
    .unwrap();
    let template_path = dir.path().join("general-2024.toml");
    fs::write(&template_path, common::TEMPLATE).unwrap();

    let config = EngineConfig::load(&config_path).unwrap();
    assert_eq!(config.majority_fraction, 0.65);
    assert_eq!(config.adapters.ocr_name_column, 24);
    assert_eq!(config.adapters.detection_tolerance, 20);
    assert_eq!(config.strategy(StrategyKind::VisionModel).unwrap().retries, 2);
    assert_eq!(config.policy().weight(StrategyKind::ClassicalCv), 1.0);

    let template = BallotTemplate::load(&template_path).unwrap();
    assert_eq!(template.id, "general-2024");
    assert_eq!(
        template.contest("council").unwrap().rule,
        MarkingRule::Ranked {
            max_rank: 2,
            accept_cross: false
        }
    );
    assert_eq!(template.candidate_at(4).unwrap().1.id, "dan");
}

#[test]
fn missing_file_reports_path() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("absent.toml");
    let err = EngineConfig::load(&missing).unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
    assert!(err.to_string().contains("absent.toml"));
}

#[test]
fn quorum_above_active_strategies_is_fatal() {
    let err = EngineConfig::from_toml_str(
        r#"
        quorum = 3
        [[strategies]]
        kind = "ocr_layout"
        [[strategies]]
        kind = "detection"
        "#,
    )
    .unwrap_err();
    assert!(matches!(err, ConfigError::InvalidQuorum { quorum: 3, active: 2 }));
}

#[test]
fn template_with_bad_ranking_is_rejected() {
    let toml = common::TEMPLATE.replace("max_rank = 2", "max_rank = 5");
    let err = BallotTemplate::from_toml_str(&toml).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidTemplate { .. }));
}

#[test]
fn unbounded_retries_are_fatal() {
    let err = EngineConfig::from_toml_str(
        r#"
        quorum = 1
        [[strategies]]
        kind = "detection"
        retries = 4294967295
        "#,
    )
    .unwrap_err();
    assert!(matches!(
        err,
        ConfigError::TooManyRetries {
            kind: StrategyKind::Detection,
            retries: u32::MAX
        }
    ));

    let at_limit = format!(
        "quorum = 1\n[[strategies]]\nkind = \"detection\"\nretries = {MAX_RETRIES}\n"
    );
    assert!(EngineConfig::from_toml_str(&at_limit).is_ok());
}
