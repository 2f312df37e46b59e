//! Pacing policy file loading and validation.
//!
//! Policies are declared in a YAML file and compiled into the classifier
//! at startup. Duplicate names, duplicate grouping expressions, missing or
//! ambiguous pacer blocks and out-of-range pacer parameters are all fatal.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::classifier::{GroupClassifier, PacingPolicy, PolicyError};
use crate::pacer::PacerFactory;
use crate::pacer::exponential::{self, ExponentialFactory};
use crate::pacer::linear::{self, LinearFactory};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("policy {0}: no pacer configuration specified")]
    MissingPacer(String),
    #[error("policy {0}: exactly one pacer may be configured")]
    AmbiguousPacer(String),
    #[error("policy {policy}: {reason}")]
    InvalidPacer { policy: String, reason: String },
    #[error(transparent)]
    Policy(#[from] PolicyError),
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyFile {
    #[serde(default)]
    pub policies: Vec<PolicyConfig>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyConfig {
    pub name: String,
    #[serde(default)]
    pub label_selector: BTreeMap<String, String>,
    #[serde(default)]
    pub bypass_label_selector: BTreeMap<String, String>,
    pub grouping_expression: String,
    pub pacer: PacerConfig,
    /// Blocked pods older than this are force-released by the reconciler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_blocked_duration_seconds: Option<u64>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PacerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exponential: Option<ExponentialPacerConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linear: Option<LinearPacerConfig>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExponentialPacerConfig {
    pub min_initial: usize,
    pub max_stagger: usize,
    pub multiplier: f64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinearPacerConfig {
    pub max_stagger: usize,
    pub step: usize,
}

impl PolicyFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        info!(path = %path.display(), "loading pacing policies");
        let raw =
            std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.display().to_string(),
                source,
            })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(raw)?)
    }
}

fn pacer_factory(
    policy: &PolicyConfig,
) -> Result<Arc<dyn PacerFactory>, ConfigError> {
    match (&policy.pacer.exponential, &policy.pacer.linear) {
        (Some(_), Some(_)) => {
            Err(ConfigError::AmbiguousPacer(policy.name.clone()))
        }
        (Some(cfg), None) => {
            if cfg.min_initial < 1 {
                return Err(ConfigError::InvalidPacer {
                    policy: policy.name.clone(),
                    reason: "minInitial must be at least 1".to_string(),
                });
            }
            if cfg.multiplier <= 1.0 {
                return Err(ConfigError::InvalidPacer {
                    policy: policy.name.clone(),
                    reason: "multiplier must be greater than 1".to_string(),
                });
            }
            info!(policy = %policy.name, ?cfg, "creating exponential pacer");
            Ok(Arc::new(ExponentialFactory::new(
                &policy.name,
                exponential::Config {
                    min_initial: cfg.min_initial,
                    max_stagger: cfg.max_stagger,
                    multiplier: cfg.multiplier,
                },
            )))
        }
        (None, Some(cfg)) => {
            if cfg.step < 1 {
                return Err(ConfigError::InvalidPacer {
                    policy: policy.name.clone(),
                    reason: "step must be at least 1".to_string(),
                });
            }
            info!(policy = %policy.name, ?cfg, "creating linear pacer");
            Ok(Arc::new(LinearFactory::new(linear::Config {
                max_stagger: cfg.max_stagger,
                step: cfg.step,
            })))
        }
        (None, None) => Err(ConfigError::MissingPacer(policy.name.clone())),
    }
}

/// Compiles the policy file into a classifier. Any invalid policy aborts
/// the whole load.
pub fn build_classifier(
    file: &PolicyFile,
) -> Result<GroupClassifier, ConfigError> {
    let classifier = GroupClassifier::new();
    for policy in &file.policies {
        let factory = pacer_factory(policy)?;
        classifier.add_policy(PacingPolicy {
            name: policy.name.clone(),
            label_selector: policy.label_selector.clone(),
            bypass_label_selector: policy.bypass_label_selector.clone(),
            grouping_expression: policy.grouping_expression.clone(),
            factory,
            max_blocked: policy
                .max_blocked_duration_seconds
                .map(Duration::from_secs),
        })?;
    }
    Ok(classifier)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
policies:
  - name: deployments
    labelSelector:
      pacing: "on"
    bypassLabelSelector:
      urgent: "1"
    groupingExpression: .metadata.labels.app
    pacer:
      exponential:
        minInitial: 1
        maxStagger: 16
        multiplier: 2.0
    maxBlockedDurationSeconds: 900
  - name: batch
    groupingExpression: .metadata.namespace
    pacer:
      linear:
        maxStagger: 12
        step: 5
"#;

    #[test]
    fn parses_sample_config() {
        let file = PolicyFile::from_yaml(SAMPLE).unwrap();
        assert_eq!(file.policies.len(), 2);

        let first = &file.policies[0];
        assert_eq!(first.name, "deployments");
        assert_eq!(
            first.label_selector.get("pacing").map(String::as_str),
            Some("on")
        );
        assert_eq!(first.max_blocked_duration_seconds, Some(900));
        let exp = first.pacer.exponential.as_ref().unwrap();
        assert_eq!(exp.min_initial, 1);
        assert_eq!(exp.max_stagger, 16);

        let second = &file.policies[1];
        assert!(second.pacer.linear.is_some());
        assert!(second.max_blocked_duration_seconds.is_none());
    }

    #[test]
    fn builds_a_classifier() {
        let file = PolicyFile::from_yaml(SAMPLE).unwrap();
        assert!(build_classifier(&file).is_ok());
    }

    #[test]
    fn empty_config_is_valid() {
        let file = PolicyFile::from_yaml("policies: []").unwrap();
        assert!(build_classifier(&file).unwrap().classify_by_group_id("x").is_none());
    }

    fn single_policy(pacer: &str) -> String {
        format!(
            r#"
policies:
  - name: p1
    groupingExpression: .metadata.namespace
    pacer:
{pacer}
"#
        )
    }

    #[test]
    fn rejects_missing_pacer() {
        let file =
            PolicyFile::from_yaml(&single_policy("      {}")).unwrap();
        assert!(matches!(
            build_classifier(&file),
            Err(ConfigError::MissingPacer(_))
        ));
    }

    #[test]
    fn rejects_ambiguous_pacer() {
        let pacer = r#"      exponential:
        minInitial: 1
        maxStagger: 16
        multiplier: 2.0
      linear:
        maxStagger: 12
        step: 5"#;
        let file = PolicyFile::from_yaml(&single_policy(pacer)).unwrap();
        assert!(matches!(
            build_classifier(&file),
            Err(ConfigError::AmbiguousPacer(_))
        ));
    }

    #[test]
    fn rejects_bad_pacer_parameters() {
        let pacer = r#"      exponential:
        minInitial: 0
        maxStagger: 16
        multiplier: 2.0"#;
        let file = PolicyFile::from_yaml(&single_policy(pacer)).unwrap();
        assert!(matches!(
            build_classifier(&file),
            Err(ConfigError::InvalidPacer { .. })
        ));

        let pacer = r#"      exponential:
        minInitial: 1
        maxStagger: 16
        multiplier: 1.0"#;
        let file = PolicyFile::from_yaml(&single_policy(pacer)).unwrap();
        assert!(matches!(
            build_classifier(&file),
            Err(ConfigError::InvalidPacer { .. })
        ));

        let pacer = r#"      linear:
        maxStagger: 12
        step: 0"#;
        let file = PolicyFile::from_yaml(&single_policy(pacer)).unwrap();
        assert!(matches!(
            build_classifier(&file),
            Err(ConfigError::InvalidPacer { .. })
        ));
    }

    #[test]
    fn rejects_duplicate_policies() {
        let raw = r#"
policies:
  - name: p1
    groupingExpression: .metadata.namespace
    pacer:
      linear: {maxStagger: 12, step: 5}
  - name: p1
    groupingExpression: .metadata.name
    pacer:
      linear: {maxStagger: 12, step: 5}
"#;
        let file = PolicyFile::from_yaml(raw).unwrap();
        assert!(matches!(
            build_classifier(&file),
            Err(ConfigError::Policy(PolicyError::DuplicateName(_)))
        ));

        let raw = r#"
policies:
  - name: p1
    groupingExpression: .metadata.namespace
    pacer:
      linear: {maxStagger: 12, step: 5}
  - name: p2
    groupingExpression: .metadata.namespace
    pacer:
      linear: {maxStagger: 12, step: 5}
"#;
        let file = PolicyFile::from_yaml(raw).unwrap();
        assert!(matches!(
            build_classifier(&file),
            Err(ConfigError::Policy(PolicyError::DuplicateExpression(..)))
        ));
    }
}
