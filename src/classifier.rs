//! Maps candidate pods to pacing groups.
//!
//! A pod is matched against the configured policies in insertion order.
//! Every matching policy contributes a grouping key (evaluated from its
//! JSON-path expression) and a pacer for that key. The matched set is
//! hashed into a stable group identifier and bound to a composite pacer.
//! Pacers and groups live in expiring tables so idle groups do not
//! accumulate; entries are refreshed on read.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use k8s_openapi::api::core::v1::Pod;
use thiserror::Error;
use tracing::debug;

use crate::jsonpath::{self, Expr};
use crate::pacer::{CompositePacer, Pacer, PacerFactory};

const GROUP_IDLE_TTL: Duration = Duration::from_secs(30 * 60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// A named pacing rule, bound to a pacer factory.
pub struct PacingPolicy {
    /// Unique policy name.
    pub name: String,
    /// Pods must carry all of these labels to be subject to the policy.
    pub label_selector: BTreeMap<String, String>,
    /// Pods carrying all of these labels skip the policy. Empty means
    /// never bypass.
    pub bypass_label_selector: BTreeMap<String, String>,
    /// JSON-path expression producing the grouping key.
    pub grouping_expression: String,
    pub factory: Arc<dyn PacerFactory>,
    /// Blocked pods older than this are force-released by the reconciler.
    pub max_blocked: Option<Duration>,
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("duplicate policy name: {0}")]
    DuplicateName(String),
    #[error("grouping expression of {0} already used by {1}")]
    DuplicateExpression(String, String),
    #[error("policy {policy}: invalid grouping expression: {source}")]
    Expression {
        policy: String,
        source: jsonpath::ExprError,
    },
}

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("failed to project pod for grouping: {0}")]
    Projection(#[from] serde_json::Error),
}

/// The outcome of classifying a pod into a pacing group.
#[derive(Clone)]
pub struct GroupClassification {
    pub id: String,
    pub pacer: Arc<dyn Pacer>,
    /// Names of the policies that matched, in canonical order.
    pub policy_names: Vec<String>,
    /// Tightest max-blocked bound across the matched policies.
    pub max_blocked: Option<Duration>,
}

struct CompiledPolicy {
    name: String,
    label_selector: BTreeMap<String, String>,
    bypass_label_selector: BTreeMap<String, String>,
    expression: Expr,
    factory: Arc<dyn PacerFactory>,
    max_blocked: Option<Duration>,
}

struct TtlEntry<V> {
    value: V,
    last_access: Instant,
}

/// Map with per-entry idle expiry; entries are refreshed on read and the
/// table is swept opportunistically on access.
struct TtlMap<V> {
    entries: HashMap<String, TtlEntry<V>>,
    ttl: Duration,
    last_sweep: Instant,
}

impl<V: Clone> TtlMap<V> {
    fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            last_sweep: Instant::now(),
        }
    }

    fn get(&mut self, key: &str) -> Option<V> {
        self.sweep();
        let entry = self.entries.get_mut(key)?;
        entry.last_access = Instant::now();
        Some(entry.value.clone())
    }

    fn insert(&mut self, key: String, value: V) {
        self.entries.insert(
            key,
            TtlEntry {
                value,
                last_access: Instant::now(),
            },
        );
    }

    fn sweep(&mut self) {
        if self.last_sweep.elapsed() < SWEEP_INTERVAL {
            return;
        }
        let ttl = self.ttl;
        self.entries.retain(|_, e| e.last_access.elapsed() < ttl);
        self.last_sweep = Instant::now();
    }
}

struct Inner {
    policies: Vec<CompiledPolicy>,
    pacers_by_key: TtlMap<Arc<dyn Pacer>>,
    groups_by_id: TtlMap<GroupClassification>,
}

/// Classifies pods into pacing groups. All state is serialized by a
/// single mutex; no lock is held across cluster I/O.
pub struct GroupClassifier {
    inner: Mutex<Inner>,
}

impl GroupClassifier {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                policies: Vec::new(),
                pacers_by_key: TtlMap::new(GROUP_IDLE_TTL),
                groups_by_id: TtlMap::new(GROUP_IDLE_TTL),
            }),
        }
    }

    pub fn add_policy(&self, policy: PacingPolicy) -> Result<(), PolicyError> {
        let mut inner = self.inner.lock().expect("classifier lock");

        if inner.policies.iter().any(|p| p.name == policy.name) {
            return Err(PolicyError::DuplicateName(policy.name));
        }
        if let Some(existing) = inner
            .policies
            .iter()
            .find(|p| p.expression.source() == policy.grouping_expression)
        {
            return Err(PolicyError::DuplicateExpression(
                policy.name,
                existing.name.clone(),
            ));
        }
        let expression = Expr::parse(&policy.grouping_expression).map_err(
            |source| PolicyError::Expression {
                policy: policy.name.clone(),
                source,
            },
        )?;

        inner.policies.push(CompiledPolicy {
            name: policy.name,
            label_selector: policy.label_selector,
            bypass_label_selector: policy.bypass_label_selector,
            expression,
            factory: policy.factory,
            max_blocked: policy.max_blocked,
        });
        Ok(())
    }

    /// Classifies a pod into its pacing group, creating the group entry on
    /// first sight. Returns `None` when no policy matches.
    pub fn classify(
        &self,
        pod: &Pod,
    ) -> Result<Option<GroupClassification>, ClassifyError> {
        let labels = pod.metadata.labels.clone().unwrap_or_default();
        let document = serde_json::to_value(pod)?;

        let mut inner = self.inner.lock().expect("classifier lock");

        let mut matched: Vec<(String, Arc<dyn Pacer>, Option<Duration>)> =
            Vec::new();
        for i in 0..inner.policies.len() {
            let policy = &inner.policies[i];
            if !selector_matches(&policy.label_selector, &labels) {
                continue;
            }
            if !policy.bypass_label_selector.is_empty()
                && selector_matches(&policy.bypass_label_selector, &labels)
            {
                debug!(policy = %policy.name, "bypass selector matched, skipping");
                continue;
            }
            let key: String = policy
                .expression
                .eval(&document)
                .iter()
                .map(|v| jsonpath::value_to_string(v))
                .collect();
            if key.is_empty() {
                debug!(policy = %policy.name, "empty grouping key, skipping");
                continue;
            }

            let name = policy.name.clone();
            let max_blocked = policy.max_blocked;
            let factory = policy.factory.clone();
            let pacer = match inner.pacers_by_key.get(&key) {
                Some(pacer) => pacer,
                None => {
                    let pacer = factory.new_pacer(&key);
                    inner.pacers_by_key.insert(key.clone(), pacer.clone());
                    pacer
                }
            };
            matched.push((name, pacer, max_blocked));
        }

        if matched.is_empty() {
            return Ok(None);
        }

        let id = group_id(&matched);
        if let Some(group) = inner.groups_by_id.get(&id) {
            return Ok(Some(group));
        }

        // canonical order keeps the identifier stable under policy reordering
        matched.sort_by(|a, b| (a.1.id(), &a.0).cmp(&(b.1.id(), &b.0)));
        let policy_names: Vec<String> =
            matched.iter().map(|(name, _, _)| name.clone()).collect();
        let max_blocked = matched
            .iter()
            .filter_map(|(_, _, max_blocked)| *max_blocked)
            .min();
        let pacers: Vec<Arc<dyn Pacer>> =
            matched.into_iter().map(|(_, pacer, _)| pacer).collect();
        let group = GroupClassification {
            id: id.clone(),
            pacer: Arc::new(CompositePacer::new(id.clone(), pacers)),
            policy_names,
            max_blocked,
        };
        inner.groups_by_id.insert(id, group.clone());
        Ok(Some(group))
    }

    /// Looks up a cached group by its identifier. No re-matching happens
    /// here; the reconciler uses this since pods already carry the label.
    pub fn classify_by_group_id(
        &self,
        group_id: &str,
    ) -> Option<GroupClassification> {
        let mut inner = self.inner.lock().expect("classifier lock");
        inner.groups_by_id.get(group_id)
    }
}

impl Default for GroupClassifier {
    fn default() -> Self {
        Self::new()
    }
}

fn selector_matches(
    selector: &BTreeMap<String, String>,
    labels: &BTreeMap<String, String>,
) -> bool {
    selector
        .iter()
        .all(|(k, v)| labels.get(k) == Some(v))
}

fn group_id(
    matched: &[(String, Arc<dyn Pacer>, Option<Duration>)],
) -> String {
    let mut pairs: Vec<(String, String)> = matched
        .iter()
        .map(|(name, pacer, _)| (pacer.id(), name.clone()))
        .collect();
    pairs.sort();
    let pacer_ids: Vec<&str> =
        pairs.iter().map(|(id, _)| id.as_str()).collect();
    let names: Vec<&str> =
        pairs.iter().map(|(_, name)| name.as_str()).collect();
    let input =
        format!("[{}]({})", pacer_ids.join(","), names.join(","));
    format!("{:x}", md5::compute(input.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pacer::exponential::{self, ExponentialFactory};

    fn exponential_factory(name: &str) -> Arc<dyn PacerFactory> {
        Arc::new(ExponentialFactory::new(
            name,
            exponential::Config {
                min_initial: 1,
                max_stagger: 16,
                multiplier: 2.0,
            },
        ))
    }

    fn policy(name: &str, expression: &str) -> PacingPolicy {
        PacingPolicy {
            name: name.to_string(),
            label_selector: BTreeMap::new(),
            bypass_label_selector: BTreeMap::new(),
            grouping_expression: expression.to_string(),
            factory: exponential_factory(name),
            max_blocked: None,
        }
    }

    fn pod_in(namespace: &str, labels: &[(&str, &str)]) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.namespace = Some(namespace.to_string());
        if !labels.is_empty() {
            pod.metadata.labels = Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            );
        }
        pod
    }

    #[test]
    fn classify_is_deterministic() {
        let classifier = GroupClassifier::new();
        classifier
            .add_policy(policy("by-namespace", ".metadata.namespace"))
            .unwrap();

        let pod = pod_in("testnamespace", &[]);
        let first = classifier.classify(&pod).unwrap().unwrap();
        let second = classifier.classify(&pod).unwrap().unwrap();
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn multiple_policies_share_one_group() {
        let classifier = GroupClassifier::new();
        classifier
            .add_policy(policy("by-namespace", ".metadata.namespace"))
            .unwrap();
        classifier
            .add_policy(policy("by-label", ".metadata.labels.label1"))
            .unwrap();

        let pod = pod_in("testnamespace", &[("label1", "value1")]);
        let group = classifier.classify(&pod).unwrap().unwrap();
        assert_eq!(
            group.policy_names,
            vec!["by-label".to_string(), "by-namespace".to_string()]
        );
    }

    #[test]
    fn group_id_is_stable_under_policy_reordering() {
        let forward = GroupClassifier::new();
        forward
            .add_policy(policy("by-namespace", ".metadata.namespace"))
            .unwrap();
        forward
            .add_policy(policy("by-label", ".metadata.labels.label1"))
            .unwrap();

        let reversed = GroupClassifier::new();
        reversed
            .add_policy(policy("by-label", ".metadata.labels.label1"))
            .unwrap();
        reversed
            .add_policy(policy("by-namespace", ".metadata.namespace"))
            .unwrap();

        let pod = pod_in("testnamespace", &[("label1", "value1")]);
        let a = forward.classify(&pod).unwrap().unwrap();
        let b = reversed.classify(&pod).unwrap().unwrap();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn label_selector_must_match() {
        let classifier = GroupClassifier::new();
        let mut p = policy("selective", ".metadata.name");
        p.label_selector =
            BTreeMap::from([("key".to_string(), "value".to_string())]);
        classifier.add_policy(p).unwrap();

        let pod = Pod::default();
        assert!(classifier.classify(&pod).unwrap().is_none());
    }

    #[test]
    fn bypass_selector_skips_policy() {
        let classifier = GroupClassifier::new();
        let mut p = policy("bypassable", ".metadata.namespace");
        p.bypass_label_selector =
            BTreeMap::from([("skip".to_string(), "1".to_string())]);
        classifier.add_policy(p).unwrap();

        let paced = pod_in("ns", &[]);
        assert!(classifier.classify(&paced).unwrap().is_some());

        let bypassed = pod_in("ns", &[("skip", "1")]);
        assert!(classifier.classify(&bypassed).unwrap().is_none());
    }

    #[test]
    fn empty_grouping_key_skips_policy() {
        let classifier = GroupClassifier::new();
        classifier
            .add_policy(policy("by-name", ".metadata.name"))
            .unwrap();

        // no name set, expression yields nothing
        let pod = Pod::default();
        assert!(classifier.classify(&pod).unwrap().is_none());
    }

    #[test]
    fn rejects_bad_expression() {
        let classifier = GroupClassifier::new();
        let result =
            classifier.add_policy(policy("broken", "bad jsonpath"));
        assert!(matches!(result, Err(PolicyError::Expression { .. })));
    }

    #[test]
    fn rejects_duplicate_names_and_expressions() {
        let classifier = GroupClassifier::new();
        classifier
            .add_policy(policy("one", ".metadata.namespace"))
            .unwrap();

        assert!(matches!(
            classifier.add_policy(policy("one", ".metadata.name")),
            Err(PolicyError::DuplicateName(_))
        ));
        assert!(matches!(
            classifier.add_policy(policy("two", ".metadata.namespace")),
            Err(PolicyError::DuplicateExpression(..))
        ));
    }

    #[test]
    fn classify_by_group_id_hits_cache_only() {
        let classifier = GroupClassifier::new();
        classifier
            .add_policy(policy("by-namespace", ".metadata.namespace"))
            .unwrap();

        let pod = pod_in("ns1", &[]);
        let group = classifier.classify(&pod).unwrap().unwrap();
        assert!(classifier.classify_by_group_id(&group.id).is_some());
        assert!(classifier.classify_by_group_id("unknown").is_none());
    }

    #[test]
    fn tightest_max_blocked_wins() {
        let classifier = GroupClassifier::new();
        let mut a = policy("slow", ".metadata.namespace");
        a.max_blocked = Some(Duration::from_secs(600));
        let mut b = policy("fast", ".metadata.labels.label1");
        b.max_blocked = Some(Duration::from_secs(60));
        classifier.add_policy(a).unwrap();
        classifier.add_policy(b).unwrap();

        let pod = pod_in("ns", &[("label1", "v")]);
        let group = classifier.classify(&pod).unwrap().unwrap();
        assert_eq!(group.max_blocked, Some(Duration::from_secs(60)));
    }
}
