use std::collections::HashMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;

use super::{GroupStanding, Pacer, pod_identity};

/// Admits only the pods that every sub-pacer admits.
pub struct CompositePacer {
    id: String,
    pacers: Vec<Arc<dyn Pacer>>,
}

impl CompositePacer {
    pub fn new(id: impl Into<String>, pacers: Vec<Arc<dyn Pacer>>) -> Self {
        Self {
            id: id.into(),
            pacers,
        }
    }
}

impl Pacer for CompositePacer {
    fn pace(&self, standing: &GroupStanding) -> Vec<Pod> {
        let mut votes: HashMap<String, usize> = HashMap::new();
        for pacer in &self.pacers {
            for pod in pacer.pace(standing) {
                *votes.entry(pod_identity(&pod)).or_default() += 1;
            }
        }

        // keep blocked order so the caller sees a stable subset
        standing
            .blocked
            .iter()
            .filter(|pod| {
                votes.get(&pod_identity(pod)) == Some(&self.pacers.len())
            })
            .cloned()
            .collect()
    }

    fn id(&self) -> String {
        let inner: Vec<String> =
            self.pacers.iter().map(|p| p.id()).collect();
        format!("composite({})[{}]", self.id, inner.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pacer::testing::named_pods;

    struct FixedPacer {
        allow: Vec<Pod>,
    }

    impl Pacer for FixedPacer {
        fn pace(&self, _standing: &GroupStanding) -> Vec<Pod> {
            self.allow.clone()
        }

        fn id(&self) -> String {
            "fixed".to_string()
        }
    }

    #[test]
    fn intersects_sub_pacer_results() {
        let blocked = named_pods(4, "pod");
        let first = FixedPacer {
            allow: blocked[0..3].to_vec(),
        };
        let second = FixedPacer {
            allow: blocked[1..4].to_vec(),
        };
        let composite = CompositePacer::new(
            "g1",
            vec![Arc::new(first), Arc::new(second)],
        );

        let standing = GroupStanding {
            ready: vec![],
            starting: vec![],
            blocked: blocked.clone(),
        };
        let allowed = composite.pace(&standing);
        let names: Vec<_> = allowed
            .iter()
            .map(|p| p.metadata.name.clone().unwrap())
            .collect();
        assert_eq!(names, vec!["pod-2", "pod-3"]);
    }

    #[test]
    fn result_is_subset_of_each_sub_pacer() {
        let blocked = named_pods(6, "pod");
        let first = FixedPacer {
            allow: blocked[0..5].to_vec(),
        };
        let second = FixedPacer {
            allow: blocked[2..6].to_vec(),
        };
        let first_ids: Vec<String> =
            first.allow.iter().map(pod_identity).collect();
        let second_ids: Vec<String> =
            second.allow.iter().map(pod_identity).collect();

        let composite = CompositePacer::new(
            "g2",
            vec![Arc::new(first), Arc::new(second)],
        );
        let standing = GroupStanding {
            ready: vec![],
            starting: vec![],
            blocked,
        };
        for pod in composite.pace(&standing) {
            let id = pod_identity(&pod);
            assert!(first_ids.contains(&id));
            assert!(second_ids.contains(&id));
        }
    }

    #[test]
    fn empty_sub_pacer_blocks_everything() {
        let blocked = named_pods(3, "pod");
        let open = FixedPacer {
            allow: blocked.clone(),
        };
        let closed = FixedPacer { allow: vec![] };
        let composite = CompositePacer::new(
            "g3",
            vec![Arc::new(open), Arc::new(closed)],
        );
        let standing = GroupStanding {
            ready: vec![],
            starting: vec![],
            blocked,
        };
        assert!(composite.pace(&standing).is_empty());
    }
}
