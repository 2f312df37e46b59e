use k8s_openapi::api::core::v1::{Container, PodSpec};

use super::{BlockError, PodBlocker};

pub const STUB_INIT_CONTAINER_NAME: &str = "pacekeeper-hold";

/// Blocks a pod with an infinitely sleeping init container.
///
/// To prevent unnecessary image pulls it also hollows out the pod's own
/// images, commands and volume mounts, replacing them with the stub image.
/// The sleeping init container leaves the pod not Ready and in `Init`
/// state as a visible sign of being held. Not reversible; only used when a
/// pod must be prevented from pulling images at all.
pub struct StubPodBlocker {
    container_image: String,
}

impl StubPodBlocker {
    pub fn new(container_image: impl Into<String>) -> Self {
        Self {
            container_image: container_image.into(),
        }
    }
}

impl PodBlocker for StubPodBlocker {
    fn block(&self, spec: &mut PodSpec) {
        if self.is_blocked(spec) {
            return;
        }
        let init_containers = spec.init_containers.get_or_insert_with(Vec::new);
        for container in init_containers.iter_mut() {
            container.image = Some(self.container_image.clone());
            container.command = None;
            container.args = Some(vec!["initcontainer".to_string()]);
            container.volume_mounts = None;
        }
        // these never start, they are stubs to prevent image pulls
        for container in spec.containers.iter_mut() {
            container.image = Some(self.container_image.clone());
            container.command = None;
            container.args = None;
            container.volume_mounts = None;
        }
        init_containers.push(Container {
            name: STUB_INIT_CONTAINER_NAME.to_string(),
            image: Some(self.container_image.clone()),
            args: Some(vec!["container".to_string()]),
            ..Container::default()
        });
    }

    fn unblock(&self, _spec: &mut PodSpec) -> Result<(), BlockError> {
        Err(BlockError::UnblockUnsupported)
    }

    fn is_blocked(&self, spec: &PodSpec) -> bool {
        spec.init_containers
            .as_ref()
            .map(|containers| {
                containers.iter().any(|c| {
                    c.name == STUB_INIT_CONTAINER_NAME
                        && c.image.as_deref()
                            == Some(self.container_image.as_str())
                })
            })
            .unwrap_or(false)
    }
}
