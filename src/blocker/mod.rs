pub mod node_selector;
pub mod stub_pod;

use k8s_openapi::api::core::v1::PodSpec;
use thiserror::Error;

pub use node_selector::NodeSelectorBlocker;
pub use stub_pod::StubPodBlocker;

#[derive(Debug, Error)]
pub enum BlockError {
    #[error("unblock is not supported by this blocker")]
    UnblockUnsupported,
}

/// Applies and detects a reversible do-not-schedule marking on a pod spec.
///
/// `block` must be idempotent: marking an already blocked spec is a no-op.
pub trait PodBlocker: Send + Sync {
    fn block(&self, spec: &mut PodSpec);

    fn unblock(&self, spec: &mut PodSpec) -> Result<(), BlockError>;

    fn is_blocked(&self, spec: &PodSpec) -> bool;
}
