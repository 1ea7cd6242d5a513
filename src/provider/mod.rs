//! The SDK boundary: every resource call goes through a [`Provider`].

pub mod memory;

use crate::core::error::Result;
use crate::core::types::{Properties, ResourceKind};

/// A cloud control plane that can manage the resource kinds of the stack.
///
/// Inputs arrive fully resolved. Every call either succeeds with the
/// provider-reported attributes or fails; there are no partial results.
pub trait Provider: Send + Sync {
    /// Provider name shown in plans and logs.
    fn name(&self) -> &str;

    /// Availability zones of the configured region, in provider order.
    fn availability_zones(&self) -> Result<Vec<String>>;

    /// Create a resource and report its attributes.
    fn create(&self, kind: ResourceKind, name: &str, inputs: &Properties) -> Result<Properties>;

    /// Replace the desired inputs of an existing resource.
    fn update(
        &self,
        kind: ResourceKind,
        name: &str,
        current: &Properties,
        inputs: &Properties,
    ) -> Result<Properties>;

    /// Delete a resource given its recorded attributes.
    fn delete(&self, kind: ResourceKind, name: &str, current: &Properties) -> Result<()>;

    /// Read a data source. Results are never persisted.
    fn invoke(&self, kind: ResourceKind, inputs: &Properties) -> Result<Properties>;
}
