//! Stack-file schema, resource identity, state lock, plan, and provenance types.
//!
//! Everything persisted derives Serialize/Deserialize so the stack file and the
//! lock file roundtrip through YAML.

use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Recorded or resolved key/value properties of one resource.
pub type Properties = IndexMap<String, serde_json::Value>;

// ============================================================================
// Stack file
// ============================================================================

/// Root configuration of one named stack of the project.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StackConfig {
    /// Project name, used in standard tags
    pub project: String,

    /// Stack name (dev, staging, prod)
    pub stack: String,

    /// Optional description
    #[serde(default)]
    pub description: Option<String>,

    /// Cloud region the provider targets
    #[serde(default = "default_region")]
    pub region: String,

    /// Namespaced configuration values (`namespace:key: value`)
    #[serde(default)]
    pub config: BTreeMap<String, String>,

    /// Tagging policy
    #[serde(default)]
    pub tagging: TagPolicy,

    /// Engine policy
    #[serde(default)]
    pub policy: Policy,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

/// Standard tag policy applied to taggable resources.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TagPolicy {
    /// Apply `<prefix>:project`, `<prefix>:stack`, `<prefix>:network` tags
    #[serde(default = "default_true")]
    pub standard_tags: bool,

    /// Tag key prefix
    #[serde(default = "default_tag_prefix")]
    pub prefix: String,
}

impl Default for TagPolicy {
    fn default() -> Self {
        Self {
            standard_tags: true,
            prefix: default_tag_prefix(),
        }
    }
}

fn default_tag_prefix() -> String {
    "air-tek".to_string()
}

/// Engine policy.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Policy {
    /// Append provenance events to the JSONL event log
    #[serde(default = "default_true")]
    pub event_log: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self { event_log: true }
    }
}

fn default_true() -> bool {
    true
}

// ============================================================================
// Resources
// ============================================================================

/// Resource kind the provider is asked to manage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
    /// Grouping node in the ownership tree; never sent to the provider.
    #[serde(rename = "component")]
    Component,
    #[serde(rename = "aws:ec2:Vpc")]
    Vpc,
    #[serde(rename = "aws:ec2:Subnet")]
    Subnet,
    #[serde(rename = "aws:ec2:InternetGateway")]
    InternetGateway,
    #[serde(rename = "aws:ec2:RouteTable")]
    RouteTable,
    #[serde(rename = "aws:ec2:RouteTableAssociation")]
    RouteTableAssociation,
    #[serde(rename = "aws:ec2:Eip")]
    Eip,
    #[serde(rename = "aws:ec2:NatGateway")]
    NatGateway,
    #[serde(rename = "aws:ec2:SecurityGroup")]
    SecurityGroup,
    #[serde(rename = "aws:lb:LoadBalancer")]
    LoadBalancer,
    #[serde(rename = "aws:lb:TargetGroup")]
    TargetGroup,
    #[serde(rename = "aws:lb:Listener")]
    Listener,
    #[serde(rename = "aws:ecr:Repository")]
    Repository,
    #[serde(rename = "aws:ecr:getCredentials")]
    RegistryCredentials,
    #[serde(rename = "docker:Image")]
    Image,
    #[serde(rename = "aws:iam:Role")]
    Role,
    #[serde(rename = "aws:iam:RolePolicyAttachment")]
    RolePolicyAttachment,
    #[serde(rename = "aws:ecs:Cluster")]
    Cluster,
    #[serde(rename = "aws:ecs:TaskDefinition")]
    TaskDefinition,
    #[serde(rename = "aws:ecs:Service")]
    Service,
}

impl ResourceKind {
    /// Type token used in URNs, the lock file, and plan output.
    pub fn token(&self) -> &'static str {
        match self {
            Self::Component => "component",
            Self::Vpc => "aws:ec2:Vpc",
            Self::Subnet => "aws:ec2:Subnet",
            Self::InternetGateway => "aws:ec2:InternetGateway",
            Self::RouteTable => "aws:ec2:RouteTable",
            Self::RouteTableAssociation => "aws:ec2:RouteTableAssociation",
            Self::Eip => "aws:ec2:Eip",
            Self::NatGateway => "aws:ec2:NatGateway",
            Self::SecurityGroup => "aws:ec2:SecurityGroup",
            Self::LoadBalancer => "aws:lb:LoadBalancer",
            Self::TargetGroup => "aws:lb:TargetGroup",
            Self::Listener => "aws:lb:Listener",
            Self::Repository => "aws:ecr:Repository",
            Self::RegistryCredentials => "aws:ecr:getCredentials",
            Self::Image => "docker:Image",
            Self::Role => "aws:iam:Role",
            Self::RolePolicyAttachment => "aws:iam:RolePolicyAttachment",
            Self::Cluster => "aws:ecs:Cluster",
            Self::TaskDefinition => "aws:ecs:TaskDefinition",
            Self::Service => "aws:ecs:Service",
        }
    }

    /// Components only group children and publish outputs.
    pub fn is_component(&self) -> bool {
        matches!(self, Self::Component)
    }

    /// Data sources are read on every run and never persisted.
    pub fn is_data_source(&self) -> bool {
        matches!(self, Self::RegistryCredentials)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.token())
    }
}

/// Stable identity of a declared resource: `<kind>::<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Urn(String);

impl Urn {
    pub fn new(kind: ResourceKind, name: &str) -> Self {
        Self(format!("{}::{}", kind.token(), name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Logical name part of the URN.
    pub fn name(&self) -> &str {
        self.0.rsplit_once("::").map(|(_, n)| n).unwrap_or(&self.0)
    }
}

impl fmt::Display for Urn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// State / Lock file
// ============================================================================

/// Per-stack state lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateLock {
    /// Schema version
    pub schema: String,

    /// Project name
    pub project: String,

    /// Stack name
    pub stack: String,

    /// When the lock was generated
    pub generated_at: String,

    /// Generator version
    pub generator: String,

    /// Per-resource state, in apply order
    pub resources: IndexMap<Urn, ResourceLock>,

    /// Resolved stack outputs
    #[serde(default)]
    pub outputs: IndexMap<String, serde_json::Value>,
}

/// Per-resource lock entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLock {
    /// Resource kind
    #[serde(rename = "type")]
    pub kind: ResourceKind,

    /// Logical name
    pub name: String,

    /// Owning component, if any
    #[serde(default)]
    pub parent: Option<Urn>,

    /// Resources this one read inputs from when it was last applied
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<Urn>,

    /// Convergence status
    pub status: ResourceStatus,

    /// When the resource was last applied
    #[serde(default)]
    pub applied_at: Option<String>,

    /// Duration of last apply in seconds
    #[serde(default)]
    pub duration_seconds: Option<f64>,

    /// BLAKE3 hash of the non-secret resolved inputs
    pub hash: String,

    /// Provider-reported attributes
    #[serde(default)]
    pub attributes: Properties,
}

/// Resource convergence status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Converged,
    Failed,
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Converged => write!(f, "CONVERGED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

// ============================================================================
// Plan
// ============================================================================

/// Action to take on a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanAction {
    Create,
    Update,
    Read,
    Destroy,
    NoOp,
}

impl fmt::Display for PlanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "CREATE"),
            Self::Update => write!(f, "UPDATE"),
            Self::Read => write!(f, "READ"),
            Self::Destroy => write!(f, "DESTROY"),
            Self::NoOp => write!(f, "NO-OP"),
        }
    }
}

/// A single planned change.
#[derive(Debug, Clone)]
pub struct PlannedChange {
    /// Resource URN
    pub urn: Urn,

    /// Resource kind
    pub kind: ResourceKind,

    /// Owning component
    pub parent: Option<Urn>,

    /// Action to take
    pub action: PlanAction,

    /// Human-readable description
    pub description: String,
}

/// Full execution plan.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    /// Stack name
    pub stack: String,

    /// Planned changes in execution order, destroys last
    pub changes: Vec<PlannedChange>,

    /// Topological execution order
    pub execution_order: Vec<Urn>,

    /// Summary counts
    pub to_create: u32,
    pub to_update: u32,
    pub to_destroy: u32,
    pub to_read: u32,
    pub unchanged: u32,
}

// ============================================================================
// Provenance events
// ============================================================================

/// Provenance event for the JSONL event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProvenanceEvent {
    UpStarted {
        stack: String,
        run_id: String,
        version: String,
    },
    ResourceStarted {
        stack: String,
        resource: String,
        action: String,
    },
    ResourceConverged {
        stack: String,
        resource: String,
        duration_seconds: f64,
        hash: String,
    },
    ResourceFailed {
        stack: String,
        resource: String,
        error: String,
    },
    ResourceDeleted {
        stack: String,
        resource: String,
    },
    UpCompleted {
        stack: String,
        run_id: String,
        resources_created: u32,
        resources_updated: u32,
        resources_unchanged: u32,
        resources_deleted: u32,
        total_seconds: f64,
    },
}

/// Timestamped event wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: ProvenanceEvent,
}

// ============================================================================
// Run results
// ============================================================================

/// Result of `up` on one stack.
#[derive(Debug, Clone)]
pub struct UpResult {
    pub stack: String,
    pub resources_created: u32,
    pub resources_updated: u32,
    pub resources_unchanged: u32,
    pub resources_deleted: u32,
    pub outputs: IndexMap<String, serde_json::Value>,
    pub total_duration: std::time::Duration,
}

/// Result of `destroy` on one stack.
#[derive(Debug, Clone)]
pub struct DestroyResult {
    pub stack: String,
    pub resources_deleted: u32,
    pub total_duration: std::time::Duration,
}

// ============================================================================
// Tests
// ============================================================================
