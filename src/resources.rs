use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt::Display,
    hash::{Hash, Hasher},
};

pub trait Meta {
    fn metadata(&self) -> &Metadata;
    fn metadata_mut(&mut self) -> &mut Metadata;
}

macro_rules! impl_meta {
    ($r:ident) => {
        impl Meta for $r {
            fn metadata(&self) -> &Metadata {
                &self.metadata
            }
            fn metadata_mut(&mut self) -> &mut Metadata {
                &mut self.metadata
            }
        }
    };
}

impl_meta!(MachineSet);
impl_meta!(Machine);
impl_meta!(Node);

/// The `(namespace, name)` pair that identifies an object and keys the work queue.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn of<M: Meta>(resource: &M) -> Self {
        let metadata = resource.metadata();
        Self::new(metadata.namespace.clone(), metadata.name.clone())
    }
}

impl Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    // Name must be unique within a namespace. Cannot be updated.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    // GenerateName is an optional prefix, used by the server, to generate a unique name ONLY IF
    // the Name field has not been provided.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub generate_name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    // CreationTimestamp is a timestamp representing the server time when this object was created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<Time>,

    // DeletionTimestamp is set by the server when a graceful deletion is requested. The resource
    // is removed once the finalizers list is empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_grace_period_seconds: Option<u64>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    // List of objects depended by this object. There cannot be more than one managing controller.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,

    // A sequence number representing a specific generation of the desired state (spec).
    #[serde(default, skip_serializing_if = "u64_is_zero")]
    pub generation: u64,

    // An opaque value used for optimistic concurrency.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_version: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
}

fn u64_is_zero(val: &u64) -> bool {
    *val == 0
}

impl Metadata {
    /// The single owner reference marked as the managing controller, if any.
    pub fn controller_ref(&self) -> Option<&OwnerReference> {
        self.owner_references.iter().find(|or| or.controller)
    }

    pub fn is_controlled_by(&self, owner: &Metadata) -> bool {
        self.controller_ref().map_or(false, |or| or.uid == owner.uid)
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub api_version: String,

    pub kind: String,

    pub name: String,

    pub uid: String,

    #[serde(default)]
    pub block_owner_deletion: bool,

    #[serde(default)]
    pub controller: bool,
}

/// Labels and annotations stamped onto objects created from a template.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MachineSet {
    pub metadata: Metadata,
    pub spec: MachineSetSpec,
    #[serde(default)]
    pub status: MachineSetStatus,
}

impl MachineSet {
    pub const GVK: GroupVersionKind = GroupVersionKind {
        group: "machine.openshift.io",
        version: "v1beta1",
        kind: "MachineSet",
        plural: "machinesets",
    };

    pub fn desired_replicas(&self) -> usize {
        self.spec.replicas.unwrap_or(1) as usize
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineSetSpec {
    // Replicas is the number of desired replicas. Defaults to 1 when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,

    // Minimum number of seconds for which a newly created machine should be ready before it is
    // considered available.
    #[serde(default)]
    pub min_ready_seconds: u32,

    // DeletePolicy defines the policy used to identify nodes to delete when downscaling.
    // Valid values are "Random", "Newest", "Oldest". Empty means "Random".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub delete_policy: String,

    // Selector is a label query over machines that should match the replica count.
    #[serde(default)]
    pub selector: LabelSelector,

    #[serde(default)]
    pub template: MachineTemplateSpec,

    // The API that is desired to be authoritative for this MachineSet.
    #[serde(default, rename = "authoritativeAPI", skip_serializing_if = "Option::is_none")]
    pub authoritative_api: Option<AuthoritativeApi>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MachineTemplateSpec {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: MachineSpec,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineSetStatus {
    // Replicas is the most recently observed number of replicas.
    #[serde(default)]
    pub replicas: u32,

    // The number of replicas that have labels matching the labels of the machine template.
    #[serde(default)]
    pub fully_labeled_replicas: u32,

    // The number of ready replicas for this MachineSet. A machine is considered ready when the
    // node has been created and is "Ready".
    #[serde(default)]
    pub ready_replicas: u32,

    // The number of available replicas (ready for at least minReadySeconds).
    #[serde(default)]
    pub available_replicas: u32,

    // ObservedGeneration reflects the generation of the most recently observed MachineSet.
    #[serde(default)]
    pub observed_generation: u64,

    // The selector machines were last reconciled against, in label query syntax.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<String>,

    // Set when there is a terminal problem reconciling the MachineSet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    // The API that is currently authoritative for this MachineSet.
    #[serde(default, rename = "authoritativeAPI", skip_serializing_if = "Option::is_none")]
    pub authoritative_api: Option<AuthoritativeApi>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthoritativeApi {
    #[default]
    MachineAPI,
    ClusterAPI,
    Migrating,
}

impl Display for AuthoritativeApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AuthoritativeApi::MachineAPI => "MachineAPI",
            AuthoritativeApi::ClusterAPI => "ClusterAPI",
            AuthoritativeApi::Migrating => "Migrating",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub r#type: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<ConditionSeverity>,
    // Last time the condition transitioned from one status to another.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
    // The reason for the condition's last transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    // A human readable message indicating details about the transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionSeverity {
    Error,
    Warning,
    Info,
    #[serde(rename = "")]
    None,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    // matchLabels is a map of {key,value} pairs. A single {key,value} in the matchLabels map is
    // equivalent to an element of matchExpressions, whose key field is "key", the operator is
    // "In", and the values array contains only "value". The requirements are ANDed.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,

    // matchExpressions is a list of label selector requirements. The requirements are ANDed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelectorRequirement {
    pub key: String,
    pub operator: LabelSelectorOperator,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LabelSelectorOperator {
    #[default]
    In,
    NotIn,
    Exists,
    DoesNotExist,
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Machine {
    pub metadata: Metadata,
    #[serde(default)]
    pub spec: MachineSpec,
    #[serde(default)]
    pub status: MachineStatus,
}

impl Machine {
    pub const GVK: GroupVersionKind = GroupVersionKind {
        group: "machine.openshift.io",
        version: "v1beta1",
        kind: "Machine",
        plural: "machines",
    };

    pub fn node_name(&self) -> Option<&str> {
        self.status.node_ref.as_ref().map(|n| n.name.as_str())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    // Labels and annotations propagated to the backing node.
    #[serde(default, skip_serializing_if = "is_default")]
    pub metadata: ObjectMeta,

    #[serde(default, skip_serializing_if = "is_default")]
    pub lifecycle_hooks: LifecycleHooks,

    // The list of taints to be applied to the corresponding Node in additive manner.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<Taint>,

    // ProviderSpec details provider-specific configuration to use during node creation.
    #[serde(default)]
    pub provider_spec: ProviderSpec,

    #[serde(default, rename = "providerID", skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
}

fn is_default<D: Default + PartialEq>(val: &D) -> bool {
    val == &D::default()
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleHooks {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_drain: Vec<LifecycleHook>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_terminate: Vec<LifecycleHook>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LifecycleHook {
    pub name: String,
    pub owner: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Taint {
    pub effect: TaintEffect,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_added: Option<Time>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaintEffect {
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProviderSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<RawExtension>,
}

/// An opaque provider payload, carried through untouched.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawExtension(pub serde_json::Value);

impl Hash for RawExtension {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_string().hash(state)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<MachinePhase>,

    // NodeRef will point to the corresponding Node if it exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_ref: Option<NodeReference>,

    // ErrorReason will be set in the event that there is a terminal problem reconciling the
    // Machine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MachinePhase {
    Provisioning,
    Provisioned,
    Running,
    Deleting,
    Failed,
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeReference {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub metadata: Metadata,
    #[serde(default)]
    pub status: NodeStatus,
}

impl Node {
    pub const GVK: GroupVersionKind = GroupVersionKind {
        group: "",
        version: "v1",
        kind: "Node",
        plural: "nodes",
    };
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeStatus {
    #[serde(default)]
    pub conditions: Vec<NodeCondition>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCondition {
    pub r#type: NodeConditionType,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub last_heartbeat_time: Option<Time>,
    #[serde(default)]
    pub last_transition_time: Option<Time>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeConditionType {
    #[default]
    Ready,
    DiskPressure,
    MemoryPressure,
    PIDPressure,
    NetworkUnavailable,
    #[serde(other)]
    Other,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Time(#[serde(with = "time::serde::rfc3339")] pub time::OffsetDateTime);

pub struct GroupVersionKind {
    pub group: &'static str,
    pub version: &'static str,
    pub kind: &'static str,
    pub plural: &'static str,
}

impl GroupVersionKind {
    pub fn group_version(&self) -> GroupVersion {
        GroupVersion {
            group: self.group,
            version: self.version,
        }
    }

    pub fn api_version(&self) -> String {
        self.group_version().to_string()
    }
}

impl Display for GroupVersionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}, Kind={}", self.group, self.version, self.kind)
    }
}

pub struct GroupVersion {
    pub group: &'static str,
    pub version: &'static str,
}

impl Display for GroupVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.version)
        } else {
            write!(f, "{}/{}", self.group, self.version)
        }
    }
}
