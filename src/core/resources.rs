use compact_str::CompactString;
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

#[derive(Debug)]
pub enum ResourcesError {
    InvalidGroupSize(usize),
    GpuPerNodeTooSmall(u32),
    NumberNodeNotOne(u32),
}

impl std::error::Error for ResourcesError {}
impl fmt::Display for ResourcesError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourcesError::InvalidGroupSize(size) => {
                write!(f, "group_size must be a positive number, got {}", size)
            }
            ResourcesError::GpuPerNodeTooSmall(gpus) => write!(
                f,
                "gpu_per_node can not be smaller than 1 when if_cuda_multi_devices is set, got {}",
                gpus
            ),
            ResourcesError::NumberNodeNotOne(nodes) => write!(
                f,
                "number_node must be 1 when if_cuda_multi_devices is set, got {}",
                nodes
            ),
        }
    }
}

/// Machine demand for one job: node/cpu/gpu counts, the scheduler queue and
/// how many tasks are packed into a single submitted script (`group_size`).
///
/// Validation happens at construction; deserializing goes through the same
/// checks, so an invalid combination can not be smuggled in via a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawResources")]
pub struct Resources {
    pub number_node: u32,
    pub cpu_per_node: u32,
    pub gpu_per_node: u32,
    pub queue_name: CompactString,
    pub group_size: usize,
    /// Spread tasks of one job over the node's GPUs via CUDA_VISIBLE_DEVICES.
    /// Requires a single node with at least one GPU.
    pub if_cuda_multi_devices: bool,
}

impl Resources {
    pub fn new(
        number_node: u32,
        cpu_per_node: u32,
        gpu_per_node: u32,
        queue_name: impl Into<CompactString>,
        group_size: usize,
        if_cuda_multi_devices: bool,
    ) -> Result<Self, ResourcesError> {
        if group_size < 1 {
            return Err(ResourcesError::InvalidGroupSize(group_size));
        }
        if if_cuda_multi_devices {
            if gpu_per_node < 1 {
                return Err(ResourcesError::GpuPerNodeTooSmall(gpu_per_node));
            }
            if number_node != 1 {
                return Err(ResourcesError::NumberNodeNotOne(number_node));
            }
        }
        Ok(Self {
            number_node,
            cpu_per_node,
            gpu_per_node,
            queue_name: queue_name.into(),
            group_size,
            if_cuda_multi_devices,
        })
    }
}

#[derive(Deserialize)]
struct RawResources {
    number_node: u32,
    cpu_per_node: u32,
    gpu_per_node: u32,
    queue_name: CompactString,
    #[serde(default = "default_group_size")]
    group_size: usize,
    #[serde(default)]
    if_cuda_multi_devices: bool,
}

fn default_group_size() -> usize {
    1
}

impl TryFrom<RawResources> for Resources {
    type Error = ResourcesError;

    fn try_from(raw: RawResources) -> Result<Self, Self::Error> {
        Resources::new(
            raw.number_node,
            raw.cpu_per_node,
            raw.gpu_per_node,
            raw.queue_name,
            raw.group_size,
            raw.if_cuda_multi_devices,
        )
    }
}

/// `Resources` plus an opaque map of extra sbatch directives, forwarded
/// verbatim to the script generator of a Slurm backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlurmResources {
    pub resources: Resources,
    pub slurm_sbatch_dict: IndexMap<CompactString, CompactString>,
}

/// Either plain `Resources` or the Slurm specialization.
///
/// The serialized forms are distinguished by the presence of the
/// `slurm_sbatch_dict` key, so no tag is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ResourceSpec {
    Base(Resources),
    Slurm(SlurmResources),
}

impl ResourceSpec {
    pub fn base(&self) -> &Resources {
        match self {
            ResourceSpec::Base(resources) => resources,
            ResourceSpec::Slurm(slurm) => &slurm.resources,
        }
    }

    pub fn group_size(&self) -> usize {
        self.base().group_size
    }
}

impl From<Resources> for ResourceSpec {
    fn from(resources: Resources) -> Self {
        ResourceSpec::Base(resources)
    }
}

impl From<SlurmResources> for ResourceSpec {
    fn from(slurm: SlurmResources) -> Self {
        ResourceSpec::Slurm(slurm)
    }
}

impl<'de> Deserialize<'de> for ResourceSpec {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        let value = serde_json::Value::deserialize(deserializer)?;
        if value.get("slurm_sbatch_dict").is_some() {
            serde_json::from_value::<SlurmResources>(value)
                .map(ResourceSpec::Slurm)
                .map_err(D::Error::custom)
        } else {
            serde_json::from_value::<Resources>(value)
                .map(ResourceSpec::Base)
                .map_err(D::Error::custom)
        }
    }
}
