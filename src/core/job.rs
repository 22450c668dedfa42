use crate::core::batch::Batch;
use crate::core::resources::ResourceSpec;
use crate::core::task::Task;
use crate::utils::sha1_hex;
use compact_str::CompactString;
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use strum::{Display, EnumIter, EnumString, FromRepr};

/// Resubmissions a job may consume before the run aborts.
pub const FAIL_COUNT_LIMIT: u32 = 5;

#[derive(Debug)]
pub enum JobError {
    UnknownState { job_hash: String },
    RetryLimitExceeded { job_hash: String, fail_count: u32 },
}

impl std::error::Error for JobError {}
impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobError::UnknownState { job_hash } => {
                write!(f, "job_state for job {} is unknown", job_hash)
            }
            JobError::RetryLimitExceeded {
                job_hash,
                fail_count,
            } => {
                write!(f, "job {} failed {} times, giving up", job_hash, fail_count)
            }
        }
    }
}

/// Scheduler-side status of a job.
///
/// The canonical serialized form is the snake_case string; deserialization
/// additionally accepts the integer codes older snapshots carry (see
/// [`Job`]'s `job_state` field).
#[derive(
    Debug,
    Deserialize,
    Serialize,
    PartialEq,
    Eq,
    Clone,
    Copy,
    Display,
    EnumIter,
    FromRepr,
    EnumString,
    Hash,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum JobState {
    Unsubmitted = 1,
    Waiting = 2,
    Running = 3,
    /// Killed externally after having been submitted.
    Terminated = 4,
    Finished = 5,
    Completing = 6,
    Unknown = 100,
}

impl JobState {
    /// States that keep a submission alive.
    pub const ALIVE: &'static [JobState] = &[
        JobState::Unsubmitted,
        JobState::Waiting,
        JobState::Running,
        JobState::Terminated,
        JobState::Completing,
        JobState::Unknown,
    ];

    pub fn is_alive(&self) -> bool {
        Self::ALIVE.contains(self)
    }

    /// States the per-job recovery step has to act on.
    pub fn needs_attention(&self) -> bool {
        matches!(self, JobState::Terminated | JobState::Unknown)
    }
}

/// A bundle of tasks submitted together as one scheduler job.
///
/// The task list and resources are frozen at construction; only the runtime
/// triple (`job_state`, `job_id`, `fail_count`) mutates afterwards. The
/// identity `job_hash` is the SHA1 of the static serialization, so it is
/// stable no matter what the scheduler does to the job.
#[derive(Debug, Clone)]
pub struct Job {
    job_task_list: Vec<Task>,
    resources: ResourceSpec,
    job_hash: String,
    pub job_state: JobState,
    pub job_id: CompactString,
    pub fail_count: u32,
}

#[derive(Serialize)]
struct StaticContent<'a> {
    job_task_list: &'a [Task],
    resources: &'a ResourceSpec,
}

#[derive(Serialize)]
struct FullContent<'a> {
    job_task_list: &'a [Task],
    resources: &'a ResourceSpec,
    job_state: JobState,
    job_id: &'a str,
    fail_count: u32,
}

#[derive(Deserialize)]
struct JobContent {
    job_task_list: Vec<Task>,
    resources: ResourceSpec,
    #[serde(default = "default_state", deserialize_with = "deserialize_job_state")]
    job_state: JobState,
    #[serde(default)]
    job_id: CompactString,
    #[serde(default)]
    fail_count: u32,
}

fn default_state() -> JobState {
    JobState::Unsubmitted
}

/// Accepts the canonical string form, the legacy integer codes of older
/// snapshots (unsubmitted=1 .. completing=6, unknown=100) and null (a job
/// serialized before its first status query).
fn deserialize_job_state<'de, D>(deserializer: D) -> Result<JobState, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::Null => Ok(JobState::Unsubmitted),
        serde_json::Value::String(s) => s
            .parse::<JobState>()
            .map_err(|e| D::Error::custom(format!("invalid job_state {:?}: {}", s, e))),
        serde_json::Value::Number(n) => n
            .as_u64()
            .and_then(|code| u8::try_from(code).ok())
            .and_then(JobState::from_repr)
            .ok_or_else(|| D::Error::custom(format!("invalid job_state code {}", n))),
        other => Err(D::Error::custom(format!(
            "job_state must be a string or an integer, got {}",
            other
        ))),
    }
}

impl Job {
    pub fn new(job_task_list: Vec<Task>, resources: ResourceSpec) -> Self {
        let job_hash = Self::compute_hash(&job_task_list, &resources);
        Self {
            job_task_list,
            resources,
            job_hash,
            job_state: JobState::Unsubmitted,
            job_id: CompactString::default(),
            fail_count: 0,
        }
    }

    fn compute_hash(job_task_list: &[Task], resources: &ResourceSpec) -> String {
        let content = StaticContent {
            job_task_list,
            resources,
        };
        let canonical =
            serde_json::to_string(&content).expect("job serialization is infallible");
        sha1_hex(canonical.as_bytes())
    }

    pub fn job_hash(&self) -> &str {
        &self.job_hash
    }

    /// Name of the script file a batch backend writes for this job.
    pub fn script_file_name(&self) -> String {
        format!("{}.sub", self.job_hash)
    }

    pub fn tasks(&self) -> &[Task] {
        &self.job_task_list
    }

    pub fn resources(&self) -> &ResourceSpec {
        &self.resources
    }

    /// Static projection `{job_hash: {job_task_list, resources}}`: the form
    /// the hash and cross-run equality are defined over.
    pub fn serialize_static(&self) -> serde_json::Value {
        let content = serde_json::to_value(StaticContent {
            job_task_list: &self.job_task_list,
            resources: &self.resources,
        })
        .expect("job serialization is infallible");
        let mut map = serde_json::Map::new();
        map.insert(self.job_hash.clone(), content);
        serde_json::Value::Object(map)
    }

    fn serialize_full(&self) -> serde_json::Value {
        let content = serde_json::to_value(FullContent {
            job_task_list: &self.job_task_list,
            resources: &self.resources,
            job_state: self.job_state,
            job_id: self.job_id.as_str(),
            fail_count: self.fail_count,
        })
        .expect("job serialization is infallible");
        let mut map = serde_json::Map::new();
        map.insert(self.job_hash.clone(), content);
        serde_json::Value::Object(map)
    }

    /// Ask the batch to submit this job and record the scheduler-assigned id.
    pub async fn submit(&mut self, batch: &dyn Batch) -> anyhow::Result<()> {
        let job_id = batch.do_submit(self).await?;
        tracing::info!(job = %self.job_hash, job_id = %job_id, "job submitted");
        self.job_id = job_id;
        Ok(())
    }

    /// Query the batch for the current status and store it.
    pub async fn refresh_state(&mut self, batch: &dyn Batch) -> anyhow::Result<()> {
        let job_state = batch.check_status(self).await?;
        tracing::debug!(
            job = %self.job_hash,
            job_id = %self.job_id,
            state = %job_state,
            "refreshed job state"
        );
        self.job_state = job_state;
        Ok(())
    }

    /// Per-job recovery step.
    ///
    /// `unknown` is fatal (the driver refuses to guess), `terminated` and
    /// `unsubmitted` consume one unit of the retry budget and go through
    /// submit + refresh, everything else is left alone. The budget check
    /// precedes the increment, so a job that never stops terminating performs
    /// exactly `FAIL_COUNT_LIMIT + 1` submit attempts in total.
    pub async fn handle_unexpected_state(&mut self, batch: &dyn Batch) -> anyhow::Result<()> {
        match self.job_state {
            JobState::Unknown => Err(JobError::UnknownState {
                job_hash: self.job_hash.clone(),
            }
            .into()),
            JobState::Terminated => {
                tracing::warn!(
                    job = %self.job_hash,
                    fail_count = self.fail_count,
                    "job terminated externally; restarting"
                );
                self.resubmit(batch).await
            }
            JobState::Unsubmitted => self.resubmit(batch).await,
            _ => Ok(()),
        }
    }

    async fn resubmit(&mut self, batch: &dyn Batch) -> anyhow::Result<()> {
        if self.fail_count > FAIL_COUNT_LIMIT {
            return Err(JobError::RetryLimitExceeded {
                job_hash: self.job_hash.clone(),
                fail_count: self.fail_count,
            }
            .into());
        }
        self.fail_count += 1;
        self.submit(batch).await?;
        self.refresh_state(batch).await
    }

    /// Write this job's own snapshot (`{job_hash}_job.json`) to the remote
    /// root. The run loop persists whole submissions instead; this is for
    /// external tooling that wants to inspect a single job.
    pub async fn job_to_json(&self, batch: &dyn Batch) -> anyhow::Result<()> {
        let write_str = serde_json::to_string_pretty(&self.serialize_full())?;
        let file_name = format!("{}_job.json", self.job_hash);
        batch.context().write_file(&file_name, &write_str).await
    }

    #[cfg(test)]
    pub fn with_state(mut self, job_state: JobState) -> Self {
        self.job_state = job_state;
        self
    }

    #[cfg(test)]
    pub fn with_job_id(mut self, job_id: impl Into<CompactString>) -> Self {
        self.job_id = job_id.into();
        self
    }
}

/// Equality disregards the runtime triple, like the hash.
impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.serialize_static() == other.serialize_static()
    }
}

impl Serialize for Job {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.serialize_full().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Job {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        let map = IndexMap::<String, JobContent>::deserialize(deserializer)?;
        if map.len() != 1 {
            return Err(D::Error::custom(format!(
                "job entry must contain exactly one hash key, got {}",
                map.len()
            )));
        }
        let Some((_stored_hash, content)) = map.into_iter().next() else {
            return Err(D::Error::custom("job entry is empty"));
        };
        // The hash is recomputed from content rather than trusted from the key.
        let job_hash = Self::compute_hash(&content.job_task_list, &content.resources);
        Ok(Job {
            job_task_list: content.job_task_list,
            resources: content.resources,
            job_hash,
            job_state: content.job_state,
            job_id: content.job_id,
            fail_count: content.fail_count,
        })
    }
}
