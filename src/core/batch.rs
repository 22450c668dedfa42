use crate::core::job::{Job, JobState};
use crate::core::submission::Submission;
use anyhow::Result;
use async_trait::async_trait;
use compact_str::CompactString;

/// File-transfer surface between the local work base and the remote root a
/// submission runs under.
///
/// Implementations (a local directory, an SSH connection) are free to block
/// on the network; the driver only calls these from its suspension points.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Context: Send + Sync {
    /// Called when a submission is bound so the transport can learn its
    /// local and remote roots from `work_base` and the submission hash.
    fn bind_submission(&self, submission: &Submission);

    /// Transfer `forward_common_files` plus every task's `forward_files`
    /// into the remote root.
    async fn upload(&self, submission: &Submission) -> Result<()>;

    /// Transfer `backward_common_files` plus every task's `backward_files`
    /// back to the local work base.
    async fn download(&self, submission: &Submission) -> Result<()>;

    async fn check_file_exists(&self, file_name: &str) -> Result<bool>;

    async fn read_file(&self, file_name: &str) -> Result<String>;

    /// Write `contents` as the whole file `file_name` under the remote root.
    ///
    /// Must be atomic at file granularity (write to a temporary name, then
    /// rename): the driver persists recovery snapshots through this call and
    /// a torn write would leave the next run unrecoverable.
    async fn write_file(&self, file_name: &str, contents: &str) -> Result<()>;
}

/// Capability surface over a scheduler backend (Slurm, PBS, a plain shell).
///
/// The driver treats `do_submit` and `check_status` as opaque, possibly slow
/// calls; a backend generates the `{job_hash}.sub` script, hands it to the
/// scheduler and translates the scheduler's status vocabulary into
/// [`JobState`].
#[async_trait]
pub trait Batch: Send + Sync {
    /// The transport this batch moves files over.
    fn context(&self) -> &dyn Context;

    /// Submit `job` and return the scheduler-assigned id.
    async fn do_submit(&self, job: &Job) -> Result<CompactString>;

    /// Current status of `job` as the scheduler reports it.
    async fn check_status(&self, job: &Job) -> Result<JobState>;

    /// Marker file a backend's script drops once a job's tasks have all run.
    fn finish_tag_name(&self, job: &Job) -> String {
        format!("{}_tag_finished", job.job_hash())
    }
}
