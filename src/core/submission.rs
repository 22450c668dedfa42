use crate::config::Config;
use crate::core::batch::Batch;
use crate::core::job::Job;
use crate::core::resources::ResourceSpec;
use crate::core::task::Task;
use crate::utils::sha1_hex;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Seed for the grouping shuffle. Seeded locally per call so nothing else in
/// the process can perturb the permutation: the same task list must map to
/// the same jobs on every re-run.
const GROUPING_SEED: u64 = 42;

#[derive(Debug)]
pub enum SubmissionError {
    TasksLocked,
    JobsAlreadyGenerated,
    JobsNotGenerated,
    NoTasks,
    InvalidGroupSize(usize),
    RecoverMismatch { submission_hash: String },
}

impl std::error::Error for SubmissionError {}
impl fmt::Display for SubmissionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmissionError::TasksLocked => {
                write!(f, "not allowed to register tasks after generating jobs")
            }
            SubmissionError::JobsAlreadyGenerated => {
                write!(f, "jobs have already been generated for this submission")
            }
            SubmissionError::JobsNotGenerated => {
                write!(f, "generate_jobs must be called before running a submission")
            }
            SubmissionError::NoTasks => write!(f, "submission must have at least 1 task"),
            SubmissionError::InvalidGroupSize(size) => {
                write!(f, "group_size must be a positive number, got {}", size)
            }
            SubmissionError::RecoverMismatch { submission_hash } => write!(
                f,
                "recover failed: snapshot {}.json does not match this submission",
                submission_hash
            ),
        }
    }
}

/// Why a run terminated without finishing.
///
/// The variants map onto the process exit codes a CLI wrapper is expected to
/// use: 1 for a user interrupt, 2 for an orderly exit request, 3 for
/// everything unexpected. In every case the snapshot has been written before
/// this value is returned, so the next run can recover.
#[derive(Debug)]
pub enum RunError {
    Interrupted { submission_hash: String },
    ExitRequested { submission_hash: String },
    Unexpected {
        submission_hash: String,
        source: anyhow::Error,
    },
}

impl RunError {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunError::Interrupted { .. } => 1,
            RunError::ExitRequested { .. } => 2,
            RunError::Unexpected { .. } => 3,
        }
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RunError::Unexpected { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunError::Interrupted { submission_hash } => {
                write!(f, "submission {} interrupted by user", submission_hash)
            }
            RunError::ExitRequested { submission_hash } => {
                write!(f, "submission {} received an exit request", submission_hash)
            }
            RunError::Unexpected {
                submission_hash,
                source,
            } => write!(f, "submission {} aborted: {}", submission_hash, source),
        }
    }
}

/// The whole workplace: every task to run, their grouping into jobs and a
/// durable identity that lets a restarted process find its prior state.
///
/// Tasks are registered first, then frozen into jobs by [`generate_jobs`];
/// after that the submission can be driven to completion with
/// [`run_submission`], which persists a snapshot (`{submission_hash}.json`)
/// through the batch's [`Context`](crate::core::batch::Context) on every
/// significant state change.
///
/// [`generate_jobs`]: Submission::generate_jobs
/// [`run_submission`]: Submission::run_submission
#[derive(Debug, Clone, Deserialize)]
#[serde(from = "SubmissionRepr")]
pub struct Submission {
    pub work_base: PathBuf,
    pub resources: ResourceSpec,
    pub forward_common_files: Vec<PathBuf>,
    pub backward_common_files: Vec<PathBuf>,
    belonging_tasks: Vec<Task>,
    belonging_jobs: Vec<Job>,
}

#[derive(Serialize)]
struct SubmissionContent<'a> {
    work_base: &'a PathBuf,
    resources: &'a ResourceSpec,
    forward_common_files: &'a [PathBuf],
    backward_common_files: &'a [PathBuf],
    belonging_jobs: Vec<serde_json::Value>,
}

/// Identity projection: the fields hashed into `submission_hash`.
///
/// The job list is deliberately left out. The snapshot file is named by this
/// hash, and it has to stay discoverable when the user's task list drifts
/// between runs, since that is exactly the situation the recovery-mismatch
/// check must catch instead of silently starting over.
#[derive(Serialize)]
struct IdentityContent<'a> {
    work_base: &'a PathBuf,
    resources: &'a ResourceSpec,
    forward_common_files: &'a [PathBuf],
    backward_common_files: &'a [PathBuf],
}

#[derive(Deserialize)]
struct SubmissionRepr {
    work_base: PathBuf,
    resources: ResourceSpec,
    #[serde(default)]
    forward_common_files: Vec<PathBuf>,
    #[serde(default)]
    backward_common_files: Vec<PathBuf>,
    #[serde(default)]
    belonging_jobs: Vec<Job>,
}

impl From<SubmissionRepr> for Submission {
    fn from(repr: SubmissionRepr) -> Self {
        Self {
            work_base: repr.work_base,
            resources: repr.resources,
            forward_common_files: repr.forward_common_files,
            backward_common_files: repr.backward_common_files,
            belonging_tasks: Vec::new(),
            belonging_jobs: repr.belonging_jobs,
        }
    }
}

pub struct SubmissionBuilder {
    work_base: PathBuf,
    resources: ResourceSpec,
    forward_common_files: Vec<PathBuf>,
    backward_common_files: Vec<PathBuf>,
}

impl SubmissionBuilder {
    pub fn new(work_base: impl Into<PathBuf>, resources: impl Into<ResourceSpec>) -> Self {
        Self {
            work_base: work_base.into(),
            resources: resources.into(),
            forward_common_files: Vec::new(),
            backward_common_files: Vec::new(),
        }
    }

    /// Files uploaded once and shared by every job.
    pub fn forward_common_files(
        mut self,
        files: impl IntoIterator<Item = impl Into<PathBuf>>,
    ) -> Self {
        self.forward_common_files = files.into_iter().map(Into::into).collect();
        self
    }

    /// Files downloaded once after every job finished.
    pub fn backward_common_files(
        mut self,
        files: impl IntoIterator<Item = impl Into<PathBuf>>,
    ) -> Self {
        self.backward_common_files = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn build(self) -> Submission {
        Submission {
            work_base: self.work_base,
            resources: self.resources,
            forward_common_files: self.forward_common_files,
            backward_common_files: self.backward_common_files,
            belonging_tasks: Vec::new(),
            belonging_jobs: Vec::new(),
        }
    }
}

impl Submission {
    pub fn builder(
        work_base: impl Into<PathBuf>,
        resources: impl Into<ResourceSpec>,
    ) -> SubmissionBuilder {
        SubmissionBuilder::new(work_base, resources)
    }

    pub fn tasks(&self) -> &[Task] {
        &self.belonging_tasks
    }

    pub fn jobs(&self) -> &[Job] {
        &self.belonging_jobs
    }

    /// Mutable access to the jobs' runtime state. The task payload of each
    /// job stays frozen; only the runtime triple is reachable through this.
    pub fn jobs_mut(&mut self) -> &mut [Job] {
        &mut self.belonging_jobs
    }

    pub fn register_task(&mut self, task: Task) -> Result<(), SubmissionError> {
        if !self.belonging_jobs.is_empty() {
            return Err(SubmissionError::TasksLocked);
        }
        self.belonging_tasks.push(task);
        Ok(())
    }

    pub fn register_task_list(
        &mut self,
        task_list: impl IntoIterator<Item = Task>,
    ) -> Result<(), SubmissionError> {
        if !self.belonging_jobs.is_empty() {
            return Err(SubmissionError::TasksLocked);
        }
        self.belonging_tasks.extend(task_list);
        Ok(())
    }

    /// Freeze the registered tasks into jobs of `group_size` tasks each.
    ///
    /// Tasks are spread over the jobs by a shuffle so heterogeneous runtimes
    /// balance across workers; the seed is fixed, so the same task list
    /// yields the same jobs (and the same hashes) on every run.
    pub fn generate_jobs(&mut self) -> Result<(), SubmissionError> {
        if !self.belonging_jobs.is_empty() {
            return Err(SubmissionError::JobsAlreadyGenerated);
        }
        if self.belonging_tasks.is_empty() {
            return Err(SubmissionError::NoTasks);
        }
        // Enforced at Resources construction too, but the fields are public.
        let group_size = self.resources.group_size();
        if group_size < 1 {
            return Err(SubmissionError::InvalidGroupSize(group_size));
        }

        let mut task_index: Vec<usize> = (0..self.belonging_tasks.len()).collect();
        let mut rng = ChaCha8Rng::seed_from_u64(GROUPING_SEED);
        task_index.shuffle(&mut rng);

        for chunk in task_index.chunks(group_size) {
            let job_task_list: Vec<Task> = chunk
                .iter()
                .map(|&index| self.belonging_tasks[index].clone())
                .collect();
            self.belonging_jobs
                .push(Job::new(job_task_list, self.resources.clone()));
        }
        tracing::debug!(
            tasks = self.belonging_tasks.len(),
            jobs = self.belonging_jobs.len(),
            group_size,
            "generated jobs"
        );
        Ok(())
    }

    /// SHA1 over the identity projection (work base, resources and common
    /// files), hex encoded. Stable across runs and across job runtime state;
    /// see [`IdentityContent`] for what is (and is not) part of it.
    pub fn submission_hash(&self) -> String {
        let content = IdentityContent {
            work_base: &self.work_base,
            resources: &self.resources,
            forward_common_files: &self.forward_common_files,
            backward_common_files: &self.backward_common_files,
        };
        let canonical =
            serde_json::to_string(&content).expect("submission serialization is infallible");
        sha1_hex(canonical.as_bytes())
    }

    /// Name of this submission's snapshot in the remote root.
    pub fn snapshot_file_name(&self) -> String {
        format!("{}.json", self.submission_hash())
    }

    /// Hook the transport up to this submission's roots.
    pub fn bind_batch(&self, batch: &dyn Batch) {
        batch.context().bind_submission(self);
    }

    fn serialize_value(&self, if_static: bool) -> serde_json::Value {
        let belonging_jobs = self
            .belonging_jobs
            .iter()
            .map(|job| {
                if if_static {
                    job.serialize_static()
                } else {
                    serde_json::to_value(job).expect("job serialization is infallible")
                }
            })
            .collect();
        serde_json::to_value(SubmissionContent {
            work_base: &self.work_base,
            resources: &self.resources,
            forward_common_files: &self.forward_common_files,
            backward_common_files: &self.backward_common_files,
            belonging_jobs,
        })
        .expect("submission serialization is infallible")
    }

    /// Static projection: the full serialized form minus every job's runtime
    /// triple. Two submissions are the same work exactly when these match.
    pub fn serialize_static(&self) -> serde_json::Value {
        self.serialize_value(true)
    }

    /// Refresh every job's status from the scheduler.
    ///
    /// Pure observer: unexpected states are left for
    /// [`handle_unexpected_submission_state`](Self::handle_unexpected_submission_state).
    pub async fn get_submission_state(&mut self, batch: &dyn Batch) -> anyhow::Result<()> {
        for job in &mut self.belonging_jobs {
            job.refresh_state(batch).await?;
        }
        Ok(())
    }

    /// Refresh all jobs, then report whether every one of them is finished.
    ///
    /// A snapshot is written first whenever any job is terminated or unknown,
    /// so that state is never lost to a fatal error further down the line.
    pub async fn check_all_finished(&mut self, batch: &dyn Batch) -> anyhow::Result<bool> {
        self.get_submission_state(batch).await?;
        if self
            .belonging_jobs
            .iter()
            .any(|job| job.job_state.needs_attention())
        {
            self.submission_to_json(batch).await?;
        }
        Ok(!self
            .belonging_jobs
            .iter()
            .any(|job| job.job_state.is_alive()))
    }

    /// Run the per-job recovery step on every job, in order.
    pub async fn handle_unexpected_submission_state(
        &mut self,
        batch: &dyn Batch,
    ) -> anyhow::Result<()> {
        for job in &mut self.belonging_jobs {
            job.handle_unexpected_state(batch).await?;
        }
        Ok(())
    }

    pub async fn upload_jobs(&self, batch: &dyn Batch) -> anyhow::Result<()> {
        batch.context().upload(self).await
    }

    pub async fn download_jobs(&self, batch: &dyn Batch) -> anyhow::Result<()> {
        batch.context().download(self).await
    }

    /// Refresh job states, then persist the runtime-inclusive serialization
    /// as `{submission_hash}.json` in the remote root.
    pub async fn submission_to_json(&mut self, batch: &dyn Batch) -> anyhow::Result<()> {
        self.get_submission_state(batch).await?;
        self.write_snapshot(batch).await
    }

    /// Persist the in-memory state as-is, without polling the scheduler.
    async fn write_snapshot(&self, batch: &dyn Batch) -> anyhow::Result<()> {
        let write_str = serde_json::to_string_pretty(&self.serialize_value(false))?;
        batch
            .context()
            .write_file(&self.snapshot_file_name(), &write_str)
            .await
    }

    /// Look for a snapshot of this submission on the remote and adopt its
    /// jobs, runtime state included, when the static forms match.
    ///
    /// A snapshot that exists but does not match means the user's inputs
    /// drifted away from the persisted run; continuing would silently redo
    /// or skip work, so that is fatal.
    pub async fn try_recover_from_json(&mut self, batch: &dyn Batch) -> anyhow::Result<()> {
        let file_name = self.snapshot_file_name();
        if !batch.context().check_file_exists(&file_name).await? {
            return Ok(());
        }
        let contents = batch.context().read_file(&file_name).await?;
        let recovered: Submission = serde_json::from_str(&contents)?;
        if *self != recovered {
            return Err(SubmissionError::RecoverMismatch {
                submission_hash: self.submission_hash(),
            }
            .into());
        }
        tracing::info!(
            submission = %self.submission_hash(),
            jobs = recovered.belonging_jobs.len(),
            "recovered submission from snapshot"
        );
        self.belonging_jobs = recovered.belonging_jobs;
        self.bind_batch(batch);
        Ok(())
    }

    /// Drive this submission to completion.
    ///
    /// Recover from a prior snapshot if one matches, upload, submit, then
    /// poll until every job reports finished and download the results. Every
    /// early exit from the loop (user interrupt, exit request, any error)
    /// persists the snapshot before returning, so a later run picks up where
    /// this one stopped.
    pub async fn run_submission(
        &mut self,
        batch: &dyn Batch,
        config: &Config,
    ) -> Result<(), RunError> {
        self.bind_batch(batch);
        if self.belonging_jobs.is_empty() {
            return Err(RunError::Unexpected {
                submission_hash: self.submission_hash(),
                source: SubmissionError::JobsNotGenerated.into(),
            });
        }

        // A mismatch must not overwrite the snapshot it failed to match, so
        // this is the one fatal path that skips the snapshot write.
        if let Err(source) = self.try_recover_from_json(batch).await {
            let submission_hash = self.submission_hash();
            tracing::error!(submission = %submission_hash, error = %source, "recovery failed");
            return Err(RunError::Unexpected {
                submission_hash,
                source,
            });
        }

        match self.check_all_finished(batch).await {
            Ok(true) => {
                tracing::info!(
                    submission = %self.submission_hash(),
                    "all jobs already finished, skipping submission"
                );
            }
            Ok(false) => {
                if let Err(source) = self.upload_jobs(batch).await {
                    return Err(self.abort_unexpected(batch, source).await);
                }
                // Initial submission point: every job starts unsubmitted and
                // the handler submits it.
                if let Err(source) = self.handle_unexpected_submission_state(batch).await {
                    return Err(self.abort_unexpected(batch, source).await);
                }
                if let Err(source) = self.submission_to_json(batch).await {
                    return Err(self.abort_unexpected(batch, source).await);
                }

                let interrupt = tokio::signal::ctrl_c();
                tokio::pin!(interrupt);
                let exit_request = exit_request();
                tokio::pin!(exit_request);
                let poll_interval = Duration::from_secs(config.poll_interval_secs);

                loop {
                    match self.check_all_finished(batch).await {
                        Ok(true) => break,
                        Ok(false) => {}
                        Err(source) => return Err(self.abort_unexpected(batch, source).await),
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(poll_interval) => {
                            if let Err(source) =
                                self.handle_unexpected_submission_state(batch).await
                            {
                                return Err(self.abort_unexpected(batch, source).await);
                            }
                        }
                        _ = &mut interrupt => {
                            return Err(self.abort_on_interrupt(batch).await);
                        }
                        _ = &mut exit_request => {
                            return Err(self.abort_on_exit_request(batch).await);
                        }
                    }
                }
            }
            Err(source) => return Err(self.abort_unexpected(batch, source).await),
        }

        if let Err(source) = self.handle_unexpected_submission_state(batch).await {
            return Err(self.abort_unexpected(batch, source).await);
        }
        if let Err(source) = self.submission_to_json(batch).await {
            return Err(self.abort_unexpected(batch, source).await);
        }
        if let Err(source) = self.download_jobs(batch).await {
            return Err(self.abort_unexpected(batch, source).await);
        }
        tracing::info!(
            submission = %self.submission_hash(),
            "submission finished, results downloaded"
        );
        Ok(())
    }

    async fn abort_unexpected(&self, batch: &dyn Batch, source: anyhow::Error) -> RunError {
        self.persist_on_abort(batch).await;
        let submission_hash = self.submission_hash();
        tracing::error!(
            submission = %submission_hash,
            error = %source,
            "run aborted on unexpected error, state persisted"
        );
        RunError::Unexpected {
            submission_hash,
            source,
        }
    }

    async fn abort_on_interrupt(&self, batch: &dyn Batch) -> RunError {
        self.persist_on_abort(batch).await;
        let submission_hash = self.submission_hash();
        tracing::error!(
            submission = %submission_hash,
            "interrupted by user, state persisted, re-run to resume"
        );
        RunError::Interrupted { submission_hash }
    }

    async fn abort_on_exit_request(&self, batch: &dyn Batch) -> RunError {
        self.persist_on_abort(batch).await;
        let submission_hash = self.submission_hash();
        tracing::error!(
            submission = %submission_hash,
            "exit requested, state persisted, re-run to resume"
        );
        RunError::ExitRequested { submission_hash }
    }

    /// Best-effort snapshot on the way out. Serializes what is in memory; the
    /// scheduler is not polled again, since a broken scheduler may be the
    /// very reason the run is aborting.
    async fn persist_on_abort(&self, batch: &dyn Batch) {
        if let Err(err) = self.write_snapshot(batch).await {
            tracing::error!(
                submission = %self.submission_hash(),
                error = %err,
                "failed to persist snapshot while aborting"
            );
        }
    }
}

/// Equality disregards the runtime information (`job_state`, `job_id`,
/// `fail_count`) of the belonging jobs: it answers "is this the same work",
/// not "is this in the same state".
impl PartialEq for Submission {
    fn eq(&self, other: &Self) -> bool {
        self.serialize_static() == other.serialize_static()
    }
}

impl Serialize for Submission {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.serialize_value(false).serialize(serializer)
    }
}

#[cfg(unix)]
async fn exit_request() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(err) => {
            tracing::warn!(error = %err, "failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn exit_request() {
    std::future::pending::<()>().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::batch::{Context, MockContext};
    use crate::core::job::JobState;
    use crate::core::resources::Resources;
    use async_trait::async_trait;
    use compact_str::{format_compact, CompactString};
    use proptest::prelude::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// In-memory remote root shared between "runs".
    #[derive(Default)]
    struct MemContext {
        files: Mutex<HashMap<String, String>>,
        uploads: AtomicUsize,
        downloads: AtomicUsize,
    }

    impl MemContext {
        fn file(&self, name: &str) -> Option<String> {
            self.files.lock().unwrap().get(name).cloned()
        }
    }

    #[async_trait]
    impl Context for MemContext {
        fn bind_submission(&self, _submission: &Submission) {}

        async fn upload(&self, _submission: &Submission) -> anyhow::Result<()> {
            self.uploads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn download(&self, _submission: &Submission) -> anyhow::Result<()> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn check_file_exists(&self, file_name: &str) -> anyhow::Result<bool> {
            Ok(self.files.lock().unwrap().contains_key(file_name))
        }

        async fn read_file(&self, file_name: &str) -> anyhow::Result<String> {
            self.file(file_name)
                .ok_or_else(|| anyhow::anyhow!("no such file: {file_name}"))
        }

        async fn write_file(&self, file_name: &str, contents: &str) -> anyhow::Result<()> {
            self.files
                .lock()
                .unwrap()
                .insert(file_name.to_owned(), contents.to_owned());
            Ok(())
        }
    }

    /// Batch whose status answers follow a fixed rule; counts submits.
    struct ScriptedBatch {
        context: Arc<MemContext>,
        submits: AtomicUsize,
        status: Box<dyn Fn(&Job) -> JobState + Send + Sync>,
    }

    impl ScriptedBatch {
        fn new(
            context: Arc<MemContext>,
            status: impl Fn(&Job) -> JobState + Send + Sync + 'static,
        ) -> Self {
            Self {
                context,
                submits: AtomicUsize::new(0),
                status: Box::new(status),
            }
        }

        fn submit_count(&self) -> usize {
            self.submits.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Batch for ScriptedBatch {
        fn context(&self) -> &dyn Context {
            &*self.context
        }

        async fn do_submit(&self, _job: &Job) -> anyhow::Result<CompactString> {
            let n = self.submits.fetch_add(1, Ordering::SeqCst);
            Ok(format_compact!("id-{}", n))
        }

        async fn check_status(&self, job: &Job) -> anyhow::Result<JobState> {
            Ok((self.status)(job))
        }
    }

    /// Batch wrapper for expectation-style tests of context delegation.
    struct ContextOnlyBatch<C: Context>(C);

    #[async_trait]
    impl<C: Context> Batch for ContextOnlyBatch<C> {
        fn context(&self) -> &dyn Context {
            &self.0
        }

        async fn do_submit(&self, _job: &Job) -> anyhow::Result<CompactString> {
            anyhow::bail!("not under test")
        }

        async fn check_status(&self, _job: &Job) -> anyhow::Result<JobState> {
            anyhow::bail!("not under test")
        }
    }

    /// Reports unsubmitted until a scheduler id exists, finished afterwards.
    fn finish_once_submitted(job: &Job) -> JobState {
        if job.job_id.is_empty() {
            JobState::Unsubmitted
        } else {
            JobState::Finished
        }
    }

    fn resources() -> ResourceSpec {
        Resources::new(1, 4, 0, "cpu", 3, false).unwrap().into()
    }

    fn submission_with_tasks(task_count: usize) -> Submission {
        let mut submission = Submission::builder("work", resources())
            .forward_common_files(["common.in"])
            .backward_common_files(["common.out"])
            .build();
        for index in 0..task_count {
            submission
                .register_task(
                    Task::builder(format!("c{index}"), format!("task_{index:03}"))
                        .build()
                        .unwrap(),
                )
                .unwrap();
        }
        submission
    }

    #[test]
    fn test_generate_jobs_partitions_all_tasks() {
        let mut submission = submission_with_tasks(7);
        submission.generate_jobs().unwrap();

        let sizes: Vec<usize> = submission.jobs().iter().map(|j| j.tasks().len()).collect();
        assert_eq!(sizes, [3, 3, 1]);

        let mut commands: Vec<&str> = submission
            .jobs()
            .iter()
            .flat_map(|job| job.tasks().iter().map(|task| task.command.as_str()))
            .collect();
        commands.sort_unstable();
        assert_eq!(commands, ["c0", "c1", "c2", "c3", "c4", "c5", "c6"]);
    }

    #[test]
    fn test_generate_jobs_is_deterministic() {
        let mut first = submission_with_tasks(7);
        let mut second = submission_with_tasks(7);
        first.generate_jobs().unwrap();
        second.generate_jobs().unwrap();

        assert_eq!(
            serde_json::to_string(&first.serialize_static()).unwrap(),
            serde_json::to_string(&second.serialize_static()).unwrap()
        );
        for (a, b) in first.jobs().iter().zip(second.jobs()) {
            assert_eq!(a.job_hash(), b.job_hash());
        }
    }

    #[test]
    fn test_registration_locked_after_generate() {
        let mut submission = submission_with_tasks(7);
        submission.generate_jobs().unwrap();

        let extra = Task::builder("c7", "task_007").build().unwrap();
        let err = submission.register_task(extra.clone()).unwrap_err();
        assert!(matches!(err, SubmissionError::TasksLocked));
        let err = submission.register_task_list([extra]).unwrap_err();
        assert!(matches!(err, SubmissionError::TasksLocked));
        assert_eq!(submission.tasks().len(), 7);
    }

    #[test]
    fn test_generate_jobs_preconditions() {
        let mut empty = Submission::builder("work", resources()).build();
        assert!(matches!(
            empty.generate_jobs().unwrap_err(),
            SubmissionError::NoTasks
        ));

        let mut submission = submission_with_tasks(2);
        submission.generate_jobs().unwrap();
        assert!(matches!(
            submission.generate_jobs().unwrap_err(),
            SubmissionError::JobsAlreadyGenerated
        ));
    }

    #[test]
    fn test_static_equality_ignores_runtime_state() {
        let mut first = submission_with_tasks(7);
        let mut second = submission_with_tasks(7);
        first.generate_jobs().unwrap();
        second.generate_jobs().unwrap();

        first.jobs_mut()[0].job_state = JobState::Running;
        first.jobs_mut()[0].job_id = "42".into();
        first.jobs_mut()[0].fail_count = 3;

        assert_eq!(first, second);
        assert_ne!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );

        let roundtripped: Submission =
            serde_json::from_str(&serde_json::to_string(&first).unwrap()).unwrap();
        assert_eq!(first, roundtripped);
        assert_eq!(roundtripped.jobs()[0].job_state, JobState::Running);
        assert_eq!(roundtripped.jobs()[0].job_id, "42");
        assert_eq!(roundtripped.jobs()[0].fail_count, 3);
    }

    #[test]
    fn test_submission_hash_stable_across_roundtrip() {
        let mut submission = submission_with_tasks(4);
        submission.generate_jobs().unwrap();

        let roundtripped: Submission =
            serde_json::from_str(&serde_json::to_string(&submission).unwrap()).unwrap();
        assert_eq!(submission.submission_hash(), roundtripped.submission_hash());
        assert_eq!(
            serde_json::to_string(&submission.serialize_static()).unwrap(),
            serde_json::to_string(&roundtripped.serialize_static()).unwrap()
        );
    }

    #[test]
    fn test_snapshot_shape() {
        let mut submission = submission_with_tasks(4);
        submission.generate_jobs().unwrap();

        let value = serde_json::to_value(&submission).unwrap();
        let keys: Vec<&str> = value
            .as_object()
            .unwrap()
            .keys()
            .map(String::as_str)
            .collect();
        assert_eq!(
            keys,
            [
                "work_base",
                "resources",
                "forward_common_files",
                "backward_common_files",
                "belonging_jobs"
            ]
        );

        let pretty = serde_json::to_string_pretty(&value).unwrap();
        assert!(pretty.starts_with("{\n  \"work_base\""));
    }

    #[test]
    fn test_bind_batch_binds_context() {
        let submission = submission_with_tasks(1);
        let mut context = MockContext::new();
        context
            .expect_bind_submission()
            .withf(|s: &Submission| s.work_base == PathBuf::from("work"))
            .times(1)
            .return_const(());
        let batch = ContextOnlyBatch(context);
        submission.bind_batch(&batch);
    }

    #[tokio::test]
    async fn test_upload_download_delegate_to_context() {
        let mut submission = submission_with_tasks(2);
        submission.generate_jobs().unwrap();

        let mut context = MockContext::new();
        context.expect_upload().times(1).returning(|_| Ok(()));
        context.expect_download().times(1).returning(|_| Ok(()));
        let batch = ContextOnlyBatch(context);

        submission.upload_jobs(&batch).await.unwrap();
        submission.download_jobs(&batch).await.unwrap();
    }

    #[tokio::test]
    async fn test_check_all_finished_monotonic() {
        let mut submission = submission_with_tasks(4);
        submission.generate_jobs().unwrap();
        let batch = ScriptedBatch::new(Arc::default(), |_| JobState::Finished);

        assert!(submission.check_all_finished(&batch).await.unwrap());
        assert!(submission.check_all_finished(&batch).await.unwrap());
    }

    #[tokio::test]
    async fn test_check_all_finished_snapshots_sick_submission() {
        let mut submission = submission_with_tasks(4);
        submission.generate_jobs().unwrap();
        let context = Arc::new(MemContext::default());
        let batch = ScriptedBatch::new(context.clone(), |_| JobState::Terminated);

        assert!(!submission.check_all_finished(&batch).await.unwrap());
        assert!(context.file(&submission.snapshot_file_name()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_submission_happy_path() {
        let mut submission = submission_with_tasks(7);
        submission.generate_jobs().unwrap();
        let context = Arc::new(MemContext::default());
        let batch = ScriptedBatch::new(context.clone(), finish_once_submitted);
        let config = Config::default();

        submission.run_submission(&batch, &config).await.unwrap();

        // one submit per job, no retries
        assert_eq!(batch.submit_count(), 3);
        assert_eq!(context.uploads.load(Ordering::SeqCst), 1);
        assert_eq!(context.downloads.load(Ordering::SeqCst), 1);
        assert!(context.file(&submission.snapshot_file_name()).is_some());
        for job in submission.jobs() {
            assert_eq!(job.job_state, JobState::Finished);
            assert!(!job.job_id.is_empty());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_submission_requires_generated_jobs() {
        let mut submission = submission_with_tasks(3);
        let batch = ScriptedBatch::new(Arc::default(), finish_once_submitted);
        let err = submission
            .run_submission(&batch, &Config::default())
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 3);
        assert!(err.to_string().contains("generate_jobs"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_aborts_after_six_submits() {
        let mut submission = submission_with_tasks(1);
        submission.generate_jobs().unwrap();
        let job_hash = submission.jobs()[0].job_hash().to_owned();

        let context = Arc::new(MemContext::default());
        let batch = ScriptedBatch::new(context.clone(), |_| JobState::Terminated);
        let err = submission
            .run_submission(&batch, &Config::default())
            .await
            .unwrap_err();

        assert_eq!(err.exit_code(), 3);
        assert!(err.to_string().contains(&job_hash));
        // initial submission plus five resubmits
        assert_eq!(batch.submit_count(), 6);
        assert!(context.file(&submission.snapshot_file_name()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_state_is_fatal() {
        let mut submission = submission_with_tasks(1);
        submission.generate_jobs().unwrap();
        let context = Arc::new(MemContext::default());
        let batch = ScriptedBatch::new(context.clone(), |_| JobState::Unknown);

        let err = submission
            .run_submission(&batch, &Config::default())
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 3);
        assert!(err.to_string().contains("unknown"));
        assert!(context.file(&submission.snapshot_file_name()).is_some());
    }

    #[tokio::test]
    async fn test_recovery_adopts_prior_jobs() {
        let context = Arc::new(MemContext::default());

        // run 1: submit everything, then "get interrupted" after a snapshot
        let mut first = submission_with_tasks(7);
        first.generate_jobs().unwrap();
        let batch = ScriptedBatch::new(context.clone(), |job: &Job| {
            if job.job_id.is_empty() {
                JobState::Unsubmitted
            } else {
                JobState::Running
            }
        });
        first.bind_batch(&batch);
        first.upload_jobs(&batch).await.unwrap();
        first.handle_unexpected_submission_state(&batch).await.unwrap();
        first.submission_to_json(&batch).await.unwrap();
        assert!(context.file(&first.snapshot_file_name()).is_some());

        // run 2: fresh submission, identical inputs, jobs now complete
        let mut second = submission_with_tasks(7);
        second.generate_jobs().unwrap();
        let batch2 = ScriptedBatch::new(context.clone(), |_| JobState::Finished);
        second.try_recover_from_json(&batch2).await.unwrap();

        assert_eq!(second.submission_hash(), first.submission_hash());
        for (recovered, prior) in second.jobs().iter().zip(first.jobs()) {
            assert_eq!(recovered.job_id, prior.job_id);
            assert_eq!(recovered.job_state, JobState::Running);
            assert_eq!(recovered.fail_count, 1);
        }

        second
            .run_submission(&batch2, &Config::default())
            .await
            .unwrap();
        // prior work is adopted: nothing resubmitted, nothing re-uploaded
        assert_eq!(batch2.submit_count(), 0);
        assert_eq!(context.uploads.load(Ordering::SeqCst), 1);
        assert_eq!(context.downloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_mismatch_is_fatal_and_preserves_snapshot() {
        let context = Arc::new(MemContext::default());

        let mut first = submission_with_tasks(7);
        first.generate_jobs().unwrap();
        let batch = ScriptedBatch::new(context.clone(), finish_once_submitted);
        first.submission_to_json(&batch).await.unwrap();
        let prior_snapshot = context.file(&first.snapshot_file_name()).unwrap();

        // same identity, one more task: the static forms no longer match
        let mut drifted = submission_with_tasks(8);
        drifted.generate_jobs().unwrap();
        assert_eq!(drifted.submission_hash(), first.submission_hash());

        let batch2 = ScriptedBatch::new(context.clone(), finish_once_submitted);
        let err = drifted.try_recover_from_json(&batch2).await.unwrap_err();
        assert!(err.to_string().contains("recover failed"));

        let err = drifted
            .run_submission(&batch2, &Config::default())
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 3);
        // no submission happened and the prior snapshot was not clobbered
        assert_eq!(batch2.submit_count(), 0);
        assert_eq!(
            context.file(&first.snapshot_file_name()).unwrap(),
            prior_snapshot
        );
    }

    proptest! {
        /// Hash stability: serialization round-trips never change the static
        /// form or the submission hash.
        #[test]
        fn prop_static_form_survives_roundtrip(
            commands in proptest::collection::vec("[a-z]{1,12}", 1..20),
            group_size in 1usize..5,
        ) {
            let resources: ResourceSpec = Resources::new(1, 4, 0, "cpu", group_size, false)
                .unwrap()
                .into();
            let mut submission = Submission::builder("work", resources).build();
            for (index, command) in commands.iter().enumerate() {
                submission
                    .register_task(
                        Task::builder(command.as_str(), format!("task_{index:03}"))
                            .build()
                            .unwrap(),
                    )
                    .unwrap();
            }
            submission.generate_jobs().unwrap();

            let roundtripped: Submission =
                serde_json::from_str(&serde_json::to_string(&submission).unwrap()).unwrap();
            prop_assert_eq!(&submission, &roundtripped);
            prop_assert_eq!(submission.submission_hash(), roundtripped.submission_hash());
            prop_assert_eq!(
                serde_json::to_string(&submission.serialize_static()).unwrap(),
                serde_json::to_string(&roundtripped.serialize_static()).unwrap()
            );
        }
    }
}
