use crate::utils::sha1_hex;
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug)]
pub enum TaskError {
    NeedResourcesOutOfRange(f64),
}

impl std::error::Error for TaskError {}
impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::NeedResourcesOutOfRange(value) => write!(
                f,
                "task_need_resources must be in (0, 1], got {}",
                value
            ),
        }
    }
}

/// One shell command together with the files it needs moved before it runs
/// (`forward_files`) and the files to fetch back afterwards
/// (`backward_files`). Paths are relative to the submission's work base.
///
/// A task is a value: it never changes once built, and its identity is the
/// SHA1 of its canonical serialization (`task_hash`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTask")]
pub struct Task {
    pub command: CompactString,
    pub task_work_path: PathBuf,
    pub forward_files: Vec<PathBuf>,
    pub backward_files: Vec<PathBuf>,
    pub outlog: CompactString,
    pub errlog: CompactString,
    /// Fraction of one execution slot this task occupies, in (0, 1].
    /// A value of 0.25 lets four tasks share a slot; the GPU-affinity logic
    /// of a batch backend uses this to pack tasks onto devices.
    pub task_need_resources: f64,
}

impl Task {
    pub fn builder(
        command: impl Into<CompactString>,
        task_work_path: impl Into<PathBuf>,
    ) -> TaskBuilder {
        TaskBuilder::new(command, task_work_path)
    }

    /// SHA1 over the canonical serialization (compact JSON, fields in
    /// declaration order).
    pub fn task_hash(&self) -> String {
        let canonical = serde_json::to_string(self).expect("task serialization is infallible");
        sha1_hex(canonical.as_bytes())
    }
}

#[derive(Deserialize)]
struct RawTask {
    command: CompactString,
    task_work_path: PathBuf,
    #[serde(default)]
    forward_files: Vec<PathBuf>,
    #[serde(default)]
    backward_files: Vec<PathBuf>,
    #[serde(default = "default_outlog")]
    outlog: CompactString,
    #[serde(default = "default_errlog")]
    errlog: CompactString,
    #[serde(default = "default_need_resources")]
    task_need_resources: f64,
}

fn default_outlog() -> CompactString {
    CompactString::const_new("log")
}

fn default_errlog() -> CompactString {
    CompactString::const_new("err")
}

fn default_need_resources() -> f64 {
    1.0
}

impl TryFrom<RawTask> for Task {
    type Error = TaskError;

    fn try_from(raw: RawTask) -> Result<Self, Self::Error> {
        TaskBuilder {
            command: raw.command,
            task_work_path: raw.task_work_path,
            forward_files: raw.forward_files,
            backward_files: raw.backward_files,
            outlog: raw.outlog,
            errlog: raw.errlog,
            task_need_resources: raw.task_need_resources,
        }
        .build()
    }
}

pub struct TaskBuilder {
    command: CompactString,
    task_work_path: PathBuf,
    forward_files: Vec<PathBuf>,
    backward_files: Vec<PathBuf>,
    outlog: CompactString,
    errlog: CompactString,
    task_need_resources: f64,
}

impl TaskBuilder {
    pub fn new(command: impl Into<CompactString>, task_work_path: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            task_work_path: task_work_path.into(),
            forward_files: Vec::new(),
            backward_files: Vec::new(),
            outlog: default_outlog(),
            errlog: default_errlog(),
            task_need_resources: default_need_resources(),
        }
    }

    pub fn forward_files(mut self, files: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        self.forward_files = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn backward_files(mut self, files: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        self.backward_files = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn outlog(mut self, outlog: impl Into<CompactString>) -> Self {
        self.outlog = outlog.into();
        self
    }

    pub fn errlog(mut self, errlog: impl Into<CompactString>) -> Self {
        self.errlog = errlog.into();
        self
    }

    pub fn task_need_resources(mut self, task_need_resources: f64) -> Self {
        self.task_need_resources = task_need_resources;
        self
    }

    pub fn build(self) -> Result<Task, TaskError> {
        if !(self.task_need_resources > 0.0 && self.task_need_resources <= 1.0) {
            return Err(TaskError::NeedResourcesOutOfRange(self.task_need_resources));
        }
        Ok(Task {
            command: self.command,
            task_work_path: self.task_work_path,
            forward_files: self.forward_files,
            backward_files: self.backward_files,
            outlog: self.outlog,
            errlog: self.errlog,
            task_need_resources: self.task_need_resources,
        })
    }
}
