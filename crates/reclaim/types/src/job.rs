//! Declarative job descriptions.
//!
//! A [`JobSpec`] is inert: it names a queue and an optional priority class
//! by their logical names and lists the task groups to run. Turning it into
//! a cluster object is the job of the test context.

use serde::{Deserialize, Serialize};

use crate::error::{SpecError, SpecResult};
use crate::resources::ResourceList;
use crate::DEFAULT_IMAGE;

/// One homogeneous task group inside a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Container image reference.
    pub image: String,

    /// Requests (and limits) of every replica.
    pub resources: ResourceList,

    /// Replicas that must run before the group counts as ready.
    pub min_available: u32,

    /// Total replicas.
    pub replicas: u32,
}

impl TaskSpec {
    /// A single-replica task with `min_available = replicas = 1`.
    pub fn new(image: impl Into<String>, resources: ResourceList) -> Self {
        Self {
            image: image.into(),
            resources,
            min_available: 1,
            replicas: 1,
        }
    }

    pub fn with_replicas(mut self, min_available: u32, replicas: u32) -> Self {
        self.min_available = min_available;
        self.replicas = replicas;
        self
    }

    fn validate(&self, job: &str, index: usize) -> SpecResult<()> {
        let fail = |reason: String| SpecError::InvalidTask {
            job: job.to_string(),
            index,
            reason,
        };

        if self.image.trim().is_empty() {
            return Err(fail("image reference is empty".to_string()));
        }
        if self.min_available < 1 {
            return Err(fail("min_available must be at least 1".to_string()));
        }
        if self.replicas < self.min_available {
            return Err(fail(format!(
                "replicas {} below min_available {}",
                self.replicas, self.min_available
            )));
        }
        if self.resources.is_empty() {
            return Err(fail("resource request is empty".to_string()));
        }
        Ok(())
    }
}

impl Default for TaskSpec {
    fn default() -> Self {
        Self::new(DEFAULT_IMAGE, ResourceList::CPU1_MEM1)
    }
}

/// A job-group submitted as a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Job name, unique within the context namespace.
    pub name: String,

    /// Logical queue name.
    pub queue: String,

    /// Logical priority class name, if any.
    pub priority_class: Option<String>,

    /// Ordered task groups.
    pub tasks: Vec<TaskSpec>,
}

impl JobSpec {
    pub fn new(name: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue: queue.into(),
            priority_class: None,
            tasks: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority_class: impl Into<String>) -> Self {
        self.priority_class = Some(priority_class.into());
        self
    }

    /// Set the priority class only when `priority_class` is non-empty.
    pub fn with_optional_priority(mut self, priority_class: Option<&str>) -> Self {
        self.priority_class = priority_class
            .filter(|p| !p.is_empty())
            .map(str::to_string);
        self
    }

    pub fn with_task(mut self, task: TaskSpec) -> Self {
        self.tasks.push(task);
        self
    }

    /// Gang threshold of the whole job: the sum of task minimums.
    pub fn min_available(&self) -> u32 {
        self.tasks.iter().map(|t| t.min_available).sum()
    }

    /// Check name and task invariants. Queue existence is checked at
    /// submission time, not here.
    pub fn validate(&self) -> SpecResult<()> {
        validate_name(&self.name)?;
        validate_name(&self.queue)?;
        if self.tasks.is_empty() {
            return Err(SpecError::NoTasks(self.name.clone()));
        }
        for (index, task) in self.tasks.iter().enumerate() {
            task.validate(&self.name, index)?;
        }
        Ok(())
    }
}

/// DNS-1123 label check shared by job, queue and priority class names.
pub fn validate_name(name: &str) -> SpecResult<()> {
    let fail = |reason: &str| SpecError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(fail("empty"));
    }
    if name.len() > 63 {
        return Err(fail("longer than 63 characters"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(fail("only lowercase alphanumerics and '-' are allowed"));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(fail("must start and end with an alphanumeric"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_task_job() -> JobSpec {
        JobSpec::new("reclaim-j1", "reclaim-q2").with_task(TaskSpec::default())
    }

    #[test]
    fn test_valid_job() {
        let job = one_task_job().with_priority("high-priority");
        assert!(job.validate().is_ok());
        assert_eq!(job.min_available(), 1);
    }

    #[test]
    fn test_min_available_sums_tasks() {
        let job = JobSpec::new("mixed", "q1")
            .with_task(TaskSpec::default().with_replicas(2, 3))
            .with_task(TaskSpec::default().with_replicas(1, 4));
        assert_eq!(job.min_available(), 3);
    }

    #[test]
    fn test_rejects_replicas_below_min() {
        let job = JobSpec::new("bad", "q1").with_task(TaskSpec::default().with_replicas(3, 2));
        assert!(matches!(
            job.validate(),
            Err(SpecError::InvalidTask { index: 0, .. })
        ));
    }

    #[test]
    fn test_rejects_zero_min() {
        let job = JobSpec::new("bad", "q1").with_task(TaskSpec::default().with_replicas(0, 2));
        assert!(matches!(job.validate(), Err(SpecError::InvalidTask { .. })));
    }

    #[test]
    fn test_rejects_empty_job() {
        assert_eq!(
            JobSpec::new("empty", "q1").validate(),
            Err(SpecError::NoTasks("empty".to_string()))
        );
    }

    #[test]
    fn test_name_rules() {
        assert!(validate_name("q1-qj-1").is_ok());
        assert!(validate_name("Upper").is_err());
        assert!(validate_name("-lead").is_err());
        assert!(validate_name(&"x".repeat(64)).is_err());
    }

    #[test]
    fn test_optional_priority_ignores_empty() {
        let job = one_task_job().with_optional_priority(Some(""));
        assert_eq!(job.priority_class, None);
        let job = one_task_job().with_optional_priority(Some("low-priority"));
        assert_eq!(job.priority_class.as_deref(), Some("low-priority"));
    }
}
