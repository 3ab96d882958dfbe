//! Ordered build-task framework.
//!
//! Tasks are registered in a declarative table of
//! `(phase, formats) -> task` entries. [`PipelineBuilder::build`] filters
//! the table for one [`OutputFormat`] and orders it by [`Phase`], keeping
//! registration order inside a phase. [`Pipeline::run`] executes the tasks
//! front to back and stops at the first error.

use crate::config::OutputFormat;
use crate::context::BuildContext;
use crate::{Error, Result};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{error, info};

/// Pipeline phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    Prepare,
    Icon,
    Metadata,
    Compile,
    Sign,
    Package,
}

impl Phase {
    pub const ALL: [Phase; 6] = [
        Phase::Prepare,
        Phase::Icon,
        Phase::Metadata,
        Phase::Compile,
        Phase::Sign,
        Phase::Package,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Prepare => "prepare",
            Phase::Icon => "icon",
            Phase::Metadata => "metadata",
            Phase::Compile => "compile",
            Phase::Sign => "sign",
            Phase::Package => "package",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Successful result of one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Done,
    /// The task produced files that belong in the build result.
    Files(Vec<PathBuf>),
}

pub type TaskResult = Result<TaskOutcome>;

/// Output files of a successful build.
pub type BuildResult = Result<Vec<PathBuf>>;

/// A named unit of work.
///
/// Tasks hold no per-build state; everything they need lives in the
/// [`BuildContext`]. A task may rely on earlier phases having run, never on
/// later ones.
pub trait BuildTask: Send + Sync {
    fn name(&self) -> &str;

    fn run(&self, ctx: &mut BuildContext) -> TaskResult;
}

struct Registration {
    phase: Phase,
    formats: Vec<OutputFormat>,
    task: Box<dyn BuildTask>,
}

/// Declarative task table.
#[derive(Default)]
pub struct PipelineBuilder {
    registrations: Vec<Registration>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `task` to `phase` for the given output formats.
    pub fn register(
        mut self,
        phase: Phase,
        formats: &[OutputFormat],
        task: impl BuildTask + 'static,
    ) -> Self {
        self.registrations.push(Registration {
            phase,
            formats: formats.to_vec(),
            task: Box::new(task),
        });
        self
    }

    /// Selects the tasks for `format` and orders them by phase.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsignedBuildNotAllowed`] if no task remains in the
    /// sign phase and `format` requires signing.
    pub fn build(self, format: OutputFormat) -> Result<Pipeline> {
        let mut tasks: Vec<(Phase, Box<dyn BuildTask>)> = self
            .registrations
            .into_iter()
            .filter(|r| r.formats.contains(&format))
            .map(|r| (r.phase, r.task))
            .collect();

        // Stable: registration order survives inside a phase.
        tasks.sort_by_key(|(phase, _)| *phase);

        let signs = tasks.iter().any(|(phase, _)| *phase == Phase::Sign);
        if !signs && !format.signing_optional() {
            return Err(Error::UnsignedBuildNotAllowed(format.to_string()));
        }

        Ok(Pipeline { format, tasks })
    }
}

/// A filtered, ordered task list for one output format.
pub struct Pipeline {
    format: OutputFormat,
    tasks: Vec<(Phase, Box<dyn BuildTask>)>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    /// `(phase, task name)` in execution order.
    pub fn plan(&self) -> Vec<(Phase, &str)> {
        self.tasks.iter().map(|(p, t)| (*p, t.name())).collect()
    }

    /// Runs every task in order.
    ///
    /// Files reported by successful tasks are appended to
    /// [`BuildContext::outputs`]. The first error stops the build and is
    /// returned unchanged; no later task runs.
    pub fn run(&self, ctx: &mut BuildContext) -> BuildResult {
        let started = Instant::now();
        info!(format = %self.format, tasks = self.tasks.len(), project = %ctx.project.name, "starting build");

        for (phase, task) in &self.tasks {
            let task_started = Instant::now();
            match task.run(ctx) {
                Ok(TaskOutcome::Done) => {}
                Ok(TaskOutcome::Files(files)) => {
                    for file in &files {
                        info!(phase = %phase, task = task.name(), file = %file.display(), "produced");
                    }
                    ctx.outputs.extend(files);
                }
                Err(e) => {
                    error!(phase = %phase, task = task.name(), "task failed: {}", e);
                    return Err(e);
                }
            }
            info!(
                phase = %phase,
                task = task.name(),
                elapsed_ms = task_started.elapsed().as_millis() as u64,
                "task finished"
            );
        }

        info!(
            outputs = ctx.outputs.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "build finished"
        );
        Ok(ctx.outputs.clone())
    }
}
