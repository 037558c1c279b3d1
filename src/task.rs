// Copyright 2021-2022 Farcaster Devs
//
// This library is free software; you can redistribute it and/or
// modify it under the terms of the GNU Lesser General Public
// License as published by the Free Software Foundation; either
// version 3 of the License, or (at your option) any later version.
//
// This library is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU
// Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public
// License along with this library; if not, write to the Free Software
// Foundation, Inc., 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301, USA

//! Sequential task pipelines. A pipeline is an ordered list of [`Task`] run over one mutable
//! context. Tasks run strictly one after the other; the first error aborts the pipeline, is
//! recorded on the context and returned. The runner never retries, the owner of the pipeline
//! decides what to do with the failure.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, error};

use crate::{Error, Res};

/// One step of a pipeline.
pub trait Task<C>: Send + Sync {
    /// Name used in logs and in the recorded error.
    fn name(&self) -> &'static str;

    fn run(&self, ctx: &mut C) -> Res<()>;
}

/// Context of a pipeline, records the failure of a task.
pub trait TaskContext {
    fn on_task_failed(&mut self, task: &'static str, error: &Error);
}

/// Hook called with the task name before each task runs. Used by tests to observe or delay the
/// execution, it cannot alter the outcome.
pub type InterceptHook = Arc<dyn Fn(&'static str) + Send + Sync>;

/// Runs a list of tasks over a context.
pub struct TaskRunner<C> {
    tasks: Vec<Box<dyn Task<C>>>,
    intercept: Option<InterceptHook>,
}

impl<C> fmt::Debug for TaskRunner<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.tasks.iter().map(|t| t.name()))
            .finish()
    }
}

impl<C> Default for TaskRunner<C> {
    fn default() -> Self {
        Self {
            tasks: Vec::new(),
            intercept: None,
        }
    }
}

impl<C: TaskContext> TaskRunner<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task.
    pub fn then(mut self, task: impl Task<C> + 'static) -> Self {
        self.tasks.push(Box::new(task));
        self
    }

    pub fn with_intercept(mut self, hook: Option<InterceptHook>) -> Self {
        self.intercept = hook;
        self
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Run every task in order, stop at the first failure.
    pub fn run(&self, ctx: &mut C) -> Res<()> {
        for task in &self.tasks {
            if let Some(hook) = &self.intercept {
                hook(task.name());
            }
            debug!(task = task.name(), "Running task");
            if let Err(e) = task.run(ctx) {
                let e = match e {
                    e @ Error::Task { .. } => e,
                    other => Error::Task {
                        task: task.name().to_string(),
                        message: other.to_string(),
                    },
                };
                error!(task = task.name(), error = %e, "Task failed");
                ctx.on_task_failed(task.name(), &e);
                return Err(e);
            }
        }
        Ok(())
    }
}

/// Declare a unit struct task running the given body, `|ctx| { .. }` must evaluate to
/// `Res<()>`.
#[macro_export]
macro_rules! trade_task {
    ($(#[$meta:meta])* $name:ident, |$ctx:ident| $body:block) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default)]
        pub struct $name;

        impl $crate::task::Task<$crate::trade::TradeContext> for $name {
            fn name(&self) -> &'static str {
                stringify!($name)
            }

            fn run(&self, $ctx: &mut $crate::trade::TradeContext) -> $crate::Res<()> {
                $body
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Ctx {
        steps: Vec<&'static str>,
        failed: Option<String>,
    }

    impl TaskContext for Ctx {
        fn on_task_failed(&mut self, task: &'static str, error: &Error) {
            self.failed = Some(format!("{}: {}", task, error));
        }
    }

    struct Step(&'static str, bool);

    impl Task<Ctx> for Step {
        fn name(&self) -> &'static str {
            self.0
        }

        fn run(&self, ctx: &mut Ctx) -> Res<()> {
            ctx.steps.push(self.0);
            if self.1 {
                Ok(())
            } else {
                Err(Error::Verification("boom".into()))
            }
        }
    }

    #[test]
    fn first_failure_stops_the_pipeline() {
        let mut ctx = Ctx::default();
        let runner = TaskRunner::new()
            .then(Step("a", true))
            .then(Step("b", false))
            .then(Step("c", true));
        let res = runner.run(&mut ctx);
        assert_eq!(ctx.steps, vec!["a", "b"]);
        match res {
            Err(Error::Task { task, message }) => {
                assert_eq!(task, "b");
                assert!(message.contains("boom"));
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert!(ctx.failed.unwrap().starts_with("b:"));
    }

    #[test]
    fn intercept_sees_every_task() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let hook_seen = seen.clone();
        let hook: InterceptHook = Arc::new(move |name: &'static str| hook_seen.lock().push(name));
        let runner = TaskRunner::new()
            .then(Step("a", true))
            .then(Step("b", true))
            .with_intercept(Some(hook));
        let mut ctx = Ctx::default();
        runner.run(&mut ctx).unwrap();
        assert_eq!(*seen.lock(), vec!["a", "b"]);
        assert!(ctx.failed.is_none());
        assert_eq!(format!("{:?}", runner), r#"["a", "b"]"#);
    }
}
