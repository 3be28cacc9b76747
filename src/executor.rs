//! Runs decoded tasks and reports one result per sub-task.

use crate::{
    Result, ShiftError,
    log_debug, log_error, log_info, log_warn,
    protocol::MigrationProtocol,
    task::{ResultContainer, SubTask, Task, TaskResult},
    transport::{Communicator, Subscription},
    work::WorkCounter,
};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

/// A dispatched sub-task whose result has not been collected yet.
enum Pending {
    Spawned {
        vm_name: String,
        handle: JoinHandle<TaskResult>,
    },
    /// Runs only when collected.
    Deferred(Pin<Box<dyn Future<Output = TaskResult> + Send>>),
}

impl Pending {
    async fn collect(self) -> TaskResult {
        match self {
            Pending::Spawned { vm_name, handle } => match handle.await {
                Ok(result) => result,
                Err(e) => {
                    log_error!("Sub-task for {} did not complete: {}", vm_name, e);
                    TaskResult::error(vm_name, format!("sub-task aborted: {}", e))
                }
            },
            Pending::Deferred(future) => future.await,
        }
    }
}

#[derive(Clone)]
pub struct TaskExecutor {
    protocol: MigrationProtocol,
    comm: Arc<dyn Communicator>,
    work: WorkCounter,
}

impl TaskExecutor {
    pub fn new(protocol: MigrationProtocol, work: WorkCounter) -> Self {
        let comm = protocol.communicator();
        Self {
            protocol,
            comm,
            work,
        }
    }

    pub fn work(&self) -> &WorkCounter {
        &self.work
    }

    /// Execute `task`. A concurrent task is handed to its own tokio task and
    /// this returns immediately; the work counter tracks it until it replies.
    ///
    /// A quit task must be intercepted by the caller and is rejected here.
    pub async fn execute(&self, task: Task) -> Result<()> {
        if task.is_quit() {
            return Err(ShiftError::UnhandledQuit);
        }
        if task.is_empty() {
            log_debug!("Ignoring {} task without sub-tasks", task.operation().as_str());
            return Ok(());
        }

        let span = tracing::info_span!(
            "task",
            id = %Uuid::new_v4(),
            operation = task.operation().as_str()
        );
        if task.concurrent() {
            let guard = self.work.register();
            let executor = self.clone();
            tokio::spawn(
                async move {
                    let _guard = guard;
                    if let Err(e) = executor.run(task).await {
                        log_error!("Task failed: {}", e);
                    }
                }
                .instrument(span),
            );
            Ok(())
        } else {
            self.run(task).instrument(span).await.map(|_| ())
        }
    }

    /// Run every sub-task of `task`, send the reply and return it.
    pub async fn run(&self, task: Task) -> Result<ResultContainer> {
        let label = task.operation().result_label();
        let sub_tasks = task.into_sub_tasks();
        log_info!("Executing {} sub-task(s) for '{}'", sub_tasks.len(), label);

        // Dispatch everything before waiting on anything.
        let pending: Vec<Pending> = sub_tasks
            .into_iter()
            .map(|sub_task| self.dispatch(sub_task))
            .collect();

        let mut results = Vec::with_capacity(pending.len());
        for p in pending {
            results.push(p.collect().await);
        }

        let container = ResultContainer::new(label, results);
        self.comm.send_message(&container.to_yaml()?).await?;
        Ok(container)
    }

    fn dispatch(&self, sub_task: SubTask) -> Pending {
        let vm_name = sub_task.vm_name();
        let concurrent = sub_task.concurrent();
        let future = self.clone().execute_sub_task(sub_task).in_current_span();
        if concurrent {
            Pending::Spawned {
                vm_name,
                handle: tokio::spawn(future),
            }
        } else {
            Pending::Deferred(Box::pin(future))
        }
    }

    async fn execute_sub_task(self, sub_task: SubTask) -> TaskResult {
        let vm_name = sub_task.vm_name();
        let outcome = match &sub_task {
            SubTask::Start(params) => self.protocol.start(params).await.map(|_| ()),
            SubTask::Stop(params) => self.protocol.stop(params).await,
            SubTask::Migrate(params) => self.protocol.migrate(params).await.map(|_| ()),
            SubTask::Quit => Err(ShiftError::UnhandledQuit),
        };
        match outcome {
            Ok(()) => TaskResult::success(vm_name),
            Err(e) => {
                log_warn!(
                    "Exception in {} task for {}: {}",
                    sub_task.operation().as_str(),
                    vm_name,
                    e
                );
                TaskResult::error(vm_name, e.to_string())
            }
        }
    }

    /// Execute tasks arriving on `tasks` until a quit task arrives or the
    /// subscription closes. Undecodable payloads are logged and skipped.
    pub async fn serve(&self, mut tasks: Subscription) -> Result<()> {
        log_info!("Waiting for tasks on '{}'", tasks.topic());
        loop {
            let payload = match tasks.recv().await {
                Ok(payload) => payload,
                Err(e) => {
                    log_warn!("Task stream ended: {}", e);
                    break;
                }
            };
            let task = match Task::from_yaml(&payload) {
                Ok(task) => task,
                Err(e) => {
                    log_error!("Failed to decode task: {}", e);
                    continue;
                }
            };
            if task.is_quit() {
                log_info!("Quit task received");
                break;
            }
            if let Err(e) = self.execute(task).await {
                log_error!("Task failed: {}", e);
            }
        }
        Ok(())
    }
}
