//! `TaskExecutor`: pulls one task at a time off the local inbound channel,
//! expands its command template, runs it as a subprocess, and escalates
//! through SIGINT/SIGTERM/SIGKILL if it overruns its wall-clock budget or a
//! shutdown is requested.
//!
//! Grounded on `original_source/client.py`'s `TaskExecutor`/`TaskState`
//! (`task_env` in particular). Python's blocking `Popen`/`process.wait`
//! polling loop becomes `tokio::process::Command`/`child.wait()` under a
//! `tokio::time::timeout`, since every action here must stay non-blocking
//! enough for a halt request to be observed within ~1s.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use shared::fsm::{HaltFlag, MachineState, StateMachine};
use shared::model::TagValue;
use shared::template::Template;
use shared::Task;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, trace, warn};

use crate::local::{LocalReceiver, LocalSender};

const GET_TIMEOUT: Duration = Duration::from_secs(1);
const PUT_TIMEOUT: Duration = Duration::from_secs(1);
const WAIT_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Start,
    GetLocal,
    CreateTask,
    StartTask,
    WaitTask,
    CheckTask,
    WaitSignal,
    StopTask,
    TermTask,
    KillTask,
    PutLocal,
    Final,
    Halt,
}

impl MachineState for TaskState {
    fn halt_state() -> Self {
        TaskState::Halt
    }
}

/// Output redirection shared by every executor when `--capture` is not set:
/// either inherit the client process's own stdout/stderr, or redirect every
/// task's output into one shared file (`--output`/`--errors`).
#[derive(Clone)]
pub enum OutputTarget {
    Inherit,
    File(Arc<std::fs::File>),
}

impl OutputTarget {
    fn stdio(&self) -> std::io::Result<Stdio> {
        match self {
            OutputTarget::Inherit => Ok(Stdio::inherit()),
            OutputTarget::File(file) => Ok(Stdio::from(file.try_clone()?)),
        }
    }
}

pub struct TaskExecutor {
    state: TaskState,
    inbound: LocalReceiver,
    outbound: LocalSender,
    template: Arc<Template>,
    client_id: String,
    client_host: String,
    task_timeout: Option<i64>,
    signalwait: chrono::Duration,
    capture: bool,
    directory: Option<String>,
    stdout_target: OutputTarget,
    stderr_target: OutputTarget,
    task: Option<Task>,
    child: Option<Child>,
    start_time: Option<chrono::DateTime<Local>>,
    stop_requested: Option<chrono::DateTime<Local>>,
    attempted_sigint: bool,
    attempted_sigterm: bool,
    attempted_sigkill: bool,
    halt: Arc<HaltFlag>,
    interrupt: Arc<HaltFlag>,
}

impl TaskExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        inbound: LocalReceiver,
        outbound: LocalSender,
        template: Arc<Template>,
        client_id: impl Into<String>,
        client_host: impl Into<String>,
        task_timeout: Option<u64>,
        signalwait_secs: u64,
        capture: bool,
        directory: Option<String>,
        stdout_target: OutputTarget,
        stderr_target: OutputTarget,
        halt: Arc<HaltFlag>,
        interrupt: Arc<HaltFlag>,
    ) -> Self {
        TaskExecutor {
            state: TaskState::Start,
            inbound,
            outbound,
            template,
            client_id: client_id.into(),
            client_host: client_host.into(),
            task_timeout: task_timeout.map(|t| t as i64),
            signalwait: chrono::Duration::seconds(signalwait_secs.max(1) as i64),
            capture,
            directory,
            stdout_target,
            stderr_target,
            task: None,
            child: None,
            start_time: None,
            stop_requested: None,
            attempted_sigint: false,
            attempted_sigterm: false,
            attempted_sigkill: false,
            halt,
            interrupt,
        }
    }

    fn start(&mut self) -> TaskState {
        debug!("started (executor)");
        TaskState::GetLocal
    }

    async fn get_local(&mut self) -> TaskState {
        if self.halt.is_tripped() {
            return TaskState::Final;
        }
        match self.inbound.recv(GET_TIMEOUT).await {
            Ok(Some(task)) => {
                self.task = Some(task);
                TaskState::CreateTask
            }
            Ok(None) => TaskState::Final,
            Err(_) => TaskState::GetLocal,
        }
    }

    fn create_task(&mut self) -> TaskState {
        let Some(task) = self.task.as_mut() else {
            return TaskState::GetLocal;
        };
        task.client_id = Some(self.client_id.clone());
        task.client_host = Some(self.client_host.clone());

        match self.template.expand(&task.args) {
            Ok(command) => {
                task.command = Some(command);
                TaskState::StartTask
            }
            Err(e) => {
                error!(task = %task.id, error = %e, "failed to expand command template");
                // `exit_status = -1` with `start_time` left unset is this
                // engine's single marker for a task that never ran; see
                // `shared::model::Task::state`.
                task.completion_time = Some(Local::now());
                task.exit_status = Some(-1);
                TaskState::PutLocal
            }
        }
    }

    async fn start_task(&mut self) -> TaskState {
        let Some(task) = self.task.as_mut() else {
            return TaskState::GetLocal;
        };
        let command = task.command.clone().unwrap_or_default();
        let cwd = self.directory.clone().unwrap_or_else(|| ".".to_string());

        let (stdout, stderr) = if self.capture {
            let outpath = PathBuf::from(&cwd).join(format!("{}.out", task.id));
            let errpath = PathBuf::from(&cwd).join(format!("{}.err", task.id));
            let out_file = match std::fs::File::create(&outpath) {
                Ok(f) => f,
                Err(e) => {
                    error!(task = %task.id, error = %e, "failed to open capture outpath");
                    return self.abort_start(e.to_string());
                }
            };
            let err_file = match std::fs::File::create(&errpath) {
                Ok(f) => f,
                Err(e) => {
                    error!(task = %task.id, error = %e, "failed to open capture errpath");
                    return self.abort_start(e.to_string());
                }
            };
            task.outpath = Some(outpath.display().to_string());
            task.errpath = Some(errpath.display().to_string());
            (Stdio::from(out_file), Stdio::from(err_file))
        } else {
            let stdout = self.stdout_target.stdio().unwrap_or_else(|_| Stdio::inherit());
            let stderr = self.stderr_target.stdio().unwrap_or_else(|_| Stdio::inherit());
            (stdout, stderr)
        };

        let env = task_env_vars(task, &cwd);
        let start_time = Local::now();
        let waited = (start_time - task.submit_time).num_seconds().max(0);
        task.start_time = Some(start_time);
        task.waited = Some(waited);

        let spawned = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .current_dir(&cwd)
            .envs(env)
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn();

        match spawned {
            Ok(child) => {
                info!(task = %task.id, pid = ?child.id(), "task started");
                self.child = Some(child);
                self.start_time = Some(start_time);
                self.stop_requested = None;
                self.attempted_sigint = false;
                self.attempted_sigterm = false;
                self.attempted_sigkill = false;
                TaskState::WaitTask
            }
            Err(e) => {
                error!(task = %task.id, error = %e, "failed to spawn task");
                self.abort_start(e.to_string())
            }
        }
    }

    fn abort_start(&mut self, reason: String) -> TaskState {
        if let Some(task) = self.task.as_mut() {
            task.completion_time = Some(Local::now());
            task.exit_status = Some(-1);
            trace!(task = %task.id, reason, "aborted before spawn");
        }
        TaskState::PutLocal
    }

    async fn wait_task(&mut self) -> TaskState {
        let Some(child) = self.child.as_mut() else {
            return TaskState::PutLocal;
        };
        match tokio::time::timeout(WAIT_POLL, child.wait()).await {
            Ok(Ok(status)) => {
                let completion = Local::now();
                if let Some(task) = self.task.as_mut() {
                    let start = self.start_time.unwrap_or(completion);
                    task.completion_time = Some(completion);
                    task.exit_status = Some(exit_code(&status));
                    task.duration = Some((completion - start).num_seconds().max(0));
                    debug!(task = %task.id, exit_status = ?task.exit_status, "task finished");
                }
                self.child = None;
                TaskState::PutLocal
            }
            Ok(Err(e)) => {
                warn!(error = %e, "error waiting on child process");
                self.child = None;
                if let Some(task) = self.task.as_mut() {
                    task.completion_time = Some(Local::now());
                    task.exit_status = Some(-1);
                }
                TaskState::PutLocal
            }
            Err(_) => {
                if self.stop_requested.is_some() {
                    TaskState::WaitSignal
                } else {
                    TaskState::CheckTask
                }
            }
        }
    }

    fn check_task(&mut self) -> TaskState {
        if self.interrupt.is_tripped() {
            self.stop_requested = Some(Local::now());
            return TaskState::WaitSignal;
        }
        let start = self.start_time.unwrap_or_else(Local::now);
        let elapsed = (Local::now() - start).num_seconds();
        match self.task_timeout {
            Some(limit) if elapsed >= limit => {
                warn!(elapsed, limit, "task exceeded wall-clock timeout");
                self.stop_requested = Some(Local::now());
                TaskState::WaitSignal
            }
            _ => TaskState::WaitTask,
        }
    }

    /// The exact SIGINT -> SIGTERM -> SIGKILL escalation ladder, each step
    /// given `signalwait` seconds to take effect before trying the next.
    fn wait_signal(&mut self) -> TaskState {
        let since = self.stop_requested.map(|t| Local::now() - t).unwrap_or_default();
        if !self.attempted_sigint {
            TaskState::StopTask
        } else if since < self.signalwait {
            TaskState::WaitTask
        } else if !self.attempted_sigterm {
            error!(task = ?self.task.as_ref().map(|t| &t.id), "interrupt ignored, escalating to terminate");
            TaskState::TermTask
        } else if since < self.signalwait * 2 {
            TaskState::WaitTask
        } else if !self.attempted_sigkill {
            error!(task = ?self.task.as_ref().map(|t| &t.id), "terminate ignored, escalating to kill");
            TaskState::KillTask
        } else if since < self.signalwait * 3 {
            TaskState::WaitTask
        } else {
            tracing::error!("process ignored SIGKILL, shutting down executor");
            TaskState::Final
        }
    }

    fn stop_task(&mut self) -> TaskState {
        self.send_signal(Signal::Int);
        self.attempted_sigint = true;
        TaskState::WaitTask
    }

    fn term_task(&mut self) -> TaskState {
        self.send_signal(Signal::Term);
        self.attempted_sigterm = true;
        TaskState::WaitTask
    }

    fn kill_task(&mut self) -> TaskState {
        self.send_signal(Signal::Kill);
        self.attempted_sigkill = true;
        TaskState::WaitTask
    }

    fn send_signal(&self, signal: Signal) {
        let Some(child) = self.child.as_ref() else { return };
        let Some(pid) = child.id() else { return };
        if let Err(e) = send_os_signal(pid, signal) {
            warn!(pid, ?signal, error = %e, "failed to deliver signal");
        }
    }

    async fn put_local(&mut self) -> TaskState {
        let Some(task) = self.task.take() else {
            return TaskState::GetLocal;
        };
        match self.outbound.send(Some(task.clone()), PUT_TIMEOUT).await {
            Ok(()) => TaskState::GetLocal,
            Err(_) => {
                self.task = Some(task);
                TaskState::PutLocal
            }
        }
    }

    fn finalize(&mut self) -> TaskState {
        debug!("done (executor)");
        TaskState::Halt
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Int,
    Term,
    Kill,
}

#[cfg(unix)]
fn send_os_signal(pid: u32, signal: Signal) -> Result<(), nix::errno::Errno> {
    use nix::sys::signal::{kill, Signal as NixSignal};
    use nix::unistd::Pid;

    let nix_signal = match signal {
        Signal::Int => NixSignal::SIGINT,
        Signal::Term => NixSignal::SIGTERM,
        Signal::Kill => NixSignal::SIGKILL,
    };
    kill(Pid::from_raw(pid as i32), nix_signal)
}

#[cfg(not(unix))]
fn send_os_signal(_pid: u32, _signal: Signal) -> Result<(), std::io::Error> {
    Ok(())
}

#[cfg(unix)]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.code().unwrap_or_else(|| -status.signal().unwrap_or(0))
}

#[cfg(not(unix))]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Every environment variable a task's subprocess runs with: the client
/// process's own environment, the task's own fields flattened with a
/// `TASK_` prefix, and its tags flattened with a `TASK_TAG_` prefix.
fn task_env_vars(task: &Task, cwd: &str) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = std::env::vars().collect();

    env.push(("TASK_ID".into(), task.id.clone()));
    env.push(("TASK_ARGS".into(), task.args.clone()));
    env.push(("TASK_SUBMIT_ID".into(), task.submit_id.clone()));
    env.push(("TASK_SUBMIT_HOST".into(), task.submit_host.clone()));
    if let Some(v) = &task.server_id {
        env.push(("TASK_SERVER_ID".into(), v.clone()));
    }
    if let Some(v) = &task.server_host {
        env.push(("TASK_SERVER_HOST".into(), v.clone()));
    }
    if let Some(v) = &task.client_id {
        env.push(("TASK_CLIENT_ID".into(), v.clone()));
    }
    if let Some(v) = &task.client_host {
        env.push(("TASK_CLIENT_HOST".into(), v.clone()));
    }
    env.push(("TASK_ATTEMPT".into(), task.attempt.to_string()));
    env.push(("TASK_RETRIED".into(), task.retried.to_string()));
    if let Some(v) = &task.previous_id {
        env.push(("TASK_PREVIOUS_ID".into(), v.clone()));
    }

    for (key, value) in &task.tag {
        env.push((format!("TASK_TAG_{}", key.to_uppercase()), tag_value_to_string(value)));
    }

    env.push(("TASK_CWD".into(), cwd.to_string()));
    if let Some(outpath) = &task.outpath {
        env.push(("TASK_OUTPATH".into(), outpath.clone()));
    }
    if let Some(errpath) = &task.errpath {
        env.push(("TASK_ERRPATH".into(), errpath.clone()));
    }
    env
}

fn tag_value_to_string(value: &TagValue) -> String {
    match value {
        TagValue::Bool(b) => b.to_string(),
        TagValue::Int(i) => i.to_string(),
        TagValue::Float(f) => f.to_string(),
        TagValue::String(s) => s.clone(),
        TagValue::Null => String::new(),
    }
}

#[async_trait]
impl StateMachine for TaskExecutor {
    type State = TaskState;

    fn state(&self) -> TaskState {
        self.state
    }

    fn set_state(&mut self, state: TaskState) {
        self.state = state;
    }

    async fn action(&mut self) -> TaskState {
        match self.state {
            TaskState::Start => self.start(),
            TaskState::GetLocal => self.get_local().await,
            TaskState::CreateTask => self.create_task(),
            TaskState::StartTask => self.start_task().await,
            TaskState::WaitTask => self.wait_task().await,
            TaskState::CheckTask => self.check_task(),
            TaskState::WaitSignal => self.wait_signal(),
            TaskState::StopTask => self.stop_task(),
            TaskState::TermTask => self.term_task(),
            TaskState::KillTask => self.kill_task(),
            TaskState::PutLocal => self.put_local().await,
            TaskState::Final => self.finalize(),
            TaskState::Halt => TaskState::Halt,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalQueue;

    fn executor(inbound: LocalReceiver, outbound: LocalSender) -> TaskExecutor {
        TaskExecutor::new(
            inbound,
            outbound,
            Arc::new(Template::default_template()),
            "client-1",
            "host-a",
            None,
            1,
            false,
            Some(".".to_string()),
            OutputTarget::Inherit,
            OutputTarget::Inherit,
            Arc::new(HaltFlag::new()),
            Arc::new(HaltFlag::new()),
        )
    }

    #[tokio::test]
    async fn create_task_expands_template_and_advances_to_start() {
        let inbound = LocalQueue::new(4);
        let outbound = LocalQueue::new(4);
        let mut exec = executor(inbound.receiver(), outbound.sender());
        exec.task = Some(Task::new("echo hi", Default::default(), "sub-1", "host-a"));
        let next = exec.action_for_test(TaskState::CreateTask).await;
        assert_eq!(next, TaskState::StartTask);
        assert_eq!(exec.task.as_ref().unwrap().command.as_deref(), Some("echo hi"));
    }

    #[tokio::test]
    async fn create_task_failure_marks_cancelled_without_start_time() {
        let inbound = LocalQueue::new(4);
        let outbound = LocalQueue::new(4);
        let mut exec = executor(inbound.receiver(), outbound.sender());
        exec.template = Arc::new(Template::new("{???}"));
        exec.task = Some(Task::new("echo hi", Default::default(), "sub-1", "host-a"));
        let next = exec.action_for_test(TaskState::CreateTask).await;
        assert_eq!(next, TaskState::PutLocal);
        let task = exec.task.as_ref().unwrap();
        assert_eq!(task.exit_status, Some(-1));
        assert!(task.start_time.is_none());
        assert_eq!(task.state(), shared::model::TaskState::New);
    }

    #[tokio::test]
    async fn full_run_through_start_and_wait_completes_a_real_command() {
        let inbound = LocalQueue::new(4);
        let outbound = LocalQueue::new(4);
        let out_rx = outbound.receiver();
        let mut exec = executor(inbound.receiver(), outbound.sender());
        let mut task = Task::new("true", Default::default(), "sub-1", "host-a");
        task.command = Some("true".to_string());
        exec.task = Some(task);
        exec.start_task().await;
        assert!(exec.child.is_some());
        loop {
            let next = exec.wait_task().await;
            if next == TaskState::PutLocal {
                break;
            }
        }
        exec.put_local().await;
        let finished = out_rx.recv(Duration::from_millis(200)).await.unwrap().unwrap();
        assert_eq!(finished.exit_status, Some(0));
        assert!(finished.duration.is_some());
    }

    #[tokio::test]
    async fn wait_signal_escalates_sigint_then_sigterm_then_sigkill() {
        let inbound = LocalQueue::new(4);
        let outbound = LocalQueue::new(4);
        let mut exec = executor(inbound.receiver(), outbound.sender());
        exec.signalwait = chrono::Duration::seconds(0);
        exec.stop_requested = Some(Local::now() - chrono::Duration::seconds(10));

        assert_eq!(exec.wait_signal(), TaskState::StopTask);
        exec.attempted_sigint = true;
        assert_eq!(exec.wait_signal(), TaskState::TermTask);
        exec.attempted_sigterm = true;
        assert_eq!(exec.wait_signal(), TaskState::KillTask);
        exec.attempted_sigkill = true;
        assert_eq!(exec.wait_signal(), TaskState::Final);
    }

    #[tokio::test]
    async fn check_task_escalates_once_timeout_exceeded() {
        let inbound = LocalQueue::new(4);
        let outbound = LocalQueue::new(4);
        let mut exec = executor(inbound.receiver(), outbound.sender());
        exec.task_timeout = Some(1);
        exec.start_time = Some(Local::now() - chrono::Duration::seconds(5));
        let next = exec.check_task();
        assert_eq!(next, TaskState::WaitSignal);
        assert!(exec.stop_requested.is_some());
    }

    #[tokio::test]
    async fn check_task_ignores_halt_only_escalates_on_interrupt() {
        let inbound = LocalQueue::new(4);
        let outbound = LocalQueue::new(4);
        let mut exec = executor(inbound.receiver(), outbound.sender());
        exec.halt.trip();
        assert_eq!(exec.check_task(), TaskState::WaitTask, "halt alone must not interrupt a running task");
        assert!(exec.stop_requested.is_none());

        exec.interrupt.trip();
        assert_eq!(exec.check_task(), TaskState::WaitSignal);
        assert!(exec.stop_requested.is_some());
    }

    // Test-only dispatcher so individual action bodies can be driven without
    // going through the full `StateMachine::action` match every time.
    impl TaskExecutor {
        async fn action_for_test(&mut self, state: TaskState) -> TaskState {
            self.state = state;
            self.action().await
        }
    }
}
