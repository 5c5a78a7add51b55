//! `AutoScaler`: launches and retires client processes against task
//! pressure, either holding a fixed fleet size or scaling dynamically.
//!
//! Grounded on `original_source/cluster/remote.py`'s `AutoScaler`/
//! `AutoScalerState`. The scaler neither kills children directly nor
//! tracks task assignments; scale-in happens by clients exceeding their
//! own idle timeout and disconnecting on their own.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use shared::fsm::{HaltFlag, MachineState, StateMachine};
use tokio::process::{Child, Command};
use tracing::{debug, trace, warn};

use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoScalerState {
    Start,
    Init,
    Wait,
    Check,
    CheckFixed,
    CheckDynamic,
    Scale,
    Clean,
    Final,
    Halt,
}

impl MachineState for AutoScalerState {
    fn halt_state() -> Self {
        AutoScalerState::Halt
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoScalerPolicy {
    Fixed,
    Dynamic,
}

impl AutoScalerPolicy {
    pub fn from_name(name: &str) -> shared::Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "fixed" => Ok(AutoScalerPolicy::Fixed),
            "dynamic" => Ok(AutoScalerPolicy::Dynamic),
            other => Err(shared::Error::Config(format!("unknown autoscale policy '{other}'")).into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AutoScalerPhase {
    Init,
    Steady,
    Stop,
}

/// What a check decided to do next, independent of how it got there.
/// Kept separate from the I/O-bound `check_fixed`/`check_dynamic` methods
/// so the scaling logic itself can be exercised without real child
/// processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Scale,
    Wait,
}

fn decide_fixed(launched_size: usize, min_size: usize, task_count: i64) -> Decision {
    if launched_size < min_size {
        return Decision::Scale;
    }
    if launched_size == 0 && task_count > 0 {
        return Decision::Scale;
    }
    Decision::Wait
}

fn decide_dynamic(launched_size: usize, min_size: usize, max_size: usize, task_count: i64, pressure: Option<f64>) -> Decision {
    if launched_size < min_size {
        return Decision::Scale;
    }
    match pressure {
        Some(pressure) if pressure > 1.0 => {
            if launched_size >= max_size {
                Decision::Wait
            } else {
                Decision::Scale
            }
        }
        Some(_) => Decision::Wait,
        None if launched_size == 0 && task_count > 0 => Decision::Scale,
        None => Decision::Wait,
    }
}

pub struct AutoScaler {
    state: AutoScalerState,
    store: Arc<Store>,
    policy: AutoScalerPolicy,
    factor: f64,
    init_size: usize,
    min_size: usize,
    max_size: usize,
    launcher: Vec<String>,
    clients: Vec<Child>,
    last_check: chrono::DateTime<Local>,
    wait_check: chrono::Duration,
    phase: AutoScalerPhase,
    halt: Arc<HaltFlag>,
}

impl AutoScaler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        launcher: Vec<String>,
        policy: AutoScalerPolicy,
        factor: f64,
        period_secs: i64,
        init_size: usize,
        min_size: usize,
        max_size: usize,
        halt: Arc<HaltFlag>,
    ) -> Self {
        AutoScaler {
            state: AutoScalerState::Start,
            store,
            policy,
            factor,
            init_size,
            min_size,
            max_size,
            launcher,
            clients: Vec::new(),
            last_check: Local::now(),
            wait_check: chrono::Duration::seconds(period_secs),
            phase: AutoScalerPhase::Init,
            halt,
        }
    }

    fn start(&mut self) -> AutoScalerState {
        debug!(policy = ?self.policy, init_size = self.init_size, "autoscale start");
        trace!(launcher = ?self.launcher, "autoscale launcher");
        AutoScalerState::Init
    }

    fn init(&mut self) -> AutoScalerState {
        if self.clients.len() < self.init_size {
            AutoScalerState::Scale
        } else {
            self.phase = AutoScalerPhase::Steady;
            AutoScalerState::Wait
        }
    }

    async fn wait(&mut self) -> AutoScalerState {
        if self.phase != AutoScalerPhase::Steady {
            return AutoScalerState::Final;
        }
        let waited = Local::now() - self.last_check;
        if waited > self.wait_check {
            return AutoScalerState::Check;
        }
        trace!(waited = waited.num_seconds(), "autoscale wait");
        tokio::time::sleep(Duration::from_secs(1)).await;
        AutoScalerState::Wait
    }

    fn check(&mut self) -> AutoScalerState {
        self.clean_children();
        self.last_check = Local::now();
        match self.policy {
            AutoScalerPolicy::Fixed => AutoScalerState::CheckFixed,
            AutoScalerPolicy::Dynamic => AutoScalerState::CheckDynamic,
        }
    }

    fn check_fixed(&mut self) -> AutoScalerState {
        let launched_size = self.clients.len();
        let registered_size = self.store.count_connected_clients().unwrap_or(0);
        let task_count = self.store.count_remaining().unwrap_or(0);
        debug!(clients = registered_size, launched = launched_size, tasks = task_count, "autoscale check (fixed)");
        match decide_fixed(launched_size, self.min_size, task_count) {
            Decision::Scale => AutoScalerState::Scale,
            Decision::Wait => AutoScalerState::Wait,
        }
    }

    fn check_dynamic(&mut self) -> AutoScalerState {
        let launched_size = self.clients.len();
        let registered_size = self.store.count_connected_clients().unwrap_or(0);
        let task_count = self.store.count_remaining().unwrap_or(0);
        let pressure = self.store.task_pressure(self.factor).unwrap_or(None);
        debug!(
            pressure = pressure,
            clients = registered_size,
            launched = launched_size,
            tasks = task_count,
            "autoscale check (dynamic)"
        );
        match decide_dynamic(launched_size, self.min_size, self.max_size, task_count, pressure) {
            Decision::Scale => AutoScalerState::Scale,
            Decision::Wait => AutoScalerState::Wait,
        }
    }

    fn scale(&mut self) -> AutoScalerState {
        if self.launcher.is_empty() {
            warn!("autoscale launcher is empty, cannot add client");
            return AutoScalerState::Wait;
        }
        match Command::new(&self.launcher[0])
            .args(&self.launcher[1..])
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(false)
            .spawn()
        {
            Ok(child) => {
                trace!(pid = child.id(), "autoscale adding client");
                self.clients.push(child);
            }
            Err(e) => warn!(error = %e, "failed to launch client"),
        }
        if self.phase == AutoScalerPhase::Init {
            AutoScalerState::Init
        } else {
            AutoScalerState::Wait
        }
    }

    fn clean_children(&mut self) {
        let mut still_running = Vec::with_capacity(self.clients.len());
        for mut child in self.clients.drain(..) {
            match child.try_wait() {
                Ok(Some(status)) => {
                    if status.success() {
                        debug!(pid = child.id(), "autoscale client disconnected");
                    } else {
                        warn!(pid = child.id(), status = ?status, "autoscale client exited with error");
                    }
                }
                Ok(None) => still_running.push(child),
                Err(e) => {
                    warn!(error = %e, "failed to poll autoscale client");
                    still_running.push(child);
                }
            }
        }
        self.clients = still_running;
    }

    fn finalize(&mut self) -> AutoScalerState {
        debug!("done (autoscaler)");
        AutoScalerState::Halt
    }
}

#[async_trait]
impl StateMachine for AutoScaler {
    type State = AutoScalerState;

    fn state(&self) -> AutoScalerState {
        self.state
    }

    fn set_state(&mut self, state: AutoScalerState) {
        self.state = state;
    }

    async fn action(&mut self) -> AutoScalerState {
        if self.halt.is_tripped() {
            self.phase = AutoScalerPhase::Stop;
            return AutoScalerState::Final;
        }
        match self.state {
            AutoScalerState::Start => self.start(),
            AutoScalerState::Init => self.init(),
            AutoScalerState::Wait => self.wait().await,
            AutoScalerState::Check => self.check(),
            AutoScalerState::CheckFixed => self.check_fixed(),
            AutoScalerState::CheckDynamic => self.check_dynamic(),
            AutoScalerState::Scale => self.scale(),
            AutoScalerState::Clean => {
                self.clean_children();
                AutoScalerState::Wait
            }
            AutoScalerState::Final => self.finalize(),
            AutoScalerState::Halt => AutoScalerState::Halt,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_parses_case_insensitively() {
        assert_eq!(AutoScalerPolicy::from_name("FIXED").unwrap(), AutoScalerPolicy::Fixed);
        assert_eq!(AutoScalerPolicy::from_name("dynamic").unwrap(), AutoScalerPolicy::Dynamic);
        assert!(AutoScalerPolicy::from_name("bogus").is_err());
    }

    #[test]
    fn fixed_scales_up_to_min_size() {
        assert_eq!(decide_fixed(0, 2, 0), Decision::Scale);
        assert_eq!(decide_fixed(1, 2, 0), Decision::Scale);
        assert_eq!(decide_fixed(2, 2, 0), Decision::Wait);
    }

    #[test]
    fn fixed_scales_up_from_zero_when_tasks_remain() {
        assert_eq!(decide_fixed(0, 0, 5), Decision::Scale);
        assert_eq!(decide_fixed(0, 0, 0), Decision::Wait);
    }

    #[test]
    fn dynamic_scales_up_to_min_size_regardless_of_pressure() {
        assert_eq!(decide_dynamic(0, 3, 10, 0, None), Decision::Scale);
    }

    #[test]
    fn dynamic_scales_up_under_high_pressure_below_max() {
        assert_eq!(decide_dynamic(2, 0, 5, 20, Some(1.5)), Decision::Scale);
    }

    #[test]
    fn dynamic_holds_at_max_size_even_under_pressure() {
        assert_eq!(decide_dynamic(5, 0, 5, 20, Some(1.5)), Decision::Wait);
    }

    #[test]
    fn dynamic_waits_under_low_pressure() {
        assert_eq!(decide_dynamic(2, 0, 5, 20, Some(0.5)), Decision::Wait);
    }

    #[test]
    fn dynamic_scales_from_zero_with_unknown_pressure_and_pending_tasks() {
        assert_eq!(decide_dynamic(0, 0, 5, 3, None), Decision::Scale);
        assert_eq!(decide_dynamic(0, 0, 5, 0, None), Decision::Wait);
    }

    fn scaler() -> AutoScaler {
        AutoScaler::new(
            Arc::new(Store::in_memory()),
            vec!["true".to_string()],
            AutoScalerPolicy::Fixed,
            1.0,
            60,
            0,
            0,
            1,
            Arc::new(HaltFlag::new()),
        )
    }

    #[tokio::test]
    async fn start_transitions_to_init() {
        let mut s = scaler();
        assert_eq!(s.action().await, AutoScalerState::Init);
    }

    #[tokio::test]
    async fn init_with_zero_size_moves_straight_to_steady_wait() {
        let mut s = scaler();
        s.state = AutoScalerState::Init;
        let next = s.action().await;
        assert_eq!(next, AutoScalerState::Wait);
        assert_eq!(s.phase, AutoScalerPhase::Steady);
    }

    #[tokio::test]
    async fn halt_flag_short_circuits_to_final() {
        let mut s = scaler();
        s.halt.trip();
        let next = s.action().await;
        assert_eq!(next, AutoScalerState::Final);
        assert_eq!(s.finalize(), AutoScalerState::Halt);
    }
}
