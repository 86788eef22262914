//! The canonical state of one check execution and the transitions allowed on it.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::PushError;
use crate::push::StatePusher;
use crate::report::{Report, ResultData, Vulnerability};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    #[default]
    None,
    Running,
    Finished,
    Aborted,
    Failed,
}

impl Status {
    pub fn is_none(&self) -> bool {
        *self == Status::None
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Finished | Status::Aborted | Status::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::None => "",
            Status::Running => "RUNNING",
            Status::Finished => "FINISHED",
            Status::Aborted => "ABORTED",
            Status::Failed => "FAILED",
        }
    }
}

/// What gets pushed to the collector on every transition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckState {
    #[serde(default, skip_serializing_if = "Status::is_none")]
    pub status: Status,
    #[serde(default)]
    pub progress: f32,
    #[serde(default)]
    pub report: Report,
}

impl CheckState {
    pub fn new(report: Report) -> Self {
        Self {
            report,
            ..Default::default()
        }
    }
}

/// Owns the [`CheckState`] of one execution. Every transition pushes a
/// snapshot of the full state before returning.
///
/// Not synchronized: it is driven by one task at a time.
pub struct CheckStateMachine {
    state: CheckState,
    pusher: Box<dyn StatePusher>,
}

impl CheckStateMachine {
    pub fn new(report: Report, pusher: Box<dyn StatePusher>) -> Self {
        Self {
            state: CheckState::new(report),
            pusher,
        }
    }

    pub fn state(&self) -> &CheckState {
        &self.state
    }

    pub fn result_mut(&mut self) -> &mut ResultData {
        &mut self.state.report.result
    }

    async fn push(&self) -> Result<(), PushError> {
        self.pusher.update_state(self.state.clone()).await
    }

    fn set_status(&mut self, status: Status) {
        self.state.status = status;
        self.state.report.status = status.as_str().to_string();
    }

    /// none -> running.
    pub async fn start(&mut self) -> Result<(), PushError> {
        if self.state.status != Status::None {
            log::warn!("[state] start_ignored: status={:?}", self.state.status);
            return Ok(());
        }
        self.set_status(Status::Running);
        self.state.progress = 0.0;
        self.state.report.start_time = Some(Utc::now());
        self.push().await
    }

    /// Raises progress while running. Anything that would not increase it,
    /// or arrives outside running, is ignored.
    pub async fn set_progress(&mut self, progress: f32) -> Result<(), PushError> {
        if self.state.status != Status::Running || !(progress > self.state.progress) {
            log::trace!("[state] progress_ignored: status={:?} current={} requested={}",
                self.state.status, self.state.progress, progress);
            return Ok(());
        }
        self.state.progress = progress.min(1.0);
        self.push().await
    }

    async fn end(&mut self, status: Status) -> Result<(), PushError> {
        if self.state.status != Status::Running {
            log::warn!("[state] transition_ignored: from={:?} to={:?}", self.state.status, status);
            return Ok(());
        }
        self.set_status(status);
        self.state.progress = 1.0;
        self.state.report.end_time = Some(Utc::now());
        self.push().await
    }

    /// running -> finished.
    pub async fn finish(&mut self) -> Result<(), PushError> {
        self.end(Status::Finished).await
    }

    /// running -> aborted.
    pub async fn abort(&mut self) -> Result<(), PushError> {
        self.end(Status::Aborted).await
    }

    /// running -> failed, recording the error in the report.
    pub async fn fail(&mut self, error: &str) -> Result<(), PushError> {
        if self.state.status == Status::Running {
            self.state.report.result.error = error.to_string();
        }
        self.end(Status::Failed).await
    }

    /// Drains the pusher. The state machine accepts no transitions afterwards.
    pub async fn shutdown(&mut self) -> Result<(), PushError> {
        self.pusher.shutdown().await
    }

    pub fn into_state(self) -> CheckState {
        self.state
    }
}

/// What a check body sees of its state: progress reporting and its result.
pub struct CheckHandle<'a> {
    machine: &'a mut CheckStateMachine,
}

impl<'a> CheckHandle<'a> {
    pub fn new(machine: &'a mut CheckStateMachine) -> Self {
        Self { machine }
    }

    pub async fn set_progress(&mut self, progress: f32) -> Result<(), PushError> {
        self.machine.set_progress(progress).await
    }

    pub fn progress(&self) -> f32 {
        self.machine.state().progress
    }

    pub fn result(&self) -> &ResultData {
        &self.machine.state().report.result
    }

    pub fn result_mut(&mut self) -> &mut ResultData {
        self.machine.result_mut()
    }

    pub fn add_vulnerabilities(&mut self, vulns: impl IntoIterator<Item = Vulnerability>) {
        self.machine.result_mut().add_vulnerabilities(vulns);
    }

    pub fn set_data(&mut self, data: serde_json::Value) {
        self.machine.result_mut().data = Some(data);
    }

    pub fn set_notes(&mut self, notes: impl Into<String>) {
        self.machine.result_mut().notes = notes.into();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    /// Records every snapshot it is given.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingPusher {
        pub states: Arc<Mutex<Vec<CheckState>>>,
        pub shutdowns: Arc<Mutex<usize>>,
    }

    #[async_trait]
    impl StatePusher for RecordingPusher {
        async fn update_state(&self, state: CheckState) -> Result<(), PushError> {
            self.states.lock().unwrap().push(state);
            Ok(())
        }

        async fn shutdown(&mut self) -> Result<(), PushError> {
            *self.shutdowns.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn machine() -> (CheckStateMachine, RecordingPusher) {
        let pusher = RecordingPusher::default();
        let report = Report {
            check_id: "check-1".to_string(),
            target: "www.example.com".to_string(),
            ..Default::default()
        };
        (CheckStateMachine::new(report, Box::new(pusher.clone())), pusher)
    }

    fn pushed(pusher: &RecordingPusher) -> Vec<(Status, f32)> {
        pusher.states.lock().unwrap().iter().map(|s| (s.status, s.progress)).collect()
    }

    #[tokio::test]
    async fn test_happy_path_transitions() {
        let (mut sm, pusher) = machine();
        sm.start().await.unwrap();
        sm.set_progress(0.1).await.unwrap();
        sm.finish().await.unwrap();

        assert_eq!(pushed(&pusher), vec![
            (Status::Running, 0.0),
            (Status::Running, 0.1),
            (Status::Finished, 1.0),
        ]);
        let state = sm.state();
        assert_eq!(state.report.status, "FINISHED");
        assert!(state.report.start_time.is_some());
        assert!(state.report.end_time.is_some());
    }

    #[tokio::test]
    async fn test_progress_is_monotonic() {
        let (mut sm, pusher) = machine();
        sm.start().await.unwrap();
        sm.set_progress(0.5).await.unwrap();
        sm.set_progress(0.3).await.unwrap();
        sm.set_progress(0.5).await.unwrap();

        assert_eq!(sm.state().progress, 0.5);
        assert_eq!(pusher.states.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_progress_outside_running_is_ignored() {
        let (mut sm, pusher) = machine();
        sm.set_progress(0.4).await.unwrap();
        assert_eq!(sm.state().progress, 0.0);
        assert!(pusher.states.lock().unwrap().is_empty());

        sm.start().await.unwrap();
        sm.finish().await.unwrap();
        sm.set_progress(0.4).await.unwrap();
        assert_eq!(sm.state().progress, 1.0);
        assert_eq!(pusher.states.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_fail_records_error() {
        let (mut sm, pusher) = machine();
        sm.start().await.unwrap();
        sm.fail("connection refused").await.unwrap();

        let states = pusher.states.lock().unwrap();
        let last = states.last().unwrap();
        assert_eq!(last.status, Status::Failed);
        assert_eq!(last.progress, 1.0);
        assert_eq!(last.report.result.error, "connection refused");
        assert_eq!(last.report.status, "FAILED");
    }

    #[tokio::test]
    async fn test_abort_and_terminal_states() {
        let (mut sm, pusher) = machine();
        sm.start().await.unwrap();
        sm.abort().await.unwrap();
        sm.finish().await.unwrap();

        assert_eq!(pushed(&pusher), vec![(Status::Running, 0.0), (Status::Aborted, 1.0)]);
        assert!(sm.state().status.is_terminal());
        sm.shutdown().await.unwrap();
        assert_eq!(*pusher.shutdowns.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_handle_mutations_show_in_next_snapshot() {
        let (mut sm, pusher) = machine();
        sm.start().await.unwrap();
        {
            let mut handle = CheckHandle::new(&mut sm);
            handle.add_vulnerabilities([Vulnerability::new("open port", 3.0)]);
            handle.set_notes("scanned 1 host");
            assert_eq!(pusher.states.lock().unwrap().len(), 1);
            handle.set_progress(0.5).await.unwrap();
            assert_eq!(handle.progress(), 0.5);
        }

        let states = pusher.states.lock().unwrap();
        assert_eq!(states[1].report.result.vulnerabilities.len(), 1);
        assert_eq!(states[1].report.result.notes, "scanned 1 host");
    }

    #[test]
    fn test_snapshot_json_shape() {
        let state = CheckState {
            status: Status::Running,
            progress: 0.25,
            report: Report { check_id: "abc".to_string(), ..Default::default() },
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["status"], "RUNNING");
        assert_eq!(json["progress"], 0.25);
        assert_eq!(json["report"]["check_id"], "abc");

        let none = serde_json::to_value(CheckState::default()).unwrap();
        assert!(none.get("status").is_none());
    }
}
