//! The lifecycle of one check execution.
//!
//! A [`Check`] validates the target, runs a [`Checker`] under a cancellable
//! context, drives the state machine through its transitions and flushes
//! every snapshot to the collector before returning.

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::abort::{AbortCoordinator, AbortNotifier};
use crate::collector::TestCollector;
use crate::config::{CommMode, Config};
use crate::error::{CheckError, PushError};
use crate::push::{PushTransport, StatePusher};
use crate::report::Report;
use crate::state::{CheckHandle, CheckState, CheckStateMachine};
use crate::target::{Target, TargetClassifier};

/// A concrete scanning routine.
#[async_trait]
pub trait Checker: Send + Sync {
    /// Scans `target`. Must return promptly once `cancel` fires, with an error
    /// wrapping [`CheckError::Canceled`].
    async fn run(
        &self,
        cancel: CancellationToken,
        target: &str,
        options: &str,
        handle: &mut CheckHandle<'_>,
    ) -> eyre::Result<()>;

    /// Runs once after `run` returned, whatever the outcome. `cancel` is a
    /// fresh token that an abort of the check does not fire.
    async fn clean_up(&self, _cancel: CancellationToken, _target: &str, _options: &str) {}
}

/// Future returned by the run closure of a [`CheckerFn`].
pub type CheckFuture<'a> = BoxFuture<'a, eyre::Result<()>>;

type RunFn = dyn for<'a, 'b> Fn(CancellationToken, &'a str, &'a str, &'a mut CheckHandle<'b>) -> CheckFuture<'a>
    + Send
    + Sync;
type CleanUpFn = dyn for<'a> Fn(CancellationToken, &'a str, &'a str) -> BoxFuture<'a, ()> + Send + Sync;

/// A [`Checker`] made of closures, for checks that need no state of their own.
///
/// ```ignore
/// let checker = CheckerFn::new(|_cancel, target, _options, handle| {
///     Box::pin(async move {
///         handle.set_notes(format!("scanned {}", target));
///         Ok::<(), eyre::Report>(())
///     })
/// });
/// ```
pub struct CheckerFn {
    run: Box<RunFn>,
    clean_up: Option<Box<CleanUpFn>>,
}

impl CheckerFn {
    pub fn new<R>(run: R) -> Self
    where
        R: for<'a, 'b> Fn(CancellationToken, &'a str, &'a str, &'a mut CheckHandle<'b>) -> CheckFuture<'a>
            + Send
            + Sync
            + 'static,
    {
        Self { run: Box::new(run), clean_up: None }
    }

    pub fn with_clean_up<C>(mut self, clean_up: C) -> Self
    where
        C: for<'a> Fn(CancellationToken, &'a str, &'a str) -> BoxFuture<'a, ()> + Send + Sync + 'static,
    {
        self.clean_up = Some(Box::new(clean_up));
        self
    }
}

#[async_trait]
impl Checker for CheckerFn {
    async fn run(
        &self,
        cancel: CancellationToken,
        target: &str,
        options: &str,
        handle: &mut CheckHandle<'_>,
    ) -> eyre::Result<()> {
        (self.run)(cancel, target, options, handle).await
    }

    async fn clean_up(&self, cancel: CancellationToken, target: &str, options: &str) {
        if let Some(clean_up) = &self.clean_up {
            clean_up(cancel, target, options).await;
        }
    }
}

/// One execution of a [`Checker`] in push mode.
pub struct Check {
    name: String,
    checker: Arc<dyn Checker>,
    config: Config,
    classifier: TargetClassifier,
    pusher: Option<Box<dyn StatePusher>>,
    cancel: CancellationToken,
    coordinator: AbortCoordinator,
}

impl Check {
    pub fn new(name: impl Into<String>, checker: Arc<dyn Checker>, mut config: Config) -> Self {
        let name = name.into();
        if config.check.checktype_name.is_empty() {
            config.check.checktype_name = name.clone();
        }
        let cancel = CancellationToken::new();
        Self {
            name,
            checker,
            config,
            classifier: TargetClassifier::system(),
            pusher: None,
            coordinator: AbortCoordinator::new(cancel.clone()),
            cancel,
        }
    }

    /// Replaces the HTTP transport built from the push configuration.
    pub fn with_pusher(mut self, pusher: Box<dyn StatePusher>) -> Self {
        self.pusher = Some(pusher);
        self
    }

    pub fn with_classifier(mut self, classifier: TargetClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn abort_notifier(&self) -> AbortNotifier {
        self.coordinator.notifier()
    }

    /// Runs the check to a terminal state and returns the final snapshot once
    /// the collector has been sent every transition.
    ///
    /// An error means the lifecycle itself broke down, most notably when a
    /// snapshot could not be delivered.
    pub async fn run_and_serve(self) -> Result<CheckState, CheckError> {
        let Check { name, checker, config, classifier, pusher, cancel, mut coordinator } = self;
        if config.comm_mode == CommMode::Pull {
            return Err(CheckError::Config("pull communication mode is not supported".to_string()));
        }

        let pusher = match pusher {
            Some(pusher) => pusher,
            None => Box::new(PushTransport::new(&config.push, &config.check.check_id, cancel.clone())?),
        };
        let mut sm = CheckStateMachine::new(Report::from_config(&config.check), pusher);

        log::info!("[check] starting: name={} check_id={} target={} kind={}", name, config.check.check_id,
            config.check.target, Target::new(config.check.target.as_str()).kind().as_str());
        coordinator.run()?;

        let outcome = match sm.start().await {
            Ok(()) => {
                let body = Body {
                    checker,
                    classifier,
                    gate: !config.allows_private_ips(),
                    cancel: cancel.clone(),
                    target: config.check.target.clone(),
                    options: config.check.options.clone(),
                };
                match tokio::spawn(body.execute(sm)).await {
                    Ok((machine, pushed)) => {
                        sm = machine;
                        pushed
                    }
                    Err(e) => {
                        coordinator.shutdown().await;
                        return Err(CheckError::Join(e.to_string()));
                    }
                }
            }
            Err(e) => Err(e),
        };

        // a failed delivery also shows up here, draining reports it first
        let drained = sm.shutdown().await;
        coordinator.shutdown().await;

        drained?;
        outcome?;
        let state = sm.into_state();
        log::info!("[check] finished: name={} status={:?} aborted={}", name, state.status, cancel.is_cancelled());
        Ok(state)
    }
}

/// Everything the check body task owns.
struct Body {
    checker: Arc<dyn Checker>,
    classifier: TargetClassifier,
    gate: bool,
    cancel: CancellationToken,
    target: String,
    options: String,
}

impl Body {
    async fn execute(self, mut sm: CheckStateMachine) -> (CheckStateMachine, Result<(), PushError>) {
        if self.gate && !self.classifier.is_scannable(&self.target).await {
            log::warn!("[check] not_scannable: target={}", self.target);
            let pushed = sm.fail(&CheckError::NotScannable.to_string()).await;
            return (sm, pushed);
        }

        let result = {
            let mut handle = CheckHandle::new(&mut sm);
            let run = self.checker.run(self.cancel.clone(), &self.target, &self.options, &mut handle);
            match AssertUnwindSafe(run).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(eyre::eyre!("check panicked: {}", panic_message(&*panic))),
            }
        };
        log::debug!("[check] clean_up: target={}", self.target);
        let clean_up = self.checker.clean_up(CancellationToken::new(), &self.target, &self.options);
        if let Err(panic) = AssertUnwindSafe(clean_up).catch_unwind().await {
            log::error!("[check] clean_up panicked: target={} error={}", self.target, panic_message(&*panic));
        }

        let pushed = match result {
            Ok(()) => sm.finish().await,
            Err(e) if CheckError::is_cancellation(&e) => {
                log::warn!("[check] aborted: target={}", self.target);
                sm.abort().await
            }
            Err(e) => {
                log::error!("[check] failed: target={} error={:#}", self.target, e);
                sm.fail(&format!("{:#}", e)).await
            }
        };
        (sm, pushed)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs the check against an embedded collector instead of a remote one and
/// returns the last snapshot the collector received.
pub async fn run_with_test_collector(
    name: &str,
    checker: Arc<dyn Checker>,
    mut config: Config,
) -> Result<CheckState, CheckError> {
    if config.check.check_id.is_empty() {
        config.check.check_id = format!("test-{}", Utc::now().timestamp_millis());
    }
    if config.allow_private_ips.is_none() {
        config.allow_private_ips = Some(true);
    }
    config.comm_mode = CommMode::Push;

    let collector = TestCollector::start(&config.check.check_id).await.map_err(CheckError::Collector)?;
    config.push.agent_addr = collector.addr();

    let result = Check::new(name, checker, config).run_and_serve().await;
    let received = collector.stop().await;
    for (i, state) in received.iter().enumerate() {
        log::info!("[check] collected: n={} status={:?} progress={}", i, state.status, state.progress);
    }

    let state = result?;
    Ok(received.into_iter().last().unwrap_or(state))
}
