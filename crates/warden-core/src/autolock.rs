//! Auto-lock monitor
//!
//! Lifecycle signals and activity pings are queued on one channel and handled
//! in arrival order by a single task, which also owns the inactivity deadline.
//! When a deadline passes, or the app is backgrounded, the task calls back
//! into the session through [`LockTarget`].
//!
//! The task holds only a weak reference to its target, so dropping the
//! session ends the task.

use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

/// App lifecycle signal from the platform
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppLifecycle {
    Active,
    /// Transitional (e.g. app switcher, incoming call overlay)
    Inactive,
    Background,
}

/// Why the monitor locked the session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockReason {
    /// No activity within the auto-lock duration
    Inactivity,
    /// The app went to the background
    Background,
    /// Returned to the foreground after the auto-lock duration had elapsed
    ExpiredWhileAway,
}

/// Something the monitor can lock
#[async_trait]
pub trait LockTarget: Send + Sync {
    /// Lock if still in the authentication epoch the monitor was armed for
    async fn auto_lock(&self, reason: LockReason, epoch: u64);
}

/// Timing knobs for the monitor
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AutoLockPolicy {
    /// Time allowed in the background before locking (zero = immediate)
    pub background_grace: Duration,
    /// Minimum spacing between activity pings that reset the timer
    pub activity_debounce: Duration,
}

enum Command {
    Start { duration: Duration, epoch: u64 },
    Stop,
    Activity,
    Lifecycle(AppLifecycle, oneshot::Sender<()>),
    SetDuration(Duration),
    Settle(oneshot::Sender<()>),
}

/// Handle to the monitor task
pub struct AutoLockMonitor {
    tx: mpsc::UnboundedSender<Command>,
}

impl AutoLockMonitor {
    /// Spawn the monitor task on the current Tokio runtime
    pub fn spawn(target: Weak<dyn LockTarget>, policy: AutoLockPolicy) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = MonitorTask {
            target,
            policy,
            armed: None,
            duration: Duration::ZERO,
            lifecycle: AppLifecycle::Active,
            last_activity: Instant::now(),
            deadline: None,
        };
        tokio::spawn(task.run(rx));
        Self { tx }
    }

    /// Arm the inactivity timer for a newly authenticated session
    pub fn start(&self, duration: Duration, epoch: u64) {
        self.send(Command::Start { duration, epoch });
    }

    /// Disarm (the session locked)
    pub fn stop(&self) {
        self.send(Command::Stop);
    }

    /// User interaction ping
    pub fn activity(&self) {
        self.send(Command::Activity);
    }

    /// Deliver a lifecycle signal and wait until it has been handled
    pub async fn lifecycle(&self, signal: AppLifecycle) {
        let (ack, done) = oneshot::channel();
        self.send(Command::Lifecycle(signal, ack));
        let _ = done.await;
    }

    /// Change the auto-lock duration, retiming a running timer
    pub fn set_duration(&self, duration: Duration) {
        self.send(Command::SetDuration(duration));
    }

    /// Wait until every previously queued command has been handled
    pub async fn settle(&self) {
        let (ack, done) = oneshot::channel();
        self.send(Command::Settle(ack));
        let _ = done.await;
    }

    fn send(&self, command: Command) {
        if self.tx.send(command).is_err() {
            debug!("Auto-lock monitor has stopped");
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Deadline {
    at: Instant,
    reason: LockReason,
}

struct MonitorTask {
    target: Weak<dyn LockTarget>,
    policy: AutoLockPolicy,
    /// Epoch of the authenticated session being watched
    armed: Option<u64>,
    duration: Duration,
    lifecycle: AppLifecycle,
    last_activity: Instant,
    deadline: Option<Deadline>,
}

impl MonitorTask {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        loop {
            let deadline = self.deadline;
            let expired = async move {
                match deadline {
                    Some(deadline) => {
                        sleep_until(deadline.at).await;
                        deadline.reason
                    }
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;

                reason = expired => self.fire(reason).await,
                command = rx.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
            }
        }

        debug!("Auto-lock monitor stopped");
    }

    async fn handle(&mut self, command: Command) {
        let now = Instant::now();

        match command {
            Command::Start { duration, epoch } => {
                self.armed = Some(epoch);
                self.duration = duration;
                self.last_activity = now;
                self.deadline = Some(Deadline {
                    at: now + duration,
                    reason: LockReason::Inactivity,
                });
                debug!("Auto-lock armed for {:?}", duration);
            }
            Command::Stop => self.disarm(),
            Command::Activity => {
                if self.armed.is_none() || self.lifecycle == AppLifecycle::Background {
                    return;
                }
                if now.duration_since(self.last_activity) < self.policy.activity_debounce {
                    return;
                }
                self.last_activity = now;
                self.deadline = Some(Deadline {
                    at: now + self.duration,
                    reason: LockReason::Inactivity,
                });
            }
            Command::Lifecycle(signal, ack) => {
                self.on_lifecycle(signal, now).await;
                let _ = ack.send(());
            }
            Command::SetDuration(duration) => {
                self.duration = duration;
                if self.armed.is_some() && self.lifecycle != AppLifecycle::Background {
                    let at = self.last_activity + duration;
                    if at <= now {
                        self.fire(LockReason::Inactivity).await;
                    } else {
                        self.deadline = Some(Deadline {
                            at,
                            reason: LockReason::Inactivity,
                        });
                    }
                }
            }
            Command::Settle(ack) => {
                let _ = ack.send(());
            }
        }
    }

    async fn on_lifecycle(&mut self, signal: AppLifecycle, now: Instant) {
        let previous = std::mem::replace(&mut self.lifecycle, signal);
        if self.armed.is_none() || previous == signal {
            return;
        }

        match signal {
            AppLifecycle::Background => {
                if self.policy.background_grace.is_zero() {
                    self.fire(LockReason::Background).await;
                } else {
                    let at = now + self.policy.background_grace;
                    let sooner = self.deadline.map_or(true, |d| at < d.at);
                    if sooner {
                        self.deadline = Some(Deadline {
                            at,
                            reason: LockReason::Background,
                        });
                    }
                }
            }
            AppLifecycle::Active => {
                let elapsed = now.duration_since(self.last_activity);
                if elapsed > self.duration {
                    self.fire(LockReason::ExpiredWhileAway).await;
                } else {
                    self.deadline = Some(Deadline {
                        at: now + (self.duration - elapsed),
                        reason: LockReason::Inactivity,
                    });
                }
            }
            AppLifecycle::Inactive => {}
        }
    }

    async fn fire(&mut self, reason: LockReason) {
        let Some(epoch) = self.armed else {
            self.deadline = None;
            return;
        };
        self.disarm();

        info!("Auto-lock triggered: {:?}", reason);
        if let Some(target) = self.target.upgrade() {
            target.auto_lock(reason, epoch).await;
        }
    }

    fn disarm(&mut self) {
        self.armed = None;
        self.deadline = None;
    }
}
