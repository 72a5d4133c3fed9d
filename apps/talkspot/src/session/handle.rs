//! Runs a [`NegotiationController`] on its own task and exposes it through a
//! cloneable command handle.

use std::collections::VecDeque;
use std::future::Future;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::controller::{NegotiationController, SessionInput};
use super::observers::CallWatch;
use super::CallStatus;
use crate::error::CallError;
use crate::transport::IceConnectionState;

#[derive(Debug)]
enum Command {
    Join {
        room: String,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Hangup {
        done: oneshot::Sender<()>,
    },
    Logout {
        done: oneshot::Sender<()>,
    },
    SetAudio(bool),
    SetVideo(bool),
    Shutdown,
}

impl Command {
    /// Commands that abandon whatever step is in flight.
    fn preempts(&self) -> bool {
        matches!(
            self,
            Command::Join { .. } | Command::Hangup { .. } | Command::Logout { .. } | Command::Shutdown
        )
    }
}

enum Step<T> {
    Done(T),
    Preempted(Command),
}

#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::Sender<Command>,
    watch: CallWatch,
}

impl CallHandle {
    /// Join `room`. Resolves once presence is announced, or with the failure
    /// that moved the call to `Error`.
    pub async fn join(&self, room: &str) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Join {
            room: room.to_string(),
            reply,
        })
        .await?;
        rx.await.unwrap_or(Err(CallError::Cancelled))
    }

    pub async fn hangup(&self) -> Result<(), CallError> {
        let (done, rx) = oneshot::channel();
        self.send(Command::Hangup { done }).await?;
        rx.await.map_err(|_| CallError::ControllerGone)
    }

    pub async fn logout(&self) -> Result<(), CallError> {
        let (done, rx) = oneshot::channel();
        self.send(Command::Logout { done }).await?;
        rx.await.map_err(|_| CallError::ControllerGone)
    }

    pub async fn set_audio_enabled(&self, enabled: bool) -> Result<(), CallError> {
        self.send(Command::SetAudio(enabled)).await
    }

    pub async fn set_video_enabled(&self, enabled: bool) -> Result<(), CallError> {
        self.send(Command::SetVideo(enabled)).await
    }

    /// Hang up and stop the controller task.
    pub async fn shutdown(&self) -> Result<(), CallError> {
        self.send(Command::Shutdown).await
    }

    pub fn status(&self) -> CallStatus {
        *self.watch.status().borrow()
    }

    pub fn ice_state(&self) -> IceConnectionState {
        *self.watch.ice_state().borrow()
    }

    pub fn watch(&self) -> &CallWatch {
        &self.watch
    }

    pub async fn wait_for_status(&self, target: CallStatus) -> Result<(), CallError> {
        let mut status = self.watch.status();
        status
            .wait_for(|current| *current == target)
            .await
            .map(|_| ())
            .map_err(|_| CallError::ControllerGone)
    }

    async fn send(&self, command: Command) -> Result<(), CallError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| CallError::ControllerGone)
    }
}

/// Start the controller loop. The task ends after `shutdown` or once every
/// handle has been dropped.
pub fn spawn(controller: NegotiationController) -> (CallHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(controller.config().command_buffer);
    let handle = CallHandle {
        commands: tx,
        watch: controller.watch(),
    };
    let task = tokio::spawn(run(controller, rx));
    (handle, task)
}

enum Wake {
    Command(Option<Command>),
    Input(SessionInput),
}

async fn run(mut controller: NegotiationController, mut commands: mpsc::Receiver<Command>) {
    let mut backlog = VecDeque::new();
    loop {
        let wake = match backlog.pop_front() {
            Some(command) => Wake::Command(Some(command)),
            None => tokio::select! {
                command = commands.recv() => Wake::Command(command),
                input = controller.next_input() => Wake::Input(input),
            },
        };

        match wake {
            Wake::Input(input) => {
                let step = controller.handle_input(input);
                if let Step::Preempted(command) = preemptible(step, &mut commands, &mut backlog).await {
                    debug!(target: "talkspot::controller", "in-flight step preempted");
                    backlog.push_front(command);
                }
            }
            Wake::Command(None) => {
                controller.hangup().await;
                break;
            }
            Wake::Command(Some(command)) => {
                if !execute(&mut controller, command, &mut commands, &mut backlog).await {
                    break;
                }
            }
        }
    }
    info!(target: "talkspot::controller", "call controller stopped");
}

/// Returns false when the loop should stop.
async fn execute(
    controller: &mut NegotiationController,
    command: Command,
    commands: &mut mpsc::Receiver<Command>,
    backlog: &mut VecDeque<Command>,
) -> bool {
    match command {
        Command::Join { room, reply } => {
            match preemptible(controller.join_room(&room), commands, backlog).await {
                Step::Done(result) => {
                    let _ = reply.send(result);
                }
                Step::Preempted(next) => {
                    debug!(target: "talkspot::controller", %room, "join preempted");
                    // dropping `reply` resolves the caller with Cancelled
                    backlog.push_front(next);
                }
            }
        }
        Command::Hangup { done } => {
            controller.hangup().await;
            let _ = done.send(());
        }
        Command::Logout { done } => {
            controller.logout().await;
            let _ = done.send(());
        }
        Command::SetAudio(enabled) => controller.set_audio_enabled(enabled),
        Command::SetVideo(enabled) => controller.set_video_enabled(enabled),
        Command::Shutdown => {
            controller.hangup().await;
            return false;
        }
    }
    true
}

/// Drive `step` to completion unless a preempting command arrives first.
/// Other commands are queued for after the step.
async fn preemptible<F: Future>(
    step: F,
    commands: &mut mpsc::Receiver<Command>,
    backlog: &mut VecDeque<Command>,
) -> Step<F::Output> {
    tokio::pin!(step);
    loop {
        tokio::select! {
            biased;
            output = &mut step => return Step::Done(output),
            command = commands.recv() => match command {
                Some(command) if command.preempts() => return Step::Preempted(command),
                Some(command) => backlog.push_back(command),
                None => return Step::Preempted(Command::Shutdown),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use signal_bus::LocalBus;

    use super::*;
    use crate::config::CallConfig;
    use crate::media::{MediaError, MediaRequest, MediaSource, MediaStreamHandle};
    use crate::profile::{StaticProfile, UserProfile};
    use crate::signaling::SignalingChannel;
    use crate::transport::mock::MockAdapterFactory;

    /// Capture that never completes, like a permission prompt left open.
    struct PendingPrompt;

    #[async_trait]
    impl MediaSource for PendingPrompt {
        async fn acquire(&self, _request: MediaRequest) -> Result<MediaStreamHandle, MediaError> {
            std::future::pending().await
        }
    }

    fn controller(bus: Arc<LocalBus>, media: Arc<dyn MediaSource>) -> NegotiationController {
        NegotiationController::new(
            CallConfig::offline(),
            SignalingChannel::new(bus, "talkspot"),
            media,
            Arc::new(MockAdapterFactory::new("ada")),
            Arc::new(StaticProfile::new(UserProfile::new("Ada", "ada").expect("profile"))),
        )
    }

    #[tokio::test]
    async fn hangup_preempts_pending_join() {
        let bus = Arc::new(LocalBus::new());
        let (handle, task) = spawn(controller(bus.clone(), Arc::new(PendingPrompt)));

        let joiner = handle.clone();
        let join = tokio::spawn(async move { joiner.join("room1").await });
        handle
            .wait_for_status(CallStatus::Connecting)
            .await
            .expect("connecting");

        handle.hangup().await.expect("hangup");
        assert_eq!(handle.status(), CallStatus::Idle);
        assert!(matches!(
            join.await.expect("join task"),
            Err(CallError::Cancelled)
        ));

        handle.shutdown().await.expect("shutdown");
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("task ends")
            .expect("task");
    }

    #[tokio::test]
    async fn toggles_queue_behind_pending_join() {
        let bus = Arc::new(LocalBus::new());
        let (handle, _task) = spawn(controller(bus, Arc::new(PendingPrompt)));
        let joiner = handle.clone();
        let _join = tokio::spawn(async move { joiner.join("room1").await });
        handle
            .wait_for_status(CallStatus::Connecting)
            .await
            .expect("connecting");

        handle.set_audio_enabled(false).await.expect("queued");
        tokio::time::sleep(Duration::from_millis(20)).await;
        // the join is still pending, so the toggle has not been applied
        assert!(handle.watch().toggles().borrow().audio);
        assert_eq!(handle.status(), CallStatus::Connecting);

        handle.logout().await.expect("logout");
        assert_eq!(handle.status(), CallStatus::Idle);
        handle
            .wait_for_status(CallStatus::Idle)
            .await
            .expect("idle");
    }
}
