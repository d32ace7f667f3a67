//! Async driver for the session manager
//!
//! One tokio task owns the `SessionManager`. Host requests and engine
//! events are messages into that task and timers are deadlines it sleeps
//! until, so manager state never needs a lock.

use flume::{Receiver, Sender};
use std::time::Instant;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep_until;

use crate::error::ServiceError;
use crate::session::{ResultCallback, SessionEvent, SessionManager, SessionStatus};

enum Request {
    Start {
        target: String,
        on_result: ResultCallback,
        reply: oneshot::Sender<bool>,
    },
    Stop {
        reply: oneshot::Sender<bool>,
    },
    StopAll {
        reply: oneshot::Sender<()>,
    },
    Visibility {
        hidden: bool,
    },
    SetContinuous {
        continuous: bool,
    },
    Subscribe {
        reply: oneshot::Sender<Receiver<SessionEvent>>,
    },
    Status {
        reply: oneshot::Sender<(SessionStatus, Option<String>)>,
    },
    Shutdown,
}

/// Cloneable handle to a running voice service
#[derive(Clone)]
pub struct VoiceHandle {
    tx: Sender<Request>,
}

impl VoiceHandle {
    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> Result<T, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send_async(make(reply))
            .await
            .map_err(|_| ServiceError::Closed)?;
        rx.await.map_err(|_| ServiceError::Closed)
    }

    fn send(&self, request: Request) -> Result<(), ServiceError> {
        self.tx.send(request).map_err(|_| ServiceError::Closed)
    }

    pub async fn start_listening(
        &self,
        target: &str,
        on_result: ResultCallback,
    ) -> Result<bool, ServiceError> {
        let target = target.to_string();
        self.call(|reply| Request::Start {
            target,
            on_result,
            reply,
        })
        .await
    }

    pub async fn stop_listening(&self) -> Result<bool, ServiceError> {
        self.call(|reply| Request::Stop { reply }).await
    }

    pub async fn stop_all(&self) -> Result<(), ServiceError> {
        self.call(|reply| Request::StopAll { reply }).await
    }

    pub fn set_visibility(&self, hidden: bool) -> Result<(), ServiceError> {
        self.send(Request::Visibility { hidden })
    }

    pub fn set_continuous(&self, continuous: bool) -> Result<(), ServiceError> {
        self.send(Request::SetContinuous { continuous })
    }

    pub async fn subscribe(&self) -> Result<Receiver<SessionEvent>, ServiceError> {
        self.call(|reply| Request::Subscribe { reply }).await
    }

    /// Current status and active target
    pub async fn status(&self) -> Result<(SessionStatus, Option<String>), ServiceError> {
        self.call(|reply| Request::Status { reply }).await
    }

    /// Unload: release everything and end the service task. Safe to call
    /// from a signal handler thread.
    pub fn unload(&self) -> Result<(), ServiceError> {
        self.send(Request::Shutdown)
    }
}

/// Spawn the service task on the current tokio runtime
pub fn spawn(manager: SessionManager) -> (VoiceHandle, JoinHandle<()>) {
    let (tx, rx) = flume::unbounded();
    let task = tokio::spawn(run(manager, rx));
    (VoiceHandle { tx }, task)
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

async fn run(mut manager: SessionManager, requests: Receiver<Request>) {
    let engine_events = manager.engine_events();
    log::debug!("[service] started");

    loop {
        let deadline = manager.next_deadline();
        tokio::select! {
            request = requests.recv_async() => match request {
                Ok(Request::Shutdown) | Err(_) => {
                    manager.on_unload();
                    break;
                }
                Ok(request) => handle_request(&mut manager, request),
            },
            Ok(msg) = engine_events.recv_async() => manager.handle_message(msg),
            _ = sleep_until_deadline(deadline) => {
                manager.poll_timers();
            }
        }
    }

    log::debug!("[service] stopped");
}

fn handle_request(manager: &mut SessionManager, request: Request) {
    match request {
        Request::Start {
            target,
            on_result,
            reply,
        } => {
            let _ = reply.send(manager.start_listening(&target, on_result));
        }
        Request::Stop { reply } => {
            let _ = reply.send(manager.stop_listening());
        }
        Request::StopAll { reply } => {
            manager.stop_all();
            let _ = reply.send(());
        }
        Request::Visibility { hidden } => manager.on_visibility_change(hidden),
        Request::SetContinuous { continuous } => manager.set_continuous(continuous),
        Request::Subscribe { reply } => {
            let _ = reply.send(manager.subscribe());
        }
        Request::Status { reply } => {
            let target = manager.active_target().map(str::to_string);
            let _ = reply.send((manager.status(), target));
        }
        Request::Shutdown => manager.on_unload(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::config::RecognitionConfig;
    use crate::engine::RecognitionErrorKind;
    use crate::feedback::RecordingFeedback;
    use crate::sim::{SimController, SimEngineFactory};
    use std::sync::Arc;
    use std::time::Duration;

    fn service(config: RecognitionConfig) -> (VoiceHandle, JoinHandle<()>, SimController) {
        let (factory, controller) = SimEngineFactory::new();
        let manager = SessionManager::new(
            config,
            Box::new(factory),
            Arc::new(RecordingFeedback::new()),
            Arc::new(TokioClock),
        );
        let (handle, task) = spawn(manager);
        (handle, task, controller)
    }

    fn collecting_callback() -> (ResultCallback, Receiver<String>) {
        let (tx, rx) = flume::unbounded();
        let callback: ResultCallback = Box::new(move |text: &str| tx.send(text.to_string()).is_ok());
        (callback, rx)
    }

    #[tokio::test]
    async fn test_final_result_reaches_callback() {
        let (handle, _task, controller) = service(RecognitionConfig::default());
        let (callback, results) = collecting_callback();

        assert!(handle.start_listening("step-1", callback).await.unwrap());
        assert!(controller.say("rinse the beaker"));

        let text = tokio::time::timeout(Duration::from_secs(1), results.recv_async())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(text, "rinse the beaker");
    }

    #[tokio::test]
    async fn test_subscribers_see_status_changes() {
        let (handle, _task, _controller) = service(RecognitionConfig::default());
        let events = handle.subscribe().await.unwrap();
        let (callback, _results) = collecting_callback();

        handle.start_listening("title", callback).await.unwrap();
        let first = tokio::time::timeout(Duration::from_secs(1), events.recv_async())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            first,
            SessionEvent::Status {
                status: SessionStatus::Listening,
                target: Some("title".to_string()),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_timer_stops_session() {
        let (handle, _task, controller) = service(RecognitionConfig::default());
        let (callback, _results) = collecting_callback();
        handle.start_listening("step-1", callback).await.unwrap();
        assert!(controller.is_running());

        tokio::time::sleep(Duration::from_millis(10_001)).await;

        let (status, target) = handle.status().await.unwrap();
        assert_eq!(status, SessionStatus::Idle);
        assert_eq!(target, None);
        assert!(!controller.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_restarts_engine_after_delay() {
        let config = RecognitionConfig {
            retry_jitter_ms: 0,
            ..RecognitionConfig::default()
        };
        let (handle, _task, controller) = service(config);
        let (callback, _results) = collecting_callback();
        handle.start_listening("step-1", callback).await.unwrap();

        controller.fail(RecognitionErrorKind::NoSpeech);
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(controller.starts(), 1);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(controller.starts(), 2);
        assert!(controller.is_running());
        let (_, target) = handle.status().await.unwrap();
        assert_eq!(target.as_deref(), Some("step-1"));
    }

    #[tokio::test]
    async fn test_unload_releases_and_closes() {
        let (handle, task, controller) = service(RecognitionConfig::default());
        let (callback, _results) = collecting_callback();
        handle.start_listening("step-1", callback).await.unwrap();

        handle.unload().unwrap();
        task.await.unwrap();

        assert!(!controller.is_running());
        assert!(controller.aborts() >= 1);
        assert_eq!(handle.status().await, Err(ServiceError::Closed));
    }

    #[tokio::test]
    async fn test_hidden_stops_listening() {
        let (handle, _task, controller) = service(RecognitionConfig::default());
        let (callback, _results) = collecting_callback();
        handle.start_listening("step-1", callback).await.unwrap();

        handle.set_visibility(true).unwrap();
        let (status, _) = handle.status().await.unwrap();
        assert_eq!(status, SessionStatus::Idle);
        assert!(!controller.is_running());
    }
}
