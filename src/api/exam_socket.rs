use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use warp::ws::{Message, WebSocket};

use super::AppContext;
use crate::cache::LocalCache;
use crate::error::{PortalError, Result};
use crate::monitor::{
    client_capabilities, spawn_monitor, CapabilityKind, ClientGrants, MonitorHandle,
    MonitorPolicy, MonitorSnapshot, Signal,
};
use crate::portal::{self, ExamTicket, StudentLogin};
use crate::remote::RemoteStore;

/// Messages from the exam-taking surface.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Start {
        #[serde(alias = "nis")]
        student_id: String,
        #[serde(alias = "password")]
        secret: String,
        #[serde(alias = "studentClass")]
        class_label: String,
        #[serde(alias = "pin")]
        access_code: String,
    },

    /// Lockdown notice acknowledged, with what the browser managed to get.
    #[serde(rename_all = "camelCase")]
    Consent {
        fullscreen: bool,
        wake_lock: bool,
        #[serde(default)]
        camera: bool,
    },

    Signal {
        signal: Signal,
    },

    Resume {
        #[serde(default)]
        fullscreen: bool,
    },

    Finish,
}

/// Messages to the exam-taking surface.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    Started { ticket: ExamTicket },

    State { snapshot: MonitorSnapshot },

    /// Give the capability back (exit full-screen, drop the wake lock, stop the camera).
    Release { capability: CapabilityKind },

    Error { message: String },
}

struct Attempt {
    monitor: MonitorHandle,
    forwarder: JoinHandle<()>,
}

struct ExamSocket<R, C> {
    ctx: AppContext<R, C>,
    tx: mpsc::UnboundedSender<Message>,
    grants: Arc<ClientGrants>,
    attempt: Option<Attempt>,
}

pub async fn handle_exam_socket<R: RemoteStore, C: LocalCache>(
    websocket: WebSocket,
    ctx: AppContext<R, C>,
) {
    tracing::info!("Exam WebSocket connection established");

    let (mut ws_sender, mut ws_receiver) = websocket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let sender_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = ws_sender.send(message).await {
                tracing::error!(error = %e, "Failed to send WebSocket message");
                break;
            }
        }
    });

    let mut socket = ExamSocket {
        ctx,
        tx,
        grants: Arc::new(ClientGrants::default()),
        attempt: None,
    };

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(message) if message.is_close() => break,
            Ok(message) => socket.handle_websocket_message(message).await,
            Err(e) => {
                tracing::error!(error = %e, "WebSocket error");
                break;
            }
        }
    }

    socket.cleanup().await;
    sender_task.abort();
    tracing::info!("Exam WebSocket connection closed");
}

impl<R: RemoteStore, C: LocalCache> ExamSocket<R, C> {
    async fn handle_websocket_message(&mut self, message: Message) {
        let Ok(text) = message.to_str() else {
            return;
        };
        tracing::debug!(raw_message = %text, "Received exam message");

        match serde_json::from_str::<ClientMessage>(text) {
            Ok(client_message) => {
                if let Err(e) = self.handle_message(client_message).await {
                    self.send(&ServerMessage::Error {
                        message: e.to_string(),
                    });
                }
            }
            Err(e) => {
                tracing::error!(error = %e, raw_message = %text, "Failed to parse exam message");
                self.send(&ServerMessage::Error {
                    message: format!("Unrecognised message: {}", e),
                });
            }
        }
    }

    async fn handle_message(&mut self, message: ClientMessage) -> Result<()> {
        match message {
            ClientMessage::Start {
                student_id,
                secret,
                class_label,
                access_code,
            } => {
                let login = StudentLogin {
                    student_id,
                    secret,
                    class_label,
                    access_code,
                };
                self.start(login).await
            }
            ClientMessage::Consent {
                fullscreen,
                wake_lock,
                camera,
            } => {
                self.grants.set(CapabilityKind::Fullscreen, fullscreen);
                self.grants.set(CapabilityKind::WakeLock, wake_lock);
                self.grants.set(CapabilityKind::Camera, camera);
                self.monitor()?.consent().await.map(|_| ())
            }
            ClientMessage::Signal { signal } => self.monitor()?.signal(signal).await.map(|_| ()),
            ClientMessage::Resume { fullscreen } => {
                self.grants.set(CapabilityKind::Fullscreen, fullscreen);
                self.monitor()?.resume().await.map(|_| ())
            }
            ClientMessage::Finish => self.monitor()?.finish().await.map(|_| ()),
        }
    }

    async fn start(&mut self, login: StudentLogin) -> Result<()> {
        if self.attempt.is_some() {
            return Err(PortalError::internal("An exam attempt is already running on this connection"));
        }

        let ticket = portal::start_session(&self.ctx.engine, &login).await?;
        let policy = MonitorPolicy::new(&self.ctx.monitor, ticket.session.duration());

        let release_tx = self.tx.clone();
        let capabilities = client_capabilities(
            self.grants.clone(),
            policy.camera_required,
            move |capability| {
                send_message(&release_tx, &ServerMessage::Release { capability });
            },
        );

        let monitor = spawn_monitor(
            ticket.student.id.clone(),
            ticket.session.id.clone(),
            policy,
            capabilities,
            self.ctx.engine.clone(),
        );

        let mut snapshots = monitor.subscribe();
        let state_tx = self.tx.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                let snapshot = snapshots.borrow_and_update().clone();
                send_message(&state_tx, &ServerMessage::State { snapshot });
                if snapshots.changed().await.is_err() {
                    break;
                }
            }
        });

        self.send(&ServerMessage::Started { ticket });
        self.attempt = Some(Attempt { monitor, forwarder });
        Ok(())
    }

    fn monitor(&self) -> Result<&MonitorHandle> {
        self.attempt
            .as_ref()
            .map(|attempt| &attempt.monitor)
            .ok_or_else(|| PortalError::internal("No exam attempt started on this connection"))
    }

    fn send(&self, message: &ServerMessage) {
        send_message(&self.tx, message);
    }

    /// The surface is gone: abandon the attempt so every capability is released.
    async fn cleanup(&mut self) {
        if let Some(attempt) = self.attempt.take() {
            match attempt.monitor.abandon().await {
                Ok(snapshot) => tracing::info!(
                    student_id = %snapshot.student_id,
                    state = ?snapshot.state,
                    "Exam attempt closed with the connection"
                ),
                Err(PortalError::MonitorClosed) => {}
                Err(e) => tracing::warn!(error = %e, "Failed to abandon exam attempt"),
            }
            attempt.monitor.join().await;
            attempt.forwarder.abort();
        }
    }
}

fn send_message(tx: &mpsc::UnboundedSender<Message>, message: &ServerMessage) {
    match serde_json::to_string(message) {
        Ok(json) => {
            if tx.send(Message::text(json)).is_err() {
                tracing::debug!("Exam socket closed, message dropped");
            }
        }
        Err(e) => tracing::error!(error = %e, "Failed to serialize exam message"),
    }
}
