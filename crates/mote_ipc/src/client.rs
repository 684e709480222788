use std::sync::Arc;

use tokio::{
    io::{split, AsyncWriteExt, WriteHalf},
    sync::Mutex,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    codec::{encode_frame, read_frame},
    message::{IpcMessage, MessageKind, RegisterPayload, Role},
    transport::{self, ClientStream},
    IpcError,
};

/// Helper-side connection to the broker.
///
/// Connects, registers the given role with this process's pid, answers
/// broker heartbeats, and hands every other inbound message to the
/// supplied handler.
pub struct BrokerClient {
    role: Role,
    writer: Arc<Mutex<WriteHalf<ClientStream>>>,
    shutdown: CancellationToken,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl BrokerClient {
    pub async fn connect(
        endpoint: &str,
        role: Role,
        handler: impl Fn(IpcMessage) + Send + Sync + 'static,
    ) -> Result<Self, IpcError> {
        let stream = transport::connect(endpoint).await?;
        let (mut reader, writer) = split(stream);
        let writer = Arc::new(Mutex::new(writer));

        let register = IpcMessage::to(MessageKind::Register, role, Role::Main).with_payload(
            &RegisterPayload {
                role,
                pid: std::process::id(),
            },
        )?;
        let frame = encode_frame(&register)?;
        writer
            .lock()
            .await
            .write_all(&frame)
            .await
            .map_err(IpcError::Write)?;

        let shutdown = CancellationToken::new();
        let reader_shutdown = shutdown.clone();
        let reader_writer = writer.clone();
        let handler: Arc<dyn Fn(IpcMessage) + Send + Sync> = Arc::new(handler);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reader_shutdown.cancelled() => break,
                    result = read_frame(&mut reader) => match result {
                        Ok(message) if message.kind == MessageKind::Ping => {
                            let pong = IpcMessage::to(MessageKind::Pong, role, Role::Main)
                                .in_reply_to(message.id.clone());
                            match encode_frame(&pong) {
                                Ok(frame) => {
                                    let mut writer = reader_writer.lock().await;
                                    if writer.write_all(&frame).await.is_err() {
                                        break;
                                    }
                                }
                                Err(error) => {
                                    warn!(error = %error, "failed to encode pong");
                                }
                            }
                        }
                        Ok(message) => handler(message),
                        Err(error) => {
                            debug!(error = %error, "broker connection closed");
                            break;
                        }
                    }
                }
            }
        });

        Ok(Self {
            role,
            writer,
            shutdown,
            reader_task: Mutex::new(Some(task)),
        })
    }

    /// The role this client registered as.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Writes one framed message to the broker.
    pub async fn send(&self, message: &IpcMessage) -> Result<(), IpcError> {
        let frame = encode_frame(message)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await.map_err(IpcError::Write)
    }

    /// Stops the read loop and shuts the connection down.
    pub async fn close(&self) {
        self.shutdown.cancel();
        if let Some(task) = self.reader_task.lock().await.take() {
            task.abort();
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

impl Drop for BrokerClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Ok(mut guard) = self.reader_task.try_lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
    }
}
