use std::{path::PathBuf, sync::Arc, time::Duration};

use tracing::{debug, warn};

use mote_ipc::{
    decode_action, decode_error, decode_notification, decode_register, decode_status_update,
    ActionKind, ActionPayload, Broker, IpcMessage, MessageKind, NotificationPayload, Role,
    ServiceStatus, StatusUpdatePayload,
};

use crate::{
    supervisor::{ProcessConfig, Supervisor},
    RuntimeError,
};

const HELPER_START_TIMEOUT: Duration = Duration::from_secs(10);
const HELPER_RESTART_DELAY: Duration = Duration::from_secs(2);
const TRAY_MAX_RESTARTS: u32 = 3;
const BUBBLE_MAX_RESTARTS: u32 = 0;

type Callback = Arc<dyn Fn() + Send + Sync>;

/// Host-supplied callbacks, all optional.
///
/// Callbacks run on the broker dispatch path and must not block; hand off
/// to a channel or spawn if the host needs to do real work.
#[derive(Clone, Default)]
pub struct BridgeCallbacks {
    pub on_tray_ready: Option<Callback>,
    pub on_bubble_ready: Option<Callback>,
    pub on_notification: Option<Arc<dyn Fn(String, String) + Send + Sync>>,
    pub on_show_bubble: Option<Arc<dyn Fn(Option<String>) + Send + Sync>>,
    pub on_service_status: Option<Arc<dyn Fn(bool) + Send + Sync>>,
    pub on_show_window: Option<Callback>,
    pub on_hide_window: Option<Callback>,
    pub on_restart_service: Option<Callback>,
    pub on_quit: Option<Callback>,
    pub on_error: Option<Arc<dyn Fn(String) + Send + Sync>>,
}

/// Façade over the broker and supervisor.
///
/// The GUI host instantiates one bridge, starts it, and drives helpers
/// through the higher-level operations here instead of raw IPC messages.
pub struct Bridge {
    broker: Arc<Broker>,
    supervisor: Arc<Supervisor>,
    on_error: Option<Arc<dyn Fn(String) + Send + Sync>>,
}

impl Bridge {
    /// Builds the bridge, wiring the callbacks into broker handlers.
    pub async fn new(endpoint: impl Into<String>, callbacks: BridgeCallbacks) -> Arc<Self> {
        let broker = Arc::new(Broker::new(endpoint));
        let supervisor = Supervisor::new(broker.clone()).await;
        let bridge = Arc::new(Self {
            broker,
            supervisor,
            on_error: callbacks.on_error.clone(),
        });
        bridge.install_handlers(callbacks).await;
        bridge
    }

    /// The broker this bridge owns.
    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// The supervisor this bridge owns.
    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Starts the IPC listener.
    pub async fn start(&self) -> Result<(), RuntimeError> {
        self.broker.start().await?;
        Ok(())
    }

    /// Stops all helpers, then the broker.
    pub async fn shutdown(&self) {
        self.supervisor.stop_all().await;
        self.broker.stop().await;
    }

    /// Launches the tray helper.
    pub async fn start_tray(&self, executable: PathBuf) -> Result<(), RuntimeError> {
        let result = self
            .supervisor
            .start(helper_config("tray", executable, Role::Tray, TRAY_MAX_RESTARTS))
            .await;
        if let Err(error) = &result {
            self.report_error(format!("tray start failed: {error}"));
        }
        result
    }

    /// Launches the bubble helper.
    pub async fn start_bubble(&self, executable: PathBuf) -> Result<(), RuntimeError> {
        let result = self
            .supervisor
            .start(helper_config(
                "bubble",
                executable,
                Role::Bubble,
                BUBBLE_MAX_RESTARTS,
            ))
            .await;
        if let Err(error) = &result {
            self.report_error(format!("bubble start failed: {error}"));
        }
        result
    }

    fn report_error(&self, message: String) {
        if let Some(on_error) = &self.on_error {
            on_error(message);
        }
    }

    /// Sends a notification to the tray helper.
    pub async fn notify_tray(&self, title: &str, body: &str) -> Result<(), RuntimeError> {
        let message = IpcMessage::to(MessageKind::ShowNotification, Role::Main, Role::Tray)
            .with_payload(&NotificationPayload {
                title: title.to_string(),
                body: body.to_string(),
            })?;
        self.broker.send(Role::Tray, &message).await?;
        Ok(())
    }

    /// Asks the bubble helper to show itself, optionally with a query.
    pub async fn show_bubble(&self, query: Option<String>) -> Result<(), RuntimeError> {
        self.send_bubble_action(ActionPayload {
            action: ActionKind::Show,
            query,
        })
        .await
    }

    /// Asks the bubble helper to hide.
    pub async fn hide_bubble(&self) -> Result<(), RuntimeError> {
        self.send_bubble_action(ActionPayload {
            action: ActionKind::Hide,
            query: None,
        })
        .await
    }

    /// Broadcasts the embedded service state to every helper.
    pub async fn broadcast_service_status(&self, running: bool) -> Result<(), RuntimeError> {
        let status = if running {
            ServiceStatus::Running
        } else {
            ServiceStatus::Stopped
        };
        let message = IpcMessage::new(MessageKind::StatusUpdate, Role::Main)
            .with_payload(&StatusUpdatePayload { status })?;
        self.broker.broadcast(&message).await?;
        Ok(())
    }

    async fn send_bubble_action(&self, payload: ActionPayload) -> Result<(), RuntimeError> {
        let message = IpcMessage::to(MessageKind::Action, Role::Main, Role::Bubble)
            .with_payload(&payload)?;
        self.broker.send(Role::Bubble, &message).await?;
        Ok(())
    }

    async fn install_handlers(&self, callbacks: BridgeCallbacks) {
        let BridgeCallbacks {
            on_tray_ready,
            on_bubble_ready,
            on_notification,
            on_show_bubble,
            on_service_status,
            on_show_window,
            on_hide_window,
            on_restart_service,
            on_quit,
            on_error,
        } = callbacks;

        self.broker
            .register_handler(MessageKind::Register, move |message| {
                let Ok(registration) = decode_register(message) else {
                    return;
                };
                let ready = match registration.role {
                    Role::Tray => on_tray_ready.as_ref(),
                    Role::Bubble => on_bubble_ready.as_ref(),
                    Role::Main => None,
                };
                if let Some(ready) = ready {
                    ready();
                }
            })
            .await;

        self.broker
            .register_handler(MessageKind::ShowNotification, move |message| {
                let Some(on_notification) = on_notification.as_ref() else {
                    return;
                };
                match decode_notification(message) {
                    Ok(payload) => on_notification(payload.title, payload.body),
                    Err(error) => warn!(error = %error, "bad notification payload"),
                }
            })
            .await;

        self.broker
            .register_handler(MessageKind::StatusUpdate, move |message| {
                let Some(on_service_status) = on_service_status.as_ref() else {
                    return;
                };
                match decode_status_update(message) {
                    Ok(payload) => on_service_status(payload.status == ServiceStatus::Running),
                    Err(error) => warn!(error = %error, "bad status payload"),
                }
            })
            .await;

        self.broker
            .register_handler(MessageKind::Error, move |message| {
                let Some(on_error) = on_error.as_ref() else {
                    return;
                };
                match decode_error(message) {
                    Ok(payload) => on_error(payload.message),
                    Err(error) => warn!(error = %error, "bad error payload"),
                }
            })
            .await;

        self.broker
            .register_handler(MessageKind::Action, move |message| {
                let payload = match decode_action(message) {
                    Ok(payload) => payload,
                    Err(error) => {
                        warn!(error = %error, "bad action payload");
                        return;
                    }
                };
                match payload.action {
                    ActionKind::ShowMainWindow => invoke(&on_show_window),
                    ActionKind::HideMainWindow => invoke(&on_hide_window),
                    ActionKind::ShowBubble => {
                        if let Some(on_show_bubble) = on_show_bubble.as_ref() {
                            on_show_bubble(payload.query);
                        }
                    }
                    ActionKind::Quit => invoke(&on_quit),
                    ActionKind::RestartService => invoke(&on_restart_service),
                    ActionKind::Show | ActionKind::Hide => {
                        debug!(action = ?payload.action, "bubble-directed action ignored by host");
                    }
                }
            })
            .await;
    }
}

fn invoke(callback: &Option<Callback>) {
    if let Some(callback) = callback {
        callback();
    }
}

fn helper_config(name: &str, executable: PathBuf, role: Role, max_restarts: u32) -> ProcessConfig {
    ProcessConfig {
        name: name.to_string(),
        executable,
        args: vec!["--role".to_string(), role.as_str().to_string()],
        role,
        max_restarts,
        restart_delay: HELPER_RESTART_DELAY,
        start_timeout: HELPER_START_TIMEOUT,
        hidden: true,
    }
}
