//! Operator console worker layer.
//!
//! The console owns the axis behind a command loop: UI or script code talks
//! to a [`RigHandle`], each request travels as a [`RigCommand`] with a
//! `oneshot` response channel, and the [`RigActor`] executes them in order.
//! Motion commands return as soon as the operation is accepted; callers that
//! want synchronous behavior follow up with [`RigHandle::wait_complete`].

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{info, warn};

use crate::error::{AppResult, RigError};
use crate::hardware::registry::{DeviceDescriptor, DeviceRegistry};
use crate::hardware::MotionPort;
use crate::motor::{Direction, MotionState, MotorAxis, OpRequest, RigEvent};

const COMMAND_CAPACITY: usize = 32;

type Responder<T> = oneshot::Sender<AppResult<T>>;

/// Opens a hardware port for a chosen device descriptor.
pub type PortFactory =
    Box<dyn Fn(&DeviceDescriptor) -> AppResult<Box<dyn MotionPort>> + Send + Sync>;

/// Snapshot of axis telemetry for the console.
#[derive(Clone, Copy, Debug)]
pub struct Telemetry {
    pub state: MotionState,
    /// True while an operation's watchdog owns the axis.
    pub busy: bool,
    pub position: i32,
    pub velocity: i32,
    pub current_ma: i16,
}

/// Requests accepted by the console actor.
pub enum RigCommand {
    Connect {
        serial_number: u64,
        resp: Responder<()>,
    },
    MoveAbsolute {
        position: i32,
        request: OpRequest,
        resp: Responder<()>,
    },
    Jog {
        direction: Direction,
        request: OpRequest,
        resp: Responder<()>,
    },
    Stop {
        resp: Responder<()>,
    },
    Home {
        resp: Responder<()>,
    },
    Disconnect {
        resp: Responder<()>,
    },
    Telemetry {
        resp: oneshot::Sender<Telemetry>,
    },
    Shutdown,
}

/// Cloneable front end to the console actor.
#[derive(Clone)]
pub struct RigHandle {
    tx: mpsc::Sender<RigCommand>,
    axis: Arc<MotorAxis>,
}

impl RigHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(Responder<T>) -> RigCommand,
    ) -> AppResult<T> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(make(resp))
            .await
            .map_err(|_| RigError::Connect("console actor gone".to_string()))?;
        rx.await
            .map_err(|_| RigError::Connect("console actor dropped request".to_string()))?
    }

    pub async fn connect(&self, serial_number: u64) -> AppResult<()> {
        self.request(|resp| RigCommand::Connect {
            serial_number,
            resp,
        })
        .await
    }

    pub async fn move_absolute(&self, position: i32, request: OpRequest) -> AppResult<()> {
        self.request(|resp| RigCommand::MoveAbsolute {
            position,
            request,
            resp,
        })
        .await
    }

    pub async fn jog(&self, direction: Direction, request: OpRequest) -> AppResult<()> {
        self.request(|resp| RigCommand::Jog {
            direction,
            request,
            resp,
        })
        .await
    }

    pub async fn stop(&self) -> AppResult<()> {
        self.request(|resp| RigCommand::Stop { resp }).await
    }

    pub async fn home(&self) -> AppResult<()> {
        self.request(|resp| RigCommand::Home { resp }).await
    }

    pub async fn disconnect(&self) -> AppResult<()> {
        self.request(|resp| RigCommand::Disconnect { resp }).await
    }

    pub async fn telemetry(&self) -> AppResult<Telemetry> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(RigCommand::Telemetry { resp })
            .await
            .map_err(|_| RigError::Connect("console actor gone".to_string()))?;
        rx.await
            .map_err(|_| RigError::Connect("console actor dropped request".to_string()))
    }

    /// Block until the in-flight operation reports its outcome. Does not go
    /// through the actor, so `stop()` stays available while waiting.
    pub async fn wait_complete(&self) -> Option<bool> {
        self.axis.wait_complete().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RigEvent> {
        self.axis.subscribe()
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(RigCommand::Shutdown).await;
    }
}

/// Command loop owning the axis, the device registry and the port factory.
pub struct RigActor {
    axis: Arc<MotorAxis>,
    registry: DeviceRegistry,
    factory: PortFactory,
    rx: mpsc::Receiver<RigCommand>,
}

impl RigActor {
    pub fn new(axis: MotorAxis, registry: DeviceRegistry, factory: PortFactory) -> (Self, RigHandle) {
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let axis = Arc::new(axis);
        let handle = RigHandle {
            tx,
            axis: Arc::clone(&axis),
        };
        (
            Self {
                axis,
                registry,
                factory,
                rx,
            },
            handle,
        )
    }

    /// Process commands until `Shutdown` or the last handle is dropped.
    pub async fn run(mut self) {
        info!("console actor started");
        while let Some(command) = self.rx.recv().await {
            match command {
                RigCommand::Connect {
                    serial_number,
                    resp,
                } => {
                    let _ = resp.send(self.connect(serial_number).await);
                }
                RigCommand::MoveAbsolute {
                    position,
                    request,
                    resp,
                } => {
                    let _ = resp.send(self.axis.move_absolute(position, request).await);
                }
                RigCommand::Jog {
                    direction,
                    request,
                    resp,
                } => {
                    let _ = resp.send(self.axis.jog(direction, request).await);
                }
                RigCommand::Stop { resp } => {
                    let _ = resp.send(self.axis.stop().await);
                }
                RigCommand::Home { resp } => {
                    let _ = resp.send(self.axis.home().await);
                }
                RigCommand::Disconnect { resp } => {
                    let _ = resp.send(self.axis.disconnect().await);
                }
                RigCommand::Telemetry { resp } => {
                    let state = self.axis.state();
                    let _ = resp.send(Telemetry {
                        state,
                        busy: state.is_busy(),
                        position: self.axis.position().await,
                        velocity: self.axis.velocity().await,
                        current_ma: self.axis.actual_current().await,
                    });
                }
                RigCommand::Shutdown => break,
            }
        }
        if let Err(err) = self.axis.disconnect().await {
            warn!(%err, "axis teardown on shutdown failed");
        }
        info!("console actor stopped");
    }

    async fn connect(&self, serial_number: u64) -> AppResult<()> {
        let descriptor = self.registry.find_by_serial(serial_number).ok_or_else(|| {
            RigError::Connect(format!(
                "no device with serial {serial_number} among {} enumerated",
                self.registry.len()
            ))
        })?;
        let port = (self.factory)(descriptor)?;
        self.axis.connect(port).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::hardware::sim;

    fn sim_rig() -> (RigActor, RigHandle) {
        let settings = Settings::default();
        let axis = MotorAxis::new(&settings);
        let factory: PortFactory = Box::new(|_descriptor| {
            let (axis, _handle) = sim::SimAxis::new();
            Ok(Box::new(axis))
        });
        RigActor::new(axis, sim::enumerate(), factory)
    }

    #[tokio::test]
    async fn test_connect_by_serial() {
        let (actor, handle) = sim_rig();
        let actor = tokio::spawn(actor.run());

        handle.connect(12345).await.unwrap();
        let telemetry = handle.telemetry().await.unwrap();
        assert_eq!(telemetry.state, MotionState::Idle);
        assert!(!telemetry.busy);

        handle.shutdown().await;
        actor.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_unknown_serial() {
        let (actor, handle) = sim_rig();
        let actor = tokio::spawn(actor.run());

        let err = handle.connect(999).await.unwrap_err();
        assert!(matches!(err, RigError::Connect(_)));
        assert_eq!(handle.telemetry().await.unwrap().state, MotionState::Off);

        handle.shutdown().await;
        actor.await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_without_connection_is_harmless() {
        let (actor, handle) = sim_rig();
        let actor = tokio::spawn(actor.run());

        handle.stop().await.unwrap();
        handle.shutdown().await;
        actor.await.unwrap();
    }
}
