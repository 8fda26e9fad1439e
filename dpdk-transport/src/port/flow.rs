use std::sync::{Arc, Mutex, PoisonError};

use crate::api::RteBackend;
use crate::api::rte::eth::{PortId, QueueId};
use crate::api::rte::flow::{FlowHandle, FlowRule};
use crate::error::Result;

/// First CPU RX queue; catch-all traffic lands here.
const HOST_QUEUE: QueueId = 0;

/// Where the installed ingress rule sends traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowTarget {
    /// Everything to the first CPU queue
    Host,
    /// Sample-stream traffic to the GPU queue
    Device,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlowState {
    /// No rule installed yet
    None,
    Active { handle: FlowHandle, target: FlowTarget },
    /// A previous install/remove failed; the hardware state is unknown.
    Indeterminate,
}

/// Ingress steering between the CPU queues and the GPU queue of a port.
///
/// Ports without a GPU queue have nothing to steer and every operation is a
/// no-op.
pub struct FlowSteering {
    rte: Arc<dyn RteBackend>,
    port_id: PortId,
    gpu_queue: Option<QueueId>,
    state: Mutex<FlowState>,
}

impl FlowSteering {
    pub fn new(rte: Arc<dyn RteBackend>, port_id: PortId, gpu_queue: Option<QueueId>) -> Self {
        Self {
            rte,
            port_id,
            gpu_queue,
            state: Mutex::new(FlowState::None),
        }
    }

    /// Whether this port has a GPU queue to steer to.
    pub fn is_enabled(&self) -> bool {
        self.gpu_queue.is_some()
    }

    /// Target of the currently installed rule, if one is known to be active.
    pub fn target(&self) -> Option<FlowTarget> {
        match *self.state.lock().unwrap_or_else(PoisonError::into_inner) {
            FlowState::Active { target, .. } => Some(target),
            FlowState::None | FlowState::Indeterminate => None,
        }
    }

    /// Handle of the currently installed rule.
    pub fn active_handle(&self) -> Option<FlowHandle> {
        match *self.state.lock().unwrap_or_else(PoisonError::into_inner) {
            FlowState::Active { handle, .. } => Some(handle),
            FlowState::None | FlowState::Indeterminate => None,
        }
    }

    /// Send all ingress to the first CPU queue.
    pub fn route_to_host(&self) -> Result<()> {
        if self.gpu_queue.is_none() {
            return Ok(());
        }
        self.replace(FlowRule::to_queue(HOST_QUEUE), FlowTarget::Host)
    }

    /// Send sample-stream ingress to the GPU queue. Other traffic falls
    /// through to default handling.
    pub fn route_to_device(&self) -> Result<()> {
        let Some(gpu_queue) = self.gpu_queue else {
            return Ok(());
        };
        self.replace(FlowRule::vita_to_queue(gpu_queue), FlowTarget::Device)
    }

    fn replace(&self, rule: FlowRule, target: FlowTarget) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        self.rte.flow_validate(self.port_id, &rule).inspect_err(|e| {
            tracing::error!(port_id = self.port_id, ?target, error = %e, "Failed to validate flow");
        })?;

        if let FlowState::Active { handle, .. } = *state {
            if let Err(e) = self.rte.flow_destroy(self.port_id, handle) {
                tracing::error!(port_id = self.port_id, error = %e, "Failed to destroy flow");
                *state = FlowState::Indeterminate;
                return Err(e.into());
            }
        }

        match self.rte.flow_create(self.port_id, &rule) {
            Ok(handle) => {
                tracing::debug!(port_id = self.port_id, ?target, ?handle, "Installed ingress flow");
                *state = FlowState::Active { handle, target };
                Ok(())
            }
            Err(e) => {
                tracing::error!(port_id = self.port_id, ?target, error = %e, "Failed to create flow");
                *state = FlowState::Indeterminate;
                Err(e.into())
            }
        }
    }
}

impl std::fmt::Debug for FlowSteering {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowSteering")
            .field("port_id", &self.port_id)
            .field("gpu_queue", &self.gpu_queue)
            .field("state", &*self.state.lock().unwrap_or_else(PoisonError::into_inner))
            .finish()
    }
}
