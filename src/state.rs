use thiserror::Error;

/// What the service holds in terms of a messaging node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NodePhase {
    #[default]
    Stopped,
    /// a local node this service started and must stop
    Running,
    /// attached to a node someone else runs
    Remote,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TelemetryPhase {
    #[default]
    Idle,
    Streaming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEvent {
    NodeStarted,
    RemoteAttached,
    NodeStopped,
    TelemetryStarted,
    TelemetryStopped,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("cannot apply {event:?} while node is {node:?} and telemetry is {telemetry:?}")]
pub struct IllegalTransition {
    pub event: RunEvent,
    pub node: NodePhase,
    pub telemetry: TelemetryPhase,
}

/// Which parts of the service are up, this gates the shutdown steps
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceRunState {
    node: NodePhase,
    telemetry: TelemetryPhase,
}

impl ServiceRunState {
    pub fn node(&self) -> NodePhase {
        self.node
    }

    pub fn telemetry(&self) -> TelemetryPhase {
        self.telemetry
    }

    pub fn node_running(&self) -> bool {
        self.node == NodePhase::Running
    }

    pub fn telemetry_streaming(&self) -> bool {
        self.telemetry == TelemetryPhase::Streaming
    }

    pub fn transition(&mut self, event: RunEvent) -> Result<(), IllegalTransition> {
        use NodePhase as N;
        use TelemetryPhase as T;

        match (event, self.node, self.telemetry) {
            (RunEvent::NodeStarted, N::Stopped, _) => self.node = N::Running,
            (RunEvent::RemoteAttached, N::Stopped, _) => self.node = N::Remote,
            (RunEvent::NodeStopped, N::Running | N::Remote, _) => self.node = N::Stopped,
            (RunEvent::TelemetryStarted, _, T::Idle) => self.telemetry = T::Streaming,
            (RunEvent::TelemetryStopped, _, T::Streaming) => self.telemetry = T::Idle,
            _ => {
                return Err(IllegalTransition {
                    event,
                    node: self.node,
                    telemetry: self.telemetry,
                })
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_lifecycle() {
        let mut state = ServiceRunState::default();
        assert!(state.transition(RunEvent::NodeStopped).is_err());
        state.transition(RunEvent::NodeStarted).unwrap();
        assert!(state.node_running());
        assert!(state.transition(RunEvent::RemoteAttached).is_err());
        state.transition(RunEvent::NodeStopped).unwrap();
        assert_eq!(state.node(), NodePhase::Stopped);
    }

    #[test]
    fn remote_is_not_running() {
        let mut state = ServiceRunState::default();
        state.transition(RunEvent::RemoteAttached).unwrap();
        assert!(!state.node_running());
        assert_eq!(state.node(), NodePhase::Remote);
    }

    #[test]
    fn telemetry_cannot_stop_twice() {
        let mut state = ServiceRunState::default();
        assert_eq!(
            state.transition(RunEvent::TelemetryStopped),
            Err(IllegalTransition {
                event: RunEvent::TelemetryStopped,
                node: NodePhase::Stopped,
                telemetry: TelemetryPhase::Idle,
            })
        );
        state.transition(RunEvent::TelemetryStarted).unwrap();
        assert!(state.transition(RunEvent::TelemetryStarted).is_err());
        assert!(state.telemetry_streaming());
        state.transition(RunEvent::TelemetryStopped).unwrap();
        assert!(!state.telemetry_streaming());
    }
}
