//! Tunnel session state machine
//!
//! Sessions move Negotiating -> Bridging -> Closed and never go back; a
//! session serves exactly one connect request.

use crate::error::Error;
use state_machines::state_machine;
use std::fmt;
use std::net::SocketAddrV4;
use tracing::debug;

state_machine! {
    name: TunnelMachine,
    dynamic: true,
    initial: Negotiating,
    states: [Negotiating, Bridging, Closed],
    events {
        bridge {
            transition: { from: Negotiating, to: Bridging }
        }
        close {
            transition: { from: [Negotiating, Bridging], to: Closed }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Negotiating,
    Bridging,
    Closed,
}

impl SessionState {
    fn from_name(s: &str) -> Self {
        match s {
            "Negotiating" => SessionState::Negotiating,
            "Bridging" => SessionState::Bridging,
            _ => SessionState::Closed,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Negotiating => "negotiating",
            SessionState::Bridging => "bridging",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// One connect request, from negotiation to teardown
pub struct TunnelSession {
    id: String,
    network_id: String,
    target: SocketAddrV4,
    machine: DynamicTunnelMachine<()>,
}

impl TunnelSession {
    pub fn new(id: impl Into<String>, network_id: impl Into<String>, target: SocketAddrV4) -> Self {
        Self {
            id: id.into(),
            network_id: network_id.into(),
            target,
            machine: TunnelMachine::new(()).into_dynamic(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn network_id(&self) -> &str {
        &self.network_id
    }

    pub fn target(&self) -> SocketAddrV4 {
        self.target
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_name(self.machine.current_state())
    }

    /// The rendezvous connection arrived; bytes start flowing
    pub fn bridge(&mut self) -> crate::error::Result<()> {
        self.machine
            .handle(TunnelMachineEvent::Bridge)
            .map_err(|e| Error::Tunnel(format!("session {} cannot bridge: {:?}", self.id, e)))?;
        debug!(session = %self.id, state = %self.state(), "session transition");
        Ok(())
    }

    /// Tear the session down; closing twice is a no-op
    pub fn close(&mut self) {
        if self.state() != SessionState::Closed
            && self.machine.handle(TunnelMachineEvent::Close).is_ok()
        {
            debug!(session = %self.id, state = %self.state(), "session transition");
        }
    }
}

impl fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelSession")
            .field("id", &self.id)
            .field("network_id", &self.network_id)
            .field("target", &self.target)
            .field("state", &self.state())
            .finish()
    }
}
