use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use hail_protocol::ActorKind;

use crate::registry::ConnectionRegistry;
use crate::rides::RideRegistry;

/// Address of one live connection: the writer task's channel plus the
/// identity it registered with.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub conn_id: String,
    pub identifier: String,
    pub kind: ActorKind,
    pub tx: mpsc::UnboundedSender<Message>,
}

/// All relay state, mutated under one write lock so each inbound message
/// is applied atomically.
#[derive(Debug, Default)]
pub struct RelayState {
    pub registry: ConnectionRegistry,
    pub rides: RideRegistry,
    pub clients: HashMap<String, ClientHandle>,
}

impl RelayState {
    pub fn new() -> Self {
        Self::default()
    }
}
