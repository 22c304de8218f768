//! Peer messaging used by protocol runs.
//!
//! [`MessagingHub`] is an in-process transport: each connected party gets an
//! endpoint and a queue of inbound messages. Replies to an outstanding
//! [`Messaging::request`] are matched by `process_id` and never reach the
//! inbound queue.

use crate::error::{EngineError, Result};
use crate::protocol::ProtocolMessage;
use async_trait::async_trait;
use ethers::types::Address;
use log::{debug, error, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

#[async_trait]
pub trait Messaging: Send + Sync {
    /// Fire and forget.
    async fn send(&self, message: ProtocolMessage) -> Result<()>;

    /// Sends `message` and waits for the counterparty's next message in the
    /// same run.
    async fn request(&self, message: ProtocolMessage, timeout: Duration) -> Result<ProtocolMessage>;
}

type Peers = Arc<Mutex<HashMap<Address, mpsc::UnboundedSender<String>>>>;
type Pending = Arc<Mutex<HashMap<Uuid, oneshot::Sender<ProtocolMessage>>>>;

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| EngineError::Messaging("messaging state poisoned".into()))
}

#[derive(Clone, Default)]
pub struct MessagingHub {
    peers: Peers,
}

impl MessagingHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `address` and returns its endpoint plus the queue of messages
    /// that start new runs. Must be called from within a tokio runtime.
    pub fn connect(&self, address: Address) -> Result<(Arc<HubEndpoint>, mpsc::UnboundedReceiver<ProtocolMessage>)> {
        let (raw_sender, raw_receiver) = mpsc::unbounded_channel();
        let (inbound_sender, inbound_receiver) = mpsc::unbounded_channel();
        lock(&self.peers)?.insert(address, raw_sender);

        let pending: Pending = Default::default();
        tokio::spawn(route(address, raw_receiver, pending.clone(), inbound_sender));
        debug!("messaging endpoint {:?} connected", address);

        let endpoint = HubEndpoint { address, peers: self.peers.clone(), pending };
        Ok((Arc::new(endpoint), inbound_receiver))
    }

    pub fn disconnect(&self, address: &Address) -> Result<()> {
        if lock(&self.peers)?.remove(address).is_some() {
            debug!("messaging endpoint {:?} disconnected", address);
        }
        Ok(())
    }
}

async fn route(
    address: Address,
    mut raw: mpsc::UnboundedReceiver<String>,
    pending: Pending,
    inbound: mpsc::UnboundedSender<ProtocolMessage>,
) {
    while let Some(payload) = raw.recv().await {
        let message: ProtocolMessage = match serde_json::from_str(&payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("{:?} dropped undecodable message: {}", address, e);
                continue;
            }
        };
        let waiter = match lock(&pending) {
            Ok(mut pending) => pending.remove(&message.process_id),
            Err(e) => {
                error!("{:?} router stopped: {}", address, e);
                return;
            }
        };
        match waiter {
            Some(waiter) => {
                if waiter.send(message).is_err() {
                    warn!("{:?} reply arrived after its request gave up", address);
                }
            }
            None => {
                if inbound.send(message).is_err() {
                    debug!("{:?} inbound queue closed", address);
                    return;
                }
            }
        }
    }
}

pub struct HubEndpoint {
    address: Address,
    peers: Peers,
    pending: Pending,
}

impl HubEndpoint {
    pub fn address(&self) -> Address {
        self.address
    }

    fn deliver(&self, message: &ProtocolMessage) -> Result<()> {
        let payload = serde_json::to_string(message)?;
        let peers = lock(&self.peers)?;
        let peer = peers
            .get(&message.to)
            .ok_or_else(|| EngineError::Messaging(format!("peer {:?} is not connected", message.to)))?;
        peer.send(payload)
            .map_err(|_| EngineError::Messaging(format!("peer {:?} stopped receiving", message.to)))
    }
}

#[async_trait]
impl Messaging for HubEndpoint {
    async fn send(&self, message: ProtocolMessage) -> Result<()> {
        debug!(
            "{:?} -> {:?} {} seq {} ({})",
            self.address, message.to, message.protocol, message.seq, message.process_id
        );
        self.deliver(&message)
    }

    async fn request(&self, message: ProtocolMessage, timeout: Duration) -> Result<ProtocolMessage> {
        let (sender, receiver) = oneshot::channel();
        lock(&self.pending)?.insert(message.process_id, sender);
        let process_id = message.process_id;
        let peer = message.to;
        if let Err(e) = self.send(message).await {
            lock(&self.pending)?.remove(&process_id);
            return Err(e);
        }
        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(EngineError::Messaging("reply channel closed".into())),
            Err(_) => {
                lock(&self.pending)?.remove(&process_id);
                Err(EngineError::ProtocolTimeout { peer, timeout_ms: timeout.as_millis() as u64 })
            }
        }
    }
}
