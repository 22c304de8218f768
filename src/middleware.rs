use crate::app_instance::{AppInstance, AppProposal};
use crate::error::{EngineError, Result};
use crate::protocol::ProtocolParams;
use crate::state_channel::StateChannel;
use crate::types::ProtocolName;
use async_trait::async_trait;
use ethers::types::Address;
use log::warn;
use std::sync::Arc;

/// What a validation hook gets to look at. Runs before anything is signed.
#[derive(Debug, Clone, Copy)]
pub struct MiddlewareContext<'a> {
    pub protocol: ProtocolName,
    pub is_initiator: bool,
    pub params: &'a ProtocolParams,
    pub channel: &'a StateChannel,
    pub proposal: Option<&'a AppProposal>,
    pub app: Option<&'a AppInstance>,
}

#[async_trait]
pub trait ValidationMiddleware: Send + Sync {
    /// `Err(reason)` rejects the run.
    async fn validate(&self, context: &MiddlewareContext<'_>) -> std::result::Result<(), String>;
}

struct Registration {
    protocol: ProtocolName,
    app_definition: Option<Address>,
    middleware: Arc<dyn ValidationMiddleware>,
}

/// Hooks keyed by protocol and, optionally, app definition. A hook without an
/// app definition runs for every app.
#[derive(Default)]
pub struct MiddlewareRegistry {
    registrations: Vec<Registration>,
}

impl MiddlewareRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        protocol: ProtocolName,
        app_definition: Option<Address>,
        middleware: Arc<dyn ValidationMiddleware>,
    ) -> &mut Self {
        self.registrations.push(Registration { protocol, app_definition, middleware });
        self
    }

    pub async fn validate(&self, app_definition: Option<Address>, context: &MiddlewareContext<'_>) -> Result<()> {
        for registration in &self.registrations {
            if registration.protocol != context.protocol {
                continue;
            }
            if registration.app_definition.is_some() && registration.app_definition != app_definition {
                continue;
            }
            if let Err(reason) = registration.middleware.validate(context).await {
                warn!("{} rejected by middleware: {}", context.protocol, reason);
                return Err(EngineError::MiddlewareRejected(reason));
            }
        }
        Ok(())
    }
}
