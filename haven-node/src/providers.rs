//! Overlay providers
//!
//! Concrete bindings of the [`OverlayProvider`] seam: iroh for
//! production, the in-memory hub for tests and simulation.

use crate::orchestrator::OverlayProvider;
use haven_model::DeviceIdentity;
use haven_net::overlay::OverlayError;
use haven_net::{MemoryHub, MemoryOverlay};
use haven_net_iroh::IrohOverlay;

/// Production provider: binds an iroh endpoint per launch.
#[derive(Debug, Clone, Default)]
pub struct IrohOverlayProvider;

impl OverlayProvider for IrohOverlayProvider {
    type Overlay = IrohOverlay;

    async fn bind(&self, identity: &DeviceIdentity) -> Result<IrohOverlay, OverlayError> {
        IrohOverlay::bind(identity).await
    }
}

/// Test provider: binds endpoints into a shared in-memory hub.
#[derive(Clone)]
pub struct MemoryOverlayProvider {
    hub: MemoryHub,
}

impl MemoryOverlayProvider {
    pub fn new(hub: MemoryHub) -> Self {
        Self { hub }
    }
}

impl OverlayProvider for MemoryOverlayProvider {
    type Overlay = MemoryOverlay;

    async fn bind(&self, identity: &DeviceIdentity) -> Result<MemoryOverlay, OverlayError> {
        Ok(self.hub.bind(identity.public_key()))
    }
}
