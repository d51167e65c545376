//! Onion service lifecycle
//!
//! Drives service provisioning over an authenticated control session.
//! Transient channel failures retry with bounded exponential backoff;
//! exhaustion surfaces a channel error that fails the current launch
//! attempt only, leaving the caller free to relaunch.

use crate::control::{ControlError, ControlLink, ControlSession};
use backon::{BackoffBuilder, ExponentialBuilder};
use haven_model::{OnionAddress, OnionError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

/// Bound on a single control command round trip.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

const RETRY_MIN_DELAY: Duration = Duration::from_millis(250);
const MAX_RETRIES: usize = 3;

/// Virtual port onion services expose.
pub const SERVICE_VIRT_PORT: u16 = 443;

#[derive(Error, Debug)]
pub enum HiddenServiceError {
    #[error(transparent)]
    Control(#[from] ControlError),

    #[error("provisioned address is invalid: {0}")]
    BadAddress(#[from] OnionError),
}

/// A provisioned onion service: the derived address plus the opaque key
/// blob that re-creates it deterministically.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HiddenService {
    pub address: OnionAddress,
    pub private_key: String,
}

/// Creates and destroys onion services through one control session.
pub struct HiddenServiceManager<L: ControlLink> {
    session: Mutex<ControlSession<L>>,
    target_port: u16,
}

impl<L: ControlLink> HiddenServiceManager<L> {
    /// Build from an already-authenticated session. Authentication
    /// itself happens in [`ControlSession::authenticate`], whose
    /// rejection is fatal to the process.
    pub fn new(session: ControlSession<L>, target_port: u16) -> Self {
        Self {
            session: Mutex::new(session),
            target_port,
        }
    }

    /// Provision a service. A supplied key blob re-derives the same
    /// address; otherwise a fresh keypair is minted.
    pub async fn create_hidden_service(
        &self,
        existing_key: Option<&str>,
    ) -> Result<HiddenService, HiddenServiceError> {
        let mut backoff = ExponentialBuilder::default()
            .with_min_delay(RETRY_MIN_DELAY)
            .with_max_times(MAX_RETRIES)
            .build();

        loop {
            let attempt = {
                let mut session = self.session.lock().await;
                match tokio::time::timeout(
                    COMMAND_TIMEOUT,
                    session.add_onion(existing_key, SERVICE_VIRT_PORT, self.target_port),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ControlError::Timeout),
                }
            };

            match attempt {
                Ok((service_id, private_key)) => {
                    let address = OnionAddress::parse(&service_id)?;
                    tracing::debug!(%address, "onion service provisioned");
                    return Ok(HiddenService {
                        address,
                        private_key,
                    });
                }
                Err(err) if err.is_transient() => match backoff.next() {
                    Some(delay) => {
                        tracing::warn!(%err, ?delay, "onion provisioning failed, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        tracing::warn!(%err, "onion provisioning retries exhausted");
                        return Err(err.into());
                    }
                },
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Destroy a service. Returns whether it existed; a service that is
    /// already absent counts as success.
    pub async fn destroy_hidden_service(
        &self,
        address: &OnionAddress,
    ) -> Result<bool, HiddenServiceError> {
        let mut session = self.session.lock().await;
        let existed = tokio::time::timeout(COMMAND_TIMEOUT, session.del_onion(address.as_str()))
            .await
            .map_err(|_| ControlError::Timeout)??;
        tracing::debug!(%address, existed, "onion service destroyed");
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryControlDaemon;

    async fn authed_manager(
        daemon: &MemoryControlDaemon,
    ) -> HiddenServiceManager<crate::memory::MemoryControlLink> {
        let session = ControlSession::authenticate(daemon.link("hunter2"), "hunter2")
            .await
            .expect("authentication");
        HiddenServiceManager::new(session, 8080)
    }

    #[tokio::test]
    async fn wrong_credential_is_fatal() {
        let daemon = MemoryControlDaemon::new();
        let result = ControlSession::authenticate(daemon.link("hunter2"), "wrong").await;
        assert!(matches!(result, Err(ControlError::AuthRejected)));
    }

    #[tokio::test]
    async fn fresh_service_has_canonical_address() {
        let daemon = MemoryControlDaemon::new();
        let manager = authed_manager(&daemon).await;

        let service = manager.create_hidden_service(None).await.unwrap();
        assert_eq!(service.address.as_str().len(), 56);
        assert!(!service.private_key.is_empty());
        assert!(daemon.has_service(service.address.as_str()));
    }

    #[tokio::test]
    async fn supplied_key_rederives_same_address() {
        let daemon = MemoryControlDaemon::new();
        let manager = authed_manager(&daemon).await;

        let first = manager.create_hidden_service(None).await.unwrap();
        manager
            .destroy_hidden_service(&first.address)
            .await
            .unwrap();

        let second = manager
            .create_hidden_service(Some(&first.private_key))
            .await
            .unwrap();
        assert_eq!(second.address, first.address);
        assert_eq!(second.private_key, first.private_key);
    }

    #[tokio::test]
    async fn destroying_absent_service_is_success() {
        let daemon = MemoryControlDaemon::new();
        let manager = authed_manager(&daemon).await;

        let service = manager.create_hidden_service(None).await.unwrap();
        assert!(manager
            .destroy_hidden_service(&service.address)
            .await
            .unwrap());
        // Second destroy: already absent, still Ok.
        assert!(!manager
            .destroy_hidden_service(&service.address)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn transient_failures_retry_until_success() {
        let daemon = MemoryControlDaemon::new();
        let manager = authed_manager(&daemon).await;

        daemon.inject_failure(ControlError::Channel {
            code: 550,
            message: "try again".into(),
        });
        daemon.inject_failure(ControlError::Timeout);

        let service = manager.create_hidden_service(None).await.unwrap();
        assert!(daemon.has_service(service.address.as_str()));
    }

    #[tokio::test]
    async fn permanent_failures_do_not_retry() {
        let daemon = MemoryControlDaemon::new();
        let manager = authed_manager(&daemon).await;

        daemon.inject_failure(ControlError::Channel {
            code: 512,
            message: "bad arguments".into(),
        });

        let result = manager.create_hidden_service(None).await;
        assert!(matches!(
            result,
            Err(HiddenServiceError::Control(ControlError::Channel {
                code: 512,
                ..
            }))
        ));
        assert_eq!(daemon.add_onion_calls(), 0);
    }
}
