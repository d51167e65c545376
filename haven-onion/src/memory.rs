//! In-memory control channel
//!
//! A miniature control daemon for tests and simulation: accepts the same
//! commands as the real channel, keeps services in a map, and derives
//! real v3 addresses from Ed25519 keys so address determinism holds.

use crate::control::{ControlError, ControlLink, Reply};
use base64::Engine;
use ed25519_dalek::SigningKey;
use haven_model::types::PubKey;
use haven_model::OnionAddress;
use rand::rngs::OsRng;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct DaemonState {
    services: HashMap<String, String>,
    /// Errors to inject before the next commands succeed.
    fail_queue: VecDeque<ControlError>,
}

/// Shared handle to the fake daemon, for assertions and fault injection.
#[derive(Clone, Default)]
pub struct MemoryControlDaemon {
    state: Arc<Mutex<DaemonState>>,
    add_onion_calls: Arc<AtomicUsize>,
}

impl MemoryControlDaemon {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ADD_ONION commands that reached the daemon.
    pub fn add_onion_calls(&self) -> usize {
        self.add_onion_calls.load(Ordering::SeqCst)
    }

    /// Whether a service id is currently provisioned.
    pub fn has_service(&self, service_id: &str) -> bool {
        self.state
            .lock()
            .map(|s| s.services.contains_key(service_id))
            .unwrap_or(false)
    }

    /// Queue a failure to inject before the next command.
    pub fn inject_failure(&self, error: ControlError) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_queue.push_back(error);
        }
    }

    /// Open a link to this daemon, gated on the given password.
    pub fn link(&self, password: &str) -> MemoryControlLink {
        MemoryControlLink {
            daemon: self.clone(),
            password: password.to_string(),
            authenticated: false,
        }
    }
}

/// Derive the service id for a key blob (base64 of the 32-byte seed).
fn service_id_for_blob(blob: &str) -> Result<String, ControlError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(blob)
        .map_err(|_| ControlError::Channel {
            code: 552,
            message: "Invalid key blob".into(),
        })?;
    let seed: [u8; 32] = bytes.try_into().map_err(|_| ControlError::Channel {
        code: 552,
        message: "Invalid key length".into(),
    })?;
    let key = SigningKey::from_bytes(&seed);
    let public = PubKey::new(key.verifying_key().to_bytes());
    Ok(OnionAddress::from_public_key(&public).to_string())
}

/// A link into the in-memory daemon.
pub struct MemoryControlLink {
    daemon: MemoryControlDaemon,
    password: String,
    authenticated: bool,
}

#[async_trait::async_trait]
impl ControlLink for MemoryControlLink {
    async fn send_command(&mut self, command: &str) -> Result<Reply, ControlError> {
        {
            let mut state = self
                .daemon
                .state
                .lock()
                .map_err(|_| ControlError::Malformed("daemon lock poisoned".into()))?;
            if let Some(err) = state.fail_queue.pop_front() {
                return Err(err);
            }
        }

        let (verb, rest) = command.split_once(' ').unwrap_or((command, ""));
        match verb {
            "AUTHENTICATE" => {
                let supplied = rest.trim_matches('"');
                if supplied == self.password {
                    self.authenticated = true;
                    Ok(Reply {
                        code: 250,
                        lines: vec!["OK".into()],
                    })
                } else {
                    Ok(Reply {
                        code: 515,
                        lines: vec!["Authentication failed".into()],
                    })
                }
            }
            _ if !self.authenticated => Ok(Reply {
                code: 514,
                lines: vec!["Authentication required".into()],
            }),
            "ADD_ONION" => {
                self.daemon.add_onion_calls.fetch_add(1, Ordering::SeqCst);
                let key_spec = rest.split_whitespace().next().unwrap_or_default();
                let (blob, fresh) = match key_spec.strip_prefix("ED25519-V3:") {
                    Some(blob) => (blob.to_string(), false),
                    None if key_spec == "NEW:ED25519-V3" => {
                        let key = SigningKey::generate(&mut OsRng);
                        let blob = base64::engine::general_purpose::STANDARD
                            .encode(key.to_bytes());
                        (blob, true)
                    }
                    None => {
                        return Ok(Reply {
                            code: 512,
                            lines: vec!["Bad arguments".into()],
                        })
                    }
                };
                let service_id = service_id_for_blob(&blob)?;
                let mut state = self
                    .daemon
                    .state
                    .lock()
                    .map_err(|_| ControlError::Malformed("daemon lock poisoned".into()))?;
                state.services.insert(service_id.clone(), blob.clone());

                let mut lines = vec![format!("ServiceID={service_id}")];
                if fresh {
                    lines.push(format!("PrivateKey=ED25519-V3:{blob}"));
                }
                lines.push("OK".into());
                Ok(Reply { code: 250, lines })
            }
            "DEL_ONION" => {
                let service_id = rest.trim();
                let mut state = self
                    .daemon
                    .state
                    .lock()
                    .map_err(|_| ControlError::Malformed("daemon lock poisoned".into()))?;
                if state.services.remove(service_id).is_some() {
                    Ok(Reply {
                        code: 250,
                        lines: vec!["OK".into()],
                    })
                } else {
                    Ok(Reply {
                        code: 552,
                        lines: vec!["Unknown Onion Service id".into()],
                    })
                }
            }
            _ => Ok(Reply {
                code: 510,
                lines: vec!["Unrecognized command".into()],
            }),
        }
    }
}
