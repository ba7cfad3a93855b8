//! Per-peer Noise sessions and their manager
//!
//! A [`NoiseSession`] owns its handshake and transport cipher state
//! exclusively; resetting or dropping the session destroys them. Sessions
//! move `Uninitialized → Handshaking → Established`, and any cryptographic
//! failure parks them in `Failed` until the coordinator restarts the pair.

use hashbrown::HashMap;
use tracing::debug;

use crate::errors::{CryptoError, MeshError, Result};
use crate::noise::crypto::{generate_fingerprint, NoiseHandshake, NoiseKeyPair, NoiseTransport};
use crate::types::{Fingerprint, PeerId};

// ----------------------------------------------------------------------------
// Role and State
// ----------------------------------------------------------------------------

/// Which side of the XX pattern this session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoiseRole {
    Initiator,
    Responder,
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created but no handshake message exchanged yet
    Uninitialized,
    /// XX messages in flight
    Handshaking,
    /// Transport ciphers derived, ready for traffic
    Established,
    /// Terminated by an error; not auto-recovered
    Failed,
}

// ----------------------------------------------------------------------------
// Noise Session
// ----------------------------------------------------------------------------

/// A single Noise XX session with one peer.
#[derive(Debug)]
pub struct NoiseSession {
    peer_id: PeerId,
    role: NoiseRole,
    state: SessionState,
    handshake: Option<NoiseHandshake>,
    transport: Option<NoiseTransport>,
    remote_static: Option<[u8; 32]>,
    handshake_hash: Option<[u8; 32]>,
    peer_fingerprint: Option<Fingerprint>,
}

impl NoiseSession {
    /// Create a session in the `Uninitialized` state.
    pub fn new(peer_id: PeerId, role: NoiseRole) -> Self {
        Self {
            peer_id,
            role,
            state: SessionState::Uninitialized,
            handshake: None,
            transport: None,
            remote_static: None,
            handshake_hash: None,
            peer_fingerprint: None,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn role(&self) -> NoiseRole {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == SessionState::Established
    }

    /// Transcript hash captured at split time; `None` until established.
    pub fn handshake_hash(&self) -> Option<&[u8; 32]> {
        self.handshake_hash.as_ref()
    }

    /// The peer's static public key, known once the handshake completes.
    pub fn remote_static(&self) -> Option<&[u8; 32]> {
        self.remote_static.as_ref()
    }

    /// Fingerprint of the peer's static key.
    pub fn peer_fingerprint(&self) -> Option<&Fingerprint> {
        self.peer_fingerprint.as_ref()
    }

    /// Begin the handshake as initiator, producing the first XX message.
    pub fn start_handshake(&mut self, local_key: &NoiseKeyPair) -> Result<Vec<u8>> {
        if self.state != SessionState::Uninitialized {
            return Err(MeshError::Handshake(
                crate::errors::HandshakeError::OutOfOrder {
                    peer_id: self.peer_id,
                },
            ));
        }
        if self.role != NoiseRole::Initiator {
            return Err(MeshError::Handshake(
                crate::errors::HandshakeError::OutOfOrder {
                    peer_id: self.peer_id,
                },
            ));
        }

        let mut handshake = NoiseHandshake::initiator(local_key)?;
        let message = handshake.write_message(&[])?;
        self.handshake = Some(handshake);
        self.state = SessionState::Handshaking;
        Ok(message)
    }

    /// Consume an incoming handshake message and produce the response, if the
    /// pattern calls for one. Establishment happens immediately after the
    /// last pattern token is consumed, whether that was a read or a write.
    pub fn process_handshake_message(
        &mut self,
        local_key: &NoiseKeyPair,
        message: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        if self.state == SessionState::Uninitialized && self.role == NoiseRole::Responder {
            self.handshake = Some(NoiseHandshake::responder(local_key)?);
            self.state = SessionState::Handshaking;
        }
        if self.state != SessionState::Handshaking {
            return Err(MeshError::Handshake(
                crate::errors::HandshakeError::OutOfOrder {
                    peer_id: self.peer_id,
                },
            ));
        }

        let result = self.advance_handshake(message);
        if result.is_err() {
            self.mark_failed();
        }
        result
    }

    fn advance_handshake(&mut self, message: &[u8]) -> Result<Option<Vec<u8>>> {
        let handshake = self
            .handshake
            .as_mut()
            .ok_or_else(|| MeshError::session_not_found(self.peer_id))?;

        handshake.read_message(message)?;
        if handshake.is_finished() {
            self.finish_handshake()?;
            return Ok(None);
        }

        let handshake = self
            .handshake
            .as_mut()
            .ok_or_else(|| MeshError::session_not_found(self.peer_id))?;
        let response = handshake.write_message(&[])?;
        if handshake.is_finished() {
            self.finish_handshake()?;
        }
        Ok(Some(response))
    }

    /// Capture the transcript hash and remote static, then split into the
    /// transport ciphers.
    fn finish_handshake(&mut self) -> Result<()> {
        let handshake = self
            .handshake
            .take()
            .ok_or_else(|| MeshError::session_not_found(self.peer_id))?;

        self.handshake_hash = Some(handshake.handshake_hash());
        if let Some(remote_static) = handshake.remote_static()? {
            self.peer_fingerprint = Some(generate_fingerprint(remote_static));
            self.remote_static = Some(remote_static);
        }
        self.transport = Some(handshake.into_transport()?);
        self.state = SessionState::Established;
        debug!(peer = %self.peer_id, "noise session established");
        Ok(())
    }

    /// Encrypt a transport message. Only valid once established.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        if self.state != SessionState::Established {
            return Err(MeshError::session_not_established(self.peer_id));
        }
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| MeshError::session_not_established(self.peer_id))?;
        match transport.encrypt(plaintext) {
            Ok(ciphertext) => Ok(ciphertext),
            Err(err) => {
                self.mark_failed();
                Err(err)
            }
        }
    }

    /// Decrypt a transport message. A verification failure terminates the
    /// session; the peer must restart through the coordinator.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if self.state != SessionState::Established {
            return Err(MeshError::session_not_established(self.peer_id));
        }
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| MeshError::session_not_established(self.peer_id))?;
        match transport.decrypt(ciphertext) {
            Ok(plaintext) => Ok(plaintext),
            Err(err) => {
                self.mark_failed();
                Err(err)
            }
        }
    }

    /// Terminate the session, destroying all cipher state.
    pub fn mark_failed(&mut self) {
        self.state = SessionState::Failed;
        self.handshake = None;
        self.transport = None;
    }

    /// Return to `Uninitialized`, destroying all owned state.
    pub fn reset(&mut self) {
        self.state = SessionState::Uninitialized;
        self.handshake = None;
        self.transport = None;
        self.remote_static = None;
        self.handshake_hash = None;
        self.peer_fingerprint = None;
    }
}

// ----------------------------------------------------------------------------
// Session Manager
// ----------------------------------------------------------------------------

/// Exclusive owner of every [`NoiseSession`], keyed by current peer ID.
#[derive(Debug)]
pub struct NoiseSessionManager {
    local_key: NoiseKeyPair,
    sessions: HashMap<PeerId, NoiseSession>,
}

impl NoiseSessionManager {
    pub fn new(local_key: NoiseKeyPair) -> Self {
        Self {
            local_key,
            sessions: HashMap::new(),
        }
    }

    /// Our static key pair.
    pub fn local_key(&self) -> &NoiseKeyPair {
        &self.local_key
    }

    /// Create (or replace) a session for the peer.
    pub fn create_session(&mut self, peer_id: PeerId, role: NoiseRole) -> &mut NoiseSession {
        self.sessions.insert(peer_id, NoiseSession::new(peer_id, role));
        self.sessions.get_mut(&peer_id).expect("just inserted")
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&NoiseSession> {
        self.sessions.get(peer_id)
    }

    pub fn get_mut(&mut self, peer_id: &PeerId) -> Option<&mut NoiseSession> {
        self.sessions.get_mut(peer_id)
    }

    pub fn remove(&mut self, peer_id: &PeerId) -> Option<NoiseSession> {
        self.sessions.remove(peer_id)
    }

    /// Re-key the table when a peer rotates its transient ID.
    pub fn migrate_session(&mut self, old_peer_id: &PeerId, new_peer_id: PeerId) {
        if let Some(mut session) = self.sessions.remove(old_peer_id) {
            session.peer_id = new_peer_id;
            self.sessions.insert(new_peer_id, session);
        }
    }

    /// Start a handshake toward `peer_id`, replacing any non-established
    /// session. Returns the first XX message, or `None` when a session is
    /// already established.
    pub fn initiate_handshake(&mut self, peer_id: PeerId) -> Result<Option<Vec<u8>>> {
        if self
            .sessions
            .get(&peer_id)
            .is_some_and(|session| session.is_established())
        {
            return Ok(None);
        }
        self.sessions.remove(&peer_id);
        let local_key = self.local_key.clone();
        let session = self.create_session(peer_id, NoiseRole::Initiator);
        session.start_handshake(&local_key).map(Some)
    }

    /// Feed an incoming handshake message, creating a responder session if
    /// none exists.
    pub fn handle_incoming_handshake(
        &mut self,
        peer_id: PeerId,
        message: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        let local_key = self.local_key.clone();
        let session = match self.sessions.get_mut(&peer_id) {
            Some(session) => session,
            None => self.create_session(peer_id, NoiseRole::Responder),
        };
        session.process_handshake_message(&local_key, message)
    }

    /// Encrypt toward a peer with an established session.
    pub fn encrypt(&mut self, peer_id: &PeerId, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.sessions
            .get_mut(peer_id)
            .ok_or(MeshError::Crypto(CryptoError::SessionNotFound {
                peer_id: *peer_id,
            }))?
            .encrypt(plaintext)
    }

    /// Decrypt from a peer with an established session.
    pub fn decrypt(&mut self, peer_id: &PeerId, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.sessions
            .get_mut(peer_id)
            .ok_or(MeshError::Crypto(CryptoError::SessionNotFound {
                peer_id: *peer_id,
            }))?
            .decrypt(ciphertext)
    }

    /// Peers with established sessions.
    pub fn established_peers(&self) -> Vec<PeerId> {
        self.sessions
            .iter()
            .filter(|(_, session)| session.is_established())
            .map(|(peer_id, _)| *peer_id)
            .collect()
    }

    /// Transcript hash for channel binding, if the session is established.
    pub fn handshake_hash(&self, peer_id: &PeerId) -> Option<[u8; 32]> {
        self.sessions
            .get(peer_id)
            .and_then(|session| session.handshake_hash().copied())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
