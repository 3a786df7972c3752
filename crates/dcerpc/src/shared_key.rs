//! Shared-key security provider
//!
//! A three-leg exchange between two parties that hold the same secret:
//!
//! ```text
//! client                                server
//!   bind:      nonce_c (32)       -->
//!              <--   bind_ack:    nonce_s (32) || proof_s (32)
//!   auth3:     proof_c (32)       -->
//! ```
//!
//! Both sides derive the session key with HKDF-SHA256 over the secret,
//! salted with both nonces. The proofs are HMAC-SHA256 tags over the nonces
//! under that key, labelled by direction, so each side shows it holds the
//! secret without revealing it.

use crate::error::{Result, RpcError};
use crate::security::{AuthSession, AuthStep, AuthType, SecurityProvider};
use bytes::Bytes;
use ring::rand::{SecureRandom, SystemRandom};
use ring::{hkdf, hmac};
use std::fmt;

const NONCE_SIZE: usize = 32;
const PROOF_SIZE: usize = 32;
const KEY_SIZE: usize = 32;

/// Provider for the [`AuthType::DcePrivate`] shared-secret scheme.
#[derive(Clone)]
pub struct SharedKeyProvider {
    secret: Vec<u8>,
    rng: SystemRandom,
}

impl SharedKeyProvider {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
            rng: SystemRandom::new(),
        }
    }
}

impl fmt::Debug for SharedKeyProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedKeyProvider").finish_non_exhaustive()
    }
}

impl SecurityProvider for SharedKeyProvider {
    fn auth_type(&self) -> AuthType {
        AuthType::DcePrivate
    }

    fn client_session(&self) -> Result<Box<dyn AuthSession>> {
        Ok(Box::new(ClientSession {
            secret: self.secret.clone(),
            rng: self.rng.clone(),
            state: ClientState::Initial,
        }))
    }

    fn server_session(&self) -> Result<Box<dyn AuthSession>> {
        Ok(Box::new(ServerSession {
            secret: self.secret.clone(),
            rng: self.rng.clone(),
            state: ServerState::AwaitingNonce,
        }))
    }
}

struct KeyLen;

impl hkdf::KeyType for KeyLen {
    fn len(&self) -> usize {
        KEY_SIZE
    }
}

fn random_nonce(rng: &SystemRandom) -> Result<[u8; NONCE_SIZE]> {
    let mut nonce = [0u8; NONCE_SIZE];
    rng.fill(&mut nonce)
        .map_err(|_| RpcError::AuthFailed("random source unavailable".into()))?;
    Ok(nonce)
}

fn session_key(secret: &[u8], nonce_c: &[u8], nonce_s: &[u8]) -> Result<Vec<u8>> {
    let mut salt = Vec::with_capacity(NONCE_SIZE * 2);
    salt.extend_from_slice(nonce_c);
    salt.extend_from_slice(nonce_s);

    let mut key = vec![0u8; KEY_SIZE];
    hkdf::Salt::new(hkdf::HKDF_SHA256, &salt)
        .extract(secret)
        .expand(&[b"dcerpc shared key session".as_slice()], KeyLen)
        .and_then(|okm| okm.fill(&mut key))
        .map_err(|_| RpcError::AuthFailed("key derivation failed".into()))?;
    Ok(key)
}

fn proof(key: &[u8], label: &[u8], nonce_c: &[u8], nonce_s: &[u8]) -> hmac::Tag {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    let mut ctx = hmac::Context::with_key(&key);
    ctx.update(label);
    ctx.update(nonce_c);
    ctx.update(nonce_s);
    ctx.sign()
}

fn check_proof(key: &[u8], label: &[u8], nonce_c: &[u8], nonce_s: &[u8], got: &[u8]) -> Result<()> {
    let mut signed = Vec::with_capacity(label.len() + NONCE_SIZE * 2);
    signed.extend_from_slice(label);
    signed.extend_from_slice(nonce_c);
    signed.extend_from_slice(nonce_s);
    hmac::verify(&hmac::Key::new(hmac::HMAC_SHA256, key), &signed, got)
        .map_err(|_| RpcError::AuthFailed("peer does not hold the shared key".into()))
}

enum ClientState {
    Initial,
    SentNonce([u8; NONCE_SIZE]),
    Done,
}

struct ClientSession {
    secret: Vec<u8>,
    rng: SystemRandom,
    state: ClientState,
}

impl AuthSession for ClientSession {
    fn step(&mut self, input: Option<&[u8]>) -> Result<AuthStep> {
        match (&self.state, input) {
            (ClientState::Initial, None) => {
                let nonce_c = random_nonce(&self.rng)?;
                self.state = ClientState::SentNonce(nonce_c);
                Ok(AuthStep::Continue(Bytes::copy_from_slice(&nonce_c)))
            }
            (ClientState::SentNonce(nonce_c), Some(token)) => {
                if token.len() != NONCE_SIZE + PROOF_SIZE {
                    return Err(RpcError::AuthFailed(format!(
                        "server token is {} bytes",
                        token.len()
                    )));
                }
                let nonce_c = *nonce_c;
                let (nonce_s, proof_s) = token.split_at(NONCE_SIZE);
                let key = session_key(&self.secret, &nonce_c, nonce_s)?;
                check_proof(&key, b"server", &nonce_c, nonce_s, proof_s)?;

                let proof_c = proof(&key, b"client", &nonce_c, nonce_s);
                self.state = ClientState::Done;
                Ok(AuthStep::Complete {
                    token: Some(Bytes::copy_from_slice(proof_c.as_ref())),
                    session_key: key,
                })
            }
            _ => Err(RpcError::AuthFailed("unexpected client authentication leg".into())),
        }
    }
}

enum ServerState {
    AwaitingNonce,
    SentProof {
        nonce_c: [u8; NONCE_SIZE],
        nonce_s: [u8; NONCE_SIZE],
        key: Vec<u8>,
    },
    Done,
}

struct ServerSession {
    secret: Vec<u8>,
    rng: SystemRandom,
    state: ServerState,
}

impl AuthSession for ServerSession {
    fn step(&mut self, input: Option<&[u8]>) -> Result<AuthStep> {
        let token = input.ok_or_else(|| RpcError::AuthFailed("missing client token".into()))?;
        match &self.state {
            ServerState::AwaitingNonce => {
                let nonce_c: [u8; NONCE_SIZE] = token
                    .try_into()
                    .map_err(|_| RpcError::AuthFailed("malformed client nonce".into()))?;
                let nonce_s = random_nonce(&self.rng)?;
                let key = session_key(&self.secret, &nonce_c, &nonce_s)?;
                let proof_s = proof(&key, b"server", &nonce_c, &nonce_s);

                let mut reply = Vec::with_capacity(NONCE_SIZE + PROOF_SIZE);
                reply.extend_from_slice(&nonce_s);
                reply.extend_from_slice(proof_s.as_ref());
                self.state = ServerState::SentProof {
                    nonce_c,
                    nonce_s,
                    key,
                };
                Ok(AuthStep::Continue(Bytes::from(reply)))
            }
            ServerState::SentProof {
                nonce_c,
                nonce_s,
                key,
            } => {
                check_proof(key, b"client", nonce_c, nonce_s, token)?;
                let session_key = key.clone();
                self.state = ServerState::Done;
                Ok(AuthStep::Complete {
                    token: None,
                    session_key,
                })
            }
            ServerState::Done => Err(RpcError::AuthFailed(
                "authentication already complete".into(),
            )),
        }
    }
}
