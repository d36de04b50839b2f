//! # Keyshare protocol
//!
//! The client side of the keyshare protocol: a three-phase interactive
//! Schnorr protocol between this device and the keyshare servers of every
//! distributed scheme a session touches. The servers hold a share of the
//! user's secret key and contribute commitments and responses into the proof
//! builders after the user authenticates with their PIN; neither party can
//! produce a proof alone.
//!
//! Session progress and outcome are delivered as [`SessionEvent`]s over a
//! channel; the PIN dialog is the separate bidirectional
//! [`PinRequestor`](crate::provider::PinRequestor) capability.

use std::collections::HashMap;

use base64ct::{Base64, Encoding};
use chrono::Utc;
use num_bigint::BigUint;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::Instrument;
use uuid::Uuid;

use crate::configuration::Configuration;
use crate::error::{ErrorType, SessionError};
use crate::identifier::{PublicKeyIdentifier, SchemeManagerIdentifier};
use crate::jwt::{self, token_needs_refresh};
use crate::proof::{
    IssueCommitmentMessage, Proof, ProofBuilderList, ProofPCommitment, Timestamp,
};
use crate::provider::{
    KeyshareClient, KeyshareContext, KeysharePinMessage, PinRequestor, PIN_STATUS_ERROR,
    PIN_STATUS_FAILURE, PIN_STATUS_SUCCESS,
};
use crate::request::SessionRequest;

/// Length of the PIN salt generated at enrollment.
pub const PIN_NONCE_LENGTH: usize = 32;

/// The local record of one keyshare server enrollment.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct KeyshareServerRecord {
    /// Opaque username assigned by the server at enrollment.
    pub username: String,

    /// Salt for PIN hashing. Generated once at enrollment; never rotated,
    /// never leaves the device.
    pub nonce: Vec<u8>,

    /// The scheme this enrollment belongs to.
    pub scheme_manager_identifier: SchemeManagerIdentifier,

    /// Bearer token from the last successful PIN verification. Transient.
    #[serde(skip)]
    pub token: Option<String>,
}

impl KeyshareServerRecord {
    /// A fresh record with a newly generated PIN salt.
    #[must_use]
    pub fn new(scheme_manager_identifier: SchemeManagerIdentifier) -> Self {
        let mut nonce = vec![0u8; PIN_NONCE_LENGTH];
        rand::thread_rng().fill_bytes(&mut nonce);
        Self { username: String::new(), nonce, scheme_manager_identifier, token: None }
    }

    /// The salted PIN hash sent to the server:
    /// `base64(sha256(nonce || pin))` followed by a newline. The trailing
    /// newline is part of the wire format.
    #[must_use]
    pub fn hashed_pin(&self, pin: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.nonce);
        hasher.update(pin.as_bytes());
        format!("{}\n", Base64::encode_string(&hasher.finalize()))
    }
}

/// What a completed keyshare session produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyshareResult {
    /// Disclosure or signature: the merged proof list.
    ProofList(Vec<Proof>),

    /// Issuance: the commitment message carrying the keyshare response JWTs
    /// for the issuer to verify and merge.
    IssueCommitment(IssueCommitmentMessage),
}

/// Session progress and outcome events.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session completed.
    Done(KeyshareResult),

    /// The user cancelled the PIN dialog.
    Cancelled,

    /// A keyshare server blocked the account for `duration` seconds.
    Blocked {
        /// The blocking scheme.
        manager: SchemeManagerIdentifier,
        /// Block duration in seconds; `-1` when the server sent no parseable
        /// duration.
        duration: i64,
    },

    /// The server knows the user but enrollment never completed.
    EnrollmentIncomplete {
        /// The affected scheme.
        manager: SchemeManagerIdentifier,
    },

    /// The server deleted the user's enrollment.
    EnrollmentDeleted {
        /// The affected scheme.
        manager: SchemeManagerIdentifier,
    },

    /// The session failed.
    Error {
        /// The scheme the error is associated with, when there is one.
        manager: Option<SchemeManagerIdentifier>,
        /// The failure.
        error: SessionError,
    },

    /// The session needs the user's PIN; a
    /// [`PinRequestor`](crate::provider::PinRequestor) prompt follows.
    PinRequired,

    /// PIN verification succeeded at every involved keyshare server.
    PinOk,
}

/// Outcome of verifying a PIN at a single keyshare server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PinOutcome {
    /// The PIN was correct; the record and context now carry a fresh token.
    Success,

    /// The PIN was wrong; this many attempts remain.
    Failure(i32),

    /// The account is blocked for this many seconds (`-1` when the server
    /// sent no parseable duration).
    Blocked(i64),
}

/// Verify a PIN at one keyshare server. On success the fresh auth token is
/// stored on both the record and the transport context. No retry logic; the
/// caller composes the loop.
pub async fn verify_pin_worker<C: KeyshareClient>(
    pin: &str, record: &mut KeyshareServerRecord, context: &mut KeyshareContext, client: &C,
) -> Result<PinOutcome, SessionError> {
    let message = KeysharePinMessage {
        username: record.username.clone(),
        pin: record.hashed_pin(pin),
    };
    let status = client.verify_pin(context, &message).await?;
    match status.status.as_str() {
        PIN_STATUS_SUCCESS => {
            record.token = Some(status.message.clone());
            context.token = Some(status.message);
            Ok(PinOutcome::Success)
        }
        PIN_STATUS_FAILURE => {
            let tries = status.message.parse().map_err(|_| {
                SessionError::new(
                    ErrorType::ServerResponse,
                    format!("malformed remaining-attempts count: {:?}", status.message),
                )
            })?;
            Ok(PinOutcome::Failure(tries))
        }
        PIN_STATUS_ERROR => Ok(PinOutcome::Blocked(status.message.parse().unwrap_or(-1))),
        _ => Err(SessionError::new(
            ErrorType::ServerResponse,
            "keyshare server returned unrecognized PIN status",
        )),
    }
}

/// Run the entire keyshare protocol with every keyshare server involved in
/// the session, merging the servers' contributions into `builders`.
///
/// The user's PIN is requested through `pin_requestor`, repeatedly, until it
/// is correct, the user cancels, or a server blocks the account. Progress and
/// the terminal outcome are delivered on `events`.
#[allow(clippy::too_many_arguments)]
pub async fn start_keyshare_session<C: KeyshareClient, P: PinRequestor>(
    events: &mpsc::UnboundedSender<SessionEvent>, pin_requestor: &P,
    builders: &mut ProofBuilderList, request: &SessionRequest, configuration: &Configuration,
    keyshare_servers: &mut HashMap<SchemeManagerIdentifier, KeyshareServerRecord>, client: &C,
    issuer_proof_nonce: Option<BigUint>, timestamp: Option<&Timestamp>,
) {
    let span = tracing::debug_span!("keyshare_session", id = %Uuid::new_v4());
    async {
        let session = KeyshareSession {
            events,
            pin_requestor,
            builders,
            request,
            configuration,
            servers: keyshare_servers,
            client,
            contexts: HashMap::new(),
            distributed: Vec::new(),
            issuer_proof_nonce,
            timestamp,
            pin_check: false,
        };
        let event = match session.run().await {
            Ok(result) => SessionEvent::Done(result),
            Err(event) => event,
        };
        let _ = events.send(event);
    }
    .instrument(span)
    .await;
}

/// Outcome of one PIN attempt across all involved keyshare servers.
enum PinAttempt {
    Success,
    Failure(i32),
    Blocked { manager: SchemeManagerIdentifier, duration: i64 },
}

struct KeyshareSession<'a, C, P> {
    events: &'a mpsc::UnboundedSender<SessionEvent>,
    pin_requestor: &'a P,
    builders: &'a mut ProofBuilderList,
    request: &'a SessionRequest,
    configuration: &'a Configuration,
    servers: &'a mut HashMap<SchemeManagerIdentifier, KeyshareServerRecord>,
    client: &'a C,
    contexts: HashMap<SchemeManagerIdentifier, KeyshareContext>,
    distributed: Vec<SchemeManagerIdentifier>,
    issuer_proof_nonce: Option<BigUint>,
    timestamp: Option<&'a Timestamp>,
    pin_check: bool,
}

impl<C: KeyshareClient, P: PinRequestor> KeyshareSession<'_, C, P> {
    async fn run(mut self) -> Result<KeyshareResult, SessionEvent> {
        self.preflight()?;
        if self.pin_check {
            self.emit(SessionEvent::PinRequired);
            self.verify_pin(-1).await?;
        }
        self.get_commitments().await?;
        self.get_proof_ps().await
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Phase 0: resolve the distributed schemes, check enrollments and the
    /// issuance cardinality, prepare transports, and decide whether the
    /// stored tokens carry us through the remaining phases.
    fn preflight(&mut self) -> Result<(), SessionEvent> {
        for manager in self.request.scheme_managers() {
            if !self.configuration.distributed(&manager) {
                continue;
            }
            if !self.servers.contains_key(&manager) {
                let error = SessionError::new(
                    ErrorType::Transport,
                    format!("not enrolled to keyshare server of scheme manager {manager}"),
                );
                return Err(SessionEvent::Error { manager: Some(manager), error });
            }
            self.distributed.push(manager);
        }

        if self.request.is_issuance() && self.distributed.len() > 1 {
            let error = SessionError::new(
                ErrorType::Transport,
                "issuance sessions involving more than one keyshare server are not supported",
            );
            return Err(SessionEvent::Error { manager: None, error });
        }

        let now = Utc::now();
        for manager in &self.distributed {
            let record = &self.servers[manager];
            let base_url = self
                .configuration
                .scheme_manager(manager)
                .and_then(|s| s.keyshare_server.clone())
                .unwrap_or_default();
            self.contexts.insert(
                manager.clone(),
                KeyshareContext {
                    base_url,
                    username: record.username.clone(),
                    token: record.token.clone(),
                },
            );

            let stale = match (&record.token, self.configuration.keyshare_auth_key(manager)) {
                (Some(token), Some(key)) => token_needs_refresh(token, key, now),
                _ => true,
            };
            if stale {
                tracing::info!(%manager, "keyshare server token invalid or expiring, asking for PIN");
                self.pin_check = true;
            }
        }
        Ok(())
    }

    /// Phase 1: ask for the PIN, repeatedly if necessary, and verify it at
    /// every involved keyshare server.
    async fn verify_pin(&mut self, mut attempts: i32) -> Result<(), SessionEvent> {
        loop {
            let Some(pin) = self.pin_requestor.request_pin(attempts).await else {
                return Err(SessionEvent::Cancelled);
            };
            match self.verify_pin_attempt(&pin).await {
                Ok(PinAttempt::Success) => {
                    self.emit(SessionEvent::PinOk);
                    return Ok(());
                }
                Ok(PinAttempt::Failure(tries)) => attempts = tries,
                Ok(PinAttempt::Blocked { manager, duration }) => {
                    return Err(SessionEvent::Blocked { manager, duration });
                }
                Err((manager, error)) => {
                    return Err(self.terminal_for(Some(manager), error));
                }
            }
        }
    }

    /// Verify the PIN at each distributed scheme in request order, aborting
    /// at the first non-success. The reported attempt and block counters are
    /// those of the first failing scheme.
    async fn verify_pin_attempt(
        &mut self, pin: &str,
    ) -> Result<PinAttempt, (SchemeManagerIdentifier, SessionError)> {
        for manager in self.distributed.clone() {
            let (record, context) = match (
                self.servers.get_mut(&manager),
                self.contexts.get_mut(&manager),
            ) {
                (Some(record), Some(context)) => (record, context),
                _ => {
                    return Err((
                        manager.clone(),
                        SessionError::new(
                            ErrorType::UnknownSchemeManager,
                            format!("no keyshare record for scheme manager {manager}"),
                        ),
                    ));
                }
            };
            match verify_pin_worker(pin, record, context, self.client).await {
                Ok(PinOutcome::Success) => {}
                Ok(PinOutcome::Failure(tries)) => return Ok(PinAttempt::Failure(tries)),
                Ok(PinOutcome::Blocked(duration)) => {
                    return Ok(PinAttempt::Blocked { manager, duration });
                }
                Err(error) => return Err((manager, error)),
            }
        }
        Ok(PinAttempt::Success)
    }

    /// Phase 2: fetch each keyshare server's commitments for the public keys
    /// in use and merge them into the builders. A 403 means the token went
    /// stale after all; recoverable through a PIN prompt exactly once per
    /// session.
    async fn get_commitments(&mut self) -> Result<(), SessionEvent> {
        match self.try_get_commitments().await {
            Ok(()) => Ok(()),
            Err((manager, error)) => {
                if error.status() == Some(403) && !self.pin_check {
                    tracing::info!(%manager, "keyshare token rejected, asking for PIN and retrying");
                    self.pin_check = true;
                    self.emit(SessionEvent::PinRequired);
                    self.verify_pin(-1).await?;
                    self.try_get_commitments()
                        .await
                        .map_err(|(manager, error)| self.terminal_for(Some(manager), error))
                } else {
                    Err(self.terminal_for(Some(manager), error))
                }
            }
        }
    }

    async fn try_get_commitments(
        &mut self,
    ) -> Result<(), (SchemeManagerIdentifier, SessionError)> {
        // Per scheme, the public keys of the builders living under it.
        let mut keys: HashMap<SchemeManagerIdentifier, Vec<PublicKeyIdentifier>> = HashMap::new();
        for builder in &self.builders.0 {
            let pk = builder.public_key();
            let manager = pk.issuer.scheme_manager();
            if self.configuration.distributed(&manager) {
                keys.entry(manager).or_default().push(pk);
            }
        }

        let mut commitments: HashMap<PublicKeyIdentifier, ProofPCommitment> = HashMap::new();
        for manager in self.distributed.clone() {
            let Some(context) = self.contexts.get(&manager) else { continue };
            let scheme_keys = keys.get(&manager).cloned().unwrap_or_default();
            let response = self
                .client
                .get_commitments(context, &scheme_keys)
                .await
                .map_err(|e| (manager.clone(), e))?;
            commitments.extend(response.commitments);
        }

        // Only merge once every server answered; a failed call above leaves
        // the builders untouched for the retry.
        for builder in &mut self.builders.0 {
            if let Some(commitment) = commitments.get(&builder.public_key()) {
                builder.merge_proof_p_commitment(commitment);
            }
        }
        Ok(())
    }

    /// Phase 3: compute the combined challenge over all builders and collect
    /// each keyshare server's response JWT, then assemble the result.
    async fn get_proof_ps(&mut self) -> Result<KeyshareResult, SessionEvent> {
        let challenge = self.builders.challenge(
            self.request.context(),
            &self.request.nonce(self.timestamp),
            self.request.is_signature(),
        );

        let mut responses: HashMap<SchemeManagerIdentifier, String> = HashMap::new();
        for manager in self.distributed.clone() {
            let Some(context) = self.contexts.get(&manager) else { continue };
            match self.client.get_response(context, &challenge).await {
                Ok(jwt) => {
                    responses.insert(manager, jwt);
                }
                Err(error) => return Err(self.terminal_for(Some(manager), error)),
            }
        }

        self.finish(&challenge, responses)
    }

    /// Phase 4: for issuance, wrap the unmerged proofs and the response JWTs
    /// for the issuer to verify; for disclosure and signing, verify each JWT
    /// here and merge the response shares into the proof list.
    fn finish(
        &self, challenge: &BigUint, responses: HashMap<SchemeManagerIdentifier, String>,
    ) -> Result<KeyshareResult, SessionEvent> {
        if self.request.is_issuance() {
            let proofs = self
                .builders
                .build_distributed_proof_list(challenge, &[])
                .map_err(|e| self.terminal_for(None, e))?;
            let Some(nonce2) = self.issuer_proof_nonce.clone() else {
                return Err(self.terminal_for(
                    None,
                    SessionError::new(ErrorType::Crypto, "issuance session without issuer proof nonce"),
                ));
            };
            let proof_p_jwts =
                responses.into_iter().map(|(m, jwt)| (m.as_str().to_string(), jwt)).collect();
            return Ok(KeyshareResult::IssueCommitment(IssueCommitmentMessage {
                proofs,
                nonce2,
                proof_p_jwts,
            }));
        }

        let mut proof_ps = vec![None; self.builders.len()];
        for (i, builder) in self.builders.0.iter().enumerate() {
            let manager = builder.public_key().issuer.scheme_manager();
            if !self.configuration.distributed(&manager) {
                continue;
            }
            let Some(key) = self.configuration.keyshare_auth_key(&manager) else {
                return Err(self.terminal_for(
                    Some(manager.clone()),
                    SessionError::new(
                        ErrorType::Crypto,
                        format!("no keyshare verification key for scheme manager {manager}"),
                    ),
                ));
            };
            let Some(response) = responses.get(&manager) else {
                return Err(self.terminal_for(
                    Some(manager.clone()),
                    SessionError::new(
                        ErrorType::ServerResponse,
                        format!("missing keyshare response for scheme manager {manager}"),
                    ),
                ));
            };
            let claims: jwt::ProofPClaims = jwt::decode(response, key).map_err(|e| {
                self.terminal_for(
                    Some(manager.clone()),
                    SessionError::new(ErrorType::Crypto, format!("invalid keyshare response JWT: {e}")),
                )
            })?;
            proof_ps[i] = Some(claims.proof_p);
        }

        let proofs = self
            .builders
            .build_distributed_proof_list(challenge, &proof_ps)
            .map_err(|e| self.terminal_for(None, e))?;
        Ok(KeyshareResult::ProofList(proofs))
    }

    /// Map a session error to its terminal event, dispatching on the
    /// server's structured error name when one is present.
    fn terminal_for(
        &self, manager: Option<SchemeManagerIdentifier>, error: SessionError,
    ) -> SessionEvent {
        if let Some(manager_id) = &manager {
            match error.error_name() {
                Some("USER_NOT_FOUND") => {
                    return SessionEvent::EnrollmentDeleted { manager: manager_id.clone() };
                }
                Some("USER_NOT_REGISTERED") => {
                    return SessionEvent::EnrollmentIncomplete { manager: manager_id.clone() };
                }
                Some("USER_BLOCKED") => {
                    let duration = error
                        .remote_error
                        .as_ref()
                        .and_then(|r| r.message.as_deref())
                        .and_then(|m| m.parse().ok())
                        .unwrap_or(-1);
                    return SessionEvent::Blocked { manager: manager_id.clone(), duration };
                }
                _ => {}
            }
        }
        SessionEvent::Error { manager, error }
    }
}
