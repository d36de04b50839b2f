//! # Providers
//!
//! The provider traits through which the engine reaches its collaborators:
//! the keyshare server transport, the issuance server used during
//! enrollment, persistent storage, the PIN dialog, the CL cryptography, and
//! the atomic timestamp service. Implementations own their transports and
//! formats; the engine owns the protocol.

use std::collections::HashMap;
use std::future::Future;

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use crate::attribute::AttributeList;
use crate::credential::Credential;
use crate::error::SessionError;
use crate::identifier::{CredentialTypeIdentifier, PublicKeyIdentifier, SchemeManagerIdentifier};
use crate::keyshare::KeyshareServerRecord;
use crate::log::LogEntry;
use crate::proof::{
    CLSignature, CredentialBuilder, DisclosureBuilder, IssueCommitmentMessage, IssueSignature,
    ProofPCommitment, Timestamp,
};
use crate::request::{IssuanceRequest, Qr};

/// Header carrying the keyshare username.
pub const KSS_USERNAME_HEADER: &str = "X-IRMA-Keyshare-Username";
/// Header carrying the keyshare protocol version.
pub const KSS_VERSION_HEADER: &str = "X-IRMA-Keyshare-ProtocolVersion";
/// Header carrying the bearer token.
pub const KSS_AUTH_HEADER: &str = "Authorization";
/// The keyshare protocol version this engine speaks.
pub const KSS_PROTOCOL_VERSION: &str = "2";

/// PIN endpoint status: the operation succeeded.
pub const PIN_STATUS_SUCCESS: &str = "success";
/// PIN endpoint status: wrong PIN, attempts remain.
pub const PIN_STATUS_FAILURE: &str = "failure";
/// PIN endpoint status: the account is blocked.
pub const PIN_STATUS_ERROR: &str = "error";

/// Everything a transport needs to address one keyshare server on behalf of
/// one enrolled user. The engine keeps the token current; the transport
/// derives the mandatory headers from it.
#[derive(Clone, Debug, Default)]
pub struct KeyshareContext {
    /// Base URL of the keyshare server.
    pub base_url: String,

    /// The enrolled username.
    pub username: String,

    /// Bearer token from the last successful PIN verification.
    pub token: Option<String>,
}

impl KeyshareContext {
    /// The headers every keyshare call after enrollment must carry.
    #[must_use]
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            (KSS_USERNAME_HEADER, self.username.clone()),
            (KSS_VERSION_HEADER, KSS_PROTOCOL_VERSION.to_string()),
        ];
        if let Some(token) = &self.token {
            headers.push((KSS_AUTH_HEADER, format!("Bearer {token}")));
        }
        headers
    }
}

/// Body of `client/register`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct KeyshareEnrollment {
    /// Username; empty at registration, assigned by the server.
    pub username: String,

    /// The hashed PIN.
    pub pin: String,

    /// Optional contact email.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    /// Preferred language for server communication.
    pub language: String,
}

/// Body of `users/verify/pin`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct KeysharePinMessage {
    /// The enrolled username.
    #[serde(rename = "id")]
    pub username: String,

    /// The hashed PIN.
    pub pin: String,
}

/// Body of `users/change/pin`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct KeyshareChangePin {
    /// The enrolled username.
    #[serde(rename = "id")]
    pub username: String,

    /// The hashed current PIN.
    #[serde(rename = "oldpin")]
    pub old_pin: String,

    /// The hashed new PIN.
    #[serde(rename = "newpin")]
    pub new_pin: String,
}

/// Response of the PIN endpoints. `message` carries the token on success,
/// the remaining attempt count on failure, and the block duration in seconds
/// on error.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct KeysharePinStatus {
    /// One of `success`, `failure`, `error`.
    pub status: String,

    /// Status-dependent payload.
    pub message: String,
}

/// Response of `prove/getCommitments`: the server's commitments by public
/// key identifier.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ProofPCommitmentMap {
    /// Commitments keyed by `"<issuer>-<counter>"`.
    #[serde(rename = "c")]
    pub commitments: HashMap<PublicKeyIdentifier, ProofPCommitment>,
}

/// The keyshare server HTTP surface. Implementations map transport failures
/// and non-2xx statuses to [`SessionError`]s, keeping the server's structured
/// error body when one is present.
pub trait KeyshareClient: Send + Sync {
    /// `POST client/register`: register a new user, returning the QR payload
    /// of the issuance session for the login credential.
    fn register(
        &self, base_url: &str, message: &KeyshareEnrollment,
    ) -> impl Future<Output = Result<Qr, SessionError>> + Send;

    /// `POST users/verify/pin`.
    fn verify_pin(
        &self, context: &KeyshareContext, message: &KeysharePinMessage,
    ) -> impl Future<Output = Result<KeysharePinStatus, SessionError>> + Send;

    /// `POST users/change/pin`.
    fn change_pin(
        &self, context: &KeyshareContext, message: &KeyshareChangePin,
    ) -> impl Future<Output = Result<KeysharePinStatus, SessionError>> + Send;

    /// `POST prove/getCommitments` with the public keys in use.
    fn get_commitments(
        &self, context: &KeyshareContext, keys: &[PublicKeyIdentifier],
    ) -> impl Future<Output = Result<ProofPCommitmentMap, SessionError>> + Send;

    /// `POST prove/getResponse` with the challenge (base-10); returns the
    /// raw response JWT.
    fn get_response(
        &self, context: &KeyshareContext, challenge: &BigUint,
    ) -> impl Future<Output = Result<String, SessionError>> + Send;
}

/// The issuance-server surface the enrollment flow drives after keyshare
/// registration.
pub trait IssuerClient: Send + Sync {
    /// Fetch the issuance request behind a QR payload.
    fn start_issuance(
        &self, qr: &Qr,
    ) -> impl Future<Output = anyhow::Result<IssuanceRequest>> + Send;

    /// Post the commitment message, returning one issuance signature per
    /// issued credential.
    fn post_commitments(
        &self, qr: &Qr, message: &IssueCommitmentMessage,
    ) -> impl Future<Output = anyhow::Result<Vec<IssueSignature>>> + Send;
}

/// Client preferences, persisted alongside the credential store.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Preferences {
    /// Whether crash reports may be sent. The reporter itself is the
    /// embedder's concern.
    pub enable_crash_reporting: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Self { enable_crash_reporting: true }
    }
}

/// Persistent storage of the client state. Signatures are stored per
/// credential, keyed by the attribute list's content hash, so they can be
/// loaded on demand during a session instead of at startup.
pub trait ClientStorer: Send + Sync {
    /// Load the master secret, if one was generated before.
    fn load_secret_key(&self) -> impl Future<Output = anyhow::Result<Option<BigUint>>> + Send;

    /// Persist the master secret.
    fn store_secret_key(&self, key: &BigUint) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Load the attribute index of all credentials.
    fn load_attributes(
        &self,
    ) -> impl Future<Output = anyhow::Result<HashMap<CredentialTypeIdentifier, Vec<AttributeList>>>>
           + Send;

    /// Persist the attribute index.
    fn store_attributes(
        &self, attributes: &HashMap<CredentialTypeIdentifier, Vec<AttributeList>>,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Load the keyshare server records.
    fn load_keyshare_servers(
        &self,
    ) -> impl Future<
        Output = anyhow::Result<HashMap<SchemeManagerIdentifier, KeyshareServerRecord>>,
    > + Send;

    /// Persist the keyshare server records.
    fn store_keyshare_servers(
        &self, servers: &HashMap<SchemeManagerIdentifier, KeyshareServerRecord>,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Load the audit trail.
    fn load_logs(&self) -> impl Future<Output = anyhow::Result<Vec<LogEntry>>> + Send;

    /// Persist the audit trail.
    fn store_logs(&self, logs: &[LogEntry]) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Load the preferences, if stored before.
    fn load_preferences(&self) -> impl Future<Output = anyhow::Result<Option<Preferences>>> + Send;

    /// Persist the preferences.
    fn store_preferences(
        &self, preferences: &Preferences,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Persist one credential's signature under the attribute list hash.
    fn store_signature(
        &self, hash: &str, signature: &CLSignature,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Load one credential's signature. `None` when no signature is stored
    /// under the hash.
    fn load_signature(
        &self, hash: &str,
    ) -> impl Future<Output = anyhow::Result<Option<CLSignature>>> + Send;

    /// Delete one credential's signature.
    fn delete_signature(&self, hash: &str) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// The PIN dialog: a bidirectional capability, synchronous with respect to
/// the session. `attempts` is the remaining-attempts count reported by the
/// server, or `-1` on the first prompt when no history is known. `None`
/// means the user cancelled.
pub trait PinRequestor: Send + Sync {
    /// Ask the user for their PIN.
    fn request_pin(&self, attempts: i32) -> impl Future<Output = Option<String>> + Send;
}

/// The CL cryptography: constructs the proof builders whose algebra the
/// engine never touches.
pub trait Prover: Send + Sync {
    /// A disclosure proof builder over a held credential, disclosing the
    /// given indices of the signed attribute vector.
    fn disclosure_builder(
        &self, credential: &Credential, disclosed: &[usize],
    ) -> anyhow::Result<Box<dyn DisclosureBuilder>>;

    /// A builder committing to a future credential under the given issuer
    /// key.
    fn credential_builder(
        &self, public_key: &PublicKeyIdentifier, context: &BigUint, secret: &BigUint,
        issuer_proof_nonce: &BigUint,
    ) -> anyhow::Result<Box<dyn CredentialBuilder>>;
}

/// The atomic timestamp service used by signature sessions.
pub trait Timestamper: Send + Sync {
    /// Obtain a timestamp over the message, the randomized signatures and
    /// the disclosed attributes of a signature session.
    fn timestamp(
        &self, message: &str, signatures: &[BigUint], disclosed: &[Vec<BigUint>],
    ) -> impl Future<Output = anyhow::Result<Timestamp>> + Send;
}
