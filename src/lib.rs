//! # IRMA holder
//!
//! The client-side engine of an IRMA attribute-based-credential ecosystem.
//! Users hold anonymous credentials and present selective disclosures or
//! issuance commitments to verifiers and issuers. The cryptographic core of
//! the user's secret key can be split between the device and a remote
//! keyshare server: the user authenticates to the keyshare server with a
//! PIN, and the server contributes its share into the zero-knowledge proofs
//! the device produces. No single party can forge proofs alone.
//!
//! The crate does not provide a user interface, persistence formats or HTTP
//! plumbing; that is the job of an embedding wallet. Embedders implement
//! the traits in [`provider`] (storage, keyshare and issuer transports, the
//! PIN dialog, the CL cryptography, atomic timestamping) and drive sessions
//! through [`Client`].
//!
//! # Design
//!
//! **Client.** [`Client`] owns the in-memory credential store: the attribute
//! index, the lazily materialized credentials (CL signatures load from
//! storage on first access), the keyshare enrollments and the audit trail.
//! It answers a verifier's request with candidate attributes, groups the
//! user's choice into per-credential proof builders, and runs enrollment and
//! PIN-change flows on background tasks.
//!
//! **Keyshare sessions.** [`keyshare::start_keyshare_session`] drives the
//! three-phase distributed-proof protocol (PIN verification, commitments,
//! responses) against every keyshare server a session involves. Progress and
//! outcome are delivered as [`keyshare::SessionEvent`]s over a channel; the
//! PIN dialog is the separate bidirectional
//! [`provider::PinRequestor`] capability.

pub mod attribute;
pub mod client;
pub mod configuration;
pub mod credential;
pub mod error;
pub mod identifier;
pub mod jwt;
pub mod keyshare;
pub mod log;
pub mod proof;
pub mod provider;
pub mod request;

pub use client::{Client, ClientEvent, Provider};
pub use configuration::Configuration;
pub use credential::Credential;
pub use error::{ConfigError, EnrollmentError, ErrorType, RemoteError, SessionError};
pub use identifier::{
    AttributeIdentifier, AttributeTypeIdentifier, CredentialIdentifier,
    CredentialTypeIdentifier, IssuerIdentifier, PublicKeyIdentifier, SchemeManagerIdentifier,
};
pub use keyshare::{KeyshareResult, KeyshareServerRecord, SessionEvent};
pub use request::{
    AttributeDisjunction, DisclosureChoice, DisclosureRequest, IssuanceRequest, SessionRequest,
    SignatureRequest,
};
