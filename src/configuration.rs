//! # Configuration
//!
//! The in-memory view of the scheme configuration: scheme managers, the
//! credential types they define, the issuer public keys the client knows of,
//! and the verification keys of keyshare servers. Parsing and updating the
//! configuration from scheme files is the embedder's concern; the engine only
//! consults it by identifier.

use std::collections::{HashMap, HashSet};
use std::fmt;

use jsonwebtoken::{Algorithm, DecodingKey};

use crate::identifier::{
    CredentialTypeIdentifier, PublicKeyIdentifier, SchemeManagerIdentifier,
};

/// A scheme manager: the federation-level trust anchor grouping issuers.
#[derive(Clone, Debug)]
pub struct SchemeManager {
    /// The scheme's identifier.
    pub id: SchemeManagerIdentifier,
    /// Base URL of the scheme's keyshare server. Present iff the scheme is
    /// distributed.
    pub keyshare_server: Option<String>,
}

impl SchemeManager {
    /// Whether credentials under this scheme require keyshare participation.
    #[must_use]
    pub fn distributed(&self) -> bool {
        self.keyshare_server.as_deref().is_some_and(|url| !url.is_empty())
    }
}

/// One attribute declared by a credential type, in declaration order.
#[derive(Clone, Debug)]
pub struct AttributeType {
    /// The attribute name (last identifier segment).
    pub id: String,
}

/// A credential type as declared by its scheme.
#[derive(Clone, Debug)]
pub struct CredentialType {
    /// The type's identifier.
    pub id: CredentialTypeIdentifier,
    /// Whether a user may hold at most one instance of this type.
    pub singleton: bool,
    /// The declared attributes, in order.
    pub attributes: Vec<AttributeType>,
}

impl CredentialType {
    /// Position of the named attribute in the declared attribute order.
    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.attributes.iter().position(|a| a.id == name)
    }
}

/// Verification key for the JWTs a keyshare server signs (auth tokens and
/// `ProofP` responses).
#[derive(Clone)]
pub struct KeyshareAuthKey {
    /// The signing algorithm the server uses.
    pub algorithm: Algorithm,
    /// The verification key.
    pub key: DecodingKey,
}

impl KeyshareAuthKey {
    /// A key from an RSA public key in PEM form, as shipped in scheme files.
    pub fn from_rsa_pem(pem: &[u8]) -> Result<Self, jsonwebtoken::errors::Error> {
        Ok(Self { algorithm: Algorithm::RS256, key: DecodingKey::from_rsa_pem(pem)? })
    }

    /// An HMAC key from a shared secret.
    #[must_use]
    pub fn from_secret(secret: &[u8]) -> Self {
        Self { algorithm: Algorithm::HS256, key: DecodingKey::from_secret(secret) }
    }
}

impl fmt::Debug for KeyshareAuthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyshareAuthKey").field("algorithm", &self.algorithm).finish_non_exhaustive()
    }
}

/// The complete scheme configuration the client operates against.
#[derive(Clone, Debug, Default)]
pub struct Configuration {
    /// Scheme managers by identifier.
    pub scheme_managers: HashMap<SchemeManagerIdentifier, SchemeManager>,
    /// Credential types by identifier.
    pub credential_types: HashMap<CredentialTypeIdentifier, CredentialType>,
    /// The issuer public keys known to the client. Key material lives with
    /// the cryptographic provider; the configuration only answers presence.
    pub public_keys: HashSet<PublicKeyIdentifier>,
    /// Keyshare server JWT verification keys by scheme.
    pub keyshare_keys: HashMap<SchemeManagerIdentifier, KeyshareAuthKey>,
}

impl Configuration {
    /// Whether the configuration declares the given credential type.
    #[must_use]
    pub fn contains(&self, id: &CredentialTypeIdentifier) -> bool {
        self.credential_types.contains_key(id)
    }

    /// Look up a scheme manager.
    #[must_use]
    pub fn scheme_manager(&self, id: &SchemeManagerIdentifier) -> Option<&SchemeManager> {
        self.scheme_managers.get(id)
    }

    /// Look up a credential type.
    #[must_use]
    pub fn credential_type(&self, id: &CredentialTypeIdentifier) -> Option<&CredentialType> {
        self.credential_types.get(id)
    }

    /// Whether the given scheme is known and distributed.
    #[must_use]
    pub fn distributed(&self, id: &SchemeManagerIdentifier) -> bool {
        self.scheme_manager(id).is_some_and(SchemeManager::distributed)
    }

    /// Whether the client knows the issuer public key with this identifier.
    #[must_use]
    pub fn contains_public_key(&self, id: &PublicKeyIdentifier) -> bool {
        self.public_keys.contains(id)
    }

    /// The JWT verification key of the given scheme's keyshare server.
    #[must_use]
    pub fn keyshare_auth_key(&self, id: &SchemeManagerIdentifier) -> Option<&KeyshareAuthKey> {
        self.keyshare_keys.get(id)
    }
}
