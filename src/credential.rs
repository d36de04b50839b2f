//! # Credential
//!
//! A credential held by the client: the full signed attribute vector (secret
//! key first), the CL signature over it, and the issuer key it was signed
//! under.

use anyhow::bail;
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use crate::attribute::AttributeList;
use crate::identifier::{CredentialTypeIdentifier, PublicKeyIdentifier};
use crate::proof::CLSignature;

/// A credential instance with its signature. The attribute vector is
/// `[secret key, metadata, typed values...]`; the secret key is shared by all
/// of the client's credentials.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Credential {
    /// The signed attribute vector, secret key first.
    pub attributes: Vec<BigUint>,

    /// The CL signature over the attribute vector.
    pub signature: CLSignature,

    /// The issuer public key the signature verifies under.
    pub public_key: PublicKeyIdentifier,
}

impl Credential {
    /// Assemble a credential. The attribute vector must contain at least the
    /// secret key and the metadata attribute.
    pub fn new(
        attributes: Vec<BigUint>, signature: CLSignature, public_key: PublicKeyIdentifier,
    ) -> anyhow::Result<Self> {
        if attributes.len() < 2 {
            bail!("credential attribute vector too short: {} entries", attributes.len());
        }
        Ok(Self { attributes, signature, public_key })
    }

    /// The user's secret key (attribute zero).
    #[must_use]
    pub fn secret_key(&self) -> &BigUint {
        &self.attributes[0]
    }

    /// The attribute list without the secret key, as stored and displayed.
    #[must_use]
    pub fn attribute_list(&self) -> AttributeList {
        AttributeList::new(self.attributes[1..].to_vec())
    }

    /// The credential type recorded in the metadata attribute.
    #[must_use]
    pub fn credential_type_id(&self) -> Option<CredentialTypeIdentifier> {
        self.attribute_list().credential_type_id()
    }
}
