//! # Session requests
//!
//! The three session request kinds (disclosure, attribute-based signature,
//! issuance), the legacy disjunction model verifiers use to ask for
//! attributes, and the shapes a finished session produces.

use std::collections::HashMap;

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::attribute::{encode_attribute, AttributeList, MetadataAttribute};
use crate::configuration::Configuration;
use crate::identifier::{
    AttributeIdentifier, AttributeTypeIdentifier, CredentialIdentifier,
    CredentialTypeIdentifier, SchemeManagerIdentifier,
};
use crate::proof::{bigint_string, Proof, Timestamp};

/// Default validity of newly issued credentials, in days, when the request
/// does not specify one.
pub const DEFAULT_VALIDITY_DAYS: u32 = 365;

/// A disjunction of requested attributes: the user satisfies it by disclosing
/// any one of `attributes`, optionally constrained to a required value.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct AttributeDisjunction {
    /// Display label for the request.
    #[serde(default)]
    pub label: String,

    /// The acceptable attribute types, in the verifier's preference order.
    pub attributes: Vec<AttributeTypeIdentifier>,

    /// Required values by attribute type. A missing entry or an explicit
    /// `null` places no constraint on the value.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub values: HashMap<AttributeTypeIdentifier, Option<String>>,
}

impl AttributeDisjunction {
    /// Whether the disjunction constrains any attribute values.
    #[must_use]
    pub fn has_values(&self) -> bool {
        !self.values.is_empty()
    }
}

/// The attributes the user chose to disclose, one per satisfied disjunction.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct DisclosureChoice {
    /// The chosen attributes.
    pub attributes: Vec<AttributeIdentifier>,
}

/// Locates one disclosed attribute within the proof list sent to the
/// verifier: which disclosure proof, and which index of the signed attribute
/// vector.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct DisclosedAttributeIndex {
    /// Index of the credential's proof among the disclosure proofs.
    #[serde(rename = "cred")]
    pub credential_index: usize,

    /// Index within the signed attribute vector (metadata is 1; typed values
    /// start at 2).
    #[serde(rename = "attr")]
    pub attribute_index: usize,

    /// The credential instance disclosed from.
    #[serde(skip)]
    pub identifier: Option<CredentialIdentifier>,
}

/// Per chosen attribute, where it ended up in the proof list.
pub type DisclosedAttributeIndices = Vec<Vec<DisclosedAttributeIndex>>;

/// A finished disclosure: the proof list plus the index map the verifier
/// needs to locate each disclosed attribute.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Disclosure {
    /// The proofs, one per disclosed credential.
    pub proofs: Vec<Proof>,

    /// Index map, aligned with the user's choice.
    pub indices: DisclosedAttributeIndices,
}

/// A request to disclose attributes to a verifier.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct DisclosureRequest {
    /// The session context.
    #[serde(with = "bigint_string")]
    pub context: BigUint,

    /// The verifier's nonce.
    #[serde(with = "bigint_string")]
    pub nonce: BigUint,

    /// The requested disjunctions, all of which must be satisfied.
    pub content: Vec<AttributeDisjunction>,
}

/// A request to create an attribute-based signature over a message.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct SignatureRequest {
    /// The session context.
    #[serde(with = "bigint_string")]
    pub context: BigUint,

    /// The requestor's nonce.
    #[serde(with = "bigint_string")]
    pub nonce: BigUint,

    /// The requested disjunctions to sign with.
    pub content: Vec<AttributeDisjunction>,

    /// The message to sign.
    pub message: String,

    /// The atomic timestamp, set during proof builder assembly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
}

impl SignatureRequest {
    /// The nonce actually signed: the request nonce bound to the message and,
    /// when present, the atomic timestamp.
    #[must_use]
    pub fn signature_nonce(&self, timestamp: Option<&Timestamp>) -> BigUint {
        let mut hasher = Sha256::new();
        let nonce_bytes = self.nonce.to_bytes_be();
        hasher.update(u32::try_from(nonce_bytes.len()).unwrap_or(u32::MAX).to_be_bytes());
        hasher.update(&nonce_bytes);
        hasher.update(Sha256::digest(self.message.as_bytes()));
        if let Some(ts) = timestamp.or(self.timestamp.as_ref()) {
            hasher.update(ts.time.to_be_bytes());
        }
        BigUint::from_bytes_be(&hasher.finalize())
    }
}

/// One credential to be issued.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct CredentialRequest {
    /// The credential type to issue.
    #[serde(rename = "credential")]
    pub credential_type: CredentialTypeIdentifier,

    /// The issuer key counter to sign under.
    #[serde(rename = "keyCounter", default)]
    pub key_counter: u32,

    /// Validity in days; defaults to [`DEFAULT_VALIDITY_DAYS`].
    #[serde(rename = "validity", default, skip_serializing_if = "Option::is_none")]
    pub validity_days: Option<u32>,

    /// Attribute values by name.
    pub attributes: HashMap<String, String>,
}

impl CredentialRequest {
    /// The attribute list this request materializes into: metadata first,
    /// then the declared attributes in order (absent values encode as empty).
    pub fn attribute_list(&self, configuration: &Configuration) -> anyhow::Result<AttributeList> {
        let credential_type = configuration
            .credential_type(&self.credential_type)
            .ok_or_else(|| anyhow::anyhow!("unknown credential type {}", self.credential_type))?;
        let metadata = MetadataAttribute::new(
            self.credential_type.clone(),
            self.key_counter,
            self.validity_days.unwrap_or(DEFAULT_VALIDITY_DAYS),
        );
        let mut ints = Vec::with_capacity(credential_type.attributes.len() + 1);
        ints.push(metadata.to_int());
        for attr_type in &credential_type.attributes {
            let value = self.attributes.get(&attr_type.id).map_or("", String::as_str);
            ints.push(encode_attribute(value));
        }
        Ok(AttributeList::new(ints))
    }
}

/// A request to issue credentials, possibly disclosing attributes alongside.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct IssuanceRequest {
    /// The session context.
    #[serde(with = "bigint_string")]
    pub context: BigUint,

    /// The issuer's nonce.
    #[serde(with = "bigint_string")]
    pub nonce: BigUint,

    /// The credentials to be issued.
    pub credentials: Vec<CredentialRequest>,

    /// Disjunctions to disclose during issuance.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disclose: Vec<AttributeDisjunction>,
}

/// Any of the three session request kinds.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum SessionRequest {
    /// Disclose attributes to a verifier.
    Disclosure(DisclosureRequest),
    /// Create an attribute-based signature.
    Signature(SignatureRequest),
    /// Obtain new credentials from an issuer.
    Issuance(IssuanceRequest),
}

impl SessionRequest {
    /// The session context.
    #[must_use]
    pub fn context(&self) -> &BigUint {
        match self {
            Self::Disclosure(r) => &r.context,
            Self::Signature(r) => &r.context,
            Self::Issuance(r) => &r.context,
        }
    }

    /// The nonce the challenge is computed against. For signature sessions
    /// this binds the message and timestamp.
    #[must_use]
    pub fn nonce(&self, timestamp: Option<&Timestamp>) -> BigUint {
        match self {
            Self::Disclosure(r) => r.nonce.clone(),
            Self::Signature(r) => r.signature_nonce(timestamp),
            Self::Issuance(r) => r.nonce.clone(),
        }
    }

    /// The disjunctions the request asks to disclose.
    #[must_use]
    pub fn disjunctions(&self) -> &[AttributeDisjunction] {
        match self {
            Self::Disclosure(r) => &r.content,
            Self::Signature(r) => &r.content,
            Self::Issuance(r) => &r.disclose,
        }
    }

    /// Whether this is a signature request.
    #[must_use]
    pub fn is_signature(&self) -> bool {
        matches!(self, Self::Signature(_))
    }

    /// Whether this is an issuance request.
    #[must_use]
    pub fn is_issuance(&self) -> bool {
        matches!(self, Self::Issuance(_))
    }

    /// Every scheme manager the request touches, deduplicated, in request
    /// order (issued credentials first for issuance, then disclosures).
    #[must_use]
    pub fn scheme_managers(&self) -> Vec<SchemeManagerIdentifier> {
        let mut schemes = Vec::new();
        let mut push = |id: SchemeManagerIdentifier| {
            if !schemes.contains(&id) {
                schemes.push(id);
            }
        };
        if let Self::Issuance(r) = self {
            for credential in &r.credentials {
                push(credential.credential_type.scheme_manager());
            }
        }
        for disjunction in self.disjunctions() {
            for attribute in &disjunction.attributes {
                push(attribute.credential_type().scheme_manager());
            }
        }
        schemes
    }
}

/// The QR payload pointing at a session, as returned by keyshare server
/// registration.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Qr {
    /// The session URL.
    #[serde(rename = "u")]
    pub url: String,

    /// The session kind, e.g. `issuing`.
    #[serde(rename = "irmaqr")]
    pub session_type: String,
}

#[cfg(test)]
mod tests {
    use num_traits::FromPrimitive;

    use super::*;

    fn disjunction(attrs: &[&str]) -> AttributeDisjunction {
        AttributeDisjunction {
            label: String::new(),
            attributes: attrs.iter().map(|a| AttributeTypeIdentifier::from(*a)).collect(),
            values: HashMap::new(),
        }
    }

    #[test]
    fn scheme_managers_in_request_order() {
        let request = SessionRequest::Issuance(IssuanceRequest {
            context: BigUint::from_u64(1).unwrap(),
            nonce: BigUint::from_u64(2).unwrap(),
            credentials: vec![CredentialRequest {
                credential_type: CredentialTypeIdentifier::from("test.test.mijnirma"),
                key_counter: 0,
                validity_days: None,
                attributes: HashMap::new(),
            }],
            disclose: vec![
                disjunction(&["irma-demo.RU.studentCard.studentID"]),
                disjunction(&["test.test.mijnirma.email"]),
            ],
        });
        let schemes: Vec<_> =
            request.scheme_managers().into_iter().map(|s| s.as_str().to_string()).collect();
        assert_eq!(schemes, vec!["test", "irma-demo"]);
    }

    #[test]
    fn signature_nonce_binds_message_and_timestamp() {
        let request = SignatureRequest {
            context: BigUint::from_u64(1).unwrap(),
            nonce: BigUint::from_u64(2).unwrap(),
            content: vec![],
            message: "hello".into(),
            timestamp: None,
        };
        let plain = request.signature_nonce(None);

        let mut other = request.clone();
        other.message = "world".into();
        assert_ne!(plain, other.signature_nonce(None));

        let ts = Timestamp { time: 1_700_000_000, evidence: serde_json::Value::Null };
        assert_ne!(plain, request.signature_nonce(Some(&ts)));
    }
}
