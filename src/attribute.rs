//! # Attributes
//!
//! The attribute list of a credential instance and the packed metadata
//! attribute. The metadata attribute is always the first integer of the list
//! and encodes the credential type, format version, signing date, validity
//! and the issuer key counter; the remaining integers are the typed attribute
//! values in declared order.

use anyhow::{anyhow, bail};
use base64ct::{Base64, Encoding};
use chrono::{DateTime, TimeZone, Utc};
use num_bigint::BigUint;
use num_traits::Zero;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::configuration::Configuration;
use crate::identifier::{AttributeTypeIdentifier, CredentialTypeIdentifier};

/// Current metadata attribute format version.
pub const METADATA_VERSION: u8 = 0x03;

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

/// Encode a string attribute value into its integer representation.
#[must_use]
pub fn encode_attribute(value: &str) -> BigUint {
    BigUint::from_bytes_be(value.as_bytes())
}

/// Decode an attribute integer back into its string value. Returns `None`
/// when the bytes are not valid UTF-8.
#[must_use]
pub fn decode_attribute(value: &BigUint) -> Option<String> {
    if value.is_zero() {
        return Some(String::new());
    }
    String::from_utf8(value.to_bytes_be()).ok()
}

/// The metadata attribute packed into the first integer of every attribute
/// list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetadataAttribute {
    /// Format version. Must be nonzero so the leading byte survives the
    /// integer round trip.
    pub version: u8,
    /// Signing date, in days since the Unix epoch.
    pub signing_date: u32,
    /// Validity starting at the signing date, in days.
    pub validity_days: u32,
    /// The issuer key counter the credential was signed under.
    pub key_counter: u32,
    /// The credential type.
    pub credential_type: CredentialTypeIdentifier,
}

impl MetadataAttribute {
    /// Metadata for a credential signed now, valid for `validity_days`.
    #[must_use]
    pub fn new(
        credential_type: CredentialTypeIdentifier, key_counter: u32, validity_days: u32,
    ) -> Self {
        let days = u32::try_from(Utc::now().timestamp() / SECONDS_PER_DAY).unwrap_or(0);
        Self {
            version: METADATA_VERSION,
            signing_date: days,
            validity_days,
            key_counter,
            credential_type,
        }
    }

    /// Pack into the attribute integer.
    #[must_use]
    pub fn to_int(&self) -> BigUint {
        let mut bytes = Vec::with_capacity(13 + self.credential_type.as_str().len());
        bytes.push(self.version);
        bytes.extend_from_slice(&self.signing_date.to_be_bytes());
        bytes.extend_from_slice(&self.validity_days.to_be_bytes());
        bytes.extend_from_slice(&self.key_counter.to_be_bytes());
        bytes.extend_from_slice(self.credential_type.as_str().as_bytes());
        BigUint::from_bytes_be(&bytes)
    }

    /// Unpack from the attribute integer.
    pub fn from_int(value: &BigUint) -> anyhow::Result<Self> {
        let bytes = value.to_bytes_be();
        if bytes.len() < 13 {
            bail!("metadata attribute too short: {} bytes", bytes.len());
        }
        let version = bytes[0];
        if version == 0 {
            bail!("metadata attribute version must be nonzero");
        }
        let word =
            |i: usize| u32::from_be_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        let credential_type = std::str::from_utf8(&bytes[13..])
            .map_err(|e| anyhow!("metadata credential type not UTF-8: {e}"))?;
        Ok(Self {
            version,
            signing_date: word(1),
            validity_days: word(5),
            key_counter: word(9),
            credential_type: CredentialTypeIdentifier::new(credential_type),
        })
    }

    /// The moment the credential was signed.
    #[must_use]
    pub fn signed_on(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(i64::from(self.signing_date) * SECONDS_PER_DAY, 0)
            .single()
            .unwrap_or_default()
    }

    /// The moment the credential expires.
    #[must_use]
    pub fn expiry(&self) -> DateTime<Utc> {
        let days = i64::from(self.signing_date) + i64::from(self.validity_days);
        Utc.timestamp_opt(days * SECONDS_PER_DAY, 0).single().unwrap_or_default()
    }

    /// Whether the credential is valid at the given moment.
    #[must_use]
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry() > now
    }
}

/// The attribute integers of one credential instance, metadata attribute
/// first. The user's secret key (attribute zero of the signed vector) is
/// never part of this list.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct AttributeList {
    /// The attribute integers, metadata first.
    pub ints: Vec<BigUint>,
}

impl AttributeList {
    /// Wrap a raw attribute vector.
    #[must_use]
    pub fn new(ints: Vec<BigUint>) -> Self {
        Self { ints }
    }

    /// Parse the metadata attribute.
    pub fn metadata(&self) -> anyhow::Result<MetadataAttribute> {
        let first = self.ints.first().ok_or_else(|| anyhow!("empty attribute list"))?;
        MetadataAttribute::from_int(first)
    }

    /// The credential type recorded in the metadata attribute.
    #[must_use]
    pub fn credential_type_id(&self) -> Option<CredentialTypeIdentifier> {
        self.metadata().ok().map(|m| m.credential_type)
    }

    /// The issuer public key identifier this instance was signed under.
    #[must_use]
    pub fn public_key_identifier(&self) -> Option<crate::identifier::PublicKeyIdentifier> {
        let metadata = self.metadata().ok()?;
        Some(crate::identifier::PublicKeyIdentifier {
            issuer: metadata.credential_type.issuer(),
            counter: metadata.key_counter,
        })
    }

    /// Whether the instance is valid now (metadata-derived expiry).
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.metadata().is_ok_and(|m| m.is_valid_at(Utc::now()))
    }

    /// Stable content hash identifying this instance:
    /// base64 of sha256 over the length-prefixed big-endian attribute bytes.
    #[must_use]
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        for int in &self.ints {
            let bytes = int.to_bytes_be();
            hasher.update(u32::try_from(bytes.len()).unwrap_or(u32::MAX).to_be_bytes());
            hasher.update(&bytes);
        }
        Base64::encode_string(&hasher.finalize())
    }

    /// The raw string value of the requested attribute, or `None` when this
    /// list does not contain it.
    #[must_use]
    pub fn untranslated_attribute(
        &self, attribute: &AttributeTypeIdentifier, configuration: &Configuration,
    ) -> Option<String> {
        let credential_type = configuration.credential_type(&attribute.credential_type())?;
        let index = credential_type.index_of(attribute.name()?)?;
        // Typed values start after the metadata attribute.
        self.ints.get(index + 1).and_then(decode_attribute)
    }

    /// Displayable information about this instance, or `None` when the
    /// credential type is not (or no longer) in the configuration.
    #[must_use]
    pub fn info(&self, configuration: &Configuration) -> Option<CredentialInfo> {
        let metadata = self.metadata().ok()?;
        let credential_type = configuration.credential_type(&metadata.credential_type)?;
        let attributes = credential_type
            .attributes
            .iter()
            .enumerate()
            .map(|(i, attr_type)| {
                let value = self.ints.get(i + 1).and_then(decode_attribute).unwrap_or_default();
                (attr_type.id.clone(), value)
            })
            .collect();
        Some(CredentialInfo {
            credential_type: metadata.credential_type.clone(),
            hash: self.hash(),
            signed_on: metadata.signed_on(),
            expires: metadata.expiry(),
            attributes,
        })
    }
}

/// Displayable information about one stored credential instance.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct CredentialInfo {
    /// The credential type.
    pub credential_type: CredentialTypeIdentifier,
    /// Content hash of the attribute list.
    pub hash: String,
    /// Signing date.
    pub signed_on: DateTime<Utc>,
    /// Expiry date.
    pub expires: DateTime<Utc>,
    /// Attribute names and raw values, in declared order.
    pub attributes: Vec<(String, String)>,
}
