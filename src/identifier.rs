//! # Identifiers
//!
//! Hierarchical identifiers for schemes, issuers, credential types and
//! attribute types, as dot-separated paths (`scheme.issuer.credential.attribute`),
//! plus the dash-separated public key identifier used on the keyshare wire.

use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorType, SessionError};

macro_rules! identifier {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a raw identifier string.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// The identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

identifier! {
    /// Identifies a scheme manager, e.g. `irma-demo`.
    SchemeManagerIdentifier
}

identifier! {
    /// Identifies an issuer within a scheme, e.g. `irma-demo.RU`.
    IssuerIdentifier
}

identifier! {
    /// Identifies a credential type, e.g. `irma-demo.RU.studentCard`.
    CredentialTypeIdentifier
}

identifier! {
    /// Identifies an attribute type, e.g. `irma-demo.RU.studentCard.studentID`.
    ///
    /// An identifier with only three segments refers to the credential as a
    /// whole ("credential present") rather than to a specific attribute.
    AttributeTypeIdentifier
}

fn parent(s: &str) -> &str {
    s.rsplit_once('.').map_or(s, |(head, _)| head)
}

impl IssuerIdentifier {
    /// The scheme manager this issuer belongs to.
    #[must_use]
    pub fn scheme_manager(&self) -> SchemeManagerIdentifier {
        SchemeManagerIdentifier::new(parent(&self.0))
    }
}

impl CredentialTypeIdentifier {
    /// The issuer of this credential type.
    #[must_use]
    pub fn issuer(&self) -> IssuerIdentifier {
        IssuerIdentifier::new(parent(&self.0))
    }

    /// The scheme manager this credential type falls under.
    #[must_use]
    pub fn scheme_manager(&self) -> SchemeManagerIdentifier {
        self.issuer().scheme_manager()
    }

    /// The attribute type identifier for the named attribute of this type.
    #[must_use]
    pub fn attribute(&self, name: &str) -> AttributeTypeIdentifier {
        AttributeTypeIdentifier::new(format!("{}.{name}", self.0))
    }
}

impl AttributeTypeIdentifier {
    /// Whether this identifier refers to a credential as a whole rather than
    /// to one of its attributes.
    #[must_use]
    pub fn is_credential(&self) -> bool {
        self.0.matches('.').count() == 2
    }

    /// The credential type this attribute belongs to.
    #[must_use]
    pub fn credential_type(&self) -> CredentialTypeIdentifier {
        if self.is_credential() {
            CredentialTypeIdentifier::new(self.0.as_str())
        } else {
            CredentialTypeIdentifier::new(parent(&self.0))
        }
    }

    /// The attribute name, i.e. the last path segment. `None` when the
    /// identifier refers to the credential as a whole.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        if self.is_credential() {
            None
        } else {
            self.0.rsplit_once('.').map(|(_, name)| name)
        }
    }
}

/// Identifies one public key of an issuer. The counter increments every time
/// the issuer rotates keys, and credentials record which counter they were
/// signed under.
///
/// Serializes as `"<issuer>-<counter>"`; the issuer identifier contains dots
/// but never a trailing dash-digit suffix, so parsing splits on the last dash.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKeyIdentifier {
    /// The issuer owning the key.
    pub issuer: IssuerIdentifier,
    /// The issuer's key rotation counter.
    pub counter: u32,
}

impl PublicKeyIdentifier {
    /// Create an identifier from its parts.
    pub fn new(issuer: impl Into<IssuerIdentifier>, counter: u32) -> Self {
        Self { issuer: issuer.into(), counter }
    }
}

impl Display for PublicKeyIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.issuer, self.counter)
    }
}

impl FromStr for PublicKeyIdentifier {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((issuer, counter)) = s.rsplit_once('-') else {
            return Err(SessionError::new(
                ErrorType::ServerResponse,
                format!("invalid public key identifier: {s}"),
            ));
        };
        let counter = counter.parse().map_err(|_| {
            SessionError::new(
                ErrorType::ServerResponse,
                format!("invalid public key counter: {s}"),
            )
        })?;
        Ok(Self { issuer: IssuerIdentifier::new(issuer), counter })
    }
}

impl Serialize for PublicKeyIdentifier {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PublicKeyIdentifier {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Points to a credential instance held by the client, by type and
/// attribute-list content hash.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub struct CredentialIdentifier {
    /// The credential type.
    #[serde(rename = "type")]
    pub credential_type: CredentialTypeIdentifier,
    /// Content hash of the instance's attribute list.
    pub hash: String,
}

/// Points to one attribute of a credential instance held by the client.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub struct AttributeIdentifier {
    /// The attribute type.
    #[serde(rename = "type")]
    pub attribute_type: AttributeTypeIdentifier,
    /// Content hash of the containing credential's attribute list.
    pub credential_hash: String,
}

impl AttributeIdentifier {
    /// The credential instance this attribute belongs to.
    #[must_use]
    pub fn credential_identifier(&self) -> CredentialIdentifier {
        CredentialIdentifier {
            credential_type: self.attribute_type.credential_type(),
            hash: self.credential_hash.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_hierarchy() {
        let attr = AttributeTypeIdentifier::from("irma-demo.RU.studentCard.studentID");
        assert!(!attr.is_credential());
        assert_eq!(attr.name(), Some("studentID"));
        assert_eq!(attr.credential_type().as_str(), "irma-demo.RU.studentCard");
        assert_eq!(attr.credential_type().issuer().as_str(), "irma-demo.RU");
        assert_eq!(attr.credential_type().scheme_manager().as_str(), "irma-demo");

        let cred_ref = AttributeTypeIdentifier::from("irma-demo.RU.studentCard");
        assert!(cred_ref.is_credential());
        assert_eq!(cred_ref.name(), None);
        assert_eq!(cred_ref.credential_type().as_str(), "irma-demo.RU.studentCard");
    }

    #[test]
    fn public_key_identifier_round_trip() {
        let pki: PublicKeyIdentifier = "irma-demo.RU-7".parse().expect("should parse");
        assert_eq!(pki.issuer.as_str(), "irma-demo.RU");
        assert_eq!(pki.counter, 7);
        assert_eq!(pki.to_string(), "irma-demo.RU-7");

        // Issuers containing dashes split on the last dash only.
        let pki: PublicKeyIdentifier = "irma-demo.some-issuer-2".parse().expect("should parse");
        assert_eq!(pki.issuer.as_str(), "irma-demo.some-issuer");
        assert_eq!(pki.counter, 2);

        assert!("nodash".parse::<PublicKeyIdentifier>().is_err());
        assert!("issuer-notanumber".parse::<PublicKeyIdentifier>().is_err());
    }

    #[test]
    fn public_key_identifier_as_json_map_key() {
        let mut map = std::collections::HashMap::new();
        map.insert(PublicKeyIdentifier::new("irma-demo.RU", 2), 1u8);
        let json = serde_json::to_string(&map).expect("should serialize");
        assert_eq!(json, r#"{"irma-demo.RU-2":1}"#);
        let back: std::collections::HashMap<PublicKeyIdentifier, u8> =
            serde_json::from_str(&json).expect("should deserialize");
        assert_eq!(back, map);
    }
}
