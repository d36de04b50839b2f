//! # Proof contract
//!
//! The boundary with the underlying CL-cryptography library. The data types
//! here mirror its wire serialization, and the [`DisclosureBuilder`] /
//! [`CredentialBuilder`] traits are the operations the engine needs from it.
//! The engine itself owns only the distributed-protocol plumbing over those
//! traits: computing the combined Fiat-Shamir challenge across builders and
//! positioning keyshare server contributions in the proof list. No group
//! arithmetic lives in this crate.

use std::collections::HashMap;

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::credential::Credential;
use crate::error::{ErrorType, SessionError};
use crate::identifier::PublicKeyIdentifier;

/// System parameters of the consumed cryptography, sized per the issuer key
/// lengths in use.
pub mod params {
    /// Bit length of the user's master secret (the `l_m` parameter of the
    /// 1024-bit system parameters).
    pub const SECRET_KEY_BITS: u64 = 256;

    /// Bit length of the statistical zero-knowledge nonce the issuer must use
    /// in its proof of correctness (the `l_statzk` parameter of the 4096-bit
    /// system parameters).
    pub const ISSUER_PROOF_NONCE_BITS: u64 = 128;
}

/// Serialize big integers as base-10 strings, the form all wire formats and
/// persisted shapes use.
pub mod bigint_string {
    use num_bigint::BigUint;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &BigUint, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&value.to_str_radix(10))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigUint, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(|_| de::Error::custom(format!("invalid big integer: {s}")))
    }
}

/// A keyshare server's commitment contribution: the first message of its
/// share of the Schnorr proof.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ProofPCommitment {
    /// The server's share of the public component.
    #[serde(rename = "P", with = "bigint_string")]
    pub p: BigUint,

    /// The server's commitment.
    #[serde(rename = "Pcommit", with = "bigint_string")]
    pub p_commit: BigUint,
}

/// A keyshare server's response contribution: its share of the Schnorr
/// response, delivered inside a JWT it signs.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ProofP {
    /// The server's share of the public component.
    #[serde(rename = "P", with = "bigint_string")]
    pub p: BigUint,

    /// The challenge the server responded to.
    #[serde(rename = "c", with = "bigint_string")]
    pub c: BigUint,

    /// The server's response share.
    #[serde(rename = "s_response", with = "bigint_string")]
    pub s_response: BigUint,
}

/// One finished proof as produced by the library. Opaque to the engine; it is
/// positioned in proof lists and shipped to the verifier or issuer.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Proof(pub serde_json::Value);

/// A credential's CL signature as persisted. Opaque to the engine.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct CLSignature(pub serde_json::Value);

/// The issuer's signature message completing an issuance, one per new
/// credential. Opaque to the engine; consumed by
/// [`CredentialBuilder::construct_credential`].
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct IssueSignature(pub serde_json::Value);

/// The commitment message the client sends to an issuer, with the keyshare
/// servers' response JWTs attached for the issuer to verify and merge.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct IssueCommitmentMessage {
    /// The combined proofs of the credential builders and any disclosures.
    #[serde(rename = "combinedProofs")]
    pub proofs: Vec<Proof>,

    /// The nonce against which the issuer's proof of correctness must verify.
    #[serde(rename = "n_2", with = "bigint_string")]
    pub nonce2: BigUint,

    /// Keyshare server response JWTs by scheme manager identifier.
    #[serde(rename = "proofPJwts", default, skip_serializing_if = "HashMap::is_empty")]
    pub proof_p_jwts: HashMap<String, String>,
}

/// An atomic timestamp over a signature session's message and disclosed
/// attributes, obtained from a timestamp server before the challenge is
/// computed.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Timestamp {
    /// Unix time attested by the timestamp server.
    pub time: i64,

    /// The server's evidence (its signature over the request), kept for the
    /// verifier.
    #[serde(default)]
    pub evidence: serde_json::Value,
}

/// The operations the engine needs from a disclosure proof builder.
pub trait DisclosureBuilder: Send + Sync {
    /// The issuer public key the credential was signed under.
    fn public_key(&self) -> PublicKeyIdentifier;

    /// Merge a keyshare server's commitment into this builder's commitment.
    fn merge_proof_p_commitment(&mut self, commitment: &ProofPCommitment);

    /// The builder's public contributions to the combined challenge, in the
    /// order the library defines.
    fn challenge_contributions(&self) -> Vec<BigUint>;

    /// Finish the proof for the given challenge, merging the keyshare
    /// server's response share when one is supplied.
    fn create_proof(&self, challenge: &BigUint, proof_p: Option<&ProofP>) -> Proof;

    /// The contributions of this builder to a timestamp request:
    /// the randomized signature and the disclosed attribute integers.
    fn timestamp_request_contributions(&self) -> (BigUint, Vec<BigUint>);
}

/// The operations the engine needs from a credential (issuance) builder.
pub trait CredentialBuilder: Send + Sync {
    /// The issuer public key the future credential will be signed under.
    fn public_key(&self) -> PublicKeyIdentifier;

    /// Merge a keyshare server's commitment into this builder's commitment.
    fn merge_proof_p_commitment(&mut self, commitment: &ProofPCommitment);

    /// The builder's public contributions to the combined challenge.
    fn challenge_contributions(&self) -> Vec<BigUint>;

    /// Finish the commitment proof for the given challenge.
    fn create_proof(&self, challenge: &BigUint, proof_p: Option<&ProofP>) -> Proof;

    /// Combine the issuer's signature with this builder's secrets into a
    /// credential. `attributes` is the attribute list without the secret key.
    fn construct_credential(
        &self, signature: &IssueSignature, attributes: &[BigUint],
    ) -> anyhow::Result<Credential>;
}

/// One proof builder: either a disclosure over an existing credential or a
/// commitment to a future one.
pub enum ProofBuilder {
    /// Discloses attributes of a held credential.
    Disclosure(Box<dyn DisclosureBuilder>),
    /// Commits to a credential under issuance.
    Credential(Box<dyn CredentialBuilder>),
}

impl ProofBuilder {
    /// The issuer public key this builder operates under.
    #[must_use]
    pub fn public_key(&self) -> PublicKeyIdentifier {
        match self {
            Self::Disclosure(b) => b.public_key(),
            Self::Credential(b) => b.public_key(),
        }
    }

    /// Merge a keyshare server's commitment.
    pub fn merge_proof_p_commitment(&mut self, commitment: &ProofPCommitment) {
        match self {
            Self::Disclosure(b) => b.merge_proof_p_commitment(commitment),
            Self::Credential(b) => b.merge_proof_p_commitment(commitment),
        }
    }

    fn challenge_contributions(&self) -> Vec<BigUint> {
        match self {
            Self::Disclosure(b) => b.challenge_contributions(),
            Self::Credential(b) => b.challenge_contributions(),
        }
    }

    fn create_proof(&self, challenge: &BigUint, proof_p: Option<&ProofP>) -> Proof {
        match self {
            Self::Disclosure(b) => b.create_proof(challenge, proof_p),
            Self::Credential(b) => b.create_proof(challenge, proof_p),
        }
    }
}

/// The ordered proof builders of one session.
#[derive(Default)]
pub struct ProofBuilderList(pub Vec<ProofBuilder>);

impl ProofBuilderList {
    /// Number of builders.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the list is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The combined Fiat-Shamir challenge over all builders: a hash over the
    /// session context, every builder's contributions in order, and the
    /// nonce. Signature sessions are domain-separated from disclosures.
    #[must_use]
    pub fn challenge(&self, context: &BigUint, nonce: &BigUint, is_signature: bool) -> BigUint {
        let mut hasher = Sha256::new();
        if is_signature {
            hasher.update(b"signature");
        }
        hash_int(&mut hasher, context);
        for builder in &self.0 {
            for contribution in builder.challenge_contributions() {
                hash_int(&mut hasher, &contribution);
            }
        }
        hash_int(&mut hasher, nonce);
        BigUint::from_bytes_be(&hasher.finalize())
    }

    /// Build the plain (non-distributed) proof list.
    #[must_use]
    pub fn build_proof_list(
        &self, context: &BigUint, nonce: &BigUint, is_signature: bool,
    ) -> Vec<Proof> {
        let challenge = self.challenge(context, nonce, is_signature);
        self.0.iter().map(|b| b.create_proof(&challenge, None)).collect()
    }

    /// Build the distributed proof list for the given challenge. `proof_ps`
    /// is positioned by builder index; `None` entries (and an empty slice)
    /// leave the corresponding proofs unmerged.
    pub fn build_distributed_proof_list(
        &self, challenge: &BigUint, proof_ps: &[Option<ProofP>],
    ) -> Result<Vec<Proof>, SessionError> {
        if !proof_ps.is_empty() && proof_ps.len() != self.0.len() {
            return Err(SessionError::new(
                ErrorType::Crypto,
                format!("got {} keyshare responses for {} builders", proof_ps.len(), self.0.len()),
            ));
        }
        Ok(self
            .0
            .iter()
            .enumerate()
            .map(|(i, b)| b.create_proof(challenge, proof_ps.get(i).and_then(Option::as_ref)))
            .collect())
    }
}

fn hash_int(hasher: &mut Sha256, value: &BigUint) {
    let bytes = value.to_bytes_be();
    hasher.update(u32::try_from(bytes.len()).unwrap_or(u32::MAX).to_be_bytes());
    hasher.update(&bytes);
}

#[cfg(test)]
mod tests {
    use num_traits::FromPrimitive;

    use super::*;

    struct FakeBuilder {
        pk: PublicKeyIdentifier,
        commitment: BigUint,
        merged: Option<ProofPCommitment>,
    }

    impl DisclosureBuilder for FakeBuilder {
        fn public_key(&self) -> PublicKeyIdentifier {
            self.pk.clone()
        }

        fn merge_proof_p_commitment(&mut self, commitment: &ProofPCommitment) {
            self.merged = Some(commitment.clone());
        }

        fn challenge_contributions(&self) -> Vec<BigUint> {
            vec![self.commitment.clone()]
        }

        fn create_proof(&self, challenge: &BigUint, proof_p: Option<&ProofP>) -> Proof {
            Proof(serde_json::json!({
                "pk": self.pk.to_string(),
                "challenge": challenge.to_str_radix(10),
                "merged_commitment": self.merged.is_some(),
                "proof_p": proof_p.map(|p| p.s_response.to_str_radix(10)),
            }))
        }

        fn timestamp_request_contributions(&self) -> (BigUint, Vec<BigUint>) {
            (self.commitment.clone(), vec![])
        }
    }

    fn builders() -> ProofBuilderList {
        ProofBuilderList(vec![ProofBuilder::Disclosure(Box::new(FakeBuilder {
            pk: PublicKeyIdentifier::new("test.issuer", 1),
            commitment: BigUint::from_u64(42).unwrap(),
            merged: None,
        }))])
    }

    #[test]
    fn challenge_is_deterministic_and_domain_separated() {
        let list = builders();
        let context = BigUint::from_u64(7).unwrap();
        let nonce = BigUint::from_u64(99).unwrap();
        assert_eq!(list.challenge(&context, &nonce, false), list.challenge(&context, &nonce, false));
        assert_ne!(list.challenge(&context, &nonce, false), list.challenge(&context, &nonce, true));
        assert_ne!(
            list.challenge(&context, &nonce, false),
            list.challenge(&context, &BigUint::from_u64(100).unwrap(), false)
        );
    }

    #[test]
    fn distributed_list_rejects_misaligned_responses() {
        let list = builders();
        let challenge = BigUint::from_u64(1).unwrap();
        let too_many = vec![None, None];
        assert!(list.build_distributed_proof_list(&challenge, &too_many).is_err());
        assert_eq!(
            list.build_distributed_proof_list(&challenge, &[]).expect("should build").len(),
            1
        );
    }

    #[test]
    fn proof_p_wire_shape() {
        let proof_p = ProofP {
            p: BigUint::from_u64(3).unwrap(),
            c: BigUint::from_u64(4).unwrap(),
            s_response: BigUint::from_u64(5).unwrap(),
        };
        let json = serde_json::to_value(&proof_p).expect("should serialize");
        assert_eq!(json, serde_json::json!({"P": "3", "c": "4", "s_response": "5"}));
    }
}
