//! In-memory provider for the integration tests: hash-map storage, a
//! scripted keyshare transport, and fake proof builders that record what the
//! engine did to them.
#![allow(dead_code)] // not every test binary uses every fixture

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use num_bigint::BigUint;
use serde_json::json;

use irma_holder::attribute::{encode_attribute, AttributeList, MetadataAttribute};
use irma_holder::configuration::{
    AttributeType, Configuration, CredentialType, KeyshareAuthKey, SchemeManager,
};
use irma_holder::credential::Credential;
use irma_holder::error::{RemoteError, SessionError};
use irma_holder::identifier::{
    CredentialTypeIdentifier, PublicKeyIdentifier, SchemeManagerIdentifier,
};
use irma_holder::keyshare::KeyshareServerRecord;
use irma_holder::log::LogEntry;
use irma_holder::proof::{
    CLSignature, CredentialBuilder, DisclosureBuilder, IssueCommitmentMessage, IssueSignature,
    Proof, ProofP, ProofPCommitment, Timestamp,
};
use irma_holder::provider::{
    ClientStorer, IssuerClient, KeyshareChangePin, KeyshareClient, KeyshareContext,
    KeyshareEnrollment, KeysharePinMessage, KeysharePinStatus, PinRequestor, Preferences,
    ProofPCommitmentMap, Prover, Timestamper,
};
use irma_holder::request::{IssuanceRequest, Qr};

/// Shared secret of the test keyshare server's JWTs.
pub const KSS_SECRET: &[u8] = b"test-kss-secret";

/// A configuration with one distributed scheme (`test`) and one plain scheme
/// (`irma-demo`).
pub fn configuration() -> Configuration {
    let mut configuration = Configuration::default();
    configuration.scheme_managers.insert(
        SchemeManagerIdentifier::from("test"),
        SchemeManager {
            id: SchemeManagerIdentifier::from("test"),
            keyshare_server: Some("https://kss.test.example.com".into()),
        },
    );
    configuration.scheme_managers.insert(
        SchemeManagerIdentifier::from("irma-demo"),
        SchemeManager { id: SchemeManagerIdentifier::from("irma-demo"), keyshare_server: None },
    );
    configuration.credential_types.insert(
        CredentialTypeIdentifier::from("test.test.mijnirma"),
        CredentialType {
            id: CredentialTypeIdentifier::from("test.test.mijnirma"),
            singleton: true,
            attributes: vec![AttributeType { id: "email".into() }],
        },
    );
    configuration.credential_types.insert(
        CredentialTypeIdentifier::from("irma-demo.RU.studentCard"),
        CredentialType {
            id: CredentialTypeIdentifier::from("irma-demo.RU.studentCard"),
            singleton: false,
            attributes: vec![
                AttributeType { id: "university".into() },
                AttributeType { id: "studentID".into() },
                AttributeType { id: "level".into() },
            ],
        },
    );
    configuration.public_keys.insert(PublicKeyIdentifier::new("test.test", 1));
    configuration.public_keys.insert(PublicKeyIdentifier::new("irma-demo.RU", 2));
    configuration
        .keyshare_keys
        .insert(SchemeManagerIdentifier::from("test"), KeyshareAuthKey::from_secret(KSS_SECRET));
    configuration
}

/// A keyshare auth token signed by the test server, expiring at `exp`.
pub fn kss_token(exp: i64) -> String {
    encode(
        &Header::default(),
        &json!({"iss": "test-kss", "sub": "testuser", "exp": exp}),
        &EncodingKey::from_secret(KSS_SECRET),
    )
    .expect("should encode token")
}

/// An enrolled record for the `test` scheme carrying the given token.
pub fn enrolled_record(token: Option<String>) -> KeyshareServerRecord {
    let mut record = KeyshareServerRecord::new(SchemeManagerIdentifier::from("test"));
    record.username = "testuser".into();
    record.token = token;
    record
}

/// A studentCard attribute list signed under `irma-demo.RU-2`.
pub fn student_card(student_id: &str) -> AttributeList {
    let metadata = MetadataAttribute::new(
        CredentialTypeIdentifier::from("irma-demo.RU.studentCard"),
        2,
        365,
    );
    AttributeList::new(vec![
        metadata.to_int(),
        encode_attribute("Radboud"),
        encode_attribute(student_id),
        encode_attribute("42"),
    ])
}

/// A mijnirma attribute list signed under `test.test-1`.
pub fn mijnirma(email: &str) -> AttributeList {
    let metadata =
        MetadataAttribute::new(CredentialTypeIdentifier::from("test.test.mijnirma"), 1, 365);
    AttributeList::new(vec![metadata.to_int(), encode_attribute(email)])
}

/// Call counts of the scripted keyshare transport.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Counts {
    pub register: usize,
    pub verify_pin: usize,
    pub change_pin: usize,
    pub get_commitments: usize,
    pub get_response: usize,
}

#[derive(Default)]
struct Inner {
    // Storage.
    secret_key: Mutex<Option<BigUint>>,
    attributes: Mutex<HashMap<CredentialTypeIdentifier, Vec<AttributeList>>>,
    keyshare_servers: Mutex<HashMap<SchemeManagerIdentifier, KeyshareServerRecord>>,
    logs: Mutex<Vec<LogEntry>>,
    preferences: Mutex<Option<Preferences>>,
    signatures: Mutex<HashMap<String, CLSignature>>,

    // Scripted keyshare transport. Queues are popped per call; an empty PIN
    // queue answers success with a fresh token, an empty commitments queue
    // answers the requested commitments.
    pin_responses: Mutex<VecDeque<KeysharePinStatus>>,
    commitment_responses: Mutex<VecDeque<Result<(), RemoteError>>>,
    counts: Mutex<Counts>,

    // Scripted issuance server.
    issuance_request: Mutex<Option<IssuanceRequest>>,
    posted_commitments: Mutex<Vec<IssueCommitmentMessage>>,
}

/// The all-in-one test provider.
#[derive(Clone, Default)]
pub struct TestProvider {
    inner: Arc<Inner>,
}

impl TestProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counts(&self) -> Counts {
        *self.inner.counts.lock().expect("should lock")
    }

    pub fn push_pin_response(&self, status: &str, message: impl Into<String>) {
        self.inner.pin_responses.lock().expect("should lock").push_back(KeysharePinStatus {
            status: status.into(),
            message: message.into(),
        })
    }

    pub fn push_commitment_failure(&self, status: u16) {
        self.push_commitment_remote(RemoteError {
            status: Some(status),
            error_name: None,
            message: None,
        });
    }

    pub fn push_commitment_remote(&self, remote: RemoteError) {
        self.inner.commitment_responses.lock().expect("should lock").push_back(Err(remote));
    }

    pub fn push_commitment_success(&self) {
        self.inner.commitment_responses.lock().expect("should lock").push_back(Ok(()));
    }

    pub fn set_issuance_request(&self, request: IssuanceRequest) {
        *self.inner.issuance_request.lock().expect("should lock") = Some(request);
    }

    pub fn posted_commitments(&self) -> Vec<IssueCommitmentMessage> {
        self.inner.posted_commitments.lock().expect("should lock").clone()
    }

    pub fn stored_keyshare_servers(
        &self,
    ) -> HashMap<SchemeManagerIdentifier, KeyshareServerRecord> {
        self.inner.keyshare_servers.lock().expect("should lock").clone()
    }

    pub fn stored_signature_count(&self) -> usize {
        self.inner.signatures.lock().expect("should lock").len()
    }

    pub fn stored_secret_key(&self) -> Option<BigUint> {
        self.inner.secret_key.lock().expect("should lock").clone()
    }

    pub fn stored_logs(&self) -> Vec<LogEntry> {
        self.inner.logs.lock().expect("should lock").clone()
    }

    pub fn has_signature(&self, hash: &str) -> bool {
        self.inner.signatures.lock().expect("should lock").contains_key(hash)
    }

    /// Seed a credential instance directly into storage, as a completed
    /// issuance would have left it.
    pub fn seed_credential(&self, attrs: &AttributeList) {
        self.inner
            .signatures
            .lock()
            .expect("should lock")
            .insert(attrs.hash(), CLSignature(json!({"seeded": attrs.hash()})));
        let id = attrs.credential_type_id().expect("seeded list should carry a type");
        self.inner
            .attributes
            .lock()
            .expect("should lock")
            .entry(id)
            .or_default()
            .push(attrs.clone());
    }

    pub fn seed_keyshare_server(&self, record: KeyshareServerRecord) {
        self.inner
            .keyshare_servers
            .lock()
            .expect("should lock")
            .insert(record.scheme_manager_identifier.clone(), record);
    }
}

impl ClientStorer for TestProvider {
    async fn load_secret_key(&self) -> anyhow::Result<Option<BigUint>> {
        Ok(self.inner.secret_key.lock().expect("should lock").clone())
    }

    async fn store_secret_key(&self, key: &BigUint) -> anyhow::Result<()> {
        *self.inner.secret_key.lock().expect("should lock") = Some(key.clone());
        Ok(())
    }

    async fn load_attributes(
        &self,
    ) -> anyhow::Result<HashMap<CredentialTypeIdentifier, Vec<AttributeList>>> {
        Ok(self.inner.attributes.lock().expect("should lock").clone())
    }

    async fn store_attributes(
        &self, attributes: &HashMap<CredentialTypeIdentifier, Vec<AttributeList>>,
    ) -> anyhow::Result<()> {
        *self.inner.attributes.lock().expect("should lock") = attributes.clone();
        Ok(())
    }

    async fn load_keyshare_servers(
        &self,
    ) -> anyhow::Result<HashMap<SchemeManagerIdentifier, KeyshareServerRecord>> {
        Ok(self.inner.keyshare_servers.lock().expect("should lock").clone())
    }

    async fn store_keyshare_servers(
        &self, servers: &HashMap<SchemeManagerIdentifier, KeyshareServerRecord>,
    ) -> anyhow::Result<()> {
        *self.inner.keyshare_servers.lock().expect("should lock") = servers.clone();
        Ok(())
    }

    async fn load_logs(&self) -> anyhow::Result<Vec<LogEntry>> {
        Ok(self.inner.logs.lock().expect("should lock").clone())
    }

    async fn store_logs(&self, logs: &[LogEntry]) -> anyhow::Result<()> {
        *self.inner.logs.lock().expect("should lock") = logs.to_vec();
        Ok(())
    }

    async fn load_preferences(&self) -> anyhow::Result<Option<Preferences>> {
        Ok(*self.inner.preferences.lock().expect("should lock"))
    }

    async fn store_preferences(&self, preferences: &Preferences) -> anyhow::Result<()> {
        *self.inner.preferences.lock().expect("should lock") = Some(*preferences);
        Ok(())
    }

    async fn store_signature(&self, hash: &str, signature: &CLSignature) -> anyhow::Result<()> {
        self.inner
            .signatures
            .lock()
            .expect("should lock")
            .insert(hash.to_string(), signature.clone());
        Ok(())
    }

    async fn load_signature(&self, hash: &str) -> anyhow::Result<Option<CLSignature>> {
        Ok(self.inner.signatures.lock().expect("should lock").get(hash).cloned())
    }

    async fn delete_signature(&self, hash: &str) -> anyhow::Result<()> {
        self.inner.signatures.lock().expect("should lock").remove(hash);
        Ok(())
    }
}

impl KeyshareClient for TestProvider {
    async fn register(
        &self, _base_url: &str, _message: &KeyshareEnrollment,
    ) -> Result<Qr, SessionError> {
        self.inner.counts.lock().expect("should lock").register += 1;
        Ok(Qr { url: "https://issuer.test.example.com/session/1".into(), session_type: "issuing".into() })
    }

    async fn verify_pin(
        &self, _context: &KeyshareContext, _message: &KeysharePinMessage,
    ) -> Result<KeysharePinStatus, SessionError> {
        self.inner.counts.lock().expect("should lock").verify_pin += 1;
        let scripted = self.inner.pin_responses.lock().expect("should lock").pop_front();
        Ok(scripted.unwrap_or_else(|| KeysharePinStatus {
            status: "success".into(),
            message: kss_token(Utc::now().timestamp() + 3600),
        }))
    }

    async fn change_pin(
        &self, _context: &KeyshareContext, _message: &KeyshareChangePin,
    ) -> Result<KeysharePinStatus, SessionError> {
        self.inner.counts.lock().expect("should lock").change_pin += 1;
        let scripted = self.inner.pin_responses.lock().expect("should lock").pop_front();
        Ok(scripted
            .unwrap_or_else(|| KeysharePinStatus { status: "success".into(), message: String::new() }))
    }

    async fn get_commitments(
        &self, _context: &KeyshareContext, keys: &[PublicKeyIdentifier],
    ) -> Result<ProofPCommitmentMap, SessionError> {
        self.inner.counts.lock().expect("should lock").get_commitments += 1;
        let scripted = self.inner.commitment_responses.lock().expect("should lock").pop_front();
        if let Some(Err(remote)) = scripted {
            return Err(SessionError::remote(remote));
        }
        let commitments = keys
            .iter()
            .map(|pk| {
                (
                    pk.clone(),
                    ProofPCommitment { p: BigUint::from(7u8), p_commit: BigUint::from(8u8) },
                )
            })
            .collect();
        Ok(ProofPCommitmentMap { commitments })
    }

    async fn get_response(
        &self, _context: &KeyshareContext, challenge: &BigUint,
    ) -> Result<String, SessionError> {
        self.inner.counts.lock().expect("should lock").get_response += 1;
        let claims = json!({
            "iss": "test-kss",
            "sub": "testuser",
            "exp": Utc::now().timestamp() + 3600,
            "ProofP": {
                "P": "7",
                "c": challenge.to_str_radix(10),
                "s_response": "11",
            },
        });
        encode(&Header::default(), &claims, &EncodingKey::from_secret(KSS_SECRET)).map_err(|e| {
            SessionError::new(irma_holder::ErrorType::Crypto, format!("token encoding: {e}"))
        })
    }
}

impl IssuerClient for TestProvider {
    async fn start_issuance(&self, _qr: &Qr) -> anyhow::Result<IssuanceRequest> {
        self.inner
            .issuance_request
            .lock()
            .expect("should lock")
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no issuance request scripted"))
    }

    async fn post_commitments(
        &self, _qr: &Qr, message: &IssueCommitmentMessage,
    ) -> anyhow::Result<Vec<IssueSignature>> {
        self.inner.posted_commitments.lock().expect("should lock").push(message.clone());
        let count = self
            .inner
            .issuance_request
            .lock()
            .expect("should lock")
            .as_ref()
            .map_or(0, |r| r.credentials.len());
        Ok((0..count).map(|i| IssueSignature(json!({"issued": i}))).collect())
    }
}

impl Prover for TestProvider {
    fn disclosure_builder(
        &self, credential: &Credential, disclosed: &[usize],
    ) -> anyhow::Result<Box<dyn DisclosureBuilder>> {
        Ok(Box::new(FakeDisclosureBuilder {
            pk: credential.public_key.clone(),
            disclosed: disclosed.to_vec(),
            merged: None,
        }))
    }

    fn credential_builder(
        &self, public_key: &PublicKeyIdentifier, _context: &BigUint, secret: &BigUint,
        _issuer_proof_nonce: &BigUint,
    ) -> anyhow::Result<Box<dyn CredentialBuilder>> {
        Ok(Box::new(FakeCredentialBuilder {
            pk: public_key.clone(),
            secret: secret.clone(),
            merged: None,
        }))
    }
}

impl Timestamper for TestProvider {
    async fn timestamp(
        &self, _message: &str, _signatures: &[BigUint], _disclosed: &[Vec<BigUint>],
    ) -> anyhow::Result<Timestamp> {
        Ok(Timestamp { time: 1_700_000_000, evidence: serde_json::Value::Null })
    }
}

/// Fake disclosure builder: records merges, produces inspectable proofs.
pub struct FakeDisclosureBuilder {
    pub pk: PublicKeyIdentifier,
    pub disclosed: Vec<usize>,
    pub merged: Option<ProofPCommitment>,
}

impl DisclosureBuilder for FakeDisclosureBuilder {
    fn public_key(&self) -> PublicKeyIdentifier {
        self.pk.clone()
    }

    fn merge_proof_p_commitment(&mut self, commitment: &ProofPCommitment) {
        self.merged = Some(commitment.clone());
    }

    fn challenge_contributions(&self) -> Vec<BigUint> {
        let mut contributions = vec![BigUint::from(3u8)];
        if let Some(merged) = &self.merged {
            contributions.push(merged.p_commit.clone());
        }
        contributions
    }

    fn create_proof(&self, challenge: &BigUint, proof_p: Option<&ProofP>) -> Proof {
        Proof(json!({
            "pk": self.pk.to_string(),
            "disclosed": self.disclosed,
            "challenge": challenge.to_str_radix(10),
            "merged_commitment": self.merged.is_some(),
            "proof_p": proof_p.map(|p| p.s_response.to_str_radix(10)),
        }))
    }

    fn timestamp_request_contributions(&self) -> (BigUint, Vec<BigUint>) {
        (BigUint::from(5u8), vec![])
    }
}

/// Fake credential builder: constructs a credential by prefixing its secret.
pub struct FakeCredentialBuilder {
    pub pk: PublicKeyIdentifier,
    pub secret: BigUint,
    pub merged: Option<ProofPCommitment>,
}

impl CredentialBuilder for FakeCredentialBuilder {
    fn public_key(&self) -> PublicKeyIdentifier {
        self.pk.clone()
    }

    fn merge_proof_p_commitment(&mut self, commitment: &ProofPCommitment) {
        self.merged = Some(commitment.clone());
    }

    fn challenge_contributions(&self) -> Vec<BigUint> {
        vec![BigUint::from(4u8)]
    }

    fn create_proof(&self, challenge: &BigUint, proof_p: Option<&ProofP>) -> Proof {
        Proof(json!({
            "pk": self.pk.to_string(),
            "challenge": challenge.to_str_radix(10),
            "merged_commitment": self.merged.is_some(),
            "proof_p": proof_p.map(|p| p.s_response.to_str_radix(10)),
        }))
    }

    fn construct_credential(
        &self, signature: &IssueSignature, attributes: &[BigUint],
    ) -> anyhow::Result<Credential> {
        let mut ints = Vec::with_capacity(attributes.len() + 1);
        ints.push(self.secret.clone());
        ints.extend(attributes.iter().cloned());
        Credential::new(ints, CLSignature(signature.0.clone()), self.pk.clone())
    }
}

/// Scripted PIN dialog recording every prompt.
#[derive(Default)]
pub struct TestPinRequestor {
    pins: Mutex<VecDeque<Option<String>>>,
    prompts: Mutex<Vec<i32>>,
}

#[allow(dead_code)]
impl TestPinRequestor {
    pub fn answering(pin: &str) -> Self {
        let requestor = Self::default();
        requestor.push(Some(pin.to_string()));
        requestor
    }

    pub fn push(&self, pin: Option<String>) {
        self.pins.lock().expect("should lock").push_back(pin);
    }

    /// The `attempts` values of every prompt so far.
    pub fn prompts(&self) -> Vec<i32> {
        self.prompts.lock().expect("should lock").clone()
    }
}

impl PinRequestor for TestPinRequestor {
    async fn request_pin(&self, attempts: i32) -> Option<String> {
        self.prompts.lock().expect("should lock").push(attempts);
        self.pins
            .lock()
            .expect("should lock")
            .pop_front()
            .unwrap_or_else(|| Some("12345".to_string()))
    }
}
