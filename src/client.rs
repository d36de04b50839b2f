//! # Client
//!
//! The client is the main entry point of this crate. It deserializes the
//! credential store and keyshare enrollments from persistent storage,
//! answers which of its attributes satisfy a verifier's request, assembles
//! the proof builders a session needs, and runs the keyshare enrollment and
//! PIN-change flows.
//!
//! The CL signature of each credential is stored separately and loaded on
//! demand during a session; the attributes of all credentials are kept
//! together since they are always needed. The secret key, shared as
//! attribute zero across all credentials, is stored exactly once.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use num_bigint::{BigUint, RandBigInt};
use tokio::sync::{mpsc, Mutex};
use tracing::instrument;

use crate::attribute::{decode_attribute, AttributeList, CredentialInfo};
use crate::configuration::Configuration;
use crate::credential::Credential;
use crate::error::{ConfigError, EnrollmentError, ErrorType, SessionError};
use crate::identifier::{
    AttributeIdentifier, CredentialIdentifier, CredentialTypeIdentifier, SchemeManagerIdentifier,
};
use crate::keyshare::{
    start_keyshare_session, verify_pin_worker, KeyshareResult, KeyshareServerRecord, PinOutcome,
    SessionEvent,
};
use crate::log::{LogEntry, LogType};
use crate::proof::{
    params, IssueCommitmentMessage, IssueSignature, ProofBuilder, ProofBuilderList, Timestamp,
};
use crate::provider::{
    ClientStorer, IssuerClient, KeyshareChangePin, KeyshareClient, KeyshareContext,
    KeyshareEnrollment, PinRequestor, Preferences, Prover, Timestamper, PIN_STATUS_ERROR,
    PIN_STATUS_FAILURE, PIN_STATUS_SUCCESS,
};
use crate::request::{
    AttributeDisjunction, DisclosedAttributeIndex, DisclosedAttributeIndices, Disclosure,
    DisclosureChoice, IssuanceRequest, SessionRequest,
};

/// Minimum PIN length accepted at enrollment.
pub const PIN_MIN_LENGTH: usize = 5;

/// Everything the client needs from its embedder, as one provider.
pub trait Provider:
    ClientStorer + KeyshareClient + IssuerClient + Prover + Timestamper + Send + Sync + 'static
{
}

impl<T> Provider for T where
    T: ClientStorer + KeyshareClient + IssuerClient + Prover + Timestamper + Send + Sync + 'static
{
}

/// Events from the client's background flows (enrollment, PIN change).
#[derive(Debug)]
pub enum ClientEvent {
    /// Keyshare enrollment completed and was persisted.
    EnrollmentSuccess {
        /// The enrolled scheme.
        manager: SchemeManagerIdentifier,
    },

    /// Keyshare enrollment failed; any provisional record was removed.
    EnrollmentFailure {
        /// The affected scheme.
        manager: SchemeManagerIdentifier,
        /// The failure.
        error: EnrollmentError,
    },

    /// The PIN was changed.
    ChangePinSuccess {
        /// The affected scheme.
        manager: SchemeManagerIdentifier,
    },

    /// The old PIN was wrong; this many attempts remain.
    ChangePinIncorrect {
        /// The affected scheme.
        manager: SchemeManagerIdentifier,
        /// Remaining attempts.
        attempts: i32,
    },

    /// The account is blocked for this many seconds.
    ChangePinBlocked {
        /// The affected scheme.
        manager: SchemeManagerIdentifier,
        /// Block duration in seconds.
        timeout: i64,
    },

    /// The PIN change failed outright.
    ChangePinFailure {
        /// The affected scheme.
        manager: SchemeManagerIdentifier,
        /// The failure.
        error: SessionError,
    },
}

/// The in-memory client state, behind one coarse lock.
struct ClientState {
    secret_key: BigUint,
    attributes: HashMap<CredentialTypeIdentifier, Vec<AttributeList>>,
    credentials: HashMap<CredentialTypeIdentifier, HashMap<usize, Credential>>,
    keyshare_servers: HashMap<SchemeManagerIdentifier, KeyshareServerRecord>,
    logs: Vec<LogEntry>,
    logs_loaded: bool,
    preferences: Preferences,
}

/// A credential and the attribute indices to be disclosed from it.
struct AttributeGroup {
    credential: CredentialIdentifier,
    attrs: Vec<usize>,
}

/// The client. See the module documentation.
pub struct Client<P: Provider> {
    provider: P,
    configuration: Arc<Configuration>,
    state: Mutex<ClientState>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl<P: Provider> Client<P> {
    /// Load a client from persisted state, generating a fresh secret key on
    /// first run. Returns the client and the receiver of its background-flow
    /// events.
    pub async fn new(
        provider: P, configuration: Configuration,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<ClientEvent>), ConfigError> {
        let secret_key = match provider.load_secret_key().await? {
            Some(key) => key,
            None => {
                let key = rand::thread_rng().gen_biguint(params::SECRET_KEY_BITS);
                provider.store_secret_key(&key).await?;
                key
            }
        };
        let attributes = provider.load_attributes().await?;
        let keyshare_servers = provider.load_keyshare_servers().await?;
        let preferences = provider.load_preferences().await?.unwrap_or_default();

        let unenrolled = configuration
            .scheme_managers
            .values()
            .filter(|s| s.distributed() && !keyshare_servers.contains_key(&s.id))
            .count();
        if unenrolled > 1 {
            return Err(ConfigError::TooManyKeyshareServers(unenrolled));
        }

        let (events, receiver) = mpsc::unbounded_channel();
        let client = Arc::new(Self {
            provider,
            configuration: Arc::new(configuration),
            state: Mutex::new(ClientState {
                secret_key,
                attributes,
                credentials: HashMap::new(),
                keyshare_servers,
                logs: Vec::new(),
                logs_loaded: false,
                preferences,
            }),
            events,
        });
        Ok((client, receiver))
    }

    /// The scheme configuration this client operates against.
    #[must_use]
    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    // --- Credential store -------------------------------------------------

    /// Add a credential, persisting its signature immediately and the
    /// attribute index when `store_attributes` is set. Duplicates (by
    /// attribute list hash) are a no-op; for singleton credential types any
    /// previous instance is removed first.
    pub async fn add_credential(
        &self, credential: Credential, store_attributes: bool,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let attrs = credential.attribute_list();
        let hash = attrs.hash();

        if state.attributes.values().flatten().any(|a| a.hash() == hash) {
            return Ok(());
        }

        let id = credential.credential_type_id().unwrap_or_default();
        let singleton =
            self.configuration.credential_type(&id).is_some_and(|ct| ct.singleton);
        if singleton {
            while state.attributes.get(&id).is_some_and(|l| !l.is_empty()) {
                self.remove_locked(&mut state, &id, 0, false).await?;
            }
        }

        let list = state.attributes.entry(id.clone()).or_default();
        list.push(attrs);
        let index = list.len() - 1;
        if !id.as_str().is_empty() {
            state.credentials.entry(id).or_default().insert(index, credential.clone());
        }

        self.provider.store_signature(&hash, &credential.signature).await?;
        if store_attributes {
            self.provider.store_attributes(&state.attributes).await?;
        }
        Ok(())
    }

    /// Remove the credential at `index` of the given type.
    pub async fn remove_credential(
        &self, id: &CredentialTypeIdentifier, index: usize,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        self.remove_locked(&mut state, id, index, true).await
    }

    /// Remove the credential with the given attribute-list hash.
    pub async fn remove_credential_by_hash(&self, hash: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let found = state.attributes.iter().find_map(|(id, lists)| {
            lists.iter().position(|a| a.hash() == hash).map(|i| (id.clone(), i))
        });
        let Some((id, index)) = found else {
            bail!("no credential with hash {hash}");
        };
        self.remove_locked(&mut state, &id, index, true).await
    }

    /// Remove all credentials, with a single log entry summarizing the
    /// removals.
    pub async fn remove_all_credentials(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let mut removed: HashMap<CredentialTypeIdentifier, Vec<String>> = HashMap::new();
        for (id, lists) in &state.attributes {
            for attrs in lists {
                removed.insert(id.clone(), attribute_strings(attrs));
                self.provider.delete_signature(&attrs.hash()).await?;
            }
        }
        state.attributes.clear();
        state.credentials.clear();
        self.provider.store_attributes(&state.attributes).await?;
        self.add_log_entry(&mut state, LogEntry::removal(removed)).await
    }

    /// The attribute list of the requested credential, or `None` when the
    /// client does not hold it.
    pub async fn attributes(
        &self, id: &CredentialTypeIdentifier, index: usize,
    ) -> Option<AttributeList> {
        let state = self.state.lock().await;
        state.attributes.get(id).and_then(|l| l.get(index)).cloned()
    }

    /// The requested credential, with its signature loaded from storage on
    /// first access, or `None` when the client does not hold it.
    pub async fn credential(
        &self, id: &CredentialTypeIdentifier, index: usize,
    ) -> anyhow::Result<Option<Credential>> {
        let mut state = self.state.lock().await;
        if let Some(cached) = state.credentials.get(id).and_then(|m| m.get(&index)) {
            return Ok(Some(cached.clone()));
        }
        let Some(attrs) = state.attributes.get(id).and_then(|l| l.get(index)).cloned() else {
            return Ok(None);
        };
        let Some(signature) = self.provider.load_signature(&attrs.hash()).await? else {
            bail!("no signature stored for credential {id}-{index}");
        };
        let Some(public_key) = attrs.public_key_identifier() else {
            bail!("credential {id}-{index} has no parseable metadata attribute");
        };
        if !self.configuration.contains_public_key(&public_key) {
            bail!("unknown public key {public_key}");
        }

        let mut ints = Vec::with_capacity(attrs.ints.len() + 1);
        ints.push(state.secret_key.clone());
        ints.extend(attrs.ints.iter().cloned());
        let credential = Credential::new(ints, signature, public_key)?;
        state.credentials.entry(id.clone()).or_default().insert(index, credential.clone());
        Ok(Some(credential))
    }

    /// The credential with the given attribute-list hash, and its index.
    pub async fn credential_by_hash(
        &self, hash: &str,
    ) -> anyhow::Result<Option<(Credential, usize)>> {
        let found = {
            let state = self.state.lock().await;
            state.attributes.iter().find_map(|(id, lists)| {
                lists.iter().position(|a| a.hash() == hash).map(|i| (id.clone(), i))
            })
        };
        match found {
            Some((id, index)) => {
                Ok(self.credential(&id, index).await?.map(|cred| (cred, index)))
            }
            None => Ok(None),
        }
    }

    /// The credential pointed at by the identifier.
    pub async fn credential_by_identifier(
        &self, id: &CredentialIdentifier,
    ) -> anyhow::Result<Option<Credential>> {
        let index = {
            let state = self.state.lock().await;
            state
                .attributes
                .get(&id.credential_type)
                .and_then(|lists| lists.iter().position(|a| a.hash() == id.hash))
        };
        match index {
            Some(index) => self.credential(&id.credential_type, index).await,
            None => Ok(None),
        }
    }

    /// Displayable information about every stored credential.
    pub async fn credential_info_list(&self) -> Vec<CredentialInfo> {
        let state = self.state.lock().await;
        state
            .attributes
            .values()
            .flatten()
            .filter_map(|attrs| attrs.info(&self.configuration))
            .collect()
    }

    // --- Logs and preferences ---------------------------------------------

    /// The audit trail, loaded from storage on first access.
    pub async fn logs(&self) -> anyhow::Result<Vec<LogEntry>> {
        let mut state = self.state.lock().await;
        self.ensure_logs_loaded(&mut state).await?;
        Ok(state.logs.clone())
    }

    /// The current preferences.
    pub async fn preferences(&self) -> Preferences {
        self.state.lock().await.preferences
    }

    /// Toggle crash reporting. The reporter itself is the embedder's
    /// concern; the preference is persisted here.
    pub async fn set_crash_reporting_preference(&self, enable: bool) {
        let mut state = self.state.lock().await;
        state.preferences.enable_crash_reporting = enable;
        if let Err(e) = self.provider.store_preferences(&state.preferences).await {
            tracing::warn!("failed to persist preferences: {e}");
        }
    }

    // --- Candidate selection ----------------------------------------------

    /// The attributes held by this client that satisfy the disjunction.
    pub async fn candidates(
        &self, disjunction: &AttributeDisjunction,
    ) -> Vec<AttributeIdentifier> {
        let state = self.state.lock().await;
        let mut candidates = Vec::new();

        for attribute in &disjunction.attributes {
            let credential_id = attribute.credential_type();
            if !self.configuration.contains(&credential_id) {
                continue;
            }
            let Some(lists) = state.attributes.get(&credential_id) else { continue };
            for attrs in lists {
                if !attrs.is_valid() {
                    continue;
                }
                let id = AttributeIdentifier {
                    attribute_type: attribute.clone(),
                    credential_hash: attrs.hash(),
                };
                if attribute.is_credential() {
                    candidates.push(id);
                    continue;
                }
                let Some(value) = attrs.untranslated_attribute(attribute, &self.configuration)
                else {
                    continue;
                };
                if !disjunction.has_values() {
                    candidates.push(id);
                    continue;
                }
                match disjunction.values.get(attribute) {
                    None | Some(None) => candidates.push(id),
                    Some(Some(required)) if *required == value => candidates.push(id),
                    Some(Some(_)) => {}
                }
            }
        }
        candidates
    }

    /// Which disjunctions the client can satisfy: the candidates per
    /// disjunction, and the disjunctions without any.
    pub async fn check_satisfiability(
        &self, disjunctions: &[AttributeDisjunction],
    ) -> (Vec<Vec<AttributeIdentifier>>, Vec<AttributeDisjunction>) {
        let mut candidates = Vec::with_capacity(disjunctions.len());
        let mut missing = Vec::new();
        for disjunction in disjunctions {
            let found = self.candidates(disjunction).await;
            if found.is_empty() {
                missing.push(disjunction.clone());
            }
            candidates.push(found);
        }
        (candidates, missing)
    }

    // --- Proof builder assembly -------------------------------------------

    /// Group the user's choice per credential. The metadata attribute is
    /// always disclosed; typed attributes are mapped through the declared
    /// attribute order, offset past the secret key and metadata.
    fn group_credentials(
        &self, choice: &DisclosureChoice,
    ) -> anyhow::Result<(Vec<AttributeGroup>, DisclosedAttributeIndices)> {
        let mut group_indices: HashMap<CredentialIdentifier, usize> = HashMap::new();
        let mut groups: Vec<AttributeGroup> = Vec::new();
        let mut indices: DisclosedAttributeIndices = Vec::with_capacity(choice.attributes.len());

        for attribute in &choice.attributes {
            let credential = attribute.credential_identifier();
            let group_index = *group_indices.entry(credential.clone()).or_insert_with(|| {
                groups.push(AttributeGroup { credential: credential.clone(), attrs: vec![1] });
                groups.len() - 1
            });

            if attribute.attribute_type.is_credential() {
                // Only the metadata attribute is disclosed, which every
                // group already contains.
                indices.push(vec![DisclosedAttributeIndex {
                    credential_index: group_index,
                    attribute_index: 1,
                    identifier: Some(credential),
                }]);
                continue;
            }

            let credential_type = self
                .configuration
                .credential_type(&attribute.attribute_type.credential_type())
                .ok_or_else(|| {
                    anyhow!("unknown credential type {}", attribute.attribute_type.credential_type())
                })?;
            let name = attribute
                .attribute_type
                .name()
                .ok_or_else(|| anyhow!("attribute {} has no name", attribute.attribute_type))?;
            let attr_index = credential_type
                .index_of(name)
                .ok_or_else(|| anyhow!("unknown attribute {}", attribute.attribute_type))?;

            // The signed attribute vector starts with the secret key and the
            // metadata attribute, so typed values sit at their declared
            // index plus two.
            indices.push(vec![DisclosedAttributeIndex {
                credential_index: group_index,
                attribute_index: attr_index + 2,
                identifier: Some(credential),
            }]);
            groups[group_index].attrs.push(attr_index + 2);
        }

        Ok((groups, indices))
    }

    async fn disclosure_builders(
        &self, choice: &DisclosureChoice,
    ) -> anyhow::Result<(Vec<ProofBuilder>, DisclosedAttributeIndices)> {
        let (groups, indices) = self.group_credentials(choice)?;
        let mut builders = Vec::with_capacity(groups.len());
        for group in groups {
            let credential = self
                .credential_by_identifier(&group.credential)
                .await?
                .ok_or_else(|| anyhow!("credential {} not present", group.credential.hash))?;
            builders.push(ProofBuilder::Disclosure(
                self.provider.disclosure_builder(&credential, &group.attrs)?,
            ));
        }
        Ok((builders, indices))
    }

    /// The proof builders for a disclosure or signature session. For
    /// signatures, obtains the atomic timestamp over the builders'
    /// contributions; the challenge must be computed against it.
    pub async fn proof_builders(
        &self, choice: &DisclosureChoice, request: &SessionRequest,
    ) -> anyhow::Result<(ProofBuilderList, DisclosedAttributeIndices, Option<Timestamp>)> {
        let (builders, indices) = self.disclosure_builders(choice).await?;

        let timestamp = if let SessionRequest::Signature(signature_request) = request {
            let mut signatures = Vec::with_capacity(builders.len());
            let mut disclosed = Vec::with_capacity(builders.len());
            for builder in &builders {
                if let ProofBuilder::Disclosure(b) = builder {
                    let (sig, attrs) = b.timestamp_request_contributions();
                    signatures.push(sig);
                    disclosed.push(attrs);
                }
            }
            Some(
                self.provider
                    .timestamp(&signature_request.message, &signatures, &disclosed)
                    .await?,
            )
        } else {
            None
        };

        Ok((ProofBuilderList(builders), indices, timestamp))
    }

    /// The proof builders for an issuance session: a builder per future
    /// credential first, then any disclosures, plus the freshly generated
    /// nonce against which the issuer's proof of correctness must verify.
    pub async fn issuance_proof_builders(
        &self, request: &IssuanceRequest, choice: &DisclosureChoice,
    ) -> anyhow::Result<(ProofBuilderList, DisclosedAttributeIndices, BigUint)> {
        let issuer_proof_nonce =
            rand::thread_rng().gen_biguint(params::ISSUER_PROOF_NONCE_BITS);
        let secret_key = self.state.lock().await.secret_key.clone();

        let mut builders = Vec::with_capacity(request.credentials.len());
        for future_credential in &request.credentials {
            let public_key = crate::identifier::PublicKeyIdentifier::new(
                future_credential.credential_type.issuer(),
                future_credential.key_counter,
            );
            if !self.configuration.contains_public_key(&public_key) {
                bail!("unknown public key {public_key}");
            }
            builders.push(ProofBuilder::Credential(self.provider.credential_builder(
                &public_key,
                &request.context,
                &secret_key,
                &issuer_proof_nonce,
            )?));
        }

        let (disclosures, indices) = self.disclosure_builders(choice).await?;
        builders.extend(disclosures);
        Ok((ProofBuilderList(builders), indices, issuer_proof_nonce))
    }

    /// Compute the plain (non-keyshare) disclosure or signature proofs for
    /// the chosen attributes.
    pub async fn proofs(
        &self, choice: &DisclosureChoice, request: &SessionRequest,
    ) -> anyhow::Result<Disclosure> {
        let (builders, indices, timestamp) = self.proof_builders(choice, request).await?;
        let proofs = builders.build_proof_list(
            request.context(),
            &request.nonce(timestamp.as_ref()),
            request.is_signature(),
        );
        let kind = if request.is_signature() { LogType::Signing } else { LogType::Disclosing };
        {
            let mut state = self.state.lock().await;
            self.add_log_entry(&mut state, LogEntry::session(kind)).await?;
        }
        Ok(Disclosure { proofs, indices })
    }

    /// Compute the plain (non-keyshare) issuance commitments. Returns the
    /// builders as well; they become the new credentials once combined with
    /// the issuer's signatures.
    pub async fn issue_commitments(
        &self, request: &IssuanceRequest, choice: &DisclosureChoice,
    ) -> anyhow::Result<(IssueCommitmentMessage, ProofBuilderList)> {
        let (builders, _indices, issuer_proof_nonce) =
            self.issuance_proof_builders(request, choice).await?;
        let proofs =
            builders.build_proof_list(&request.context, &request.nonce, false);
        Ok((
            IssueCommitmentMessage {
                proofs,
                nonce2: issuer_proof_nonce,
                proof_p_jwts: HashMap::new(),
            },
            builders,
        ))
    }

    /// Construct and store the new credentials from the issuer's signature
    /// messages. All credentials are constructed before any is stored, so a
    /// failing one fails the session cleanly.
    pub async fn construct_credentials(
        &self, signatures: &[IssueSignature], request: &IssuanceRequest,
        builders: &ProofBuilderList,
    ) -> anyhow::Result<()> {
        let credential_builders: Vec<_> = builders
            .0
            .iter()
            .filter_map(|b| match b {
                ProofBuilder::Credential(cb) => Some(cb),
                ProofBuilder::Disclosure(_) => None,
            })
            .collect();
        if signatures.len() > credential_builders.len() {
            bail!("received unexpected amount of signatures");
        }

        let mut credentials = Vec::with_capacity(signatures.len());
        for (i, signature) in signatures.iter().enumerate() {
            let request_credential = request
                .credentials
                .get(i)
                .ok_or_else(|| anyhow!("no credential request for signature {i}"))?;
            let attrs = request_credential.attribute_list(&self.configuration)?;
            credentials.push(credential_builders[i].construct_credential(signature, &attrs.ints)?);
        }

        for credential in credentials {
            self.add_credential(credential, true).await?;
        }
        {
            let mut state = self.state.lock().await;
            self.add_log_entry(&mut state, LogEntry::session(LogType::Issuing)).await?;
        }
        Ok(())
    }

    // --- Keyshare sessions ------------------------------------------------

    /// Run the complete keyshare protocol for the given request: assemble
    /// the proof builders for the user's choice, then drive the distributed
    /// proof across the involved keyshare servers. All progress and the
    /// outcome are delivered on `events`.
    pub async fn keyshare_session(
        &self, request: &SessionRequest, choice: &DisclosureChoice,
        pin_requestor: &impl PinRequestor, events: &mpsc::UnboundedSender<SessionEvent>,
    ) {
        let assembled = match request {
            SessionRequest::Issuance(issuance) => self
                .issuance_proof_builders(issuance, choice)
                .await
                .map(|(builders, _indices, nonce)| (builders, Some(nonce), None)),
            _ => self
                .proof_builders(choice, request)
                .await
                .map(|(builders, _indices, timestamp)| (builders, None, timestamp)),
        };
        let (mut builders, issuer_proof_nonce, timestamp) = match assembled {
            Ok(assembled) => assembled,
            Err(e) => {
                let _ = events.send(SessionEvent::Error {
                    manager: None,
                    error: SessionError::new(ErrorType::Crypto, e.to_string()),
                });
                return;
            }
        };

        let mut servers = self.state.lock().await.keyshare_servers.clone();
        start_keyshare_session(
            events,
            pin_requestor,
            &mut builders,
            request,
            &self.configuration,
            &mut servers,
            &self.provider,
            issuer_proof_nonce,
            timestamp.as_ref(),
        )
        .await;

        // Keep any token obtained during the session, so the next session
        // under the same scheme need not prompt for the PIN again.
        let mut state = self.state.lock().await;
        for (manager, record) in servers {
            if let Some(existing) = state.keyshare_servers.get_mut(&manager) {
                existing.token = record.token;
            }
        }
    }

    // --- Keyshare server management ---------------------------------------

    /// The distributed schemes without a keyshare enrollment.
    pub async fn unenrolled_scheme_managers(&self) -> Vec<SchemeManagerIdentifier> {
        self.scheme_managers_by_enrollment(false).await
    }

    /// The distributed schemes with a keyshare enrollment.
    pub async fn enrolled_scheme_managers(&self) -> Vec<SchemeManagerIdentifier> {
        self.scheme_managers_by_enrollment(true).await
    }

    async fn scheme_managers_by_enrollment(
        &self, enrolled: bool,
    ) -> Vec<SchemeManagerIdentifier> {
        let state = self.state.lock().await;
        let mut managers: Vec<_> = self
            .configuration
            .scheme_managers
            .values()
            .filter(|s| s.distributed() && state.keyshare_servers.contains_key(&s.id) == enrolled)
            .map(|s| s.id.clone())
            .collect();
        managers.sort();
        managers
    }

    /// Verify the PIN at the keyshare server of the given scheme, outside of
    /// any session.
    pub async fn keyshare_verify_pin(
        &self, pin: &str, scheme: &SchemeManagerIdentifier,
    ) -> Result<PinOutcome, SessionError> {
        if !self.configuration.distributed(scheme) {
            return Err(SessionError::new(
                ErrorType::UnknownSchemeManager,
                format!("can't verify PIN of scheme {scheme}"),
            ));
        }
        let mut state = self.state.lock().await;
        let base_url = self
            .configuration
            .scheme_manager(scheme)
            .and_then(|s| s.keyshare_server.clone())
            .unwrap_or_default();
        let Some(record) = state.keyshare_servers.get_mut(scheme) else {
            return Err(SessionError::new(
                ErrorType::UnknownSchemeManager,
                format!("not enrolled to scheme {scheme}"),
            ));
        };
        let mut context = KeyshareContext {
            base_url,
            username: record.username.clone(),
            token: record.token.clone(),
        };
        verify_pin_worker(pin, record, &mut context, &self.provider).await
    }

    /// Unenroll the keyshare server of the given scheme.
    pub async fn keyshare_remove(
        &self, manager: &SchemeManagerIdentifier,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        if state.keyshare_servers.remove(manager).is_none() {
            bail!("can't unenroll from unknown keyshare server {manager}");
        }
        self.provider.store_keyshare_servers(&state.keyshare_servers).await
    }

    /// Remove all keyshare enrollments.
    pub async fn keyshare_remove_all(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        state.keyshare_servers.clear();
        self.provider.store_keyshare_servers(&state.keyshare_servers).await
    }

    /// Enroll at the keyshare server of the given scheme on a background
    /// task. The outcome arrives as a [`ClientEvent`].
    pub fn keyshare_enroll(
        self: &Arc<Self>, manager: SchemeManagerIdentifier, email: Option<String>, pin: String,
        language: String,
    ) -> tokio::task::JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            match client.keyshare_enroll_worker(&manager, email, &pin, &language).await {
                Ok(()) => {
                    let _ = client.events.send(ClientEvent::EnrollmentSuccess { manager });
                }
                Err(error) => {
                    tracing::error!(%manager, %error, "keyshare enrollment failed");
                    let _ =
                        client.events.send(ClientEvent::EnrollmentFailure { manager, error });
                }
            }
        })
    }

    #[instrument(level = "debug", skip_all, fields(%manager))]
    async fn keyshare_enroll_worker(
        &self, manager: &SchemeManagerIdentifier, email: Option<String>, pin: &str,
        language: &str,
    ) -> Result<(), EnrollmentError> {
        let scheme = self
            .configuration
            .scheme_manager(manager)
            .ok_or_else(|| EnrollmentError::UnknownSchemeManager(manager.clone()))?;
        let base_url = scheme
            .keyshare_server
            .clone()
            .filter(|url| !url.is_empty())
            .ok_or_else(|| EnrollmentError::NoKeyshareServer(manager.clone()))?;
        if pin.len() < PIN_MIN_LENGTH {
            return Err(EnrollmentError::PinTooShort { minimum: PIN_MIN_LENGTH });
        }

        let record = KeyshareServerRecord::new(manager.clone());
        let message = KeyshareEnrollment {
            username: String::new(),
            pin: record.hashed_pin(pin),
            email,
            language: language.to_string(),
        };
        let qr = self.provider.register(&base_url, &message).await?;

        // The keyshare session of the login-credential issuance needs to find
        // the record, so it is added before the session and persisted only
        // when the session succeeds.
        {
            let mut state = self.state.lock().await;
            state.keyshare_servers.insert(manager.clone(), record);
        }
        match self.keyshare_enrollment_session(manager, &qr, pin).await {
            Ok(()) => {
                let state = self.state.lock().await;
                self.provider.store_keyshare_servers(&state.keyshare_servers).await?;
                Ok(())
            }
            Err(error) => {
                let mut state = self.state.lock().await;
                state.keyshare_servers.remove(manager);
                Err(error)
            }
        }
    }

    /// The issuance session obtaining the keyshare server's login
    /// credential. The server-assigned username is taken from the issuance
    /// request and recorded before the keyshare protocol runs.
    async fn keyshare_enrollment_session(
        &self, manager: &SchemeManagerIdentifier, qr: &crate::request::Qr, pin: &str,
    ) -> Result<(), EnrollmentError> {
        let request = self
            .provider
            .start_issuance(qr)
            .await
            .map_err(|e| EnrollmentError::Session(e.to_string()))?;

        let username = request
            .credentials
            .first()
            .and_then(|cred| {
                self.configuration
                    .credential_type(&cred.credential_type)
                    .and_then(|ct| {
                        ct.attributes.iter().find_map(|a| cred.attributes.get(&a.id).cloned())
                    })
                    .or_else(|| cred.attributes.values().next().cloned())
            })
            .ok_or_else(|| {
                EnrollmentError::Session("enrollment issuance carries no username".into())
            })?;
        {
            let mut state = self.state.lock().await;
            if let Some(record) = state.keyshare_servers.get_mut(manager) {
                record.username = username;
            }
        }

        let (mut builders, _indices, issuer_proof_nonce) = self
            .issuance_proof_builders(&request, &DisclosureChoice::default())
            .await
            .map_err(|e| EnrollmentError::Session(e.to_string()))?;

        let (events, mut session_events) = mpsc::unbounded_channel();
        let session_request = SessionRequest::Issuance(request.clone());
        let pin_requestor = EnrollmentPinRequestor { pin: pin.to_string() };
        {
            let mut state = self.state.lock().await;
            let ClientState { keyshare_servers, .. } = &mut *state;
            start_keyshare_session(
                &events,
                &pin_requestor,
                &mut builders,
                &session_request,
                &self.configuration,
                keyshare_servers,
                &self.provider,
                Some(issuer_proof_nonce),
                None,
            )
            .await;
        }
        drop(events);

        let commitment = loop {
            match session_events.recv().await {
                Some(SessionEvent::PinRequired | SessionEvent::PinOk) => {}
                Some(SessionEvent::Done(KeyshareResult::IssueCommitment(message))) => {
                    break message;
                }
                Some(SessionEvent::Done(KeyshareResult::ProofList(_))) => {
                    return Err(EnrollmentError::Session(
                        "enrollment session produced no issue commitment".into(),
                    ));
                }
                Some(SessionEvent::Cancelled) => {
                    return Err(EnrollmentError::Session("PIN incorrect".into()));
                }
                Some(SessionEvent::Blocked { duration, .. }) => {
                    return Err(EnrollmentError::Session(format!(
                        "blocked for {duration} seconds"
                    )));
                }
                Some(SessionEvent::EnrollmentIncomplete { .. }) => {
                    return Err(EnrollmentError::Session("registration incomplete".into()));
                }
                Some(SessionEvent::EnrollmentDeleted { .. }) => {
                    return Err(EnrollmentError::Session("not enrolled".into()));
                }
                Some(SessionEvent::Error { error, .. }) => {
                    return Err(EnrollmentError::Session(error.to_string()));
                }
                None => {
                    return Err(EnrollmentError::Session(
                        "keyshare session ended without result".into(),
                    ));
                }
            }
        };

        let signatures = self
            .provider
            .post_commitments(qr, &commitment)
            .await
            .map_err(|e| EnrollmentError::Session(e.to_string()))?;
        self.construct_credentials(&signatures, &request, &builders)
            .await
            .map_err(EnrollmentError::Storage)
    }

    /// Change the PIN at the keyshare server of the given scheme on a
    /// background task. The outcome arrives as a [`ClientEvent`]; the
    /// events are the sole source of truth for success or failure.
    pub fn keyshare_change_pin(
        self: &Arc<Self>, manager: SchemeManagerIdentifier, old_pin: String, new_pin: String,
    ) -> tokio::task::JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(error) =
                client.keyshare_change_pin_worker(&manager, &old_pin, &new_pin).await
            {
                tracing::error!(%manager, %error, "keyshare PIN change failed");
                let _ = client.events.send(ClientEvent::ChangePinFailure { manager, error });
            }
        })
    }

    #[instrument(level = "debug", skip_all, fields(%manager))]
    async fn keyshare_change_pin_worker(
        &self, manager: &SchemeManagerIdentifier, old_pin: &str, new_pin: &str,
    ) -> Result<(), SessionError> {
        let base_url = self
            .configuration
            .scheme_manager(manager)
            .and_then(|s| s.keyshare_server.clone())
            .unwrap_or_default();
        let (message, context) = {
            let state = self.state.lock().await;
            let Some(record) = state.keyshare_servers.get(manager) else {
                return Err(SessionError::new(
                    ErrorType::UnknownSchemeManager,
                    format!("unknown keyshare server {manager}"),
                ));
            };
            (
                KeyshareChangePin {
                    username: record.username.clone(),
                    old_pin: record.hashed_pin(old_pin),
                    new_pin: record.hashed_pin(new_pin),
                },
                KeyshareContext {
                    base_url,
                    username: record.username.clone(),
                    token: record.token.clone(),
                },
            )
        };

        let status = self.provider.change_pin(&context, &message).await?;
        let event = match status.status.as_str() {
            PIN_STATUS_SUCCESS => ClientEvent::ChangePinSuccess { manager: manager.clone() },
            PIN_STATUS_FAILURE => {
                let attempts = status.message.parse().map_err(|_| {
                    SessionError::new(
                        ErrorType::ServerResponse,
                        format!("malformed remaining-attempts count: {:?}", status.message),
                    )
                })?;
                ClientEvent::ChangePinIncorrect { manager: manager.clone(), attempts }
            }
            PIN_STATUS_ERROR => ClientEvent::ChangePinBlocked {
                manager: manager.clone(),
                timeout: status.message.parse().unwrap_or(-1),
            },
            _ => {
                return Err(SessionError::new(
                    ErrorType::ServerResponse,
                    "keyshare server returned unrecognized PIN status",
                ));
            }
        };
        let _ = self.events.send(event);
        Ok(())
    }

    // --- Internals ----------------------------------------------------------

    async fn remove_locked(
        &self, state: &mut ClientState, id: &CredentialTypeIdentifier, index: usize,
        store_now: bool,
    ) -> anyhow::Result<()> {
        let Some(list) = state.attributes.get_mut(id) else {
            bail!("can't remove credential {id}-{index}: no such credential");
        };
        if index >= list.len() {
            bail!("can't remove credential {id}-{index}: no such credential");
        }
        let attrs = list.remove(index);
        if store_now {
            self.provider.store_attributes(&state.attributes).await?;
        }

        // Later instances shift down, so the whole per-type cache goes.
        state.credentials.remove(id);
        self.provider.delete_signature(&attrs.hash()).await?;

        if store_now {
            let mut removed = HashMap::new();
            removed.insert(id.clone(), attribute_strings(&attrs));
            self.add_log_entry(state, LogEntry::removal(removed)).await?;
        }
        Ok(())
    }

    async fn ensure_logs_loaded(&self, state: &mut ClientState) -> anyhow::Result<()> {
        if !state.logs_loaded {
            state.logs = self.provider.load_logs().await?;
            state.logs_loaded = true;
        }
        Ok(())
    }

    async fn add_log_entry(
        &self, state: &mut ClientState, entry: LogEntry,
    ) -> anyhow::Result<()> {
        self.ensure_logs_loaded(state).await?;
        state.logs.push(entry);
        self.provider.store_logs(&state.logs).await
    }
}

/// Answers the stored PIN on the first prompt of the enrollment issuance
/// session and cancels on any retry; a retry means the PIN the user just
/// registered with was rejected.
struct EnrollmentPinRequestor {
    pin: String,
}

impl PinRequestor for EnrollmentPinRequestor {
    async fn request_pin(&self, attempts: i32) -> Option<String> {
        (attempts == -1).then(|| self.pin.clone())
    }
}

fn attribute_strings(attrs: &AttributeList) -> Vec<String> {
    attrs.ints.iter().skip(1).map(|v| decode_attribute(v).unwrap_or_default()).collect()
}
