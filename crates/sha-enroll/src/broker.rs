use std::sync::Arc;

use base64::Engine as _;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ed25519_dalek::{Signature, VerifyingKey};
use rand_core::{OsRng, RngCore};
use sha_domain::{
    ActiveConnection, ActiveConnectionStatus, AuditEvent, Enrollment, EnrollmentId,
    EnrollmentStatus,
};
use sha_store::StateStore;
use tracing::info;

use crate::error::EnrollError;

const PAIRING_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Drives the SNA enrollment handshake and the resulting tunnel's lifecycle.
/// Every state change is written through as an audit row — nothing here is
/// held only in memory.
pub struct EnrollmentBroker {
    store: Arc<dyn StateStore>,
}

impl EnrollmentBroker {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        EnrollmentBroker { store }
    }

    /// Step 1: operator requests a pairing code. Persists it as an `issued`
    /// Enrollment stub with no SNA identity attached yet, so `enroll` below
    /// has something authoritative to check the presented code against
    /// instead of trusting whatever the caller sends.
    pub async fn generate_pairing_code(&self, valid_for_seconds: i64) -> Result<PairingCode, EnrollError> {
        let mut groups = [[0u8; 4]; 3];
        for group in groups.iter_mut() {
            let mut bytes = [0u8; 4];
            OsRng.fill_bytes(&mut bytes);
            for (slot, b) in group.iter_mut().zip(bytes.iter()) {
                *slot = PAIRING_CODE_ALPHABET[(*b as usize) % PAIRING_CODE_ALPHABET.len()];
            }
        }
        let code = groups
            .iter()
            .map(|g| String::from_utf8_lossy(g).to_string())
            .collect::<Vec<_>>()
            .join("-");
        let now = Utc::now();
        let expires_at = now + ChronoDuration::seconds(valid_for_seconds);

        let stub = Enrollment {
            id: EnrollmentId::new(),
            pairing_code: code.clone(),
            sna_public_key: String::new(),
            sna_name: String::new(),
            sna_version: String::new(),
            sna_fingerprint: String::new(),
            source_ip: None,
            challenge_nonce: String::new(),
            status: EnrollmentStatus::Issued,
            approver: None,
            created_at: now,
            expires_at,
            verified_at: None,
            approved_at: None,
        };
        self.store.create_enrollment(&stub).await?;
        Ok(PairingCode { code, expires_at })
    }

    /// Step 2: SNA presents the pairing code plus its identity and public key.
    /// The code must match a still-`issued`, unexpired stub created by
    /// `generate_pairing_code` — an SNA cannot self-issue a code by supplying
    /// one nobody handed it. On success the stub is filled in with the SNA's
    /// identity and transitioned to `pending_verification`, which also
    /// consumes the code: a second `enroll` against the same code finds it
    /// already past `issued` and is rejected.
    pub async fn enroll(
        &self,
        code: &str,
        sna_public_key_b64: &str,
        sna_name: &str,
        sna_version: &str,
        sna_fingerprint: &str,
        source_ip: Option<String>,
    ) -> Result<(EnrollmentId, String), EnrollError> {
        let mut enrollment = self
            .store
            .find_enrollment_by_pairing_code(code)
            .await?
            .ok_or(EnrollError::InvalidPairingCode)?;
        if enrollment.status != EnrollmentStatus::Issued {
            return Err(EnrollError::InvalidPairingCode);
        }
        if Utc::now() > enrollment.expires_at {
            return Err(EnrollError::PairingCodeExpired);
        }
        base64::engine::general_purpose::STANDARD
            .decode(sna_public_key_b64)
            .map_err(|e| EnrollError::Malformed(e.to_string()))?;

        let mut nonce = [0u8; 32];
        OsRng.fill_bytes(&mut nonce);
        let challenge_nonce = base64::engine::general_purpose::STANDARD.encode(nonce);

        let now = Utc::now();
        enrollment.sna_public_key = sna_public_key_b64.to_string();
        enrollment.sna_name = sna_name.to_string();
        enrollment.sna_version = sna_version.to_string();
        enrollment.sna_fingerprint = sna_fingerprint.to_string();
        enrollment.source_ip = source_ip;
        enrollment.challenge_nonce = challenge_nonce.clone();
        enrollment.status = EnrollmentStatus::PendingVerification;
        enrollment.created_at = now;

        self.store.update_enrollment(&enrollment).await?;
        self.store
            .append_event(&AuditEvent::EnrollmentCreated { id: uuid::Uuid::new_v4(), at: now, enrollment_id: enrollment.id })
            .await?;
        info!(enrollment_id = %enrollment.id, sna = %sna_name, "enrollment pending verification");
        Ok((enrollment.id, challenge_nonce))
    }

    /// Step 3: SNA signs the challenge nonce with its private key. Verifies
    /// against the public key recorded at `enroll` time, never one supplied
    /// here, so a later compromised message cannot substitute a different key.
    pub async fn verify(&self, enrollment_id: EnrollmentId, signature_b64: &str) -> Result<(), EnrollError> {
        let mut enrollment = self.get(enrollment_id).await?;
        self.require_status(&enrollment, EnrollmentStatus::PendingVerification)?;

        let public_key_bytes = base64::engine::general_purpose::STANDARD
            .decode(&enrollment.sna_public_key)
            .map_err(|e| EnrollError::Malformed(e.to_string()))?;
        let public_key_bytes: [u8; 32] =
            public_key_bytes.try_into().map_err(|_| EnrollError::Malformed("public key must be 32 bytes".into()))?;
        let verifying_key =
            VerifyingKey::from_bytes(&public_key_bytes).map_err(|e| EnrollError::Malformed(e.to_string()))?;

        let signature_bytes = base64::engine::general_purpose::STANDARD
            .decode(signature_b64)
            .map_err(|e| EnrollError::Malformed(e.to_string()))?;
        let signature_bytes: [u8; 64] =
            signature_bytes.try_into().map_err(|_| EnrollError::Malformed("signature must be 64 bytes".into()))?;
        let signature = Signature::from_bytes(&signature_bytes);

        let nonce = base64::engine::general_purpose::STANDARD
            .decode(&enrollment.challenge_nonce)
            .map_err(|e| EnrollError::Malformed(e.to_string()))?;

        verifying_key.verify_strict(&nonce, &signature).map_err(|_| EnrollError::SignatureInvalid)?;

        let now = Utc::now();
        enrollment.status = EnrollmentStatus::AwaitingApproval;
        enrollment.verified_at = Some(now);
        self.store.update_enrollment(&enrollment).await?;
        self.store
            .append_event(&AuditEvent::ChallengeVerified { id: uuid::Uuid::new_v4(), at: now, enrollment_id })
            .await?;
        Ok(())
    }

    /// Step 4a: operator approves. Issues the restricted SSH principal and
    /// records an ActiveConnection in the `connected` state.
    pub async fn approve(&self, enrollment_id: EnrollmentId, approver: &str) -> Result<ActiveConnection, EnrollError> {
        let mut enrollment = self.get(enrollment_id).await?;
        self.require_status(&enrollment, EnrollmentStatus::AwaitingApproval)?;

        let now = Utc::now();
        enrollment.status = EnrollmentStatus::Approved;
        enrollment.approver = Some(approver.to_string());
        enrollment.approved_at = Some(now);
        self.store.update_enrollment(&enrollment).await?;

        let connection = ActiveConnection {
            enrollment_id,
            ssh_principal: ssh_principal_for(enrollment_id),
            status: ActiveConnectionStatus::Connected,
            last_seen_at: Some(now),
            connected_at: Some(now),
            revoked_at: None,
            revoked_by: None,
        };
        self.store.upsert_active_connection(&connection).await?;
        self.store
            .append_event(&AuditEvent::EnrollmentApproved {
                id: uuid::Uuid::new_v4(),
                at: now,
                enrollment_id,
                approver: approver.to_string(),
            })
            .await?;
        self.store
            .append_event(&AuditEvent::ConnectionEstablished { id: uuid::Uuid::new_v4(), at: now, enrollment_id })
            .await?;
        Ok(connection)
    }

    /// Step 4b: operator rejects, with a reason kept on the audit trail.
    pub async fn reject(&self, enrollment_id: EnrollmentId, approver: &str, reason: &str) -> Result<(), EnrollError> {
        let mut enrollment = self.get(enrollment_id).await?;
        self.require_status(&enrollment, EnrollmentStatus::AwaitingApproval)?;

        let now = Utc::now();
        enrollment.status = EnrollmentStatus::Rejected;
        enrollment.approver = Some(approver.to_string());
        self.store.update_enrollment(&enrollment).await?;
        self.store
            .append_event(&AuditEvent::EnrollmentRejected {
                id: uuid::Uuid::new_v4(),
                at: now,
                enrollment_id,
                approver: approver.to_string(),
                reason: reason.to_string(),
            })
            .await?;
        Ok(())
    }

    /// Step 5: SNA polls for the outcome of a pending approval decision.
    pub async fn result(&self, enrollment_id: EnrollmentId) -> Result<Enrollment, EnrollError> {
        self.get(enrollment_id).await
    }

    /// Revokes an established connection — removes the principal's standing
    /// and marks the connection `revoked`.
    pub async fn revoke(&self, enrollment_id: EnrollmentId, revoked_by: &str) -> Result<(), EnrollError> {
        let mut connection = self
            .store
            .get_active_connection(&enrollment_id)
            .await?
            .ok_or(EnrollError::EnrollmentNotFound(enrollment_id.as_uuid()))?;

        let now = Utc::now();
        connection.status = ActiveConnectionStatus::Revoked;
        connection.revoked_at = Some(now);
        connection.revoked_by = Some(revoked_by.to_string());
        self.store.upsert_active_connection(&connection).await?;
        self.store
            .append_event(&AuditEvent::ConnectionRevoked {
                id: uuid::Uuid::new_v4(),
                at: now,
                enrollment_id,
                by: revoked_by.to_string(),
            })
            .await?;
        Ok(())
    }

    async fn get(&self, enrollment_id: EnrollmentId) -> Result<Enrollment, EnrollError> {
        self.store
            .get_enrollment(&enrollment_id)
            .await?
            .ok_or(EnrollError::EnrollmentNotFound(enrollment_id.as_uuid()))
    }

    fn require_status(&self, enrollment: &Enrollment, expected: EnrollmentStatus) -> Result<(), EnrollError> {
        if enrollment.status != expected {
            return Err(EnrollError::WrongState(enrollment.id.as_uuid(), enrollment.status, expected));
        }
        Ok(())
    }
}

fn ssh_principal_for(enrollment_id: EnrollmentId) -> String {
    format!("sna-{}", enrollment_id.as_uuid().simple())
}

/// A pairing code handed to the operator out of band (shown on a console,
/// read over the phone). Single-use — `generate_pairing_code` persists the
/// issuing stub, `enroll` consumes it.
#[derive(Debug, Clone)]
pub struct PairingCode {
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use sha_store::InMemoryStore;

    fn keypair() -> SigningKey {
        SigningKey::generate(&mut OsRng)
    }

    #[tokio::test]
    async fn full_enrollment_flow_succeeds() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
        let broker = EnrollmentBroker::new(store);

        let code = broker.generate_pairing_code(300).await.unwrap();
        let signing_key = keypair();
        let public_key_b64 =
            base64::engine::general_purpose::STANDARD.encode(signing_key.verifying_key().to_bytes());

        let (enrollment_id, nonce_b64) = broker
            .enroll(&code.code, &public_key_b64, "sna-01", "1.0.0", "aa:bb:cc", Some("10.0.0.5".into()))
            .await
            .unwrap();

        let nonce = base64::engine::general_purpose::STANDARD.decode(&nonce_b64).unwrap();
        let signature = signing_key.sign(&nonce);
        let signature_b64 = base64::engine::general_purpose::STANDARD.encode(signature.to_bytes());

        broker.verify(enrollment_id, &signature_b64).await.unwrap();

        let connection = broker.approve(enrollment_id, "alice").await.unwrap();
        assert_eq!(connection.status, ActiveConnectionStatus::Connected);

        let enrollment = broker.result(enrollment_id).await.unwrap();
        assert_eq!(enrollment.status, EnrollmentStatus::Approved);

        broker.revoke(enrollment_id, "alice").await.unwrap();
        let enrollment = broker.result(enrollment_id).await.unwrap();
        assert_eq!(enrollment.status, EnrollmentStatus::Approved);
    }

    #[tokio::test]
    async fn verify_rejects_bad_signature() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
        let broker = EnrollmentBroker::new(store);

        let code = broker.generate_pairing_code(300).await.unwrap();
        let signing_key = keypair();
        let wrong_key = keypair();
        let public_key_b64 =
            base64::engine::general_purpose::STANDARD.encode(signing_key.verifying_key().to_bytes());

        let (enrollment_id, nonce_b64) =
            broker.enroll(&code.code, &public_key_b64, "sna-01", "1.0.0", "aa:bb:cc", None).await.unwrap();

        let nonce = base64::engine::general_purpose::STANDARD.decode(&nonce_b64).unwrap();
        let bad_signature = wrong_key.sign(&nonce);
        let bad_signature_b64 = base64::engine::general_purpose::STANDARD.encode(bad_signature.to_bytes());

        let err = broker.verify(enrollment_id, &bad_signature_b64).await.unwrap_err();
        assert!(matches!(err, EnrollError::SignatureInvalid));
    }

    #[tokio::test]
    async fn reject_records_reason_and_stops_polling_from_approving() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
        let broker = EnrollmentBroker::new(store);

        let code = broker.generate_pairing_code(300).await.unwrap();
        let signing_key = keypair();
        let public_key_b64 =
            base64::engine::general_purpose::STANDARD.encode(signing_key.verifying_key().to_bytes());
        let (enrollment_id, nonce_b64) =
            broker.enroll(&code.code, &public_key_b64, "sna-02", "1.0.0", "dd:ee:ff", None).await.unwrap();
        let nonce = base64::engine::general_purpose::STANDARD.decode(&nonce_b64).unwrap();
        let signature = signing_key.sign(&nonce);
        let signature_b64 = base64::engine::general_purpose::STANDARD.encode(signature.to_bytes());
        broker.verify(enrollment_id, &signature_b64).await.unwrap();

        broker.reject(enrollment_id, "bob", "unrecognized fingerprint").await.unwrap();
        let enrollment = broker.result(enrollment_id).await.unwrap();
        assert_eq!(enrollment.status, EnrollmentStatus::Rejected);

        let err = broker.approve(enrollment_id, "bob").await.unwrap_err();
        assert!(matches!(err, EnrollError::WrongState(..)));
    }

    #[tokio::test]
    async fn enroll_rejects_a_code_nobody_issued() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
        let broker = EnrollmentBroker::new(store);

        let signing_key = keypair();
        let public_key_b64 =
            base64::engine::general_purpose::STANDARD.encode(signing_key.verifying_key().to_bytes());

        let err = broker
            .enroll("ABCD-EFGH-JKLM", &public_key_b64, "sna-03", "1.0.0", "00:11:22", None)
            .await
            .unwrap_err();
        assert!(matches!(err, EnrollError::InvalidPairingCode));
    }

    #[tokio::test]
    async fn enroll_rejects_a_code_already_consumed() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
        let broker = EnrollmentBroker::new(store);

        let code = broker.generate_pairing_code(300).await.unwrap();
        let signing_key = keypair();
        let public_key_b64 =
            base64::engine::general_purpose::STANDARD.encode(signing_key.verifying_key().to_bytes());
        broker.enroll(&code.code, &public_key_b64, "sna-04", "1.0.0", "33:44:55", None).await.unwrap();

        let err = broker
            .enroll(&code.code, &public_key_b64, "sna-05", "1.0.0", "66:77:88", None)
            .await
            .unwrap_err();
        assert!(matches!(err, EnrollError::InvalidPairingCode));
    }
}
