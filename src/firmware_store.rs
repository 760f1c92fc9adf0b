//! Firmware Store (component B): accepts uploads, hashes, signs
//! (ECDSA-P256), validates, promotes test releases to production, and
//! produces manifests. Upload launches validation as a detached task it
//! owns a handle to, the same shape the Session Engine uses for
//! post-download verification.

use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, VerifyingKey};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use semver::Version;

use crate::clock::{Clock, SystemClock};
use crate::error::{OtaError, Result};
use crate::key_store::{KeyStore, DEFAULT_KEY_ID, SIGNATURE_ALGORITHM};
use crate::model::{FirmwareRelease, Manifest, ReleaseType};
use crate::repository::Repository;

/// Encodes an ECDSA signature as `r,s` hex, matching the stored-signature
/// format parsed back in [`FirmwareStore::verify_signature`].
fn signature_to_hex_pair(signature: &Signature) -> String {
    let bytes = signature.to_bytes();
    let (r, s) = bytes.as_slice().split_at(32);
    format!("{},{}", hex::encode(r), hex::encode(s))
}

pub struct Validation {
    pub hash_matches: bool,
    pub size_matches: bool,
    pub version_parses: bool,
    pub signature_valid: Option<bool>,
}

impl Validation {
    pub fn passed(&self) -> bool {
        self.hash_matches
            && self.size_matches
            && self.version_parses
            && self.signature_valid.unwrap_or(true)
    }
}

#[derive(Clone)]
pub struct FirmwareStore {
    storage_root: PathBuf,
    repository: Arc<dyn Repository>,
    keys: Arc<KeyStore>,
    clock: Arc<dyn Clock>,
    validation_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl FirmwareStore {
    pub fn new(storage_root: impl Into<PathBuf>, repository: Arc<dyn Repository>, keys: Arc<KeyStore>) -> Self {
        Self::with_clock(storage_root, repository, keys, Arc::new(SystemClock))
    }

    pub fn with_clock(
        storage_root: impl Into<PathBuf>,
        repository: Arc<dyn Repository>,
        keys: Arc<KeyStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage_root: storage_root.into(),
            repository,
            keys,
            clock,
            validation_tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Awaits every outstanding detached validation task, for deterministic
    /// tests and graceful shutdown.
    pub async fn drain_validation_tasks(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.validation_tasks.lock());
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(%err, "validation task panicked");
            }
        }
    }

    /// Streams `stream` to `<storage_root>/<release_type>/<version>/<version>-<ts>.bin`
    /// while computing its SHA-256, records a new (unvalidated)
    /// [`FirmwareRelease`], then launches [`FirmwareStore::validate`] as a
    /// detached task (spec §4.B: Upload "launches asynchronous
    /// `Validate`"). The returned release still reflects `valid: false`;
    /// callers that need the validated record should re-fetch it or await
    /// [`FirmwareStore::drain_validation_tasks`].
    #[instrument(skip(self, stream, filename), fields(version = %version, release_type = ?release_type))]
    pub async fn upload(
        &self,
        mut stream: impl AsyncRead + Unpin + Send,
        filename: &str,
        release_type: ReleaseType,
        version: &str,
        is_test: bool,
        test_device_id: Option<i64>,
        notes: Option<String>,
    ) -> Result<FirmwareRelease> {
        let _ = filename;
        let parsed_version =
            Version::parse(version).map_err(|e| OtaError::InvalidVersion(e.to_string()))?;

        let dir = self
            .storage_root
            .join(release_type.as_str())
            .join(version);
        tokio::fs::create_dir_all(&dir).await?;

        let timestamp = self.clock.now().format("%Y%m%dT%H%M%S%.6fZ");
        let file_path = dir.join(format!("{version}-{timestamp}.bin"));

        let mut file = tokio::fs::File::create(&file_path).await?;
        let mut hasher = Sha256::new();
        let mut size: u64 = 0;
        let mut buf = [0u8; 64 * 1024];

        loop {
            use tokio::io::AsyncReadExt;
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n]).await?;
            size += n as u64;
        }
        file.flush().await?;

        let file_hash = hex::encode(hasher.finalize());

        let release = FirmwareRelease {
            id: 0,
            file_path: file_path.to_string_lossy().into_owned(),
            size,
            file_hash,
            version: parsed_version,
            release_type,
            valid: false,
            active: false,
            is_test,
            test_device_id,
            test_passed: false,
            signature: None,
            signature_algorithm: None,
            signed_at: None,
            signed_by: None,
            certificate_id: None,
            notes,
        };

        let created = self.repository.create_firmware(release).await?;
        info!(id = created.id, size, "Uploaded firmware release");

        let store = self.clone();
        let id = created.id;
        let handle = tokio::spawn(async move {
            if let Err(err) = store.validate(id).await {
                warn!(id, %err, "post-upload validation task failed");
            }
        });
        self.validation_tasks.lock().push(handle);

        Ok(created)
    }

    /// Recomputes the SHA-256 of the file on disk, verifies size and
    /// version, and (if a signature is present) verifies it. Sets `valid`
    /// on the stored release accordingly.
    #[instrument(skip(self))]
    pub async fn validate(&self, id: i64) -> Result<Validation> {
        let mut release = self
            .repository
            .get_firmware_by_id(id)
            .await?
            .ok_or_else(|| OtaError::NotFound(format!("firmware {id}")))?;

        let bytes = read_file_or_missing(&release.file_path).await?;

        let actual_hash = hex::encode(Sha256::digest(&bytes));
        let hash_matches = actual_hash == release.file_hash;
        let size_matches = bytes.len() as u64 == release.size;
        let version_parses = Version::parse(&release.version.to_string()).is_ok();

        let signature_valid = if release.signature.is_some() {
            Some(self.verify_signature(&release).await?)
        } else {
            None
        };

        let validation = Validation {
            hash_matches,
            size_matches,
            version_parses,
            signature_valid,
        };

        release.valid = validation.passed();
        if !validation.passed() {
            warn!(
                id,
                hash_matches,
                size_matches,
                version_parses,
                "Firmware validation failed"
            );
        }
        self.repository.update_firmware(release).await?;

        Ok(validation)
    }

    /// Signs the firmware file's bytes with ECDSA P-256. Uses the default
    /// process key unless `private_key_pem` is supplied for this call.
    #[instrument(skip(self, private_key_pem))]
    pub async fn sign(&self, id: i64, private_key_pem: Option<&str>) -> Result<FirmwareRelease> {
        let mut release = self
            .repository
            .get_firmware_by_id(id)
            .await?
            .ok_or_else(|| OtaError::NotFound(format!("firmware {id}")))?;

        let bytes = read_file_or_missing(&release.file_path).await?;

        let (signing_key, certificate_id) = if let Some(pem) = private_key_pem {
            use p256::ecdsa::SigningKey;
            use p256::elliptic_curve::pkcs8::DecodePrivateKey as _;
            use p256::elliptic_curve::sec1::DecodeEcPrivateKey as _;
            let secret = p256::SecretKey::from_pkcs8_pem(pem)
                .or_else(|_| p256::SecretKey::from_sec1_pem(pem))
                .map_err(|e| OtaError::StoreError(format!("invalid signing key PEM: {e}")))?;
            (Arc::new(SigningKey::from(secret)), "ad-hoc".to_string())
        } else {
            self.keys.ensure_initialized().await?;
            (
                self.keys.get_or_create(DEFAULT_KEY_ID).await?,
                DEFAULT_KEY_ID.to_string(),
            )
        };

        let signature: Signature = signing_key.sign(&bytes);
        let signature_str = signature_to_hex_pair(&signature);

        release.signature = Some(signature_str);
        release.signature_algorithm = Some(SIGNATURE_ALGORITHM.to_string());
        release.signed_at = Some(self.clock.now());
        release.signed_by = Some("firmware-store".to_string());
        release.certificate_id = Some(certificate_id);

        self.repository.update_firmware(release.clone()).await?;
        info!(id, "Signed firmware release");
        Ok(release)
    }

    /// Verifies a release's stored signature against the file on disk.
    #[instrument(skip(self, release), fields(id = release.id))]
    pub async fn verify_signature(&self, release: &FirmwareRelease) -> Result<bool> {
        let Some(signature_str) = &release.signature else {
            return Ok(false);
        };
        let Some(algorithm) = &release.signature_algorithm else {
            return Ok(false);
        };
        if algorithm != SIGNATURE_ALGORITHM {
            return Ok(false);
        }
        let Some(certificate_id) = &release.certificate_id else {
            return Ok(false);
        };

        let Some((r_hex, s_hex)) = signature_str.split_once(',') else {
            return Ok(false);
        };
        let Ok(r_bytes) = hex::decode(r_hex) else {
            return Ok(false);
        };
        let Ok(s_bytes) = hex::decode(s_hex) else {
            return Ok(false);
        };
        let Ok(signature) = Signature::from_scalars(
            <[u8; 32]>::try_from(r_bytes.as_slice()).unwrap_or([0u8; 32]),
            <[u8; 32]>::try_from(s_bytes.as_slice()).unwrap_or([0u8; 32]),
        ) else {
            return Ok(false);
        };

        self.keys.ensure_initialized().await?;
        let Some(signing_key) = self.keys.get_or_create(certificate_id).await.ok() else {
            return Ok(false);
        };
        let verifying_key: VerifyingKey = *signing_key.verifying_key();

        let bytes = read_file_or_missing(&release.file_path).await?;
        Ok(verifying_key.verify(&bytes, &signature).is_ok())
    }

    /// Promotes a validated test release to production, pointing at the
    /// same binary and preserving hash and signature.
    #[instrument(skip(self))]
    pub async fn promote_test_to_production(&self, test_id: i64) -> Result<FirmwareRelease> {
        let test_release = self
            .repository
            .get_firmware_by_id(test_id)
            .await?
            .ok_or_else(|| OtaError::NotFound(format!("firmware {test_id}")))?;

        if !test_release.is_promotable() {
            return Err(OtaError::FirmwareNotEligible(format!(
                "firmware {test_id} is not a passed test release"
            )));
        }

        let mut production_version = test_release.version.clone();
        production_version.pre = semver::Prerelease::EMPTY;
        production_version.build = semver::BuildMetadata::EMPTY;

        let production = FirmwareRelease {
            id: 0,
            file_path: test_release.file_path.clone(),
            size: test_release.size,
            file_hash: test_release.file_hash.clone(),
            version: production_version,
            release_type: ReleaseType::Production,
            valid: test_release.valid,
            active: true,
            is_test: false,
            test_device_id: None,
            test_passed: false,
            signature: test_release.signature.clone(),
            signature_algorithm: test_release.signature_algorithm.clone(),
            signed_at: test_release.signed_at,
            signed_by: test_release.signed_by.clone(),
            certificate_id: test_release.certificate_id.clone(),
            notes: test_release.notes.clone(),
        };

        let created = self.repository.create_firmware(production).await?;
        info!(
            test_id,
            production_id = created.id,
            "Promoted test release to production"
        );
        Ok(created)
    }

    /// Lists all valid+active releases of `release_type` and computes the
    /// minimum/recommended version bounds.
    #[instrument(skip(self))]
    pub async fn generate_manifest(&self, release_type: ReleaseType) -> Result<Manifest> {
        let releases = self.repository.list_valid_firmware(release_type, true).await?;

        let non_pre_release: Vec<&FirmwareRelease> = releases
            .iter()
            .filter(|r| r.version.pre.is_empty())
            .collect();

        let minimum_version = non_pre_release
            .iter()
            .min_by(|a, b| a.version.cmp(&b.version))
            .map(|r| r.version.clone());
        let recommended_version = non_pre_release
            .iter()
            .max_by(|a, b| a.version.cmp(&b.version))
            .map(|r| r.version.clone());

        Ok(Manifest {
            manifest_version: 1,
            generated_at: self.clock.now(),
            minimum_version,
            recommended_version,
            releases,
            signature: None,
        })
    }

    /// Signs a manifest's canonical string form with the default key.
    #[instrument(skip(self, manifest))]
    pub async fn sign_manifest(&self, manifest: &mut Manifest) -> Result<()> {
        self.keys.ensure_initialized().await?;
        let signing_key = self.keys.get_or_create(DEFAULT_KEY_ID).await?;
        let canonical = manifest.canonical_signing_string();
        let signature: Signature = signing_key.sign(canonical.as_bytes());
        manifest.signature = Some(signature_to_hex_pair(&signature));
        Ok(())
    }
}

async fn read_file_or_missing(path: &str) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .map_err(|_| OtaError::FirmwareFileMissing(path.to_string()))
}
