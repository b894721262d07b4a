use std::fmt;

use rand_core::{OsRng, RngCore};
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256, Sha384, Sha512};
use tracing::{Span, debug, info, info_span, warn};
use x509_cert::spki::SubjectPublicKeyInfoOwned;
use zeroize::Zeroizing;

use crate::cert::HashAlgorithm;
use crate::error::CertIssuerError;

pub type Result<T> = std::result::Result<T, CertIssuerError>;

/// Smallest accepted RSA modulus, in bits.
pub const MIN_KEY_BITS: usize = 1024;
/// Largest accepted RSA modulus, in bits.
pub const MAX_KEY_BITS: usize = 4096;

/// Where a key pair is scoped: shared by the whole machine or owned by one principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyContext {
    Machine,
    User,
}

impl KeyContext {
    pub fn from_machine_flag(machine_context: bool) -> Self {
        if machine_context {
            KeyContext::Machine
        } else {
            KeyContext::User
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            KeyContext::Machine => "machine",
            KeyContext::User => "user",
        }
    }
}

impl fmt::Display for KeyContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supported asymmetric algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    Rsa,
}

/// An RSA key pair bound to a usage context.
///
/// The private half is a secret: the type is neither `Clone` nor `Copy`, its `Debug`
/// output is redacted, and the key material is zeroized when the value is dropped or
/// passed to [`KeyPair::destroy`].
pub struct KeyPair {
    private: Box<RsaPrivateKey>,
    public: RsaPublicKey,
    bits: usize,
    context: KeyContext,
}

impl KeyPair {
    /// Generate an RSA key pair with the specified number of bits.
    pub fn generate_rsa(bits: usize, context: KeyContext) -> Result<Self> {
        check_bit_length(bits)?;
        let mut rng = OsRng;
        let private = RsaPrivateKey::new(&mut rng, bits)?;
        let public = RsaPublicKey::from(&private);
        Ok(KeyPair {
            private: Box::new(private),
            public,
            bits,
            context,
        })
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        KeyAlgorithm::Rsa
    }

    pub fn bits(&self) -> usize {
        self.bits
    }

    pub fn context(&self) -> KeyContext {
        self.context
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }

    /// The public key as a `SubjectPublicKeyInfo` structure.
    pub fn as_spki(&self) -> Result<SubjectPublicKeyInfoOwned> {
        SubjectPublicKeyInfoOwned::from_key(self.public.clone())
            .map_err(|e| CertIssuerError::CsrEncodingError(e.to_string()))
    }

    /// Lowercase hex SHA-256 of the DER-encoded public key.
    pub fn public_key_fingerprint(&self) -> Result<String> {
        let der = self
            .public
            .to_public_key_der()
            .map_err(|e| CertIssuerError::CsrEncodingError(e.to_string()))?;
        Ok(format!("{:x}", Sha256::digest(der.as_bytes())))
    }

    /// Signs `data` with RSA PKCS#1 v1.5 over the given digest.
    ///
    /// Signs through the owned key in place; the secret is never copied.
    pub fn sign_data(&self, data: &[u8], hash: HashAlgorithm) -> Result<Vec<u8>> {
        let (scheme, digest) = match hash {
            HashAlgorithm::Sha256 => (Pkcs1v15Sign::new::<Sha256>(), Sha256::digest(data).to_vec()),
            HashAlgorithm::Sha384 => (Pkcs1v15Sign::new::<Sha384>(), Sha384::digest(data).to_vec()),
            HashAlgorithm::Sha512 => (Pkcs1v15Sign::new::<Sha512>(), Sha512::digest(data).to_vec()),
        };
        self.private
            .sign_with_rng(&mut OsRng, scheme, &digest)
            .map_err(|e| CertIssuerError::CsrEncodingError(e.to_string()))
    }

    /// Exports the private key as PKCS#8 PEM for callers that must keep it.
    pub fn export_private_key_pem(&self) -> Result<Zeroizing<String>> {
        let pem = self
            .private
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| CertIssuerError::KeyGenerationError(e.to_string()))?;
        Ok(Zeroizing::new(pem.to_string()))
    }

    /// Discards the key pair. The private key is zeroized on drop.
    pub fn destroy(self) {
        debug!(bits = self.bits, context = %self.context, "destroying key pair");
        drop(self);
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("algorithm", &self.algorithm())
            .field("bits", &self.bits)
            .field("modulus_bytes", &self.public.size())
            .field("context", &self.context)
            .field("private", &"<redacted>")
            .finish()
    }
}

fn check_bit_length(bits: usize) -> Result<()> {
    if !(MIN_KEY_BITS..=MAX_KEY_BITS).contains(&bits) {
        return Err(CertIssuerError::KeyGenerationError(format!(
            "key length {bits} is outside [{MIN_KEY_BITS}, {MAX_KEY_BITS}]"
        )));
    }
    Ok(())
}

/// Produces key pairs for the issuance pipeline.
#[derive(Debug, Clone)]
pub struct KeyPairGenerator {
    span: Span,
}

impl Default for KeyPairGenerator {
    fn default() -> Self {
        Self::with_parent(&Span::none())
    }
}

impl KeyPairGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a generator that logs under `parent`.
    pub fn with_parent(parent: &Span) -> Self {
        Self {
            span: info_span!(parent: parent, "key_pair_generator"),
        }
    }

    /// Generates a key pair on the blocking thread pool.
    pub async fn generate(&self, context: KeyContext, bits: usize) -> Result<KeyPair> {
        let generator = self.clone();
        tokio::task::spawn_blocking(move || generator.generate_blocking(context, bits))
            .await
            .map_err(|e| CertIssuerError::KeyGenerationError(e.to_string()))?
    }

    /// Generates a key pair on the current thread. CPU-bound; do not call from an
    /// async task directly.
    pub fn generate_blocking(&self, context: KeyContext, bits: usize) -> Result<KeyPair> {
        let _entered = self.span.enter();
        info!(bits, %context, "generating key pair");

        if let Err(err) = check_bit_length(bits) {
            warn!(bits, "rejected key length");
            return Err(err);
        }
        check_entropy()?;

        let key_pair = KeyPair::generate_rsa(bits, context).inspect_err(|err| {
            warn!(error = %err, "key generation failed");
        })?;
        info!(bits, %context, "key pair generated");
        Ok(key_pair)
    }
}

fn check_entropy() -> Result<()> {
    let mut sample = Zeroizing::new([0u8; 32]);
    OsRng.try_fill_bytes(&mut sample[..]).map_err(|e| {
        warn!(error = %e, "entropy source unavailable");
        CertIssuerError::KeyGenerationError(format!("entropy source unavailable: {e}"))
    })
}
