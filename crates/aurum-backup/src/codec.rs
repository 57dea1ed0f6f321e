//! Streaming codec for backup artifacts.
//!
//! Artifacts flow through gzip (level 9) and an authenticated AES-256-GCM
//! container, processed in fixed 1 MiB chunks so multi-GB dumps never hold
//! more than one chunk in memory. The encrypted container starts with a
//! `AUR1` magic and a random 8-byte nonce prefix; every chunk is sealed with
//! nonce = prefix || chunk counter, making nonces unique per file and chunk.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rand::RngCore;
use sha2::{Digest, Sha256, Sha512};
use tracing::debug;

use crate::error::{BackupError, Result};

/// Chunk size for all streaming operations.
pub const CHUNK_SIZE: usize = 1024 * 1024;

const MAGIC: &[u8; 4] = b"AUR1";
const NONCE_PREFIX_LEN: usize = 8;

/// The 32-byte AES-256 key, decoded from its URL-safe base64 encoding.
#[derive(Clone)]
pub struct EncryptionKey {
    bytes: [u8; 32],
}

impl EncryptionKey {
    /// Decode a URL-safe base64 key. Fails unless it decodes to 32 bytes.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let decoded = URL_SAFE.decode(encoded.trim()).map_err(|_| {
            BackupError::Encryption(
                "BACKUP_ENCRYPTION_KEY is not valid url-safe base64".to_string(),
            )
        })?;
        let bytes: [u8; 32] = decoded.try_into().map_err(|_| {
            BackupError::Encryption(
                "BACKUP_ENCRYPTION_KEY must decode to exactly 32 bytes".to_string(),
            )
        })?;
        Ok(Self { bytes })
    }

    /// Generate a fresh random key, returned in its base64 encoding.
    pub fn generate() -> String {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        URL_SAFE.encode(bytes)
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.bytes)
            .map_err(|e| BackupError::Encryption(format!("failed to initialize cipher: {e}")))
    }
}

/// Checksum algorithms supported for artifact digests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Sha256,
    Sha512,
    Md5,
}

impl Default for ChecksumAlgorithm {
    fn default() -> Self {
        ChecksumAlgorithm::Sha256
    }
}

/// Result of a compress-then-encrypt run.
#[derive(Debug, Clone)]
pub struct EncodedArtifact {
    pub path: PathBuf,
    /// Lower-case hex SHA-256 of the final encrypted file.
    pub checksum: String,
    pub original_size: u64,
    pub compressed_size: u64,
    pub final_size: u64,
}

fn ensure_input(path: &Path) -> Result<()> {
    if !path.is_file() {
        return Err(BackupError::NotFound(path.display().to_string()));
    }
    Ok(())
}

fn file_size(path: &Path) -> Result<u64> {
    Ok(fs::metadata(path)?.len())
}

/// Compress a file with gzip level 9.
///
/// Returns the output path together with the original and compressed sizes.
/// The default output path appends `.gz`.
pub fn compress_file(input: &Path, output: Option<&Path>) -> Result<(PathBuf, u64, u64)> {
    ensure_input(input)?;
    let output = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(format!("{}.gz", input.display())));

    let original_size = file_size(input)?;
    let mut reader =
        File::open(input).map_err(|e| BackupError::Compression(format!("open input: {e}")))?;
    let writer =
        File::create(&output).map_err(|e| BackupError::Compression(format!("create output: {e}")))?;
    let mut encoder = GzEncoder::new(writer, Compression::new(9));

    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = reader
            .read(&mut buf)
            .map_err(|e| BackupError::Compression(format!("read: {e}")))?;
        if n == 0 {
            break;
        }
        encoder
            .write_all(&buf[..n])
            .map_err(|e| BackupError::Compression(format!("write: {e}")))?;
    }
    encoder
        .finish()
        .map_err(|e| BackupError::Compression(format!("finish: {e}")))?;

    let compressed_size = file_size(&output)?;
    debug!(
        input = %input.display(),
        original_size,
        compressed_size,
        "compressed file"
    );
    Ok((output, original_size, compressed_size))
}

/// Decompress a gzip file. The default output path strips the `.gz` suffix.
pub fn decompress_file(input: &Path, output: Option<&Path>) -> Result<PathBuf> {
    ensure_input(input)?;
    let output = match output {
        Some(p) => p.to_path_buf(),
        None => {
            let name = input.display().to_string();
            let stripped = name.strip_suffix(".gz").ok_or_else(|| {
                BackupError::Compression(format!("cannot derive output path from {name}"))
            })?;
            PathBuf::from(stripped)
        }
    };

    let reader =
        File::open(input).map_err(|e| BackupError::Compression(format!("open input: {e}")))?;
    let mut decoder = GzDecoder::new(reader);
    let mut writer =
        File::create(&output).map_err(|e| BackupError::Compression(format!("create output: {e}")))?;

    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = decoder
            .read(&mut buf)
            .map_err(|e| BackupError::Compression(format!("decompress: {e}")))?;
        if n == 0 {
            break;
        }
        writer
            .write_all(&buf[..n])
            .map_err(|e| BackupError::Compression(format!("write: {e}")))?;
    }
    Ok(output)
}

/// Encrypt a file into the chunked AES-256-GCM container.
///
/// The default output path appends `.enc`.
pub fn encrypt_file(key: &EncryptionKey, input: &Path, output: Option<&Path>) -> Result<PathBuf> {
    ensure_input(input)?;
    let output = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(format!("{}.enc", input.display())));

    let cipher = key.cipher()?;
    let mut reader = File::open(input)?;
    let mut writer = File::create(&output)?;

    let mut nonce_prefix = [0u8; NONCE_PREFIX_LEN];
    OsRng.fill_bytes(&mut nonce_prefix);
    writer.write_all(MAGIC)?;
    writer.write_all(&nonce_prefix)?;

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut counter: u32 = 0;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        let nonce = chunk_nonce(&nonce_prefix, counter);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), &buf[..n])
            .map_err(|_| BackupError::Encryption("encryption failed".to_string()))?;
        writer.write_all(&(ciphertext.len() as u32).to_be_bytes())?;
        writer.write_all(&ciphertext)?;
        counter = counter.checked_add(1).ok_or_else(|| {
            BackupError::Encryption("input exceeds maximum chunk count".to_string())
        })?;
    }
    Ok(output)
}

/// Decrypt a chunked container, rejecting tampered ciphertext.
///
/// The default output path strips the `.enc` suffix.
pub fn decrypt_file(key: &EncryptionKey, input: &Path, output: Option<&Path>) -> Result<PathBuf> {
    ensure_input(input)?;
    let output = match output {
        Some(p) => p.to_path_buf(),
        None => {
            let name = input.display().to_string();
            let stripped = name.strip_suffix(".enc").ok_or_else(|| {
                BackupError::Encryption(format!("cannot derive output path from {name}"))
            })?;
            PathBuf::from(stripped)
        }
    };

    let cipher = key.cipher()?;
    let mut reader = File::open(input)?;
    let mut writer = File::create(&output)?;

    let mut header = [0u8; 4 + NONCE_PREFIX_LEN];
    if reader.read_exact(&mut header).is_err() || &header[..4] != MAGIC {
        let _ = fs::remove_file(&output);
        return Err(BackupError::invalid_key());
    }
    let mut nonce_prefix = [0u8; NONCE_PREFIX_LEN];
    nonce_prefix.copy_from_slice(&header[4..]);

    let mut counter: u32 = 0;
    loop {
        let mut len_bytes = [0u8; 4];
        match reader.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > CHUNK_SIZE + 16 {
            let _ = fs::remove_file(&output);
            return Err(BackupError::invalid_key());
        }
        let mut ciphertext = vec![0u8; len];
        if reader.read_exact(&mut ciphertext).is_err() {
            let _ = fs::remove_file(&output);
            return Err(BackupError::invalid_key());
        }
        let nonce = chunk_nonce(&nonce_prefix, counter);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|_| {
                let _ = fs::remove_file(&output);
                BackupError::invalid_key()
            })?;
        writer.write_all(&plaintext)?;
        counter += 1;
    }
    Ok(output)
}

fn chunk_nonce(prefix: &[u8; NONCE_PREFIX_LEN], counter: u32) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..NONCE_PREFIX_LEN].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_LEN..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

/// Calculate the hex digest of a file, streaming in chunks.
pub fn calculate_checksum(path: &Path, algorithm: ChecksumAlgorithm) -> Result<String> {
    ensure_input(path)?;
    let mut reader = File::open(path)?;
    let mut buf = vec![0u8; CHUNK_SIZE];

    enum Hasher {
        Sha256(Sha256),
        Sha512(Sha512),
        Md5(md5::Context),
    }

    let mut hasher = match algorithm {
        ChecksumAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
        ChecksumAlgorithm::Sha512 => Hasher::Sha512(Sha512::new()),
        ChecksumAlgorithm::Md5 => Hasher::Md5(md5::Context::new()),
    };

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        match &mut hasher {
            Hasher::Sha256(h) => h.update(&buf[..n]),
            Hasher::Sha512(h) => h.update(&buf[..n]),
            Hasher::Md5(h) => h.consume(&buf[..n]),
        }
    }

    Ok(match hasher {
        Hasher::Sha256(h) => hex::encode(h.finalize()),
        Hasher::Sha512(h) => hex::encode(h.finalize()),
        Hasher::Md5(h) => format!("{:x}", h.compute()),
    })
}

/// Compare a file's digest against an expected value, case-insensitively.
pub fn verify_checksum(path: &Path, expected: &str, algorithm: ChecksumAlgorithm) -> Result<bool> {
    let actual = calculate_checksum(path, algorithm)?;
    Ok(actual.eq_ignore_ascii_case(expected))
}

/// Compress then encrypt a file, returning size accounting and the SHA-256
/// checksum of the final encrypted artifact.
///
/// The default output path appends `.gz.enc`; the intermediate `.gz` file is
/// removed unless `keep_intermediate` is set.
pub fn compress_and_encrypt_file(
    key: &EncryptionKey,
    input: &Path,
    output: Option<&Path>,
    keep_intermediate: bool,
) -> Result<EncodedArtifact> {
    let output = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(format!("{}.gz.enc", input.display())));

    let (compressed_path, original_size, compressed_size) = compress_file(input, None)?;
    let result = encrypt_file(key, &compressed_path, Some(&output));
    if !keep_intermediate {
        let _ = fs::remove_file(&compressed_path);
    }
    let path = result?;

    let checksum = calculate_checksum(&path, ChecksumAlgorithm::Sha256)?;
    let final_size = file_size(&path)?;
    Ok(EncodedArtifact {
        path,
        checksum,
        original_size,
        compressed_size,
        final_size,
    })
}

/// Decrypt then decompress an artifact produced by
/// [`compress_and_encrypt_file`].
///
/// The default output path strips `.gz.enc`.
pub fn decrypt_and_decompress_file(
    key: &EncryptionKey,
    input: &Path,
    output: Option<&Path>,
    keep_intermediate: bool,
) -> Result<PathBuf> {
    let output = match output {
        Some(p) => p.to_path_buf(),
        None => {
            let name = input.display().to_string();
            let stripped = name.strip_suffix(".gz.enc").ok_or_else(|| {
                BackupError::Encryption(format!("cannot derive output path from {name}"))
            })?;
            PathBuf::from(stripped)
        }
    };

    let compressed_path = PathBuf::from(format!("{}.gz", output.display()));
    decrypt_file(key, input, Some(&compressed_path))?;
    let result = decompress_file(&compressed_path, Some(&output));
    if !keep_intermediate {
        let _ = fs::remove_file(&compressed_path);
    }
    result
}
