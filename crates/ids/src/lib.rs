use sha2::{Digest, Sha256};

/// Number of hex characters of the identity digest used in storage keys.
const STORAGE_HASH_LEN: usize = 16;
/// Maximum length of a database file stem derived from an identity.
const DB_FILE_STEM_MAX: usize = 64;

/// A user's decentralized identifier.
///
/// Identifiers are compared case-insensitively after trimming surrounding
/// whitespace, because the same DID may arrive differently-cased over
/// different delivery paths. The original (trimmed) spelling is preserved
/// for display and for deriving on-disk names.
#[derive(Clone)]
pub struct UserDid {
    raw: String,
    folded: String,
}

impl UserDid {
    pub fn new(raw: impl AsRef<str>) -> Self {
        let raw = raw.as_ref().trim().to_string();
        let folded = raw.to_lowercase();
        Self { raw, folded }
    }

    /// The trimmed identifier as supplied by the caller.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Stable short key suffix: the first 16 hex characters of the SHA-256
    /// digest of the case-folded identifier. Two spellings of the same user
    /// always map to the same suffix.
    pub fn storage_hash(&self) -> String {
        let digest = Sha256::digest(self.folded.as_bytes());
        let mut hash = hex::encode(digest);
        hash.truncate(STORAGE_HASH_LEN);
        hash
    }

    /// File stem for this user's on-disk MLS database.
    ///
    /// This is an interoperability contract shared with every other producer
    /// of the database file: base64 of the identifier with `/` -> `_` and
    /// `+` -> `-`, padding stripped, truncated to 64 characters. Any
    /// deviation opens a different (empty) database and decryption silently
    /// fails.
    pub fn db_file_stem(&self) -> String {
        let mut stem = base64::encode_config(self.raw.as_bytes(), base64::URL_SAFE_NO_PAD);
        stem.truncate(DB_FILE_STEM_MAX);
        stem
    }
}

impl PartialEq for UserDid {
    fn eq(&self, other: &Self) -> bool {
        self.folded == other.folded
    }
}
impl Eq for UserDid {}

impl std::hash::Hash for UserDid {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.folded.hash(state);
    }
}

impl std::fmt::Display for UserDid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

impl std::fmt::Debug for UserDid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UserDid({})", self.raw)
    }
}

impl From<&str> for UserDid {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl serde::Serialize for UserDid {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> serde::Deserialize<'de> for UserDid {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = <String as serde::Deserialize>::deserialize(deserializer)?;
        Ok(Self::new(raw))
    }
}

/// Seconds since the Unix epoch, as carried by handshake and activity records.
pub fn epoch_seconds() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
