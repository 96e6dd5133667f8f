use std::hash::Hash;

/// Atomic reference-counted string type used for identifiers.
pub(crate) type ArcStr = std::sync::Arc<str>;

/// A 32-byte BLAKE3 hash used for content-addressing.
///
/// In `okuri`, this serves two purposes:
/// 1. It fingerprints evaluation contexts, so that two contexts holding the
///    same variables are recognized as equivalent.
/// 2. It backs [`ExecutionHash`], the identity under which tasks are merged.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    /// Hashes any value implementing [`std::hash::Hash`] with BLAKE3.
    pub fn of<T: Hash + ?Sized>(value: &T) -> Self {
        let mut hasher = Blake3Hasher::default();
        value.hash(&mut hasher);
        hasher.into()
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&byte| byte == 0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in self.0.iter() {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

/// Adapter feeding [`std::hash::Hash`] implementations into BLAKE3.
#[derive(Default)]
pub struct Blake3Hasher(blake3::Hasher);

impl From<Blake3Hasher> for Hash32 {
    fn from(value: Blake3Hasher) -> Self {
        let bytes: [u8; 32] = value.0.finalize().into();
        Hash32::from(bytes)
    }
}

impl std::hash::Hasher for Blake3Hasher {
    fn finish(&self) -> u64 {
        let mut output = [0u8; 8];
        self.0.finalize_xof().fill(&mut output);
        u64::from_le_bytes(output)
    }

    fn write(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }
}

/// Fingerprint of the side effect produced by executing one node under one
/// context.
///
/// Two tasks with equal [`ExecutionHash::Digest`] values are interchangeable:
/// a dispatcher may execute only one of them and treat both as satisfied.
/// [`ExecutionHash::Null`] opts out of this entirely, a task carrying it is
/// never merged with any other task.
///
/// Node implementers are responsible for never giving the same digest to
/// invocations whose side effects differ. Such a collision can't be detected
/// here and silently skips one of the invocations.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Default)]
pub enum ExecutionHash {
    #[default]
    Null,
    Digest(Hash32),
}

impl ExecutionHash {
    /// Hashes any value implementing [`std::hash::Hash`] into a digest.
    pub fn of<T: Hash + ?Sized>(value: &T) -> Self {
        Self::from(Hash32::of(value))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ExecutionHash::Null)
    }

    pub fn digest(&self) -> Option<Hash32> {
        match self {
            ExecutionHash::Null => None,
            ExecutionHash::Digest(hash) => Some(*hash),
        }
    }
}

/// The all-zero digest is the default hash value and is treated as null.
impl From<Hash32> for ExecutionHash {
    fn from(hash: Hash32) -> Self {
        if hash.is_zero() {
            ExecutionHash::Null
        } else {
            ExecutionHash::Digest(hash)
        }
    }
}

impl From<Blake3Hasher> for ExecutionHash {
    fn from(hasher: Blake3Hasher) -> Self {
        Self::from(Hash32::from(hasher))
    }
}
