//! Versioned encoding for backend and mutator state.
//!
//! Every blob starts with a header naming the variant that produced it and
//! the format version, followed by a bincode payload. Decoding refuses blobs
//! from another variant or version instead of guessing at their layout.

use bincode::{
    Decode, Encode,
    config::{Configuration, Fixint, LittleEndian, Limit, NoLimit},
    decode_from_slice, encode_to_vec,
    error::{DecodeError, EncodeError},
};
use std::fs;
use std::path::Path;
use thiserror::Error;

const MAGIC: [u8; 4] = *b"EMBS";

/// Upper bound on what one decode may claim, so a corrupt length prefix
/// fails instead of allocating.
pub const MAX_STATE_LEN: usize = 64 << 20;

#[derive(Error, Debug)]
pub enum StateError {
    #[error("State blob does not start with a state header")]
    BadMagic,
    #[error("State blob belongs to {found:?}, expected {expected:?}")]
    WrongVariant { expected: String, found: String },
    #[error("State blob version {found} is not supported (expected {expected})")]
    UnsupportedVersion { expected: u16, found: u16 },
    #[error("State blob has {0} trailing bytes")]
    TrailingBytes(usize),
    #[error("State blob is inconsistent: {0}")]
    Invalid(String),
    #[error("State serialization error: {0}")]
    Serialization(String),
    #[error("State deserialization error: {0}")]
    Deserialization(String),
    #[error("State I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<EncodeError> for StateError {
    fn from(err: EncodeError) -> Self {
        StateError::Serialization(format!("Bincode encoding error: {}", err))
    }
}

impl From<DecodeError> for StateError {
    fn from(err: DecodeError) -> Self {
        StateError::Deserialization(format!("Bincode decoding error: {}", err))
    }
}

#[derive(Encode, Decode, Debug)]
struct Header {
    magic: [u8; 4],
    version: u16,
    variant: String,
}

fn bincode_config() -> Configuration<LittleEndian, Fixint, NoLimit> {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

fn bounded_config() -> Configuration<LittleEndian, Fixint, Limit<MAX_STATE_LEN>> {
    bincode_config().with_limit::<MAX_STATE_LEN>()
}

/// Encodes `payload` behind a header for `variant` at `version`.
pub fn encode<T: Encode>(variant: &str, version: u16, payload: &T) -> Result<Vec<u8>, StateError> {
    let header = Header {
        magic: MAGIC,
        version,
        variant: variant.to_string(),
    };
    let mut out = encode_to_vec(&header, bincode_config())?;
    out.extend(encode_to_vec(payload, bincode_config())?);
    Ok(out)
}

/// Decodes a blob produced by [`encode`] for the same variant and version.
pub fn decode<T: Decode<()>>(variant: &str, version: u16, bytes: &[u8]) -> Result<T, StateError> {
    if bytes.len() < MAGIC.len() || bytes[..MAGIC.len()] != MAGIC {
        return Err(StateError::BadMagic);
    }
    let (header, used): (Header, usize) = decode_from_slice(bytes, bounded_config())?;
    if header.variant != variant {
        return Err(StateError::WrongVariant {
            expected: variant.to_string(),
            found: header.variant,
        });
    }
    if header.version != version {
        return Err(StateError::UnsupportedVersion {
            expected: version,
            found: header.version,
        });
    }
    let rest = &bytes[used..];
    let (payload, consumed): (T, usize) = decode_from_slice(rest, bounded_config())?;
    if consumed != rest.len() {
        return Err(StateError::TrailingBytes(rest.len() - consumed));
    }
    Ok(payload)
}

/// Saved campaign: the state of the instrumentation and of the mutator.
#[derive(Encode, Decode, Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub instrumentation_kind: String,
    pub instrumentation: Vec<u8>,
    pub mutator_kind: String,
    pub mutator: Vec<u8>,
}

impl Checkpoint {
    const VARIANT: &'static str = "checkpoint";
    const VERSION: u16 = 1;

    pub fn to_bytes(&self) -> Result<Vec<u8>, StateError> {
        encode(Self::VARIANT, Self::VERSION, self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StateError> {
        decode(Self::VARIANT, Self::VERSION, bytes)
    }

    /// Writes the checkpoint next to `path` first and renames it into place.
    pub fn save(&self, path: &Path) -> Result<(), StateError> {
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, self.to_bytes()?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, StateError> {
        Self::from_bytes(&fs::read(path)?)
    }
}
