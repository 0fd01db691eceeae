//! Signed configuration distribution
//!
//! Configurations travel as `multipart/signed` envelopes: the YAML document
//! plus a detached Ed25519 signature over it. This crate provides the envelope
//! codec, key handling, the upload endpoint that accepts pushed envelopes, the
//! grove endpoint that serves them, the pusher, and a configuration source
//! that pulls from a grove.

pub mod envelope;
pub mod grove;
pub mod keyring;
pub mod pull;
pub mod push;
pub mod upload;

pub use envelope::{parse_media_type, random_boundary, EnvelopeError, MediaType, SignedDocument};
pub use grove::{etag_for, parse_bool, Grove};
pub use keyring::{KeyId, KeyRing, KeyRingError, SignatureError};
pub use pull::{HttpSource, PullOptions};
pub use push::{push, PushError, PushOutcome};
pub use upload::{upload_router, ApplyError, ConfigSink, FileApplier, UploadState};
