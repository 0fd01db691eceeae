//! `multipart/signed` envelope codec
//!
//! An envelope carries two parts: the configuration document
//! (`text/yaml; charset=utf-8`) and a detached signature over exactly those
//! bytes (`application/x-shunt-signature`, base64 Ed25519). Other parts are
//! ignored.
//!
//! ```text
//! --BOUNDARY\r\n
//! Content-Type: text/yaml; charset=utf-8\r\n
//! \r\n
//! <document>\r\n
//! --BOUNDARY\r\n
//! Content-Type: application/x-shunt-signature\r\n
//! \r\n
//! <signature>\r\n
//! --BOUNDARY--\r\n
//! ```

use ed25519_dalek::SigningKey;
use rand::RngCore;
use std::collections::HashMap;
use thiserror::Error;

use crate::keyring;

pub const MEDIA_TYPE: &str = "multipart/signed";
pub const DOCUMENT_TYPE: &str = "text/yaml";
pub const DOCUMENT_CONTENT_TYPE: &str = "text/yaml; charset=utf-8";
pub const SIGNATURE_TYPE: &str = "application/x-shunt-signature";

const MAX_PART_HEADERS: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("cannot parse Content-Type {0:?}")]
    InvalidContentType(String),

    #[error("expected Content-Type multipart/signed, got {0}")]
    UnsupportedMediaType(String),

    #[error("multipart/signed is missing required parameter 'boundary'")]
    MissingBoundary,

    #[error("malformed multipart body: {0}")]
    Malformed(&'static str),

    #[error("only UTF-8 is supported for text/yaml, got charset {0:?}")]
    UnsupportedCharset(String),

    #[error("missing required part: {0}")]
    MissingPart(&'static str),
}

/// A parsed `type/subtype; key=value` header value. Type and parameter names are lowercased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaType {
    pub essence: String,
    pub params: HashMap<String, String>,
}

impl MediaType {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
}

pub fn parse_media_type(value: &str) -> Result<MediaType, EnvelopeError> {
    let invalid = || EnvelopeError::InvalidContentType(value.to_string());
    let mut pieces = value.split(';');

    let essence = pieces.next().unwrap_or_default().trim().to_ascii_lowercase();
    match essence.split_once('/') {
        Some((kind, sub)) if !kind.is_empty() && !sub.is_empty() => {}
        _ => return Err(invalid()),
    }

    let mut params = HashMap::new();
    for piece in pieces {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        let (key, val) = piece.split_once('=').ok_or_else(invalid)?;
        let key = key.trim().to_ascii_lowercase();
        if key.is_empty() {
            return Err(invalid());
        }
        let val = val.trim();
        let val = val
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(val);
        params.insert(key, val.to_string());
    }

    Ok(MediaType { essence, params })
}

/// A configuration document and its detached signature (base64 text)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedDocument {
    pub document: Vec<u8>,
    pub signature: Vec<u8>,
}

impl SignedDocument {
    /// Sign `document` with `key`
    pub fn sign(document: impl Into<Vec<u8>>, key: &SigningKey) -> Self {
        let document = document.into();
        let signature = keyring::sign(key, &document).into_bytes();
        Self {
            document,
            signature,
        }
    }

    /// `Content-Type` header value for an envelope encoded with `boundary`
    pub fn content_type(boundary: &str) -> String {
        format!("{}; boundary={}", MEDIA_TYPE, boundary)
    }

    pub fn encode(&self, boundary: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.document.len() + self.signature.len() + 256);
        for (content_type, body) in [
            (DOCUMENT_CONTENT_TYPE, &self.document),
            (SIGNATURE_TYPE, &self.signature),
        ] {
            out.extend_from_slice(b"--");
            out.extend_from_slice(boundary.as_bytes());
            out.extend_from_slice(b"\r\nContent-Type: ");
            out.extend_from_slice(content_type.as_bytes());
            out.extend_from_slice(b"\r\n\r\n");
            out.extend_from_slice(body);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"--");
        out.extend_from_slice(boundary.as_bytes());
        out.extend_from_slice(b"--\r\n");
        out
    }

    /// Decode an envelope given the value of its `Content-Type` header
    pub fn decode(content_type: &str, body: &[u8]) -> Result<Self, EnvelopeError> {
        let media_type = parse_media_type(content_type)?;
        if media_type.essence != MEDIA_TYPE {
            return Err(EnvelopeError::UnsupportedMediaType(media_type.essence));
        }
        let boundary = media_type
            .param("boundary")
            .filter(|b| !b.is_empty())
            .ok_or(EnvelopeError::MissingBoundary)?;

        let mut document = None;
        let mut signature = None;
        for part in split_parts(body, boundary)? {
            let (content_type, payload) = parse_part(part)?;
            let Some(value) = content_type else {
                continue;
            };
            let part_type = match parse_media_type(value) {
                Ok(part_type) => part_type,
                Err(_) => return Err(EnvelopeError::Malformed("unparseable part Content-Type")),
            };

            match part_type.essence.as_str() {
                DOCUMENT_TYPE => {
                    let charset = part_type.param("charset").unwrap_or_default();
                    if !charset.eq_ignore_ascii_case("utf-8") {
                        return Err(EnvelopeError::UnsupportedCharset(charset.to_string()));
                    }
                    document = Some(payload.to_vec());
                }
                SIGNATURE_TYPE => signature = Some(payload.to_vec()),
                _ => {}
            }
        }

        Ok(Self {
            document: document.ok_or(EnvelopeError::MissingPart(DOCUMENT_TYPE))?,
            signature: signature.ok_or(EnvelopeError::MissingPart(SIGNATURE_TYPE))?,
        })
    }
}

/// A fresh random boundary
pub fn random_boundary() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn split_parts<'a>(body: &'a [u8], boundary: &str) -> Result<Vec<&'a [u8]>, EnvelopeError> {
    let opening = format!("--{}", boundary);
    let delimiter = format!("\r\n--{}", boundary);

    let mut rest = if body.starts_with(opening.as_bytes()) {
        &body[opening.len()..]
    } else {
        let start = find(body, delimiter.as_bytes())
            .ok_or(EnvelopeError::Malformed("missing opening boundary"))?;
        &body[start + delimiter.len()..]
    };

    let mut parts = Vec::new();
    loop {
        if rest.starts_with(b"--") {
            return Ok(parts);
        }
        let line_end =
            find(rest, b"\r\n").ok_or(EnvelopeError::Malformed("unterminated boundary line"))?;
        if !rest[..line_end].iter().all(|b| *b == b' ' || *b == b'\t') {
            return Err(EnvelopeError::Malformed("garbage after boundary"));
        }
        rest = &rest[line_end + 2..];

        let end = find(rest, delimiter.as_bytes())
            .ok_or(EnvelopeError::Malformed("missing closing boundary"))?;
        parts.push(&rest[..end]);
        rest = &rest[end + delimiter.len()..];
    }
}

/// Content-Type of one part, if it has one, and the payload after the header block
fn parse_part(part: &[u8]) -> Result<(Option<&str>, &[u8]), EnvelopeError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_PART_HEADERS];
    match httparse::parse_headers(part, &mut headers) {
        Ok(httparse::Status::Complete((offset, parsed))) => {
            let content_type = parsed
                .iter()
                .find(|header| header.name.eq_ignore_ascii_case("content-type"))
                .map(|header| std::str::from_utf8(header.value).map(str::trim))
                .transpose()
                .map_err(|_| EnvelopeError::Malformed("non-UTF-8 part Content-Type"))?;
            Ok((content_type, &part[offset..]))
        }
        Ok(httparse::Status::Partial) => Err(EnvelopeError::Malformed("unterminated part headers")),
        Err(_) => Err(EnvelopeError::Malformed("invalid part headers")),
    }
}
