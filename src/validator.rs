//! Structural and cryptographic event validation.
//!
//! The pipeline runs in a fixed order and stops at the first failure:
//! field presence and types, size limits, id recomputation, signature,
//! timestamp sanity. It has no side effects, so it is safe to run on the
//! blocking pool.

use crate::codec::InboundEvent;
use crate::error::Error;
use crate::kinds::KIND_REGISTRATION_REQUEST_9021;
use nostr::{Event, Timestamp};
use secp256k1::{schnorr, Message, XOnlyPublicKey, SECP256K1};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ValidationLimits {
    pub max_content_bytes: usize,
    pub max_registration_content_bytes: usize,
    pub max_tags: usize,
    pub max_tag_value_bytes: usize,
    #[serde(with = "humantime_serde")]
    pub max_clock_skew: Duration,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_content_bytes: 64 * 1024,
            max_registration_content_bytes: 8 * 1024,
            max_tags: 2000,
            max_tag_value_bytes: 1024,
            max_clock_skew: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// Borrowed view over the raw fields of an inbound event.
#[derive(Debug)]
struct RawEventFields<'a> {
    id: &'a str,
    pubkey: &'a str,
    created_at: u64,
    kind: u16,
    tags: Vec<Vec<&'a str>>,
    content: &'a str,
    sig: &'a str,
}

impl<'a> RawEventFields<'a> {
    fn extract(object: &'a Map<String, Value>) -> Result<Self, Error> {
        let id = hex_field(object, "id", 32)?;
        let pubkey = hex_field(object, "pubkey", 32)?;
        let sig = hex_field(object, "sig", 64)?;

        let created_at = object
            .get("created_at")
            .ok_or_else(|| Error::invalid("missing field 'created_at'"))?
            .as_u64()
            .ok_or_else(|| Error::invalid("'created_at' must be a non-negative integer"))?;

        let kind = object
            .get("kind")
            .ok_or_else(|| Error::invalid("missing field 'kind'"))?
            .as_u64()
            .and_then(|kind| u16::try_from(kind).ok())
            .ok_or_else(|| Error::invalid("'kind' must be an integer between 0 and 65535"))?;

        let content = object
            .get("content")
            .ok_or_else(|| Error::invalid("missing field 'content'"))?
            .as_str()
            .ok_or_else(|| Error::invalid("'content' must be a string"))?;

        let tags = object
            .get("tags")
            .ok_or_else(|| Error::invalid("missing field 'tags'"))?
            .as_array()
            .ok_or_else(|| Error::invalid("'tags' must be an array"))?
            .iter()
            .map(|tag| {
                tag.as_array()
                    .ok_or_else(|| Error::invalid("each tag must be an array"))?
                    .iter()
                    .map(|value| {
                        value
                            .as_str()
                            .ok_or_else(|| Error::invalid("tag values must be strings"))
                    })
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            id,
            pubkey,
            created_at,
            kind,
            tags,
            content,
            sig,
        })
    }
}

fn hex_field<'a>(
    object: &'a Map<String, Value>,
    name: &str,
    bytes: usize,
) -> Result<&'a str, Error> {
    let value = object
        .get(name)
        .ok_or_else(|| Error::invalid(format!("missing field '{name}'")))?
        .as_str()
        .ok_or_else(|| Error::invalid(format!("'{name}' must be a string")))?;
    let well_formed = value.len() == bytes * 2
        && value
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if !well_formed {
        return Err(Error::invalid(format!(
            "'{name}' must be {} lowercase hex characters",
            bytes * 2
        )));
    }
    Ok(value)
}

/// Lowercase hex SHA-256 of `[0,pubkey,created_at,kind,tags,content]`
/// serialized as compact JSON.
pub fn canonical_event_id<T>(
    pubkey: &str,
    created_at: u64,
    kind: u16,
    tags: &T,
    content: &str,
) -> Result<String, serde_json::Error>
where
    T: Serialize + ?Sized,
{
    let serialized = serde_json::to_string(&(0u8, pubkey, created_at, kind, tags, content))?;
    Ok(hex::encode(Sha256::digest(serialized.as_bytes())))
}

/// Recomputes the id of an already typed event.
pub fn compute_event_id(event: &Event) -> Result<String, serde_json::Error> {
    canonical_event_id(
        &event.pubkey.to_hex(),
        event.created_at.as_u64(),
        event.kind.as_u16(),
        &event.tags.iter().map(|tag| tag.as_slice()).collect::<Vec<_>>(),
        &event.content,
    )
}

/// Verifies a BIP-340 Schnorr signature over the 32 byte event id.
pub fn verify_signature(id_hex: &str, pubkey_hex: &str, sig_hex: &str) -> Result<(), Error> {
    let digest: [u8; 32] = hex::decode(id_hex)
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| Error::invalid("event id is not 32 bytes of hex"))?;
    let pubkey = hex::decode(pubkey_hex)
        .ok()
        .and_then(|bytes| XOnlyPublicKey::from_slice(&bytes).ok())
        .ok_or_else(|| Error::invalid("pubkey is not a valid curve point"))?;
    let signature = hex::decode(sig_hex)
        .ok()
        .and_then(|bytes| schnorr::Signature::from_slice(&bytes).ok())
        .ok_or_else(|| Error::invalid("malformed signature"))?;

    SECP256K1
        .verify_schnorr(&signature, &Message::from_digest(digest), &pubkey)
        .map_err(|_| Error::invalid("event signature verification failed"))
}

#[derive(Debug, Clone, Default)]
pub struct EventValidator {
    limits: ValidationLimits,
}

impl EventValidator {
    pub fn new(limits: ValidationLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &ValidationLimits {
        &self.limits
    }

    pub fn validate(&self, inbound: &InboundEvent) -> Result<Event, Error> {
        self.validate_at(inbound, Timestamp::now().as_u64())
    }

    pub fn validate_at(&self, inbound: &InboundEvent, now: u64) -> Result<Event, Error> {
        let object = inbound
            .raw()
            .as_object()
            .ok_or_else(|| Error::invalid("event must be a JSON object"))?;
        let fields = RawEventFields::extract(object)?;

        self.check_sizes(&fields)?;

        let computed = canonical_event_id(
            fields.pubkey,
            fields.created_at,
            fields.kind,
            &fields.tags,
            fields.content,
        )?;
        if computed != fields.id {
            return Err(Error::invalid("event id does not match its content"));
        }

        verify_signature(fields.id, fields.pubkey, fields.sig)?;

        let skew = self.limits.max_clock_skew.as_secs();
        if fields.created_at.abs_diff(now) > skew {
            return Err(Error::invalid(format!(
                "created_at {} is more than {}s away from the relay clock",
                fields.created_at, skew
            )));
        }

        serde_json::from_value::<Event>(inbound.raw().clone())
            .map_err(|e| Error::invalid(format!("malformed event: {e}")))
    }

    fn check_sizes(&self, fields: &RawEventFields<'_>) -> Result<(), Error> {
        let content_limit = if fields.kind == KIND_REGISTRATION_REQUEST_9021.as_u16() {
            self.limits.max_registration_content_bytes
        } else {
            self.limits.max_content_bytes
        };
        if fields.content.len() > content_limit {
            return Err(Error::invalid(format!(
                "content exceeds {content_limit} bytes"
            )));
        }
        if fields.tags.len() > self.limits.max_tags {
            return Err(Error::invalid(format!(
                "too many tags (max {})",
                self.limits.max_tags
            )));
        }
        if fields
            .tags
            .iter()
            .flatten()
            .any(|value| value.len() > self.limits.max_tag_value_bytes)
        {
            return Err(Error::invalid(format!(
                "tag value exceeds {} bytes",
                self.limits.max_tag_value_bytes
            )));
        }
        Ok(())
    }
}
