//! Write authorization, connection authentication and signed HTTP requests.

use crate::codec::InboundEvent;
use crate::error::Error;
use crate::kinds::{is_admin_kind, is_bypass_kind, KIND_AUTH_22242, KIND_HTTP_AUTH_27235};
use crate::validator::EventValidator;
use crate::whitelist::Whitelist;
use base64::Engine;
use nostr::{Event, PublicKey, Timestamp};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use strum::{Display, IntoStaticStr};
use tracing::debug;

/// How old or how far ahead an AUTH response may be.
pub const AUTH_EVENT_MAX_AGE_SECS: u64 = 600;
/// Window for signed HTTP request events.
pub const HTTP_AUTH_WINDOW_SECS: u64 = 60;
pub const HTTP_AUTH_SCHEME: &str = "Nostr";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum DenyCode {
    AuthRequired,
    NotWhitelisted,
    MembershipExpired,
    CohortMismatch,
    NotAdmin,
    AuthorMismatch,
    AuthEventPublished,
}

impl DenyCode {
    fn detail(self) -> &'static str {
        match self {
            DenyCode::AuthRequired => "authenticate to publish this kind",
            DenyCode::NotWhitelisted => "pubkey is not whitelisted",
            DenyCode::MembershipExpired => "whitelist membership has expired",
            DenyCode::CohortMismatch => "pubkey may not post in this section",
            DenyCode::NotAdmin => "admin cohort required",
            DenyCode::AuthorMismatch => "admin commands must be signed by the authenticated pubkey",
            DenyCode::AuthEventPublished => "authentication events must be sent with AUTH",
        }
    }
}

/// A refused write. The code is stable; the reason is what the client sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denial {
    pub code: DenyCode,
    pub section: Option<String>,
}

impl Denial {
    fn new(code: DenyCode) -> Self {
        Self {
            code,
            section: None,
        }
    }

    pub fn into_error(self) -> Error {
        let detail = match &self.section {
            Some(section) => format!("{} ({section})", self.code.detail()),
            None => self.code.detail().to_string(),
        };
        match self.code {
            DenyCode::AuthRequired => Error::auth_required(detail),
            DenyCode::AuthEventPublished => Error::invalid(detail),
            _ => Error::blocked(detail),
        }
    }
}

/// Section an event is posted to, from its first `h` tag.
pub fn section_of(event: &Event) -> Option<&str> {
    event.tags.iter().find_map(|tag| {
        let values = tag.as_slice();
        match (values.first().map(String::as_str), values.get(1)) {
            (Some("h"), Some(section)) => Some(section.as_str()),
            _ => None,
        }
    })
}

fn first_tag_value<'a>(event: &'a Event, name: &str) -> Option<&'a str> {
    event.tags.iter().find_map(|tag| {
        let values = tag.as_slice();
        match (values.first(), values.get(1)) {
            (Some(tag_name), Some(value)) if tag_name == name => Some(value.as_str()),
            _ => None,
        }
    })
}

#[derive(Debug, Clone)]
pub struct Authorizer {
    whitelist: Whitelist,
    sections: HashMap<String, BTreeSet<String>>,
    relay_url: String,
}

impl Authorizer {
    pub fn new(
        whitelist: Whitelist,
        sections: HashMap<String, BTreeSet<String>>,
        relay_url: impl Into<String>,
    ) -> Self {
        Self {
            whitelist,
            sections,
            relay_url: relay_url.into(),
        }
    }

    pub fn whitelist(&self) -> &Whitelist {
        &self.whitelist
    }

    pub fn relay_url(&self) -> &str {
        &self.relay_url
    }

    pub fn authorize(&self, event: &Event, authed: Option<&PublicKey>) -> Result<(), Denial> {
        self.authorize_at(event, authed, Timestamp::now())
    }

    pub fn authorize_at(
        &self,
        event: &Event,
        authed: Option<&PublicKey>,
        now: Timestamp,
    ) -> Result<(), Denial> {
        if event.kind == KIND_AUTH_22242 {
            return Err(Denial::new(DenyCode::AuthEventPublished));
        }

        if is_bypass_kind(event.kind) {
            return Ok(());
        }

        let Some(authed) = authed else {
            return Err(Denial::new(DenyCode::AuthRequired));
        };

        let entry = match self.whitelist.lookup(&event.pubkey) {
            Some(entry) if entry.is_expired_at(now) => {
                return Err(Denial::new(DenyCode::MembershipExpired))
            }
            Some(entry) => entry,
            None => return Err(Denial::new(DenyCode::NotWhitelisted)),
        };
        let is_admin = entry.has_cohort(self.whitelist.admin_cohort());

        if is_admin_kind(event.kind) {
            if event.pubkey != *authed {
                return Err(Denial::new(DenyCode::AuthorMismatch));
            }
            if !is_admin {
                return Err(Denial::new(DenyCode::NotAdmin));
            }
        }

        if let Some(section) = section_of(event) {
            if let Some(required) = self.sections.get(section) {
                if !is_admin && !required.is_empty() && !entry.intersects(required) {
                    debug!(
                        target: "auth",
                        "{} has cohorts {:?}, section {} requires {:?}",
                        event.pubkey, entry.cohorts, section, required
                    );
                    return Err(Denial {
                        code: DenyCode::CohortMismatch,
                        section: Some(section.to_string()),
                    });
                }
            }
        }

        Ok(())
    }

    /// Checks an AUTH response against the challenge issued to the
    /// connection. The event must already have passed validation.
    pub fn verify_auth_event(
        &self,
        event: &Event,
        challenge: &str,
        now: Timestamp,
    ) -> Result<PublicKey, Error> {
        if event.kind != KIND_AUTH_22242 {
            return Err(Error::auth_required("invalid event kind"));
        }

        match first_tag_value(event, "challenge") {
            Some(tag_challenge) if tag_challenge == challenge => {}
            Some(_) => return Err(Error::auth_required("challenge mismatch")),
            None => return Err(Error::auth_required("missing challenge tag")),
        }

        match first_tag_value(event, "relay") {
            Some(url) if same_url(url, &self.relay_url) => {}
            Some(_) => return Err(Error::auth_required("relay mismatch")),
            None => return Err(Error::auth_required("missing relay tag")),
        }

        if now.as_u64().abs_diff(event.created_at.as_u64()) > AUTH_EVENT_MAX_AGE_SECS {
            return Err(Error::auth_required("expired auth event"));
        }

        Ok(event.pubkey)
    }

    pub fn require_admin(&self, pubkey: &PublicKey) -> Result<(), Error> {
        if self.whitelist.is_admin(pubkey, Timestamp::now()) {
            Ok(())
        } else {
            Err(Error::blocked(DenyCode::NotAdmin.detail()))
        }
    }
}

fn same_url(a: &str, b: &str) -> bool {
    a.trim_end_matches('/') == b.trim_end_matches('/')
}

pub fn new_challenge() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

/// A request to check against a signed HTTP authorization header.
#[derive(Debug, Clone, Copy)]
pub struct HttpRequest<'a> {
    pub url: &'a str,
    pub method: &'a str,
    pub body: &'a [u8],
}

/// Verifies a `Nostr <base64 event>` authorization header and returns the
/// signer. Callers decide what the signer may do.
pub fn verify_http_auth(
    header: &str,
    request: HttpRequest<'_>,
    validator: &EventValidator,
    now: u64,
) -> Result<PublicKey, Error> {
    let encoded = header
        .strip_prefix(HTTP_AUTH_SCHEME)
        .map(str::trim)
        .filter(|encoded| !encoded.is_empty())
        .ok_or_else(|| Error::auth_required("expected 'Nostr <base64 event>' authorization"))?;

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| Error::auth_required(format!("authorization is not base64: {e}")))?;
    let raw: serde_json::Value = serde_json::from_slice(&decoded)
        .map_err(|e| Error::auth_required(format!("authorization is not an event: {e}")))?;
    let event = validator.validate_at(&InboundEvent::new(raw), now)?;

    if event.kind != KIND_HTTP_AUTH_27235 {
        return Err(Error::auth_required("authorization event has the wrong kind"));
    }

    if now.abs_diff(event.created_at.as_u64()) > HTTP_AUTH_WINDOW_SECS {
        return Err(Error::auth_required("authorization event is stale"));
    }

    match first_tag_value(&event, "u") {
        Some(url) if same_url(url, request.url) => {}
        _ => return Err(Error::auth_required("authorization url mismatch")),
    }

    match first_tag_value(&event, "method") {
        Some(method) if method.eq_ignore_ascii_case(request.method) => {}
        _ => return Err(Error::auth_required("authorization method mismatch")),
    }

    if let Some(payload) = first_tag_value(&event, "payload") {
        let digest = hex::encode(Sha256::digest(request.body));
        if !payload.eq_ignore_ascii_case(&digest) {
            return Err(Error::auth_required("authorization payload mismatch"));
        }
    }

    Ok(event.pubkey)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinds::{KIND_ADD_MEMBER_9000, KIND_REGISTRATION_REQUEST_9021};
    use crate::test_utils::{auth_event, signed_event, signed_event_at, tag};
    use crate::validator::ValidationLimits;
    use crate::whitelist::MemoryWhitelist;
    use nostr::{Keys, Kind};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    const RELAY_URL: &str = "wss://relay.example.com";

    async fn authorizer(members: &[(&Keys, &[&str])]) -> Authorizer {
        let whitelist = Whitelist::new(Arc::new(MemoryWhitelist::new()), "member", "admin");
        for (keys, cohorts) in members {
            whitelist
                .add_member(
                    keys.public_key(),
                    cohorts.iter().map(|c| c.to_string()).collect(),
                    None,
                )
                .await
                .unwrap();
        }
        let sections = HashMap::from([
            ("general".to_string(), BTreeSet::new()),
            (
                "board".to_string(),
                BTreeSet::from(["staff".to_string()]),
            ),
        ]);
        Authorizer::new(whitelist, sections, RELAY_URL)
    }

    #[tokio::test]
    async fn test_bypass_kinds_need_nothing() {
        let authorizer = authorizer(&[]).await;
        let stranger = Keys::generate();
        for kind in [Kind::Metadata, KIND_REGISTRATION_REQUEST_9021] {
            let event = signed_event(&stranger, kind, "{}", vec![]);
            assert_eq!(authorizer.authorize(&event, None), Ok(()));
        }
    }

    #[tokio::test]
    async fn test_non_bypass_requires_auth_then_whitelist() {
        let member = Keys::generate();
        let stranger = Keys::generate();
        let authorizer = authorizer(&[(&member, &["member"])]).await;

        let note = signed_event(&member, Kind::TextNote, "hi", vec![]);
        let denial = authorizer.authorize(&note, None).unwrap_err();
        assert_eq!(denial.code, DenyCode::AuthRequired);
        assert!(denial
            .into_error()
            .to_string()
            .starts_with("auth-required:"));
        assert_eq!(
            authorizer.authorize(&note, Some(&member.public_key())),
            Ok(())
        );

        let note = signed_event(&stranger, Kind::TextNote, "hi", vec![]);
        let denial = authorizer
            .authorize(&note, Some(&stranger.public_key()))
            .unwrap_err();
        assert_eq!(denial.code, DenyCode::NotWhitelisted);
        assert_eq!(
            denial.into_error().to_string(),
            "blocked: pubkey is not whitelisted"
        );
    }

    #[tokio::test]
    async fn test_section_cohorts() {
        let member = Keys::generate();
        let staff = Keys::generate();
        let authorizer = authorizer(&[(&member, &["member"]), (&staff, &["staff"])]).await;

        let open = signed_event(&member, Kind::TextNote, "hi", vec![tag(&["h", "general"])]);
        assert!(authorizer
            .authorize(&open, Some(&member.public_key()))
            .is_ok());

        let unknown = signed_event(&member, Kind::TextNote, "hi", vec![tag(&["h", "random"])]);
        assert!(authorizer
            .authorize(&unknown, Some(&member.public_key()))
            .is_ok());

        let board = signed_event(&member, Kind::TextNote, "hi", vec![tag(&["h", "board"])]);
        let denial = authorizer
            .authorize(&board, Some(&member.public_key()))
            .unwrap_err();
        assert_eq!(denial.code, DenyCode::CohortMismatch);

        let board = signed_event(&staff, Kind::TextNote, "hi", vec![tag(&["h", "board"])]);
        assert!(authorizer
            .authorize(&board, Some(&staff.public_key()))
            .is_ok());
    }

    #[tokio::test]
    async fn test_admin_kinds() {
        let admin = Keys::generate();
        let member = Keys::generate();
        let authorizer = authorizer(&[(&admin, &["admin"]), (&member, &["member"])]).await;

        let command = signed_event(
            &member,
            KIND_ADD_MEMBER_9000,
            "",
            vec![tag(&["p", &Keys::generate().public_key().to_hex()])],
        );
        assert_eq!(
            authorizer
                .authorize(&command, Some(&member.public_key()))
                .unwrap_err()
                .code,
            DenyCode::NotAdmin
        );

        let command = signed_event(&admin, KIND_ADD_MEMBER_9000, "", vec![]);
        assert!(authorizer
            .authorize(&command, Some(&admin.public_key()))
            .is_ok());
        assert_eq!(
            authorizer
                .authorize(&command, Some(&member.public_key()))
                .unwrap_err()
                .code,
            DenyCode::AuthorMismatch
        );
    }

    #[tokio::test]
    async fn test_expired_membership() {
        let member = Keys::generate();
        let authorizer = authorizer(&[]).await;
        authorizer
            .whitelist()
            .add_member(member.public_key(), BTreeSet::new(), Some(Timestamp::from(100)))
            .await
            .unwrap();

        let note = signed_event(&member, Kind::TextNote, "hi", vec![]);
        let denial = authorizer
            .authorize_at(&note, Some(&member.public_key()), Timestamp::from(200))
            .unwrap_err();
        assert_eq!(denial.code, DenyCode::MembershipExpired);
    }

    #[tokio::test]
    async fn test_auth_event_verification() {
        let authorizer = authorizer(&[]).await;
        let keys = Keys::generate();
        let now = Timestamp::now();

        let event = auth_event(&keys, "abc", &format!("{RELAY_URL}/"));
        assert_eq!(
            authorizer.verify_auth_event(&event, "abc", now).unwrap(),
            keys.public_key()
        );

        let error = authorizer
            .verify_auth_event(&event, "other", now)
            .unwrap_err();
        assert_eq!(error.to_string(), "auth-required: challenge mismatch");

        let wrong_relay = auth_event(&keys, "abc", "wss://elsewhere.example.com");
        assert!(authorizer
            .verify_auth_event(&wrong_relay, "abc", now)
            .is_err());

        let old = signed_event_at(
            &keys,
            Kind::Authentication,
            "",
            vec![tag(&["challenge", "abc"]), tag(&["relay", RELAY_URL])],
            now.as_u64() - 3600,
        );
        let error = authorizer.verify_auth_event(&old, "abc", now).unwrap_err();
        assert_eq!(error.to_string(), "auth-required: expired auth event");
    }

    fn http_header(event: &Event) -> String {
        let json = serde_json::to_string(event).unwrap();
        format!(
            "Nostr {}",
            base64::engine::general_purpose::STANDARD.encode(json)
        )
    }

    #[test]
    fn test_http_auth() {
        let keys = Keys::generate();
        let validator = EventValidator::new(ValidationLimits::default());
        let url = "https://relay.example.com/api/whitelist";
        let body = br#"{"pubkey":"x"}"#;
        let event = signed_event(
            &keys,
            KIND_HTTP_AUTH_27235,
            "",
            vec![
                tag(&["u", url]),
                tag(&["method", "POST"]),
                tag(&["payload", &hex::encode(Sha256::digest(body))]),
            ],
        );
        let now = event.created_at.as_u64();
        let request = HttpRequest {
            url,
            method: "post",
            body,
        };

        assert_eq!(
            verify_http_auth(&http_header(&event), request, &validator, now).unwrap(),
            keys.public_key()
        );

        let wrong_method = HttpRequest {
            method: "DELETE",
            ..request
        };
        assert!(verify_http_auth(&http_header(&event), wrong_method, &validator, now).is_err());

        let wrong_body = HttpRequest {
            body: b"{}",
            ..request
        };
        assert!(verify_http_auth(&http_header(&event), wrong_body, &validator, now).is_err());

        assert!(verify_http_auth(&http_header(&event), request, &validator, now + 120).is_err());
        assert!(verify_http_auth("Bearer abc", request, &validator, now).is_err());
    }
}
