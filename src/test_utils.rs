use crate::codec::InboundEvent;
use crate::storage::{QueryLimits, RelayDatabase};
use nostr::prelude::*;
use std::sync::Arc;
use tempfile::TempDir;

pub async fn setup_test() -> (TempDir, Arc<RelayDatabase>, Keys) {
    let tmp_dir = TempDir::new().unwrap();
    let db_path = tmp_dir.path().join("test.db");
    let keys = Keys::generate();
    let database = Arc::new(RelayDatabase::open(&db_path, QueryLimits::default()).unwrap());
    (tmp_dir, database, keys)
}

pub fn tag(values: &[&str]) -> Tag {
    Tag::custom(
        TagKind::Custom(values[0].to_string().into()),
        values[1..].iter().map(|value| value.to_string()),
    )
}

pub fn signed_event(keys: &Keys, kind: Kind, content: &str, tags: Vec<Tag>) -> Event {
    EventBuilder::new(kind, content)
        .tags(tags)
        .sign_with_keys(keys)
        .unwrap()
}

pub fn signed_event_at(
    keys: &Keys,
    kind: Kind,
    content: &str,
    tags: Vec<Tag>,
    created_at: u64,
) -> Event {
    EventBuilder::new(kind, content)
        .tags(tags)
        .custom_created_at(Timestamp::from(created_at))
        .sign_with_keys(keys)
        .unwrap()
}

pub fn inbound(event: &Event) -> InboundEvent {
    InboundEvent::new(serde_json::to_value(event).unwrap())
}

pub fn auth_event(keys: &Keys, challenge: &str, relay_url: &str) -> Event {
    signed_event(
        keys,
        Kind::Authentication,
        "",
        vec![tag(&["challenge", challenge]), tag(&["relay", relay_url])],
    )
}
