//! Live matching of events against subscription filters.
//!
//! Uses the same rules as the SQL built by the storage layer: every present
//! field must match, any value within a field may match, and an empty value
//! set matches nothing. `limit` only bounds the historical query.

use nostr::{Event, Filter};

pub fn matches(filter: &Filter, event: &Event) -> bool {
    if let Some(ids) = &filter.ids {
        if !ids.contains(&event.id) {
            return false;
        }
    }

    if let Some(authors) = &filter.authors {
        if !authors.contains(&event.pubkey) {
            return false;
        }
    }

    if let Some(kinds) = &filter.kinds {
        if !kinds.contains(&event.kind) {
            return false;
        }
    }

    if filter.since.is_some_and(|since| event.created_at < since) {
        return false;
    }

    if filter.until.is_some_and(|until| event.created_at > until) {
        return false;
    }

    filter.generic_tags.iter().all(|(tag, values)| {
        let name = tag.as_char().to_string();
        event.tags.iter().any(|event_tag| {
            let slice = event_tag.as_slice();
            slice.first() == Some(&name) && slice.get(1).is_some_and(|value| values.contains(value))
        })
    })
}

/// A subscription matches when any of its filters does.
pub fn matches_any(filters: &[Filter], event: &Event) -> bool {
    filters.iter().any(|filter| matches(filter, event))
}
