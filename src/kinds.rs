//! Event kind constants and the table-driven storage classification.
//!
//! The storage behaviour of a kind is never decided by ad-hoc conditionals:
//! [`KindClass::of`] scans [`KIND_CLASS_TABLE`] and every write path
//! dispatches on the resulting class. New kinds are added as table rows.

use nostr::Kind;
use std::ops::RangeInclusive;
use strum::{Display, IntoStaticStr};

pub const KIND_METADATA_0: Kind = Kind::Metadata;
pub const KIND_DELETION_5: Kind = Kind::EventDeletion;
pub const KIND_ADD_MEMBER_9000: Kind = Kind::Custom(9000);
pub const KIND_REMOVE_MEMBER_9001: Kind = Kind::Custom(9001);
pub const KIND_MODERATED_DELETE_9005: Kind = Kind::Custom(9005);
pub const KIND_REGISTRATION_REQUEST_9021: Kind = Kind::Custom(9021);
pub const KIND_AUTH_22242: Kind = Kind::Authentication;
pub const KIND_HTTP_AUTH_27235: Kind = Kind::Custom(27235);

/// Kinds any pubkey may publish, whitelisted or not.
pub const BYPASS_KINDS: [Kind; 2] = [KIND_METADATA_0, KIND_REGISTRATION_REQUEST_9021];

/// Kinds interpreted as privileged commands by the admin processor.
pub const ADMIN_KINDS: [Kind; 3] = [
    KIND_ADD_MEMBER_9000,
    KIND_REMOVE_MEMBER_9001,
    KIND_MODERATED_DELETE_9005,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum KindClass {
    Regular,
    Replaceable,
    ParameterizedReplaceable,
    Ephemeral,
}

/// Rows are scanned in order; the first matching range wins and anything
/// unmatched is [`KindClass::Regular`].
pub const KIND_CLASS_TABLE: &[(RangeInclusive<u16>, KindClass)] = &[
    (0..=0, KindClass::Replaceable),
    (3..=3, KindClass::Replaceable),
    (10_000..=19_999, KindClass::Replaceable),
    (20_000..=29_999, KindClass::Ephemeral),
    (30_000..=39_999, KindClass::ParameterizedReplaceable),
];

impl KindClass {
    pub fn of(kind: Kind) -> Self {
        let kind = kind.as_u16();
        KIND_CLASS_TABLE
            .iter()
            .find(|(range, _)| range.contains(&kind))
            .map(|(_, class)| *class)
            .unwrap_or(KindClass::Regular)
    }

    pub fn is_persisted(self) -> bool {
        !matches!(self, KindClass::Ephemeral)
    }

    pub fn is_replaceable(self) -> bool {
        matches!(
            self,
            KindClass::Replaceable | KindClass::ParameterizedReplaceable
        )
    }
}

pub fn is_bypass_kind(kind: Kind) -> bool {
    BYPASS_KINDS.contains(&kind)
}

pub fn is_admin_kind(kind: Kind) -> bool {
    ADMIN_KINDS.contains(&kind)
}
