//! Privileged membership and moderation commands.
//!
//! Commands are ordinary signed events. They are parsed before storage so a
//! malformed command is refused outright, and applied only after the event
//! itself has been stored. Applied command ids are recorded, so a command
//! whose side effect failed is applied when the client publishes it again.

use crate::error::Error;
use crate::kinds::{KIND_ADD_MEMBER_9000, KIND_MODERATED_DELETE_9005, KIND_REMOVE_MEMBER_9001};
use crate::metrics;
use crate::storage::{deletion_targets, DeletionTarget, RelayDatabase};
use crate::whitelist::Whitelist;
use nostr::{Event, PublicKey, Timestamp};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberChange {
    pub pubkey: PublicKey,
    pub cohorts: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    AddMembers {
        members: Vec<MemberChange>,
        expires_at: Option<Timestamp>,
    },
    RemoveMembers {
        members: Vec<MemberChange>,
    },
    ModeratedDelete {
        targets: Vec<DeletionTarget>,
    },
}

impl AdminCommand {
    /// `Ok(None)` for events that are not admin commands.
    pub fn from_event(event: &Event) -> Result<Option<Self>, Error> {
        let command = if event.kind == KIND_ADD_MEMBER_9000 {
            AdminCommand::AddMembers {
                members: member_changes(event)?,
                expires_at: expiration(event)?,
            }
        } else if event.kind == KIND_REMOVE_MEMBER_9001 {
            AdminCommand::RemoveMembers {
                members: member_changes(event)?,
            }
        } else if event.kind == KIND_MODERATED_DELETE_9005 {
            let targets = deletion_targets(event);
            if targets.is_empty() {
                return Err(Error::invalid("moderated delete names no events"));
            }
            AdminCommand::ModeratedDelete { targets }
        } else {
            return Ok(None);
        };
        Ok(Some(command))
    }

    fn label(&self) -> &'static str {
        match self {
            AdminCommand::AddMembers { .. } => "add_member",
            AdminCommand::RemoveMembers { .. } => "remove_member",
            AdminCommand::ModeratedDelete { .. } => "moderated_delete",
        }
    }
}

fn member_changes(event: &Event) -> Result<Vec<MemberChange>, Error> {
    let mut members = Vec::new();
    for tag in event.tags.iter() {
        let values = tag.as_slice();
        if values.first().map(String::as_str) != Some("p") {
            continue;
        }
        let hex = values
            .get(1)
            .ok_or_else(|| Error::invalid("p tag without a pubkey"))?;
        let pubkey = PublicKey::from_hex(hex)
            .map_err(|_| Error::invalid(format!("bad member pubkey {hex}")))?;
        let cohorts = values
            .iter()
            .skip(2)
            .filter(|cohort| !cohort.is_empty())
            .cloned()
            .collect();
        members.push(MemberChange { pubkey, cohorts });
    }

    if members.is_empty() {
        return Err(Error::invalid("membership command names no pubkey"));
    }
    Ok(members)
}

fn expiration(event: &Event) -> Result<Option<Timestamp>, Error> {
    for tag in event.tags.iter() {
        let values = tag.as_slice();
        if values.first().map(String::as_str) == Some("expiration") {
            let at = values
                .get(1)
                .and_then(|value| value.parse::<u64>().ok())
                .ok_or_else(|| Error::invalid("expiration must be a unix timestamp"))?;
            return Ok(Some(Timestamp::from(at)));
        }
    }
    Ok(None)
}

#[derive(Debug, Clone)]
pub struct AdminProcessor {
    whitelist: Whitelist,
    database: Arc<RelayDatabase>,
}

impl AdminProcessor {
    pub fn new(whitelist: Whitelist, database: Arc<RelayDatabase>) -> Self {
        Self {
            whitelist,
            database,
        }
    }

    /// Applies a stored command unless an earlier delivery of the same event
    /// already did. Returns whether it was applied now.
    pub async fn apply_once(&self, command: AdminCommand, event: &Event) -> Result<bool, Error> {
        let id = event.id.to_hex();
        if self.database.is_command_applied(id.clone()).await? {
            debug!(target: "admin", "Command {} was already applied", id);
            return Ok(false);
        }
        self.apply(command, event).await?;
        self.database.mark_command_applied(id).await?;
        Ok(true)
    }

    /// Applies the side effect of a stored command event. Every command is
    /// idempotent.
    pub async fn apply(&self, command: AdminCommand, event: &Event) -> Result<(), Error> {
        let label = command.label();
        match command {
            AdminCommand::AddMembers {
                members,
                expires_at,
            } => {
                for member in members {
                    self.whitelist
                        .add_member(member.pubkey, member.cohorts, expires_at)
                        .await?;
                    info!(
                        target: "admin",
                        "{} added {} to the whitelist", event.pubkey, member.pubkey
                    );
                }
            }
            AdminCommand::RemoveMembers { members } => {
                for member in members {
                    self.whitelist
                        .remove_member(member.pubkey, member.cohorts)
                        .await?;
                    info!(
                        target: "admin",
                        "{} removed {} from the whitelist", event.pubkey, member.pubkey
                    );
                }
            }
            AdminCommand::ModeratedDelete { targets } => {
                let count = self
                    .database
                    .tombstone(targets, None, event.id.to_hex(), event.created_at)
                    .await?;
                info!(
                    target: "admin",
                    "{} tombstoned {} event(s) with {}", event.pubkey, count, event.id
                );
            }
        }
        metrics::admin_commands_applied(label).increment(1);
        Ok(())
    }
}
