//! Signing and publishing the event kinds the client produces.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::{
    error::Result,
    event::{Event, Tag, UnsignedEvent, KIND_CONTACTS},
    keys::{npub_to_hex, Keys},
    relay::{PublishReport, RelayPool},
};

/// Publishes to a fixed relay set.
pub struct Publisher {
    pool: Arc<dyn RelayPool>,
    relays: Vec<String>,
}

impl Publisher {
    pub fn new(pool: Arc<dyn RelayPool>, relays: Vec<String>) -> Self {
        Self { pool, relays }
    }

    /// Sign `unsigned` as `keys` and send it to every relay.
    pub async fn publish(
        &self,
        keys: &Keys,
        unsigned: UnsignedEvent,
    ) -> Result<(Event, PublishReport)> {
        let event = keys.sign(unsigned)?;
        event.verify()?;
        let report = self.pool.publish(&self.relays, &event).await?;
        info!(
            id = %event.id,
            kind = event.kind,
            accepted = report.accepted.len(),
            rejected = report.rejected.len(),
            failed = report.failed.len(),
            "event published"
        );
        for (relay, reason) in &report.rejected {
            warn!(relay = %relay, reason = %reason, "relay rejected event");
        }
        Ok((event, report))
    }

    pub async fn note(&self, keys: &Keys, content: &str) -> Result<(Event, PublishReport)> {
        self.publish(keys, UnsignedEvent::note(content, vec![])).await
    }

    pub async fn metadata(&self, keys: &Keys, metadata: &Value) -> Result<(Event, PublishReport)> {
        self.publish(keys, UnsignedEvent::metadata(metadata)?).await
    }

    pub async fn react(
        &self,
        keys: &Keys,
        event_id: &str,
        author: &str,
        content: Option<&str>,
    ) -> Result<(Event, PublishReport)> {
        self.publish(keys, UnsignedEvent::reaction(event_id, author, content)).await
    }

    pub async fn repost(&self, keys: &Keys, original: &Event) -> Result<(Event, PublishReport)> {
        let hint = self.relays.first().map(String::as_str);
        self.publish(keys, UnsignedEvent::repost(original, hint)?).await
    }

    /// Add `npub` to the contact list, keeping every existing entry.
    pub async fn follow(&self, keys: &Keys, npub: &str) -> Result<(Event, PublishReport)> {
        let target = npub_to_hex(npub)?;
        let existing = self.contact_list(keys).await?;
        let mut unsigned = UnsignedEvent::contact_list(follow_tags(existing.as_ref(), &target));
        if let Some(prev) = existing {
            unsigned.content = prev.content;
        }
        self.publish(keys, unsigned).await
    }

    /// Drop `npub` from the contact list. Returns `None` when there is no
    /// contact list to edit.
    pub async fn unfollow(
        &self,
        keys: &Keys,
        npub: &str,
    ) -> Result<Option<(Event, PublishReport)>> {
        let target = npub_to_hex(npub)?;
        let Some(existing) = self.contact_list(keys).await? else {
            info!(npub, "no contact list; nothing to unfollow");
            return Ok(None);
        };
        let mut unsigned = UnsignedEvent::contact_list(unfollow_tags(&existing, &target));
        unsigned.content = existing.content;
        self.publish(keys, unsigned).await.map(Some)
    }

    /// Latest kind-3 event authored by `keys`.
    async fn contact_list(&self, keys: &Keys) -> Result<Option<Event>> {
        let filter = json!({"kinds": [KIND_CONTACTS], "authors": [keys.public_key_hex()]});
        self.pool.get(&self.relays, &filter).await
    }
}

fn follow_tags(existing: Option<&Event>, target: &str) -> Vec<Tag> {
    let mut tags: Vec<Tag> = existing.map(|ev| ev.tags.clone()).unwrap_or_default();
    let already = tags
        .iter()
        .any(|t| t.0.first().map(String::as_str) == Some("p") && t.value() == Some(target));
    if !already {
        tags.push(Tag::pair("p", target));
    }
    tags
}

fn unfollow_tags(existing: &Event, target: &str) -> Vec<Tag> {
    existing
        .tags
        .iter()
        .filter(|t| !(t.0.first().map(String::as_str) == Some("p") && t.value() == Some(target)))
        .cloned()
        .collect()
}
