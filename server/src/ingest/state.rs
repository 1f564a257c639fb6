use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use crate::ingest::fetch::FetchCandidate;
use api::{MsgId, UserId};
use common::upstream::RemoteDocument;

// pending conversational state, one slot per user
//
// both flows are short-lived (seconds to minutes); anything older than the
// ttl is a user who walked away, and the sweeper drops it so the map does
// not grow with every drive-by /start
pub const PENDING_TTL: Duration = Duration::from_secs(600);

#[derive(Clone, Debug)]
pub enum Pending {
    Upload(UploadState),
    Url(UrlState),
}

impl Pending {
    fn since(&self) -> Instant {
        match self {
            Pending::Upload(state) => state.since,
            Pending::Url(state) => state.since,
        }
    }
}

// a received file waiting for its display name
#[derive(Clone, Debug)]
pub struct UploadState {
    pub src_chat: i64,
    pub src_msg_id: MsgId,
    pub doc: RemoteDocument,
    pub since: Instant,
}

// a probed url waiting for a quality selection
#[derive(Clone, Debug)]
pub struct UrlState {
    pub url: String,
    pub title: String,
    pub duration_seconds: Option<u64>,
    pub candidates: Vec<FetchCandidate>,
    pub since: Instant,
}

pub struct PendingMap {
    inner: DashMap<UserId, Pending>,
}

impl Default for PendingMap {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingMap {
    pub fn new() -> Self {
        PendingMap {
            inner: DashMap::new(),
        }
    }

    // a new interaction replaces whatever was pending before
    pub fn insert(&self, user_id: UserId, pending: Pending) {
        self.inner.insert(user_id, pending);
    }

    pub fn take(&self, user_id: UserId) -> Option<Pending> {
        self.inner.remove(&user_id).map(|(_, pending)| pending)
    }

    pub fn peek_kind(&self, user_id: UserId) -> Option<&'static str> {
        self.inner.get(&user_id).map(|entry| match entry.value() {
            Pending::Upload(_) => "upload",
            Pending::Url(_) => "url",
        })
    }

    pub fn sweep(&self, ttl: Duration) -> usize {
        let before = self.inner.len();

        self.inner.retain(|_, pending| pending.since().elapsed() < ttl);

        let removed = before - self.inner.len();
        if removed > 0 {
            debug!({ removed }, "swept stale pending state");
        }

        removed
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload(since: Instant) -> Pending {
        Pending::Upload(UploadState {
            src_chat: 7,
            src_msg_id: 1,
            doc: RemoteDocument {
                unique_id: "u".to_string(),
                name: "n".to_string(),
                mime_type: "video/mp4".to_string(),
                size: 1,
                duration_seconds: None,
            },
            since,
        })
    }

    #[test]
    fn take_consumes_the_slot() {
        let map = PendingMap::new();
        map.insert(1, upload(Instant::now()));

        assert!(map.take(1).is_some());
        assert!(map.take(1).is_none());
    }

    #[test]
    fn sweep_drops_only_stale_entries() {
        let map = PendingMap::new();

        map.insert(1, upload(Instant::now()));
        map.insert(2, upload(Instant::now() - Duration::from_secs(3600)));

        assert_eq!(map.sweep(PENDING_TTL), 1);
        assert_eq!(map.len(), 1);
        assert!(map.take(1).is_some());
    }
}
