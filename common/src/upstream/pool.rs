use std::collections::HashMap;
use std::sync::Arc;

use async_stream::stream;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, instrument, Level};

use crate::upstream::{
    BlobStream, DcId, FileLocator, Upstream, UpstreamError, UpstreamSession, CHUNK,
};

// per-datacenter pool of pre-authenticated download sessions
//
// authenticating a fresh session against a datacenter takes 10-15 seconds,
// so every concurrent stream targeting the same dc shares one entry.  the
// map mutex is held only for lookup/insert; session creation happens under
// the entry's OnceCell so racing first requests wait instead of opening a
// second session.  entries are never evicted -- they are idle-cheap and
// dropped at shutdown.
pub struct SessionPool {
    upstream: Arc<dyn Upstream>,
    entries: Mutex<HashMap<DcId, Arc<PoolEntry>>>,
}

pub struct PoolEntry {
    dc_id: DcId,
    session: OnceCell<Arc<dyn UpstreamSession>>,
    // serializes wire requests where the underlying protocol is
    // single-request-per-connection; held per chunk, so concurrent streams
    // interleave at blob granularity
    request_lock: Mutex<()>,
}

impl PoolEntry {
    async fn session(
        &self,
        upstream: &Arc<dyn Upstream>,
    ) -> Result<Arc<dyn UpstreamSession>, UpstreamError> {
        self.session
            .get_or_try_init(|| upstream.open_session(self.dc_id))
            .await
            .cloned()
    }
}

impl SessionPool {
    pub fn new(upstream: Arc<dyn Upstream>) -> Arc<Self> {
        Arc::new(SessionPool {
            upstream,
            entries: Mutex::new(HashMap::new()),
        })
    }

    async fn entry(&self, dc_id: DcId) -> Arc<PoolEntry> {
        let mut entries = self.entries.lock().await;

        entries
            .entry(dc_id)
            .or_insert_with(|| {
                debug!({ dc_id = dc_id }, "creating session pool entry");
                Arc::new(PoolEntry {
                    dc_id,
                    session: OnceCell::new(),
                    request_lock: Mutex::new(()),
                })
            })
            .clone()
    }

    // lazy blob sequence for one file starting at start_chunk
    //
    // resolves the datacenter from the locator, waits on the entry (and its
    // first-use session creation) and then pulls chunks one wire request at
    // a time.  the sequence ends at the first short or empty chunk; errors
    // terminate it and are the caller's to classify.
    #[instrument(level = Level::DEBUG, skip(self, locator), fields(dc_id = locator.dc_id))]
    pub fn stream_from(self: Arc<Self>, locator: FileLocator, start_chunk: u64) -> BlobStream {
        let pool = self;

        Box::pin(stream! {
            let entry = pool.entry(locator.dc_id).await;

            let session = match entry.session(&pool.upstream).await {
                Ok(session) => session,
                Err(err) => {
                    yield Err(err);
                    return;
                }
            };

            let mut chunk_index = start_chunk;

            loop {
                let fetched = {
                    let _guard = entry.request_lock.lock().await;
                    session.fetch_chunk(&locator, chunk_index).await
                };

                match fetched {
                    Ok(Some(blob)) if blob.is_empty() => break,
                    Ok(Some(blob)) => {
                        let last = (blob.len() as u64) < CHUNK;
                        yield Ok(blob);
                        if last {
                            break;
                        }
                        chunk_index += 1;
                    }
                    Ok(None) => break,
                    Err(err) => {
                        yield Err(err);
                        break;
                    }
                }
            }
        })
    }

    // number of live entries; diagnostic only
    pub async fn entry_count(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn shutdown(&self) {
        self.entries.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::upstream::mock::MockUpstream;

    #[tokio::test]
    async fn concurrent_streams_share_one_entry() {
        let upstream = MockUpstream::new();
        upstream.add_file(-100, 1, vec![7u8; (2 * CHUNK + 5) as usize]);

        let pool = SessionPool::new(upstream.as_dyn());

        let file = upstream.remote_file(-100, 1);

        let a = pool.clone().stream_from(file.locator.clone(), 0);
        let b = pool.clone().stream_from(file.locator.clone(), 0);

        let (a, b) = tokio::join!(
            a.collect::<Vec<_>>(),
            b.collect::<Vec<_>>()
        );

        assert_eq!(a.len(), 3);
        assert_eq!(b.len(), 3);
        assert_eq!(pool.entry_count().await, 1);
        assert_eq!(upstream.open_session_calls(), 1);
    }

    #[tokio::test]
    async fn blob_sequence_ends_at_chunk_aligned_eof() {
        let upstream = MockUpstream::new();
        upstream.add_file(-100, 2, vec![1u8; CHUNK as usize]);

        let pool = SessionPool::new(upstream.as_dyn());
        let file = upstream.remote_file(-100, 2);

        let blobs: Vec<_> = pool
            .stream_from(file.locator.clone(), 0)
            .collect::<Vec<_>>()
            .await;

        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs[0].as_ref().unwrap().len(), CHUNK as usize);
    }

    #[tokio::test]
    async fn streams_to_distinct_dcs_get_distinct_entries() {
        let upstream = MockUpstream::new();
        upstream.add_file_in_dc(-100, 3, vec![0u8; 10], 2);
        upstream.add_file_in_dc(-100, 4, vec![0u8; 10], 4);

        let pool = SessionPool::new(upstream.as_dyn());

        let f3 = upstream.remote_file(-100, 3);
        let f4 = upstream.remote_file(-100, 4);

        let _ = pool.clone().stream_from(f3.locator, 0).collect::<Vec<_>>().await;
        let _ = pool.clone().stream_from(f4.locator, 0).collect::<Vec<_>>().await;

        assert_eq!(pool.entry_count().await, 2);
        assert_eq!(upstream.open_session_calls(), 2);
    }
}
