use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, warn};

use crate::http::range::{ByteSpan, ChunkPlan};
use api::{ChannelId, MsgId};
use common::upstream::{
    pool::SessionPool, BlobStream, FileLocator, Upstream, UpstreamError,
};

// stream engine
//
// given a validated byte span, produce exactly span.want() bytes of the
// archived file and close cleanly.  the upstream speaks in fixed chunks,
// so a span maps to a chunk plan: skip whole chunks, trim the head of the
// first blob, trim the tail of the last.
//
// file locators expire minutes after issuance.  when the blob sequence
// fails with a recoverable kind the outer loop owns the cursor state
// (delivered, locator) and builds a *new* blob sequence at the current
// absolute position -- iterators are never reused across retries.
pub struct StreamEngine {
    upstream: Arc<dyn Upstream>,
    pool: Arc<SessionPool>,
    blob_timeout: Duration,
}

// bounded recovery: exceeding this surfaces StreamBroken, which the http
// layer can only express as an abrupt close once headers are out
const MAX_RECOVERY_ATTEMPTS: u32 = 3;
const BACKOFF: [Duration; 3] = [
    Duration::from_millis(100),
    Duration::from_millis(400),
    Duration::from_millis(1600),
];

impl StreamEngine {
    pub fn new(
        upstream: Arc<dyn Upstream>,
        pool: Arc<SessionPool>,
        blob_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(StreamEngine {
            upstream,
            pool,
            blob_timeout,
        })
    }

    pub fn stream(&self, channel_id: ChannelId, msg_id: MsgId, span: ByteSpan) -> BlobStream {
        let upstream = self.upstream.clone();
        let pool = self.pool.clone();
        let blob_timeout = self.blob_timeout;

        Box::pin(async_stream::stream! {
            let want = span.want();
            let mut delivered: u64 = 0;
            let mut attempts: u32 = 0;

            // set when a retry may reuse the previous locator (first blob
            // timeout, flood waits); everything else re-fetches the message
            let mut resume_locator: Option<FileLocator> = None;

            'restart: loop {
                let locator = match resume_locator.take() {
                    Some(locator) => locator,
                    None => match upstream.get_message(channel_id, msg_id).await {
                        Ok(file) => file.locator,
                        Err(UpstreamError::FloodLimited { retry_after }) => {
                            warn!({ channel_id, msg_id, wait = ?retry_after }, "flood limited while resolving message");
                            sleep(retry_after).await;
                            continue 'restart;
                        }
                        Err(err) if err.is_recoverable() && attempts < MAX_RECOVERY_ATTEMPTS => {
                            attempts += 1;
                            sleep(BACKOFF[(attempts - 1) as usize]).await;
                            continue 'restart;
                        }
                        Err(err) => {
                            error!({ channel_id, msg_id, error = %err }, "failed to resolve message");
                            yield Err(err);
                            return;
                        }
                    },
                };

                // absolute cursor: bytes [span.start, span.start + delivered)
                // are already with the client
                let plan = ChunkPlan::at(span.start + delivered, want - delivered);
                let mut head_skip = plan.head_skip;

                debug!(
                    { channel_id, msg_id, dc_id = locator.dc_id,
                      chunk_offset = plan.chunk_offset, head_skip = plan.head_skip, want = plan.want },
                    "starting blob sequence"
                );

                let mut blobs = pool.clone().stream_from(locator.clone(), plan.chunk_offset);

                loop {
                    let item = match timeout(blob_timeout, blobs.next()).await {
                        Ok(item) => item,
                        Err(_) => {
                            // a stalled fetch heals like an expired
                            // reference, except the locator survives the
                            // first retry
                            attempts += 1;
                            if attempts > MAX_RECOVERY_ATTEMPTS {
                                error!({ channel_id, msg_id, delivered }, "blob timeout after retry budget");
                                yield Err(UpstreamError::StreamBroken { attempts: attempts - 1 });
                                return;
                            }
                            if attempts == 1 {
                                resume_locator = Some(locator.clone());
                            }
                            warn!({ channel_id, msg_id, delivered, attempt = attempts }, "blob timeout, resuming");
                            sleep(BACKOFF[(attempts - 1) as usize]).await;
                            continue 'restart;
                        }
                    };

                    match item {
                        Some(Ok(mut blob)) => {
                            // head trim applies only to the first blob of
                            // each (re)start
                            if head_skip > 0 {
                                if (blob.len() as u64) <= head_skip {
                                    head_skip -= blob.len() as u64;
                                    continue;
                                }
                                blob = blob.slice(head_skip as usize..);
                                head_skip = 0;
                            }

                            // tail trim: never emit past want
                            let remaining = want - delivered;
                            if (blob.len() as u64) > remaining {
                                blob = blob.slice(..remaining as usize);
                            }

                            delivered += blob.len() as u64;
                            yield Ok(blob);

                            if delivered == want {
                                debug!({ channel_id, msg_id, delivered }, "stream complete");
                                return;
                            }
                        }
                        Some(Err(UpstreamError::FloodLimited { retry_after })) => {
                            // honour the indicated wait; does not consume a
                            // recovery attempt and the locator stays valid
                            warn!({ channel_id, msg_id, wait = ?retry_after }, "flood limited mid-stream");
                            sleep(retry_after).await;
                            resume_locator = Some(locator.clone());
                            continue 'restart;
                        }
                        Some(Err(err)) if err.is_recoverable() => {
                            attempts += 1;
                            if attempts > MAX_RECOVERY_ATTEMPTS {
                                error!({ channel_id, msg_id, delivered, error = %err }, "stream broken after retry budget");
                                yield Err(UpstreamError::StreamBroken { attempts: attempts - 1 });
                                return;
                            }
                            warn!({ channel_id, msg_id, delivered, attempt = attempts, error = %err }, "blob sequence failed, healing");
                            sleep(BACKOFF[(attempts - 1) as usize]).await;
                            continue 'restart;
                        }
                        Some(Err(err)) => {
                            error!({ channel_id, msg_id, delivered, error = %err }, "terminal upstream failure");
                            yield Err(err);
                            return;
                        }
                        None => {
                            // upstream ran out of data before the span was
                            // satisfied; size_bytes and reality disagree
                            error!({ channel_id, msg_id, delivered, want }, "premature end of blob sequence");
                            yield Err(UpstreamError::PrematureEof { delivered, want });
                            return;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use futures::StreamExt;

    use super::*;
    use common::upstream::mock::{Fault, MockUpstream};
    use common::upstream::CHUNK;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn engine_over(upstream: &MockUpstream) -> Arc<StreamEngine> {
        engine_with_timeout(upstream, Duration::from_secs(5))
    }

    fn engine_with_timeout(upstream: &MockUpstream, blob_timeout: Duration) -> Arc<StreamEngine> {
        let handle = upstream.as_dyn();
        StreamEngine::new(handle.clone(), SessionPool::new(handle), blob_timeout)
    }

    async fn collect(stream: BlobStream) -> Result<Vec<u8>, UpstreamError> {
        let mut out = BytesMut::new();
        let mut stream = stream;

        while let Some(item) = stream.next().await {
            out.extend_from_slice(&item?);
        }

        Ok(out.to_vec())
    }

    fn span(start: u64, end: u64, total: u64) -> ByteSpan {
        ByteSpan { start, end, total }
    }

    #[tokio::test]
    async fn full_read_is_byte_exact() {
        let data = pattern((3 * CHUNK + 123) as usize);
        let upstream = MockUpstream::new();
        upstream.add_file(-100, 1, data.clone());

        let engine = engine_over(&upstream);
        let total = data.len() as u64;

        let out = collect(engine.stream(-100, 1, span(0, total - 1, total)))
            .await
            .unwrap();

        assert_eq!(out, data);
        assert_eq!(
            upstream
                .fetched_chunks()
                .iter()
                .map(|(_, c)| *c)
                .collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
    }

    #[tokio::test]
    async fn ranges_are_byte_exact_at_awkward_sizes() {
        // sizes around the chunk boundary plus a mid-file span
        for size in [1, CHUNK - 1, CHUNK, CHUNK + 1, 3 * CHUNK + 123] {
            let data = pattern(size as usize);
            let upstream = MockUpstream::new();
            upstream.add_file(-100, 1, data.clone());
            let engine = engine_over(&upstream);

            let cases = [
                (0, size - 1),
                (0, (size - 1) / 2),
                (size / 2, size - 1),
                (size.saturating_sub(7).min(size - 1), size - 1),
            ];

            for (start, end) in cases {
                let out = collect(engine.stream(-100, 1, span(start, end, size)))
                    .await
                    .unwrap();

                assert_eq!(
                    out,
                    &data[start as usize..=end as usize],
                    "size {size} range {start}-{end}"
                );
            }
        }
    }

    #[tokio::test]
    async fn range_spanning_one_chunk_boundary() {
        let total = 1_500_000u64;
        let data = pattern(total as usize);
        let upstream = MockUpstream::new();
        upstream.add_file(-100, 1, data.clone());
        let engine = engine_over(&upstream);

        let out = collect(engine.stream(-100, 1, span(500_000, 1_000_000, total)))
            .await
            .unwrap();

        assert_eq!(out.len(), 500_001);
        assert_eq!(out, &data[500_000..=1_000_000]);

        // head skipped inside chunk 0, finished inside chunk 1
        assert_eq!(
            upstream
                .fetched_chunks()
                .iter()
                .map(|(_, c)| *c)
                .collect::<Vec<_>>(),
            vec![0, 1]
        );
    }

    #[tokio::test]
    async fn tail_range_starts_at_the_right_chunk() {
        let total = 1_500_000u64;
        let data = pattern(total as usize);
        let upstream = MockUpstream::new();
        upstream.add_file(-100, 1, data.clone());
        let engine = engine_over(&upstream);

        let out = collect(engine.stream(-100, 1, span(1_400_000, total - 1, total)))
            .await
            .unwrap();

        assert_eq!(out, &data[1_400_000..]);

        // chunk 0 is never touched
        assert_eq!(
            upstream
                .fetched_chunks()
                .iter()
                .map(|(_, c)| *c)
                .collect::<Vec<_>>(),
            vec![1]
        );
    }

    #[tokio::test]
    async fn expired_reference_heals_and_stays_byte_exact() {
        let total = 3 * CHUNK;
        let data = pattern(total as usize);
        let upstream = MockUpstream::new();
        upstream.add_file(-100, 6, data.clone());

        upstream.inject_fault(Fault::ExpireReference {
            channel_id: -100,
            msg_id: 6,
            at_chunk: 1,
        });

        let engine = engine_over(&upstream);

        let out = collect(engine.stream(-100, 6, span(0, total - 1, total)))
            .await
            .unwrap();

        assert_eq!(out, data);

        // one resolve for the start, one for the heal; the healed sequence
        // resumes at the chunk that failed
        assert_eq!(upstream.get_message_calls(), 2);
        assert_eq!(
            upstream
                .fetched_chunks()
                .iter()
                .map(|(_, c)| *c)
                .collect::<Vec<_>>(),
            vec![0, 1, 1, 2]
        );
    }

    #[tokio::test]
    async fn heal_reapplies_head_skip_at_an_unaligned_start() {
        let total = 2 * CHUNK;
        let data = pattern(total as usize);
        let upstream = MockUpstream::new();
        upstream.add_file(-100, 7, data.clone());

        // fail before any blob arrives: the resume position is still the
        // unaligned span start, so the fresh sequence must re-skip the head
        upstream.inject_fault(Fault::ExpireReference {
            channel_id: -100,
            msg_id: 7,
            at_chunk: 0,
        });

        let engine = engine_over(&upstream);

        let out = collect(engine.stream(-100, 7, span(500_000, total - 1, total)))
            .await
            .unwrap();

        assert_eq!(out, &data[500_000..]);
        assert_eq!(upstream.get_message_calls(), 2);
    }

    #[tokio::test]
    async fn transient_errors_heal_with_bounded_attempts() {
        let total = CHUNK;
        let data = pattern(total as usize);
        let upstream = MockUpstream::new();
        upstream.add_file(-100, 8, data.clone());

        upstream.inject_fault(Fault::Transient {
            channel_id: -100,
            msg_id: 8,
            at_chunk: 0,
        });
        upstream.inject_fault(Fault::Transient {
            channel_id: -100,
            msg_id: 8,
            at_chunk: 0,
        });

        let engine = engine_over(&upstream);

        let out = collect(engine.stream(-100, 8, span(0, total - 1, total)))
            .await
            .unwrap();

        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn flood_waits_are_honoured_without_burning_an_attempt() {
        let total = CHUNK + 5;
        let data = pattern(total as usize);
        let upstream = MockUpstream::new();
        upstream.add_file(-100, 13, data.clone());

        upstream.inject_fault(Fault::Flood {
            channel_id: -100,
            msg_id: 13,
            at_chunk: 1,
            retry_after: Duration::from_millis(50),
        });

        let engine = engine_over(&upstream);

        let out = collect(engine.stream(-100, 13, span(0, total - 1, total)))
            .await
            .unwrap();

        assert_eq!(out, data);

        // the wait is not a recovery: the locator survives and the message
        // is not re-resolved
        assert_eq!(upstream.get_message_calls(), 1);
    }

    #[tokio::test]
    async fn retry_budget_is_enforced() {
        let total = CHUNK;
        let upstream = MockUpstream::new();
        upstream.add_file(-100, 9, pattern(total as usize));

        for _ in 0..4 {
            upstream.inject_fault(Fault::Transient {
                channel_id: -100,
                msg_id: 9,
                at_chunk: 0,
            });
        }

        let engine = engine_over(&upstream);

        let err = collect(engine.stream(-100, 9, span(0, total - 1, total)))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            UpstreamError::StreamBroken {
                attempts: MAX_RECOVERY_ATTEMPTS
            }
        ));

        // initial try plus exactly three recoveries
        assert_eq!(upstream.fetched_chunks().len(), 4);
    }

    #[tokio::test]
    async fn stalled_fetch_times_out_and_resumes_with_the_same_locator() {
        let total = CHUNK + 10;
        let data = pattern(total as usize);
        let upstream = MockUpstream::new();
        upstream.add_file(-100, 10, data.clone());

        upstream.inject_fault(Fault::Stall {
            channel_id: -100,
            msg_id: 10,
            at_chunk: 1,
        });

        let engine = engine_with_timeout(&upstream, Duration::from_millis(50));

        let out = collect(engine.stream(-100, 10, span(0, total - 1, total)))
            .await
            .unwrap();

        assert_eq!(out, data);

        // the first timeout retry must not re-resolve the message
        assert_eq!(upstream.get_message_calls(), 1);
    }

    #[tokio::test]
    async fn premature_end_is_an_error_not_a_short_body() {
        let upstream = MockUpstream::new();
        // claimed size is twice what the upstream actually has
        upstream.add_file(-100, 11, pattern(CHUNK as usize));

        let engine = engine_over(&upstream);
        let total = 2 * CHUNK;

        let mut delivered = 0u64;
        let mut stream = engine.stream(-100, 11, span(0, total - 1, total));
        let mut last_err = None;

        while let Some(item) = stream.next().await {
            match item {
                Ok(blob) => delivered += blob.len() as u64,
                Err(err) => {
                    last_err = Some(err);
                    break;
                }
            }
        }

        assert_eq!(delivered, CHUNK);
        assert!(matches!(
            last_err,
            Some(UpstreamError::PrematureEof { delivered: d, want }) if d == CHUNK && want == 2 * CHUNK
        ));
    }

    #[tokio::test]
    async fn missing_message_is_terminal() {
        let upstream = MockUpstream::new();
        let engine = engine_over(&upstream);

        let err = collect(engine.stream(-100, 404, span(0, 9, 10)))
            .await
            .unwrap_err();

        assert!(matches!(err, UpstreamError::NotFound));
        assert!(upstream.fetched_chunks().is_empty());
    }

    #[tokio::test]
    async fn dropping_the_stream_cancels_the_fetch() {
        let total = 4 * CHUNK;
        let upstream = MockUpstream::new();
        upstream.add_file(-100, 12, pattern(total as usize));

        let engine = engine_over(&upstream);

        {
            let mut stream = engine.stream(-100, 12, span(0, total - 1, total));
            let first = stream.next().await.unwrap().unwrap();
            assert_eq!(first.len() as u64, CHUNK);
            // dropped here, mid-file
        }

        // give any leaked task a chance to fetch more; nothing should
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(upstream.fetched_chunks().len() <= 2);
    }

    #[tokio::test]
    async fn repeated_mid_stream_cancellation_leaks_nothing() {
        let total = 4 * CHUNK;
        let upstream = MockUpstream::new();
        upstream.add_file(-100, 14, pattern(total as usize));

        let engine = engine_over(&upstream);

        for _ in 0..200 {
            let mut stream = engine.stream(-100, 14, span(0, total - 1, total));
            let _ = stream.next().await;
            // dropped mid-file every iteration
        }

        let after_drops = upstream.fetched_chunks().len();

        // at most the first fetch (and one in-flight follow-up) per
        // iteration; anything more means orphaned tasks kept pulling
        assert!(after_drops <= 400, "fetched {after_drops} chunks");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(upstream.fetched_chunks().len(), after_drops);
    }
}
