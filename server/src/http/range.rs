use regex::Regex;

use common::upstream::CHUNK;

// http range header parser and chunk planner
//
// the only supported syntax is a single byte range "bytes=S-E" with E
// optional.  suffix ranges ("bytes=-K") and multi-range requests are
// rejected as unsatisfiable rather than clamped -- the players this serves
// always send explicit offsets, and silent clamping is how off-by-large
// Content-Length bugs are born.

// compiled once and stored on the http endpoint; the const generic for
// extract is the number of capture groups and must match the pattern
pub const RANGE_PATTERN: &str = r"^bytes=(\d*)-(\d*)$";

pub fn range_regex() -> Regex {
    Regex::new(RANGE_PATTERN).expect("range pattern failed to compile")
}

// a validated contiguous slice of a file: 0 <= start <= end < total
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ByteSpan {
    pub start: u64,
    pub end: u64,
    pub total: u64,
}

impl ByteSpan {
    pub fn full(total: u64) -> Option<ByteSpan> {
        if total == 0 {
            return None;
        }

        Some(ByteSpan {
            start: 0,
            end: total - 1,
            total,
        })
    }

    // exact number of bytes the response body must carry
    pub fn want(&self) -> u64 {
        self.end - self.start + 1
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParsedRange {
    // no Range header: plain 200 with the whole file
    Full(ByteSpan),
    // valid single range: 206
    Partial(ByteSpan),
}

// unsatisfiable or malformed; the http layer maps this to 416 with
// "Content-Range: bytes */total"
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RangeNotSatisfiable {
    pub total: u64,
}

pub fn parse_range(
    regex: &Regex,
    header: Option<&str>,
    total: u64,
) -> Result<ParsedRange, RangeNotSatisfiable> {
    let unsat = RangeNotSatisfiable { total };

    let Some(header) = header else {
        return ByteSpan::full(total).map(ParsedRange::Full).ok_or(unsat);
    };

    // the anchored pattern rejects multi-range ("a-b,c-d") outright
    let captures = regex.captures(header).ok_or(unsat)?;

    let start_str = &captures[1];
    let end_str = &captures[2];

    // "bytes=-K" would be a suffix range; unsupported
    if start_str.is_empty() {
        return Err(unsat);
    }

    let start: u64 = start_str.parse().map_err(|_| unsat)?;

    let end: u64 = if end_str.is_empty() {
        total.checked_sub(1).ok_or(unsat)?
    } else {
        end_str.parse().map_err(|_| unsat)?
    };

    if start > end || end >= total {
        return Err(unsat);
    }

    Ok(ParsedRange::Partial(ByteSpan { start, end, total }))
}

// the contract the stream engine consumes: how many whole chunks to skip
// at the upstream, how many bytes to discard from the first fetched chunk,
// and exactly how many bytes to deliver
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ChunkPlan {
    pub chunk_offset: u64,
    pub head_skip: u64,
    pub want: u64,
}

impl ChunkPlan {
    // plan for delivering `want` bytes starting at absolute byte `offset`;
    // also used mid-stream when self-heal resumes at a new position
    pub fn at(offset: u64, want: u64) -> ChunkPlan {
        ChunkPlan {
            chunk_offset: offset / CHUNK,
            head_skip: offset % CHUNK,
            want,
        }
    }

    pub fn for_span(span: &ByteSpan) -> ChunkPlan {
        ChunkPlan::at(span.start, span.want())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(header: Option<&str>, total: u64) -> Result<ParsedRange, RangeNotSatisfiable> {
        parse_range(&range_regex(), header, total)
    }

    fn partial(start: u64, end: u64, total: u64) -> ParsedRange {
        ParsedRange::Partial(ByteSpan { start, end, total })
    }

    #[test]
    fn absent_header_is_a_full_read() {
        assert_eq!(
            parse(None, 1000),
            Ok(ParsedRange::Full(ByteSpan {
                start: 0,
                end: 999,
                total: 1000
            }))
        );
    }

    #[test]
    fn closed_range() {
        assert_eq!(parse(Some("bytes=0-499"), 1000), Ok(partial(0, 499, 1000)));
        assert_eq!(parse(Some("bytes=500-999"), 1000), Ok(partial(500, 999, 1000)));
    }

    #[test]
    fn open_ended_range_runs_to_the_last_byte() {
        assert_eq!(parse(Some("bytes=500-"), 1000), Ok(partial(500, 999, 1000)));
    }

    #[test]
    fn inverted_range_is_unsatisfiable() {
        assert_eq!(
            parse(Some("bytes=5-2"), 1000),
            Err(RangeNotSatisfiable { total: 1000 })
        );
    }

    #[test]
    fn start_at_or_past_eof_is_unsatisfiable() {
        assert_eq!(
            parse(Some("bytes=1000-"), 1000),
            Err(RangeNotSatisfiable { total: 1000 })
        );
        assert_eq!(
            parse(Some("bytes=1600000-1700000"), 1_500_000),
            Err(RangeNotSatisfiable { total: 1_500_000 })
        );
    }

    #[test]
    fn end_past_eof_is_unsatisfiable_not_clamped() {
        assert_eq!(
            parse(Some("bytes=0-1000"), 1000),
            Err(RangeNotSatisfiable { total: 1000 })
        );
    }

    #[test]
    fn multi_range_is_unsatisfiable() {
        assert_eq!(
            parse(Some("bytes=0-1,5-6"), 1000),
            Err(RangeNotSatisfiable { total: 1000 })
        );
    }

    #[test]
    fn suffix_range_is_unsatisfiable() {
        assert_eq!(
            parse(Some("bytes=-500"), 1000),
            Err(RangeNotSatisfiable { total: 1000 })
        );
    }

    #[test]
    fn garbage_is_unsatisfiable() {
        for header in ["bytes=", "bytes=a-b", "chunks=0-1", "0-1", "bytes=1-2-3"] {
            assert!(parse(Some(header), 1000).is_err(), "accepted {header}");
        }
    }

    #[test]
    fn empty_file_has_no_satisfiable_range() {
        assert!(parse(Some("bytes=0-0"), 0).is_err());
    }

    #[test]
    fn plan_arithmetic_over_chunk_boundaries() {
        // one whole chunk starting at zero
        assert_eq!(
            ChunkPlan::at(0, CHUNK),
            ChunkPlan {
                chunk_offset: 0,
                head_skip: 0,
                want: CHUNK
            }
        );

        // mid-first-chunk start spanning into the second chunk
        assert_eq!(
            ChunkPlan::at(500_000, 500_001),
            ChunkPlan {
                chunk_offset: 0,
                head_skip: 500_000,
                want: 500_001
            }
        );

        // exactly on the second chunk boundary
        assert_eq!(
            ChunkPlan::at(1_048_576, 451_424),
            ChunkPlan {
                chunk_offset: 1,
                head_skip: 0,
                want: 451_424
            }
        );

        // inside the second chunk
        assert_eq!(
            ChunkPlan::at(1_400_000, 100_000),
            ChunkPlan {
                chunk_offset: 1,
                head_skip: 351_424,
                want: 100_000
            }
        );
    }

    #[test]
    fn plan_arithmetic_holds_across_offsets() {
        // sweep offsets through ten chunks; the plan must always put the
        // first delivered byte exactly at the requested offset
        let mut offset = 0u64;
        while offset <= 10 * CHUNK {
            let plan = ChunkPlan::at(offset, 1);
            assert_eq!(plan.chunk_offset * CHUNK + plan.head_skip, offset);
            assert!(plan.head_skip < CHUNK);
            offset += 61_417; // odd stride so boundaries land unaligned
        }

        // and the boundary cases exactly
        for offset in [CHUNK - 1, CHUNK, CHUNK + 1, 3 * CHUNK + 123] {
            let plan = ChunkPlan::at(offset, 7);
            assert_eq!(plan.chunk_offset, offset / CHUNK);
            assert_eq!(plan.head_skip, offset % CHUNK);
            assert_eq!(plan.want, 7);
        }
    }
}
