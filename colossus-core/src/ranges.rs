//! HTTP byte-range parsing, merging and serving plans.
//!
//! `parse("bytes=0-10,11-20,40-")` yields a merged, ascending RangeSet:
//! overlapping ranges and ranges that touch (one ends at `n`, the next starts
//! at `n + 1`) collapse into one. A malformed header is never fatal to a
//! request: callers serve the full entity instead.

use std::fmt;

/// Unit assumed when the header carries no `unit=` prefix.
pub const DEFAULT_UNIT: &str = "bytes";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RangeError {
    #[error("malformed range {0:?}")]
    Malformed(String),
}

/// One requested range. Bounds are inclusive; at least one is present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: Option<u64>,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn new(start: Option<u64>, end: Option<u64>) -> Self {
        Self { start, end }
    }

    pub fn bounded(start: u64, end: u64) -> Self {
        Self::new(Some(start), Some(end))
    }

    fn low(&self) -> u64 {
        self.start.unwrap_or(0)
    }

    fn high(&self) -> u64 {
        self.end.unwrap_or(u64::MAX)
    }

    /// Overlapping, or adjacent by exactly one.
    fn touches(&self, other: &ByteRange) -> bool {
        self.high().saturating_add(1) >= other.low() && other.high().saturating_add(1) >= self.low()
    }

    fn merge(&self, other: &ByteRange) -> ByteRange {
        let start = match (self.start, other.start) {
            (Some(a), Some(b)) => Some(a.min(b)),
            _ => None,
        };
        let end = match (self.end, other.end) {
            (Some(a), Some(b)) => Some(a.max(b)),
            _ => None,
        };
        ByteRange { start, end }
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(start) = self.start {
            write!(f, "{start}")?;
        }
        f.write_str("-")?;
        if let Some(end) = self.end {
            write!(f, "{end}")?;
        }
        Ok(())
    }
}

/// Parsed `Range` header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeHeader {
    pub unit: String,
    pub ranges: Vec<ByteRange>,
}

fn parse_bound(text: &str, whole: &str) -> Result<Option<u64>, RangeError> {
    if text.is_empty() {
        return Ok(None);
    }
    if !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RangeError::Malformed(whole.to_string()));
    }
    text.parse::<u64>()
        .map(Some)
        .map_err(|_| RangeError::Malformed(whole.to_string()))
}

fn parse_range(token: &str) -> Result<ByteRange, RangeError> {
    let token = token.trim();
    let (start, end) = token
        .split_once('-')
        .ok_or_else(|| RangeError::Malformed(token.to_string()))?;
    let start = parse_bound(start, token)?;
    let end = parse_bound(end, token)?;
    match (start, end) {
        (None, None) => Err(RangeError::Malformed(token.to_string())),
        (Some(s), Some(e)) if s > e => Err(RangeError::Malformed(token.to_string())),
        _ => Ok(ByteRange { start, end }),
    }
}

/// Merge `new` into `accepted`, cascading through every range it absorbs.
fn insert_merged(accepted: &mut Vec<ByteRange>, new: ByteRange) {
    let mut current = new;
    loop {
        let Some(pos) = accepted.iter().position(|r| r.touches(&current)) else {
            break;
        };
        let absorbed = accepted.remove(pos);
        tracing::trace!(%absorbed, %current, "merging ranges");
        current = absorbed.merge(&current);
    }
    accepted.push(current);
}

/// Parse a header value such as `bytes=0-99,200-` into a normalized RangeSet.
pub fn parse(value: &str) -> Result<RangeHeader, RangeError> {
    let value = value.trim();
    let (unit, list) = match value.split_once('=') {
        Some((unit, list)) => {
            let unit = unit.trim();
            if unit.is_empty() || unit.contains(char::is_whitespace) {
                return Err(RangeError::Malformed(value.to_string()));
            }
            (unit, list)
        }
        None => (DEFAULT_UNIT, value),
    };
    // A single trailing comma is tolerated; empty items elsewhere are not.
    let list = list.trim();
    let list = list.strip_suffix(',').unwrap_or(list);
    if list.trim().is_empty() {
        return Err(RangeError::Malformed(value.to_string()));
    }
    let mut ranges: Vec<ByteRange> = Vec::new();
    for token in list.split(',') {
        insert_merged(&mut ranges, parse_range(token)?);
    }
    ranges.sort_by_key(|r| r.start);
    Ok(RangeHeader {
        unit: unit.to_string(),
        ranges,
    })
}

/// Inclusive byte span resolved against an entity size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: u64,
    pub end: u64,
}

// Never empty: `end >= start` always holds.
#[allow(clippy::len_without_is_empty)]
impl Span {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// How to answer a request for an entity of known size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServePlan {
    /// 200 with the whole entity.
    Full,
    /// 206 with one `Content-Range`.
    Single(Span),
    /// 206 `multipart/byteranges`.
    Multipart(Vec<Span>),
    /// 416.
    Unsatisfiable,
}

impl RangeHeader {
    /// Resolve against an entity of `size` bytes. Requests in a unit other than
    /// bytes, or containing a range without a start, are served in full.
    pub fn plan(&self, size: u64) -> ServePlan {
        if !self.unit.eq_ignore_ascii_case(DEFAULT_UNIT)
            || self.ranges.iter().any(|r| r.start.is_none())
        {
            return ServePlan::Full;
        }
        if size == 0 {
            return ServePlan::Unsatisfiable;
        }
        let last = size - 1;
        let spans: Vec<Span> = self
            .ranges
            .iter()
            .filter_map(|r| {
                let start = r.start?;
                if start > last {
                    return None;
                }
                Some(Span {
                    start,
                    end: r.end.map_or(last, |e| e.min(last)),
                })
            })
            .collect();
        match spans.len() {
            0 => ServePlan::Unsatisfiable,
            1 => ServePlan::Single(spans[0]),
            _ => ServePlan::Multipart(spans),
        }
    }
}

/// `Content-Range` value for one span.
pub fn content_range(span: &Span, size: u64) -> String {
    format!("{} {}-{}/{}", DEFAULT_UNIT, span.start, span.end, size)
}

/// `Content-Range` value for a 416 response.
pub fn unsatisfied_range(size: u64) -> String {
    format!("{DEFAULT_UNIT} */{size}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounded(ranges: &[(u64, u64)]) -> Vec<ByteRange> {
        ranges.iter().map(|&(s, e)| ByteRange::bounded(s, e)).collect()
    }

    #[test]
    fn overlapping_ranges_merge() {
        assert_eq!(parse("0-20,10-30").unwrap().ranges, bounded(&[(0, 30)]));
    }

    #[test]
    fn adjacent_ranges_merge() {
        assert_eq!(parse("0-10,11-20").unwrap().ranges, bounded(&[(0, 20)]));
        assert_eq!(parse("11-20,0-10").unwrap().ranges, bounded(&[(0, 20)]));
    }

    #[test]
    fn gap_of_two_stays_separate() {
        assert_eq!(
            parse("0-10,12-20").unwrap().ranges,
            bounded(&[(0, 10), (12, 20)])
        );
    }

    #[test]
    fn disjoint_ranges_sorted() {
        let header = parse("bytes=60-80,0-10,30-40").unwrap();
        assert_eq!(header.unit, "bytes");
        assert_eq!(header.ranges, bounded(&[(0, 10), (30, 40), (60, 80)]));
    }

    #[test]
    fn merge_cascades() {
        // 20-30 bridges the two earlier ranges.
        assert_eq!(
            parse("0-19,31-40,20-30").unwrap().ranges,
            bounded(&[(0, 40)])
        );
    }

    #[test]
    fn open_ranges() {
        assert_eq!(
            parse("500-").unwrap().ranges,
            vec![ByteRange::new(Some(500), None)]
        );
        assert_eq!(
            parse("-500").unwrap().ranges,
            vec![ByteRange::new(None, Some(500))]
        );
        assert_eq!(
            parse("10-20,15-").unwrap().ranges,
            vec![ByteRange::new(Some(10), None)]
        );
    }

    #[test]
    fn custom_unit_and_default_unit() {
        assert_eq!(parse("items=1-2").unwrap().unit, "items");
        assert_eq!(parse("1-2").unwrap().unit, "bytes");
    }

    #[test]
    fn single_point_range_allowed() {
        assert_eq!(parse("5-5").unwrap().ranges, bounded(&[(5, 5)]));
    }

    #[test]
    fn malformed_inputs() {
        for bad in [
            "", "bytes=", "bytes=-", "bytes=a-b", "bytes=10-5", "bytes=1-2-3", "bytes=1,2",
            "=0-1", "bytes=0-1,,2-3", "bytes=+1-2", "bytes=99999999999999999999-",
        ] {
            assert!(
                matches!(parse(bad), Err(RangeError::Malformed(_))),
                "{bad:?} should be malformed"
            );
        }
    }

    #[test]
    fn plan_single_and_clamped() {
        let header = parse("bytes=0-99").unwrap();
        assert_eq!(header.plan(1000), ServePlan::Single(Span { start: 0, end: 99 }));
        assert_eq!(header.plan(50), ServePlan::Single(Span { start: 0, end: 49 }));
        let open = parse("bytes=900-").unwrap();
        assert_eq!(open.plan(1000), ServePlan::Single(Span { start: 900, end: 999 }));
    }

    #[test]
    fn plan_multipart() {
        let header = parse("bytes=0-9,20-29").unwrap();
        assert_eq!(
            header.plan(100),
            ServePlan::Multipart(vec![Span { start: 0, end: 9 }, Span { start: 20, end: 29 }])
        );
        // the second range starts past the end and is dropped
        assert_eq!(header.plan(15), ServePlan::Single(Span { start: 0, end: 9 }));
    }

    #[test]
    fn plan_full_and_unsatisfiable() {
        assert_eq!(parse("bytes=-100").unwrap().plan(1000), ServePlan::Full);
        assert_eq!(parse("items=0-1").unwrap().plan(1000), ServePlan::Full);
        assert_eq!(parse("bytes=2000-").unwrap().plan(1000), ServePlan::Unsatisfiable);
        assert_eq!(parse("bytes=0-1").unwrap().plan(0), ServePlan::Unsatisfiable);
    }

    #[test]
    fn header_values() {
        let span = Span { start: 10, end: 19 };
        assert_eq!(span.len(), 10);
        assert_eq!(content_range(&span, 100), "bytes 10-19/100");
        assert_eq!(unsatisfied_range(100), "bytes */100");
        assert_eq!(ByteRange::new(None, Some(5)).to_string(), "-5");
    }
}
