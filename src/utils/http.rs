//! Conventions shared with HTTP collaborators.

/// A parsed `Content-Range`-style header of the form `items <offset>-<end>/<total>`.
///
/// List-loading collaborators use this to recover the total collection size for
/// pagination. A malformed or missing header degrades to the default, and a total
/// that did not parse (such as the `*` unknown-length marker) is carried as `None`,
/// in which case [`total_or`](ContentRange::total_or) substitutes the response
/// length. A genuine total of zero is honored as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContentRange {
    pub total: Option<usize>,
    pub offset: usize,
    pub limit: usize,
}

impl ContentRange {
    /// The total count, or `response_len` when the header carried no usable one.
    pub fn total_or(&self, response_len: usize) -> usize {
        self.total.unwrap_or(response_len)
    }
}

/// Parses an `items <offset>-<end>/<total>` header value.
pub fn parse_content_range(header: Option<&str>) -> ContentRange {
    header.and_then(parse_inner).unwrap_or_default()
}

fn parse_inner(header: &str) -> Option<ContentRange> {
    let (_unit, range) = header.trim().split_once(' ')?;
    let (from_to, total) = range.split_once('/')?;
    let (offset, end) = from_to.split_once('-')?;

    Some(ContentRange {
        total: total.trim().parse().ok(),
        offset: offset.trim().parse().ok()?,
        limit: end.trim().parse().ok()?,
    })
}
