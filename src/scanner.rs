//! Delimiter search across an ordered sequence of byte chunks.
//!
//! Received data sits in the receive queue as the chunks the socket produced,
//! so a delimiter may straddle any number of chunk boundaries. The scanner
//! walks the chunks in order without concatenating them and hands back a
//! [`ScanIndex`] that doubles as a resumption token:
//!
//! ```text
//! chunks:  ["AB\r"] ["\nCD"]
//! scan("\r\n") -> ScanIndex { found: true, content_len: 2, .. }
//! ```
//!
//! Scanning again with a previous non-matching index only inspects bytes that
//! were appended after the previous call, so many small appends cost
//! O(total bytes) in aggregate.

use bytes::{Buf, Bytes};
use std::collections::VecDeque;

/// Outcome of a scan and the state needed to resume it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanIndex {
    found: bool,
    /// Bytes before the first byte of the (candidate) delimiter.
    content_len: usize,
    /// Length of the in-progress partial match at the end of the scanned bytes.
    matched: usize,
}

impl ScanIndex {
    /// Whether the delimiter was located.
    pub fn is_found(&self) -> bool {
        self.found
    }

    /// Number of bytes preceding the delimiter. When the delimiter has not
    /// been found this is the number of bytes known not to start it.
    pub fn content_len(&self) -> usize {
        self.content_len
    }

    /// Total bytes inspected so far.
    pub fn scanned(&self) -> usize {
        self.content_len + self.matched
    }
}

/// Scan `chunks` from the beginning for `delimiter`.
pub fn scan<I>(chunks: I, delimiter: &[u8]) -> ScanIndex
where
    I: IntoIterator,
    I::Item: AsRef<[u8]>,
{
    scan_from(chunks, delimiter, ScanIndex::default())
}

/// Resume a scan. `chunks` must be the same sequence the prior index was
/// computed on, optionally with more chunks appended at the tail.
pub fn scan_from<I>(chunks: I, delimiter: &[u8], prior: ScanIndex) -> ScanIndex
where
    I: IntoIterator,
    I::Item: AsRef<[u8]>,
{
    if prior.found {
        return prior;
    }
    if delimiter.is_empty() {
        return ScanIndex {
            found: true,
            content_len: 0,
            matched: 0,
        };
    }

    let fallback = prefix_table(delimiter);
    let mut skip = prior.scanned();
    let mut position = skip;
    let mut matched = prior.matched;

    for chunk in chunks {
        let chunk = chunk.as_ref();
        if skip >= chunk.len() {
            skip -= chunk.len();
            continue;
        }

        for &byte in &chunk[skip..] {
            while matched > 0 && byte != delimiter[matched] {
                matched = fallback[matched - 1];
            }
            if byte == delimiter[matched] {
                matched += 1;
            }
            position += 1;

            if matched == delimiter.len() {
                return ScanIndex {
                    found: true,
                    content_len: position - delimiter.len(),
                    matched: 0,
                };
            }
        }
        skip = 0;
    }

    ScanIndex {
        found: false,
        content_len: position - matched,
        matched,
    }
}

/// Longest proper prefix of `delimiter[..=i]` that is also its suffix.
/// For delimiters without self-overlap (`\r\n`, `\0`) this is all zeros,
/// which makes the scan a plain reset-to-zero on mismatch.
fn prefix_table(delimiter: &[u8]) -> Vec<usize> {
    let mut table = vec![0; delimiter.len()];
    let mut k = 0;
    for i in 1..delimiter.len() {
        while k > 0 && delimiter[i] != delimiter[k] {
            k = table[k - 1];
        }
        if delimiter[i] == delimiter[k] {
            k += 1;
        }
        table[i] = k;
    }
    table
}

/// Remove the first `content_len` bytes from `queue` and return them as
/// chunks, then drop the following `delimiter_len` bytes. The chunk holding
/// a boundary is split in place; no other chunk is copied.
pub fn extract(queue: &mut VecDeque<Bytes>, content_len: usize, delimiter_len: usize) -> Vec<Bytes> {
    let content = take_front(queue, content_len);
    drop_front(queue, delimiter_len);
    content
}

/// Split off the first `n` bytes of `queue`.
pub(crate) fn take_front(queue: &mut VecDeque<Bytes>, mut n: usize) -> Vec<Bytes> {
    let mut taken = Vec::new();
    while n > 0 {
        let Some(front) = queue.front_mut() else {
            debug_assert!(false, "queue shorter than requested prefix");
            break;
        };
        if front.len() <= n {
            n -= front.len();
            if let Some(chunk) = queue.pop_front() {
                if !chunk.is_empty() {
                    taken.push(chunk);
                }
            }
        } else {
            taken.push(front.split_to(n));
            n = 0;
        }
    }
    taken
}

/// Discard the first `n` bytes of `queue`.
pub(crate) fn drop_front(queue: &mut VecDeque<Bytes>, mut n: usize) {
    while n > 0 {
        let Some(front) = queue.front_mut() else {
            break;
        };
        if front.len() <= n {
            n -= front.len();
            queue.pop_front();
        } else {
            front.advance(n);
            n = 0;
        }
    }
    while queue.front().is_some_and(|c| c.is_empty()) {
        queue.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn queue(parts: &[&[u8]]) -> VecDeque<Bytes> {
        parts.iter().map(|p| Bytes::copy_from_slice(p)).collect()
    }

    fn concat(chunks: &[Bytes]) -> Vec<u8> {
        chunks.iter().flat_map(|c| c.iter().copied()).collect()
    }

    #[test]
    fn test_delimiter_in_single_chunk() {
        let mut q = queue(&[b"GET\r\n"]);
        let idx = scan(&q, b"\r\n");
        assert!(idx.is_found());
        assert_eq!(idx.content_len(), 3);

        let content = extract(&mut q, idx.content_len(), 2);
        assert_eq!(concat(&content), b"GET");
        assert!(q.is_empty());
    }

    #[test]
    fn test_delimiter_straddles_chunks() {
        let mut q = queue(&[b"AB\r", b"\nCD\r", b"\n"]);
        let idx = scan(&q, b"\r\n");
        assert!(idx.is_found());
        assert_eq!(idx.content_len(), 2);

        let content = extract(&mut q, idx.content_len(), 2);
        assert_eq!(concat(&content), b"AB");
        assert_eq!(concat(q.make_contiguous()), b"CD\r\n");

        let idx = scan(&q, b"\r\n");
        let content = extract(&mut q, idx.content_len(), 2);
        assert_eq!(concat(&content), b"CD");
        assert!(q.is_empty());
    }

    #[test]
    fn test_not_found_keeps_partial_match() {
        let q = queue(&[b"hello\r"]);
        let idx = scan(&q, b"\r\n");
        assert!(!idx.is_found());
        assert_eq!(idx.content_len(), 5);
        assert_eq!(idx.scanned(), 6);
    }

    #[test]
    fn test_repeated_first_byte() {
        let q = queue(&[b"x\r", b"\r\r\n"]);
        let idx = scan(&q, b"\r\n");
        assert!(idx.is_found());
        assert_eq!(idx.content_len(), 3);
    }

    #[test]
    fn test_self_overlapping_delimiter() {
        let q = queue(&[b"aa", b"ab"]);
        let idx = scan(&q, b"aab");
        assert!(idx.is_found());
        assert_eq!(idx.content_len(), 1);
    }

    #[test]
    fn test_empty_chunks_are_gaps() {
        let mut q = queue(&[b"", b"ab", b"", b"|", b"", b"c"]);
        let idx = scan(&q, b"|");
        assert_eq!(idx.content_len(), 2);
        let content = extract(&mut q, 2, 1);
        assert_eq!(concat(&content), b"ab");
        assert_eq!(concat(q.make_contiguous()), b"c");
    }

    #[test]
    fn test_resume_skips_scanned_bytes() {
        let mut q = queue(&[b"abc\r"]);
        let first = scan(&q, b"\r\n");
        assert!(!first.is_found());

        // Bytes before the resume point are never looked at again, so
        // corrupting them does not change the outcome.
        q[0] = Bytes::from_static(b"\r\n\r\r");
        q.push_back(Bytes::from_static(b"\nrest"));
        let resumed = scan_from(&q, b"\r\n", first);
        assert!(resumed.is_found());
        assert_eq!(resumed.content_len(), 3);
    }

    #[test]
    fn test_found_index_is_stable() {
        let q = queue(&[b"a;b"]);
        let idx = scan(&q, b";");
        assert_eq!(scan_from(&q, b";", idx), idx);
    }

    #[test]
    fn test_take_front_splits_boundary_chunk() {
        let mut q = queue(&[b"abc", b"def"]);
        let taken = take_front(&mut q, 4);
        assert_eq!(taken.len(), 2);
        assert_eq!(concat(&taken), b"abcd");
        assert_eq!(q.len(), 1);
        assert_eq!(&q[0][..], b"ef");
    }

    fn chunked(data: Vec<u8>, cuts: Vec<usize>) -> Vec<Bytes> {
        let mut points: Vec<usize> = cuts.into_iter().map(|c| c % (data.len() + 1)).collect();
        points.sort_unstable();
        let mut out = Vec::new();
        let mut last = 0;
        for p in points {
            out.push(Bytes::copy_from_slice(&data[last..p]));
            last = p;
        }
        out.push(Bytes::copy_from_slice(&data[last..]));
        out
    }

    proptest! {
        #[test]
        fn prop_chunking_does_not_change_result(
            data in proptest::collection::vec(prop::sample::select(vec![b'a', b'b', b'\r', b'\n']), 0..64),
            cuts in proptest::collection::vec(any::<usize>(), 0..8),
        ) {
            let delimiter = b"\r\n";
            let expected = data.windows(2).position(|w| w == delimiter);

            let mut q: VecDeque<Bytes> = chunked(data.clone(), cuts).into();
            let idx = scan(&q, delimiter);
            prop_assert_eq!(idx.is_found(), expected.is_some());

            if let Some(pos) = expected {
                prop_assert_eq!(idx.content_len(), pos);
                let content = extract(&mut q, idx.content_len(), delimiter.len());
                prop_assert_eq!(concat(&content), data[..pos].to_vec());
                prop_assert_eq!(concat(q.make_contiguous()), data[pos + 2..].to_vec());
            }
        }

        #[test]
        fn prop_resume_equals_full_scan(
            head in proptest::collection::vec(prop::sample::select(vec![b'a', b'b', b'c']), 0..32),
            tail in proptest::collection::vec(prop::sample::select(vec![b'a', b'b', b'c']), 0..32),
        ) {
            let delimiter = b"abc";
            let mut q: VecDeque<Bytes> = VecDeque::new();
            q.push_back(Bytes::from(head));
            let prior = scan(&q, delimiter);
            q.push_back(Bytes::from(tail));

            let resumed = scan_from(&q, delimiter, prior);
            let full = scan(&q, delimiter);
            prop_assert_eq!(resumed, full);
        }
    }
}
