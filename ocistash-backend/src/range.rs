//! Byte-range expressions for ranged object reads.

use std::fmt;

use ocistash_common::BackendError;

/// A validated `Range` header value. Only [`get_range`] constructs one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange(Spec);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Spec {
    /// The last `n` bytes.
    Suffix(u64),
    /// From `start` to the end of the object.
    From(u64),
    /// From `start` to `end`, both inclusive.
    Closed(u64, u64),
}

impl ByteRange {
    /// Select `length` bytes at `offset`; a zero length reads to the end.
    /// Returns `None` when the whole object is wanted.
    pub fn for_read(length: usize, offset: u64) -> Result<Option<Self>, BackendError> {
        let start = i64::try_from(offset)
            .map_err(|_| BackendError::InvalidRange { start: i64::MAX, end: 0 })?;
        if length > 0 {
            let end = start
                .checked_add(length as i64 - 1)
                .ok_or(BackendError::InvalidRange { start, end: i64::MAX })?;
            return get_range(start, end).map(Some);
        }
        if start > 0 {
            return get_range(start, 0).map(Some);
        }
        Ok(None)
    }

    /// Resolve against an object of `size` bytes into a half-open span.
    /// `None` means the range is not satisfiable.
    pub fn resolve(&self, size: u64) -> Option<(u64, u64)> {
        match self.0 {
            Spec::Suffix(n) => Some((size.saturating_sub(n), size)),
            Spec::From(s) if s < size => Some((s, size)),
            Spec::Closed(s, e) if s < size => Some((s, (e + 1).min(size))),
            _ => None,
        }
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Spec::Suffix(n) => write!(f, "bytes=-{}", n),
            Spec::From(s) => write!(f, "bytes={}-", s),
            Spec::Closed(s, e) => write!(f, "bytes={}-{}", s, e),
        }
    }
}

/// Build the range for `start`/`end`.
///
/// * `start == 0, end < 0`: the last `|end|` bytes
/// * `start > 0, end == 0`: from `start` to the end
/// * `0 <= start <= end`: `start..=end`
///
/// Everything else is rejected; nothing is clamped.
pub fn get_range(start: i64, end: i64) -> Result<ByteRange, BackendError> {
    let spec = if start == 0 && end < 0 {
        Spec::Suffix(end.unsigned_abs())
    } else if start > 0 && end == 0 {
        Spec::From(start as u64)
    } else if 0 <= start && start <= end {
        Spec::Closed(start as u64, end as u64)
    } else {
        return Err(BackendError::InvalidRange { start, end });
    };
    Ok(ByteRange(spec))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_range_forms() {
        let cases = [
            (0, -100, "bytes=-100"),
            (50, 0, "bytes=50-"),
            (10, 20, "bytes=10-20"),
            (0, 0, "bytes=0-0"),
            (7, 7, "bytes=7-7"),
            (0, i64::MIN, "bytes=-9223372036854775808"),
        ];
        for (start, end, want) in cases {
            assert_eq!(get_range(start, end).unwrap().to_string(), want, "{} {}", start, end);
        }
    }

    #[test]
    fn test_get_range_rejects_invalid() {
        for (start, end) in [(20, 10), (-1, 5), (-5, -1), (3, -2), (-1, 0)] {
            match get_range(start, end) {
                Err(BackendError::InvalidRange { start: s, end: e }) => {
                    assert_eq!((s, e), (start, end));
                }
                other => panic!("({}, {}) gave {:?}", start, end, other),
            }
        }
    }

    #[test]
    fn test_for_read() {
        assert_eq!(ByteRange::for_read(0, 0).unwrap(), None);
        assert_eq!(ByteRange::for_read(0, 100).unwrap().unwrap().to_string(), "bytes=100-");
        assert_eq!(ByteRange::for_read(10, 5).unwrap().unwrap().to_string(), "bytes=5-14");
        assert_eq!(ByteRange::for_read(1, 0).unwrap().unwrap().to_string(), "bytes=0-0");
        assert!(ByteRange::for_read(1, u64::MAX).is_err());
    }

    #[test]
    fn test_resolve() {
        let r = get_range(2, 5).unwrap();
        assert_eq!(r.resolve(10), Some((2, 6)));
        assert_eq!(r.resolve(4), Some((2, 4)));
        assert_eq!(r.resolve(2), None);
        assert_eq!(get_range(0, -3).unwrap().resolve(10), Some((7, 10)));
        assert_eq!(get_range(0, -30).unwrap().resolve(10), Some((0, 10)));
        assert_eq!(get_range(9, 0).unwrap().resolve(10), Some((9, 10)));
        assert_eq!(get_range(10, 0).unwrap().resolve(10), None);
    }
}
