use std::fmt;

use bytes::Bytes;
use miniz_oxide::{deflate, inflate};
use snafu::prelude::*;

use super::{error, Middleware, MiddlewareError};

/// zlib compression, binary frames only
#[derive(Debug, Clone, Copy)]
pub struct Deflate {
    level: u8,
}

impl Default for Deflate {
    fn default() -> Self {
        Self { level: 6 }
    }
}

impl Deflate {
    /// Create with compression level 0..=10
    pub fn new(level: u8) -> Self {
        Self {
            level: level.min(10),
        }
    }
}

impl Middleware for Deflate {
    fn outbound(&self, data: Bytes) -> Result<Bytes, MiddlewareError> {
        Ok(deflate::compress_to_vec_zlib(&data, self.level).into())
    }

    fn inbound(&self, data: Bytes) -> Result<Bytes, MiddlewareError> {
        inflate::decompress_to_vec_zlib(&data)
            .map(Bytes::from)
            .map_err(|status| MiddlewareError::Inflate { status })
    }

    fn binary_only(&self) -> bool {
        true
    }
}

/// Rejects payloads longer than a limit, in both directions
#[derive(Debug, Clone, Copy)]
pub struct SizeLimit {
    limit: usize,
}

impl SizeLimit {
    /// Create with a limit in bytes
    pub fn new(limit: usize) -> Self {
        Self { limit }
    }

    fn check(&self, data: Bytes) -> Result<Bytes, MiddlewareError> {
        ensure!(
            data.len() <= self.limit,
            error::TooLarge {
                len: data.len(),
                limit: self.limit
            }
        );
        Ok(data)
    }
}

impl Middleware for SizeLimit {
    fn outbound(&self, data: Bytes) -> Result<Bytes, MiddlewareError> {
        self.check(data)
    }

    fn inbound(&self, data: Bytes) -> Result<Bytes, MiddlewareError> {
        self.check(data)
    }
}

/// Middleware made of two closures
pub struct FnMiddleware<O, I> {
    outbound: O,
    inbound: I,
}

impl<O, I> fmt::Debug for FnMiddleware<O, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnMiddleware").finish_non_exhaustive()
    }
}

/// Create a middleware from an outbound and an inbound transform
pub fn from_fn<O, I>(outbound: O, inbound: I) -> FnMiddleware<O, I>
where
    O: Fn(Bytes) -> Result<Bytes, MiddlewareError> + Send + Sync,
    I: Fn(Bytes) -> Result<Bytes, MiddlewareError> + Send + Sync,
{
    FnMiddleware { outbound, inbound }
}

impl<O, I> Middleware for FnMiddleware<O, I>
where
    O: Fn(Bytes) -> Result<Bytes, MiddlewareError> + Send + Sync,
    I: Fn(Bytes) -> Result<Bytes, MiddlewareError> + Send + Sync,
{
    fn outbound(&self, data: Bytes) -> Result<Bytes, MiddlewareError> {
        (self.outbound)(data)
    }

    fn inbound(&self, data: Bytes) -> Result<Bytes, MiddlewareError> {
        (self.inbound)(data)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_deflate_round_trip() {
        let deflate = Deflate::default();
        let data = Bytes::from(vec![b'x'; 4096]);

        let compressed = deflate.outbound(data.clone()).unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(deflate.inbound(compressed).unwrap(), data);
    }

    #[test]
    fn test_deflate_rejects_garbage() {
        let err = Deflate::default()
            .inbound(Bytes::from_static(b"not zlib at all"))
            .unwrap_err();
        assert!(matches!(err, MiddlewareError::Inflate { .. }));
    }

    #[test]
    fn test_size_limit() {
        let limit = SizeLimit::new(4);
        assert!(limit.outbound(Bytes::from_static(b"1234")).is_ok());
        assert!(matches!(
            limit.inbound(Bytes::from_static(b"12345")),
            Err(MiddlewareError::TooLarge { len: 5, limit: 4 })
        ));
    }

    #[test]
    fn test_from_fn() {
        let upper = from_fn(
            |data: Bytes| Ok(data.to_ascii_uppercase().into()),
            |data: Bytes| Ok(data.to_ascii_lowercase().into()),
        );
        assert_eq!(
            upper.outbound(Bytes::from_static(b"abc")).unwrap(),
            Bytes::from_static(b"ABC")
        );
        assert_eq!(
            upper.inbound(Bytes::from_static(b"ABC")).unwrap(),
            Bytes::from_static(b"abc")
        );
    }
}
