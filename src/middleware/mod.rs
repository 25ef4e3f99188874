//! Ordered, bidirectional transform chain between the protocol and the transport.
//!
//! Entries are sorted by priority, higher first. Outbound data runs through
//! them from the highest priority (closest to the application) to the lowest
//! (closest to the wire), inbound data runs the other way round. An entry that
//! encrypts then compresses on send therefore decompresses then decrypts on
//! receive without knowing about its neighbours.

mod builtin;

pub use builtin::{from_fn, Deflate, FnMiddleware, SizeLimit};

use std::{cmp::Reverse, collections::HashSet, fmt, sync::Arc};

use bytes::Bytes;
use snafu::prelude::*;

use crate::{
    config::{error as config_error, ConfigError},
    transport::Frame,
};

/// Error of a single middleware
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), module(error), context(suffix(false)))]
pub enum MiddlewareError {
    /// inflate compressed data failed
    #[snafu(display("decompress data failed: {status:?}"))]
    Inflate {
        /// decompress error status code
        status: miniz_oxide::inflate::TINFLStatus,
    },

    /// data is over the size limit
    #[snafu(display("data of {len} bytes is over limit {limit}"))]
    TooLarge {
        /// data length
        len: usize,
        /// limit
        limit: usize,
    },

    /// a text frame is not UTF-8 anymore after the chain
    #[snafu(display("text frame is not utf-8 after transform: {source}"))]
    NotUtf8 {
        /// source error
        source: std::string::FromUtf8Error,
    },

    /// user middleware failure
    #[snafu(display("{message}"))]
    Custom {
        /// reason
        message: String,
    },
}

/// A transform applied to every frame payload.
///
/// Both directions pass data through unchanged by default.
pub trait Middleware: Send + Sync + fmt::Debug {
    /// transform data on its way to the transport
    fn outbound(&self, data: Bytes) -> Result<Bytes, MiddlewareError> {
        Ok(data)
    }

    /// transform data on its way to the protocol decoder
    fn inbound(&self, data: Bytes) -> Result<Bytes, MiddlewareError> {
        Ok(data)
    }

    /// true to let text frames pass this entry untouched
    fn binary_only(&self) -> bool {
        false
    }
}

/// Pipeline direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// application to wire
    Outbound,
    /// wire to application
    Inbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Outbound => f.write_str("outbound"),
            Self::Inbound => f.write_str("inbound"),
        }
    }
}

/// A failing entry aborts the whole chain
#[derive(Debug, Snafu)]
#[snafu(display("middleware {name} failed on {direction}: {source}"))]
pub struct PipelineError {
    /// name of failed entry
    pub name: String,
    /// direction
    pub direction: Direction,
    /// source error
    pub source: MiddlewareError,
}

/// A named, prioritized middleware
#[derive(Debug, Clone)]
pub struct MiddlewareEntry {
    name: String,
    priority: i32,
    middleware: Arc<dyn Middleware>,
}

impl MiddlewareEntry {
    /// Create entry
    pub fn new<S: Into<String>, M: Middleware + 'static>(name: S, priority: i32, middleware: M) -> Self {
        Self {
            name: name.into(),
            priority,
            middleware: Arc::new(middleware),
        }
    }

    /// entry name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// entry priority
    pub fn priority(&self) -> i32 {
        self.priority
    }
}

/// Collects entries before a connection is built
#[derive(Debug, Default)]
pub struct PipelineBuilder {
    entries: Vec<MiddlewareEntry>,
}

impl PipelineBuilder {
    /// Add an entry
    pub fn add(mut self, entry: MiddlewareEntry) -> Self {
        self.entries.push(entry);
        self
    }

    /// Add an entry in place
    pub fn push(&mut self, entry: MiddlewareEntry) {
        self.entries.push(entry);
    }

    /// Validate names and freeze the order
    pub fn build(self) -> Result<Pipeline, ConfigError> {
        let mut names = HashSet::new();
        for entry in &self.entries {
            ensure!(
                names.insert(entry.name.as_str()),
                config_error::DuplicateMiddleware { name: &entry.name }
            );
        }

        let mut entries = self.entries;
        // stable sort, equal priorities keep insertion order
        entries.sort_by_key(|e| Reverse(e.priority));

        Ok(Pipeline { entries })
    }
}

/// Frozen, ordered middleware chain of a connection
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    entries: Vec<MiddlewareEntry>,
}

impl Pipeline {
    /// Start building a pipeline
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// entry names in outbound order
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }

    /// true if there is no entry
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run a frame through the chain, highest priority first
    pub fn process_outbound(&self, frame: Frame) -> Result<Frame, PipelineError> {
        Self::fold(self.entries.iter(), Direction::Outbound, frame)
    }

    /// Run a frame through the chain, lowest priority first
    pub fn process_inbound(&self, frame: Frame) -> Result<Frame, PipelineError> {
        Self::fold(self.entries.iter().rev(), Direction::Inbound, frame)
    }

    fn fold<'a, I>(entries: I, direction: Direction, frame: Frame) -> Result<Frame, PipelineError>
    where
        I: Iterator<Item = &'a MiddlewareEntry>,
    {
        if entries.size_hint().1 == Some(0) {
            return Ok(frame);
        }

        let text = frame.is_text();
        let mut data = frame.into_bytes();
        let mut last = None;

        for entry in entries {
            if text && entry.middleware.binary_only() {
                continue;
            }
            log::trace!("Middleware {} {} {} bytes", entry.name, direction, data.len());

            let result = match direction {
                Direction::Outbound => entry.middleware.outbound(data),
                Direction::Inbound => entry.middleware.inbound(data),
            };
            data = result.with_context(|_| PipelineSnafu {
                name: &entry.name,
                direction,
            })?;
            last = Some(entry);
        }

        if !text {
            return Ok(Frame::Binary(data));
        }

        String::from_utf8(data.to_vec())
            .context(error::NotUtf8)
            .map(Frame::Text)
            .with_context(|_| PipelineSnafu {
                name: last.map_or("", |e| e.name.as_str()),
                direction,
            })
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug)]
    struct Recorder {
        tag: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Middleware for Recorder {
        fn outbound(&self, data: Bytes) -> Result<Bytes, MiddlewareError> {
            self.log.lock().unwrap().push(format!("out:{}", self.tag));
            Ok(data)
        }

        fn inbound(&self, data: Bytes) -> Result<Bytes, MiddlewareError> {
            self.log.lock().unwrap().push(format!("in:{}", self.tag));
            Ok(data)
        }
    }

    /// xor with a key, its own inverse
    #[derive(Debug)]
    struct Xor(u8);

    impl Middleware for Xor {
        fn outbound(&self, data: Bytes) -> Result<Bytes, MiddlewareError> {
            Ok(data.iter().map(|b| b ^ self.0).collect::<Vec<_>>().into())
        }

        fn inbound(&self, data: Bytes) -> Result<Bytes, MiddlewareError> {
            self.outbound(data)
        }
    }

    /// appends a marker byte, removes it on the way back
    #[derive(Debug)]
    struct Suffix(u8);

    impl Middleware for Suffix {
        fn outbound(&self, data: Bytes) -> Result<Bytes, MiddlewareError> {
            let mut v = data.to_vec();
            v.push(self.0);
            Ok(v.into())
        }

        fn inbound(&self, data: Bytes) -> Result<Bytes, MiddlewareError> {
            match data.last() {
                Some(b) if *b == self.0 => Ok(data.slice(..data.len() - 1)),
                _ => Err(MiddlewareError::Custom {
                    message: "marker missing".to_string(),
                }),
            }
        }
    }

    #[test]
    fn test_outbound_high_priority_first_inbound_reversed() {
        let log = Arc::new(Mutex::new(vec![]));
        let pipeline = Pipeline::builder()
            .add(MiddlewareEntry::new(
                "b",
                5,
                Recorder {
                    tag: "B",
                    log: log.clone(),
                },
            ))
            .add(MiddlewareEntry::new(
                "a",
                10,
                Recorder {
                    tag: "A",
                    log: log.clone(),
                },
            ))
            .build()
            .unwrap();

        assert_eq!(pipeline.names(), vec!["a", "b"]);

        let frame = Frame::from(vec![1u8, 2, 3]);
        let sent = pipeline.process_outbound(frame.clone()).unwrap();
        pipeline.process_inbound(sent).unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["out:A", "out:B", "in:B", "in:A"]);
    }

    #[test]
    fn test_round_trip_with_inverse_transforms() {
        let pipeline = Pipeline::builder()
            .add(MiddlewareEntry::new("xor", 10, Xor(0x5a)))
            .add(MiddlewareEntry::new("suffix", 5, Suffix(0xff)))
            .build()
            .unwrap();

        let frame = Frame::from(b"payload".to_vec());
        let wire = pipeline.process_outbound(frame.clone()).unwrap();

        // xor ran first, suffix last: marker is in clear at the end
        assert_eq!(wire.as_bytes().last(), Some(&0xff));
        assert_eq!(wire.as_bytes()[0], b'p' ^ 0x5a);

        assert_eq!(pipeline.process_inbound(wire).unwrap(), frame);
    }

    #[test]
    fn test_failure_aborts_chain() {
        let pipeline = Pipeline::builder()
            .add(MiddlewareEntry::new("suffix", 1, Suffix(0xff)))
            .build()
            .unwrap();

        let err = pipeline
            .process_inbound(Frame::from(vec![1u8, 2]))
            .unwrap_err();
        assert_eq!(err.name, "suffix");
        assert_eq!(err.direction, Direction::Inbound);
        assert!(matches!(err.source, MiddlewareError::Custom { .. }));
    }

    #[test]
    fn test_text_must_stay_utf8() {
        let pipeline = Pipeline::builder()
            .add(MiddlewareEntry::new("xor", 1, Xor(0x80)))
            .build()
            .unwrap();

        let err = pipeline
            .process_outbound(Frame::from("hello"))
            .unwrap_err();
        assert!(matches!(err.source, MiddlewareError::NotUtf8 { .. }));

        let same = Pipeline::default()
            .process_outbound(Frame::from("hello"))
            .unwrap();
        assert_eq!(same, Frame::from("hello"));
    }

    #[test]
    fn test_binary_only_entry_skips_text() {
        let log = Arc::new(Mutex::new(vec![]));
        let pipeline = Pipeline::builder()
            .add(MiddlewareEntry::new("deflate", 1, Deflate::default()))
            .add(MiddlewareEntry::new(
                "recorder",
                10,
                Recorder {
                    tag: "R",
                    log: log.clone(),
                },
            ))
            .build()
            .unwrap();

        let text = Frame::from("42[\"msg\",\"hi\"]");
        let sent = pipeline.process_outbound(text.clone()).unwrap();
        assert_eq!(sent, text);
        assert_eq!(pipeline.process_inbound(sent).unwrap(), text);
        assert_eq!(*log.lock().unwrap(), vec!["out:R", "in:R"]);

        let binary = Frame::from(vec![7u8; 256]);
        let sent = pipeline.process_outbound(binary.clone()).unwrap();
        assert!(sent.as_bytes().len() < 256);
        assert_eq!(pipeline.process_inbound(sent).unwrap(), binary);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let result = Pipeline::builder()
            .add(MiddlewareEntry::new("x", 1, Xor(1)))
            .add(MiddlewareEntry::new("x", 2, Xor(2)))
            .build();
        assert_eq!(
            result.unwrap_err(),
            ConfigError::DuplicateMiddleware {
                name: "x".to_string()
            }
        );
    }

    #[test]
    fn test_equal_priority_keeps_insertion_order() {
        let pipeline = Pipeline::builder()
            .add(MiddlewareEntry::new("first", 1, Xor(1)))
            .add(MiddlewareEntry::new("second", 1, Xor(2)))
            .add(MiddlewareEntry::new("top", 9, Xor(3)))
            .build()
            .unwrap();
        assert_eq!(pipeline.names(), vec!["top", "first", "second"]);
    }
}
