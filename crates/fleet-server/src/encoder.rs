//! Wire encoding for event streams.
//!
//! Events are written as text frames:
//!
//! ```text
//! id:<id>
//! event:<name>        (only for named events)
//! data:<json>
//!
//! ```
//!
//! A keep-alive is the comment frame `:\n\n`. When the client accepts it, the
//! whole stream goes through one gzip or deflate compressor that is
//! sync-flushed after every frame, so each frame is decodable on arrival.

use std::io::Write;

use bytes::Bytes;
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use fleet_core::{Event, FleetError, FleetResult};

use crate::config::CompressionConfig;

/// Keep-alive comment frame.
pub const KEEPALIVE: &[u8] = b":\n\n";

/// Content encoding of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// No compression.
    Identity,
    /// gzip.
    Gzip,
    /// deflate (zlib wrapped).
    Deflate,
}

impl Encoding {
    /// Pick an encoding from an `Accept-Encoding` header value.
    ///
    /// gzip wins over deflate; codings with `q=0` are refused.
    pub fn negotiate(accept_encoding: Option<&str>, config: &CompressionConfig) -> Self {
        if !config.enabled {
            return Encoding::Identity;
        }
        let Some(header) = accept_encoding else {
            return Encoding::Identity;
        };

        let mut gzip = false;
        let mut deflate = false;
        for item in header.split(',') {
            let mut parts = item.split(';');
            let coding = parts.next().unwrap_or("").trim().to_ascii_lowercase();
            let refused = parts.any(|param| {
                let param = param.trim();
                param
                    .strip_prefix("q=")
                    .and_then(|q| q.trim().parse::<f32>().ok())
                    .is_some_and(|q| q <= 0.0)
            });
            if refused {
                continue;
            }
            match coding.as_str() {
                "gzip" | "x-gzip" => gzip = true,
                "deflate" => deflate = true,
                "*" => gzip = true,
                _ => {}
            }
        }

        if gzip {
            Encoding::Gzip
        } else if deflate {
            Encoding::Deflate
        } else {
            Encoding::Identity
        }
    }

    /// Value for the `content-encoding` header; `None` for identity.
    pub fn header_value(self) -> Option<&'static str> {
        match self {
            Encoding::Identity => None,
            Encoding::Gzip => Some("gzip"),
            Encoding::Deflate => Some("deflate"),
        }
    }

    /// Name used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        self.header_value().unwrap_or("identity")
    }
}

/// Render one event as a frame.
pub fn frame(event: &Event) -> FleetResult<Vec<u8>> {
    let data = serde_json::to_vec(&event.data)
        .map_err(|e| FleetError::internal("event serialization failed", e))?;

    let mut out = Vec::with_capacity(data.len() + 32);
    out.extend_from_slice(b"id:");
    out.extend_from_slice(event.id.to_string().as_bytes());
    out.push(b'\n');
    if let Some(name) = &event.name {
        out.extend_from_slice(b"event:");
        out.extend_from_slice(name.as_bytes());
        out.push(b'\n');
    }
    out.extend_from_slice(b"data:");
    out.extend_from_slice(&data);
    out.extend_from_slice(b"\n\n");
    Ok(out)
}

enum Compressor {
    Identity,
    Gzip(GzEncoder<Vec<u8>>),
    Deflate(ZlibEncoder<Vec<u8>>),
}

/// Per-session stream encoder. Holds the compressor state across frames.
pub struct StreamEncoder {
    encoding: Encoding,
    compressor: Compressor,
}

impl std::fmt::Debug for StreamEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamEncoder")
            .field("encoding", &self.encoding)
            .finish()
    }
}

impl StreamEncoder {
    /// Create an encoder for `encoding`.
    pub fn new(encoding: Encoding, config: &CompressionConfig) -> Self {
        let level = Compression::new(config.level.min(9));
        let compressor = match encoding {
            Encoding::Identity => Compressor::Identity,
            Encoding::Gzip => Compressor::Gzip(GzEncoder::new(Vec::new(), level)),
            Encoding::Deflate => Compressor::Deflate(ZlibEncoder::new(Vec::new(), level)),
        };
        Self {
            encoding,
            compressor,
        }
    }

    /// The negotiated encoding.
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Encode `frame`, returning the bytes to put on the wire.
    pub fn encode(&mut self, frame: &[u8]) -> FleetResult<Bytes> {
        match &mut self.compressor {
            Compressor::Identity => Ok(Bytes::copy_from_slice(frame)),
            Compressor::Gzip(encoder) => {
                encoder
                    .write_all(frame)
                    .and_then(|()| encoder.flush())
                    .map_err(|e| FleetError::internal("gzip write failed", e))?;
                Ok(Bytes::from(std::mem::take(encoder.get_mut())))
            }
            Compressor::Deflate(encoder) => {
                encoder
                    .write_all(frame)
                    .and_then(|()| encoder.flush())
                    .map_err(|e| FleetError::internal("deflate write failed", e))?;
                Ok(Bytes::from(std::mem::take(encoder.get_mut())))
            }
        }
    }

    /// Encode an event.
    pub fn encode_event(&mut self, event: &Event) -> FleetResult<Bytes> {
        let frame = frame(event)?;
        self.encode(&frame)
    }

    /// Encode a keep-alive comment.
    pub fn encode_keepalive(&mut self) -> FleetResult<Bytes> {
        self.encode(KEEPALIVE)
    }
}
