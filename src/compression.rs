// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Payload Compression
//!
//! gzip helpers for payloads tagged with `Content-Encoding: gzip`.

use crate::errors::AmqpError;
use async_compression::tokio::{bufread::GzipDecoder, write::GzipEncoder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::error;

/// Content encoding used for compressed payloads.
pub const GZIP_ENCODING: &str = "gzip";

/// Compresses `data` with gzip.
pub async fn gzip(data: &[u8]) -> Result<Vec<u8>, AmqpError> {
    let mut encoder = GzipEncoder::new(Vec::with_capacity(data.len() / 2));

    let written = async {
        encoder.write_all(data).await?;
        encoder.shutdown().await
    }
    .await;

    if let Err(err) = written {
        error!(error = err.to_string(), "failure to compress payload");
        return Err(AmqpError::CompressionError(err.to_string()));
    }

    Ok(encoder.into_inner())
}

/// Decompresses a gzip payload.
pub async fn gunzip(data: &[u8]) -> Result<Vec<u8>, AmqpError> {
    let mut decoder = GzipDecoder::new(data);
    let mut out = Vec::with_capacity(data.len() * 2);

    match decoder.read_to_end(&mut out).await {
        Ok(_) => Ok(out),
        Err(err) => {
            error!(error = err.to_string(), "failure to decompress payload");
            Err(AmqpError::CompressionError(err.to_string()))
        }
    }
}

/// Decodes a payload according to its content encoding. Unknown encodings pass through.
pub async fn decode(encoding: Option<&str>, data: &[u8]) -> Result<Vec<u8>, AmqpError> {
    match encoding {
        Some(enc) if enc.eq_ignore_ascii_case(GZIP_ENCODING) => gunzip(data).await,
        _ => Ok(data.to_vec()),
    }
}
