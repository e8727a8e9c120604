//! Request body decompression per `content-encoding`, per spec.md §4.7 step
//! 4. Decompression failure is non-fatal: callers fall back to the raw
//! bytes.

use async_compression::tokio::bufread::{BrotliDecoder, GzipDecoder, ZlibDecoder, ZstdDecoder};
use axum::body::Bytes;
use tokio::io::AsyncReadExt;

/// Decompresses `body` according to `content_encoding`. Returns the raw
/// bytes unchanged for `identity`/unknown encodings, and on any decode
/// error (the caller logs at debug level and proceeds with `body`
/// untouched either way, since this function already returns the original
/// bytes on failure).
pub async fn decompress_request_body(body: &Bytes, content_encoding: Option<&str>) -> Bytes {
    let Some(encoding) = content_encoding else {
        return body.clone();
    };

    let result = match encoding.trim().to_ascii_lowercase().as_str() {
        "gzip" => decode_with(GzipDecoder::new(&body[..])).await,
        "deflate" => decode_with(ZlibDecoder::new(&body[..])).await,
        "br" => decode_with(BrotliDecoder::new(&body[..])).await,
        "zstd" => decode_with(ZstdDecoder::new(&body[..])).await,
        _ => None,
    };

    match result {
        Some(decoded) => Bytes::from(decoded),
        None => body.clone(),
    }
}

async fn decode_with<R>(mut reader: R) -> Option<Vec<u8>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut out = Vec::new();
    match reader.read_to_end(&mut out).await {
        Ok(_) => Some(out),
        Err(err) => {
            tracing::debug!(error = %err, "request body decompression failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_encoding_passes_through() {
        let body = Bytes::from_static(b"plain text");
        let result = decompress_request_body(&body, Some("identity")).await;
        assert_eq!(result, body);
    }

    #[tokio::test]
    async fn no_encoding_header_passes_through() {
        let body = Bytes::from_static(b"plain text");
        let result = decompress_request_body(&body, None).await;
        assert_eq!(result, body);
    }

    #[tokio::test]
    async fn gzip_round_trip() {
        use async_compression::tokio::write::GzipEncoder;
        use tokio::io::AsyncWriteExt;

        let mut encoder = GzipEncoder::new(Vec::new());
        encoder.write_all(b"hello world").await.unwrap();
        encoder.shutdown().await.unwrap();
        let compressed = encoder.into_inner();

        let result = decompress_request_body(&Bytes::from(compressed), Some("gzip")).await;
        assert_eq!(&result[..], b"hello world");
    }

    #[tokio::test]
    async fn malformed_body_falls_back_to_raw_bytes() {
        let body = Bytes::from_static(b"not actually gzip data");
        let result = decompress_request_body(&body, Some("gzip")).await;
        assert_eq!(result, body);
    }
}
