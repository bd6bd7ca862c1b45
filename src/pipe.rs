//! Asynchronous pipe endpoints.
//!
//! The async read path buffers exactly one complete top-level structure —
//! proved complete by the streaming reader's resumable skip — and then runs
//! the synchronous converters over it. Suspension points are exactly the
//! refill reads and the chunked flush writes; converters never suspend.

use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use futures_core::stream::{FusedStream, Stream};
use futures_io::{AsyncRead, AsyncWrite};
use pin_project_lite::pin_project;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::serializer::Serializer;
use crate::shape::ShapeId;
use crate::stream::StreamReader;
use crate::value::Value;
use crate::DecodeResult;

/// Refill granularity for the async read path.
const READ_CHUNK: usize = 8 * 1024;

impl Serializer {
    /// Encode `value` and write it to an async pipe, one flush-threshold
    /// chunk at a time.
    pub async fn serialize_async<W>(
        &self,
        pipe: &mut W,
        value: &Value,
        shape: ShapeId,
        ctx: &Context,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let bytes = self.serialize_to_vec(value, shape, ctx)?;
        for chunk in bytes.chunks(ctx.unflushed_bytes_threshold().max(1)) {
            if ctx.cancel_token().is_canceled() {
                return Err(Error::Canceled);
            }
            write_all(pipe, chunk).await?;
        }
        poll_fn(|cx| Pin::new(&mut *pipe).poll_flush(cx)).await?;
        Ok(())
    }

    /// Decode one value of `shape` from an async pipe.
    ///
    /// Bytes are buffered until the streaming reader can skip one complete
    /// structure; the converters then run synchronously over that buffer.
    pub async fn deserialize_async<R>(
        &self,
        pipe: R,
        shape: ShapeId,
        ctx: &Context,
    ) -> Result<Value>
    where
        R: AsyncRead + Unpin,
    {
        let mut stream = self.deserialize_stream(pipe, shape, ctx.clone());
        let next = poll_fn(|cx| Pin::new(&mut stream).poll_next(cx)).await;
        next.unwrap_or(Err(Error::EndOfStream))
    }

    /// Decode an unframed concatenation of top-level values lazily. The
    /// stream ends cleanly at end of input on a value boundary; a partial
    /// trailing value is an [`Error::EndOfStream`] item.
    pub fn deserialize_stream<R>(
        &self,
        pipe: R,
        shape: ShapeId,
        ctx: Context,
    ) -> DeserializeStream<'_, R>
    where
        R: AsyncRead,
    {
        DeserializeStream {
            pipe,
            serializer: self,
            shape,
            ctx,
            reader: StreamReader::new(),
            acc: Vec::new(),
            value_start: 0,
            done: false,
        }
    }
}

async fn write_all<W: AsyncWrite + Unpin>(pipe: &mut W, buf: &[u8]) -> Result<()> {
    let mut rest = buf;
    poll_fn(move |cx| {
        while !rest.is_empty() {
            match Pin::new(&mut *pipe).poll_write(cx, rest) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(Error::from(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "pipe refused further bytes",
                    ))))
                }
                Poll::Ready(Ok(n)) => rest = &rest[n..],
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e.into())),
                Poll::Pending => return Poll::Pending,
            }
        }
        Poll::Ready(Ok(()))
    })
    .await
}

pin_project! {
    /// A lazy sequence of decoded values over an async byte pipe.
    ///
    /// Each item is one complete top-level msgpack value of the stream's
    /// shape; the source is treated as a concatenation with no framing.
    #[must_use = "streams do nothing unless polled"]
    pub struct DeserializeStream<'a, R> {
        #[pin]
        pipe: R,
        serializer: &'a Serializer,
        shape: ShapeId,
        ctx: Context,
        reader: StreamReader,
        acc: Vec<u8>,
        value_start: u64,
        done: bool,
    }
}

impl<R> Stream for DeserializeStream<'_, R>
where
    R: AsyncRead,
{
    type Item = Result<Value>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        if *this.done {
            return Poll::Ready(None);
        }
        Poll::Ready(loop {
            match this.reader.try_skip() {
                Err(err) => {
                    *this.done = true;
                    break Some(Err(err));
                }
                Ok(DecodeResult::Success(())) => {
                    let len = (this.reader.position() - *this.value_start) as usize;
                    let bytes: Vec<u8> = this.acc.drain(..len).collect();
                    *this.value_start = this.reader.position();
                    let value = this.serializer.deserialize(&bytes, *this.shape, this.ctx);
                    if value.is_err() {
                        *this.done = true;
                    }
                    break Some(value);
                }
                Ok(DecodeResult::TokenMismatch(marker)) => {
                    *this.done = true;
                    break Some(Err(Error::InvalidCode(marker.into_u8())));
                }
                Ok(DecodeResult::InsufficientBuffer(_)) | Ok(DecodeResult::EmptyBuffer)
                    if !this.reader.is_end_of_stream() =>
                {
                    if this.ctx.cancel_token().is_canceled() {
                        *this.done = true;
                        break Some(Err(Error::Canceled));
                    }
                    let mut buf = [0u8; READ_CHUNK];
                    match this.pipe.as_mut().poll_read(cx, &mut buf) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Ok(0)) => this.reader.finish_input(),
                        Poll::Ready(Ok(n)) => {
                            this.acc.extend_from_slice(&buf[..n]);
                            this.reader.feed(buf[..n].to_vec());
                        }
                        Poll::Ready(Err(e)) => {
                            *this.done = true;
                            break Some(Err(e.into()));
                        }
                    }
                }
                Ok(DecodeResult::InsufficientBuffer(_)) | Ok(DecodeResult::EmptyBuffer) => {
                    // Input is drained. A clean boundary ends the stream; a
                    // partly consumed or partly buffered value is a
                    // truncation.
                    *this.done = true;
                    if this.reader.mid_skip()
                        || this.reader.position() > *this.value_start
                        || this.reader.remaining() > 0
                    {
                        break Some(Err(Error::EndOfStream));
                    }
                    break None;
                }
            }
        })
    }
}

impl<R> FusedStream for DeserializeStream<'_, R>
where
    R: AsyncRead,
{
    fn is_terminated(&self) -> bool {
        self.done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CancelToken;
    use crate::shape::{Scalar, ShapeGraph};
    use futures_executor::block_on;
    use futures_util::stream::StreamExt;
    use std::sync::Arc;

    /// An AsyncRead that hands out at most `step` bytes per poll, so every
    /// value crosses several refills.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        step: usize,
    }

    impl AsyncRead for Trickle {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut TaskContext<'_>,
            buf: &mut [u8],
        ) -> Poll<io::Result<usize>> {
            let n = self.step.min(buf.len()).min(self.data.len() - self.pos);
            let pos = self.pos;
            buf[..n].copy_from_slice(&self.data[pos..pos + n]);
            self.pos += n;
            Poll::Ready(Ok(n))
        }
    }

    fn any_serializer() -> (Serializer, ShapeId) {
        let mut graph = ShapeGraph::new();
        let any = graph.scalar(Scalar::Any);
        (Serializer::new(Arc::new(graph)), any)
    }

    #[test]
    fn async_write_matches_sync() {
        let (ser, any) = any_serializer();
        let ctx = Context::new().with_unflushed_bytes_threshold(16);
        let value = Value::Array((0..200u32).map(Value::from).collect());
        let mut sink: Vec<u8> = Vec::new();
        block_on(ser.serialize_async(&mut sink, &value, any, &ctx)).unwrap();
        assert_eq!(sink, ser.serialize_to_vec(&value, any, &ctx).unwrap());
    }

    #[test]
    fn async_read_across_refills() {
        let (ser, any) = any_serializer();
        let ctx = Context::new();
        let value = Value::Map(vec![
            (Value::from("k"), Value::Array(vec![Value::from(1u8); 50])),
            (Value::from("s"), Value::from("some text")),
        ]);
        let bytes = ser.serialize_to_vec(&value, any, &ctx).unwrap();
        let pipe = Trickle {
            data: bytes,
            pos: 0,
            step: 3,
        };
        let back = block_on(ser.deserialize_async(pipe, any, &ctx)).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn stream_yields_concatenated_values() {
        let (ser, any) = any_serializer();
        let ctx = Context::new();
        let values = vec![
            Value::from(1u8),
            Value::from("two"),
            Value::Array(vec![Value::from(3u8)]),
        ];
        let mut bytes = Vec::new();
        for v in &values {
            bytes.extend(ser.serialize_to_vec(v, any, &ctx).unwrap());
        }
        let pipe = Trickle {
            data: bytes,
            pos: 0,
            step: 2,
        };
        let collected: Vec<Value> = block_on(
            ser.deserialize_stream(pipe, any, ctx)
                .map(|item| item.unwrap())
                .collect(),
        );
        assert_eq!(collected, values);
    }

    #[test]
    fn truncated_trailing_value_errors() {
        let (ser, any) = any_serializer();
        let ctx = Context::new();
        let mut bytes = ser
            .serialize_to_vec(&Value::from(1u8), any, &ctx)
            .unwrap();
        bytes.extend([0x92, 0x01]); // half an array
        let pipe = Trickle {
            data: bytes,
            pos: 0,
            step: 8,
        };
        let items: Vec<Result<Value>> =
            block_on(ser.deserialize_stream(pipe, any, ctx.clone()).collect());
        assert_eq!(items.len(), 2);
        assert_eq!(*items[0].as_ref().unwrap(), Value::from(1u8));
        match &items[1] {
            Err(Error::EndOfStream) => (),
            other => panic!("expected truncation error, got {:?}", other),
        }

        // A trailing partial token (not even a complete header) is also a
        // truncation, not a clean end.
        let mut bytes = ser
            .serialize_to_vec(&Value::from(1u8), any, &ctx)
            .unwrap();
        bytes.extend([0xcd, 0x01]); // uint16 missing its last byte
        let pipe = Trickle {
            data: bytes,
            pos: 0,
            step: 8,
        };
        let items: Vec<Result<Value>> =
            block_on(ser.deserialize_stream(pipe, any, ctx).collect());
        assert_eq!(items.len(), 2);
        match &items[1] {
            Err(Error::EndOfStream) => (),
            other => panic!("expected truncation error, got {:?}", other),
        }
    }

    #[test]
    fn empty_pipe_is_end_of_stream() {
        let (ser, any) = any_serializer();
        let ctx = Context::new();
        let pipe = Trickle {
            data: Vec::new(),
            pos: 0,
            step: 8,
        };
        match block_on(ser.deserialize_async(pipe, any, &ctx)) {
            Err(Error::EndOfStream) => (),
            other => panic!("expected end of stream, got {:?}", other),
        }
        // The enumerable form treats the same input as a clean, empty
        // sequence.
        let pipe = Trickle {
            data: Vec::new(),
            pos: 0,
            step: 8,
        };
        let items: Vec<Result<Value>> =
            block_on(ser.deserialize_stream(pipe, any, ctx).collect());
        assert!(items.is_empty());
    }

    #[test]
    fn cancellation_stops_refills() {
        let (ser, any) = any_serializer();
        let token = CancelToken::new();
        let ctx = Context::new().with_cancel_token(token.clone());
        let value = Value::Array((0..1000u32).map(Value::from).collect());
        let bytes = ser.serialize_to_vec(&value, any, &ctx).unwrap();
        token.cancel();
        let pipe = Trickle {
            data: bytes,
            pos: 0,
            step: 16,
        };
        match block_on(ser.deserialize_async(pipe, any, &ctx)) {
            Err(Error::Canceled) => (),
            other => panic!("expected cancellation, got {:?}", other),
        }
    }
}
