// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Length-delimited JSON framing over a `TcpStream`.
//!
//! The original transport is Go's `net/rpc` over `gob`; the Rust-native
//! substitute keeps the same one-frame-per-call contract with a
//! portable encoding (`tokio_util`'s `LengthDelimitedCodec` carrying
//! JSON payloads), per SPEC_FULL.md §4.1.

use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::{TransportError, TransportResult};
use crate::protocol::{Call, Reply};

/// A framed connection carrying [`Call`]/[`Reply`] pairs.
pub struct Connection {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
}

impl Connection {
    /// Wrap an accepted or dialed TCP stream.
    pub fn new(stream: TcpStream) -> Self {
        Self {
            framed: Framed::new(stream, LengthDelimitedCodec::new()),
        }
    }

    /// Read the next call frame, or `None` on a clean EOF.
    pub async fn read_call(&mut self) -> TransportResult<Option<Call>> {
        match self.framed.next().await {
            Some(Ok(bytes)) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Some(Err(e)) => Err(TransportError::Io(e)),
            None => Ok(None),
        }
    }

    /// Write a reply frame.
    pub async fn write_reply(&mut self, reply: &Reply) -> TransportResult<()> {
        let bytes = serde_json::to_vec(reply)?;
        self.framed.send(Bytes::from(bytes)).await?;
        Ok(())
    }

    /// Write a call frame (worker side).
    pub async fn write_call(&mut self, call: &Call) -> TransportResult<()> {
        let bytes = serde_json::to_vec(call)?;
        self.framed.send(Bytes::from(bytes)).await?;
        Ok(())
    }

    /// Read the next reply frame.
    pub async fn read_reply(&mut self) -> TransportResult<Reply> {
        match self.framed.next().await {
            Some(Ok(bytes)) => Ok(decode_reply(&bytes)?),
            Some(Err(e)) => Err(TransportError::Io(e)),
            None => Err(TransportError::ConnectionClosed),
        }
    }
}

fn decode_reply(bytes: &BytesMut) -> Result<Reply, serde_json::Error> {
    serde_json::from_slice(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Opcode, Request, RpcMethod};

    #[tokio::test]
    async fn call_and_reply_round_trip_over_a_real_socket() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = Connection::new(stream);
            let call = conn.read_call().await.unwrap().expect("call frame");
            assert_eq!(call.method, RpcMethod::SendWorkUnit);
            conn.write_reply(&Reply::ok_with_payload(1, vec![9, 9]))
                .await
                .unwrap();
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut conn = Connection::new(stream);
        let call = Call {
            method: RpcMethod::SendWorkUnit,
            request: Request::status(Opcode::Download, 1, 1, "1"),
        };
        conn.write_call(&call).await.unwrap();
        let reply = conn.read_reply().await.unwrap();
        assert_eq!(reply.payload, vec![9, 9]);

        server.await.unwrap();
    }
}
