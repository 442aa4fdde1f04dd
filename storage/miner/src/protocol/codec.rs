// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::io;
use std::marker::PhantomData;

use asynchronous_codec::{Decoder, Encoder};
use bytes::{Buf, BytesMut};
use fvm_ipld_encoding::{from_slice, to_vec};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Messages over 2 MiB are likely malicious.
const MAX_MESSAGE_BYTES: usize = 2 * 1024 * 1024;

/// Codec for a single varint length-prefixed CBOR message in each direction.
/// `Dec` is the inbound message type, `Enc` the outbound one; a handler for
/// one protocol uses it as `MessageCodec<Request, Response>` and the client
/// side flips the parameters.
pub struct MessageCodec<Dec, Enc> {
    _marker: PhantomData<fn(Enc) -> Dec>,
}

impl<Dec, Enc> Default for MessageCodec<Dec, Enc> {
    fn default() -> Self {
        MessageCodec {
            _marker: PhantomData,
        }
    }
}

impl<Dec: DeserializeOwned, Enc> Decoder for MessageCodec<Dec, Enc> {
    type Item = Dec;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Dec>> {
        let (length, prefix_len) = {
            let buf = &src[..];
            match unsigned_varint::decode::usize(buf) {
                Ok((length, rest)) => (length, buf.len() - rest.len()),
                Err(unsigned_varint::decode::Error::Insufficient) => return Ok(None),
                Err(e) => {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, e.to_string()));
                }
            }
        };

        if length > MAX_MESSAGE_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("message length {} exceeds maximum", length),
            ));
        }

        if src.len() < prefix_len + length {
            // Wait for the rest of the frame.
            return Ok(None);
        }

        src.advance(prefix_len);
        let frame = src.split_to(length);
        from_slice(&frame)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
    }
}

impl<Dec, Enc: Serialize> Encoder for MessageCodec<Dec, Enc> {
    type Item = Enc;
    type Error = io::Error;

    fn encode(&mut self, item: Enc, dst: &mut BytesMut) -> io::Result<()> {
        let bytes =
            to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

        let mut prefix = unsigned_varint::encode::usize_buffer();
        dst.extend_from_slice(unsigned_varint::encode::usize(bytes.len(), &mut prefix));
        dst.extend_from_slice(&bytes);
        Ok(())
    }
}
