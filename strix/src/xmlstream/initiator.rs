// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use core::pin::Pin;
use std::borrow::Cow;
use std::io;

use futures::{SinkExt, StreamExt};

use tokio::io::{AsyncBufRead, AsyncWrite};

use strix_stanzas::stream_features::StreamFeatures;

use super::common::{RawError, RawXmlStream, StreamHeader};
use super::{FromElement, XmlStream};
use strix_schema::TreeBuilder;

/// Type state for an initiator stream which has not yet sent its stream
/// header.
///
/// To continue stream setup, call [`send_header`][`Self::send_header`].
pub struct InitiatingStream<Io>(pub(super) RawXmlStream<Io>);

impl<Io: AsyncBufRead + AsyncWrite + Unpin> InitiatingStream<Io> {
    /// Send the stream header.
    pub async fn send_header(
        self,
        header: StreamHeader<'_>,
    ) -> io::Result<PendingFeaturesRecv<Io>> {
        let Self(mut stream) = self;

        header.send(Pin::new(&mut stream)).await?;
        stream.flush().await?;
        let header = StreamHeader::recv(Pin::new(&mut stream)).await?;
        Ok(PendingFeaturesRecv { stream, header })
    }
}

/// Type state for an initiator stream which has sent and received the
/// stream header.
///
/// To continue stream setup, call [`recv_features`][`Self::recv_features`].
pub struct PendingFeaturesRecv<Io> {
    pub(super) stream: RawXmlStream<Io>,
    pub(super) header: StreamHeader<'static>,
}

impl<Io> PendingFeaturesRecv<Io> {
    /// The stream header contents as sent by the peer.
    pub fn header(&self) -> StreamHeader<'_> {
        StreamHeader {
            from: self.header.from.as_ref().map(|x| Cow::Borrowed(&**x)),
            to: self.header.to.as_ref().map(|x| Cow::Borrowed(&**x)),
            id: self.header.id.as_ref().map(|x| Cow::Borrowed(&**x)),
        }
    }

    /// Extract the stream header contents as sent by the peer.
    pub fn take_header(&mut self) -> StreamHeader<'static> {
        self.header.take()
    }
}

impl<Io: AsyncBufRead + AsyncWrite + Unpin> PendingFeaturesRecv<Io> {
    /// Receive the responder's stream features.
    ///
    /// After the stream features have been received, the stream can be
    /// used for exchanging stream-level elements (stanzas or "nonzas").
    /// The Rust type for these elements must be given as type parameter
    /// `T`.
    pub async fn recv_features<T: FromElement>(
        self,
    ) -> io::Result<(StreamFeatures, XmlStream<Io, T>)> {
        let Self {
            mut stream,
            header: _,
        } = self;

        let mut builder = TreeBuilder::new();
        let features = loop {
            let ev = match Pin::new(&mut stream).next().await {
                Some(Ok(ev)) => ev,
                Some(Err(RawError::Io(e))) => return Err(e),
                // prodding the peer is not possible yet; wait for the
                // hard timeout if it stays silent
                Some(Err(RawError::SoftTimeout)) => continue,
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "eof before stream features",
                    ))
                }
            };
            match builder
                .feed(ev)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?
            {
                Some(element) => {
                    break StreamFeatures::try_from(element)
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?
                }
                None => continue,
            }
        };
        Ok((features, XmlStream::wrap(stream)))
    }
}
