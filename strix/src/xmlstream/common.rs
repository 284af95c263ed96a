// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use core::time::Duration;
use std::borrow::Cow;
use std::io;

use bytes::{Buf, BytesMut};

use futures::{ready, Sink, SinkExt, Stream, StreamExt};

use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::time::Instant;

use rxml::writer::TrackNamespace;
use rxml::{xml_ncname, Event, Namespace};

use strix_schema::{Element, Item};
use strix_stanzas::ns::STREAM as XML_STREAM_NS;

/// Liveness timeouts of an XML stream.
///
/// When no bytes arrive for `soft`, the stream emits a single
/// [`SoftTimeout`][`super::ReadError::SoftTimeout`] so that the consumer
/// can provoke the peer into sending something (`<sm:r/>` or a ping IQ).
/// When still nothing arrives for another `grace`, the stream fails with a
/// timeout I/O error. Any received byte resets both.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Time of rx silence after which a soft timeout is signalled.
    pub soft: Duration,

    /// Additional rx silence after the soft timeout before the stream is
    /// declared dead.
    pub grace: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            soft: Duration::new(60, 0),
            grace: Duration::new(15, 0),
        }
    }
}

impl Timeouts {
    /// Aggressive settings for tests and interactive use.
    pub fn tight() -> Timeouts {
        Timeouts {
            soft: Duration::new(15, 0),
            grace: Duration::new(5, 0),
        }
    }
}

/// Error variants produced by [`RawXmlStream`].
#[derive(Debug)]
pub(super) enum RawError {
    /// An I/O error; fatal.
    Io(io::Error),

    /// The soft liveness timeout tripped.
    SoftTimeout,
}

impl From<io::Error> for RawError {
    fn from(other: io::Error) -> Self {
        Self::Io(other)
    }
}

pin_project_lite::pin_project! {
    // NOTE: due to limitations of pin_project_lite, the field comments are
    // no doc comments. Luckily, this struct is only `pub(super)` anyway.
    #[project = RawXmlStreamProj]
    pub(super) struct RawXmlStream<Io> {
        // The parser used for deserialising data.
        #[pin]
        parser: rxml::AsyncReader<Io>,

        // The writer used for serialising data.
        writer: rxml::writer::Encoder<rxml::writer::SimpleNamespaces>,

        // The default namespace to declare on the stream header.
        stream_ns: &'static str,

        // Buffer containing serialised data which will then be sent through
        // the inner `Io`. Sending that serialised data happens in
        // `poll_ready` and `poll_flush`, while appending serialised data
        // happens in `start_send`.
        tx_buffer: BytesMut,

        // Limit at which the Sink refuses more data until writes have
        // progressed. `start_send` is exempt: an element must be encoded
        // in one batch once started.
        tx_buffer_high_water_mark: usize,

        // Liveness configuration and the timer tracking it. The timer
        // deadline is pushed forward on every received event. Boxed so
        // that the stream stays Unpin for the type-state handshake API.
        timeouts: Timeouts,
        rx_timer: Pin<Box<tokio::time::Sleep>>,
        soft_tripped: bool,

        // Set after an I/O error; everything fails fast afterwards.
        poisoned: bool,
    }
}

impl<Io: AsyncBufRead + AsyncWrite> RawXmlStream<Io> {
    fn new_writer(
        stream_ns: &'static str,
    ) -> rxml::writer::Encoder<rxml::writer::SimpleNamespaces> {
        let mut writer = rxml::writer::Encoder::new();
        writer
            .ns_tracker_mut()
            .declare_fixed(Some(xml_ncname!("stream")), XML_STREAM_NS.into());
        writer.ns_tracker_mut().declare_fixed(None, stream_ns.into());
        writer
    }

    pub(super) fn new(io: Io, stream_ns: &'static str, timeouts: Timeouts) -> Self {
        let parser = rxml::Parser::default();
        Self {
            parser: rxml::AsyncReader::wrap(io, parser),
            writer: Self::new_writer(stream_ns),
            stream_ns,
            tx_buffer: BytesMut::new(),
            // if we already have 2 kiB in our send buffer, do not accept
            // more data until some of it was flushed.
            tx_buffer_high_water_mark: 2048,
            rx_timer: Box::pin(tokio::time::sleep(timeouts.soft)),
            soft_tripped: false,
            timeouts,
            poisoned: false,
        }
    }

    /// Discard all parser and serialiser state for a stream restart.
    pub(super) fn reset_state(self: Pin<&mut Self>) {
        let this = self.project();
        *this.parser.parser_pinned() = rxml::Parser::default();
        *this.writer = Self::new_writer(this.stream_ns);
    }
}

impl<Io> RawXmlStream<Io> {
    fn parser_pinned(self: Pin<&mut Self>) -> &mut rxml::Parser {
        self.project().parser.parser_pinned()
    }

    pub(super) fn get_stream(&self) -> &Io {
        self.parser.inner()
    }

    pub(super) fn into_inner(self) -> Io {
        self.parser.into_inner()
    }
}

impl<Io: AsyncBufRead> Stream for RawXmlStream<Io> {
    type Item = Result<rxml::Event, RawError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        if *this.poisoned {
            return Poll::Ready(None);
        }
        loop {
            match this.parser.as_mut().poll_read(cx) {
                Poll::Ready(result) => {
                    // any progress on the read side feeds the liveness
                    // timer
                    *this.soft_tripped = false;
                    this.rx_timer
                        .as_mut()
                        .reset(Instant::now() + this.timeouts.soft);
                    return Poll::Ready(match result.transpose() {
                        // Skip the XML declaration, nobody wants to hear
                        // about that.
                        Some(Ok(Event::XmlDeclaration(_, _))) => continue,
                        Some(Ok(other)) => Some(Ok(other)),
                        Some(Err(e)) => {
                            *this.poisoned = true;
                            Some(Err(e.into()))
                        }
                        None => None,
                    });
                }
                Poll::Pending => (),
            }
            ready!(this.rx_timer.as_mut().poll(cx));
            if *this.soft_tripped {
                *this.poisoned = true;
                return Poll::Ready(Some(Err(RawError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "peer stayed silent beyond the hard liveness timeout",
                )))));
            }
            *this.soft_tripped = true;
            this.rx_timer
                .as_mut()
                .reset(Instant::now() + this.timeouts.grace);
            return Poll::Ready(Some(Err(RawError::SoftTimeout)));
        }
    }
}

impl<'x, Io: AsyncWrite> RawXmlStreamProj<'x, Io> {
    fn progress_write(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        while self.tx_buffer.len() > 0 {
            let written = match ready!(self
                .parser
                .as_mut()
                .inner_pinned()
                .poll_write(cx, &self.tx_buffer))
            {
                Ok(v) => v,
                Err(e) => return Poll::Ready(Err(e)),
            };
            self.tx_buffer.advance(written);
        }
        Poll::Ready(Ok(()))
    }
}

impl<Io: AsyncBufRead + AsyncWrite> RawXmlStream<Io> {
    /// Serialise a complete element into the transmit buffer.
    ///
    /// Either the whole element lands in the buffer, or — when any part
    /// of it fails to serialise — the buffer is rolled back to its state
    /// before the call and the serialiser is rebuilt, so that nothing of
    /// the broken element can ever reach the wire.
    pub(super) fn start_send_element(self: Pin<&mut Self>, element: &Element) -> io::Result<()> {
        let this = self.project();
        let checkpoint = this.tx_buffer.len();
        let result = (|| -> io::Result<()> {
            let items = element
                .as_items()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
            for item in items {
                this.writer
                    .encode_into_bytes(item.as_rxml_item(), this.tx_buffer)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            }
            Ok(())
        })();
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                this.tx_buffer.truncate(checkpoint);
                *this.writer = Self::new_writer(this.stream_ns);
                Err(e)
            }
        }
    }
}

impl<'x, Io: AsyncWrite> Sink<Item<'x>> for RawXmlStream<Io> {
    type Error = io::Error;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let mut this = self.project();
        match this.progress_write(cx) {
            // No progress on write, but if we have enough space in the
            // buffer it's ok nonetheless.
            Poll::Pending => (),
            Poll::Ready(Ok(())) => (),
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
        }
        if this.tx_buffer.len() < *this.tx_buffer_high_water_mark {
            Poll::Ready(Ok(()))
        } else {
            Poll::Pending
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let mut this = self.project();
        ready!(this.progress_write(cx))?;
        this.parser.as_mut().inner_pinned().poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let mut this = self.project();
        ready!(this.progress_write(cx))?;
        this.parser.as_mut().inner_pinned().poll_shutdown(cx)
    }

    fn start_send(self: Pin<&mut Self>, item: Item<'x>) -> Result<(), Self::Error> {
        let this = self.project();
        this.writer
            .encode_into_bytes(item.as_rxml_item(), this.tx_buffer)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
    }
}

/// Contains metadata from an XML stream header.
#[derive(Default)]
pub struct StreamHeader<'x> {
    /// The optional `from` attribute.
    pub from: Option<Cow<'x, str>>,

    /// The optional `to` attribute.
    pub to: Option<Cow<'x, str>>,

    /// The optional `id` attribute.
    pub id: Option<Cow<'x, str>>,
}

impl<'x> StreamHeader<'x> {
    /// Take the contents and return them as new object.
    ///
    /// `self` will be left with all its parts set to `None`.
    pub fn take(&mut self) -> Self {
        Self {
            from: self.from.take(),
            to: self.to.take(),
            id: self.id.take(),
        }
    }

    pub(super) async fn send<Io: AsyncBufRead + AsyncWrite + Unpin>(
        self,
        mut stream: Pin<&mut RawXmlStream<Io>>,
    ) -> io::Result<()> {
        stream
            .send(Item::XmlDeclaration(rxml::XmlVersion::V1_0))
            .await?;
        stream
            .send(Item::ElementHeadStart(
                Namespace::from(XML_STREAM_NS),
                Cow::Borrowed(xml_ncname!("stream")),
            ))
            .await?;
        if let Some(from) = self.from {
            stream
                .send(Item::Attribute(
                    Namespace::NONE,
                    Cow::Borrowed(xml_ncname!("from")),
                    from,
                ))
                .await?;
        }
        if let Some(to) = self.to {
            stream
                .send(Item::Attribute(
                    Namespace::NONE,
                    Cow::Borrowed(xml_ncname!("to")),
                    to,
                ))
                .await?;
        }
        if let Some(id) = self.id {
            stream
                .send(Item::Attribute(
                    Namespace::NONE,
                    Cow::Borrowed(xml_ncname!("id")),
                    id,
                ))
                .await?;
        }
        stream
            .send(Item::Attribute(
                Namespace::NONE,
                Cow::Borrowed(xml_ncname!("version")),
                Cow::Borrowed("1.0"),
            ))
            .await?;
        stream.send(Item::ElementHeadEnd).await?;
        Ok(())
    }
}

impl StreamHeader<'static> {
    pub(super) async fn recv<Io: AsyncBufRead>(
        mut stream: Pin<&mut RawXmlStream<Io>>,
    ) -> io::Result<Self> {
        loop {
            match stream.as_mut().next().await.transpose() {
                Err(RawError::Io(e)) => return Err(e),
                // nothing to prompt here yet, just keep waiting for the
                // hard timeout
                Err(RawError::SoftTimeout) => continue,
                Ok(Some(Event::StartElement(_, (ns, name), mut attrs))) => {
                    if ns != XML_STREAM_NS || name != "stream" {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "unknown stream header",
                        ));
                    }

                    match attrs.remove(Namespace::none(), "version") {
                        Some(v) => {
                            if v != "1.0" {
                                return Err(io::Error::new(
                                    io::ErrorKind::InvalidData,
                                    format!("unsupported stream version: {}", v),
                                ));
                            }
                        }
                        None => {
                            return Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                "required `version` attribute missing",
                            ))
                        }
                    }

                    let from = attrs.remove(Namespace::none(), "from");
                    let to = attrs.remove(Namespace::none(), "to");
                    let id = attrs.remove(Namespace::none(), "id");
                    let _ = attrs.remove(Namespace::xml(), "lang");

                    return Ok(StreamHeader {
                        from: from.map(Cow::Owned),
                        to: to.map(Cow::Owned),
                        id: id.map(Cow::Owned),
                    });
                }
                Ok(Some(Event::Text(_, _))) | Ok(Some(Event::EndElement(_))) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "unexpected content before stream header",
                    ))
                }
                // We cannot loop infinitely here because the XML parser
                // will prevent more than one XML declaration from being
                // parsed.
                Ok(Some(Event::XmlDeclaration(_, _))) => (),
                Ok(None) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "eof before stream header",
                    ))
                }
            }
        }
    }
}
