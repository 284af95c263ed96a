// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! # RFC 6120 XML Streams
//!
//! **Note:** The XML stream is a low-level API which you should probably
//! not use directly.
//!
//! An XML stream frames an unbounded sequence of top-level elements inside
//! a `<stream:stream>` envelope. [`XmlStream`] reads those elements one at
//! a time — each one materialised as a captured subtree and parsed into
//! the typed element `T` — and writes outbound elements atomically.
//!
//! Establishing a stream is a multi-stage process: [`initiate_stream`]
//! sends the header and yields a [`PendingFeaturesRecv`], whose
//! [`recv_features`][`PendingFeaturesRecv::recv_features`] produces the
//! [`XmlStream`] proper. Mid-negotiation stream restarts (after STARTTLS
//! and after SASL) drop all parser state and start over via
//! [`XmlStream::initiate_reset`].

use core::fmt;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use std::io;

use futures::{ready, Sink, Stream};

use tokio::io::{AsyncBufRead, AsyncWrite};

use strix_schema::{Element, FromElementError, TreeBuilder};

mod common;
mod initiator;
#[cfg(test)]
mod tests;

use self::common::{RawError, RawXmlStream};
pub use self::common::{StreamHeader, Timeouts};
pub use self::initiator::{InitiatingStream, PendingFeaturesRecv};

/// Parse a captured top-level element into a typed stream element.
///
/// This is the inbound half of the stream's type parameter. The outbound
/// half is plain [`Element`] values, which callers produce with their
/// types' `Into<Element>` conversions.
pub trait FromElement: Sized {
    /// Attempt to parse the element.
    fn from_element(elem: Element) -> Result<Self, FromElementError>;
}

impl FromElement for Element {
    fn from_element(elem: Element) -> Result<Self, FromElementError> {
        Ok(elem)
    }
}

impl FromElement for crate::stanza::XmppStreamElement {
    fn from_element(elem: Element) -> Result<Self, FromElementError> {
        Self::try_from(elem)
    }
}

impl FromElement for crate::stanza::Stanza {
    fn from_element(elem: Element) -> Result<Self, FromElementError> {
        Self::try_from(elem)
    }
}

/// Initiate a new stream using the given I/O object `io`.
///
/// The default XML namespace will be set to `stream_ns` and the stream
/// header will use the attributes as set in `stream_header`, along with
/// version `1.0`.
pub async fn initiate_stream<Io: AsyncBufRead + AsyncWrite + Unpin>(
    io: Io,
    stream_ns: &'static str,
    stream_header: StreamHeader<'_>,
    timeouts: Timeouts,
) -> Result<PendingFeaturesRecv<Io>, io::Error> {
    let stream = InitiatingStream(RawXmlStream::new(io, stream_ns, timeouts));
    stream.send_header(stream_header).await
}

/// Identifying pieces of a top-level element which failed to parse.
///
/// Carried alongside parse errors so that the stanza stream can keep its
/// stream-management counters accurate and generate error replies without
/// retaining the whole broken subtree.
#[derive(Debug, Clone)]
pub struct ElementHead {
    /// The namespace of the failed element.
    pub ns: String,

    /// The local name of the failed element.
    pub name: String,

    /// The `id` attribute, if present.
    pub id: Option<String>,

    /// The `from` attribute, if present.
    pub from: Option<String>,

    /// The `type` attribute, if present.
    pub type_: Option<String>,
}

impl ElementHead {
    fn of(elem: &Element) -> ElementHead {
        ElementHead {
            ns: elem.ns().to_owned(),
            name: elem.name().to_owned(),
            id: elem.attr("id").map(str::to_owned),
            from: elem.attr("from").map(str::to_owned),
            type_: elem.attr("type").map(str::to_owned),
        }
    }
}

/// A non-success state which may occur while reading from an
/// [`XmlStream`].
#[derive(Debug)]
pub enum ReadError {
    /// The soft timeout of the stream triggered.
    ///
    /// User code should handle this by sending something into the stream
    /// which causes the peer to send data before the hard timeout
    /// triggers.
    SoftTimeout,

    /// An I/O error occurred in the underlying I/O object.
    ///
    /// This is generally fatal.
    HardError(io::Error),

    /// A parse error occurred while processing the element.
    ///
    /// This is non-fatal and more elements may be read from the stream:
    /// the XML subtree of the offending element has been fully consumed.
    ParseError {
        /// The schema error produced while materialising the element.
        error: strix_schema::Error,

        /// Identifying attributes of the element which failed.
        head: ElementHead,
    },

    /// The stream footer was received.
    ///
    /// Any future read attempts will again return this error. The stream
    /// has been closed by the peer and you should probably close it, too.
    StreamFooterReceived,
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadError::SoftTimeout => write!(f, "soft timeout"),
            ReadError::HardError(e) => write!(f, "hard error: {}", e),
            ReadError::ParseError { error, head } => write!(
                f,
                "parse error in {{{}}}{}: {}",
                head.ns, head.name, error
            ),
            ReadError::StreamFooterReceived => write!(f, "stream footer received"),
        }
    }
}

impl std::error::Error for ReadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReadError::HardError(e) => Some(e),
            ReadError::ParseError { error, .. } => Some(error),
            _ => None,
        }
    }
}

enum WriteState {
    Open,
    SendElementFoot,
    FooterSent,
    Failed,
}

impl WriteState {
    fn check_ok(&self) -> io::Result<()> {
        match self {
            WriteState::Failed => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "XML stream sink unusable because of previous write error",
            )),
            WriteState::Open | WriteState::SendElementFoot | WriteState::FooterSent => Ok(()),
        }
    }

    fn check_writable(&self) -> io::Result<()> {
        match self {
            WriteState::SendElementFoot | WriteState::FooterSent => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "stream footer already sent",
            )),
            WriteState::Failed | WriteState::Open => self.check_ok(),
        }
    }
}

pin_project_lite::pin_project! {
    /// XML stream
    ///
    /// This struct represents an
    /// [RFC 6120](https://tools.ietf.org/html/rfc6120) XML stream, where
    /// the payload consists of elements parsed via [`FromElement`] into
    /// `T` on receive, and serialised from [`Element`] values on send.
    pub struct XmlStream<Io, T> {
        #[pin]
        inner: RawXmlStream<Io>,
        // None after the stream footer was received.
        read_state: Option<TreeBuilder>,
        write_state: WriteState,
        _marker: core::marker::PhantomData<T>,
    }
}

impl<Io, T> XmlStream<Io, T> {
    /// Obtain a reference to the `Io` stream.
    pub fn get_stream(&self) -> &Io {
        self.inner.get_stream()
    }
}

impl<Io: AsyncBufRead + AsyncWrite, T: FromElement> XmlStream<Io, T> {
    pub(crate) fn wrap(inner: RawXmlStream<Io>) -> Self {
        Self {
            inner,
            read_state: Some(TreeBuilder::new()),
            write_state: WriteState::Open,
            _marker: core::marker::PhantomData,
        }
    }

    fn assert_retypable(&self) {
        match self.read_state {
            Some(ref builder) if builder.depth() == 0 => (),
            Some(_) => panic!("cannot reset stream: element parsing in progress!"),
            None => panic!("cannot reset stream: stream footer received!"),
        }
        match self.write_state.check_writable() {
            Ok(()) => (),
            Err(e) => panic!("cannot reset stream: {}", e),
        }
    }
}

impl<Io: AsyncBufRead + AsyncWrite + Unpin, T: FromElement> XmlStream<Io, T> {
    /// Initiate a stream reset.
    ///
    /// To actually send the new stream header, call
    /// [`send_header`][`InitiatingStream::send_header`] on the result.
    ///
    /// # Panics
    ///
    /// Attempting to reset the stream while an element is being received,
    /// or after either side closed the stream, will panic.
    pub fn initiate_reset(self) -> InitiatingStream<Io> {
        self.assert_retypable();

        let mut stream = self.inner;
        Pin::new(&mut stream).reset_state();
        InitiatingStream(stream)
    }

    /// Discard all XML state and return the inner I/O object.
    pub fn into_inner(self) -> Io {
        self.assert_retypable();
        self.inner.into_inner()
    }

    /// Exchange the typed element parameter of this stream.
    ///
    /// This is only valid between top-level elements, which the
    /// borrowchecker mostly enforces for free.
    pub fn retype<U: FromElement>(self) -> XmlStream<Io, U> {
        self.assert_retypable();
        XmlStream {
            inner: self.inner,
            read_state: self.read_state,
            write_state: self.write_state,
            _marker: core::marker::PhantomData,
        }
    }
}

impl<Io: AsyncBufRead, T: FromElement> Stream for XmlStream<Io, T> {
    type Item = Result<T, ReadError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        let builder = match this.read_state.as_mut() {
            None => {
                // awaiting eof.
                return loop {
                    match ready!(this.inner.as_mut().poll_next(cx)) {
                        None => break Poll::Ready(None),
                        Some(Ok(_)) => unreachable!("xml parser allowed data after stream footer"),
                        Some(Err(RawError::Io(e))) => {
                            break Poll::Ready(Some(Err(ReadError::HardError(e))))
                        }
                        // Swallow soft timeout, we don't want the user to
                        // trigger anything here.
                        Some(Err(RawError::SoftTimeout)) => continue,
                    }
                };
            }
            Some(builder) => builder,
        };
        loop {
            let ev = match ready!(this.inner.as_mut().poll_next(cx)) {
                Some(Ok(ev)) => ev,
                Some(Err(RawError::Io(e))) => {
                    return Poll::Ready(Some(Err(ReadError::HardError(e))))
                }
                Some(Err(RawError::SoftTimeout)) => {
                    return Poll::Ready(Some(Err(ReadError::SoftTimeout)))
                }
                None => {
                    return Poll::Ready(Some(Err(ReadError::HardError(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "eof without stream footer",
                    )))))
                }
            };
            // An end-element at depth zero is the stream footer.
            if builder.depth() == 0 {
                if let rxml::Event::EndElement(_) = ev {
                    *this.read_state = None;
                    return Poll::Ready(Some(Err(ReadError::StreamFooterReceived)));
                }
            }
            match builder.feed(ev) {
                Ok(Some(element)) => {
                    let head = ElementHead::of(&element);
                    return Poll::Ready(Some(match T::from_element(element) {
                        Ok(v) => Ok(v),
                        Err(e) => Err(ReadError::ParseError {
                            error: e.into(),
                            head,
                        }),
                    }));
                }
                Ok(None) => continue,
                Err(e) => {
                    // Text garbage between stanzas; the stream framing is
                    // broken beyond recovery.
                    return Poll::Ready(Some(Err(ReadError::HardError(io::Error::new(
                        io::ErrorKind::InvalidData,
                        e.to_string(),
                    )))));
                }
            }
        }
    }
}

impl<Io: AsyncBufRead + AsyncWrite, T> XmlStream<Io, T> {
    /// Initiate stream shutdown and poll for completion.
    ///
    /// This sends the stream footer and shuts the transmit side of the
    /// transport down; the receive side is unaffected.
    pub fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<(), io::Error>> {
        let mut this = self.project();
        this.write_state.check_ok()?;
        loop {
            match this.write_state {
                WriteState::Open => {
                    *this.write_state = WriteState::SendElementFoot;
                }
                WriteState::SendElementFoot => {
                    match ready!(this.inner.as_mut().poll_ready(cx)).and_then(|_| {
                        this.inner
                            .as_mut()
                            .start_send(strix_schema::Item::ElementFoot)
                    }) {
                        Ok(()) => {
                            log::trace!("stream footer sent successfully");
                        }
                        Err(e) => {
                            log::debug!(
                                "omitting stream footer: failed to make stream ready: {}",
                                e
                            );
                            *this.write_state = WriteState::Failed;
                            return Poll::Ready(Err(e));
                        }
                    }
                    *this.write_state = WriteState::FooterSent;
                }
                WriteState::FooterSent => break,
                WriteState::Failed => unreachable!(), // caught by check_ok()
            }
        }
        this.inner.poll_close(cx)
    }
}

impl<Io: AsyncBufRead + AsyncWrite + Unpin, T> XmlStream<Io, T> {
    /// Send the stream footer and close the sender side of the underlying
    /// transport.
    pub fn shutdown(&mut self) -> Shutdown<'_, Io, T> {
        Shutdown {
            stream: Pin::new(self),
        }
    }
}

impl<'x, Io: AsyncBufRead + AsyncWrite, T> Sink<&'x Element> for XmlStream<Io, T> {
    type Error = io::Error;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        this.write_state.check_writable()?;
        <RawXmlStream<Io> as Sink<strix_schema::Item<'_>>>::poll_ready(this.inner, cx)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        this.write_state.check_writable()?;
        <RawXmlStream<Io> as Sink<strix_schema::Item<'_>>>::poll_flush(this.inner, cx)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        ready!(self.as_mut().poll_shutdown(cx))?;
        let this = self.project();
        <RawXmlStream<Io> as Sink<strix_schema::Item<'_>>>::poll_close(this.inner, cx)
    }

    fn start_send(self: Pin<&mut Self>, item: &'x Element) -> Result<(), Self::Error> {
        let this = self.project();
        this.write_state.check_writable()?;
        match this.inner.start_send_element(item) {
            Ok(()) => Ok(()),
            Err(e) => {
                // nothing of the element reached the buffer; the sink
                // itself stays usable
                log::debug!("failed to serialise element: {}", e);
                Err(e)
            }
        }
    }
}

/// Future implementing [`XmlStream::shutdown`] using
/// [`XmlStream::poll_shutdown`].
pub struct Shutdown<'a, Io: AsyncBufRead + AsyncWrite, T> {
    stream: Pin<&'a mut XmlStream<Io, T>>,
}

impl<'a, Io: AsyncBufRead + AsyncWrite, T> Future for Shutdown<'a, Io, T> {
    type Output = io::Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        self.stream.as_mut().poll_shutdown(cx)
    }
}

/// Convenience alias for an XML stream using
/// [`XmppStreamElement`][`crate::stanza::XmppStreamElement`].
pub type XmppStream<Io> = XmlStream<Io, crate::stanza::XmppStreamElement>;
