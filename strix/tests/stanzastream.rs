// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Scripted-server tests for the stanza stream: negotiation, stream
//! management acknowledgement, resumption and failure semantics.

use core::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;

use strix::connect::AsyncReadAndWrite;
use strix::jid::Jid;
use strix::schema::PayloadRegistry;
use strix::stanzas::message::Message;
use strix::stanzastream::{
    Connection, Event, StanzaStage, StanzaState, StanzaStream, StreamEvent,
};
use strix::xmlstream::{initiate_stream, StreamHeader, Timeouts};
use strix::Stanza;

const SERVER_HEADER: &str = "<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' version='1.0' id='s-1'>";
const FEATURES_BIND_SM: &str = "<stream:features><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/><sm xmlns='urn:xmpp:sm:3'/></stream:features>";
const BIND_RESULT: &str = "<iq type='result' id='resource-binding'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><jid>alice@example.net/orchard</jid></bind></iq>";

/// Spawn a stanza stream whose "connections" are in-process duplex
/// pipes; the server halves pop out of the returned receiver, one per
/// (re)connect.
fn scripted_stream() -> (StanzaStream, mpsc::UnboundedReceiver<DuplexStream>) {
    let (server_tx, server_rx) = mpsc::unbounded_channel();
    let jid: Jid = "alice@example.net".parse().unwrap();
    let connector = Box::new(move |_loc: Option<String>, slot| {
        let server_tx: mpsc::UnboundedSender<DuplexStream> = server_tx.clone();
        let jid = jid.clone();
        tokio::spawn(async move {
            let (client_half, server_half) = tokio::io::duplex(65536);
            server_tx.send(server_half).expect("test dropped server rx");
            let io: Box<dyn AsyncReadAndWrite> = Box::new(BufReader::new(client_half));
            let pending = initiate_stream(
                io,
                "jabber:client",
                StreamHeader {
                    to: Some("example.net".into()),
                    ..StreamHeader::default()
                },
                Timeouts::default(),
            )
            .await
            .expect("stream header exchange");
            let (features, stream) = pending.recv_features().await.expect("features");
            let _: Result<_, _> = slot.send(Connection {
                stream,
                features,
                identity: jid,
            });
        });
    });
    let stream = StanzaStream::new(
        connector,
        16,
        Some(Duration::from_secs(60)),
        PayloadRegistry::new(),
    );
    (stream, server_rx)
}

struct Script {
    io: DuplexStream,
    rx_buf: Vec<u8>,
}

impl Script {
    fn new(io: DuplexStream) -> Script {
        Script {
            io,
            rx_buf: Vec::new(),
        }
    }

    async fn send(&mut self, data: &str) {
        self.io.write_all(data.as_bytes()).await.expect("write");
    }

    /// Everything received so far, with attribute quotes normalised to
    /// single quotes so that expectations are quoting-agnostic.
    fn received(&self) -> String {
        String::from_utf8_lossy(&self.rx_buf).replace('"', "'")
    }

    /// Read until the collected inbound text contains `needle`.
    async fn expect(&mut self, needle: &str) {
        let deadline = Duration::from_secs(5);
        let read = async {
            loop {
                if self.received().contains(needle) {
                    return;
                }
                let mut chunk = [0u8; 4096];
                let n = self.io.read(&mut chunk).await.expect("read");
                assert!(n > 0, "eof while waiting for {:?}", needle);
                self.rx_buf.extend_from_slice(&chunk[..n]);
            }
        };
        tokio::time::timeout(deadline, read)
            .await
            .unwrap_or_else(|_|

                panic!(
                    "timeout waiting for {:?}; got so far: {}",
                    needle,
                    self.received()
                )
            );
    }

    /// Preamble up to and including a resumable SM session.
    async fn establish(&mut self) {
        self.expect("<stream:stream").await;
        self.send(SERVER_HEADER).await;
        self.send(FEATURES_BIND_SM).await;
        self.expect("resource-binding").await;
        self.send(BIND_RESULT).await;
        self.expect("<enable").await;
        self.send("<enabled xmlns='urn:xmpp:sm:3' resume='true' id='sid-1'/>")
            .await;
    }
}

async fn next_event(stream: &mut StanzaStream) -> Event {
    tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("timeout waiting for stream event")
        .expect("stream ended unexpectedly")
}

fn chat_message(body: &str) -> Box<Stanza> {
    let mut message = Message::new(Some("alice@example.net".parse().unwrap())).with_body(body);
    message.id = Some(format!("test-{}", body));
    Box::new(Stanza::Message(message))
}

#[tokio::test]
async fn establish_send_ack_and_receive() {
    let (mut stream, mut server_rx) = scripted_stream();
    let mut script = Script::new(server_rx.recv().await.unwrap());
    script.establish().await;

    match next_event(&mut stream).await {
        Event::Stream(StreamEvent::Reset { bound_jid }) => {
            assert_eq!(bound_jid.to_string(), "alice@example.net/orchard");
        }
        other => panic!("unexpected event: {:?}", other),
    }

    // outbound: a message, acked by the server
    let mut token = stream.send(chat_message("hello-out")).await.unwrap();
    script.expect("hello-out").await;
    assert!(matches!(token.state(), StanzaState::Sent {}));
    script.send("<a xmlns='urn:xmpp:sm:3' h='1'/>").await;
    let state = tokio::time::timeout(
        Duration::from_secs(5),
        token.wait_for(StanzaStage::Acked),
    )
    .await
    .expect("timeout waiting for ack")
    .expect("token dropped");
    assert!(matches!(state, StanzaState::Acked {}));

    // inbound: a message for the application
    script
        .send("<message from='bob@example.net/pda' type='chat'><body>hello-in</body></message>")
        .await;
    match next_event(&mut stream).await {
        Event::Stanza(Stanza::Message(message)) => {
            assert_eq!(message.bodies.get(""), Some(&"hello-in".to_owned()));
        }
        other => panic!("unexpected event: {:?}", other),
    }

    // the server requests our counters; the inbound message must have
    // been counted
    script.send("<r xmlns='urn:xmpp:sm:3'/>").await;
    script.expect("h='1'").await;

    stream.close().await;
}

#[tokio::test]
async fn unhandled_iq_and_malformed_stanza_counting() {
    let (mut stream, mut server_rx) = scripted_stream();
    let mut script = Script::new(server_rx.recv().await.unwrap());
    script.establish().await;
    match next_event(&mut stream).await {
        Event::Stream(StreamEvent::Reset { .. }) => (),
        other => panic!("unexpected event: {:?}", other),
    }

    // an IQ get nobody handles is answered with service-unavailable,
    // not feature-not-implemented
    script
        .send("<iq type='get' id='x1' from='peer@example.net/r'><odd xmlns='urn:example:odd'/></iq>")
        .await;
    script.expect("service-unavailable").await;
    assert!(!script.received().contains("feature-not-implemented"));

    // a malformed stanza (iq without id) is dropped, but still counted
    script.send("<iq type='get'><odd xmlns='urn:example:odd'/></iq>").await;
    script.send("<r xmlns='urn:xmpp:sm:3'/>").await;
    script.expect("h='2'").await;

    stream.close().await;
}

#[tokio::test]
async fn resume_after_blackhole_retransmits_and_acks() {
    let (mut stream, mut server_rx) = scripted_stream();
    let mut script = Script::new(server_rx.recv().await.unwrap());
    script.establish().await;
    match next_event(&mut stream).await {
        Event::Stream(StreamEvent::Reset { .. }) => (),
        other => panic!("unexpected event: {:?}", other),
    }

    let mut token1 = stream.send(chat_message("first")).await.unwrap();
    let mut token2 = stream.send(chat_message("second")).await.unwrap();
    script.expect("second").await;

    // blackhole: the TCP connection dies without any ack
    drop(script);

    match next_event(&mut stream).await {
        Event::Stream(StreamEvent::Suspended) => (),
        other => panic!("unexpected event: {:?}", other),
    }

    // the reconnector produces a fresh connection; the client must
    // resume, not rebind
    let mut script = Script::new(server_rx.recv().await.unwrap());
    script.expect("<stream:stream").await;
    script.send(SERVER_HEADER).await;
    script.send(FEATURES_BIND_SM).await;
    script.expect("previd='sid-1'").await;
    assert!(script.received().contains("h='0'"));
    script
        .send("<resumed xmlns='urn:xmpp:sm:3' h='0' previd='sid-1'/>")
        .await;

    match next_event(&mut stream).await {
        Event::Stream(StreamEvent::Resumed) => (),
        other => panic!("unexpected event: {:?}", other),
    }

    // both unacked stanzas are replayed, in order
    script.expect("first").await;
    script.expect("second").await;
    let wire = script.received();
    assert!(wire.find("first").unwrap() < wire.find("second").unwrap());

    // ack everything; no token may be left in an unknown state
    script.send("<a xmlns='urn:xmpp:sm:3' h='2'/>").await;
    for token in [&mut token1, &mut token2] {
        let state = tokio::time::timeout(
            Duration::from_secs(5),
            token.wait_for(StanzaStage::Acked),
        )
        .await
        .expect("timeout waiting for ack")
        .expect("token dropped");
        assert!(matches!(state, StanzaState::Acked {}));
    }

    stream.close().await;
}

#[tokio::test]
async fn resume_failure_disconnects_tokens_and_rebinds() {
    let (mut stream, mut server_rx) = scripted_stream();
    let mut script = Script::new(server_rx.recv().await.unwrap());
    script.establish().await;
    match next_event(&mut stream).await {
        Event::Stream(StreamEvent::Reset { .. }) => (),
        other => panic!("unexpected event: {:?}", other),
    }

    let mut token = stream.send(chat_message("doomed")).await.unwrap();
    script.expect("doomed").await;
    drop(script);

    match next_event(&mut stream).await {
        Event::Stream(StreamEvent::Suspended) => (),
        other => panic!("unexpected event: {:?}", other),
    }

    // the server lost the session: resumption fails and the client has
    // to bind a fresh one
    let mut script = Script::new(server_rx.recv().await.unwrap());
    script.expect("<stream:stream").await;
    script.send(SERVER_HEADER).await;
    script.send(FEATURES_BIND_SM).await;
    script.expect("previd='sid-1'").await;
    script
        .send("<failed xmlns='urn:xmpp:sm:3'><item-not-found xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></failed>")
        .await;

    // the in-flight stanza's outcome is unknowable
    let state = tokio::time::timeout(
        Duration::from_secs(5),
        token.wait_for(StanzaStage::Disconnected),
    )
    .await
    .expect("timeout waiting for disconnect state")
    .expect("token dropped");
    assert!(matches!(state, StanzaState::Disconnected));

    // fresh session: bind again, enable again
    script.expect("resource-binding").await;
    script.send(BIND_RESULT).await;
    script.expect("<enable").await;
    script
        .send("<enabled xmlns='urn:xmpp:sm:3' resume='true' id='sid-2'/>")
        .await;

    match next_event(&mut stream).await {
        Event::Stream(StreamEvent::Reset { .. }) => (),
        other => panic!("unexpected event: {:?}", other),
    }

    stream.close().await;
}

#[tokio::test]
async fn concurrent_sends_keep_wire_order() {
    let (mut stream, mut server_rx) = scripted_stream();
    let mut script = Script::new(server_rx.recv().await.unwrap());
    script.establish().await;
    match next_event(&mut stream).await {
        Event::Stream(StreamEvent::Reset { .. }) => (),
        other => panic!("unexpected event: {:?}", other),
    }

    // send calls complete in submission order; the serialised order on
    // the wire must match
    for i in 0..20 {
        stream
            .send(chat_message(&format!("ordered-{:02}", i)))
            .await
            .unwrap();
    }
    script.expect("ordered-19").await;
    let wire = script.received();
    let mut last = 0;
    for i in 0..20 {
        let pos = wire
            .find(&format!("ordered-{:02}", i))
            .unwrap_or_else(|| panic!("ordered-{:02} missing from wire", i));
        assert!(pos >= last, "ordered-{:02} out of order", i);
        last = pos;
    }

    stream.close().await;
}
