// Copyright (c) 2024 strix contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use core::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};

use strix_schema::Element;
use strix_stanzas::ns;

use crate::stanza::{Stanza, XmppStreamElement};

use super::*;

const SERVER_HEADER: &str = "<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' version='1.0' id='t-0'>";

async fn client_side(
    io: DuplexStream,
    timeouts: Timeouts,
) -> io::Result<XmlStream<BufReader<DuplexStream>, XmppStreamElement>> {
    let pending = initiate_stream(
        BufReader::new(io),
        ns::JABBER_CLIENT,
        StreamHeader {
            to: Some("example.net".into()),
            ..StreamHeader::default()
        },
        timeouts,
    )
    .await?;
    let (features, stream) = pending.recv_features::<XmppStreamElement>().await?;
    assert!(!features.can_bind());
    Ok(stream)
}

async fn serve_preamble(server: &mut DuplexStream) {
    // swallow the client header, then answer with ours plus empty
    // features
    let mut buf = vec![0u8; 1024];
    let n = server.read(&mut buf).await.unwrap();
    assert!(n > 0);
    server.write_all(SERVER_HEADER.as_bytes()).await.unwrap();
    server
        .write_all(b"<stream:features/>")
        .await
        .unwrap();
}

#[tokio::test]
async fn handshake_and_receive_stanza() {
    let (client, mut server) = tokio::io::duplex(65536);
    let server = tokio::spawn(async move {
        serve_preamble(&mut server).await;
        server
            .write_all(b"<message xmlns='jabber:client'><body>hello</body></message>")
            .await
            .unwrap();
        server
    });
    let mut stream = client_side(client, Timeouts::default()).await.unwrap();
    match stream.next().await {
        Some(Ok(XmppStreamElement::Stanza(Stanza::Message(message)))) => {
            assert_eq!(message.bodies.get(""), Some(&"hello".to_owned()));
        }
        other => panic!("unexpected read: {:?}", other),
    }
    server.await.unwrap();
}

#[tokio::test]
async fn parse_error_is_recoverable() {
    let (client, mut server) = tokio::io::duplex(65536);
    let server = tokio::spawn(async move {
        serve_preamble(&mut server).await;
        // iq without an id fails to parse, but the following message must
        // still come through
        server
            .write_all(b"<iq xmlns='jabber:client' type='get'><x xmlns='y'/></iq><message xmlns='jabber:client'><body>after</body></message>")
            .await
            .unwrap();
        server
    });
    let mut stream = client_side(client, Timeouts::default()).await.unwrap();
    match stream.next().await {
        Some(Err(ReadError::ParseError { ref head, .. })) => {
            assert_eq!(head.name, "iq");
        }
        other => panic!("unexpected read: {:?}", other),
    }
    match stream.next().await {
        Some(Ok(XmppStreamElement::Stanza(Stanza::Message(message)))) => {
            assert_eq!(message.bodies.get(""), Some(&"after".to_owned()));
        }
        other => panic!("unexpected read: {:?}", other),
    }
    server.await.unwrap();
}

#[tokio::test]
async fn malformed_xml_is_fatal() {
    let (client, mut server) = tokio::io::duplex(65536);
    let server = tokio::spawn(async move {
        serve_preamble(&mut server).await;
        server.write_all(b"<message <broken").await.unwrap();
        server
    });
    let mut stream = client_side(client, Timeouts::default()).await.unwrap();
    match stream.next().await {
        Some(Err(ReadError::HardError(_))) => (),
        other => panic!("unexpected read: {:?}", other),
    }
    server.await.unwrap();
}

#[tokio::test]
async fn stream_footer_signalled() {
    let (client, mut server) = tokio::io::duplex(65536);
    let server = tokio::spawn(async move {
        serve_preamble(&mut server).await;
        server.write_all(b"</stream:stream>").await.unwrap();
        server
    });
    let mut stream = client_side(client, Timeouts::default()).await.unwrap();
    match stream.next().await {
        Some(Err(ReadError::StreamFooterReceived)) => (),
        other => panic!("unexpected read: {:?}", other),
    }
    server.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn soft_then_hard_timeout() {
    let (client, mut server) = tokio::io::duplex(65536);
    let server = tokio::spawn(async move {
        serve_preamble(&mut server).await;
        // keep the connection open without sending anything
        tokio::time::sleep(Duration::from_secs(3600)).await;
        server
    });
    let timeouts = Timeouts {
        soft: Duration::from_secs(5),
        grace: Duration::from_secs(2),
    };
    let mut stream = client_side(client, timeouts).await.unwrap();
    match stream.next().await {
        Some(Err(ReadError::SoftTimeout)) => (),
        other => panic!("unexpected read: {:?}", other),
    }
    match stream.next().await {
        Some(Err(ReadError::HardError(e))) => {
            assert_eq!(e.kind(), io::ErrorKind::TimedOut);
        }
        other => panic!("unexpected read: {:?}", other),
    }
    server.abort();
}

#[tokio::test]
async fn sent_elements_reach_the_wire_in_order() {
    let (client, mut server) = tokio::io::duplex(65536);
    let serve = tokio::spawn(async move {
        serve_preamble(&mut server).await;
        let mut collected = Vec::new();
        let mut buf = vec![0u8; 4096];
        loop {
            let n = server.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&buf[..n]);
            if collected
                .windows("sec\u{f6}".len())
                .any(|w| w == "sec\u{f6}".as_bytes())
            {
                break;
            }
        }
        String::from_utf8(collected).unwrap()
    });
    let mut stream = client_side(client, Timeouts::default()).await.unwrap();
    let first: Element = "<message xmlns='jabber:client'><body>first</body></message>"
        .parse()
        .unwrap();
    let second: Element = "<message xmlns='jabber:client'><body>sec\u{f6}</body></message>"
        .parse()
        .unwrap();
    stream.send(&first).await.unwrap();
    stream.send(&second).await.unwrap();
    let wire = serve.await.unwrap();
    let first_at = wire.find("first").expect("first message missing");
    let second_at = wire.find("sec\u{f6}").expect("second message missing");
    assert!(first_at < second_at);
}
