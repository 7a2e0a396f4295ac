//! Integration test: session bootstrap from an unencrypted message.
//!
//! A participant receiving plain text answers with a protocol query;
//! the peer that sent the plain text reacts to the query by starting
//! the key agreement, and both sides converge to READY.

use mpenc_crypto::rsa::StaticPrivateKey;
use mpenc_greet::greeting::GreetingState;
use mpenc_greet::{LocalIdentity, StaticKeyDirectory};
use mpenc_handler::{ProtocolHandler, UiEvent};
use mpenc_wire::frame;

fn build_pair() -> (ProtocolHandler, ProtocolHandler) {
    let mut directory = StaticKeyDirectory::new();
    let key1 = StaticPrivateKey::generate(1024).expect("keygen");
    let key2 = StaticPrivateKey::generate(1024).expect("keygen");
    directory.insert("1", key1.public_key());
    directory.insert("2", key2.public_key());
    (
        ProtocolHandler::new(LocalIdentity::new("1", key1), directory.clone(), 0),
        ProtocolHandler::new(LocalIdentity::new("2", key2), directory, 0),
    )
}

fn drain(handlers: &mut [ProtocolHandler]) {
    loop {
        let mut packets = Vec::new();
        for handler in handlers.iter_mut() {
            while let Some(packet) = handler.protocol_out_queue().pop_front() {
                packets.push(packet);
            }
        }
        if packets.is_empty() {
            return;
        }
        for packet in packets {
            for handler in handlers.iter_mut() {
                handler.process_message(&packet.from, &packet.message);
            }
        }
    }
}

#[test]
fn plaintext_bootstraps_two_member_session() {
    let (mut h1, mut h2) = build_pair();

    // Member 2 receives plain text from member 1.
    h2.process_message("1", "Kia ora");

    assert_eq!(
        h2.ui_queue().pop_front(),
        Some(UiEvent::Info(
            "Received unencrypted message, requesting encryption.".into()
        ))
    );
    let query = h2.protocol_out_queue().pop_front().expect("query frame");
    assert!(query.message.starts_with(frame::QUERY_PREFIX));
    assert_eq!(query.to, "1");

    // Member 1 reacts to the query by starting the agreement.
    h1.process_message(&query.from, &query.message);
    assert_eq!(h1.state(), GreetingState::InitUpflow);

    let mut handlers = [h1, h2];
    drain(&mut handlers);

    for handler in &handlers {
        assert_eq!(handler.state(), GreetingState::Ready);
    }
    let store1 = handlers[0].session_store().expect("store");
    let store2 = handlers[1].session_store().expect("store");
    assert_eq!(store1.group_key, store2.group_key);
    assert_eq!(store1.session_id, store2.session_id);
    assert_eq!(store1.members, vec!["1".to_string(), "2".to_string()]);
}

#[test]
fn query_ignored_outside_null() {
    let (h1, h2) = build_pair();
    let mut handlers = [h1, h2];
    handlers[0].start(&["2".to_string()]).expect("start");
    drain(&mut handlers);

    // Both are READY; a late query must not restart anything.
    handlers[0].process_message("2", &frame::encode_query(""));
    assert_eq!(handlers[0].state(), GreetingState::Ready);
    assert!(handlers[0].protocol_out_queue().is_empty());
}
