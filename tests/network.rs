//! End-to-end tests driving whole nodes over loopback TCP.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use bytes::Bytes;
use codec::{NetworkId, address::Address, identity::Identity};
use muddle_node::muddle::Muddle;
use overlay::{
    peers::NEVER_EXPIRE,
    routing::RequestHandler,
    tracker::TrackerConfiguration,
};

const NETWORK: NetworkId = NetworkId::new(*b"TEST");

const SERVICE: u16 = 1920;
const CHANNEL: u16 = 101;

fn test_node(seed: u8) -> Muddle {
    Muddle::new(
        NETWORK,
        Identity::from_seed(&[seed; 32]),
        "127.0.0.1".to_string(),
        Default::default(),
    )
}

async fn start(muddle: &Muddle) -> Result<u16> {
    muddle.start(&[0]).await?;
    Ok(muddle.get_listening_ports()[0])
}

fn uri(port: u16) -> String {
    format!("tcp://127.0.0.1:{port}")
}

async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if condition() {
            return true;
        }

        if tokio::time::Instant::now() >= deadline {
            return false;
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn two_nodes_handshake_and_message() -> Result<()> {
    let a = test_node(1);
    let b = test_node(2);

    let a_port = start(&a).await?;
    start(&b).await?;

    b.connect_to_uri(uri(a_port), NEVER_EXPIRE);

    assert!(
        wait_for(Duration::from_secs(20), || {
            a.is_directly_connected(&b.get_address())
                && b.is_directly_connected(&a.get_address())
        })
        .await
    );

    let mut subscription = a.get_endpoint().subscribe(SERVICE, CHANNEL);

    b.get_endpoint().send(
        a.get_address(),
        SERVICE,
        CHANNEL,
        Bytes::from_static(b"Hello world"),
    )?;

    let packet = tokio::time::timeout(Duration::from_secs(10), subscription.recv())
        .await?
        .expect("delivery");

    assert_eq!(packet.payload, Bytes::from_static(b"Hello world"));
    assert_eq!(packet.sender, b.get_address());

    a.stop().await;
    b.stop().await;

    Ok(())
}

struct Echo;

impl RequestHandler for Echo {
    fn handle(&self, _sender: &Address, payload: &[u8]) -> Option<Bytes> {
        let mut reversed = payload.to_vec();
        reversed.reverse();
        Some(Bytes::from(reversed))
    }
}

#[tokio::test]
async fn exchange_round_trip_and_timeout() -> Result<()> {
    let a = test_node(1);
    let b = test_node(2);

    let a_port = start(&a).await?;
    start(&b).await?;
    a.register_handler(SERVICE, 7, Arc::new(Echo));

    b.connect_to_uri(uri(a_port), NEVER_EXPIRE);
    assert!(
        wait_for(Duration::from_secs(20), || {
            b.is_directly_connected(&a.get_address())
        })
        .await
    );

    let promise = b.get_endpoint().exchange(
        a.get_address(),
        SERVICE,
        7,
        Bytes::from_static(b"muddle"),
        Duration::from_secs(10),
    )?;
    assert_eq!(promise.wait().await, Ok(Bytes::from_static(b"elddum")));

    // No handler on that channel: the promise times out and frees its
    // slot.
    let promise = b.get_endpoint().exchange(
        a.get_address(),
        555,
        1,
        Bytes::new(),
        Duration::from_secs(1),
    )?;
    assert_eq!(promise.wait().await, Err(overlay::Error::Timeout));

    a.stop().await;
    b.stop().await;

    Ok(())
}

#[tokio::test]
async fn duplicate_dials_collapse_to_one_link() -> Result<()> {
    let a = test_node(1);
    let b = test_node(2);

    let a_port = start(&a).await?;
    let b_port = start(&b).await?;

    // Both sides dial each other at once.
    a.connect_to_uri(uri(b_port), NEVER_EXPIRE);
    b.connect_to_uri(uri(a_port), NEVER_EXPIRE);

    assert!(
        wait_for(Duration::from_secs(30), || {
            let (a_in, a_out) = a.connection_counts();
            let (b_in, b_out) = b.connection_counts();

            a.is_directly_connected(&b.get_address())
                && b.is_directly_connected(&a.get_address())
                && a_in + a_out == 1
                && b_in + b_out == 1
        })
        .await
    );

    // The surviving direction matches the address-comparison rule.
    let (lower, higher) = if a.get_address() < b.get_address() {
        (&a, &b)
    } else {
        (&b, &a)
    };

    assert_eq!(lower.get_outgoing_connected_peers().len(), 1);
    assert_eq!(higher.get_incoming_connected_peers().len(), 1);

    a.stop().await;
    b.stop().await;

    Ok(())
}

#[tokio::test]
async fn line_of_five_relays_to_the_head() -> Result<()> {
    let nodes: Vec<Muddle> = (1..=5).map(test_node).collect();

    let mut ports = Vec::new();
    for node in &nodes {
        ports.push(start(node).await?);
    }

    // Each node dials its predecessor, as in a freshly bootstrapped
    // line.
    for i in 1..nodes.len() {
        nodes[i].connect_to_uri(uri(ports[i - 1]), NEVER_EXPIRE);
    }

    assert!(
        wait_for(Duration::from_secs(30), || {
            (1..nodes.len()).all(|i| {
                nodes[i].is_directly_connected(&nodes[i - 1].get_address())
            })
        })
        .await
    );

    let head = nodes[0].get_address();
    let mut subscription = nodes[0].get_endpoint().subscribe(SERVICE, CHANNEL);

    for node in &nodes[1..] {
        node.get_endpoint()
            .send(head, SERVICE, CHANNEL, Bytes::from_static(b"Hello world"))?;
    }

    let mut senders = Vec::new();
    for _ in 0..nodes.len() - 1 {
        let packet = tokio::time::timeout(Duration::from_secs(30), subscription.recv())
            .await?
            .expect("relayed delivery");

        assert_eq!(packet.payload, Bytes::from_static(b"Hello world"));
        senders.push(packet.sender);
    }

    senders.sort();
    senders.dedup();
    assert_eq!(senders.len(), nodes.len() - 1);

    for node in &nodes {
        node.stop().await;
    }

    Ok(())
}

#[tokio::test]
async fn self_dial_leaves_no_connection() -> Result<()> {
    let a = test_node(1);
    let port = start(&a).await?;

    a.connect_to_uri(uri(port), NEVER_EXPIRE);
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(a.get_num_directly_connected_peers(), 0);
    assert!(!a.is_directly_connected(&a.get_address()));

    a.stop().await;

    Ok(())
}

#[tokio::test]
async fn start_stop_start_keeps_routing() -> Result<()> {
    let a = test_node(1);
    start(&a).await?;
    a.stop().await;

    // Second life under the same identity.
    let a_port = start(&a).await?;
    assert_eq!(a.get_num_directly_connected_peers(), 0);

    let b = test_node(2);
    start(&b).await?;
    b.connect_to_uri(uri(a_port), NEVER_EXPIRE);

    assert!(
        wait_for(Duration::from_secs(20), || {
            b.is_directly_connected(&a.get_address())
        })
        .await
    );

    let mut subscription = a.get_endpoint().subscribe(SERVICE, CHANNEL);
    b.get_endpoint()
        .send(a.get_address(), SERVICE, CHANNEL, Bytes::from_static(b"again"))?;

    let packet = tokio::time::timeout(Duration::from_secs(10), subscription.recv())
        .await?
        .expect("delivery after restart");
    assert_eq!(packet.payload, Bytes::from_static(b"again"));

    a.stop().await;
    b.stop().await;

    Ok(())
}

#[tokio::test]
async fn peer_table_recovery_drives_reconnect() -> Result<()> {
    let table_file = std::env::temp_dir().join(format!(
        "muddle-reboot-{}.peer_table",
        std::process::id()
    ));
    let _ = std::fs::remove_file(&table_file);

    let tracker = TrackerConfiguration {
        max_kademlia_connections: 2,
        persist_interval: 1,
        ..TrackerConfiguration::default()
    };

    let b = test_node(2);
    start(&b).await?;

    {
        let a = test_node(1);
        a.set_peer_table_file(table_file.clone());
        a.set_tracker_configuration(tracker.clone());
        start(&a).await?;

        a.connect_to_uri(uri(b.get_listening_ports()[0]), NEVER_EXPIRE);
        assert!(
            wait_for(Duration::from_secs(20), || {
                a.is_directly_connected(&b.get_address())
            })
            .await
        );

        // Let at least one persist tick run before going down.
        tokio::time::sleep(Duration::from_secs(2)).await;
        a.stop().await;
    }

    // A fresh instance under the same identity knows nobody explicitly;
    // the recovered peer table alone must bring the link back.
    let a = test_node(1);
    a.set_peer_table_file(table_file.clone());
    a.set_tracker_configuration(tracker);
    start(&a).await?;

    assert!(
        wait_for(Duration::from_secs(40), || {
            a.is_directly_connected(&b.get_address())
        })
        .await
    );

    a.stop().await;
    b.stop().await;
    let _ = std::fs::remove_file(&table_file);

    Ok(())
}
