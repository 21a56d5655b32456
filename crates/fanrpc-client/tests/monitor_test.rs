//! Connection monitor tests for the fanrpc client
//!
//! These tests verify:
//! - Unhealthy handles are repaired in place on the health tick
//! - Broken IP addresses are disconnected, broken DNS names stay registered
//! - Pending reconnects recover addresses that were down at startup
//! - Rebalance ticks top up healthy handles
//! - Cancelling the monitor's context ends the error stream and closes the client

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{init_tracing, wait_until, MockDialer};
use fanrpc_client::{Client, ClientConfig, ReplacePolicy};
use fanrpc_common::Context;

const IP: &str = "10.0.0.1:8081";
const OTHER_IP: &str = "10.0.0.2:8081";
const DNS: &str = "node-a.svc:8081";

fn client(addrs: &[&str]) -> (Client<MockDialer>, MockDialer) {
    init_tracing();
    let dialer = MockDialer::new();
    let mut config = ClientConfig::new(addrs.iter().copied());
    config.health_check_interval_ms = 1000;
    config.replace_policy = ReplacePolicy::CloseImmediately;
    (Client::new(dialer.clone(), config), dialer)
}

async fn past_first_tick() {
    tokio::time::sleep(Duration::from_millis(1500)).await;
}

#[tokio::test(start_paused = true)]
async fn test_health_tick_repairs_in_place() {
    let (client, dialer) = client(&[IP]);
    client
        .start_connection_monitor(&Context::background())
        .await
        .unwrap();

    // drop the handle's connection without breaking it for good
    dialer.state.handles(IP)[0].healthy.store(false, Ordering::SeqCst);
    past_first_tick().await;

    assert!(client.is_connected(&Context::background(), IP).await);
    assert_eq!(dialer.state.dials(IP), 1);
    assert_eq!(client.live_connections(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_broken_ip_address_is_disconnected() {
    let (client, dialer) = client(&[IP, OTHER_IP]);
    let mut errors = client
        .start_connection_monitor(&Context::background())
        .await
        .unwrap();

    dialer.state.set_down(IP, true);
    past_first_tick().await;

    assert_eq!(client.connected_addrs(), vec![OTHER_IP.to_string()]);
    assert_eq!(client.live_connections(), 1);
    assert!(dialer.state.handles(IP)[0].disconnected.load(Ordering::SeqCst));

    let err = errors.try_recv().expect("reconnect failure reported");
    assert!(err.to_string().contains(IP));
}

#[tokio::test(start_paused = true)]
async fn test_broken_dns_address_stays_registered() {
    let (client, dialer) = client(&[DNS, IP]);
    client
        .start_connection_monitor(&Context::background())
        .await
        .unwrap();

    dialer.state.set_down(DNS, true);
    past_first_tick().await;

    assert_eq!(client.connected_addrs(), vec![IP.to_string(), DNS.to_string()]);
    assert_eq!(client.live_connections(), 2);
    assert!(!client.is_connected(&Context::background(), DNS).await);

    // the name resolves again and the registered handle recovers
    dialer.state.set_down(DNS, false);
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert!(client.is_connected(&Context::background(), DNS).await);
}

#[tokio::test(start_paused = true)]
async fn test_pending_reconnect_recovers_address() {
    let (client, dialer) = client(&[IP, OTHER_IP]);
    dialer.state.set_down(OTHER_IP, true);
    client
        .start_connection_monitor(&Context::background())
        .await
        .unwrap();
    assert_eq!(client.pending_reconnects(), vec![OTHER_IP.to_string()]);

    dialer.state.set_down(OTHER_IP, false);
    past_first_tick().await;

    assert_eq!(
        client.connected_addrs(),
        vec![IP.to_string(), OTHER_IP.to_string()]
    );
    assert_eq!(client.live_connections(), 2);
    assert!(client.pending_reconnects().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_address_stays_pending() {
    let (client, dialer) = client(&[IP, OTHER_IP]);
    dialer.state.set_down(OTHER_IP, true);
    client
        .start_connection_monitor(&Context::background())
        .await
        .unwrap();

    past_first_tick().await;

    assert_eq!(client.connected_addrs(), vec![IP.to_string()]);
    assert_eq!(client.pending_reconnects(), vec![OTHER_IP.to_string()]);
    assert_eq!(dialer.state.dials(OTHER_IP), 2);
}

#[tokio::test(start_paused = true)]
async fn test_rebalance_tops_up_healthy_handles() {
    init_tracing();
    let dialer = MockDialer::new();
    let mut config = ClientConfig::new([IP]);
    config.health_check_interval_ms = 60_000;
    config.enable_rebalance = true;
    config.rebalance_interval_ms = 500;
    let client = Client::new(dialer.clone(), config);
    client
        .start_connection_monitor(&Context::background())
        .await
        .unwrap();

    let handle = dialer.state.handles(IP)[0].clone();
    assert_eq!(handle.connects.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(1100)).await;

    assert_eq!(handle.connects.load(Ordering::SeqCst), 3);
    assert_eq!(dialer.state.dials(IP), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_monitor_and_closes_client() {
    let (client, dialer) = client(&[IP, DNS]);
    let ctx = Context::background();
    let mut errors = client.start_connection_monitor(&ctx).await.unwrap();
    let mut second = client.start_connection_monitor(&ctx).await.unwrap();

    ctx.cancel();

    assert!(errors.recv().await.is_none());
    assert!(second.recv().await.is_none());
    assert!(wait_until(|| client.connected_addrs().is_empty()).await);
    assert!(client.is_closed());
    assert!(!client.is_running());
    assert_eq!(client.live_connections(), 0);
    for addr in [IP, DNS] {
        assert!(dialer.state.handles(addr)[0].disconnected.load(Ordering::SeqCst));
    }
}
