//! Benchmarks for TCP and UDP DNS request handling.
//!
//! Measures proxy performance for locally answered queries and for queries
//! forwarded to a mock upstream with simulated latency. The mock sits
//! behind a dead upstream for the first query only; after that the
//! promotion keeps it at the front.
//! We simulate ~15ms average with ±5ms jitter.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use rand::Rng;
use std::net::SocketAddr;
use std::sync::mpsc;
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tokio::runtime::Runtime;

use sdns::transport::client::{read_framed, write_framed};
use sdns::{Config, Proxy, RuleSet};

const MAX_DNS_PACKET_SIZE: usize = 4096;

/// Simulated upstream latency (based on real-world DNS benchmarks)
const BASE_LATENCY_MS: u64 = 15;
const JITTER_MS: u64 = 5;

fn build_dns_query(domain: &str) -> Vec<u8> {
    let mut query = Vec::new();
    query.extend_from_slice(&[0x12, 0x34]); // Query ID
    query.extend_from_slice(&[0x01, 0x00]); // Flags: standard query
    query.extend_from_slice(&[0x00, 0x01]); // Questions: 1
    query.extend_from_slice(&[0x00, 0x00]); // Answer RRs: 0
    query.extend_from_slice(&[0x00, 0x00]); // Authority RRs: 0
    query.extend_from_slice(&[0x00, 0x00]); // Additional RRs: 0
    for label in domain.split('.') {
        query.push(label.len() as u8);
        query.extend_from_slice(label.as_bytes());
    }
    query.extend_from_slice(&[0x00]); // null terminator
    query.extend_from_slice(&[0x00, 0x01]); // Type: A
    query.extend_from_slice(&[0x00, 0x01]); // Class: IN
    query
}

fn build_dns_response(query: &[u8]) -> Vec<u8> {
    let mut response = query.to_vec();
    response[2] = 0x81; // Response flag
    response[3] = 0x80; // Recursion available
    response[6] = 0x00; // Answer count
    response[7] = 0x01;
    // Answer: <question> A 93.184.216.34
    response.extend_from_slice(&[0xc0, 0x0c]); // Name pointer
    response.extend_from_slice(&[0x00, 0x01]); // Type: A
    response.extend_from_slice(&[0x00, 0x01]); // Class: IN
    response.extend_from_slice(&[0x00, 0x00, 0x01, 0x2c]); // TTL: 300
    response.extend_from_slice(&[0x00, 0x04]); // Data length: 4
    response.extend_from_slice(&[93, 184, 216, 34]); // IP address
    response
}

/// Simulate realistic upstream latency with jitter
async fn simulate_upstream_latency() {
    let jitter = rand::rng().random_range(0..=JITTER_MS * 2);
    let latency = BASE_LATENCY_MS - JITTER_MS + jitter;
    tokio::time::sleep(Duration::from_millis(latency)).await;
}

/// Mock UDP upstream with simulated latency
async fn mock_udp_upstream(socket: std::sync::Arc<UdpSocket>) {
    let mut buf = [0u8; MAX_DNS_PACKET_SIZE];
    loop {
        if let Ok((len, src)) = socket.recv_from(&mut buf).await {
            let response = build_dns_response(&buf[..len]);
            let socket = socket.clone();
            tokio::spawn(async move {
                simulate_upstream_latency().await;
                let _ = socket.send_to(&response, src).await;
            });
        }
    }
}

/// Start a mock upstream and a proxy in a background thread and return the
/// proxy address.
fn start_proxy() -> SocketAddr {
    let (tx, rx) = mpsc::channel();

    std::thread::spawn(move || {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let upstream = std::sync::Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
            let upstream_addr = upstream.local_addr().unwrap();
            tokio::spawn(mock_udp_upstream(upstream));

            let config = Config::from_toml(&format!(
                r#"
                addr = "127.0.0.1:0"
                servers = ["127.0.0.1:1", "{upstream_addr}"]
                timeout_ms = 200
                stats_interval_secs = 0

                [rules.exact]
                "local.bench" = "10.0.0.1"
                "#
            ))
            .unwrap();
            let rules = RuleSet::compile(config.rules.clone()).unwrap();
            let proxy = Proxy::bind(&config, rules, "192.168.0.2".parse().unwrap())
                .await
                .unwrap();
            tx.send(proxy.local_addr().unwrap()).unwrap();

            let _ = proxy.run().await;
        });
    });

    rx.recv().unwrap()
}

async fn udp_request(proxy_addr: SocketAddr, query: &[u8]) -> usize {
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(query, proxy_addr).await.unwrap();

    let mut buf = [0u8; MAX_DNS_PACKET_SIZE];
    tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap()
        .0
}

async fn tcp_request(proxy_addr: SocketAddr, query: &[u8]) -> usize {
    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    write_framed(&mut client, query).await.unwrap();
    read_framed(&mut client).await.unwrap().len()
}

fn bench_udp_request(c: &mut Criterion) {
    let proxy_addr = start_proxy();
    let rt = Runtime::new().unwrap();

    let local = build_dns_query("local.bench");
    let forwarded = build_dns_query("example.com");

    // Warm up: moves the working upstream to the front
    rt.block_on(udp_request(proxy_addr, &forwarded));

    let mut group = c.benchmark_group("udp");
    group.throughput(Throughput::Elements(1));

    group.bench_function(BenchmarkId::new("request_handling", "local"), |b| {
        b.to_async(&rt).iter(|| udp_request(proxy_addr, &local));
    });

    group.bench_function(BenchmarkId::new("request_handling", "forwarded"), |b| {
        b.to_async(&rt).iter(|| udp_request(proxy_addr, &forwarded));
    });

    group.finish();
}

fn bench_tcp_request(c: &mut Criterion) {
    let proxy_addr = start_proxy();
    let rt = Runtime::new().unwrap();

    let local = build_dns_query("local.bench");
    let forwarded = build_dns_query("example.com");

    rt.block_on(tcp_request(proxy_addr, &forwarded));

    let mut group = c.benchmark_group("tcp");
    group.throughput(Throughput::Elements(1));

    group.bench_function(BenchmarkId::new("request_handling", "local"), |b| {
        b.to_async(&rt).iter(|| tcp_request(proxy_addr, &local));
    });

    group.bench_function(BenchmarkId::new("request_handling", "forwarded"), |b| {
        b.to_async(&rt).iter(|| tcp_request(proxy_addr, &forwarded));
    });

    group.finish();
}

criterion_group!(benches, bench_udp_request, bench_tcp_request);
criterion_main!(benches);
