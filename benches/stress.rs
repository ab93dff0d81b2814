//! Load test against a running server.
//!
//! ```text
//! SLOTWISE_OPERATOR_TOKEN=bench cargo run --release &
//! SLOTWISE_OPERATOR_TOKEN=bench cargo bench --bench stress
//! ```
//!
//! The server's provider settings are overwritten: open every day around the
//! clock with 15-minute slots and no lead time.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};
use ulid::Ulid;

struct Conn {
    framed: Framed<TcpStream, LinesCodec>,
}

impl Conn {
    async fn open(host: &str, port: u16) -> Self {
        let stream = TcpStream::connect((host, port)).await.expect("connect failed");
        Self {
            framed: Framed::new(stream, LinesCodec::new()),
        }
    }

    async fn call(&mut self, req: Value) -> Value {
        self.framed.send(req.to_string()).await.expect("send failed");
        loop {
            let line = self
                .framed
                .next()
                .await
                .expect("server closed connection")
                .expect("read failed");
            let msg: Value = serde_json::from_str(&line).expect("bad json from server");
            if msg.get("ok").is_some() {
                return msg;
            }
        }
    }

    async fn operator(host: &str, port: u16, token: &str) -> Self {
        let mut c = Self::open(host, port).await;
        let reply = c.call(json!({ "op": "hello", "role": "operator", "token": token })).await;
        assert_eq!(reply["ok"], true, "operator hello failed: {reply}");
        c
    }

    async fn client(host: &str, port: u16, user: &str) -> Self {
        let mut c = Self::open(host, port).await;
        c.call(json!({ "op": "hello", "role": "client", "userId": user })).await;
        c
    }
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

/// Quarter-hour slot `n` counted from tomorrow 00:00 UTC.
fn slot(n: i64) -> DateTime<Utc> {
    let tomorrow = (Utc::now() + chrono::Duration::days(1)).date_naive();
    let midnight = tomorrow.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc();
    midnight + chrono::Duration::minutes(15 * n)
}

async fn setup(op: &mut Conn) -> String {
    let all_day = json!({ "enabled": true, "start": "00:00", "end": "24:00" });
    let settings = json!({
        "timezone": "UTC",
        "businessHours": {
            "mon": all_day, "tue": all_day, "wed": all_day, "thu": all_day,
            "fri": all_day, "sat": all_day, "sun": all_day
        },
        "slotIntervalMinutes": 15,
        "bookingMinLeadMinutes": 0,
        "bookingMaxDays": 366,
        "paymentsEnabled": false
    });
    let reply = op.call(json!({ "op": "put_settings", "settings": settings })).await;
    assert_eq!(reply["ok"], true, "put_settings failed: {reply}");
    let reply = op
        .call(json!({ "op": "put_service", "name": format!("bench-{}", Ulid::new()), "durationMin": 15 }))
        .await;
    reply["data"]["id"].as_str().expect("service id").to_string()
}

async fn phase1_sequential(host: &str, port: u16, service_id: &str) {
    let mut c = Conn::client(host, port, &format!("seq-{}", Ulid::new())).await;
    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let mut rejected = 0;
    let start = Instant::now();

    for i in 0..n {
        let t = Instant::now();
        let reply = c
            .call(json!({ "op": "book", "serviceId": service_id, "start": slot(i as i64) }))
            .await;
        latencies.push(t.elapsed());
        if reply["ok"] != true {
            rejected += 1;
        }
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!(
        "  {n} bookings in {:.2}s = {ops:.0} ops/sec ({rejected} rejected)",
        elapsed.as_secs_f64()
    );
    print_latency("write latency", &mut latencies);
}

/// Many clients race for the same slots: each slot must be won exactly once.
async fn phase2_contended(host: &str, port: u16, service_id: &str) {
    let n_tasks = 20;
    let n_slots = 100;
    let offset = 5000;

    let start = Instant::now();
    let mut handles = Vec::new();
    for t in 0..n_tasks {
        let host = host.to_string();
        let service_id = service_id.to_string();
        handles.push(tokio::spawn(async move {
            let mut c = Conn::client(&host, port, &format!("racer-{t}")).await;
            let mut won = 0u32;
            for s in 0..n_slots {
                let reply = c
                    .call(json!({ "op": "book", "serviceId": service_id, "start": slot(offset + s) }))
                    .await;
                if reply["ok"] == true {
                    won += 1;
                }
            }
            won
        }));
    }

    let mut total_won = 0;
    for h in handles {
        total_won += h.await.unwrap_or(0);
    }
    let elapsed = start.elapsed();
    let attempts = n_tasks * n_slots as usize;
    println!(
        "  {n_tasks} tasks x {n_slots} slots = {attempts} attempts in {:.2}s, {total_won} won",
        elapsed.as_secs_f64()
    );
    assert_eq!(total_won, n_slots as u32, "every contended slot must be booked exactly once");
}

async fn phase3_slots_under_load(host: &str, port: u16, service_id: &str) {
    let writer_host = host.to_string();
    let writer_service = service_id.to_string();
    let writer = tokio::spawn(async move {
        let mut c = Conn::client(&writer_host, port, "background-writer").await;
        for i in 0..1000 {
            c.call(json!({ "op": "book", "serviceId": writer_service, "start": slot(10_000 + i) }))
                .await;
        }
    });

    let mut reader = Conn::open(host, port).await;
    let day = slot(0).date_naive().to_string();
    let mut latencies = Vec::with_capacity(500);
    for _ in 0..500 {
        let t = Instant::now();
        let reply = reader
            .call(json!({ "op": "slots", "date": day, "serviceId": service_id }))
            .await;
        latencies.push(t.elapsed());
        assert_eq!(reply["ok"], true, "slots failed: {reply}");
    }
    let _ = writer.await;
    print_latency("slots latency under write load", &mut latencies);
}

async fn phase4_connection_storm(host: &str, port: u16) {
    let n = 200;
    let start = Instant::now();
    let mut handles = Vec::new();
    for i in 0..n {
        let host = host.to_string();
        handles.push(tokio::spawn(async move {
            let mut c = Conn::client(&host, port, &format!("storm-{i}")).await;
            c.call(json!({ "op": "list_services" })).await
        }));
    }
    let mut ok = 0;
    for h in handles {
        if let Ok(reply) = h.await
            && reply["ok"] == true
        {
            ok += 1;
        }
    }
    println!(
        "  {ok}/{n} connections served in {:.2}s",
        start.elapsed().as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("SLOTWISE_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("SLOTWISE_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(7433);
    let token = std::env::var("SLOTWISE_OPERATOR_TOKEN").unwrap_or_else(|_| "slotwise".into());

    println!("slotwise stress test against {host}:{port}");
    let mut op = Conn::operator(&host, port, &token).await;
    let service_id = setup(&mut op).await;

    println!("\nphase 1: sequential bookings");
    phase1_sequential(&host, port, &service_id).await;
    println!("\nphase 2: contended bookings");
    phase2_contended(&host, port, &service_id).await;
    println!("\nphase 3: slot queries under write load");
    phase3_slots_under_load(&host, port, &service_id).await;
    println!("\nphase 4: connection storm");
    phase4_connection_storm(&host, port).await;
}
