use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_postgres::{Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

async fn connect(host: &str, port: u16, dbname: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(dbname)
        .user("parkline")
        .password("parkline");

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn fresh_db() -> String {
    format!("bench_{}", Ulid::new())
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
        println!("  {label}: no samples");
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

/// Submit a request, then end it: leave if a slot was granted, cancel otherwise.
/// Returns whether the request was allocated.
async fn park_and_leave(client: &tokio_postgres::Client, vehicle: &str, zone: i64) -> bool {
    let msgs = client
        .simple_query(&format!(
            "INSERT INTO requests (vehicle_id, zone_id) VALUES ('{vehicle}', {zone})"
        ))
        .await
        .unwrap();
    let row = msgs
        .iter()
        .find_map(|m| match m {
            SimpleQueryMessage::Row(r) => Some(r),
            _ => None,
        })
        .expect("submit returns a row");
    let id = row.get("request_id").expect("request id").to_string();
    let allocated = row.get("allocated") == Some("t");

    let table = if allocated { "occupancy" } else { "requests" };
    client
        .batch_execute(&format!("DELETE FROM {table} WHERE id = {id}"))
        .await
        .unwrap();
    allocated
}

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port, &fresh_db()).await;
    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let mut allocated = 0;
    let start = Instant::now();

    for i in 0..n {
        let t = Instant::now();
        if park_and_leave(&client, &format!("V{i}"), 1).await {
            allocated += 1;
        }
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!(
        "  {n} park/leave cycles ({allocated} allocated) in {:.2}s = {ops:.0} cycles/sec",
        elapsed.as_secs_f64()
    );
    print_latency("cycle latency", &mut latencies);
}

/// Many clients contend for the same facility.
async fn phase2_contended(host: &str, port: u16) {
    let db = fresh_db();
    let n_tasks = 10;
    let n_per_task = 200;
    let allocated = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let mut handles = Vec::new();
    for t in 0..n_tasks {
        let host = host.to_string();
        let db = db.clone();
        let allocated = allocated.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &db).await;
            for j in 0..n_per_task {
                let zone = (j % 3) as i64 + 1;
                if park_and_leave(&client, &format!("T{t}-{j}"), zone).await {
                    allocated.fetch_add(1, Ordering::Relaxed);
                }
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    println!(
        "  {n_tasks} tasks x {n_per_task} cycles = {total} total ({} allocated) in {:.2}s = {:.0} cycles/sec",
        allocated.load(Ordering::Relaxed),
        elapsed.as_secs_f64(),
        total as f64 / elapsed.as_secs_f64()
    );
}

async fn phase3_read_under_load(host: &str, port: u16) {
    let db = fresh_db();
    let stop = Arc::new(AtomicBool::new(false));

    let mut writer_handles = Vec::new();
    for w in 0..5 {
        let host = host.to_string();
        let db = db.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &db).await;
            let mut i = 0u64;
            while !stop.load(Ordering::Relaxed) {
                park_and_leave(&client, &format!("W{w}-{i}"), 1).await;
                if i % 50 == 0 {
                    let _ = client.batch_execute("ROLLBACK 3").await;
                }
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for r in 0..n_readers {
        let host = host.to_string();
        let db = db.clone();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &db).await;
            let query = if r % 2 == 0 {
                "SELECT * FROM zone_utilization"
            } else {
                "SELECT * FROM requests WHERE state = 'ALLOCATED'"
            };
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client.simple_query(query).await.unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }
    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("read latency", &mut all_latencies);
}

async fn phase4_connection_storm(host: &str, port: u16) {
    let n_conns = 50;
    let ops_per_conn = 10;
    let success = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let mut handles = Vec::new();
    for c in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &fresh_db()).await;
            for i in 0..ops_per_conn {
                park_and_leave(&client, &format!("C{c}-{i}"), 1).await;
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }
    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} cycles each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("PARKLINE_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("PARKLINE_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid PARKLINE_PORT");

    println!("=== parkline stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential park/leave throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] contended facility");
    phase2_contended(&host, port).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(&host, port).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port).await;

    println!("\n=== benchmark complete ===");
}
