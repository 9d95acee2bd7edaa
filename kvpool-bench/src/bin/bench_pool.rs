//! # Pool Contention Benchmark
//!
//! Purpose: Measure acquire/release throughput and wait behaviour of a pool
//! under thread contention, so regressions in the locking protocol show up
//! as numbers.
//!
//! ## Usage
//! ```text
//! bench_pool [threads] [iterations] [max_connections]
//! KVPOOL_CONFIG=kvpool.toml KVPOOL_POOL=token bench_pool 16 10000
//! ```
//! Without `KVPOOL_CONFIG` the pool talks to an in-process loopback
//! transport, which isolates pool overhead from network latency.

use std::env;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use kvpool_client::{
    ClientResult, ConnectError, ConnectOptions, Connector, PoolRegistry, PoolSettings,
    RegistryConfig, RespValue, Target, Transport,
};
use tracing::info;

const DEFAULT_THREADS: usize = 8;
const DEFAULT_ITERATIONS: usize = 10_000;
const DEFAULT_MAX_CONNECTIONS: usize = 4;
const LOOPBACK_POOL: &str = "loopback";

struct BenchConfig {
    threads: usize,
    iterations: usize,
    max_connections: usize,
}

impl BenchConfig {
    fn from_args() -> Self {
        let mut args = env::args().skip(1);
        BenchConfig {
            threads: parse_usize(args.next(), DEFAULT_THREADS).max(1),
            iterations: parse_usize(args.next(), DEFAULT_ITERATIONS),
            max_connections: parse_usize(args.next(), DEFAULT_MAX_CONNECTIONS).max(1),
        }
    }
}

fn parse_usize(value: Option<String>, fallback: usize) -> usize {
    value.and_then(|raw| raw.parse().ok()).unwrap_or(fallback)
}

/// Answers every command locally.
struct LoopbackTransport;

impl Transport for LoopbackTransport {
    fn exec(&mut self, args: &[&[u8]]) -> ClientResult<RespValue> {
        match args.first() {
            Some(&b"PING") => Ok(RespValue::Simple(b"PONG".to_vec())),
            _ => Ok(RespValue::Simple(b"OK".to_vec())),
        }
    }

    fn ping(&mut self) -> bool {
        true
    }
}

struct LoopbackConnector;

impl Connector for LoopbackConnector {
    fn connect(
        &self,
        _target: &Target,
        _options: &ConnectOptions,
    ) -> Result<Box<dyn Transport>, ConnectError> {
        Ok(Box::new(LoopbackTransport))
    }
}

fn build_registry(config: &BenchConfig) -> anyhow::Result<(PoolRegistry, String)> {
    if let Ok(path) = env::var("KVPOOL_CONFIG") {
        let pool = env::var("KVPOOL_POOL").context("KVPOOL_POOL must name a pool in KVPOOL_CONFIG")?;
        let registry = PoolRegistry::from_file(&path)
            .with_context(|| format!("loading pool configuration from {path}"))?;
        if registry.config().get(&pool).is_none() {
            bail!("pool `{pool}` is not defined in {path}");
        }
        return Ok((registry, pool));
    }

    let settings = PoolSettings {
        max_connections: config.max_connections,
        health_check: false,
        ..PoolSettings::default()
    };
    let registry = PoolRegistry::new(
        RegistryConfig::default().with_pool(LOOPBACK_POOL, settings),
        Arc::new(LoopbackConnector),
    );
    Ok((registry, LOOPBACK_POOL.to_string()))
}

fn report(label: &str, ops: usize, elapsed: Duration) {
    let secs = elapsed.as_secs_f64();
    let ops_per_sec = (ops as f64) / secs;
    let nanos_per_op = (secs * 1e9) / (ops as f64).max(1.0);
    println!(
        "{label}: {ops} ops in {secs:.3}s ({ops_per_sec:.0} ops/s, {nanos_per_op:.1} ns/op)"
    );
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run() {
        eprintln!("bench_pool failed: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let config = BenchConfig::from_args();
    let (registry, pool_name) = build_registry(&config)?;
    let registry = Arc::new(registry);

    info!(
        pool = %pool_name,
        threads = config.threads,
        iterations = config.iterations,
        "starting benchmark"
    );

    let barrier = Arc::new(Barrier::new(config.threads + 1));
    let workers: Vec<_> = (0..config.threads)
        .map(|_| {
            let registry = registry.clone();
            let barrier = barrier.clone();
            let pool_name = pool_name.clone();
            let iterations = config.iterations;
            thread::spawn(move || -> anyhow::Result<()> {
                barrier.wait();
                for _ in 0..iterations {
                    let mut lease = registry.lease(&pool_name)?;
                    lease.exec(&[b"PING"])?;
                }
                Ok(())
            })
        })
        .collect();

    barrier.wait();
    let start = Instant::now();
    for worker in workers {
        match worker.join() {
            Ok(result) => result?,
            Err(_) => bail!("benchmark worker panicked"),
        }
    }
    report("ACQUIRE+PING+RELEASE", config.threads * config.iterations, start.elapsed());

    let stats = registry
        .stats(&pool_name)
        .context("pool was never built")?;
    println!(
        "pool {}: total={} idle={} max={} opened={} waits={} timeouts={} mean_wait={:?}",
        stats.name,
        stats.total,
        stats.idle,
        stats.max_connections,
        stats.metrics.opened,
        stats.metrics.waits,
        stats.metrics.timeouts,
        stats.metrics.wait_latency.mean(),
    );

    registry.shutdown();
    Ok(())
}
