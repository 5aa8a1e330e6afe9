//! Request flow example: one guard protecting a small account service.
//!
//! Shows per-client rate limiting, cached balance queries that are
//! invalidated by writes, and a circuit breaker isolating a flaky
//! downstream dependency.
//!
//! Run with `RUST_LOG=service_guard=debug` to see the components' own logs.

use serde::{Deserialize, Serialize};
use service_guard::{
    Aggregate, CacheKey, CircuitBreakerConfig, Command, DomainEvent, Projection, Query,
    RecordedEvent, ServiceGuard,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Serialize, Deserialize)]
enum WalletEvent {
    Credited { amount: u64 },
    Debited { amount: u64 },
}

impl DomainEvent for WalletEvent {
    fn event_type(&self) -> &'static str {
        match self {
            WalletEvent::Credited { .. } => "WalletCredited",
            WalletEvent::Debited { .. } => "WalletDebited",
        }
    }
}

enum WalletCommand {
    Credit { wallet: String, amount: u64 },
    Debit { wallet: String, amount: u64 },
}

impl Command for WalletCommand {
    fn aggregate_id(&self) -> &str {
        match self {
            WalletCommand::Credit { wallet, .. } | WalletCommand::Debit { wallet, .. } => wallet,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("insufficient funds: balance {balance}, requested {requested}")]
struct InsufficientFunds {
    balance: u64,
    requested: u64,
}

#[derive(Default)]
struct Wallet {
    balance: u64,
}

impl Aggregate for Wallet {
    const SCOPE: &'static str = "wallet";
    type Command = WalletCommand;
    type Event = WalletEvent;
    type Error = InsufficientFunds;

    fn decide(&self, command: &WalletCommand) -> Result<Vec<WalletEvent>, InsufficientFunds> {
        match *command {
            WalletCommand::Credit { amount, .. } => Ok(vec![WalletEvent::Credited { amount }]),
            WalletCommand::Debit { amount, .. } if amount > self.balance => {
                Err(InsufficientFunds {
                    balance: self.balance,
                    requested: amount,
                })
            }
            WalletCommand::Debit { amount, .. } => Ok(vec![WalletEvent::Debited { amount }]),
        }
    }

    fn apply(&mut self, event: &WalletEvent) {
        match event {
            WalletEvent::Credited { amount } => self.balance += amount,
            WalletEvent::Debited { amount } => self.balance -= amount,
        }
    }
}

#[derive(Default)]
struct BalanceView {
    balance: u64,
}

impl Projection for BalanceView {
    type Event = WalletEvent;

    fn apply(&mut self, event: &RecordedEvent<WalletEvent>) {
        match event.payload {
            WalletEvent::Credited { amount } => self.balance += amount,
            WalletEvent::Debited { amount } => self.balance -= amount,
        }
    }
}

struct GetBalance(String);

impl Query for GetBalance {
    type Projection = BalanceView;
    type Output = u64;

    fn aggregate_id(&self) -> &str {
        &self.0
    }

    fn cache_key(&self) -> CacheKey {
        CacheKey::simple(Wallet::SCOPE, &self.0)
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(60)
    }

    fn project(&self, view: &BalanceView) -> u64 {
        view.balance
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let guard: ServiceGuard<u64> = ServiceGuard::builder()
        .with_rate_limit(5, Duration::from_secs(1))
        .with_circuit_breaker(CircuitBreakerConfig::new(2, Duration::from_millis(200))?)
        .with_sweep_interval(Duration::from_secs(5))
        .build()?;

    let store = guard.in_memory_event_store::<WalletEvent>();
    let commands = guard.command_handler::<Wallet, _>(Arc::clone(&store));
    let queries = guard.query_handler::<GetBalance, _>(store);

    println!("=== Request Flow Example ===\n");

    println!("Crediting wallet w-1 with 100 and reading its balance twice:");
    commands.handle(&WalletCommand::Credit {
        wallet: "w-1".into(),
        amount: 100,
    })?;
    for _ in 0..2 {
        println!("  balance = {}", queries.handle(&GetBalance("w-1".into()))?);
    }
    println!("  cache hits so far: {}\n", guard.metrics().cache_hits());

    println!("Debiting 30; the write invalidates the cached balance:");
    commands.handle(&WalletCommand::Debit {
        wallet: "w-1".into(),
        amount: 30,
    })?;
    println!("  balance = {}\n", queries.handle(&GetBalance("w-1".into()))?);

    println!("Debiting 500 is rejected by the aggregate:");
    if let Err(err) = commands.handle(&WalletCommand::Debit {
        wallet: "w-1".into(),
        amount: 500,
    }) {
        println!("  {}\n", err);
    }

    println!("Client 'burst' sends 8 requests at once (limit 5 per second):");
    for i in 1..=8 {
        match guard.admit("burst") {
            Ok(()) => println!("  request {} admitted", i),
            Err(err) => println!("  request {} rejected, retry after {:?}", i, err.retry_after),
        }
    }
    println!();

    println!("Calling a flaky pricing service through its breaker:");
    let attempts = AtomicUsize::new(0);
    let pricing = guard.breaker("pricing");
    for i in 1..=4 {
        let result = pricing
            .execute(|| async {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err("pricing service unavailable")
                } else {
                    Ok(42)
                }
            })
            .await;
        println!("  call {}: {:?} (circuit {:?})", i, result, pricing.state());
    }

    println!("  waiting out the cool-down...");
    tokio::time::sleep(Duration::from_millis(250)).await;
    let result = pricing.execute(|| async { Ok::<_, &str>(42) }).await;
    println!("  trial call: {:?} (circuit {:?})", result, pricing.state());

    let snapshot = guard.metrics().snapshot();
    println!("\n=== Example Complete ===");
    println!(
        "admitted {}, rejected {}, cache hit rate {:.0}%, circuit trips {}",
        snapshot.requests_allowed,
        snapshot.requests_rejected,
        snapshot.cache_hit_rate() * 100.0,
        snapshot.circuit_trips
    );

    guard.shutdown().await?;
    Ok(())
}
