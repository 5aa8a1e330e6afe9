//! End-to-end request handling: admission, cached reads, protected
//! dependency calls and event-sourced writes through one guard.

mod common;

use common::{
    Account, AccountCommand, AccountError, AccountEvent, Balance, GetBalance, TestClock,
};
use service_guard::{
    CircuitBreakerConfig, CircuitBreakerError, CircuitState, CommandError, CommandHandler,
    InMemoryEventLog, QueryError, QueryHandler, RateLimitExceeded, ServiceGuard,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
enum RequestError {
    #[error(transparent)]
    RateLimited(#[from] RateLimitExceeded),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Command(#[from] CommandError<AccountError>),
    #[error("fraud check unavailable")]
    FraudCheck(#[from] CircuitBreakerError<&'static str>),
}

struct Service {
    guard: ServiceGuard<Balance>,
    commands: CommandHandler<Account, InMemoryEventLog<AccountEvent>>,
    queries: QueryHandler<GetBalance, InMemoryEventLog<AccountEvent>>,
    fraud_checks: AtomicUsize,
    fraud_check_up: AtomicBool,
}

impl Service {
    fn new(clock: &TestClock) -> Self {
        let guard = ServiceGuard::builder()
            .with_clock(clock.shared())
            .with_rate_limit(3, Duration::from_secs(1))
            .with_circuit_breaker(CircuitBreakerConfig::new(2, Duration::from_secs(10)).unwrap())
            .build()
            .unwrap();
        let store = guard.in_memory_event_store::<AccountEvent>();
        let commands = guard.command_handler::<Account, _>(Arc::clone(&store));
        let queries = guard.query_handler::<GetBalance, _>(store);

        Self {
            guard,
            commands,
            queries,
            fraud_checks: AtomicUsize::new(0),
            fraud_check_up: AtomicBool::new(true),
        }
    }

    fn balance(&self, client: &str, account: &str) -> Result<Balance, RequestError> {
        self.guard.admit(client)?;
        Ok(self.queries.handle(&GetBalance::new(account))?)
    }

    fn withdraw(&self, client: &str, account: &str, amount: u64) -> Result<(), RequestError> {
        self.guard.admit(client)?;
        self.guard.breaker("fraud-check").call(|| {
            self.fraud_checks.fetch_add(1, Ordering::SeqCst);
            if self.fraud_check_up.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err("connection refused")
            }
        })?;
        self.commands.handle(&AccountCommand::withdraw(account, amount))?;
        Ok(())
    }
}

fn seeded_service(clock: &TestClock) -> Service {
    let service = Service::new(clock);
    service
        .commands
        .handle(&AccountCommand::open("acct-1", "ada"))
        .unwrap();
    service
        .commands
        .handle(&AccountCommand::deposit("acct-1", 100))
        .unwrap();
    service
}

#[test]
fn test_happy_path() {
    let clock = TestClock::new();
    let service = seeded_service(&clock);

    assert_eq!(service.balance("client", "acct-1").unwrap().balance, 100);
    service.withdraw("client", "acct-1", 40).unwrap();
    assert_eq!(service.balance("client", "acct-1").unwrap().balance, 60);

    let metrics = service.guard.metrics().snapshot();
    assert_eq!(metrics.requests_allowed, 3);
    assert_eq!(metrics.events_appended, 3);
    assert_eq!(metrics.cache_invalidations, 1);
}

#[test]
fn test_rate_limited_client_never_reaches_store() {
    let clock = TestClock::new();
    let service = seeded_service(&clock);

    for _ in 0..3 {
        service.balance("noisy", "acct-1").unwrap();
    }
    let err = service.withdraw("noisy", "acct-1", 10).unwrap_err();
    assert!(matches!(err, RequestError::RateLimited(_)));
    assert_eq!(service.fraud_checks.load(Ordering::SeqCst), 0);

    // Other clients are unaffected
    service.withdraw("quiet", "acct-1", 10).unwrap();
    assert_eq!(service.balance("quiet", "acct-1").unwrap().balance, 90);
}

#[test]
fn test_open_circuit_blocks_writes_until_recovery() {
    let clock = TestClock::new();
    let service = seeded_service(&clock);
    service.fraud_check_up.store(false, Ordering::SeqCst);

    for _ in 0..2 {
        clock.advance(Duration::from_secs(1));
        let err = service.withdraw("client", "acct-1", 10).unwrap_err();
        assert!(matches!(
            err,
            RequestError::FraudCheck(CircuitBreakerError::Dependency(_))
        ));
    }
    assert_eq!(
        service.guard.breaker("fraud-check").state(),
        CircuitState::Open
    );

    clock.advance(Duration::from_secs(1));
    let err = service.withdraw("client", "acct-1", 10).unwrap_err();
    assert!(matches!(
        err,
        RequestError::FraudCheck(CircuitBreakerError::Open(_))
    ));
    assert_eq!(service.fraud_checks.load(Ordering::SeqCst), 2);

    // Reads do not depend on the fraud check
    assert_eq!(service.balance("client", "acct-1").unwrap().balance, 100);

    service.fraud_check_up.store(true, Ordering::SeqCst);
    clock.advance(Duration::from_secs(10));
    service.withdraw("client", "acct-1", 10).unwrap();
    assert_eq!(
        service.guard.breaker("fraud-check").state(),
        CircuitState::Closed
    );
    assert_eq!(service.balance("client", "acct-1").unwrap().balance, 90);
}
