//! Shared fixtures for integration tests.

#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use service_guard::{
    Aggregate, CacheKey, Clock, Command, DomainEvent, Projection, Query, RecordedEvent,
};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

/// Manually driven clock; clones share the same time.
#[derive(Debug, Clone)]
pub struct TestClock {
    current: Arc<Mutex<(Instant, SystemTime)>>,
}

impl TestClock {
    pub fn new() -> Self {
        Self {
            current: Arc::new(Mutex::new((Instant::now(), SystemTime::UNIX_EPOCH))),
        }
    }

    pub fn advance(&self, duration: Duration) {
        let mut current = self.current.lock().unwrap();
        current.0 += duration;
        current.1 += duration;
    }

    pub fn shared(&self) -> Arc<dyn Clock> {
        Arc::new(self.clone())
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.current.lock().unwrap().0
    }

    fn wall_clock(&self) -> SystemTime {
        self.current.lock().unwrap().1
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AccountEvent {
    Opened { owner: String },
    Deposited { amount: u64 },
    Withdrawn { amount: u64 },
}

impl DomainEvent for AccountEvent {
    fn event_type(&self) -> &'static str {
        match self {
            AccountEvent::Opened { .. } => "AccountOpened",
            AccountEvent::Deposited { .. } => "FundsDeposited",
            AccountEvent::Withdrawn { .. } => "FundsWithdrawn",
        }
    }
}

#[derive(Debug, Clone)]
pub enum AccountCommand {
    Open { id: String, owner: String },
    Deposit { id: String, amount: u64 },
    Withdraw { id: String, amount: u64 },
}

impl AccountCommand {
    pub fn open(id: &str, owner: &str) -> Self {
        AccountCommand::Open {
            id: id.to_string(),
            owner: owner.to_string(),
        }
    }

    pub fn deposit(id: &str, amount: u64) -> Self {
        AccountCommand::Deposit {
            id: id.to_string(),
            amount,
        }
    }

    pub fn withdraw(id: &str, amount: u64) -> Self {
        AccountCommand::Withdraw {
            id: id.to_string(),
            amount,
        }
    }
}

impl Command for AccountCommand {
    fn aggregate_id(&self) -> &str {
        match self {
            AccountCommand::Open { id, .. }
            | AccountCommand::Deposit { id, .. }
            | AccountCommand::Withdraw { id, .. } => id,
        }
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum AccountError {
    #[error("account already exists")]
    AlreadyOpen,
    #[error("account does not exist")]
    NotOpen,
    #[error("insufficient funds")]
    InsufficientFunds,
}

#[derive(Debug, Default)]
pub struct Account {
    open: bool,
    balance: u64,
}

impl Aggregate for Account {
    const SCOPE: &'static str = "account";
    type Command = AccountCommand;
    type Event = AccountEvent;
    type Error = AccountError;

    fn decide(&self, command: &AccountCommand) -> Result<Vec<AccountEvent>, AccountError> {
        match command {
            AccountCommand::Open { owner, .. } => {
                if self.open {
                    return Err(AccountError::AlreadyOpen);
                }
                Ok(vec![AccountEvent::Opened {
                    owner: owner.clone(),
                }])
            }
            _ if !self.open => Err(AccountError::NotOpen),
            AccountCommand::Deposit { amount, .. } => {
                Ok(vec![AccountEvent::Deposited { amount: *amount }])
            }
            AccountCommand::Withdraw { amount, .. } => {
                if *amount > self.balance {
                    return Err(AccountError::InsufficientFunds);
                }
                Ok(vec![AccountEvent::Withdrawn { amount: *amount }])
            }
        }
    }

    fn apply(&mut self, event: &AccountEvent) {
        match event {
            AccountEvent::Opened { .. } => self.open = true,
            AccountEvent::Deposited { amount } => self.balance += amount,
            AccountEvent::Withdrawn { amount } => self.balance -= amount,
        }
    }
}

#[derive(Debug, Default)]
pub struct AccountSummary {
    owner: String,
    balance: u64,
    version: u64,
}

impl Projection for AccountSummary {
    type Event = AccountEvent;

    fn apply(&mut self, event: &RecordedEvent<AccountEvent>) {
        match &event.payload {
            AccountEvent::Opened { owner } => self.owner = owner.clone(),
            AccountEvent::Deposited { amount } => self.balance += amount,
            AccountEvent::Withdrawn { amount } => self.balance -= amount,
        }
        self.version = event.sequence;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Balance {
    pub owner: String,
    pub balance: u64,
    pub version: u64,
}

pub struct GetBalance {
    pub account_id: String,
}

impl GetBalance {
    pub fn new(account_id: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
        }
    }
}

impl Query for GetBalance {
    type Projection = AccountSummary;
    type Output = Balance;

    fn aggregate_id(&self) -> &str {
        &self.account_id
    }

    fn cache_key(&self) -> CacheKey {
        CacheKey::builder(Account::SCOPE, &self.account_id)
            .field("view", "balance")
            .build()
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(30)
    }

    fn project(&self, view: &AccountSummary) -> Balance {
        Balance {
            owner: view.owner.clone(),
            balance: view.balance,
            version: view.version,
        }
    }
}
