//! The ledger transition engine.
//!
//! [`apply_block`] replays one block against the ledger and either returns
//! the undo log for it or rolls back every partial mutation and reports
//! the first violation. Application order within a block is fixed by the
//! protocol: the mining subsidy first, then payments, integrations,
//! commits, broker registrations and sensor registrations. A transaction
//! that references a registry therefore sees it as of the start of the
//! block, never mid-block.

use chain_types::transaction::{
    BrokerRegistration, Commit, Integration, Payment, SensorRegistration, Transaction,
    TransactionSet,
};
use chain_types::{Block, VerifyError, MINING_REWARD};

use crate::state::{
    IntegrationExpanded, IntegrationKey, IntegrationOutputExtra, LedgerState, UndoLog, Wallet,
};

/// Why a block or transaction batch is not a valid state transition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpdateError {
    #[error(transparent)]
    Verify(#[from] VerifyError),

    #[error("block links to {actual} but the previous block's hash is {expected}")]
    BrokenLink { expected: String, actual: String },

    #[error("block declares difficulty {actual} but retargeting requires {expected}")]
    WrongDifficulty { expected: u32, actual: u32 },

    #[error("counter {counter} for {input} does not exceed committed counter {committed}")]
    CounterNotIncreasing {
        input: String,
        counter: u64,
        committed: u64,
    },

    #[error("{input} holds {available} but needs {needed} more")]
    InsufficientBalance {
        input: String,
        needed: u64,
        available: u64,
    },

    #[error("sensor '{0}' is not registered")]
    UnknownSensor(String),

    #[error("broker '{0}' is not registered")]
    UnknownBroker(String),

    #[error("pinned hash for sensor '{0}' does not match its current registration")]
    SensorHashMismatch(String),

    #[error("pinned hash for broker '{0}' does not match its current registration")]
    BrokerHashMismatch(String),

    #[error("no integration under ({input}, {counter})")]
    UnknownIntegration { input: String, counter: u64 },

    #[error("broker '{broker}' is not a witness of that integration")]
    NotAWitness { broker: String },

    #[error("broker '{broker}' already attested that integration")]
    AlreadyAttested { broker: String },

    #[error("commit signer does not own broker '{broker}'")]
    NotBrokerOwner { broker: String },

    #[error("name '{0}' is already registered to a different key")]
    NameTaken(String),
}

/// Apply `block` on top of `prev`. On success the ledger holds the new
/// state and the returned log undoes it; on failure the ledger is exactly
/// as before.
pub fn apply_block(
    state: &mut LedgerState,
    prev: &Block,
    block: &Block,
) -> Result<UndoLog, UpdateError> {
    block.verify()?;
    if block.last_hash != prev.hash {
        return Err(UpdateError::BrokenLink {
            expected: prev.hash.clone(),
            actual: block.last_hash.clone(),
        });
    }
    let expected = Block::adjust_difficulty(prev, block.timestamp);
    if block.difficulty != expected {
        return Err(UpdateError::WrongDifficulty {
            expected,
            actual: block.difficulty,
        });
    }

    let mut undo = UndoLog::default();
    let result = apply_batch(
        state,
        &mut undo,
        &block.reward,
        block.timestamp,
        block.payments.as_deref().unwrap_or_default(),
        block.integrations.as_deref().unwrap_or_default(),
        block.commits.as_deref().unwrap_or_default(),
        block.broker_registrations.as_deref().unwrap_or_default(),
        block.sensor_registrations.as_deref().unwrap_or_default(),
    );
    match result {
        Ok(()) => Ok(undo),
        Err(e) => {
            undo.undo(state);
            Err(e)
        }
    }
}

/// Dry-run a transaction batch as if it were the body of the next block.
/// The ledger is guaranteed untouched afterward. This is the miner's
/// question: can these transactions be included together right now?
pub fn would_be_valid(
    state: &mut LedgerState,
    reward: &str,
    timestamp: u64,
    txs: &TransactionSet,
) -> Result<(), UpdateError> {
    txs.verify_all()?;
    let mut undo = UndoLog::default();
    let result = apply_batch(
        state,
        &mut undo,
        reward,
        timestamp,
        &txs.payments,
        &txs.integrations,
        &txs.commits,
        &txs.broker_registrations,
        &txs.sensor_registrations,
    );
    undo.undo(state);
    result
}

#[allow(clippy::too_many_arguments)]
fn apply_batch(
    state: &mut LedgerState,
    undo: &mut UndoLog,
    reward: &str,
    timestamp: u64,
    payments: &[Payment],
    integrations: &[Integration],
    commits: &[Commit],
    broker_registrations: &[BrokerRegistration],
    sensor_registrations: &[SensorRegistration],
) -> Result<(), UpdateError> {
    credit(state, undo, reward, MINING_REWARD);
    for tx in payments {
        apply_payment(state, undo, reward, tx)?;
    }
    for tx in integrations {
        apply_integration(state, undo, reward, timestamp, tx)?;
    }
    for tx in commits {
        apply_commit(state, undo, tx)?;
    }
    for tx in broker_registrations {
        apply_broker_registration(state, undo, reward, tx)?;
    }
    for tx in sensor_registrations {
        apply_sensor_registration(state, undo, reward, tx)?;
    }
    Ok(())
}

fn credit(state: &mut LedgerState, undo: &mut UndoLog, key: &str, amount: u64) {
    let mut wallet = state.wallet(key);
    wallet.balance += amount;
    state.set_wallet(undo, key, wallet);
}

fn debit(
    state: &mut LedgerState,
    undo: &mut UndoLog,
    key: &str,
    amount: u64,
) -> Result<(), UpdateError> {
    let mut wallet = state.wallet(key);
    if wallet.balance < amount {
        return Err(UpdateError::InsufficientBalance {
            input: key.to_owned(),
            needed: amount,
            available: wallet.balance,
        });
    }
    wallet.balance -= amount;
    state.set_wallet(undo, key, wallet);
    Ok(())
}

/// Enforce the strictly-increasing counter rule and commit the new value.
fn bump_counter(
    state: &mut LedgerState,
    undo: &mut UndoLog,
    input: &str,
    counter: u64,
) -> Result<(), UpdateError> {
    let mut wallet = state.wallet(input);
    if counter <= wallet.counter {
        return Err(UpdateError::CounterNotIncreasing {
            input: input.to_owned(),
            counter,
            committed: wallet.counter,
        });
    }
    wallet.counter = counter;
    state.set_wallet(undo, input, wallet);
    Ok(())
}

fn apply_payment(
    state: &mut LedgerState,
    undo: &mut UndoLog,
    reward: &str,
    tx: &Payment,
) -> Result<(), UpdateError> {
    bump_counter(state, undo, &tx.input, tx.counter)?;
    debit(state, undo, &tx.input, tx.reward_amount)?;
    for output in &tx.outputs {
        debit(state, undo, &tx.input, output.amount)?;
    }
    for output in &tx.outputs {
        credit(state, undo, &output.public_key, output.amount);
    }
    credit(state, undo, reward, tx.reward_amount);
    Ok(())
}

fn apply_integration(
    state: &mut LedgerState,
    undo: &mut UndoLog,
    reward: &str,
    timestamp: u64,
    tx: &Integration,
) -> Result<(), UpdateError> {
    bump_counter(state, undo, &tx.input, tx.counter)?;

    // Resolve and pin every referenced sensor and its broker before any
    // funds move. The hashes the buyer saw must still be current.
    let mut outputs_extra = Vec::with_capacity(tx.outputs.len());
    for output in &tx.outputs {
        let sensor = state
            .sensors
            .get(&output.sensor_name)
            .ok_or_else(|| UpdateError::UnknownSensor(output.sensor_name.clone()))?;
        if sensor.hash_to_sign() != output.sensor_hash {
            return Err(UpdateError::SensorHashMismatch(output.sensor_name.clone()));
        }
        let broker_name = sensor.metadata.integration_broker.clone();
        let broker = state
            .brokers
            .get(&broker_name)
            .ok_or_else(|| UpdateError::UnknownBroker(broker_name.clone()))?;
        if broker.hash_to_sign() != output.broker_hash {
            return Err(UpdateError::BrokerHashMismatch(broker_name));
        }
        outputs_extra.push(IntegrationOutputExtra {
            broker: broker_name,
            cost_per_minute: sensor.metadata.cost_per_minute,
            cost_per_kb: sensor.metadata.cost_per_kb,
        });
    }

    debit(state, undo, &tx.input, tx.reward_amount)?;
    for output in &tx.outputs {
        debit(state, undo, &tx.input, output.amount)?;
    }
    credit(state, undo, reward, tx.reward_amount);

    let broker_names: Vec<String> = state.brokers.keys().cloned().collect();
    let witnesses = tx
        .choose_witnesses(&broker_names)?
        .into_iter()
        .map(|name| (name, false))
        .collect();

    state.set_integration(
        undo,
        IntegrationKey {
            input: tx.input.clone(),
            counter: tx.counter,
        },
        IntegrationExpanded {
            tx: tx.clone(),
            start_time: timestamp,
            witnesses,
            compensation_count: 0,
            outputs_extra,
        },
    );
    Ok(())
}

fn apply_commit(
    state: &mut LedgerState,
    undo: &mut UndoLog,
    tx: &Commit,
) -> Result<(), UpdateError> {
    let broker = state
        .brokers
        .get(&tx.broker_name)
        .ok_or_else(|| UpdateError::UnknownBroker(tx.broker_name.clone()))?;
    if broker.input != tx.input {
        return Err(UpdateError::NotBrokerOwner {
            broker: tx.broker_name.clone(),
        });
    }

    let key = IntegrationKey {
        input: tx.integration.input.clone(),
        counter: tx.integration.counter,
    };
    let Some(integration) = state.integrations.get(&key) else {
        return Err(UpdateError::UnknownIntegration {
            input: key.input,
            counter: key.counter,
        });
    };
    match integration.witnesses.get(&tx.broker_name) {
        None => {
            return Err(UpdateError::NotAWitness {
                broker: tx.broker_name.clone(),
            });
        }
        Some(true) => {
            return Err(UpdateError::AlreadyAttested {
                broker: tx.broker_name.clone(),
            });
        }
        Some(false) => {}
    }

    let mut updated = integration.clone();
    updated.witnesses.insert(tx.broker_name.clone(), true);
    updated.compensation_count += 1;
    let released = updated.compensation_count == updated.majority_threshold();
    let escrow: u64 = updated.tx.outputs.iter().map(|o| o.amount).sum();
    let buyer = updated.tx.input.clone();
    state.set_integration(undo, key, updated);

    // Exactly one commit crosses the threshold; only that one pays out.
    if released {
        credit(state, undo, &buyer, escrow);
    }
    Ok(())
}

fn check_name_ownership(
    existing_input: Option<&str>,
    input: &str,
    name: &str,
) -> Result<(), UpdateError> {
    match existing_input {
        Some(owner) if owner != input => Err(UpdateError::NameTaken(name.to_owned())),
        _ => Ok(()),
    }
}

fn apply_broker_registration(
    state: &mut LedgerState,
    undo: &mut UndoLog,
    reward: &str,
    tx: &BrokerRegistration,
) -> Result<(), UpdateError> {
    bump_counter(state, undo, &tx.input, tx.counter)?;
    debit(state, undo, &tx.input, tx.reward_amount)?;
    credit(state, undo, reward, tx.reward_amount);

    let name = &tx.metadata.name;
    check_name_ownership(
        state.brokers.get(name).map(|b| b.input.as_str()),
        &tx.input,
        name,
    )?;
    state.set_broker(undo, name, tx.clone());
    Ok(())
}

fn apply_sensor_registration(
    state: &mut LedgerState,
    undo: &mut UndoLog,
    reward: &str,
    tx: &SensorRegistration,
) -> Result<(), UpdateError> {
    bump_counter(state, undo, &tx.input, tx.counter)?;
    debit(state, undo, &tx.input, tx.reward_amount)?;
    credit(state, undo, reward, tx.reward_amount);

    if !state
        .brokers
        .contains_key(&tx.metadata.integration_broker)
    {
        return Err(UpdateError::UnknownBroker(
            tx.metadata.integration_broker.clone(),
        ));
    }
    let name = &tx.metadata.name;
    check_name_ownership(
        state.sensors.get(name).map(|s| s.input.as_str()),
        &tx.input,
        name,
    )?;
    state.set_sensor(undo, name, tx.clone());
    Ok(())
}
