//! End-to-end scenarios through the chain actor's public handle: a full
//! marketplace session, a fork fight, and recovery from disk.

use chain_store::service::Blockchain;
use chain_store::state::IntegrationKey;
use chain_types::transaction::{
    BrokerMetadata, BrokerRegistration, Commit, Integration, IntegrationOutput, IntegrationRef,
    Payment, PaymentOutput, SensorMetadata, SensorRegistration, Transaction,
};
use chain_types::{Block, Keypair, TransactionSet, MINING_REWARD};

fn broker_reg(owner: &Keypair, counter: u64, name: &str) -> BrokerRegistration {
    BrokerRegistration::new(
        owner,
        counter,
        BrokerMetadata {
            name: name.into(),
            endpoint: format!("tcp://{name}.example:9000"),
            extra_nodes: None,
            extra_literals: None,
        },
        0,
    )
    .unwrap()
}

fn sensor_reg(owner: &Keypair, counter: u64, name: &str, broker: &str) -> SensorRegistration {
    SensorRegistration::new(
        owner,
        counter,
        SensorMetadata {
            name: name.into(),
            cost_per_minute: 2,
            cost_per_kb: 1,
            integration_broker: broker.into(),
            extra_nodes: None,
            extra_literals: None,
        },
        0,
    )
    .unwrap()
}

#[tokio::test]
async fn test_full_marketplace_session() {
    let dir = tempfile::tempdir().unwrap();
    let miner = Keypair::generate();
    let broker_owner = Keypair::generate();
    let sensor_owner = Keypair::generate();
    let buyer = Keypair::generate();

    let (chain, _task) = Blockchain::open(dir.path()).await.unwrap();

    // Block 1: subsidy only, funds the miner.
    let genesis = chain.block(0).await.unwrap();
    let b1 = Block::debug_mine(&genesis, miner.public_key(), TransactionSet::default());
    chain.add_block(b1.clone()).await.unwrap();

    // Block 2: fund the buyer, register the broker.
    let mut txs = TransactionSet::default();
    txs.payments.push(
        Payment::new(
            &miner,
            1,
            vec![PaymentOutput {
                public_key: buyer.public_key(),
                amount: 30,
            }],
            0,
        )
        .unwrap(),
    );
    txs.broker_registrations
        .push(broker_reg(&broker_owner, 1, "hub"));
    let b2 = Block::debug_mine(&b1, miner.public_key(), txs);
    chain.add_block(b2.clone()).await.unwrap();
    assert_eq!(chain.balance(&buyer.public_key()).await.unwrap(), 30);
    assert!(chain.broker("hub").await.unwrap().is_some());

    // Block 3: register the sensor against the broker.
    let sensor = sensor_reg(&sensor_owner, 1, "temp-1", "hub");
    let sensor_hash = sensor.hash_to_sign();
    let mut txs = TransactionSet::default();
    txs.sensor_registrations.push(sensor);
    let b3 = Block::debug_mine(&b2, miner.public_key(), txs);
    chain.add_block(b3.clone()).await.unwrap();

    // Block 4: the buyer opens an integration pinned to both hashes.
    let broker_hash = chain.broker("hub").await.unwrap().unwrap().hash_to_sign();
    let mut txs = TransactionSet::default();
    txs.integrations.push(
        Integration::new(
            &buyer,
            1,
            vec![IntegrationOutput {
                amount: 20,
                sensor_name: "temp-1".into(),
                sensor_hash,
                broker_hash,
            }],
            1,
            0,
        )
        .unwrap(),
    );
    let b4 = Block::debug_mine(&b3, miner.public_key(), txs);
    chain.add_block(b4.clone()).await.unwrap();
    assert_eq!(chain.balance(&buyer.public_key()).await.unwrap(), 10);

    let key = IntegrationKey {
        input: buyer.public_key(),
        counter: 1,
    };
    let expanded = chain.integration(key.clone()).await.unwrap().unwrap();
    assert_eq!(expanded.witnesses.len(), 1);
    assert!(expanded.witnesses.contains_key("hub"));

    // Block 5: the sole witness attests; majority of one releases escrow.
    let mut txs = TransactionSet::default();
    txs.commits.push(
        Commit::new(
            &broker_owner,
            "hub",
            IntegrationRef {
                input: buyer.public_key(),
                counter: 1,
            },
        )
        .unwrap(),
    );
    let b5 = Block::debug_mine(&b4, miner.public_key(), txs);
    chain.add_block(b5).await.unwrap();
    assert_eq!(chain.balance(&buyer.public_key()).await.unwrap(), 30);
    let expanded = chain.integration(key).await.unwrap().unwrap();
    assert_eq!(expanded.compensation_count, 1);
    assert!(expanded.witnesses["hub"]);
}

#[tokio::test]
async fn test_reorg_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let miner_a = Keypair::generate();
    let miner_b = Keypair::generate();

    let genesis = Block::genesis();
    let a1 = Block::debug_mine(&genesis, miner_a.public_key(), TransactionSet::default());
    let b1 = Block::debug_mine(&genesis, miner_b.public_key(), TransactionSet::default());
    let b2 = Block::debug_mine(&b1, miner_b.public_key(), TransactionSet::default());

    {
        let (chain, _task) = Blockchain::open(dir.path()).await.unwrap();
        chain.add_block(a1).await.unwrap();
        chain
            .replace_chain(1, vec![b1.clone(), b2.clone()])
            .await
            .unwrap();
        assert_eq!(chain.length().await.unwrap(), 3);
    }

    // The reorganized chain, not the original branch, is what persists.
    let (chain, _task) = Blockchain::open(dir.path()).await.unwrap();
    assert_eq!(chain.length().await.unwrap(), 3);
    assert_eq!(chain.block(1).await.unwrap(), b1);
    assert_eq!(chain.block(2).await.unwrap(), b2);
    assert_eq!(chain.balance(&miner_a.public_key()).await.unwrap(), 0);
    assert_eq!(
        chain.balance(&miner_b.public_key()).await.unwrap(),
        2 * MINING_REWARD
    );
}

#[tokio::test]
async fn test_registry_listings() {
    let dir = tempfile::tempdir().unwrap();
    let miner = Keypair::generate();
    let owner = Keypair::generate();
    let (chain, _task) = Blockchain::open(dir.path()).await.unwrap();

    let genesis = chain.block(0).await.unwrap();
    let mut txs = TransactionSet::default();
    txs.broker_registrations.push(broker_reg(&owner, 1, "hub-a"));
    txs.broker_registrations.push(broker_reg(&owner, 2, "hub-b"));
    let b1 = Block::debug_mine(&genesis, miner.public_key(), txs);
    chain.add_block(b1).await.unwrap();

    let brokers = chain.brokers().await.unwrap();
    assert_eq!(brokers.len(), 2);
    assert!(brokers.contains_key("hub-a") && brokers.contains_key("hub-b"));
    assert!(chain.sensors().await.unwrap().is_empty());
}
