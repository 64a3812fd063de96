//! Atomic output writes and input offset advances
//!
//! A [`TransactionCoordinator`] owns one transactional producer identity.
//! Output records are staged locally and appended to the broker only when the
//! transaction commits, inside a broker transaction that also stores the
//! consumer offsets. A crash before the broker commit leaves neither the
//! records nor the offsets visible to read-committed consumers.

use crate::broker::{BrokerClient, OffsetCommit, ProducerId, TransactionOutcome};
use crate::error::{BrokerError, TransactionError};
use crate::record::{ProducerRecord, TopicPartition};
use crate::retry::{RetryConfig, RetryError, RetryHandle};
use std::collections::BTreeMap;
use tokio::sync::watch;
use tracing::{debug, info, instrument, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    Begun,
    Producing,
    Committing,
    Aborting,
}

/// The single live transaction of a coordinator
#[derive(Debug, Clone)]
pub struct Transaction {
    id: String,
    state: TransactionState,
    pending_writes: Vec<ProducerRecord>,
    input_offsets: BTreeMap<TopicPartition, i64>,
}

impl Transaction {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn pending_writes(&self) -> &[ProducerRecord] {
        &self.pending_writes
    }

    pub fn input_offsets(&self) -> &BTreeMap<TopicPartition, i64> {
        &self.input_offsets
    }
}

pub struct TransactionCoordinator<B: BrokerClient> {
    broker: B,
    producer: ProducerId,
    group_id: String,
    retry_config: RetryConfig,
    current: Option<Transaction>,
    completed: u64,
    /// Append sequence numbers are never reused within an epoch
    next_sequence: u64,
}

impl<B: BrokerClient> TransactionCoordinator<B> {
    /// Register `transactional_id` with the broker
    ///
    /// This bumps the identity's epoch, which fences any older instance and
    /// aborts whatever it left uncommitted.
    #[instrument(skip(broker, retry_config, shutdown))]
    pub async fn init(
        broker: B,
        transactional_id: &str,
        group_id: &str,
        retry_config: RetryConfig,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Self, TransactionError> {
        let mut retry = RetryHandle::from_config(retry_config.clone());
        let epoch = retry
            .retry_if(
                || broker.init_producer(transactional_id),
                BrokerError::is_transient,
                shutdown,
            )
            .await
            .map_err(to_transaction_error)?;

        info!(
            transactional_id = %transactional_id,
            epoch,
            "Transactional producer initialized"
        );

        Ok(Self {
            broker,
            producer: ProducerId {
                transactional_id: transactional_id.to_string(),
                epoch,
            },
            group_id: group_id.to_string(),
            retry_config,
            current: None,
            completed: 0,
            next_sequence: 0,
        })
    }

    pub fn producer_id(&self) -> &ProducerId {
        &self.producer
    }

    pub fn state(&self) -> TransactionState {
        self.current
            .as_ref()
            .map(|txn| txn.state)
            .unwrap_or(TransactionState::Idle)
    }

    pub fn current(&self) -> Option<&Transaction> {
        self.current.as_ref()
    }

    pub fn begin(&mut self) -> Result<(), TransactionError> {
        if let Some(txn) = &self.current {
            return Err(TransactionError::AlreadyActive(txn.id.clone()));
        }

        let id = format!(
            "{}-{}-{}",
            self.producer.transactional_id, self.producer.epoch, self.completed
        );
        trace!(transaction_id = %id, "Transaction begun");
        self.current = Some(Transaction {
            id,
            state: TransactionState::Begun,
            pending_writes: Vec::new(),
            input_offsets: BTreeMap::new(),
        });
        Ok(())
    }

    /// Stage an output record; it stays invisible until commit
    pub fn stage(&mut self, record: ProducerRecord) -> Result<(), TransactionError> {
        let txn = self.current.as_mut().ok_or(TransactionError::NotActive)?;
        txn.pending_writes.push(record);
        txn.state = TransactionState::Producing;
        Ok(())
    }

    /// Record the committed offset (next offset to read) for `tp`
    pub fn mark_input_offset(
        &mut self,
        tp: TopicPartition,
        offset: i64,
    ) -> Result<(), TransactionError> {
        let txn = self.current.as_mut().ok_or(TransactionError::NotActive)?;
        txn.input_offsets
            .entry(tp)
            .and_modify(|current| *current = (*current).max(offset))
            .or_insert(offset);
        Ok(())
    }

    /// Make every staged write and offset visible as one unit
    ///
    /// Transient broker failures are retried until `shutdown` is requested.
    /// Shutdown aborts the broker transaction and returns
    /// [`TransactionError::Interrupted`]. On any error the coordinator returns
    /// to `Idle` and nothing of the transaction is visible.
    pub async fn commit(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), TransactionError> {
        let mut txn = self.current.take().ok_or(TransactionError::NotActive)?;
        txn.state = TransactionState::Committing;

        let writes = std::mem::take(&mut txn.pending_writes);
        let write_count = writes.len();
        let mut retry = RetryHandle::from_config(self.retry_config.clone());

        for record in writes {
            let sequence = self.next_sequence;
            self.next_sequence += 1;
            let broker = &self.broker;
            let producer = &self.producer;
            retry.reset();
            let appended = retry
                .retry_if(
                    || broker.append(producer, sequence, record.clone()),
                    BrokerError::is_transient,
                    shutdown,
                )
                .await;

            if let Err(e) = appended {
                let err = to_transaction_error(e);
                warn!(
                    transaction_id = %txn.id,
                    sequence,
                    error = %err,
                    "Append failed, aborting transaction"
                );
                if !matches!(err, TransactionError::Fenced(_)) {
                    self.abort_on_broker().await;
                }
                self.completed += 1;
                return Err(err);
            }
        }

        let offsets = OffsetCommit {
            group_id: self.group_id.clone(),
            offsets: txn.input_offsets.clone(),
        };
        let broker = &self.broker;
        let producer = &self.producer;
        retry.reset();
        let ended = retry
            .retry_if(
                || broker.end_transaction(producer, TransactionOutcome::Commit, &offsets),
                BrokerError::is_transient,
                shutdown,
            )
            .await;
        self.completed += 1;

        match ended {
            Ok(()) => {
                debug!(
                    transaction_id = %txn.id,
                    writes = write_count,
                    offsets = ?txn.input_offsets,
                    "Transaction committed"
                );
                Ok(())
            }
            Err(e) => {
                let err = to_transaction_error(e);
                warn!(transaction_id = %txn.id, error = %err, "Transaction commit failed");
                if !matches!(err, TransactionError::Fenced(_)) {
                    self.abort_on_broker().await;
                }
                Err(err)
            }
        }
    }

    /// Discard staged writes without advancing any offset
    pub fn abort(&mut self) -> Result<(), TransactionError> {
        let mut txn = self.current.take().ok_or(TransactionError::NotActive)?;
        txn.state = TransactionState::Aborting;
        debug!(
            transaction_id = %txn.id,
            discarded = txn.pending_writes.len(),
            "Transaction aborted"
        );
        self.completed += 1;
        Ok(())
    }

    /// Best-effort abort with a bounded number of attempts
    ///
    /// Runs even after shutdown so a stopping worker leaves no open
    /// transaction behind.
    async fn abort_on_broker(&self) {
        let (_, mut uninterrupted) = watch::channel(false);
        let mut retry = RetryHandle::from_config(RetryConfig {
            max_retries: Some(3),
            ..self.retry_config.clone()
        });
        let broker = &self.broker;
        let producer = &self.producer;
        let offsets = OffsetCommit::default();
        if let Err(e) = retry
            .retry_if(
                || broker.end_transaction(producer, TransactionOutcome::Abort, &offsets),
                BrokerError::is_transient,
                &mut uninterrupted,
            )
            .await
        {
            // The next epoch bump aborts whatever is left open
            warn!(error = %e, "Failed to abort transaction on broker");
        }
    }
}

fn to_transaction_error(err: RetryError<BrokerError>) -> TransactionError {
    match err.into_inner() {
        Some(BrokerError::Fenced {
            identity,
            current,
            attempted,
        }) => TransactionError::Fenced(format!(
            "{} at epoch {} superseded by epoch {}",
            identity, attempted, current
        )),
        Some(BrokerError::InvalidTransactionState(msg)) => TransactionError::Fatal(msg),
        Some(other) => TransactionError::Aborted(other.to_string()),
        None => TransactionError::Interrupted,
    }
}
