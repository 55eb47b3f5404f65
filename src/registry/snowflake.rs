use std::sync::{Mutex, PoisonError};

use thiserror::Error;
use time::OffsetDateTime;

const WORKER_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;

/// Largest worker id an [`IdGenerator`] accepts.
pub const MAX_WORKER_ID: u64 = (1 << WORKER_BITS) - 1;

/// Milliseconds since the Unix epoch at which generated timestamps start (2019-08-08 08:08:08 UTC).
pub const EPOCH_MS: u64 = 1_565_251_688_000;

#[derive(Debug, Error)]
pub enum IdError {
    #[error("worker id {0} exceeds {MAX_WORKER_ID}")]
    WorkerIdOutOfRange(u64),

    #[error("clock moved backwards by {0} ms")]
    ClockMovedBackwards(u64),
}

#[derive(Debug, Default)]
struct State {
    last_ms: u64,
    sequence: u64,
}

/// Snowflake id generator: 41 bits of milliseconds, 10 bits of worker id and
/// 12 bits of sequence.
///
/// Ids from one generator are strictly increasing. Generators with distinct
/// worker ids never produce the same id.
#[derive(Debug)]
pub struct IdGenerator {
    worker_id: u64,
    state: Mutex<State>,
}

impl IdGenerator {
    pub fn new(worker_id: u64) -> Result<Self, IdError> {
        if worker_id > MAX_WORKER_ID {
            return Err(IdError::WorkerIdOutOfRange(worker_id));
        }
        Ok(Self {
            worker_id,
            state: Mutex::new(State::default()),
        })
    }

    pub fn worker_id(&self) -> u64 {
        self.worker_id
    }

    /// Returns the next id.
    ///
    /// When the sequence for the current millisecond is exhausted the call
    /// waits for the clock to advance.
    pub fn next_id(&self) -> Result<u64, IdError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut now = current_ms();

        if now < state.last_ms {
            return Err(IdError::ClockMovedBackwards(state.last_ms - now));
        }

        if now == state.last_ms {
            state.sequence = (state.sequence + 1) & MAX_SEQUENCE;
            if state.sequence == 0 {
                while now <= state.last_ms {
                    std::thread::yield_now();
                    now = current_ms();
                }
            }
        } else {
            state.sequence = 0;
        }
        state.last_ms = now;

        let elapsed = now.saturating_sub(EPOCH_MS);
        Ok((elapsed << (WORKER_BITS + SEQUENCE_BITS))
            | (self.worker_id << SEQUENCE_BITS)
            | state.sequence)
    }

    /// Splits an id into (milliseconds since the Unix epoch, worker id, sequence).
    pub fn decompose(id: u64) -> (u64, u64, u64) {
        let ms = (id >> (WORKER_BITS + SEQUENCE_BITS)) + EPOCH_MS;
        let worker = (id >> SEQUENCE_BITS) & MAX_WORKER_ID;
        (ms, worker, id & MAX_SEQUENCE)
    }
}

fn current_ms() -> u64 {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
    u64::try_from(nanos / 1_000_000).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_increase_and_carry_worker() {
        let generator = IdGenerator::new(7).unwrap();
        let mut previous = 0;
        for _ in 0..10_000 {
            let id = generator.next_id().unwrap();
            assert!(id > previous);
            previous = id;
        }
        let (ms, worker, _) = IdGenerator::decompose(previous);
        assert_eq!(worker, 7);
        assert!(ms >= EPOCH_MS);
    }

    #[test]
    fn workers_do_not_collide() {
        let a = IdGenerator::new(1).unwrap();
        let b = IdGenerator::new(2).unwrap();
        let ids: std::collections::HashSet<u64> = (0..1000)
            .flat_map(|_| [a.next_id().unwrap(), b.next_id().unwrap()])
            .collect();
        assert_eq!(ids.len(), 2000);
    }

    #[test]
    fn rejects_large_worker_id() {
        assert!(IdGenerator::new(MAX_WORKER_ID).is_ok());
        assert!(matches!(
            IdGenerator::new(MAX_WORKER_ID + 1),
            Err(IdError::WorkerIdOutOfRange(1024))
        ));
    }
}
