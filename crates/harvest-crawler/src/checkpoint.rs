use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scrapable::Record;
use crate::session::{KnownKeys, ScrapeSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteMode {
    /// Replace the target, schema from the base columns and known keys
    Create,
    /// Add rows under the target's existing schema
    Append,
}

#[derive(Debug, Error)]
#[error("couldn't persist {count} record(s) to {target}: {source}")]
pub struct PersistenceError {
    pub target: String,
    pub count: usize,
    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync>,
}

/// Durable storage for scraped records.
pub trait Checkpoint: Send {
    fn persist(
        &mut self,
        records: &[Record],
        keys: &KnownKeys,
        mode: WriteMode,
    ) -> Result<(), PersistenceError>;
}

/// Drives a [`Checkpoint`] from a [`ScrapeSession`] cursor so every record is
/// written at most once by incremental saves.
pub struct Checkpointer<'a> {
    target: &'a mut dyn Checkpoint,
    keys: KnownKeys,
    created: bool,
}

impl<'a> Checkpointer<'a> {
    pub fn new(target: &'a mut dyn Checkpoint, keys: KnownKeys) -> Self {
        Self {
            target,
            keys,
            created: false,
        }
    }

    /// Writes the records past the session cursor. Failures are logged and
    /// left pending for the next call.
    pub fn save_pending(&mut self, session: &mut ScrapeSession) -> Result<(), PersistenceError> {
        let pending = session.pending();
        if pending.is_empty() {
            return Ok(());
        }
        let mode = if self.created {
            WriteMode::Append
        } else {
            WriteMode::Create
        };
        let count = pending.len();
        match self.target.persist(pending, &self.keys, mode) {
            Ok(()) => {
                self.created = true;
                session.mark_persisted(count);
                log::info!(
                    "Checkpoint: {count} record(s) saved ({} total)",
                    session.persisted()
                );
                Ok(())
            }
            Err(e) => {
                log::error!("Checkpoint failed, will retry at next save: {e}");
                Err(e)
            }
        }
    }

    /// Rewrites the target with every session record and the full schema.
    pub fn save_all(&mut self, session: &mut ScrapeSession) -> Result<(), PersistenceError> {
        if session.is_empty() {
            log::warn!("No records to save");
            return Ok(());
        }
        match self
            .target
            .persist(session.records(), &self.keys, WriteMode::Create)
        {
            Ok(()) => {
                self.created = true;
                session.mark_all_persisted();
                log::info!("Final save: {} record(s)", session.len());
                Ok(())
            }
            Err(e) => {
                let lost = session.len() - session.persisted();
                if lost > 0 {
                    log::error!("Final save failed, {lost} record(s) are lost: {e}");
                } else {
                    log::error!(
                        "Final save failed, the checkpoint file keeps all {} record(s): {e}",
                        session.persisted()
                    );
                }
                Err(e)
            }
        }
    }
}
