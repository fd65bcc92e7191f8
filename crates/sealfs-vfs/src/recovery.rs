//! Recovery journal replay.
//!
//! The journal is a flat concatenation of `(physical_node_number,
//! original_node_bytes)` records. Replay writes every pre-image back to its
//! node offset, syncs, and unlinks the journal. Applying the same journal
//! twice is a no-op with respect to the final state, so a crash during
//! replay is handled by simply replaying again on the next open.

use std::path::Path;

use sealfs_error::{Result, SealError};
use sealfs_types::{RecoveryRecord, NODE_SIZE, RECOVERY_RECORD_SIZE};
use tracing::{debug, warn};

use crate::traits::{Vfs, VfsFile};

/// Replay the journal at `recovery_path` onto the open data file.
///
/// A journal whose size is not a whole number of records is rejected as
/// corrupt without touching the data file.
pub fn replay_recovery<V: Vfs>(
    vfs: &V,
    data_file: &mut V::File,
    recovery_path: &Path,
) -> Result<()> {
    let mut journal = vfs.open_read(recovery_path)?;

    let size = journal.size()?;
    let record_size = RECOVERY_RECORD_SIZE as u64;
    if size % record_size != 0 {
        warn!(path = %recovery_path.display(), size, "recovery journal has bad granularity");
        return Err(SealError::RecoveryCorrupt { size });
    }
    let count = size / record_size;
    debug!(path = %recovery_path.display(), records = count, "replaying recovery journal");

    let mut raw = vec![0u8; RECOVERY_RECORD_SIZE];
    for i in 0..count {
        let n = journal.read_at(&mut raw, i * record_size)?;
        if n < RECOVERY_RECORD_SIZE {
            return Err(SealError::RecoveryCorrupt { size });
        }
        let record = RecoveryRecord::decode(&raw)?;
        data_file.write_at(
            &record.bytes[..],
            record.physical_node_number * NODE_SIZE as u64,
        )?;
    }

    data_file.sync()?;
    journal.close()?;
    vfs.remove(recovery_path)?;
    Ok(())
}
