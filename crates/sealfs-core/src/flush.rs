//! Two-phase flush: journal pre-images, re-key from the leaves up, commit.
//!
//! Prepare captures the on-disk image of every node about to be rewritten
//! (metadata first) in the recovery journal and makes it durable. Commit
//! then raises the metadata update flag on disk, rewrites every dirty node
//! with freshly derived keys, rewrites the metadata with the flag cleared,
//! and finally unlinks the journal. A crash at any point either leaves the
//! file byte-identical to its pre-flush state or leaves a complete journal
//! whose replay restores it.
//!
//! Failures split into two recoverable states: `FlushError` before any
//! ciphertext was regenerated (retry re-runs the whole flush) and
//! `WriteToDiskFailed` after (retry re-runs only the commit — the journal
//! on disk still holds the pre-images, and re-journaling at that point
//! would capture partially written post-images).

use sealfs_crypto::{aead_encrypt, Key128, EMPTY_IV};
use sealfs_error::{FileStatus, Result, SealError};
use sealfs_types::address::{
    data_slot_in_mht, mht_of_data, mht_slot_in_parent, parent_of_mht, physical_of_mht,
    role_of_physical, NodeRole,
};
use sealfs_types::{
    MetaPlain, NodeNumber, RecoveryRecord, META_ENCRYPTED_SIZE, META_PLAIN_SIZE, NODE_SIZE,
    RECOVERY_RECORD_SIZE,
};
use sealfs_vfs::{Vfs, VfsFile};
use tracing::{debug, warn};
use zeroize::Zeroize;

use crate::file::{FileInner, KeyPolicy};
use crate::node::NodePayload;

impl<V: Vfs> FileInner<V> {
    /// Run the full two-phase flush.
    ///
    /// `sync` pushes the commit to stable storage; eviction-triggered
    /// flushes pass `false` and inherit the host's buffering.
    pub(crate) fn internal_flush(&mut self, sync: bool) -> Result<()> {
        if !self.need_writing {
            if sync {
                self.host_mut()?.sync()?;
            }
            return Ok(());
        }

        // A previous attempt that failed mid-commit left staged
        // ciphertexts and a durable journal; only the commit is retried.
        if self.staged_meta.is_some() {
            return self.commit(sync);
        }

        let (dirty_data, dirty_mht) = self.build_dirty_closure()?;
        debug!(
            path = %self.path.display(),
            data_nodes = dirty_data.len(),
            mht_nodes = dirty_mht.len(),
            "flushing"
        );

        if self.real_file_size > 0 {
            if let Err(err) = self.write_recovery_journal(&dirty_data, &dirty_mht) {
                warn!(path = %self.path.display(), error = %err, "journal write failed");
                self.status = FileStatus::FlushError;
                return Err(err);
            }
            if let Err(err) = self.raise_update_flag() {
                warn!(path = %self.path.display(), error = %err, "update-flag write failed");
                self.status = FileStatus::FlushError;
                return Err(err);
            }
        }

        if let Err(err) = self.encrypt_dirty_nodes(&dirty_data, &dirty_mht) {
            // Key derivation or sealing failed with the journal already
            // durable; the file is unusable until reopened (and replayed).
            self.note_error(&err);
            self.status = FileStatus::CryptoError;
            return Err(err);
        }

        self.commit(sync)
    }

    /// Collect the dirty data nodes and mark every ancestor MHT dirty,
    /// fetching absent ancestors from disk.
    fn build_dirty_closure(&mut self) -> Result<(Vec<NodeNumber>, Vec<NodeNumber>)> {
        let dirty_data = self.cache.physicals_where(|n| n.dirty && !n.is_mht());

        for &physical in &dirty_data {
            let mut m = mht_of_data(self.data_index_of(physical));
            loop {
                self.ensure_mht_node(m)?;
                let node = self
                    .cache
                    .find_mut(physical_of_mht(m))
                    .expect("ancestor was just ensured");
                if node.dirty {
                    // An earlier walk already marked this chain to the root.
                    break;
                }
                node.dirty = true;
                if m == 0 {
                    break;
                }
                m = parent_of_mht(m);
            }
        }

        let dirty_mht = self.cache.physicals_where(|n| n.dirty && n.is_mht());
        Ok((dirty_data, dirty_mht))
    }

    /// Prepare phase: append a pre-image record for every dirty node that
    /// already has an on-disk image (metadata node first), then sync.
    fn write_recovery_journal(
        &mut self,
        dirty_data: &[NodeNumber],
        dirty_mht: &[NodeNumber],
    ) -> Result<()> {
        let mut journal = self.vfs.create_recovery(&self.recovery_path)?;
        let mut offset = 0_u64;

        let meta_record = RecoveryRecord {
            physical_node_number: 0,
            bytes: self.meta_disk_image.clone(),
        };
        journal.write_at(&meta_record.encode(), offset)?;
        offset += RECOVERY_RECORD_SIZE as u64;

        for physical in dirty_data.iter().chain(dirty_mht.iter()) {
            let node = self.cache.find(*physical).expect("dirty node is resident");
            if !node.on_disk {
                continue;
            }
            let record = RecoveryRecord {
                physical_node_number: physical.get(),
                bytes: node.cipher.clone(),
            };
            journal.write_at(&record.encode(), offset)?;
            offset += RECOVERY_RECORD_SIZE as u64;
        }

        journal.sync()?;
        journal.close()?;
        debug!(path = %self.recovery_path.display(), bytes = offset, "journal durable");
        Ok(())
    }

    /// Write the on-disk metadata node with the update flag raised.
    fn raise_update_flag(&mut self) -> Result<()> {
        let mut image = self.meta_disk_image.clone();
        let mut plain = MetaPlain::decode(&image);
        plain.update_flag = 1;
        plain.encode(&mut image);
        self.host_mut()?
            .write_at(&image[..], NodeNumber::METADATA.byte_offset())
    }

    /// Re-encrypt every dirty node, leaves first, and stage the re-sealed
    /// metadata node.
    fn encrypt_dirty_nodes(
        &mut self,
        dirty_data: &[NodeNumber],
        dirty_mht: &[NodeNumber],
    ) -> Result<()> {
        // Data nodes: fresh key, seal, store (key, gmac) in the parent MHT.
        for &physical in dirty_data {
            let key = self
                .session
                .derive_node_key(self.platform.as_ref(), physical.get())?;

            let node = self.cache.find_mut(physical).expect("dirty node resident");
            let tag = match &node.payload {
                NodePayload::Data(plain) => {
                    aead_encrypt(key.as_bytes(), &EMPTY_IV, b"", &plain[..], &mut node.cipher[..])?
                }
                NodePayload::Mht(_) => unreachable!("data list holds only data nodes"),
            };
            let index = node.logical;

            let parent = self
                .cache
                .find_mut(physical_of_mht(mht_of_data(index)))
                .expect("parent MHT resident");
            let slot = parent.mht_mut().data_slot_mut(data_slot_in_mht(index));
            slot.key = *key.as_bytes();
            slot.gmac = tag;
        }

        // MHT nodes: deepest ordinals first so every child's slot is final
        // before its parent seals over it.
        let mut ordinals: Vec<u64> = dirty_mht
            .iter()
            .map(|p| match role_of_physical(*p) {
                NodeRole::Mht(m) => m,
                NodeRole::Metadata | NodeRole::Data(_) => {
                    unreachable!("MHT list holds only MHT nodes")
                }
            })
            .collect();
        ordinals.sort_unstable_by(|a, b| b.cmp(a));

        for m in ordinals {
            let physical = physical_of_mht(m);
            let key = self
                .session
                .derive_node_key(self.platform.as_ref(), physical.get())?;

            let node = self.cache.find_mut(physical).expect("dirty MHT resident");
            let mut plain_bytes = node.mht().to_bytes();
            let tag = aead_encrypt(
                key.as_bytes(),
                &EMPTY_IV,
                b"",
                &plain_bytes[..],
                &mut node.cipher[..],
            )?;
            plain_bytes.zeroize();

            if m == 0 {
                self.meta_encrypted.mht_key = *key.as_bytes();
                self.meta_encrypted.mht_gmac = tag;
            } else {
                let parent = self
                    .cache
                    .find_mut(physical_of_mht(parent_of_mht(m)))
                    .expect("parent MHT resident");
                let slot = parent.mht_mut().mht_slot_mut(mht_slot_in_parent(m));
                slot.key = *key.as_bytes();
                slot.gmac = tag;
            }
        }

        // Seal the metadata under a freshly derived key.
        let meta_key = match &self.key_policy {
            KeyPolicy::UserKdk(kdk) => {
                let (key, key_id) =
                    sealfs_crypto::fresh_metadata_key(kdk, self.platform.as_ref())?;
                self.meta_plain.meta_data_key_id = key_id;
                key
            }
            KeyPolicy::Auto => {
                let mut key_id = [0u8; 32];
                self.platform.fill_random(&mut key_id)?;
                let key = Key128::from_bytes(self.platform.sealing_key(&key_id)?);
                self.meta_plain.meta_data_key_id = key_id;
                key
            }
        };

        let mut enc_bytes = self.meta_encrypted.to_bytes();
        let mut staged = Box::new([0u8; NODE_SIZE]);
        let tag = aead_encrypt(
            meta_key.as_bytes(),
            &EMPTY_IV,
            b"",
            &enc_bytes[..],
            &mut staged[META_PLAIN_SIZE..META_PLAIN_SIZE + META_ENCRYPTED_SIZE],
        )?;
        enc_bytes.zeroize();

        self.meta_plain.meta_data_gmac = tag;
        self.meta_plain.update_flag = 0;
        self.meta_plain.encode(&mut staged);
        self.staged_meta = Some(staged);
        Ok(())
    }

    /// Commit phase: write every staged ciphertext, metadata last with the
    /// update flag cleared, sync, and unlink the journal.
    pub(crate) fn commit(&mut self, sync: bool) -> Result<()> {
        let result = self.commit_inner(sync);
        if let Err(err) = &result {
            warn!(path = %self.path.display(), error = %err, "commit failed; journal retained");
            self.last_error = err.error_code();
            self.status = FileStatus::WriteToDiskFailed;
        }
        result
    }

    fn commit_inner(&mut self, sync: bool) -> Result<()> {
        let dirty = self.cache.physicals_where(|n| n.dirty);
        let host = self.host.as_mut().ok_or(SealError::BadStatus {
            status: FileStatus::Closed,
        })?;

        let mut max_physical = 0_u64;
        for &physical in &dirty {
            let node = self.cache.find(physical).expect("dirty node resident");
            host.write_at(&node.cipher[..], physical.byte_offset())?;
            max_physical = max_physical.max(physical.get());
        }

        let staged = self
            .staged_meta
            .as_ref()
            .expect("encrypt phase staged the metadata node");
        host.write_at(&staged[..], NodeNumber::METADATA.byte_offset())?;
        if sync {
            host.sync()?;
        }

        // The new state is durable (or at least handed to the host); only
        // now may the in-memory bookkeeping move past the old images.
        self.meta_disk_image = self
            .staged_meta
            .take()
            .expect("staged metadata checked above");
        for &physical in &dirty {
            let node = self.cache.find_mut(physical).expect("dirty node resident");
            node.dirty = false;
            node.on_disk = true;
        }
        self.real_file_size = self
            .real_file_size
            .max((max_physical + 1) * NODE_SIZE as u64);
        self.need_writing = false;

        if self.vfs.exists(&self.recovery_path)? {
            let _ = self.vfs.remove(&self.recovery_path);
        }
        debug!(path = %self.path.display(), nodes = dirty.len() + 1, "flush committed");
        Ok(())
    }
}
