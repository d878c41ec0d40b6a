// src/core/epoch_log.rs

//! Durable, append-only record mapping `epoch -> ordered node list`.
//!
//! One file per committed epoch, named by its zero-padded epoch number,
//! holding the storage roster committed at that epoch as concatenated
//! bincode-encoded [`NodeEntry`] records. Writes are atomic
//! (temp-file-then-rename), the same pattern `ClusterState::save_config`
//! uses for `nodes.conf` in the gossip-based sibling of this design.

use crate::core::node::NodeEntry;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Epoch file names are zero-padded to this width so that directory listings
/// sort the same way numeric comparison would.
const EPOCH_FILENAME_WIDTH: usize = 10;

#[derive(Debug, Clone, Copy, bincode::Encode, bincode::Decode)]
struct FormatInfo {
    ctime: u64,
    replication_factor: u32,
}

#[derive(Debug)]
pub struct EpochLog {
    dir: PathBuf,
}

impl EpochLog {
    /// Opens (and creates, if necessary) the epoch log directory.
    pub fn open(dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, epoch: u32) -> PathBuf {
        self.dir
            .join(format!("{epoch:0width$}.dat", width = EPOCH_FILENAME_WIDTH))
    }

    /// Atomically writes the node list committed at `epoch`. Overwriting an
    /// existing epoch is permitted (used by format). Per spec, a write
    /// failure is logged but never propagated as fatal -- the caller decides
    /// whether to retry.
    pub fn write(&self, epoch: u32, nodes: &[NodeEntry]) {
        if let Err(e) = self.try_write(epoch, nodes) {
            warn!("epoch log: failed to write epoch {}: {}", epoch, e);
        }
    }

    fn try_write(&self, epoch: u32, nodes: &[NodeEntry]) -> std::io::Result<()> {
        let bincode_config = bincode::config::standard();
        let mut buf = Vec::new();
        for node in nodes {
            bincode::encode_into_std_write(node, &mut buf, bincode_config).map_err(|e| {
                std::io::Error::other(format!("failed to encode epoch {epoch} node list: {e}"))
            })?;
        }

        let final_path = self.path_for(epoch);
        let temp_path = self.dir.join(format!(
            "{epoch:0width$}.tmp-{rand}",
            width = EPOCH_FILENAME_WIDTH,
            rand = rand::random::<u32>()
        ));
        std::fs::write(&temp_path, &buf)?;
        std::fs::rename(&temp_path, &final_path)?;
        debug!("epoch log: committed epoch {} with {} nodes", epoch, nodes.len());
        Ok(())
    }

    /// Reads the node list committed at `epoch` from the local log. Read
    /// failures (missing file, corrupt content) return `None` (`NoTag`),
    /// never an error -- the log's ordering is the source of truth, not its
    /// individual record integrity.
    pub fn read(&self, epoch: u32) -> Option<Vec<NodeEntry>> {
        let bytes = std::fs::read(self.path_for(epoch)).ok()?;
        decode_node_list(&bytes)
    }

    /// Deletes the committed node list for `epoch`. Used only by format.
    pub fn remove(&self, epoch: u32) {
        if let Err(e) = std::fs::remove_file(self.path_for(epoch)) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("epoch log: failed to remove epoch {}: {}", epoch, e);
            }
        }
    }

    /// Persists the `make-fs` stamp (ctime, replication-factor hint) so a
    /// restarted process can rebuild its `Join/Init` without having
    /// observed the original `VdiOp/Fin` in this run.
    pub fn write_format_info(&self, ctime: u64, replication_factor: u32) {
        if let Err(e) = self.try_write_format_info(ctime, replication_factor) {
            warn!("epoch log: failed to write format info: {}", e);
        }
    }

    fn try_write_format_info(&self, ctime: u64, replication_factor: u32) -> std::io::Result<()> {
        let info = FormatInfo {
            ctime,
            replication_factor,
        };
        let bytes = bincode::encode_to_vec(info, bincode::config::standard())
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        let final_path = self.dir.join("format.dat");
        let temp_path = self
            .dir
            .join(format!("format.tmp-{}", rand::random::<u32>()));
        std::fs::write(&temp_path, &bytes)?;
        std::fs::rename(&temp_path, &final_path)?;
        Ok(())
    }

    /// Reads back the `make-fs` stamp, if this node has ever formatted or
    /// joined a formatted cluster.
    pub fn read_format_info(&self) -> Option<(u64, u32)> {
        let bytes = std::fs::read(self.dir.join("format.dat")).ok()?;
        let (info, _): (FormatInfo, usize) =
            bincode::decode_from_slice(&bytes, bincode::config::standard()).ok()?;
        Some((info.ctime, info.replication_factor))
    }

    /// Returns the highest committed epoch, or `0` if the log is empty.
    pub fn latest(&self) -> u32 {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return 0;
        };
        entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name();
                let name = name.to_str()?;
                name.strip_suffix(".dat")?.parse::<u32>().ok()
            })
            .max()
            .unwrap_or(0)
    }
}

fn decode_node_list(bytes: &[u8]) -> Option<Vec<NodeEntry>> {
    let bincode_config = bincode::config::standard();
    let mut nodes = Vec::new();
    let mut offset = 0usize;
    while offset < bytes.len() {
        let (node, consumed): (NodeEntry, usize) =
            bincode::decode_from_slice(&bytes[offset..], bincode_config).ok()?;
        nodes.push(node);
        offset += consumed;
    }
    Some(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_nodes() -> Vec<NodeEntry> {
        vec![
            NodeEntry::new("10.0.0.1", 7000, 0, 128),
            NodeEntry::new("10.0.0.2", 7000, 1, 128),
        ]
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let log = EpochLog::open(dir.path()).unwrap();
        let nodes = sample_nodes();

        log.write(1, &nodes);
        assert_eq!(log.read(1), Some(nodes));
        assert_eq!(log.latest(), 1);
    }

    #[test]
    fn missing_epoch_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let log = EpochLog::open(dir.path()).unwrap();
        assert_eq!(log.read(7), None);
        assert_eq!(log.latest(), 0);
    }

    #[test]
    fn overwrite_is_permitted() {
        let dir = tempfile::tempdir().unwrap();
        let log = EpochLog::open(dir.path()).unwrap();
        log.write(1, &sample_nodes());
        log.write(1, &[]);
        assert_eq!(log.read(1), Some(vec![]));
    }

    #[test]
    fn remove_drops_the_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let log = EpochLog::open(dir.path()).unwrap();
        log.write(2, &sample_nodes());
        log.remove(2);
        assert_eq!(log.read(2), None);
    }

    #[test]
    fn latest_tracks_the_highest_committed_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let log = EpochLog::open(dir.path()).unwrap();
        log.write(1, &sample_nodes());
        log.write(5, &sample_nodes());
        log.write(3, &sample_nodes());
        assert_eq!(log.latest(), 5);
    }

    #[test]
    fn format_info_round_trips_and_does_not_confuse_latest() {
        let dir = tempfile::tempdir().unwrap();
        let log = EpochLog::open(dir.path()).unwrap();
        assert_eq!(log.read_format_info(), None);

        log.write_format_info(12345, 3);
        assert_eq!(log.read_format_info(), Some((12345, 3)));
        assert_eq!(log.latest(), 0);

        log.write(1, &sample_nodes());
        assert_eq!(log.latest(), 1);
        assert_eq!(log.read_format_info(), Some((12345, 3)));
    }
}
