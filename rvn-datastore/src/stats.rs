//! Statistics collected by write and sweep operations.

/// Counters filled while the files of one snapshot are chunked and stored.
#[derive(Clone, Copy, Default)]
pub struct CommitStats {
    /// Number of versions created.
    pub file_count: usize,
    /// Sum of version sizes.
    pub size: u64,
    /// Bytes newly written to the blob store.
    pub stored_size: u64,
    /// Bytes satisfied by already stored blobs.
    pub reused_size: u64,

    pub chunk_count: usize,
    pub duplicate_chunks: usize,
}

impl CommitStats {
    pub fn record_chunk(&mut self, size: u64, duplicate: bool) {
        self.chunk_count += 1;
        if duplicate {
            self.duplicate_chunks += 1;
            self.reused_size += size;
        } else {
            self.stored_size += size;
        }
    }
}

impl std::fmt::Debug for CommitStats {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let avg = if self.chunk_count > 0 {
            (self.size as f64 / self.chunk_count as f64) as usize
        } else {
            0
        };
        let dedup_rate = if self.size > 0 {
            (self.reused_size * 100) / self.size
        } else {
            0
        };

        write!(
            f,
            "Files: {}, size: {}, average chunk size: {}, stored: {}, deduplicated: {}%",
            self.file_count, self.size, avg, self.stored_size, dedup_rate
        )
    }
}

/// Result of sweeping unreferenced blobs.
#[derive(Clone, Copy, Default)]
pub struct CleanStatus {
    /// Number of removed blob files.
    pub removed_blobs: usize,
    /// Sum of removed bytes.
    pub removed_bytes: u64,
    /// Blobs still referenced and kept on disk.
    pub disk_blobs: usize,
    /// Bytes still used on disk.
    pub disk_bytes: u64,
}

impl std::fmt::Debug for CleanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Removed blobs: {}, removed bytes: {}, disk blobs: {}, disk bytes: {}",
            self.removed_blobs, self.removed_bytes, self.disk_blobs, self.disk_bytes
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn commit_stats_track_dedup() {
        let mut stats = CommitStats {
            file_count: 2,
            size: 300,
            ..Default::default()
        };
        stats.record_chunk(100, false);
        stats.record_chunk(100, true);
        stats.record_chunk(100, true);

        assert_eq!(stats.chunk_count, 3);
        assert_eq!(stats.duplicate_chunks, 2);
        assert_eq!(stats.stored_size, 100);
        assert_eq!(stats.reused_size, 200);

        let text = format!("{:?}", stats);
        assert!(text.contains("deduplicated: 66%"));
    }

    #[test]
    fn debug_handles_empty_stats() {
        let text = format!("{:?}", CommitStats::default());
        assert!(text.contains("Files: 0"));
        assert!(format!("{:?}", CleanStatus::default()).contains("Removed blobs: 0"));
    }
}
