//! Seekable cache over a forward-only byte channel.

use std::io::{Read, Seek, SeekFrom, Write};

use anyhow::Error;

const FILL_CHUNK: usize = 64 * 1024;

/// Makes a forward-only channel randomly readable.
///
/// Bytes are spooled into an anonymous temporary file as the channel is
/// consumed; reads at already-seen offsets come from the spool without
/// touching the channel again, reads past its end consume more of the
/// channel first. Dropping the cache deletes the temporary file.
pub struct SeekableCache {
    source: Option<Box<dyn Read + Send>>,
    spool: std::fs::File,
    spooled: u64,
}

impl SeekableCache {
    pub fn new(source: Box<dyn Read + Send>) -> Result<Self, Error> {
        Ok(Self {
            source: Some(source),
            spool: tempfile::tempfile()?,
            spooled: 0,
        })
    }

    /// Bytes of the channel consumed so far.
    pub fn cached_len(&self) -> u64 {
        self.spooled
    }

    fn fill_to(&mut self, target: u64) -> Result<(), Error> {
        let mut buf = [0u8; FILL_CHUNK];

        while self.spooled < target {
            let source = match self.source.as_mut() {
                Some(source) => source,
                None => break,
            };

            let got = source.read(&mut buf)?;
            if got == 0 {
                self.source = None;
                break;
            }

            self.spool.seek(SeekFrom::Start(self.spooled))?;
            self.spool.write_all(&buf[..got])?;
            self.spooled += got as u64;
        }

        Ok(())
    }

    /// Read up to `buf.len()` bytes at `offset`. Returns the number of
    /// bytes copied; zero past the end of the channel.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, Error> {
        self.fill_to(offset.saturating_add(buf.len() as u64))?;

        if offset >= self.spooled {
            return Ok(0);
        }

        let available = (self.spooled - offset).min(buf.len() as u64) as usize;
        self.spool.seek(SeekFrom::Start(offset))?;

        let mut copied = 0;
        while copied < available {
            let got = self.spool.read(&mut buf[copied..available])?;
            if got == 0 {
                break;
            }
            copied += got;
        }
        Ok(copied)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// A reader that counts how many bytes were pulled from it and only
    /// hands out small fragments.
    struct CountingReader {
        data: Vec<u8>,
        pos: usize,
    }

    impl Read for CountingReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = (self.data.len() - self.pos).min(buf.len()).min(7);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn sequential_and_repeated_reads() {
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let mut cache = SeekableCache::new(Box::new(CountingReader {
            data: data.clone(),
            pos: 0,
        }))
        .unwrap();

        let mut buf = vec![0u8; 100];
        let got = cache.read_at(0, &mut buf).unwrap();
        assert_eq!(got, 100);
        assert_eq!(&buf[..], &data[..100]);

        // re-read of a cached range
        let got = cache.read_at(50, &mut buf).unwrap();
        assert_eq!(got, 100);
        assert_eq!(&buf[..], &data[50..150]);

        // far seek extends the spool
        let got = cache.read_at(900, &mut buf).unwrap();
        assert_eq!(got, 100);
        assert_eq!(&buf[..], &data[900..1000]);

        // past the end
        assert_eq!(cache.read_at(1000, &mut buf).unwrap(), 0);
        assert_eq!(cache.cached_len(), 1000);
    }

    #[test]
    fn short_reads_at_the_tail() {
        let mut cache = SeekableCache::new(Box::new(std::io::Cursor::new(b"tail".to_vec())))
            .unwrap();

        let mut buf = vec![0u8; 16];
        assert_eq!(cache.read_at(2, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"il");
    }

    #[test]
    fn empty_channel() {
        let mut cache =
            SeekableCache::new(Box::new(std::io::Cursor::new(Vec::new()))).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(cache.read_at(0, &mut buf).unwrap(), 0);
    }
}
