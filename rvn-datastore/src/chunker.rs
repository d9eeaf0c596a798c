//! Splitting file content into blobs.
//!
//! Two strategies are supported: fixed size blocks, and content defined
//! chunking with a Buzhash rolling hash (a rewrite of the *casync* chunker,
//! see the [Rolling Hash](https://en.wikipedia.org/wiki/Rolling_hash)
//! article for background). Content defined boundaries shift with insert
//! and delete edits, so unchanged regions reproduce identical blobs.

use std::io::Read;

use anyhow::{bail, Error};

use crate::blob::Blob;
use crate::error::RvnError;

/// Note: window size 32 or 64 is faster because we can speed up modulo
/// operations, but always computes hash 0 for constant data streams
/// .. 0,0,0,0,0,0 so the chunk boundary test must not use hash value 0 to
/// detect a boundary.
const CHUNKER_WINDOW_SIZE: usize = 64;

const READ_BUFFER_SIZE: usize = 64 * 1024;

const BUZHASH_TABLE: [u32; 256] = [
    0x458be752, 0xc10748cc, 0xfbbcdbb8, 0x6ded5b68, 0xb10a82b5, 0x20d75648, 0xdfc5665f, 0xa8428801,
    0x7ebf5191, 0x841135c7, 0x65cc53b3, 0x280a597c, 0x16f60255, 0xc78cbc3e, 0x294415f5, 0xb938d494,
    0xec85c4e6, 0xb7d33edc, 0xe549b544, 0xfdeda5aa, 0x882bf287, 0x3116737c, 0x05569956, 0xe8cc1f68,
    0x0806ac5e, 0x22a14443, 0x15297e10, 0x50d090e7, 0x4ba60f6f, 0xefd9f1a7, 0x5c5c885c, 0x82482f93,
    0x9bfd7c64, 0x0b3e7276, 0xf2688e77, 0x8fad8abc, 0xb0509568, 0xf1ada29f, 0xa53efdfe, 0xcb2b1d00,
    0xf2a9e986, 0x6463432b, 0x95094051, 0x5a223ad2, 0x9be8401b, 0x61e579cb, 0x1a556a14, 0x5840fdc2,
    0x9261ddf6, 0xcde002bb, 0x52432bb0, 0xbf17373e, 0x7b7c222f, 0x2955ed16, 0x9f10ca59, 0xe840c4c9,
    0xccabd806, 0x14543f34, 0x1462417a, 0x0d4a1f9c, 0x087ed925, 0xd7f8f24c, 0x7338c425, 0xcf86c8f5,
    0xb19165cd, 0x9891c393, 0x325384ac, 0x0308459d, 0x86141d7e, 0xc922116a, 0xe2ffa6b6, 0x53f52aed,
    0x2cd86197, 0xf5b9f498, 0xbf319c8f, 0xe0411fae, 0x977eb18c, 0xd8770976, 0x9833466a, 0xc674df7f,
    0x8c297d45, 0x8ca48d26, 0xc49ed8e2, 0x7344f874, 0x556f79c7, 0x6b25eaed, 0xa03e2b42, 0xf68f66a4,
    0x8e8b09a2, 0xf2e0e62a, 0x0d3a9806, 0x9729e493, 0x8c72b0fc, 0x160b94f6, 0x450e4d3d, 0x7a320e85,
    0xbef8f0e1, 0x21d73653, 0x4e3d977a, 0x1e7b3929, 0x1cc6c719, 0xbe478d53, 0x8d752809, 0xe6d8c2c6,
    0x275f0892, 0xc8acc273, 0x4cc21580, 0xecc4a617, 0xf5f7be70, 0xe795248a, 0x375a2fe9, 0x425570b6,
    0x8898dcf8, 0xdc2d97c4, 0x0106114b, 0x364dc22f, 0x1e0cad1f, 0xbe63803c, 0x5f69fac2, 0x4d5afa6f,
    0x1bc0dfb5, 0xfb273589, 0x0ea47f7b, 0x3c1c2b50, 0x21b2a932, 0x6b1223fd, 0x2fe706a8, 0xf9bd6ce2,
    0xa268e64e, 0xe987f486, 0x3eacf563, 0x1ca2018c, 0x65e18228, 0x2207360a, 0x57cf1715, 0x34c37d2b,
    0x1f8f3cde, 0x93b657cf, 0x31a019fd, 0xe69eb729, 0x8bca7b9b, 0x4c9d5bed, 0x277ebeaf, 0xe0d8f8ae,
    0xd150821c, 0x31381871, 0xafc3f1b0, 0x927db328, 0xe95effac, 0x305a47bd, 0x426ba35b, 0x1233af3f,
    0x686a5b83, 0x50e072e5, 0xd9d3bb2a, 0x8befc475, 0x487f0de6, 0xc88dff89, 0xbd664d5e, 0x971b5d18,
    0x63b14847, 0xd7d3c1ce, 0x7f583cf3, 0x72cbcb09, 0xc0d0a81c, 0x7fa3429b, 0xe9158a1b, 0x225ea19a,
    0xd8ca9ea3, 0xc763b282, 0xbb0c6341, 0x020b8293, 0xd4cd299d, 0x58cfa7f8, 0x91b4ee53, 0x37e4d140,
    0x95ec764c, 0x30f76b06, 0x5ee68d24, 0x679c8661, 0xa41979c2, 0xf2b61284, 0x4fac1475, 0x0adb49f9,
    0x19727a23, 0x15a7e374, 0xc43a18d5, 0x3fb1aa73, 0x342fc615, 0x924c0793, 0xbee2d7f0, 0x8a279de9,
    0x4aa2d70c, 0xe24dd37f, 0xbe862c0b, 0x177c22c2, 0x5388e5ee, 0xcd8a7510, 0xf901b4fd, 0xdbc13dbc,
    0x6c0bae5b, 0x64efe8c7, 0x48b02079, 0x80331a49, 0xca3d8ae6, 0xf3546190, 0xfed7108b, 0xc49b941b,
    0x32baf4a9, 0xeb833a4a, 0x88a3f1a5, 0x3a91ce0a, 0x3cc27da1, 0x7112e684, 0x4a3096b1, 0x3794574c,
    0xa3c8b6f3, 0x1d213941, 0x6e0a2e00, 0x233479f1, 0x0f4cd82f, 0x6093edd2, 0x5d7d209e, 0x464fe319,
    0xd4dcac9e, 0x0db845cb, 0xfb5e4bc3, 0xe0256ce1, 0x09fb4ed1, 0x0914be1e, 0xa5bdb2c3, 0xc6eb57bb,
    0x30320350, 0x3f397e91, 0xa67791bc, 0x86bc0e2c, 0xefa0a7e2, 0xe9ff7543, 0xe733612c, 0xd185897b,
    0x329e5388, 0x91dd236b, 0x2ecb0d93, 0xf4d82a3d, 0x35b5c03f, 0xe4e606f0, 0x05b21843, 0x37b45964,
    0x5eff22f4, 0x6027f4cc, 0x77178b3c, 0xae507131, 0x7bf7cabc, 0xf9c18d66, 0x593ade65, 0xd95ddf11,
];

/// Sliding window boundary scanner (Buzhash by cyclic polynomial).
struct BuzhashScanner {
    h: u32,
    window_size: usize,
    chunk_size: usize,

    chunk_size_min: usize,
    chunk_size_max: usize,

    break_test_mask: u32,
    break_test_minimum: u32,

    window: [u8; CHUNKER_WINDOW_SIZE],
}

impl BuzhashScanner {
    /// `chunk_size_avg` must be a power of two; chunks vary from avg/4 up
    /// to avg*4.
    fn new(chunk_size_avg: usize) -> Self {
        debug_assert_eq!(chunk_size_avg.count_ones(), 1);

        let break_test_mask = (chunk_size_avg * 2 - 1) as u32;
        let break_test_minimum = break_test_mask - 2;

        Self {
            h: 0,
            window_size: 0,
            chunk_size: 0,
            chunk_size_min: chunk_size_avg >> 2,
            chunk_size_max: chunk_size_avg << 2,
            break_test_mask,
            break_test_minimum,
            window: [0u8; CHUNKER_WINDOW_SIZE],
        }
    }

    /// Scan `data` for a chunk border. Returns 0 if none was found (call
    /// again with more data), otherwise the position of the border.
    fn scan(&mut self, data: &[u8]) -> usize {
        let window_len = self.window.len();
        let data_len = data.len();

        let mut pos = 0;

        if self.window_size < window_len {
            let need = window_len - self.window_size;
            let copy_len = if need < data_len { need } else { data_len };

            for _ in 0..copy_len {
                let byte = data[pos];
                self.window[self.window_size] = byte;
                self.h = self.h.rotate_left(1) ^ BUZHASH_TABLE[byte as usize];
                pos += 1;
                self.window_size += 1;
            }

            self.chunk_size += copy_len;

            if self.window_size < window_len {
                return 0;
            }
        }

        let mut idx = self.chunk_size & 0x3f;

        while pos < data_len {
            // roll window
            let enter = data[pos];
            let leave = self.window[idx];
            self.h = self.h.rotate_left(1)
                ^ BUZHASH_TABLE[leave as usize]
                ^ BUZHASH_TABLE[enter as usize];

            self.chunk_size += 1;
            pos += 1;

            self.window[idx] = enter;

            if self.shall_break() {
                self.h = 0;
                self.chunk_size = 0;
                self.window_size = 0;
                return pos;
            }

            idx = self.chunk_size & 0x3f;
        }

        0
    }

    // fast implementation avoiding modulo
    fn shall_break(&self) -> bool {
        if self.chunk_size >= self.chunk_size_max {
            return true;
        }

        if self.chunk_size < self.chunk_size_min {
            return false;
        }

        (self.h & self.break_test_mask) >= self.break_test_minimum
    }
}

/// A pure splitting strategy; [`chunks`](Chunker::chunks) maps a reader to
/// a lazy, finite, non restartable sequence of blobs whose concatenation
/// equals the original bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Chunker {
    FixedSize { block_size: u64 },
    ContentDefined { average_bits: u32 },
}

impl Chunker {
    pub fn fixed_size(block_size: u64) -> Result<Self, Error> {
        if block_size == 0 {
            bail!(RvnError::InvalidInput("block size must be positive".into()));
        }
        Ok(Chunker::FixedSize { block_size })
    }

    /// Content defined chunking with an average chunk size of
    /// `1 << average_bits` bytes (e.g. 22 -> ~4 MiB).
    pub fn content_defined(average_bits: u32) -> Result<Self, Error> {
        // avg/4 must still cover the scanner window, avg*4 must fit usize
        if !(8..=30).contains(&average_bits) {
            bail!(RvnError::InvalidInput(format!(
                "chunker average bits {} out of range (8..=30)",
                average_bits
            )));
        }
        Ok(Chunker::ContentDefined { average_bits })
    }

    pub fn chunks<R: Read>(&self, reader: R) -> Chunks<R> {
        let scanner = match self {
            Chunker::FixedSize { .. } => None,
            Chunker::ContentDefined { average_bits } => {
                Some(BuzhashScanner::new(1usize << average_bits))
            }
        };
        let block_size = match self {
            Chunker::FixedSize { block_size } => *block_size,
            Chunker::ContentDefined { .. } => 0,
        };
        Chunks {
            reader,
            scanner,
            block_size,
            buffer: Vec::new(),
            buffer_pos: 0,
            chunk: Vec::new(),
            eof: false,
            failed: false,
        }
    }
}

/// Lazy blob sequence produced by a [`Chunker`].
pub struct Chunks<R: Read> {
    reader: R,
    scanner: Option<BuzhashScanner>,
    block_size: u64,
    buffer: Vec<u8>,
    buffer_pos: usize,
    chunk: Vec<u8>,
    eof: bool,
    failed: bool,
}

impl<R: Read> Chunks<R> {
    fn fill_buffer(&mut self) -> Result<bool, Error> {
        if self.buffer_pos < self.buffer.len() {
            return Ok(true);
        }
        if self.eof {
            return Ok(false);
        }
        self.buffer.resize(READ_BUFFER_SIZE, 0);
        self.buffer_pos = 0;
        let got = self.reader.read(&mut self.buffer)?;
        self.buffer.truncate(got);
        if got == 0 {
            self.eof = true;
            return Ok(false);
        }
        Ok(true)
    }

    fn next_fixed(&mut self) -> Result<Option<Blob>, Error> {
        while (self.chunk.len() as u64) < self.block_size {
            if !self.fill_buffer()? {
                break;
            }
            let available = self.buffer.len() - self.buffer_pos;
            let want = (self.block_size - self.chunk.len() as u64).min(available as u64) as usize;
            self.chunk
                .extend_from_slice(&self.buffer[self.buffer_pos..self.buffer_pos + want]);
            self.buffer_pos += want;
        }

        if self.chunk.is_empty() {
            return Ok(None);
        }
        Ok(Some(Blob::from_data(std::mem::take(&mut self.chunk))))
    }

    fn next_content_defined(&mut self) -> Result<Option<Blob>, Error> {
        loop {
            if !self.fill_buffer()? {
                if self.chunk.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(Blob::from_data(std::mem::take(&mut self.chunk))));
            }

            let scanner = match self.scanner.as_mut() {
                Some(scanner) => scanner,
                None => bail!(RvnError::Internal("chunk scanner missing".into())),
            };

            let data = &self.buffer[self.buffer_pos..];
            let boundary = scanner.scan(data);
            if boundary == 0 {
                self.chunk.extend_from_slice(data);
                self.buffer_pos = self.buffer.len();
            } else {
                self.chunk.extend_from_slice(&data[..boundary]);
                self.buffer_pos += boundary;
                return Ok(Some(Blob::from_data(std::mem::take(&mut self.chunk))));
            }
        }
    }
}

impl<R: Read> Iterator for Chunks<R> {
    type Item = Result<Blob, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let result = if self.scanner.is_some() {
            self.next_content_defined()
        } else {
            self.next_fixed()
        };
        match result {
            Ok(Some(blob)) => Some(Ok(blob)),
            Ok(None) => None,
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::checksum::Checksum;

    fn collect(chunker: Chunker, data: &[u8]) -> Vec<Vec<u8>> {
        chunker
            .chunks(data)
            .map(|blob| {
                let blob = blob.unwrap();
                let mut bytes = Vec::new();
                blob.open().unwrap().read_to_end(&mut bytes).unwrap();
                bytes
            })
            .collect()
    }

    #[test]
    fn fixed_size_splits_evenly() {
        let chunker = Chunker::fixed_size(4).unwrap();
        let chunks = collect(chunker, b"abcdefghij");
        assert_eq!(chunks, vec![b"abcd".to_vec(), b"efgh".to_vec(), b"ij".to_vec()]);
    }

    #[test]
    fn empty_input_produces_no_blobs() {
        assert!(collect(Chunker::fixed_size(4).unwrap(), b"").is_empty());
        assert!(collect(Chunker::content_defined(12).unwrap(), b"").is_empty());
    }

    #[test]
    fn short_input_produces_one_blob() {
        let chunks = collect(Chunker::fixed_size(1 << 20).unwrap(), b"short");
        assert_eq!(chunks, vec![b"short".to_vec()]);
    }

    #[test]
    fn zero_block_size_is_rejected() {
        assert!(Chunker::fixed_size(0).is_err());
        assert!(Chunker::content_defined(4).is_err());
    }

    #[test]
    fn concatenation_reproduces_input() {
        let mut data = Vec::new();
        for i in 0u32..(64 * 1024) {
            for j in 0..4 {
                data.push(((i >> (j << 3)) & 0xff) as u8);
            }
        }

        for chunker in [
            Chunker::fixed_size(10_000).unwrap(),
            Chunker::content_defined(12).unwrap(),
        ] {
            let chunks = collect(chunker, &data);
            let joined: Vec<u8> = chunks.concat();
            assert_eq!(joined, data);
        }
    }

    #[test]
    fn content_defined_chunks_are_deterministic() {
        let mut data = Vec::new();
        for i in 0u32..(64 * 1024) {
            data.extend_from_slice(&i.to_le_bytes());
        }

        let chunker = Chunker::content_defined(12).unwrap();
        let first = collect(chunker, &data);
        let second = collect(chunker, &data);
        assert!(first.len() > 1);
        assert_eq!(first, second);
    }

    #[test]
    fn unchanged_tail_reproduces_identical_blobs() {
        let mut data = Vec::new();
        for i in 0u32..(256 * 1024) {
            data.extend_from_slice(&i.to_le_bytes());
        }

        // insert a few bytes near the front; the tail chunks must re-align
        let mut edited = data.clone();
        for (i, byte) in b"wedge".iter().enumerate() {
            edited.insert(100 + i, *byte);
        }

        let chunker = Chunker::content_defined(12).unwrap();
        let digests = |input: &[u8]| -> Vec<Checksum> {
            chunker
                .chunks(input)
                .map(|blob| blob.unwrap().checksum().unwrap())
                .collect()
        };

        let original = digests(&data);
        let modified = digests(&edited);

        let last = original.last().unwrap();
        assert!(modified.contains(last));
    }
}
