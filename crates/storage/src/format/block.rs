//! Block files
//!
//! A block file holds the records of one insert batch of one partition,
//! appended back to back. The file has no header: every record is located
//! by the `(position, total size)` pair stored in its reference.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Append-only writer for one block file
#[derive(Debug)]
pub struct BlockWriter {
    out: BufWriter<File>,
    position: u64,
}

impl BlockWriter {
    /// Create (or truncate) a block file
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            out: BufWriter::new(file),
            position: 0,
        })
    }

    /// Append one encoded record, returning its position
    pub fn append(&mut self, record: &[u8]) -> io::Result<u64> {
        let position = self.position;
        self.out.write_all(record)?;
        self.position += record.len() as u64;
        Ok(position)
    }

    /// Offset the next record will start at
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Flush buffered bytes and close the file
    pub fn finish(mut self) -> io::Result<u64> {
        self.out.flush()?;
        Ok(self.position)
    }
}

/// One pending read in a coalesced pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest<T> {
    /// Record start
    pub position: u64,
    /// Record length
    pub len: u64,
    /// Caller tag handed back with the bytes
    pub tag: T,
}

/// Positioned reader with a reusable buffer
///
/// The buffer grows to the largest record read and is never shrunk, so a
/// pass over many small records performs no allocation after the first.
#[derive(Debug)]
pub struct BlockReader {
    file: File,
    buffer: Vec<u8>,
}

impl BlockReader {
    /// Open a block file for reading
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            file: File::open(path)?,
            buffer: Vec::new(),
        })
    }

    /// Read one record
    pub fn read_at(&mut self, position: u64, len: u64) -> io::Result<&[u8]> {
        let len = len as usize;
        if self.buffer.len() < len {
            self.buffer.resize(len, 0);
        }
        self.file.seek(SeekFrom::Start(position))?;
        self.file.read_exact(&mut self.buffer[..len])?;
        Ok(&self.buffer[..len])
    }

    /// Read many records in one pass ordered by file position
    ///
    /// `consume` is called once per request, in position order, with the
    /// record bytes or the error for that record. One failed read does not
    /// stop the pass.
    pub fn read_sorted<T, F>(&mut self, mut requests: Vec<ReadRequest<T>>, mut consume: F)
    where
        F: FnMut(T, io::Result<&[u8]>),
    {
        requests.sort_by_key(|r| r.position);
        for request in requests {
            let bytes = self.read_at(request.position, request.len);
            consume(request.tag, bytes);
        }
    }

    #[cfg(test)]
    fn buffer_capacity(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_append_tracks_positions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blk.dat");
        let mut writer = BlockWriter::create(&path).unwrap();
        assert_eq!(writer.append(b"abc").unwrap(), 0);
        assert_eq!(writer.append(b"defgh").unwrap(), 3);
        assert_eq!(writer.finish().unwrap(), 8);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 8);
    }

    #[test]
    fn test_read_at() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blk.dat");
        let mut writer = BlockWriter::create(&path).unwrap();
        writer.append(b"hello").unwrap();
        writer.append(b"world!").unwrap();
        writer.finish().unwrap();

        let mut reader = BlockReader::open(&path).unwrap();
        assert_eq!(reader.read_at(5, 6).unwrap(), b"world!");
        assert_eq!(reader.read_at(0, 5).unwrap(), b"hello");
        // Buffer keeps the largest size seen
        assert_eq!(reader.buffer_capacity(), 6);
    }

    #[test]
    fn test_read_sorted_visits_in_position_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blk.dat");
        let mut writer = BlockWriter::create(&path).unwrap();
        let positions: Vec<u64> = [b"aa", b"bb", b"cc"]
            .iter()
            .map(|r| writer.append(*r).unwrap())
            .collect();
        writer.finish().unwrap();

        let requests = vec![
            ReadRequest { position: positions[2], len: 2, tag: 'c' },
            ReadRequest { position: positions[0], len: 2, tag: 'a' },
            ReadRequest { position: positions[1], len: 2, tag: 'b' },
        ];
        let mut seen = Vec::new();
        let mut reader = BlockReader::open(&path).unwrap();
        reader.read_sorted(requests, |tag, bytes| {
            seen.push((tag, bytes.unwrap().to_vec()));
        });
        assert_eq!(
            seen,
            vec![('a', b"aa".to_vec()), ('b', b"bb".to_vec()), ('c', b"cc".to_vec())]
        );
    }

    #[test]
    fn test_read_past_end_is_per_record_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blk.dat");
        let mut writer = BlockWriter::create(&path).unwrap();
        writer.append(b"abc").unwrap();
        writer.finish().unwrap();

        let requests = vec![
            ReadRequest { position: 0, len: 3, tag: 0 },
            ReadRequest { position: 2, len: 10, tag: 1 },
        ];
        let mut ok = 0;
        let mut failed = 0;
        BlockReader::open(&path).unwrap().read_sorted(requests, |_, bytes| match bytes {
            Ok(_) => ok += 1,
            Err(_) => failed += 1,
        });
        assert_eq!((ok, failed), (1, 1));
    }
}
