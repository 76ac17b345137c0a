use std::io;
use std::io::{Read, Seek, SeekFrom};

/// Restricts an underlying Read+Seek to a fixed `[start, end)` byte range, so it can be
/// handed out as if it were its own independent file (e.g. a single entry sliced out of
/// a cache file that also holds a serialized policy header).
pub struct SeekSlice<T: Seek> {
    inner: T,
    start: u64,
    end: u64,
    current: u64,
}

impl<T: Seek> SeekSlice<T> {
    pub fn new(mut inner: T, start: u64, end: u64) -> std::io::Result<SeekSlice<T>> {
        assert!(end >= start);
        let current = inner.seek(SeekFrom::Start(start))?;
        Ok(SeekSlice {
            inner,
            start,
            end,
            current,
        })
    }
}

impl<T: Seek> Seek for SeekSlice<T> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let goal_idx = match pos {
            SeekFrom::Start(amount) => self.start.checked_add(amount),
            SeekFrom::End(amount) => add_signed(self.end, amount),
            SeekFrom::Current(amount) => add_signed(self.current, amount),
        }
        .ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek out of range")
        })?;
        if goal_idx < self.start || goal_idx > self.end {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative or overflowing position",
            ));
        }
        self.current = self.inner.seek(SeekFrom::Start(goal_idx))?;
        Ok(self.current - self.start)
    }
}

fn add_signed(base: u64, amount: i64) -> Option<u64> {
    if amount >= 0 {
        base.checked_add(amount as u64)
    } else {
        base.checked_sub((-amount) as u64)
    }
}

impl<T: Read + Seek> Read for SeekSlice<T> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let max_read = (self.end - self.current) as usize;
        let capped = max_read.min(buf.len());
        let amount = self.inner.read(&mut buf[..capped])?;
        self.current += amount as u64;
        Ok(amount)
    }
}

// could impl Write as well, but so far nothing needs it

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_seek_slice() {
        let buf: [u8; 10] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9];
        let cursor = Cursor::new(buf);
        let mut slice = SeekSlice::new(cursor, 2, 8).unwrap();

        let mut one = [0u8; 1];

        // starts at offset zero
        assert_eq!(slice.seek(SeekFrom::Current(0)).unwrap(), 0);
        // reading advances position as expected
        slice.read_exact(&mut one).unwrap();
        assert_eq!(one[0], 2);
        slice.read_exact(&mut one).unwrap();
        assert_eq!(one[0], 3);
        assert_eq!(slice.seek(SeekFrom::Current(0)).unwrap(), 2);
        slice.read_exact(&mut one).unwrap();
        assert_eq!(one[0], 4);

        // out of range seeks caught and have no effect
        assert!(slice.seek(SeekFrom::Current(-10)).is_err());
        assert!(slice.seek(SeekFrom::Current(10)).is_err());
        slice.read_exact(&mut one).unwrap();
        assert_eq!(one[0], 5);

        assert_eq!(slice.seek(SeekFrom::Start(1)).unwrap(), 1);
        slice.read_exact(&mut one).unwrap();
        assert_eq!(one[0], 1);

        assert_eq!(slice.seek(SeekFrom::End(-1)).unwrap(), 5);
        slice.read_exact(&mut one).unwrap();
        assert_eq!(one[0], 7);
        assert_eq!(slice.read(&mut one).unwrap(), 0);
    }
}
