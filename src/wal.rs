use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};

use crate::model::Event;

/// Frame one event as `[u32 len][bincode payload][u32 crc32]`, little endian.
fn frame(event: &Event) -> io::Result<BytesMut> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut buf = BytesMut::with_capacity(payload.len() + 8);
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(&payload);
    buf.put_u32_le(crc32fast::hash(&payload));
    Ok(buf)
}

/// Append-only write-ahead log of booking events.
///
/// A crash can leave a partial record at the tail; replay stops at the first
/// record that is short or fails its checksum.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    /// Number of appends that succeed before writes start failing.
    #[cfg(test)]
    fail_after: Option<u64>,
}

/// Log position taken before a batch, used to undo it.
#[derive(Debug, Clone, Copy)]
pub struct WalMark {
    len: u64,
    appends: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            #[cfg(test)]
            fail_after: None,
        })
    }

    /// Append and fsync a single event.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer an event without syncing. Durable only after `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        let frame = frame(event)?;
        #[cfg(test)]
        if let Some(left) = self.fail_after {
            if left == 0 {
                // leave a torn frame behind, as a failed write_all can
                self.writer.write_all(&frame[..frame.len() / 2])?;
                return Err(io::Error::other("injected write failure"));
            }
            self.fail_after = Some(left - 1);
        }
        self.writer.write_all(&frame)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Make appends fail once `appends` more have succeeded. `None` heals the log.
    #[cfg(test)]
    pub fn fail_after(&mut self, appends: Option<u64>) {
        self.fail_after = appends;
    }

    /// Current committed position. Flushes anything still buffered first.
    pub fn mark(&mut self) -> io::Result<WalMark> {
        self.writer.flush()?;
        Ok(WalMark {
            len: self.writer.get_ref().metadata()?.len(),
            appends: self.appends_since_compact,
        })
    }

    /// Drop everything written after `mark`, buffered or on disk.
    pub fn rollback(&mut self, mark: WalMark) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // into_parts hands back the file without flushing the stale buffer
        let (stale_file, _) = stale.into_parts();
        stale_file.set_len(mark.len)?;
        stale_file.sync_all()?;
        self.appends_since_compact = mark.appends;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn compact_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write a replacement log next to the live one and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_path(path))?);
        for event in events {
            writer.write_all(&frame(event)?)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the replacement log over the live one and reopen for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_path(&self.path), &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Read every intact event from disk. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let data = match fs::read(path) {
            Ok(d) => d,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut buf = &data[..];
        let mut events = Vec::new();
        while buf.remaining() >= 4 {
            let len = buf.get_u32_le() as usize;
            if buf.remaining() < len + 4 {
                break; // truncated tail
            }
            let (payload, rest) = buf.split_at(len);
            buf = rest;
            if buf.get_u32_le() != crc32fast::hash(payload) {
                break;
            }
            match bincode::deserialize::<Event>(payload) {
                Ok(event) => events.push(event),
                Err(_) => break,
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Doctor, Patient, SlotStatus};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("medislot_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn doctor_event(name: &str) -> Event {
        Event::DoctorRegistered {
            doctor: Doctor {
                id: Ulid::new(),
                name: name.into(),
                department: Some("Cardiology".into()),
            },
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let events = vec![
            doctor_event("John Doe"),
            Event::PatientRegistered {
                patient: Patient {
                    id: Ulid::new(),
                    name: "Jane Smith".into(),
                    email: "patient@test.com".into(),
                },
            },
        ];

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_discards_truncated_tail() {
        let path = tmp_path("truncated.wal");
        let event = doctor_event("John Doe");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            // length prefix claiming 200 bytes, followed by only two
            f.write_all(&200u32.to_le_bytes()).unwrap();
            f.write_all(&[1, 2]).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_stops_at_bad_crc() {
        let path = tmp_path("bad_crc.wal");
        let good = doctor_event("John Doe");
        let bad = Event::SlotStatusChanged {
            id: Ulid::new(),
            doctor_id: Ulid::new(),
            status: SlotStatus::Booked,
        };
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
            let payload = bincode::serialize(&bad).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
            // an intact record after the corrupt one is not reached
            wal.append(&doctor_event("After")).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let path = tmp_path("missing.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn open_creates_parent_dir() {
        let dir = std::env::temp_dir()
            .join("medislot_test_wal")
            .join(Ulid::new().to_string());
        let path = dir.join("nested.wal");
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&doctor_event("Nested")).unwrap();
        assert_eq!(Wal::replay(&path).unwrap().len(), 1);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn compact_shrinks_and_accepts_appends() {
        let path = tmp_path("compact.wal");
        let keep = doctor_event("Kept");
        let later = doctor_event("Later");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&keep).unwrap();
            for i in 0..20 {
                wal.append(&doctor_event(&format!("churn {i}"))).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 21);
        }
        let before = fs::metadata(&path).unwrap().len();

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.compact(std::slice::from_ref(&keep)).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            wal.append(&later).unwrap();
        }

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted log should shrink: {after} < {before}");
        assert_eq!(Wal::replay(&path).unwrap(), vec![keep, later]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn rollback_discards_partial_batch() {
        let path = tmp_path("rollback.wal");
        let committed = doctor_event("Committed");
        let later = doctor_event("Later");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&committed).unwrap();

            let mark = wal.mark().unwrap();
            wal.fail_after(Some(1));
            wal.append_buffered(&doctor_event("Buffered")).unwrap();
            assert!(wal.append_buffered(&doctor_event("Torn")).is_err());
            wal.rollback(mark).unwrap();
            assert_eq!(wal.appends_since_compact(), 1);

            wal.fail_after(None);
            wal.append(&later).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![committed, later]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn buffered_appends_are_durable_after_flush() {
        let path = tmp_path("buffered.wal");
        let events: Vec<Event> = (0..5).map(|i| doctor_event(&format!("D{i}"))).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            wal.flush_sync().unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }
}
