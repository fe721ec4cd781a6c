//! OpenFlow channel debug log.
//!
//! When a datapath configures `ofchannel_log`, every emitted message is
//! appended to that file with an `i/N` index so a capture of one event's
//! message list reads in transmission order. The file opens on first use
//! and lives for the process; there is no rotation.

use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use once_cell::unsync::OnceCell;
use tracing::warn;

use faucet_of::OfMsg;

pub struct OfChannelLog {
    path: PathBuf,
    file: OnceCell<RefCell<File>>,
}

impl OfChannelLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            file: OnceCell::new(),
        }
    }

    fn open(&self) -> Option<&RefCell<File>> {
        let path = &self.path;
        self.file
            .get_or_try_init(|| {
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map(RefCell::new)
            })
            .map_err(|err| {
                warn!("cannot open ofchannel log {}: {}", path.display(), err);
                err
            })
            .ok()
    }

    /// Append one event's messages, indexed `i/N`.
    pub fn log(&self, dp_id: u64, ofmsgs: &[OfMsg]) {
        let Some(file) = self.open() else {
            return;
        };
        let mut file = file.borrow_mut();
        let total = ofmsgs.len();
        for (i, msg) in ofmsgs.iter().enumerate() {
            if let Err(err) = writeln!(file, "{}/{} {:#x} {:?}", i + 1, total, dp_id, msg) {
                warn!("ofchannel log write failed: {}", err);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faucet_of::messages::meterdel;

    #[test]
    fn test_log_appends_indexed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ofchannel.log");
        let log = OfChannelLog::new(path.clone());

        log.log(0x1, &[meterdel(), meterdel()]);
        log.log(0x1, &[meterdel()]);

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("1/2 0x1 "));
        assert!(lines[1].starts_with("2/2 0x1 "));
        assert!(lines[2].starts_with("1/1 0x1 "));
    }

    #[test]
    fn test_unopenable_path_is_nonfatal() {
        let log = OfChannelLog::new(PathBuf::from("/nonexistent-dir/ofchannel.log"));
        log.log(0x1, &[meterdel()]);
    }
}
