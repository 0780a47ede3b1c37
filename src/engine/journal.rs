use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::time::UNIX_EPOCH;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::Hash32;
use crate::error::JournalError;

/// Bumped whenever the record layout changes; older journals are discarded.
const SCHEMA: u32 = 1;

/// What the journal remembers about one completed node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Canonical node key.
    pub key: String,
    /// Signature the node ran under.
    pub signature: Hash32,
    /// Digest of the result, as seen by dependents.
    pub stamp: Hash32,
    /// CBOR encoded output value.
    pub output: Vec<u8>,
    /// Artifact metadata for file nodes.
    pub file: Option<FileMeta>,
}

/// Cheap pre-check before re-hashing an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub len: u64,
    pub modified: u64,
}

impl FileMeta {
    pub fn read(path: &Utf8Path) -> std::io::Result<Self> {
        let meta = fs::metadata(path)?;
        let modified = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();

        Ok(Self {
            len: meta.len(),
            modified,
        })
    }
}

#[derive(Serialize, Deserialize)]
enum Record {
    Header { schema: u32 },
    Entry(Entry),
}

/// Persistent record of completed nodes across invocations.
///
/// On disk this is a header followed by a stream of CBOR records; a later
/// record for the same key wins. Opening the journal compacts it (atomically,
/// through a temporary file), and every completed node is appended and
/// flushed right away, so an interrupted build loses at most the entry being
/// written. A torn record at the end is ignored on the next open.
pub struct Journal {
    path: Utf8PathBuf,
    entries: HashMap<String, Entry>,
    writer: Option<BufWriter<File>>,
}

impl Journal {
    pub fn open(path: impl Into<Utf8PathBuf>) -> Result<Self, JournalError> {
        let path = path.into();
        let entries = if path.exists() {
            Self::load(&path).map_err(|e| JournalError::Io(path.clone(), e))?
        } else {
            HashMap::new()
        };

        tracing::debug!("Loaded {} journal entries from {}", entries.len(), path);

        let mut journal = Self {
            path,
            entries,
            writer: None,
        };
        journal.compact()?;
        Ok(journal)
    }

    /// A journal that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: Utf8PathBuf::new(),
            entries: HashMap::new(),
            writer: None,
        }
    }

    fn load(path: &Utf8Path) -> std::io::Result<HashMap<String, Entry>> {
        let mut entries = HashMap::new();
        let mut reader = BufReader::new(File::open(path)?);

        match ciborium::from_reader::<Record, _>(&mut reader) {
            Ok(Record::Header { schema }) if schema == SCHEMA => {}
            Ok(Record::Header { schema }) => {
                tracing::warn!("Journal {path} has schema {schema}, expected {SCHEMA}; starting over");
                return Ok(entries);
            }
            _ => {
                tracing::warn!("Journal {path} has no valid header; starting over");
                return Ok(entries);
            }
        }

        loop {
            if reader.fill_buf()?.is_empty() {
                break;
            }

            match ciborium::from_reader::<Record, _>(&mut reader) {
                Ok(Record::Entry(entry)) => {
                    entries.insert(entry.key.clone(), entry);
                }
                Ok(Record::Header { .. }) => {}
                Err(e) => {
                    tracing::warn!("Discarding damaged journal tail in {path}: {e}");
                    break;
                }
            }
        }

        Ok(entries)
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Entry> {
        self.entries.get(key)
    }

    /// Remembers a completed node and appends it to disk immediately.
    pub fn record(&mut self, entry: Entry) -> Result<(), JournalError> {
        if let Some(writer) = &mut self.writer {
            ciborium::into_writer(&Record::Entry(entry.clone()), &mut *writer)?;
            writer
                .flush()
                .map_err(|e| JournalError::Io(self.path.clone(), e))?;
        }

        self.entries.insert(entry.key.clone(), entry);
        Ok(())
    }

    /// Drops every entry whose key is not in `keep`, returning how many
    /// were removed.
    pub fn prune<'a>(&mut self, keep: impl IntoIterator<Item = &'a str>) -> Result<usize, JournalError> {
        let keep: HashSet<&str> = keep.into_iter().collect();
        let before = self.entries.len();
        self.entries.retain(|key, _| keep.contains(key.as_str()));

        let removed = before - self.entries.len();
        if removed > 0 {
            self.compact()?;
        }
        Ok(removed)
    }

    /// Rewrites the file with only the live entries, then reopens it for
    /// appending.
    pub fn compact(&mut self) -> Result<(), JournalError> {
        if self.path.as_str().is_empty() {
            return Ok(());
        }

        let path = self.path.clone();
        let io = |e| JournalError::Io(path.clone(), e);

        self.writer = None;

        if let Some(parent) = self.path.parent()
            && !parent.as_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(io)?;
        }

        let tmp = Utf8PathBuf::from(format!("{}.tmp", self.path));
        {
            let mut writer = BufWriter::new(File::create(&tmp).map_err(io)?);
            ciborium::into_writer(&Record::Header { schema: SCHEMA }, &mut writer)?;

            let mut keys: Vec<&String> = self.entries.keys().collect();
            keys.sort();
            for key in keys {
                ciborium::into_writer(&Record::Entry(self.entries[key].clone()), &mut writer)?;
            }

            writer.flush().map_err(io)?;
        }
        fs::rename(&tmp, &path).map_err(io)?;

        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(io)?;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    /// Deletes a journal file, forcing the next build to start from scratch.
    pub fn delete(path: &Utf8Path) -> std::io::Result<bool> {
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, n: u8) -> Entry {
        Entry {
            key: key.to_string(),
            signature: Hash32::hash([n]),
            stamp: Hash32::hash([n, n]),
            output: vec![n; 3],
            file: None,
        }
    }

    fn temp_journal() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join(".build/.journal")).unwrap();
        (dir, path)
    }

    #[test]
    fn test_entries_survive_reopen() {
        let (_dir, path) = temp_journal();

        let mut journal = Journal::open(&path).unwrap();
        assert!(journal.is_empty());
        journal.record(entry("file:a:[]", 1)).unwrap();
        journal.record(entry("file:b:[]", 2)).unwrap();
        journal.record(entry("file:a:[]", 3)).unwrap();
        drop(journal);

        let journal = Journal::open(&path).unwrap();
        assert_eq!(journal.len(), 2);
        assert_eq!(journal.get("file:a:[]"), Some(&entry("file:a:[]", 3)));
        assert_eq!(journal.get("file:b:[]"), Some(&entry("file:b:[]", 2)));
    }

    #[test]
    fn test_torn_tail_is_ignored() {
        let (_dir, path) = temp_journal();

        let mut journal = Journal::open(&path).unwrap();
        journal.record(entry("task:keep:[]", 1)).unwrap();
        journal.record(entry("task:torn:[]", 2)).unwrap();
        drop(journal);

        // Cut the last record in half, as a crash mid-write would.
        let bytes = fs::read(&path).unwrap();
        let mut last = Vec::new();
        ciborium::into_writer(&Record::Entry(entry("task:torn:[]", 2)), &mut last).unwrap();
        fs::write(&path, &bytes[..bytes.len() - last.len() / 2]).unwrap();

        let journal = Journal::open(&path).unwrap();
        assert_eq!(journal.len(), 1);
        assert!(journal.get("task:keep:[]").is_some());
        assert!(journal.get("task:torn:[]").is_none());
    }

    #[test]
    fn test_unknown_file_starts_empty() {
        let (_dir, path) = temp_journal();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"not a journal").unwrap();

        let journal = Journal::open(&path).unwrap();
        assert!(journal.is_empty());
    }

    #[test]
    fn test_prune_keeps_only_listed_keys() {
        let (_dir, path) = temp_journal();

        let mut journal = Journal::open(&path).unwrap();
        for (i, key) in ["a", "b", "c"].into_iter().enumerate() {
            journal.record(entry(key, i as u8)).unwrap();
        }

        assert_eq!(journal.prune(["a", "c"]).unwrap(), 1);
        drop(journal);

        let journal = Journal::open(&path).unwrap();
        assert_eq!(journal.len(), 2);
        assert!(journal.get("b").is_none());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let (_dir, path) = temp_journal();
        Journal::open(&path).unwrap();

        assert!(Journal::delete(&path).unwrap());
        assert!(!Journal::delete(&path).unwrap());
    }
}
