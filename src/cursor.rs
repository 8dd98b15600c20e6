use crate::{
    host::EntryInfo,
    listing::{DirEntry, DirectoryListing},
    records::{InfoClass, Push, RecordWriter},
    status::{
        NtStatus, STATUS_BUFFER_OVERFLOW, STATUS_INFO_LENGTH_MISMATCH, STATUS_NO_MORE_FILES,
        STATUS_NO_SUCH_FILE, STATUS_SUCCESS,
    },
    wildcard::NamePattern,
};

bitflags::bitflags! {
    /// `SL_*` flags of `NtQueryDirectoryFileEx`.
    pub struct ScanFlags: u32 {
        const RESTART_SCAN = 0x0000_0001;
        const RETURN_SINGLE_ENTRY = 0x0000_0002;
        const INDEX_SPECIFIED = 0x0000_0004;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryResult {
    pub status: NtStatus,
    /// Bytes of the caller buffer filled; reported through the I/O status
    /// block.
    pub bytes: usize,
}

/// Position of one open directory handle in its merged listing.
#[derive(Debug, Clone)]
pub struct DirCursor {
    entries: Vec<DirEntry>,
    position: usize,
    pattern: Option<NamePattern>,
    /// A query of the current scan already reported something.
    returned_any: bool,
}

impl DirCursor {
    pub fn new(entries: Vec<DirEntry>) -> DirCursor {
        DirCursor {
            entries,
            position: 0,
            pattern: None,
            returned_any: false,
        }
    }

    /// A cursor over `listing`; non-root directories report `.` and `..`
    /// first, as the host does.
    pub fn for_listing(listing: &DirectoryListing, dot_info: EntryInfo) -> DirCursor {
        let mut entries = Vec::with_capacity(listing.entries.len() + 2);
        if !listing.key.is_root() {
            entries.push(DirEntry::dot(".", dot_info));
            entries.push(DirEntry::dot("..", dot_info));
        }
        entries.extend(listing.entries.iter().cloned());
        DirCursor::new(entries)
    }

    pub fn entries(&self) -> &[DirEntry] {
        &self.entries
    }

    pub fn is_started(&self) -> bool {
        self.pattern.is_some()
    }

    fn start(&mut self, pattern: Option<&str>, restart: bool) {
        if restart || self.pattern.is_none() {
            self.position = 0;
            self.returned_any = false;
            match pattern {
                Some(pattern) => self.pattern = Some(NamePattern::parse(pattern)),
                None if self.pattern.is_none() => self.pattern = Some(NamePattern::match_all()),
                None => {}
            }
        }
    }

    /// Fills `buf` with as many records of `class` as fit, continuing where
    /// the previous query on this handle stopped.
    ///
    /// The name filter is taken from the first query (or a restart); later
    /// filters are ignored.
    pub fn query(
        &mut self,
        buf: &mut [u8],
        class: InfoClass,
        flags: ScanFlags,
        pattern: Option<&str>,
    ) -> QueryResult {
        if buf.len() < class.name_offset() {
            return QueryResult {
                status: STATUS_INFO_LENGTH_MISMATCH,
                bytes: 0,
            };
        }
        self.start(pattern, flags.contains(ScanFlags::RESTART_SCAN));
        let single = flags.contains(ScanFlags::RETURN_SINGLE_ENTRY);
        let filter = self.pattern.clone().unwrap_or_default();

        let mut writer = RecordWriter::new(buf, class);
        while let Some(entry) = self.entries.get(self.position) {
            if !filter.matches(&entry.name) {
                self.position += 1;
                continue;
            }
            match writer.push(&entry.name, &entry.info) {
                Push::Written => {
                    self.position += 1;
                    if single {
                        break;
                    }
                }
                Push::Full => {
                    log::trace!("directory buffer full after {} records", writer.count());
                    break;
                }
                Push::Truncated => {
                    self.position += 1;
                    self.returned_any = true;
                    return QueryResult {
                        status: STATUS_BUFFER_OVERFLOW,
                        bytes: writer.bytes_written(),
                    };
                }
            }
        }

        if writer.count() == 0 {
            let status = match self.returned_any {
                true => STATUS_NO_MORE_FILES,
                false => STATUS_NO_SUCH_FILE,
            };
            self.returned_any = true;
            return QueryResult { status, bytes: 0 };
        }
        self.returned_any = true;
        QueryResult {
            status: STATUS_SUCCESS,
            bytes: writer.bytes_written(),
        }
    }

    /// Next entry matching `pattern`, for the find-first/find-next family.
    pub fn next_match(&mut self, pattern: &NamePattern) -> Option<DirEntry> {
        while let Some(entry) = self.entries.get(self.position) {
            self.position += 1;
            if pattern.matches(&entry.name) {
                self.returned_any = true;
                return Some(entry.clone());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::listing::EntryOrigin;

    fn entry(name: &str) -> DirEntry {
        DirEntry {
            name: name.to_owned(),
            info: EntryInfo::default(),
            origin: EntryOrigin::Virtual,
            real_path: PathBuf::from(name),
        }
    }

    fn names_in(buf: &[u8], bytes: usize) -> Vec<String> {
        let mut names = Vec::new();
        let mut at = 0;
        loop {
            let next = u32::from_le_bytes(buf[at..at + 4].try_into().unwrap()) as usize;
            let len = u32::from_le_bytes(buf[at + 8..at + 12].try_into().unwrap()) as usize;
            let units: Vec<u16> = buf[at + 12..at + 12 + len]
                .chunks(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect();
            names.push(String::from_utf16(&units).unwrap());
            assert!(at + 12 + len <= bytes);
            if next == 0 {
                break;
            }
            at += next;
        }
        names
    }

    fn cursor() -> DirCursor {
        DirCursor::new(vec![entry("a.txt"), entry("b.txt"), entry("c.dds"), entry("d.txt")])
    }

    #[test]
    fn pages_across_queries() {
        let mut cursor = cursor();
        // room for two 5-character names: 22 + 2 pad + 22
        let mut buf = vec![0u8; 46];
        let first = cursor.query(&mut buf, InfoClass::Names, ScanFlags::empty(), None);
        assert_eq!(first.status, STATUS_SUCCESS);
        assert_eq!(names_in(&buf, first.bytes), vec!["a.txt", "b.txt"]);

        let second = cursor.query(&mut buf, InfoClass::Names, ScanFlags::empty(), None);
        assert_eq!(names_in(&buf, second.bytes), vec!["c.dds", "d.txt"]);

        let third = cursor.query(&mut buf, InfoClass::Names, ScanFlags::empty(), None);
        assert_eq!(third.status, STATUS_NO_MORE_FILES);
        assert_eq!(third.bytes, 0);
    }

    #[test]
    fn filter_is_captured_on_first_query() {
        let mut cursor = cursor();
        let mut buf = vec![0u8; 1024];
        let r = cursor.query(&mut buf, InfoClass::Names, ScanFlags::empty(), Some("*.TXT"));
        assert_eq!(names_in(&buf, r.bytes), vec!["a.txt", "b.txt", "d.txt"]);

        let r = cursor.query(&mut buf, InfoClass::Names, ScanFlags::RESTART_SCAN, None);
        assert_eq!(names_in(&buf, r.bytes), vec!["a.txt", "b.txt", "d.txt"]);

        let r = cursor.query(&mut buf, InfoClass::Names, ScanFlags::RESTART_SCAN, Some("*.dds"));
        assert_eq!(names_in(&buf, r.bytes), vec!["c.dds"]);
    }

    #[test]
    fn single_entry_queries() {
        let mut cursor = cursor();
        let mut buf = vec![0u8; 1024];
        let r = cursor.query(&mut buf, InfoClass::Names, ScanFlags::RETURN_SINGLE_ENTRY, None);
        assert_eq!(names_in(&buf, r.bytes), vec!["a.txt"]);
        let r = cursor.query(&mut buf, InfoClass::Names, ScanFlags::RETURN_SINGLE_ENTRY, None);
        assert_eq!(names_in(&buf, r.bytes), vec!["b.txt"]);
    }

    #[test]
    fn empty_results() {
        let mut cursor = cursor();
        let mut buf = vec![0u8; 1024];
        let r = cursor.query(&mut buf, InfoClass::Names, ScanFlags::empty(), Some("*.esp"));
        assert_eq!(r.status, STATUS_NO_SUCH_FILE);
        let r = cursor.query(&mut buf, InfoClass::Names, ScanFlags::empty(), None);
        assert_eq!(r.status, STATUS_NO_MORE_FILES);
        let r = cursor.query(&mut buf, InfoClass::Names, ScanFlags::RESTART_SCAN, None);
        assert_eq!(r.status, STATUS_NO_SUCH_FILE);
    }

    #[test]
    fn small_buffers() {
        let mut cursor = cursor();
        let mut buf = vec![0u8; 8];
        let r = cursor.query(&mut buf, InfoClass::Names, ScanFlags::empty(), None);
        assert_eq!(r.status, STATUS_INFO_LENGTH_MISMATCH);
        assert!(!cursor.is_started());

        let mut buf = vec![0u8; 16];
        let r = cursor.query(&mut buf, InfoClass::Names, ScanFlags::empty(), None);
        assert_eq!(r.status, STATUS_BUFFER_OVERFLOW);
        assert_eq!(r.bytes, 16);

        let mut buf = vec![0u8; 1024];
        let r = cursor.query(&mut buf, InfoClass::Names, ScanFlags::empty(), None);
        assert_eq!(names_in(&buf, r.bytes), vec!["b.txt", "c.dds", "d.txt"]);
    }

    #[test]
    fn find_next_style_iteration() {
        let mut cursor = cursor();
        let pattern = NamePattern::from_win32("*.txt");
        let names: Vec<String> = std::iter::from_fn(|| cursor.next_match(&pattern))
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "d.txt"]);
    }
}
