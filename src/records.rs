//! Byte layouts of the directory records handed back to applications.
//!
//! Kernel-level queries fill a caller buffer with a chain of variable-sized
//! records, each starting on an 8-byte boundary and linked through its
//! leading `NextEntryOffset`. The file name is UTF-16 and not terminated.

use crate::{
    host::EntryInfo,
    listing::DirEntry,
    status::{NtStatus, STATUS_BUFFER_OVERFLOW, STATUS_INFO_LENGTH_MISMATCH, STATUS_SUCCESS},
};

/// `FILE_INFORMATION_CLASS` values for directory queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum InfoClass {
    Directory = 1,
    FullDirectory = 2,
    BothDirectory = 3,
    Names = 12,
    IdBothDirectory = 37,
    IdFullDirectory = 38,
    IdExtdDirectory = 60,
}

impl InfoClass {
    pub fn from_raw(value: u32) -> Option<InfoClass> {
        Some(match value {
            1 => InfoClass::Directory,
            2 => InfoClass::FullDirectory,
            3 => InfoClass::BothDirectory,
            12 => InfoClass::Names,
            37 => InfoClass::IdBothDirectory,
            38 => InfoClass::IdFullDirectory,
            60 => InfoClass::IdExtdDirectory,
            _ => return None,
        })
    }

    /// Offset of `FileName`, which is also the smallest buffer the query
    /// accepts.
    pub fn name_offset(self) -> usize {
        match self {
            InfoClass::Directory => 64,
            InfoClass::FullDirectory => 68,
            InfoClass::BothDirectory => 94,
            InfoClass::Names => 12,
            InfoClass::IdBothDirectory => 104,
            InfoClass::IdFullDirectory => 80,
            InfoClass::IdExtdDirectory => 88,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Push {
    Written,
    /// The record does not fit; it must be returned by the next query.
    Full,
    /// First record of the buffer, cut short. Its `FileNameLength` still
    /// carries the full length.
    Truncated,
}

fn align8(offset: usize) -> usize {
    (offset + 7) & !7
}

fn put_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut [u8], at: usize, value: u64) {
    buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

pub struct RecordWriter<'a> {
    buf: &'a mut [u8],
    class: InfoClass,
    end: usize,
    last: Option<usize>,
    count: usize,
}

impl<'a> RecordWriter<'a> {
    pub fn new(buf: &'a mut [u8], class: InfoClass) -> RecordWriter<'a> {
        RecordWriter {
            buf,
            class,
            end: 0,
            last: None,
            count: 0,
        }
    }

    /// Bytes of the buffer that hold records.
    pub fn bytes_written(&self) -> usize {
        self.end
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn push(&mut self, name: &str, info: &EntryInfo) -> Push {
        let name: Vec<u16> = name.encode_utf16().collect();
        let name_bytes = name.len() * 2;
        let offset = self.class.name_offset();
        let start = match self.last {
            Some(_) => align8(self.end),
            None => 0,
        };
        let required = start + offset + name_bytes;

        if required > self.buf.len() {
            if self.last.is_some() || self.buf.len() < offset {
                return Push::Full;
            }
            let room = (self.buf.len() - offset) / 2;
            self.buf.fill(0);
            self.write_fixed(0, name_bytes as u32, info);
            self.write_name(offset, &name[..room]);
            self.end = offset + room * 2;
            self.last = Some(0);
            self.count = 1;
            return Push::Truncated;
        }

        self.buf[self.end..required].fill(0);
        self.write_fixed(start, name_bytes as u32, info);
        self.write_name(start + offset, &name);
        if let Some(previous) = self.last {
            put_u32(self.buf, previous, (start - previous) as u32);
        }
        self.last = Some(start);
        self.end = required;
        self.count += 1;
        Push::Written
    }

    fn write_name(&mut self, at: usize, name: &[u16]) {
        for (i, unit) in name.iter().enumerate() {
            self.buf[at + i * 2..at + i * 2 + 2].copy_from_slice(&unit.to_le_bytes());
        }
    }

    fn write_fixed(&mut self, at: usize, name_len: u32, info: &EntryInfo) {
        let buf = &mut *self.buf;
        // NextEntryOffset and FileIndex stay zero.
        if self.class == InfoClass::Names {
            put_u32(buf, at + 8, name_len);
            return;
        }
        put_u64(buf, at + 8, info.creation_time);
        put_u64(buf, at + 16, info.last_access_time);
        put_u64(buf, at + 24, info.last_write_time);
        put_u64(buf, at + 32, info.change_time);
        put_u64(buf, at + 40, info.size);
        put_u64(buf, at + 48, info.allocation_size);
        put_u32(buf, at + 56, info.attributes);
        put_u32(buf, at + 60, name_len);
        // EaSize (64), ShortNameLength and ShortName stay zero.
        match self.class {
            InfoClass::IdBothDirectory => put_u64(buf, at + 96, info.file_id),
            InfoClass::IdFullDirectory => put_u64(buf, at + 72, info.file_id),
            InfoClass::IdExtdDirectory => put_u64(buf, at + 72, info.file_id),
            _ => {}
        }
    }
}

pub const MAX_PATH: usize = 260;

/// Same layout as `WIN32_FIND_DATAW`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct FindDataW {
    pub file_attributes: u32,
    pub creation_time: [u32; 2],
    pub last_access_time: [u32; 2],
    pub last_write_time: [u32; 2],
    pub file_size_high: u32,
    pub file_size_low: u32,
    pub reserved0: u32,
    pub reserved1: u32,
    pub file_name: [u16; MAX_PATH],
    pub alternate_file_name: [u16; 14],
}

fn split_filetime(time: u64) -> [u32; 2] {
    [time as u32, (time >> 32) as u32]
}

impl FindDataW {
    pub fn from_entry(entry: &DirEntry) -> FindDataW {
        let info = &entry.info;
        let mut data = FindDataW {
            file_attributes: info.attributes,
            creation_time: split_filetime(info.creation_time),
            last_access_time: split_filetime(info.last_access_time),
            last_write_time: split_filetime(info.last_write_time),
            file_size_high: (info.size >> 32) as u32,
            file_size_low: info.size as u32,
            reserved0: 0,
            reserved1: 0,
            file_name: [0; MAX_PATH],
            alternate_file_name: [0; 14],
        };
        for (slot, unit) in data
            .file_name
            .iter_mut()
            .take(MAX_PATH - 1)
            .zip(entry.name.encode_utf16())
        {
            *slot = unit;
        }
        data
    }

    /// Sets the 8.3 alias, cut to the 13 units the record holds.
    pub fn with_short_name(mut self, short: &str) -> FindDataW {
        self.alternate_file_name = [0; 14];
        for (slot, unit) in self
            .alternate_file_name
            .iter_mut()
            .take(13)
            .zip(short.encode_utf16())
        {
            *slot = unit;
        }
        self
    }

    pub fn name(&self) -> String {
        until_nul(&self.file_name)
    }

    pub fn short_name(&self) -> String {
        until_nul(&self.alternate_file_name)
    }
}

fn until_nul(units: &[u16]) -> String {
    let len = units.iter().position(|&c| c == 0).unwrap_or(units.len());
    String::from_utf16_lossy(&units[..len])
}

/// Fills a `FILE_NAME_INFORMATION` (a `u32` byte length followed by the
/// name). Returns the status and the number of bytes written; a name that
/// does not fit is cut off with `STATUS_BUFFER_OVERFLOW`, the length field
/// still giving the full size.
pub fn write_file_name_information(buf: &mut [u8], name: &str) -> (NtStatus, usize) {
    if buf.len() < 4 {
        return (STATUS_INFO_LENGTH_MISMATCH, 0);
    }
    let name: Vec<u16> = name.encode_utf16().collect();
    put_u32(buf, 0, (name.len() * 2) as u32);
    let room = (buf.len() - 4) / 2;
    let fits = name.len().min(room);
    for (i, unit) in name[..fits].iter().enumerate() {
        buf[4 + i * 2..6 + i * 2].copy_from_slice(&unit.to_le_bytes());
    }
    let status = if fits < name.len() {
        STATUS_BUFFER_OVERFLOW
    } else {
        STATUS_SUCCESS
    };
    (status, 4 + fits * 2)
}
