//! The `sync:` file service: STAT/LIST/SEND/RECV/QUIT requests framed as
//! little-endian id+length records inside the stream, answered with
//! STAT/DENT/DATA/DONE/OKAY/FAIL records. Requests may arrive split across
//! frames and several may share one frame; replies accumulate and drain one
//! packet-sized slice per ack. Filesystem calls are synchronous.

use std::cmp::min;
use std::ffi::OsStr;
use std::fs::{self, File, OpenOptions, ReadDir};
use std::io::{self, Read, Write};
use std::mem;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::{symlink, MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};

use super::Step;
use crate::packet::Packet;

const fn request_id(tag: [u8; 4]) -> u32 {
    (tag[0] as u32) | ((tag[1] as u32) << 8) | ((tag[2] as u32) << 16) | ((tag[3] as u32) << 24)
}

const ID_STAT: u32 = request_id(*b"STAT");
const ID_LIST: u32 = request_id(*b"LIST");
const ID_SEND: u32 = request_id(*b"SEND");
const ID_RECV: u32 = request_id(*b"RECV");
const ID_DENT: u32 = request_id(*b"DENT");
const ID_DONE: u32 = request_id(*b"DONE");
const ID_DATA: u32 = request_id(*b"DATA");
const ID_OKAY: u32 = request_id(*b"OKAY");
const ID_FAIL: u32 = request_id(*b"FAIL");
const ID_QUIT: u32 = request_id(*b"QUIT");

/// Request and record headers are two little-endian u32 words.
const RECORD_HEADER: usize = 8;

/// Staging bound for names and symlink targets.
const TEMP_BUFF_SIZE: usize = 1024;

/// File bytes read per RECV chunk; slicing toward the peer handles packets
/// smaller than this.
const RECV_CHUNK: usize = 4096;

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

enum SyncState {
    /// Waiting for the 8-byte request header.
    WaitCmd,
    /// Waiting for the request name (`namelen` bytes).
    WaitCmdData,
    /// Draining a directory listing, one DENT per ack.
    List { dir: ReadDir, base: PathBuf },
    /// Draining file contents, one DATA chunk per ack.
    Recv { file: File },
    /// Upload: waiting for the next DATA/DONE record header.
    SendFileHdr { file: File },
    /// Upload: consuming `remaining` file bytes.
    SendFileData { file: File, remaining: u32 },
    /// Symlink upload: waiting for the target DATA/DONE header.
    SendLinkHdr { link_path: PathBuf },
    /// Symlink upload: consuming the `remaining`-byte target.
    SendLinkData { link_path: PathBuf, remaining: u32 },
}

enum Flow {
    /// Keep consuming the frame.
    Continue,
    /// Protocol requires closing the stream (QUIT or malformed request).
    Close,
}

pub struct SyncService {
    state: SyncState,
    cmd: u32,
    namelen: usize,
    /// Bytes staged so far toward the current `stage_input` target.
    size: usize,
    buff: [u8; TEMP_BUFF_SIZE],
    /// Accumulated reply records, drained packet-sized slice at a time.
    reply: Vec<u8>,
    reply_index: usize,
}

impl SyncService {
    pub fn new() -> SyncService {
        SyncService {
            state: SyncState::WaitCmd,
            cmd: 0,
            namelen: 0,
            size: 0,
            buff: [0; TEMP_BUFF_SIZE],
            reply: Vec::new(),
            reply_index: 0,
        }
    }

    pub fn on_write(&mut self, mut packet: Packet) -> Step {
        let mut offset = 0;

        while offset < packet.header.data_length as usize {
            match self.step(&packet, &mut offset) {
                Flow::Continue => {}
                Flow::Close => return Step::Fail(Some(packet)),
            }
        }

        self.stage_reply(&mut packet);
        Step::Done(packet)
    }

    pub fn on_ack(&mut self, mut packet: Packet) -> Step {
        if self.reply_index < self.reply.len() {
            // Previous replies still draining.
            self.stage_reply(&mut packet);
            return Step::Done(packet);
        }

        match mem::replace(&mut self.state, SyncState::WaitCmd) {
            SyncState::Recv { mut file } => {
                let mut buf = [0u8; RECV_CHUNK];
                loop {
                    match file.read(&mut buf) {
                        Ok(0) => {
                            self.append_record(ID_DONE, 0);
                            break;
                        }
                        Ok(n) => {
                            self.append_data(&buf[..n]);
                            self.state = SyncState::Recv { file };
                            break;
                        }
                        Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                        Err(_) => {
                            self.append_fail("read failed");
                            break;
                        }
                    }
                }
            }
            SyncState::List { mut dir, base } => {
                if self.next_dent(&mut dir, &base) {
                    self.state = SyncState::List { dir, base };
                }
            }
            other => self.state = other,
        }

        self.stage_reply(&mut packet);
        Step::Done(packet)
    }

    /// Copies the next reply slice into the packet, if any is pending.
    fn stage_reply(&mut self, packet: &mut Packet) {
        if self.reply_index >= self.reply.len() {
            self.reply.clear();
            self.reply_index = 0;
            return;
        }

        let n = min(self.reply.len() - self.reply_index, packet.capacity());
        packet.data_mut()[..n].copy_from_slice(&self.reply[self.reply_index..self.reply_index + n]);
        packet.stage_len(n);
        self.reply_index += n;

        if self.reply_index >= self.reply.len() {
            self.reply.clear();
            self.reply_index = 0;
        }
    }

    /// Accumulates input toward `want` bytes in the staging buffer. True
    /// once the full target has been gathered.
    fn stage_input(&mut self, input: &[u8], offset: &mut usize, want: usize) -> bool {
        let chunk = min(want - self.size, input.len() - *offset);
        self.buff[self.size..self.size + chunk].copy_from_slice(&input[*offset..*offset + chunk]);
        self.size += chunk;
        *offset += chunk;

        if self.size == want {
            self.size = 0;
            true
        } else {
            false
        }
    }

    /// One state-machine step over the frame payload.
    fn step(&mut self, packet: &Packet, offset: &mut usize) -> Flow {
        let input = packet.payload();

        match mem::replace(&mut self.state, SyncState::WaitCmd) {
            SyncState::WaitCmd => {
                if !self.stage_input(input, offset, RECORD_HEADER) {
                    return Flow::Continue;
                }

                let id = LittleEndian::read_u32(&self.buff[0..4]);
                let namelen = LittleEndian::read_u32(&self.buff[4..8]) as usize;

                if id == ID_QUIT {
                    return Flow::Close;
                }
                if namelen >= TEMP_BUFF_SIZE {
                    return Flow::Close;
                }

                self.cmd = id;
                self.namelen = namelen;
                self.state = SyncState::WaitCmdData;
                Flow::Continue
            }

            SyncState::WaitCmdData => {
                let namelen = self.namelen;
                if !self.stage_input(input, offset, namelen) {
                    self.state = SyncState::WaitCmdData;
                    return Flow::Continue;
                }

                let name = self.buff[..namelen].to_vec();
                match self.cmd {
                    ID_STAT => self.init_stat(&name),
                    ID_LIST => self.init_list(&name),
                    ID_SEND => self.init_send(&name),
                    ID_RECV => self.init_recv(&name),
                    _ => return Flow::Close,
                }
                Flow::Continue
            }

            SyncState::SendFileHdr { file } => {
                if !self.stage_input(input, offset, RECORD_HEADER) {
                    self.state = SyncState::SendFileHdr { file };
                    return Flow::Continue;
                }

                let id = LittleEndian::read_u32(&self.buff[0..4]);
                let size = LittleEndian::read_u32(&self.buff[4..8]);

                match id {
                    ID_DATA => self.state = SyncState::SendFileData {
                        file,
                        remaining: size,
                    },
                    ID_DONE => self.append_record(ID_OKAY, 0),
                    _ => self.append_fail("invalid data message"),
                }
                Flow::Continue
            }

            SyncState::SendFileData {
                mut file,
                remaining,
            } => {
                let chunk = min(remaining as usize, input.len() - *offset);
                let result = file.write_all(&input[*offset..*offset + chunk]);
                *offset += chunk;

                match result {
                    Ok(()) => {
                        let remaining = remaining - chunk as u32;
                        if remaining == 0 {
                            self.state = SyncState::SendFileHdr { file };
                        } else {
                            self.state = SyncState::SendFileData { file, remaining };
                        }
                    }
                    Err(_) => self.append_fail("write error"),
                }
                Flow::Continue
            }

            SyncState::SendLinkHdr { link_path } => {
                if !self.stage_input(input, offset, RECORD_HEADER) {
                    self.state = SyncState::SendLinkHdr { link_path };
                    return Flow::Continue;
                }

                let id = LittleEndian::read_u32(&self.buff[0..4]);
                let size = LittleEndian::read_u32(&self.buff[4..8]);

                match id {
                    ID_DATA => {
                        if size as usize >= TEMP_BUFF_SIZE {
                            // Target would overflow the staging buffer.
                            self.append_fail("symlink target too long");
                        } else {
                            self.state = SyncState::SendLinkData {
                                link_path,
                                remaining: size,
                            };
                        }
                    }
                    ID_DONE => self.append_record(ID_OKAY, 0),
                    _ => self.append_fail("invalid data message"),
                }
                Flow::Continue
            }

            SyncState::SendLinkData {
                link_path,
                remaining,
            } => {
                let want = remaining as usize;
                if !self.stage_input(input, offset, want) {
                    self.state = SyncState::SendLinkData {
                        link_path,
                        remaining,
                    };
                    return Flow::Continue;
                }

                let target = OsStr::from_bytes(&self.buff[..want]).to_os_string();
                match symlink(&target, &link_path) {
                    Ok(()) => self.state = SyncState::SendLinkHdr { link_path },
                    Err(_) => self.append_fail("symlink call failed"),
                }
                Flow::Continue
            }

            // Draining states never see inbound payload; treat it as a
            // protocol error.
            SyncState::List { .. } | SyncState::Recv { .. } => Flow::Close,
        }
    }

    fn init_stat(&mut self, name: &[u8]) {
        let path = bytes_to_path(name);
        match fs::metadata(&path) {
            Ok(md) => self.append_stat(md.mode(), md.len() as u32, md.mtime() as u32),
            // Not found reports all-zero fields, not an error.
            Err(_) => self.append_stat(0, 0, 0),
        }
    }

    fn init_list(&mut self, name: &[u8]) {
        let base = bytes_to_path(name);
        match fs::read_dir(&base) {
            Ok(mut dir) => {
                if self.next_dent(&mut dir, &base) {
                    self.state = SyncState::List { dir, base };
                }
            }
            Err(_) => self.append_done_dent(),
        }
    }

    fn init_send(&mut self, name: &[u8]) {
        // "path,mode" with the numeric mode after the last comma.
        let (path_bytes, mode) = match name.iter().rposition(|&b| b == b',') {
            Some(at) => {
                let mode = parse_c_u32(&name[at + 1..]).unwrap_or(0o644);
                (&name[..at], mode)
            }
            None => (name, 0o644),
        };

        let is_link = (mode & S_IFMT) == S_IFLNK;
        let mode = mode & 0o777;
        let path = bytes_to_path(path_bytes);

        if !path.is_absolute() {
            self.append_fail("path is not absolute");
            return;
        }

        // A stale entry may be a symlink or a directory; clear it first.
        let _ = fs::remove_file(&path);

        if let Some(parent) = path.parent() {
            if fs::create_dir_all(parent).is_err() {
                self.append_fail("cannot create directories");
                return;
            }
        }

        if is_link {
            self.state = SyncState::SendLinkHdr { link_path: path };
            return;
        }

        match OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(&path)
        {
            Ok(file) => self.state = SyncState::SendFileHdr { file },
            Err(err) => {
                let message = format!("open failed: {}", err);
                self.append_fail(&message);
            }
        }
    }

    fn init_recv(&mut self, name: &[u8]) {
        let path = bytes_to_path(name);
        match File::open(&path) {
            Ok(mut file) => {
                // First chunk goes out with the request's ack; the rest
                // drains on subsequent acks.
                let mut buf = [0u8; RECV_CHUNK];
                loop {
                    match file.read(&mut buf) {
                        Ok(0) => {
                            self.append_record(ID_DONE, 0);
                            break;
                        }
                        Ok(n) => {
                            self.append_data(&buf[..n]);
                            self.state = SyncState::Recv { file };
                            break;
                        }
                        Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                        Err(_) => {
                            self.append_fail("read failed");
                            break;
                        }
                    }
                }
            }
            Err(_) => self.append_fail("file does not exist"),
        }
    }

    /// Appends one directory entry (or the DONE terminator). True while the
    /// listing should continue.
    fn next_dent(&mut self, dir: &mut ReadDir, base: &Path) -> bool {
        match dir.next() {
            Some(Ok(entry)) => {
                let name = entry.file_name();
                let full = base.join(&name);
                // Do not follow symlinks.
                let (mode, size, time) = match fs::symlink_metadata(&full) {
                    Ok(md) => (md.mode(), md.len() as u32, md.mtime() as u32),
                    Err(_) => (0, 0, 0),
                };
                self.append_dent(mode, size, time, name.as_os_str().as_bytes());
                true
            }
            Some(Err(_)) | None => {
                self.append_done_dent();
                false
            }
        }
    }

    fn append_u32(&mut self, value: u32) {
        let mut word = [0u8; 4];
        LittleEndian::write_u32(&mut word, value);
        self.reply.extend_from_slice(&word);
    }

    fn append_record(&mut self, id: u32, len: u32) {
        self.append_u32(id);
        self.append_u32(len);
    }

    fn append_data(&mut self, data: &[u8]) {
        self.append_record(ID_DATA, data.len() as u32);
        self.reply.extend_from_slice(data);
    }

    fn append_fail(&mut self, message: &str) {
        self.append_record(ID_FAIL, message.len() as u32);
        self.reply.extend_from_slice(message.as_bytes());
    }

    fn append_stat(&mut self, mode: u32, size: u32, time: u32) {
        self.append_u32(ID_STAT);
        self.append_u32(mode);
        self.append_u32(size);
        self.append_u32(time);
    }

    fn append_dent(&mut self, mode: u32, size: u32, time: u32, name: &[u8]) {
        self.append_u32(ID_DENT);
        self.append_u32(mode);
        self.append_u32(size);
        self.append_u32(time);
        self.append_u32(name.len() as u32);
        self.reply.extend_from_slice(name);
    }

    /// LIST terminates with a DENT-shaped DONE record.
    fn append_done_dent(&mut self) {
        self.append_u32(ID_DONE);
        self.append_u32(0);
        self.append_u32(0);
        self.append_u32(0);
        self.append_u32(0);
    }
}

fn bytes_to_path(bytes: &[u8]) -> PathBuf {
    PathBuf::from(std::ffi::OsString::from_vec(bytes.to_vec()))
}

/// C-style numeric parse: `0x` hex, leading `0` octal, decimal otherwise.
fn parse_c_u32(bytes: &[u8]) -> Option<u32> {
    let s = std::str::from_utf8(bytes).ok()?;
    if let Some(hex) = s.strip_prefix("0x") {
        return u32::from_str_radix(hex, 16).ok();
    }
    if s.len() > 1 && s.starts_with('0') {
        return u32::from_str_radix(&s[1..], 8).ok();
    }
    s.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{PacketPool, Staged};

    fn request(id: u32, name: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        let mut word = [0u8; 4];
        LittleEndian::write_u32(&mut word, id);
        bytes.extend_from_slice(&word);
        LittleEndian::write_u32(&mut word, name.len() as u32);
        bytes.extend_from_slice(&word);
        bytes.extend_from_slice(name);
        bytes
    }

    fn data_record(payload: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        let mut word = [0u8; 4];
        LittleEndian::write_u32(&mut word, ID_DATA);
        bytes.extend_from_slice(&word);
        LittleEndian::write_u32(&mut word, payload.len() as u32);
        bytes.extend_from_slice(&word);
        bytes.extend_from_slice(payload);
        bytes
    }

    fn done_record() -> Vec<u8> {
        let mut bytes = Vec::new();
        let mut word = [0u8; 4];
        LittleEndian::write_u32(&mut word, ID_DONE);
        bytes.extend_from_slice(&word);
        bytes.extend_from_slice(&[0u8; 4]);
        bytes
    }

    fn inbound(payload: &[u8]) -> Packet {
        let mut pool = PacketPool::new(1, 4096, 4096);
        let mut packet = pool.allocate(false).unwrap();
        packet.data_mut()[..payload.len()].copy_from_slice(payload);
        packet.header.data_length = payload.len() as u32;
        packet
    }

    fn blank() -> Packet {
        inbound(&[])
    }

    fn staged_bytes(packet: &Packet) -> &[u8] {
        match packet.staged {
            Staged::Reply(len) => &packet.data()[..len],
            _ => &[],
        }
    }

    /// Feeds the frame and returns the staged reply, draining follow-up
    /// slices through acks.
    fn drive(svc: &mut SyncService, payload: &[u8]) -> Vec<u8> {
        let mut reply = Vec::new();

        match svc.on_write(inbound(payload)) {
            Step::Done(packet) => reply.extend_from_slice(staged_bytes(&packet)),
            _ => panic!("write failed"),
        }

        reply
    }

    fn drain_acks(svc: &mut SyncService, rounds: usize) -> Vec<u8> {
        let mut reply = Vec::new();
        for _ in 0..rounds {
            match svc.on_ack(blank()) {
                Step::Done(packet) => {
                    let bytes = staged_bytes(&packet);
                    if bytes.is_empty() {
                        break;
                    }
                    reply.extend_from_slice(bytes);
                }
                _ => panic!("ack failed"),
            }
        }
        reply
    }

    #[test]
    fn test_stat_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probe");
        fs::write(&path, b"12345").unwrap();

        let mut svc = SyncService::new();
        let reply = drive(&mut svc, &request(ID_STAT, path.as_os_str().as_bytes()));

        assert_eq!(LittleEndian::read_u32(&reply[0..4]), ID_STAT);
        let mode = LittleEndian::read_u32(&reply[4..8]);
        assert_eq!(mode & S_IFMT, 0o100000);
        assert_eq!(LittleEndian::read_u32(&reply[8..12]), 5);
    }

    #[test]
    fn test_stat_missing_file_is_zeroed() {
        let mut svc = SyncService::new();
        let reply = drive(&mut svc, &request(ID_STAT, b"/no/such/file/anywhere"));

        assert_eq!(LittleEndian::read_u32(&reply[0..4]), ID_STAT);
        assert_eq!(&reply[4..16], &[0u8; 12]);
    }

    #[test]
    fn test_pipelined_stats_in_one_frame() {
        let mut svc = SyncService::new();
        let mut payload = request(ID_STAT, b"/no/such/a");
        payload.extend_from_slice(&request(ID_STAT, b"/no/such/b"));

        let mut reply = drive(&mut svc, &payload);
        reply.extend_from_slice(&drain_acks(&mut svc, 8));

        assert_eq!(reply.len(), 32);
        assert_eq!(LittleEndian::read_u32(&reply[0..4]), ID_STAT);
        assert_eq!(LittleEndian::read_u32(&reply[16..20]), ID_STAT);
    }

    #[test]
    fn test_recv_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload");
        fs::write(&path, b"file sync service contents").unwrap();

        let mut svc = SyncService::new();
        let mut reply = drive(&mut svc, &request(ID_RECV, path.as_os_str().as_bytes()));
        reply.extend_from_slice(&drain_acks(&mut svc, 16));

        assert_eq!(LittleEndian::read_u32(&reply[0..4]), ID_DATA);
        let len = LittleEndian::read_u32(&reply[4..8]) as usize;
        assert_eq!(&reply[8..8 + len], b"file sync service contents");
        assert_eq!(
            LittleEndian::read_u32(&reply[8 + len..12 + len]),
            ID_DONE
        );
    }

    #[test]
    fn test_recv_missing_file_fails() {
        let mut svc = SyncService::new();
        let reply = drive(&mut svc, &request(ID_RECV, b"/no/such/file"));

        assert_eq!(LittleEndian::read_u32(&reply[0..4]), ID_FAIL);
    }

    #[test]
    fn test_send_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pushed");

        let mut name = path.as_os_str().as_bytes().to_vec();
        name.extend_from_slice(b",33188"); // 0o100644

        let mut payload = request(ID_SEND, &name);
        payload.extend_from_slice(&data_record(b"uploaded bytes"));
        payload.extend_from_slice(&done_record());

        let mut svc = SyncService::new();
        let reply = drive(&mut svc, &payload);

        assert_eq!(LittleEndian::read_u32(&reply[0..4]), ID_OKAY);
        assert_eq!(fs::read(&path).unwrap(), b"uploaded bytes");
    }

    #[test]
    fn test_send_data_split_across_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("split");

        let mut name = path.as_os_str().as_bytes().to_vec();
        name.extend_from_slice(b",33188");

        let mut svc = SyncService::new();

        let mut first = request(ID_SEND, &name);
        first.extend_from_slice(&data_record(b"first+second")[..10]);
        match svc.on_write(inbound(&first)) {
            Step::Done(_) => {}
            _ => panic!("write failed"),
        }

        let mut second = data_record(b"first+second")[10..].to_vec();
        second.extend_from_slice(&done_record());
        let reply = drive(&mut svc, &second);

        assert_eq!(LittleEndian::read_u32(&reply[0..4]), ID_OKAY);
        assert_eq!(fs::read(&path).unwrap(), b"first+second");
    }

    #[test]
    fn test_send_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("link");

        let mut name = path.as_os_str().as_bytes().to_vec();
        name.extend_from_slice(b",41471"); // 0o120777

        let mut payload = request(ID_SEND, &name);
        payload.extend_from_slice(&data_record(b"/tmp/target"));
        payload.extend_from_slice(&done_record());

        let mut svc = SyncService::new();
        let reply = drive(&mut svc, &payload);

        assert_eq!(LittleEndian::read_u32(&reply[0..4]), ID_OKAY);
        assert_eq!(
            fs::read_link(&path).unwrap(),
            PathBuf::from("/tmp/target")
        );
    }

    #[test]
    fn test_symlink_target_overflow_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("link");

        let mut name = path.as_os_str().as_bytes().to_vec();
        name.extend_from_slice(b",41471");

        let mut payload = request(ID_SEND, &name);
        // DATA header promising more than the staging buffer holds.
        let mut word = [0u8; 4];
        LittleEndian::write_u32(&mut word, ID_DATA);
        payload.extend_from_slice(&word);
        LittleEndian::write_u32(&mut word, TEMP_BUFF_SIZE as u32 + 1);
        payload.extend_from_slice(&word);

        let mut svc = SyncService::new();
        let reply = drive(&mut svc, &payload);

        assert_eq!(LittleEndian::read_u32(&reply[0..4]), ID_FAIL);
    }

    #[test]
    fn test_relative_send_path_fails() {
        let mut svc = SyncService::new();
        let reply = drive(&mut svc, &request(ID_SEND, b"relative/path,33188"));

        assert_eq!(LittleEndian::read_u32(&reply[0..4]), ID_FAIL);
    }

    #[test]
    fn test_list_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("one"), b"1").unwrap();
        fs::write(dir.path().join("two"), b"22").unwrap();

        let mut svc = SyncService::new();
        let mut reply = drive(&mut svc, &request(ID_LIST, dir.path().as_os_str().as_bytes()));
        reply.extend_from_slice(&drain_acks(&mut svc, 8));

        let mut names = Vec::new();
        let mut at = 0;
        loop {
            let id = LittleEndian::read_u32(&reply[at..at + 4]);
            if id == ID_DONE {
                break;
            }
            assert_eq!(id, ID_DENT);
            let namelen = LittleEndian::read_u32(&reply[at + 16..at + 20]) as usize;
            names.push(reply[at + 20..at + 20 + namelen].to_vec());
            at += 20 + namelen;
        }

        names.sort();
        assert_eq!(names, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn test_list_missing_directory_reports_done() {
        let mut svc = SyncService::new();
        let reply = drive(&mut svc, &request(ID_LIST, b"/no/such/dir"));

        assert_eq!(LittleEndian::read_u32(&reply[0..4]), ID_DONE);
    }

    #[test]
    fn test_quit_closes_stream() {
        let mut svc = SyncService::new();
        match svc.on_write(inbound(&request(ID_QUIT, b""))) {
            Step::Fail(Some(_)) => {}
            _ => panic!("QUIT must close the stream"),
        }
    }

    #[test]
    fn test_unknown_request_closes_stream() {
        let mut svc = SyncService::new();
        match svc.on_write(inbound(&request(request_id(*b"XXXX"), b"zz"))) {
            Step::Fail(Some(_)) => {}
            _ => panic!("unknown requests close the stream"),
        }
    }

    #[test]
    fn test_parse_c_u32() {
        assert_eq!(parse_c_u32(b"33188"), Some(33188));
        assert_eq!(parse_c_u32(b"0644"), Some(0o644));
        assert_eq!(parse_c_u32(b"0x1ff"), Some(0x1ff));
        assert_eq!(parse_c_u32(b"junk"), None);
    }
}
