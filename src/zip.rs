//! Random-access ZIP reading over HTTP byte ranges.
//!
//! Treats a remote archive URL plus its total byte length as a random-access
//! handle and extracts one named member at a time, so a request touching one
//! chain pays for that chain's CSV files rather than the whole ~80 MB
//! archive.
//!
//! # Protocol
//!
//! 1. **Directory discovery** — fetch a trailing window of
//!    `min(file_size, 65557)` bytes (the maximum EOCD comment plus the
//!    22-byte trailer), scan backward for the EOCD signature, and read the
//!    central directory's size and offset from it. Fetch exactly that range
//!    as a second request.
//! 2. **Central-directory walk** — iterate fixed-layout entries until a
//!    signature check fails, collecting name, compression method, sizes,
//!    and local-header offset per member.
//! 3. **Member extraction** — fetch the member's 30-byte local header to
//!    learn the local name/extra lengths, then fetch exactly
//!    `compressed_size` bytes of payload and inflate according to the
//!    compression method (STORED or raw DEFLATE).
//!
//! Zip64 is not handled: archives past 4 GiB or 65535 entries fail fast
//! with [`ArchiveError::EocdNotFound`] instead of silently truncating.
//!
//! The byte-range transport is behind the [`RangeSource`] trait so the
//! parsing logic is independent of HTTP and testable against in-memory
//! archives.

use async_trait::async_trait;

use crate::error::ArchiveError;

/// End-of-Central-Directory signature.
const EOCD_SIG: u32 = 0x0605_4b50;
/// Central-directory entry signature.
const CD_ENTRY_SIG: u32 = 0x0201_4b50;
/// Fixed EOCD length without the trailing comment.
const EOCD_LEN: u64 = 22;
/// EOCD length plus the maximum comment length: the tail window bound.
const TAIL_WINDOW: u64 = EOCD_LEN + 65535;
/// Fixed local-file-header length without name and extra fields.
const LOCAL_HEADER_LEN: u64 = 30;

pub const COMPRESSION_STORED: u16 = 0;
pub const COMPRESSION_DEFLATE: u16 = 8;

/// A random-access byte source of known total length.
///
/// `fetch` returns the inclusive range `[start, end]`. Implementations may
/// return fewer bytes than requested (a truncated origin); callers detect
/// that and fail with [`ArchiveError::TruncatedArchive`].
#[async_trait]
pub trait RangeSource: Send + Sync {
    /// Total size of the archive in bytes.
    fn len(&self) -> u64;

    /// Fetch the inclusive byte range `[start, end]`.
    async fn fetch(&self, start: u64, end: u64) -> Result<Vec<u8>, ArchiveError>;
}

/// One central-directory entry.
#[derive(Debug, Clone)]
pub struct Entry {
    pub name: String,
    pub compression: u16,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub local_header_offset: u32,
}

/// A parsed central directory plus the archive size it was read from.
/// The size participates in cache validation: a changed archive size
/// invalidates any cached directory for the same URL.
#[derive(Debug, Clone)]
pub struct Directory {
    pub entries: Vec<Entry>,
    pub size: u64,
}

impl Directory {
    /// Find an entry by exact member name.
    pub fn entry(&self, name: &str) -> Option<&Entry> {
        self.entries.iter().find(|e| e.name == name)
    }
}

/// Locate and parse the central directory of the archive behind `src`.
pub async fn read_directory(src: &dyn RangeSource) -> Result<Directory, ArchiveError> {
    let size = src.len();
    let window = size.min(TAIL_WINDOW);
    if window < EOCD_LEN {
        return Err(ArchiveError::EocdNotFound);
    }

    let tail = src.fetch(size - window, size - 1).await?;
    let eocd = find_eocd(&tail).ok_or(ArchiveError::EocdNotFound)?;
    let cd_size = le32(&tail[eocd + 12..]) as u64;
    let cd_offset = le32(&tail[eocd + 16..]) as u64;

    if cd_size == 0 {
        return Ok(Directory {
            entries: Vec::new(),
            size,
        });
    }

    let cd = src.fetch(cd_offset, cd_offset + cd_size - 1).await?;
    if (cd.len() as u64) < cd_size {
        return Err(ArchiveError::TruncatedArchive {
            wanted: cd_size,
            got: cd.len() as u64,
        });
    }

    Ok(Directory {
        entries: parse_central_directory(&cd),
        size,
    })
}

/// Fetch and decompress one member. STORED payloads pass through; DEFLATE
/// payloads are inflated as a raw deflate stream; anything else is
/// [`ArchiveError::UnsupportedCompression`].
pub async fn read_member(src: &dyn RangeSource, entry: &Entry) -> Result<Vec<u8>, ArchiveError> {
    match entry.compression {
        COMPRESSION_STORED | COMPRESSION_DEFLATE => {}
        method => return Err(ArchiveError::UnsupportedCompression { method }),
    }

    let header_start = entry.local_header_offset as u64;
    let header = src
        .fetch(header_start, header_start + LOCAL_HEADER_LEN - 1)
        .await?;
    if (header.len() as u64) < LOCAL_HEADER_LEN {
        return Err(ArchiveError::TruncatedArchive {
            wanted: LOCAL_HEADER_LEN,
            got: header.len() as u64,
        });
    }

    // The local name/extra lengths may differ from the central directory's;
    // the payload position is defined by the local header.
    let name_len = le16(&header[26..]) as u64;
    let extra_len = le16(&header[28..]) as u64;
    let data_start = header_start + LOCAL_HEADER_LEN + name_len + extra_len;

    let compressed_size = entry.compressed_size as u64;
    if compressed_size == 0 {
        return Ok(Vec::new());
    }

    let data = src
        .fetch(data_start, data_start + compressed_size - 1)
        .await?;
    if (data.len() as u64) < compressed_size {
        return Err(ArchiveError::TruncatedArchive {
            wanted: compressed_size,
            got: data.len() as u64,
        });
    }

    match entry.compression {
        COMPRESSION_STORED => Ok(data),
        _ => {
            use std::io::Read;
            let mut out = Vec::with_capacity(entry.uncompressed_size as usize);
            flate2::read::DeflateDecoder::new(&data[..]).read_to_end(&mut out)?;
            Ok(out)
        }
    }
}

/// [`read_member`] decoded as UTF-8 text.
pub async fn read_member_text(
    src: &dyn RangeSource,
    entry: &Entry,
) -> Result<String, ArchiveError> {
    let bytes = read_member(src, entry).await?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Scan `buf` backward for the EOCD signature, returning its offset within
/// `buf`. The trailer sits at the very end unless an archive comment
/// follows it, hence the reverse scan.
fn find_eocd(buf: &[u8]) -> Option<usize> {
    if (buf.len() as u64) < EOCD_LEN {
        return None;
    }
    let last = buf.len() - EOCD_LEN as usize;
    (0..=last).rev().find(|&pos| le32(&buf[pos..]) == EOCD_SIG)
}

/// Walk fixed-layout central-directory headers. Stops at the first failed
/// signature check.
fn parse_central_directory(buf: &[u8]) -> Vec<Entry> {
    let mut entries = Vec::new();
    let mut pos = 0usize;

    while pos + 46 <= buf.len() && le32(&buf[pos..]) == CD_ENTRY_SIG {
        let compression = le16(&buf[pos + 10..]);
        let compressed_size = le32(&buf[pos + 20..]);
        let uncompressed_size = le32(&buf[pos + 24..]);
        let name_len = le16(&buf[pos + 28..]) as usize;
        let extra_len = le16(&buf[pos + 30..]) as usize;
        let comment_len = le16(&buf[pos + 32..]) as usize;
        let local_header_offset = le32(&buf[pos + 42..]);

        let name_end = pos + 46 + name_len;
        if name_end > buf.len() {
            break;
        }
        let name = String::from_utf8_lossy(&buf[pos + 46..name_end]).into_owned();

        entries.push(Entry {
            name,
            compression,
            compressed_size,
            uncompressed_size,
            local_header_offset,
        });

        pos += 46 + name_len + extra_len + comment_len;
    }

    entries
}

fn le16(buf: &[u8]) -> u16 {
    u16::from_le_bytes([buf[0], buf[1]])
}

fn le32(buf: &[u8]) -> u32 {
    u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])
}

/// HTTP transport for [`RangeSource`]: one `Range: bytes=start-end` GET per
/// fetch. `206 Partial Content` is the expected reply; a server ignoring
/// the range header and answering `200 OK` is tolerated by keeping the
/// first `end - start + 1` bytes of the body.
pub struct HttpRangeSource {
    client: reqwest::Client,
    url: String,
    size: u64,
}

impl HttpRangeSource {
    pub fn new(client: reqwest::Client, url: String, size: u64) -> Self {
        Self { client, url, size }
    }
}

#[async_trait]
impl RangeSource for HttpRangeSource {
    fn len(&self) -> u64 {
        self.size
    }

    async fn fetch(&self, start: u64, end: u64) -> Result<Vec<u8>, ArchiveError> {
        let response = self
            .client
            .get(&self.url)
            .header(reqwest::header::RANGE, format!("bytes={}-{}", start, end))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ArchiveError::RangeFailed {
                status: status.as_u16(),
            });
        }

        let mut data = response.bytes().await?.to_vec();
        let wanted = (end - start + 1) as usize;
        if status != reqwest::StatusCode::PARTIAL_CONTENT && data.len() > wanted {
            data.truncate(wanted);
        }
        Ok(data)
    }
}

#[cfg(test)]
pub mod testkit {
    //! In-memory archives for tests: a byte-accurate ZIP writer and a
    //! [`RangeSource`] over a buffer with a request counter.

    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    pub struct MemSource {
        data: Vec<u8>,
        claimed_len: u64,
        fetches: AtomicUsize,
    }

    impl MemSource {
        pub fn new(data: Vec<u8>) -> Self {
            let claimed_len = data.len() as u64;
            Self {
                data,
                claimed_len,
                fetches: AtomicUsize::new(0),
            }
        }

        /// A source that advertises `claimed_len` but can only serve what it
        /// holds, emulating a truncated origin.
        pub fn truncated(data: Vec<u8>, claimed_len: u64) -> Self {
            Self {
                data,
                claimed_len,
                fetches: AtomicUsize::new(0),
            }
        }

        pub fn fetch_count(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RangeSource for MemSource {
        fn len(&self) -> u64 {
            self.claimed_len
        }

        async fn fetch(&self, start: u64, end: u64) -> Result<Vec<u8>, ArchiveError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let start = start as usize;
            let end = ((end + 1) as usize).min(self.data.len());
            if start >= end {
                return Ok(Vec::new());
            }
            Ok(self.data[start..end].to_vec())
        }
    }

    enum Payload {
        Stored(Vec<u8>),
        Deflate(Vec<u8>),
        Raw { method: u16, data: Vec<u8> },
    }

    struct Member {
        name: String,
        payload: Payload,
        uncompressed_size: u32,
        crc: u32,
    }

    /// Builds structurally valid archives one member at a time.
    pub struct ArchiveBuilder {
        members: Vec<Member>,
        local_extra: Vec<u8>,
        comment: Vec<u8>,
    }

    impl Default for ArchiveBuilder {
        fn default() -> Self {
            Self::new()
        }
    }

    impl ArchiveBuilder {
        pub fn new() -> Self {
            Self {
                members: Vec::new(),
                local_extra: Vec::new(),
                comment: Vec::new(),
            }
        }

        /// Add a DEFLATE-compressed member.
        pub fn member(mut self, name: &str, data: &[u8]) -> Self {
            use std::io::Read;
            let mut compressed = Vec::new();
            flate2::read::DeflateEncoder::new(data, flate2::Compression::default())
                .read_to_end(&mut compressed)
                .unwrap();
            self.members.push(Member {
                name: name.to_string(),
                payload: Payload::Deflate(compressed),
                uncompressed_size: data.len() as u32,
                crc: crc32(data),
            });
            self
        }

        /// Add a STORED (uncompressed) member.
        pub fn member_stored(mut self, name: &str, data: &[u8]) -> Self {
            self.members.push(Member {
                name: name.to_string(),
                payload: Payload::Stored(data.to_vec()),
                uncompressed_size: data.len() as u32,
                crc: crc32(data),
            });
            self
        }

        /// Add a member claiming an arbitrary compression method.
        pub fn member_raw(mut self, name: &str, method: u16, data: &[u8]) -> Self {
            self.members.push(Member {
                name: name.to_string(),
                payload: Payload::Raw {
                    method,
                    data: data.to_vec(),
                },
                uncompressed_size: data.len() as u32,
                crc: 0,
            });
            self
        }

        /// Pad every local header with an extra field of `len` bytes. The
        /// central directory keeps extra_len = 0, so readers that trust the
        /// central copy misplace the payload.
        pub fn local_extra(mut self, len: usize) -> Self {
            self.local_extra = vec![0xAA; len];
            self
        }

        /// Append an EOCD comment so the trailer is not at the very end.
        pub fn comment(mut self, text: &str) -> Self {
            self.comment = text.as_bytes().to_vec();
            self
        }

        pub fn build(self) -> Vec<u8> {
            let mut out = Vec::new();
            let mut catalog = Vec::new();

            for member in &self.members {
                let (method, data) = match &member.payload {
                    Payload::Stored(data) => (COMPRESSION_STORED, data),
                    Payload::Deflate(data) => (COMPRESSION_DEFLATE, data),
                    Payload::Raw { method, data } => (*method, data),
                };
                let offset = out.len() as u32;
                catalog.push((member, method, data.len() as u32, offset));

                // Local file header
                out.extend_from_slice(&0x0403_4b50u32.to_le_bytes());
                out.extend_from_slice(&20u16.to_le_bytes()); // version needed
                out.extend_from_slice(&0u16.to_le_bytes()); // flags
                out.extend_from_slice(&method.to_le_bytes());
                out.extend_from_slice(&0u16.to_le_bytes()); // mod time
                out.extend_from_slice(&0u16.to_le_bytes()); // mod date
                out.extend_from_slice(&member.crc.to_le_bytes());
                out.extend_from_slice(&(data.len() as u32).to_le_bytes());
                out.extend_from_slice(&member.uncompressed_size.to_le_bytes());
                out.extend_from_slice(&(member.name.len() as u16).to_le_bytes());
                out.extend_from_slice(&(self.local_extra.len() as u16).to_le_bytes());
                out.extend_from_slice(member.name.as_bytes());
                out.extend_from_slice(&self.local_extra);
                out.extend_from_slice(data);
            }

            let cd_offset = out.len() as u32;
            for (member, method, compressed_size, offset) in &catalog {
                out.extend_from_slice(&CD_ENTRY_SIG.to_le_bytes());
                out.extend_from_slice(&20u16.to_le_bytes()); // version made by
                out.extend_from_slice(&20u16.to_le_bytes()); // version needed
                out.extend_from_slice(&0u16.to_le_bytes()); // flags
                out.extend_from_slice(&method.to_le_bytes());
                out.extend_from_slice(&0u16.to_le_bytes()); // mod time
                out.extend_from_slice(&0u16.to_le_bytes()); // mod date
                out.extend_from_slice(&member.crc.to_le_bytes());
                out.extend_from_slice(&compressed_size.to_le_bytes());
                out.extend_from_slice(&member.uncompressed_size.to_le_bytes());
                out.extend_from_slice(&(member.name.len() as u16).to_le_bytes());
                out.extend_from_slice(&0u16.to_le_bytes()); // extra len
                out.extend_from_slice(&0u16.to_le_bytes()); // comment len
                out.extend_from_slice(&0u16.to_le_bytes()); // disk number
                out.extend_from_slice(&0u16.to_le_bytes()); // internal attrs
                out.extend_from_slice(&0u32.to_le_bytes()); // external attrs
                out.extend_from_slice(&offset.to_le_bytes());
                out.extend_from_slice(member.name.as_bytes());
            }
            let cd_size = out.len() as u32 - cd_offset;

            // EOCD
            out.extend_from_slice(&EOCD_SIG.to_le_bytes());
            out.extend_from_slice(&0u16.to_le_bytes()); // disk number
            out.extend_from_slice(&0u16.to_le_bytes()); // cd start disk
            out.extend_from_slice(&(catalog.len() as u16).to_le_bytes());
            out.extend_from_slice(&(catalog.len() as u16).to_le_bytes());
            out.extend_from_slice(&cd_size.to_le_bytes());
            out.extend_from_slice(&cd_offset.to_le_bytes());
            out.extend_from_slice(&(self.comment.len() as u16).to_le_bytes());
            out.extend_from_slice(&self.comment);
            out
        }
    }

    fn crc32(data: &[u8]) -> u32 {
        let mut crc = flate2::Crc::new();
        crc.update(data);
        crc.sum()
    }
}
