//! Post-write media check against the checksum embedded in ISO 9660 images.
//!
//! Publishers implant an MD5 of the image into the application-use area of
//! the Primary Volume Descriptor (the `isomd5sum` format). The digest covers
//! the first `isosize - skipsectors * 2048` bytes with that 512-byte area
//! read as ASCII spaces, so it can be checked straight off a written drive.
use crate::checksum::{Checksum, ChecksumAlgorithm};
use std::fs::OpenOptions;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

pub const SECTOR_SIZE: u64 = 2048;
/// First volume descriptor lives in sector 16.
const DESCRIPTOR_START: u64 = 16 * SECTOR_SIZE;
/// Upper bound on descriptors scanned before giving up on finding the PVD.
const MAX_DESCRIPTORS: u64 = 64;
const APPDATA_OFFSET: u64 = 883;
const APPDATA_LEN: usize = 512;
/// Big-endian half of the both-endian volume space size.
const SIZE_OFFSET: usize = 84;
const DEFAULT_SKIP_SECTORS: u64 = 15;
const READ_CHUNK: usize = 64 * 1024;

/// The record found in the application-use area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedChecksum {
    pub md5: String,
    pub skip_sectors: u64,
    /// Image size in bytes according to the PVD.
    pub iso_size: u64,
    /// Byte offset of the PVD.
    pub pvd_offset: u64,
    /// `RHLISOSTATUS`, when present.
    pub supported: Option<bool>,
    pub fragment_sums: Option<String>,
    pub fragment_count: Option<u64>,
}

impl EmbeddedChecksum {
    /// Bytes covered by the digest.
    pub fn covered_len(&self) -> u64 {
        self.iso_size
            .saturating_sub(self.skip_sectors * SECTOR_SIZE)
    }

    fn appdata_range(&self) -> (u64, u64) {
        let start = self.pvd_offset + APPDATA_OFFSET;
        (start, start + APPDATA_LEN as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaCheck {
    /// No embedded checksum; treated as a pass.
    NotFound,
    Passed,
    Failed { embedded: String, computed: String },
}

impl MediaCheck {
    pub fn is_pass(&self) -> bool {
        !matches!(self, MediaCheck::Failed { .. })
    }
}

/// Locates the PVD; returns its offset and raw sector.
fn find_pvd<R: Read + Seek>(reader: &mut R) -> io::Result<Option<(u64, Vec<u8>)>> {
    let mut sector = vec![0u8; SECTOR_SIZE as usize];
    for index in 0..MAX_DESCRIPTORS {
        let offset = DESCRIPTOR_START + index * SECTOR_SIZE;
        reader.seek(SeekFrom::Start(offset))?;
        match reader.read_exact(&mut sector) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        match sector[0] {
            1 if &sector[1..6] == b"CD001" => return Ok(Some((offset, sector))),
            255 => return Ok(None),
            _ => {}
        }
    }
    Ok(None)
}

fn parse_appdata(appdata: &[u8]) -> (Option<String>, Option<u64>, Option<bool>, Option<String>, Option<u64>) {
    let text = String::from_utf8_lossy(appdata);
    let mut md5 = None;
    let mut skip = None;
    let mut supported = None;
    let mut fragment_sums = None;
    let mut fragment_count = None;

    for record in text.split(';').map(|r| r.trim_matches(|c: char| c == ' ' || c == '\0')) {
        if let Some(value) = record.strip_prefix("ISO MD5SUM = ") {
            let value = value.trim();
            if value.len() == 32 && value.chars().all(|c| c.is_ascii_hexdigit()) {
                md5 = Some(value.to_ascii_lowercase());
            }
        } else if let Some(value) = record.strip_prefix("SKIPSECTORS = ") {
            skip = value.trim().parse().ok();
        } else if let Some(value) = record.strip_prefix("RHLISOSTATUS=") {
            supported = Some(value.trim() == "1");
        } else if let Some(value) = record.strip_prefix("FRAGMENT SUMS = ") {
            fragment_sums = Some(value.trim().to_string());
        } else if let Some(value) = record.strip_prefix("FRAGMENT COUNT = ") {
            fragment_count = value.trim().parse().ok();
        }
    }

    (md5, skip, supported, fragment_sums, fragment_count)
}

/// Reads the embedded checksum record, if the medium carries one.
pub fn read_embedded<R: Read + Seek>(reader: &mut R) -> io::Result<Option<EmbeddedChecksum>> {
    let Some((pvd_offset, pvd)) = find_pvd(reader)? else {
        return Ok(None);
    };

    let start = APPDATA_OFFSET as usize;
    let (md5, skip, supported, fragment_sums, fragment_count) =
        parse_appdata(&pvd[start..start + APPDATA_LEN]);
    let (Some(md5), Some(skip_sectors)) = (md5, skip) else {
        return Ok(None);
    };

    let size_bytes: [u8; 4] = pvd[SIZE_OFFSET..SIZE_OFFSET + 4]
        .try_into()
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidData))?;
    let iso_size = u64::from(u32::from_be_bytes(size_bytes)) * SECTOR_SIZE;

    Ok(Some(EmbeddedChecksum {
        md5,
        skip_sectors,
        iso_size,
        pvd_offset,
        supported,
        fragment_sums,
        fragment_count,
    }))
}

/// Replaces the part of `buf` (which starts at byte `offset` of the medium)
/// that overlaps `range` with spaces.
fn blank_range(buf: &mut [u8], offset: u64, range: (u64, u64)) {
    let end = offset + buf.len() as u64;
    let from = range.0.max(offset);
    let to = range.1.min(end);
    if from < to {
        buf[(from - offset) as usize..(to - offset) as usize].fill(b' ');
    }
}

/// MD5 over the covered bytes with the record area blanked.
fn digest<R: Read + Seek>(
    reader: &mut R,
    record: &EmbeddedChecksum,
    mut on_progress: impl FnMut(u64),
) -> io::Result<String> {
    let total = record.covered_len();
    let range = record.appdata_range();
    let mut sum = Checksum::new(ChecksumAlgorithm::Md5);
    let mut buf = vec![0u8; READ_CHUNK];
    let mut offset = 0u64;

    reader.seek(SeekFrom::Start(0))?;
    while offset < total {
        let want = (total - offset).min(READ_CHUNK as u64) as usize;
        let n = reader.read(&mut buf[..want])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("medium ended at {offset} of {total} bytes"),
            ));
        }
        blank_range(&mut buf[..n], offset, range);
        sum.update(&buf[..n]);
        offset += n as u64;
        on_progress(offset);
    }

    Ok(sum.finalize())
}

/// Scans a medium for its embedded checksum and verifies it.
///
/// `on_progress` receives the cumulative number of bytes scanned.
///
/// # Errors
///
/// Returns an error when the medium cannot be read, or ends before the size
/// its volume descriptor claims.
pub fn check_media<R: Read + Seek>(
    reader: &mut R,
    on_progress: impl FnMut(u64),
) -> io::Result<MediaCheck> {
    let Some(record) = read_embedded(reader)? else {
        tracing::info!("no embedded checksum found");
        return Ok(MediaCheck::NotFound);
    };
    tracing::debug!(?record, "embedded checksum found");

    let computed = digest(reader, &record, on_progress)?;
    if computed.eq_ignore_ascii_case(&record.md5) {
        Ok(MediaCheck::Passed)
    } else {
        Ok(MediaCheck::Failed {
            embedded: record.md5,
            computed,
        })
    }
}

/// Implants an embedded checksum into the ISO image at `path` and returns it.
///
/// # Errors
///
/// Fails with `InvalidData` if the image has no Primary Volume Descriptor.
pub fn implant(path: &Path) -> io::Result<String> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let (pvd_offset, pvd) = find_pvd(&mut file)?.ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "no primary volume descriptor")
    })?;

    let size_bytes: [u8; 4] = pvd[SIZE_OFFSET..SIZE_OFFSET + 4]
        .try_into()
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidData))?;
    let record = EmbeddedChecksum {
        md5: String::new(),
        skip_sectors: DEFAULT_SKIP_SECTORS,
        iso_size: u64::from(u32::from_be_bytes(size_bytes)) * SECTOR_SIZE,
        pvd_offset,
        supported: Some(true),
        fragment_sums: None,
        fragment_count: None,
    };

    let md5 = digest(&mut file, &record, |_| {})?;
    let text = format!(
        "ISO MD5SUM = {md5};SKIPSECTORS = {};RHLISOSTATUS=1;THIS IS NOT THE SAME AS RUNNING MD5SUM ON THIS ISO!!",
        record.skip_sectors
    );
    let mut appdata = [b' '; APPDATA_LEN];
    let len = text.len().min(APPDATA_LEN);
    appdata[..len].copy_from_slice(&text.as_bytes()[..len]);

    file.seek(SeekFrom::Start(record.appdata_range().0))?;
    file.write_all(&appdata)?;
    file.sync_all()?;
    Ok(md5)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::SECTOR_SIZE;

    /// A minimal ISO 9660 skeleton: system area, PVD at sector 16, set
    /// terminator at 17, then `data_sectors` of patterned payload.
    pub fn iso_image(data_sectors: u64) -> Vec<u8> {
        let sectors = 18 + data_sectors;
        let mut image = vec![0u8; (sectors * SECTOR_SIZE) as usize];

        let pvd = (16 * SECTOR_SIZE) as usize;
        image[pvd] = 1;
        image[pvd + 1..pvd + 6].copy_from_slice(b"CD001");
        image[pvd + 6] = 1;
        let count = sectors as u32;
        image[pvd + 80..pvd + 84].copy_from_slice(&count.to_le_bytes());
        image[pvd + 84..pvd + 88].copy_from_slice(&count.to_be_bytes());

        let term = (17 * SECTOR_SIZE) as usize;
        image[term] = 255;
        image[term + 1..term + 6].copy_from_slice(b"CD001");

        for (i, byte) in image[(18 * SECTOR_SIZE) as usize..].iter_mut().enumerate() {
            *byte = (i % 253) as u8;
        }
        image
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::iso_image;
    use super::*;
    use std::io::Cursor;
    use tempfile::NamedTempFile;

    fn implanted(data_sectors: u64) -> (NamedTempFile, String) {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), iso_image(data_sectors)).unwrap();
        let md5 = implant(file.path()).unwrap();
        (file, md5)
    }

    #[test]
    fn implanted_checksum_is_found_and_passes() {
        let (file, md5) = implanted(40);
        let mut reader = std::fs::File::open(file.path()).unwrap();

        let record = read_embedded(&mut reader).unwrap().unwrap();
        assert_eq!(record.md5, md5);
        assert_eq!(record.skip_sectors, 15);
        assert_eq!(record.iso_size, 58 * SECTOR_SIZE);
        assert_eq!(record.pvd_offset, 16 * SECTOR_SIZE);
        assert_eq!(record.supported, Some(true));

        let mut progress = Vec::new();
        let result = check_media(&mut reader, |p| progress.push(p)).unwrap();
        assert_eq!(result, MediaCheck::Passed);
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*progress.last().unwrap(), record.covered_len());
    }

    #[test]
    fn trailing_device_bytes_do_not_matter() {
        let (file, _) = implanted(20);
        let mut data = std::fs::read(file.path()).unwrap();
        data.extend(vec![0xEE; 1024 * 1024]);
        assert_eq!(check_media(&mut Cursor::new(data), |_| {}).unwrap(), MediaCheck::Passed);
    }

    #[test]
    fn corrupted_payload_fails() {
        let (file, md5) = implanted(40);
        let mut data = std::fs::read(file.path()).unwrap();
        let victim = (20 * SECTOR_SIZE + 7) as usize;
        data[victim] ^= 0xFF;
        match check_media(&mut Cursor::new(data), |_| {}).unwrap() {
            MediaCheck::Failed { embedded, computed } => {
                assert_eq!(embedded, md5);
                assert_ne!(computed, md5);
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn skipped_sectors_are_not_covered() {
        let (file, _) = implanted(40);
        let mut data = std::fs::read(file.path()).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        assert_eq!(check_media(&mut Cursor::new(data), |_| {}).unwrap(), MediaCheck::Passed);
    }

    #[test]
    fn plain_image_has_no_checksum() {
        let data = iso_image(4);
        assert_eq!(check_media(&mut Cursor::new(data), |_| {}).unwrap(), MediaCheck::NotFound);
        assert_eq!(
            check_media(&mut Cursor::new(vec![0u8; 4096]), |_| {}).unwrap(),
            MediaCheck::NotFound
        );
    }

    #[test]
    fn truncated_medium_is_an_error() {
        let (file, _) = implanted(40);
        let mut data = std::fs::read(file.path()).unwrap();
        data.truncate((30 * SECTOR_SIZE) as usize);
        let err = check_media(&mut Cursor::new(data), |_| {}).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn appdata_records_are_parsed() {
        let mut area = [b' '; APPDATA_LEN];
        let text = b"ISO MD5SUM = 0123456789ABCDEF0123456789abcdef;SKIPSECTORS = 15;RHLISOSTATUS=0;FRAGMENT SUMS = abcdef;FRAGMENT COUNT = 20;";
        area[..text.len()].copy_from_slice(text);
        let (md5, skip, supported, sums, count) = parse_appdata(&area);
        assert_eq!(md5.as_deref(), Some("0123456789abcdef0123456789abcdef"));
        assert_eq!(skip, Some(15));
        assert_eq!(supported, Some(false));
        assert_eq!(sums.as_deref(), Some("abcdef"));
        assert_eq!(count, Some(20));
    }

    #[test]
    fn blanking_only_touches_the_overlap() {
        let mut buf = vec![b'x'; 10];
        blank_range(&mut buf, 100, (105, 200));
        assert_eq!(&buf, b"xxxxx     ");
        let mut buf = vec![b'x'; 10];
        blank_range(&mut buf, 0, (20, 30));
        assert_eq!(&buf, b"xxxxxxxxxx");
    }
}
