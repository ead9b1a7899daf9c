use std::io::{self, Read, Seek, SeekFrom};

use memchr::memmem;

use super::superblock::{Superblock, MAGIC, SUPERBLOCK_SIZE};

const SCAN_CHUNK: usize = 1 << 20;

/// Find the byte offset of a SquashFS superblock inside `r`.
///
/// Images are usually at offset 0, which is tried first. Otherwise the whole source is scanned
/// for the magic and the first candidate whose header is a plausible 4.0 superblock that fits
/// in the source wins. This covers images appended to executables or embedded in firmware.
pub fn find_superblock_offset<R>(r: &mut R) -> io::Result<Option<u64>>
where R: Read + Seek
{
    let len = r.seek(SeekFrom::End(0))?;
    if probe(r, 0, len)? {
        return Ok(Some(0));
    }

    let magic = MAGIC.to_le_bytes();
    let finder = memmem::Finder::new(&magic);
    let mut buf = vec![0; SCAN_CHUNK];
    let mut chunk_start = 0u64;
    while chunk_start < len {
        r.seek(SeekFrom::Start(chunk_start))?;
        let n = read_up_to(r, &mut buf)?;
        if n == 0 {
            break;
        }
        let candidates: Vec<usize> = finder.find_iter(&buf[..n]).collect();
        for pos in candidates {
            let candidate = chunk_start + pos as u64;
            if candidate != 0 && probe(r, candidate, len)? {
                return Ok(Some(candidate));
            }
        }
        if chunk_start + n as u64 >= len || n <= magic.len() {
            break;
        }
        // Overlap consecutive chunks so a magic split across them is still seen.
        chunk_start += (n - (magic.len() - 1)) as u64;
    }
    Ok(None)
}

fn probe<R: Read + Seek>(r: &mut R, offset: u64, len: u64) -> io::Result<bool> {
    if len.saturating_sub(offset) < SUPERBLOCK_SIZE as u64 {
        return Ok(false);
    }
    let mut raw = [0u8; SUPERBLOCK_SIZE];
    r.seek(SeekFrom::Start(offset))?;
    r.read_exact(&mut raw)?;
    let sb = Superblock::from_bytes(&raw)?;
    Ok(sb.looks_valid() && sb.bytes_used <= len - offset)
}

fn read_up_to<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
