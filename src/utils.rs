use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{self, BufReader, Read, stdin};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Thomas Wang's 64-bit integer hash. Used for minimizer hashing, cache
/// fingerprints and per-read RNG seeding.
pub fn hash_64(key: u64) -> u64 {
    let mut key = key;
    key = key.wrapping_add(!key.wrapping_shl(32));
    key ^= key.wrapping_shr(22);
    key = key.wrapping_add(!key.wrapping_shl(13));
    key ^= key.wrapping_shr(8);
    key = key.wrapping_add(key.wrapping_shl(3));
    key ^= key.wrapping_shr(15);
    key = key.wrapping_add(!key.wrapping_shl(27));
    key ^= key.wrapping_shr(31);
    key
}

pub fn realtime() -> f64 {
    let now = SystemTime::now();
    let since_epoch = now.duration_since(UNIX_EPOCH).expect("Time went backwards");
    since_epoch.as_secs_f64()
}

pub fn cputime() -> f64 {
    let rusage = unsafe {
        let mut rusage = std::mem::MaybeUninit::uninit();
        libc::getrusage(libc::RUSAGE_SELF, rusage.as_mut_ptr());
        rusage.assume_init()
    };
    let user_time = rusage.ru_utime;
    let sys_time = rusage.ru_stime;
    (user_time.tv_sec as f64 + user_time.tv_usec as f64 * 1e-6)
        + (sys_time.tv_sec as f64 + sys_time.tv_usec as f64 * 1e-6)
}

/// Fatal error path for configuration/usage and input desynchronisation
/// errors: one message, non-zero exit. Recoverable per-read anomalies never
/// come through here.
pub fn exit_with_message(msg: &str) -> ! {
    log::error!("{}", msg);
    std::process::exit(1);
}

pub fn xopen(path: &Path) -> io::Result<Box<dyn Read + Send + Sync>> {
    if path.to_str() == Some("-") {
        return Ok(Box::new(BufReader::new(stdin())));
    }
    let file = File::open(path)?;
    Ok(Box::new(BufReader::new(file)))
}

/// BGZF files carry a gzip extra field with the "BC" subfield id.
fn is_bgzf_header(header: &[u8], n: usize) -> bool {
    n >= 18
        && header[0] == 0x1f
        && header[1] == 0x8b
        && header[3] & 0x04 != 0
        && header[12] == b'B'
        && header[13] == b'C'
}

/// Open a possibly-compressed file for reading. Detection is by magic bytes,
/// not extension, so renamed `.fastq` files that are really gzip still work.
/// BGZF (the block-gzip variant sequencing tools emit) gets its own reader;
/// plain gzip falls back to a multi-member decoder.
pub fn xzopen(path: &Path) -> io::Result<Box<dyn Read + Send + Sync>> {
    if path.to_str() == Some("-") {
        return xopen(path);
    }
    let mut file = File::open(path)?;
    let mut header = [0u8; 18];
    let mut n = 0;
    while n < header.len() {
        let read = file.read(&mut header[n..])?;
        if read == 0 {
            break;
        }
        n += read;
    }
    let file = File::open(path)?;
    if is_bgzf_header(&header, n) {
        Ok(Box::new(noodles_bgzf::Reader::new(file)))
    } else if n >= 2 && header[0] == 0x1f && header[1] == 0x8b {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_64_is_deterministic() {
        assert_eq!(hash_64(0), hash_64(0));
        assert_eq!(hash_64(12345), hash_64(12345));
        assert_ne!(hash_64(1), hash_64(2));
    }

    #[test]
    fn test_hash_64_spreads_low_bits() {
        // Successive keys should not land in successive buckets.
        let a = hash_64(100) % 1024;
        let b = hash_64(101) % 1024;
        let c = hash_64(102) % 1024;
        assert!(!(a + 1 == b && b + 1 == c));
    }
}
