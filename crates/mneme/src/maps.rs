//! Process-level memory introspection: resident set size and the memory
//! map section written near the end of a capture.

use std::{fs, io};

use ahash::AHashMap;

use crate::records::ImageMap;

/// Resident set size of the current process, in bytes.
///
/// Reads `/proc/self/statm` (second field, in pages). On platforms without
/// procfs there is nothing cheap enough to poll every few milliseconds, so
/// the sampler records zero and the snapshots still serve as aggregation
/// boundaries.
#[must_use]
pub fn read_rss_bytes() -> u64 {
    #[cfg(target_os = "linux")]
    {
        let Ok(statm) = fs::read_to_string("/proc/self/statm") else {
            return 0;
        };
        let Some(resident_pages) = statm.split_whitespace().nth(1).and_then(|field| field.parse::<u64>().ok()) else {
            return 0;
        };
        resident_pages * page_size()
    }
    #[cfg(not(target_os = "linux"))]
    {
        0
    }
}

#[cfg(target_os = "linux")]
fn page_size() -> u64 {
    // SAFETY: sysconf with a valid name constant has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as u64 } else { 4096 }
}

/// The file-backed segments currently mapped into the process, grouped per
/// image, for resolving native instruction pointers after the fact.
///
/// Parses `/proc/self/maps`. Anonymous and pseudo mappings (`[heap]`,
/// `[stack]`, ...) carry no symbols and are skipped.
pub fn read_memory_maps() -> io::Result<Vec<ImageMap>> {
    let maps = fs::read_to_string("/proc/self/maps")?;
    Ok(parse_memory_maps(&maps))
}

fn parse_memory_maps(maps: &str) -> Vec<ImageMap> {
    let mut order: Vec<String> = Vec::new();
    let mut images: AHashMap<String, ImageMap> = AHashMap::new();

    for line in maps.lines() {
        // `start-end perms offset dev inode pathname`
        let mut fields = line.split_whitespace();
        let Some(range) = fields.next() else { continue };
        let Some((start, end)) = range.split_once('-') else { continue };
        let (Ok(start), Ok(end)) = (u64::from_str_radix(start, 16), u64::from_str_radix(end, 16)) else {
            continue;
        };
        let Some(filename) = fields.nth(4) else { continue };
        if filename.starts_with('[') {
            continue;
        }
        let image = images.entry(filename.to_owned()).or_insert_with(|| {
            order.push(filename.to_owned());
            ImageMap {
                filename: filename.to_owned(),
                base_addr: start,
                segments: Vec::new(),
            }
        });
        image.base_addr = image.base_addr.min(start);
        image.segments.push((start, end.saturating_sub(start)));
    }

    order
        .into_iter()
        .filter_map(|filename| images.remove(&filename))
        .collect()
}

/// Milliseconds since the Unix epoch, the clock used throughout captures.
#[must_use]
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
