//! `/proc/<pid>/maps` parsing.

use std::fs;
use std::io;
use std::path::PathBuf;

/// One line of `/proc/<pid>/maps`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping
{
    /// First address
    pub start: u64,
    /// One past the last address
    pub end: u64,
    /// `rwxp` permission string
    pub perms: String,
    /// Offset into the backing file
    pub offset: u64,
    /// Backing file, for file-backed mappings
    pub path: Option<PathBuf>,
}

/// A file-backed image and the lowest address it is mapped at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedImage
{
    /// Path of the image as the target sees it
    pub path: PathBuf,
    /// Lowest mapped address
    pub base: u64,
}

/// Read and parse the mappings of `pid`
pub fn read_maps(pid: i32) -> io::Result<Vec<Mapping>>
{
    Ok(parse_maps(&fs::read_to_string(format!("/proc/{pid}/maps"))?))
}

/// Parse the text of a maps file, skipping lines that don't parse
pub fn parse_maps(text: &str) -> Vec<Mapping>
{
    text.lines().filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<Mapping>
{
    let mut fields = line.splitn(6, ' ');
    let range = fields.next()?;
    let perms = fields.next()?;
    let offset = fields.next()?;
    let _device = fields.next()?;
    let _inode = fields.next()?;
    let path = fields.next().map(str::trim).unwrap_or("");

    let (start, end) = range.split_once('-')?;
    let path = path.strip_suffix(" (deleted)").unwrap_or(path);

    Some(Mapping {
        start: u64::from_str_radix(start, 16).ok()?,
        end: u64::from_str_radix(end, 16).ok()?,
        perms: perms.to_string(),
        offset: u64::from_str_radix(offset, 16).ok()?,
        path: path.starts_with('/').then(|| PathBuf::from(path)),
    })
}

/// File-backed images in first-mapped order, each with its lowest address
pub fn images(mappings: &[Mapping]) -> Vec<MappedImage>
{
    let mut images: Vec<MappedImage> = Vec::new();
    for mapping in mappings {
        let Some(path) = &mapping.path else {
            continue;
        };
        match images.iter_mut().find(|image| &image.path == path) {
            Some(image) => image.base = image.base.min(mapping.start),
            None => images.push(MappedImage {
                path: path.clone(),
                base: mapping.start,
            }),
        }
    }
    images
}
