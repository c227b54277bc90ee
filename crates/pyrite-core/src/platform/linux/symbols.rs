//! # ELF Symbol Index
//!
//! Builds a name → address table from every file-backed image mapped into
//! the target, relocated by each image's load bias.
//!
//! ## Load bias
//!
//! For a position-independent image the addresses in its symbol tables are
//! link-time virtual addresses. The bias is the difference between where
//! the lowest `PT_LOAD` segment landed (the lowest mapping of the file in
//! `/proc/<pid>/maps`) and the page-aligned vaddr of that segment. Non-PIE
//! executables get a bias of zero.
//!
//! ## Symbol files
//!
//! A separate symbol file (for example the `.debug` file of a stripped
//! runtime) carries the same link-time addresses as the image it belongs
//! to. It is relocated with the bias of the runtime image and its symbols
//! win over anything found in the mapped images.
//!
//! ## References
//!
//! - [proc(5): /proc/pid/maps](https://man7.org/linux/man-pages/man5/proc.5.html)
//! - [elf(5)](https://man7.org/linux/man-pages/man5/elf.5.html)

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use object::{Object, ObjectSegment, ObjectSymbol, SymbolKind};
use tracing::{debug, trace};

use super::maps::MappedImage;
use crate::backend::Symbol;
use crate::layout::BuildSignature;
use crate::types::Address;

const PAGE_MASK: u64 = !0xfff;

/// Relocated symbols of one process
#[derive(Debug, Default)]
pub struct SymbolIndex
{
    by_name: HashMap<String, Symbol>,
}

impl SymbolIndex
{
    /// Index every image of `pid`, plus the optional symbol file
    ///
    /// Images that can't be read or parsed are skipped; a missing symbol
    /// surfaces later as a lookup failure.
    pub fn load(pid: i32, images: &[MappedImage], symbol_file: Option<&Path>) -> Self
    {
        let mut index = Self::default();

        if let Some(file) = symbol_file {
            let runtime = images
                .iter()
                .find(|image| BuildSignature::from_image_path(&image.path).is_some());
            match runtime {
                Some(runtime) => match read_image(file, runtime.base) {
                    Ok(symbols) => {
                        debug!(file = %file.display(), count = symbols.len(), "loaded symbol file");
                        index.extend(symbols);
                    }
                    Err(reason) => debug!(file = %file.display(), %reason, "symbol file unusable"),
                },
                None => debug!(file = %file.display(), "no runtime image to relocate the symbol file against"),
            }
        }

        for image in images {
            match read_image(&on_disk(pid, &image.path), image.base) {
                Ok(symbols) => {
                    trace!(image = %image.path.display(), count = symbols.len(), "indexed image");
                    index.extend(symbols);
                }
                Err(reason) => debug!(image = %image.path.display(), %reason, "skipping image"),
            }
        }

        index
    }

    /// Look up a symbol by exact name
    pub fn get(&self, name: &str) -> Option<&Symbol>
    {
        self.by_name.get(name)
    }

    /// Number of distinct names
    pub fn len(&self) -> usize
    {
        self.by_name.len()
    }

    /// Whether nothing was indexed
    pub fn is_empty(&self) -> bool
    {
        self.by_name.is_empty()
    }

    /// First definition of a name wins
    fn extend(&mut self, symbols: Vec<Symbol>)
    {
        for symbol in symbols {
            self.by_name.entry(symbol.name.clone()).or_insert(symbol);
        }
    }
}

/// Path through the target's root, so images in other mount namespaces
/// (containers) resolve to the file the target actually mapped
fn on_disk(pid: i32, path: &Path) -> PathBuf
{
    let rooted = PathBuf::from(format!("/proc/{pid}/root{}", path.display()));
    if rooted.exists() {
        rooted
    } else {
        path.to_path_buf()
    }
}

fn read_image(path: &Path, base: u64) -> Result<Vec<Symbol>, String>
{
    let data = fs::read(path).map_err(|err| err.to_string())?;
    let file = object::File::parse(&*data).map_err(|err| err.to_string())?;
    Ok(relocated_symbols(&file, base))
}

/// Defined code and data symbols of `file`, relocated for an image whose
/// lowest mapping starts at `base`
fn relocated_symbols(file: &object::File<'_>, base: u64) -> Vec<Symbol>
{
    let link_base = file
        .segments()
        .map(|segment| segment.address())
        .min()
        .unwrap_or(0)
        & PAGE_MASK;
    let bias = base.wrapping_sub(link_base);

    file.symbols()
        .chain(file.dynamic_symbols())
        .filter(|symbol| !symbol.is_undefined() && symbol.address() != 0)
        .filter(|symbol| matches!(symbol.kind(), SymbolKind::Text | SymbolKind::Data | SymbolKind::Unknown))
        .filter_map(|symbol| {
            let name = symbol.name().ok()?;
            if name.is_empty() {
                return None;
            }
            Some(Symbol {
                name: name.to_string(),
                address: Address::new(symbol.address().wrapping_add(bias)),
                size: symbol.size(),
            })
        })
        .collect()
}
