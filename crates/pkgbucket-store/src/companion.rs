use crate::StoreError;
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Component, Path};
use tracing::{debug, warn};

/// Conventional folder packers nest archive contents under.
const PACKAGE_FOLDER: &str = "package";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Metadata files mirrored next to `package.json` when found in a tarball.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompanionFile {
    Composer,
    Extension,
}

impl CompanionFile {
    pub const ALL: [CompanionFile; 2] = [CompanionFile::Composer, CompanionFile::Extension];

    pub fn file_name(self) -> &'static str {
        match self {
            CompanionFile::Composer => "composer.json",
            CompanionFile::Extension => "extension.json",
        }
    }

    fn from_file_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.file_name() == name)
    }
}

impl std::fmt::Display for CompanionFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.file_name())
    }
}

/// Raw text of the companion files found in an archive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Companions {
    pub composer: Option<String>,
    pub extension: Option<String>,
}

impl Companions {
    pub fn get(&self, file: CompanionFile) -> Option<&str> {
        match file {
            CompanionFile::Composer => self.composer.as_deref(),
            CompanionFile::Extension => self.extension.as_deref(),
        }
    }

    fn slot(&mut self, file: CompanionFile) -> &mut Option<String> {
        match file {
            CompanionFile::Composer => &mut self.composer,
            CompanionFile::Extension => &mut self.extension,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.composer.is_none() && self.extension.is_none()
    }
}

/// Where an entry sits: lower ranks win.
/// 0 = archive root, 1 = `package/`, 2 = any other first-level folder.
fn entry_rank(path: &Path) -> Option<(CompanionFile, u8)> {
    let parts: Vec<&str> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => s.to_str(),
            _ => None,
        })
        .collect();
    let (name, dirs) = parts.split_last()?;
    let file = CompanionFile::from_file_name(name)?;
    match dirs {
        [] => Some((file, 0)),
        [dir] if *dir == PACKAGE_FOLDER => Some((file, 1)),
        [_] => Some((file, 2)),
        _ => None,
    }
}

fn archive_error(e: &std::io::Error) -> StoreError {
    StoreError::Archive(e.to_string())
}

/// Read the companion files out of a staged tarball without unpacking it.
///
/// Only entries named like a companion file at the archive root or one folder
/// deep are read. Gzip and plain tar are both accepted. Missing or empty files
/// come back as `None`; an unreadable archive is an error.
pub fn extract_companions(archive: &Path) -> Result<Companions, StoreError> {
    debug!("scanning {} for companion files", archive.display());
    let mut file = File::open(archive)?;
    let mut magic = [0u8; 2];
    let is_gzip = file.read_exact(&mut magic).is_ok() && magic == GZIP_MAGIC;
    file.seek(SeekFrom::Start(0))?;

    let reader: Box<dyn Read> = if is_gzip {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    let mut tar = tar::Archive::new(reader);

    let mut found = Companions::default();
    let mut ranks: [Option<u8>; 2] = [None, None];
    for entry in tar.entries().map_err(|e| archive_error(&e))? {
        let mut entry = entry.map_err(|e| archive_error(&e))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path().map_err(|e| archive_error(&e))?.into_owned();
        let Some((companion, rank)) = entry_rank(&path) else {
            continue;
        };
        let idx = companion as usize;
        if ranks[idx].is_some_and(|best| best <= rank) {
            continue;
        }
        let mut raw = Vec::new();
        entry
            .read_to_end(&mut raw)
            .map_err(|e| archive_error(&e))?;
        match String::from_utf8(raw) {
            Ok(text) => {
                debug!("found {companion} at {}", path.display());
                *found.slot(companion) = Some(text);
                ranks[idx] = Some(rank);
            }
            Err(_) => warn!("skipping {}: not valid UTF-8", path.display()),
        }
    }

    for companion in CompanionFile::ALL {
        let slot = found.slot(companion);
        if slot.as_deref().is_some_and(str::is_empty) {
            debug!("{companion} is empty, treating as absent");
            *slot = None;
        }
    }
    Ok(found)
}
