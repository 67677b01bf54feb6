// files.rs — search paths, pk3 archives and archive extraction

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use rayon::prelude::*;

use crate::common::{com_dprintf, com_printf};
use crate::compression::decompress_with_size;
use crate::crc::crc32_block;
use crate::qcommon::{BASEGAME, PK3_EXT};
use crate::qfiles::{
    DZipHeader, MAX_FILES_IN_PACK, ZIP_FLAG_DATA_DESCRIPTOR, ZIP_FLAG_ENCRYPTED,
    ZIP_METHOD_DEFLATED, ZIP_METHOD_STORED, ZPAKDIRHEADER, ZPAKHEADER,
};

// ============================================================
// In-memory structures
// ============================================================

/// A member of a pk3 archive.
#[derive(Debug, Clone)]
pub struct PackFile {
    pub name: String,
    /// Offset of the member data (past the local header, name and extra field).
    pub filepos: u64,
    pub compressed_len: u32,
    pub filelen: u32,
    pub compression: u16,
    pub crc32: u32,
}

/// A loaded pk3 archive.
#[derive(Debug)]
pub struct Pack {
    pub filename: String,
    pub files: Vec<PackFile>,
    /// lowercase member name -> index in files
    file_index: HashMap<String, usize>,
}

impl Pack {
    pub fn new(filename: String, files: Vec<PackFile>) -> Self {
        let file_index = files
            .iter()
            .enumerate()
            .map(|(i, pf)| (pf.name.to_lowercase(), i))
            .collect();
        Self {
            filename,
            files,
            file_index,
        }
    }

    /// Finds a member by name (case-insensitive).
    #[inline]
    pub fn find_file(&self, filename: &str) -> Option<&PackFile> {
        self.file_index
            .get(&filename.to_lowercase())
            .map(|&idx| &self.files[idx])
    }

    /// Read and verify a member. Deflated members are inflated.
    pub fn read_file(&self, pf: &PackFile) -> io::Result<Vec<u8>> {
        let mut f = File::open(&self.filename)?;
        f.seek(SeekFrom::Start(pf.filepos))?;
        let mut raw = vec![0u8; pf.compressed_len as usize];
        f.read_exact(&mut raw)?;

        let data = match pf.compression {
            ZIP_METHOD_STORED => raw,
            ZIP_METHOD_DEFLATED => decompress_with_size(&raw, pf.filelen as usize)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("compression method {}", other),
                ))
            }
        };

        if crc32_block(&data) != pf.crc32 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{}: CRC mismatch in {}", self.filename, pf.name),
            ));
        }
        Ok(data)
    }
}

/// A single element on the search path, either a directory or a pk3.
#[derive(Debug)]
pub struct SearchPath {
    /// Directory path (used when `pack` is `None`).
    pub filename: String,
    pub pack: Option<Pack>,
}

// ============================================================
// Filesystem context
// ============================================================

/// Search path state. Earlier entries have higher priority.
#[derive(Debug, Default)]
pub struct FsContext {
    pub search_paths: Vec<SearchPath>,
    /// Active content set; empty means `BASEGAME`.
    pub gamedir: String,
}

impl FsContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current game directory, or BASEGAME if not set.
    pub fn gamedir(&self) -> &str {
        if self.gamedir.is_empty() {
            BASEGAME
        } else {
            &self.gamedir
        }
    }

    /// `base/game/file`. An empty game uses the default content set.
    pub fn build_os_path(base: &str, game: &str, file: &str) -> String {
        let game = if game.is_empty() { BASEGAME } else { game };
        let base = base.trim_end_matches(['/', '\\']);
        let file = file.trim_start_matches(['/', '\\']);
        format!("{}/{}/{}", base, game, file)
    }

    /// Rebuild the search path from the two roots and the content set.
    /// The default content set is always searched; a mod directory is
    /// layered on top of it. Homepath beats basepath within each set.
    pub fn init_filesystem(&mut self, homepath: &str, basepath: &str, game: &str) {
        self.search_paths.clear();
        self.gamedir = game.to_string();

        self.add_game_directory(basepath, BASEGAME);
        if homepath != basepath {
            self.add_game_directory(homepath, BASEGAME);
        }

        let game = self.gamedir().to_string();
        if !game.eq_ignore_ascii_case(BASEGAME) {
            self.add_game_directory(basepath, &game);
            if homepath != basepath {
                self.add_game_directory(homepath, &game);
            }
        }
    }

    // ============================================================
    // Search path construction
    // ============================================================

    /// Sorted list of the pk3 archives directly inside `dir`.
    pub fn list_pk3_files(dir: &str) -> Vec<String> {
        let entries = match fs::read_dir(dir) {
            Ok(e) => e,
            Err(_) => return Vec::new(),
        };
        let mut found: Vec<String> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.is_file()
                    && p
                        .extension()
                        .is_some_and(|ext| ext.eq_ignore_ascii_case(PK3_EXT))
            })
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .collect();
        found.sort();
        found
    }

    /// Adds `root/game` and every pk3 in it to the front of the search path.
    ///
    /// Archives are parsed in parallel; later archives in sort order end up
    /// with higher priority.
    pub fn add_game_directory(&mut self, root: &str, game: &str) {
        let dir = Self::build_os_path(root, game, "");
        let dir = dir.trim_end_matches('/').to_string();

        self.search_paths.insert(
            0,
            SearchPath {
                filename: dir.clone(),
                pack: None,
            },
        );

        let pk3files = Self::list_pk3_files(&dir);
        let loaded_packs: Vec<Option<Pack>> = pk3files
            .par_iter()
            .map(|path| Self::load_zip_file(path))
            .collect();

        for pack in loaded_packs.into_iter().flatten() {
            self.search_paths.insert(
                0,
                SearchPath {
                    filename: String::new(),
                    pack: Some(pack),
                },
            );
        }
    }

    /// Walks the local headers of a pk3, returning a `Pack` on success.
    pub fn load_zip_file(packfile: &str) -> Option<Pack> {
        let mut f = match File::open(packfile) {
            Ok(f) => f,
            Err(e) => {
                com_printf(&format!("WARNING: couldn't open {}: {}\n", packfile, e));
                return None;
            }
        };

        let mut files: Vec<PackFile> = Vec::new();

        for _ in 0..MAX_FILES_IN_PACK {
            let mut hdr_bytes = [0u8; DZipHeader::SIZE];
            if f.read_exact(&mut hdr_bytes).is_err() {
                break;
            }
            let hdr = DZipHeader::parse(&hdr_bytes);

            // Central directory means we are done
            if hdr.ident == ZPAKDIRHEADER {
                break;
            }
            if hdr.ident != ZPAKHEADER {
                if files.is_empty() {
                    com_printf(&format!("WARNING: {} is not a packfile\n", packfile));
                    return None;
                }
                break;
            }

            let mut name_bytes = vec![0u8; hdr.filename_length as usize];
            f.read_exact(&mut name_bytes).ok()?;
            let name = String::from_utf8_lossy(&name_bytes).into_owned();

            let data_offset = f.stream_position().ok()? + hdr.extra_field_length as u64;

            // Sizes live after the data; the next header can't be located.
            if hdr.flags & ZIP_FLAG_DATA_DESCRIPTOR != 0 {
                com_printf(&format!(
                    "WARNING: {}: {} uses a data descriptor, remaining members skipped\n",
                    packfile, name
                ));
                break;
            }

            let supported = hdr.flags & ZIP_FLAG_ENCRYPTED == 0
                && (hdr.compression == ZIP_METHOD_STORED || hdr.compression == ZIP_METHOD_DEFLATED);
            if !supported {
                com_printf(&format!("WARNING: {}: skipping {}\n", packfile, name));
            } else if !name.ends_with('/') {
                files.push(PackFile {
                    name,
                    filepos: data_offset,
                    compressed_len: hdr.compressed_size,
                    filelen: hdr.uncompressed_size,
                    compression: hdr.compression,
                    crc32: hdr.crc32,
                });
            }

            let next_pos = data_offset + hdr.compressed_size as u64;
            f.seek(SeekFrom::Start(next_pos)).ok()?;
        }

        com_dprintf(&format!("Added {} ({} files)\n", packfile, files.len()));
        Some(Pack::new(packfile.to_string(), files))
    }

    // ============================================================
    // File access
    // ============================================================

    fn read_from_pack(pack: &Pack, path: &str) -> Option<Vec<u8>> {
        let pf = pack.find_file(path)?;
        match pack.read_file(pf) {
            Ok(data) => Some(data),
            Err(e) => {
                com_printf(&format!("WARNING: {}\n", e));
                None
            }
        }
    }

    /// Loads a file from the first search path entry that has it.
    pub fn load_file(&self, path: &str) -> Option<Vec<u8>> {
        for sp in &self.search_paths {
            match sp.pack {
                Some(ref pack) => {
                    if let Some(data) = Self::read_from_pack(pack, path) {
                        return Some(data);
                    }
                }
                None => {
                    let netpath = format!("{}/{}", sp.filename, path);
                    if let Ok(data) = fs::read(&netpath) {
                        return Some(data);
                    }
                }
            }
        }
        com_dprintf(&format!("FindFile: can't find {}\n", path));
        None
    }

    /// Like `load_file`, but directories are not searched.
    pub fn load_file_from_pak(&self, path: &str) -> Option<Vec<u8>> {
        self.search_paths
            .iter()
            .filter_map(|sp| sp.pack.as_ref())
            .find_map(|pack| Self::read_from_pack(pack, path))
    }

    /// Writes a whole file, creating parent directories as needed.
    pub fn write_os_file(ospath: &str, data: &[u8]) -> io::Result<()> {
        if let Some(parent) = Path::new(ospath).parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(ospath, data)
    }

    /// Refresh `base/gamedir/file` from the archive copy of `file`.
    ///
    /// The disk copy is only rewritten when it differs. Returns true when the
    /// disk copy matches the archive afterwards.
    pub fn extract_from_pak(&self, base: &str, gamedir: &str, file: &str) -> bool {
        let Some(src) = self.load_file_from_pak(file) else {
            com_dprintf(&format!("Couldn't find {} in any pak file\n", file));
            return false;
        };

        let ospath = Self::build_os_path(base, gamedir, file);
        if let Ok(existing) = fs::read(&ospath) {
            if existing == src {
                return true;
            }
        }

        com_printf(&format!("Extracting {} to {}\n", file, ospath));
        match Self::write_os_file(&ospath, &src) {
            Ok(()) => true,
            Err(e) => {
                com_printf(&format!("WARNING: couldn't write {}: {}\n", ospath, e));
                false
            }
        }
    }

    /// Print the current search path.
    pub fn path_f(&self) {
        com_printf("Current search path:\n");
        for sp in &self.search_paths {
            match sp.pack {
                Some(ref pack) => {
                    com_printf(&format!("{} ({} files)\n", pack.filename, pack.files.len()))
                }
                None => com_printf(&format!("{}\n", sp.filename)),
            }
        }
    }
}

// ============================================================
// Test helpers
// ============================================================

/// Writes a pk3 with the given `(name, data, deflate)` members.
#[cfg(test)]
pub(crate) fn write_test_pk3(path: &str, members: &[(&str, &[u8], bool)]) {
    use crate::compression::compress_data;
    use std::io::Write;

    let mut out = Vec::new();
    for (name, data, deflate) in members {
        let stored = if *deflate {
            compress_data(data).unwrap()
        } else {
            data.to_vec()
        };
        let hdr = DZipHeader {
            ident: ZPAKHEADER,
            version: 20,
            flags: 0,
            compression: if *deflate { ZIP_METHOD_DEFLATED } else { ZIP_METHOD_STORED },
            modtime: 0,
            moddate: 0,
            crc32: crc32_block(data),
            compressed_size: stored.len() as u32,
            uncompressed_size: data.len() as u32,
            filename_length: name.len() as u16,
            extra_field_length: 0,
        };
        out.extend_from_slice(&hdr.to_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(&stored);
    }
    out.extend_from_slice(&ZPAKDIRHEADER.to_le_bytes());

    if let Some(parent) = Path::new(path).parent() {
        fs::create_dir_all(parent).unwrap();
    }
    let mut f = File::create(path).unwrap();
    f.write_all(&out).unwrap();
}
