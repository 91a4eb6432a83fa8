use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::process::{Command, Stdio};

use uuid::Uuid;
use walkdir::WalkDir;
use zip::result::ZipError;
use zip::ZipArchive;

use crate::errors::ExtractionError;
use crate::utils::file::{find_first_with_extension, move_path, remove_path};
use crate::utils::format::output_excerpt;
use crate::utils::process::{find_on_path, hide_console_window};

const TOOL_EXCERPT_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    Rar,
    SevenZip,
    Tar,
    TarGz,
    TarBz2,
    TarXz,
    TarZst,
    /// Numbered volume (`.001` to `.999`).
    Split,
    /// Single compressed file (`.gz`, `.bz2`, `.xz`).
    Compressed,
    /// Not recognised by name; only a general-purpose tool can try it.
    Other,
}

impl ArchiveKind {
    pub fn detect(path: &Path) -> Option<ArchiveKind> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        let kind = if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            ArchiveKind::TarGz
        } else if name.ends_with(".tar.bz2") || name.ends_with(".tbz2") {
            ArchiveKind::TarBz2
        } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
            ArchiveKind::TarXz
        } else if name.ends_with(".tar.zst") || name.ends_with(".tzst") {
            ArchiveKind::TarZst
        } else if name.ends_with(".tar") {
            ArchiveKind::Tar
        } else if name.ends_with(".zip") {
            ArchiveKind::Zip
        } else if name.ends_with(".rar") {
            ArchiveKind::Rar
        } else if name.ends_with(".7z") {
            ArchiveKind::SevenZip
        } else if name.ends_with(".gz") || name.ends_with(".bz2") || name.ends_with(".xz") {
            ArchiveKind::Compressed
        } else if is_volume_suffix(&name) {
            ArchiveKind::Split
        } else {
            return None;
        };
        Some(kind)
    }

    pub fn label(&self) -> &'static str {
        match self {
            ArchiveKind::Zip => "zip",
            ArchiveKind::Rar => "rar",
            ArchiveKind::SevenZip => "7z",
            ArchiveKind::Tar => "tar",
            ArchiveKind::TarGz => "tar.gz",
            ArchiveKind::TarBz2 => "tar.bz2",
            ArchiveKind::TarXz => "tar.xz",
            ArchiveKind::TarZst => "tar.zst",
            ArchiveKind::Split => "split volume",
            ArchiveKind::Compressed => "compressed file",
            ArchiveKind::Other => "archive",
        }
    }

    fn is_tar_family(&self) -> bool {
        matches!(
            self,
            ArchiveKind::Tar
                | ArchiveKind::TarGz
                | ArchiveKind::TarBz2
                | ArchiveKind::TarXz
                | ArchiveKind::TarZst
        )
    }
}

fn is_volume_suffix(name: &str) -> bool {
    let Some((_, ext)) = name.rsplit_once('.') else {
        return false;
    };
    ext.len() == 3
        && ext.bytes().all(|b| b.is_ascii_digit())
        && ext.parse::<u16>().map(|n| n >= 1).unwrap_or(false)
}

pub fn is_archive(path: &Path) -> bool {
    ArchiveKind::detect(path).is_some()
}

/// Maps an archive member name onto a path under `dest`. Backslashes count
/// as separators; absolute names, drive prefixes and `..` segments are
/// rejected.
pub fn safe_member_path(dest: &Path, member: &str) -> Result<PathBuf, ExtractionError> {
    let traversal = || ExtractionError::PathTraversal {
        member: member.to_string(),
    };

    let normalized = member.replace('\\', "/");
    let bytes = normalized.as_bytes();
    if normalized.starts_with('/') || (bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':') {
        return Err(traversal());
    }

    let mut clean = PathBuf::new();
    for segment in normalized.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(traversal()),
            other => clean.push(other),
        }
    }
    if !clean
        .components()
        .all(|component| matches!(component, Component::Normal(_)))
    {
        return Err(traversal());
    }

    Ok(dest.join(clean))
}

/// Validates every name before anything is written.
fn prescan<'a, I>(dest: &Path, names: I) -> Result<(), ExtractionError>
where
    I: IntoIterator<Item = &'a str>,
{
    for name in names {
        safe_member_path(dest, name)?;
    }
    Ok(())
}

/// First `.iso` below `dir` in sorted order.
pub fn find_disc_image(dir: &Path) -> Option<PathBuf> {
    find_first_with_extension(dir, "iso")
}

pub trait Extractor: Send + Sync {
    fn name(&self) -> &str;
    fn can_handle(&self, kind: ArchiveKind) -> bool;
    fn is_available(&self) -> bool;
    fn extract(&self, archive: &Path, dest: &Path, kind: ArchiveKind) -> Result<(), ExtractionError>;
}

pub struct ZipExtractor;

impl Extractor for ZipExtractor {
    fn name(&self) -> &str {
        "zip"
    }

    fn can_handle(&self, kind: ArchiveKind) -> bool {
        kind == ArchiveKind::Zip
    }

    fn is_available(&self) -> bool {
        true
    }

    fn extract(&self, archive: &Path, dest: &Path, _kind: ArchiveKind) -> Result<(), ExtractionError> {
        let file = File::open(archive)?;
        let mut zip = ZipArchive::new(file).map_err(zip_error)?;
        prescan(dest, zip.file_names())?;

        for index in 0..zip.len() {
            let mut entry = zip.by_index(index).map_err(zip_error)?;
            let out_path = safe_member_path(dest, entry.name())?;
            if entry.is_dir() {
                fs::create_dir_all(&out_path)?;
                continue;
            }
            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut outfile = File::create(&out_path)?;
            io::copy(&mut entry, &mut outfile).map_err(|err| corrupt("zip", err))?;
        }
        Ok(())
    }
}

fn zip_error(err: ZipError) -> ExtractionError {
    match err {
        ZipError::Io(io_err) => ExtractionError::Io(io_err),
        other => corrupt("zip", other),
    }
}

fn corrupt(format: &str, reason: impl ToString) -> ExtractionError {
    ExtractionError::Corrupt {
        format: format.to_string(),
        reason: reason.to_string(),
    }
}

pub struct TarExtractor;

impl TarExtractor {
    fn open(archive: &Path, kind: ArchiveKind) -> Result<tar::Archive<Box<dyn Read>>, ExtractionError> {
        let file = File::open(archive)?;
        let reader: Box<dyn Read> = match kind {
            ArchiveKind::TarGz => Box::new(flate2::read::GzDecoder::new(file)),
            ArchiveKind::TarBz2 => Box::new(bzip2::read::BzDecoder::new(file)),
            ArchiveKind::TarXz => Box::new(xz2::read::XzDecoder::new(file)),
            ArchiveKind::TarZst => Box::new(zstd::stream::read::Decoder::new(file)?),
            _ => Box::new(file),
        };
        Ok(tar::Archive::new(reader))
    }
}

impl Extractor for TarExtractor {
    fn name(&self) -> &str {
        "tar"
    }

    fn can_handle(&self, kind: ArchiveKind) -> bool {
        kind.is_tar_family()
    }

    fn is_available(&self) -> bool {
        true
    }

    fn extract(&self, archive: &Path, dest: &Path, kind: ArchiveKind) -> Result<(), ExtractionError> {
        let format = kind.label();

        let mut listing = Self::open(archive, kind)?;
        let mut names = Vec::new();
        for entry in listing.entries().map_err(|err| corrupt(format, err))? {
            let entry = entry.map_err(|err| corrupt(format, err))?;
            let path = entry.path().map_err(|err| corrupt(format, err))?;
            names.push(path.to_string_lossy().into_owned());
        }
        prescan(dest, names.iter().map(String::as_str))?;

        let mut tar = Self::open(archive, kind)?;
        for entry in tar.entries().map_err(|err| corrupt(format, err))? {
            let mut entry = entry.map_err(|err| corrupt(format, err))?;
            let name = entry
                .path()
                .map_err(|err| corrupt(format, err))?
                .to_string_lossy()
                .into_owned();
            let out_path = safe_member_path(dest, &name)?;
            let entry_type = entry.header().entry_type();

            if entry_type.is_dir() {
                fs::create_dir_all(&out_path)?;
            } else if entry_type.is_file() {
                if let Some(parent) = out_path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut outfile = File::create(&out_path)?;
                io::copy(&mut entry, &mut outfile).map_err(|err| corrupt(format, err))?;
            } else {
                tracing::debug!("skipping non-regular tar member {}", name);
            }
        }
        Ok(())
    }
}

pub struct SevenZipExtractor;

impl Extractor for SevenZipExtractor {
    fn name(&self) -> &str {
        "7z (native)"
    }

    fn can_handle(&self, kind: ArchiveKind) -> bool {
        kind == ArchiveKind::SevenZip
    }

    fn is_available(&self) -> bool {
        true
    }

    fn extract(&self, archive: &Path, dest: &Path, _kind: ArchiveKind) -> Result<(), ExtractionError> {
        let file = File::open(archive)?;
        let reader = sevenz_rust2::SevenZReader::new(file, sevenz_rust2::Password::empty())
            .map_err(|err| corrupt("7z", err))?;
        prescan(dest, reader.archive().files.iter().map(|entry| entry.name.as_str()))?;
        drop(reader);

        let mut failure: Option<ExtractionError> = None;
        let mut extract_fn = |entry: &sevenz_rust2::SevenZArchiveEntry,
                              data: &mut dyn Read,
                              _default_path: &PathBuf|
         -> std::result::Result<bool, sevenz_rust2::Error> {
            let out_path = match safe_member_path(dest, &entry.name) {
                Ok(path) => path,
                Err(err) => {
                    failure = Some(err);
                    return Ok(false);
                }
            };
            let written = if entry.is_directory {
                fs::create_dir_all(&out_path)
            } else {
                out_path
                    .parent()
                    .map(fs::create_dir_all)
                    .unwrap_or(Ok(()))
                    .and_then(|_| File::create(&out_path))
                    .and_then(|mut outfile| io::copy(data, &mut outfile).map(|_| ()))
            };
            match written {
                Ok(()) => Ok(true),
                Err(err) => {
                    failure = Some(ExtractionError::Io(err));
                    Ok(false)
                }
            }
        };

        let file = File::open(archive)?;
        let result = sevenz_rust2::decompress_with_extract_fn(file, dest, &mut extract_fn);
        if let Some(err) = failure {
            return Err(err);
        }
        result.map_err(|err| corrupt("7z", err))
    }
}

/// RAR through the bundled unrar library; multi-volume sets are followed
/// from the first part.
pub struct UnrarExtractor;

fn rar_error(err: impl std::fmt::Debug) -> ExtractionError {
    corrupt("rar", format!("{:?}", err))
}

impl Extractor for UnrarExtractor {
    fn name(&self) -> &str {
        "rar (native)"
    }

    fn can_handle(&self, kind: ArchiveKind) -> bool {
        kind == ArchiveKind::Rar
    }

    fn is_available(&self) -> bool {
        true
    }

    fn extract(&self, archive: &Path, dest: &Path, _kind: ArchiveKind) -> Result<(), ExtractionError> {
        let listing = unrar::Archive::new(archive)
            .open_for_listing()
            .map_err(rar_error)?;
        let mut names = Vec::new();
        for header in listing {
            let header = header.map_err(rar_error)?;
            names.push(header.filename.to_string_lossy().into_owned());
        }
        prescan(dest, names.iter().map(String::as_str))?;

        let mut processing = unrar::Archive::new(archive)
            .open_for_processing()
            .map_err(rar_error)?;
        while let Some(header) = processing.read_header().map_err(rar_error)? {
            let entry = header.entry();
            let name = entry.filename.to_string_lossy().into_owned();
            let (is_dir, is_file) = (entry.is_directory(), entry.is_file());
            let out_path = safe_member_path(dest, &name)?;
            processing = if is_dir {
                fs::create_dir_all(&out_path)?;
                header.skip().map_err(rar_error)?
            } else if is_file {
                if let Some(parent) = out_path.parent() {
                    fs::create_dir_all(parent)?;
                }
                header.extract_to(&out_path).map_err(rar_error)?
            } else {
                tracing::debug!("skipping rar member {}", name);
                header.skip().map_err(rar_error)?
            };
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliTool {
    SevenZip,
    Unrar,
}

impl CliTool {
    fn label(&self) -> &'static str {
        match self {
            CliTool::SevenZip => "7z",
            CliTool::Unrar => "unrar",
        }
    }

    fn candidates(&self) -> &'static [&'static str] {
        match self {
            CliTool::SevenZip => &["7z", "7za", "7zz"],
            CliTool::Unrar => &["unrar"],
        }
    }
}

/// External extraction tool. Members are listed and validated before the
/// real extraction runs.
pub struct CliExtractor {
    tool: CliTool,
    binary: Option<PathBuf>,
    name: String,
}

impl CliExtractor {
    pub fn discover(tool: CliTool) -> Self {
        Self::with_binary(tool, find_on_path(tool.candidates()))
    }

    pub fn with_binary(tool: CliTool, binary: Option<PathBuf>) -> Self {
        Self {
            tool,
            binary,
            name: format!("{} (cli)", tool.label()),
        }
    }

    fn run(&self, binary: &Path, args: &[&OsStr]) -> Result<Vec<u8>, ExtractionError> {
        let mut command = Command::new(binary);
        hide_console_window(&mut command);
        let output = command
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|err| ExtractionError::Tool {
                tool: self.tool.label().to_string(),
                details: format!("failed to launch {}: {}", binary.display(), err),
            })?;
        if !output.status.success() {
            let stderr = output_excerpt(&output.stderr, TOOL_EXCERPT_CHARS);
            let details = if stderr.is_empty() {
                output_excerpt(&output.stdout, TOOL_EXCERPT_CHARS)
            } else {
                stderr
            };
            return Err(ExtractionError::Tool {
                tool: self.tool.label().to_string(),
                details: format!("exit status {}: {}", output.status, details),
            });
        }
        Ok(output.stdout)
    }

    fn list_members(&self, binary: &Path, archive: &Path) -> Result<Vec<String>, ExtractionError> {
        let stdout = match self.tool {
            CliTool::SevenZip => {
                self.run(binary, &[OsStr::new("l"), OsStr::new("-slt"), archive.as_os_str()])?
            }
            CliTool::Unrar => self.run(binary, &[OsStr::new("lb"), archive.as_os_str()])?,
        };
        let text = String::from_utf8_lossy(&stdout);
        Ok(match self.tool {
            CliTool::SevenZip => parse_7z_listing(&text),
            CliTool::Unrar => text
                .lines()
                .map(str::trim_end)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
        })
    }
}

/// `Path = ` records after the `----------` separator; the block before it
/// describes the archive itself.
fn parse_7z_listing(text: &str) -> Vec<String> {
    let mut members = Vec::new();
    let mut in_members = false;
    for line in text.lines() {
        let line = line.trim_end();
        if line.starts_with("----------") {
            in_members = true;
            continue;
        }
        if !in_members {
            continue;
        }
        if let Some(path) = line.strip_prefix("Path = ") {
            members.push(path.to_string());
        }
    }
    members
}

/// Symlinks written by an external tool may still point outside `dest`.
fn verify_tree_contained(dest: &Path) -> Result<(), ExtractionError> {
    let root = dest.canonicalize()?;
    for entry in WalkDir::new(dest).follow_links(false) {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.path_is_symlink() {
            continue;
        }
        let resolved = entry.path().canonicalize();
        let contained = resolved.map(|path| path.starts_with(&root)).unwrap_or(false);
        if !contained {
            let member = entry
                .path()
                .strip_prefix(dest)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .into_owned();
            return Err(ExtractionError::PathTraversal { member });
        }
    }
    Ok(())
}

impl Extractor for CliExtractor {
    fn name(&self) -> &str {
        &self.name
    }

    fn can_handle(&self, kind: ArchiveKind) -> bool {
        match self.tool {
            CliTool::Unrar => kind == ArchiveKind::Rar,
            CliTool::SevenZip => matches!(
                kind,
                ArchiveKind::SevenZip
                    | ArchiveKind::Rar
                    | ArchiveKind::Split
                    | ArchiveKind::Compressed
                    | ArchiveKind::Other
            ),
        }
    }

    fn is_available(&self) -> bool {
        self.binary.as_ref().map(|path| path.is_file()).unwrap_or(false)
    }

    fn extract(&self, archive: &Path, dest: &Path, _kind: ArchiveKind) -> Result<(), ExtractionError> {
        let binary = self
            .binary
            .as_deref()
            .ok_or_else(|| ExtractionError::NoBackend(self.tool.label().to_string()))?;

        let members = self.list_members(binary, archive)?;
        prescan(dest, members.iter().map(String::as_str))?;

        match self.tool {
            CliTool::SevenZip => {
                let output_flag = format!("-o{}", dest.display());
                self.run(
                    binary,
                    &[
                        OsStr::new("x"),
                        OsStr::new("-y"),
                        OsStr::new(&output_flag),
                        archive.as_os_str(),
                    ],
                )?;
            }
            CliTool::Unrar => {
                let mut target = dest.as_os_str().to_owned();
                target.push(std::path::MAIN_SEPARATOR.to_string());
                self.run(
                    binary,
                    &[
                        OsStr::new("x"),
                        OsStr::new("-o+"),
                        OsStr::new("-y"),
                        archive.as_os_str(),
                        target.as_os_str(),
                    ],
                )?;
            }
        }

        verify_tree_contained(dest)
    }
}

/// Hidden sibling of `dest`, unique per call.
fn staging_dir_for(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "extracted".to_string());
    let staging_name = format!(".{}.partial-{}", name, Uuid::new_v4().simple());
    match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join(staging_name),
        _ => PathBuf::from(staging_name),
    }
}

fn discard_staging(staging: &Path) {
    if let Err(err) = remove_path(staging) {
        tracing::warn!("could not remove staging dir {}: {}", staging.display(), err);
    }
}

/// Moves every entry of `from` into `to`, descending into directories both
/// sides have. Same-named files in `to` are overwritten.
fn merge_into(from: &Path, to: &Path) -> Result<(), ExtractionError> {
    if !to.exists() {
        move_path(from, to)?;
        return Ok(());
    }
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let source = entry.path();
        let target = to.join(entry.file_name());
        let source_is_dir = entry.file_type()?.is_dir();
        let target_is_dir = fs::symlink_metadata(&target)
            .map(|meta| meta.is_dir())
            .unwrap_or(false);
        if source_is_dir && target_is_dir {
            merge_into(&source, &target)?;
        } else {
            remove_path(&target)?;
            move_path(&source, &target)?;
        }
    }
    Ok(())
}

pub struct ExtractionService {
    backends: Vec<Box<dyn Extractor>>,
}

impl Default for ExtractionService {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtractionService {
    /// Native backends first, then whatever command-line tools are on `PATH`.
    pub fn new() -> Self {
        Self::with_backends(vec![
            Box::new(ZipExtractor),
            Box::new(TarExtractor),
            Box::new(SevenZipExtractor),
            Box::new(UnrarExtractor),
            Box::new(CliExtractor::discover(CliTool::Unrar)),
            Box::new(CliExtractor::discover(CliTool::SevenZip)),
        ])
    }

    pub fn with_backends(backends: Vec<Box<dyn Extractor>>) -> Self {
        Self { backends }
    }

    /// Extracts into a private staging directory next to `dest` and moves
    /// the result into `dest` only once a backend succeeds. Files already in
    /// `dest` are kept unless the archive overwrites them.
    pub fn extract(&self, archive: &Path, dest: &Path) -> Result<PathBuf, ExtractionError> {
        if !archive.is_file() {
            return Err(ExtractionError::NotFound(archive.to_path_buf()));
        }
        let kind = ArchiveKind::detect(archive).unwrap_or(ArchiveKind::Other);
        let display_name = archive
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| archive.display().to_string());

        let staging = staging_dir_for(dest);
        let result = self.extract_staged(archive, &staging, kind, &display_name);
        let result = result.and_then(|backend| {
            merge_into(&staging, dest)?;
            tracing::info!("extracted {} with {} into {}", display_name, backend, dest.display());
            Ok(dest.to_path_buf())
        });
        discard_staging(&staging);
        result
    }

    /// Runs the backend chain against `staging`; returns the winning
    /// backend's name.
    fn extract_staged(
        &self,
        archive: &Path,
        staging: &Path,
        kind: ArchiveKind,
        display_name: &str,
    ) -> Result<String, ExtractionError> {
        let mut attempted = false;
        let mut last_failure: Option<ExtractionError> = None;

        for backend in self.backends.iter().filter(|backend| backend.can_handle(kind)) {
            if !backend.is_available() {
                tracing::debug!("extraction backend {} unavailable for {}", backend.name(), display_name);
                continue;
            }
            if attempted {
                remove_path(staging)?;
            }
            fs::create_dir_all(staging)?;
            attempted = true;

            match backend.extract(archive, staging, kind) {
                Ok(()) => return Ok(backend.name().to_string()),
                Err(err @ ExtractionError::PathTraversal { .. }) => {
                    tracing::error!("refusing to extract {}: {}", display_name, err);
                    return Err(err);
                }
                Err(err) => {
                    tracing::warn!("backend {} failed on {}: {}", backend.name(), display_name, err);
                    last_failure = Some(err);
                }
            }
        }

        match last_failure {
            Some(err) => Err(err),
            None => Err(ExtractionError::NoBackend(format!("{} ({})", display_name, kind.label()))),
        }
    }

    /// The disc image inside an extracted tree, or `NoDiscImage`.
    pub fn locate_disc_image(&self, dir: &Path, archive_name: &str) -> Result<PathBuf, ExtractionError> {
        find_disc_image(dir).ok_or_else(|| ExtractionError::NoDiscImage(archive_name.to_string()))
    }
}
