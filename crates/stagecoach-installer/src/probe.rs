use anyhow::{Context, Result};
use std::io::{Read, SeekFrom};

use stagecoach_core::{FormatInfo, FormatKind, FormatSubtype};

use crate::source::ByteSource;

pub const DEFAULT_PROBE_LIMIT: u64 = 1024 * 1024;

/// Classifies a byte source. Implementations leave the source at offset 0.
pub trait FormatProber: Send + Sync {
    fn probe(&self, source: &mut dyn ByteSource) -> Result<FormatInfo>;
}

/// Sniffs magic numbers and installer signatures from a bounded prefix.
#[derive(Debug, Clone, Copy)]
pub struct MagicProber {
    limit: u64,
}

impl MagicProber {
    pub fn new(limit: u64) -> Self {
        Self { limit }
    }
}

impl Default for MagicProber {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_LIMIT)
    }
}

impl FormatProber for MagicProber {
    fn probe(&self, source: &mut dyn ByteSource) -> Result<FormatInfo> {
        let name = source.name().to_string();
        source
            .seek(SeekFrom::Start(0))
            .with_context(|| format!("failed to rewind {name}"))?;
        let mut prefix = Vec::new();
        (&mut *source)
            .take(self.limit)
            .read_to_end(&mut prefix)
            .with_context(|| format!("failed to read {name} for probing"))?;
        source
            .seek(SeekFrom::Start(0))
            .with_context(|| format!("failed to rewind {name}"))?;
        Ok(classify_prefix(&prefix, &name))
    }
}

const OLE_MAGIC: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];
const XZ_MAGIC: &[u8] = &[0xFD, b'7', b'z', b'X', b'Z', 0x00];
const SEVEN_ZIP_MAGIC: &[u8] = &[b'7', b'z', 0xBC, 0xAF, 0x27, 0x1C];
const RPM_MAGIC: &[u8] = &[0xED, 0xAB, 0xEE, 0xDB];
const MACH_O_MAGICS: [[u8; 4]; 5] = [
    [0xFE, 0xED, 0xFA, 0xCE],
    [0xFE, 0xED, 0xFA, 0xCF],
    [0xCE, 0xFA, 0xED, 0xFE],
    [0xCF, 0xFA, 0xED, 0xFE],
    [0xCA, 0xFE, 0xBA, 0xBE],
];

/// Classifies the first bytes of a file. `name` is only a hint for formats
/// whose signature lives at the end of the file.
pub fn classify_prefix(prefix: &[u8], name: &str) -> FormatInfo {
    use FormatSubtype as S;

    let archive = |subtype| FormatInfo::new(FormatKind::Archive, subtype);
    let installer = |subtype| FormatInfo::new(FormatKind::NativeInstaller, subtype);
    let unsupported = |subtype| FormatInfo::new(FormatKind::Unsupported, subtype);

    if prefix.starts_with(b"PK\x03\x04") || prefix.starts_with(b"PK\x05\x06") {
        return archive(S::Zip);
    }
    if prefix.starts_with(&[0x1F, 0x8B]) {
        return archive(S::Gzip);
    }
    if prefix.starts_with(b"BZh") {
        return archive(S::Bzip2);
    }
    if prefix.starts_with(XZ_MAGIC) {
        return archive(S::Xz);
    }
    if prefix.starts_with(SEVEN_ZIP_MAGIC) {
        return archive(S::SevenZip);
    }
    if prefix.starts_with(b"Rar!\x1A\x07") {
        return archive(S::Rar);
    }
    if prefix.get(257..262) == Some(b"ustar".as_slice()) {
        return archive(S::Tar);
    }
    if prefix.starts_with(OLE_MAGIC) {
        return installer(S::Msi);
    }
    if prefix.starts_with(b"MZ") {
        if contains(prefix, b"Inno Setup") {
            return installer(S::Inno);
        }
        if contains(prefix, b"NullsoftInst") {
            return installer(S::Nsis);
        }
        return FormatInfo::bare(S::PortableExecutable);
    }
    if prefix.starts_with(b"\x7FELF") {
        return FormatInfo::bare(S::Elf);
    }
    if MACH_O_MAGICS.iter().any(|magic| prefix.starts_with(magic)) {
        return FormatInfo::bare(S::MachO);
    }
    if prefix.starts_with(b"#!") {
        return FormatInfo::bare(S::Script);
    }
    if prefix.starts_with(b"!<arch>\ndebian") {
        return unsupported(S::Deb);
    }
    if prefix.starts_with(RPM_MAGIC) {
        return unsupported(S::Rpm);
    }
    if prefix.starts_with(b"xar!") {
        return unsupported(S::Xar);
    }
    if name.to_ascii_lowercase().ends_with(".dmg") {
        return unsupported(S::DiskImage);
    }

    FormatInfo::bare(S::Other)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|window| window == needle)
}
