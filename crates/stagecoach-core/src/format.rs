use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum FormatKind {
    Archive,
    BareFile,
    NativeInstaller,
    Unsupported,
    #[default]
    Unknown,
}

impl FormatKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Archive => "archive",
            Self::BareFile => "bare-file",
            Self::NativeInstaller => "native-installer",
            Self::Unsupported => "unsupported",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum FormatSubtype {
    Zip,
    Tar,
    Gzip,
    Bzip2,
    Xz,
    SevenZip,
    Rar,
    Msi,
    Inno,
    Nsis,
    Elf,
    MachO,
    PortableExecutable,
    Script,
    DiskImage,
    Deb,
    Rpm,
    Xar,
    #[default]
    Other,
}

impl FormatSubtype {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::Tar => "tar",
            Self::Gzip => "gzip",
            Self::Bzip2 => "bzip2",
            Self::Xz => "xz",
            Self::SevenZip => "7z",
            Self::Rar => "rar",
            Self::Msi => "msi",
            Self::Inno => "inno",
            Self::Nsis => "nsis",
            Self::Elf => "elf",
            Self::MachO => "mach-o",
            Self::PortableExecutable => "pe",
            Self::Script => "script",
            Self::DiskImage => "disk-image",
            Self::Deb => "deb",
            Self::Rpm => "rpm",
            Self::Xar => "xar",
            Self::Other => "other",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "zip" => Some(Self::Zip),
            "tar" => Some(Self::Tar),
            "gzip" | "gz" => Some(Self::Gzip),
            "bzip2" | "bz2" => Some(Self::Bzip2),
            "xz" => Some(Self::Xz),
            "7z" => Some(Self::SevenZip),
            "rar" => Some(Self::Rar),
            "msi" => Some(Self::Msi),
            "inno" => Some(Self::Inno),
            "nsis" => Some(Self::Nsis),
            "elf" => Some(Self::Elf),
            "mach-o" | "macho" => Some(Self::MachO),
            "pe" | "exe" => Some(Self::PortableExecutable),
            "script" => Some(Self::Script),
            "disk-image" | "dmg" => Some(Self::DiskImage),
            "deb" => Some(Self::Deb),
            "rpm" => Some(Self::Rpm),
            "xar" | "pkg" => Some(Self::Xar),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

/// Outcome of probing a byte source. `kind` decides the backend family,
/// `subtype` narrows it (native installers are dispatched per subtype).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct FormatInfo {
    pub kind: FormatKind,
    pub subtype: FormatSubtype,
}

impl FormatInfo {
    pub fn new(kind: FormatKind, subtype: FormatSubtype) -> Self {
        Self { kind, subtype }
    }

    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn bare(subtype: FormatSubtype) -> Self {
        Self::new(FormatKind::BareFile, subtype)
    }

    pub fn is_known(&self) -> bool {
        self.kind != FormatKind::Unknown
    }

    pub fn is_native_installer(&self) -> bool {
        self.kind == FormatKind::NativeInstaller
    }

    /// Name of the backend that installs this format, used both for registry
    /// lookup and as the `installerName` recorded in receipts.
    pub fn installer_name(&self) -> Option<&'static str> {
        match self.kind {
            FormatKind::Archive => Some("archive"),
            FormatKind::BareFile => Some("naked"),
            FormatKind::NativeInstaller => Some(self.subtype.as_str()),
            FormatKind::Unsupported | FormatKind::Unknown => None,
        }
    }

    /// With installers ignored, anything that is not already an archive or a
    /// bare file gets copied as-is.
    pub fn ignoring_installers(self) -> Self {
        match self.kind {
            FormatKind::Archive | FormatKind::BareFile => self,
            _ => Self::bare(self.subtype),
        }
    }
}

impl std::fmt::Display for FormatInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind.as_str(), self.subtype.as_str())
    }
}
