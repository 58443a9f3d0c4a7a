//! Native library checks run before a bundle is launched.
//!
//! Every library a bundle declares must exist under the bundle root and be an
//! ELF shared object built for the host: same word size, byte order and machine.
//! The entry point, when declared, must be an executable file.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ET_DYN: u16 = 3;

/// The ELF identity a native library must have to load in this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostAbi {
    /// `1` for 32-bit, `2` for 64-bit.
    pub class: u8,
    pub little_endian: bool,
    pub machine: u16,
}

pub fn host_abi() -> HostAbi {
    let machine = match std::env::consts::ARCH {
        "x86" => 3,
        "arm" => 40,
        "x86_64" => 62,
        "aarch64" => 183,
        "riscv64" => 243,
        _ => 0,
    };
    HostAbi {
        class: if cfg!(target_pointer_width = "64") { 2 } else { 1 },
        little_endian: cfg!(target_endian = "little"),
        machine,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LibraryProblem {
    Missing(PathBuf),
    Unreadable { path: PathBuf, reason: String },
    NotElf(PathBuf),
    NotSharedObject(PathBuf),
    WrongClass { path: PathBuf, expected: u8, found: u8 },
    WrongByteOrder(PathBuf),
    WrongMachine { path: PathBuf, expected: u16, found: u16 },
    EntryPointMissing(PathBuf),
    EntryPointNotExecutable(PathBuf),
}

fn bits(class: u8) -> &'static str {
    match class {
        1 => "32-bit",
        2 => "64-bit",
        _ => "unknown-width",
    }
}

impl fmt::Display for LibraryProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing(p) => write!(f, "  - {}: missing", p.display()),
            Self::Unreadable { path, reason } => {
                write!(f, "  - {}: unreadable ({reason})", path.display())
            }
            Self::NotElf(p) => write!(f, "  - {}: not an ELF file", p.display()),
            Self::NotSharedObject(p) => {
                write!(f, "  - {}: not a shared object", p.display())
            }
            Self::WrongClass {
                path,
                expected,
                found,
            } => write!(
                f,
                "  - {}: built {}, host is {}",
                path.display(),
                bits(*found),
                bits(*expected)
            ),
            Self::WrongByteOrder(p) => write!(f, "  - {}: wrong byte order", p.display()),
            Self::WrongMachine {
                path,
                expected,
                found,
            } => write!(
                f,
                "  - {}: ELF machine {found}, host machine is {expected}",
                path.display()
            ),
            Self::EntryPointMissing(p) => write!(f, "  - entry point {}: missing", p.display()),
            Self::EntryPointNotExecutable(p) => {
                write!(f, "  - entry point {}: not executable", p.display())
            }
        }
    }
}

/// Check one shared library against `abi`.
pub fn check_library(path: &Path, abi: HostAbi) -> Option<LibraryProblem> {
    let mut header = [0u8; 20];
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Some(LibraryProblem::Missing(path.to_path_buf()));
        }
        Err(e) => {
            return Some(LibraryProblem::Unreadable {
                path: path.to_path_buf(),
                reason: e.to_string(),
            });
        }
    };
    if file.read_exact(&mut header).is_err() || header[..4] != ELF_MAGIC {
        return Some(LibraryProblem::NotElf(path.to_path_buf()));
    }
    let class = header[4];
    let little_endian = header[5] == 1;
    let read_u16 = |at: usize| {
        let bytes = [header[at], header[at + 1]];
        if little_endian {
            u16::from_le_bytes(bytes)
        } else {
            u16::from_be_bytes(bytes)
        }
    };

    if class != abi.class {
        return Some(LibraryProblem::WrongClass {
            path: path.to_path_buf(),
            expected: abi.class,
            found: class,
        });
    }
    if little_endian != abi.little_endian {
        return Some(LibraryProblem::WrongByteOrder(path.to_path_buf()));
    }
    if read_u16(16) != ET_DYN {
        return Some(LibraryProblem::NotSharedObject(path.to_path_buf()));
    }
    let machine = read_u16(18);
    if machine != abi.machine {
        return Some(LibraryProblem::WrongMachine {
            path: path.to_path_buf(),
            expected: abi.machine,
            found: machine,
        });
    }
    None
}

#[cfg(unix)]
fn is_executable(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &std::fs::Metadata) -> bool {
    true
}

/// Check every declared library and the entry point of a bundle.
/// An empty list means the bundle can be launched on this host.
pub fn check_bundle(
    root: &Path,
    libraries: &[String],
    entry_point: Option<&str>,
    abi: HostAbi,
) -> Vec<LibraryProblem> {
    let mut problems: Vec<LibraryProblem> = libraries
        .iter()
        .filter_map(|lib| check_library(&root.join(lib), abi))
        .collect();

    if let Some(entry) = entry_point {
        let path = root.join(entry);
        match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() && is_executable(&meta) => {}
            Ok(_) => problems.push(LibraryProblem::EntryPointNotExecutable(path)),
            Err(_) => problems.push(LibraryProblem::EntryPointMissing(path)),
        }
    }
    problems
}

pub fn format_problems(problems: &[LibraryProblem]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("bundle cannot run on this device:\n");
    for p in problems {
        let _ = writeln!(msg, "{p}");
    }
    msg.push_str("\nReinstall the bundle or select one built for this device.");
    msg
}
