use crate::error::{Result, SidesignError};
use goblin::mach::cputype::CPU_TYPE_ARM64;
use goblin::mach::header::{MH_DYLIB, MH_MAGIC_64};
use goblin::mach::load_command::{
    CommandVariant, LC_CODE_SIGNATURE, LC_LAZY_LOAD_DYLIB, LC_LOAD_DYLIB, LC_LOAD_UPWARD_DYLIB,
    LC_LOAD_WEAK_DYLIB, LC_REEXPORT_DYLIB,
};
use goblin::mach::Mach;
use std::fs;
use std::path::Path;

const DYLIB_COMMANDS: &[u32] = &[
    LC_LOAD_DYLIB,
    LC_LOAD_WEAK_DYLIB,
    LC_REEXPORT_DYLIB,
    LC_LAZY_LOAD_DYLIB,
    LC_LOAD_UPWARD_DYLIB,
];

/// Size of the zero-filled signature region in synthesized stubs. Must be
/// larger than any signature the tool will embed.
pub const CODE_SIGNATURE_SPACE: u32 = 8192;

/// Mach-O header (32 bytes) plus one LC_CODE_SIGNATURE command (16 bytes).
const STUB_HEADER_AND_COMMAND: u32 = 48;

/// Canonical load path for the injected substrate shim.
pub const SUBSTRATE_INSTALL_PATH: &str = "@rpath/CydiaSubstrate.framework/CydiaSubstrate";

/// Builds a minimal 64-bit Mach-O dylib whose single load command is an
/// LC_CODE_SIGNATURE pointing at a pre-allocated zero-filled region. The
/// signing tool finds enough contiguous reserved space to embed a fresh
/// signature without relocating load commands, which sidesteps the
/// "not enough code-signature space" failure on certain shipped frameworks.
pub fn code_signature_stub(signature_space: u32) -> Vec<u8> {
    let mut bytes = Vec::with_capacity((STUB_HEADER_AND_COMMAND + signature_space) as usize);

    // Header
    bytes.extend_from_slice(&MH_MAGIC_64.to_le_bytes());
    bytes.extend_from_slice(&CPU_TYPE_ARM64.to_le_bytes());
    bytes.extend_from_slice(&0u32.to_le_bytes()); // CPU_SUBTYPE_ARM64_ALL
    bytes.extend_from_slice(&MH_DYLIB.to_le_bytes());
    bytes.extend_from_slice(&1u32.to_le_bytes()); // ncmds
    bytes.extend_from_slice(&16u32.to_le_bytes()); // sizeofcmds
    bytes.extend_from_slice(&0x0020_0085u32.to_le_bytes()); // MH_PIE | MH_NO_REEXPORTED_DYLIBS | ...
    bytes.extend_from_slice(&0u32.to_le_bytes()); // reserved

    // LC_CODE_SIGNATURE
    bytes.extend_from_slice(&LC_CODE_SIGNATURE.to_le_bytes());
    bytes.extend_from_slice(&16u32.to_le_bytes()); // cmdsize
    bytes.extend_from_slice(&STUB_HEADER_AND_COMMAND.to_le_bytes()); // dataoff
    bytes.extend_from_slice(&signature_space.to_le_bytes()); // datasize

    bytes.resize((STUB_HEADER_AND_COMMAND + signature_space) as usize, 0);
    bytes
}

/// The stub written over deny-listed framework executables.
pub fn replacement_stub() -> Vec<u8> {
    code_signature_stub(CODE_SIGNATURE_SPACE)
}

fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// (offset, length) of every Mach-O slice in the file: one entry for thin
/// binaries, one per architecture for fat binaries.
fn arch_slices(data: &[u8]) -> Result<Vec<(usize, usize)>> {
    match Mach::parse(data)? {
        Mach::Binary(_) => Ok(vec![(0, data.len())]),
        Mach::Fat(fat) => {
            let mut slices = Vec::new();
            for arch in fat.iter_arches() {
                let arch = arch?;
                slices.push((arch.offset as usize, arch.size as usize));
            }
            Ok(slices)
        }
    }
}

fn extract_lc_str(slice: &[u8], load_cmd_offset: usize, str_offset_rel: u32) -> Option<String> {
    let name_offset = load_cmd_offset + str_offset_rel as usize;
    if name_offset >= slice.len() {
        return None;
    }

    let mut end = name_offset;
    while end < slice.len() && slice[end] != 0 {
        end += 1;
    }

    std::str::from_utf8(&slice[name_offset..end])
        .ok()
        .map(|s| s.to_string())
}

fn dylib_command_path(slice: &[u8], load_cmd_offset: usize) -> Option<String> {
    if load_cmd_offset + 12 > slice.len() {
        return None;
    }
    let str_offset = read_u32_le(slice, load_cmd_offset + 8);
    extract_lc_str(slice, load_cmd_offset, str_offset)
}

/// Dylib load paths referenced by the binary (all architectures), restricted
/// to system and loader-relative paths the fixups care about.
pub fn linked_dylibs<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let data = fs::read(path.as_ref())?;
    let mut deps = Vec::new();

    for (base, len) in arch_slices(&data)? {
        let slice = &data[base..base + len];
        let macho = goblin::mach::MachO::parse(slice, 0)?;
        for lib in &macho.libs {
            if !lib.is_empty() && !deps.contains(&lib.to_string()) {
                deps.push(lib.to_string());
            }
        }
    }

    Ok(deps
        .into_iter()
        .filter(|d| d.starts_with("/Library/") || d.starts_with("/usr/lib/") || d.starts_with('@'))
        .collect())
}

struct PathRewrite {
    name_offset: usize,
    available: usize,
}

/// Rewrites every dylib load command referencing `old_path` to `new_path`,
/// in place. The new path must fit in the existing command's string space.
/// Returns whether anything changed.
pub fn rewrite_dylib_path<P: AsRef<Path>>(path: P, old_path: &str, new_path: &str) -> Result<bool> {
    let path = path.as_ref();
    let mut data = fs::read(path)?;

    let mut rewrites: Vec<PathRewrite> = Vec::new();
    for (base, len) in arch_slices(&data)? {
        let slice = &data[base..base + len];
        let macho = goblin::mach::MachO::parse(slice, 0)?;

        for load_cmd in macho
            .load_commands
            .iter()
            .filter(|lc| DYLIB_COMMANDS.contains(&lc.command.cmd()))
        {
            let found = match &load_cmd.command {
                CommandVariant::LoadDylib(dylib)
                | CommandVariant::LoadWeakDylib(dylib)
                | CommandVariant::ReexportDylib(dylib)
                | CommandVariant::LazyLoadDylib(dylib)
                | CommandVariant::LoadUpwardDylib(dylib) => {
                    extract_lc_str(slice, load_cmd.offset, dylib.dylib.name)
                }
                _ => dylib_command_path(slice, load_cmd.offset),
            };

            if found.as_deref() == Some(old_path) {
                let cmdsize = read_u32_le(slice, load_cmd.offset + 4) as usize;
                let str_offset = read_u32_le(slice, load_cmd.offset + 8) as usize;
                rewrites.push(PathRewrite {
                    name_offset: base + load_cmd.offset + str_offset,
                    available: cmdsize - str_offset,
                });
            }
        }
    }

    if rewrites.is_empty() {
        return Ok(false);
    }

    for rw in &rewrites {
        if new_path.len() + 1 > rw.available {
            return Err(SidesignError::MachO(format!(
                "not enough space for new dylib path (need {}, have {})",
                new_path.len() + 1,
                rw.available
            )));
        }

        data[rw.name_offset..rw.name_offset + rw.available].fill(0);
        data[rw.name_offset..rw.name_offset + new_path.len()]
            .copy_from_slice(new_path.as_bytes());
    }

    fs::write(path, &data)?;
    Ok(true)
}

struct CommandInsert {
    base: usize,
    insert_offset: usize,
    command: Vec<u8>,
    new_sizeofcmds: u32,
    new_ncmds: u32,
}

/// Appends an LC_LOAD_WEAK_DYLIB command for `dylib_path` to every
/// architecture, writing into the zero gap between the existing load
/// commands and the first segment's file data. A no-op when the binary
/// already links the path.
pub fn add_weak_dylib<P: AsRef<Path>>(path: P, dylib_path: &str) -> Result<()> {
    let path = path.as_ref();
    let mut data = fs::read(path)?;

    let mut inserts: Vec<CommandInsert> = Vec::new();
    for (base, len) in arch_slices(&data)? {
        let slice = &data[base..base + len];
        let macho = goblin::mach::MachO::parse(slice, 0)?;

        let already_linked = macho
            .load_commands
            .iter()
            .filter(|lc| DYLIB_COMMANDS.contains(&lc.command.cmd()))
            .any(|lc| dylib_command_path(slice, lc.offset).as_deref() == Some(dylib_path));
        if already_linked {
            log::debug!("{dylib_path} already linked in {}", path.display());
            continue;
        }

        let header_size = if macho.is_64 { 32 } else { 28 };
        let sizeofcmds = read_u32_le(slice, 20);
        let ncmds = read_u32_le(slice, 16);

        // dylib_command: cmd(4) cmdsize(4) str_offset(4) timestamp(4)
        // current_version(4) compat_version(4) = 24-byte fixed part
        let padding = (8 - ((dylib_path.len() + 1) % 8)) % 8;
        let command_size = 24 + dylib_path.len() + 1 + padding;

        let load_commands_end = header_size + sizeofcmds as usize;
        let data_start = macho
            .segments
            .iter()
            .filter(|seg| seg.filesize > 0 && seg.fileoff > 0)
            .map(|seg| seg.fileoff as usize)
            .min()
            .unwrap_or(len);

        let available = data_start.saturating_sub(load_commands_end);
        if command_size > available {
            return Err(SidesignError::MachO(format!(
                "not enough space for new load command (need {command_size}, have {available})"
            )));
        }

        let mut command = Vec::with_capacity(command_size);
        command.extend_from_slice(&LC_LOAD_WEAK_DYLIB.to_le_bytes());
        command.extend_from_slice(&(command_size as u32).to_le_bytes());
        command.extend_from_slice(&24u32.to_le_bytes());
        command.extend_from_slice(&2u32.to_le_bytes()); // timestamp
        command.extend_from_slice(&0x0001_0000u32.to_le_bytes()); // current_version
        command.extend_from_slice(&0x0001_0000u32.to_le_bytes()); // compatibility_version
        command.extend_from_slice(dylib_path.as_bytes());
        command.push(0);
        command.resize(command_size, 0);

        inserts.push(CommandInsert {
            base,
            insert_offset: base + load_commands_end,
            command,
            new_sizeofcmds: sizeofcmds + command_size as u32,
            new_ncmds: ncmds + 1,
        });
    }

    if inserts.is_empty() {
        return Ok(());
    }

    for ins in &inserts {
        data[ins.insert_offset..ins.insert_offset + ins.command.len()]
            .copy_from_slice(&ins.command);
        data[ins.base + 20..ins.base + 24].copy_from_slice(&ins.new_sizeofcmds.to_le_bytes());
        data[ins.base + 16..ins.base + 20].copy_from_slice(&ins.new_ncmds.to_le_bytes());
    }

    fs::write(path, &data)?;
    Ok(())
}

/// Repoints any substrate-family load command at the injected substrate
/// framework so the loader resolves the hook library shipped inside the app.
pub fn fix_substrate<P: AsRef<Path>>(path: P) -> Result<bool> {
    let path = path.as_ref();
    let mut changed = false;

    for dep in linked_dylibs(path)? {
        if dep.to_lowercase().contains("substrate") && dep != SUBSTRATE_INSTALL_PATH {
            if rewrite_dylib_path(path, &dep, SUBSTRATE_INSTALL_PATH)? {
                log::info!(
                    "fixed substrate linkage in {}: {dep} -> {SUBSTRATE_INSTALL_PATH}",
                    path.display()
                );
                changed = true;
            }
        }
    }

    Ok(changed)
}
