use std::fmt::Display;

pub const SECTION_PREFIX: &str = ".ncp_";
pub const SYMBOL_PREFIX: &str = "ncp_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchKind {
    Jump,
    Call,
    Hook,
    Over,
}

impl Display for PatchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            PatchKind::Jump => "jump",
            PatchKind::Call => "call",
            PatchKind::Hook => "hook",
            PatchKind::Over => "over",
        })
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum DirectiveError {
    /// Name carries the prefix but no kind separator; silently skipped.
    #[error("missing patch type separator")]
    MissingSeparator,

    #[error("Found invalid patch type: {0}")]
    InvalidKind(String),

    #[error("\"over\" patch must be a section type patch: {0}")]
    OverAsLabel(String),

    #[error("Found invalid address for patch: {0}")]
    InvalidAddress(String),

    #[error("Expected overlay definition in patch for: {0}")]
    ExpectedOverlay(String),

    #[error("Found invalid overlay for patch: {0}")]
    InvalidOverlay(String),
}

/// A parsed `ncp_*` / `.ncp_*` name.
#[derive(Debug, PartialEq)]
pub enum Directive {
    Patch {
        kind: PatchKind,
        is_ncp_set: bool,
        dest_address: u32,
        dest_thumb: bool,
        dest_overlay: i32,
    },
    RtRepl,
}

fn parse_hex_address(s: &str) -> Option<u32> {
    let s = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    u32::from_str_radix(s, 16).ok()
}

/// Parses the suffix grammar `<kind>_<hexaddr>[_ov<decimal>]`. The `t`
/// prefix marks the patched site as THUMB by setting the address low bit;
/// the `set` prefix marks link-time resolved patches.
pub fn parse_directive(name: &str, declared_as_section: bool) -> Result<Directive, DirectiveError> {
    let prefix_len = if declared_as_section {
        SECTION_PREFIX.len()
    } else {
        SYMBOL_PREFIX.len()
    };
    let label = &name[prefix_len..];

    let kind_end = label.find('_').ok_or(DirectiveError::MissingSeparator)?;
    let kind_name = &label[..kind_end];

    if kind_name == "rtrepl" {
        return Ok(Directive::RtRepl);
    }

    let (kind, is_ncp_set, force_thumb) = match kind_name {
        "jump" => (PatchKind::Jump, false, false),
        "call" => (PatchKind::Call, false, false),
        "hook" => (PatchKind::Hook, false, false),
        "over" => (PatchKind::Over, false, false),
        "setjump" => (PatchKind::Jump, true, false),
        "setcall" => (PatchKind::Call, true, false),
        "sethook" => (PatchKind::Hook, true, false),
        "tjump" => (PatchKind::Jump, false, true),
        "tcall" => (PatchKind::Call, false, true),
        "thook" => (PatchKind::Hook, false, true),
        "tsetjump" => (PatchKind::Jump, true, true),
        "tsetcall" => (PatchKind::Call, true, true),
        "tsethook" => (PatchKind::Hook, true, true),
        _ => return Err(DirectiveError::InvalidKind(kind_name.to_string())),
    };

    if kind == PatchKind::Over && !declared_as_section {
        return Err(DirectiveError::OverAsLabel(label.to_string()));
    }

    let address_start = kind_end + 1;
    let (address_name, overlay_name) = match label[address_start..].find('_') {
        Some(end) => (
            &label[address_start..address_start + end],
            Some(&label[address_start + end + 1..]),
        ),
        None => (&label[address_start..], None),
    };

    let mut dest_address =
        parse_hex_address(address_name).ok_or_else(|| DirectiveError::InvalidAddress(label.to_string()))?;
    if force_thumb {
        dest_address |= 1;
    }

    let dest_overlay = match overlay_name {
        Some(name) => {
            let number = name
                .strip_prefix("ov")
                .ok_or_else(|| DirectiveError::ExpectedOverlay(label.to_string()))?;
            number
                .parse::<i32>()
                .ok()
                .filter(|n| *n >= 0)
                .ok_or_else(|| DirectiveError::InvalidOverlay(label.to_string()))?
        }
        None => -1,
    };

    Ok(Directive::Patch {
        kind,
        is_ncp_set,
        dest_address: dest_address & !1,
        dest_thumb: dest_address & 1 != 0,
        dest_overlay,
    })
}

/// One patch to splice into a destination binary. `src_address` is only
/// known once the linker has run.
#[derive(Debug, Clone)]
pub struct PatchInfo {
    pub src_address: u32,
    pub src_dest: i32,
    pub dest_address: u32,
    pub dest_dest: i32,
    pub kind: PatchKind,
    pub is_ncp_set: bool,
    pub src_thumb: bool,
    pub dest_thumb: bool,
    pub declared_as_section: bool,
    pub section_idx: Option<usize>,
    pub section_size: u32,
    pub symbol: String,
    pub job: usize,
}

impl PatchInfo {
    /// Bytes rewritten at the destination; used for overlap detection.
    pub fn dest_size(&self) -> u32 {
        if self.kind == PatchKind::Over {
            self.section_size
        } else {
            4
        }
    }
}

/// Runtime-replaceable content: pure linker bookkeeping, the script emits
/// a `<name>_start`/`<name>_end` pair around the section.
#[derive(Debug, Clone, PartialEq)]
pub struct RtReplPatch {
    pub symbol: String,
    pub job: usize,
}
