//! Dependency type bitflags.
//!
//! A dependency edge carries one or more of build/link/run/test. The flags
//! are stored as a small bitset so edges can be merged cheaply.

pub type DepFlag = u8;

pub const BUILD: DepFlag = 0b0001;
pub const LINK: DepFlag = 0b0010;
pub const RUN: DepFlag = 0b0100;
pub const TEST: DepFlag = 0b1000;

pub const ALL: DepFlag = BUILD | LINK | RUN | TEST;

/// Default type for a dependency declared without an explicit type.
pub const DEFAULT: DepFlag = BUILD | LINK;

pub const ALL_FLAGS: [DepFlag; 4] = [BUILD, LINK, RUN, TEST];

pub fn flag_to_str(flag: DepFlag) -> &'static str {
    match flag {
        BUILD => "build",
        LINK => "link",
        RUN => "run",
        TEST => "test",
        _ => "unknown",
    }
}

pub fn str_to_flag(name: &str) -> Option<DepFlag> {
    match name {
        "build" => Some(BUILD),
        "link" => Some(LINK),
        "run" => Some(RUN),
        "test" => Some(TEST),
        _ => None,
    }
}

/// Individual flags present in a combined depflag, in canonical order.
pub fn flag_to_parts(depflag: DepFlag) -> impl Iterator<Item = DepFlag> {
    ALL_FLAGS.into_iter().filter(move |f| depflag & f != 0)
}

/// Canonical comma-joined form, e.g. `build,link`.
pub fn flag_to_string(depflag: DepFlag) -> String {
    flag_to_parts(depflag)
        .map(flag_to_str)
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse a comma-joined form back into a bitset. Unknown names are ignored.
pub fn string_to_flag(text: &str) -> DepFlag {
    text.split(',')
        .filter_map(|part| str_to_flag(part.trim()))
        .fold(0, |acc, f| acc | f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_round_trip() {
        assert_eq!(flag_to_string(BUILD | RUN), "build,run");
        assert_eq!(string_to_flag("build,run"), BUILD | RUN);
        assert_eq!(string_to_flag("bogus"), 0);
    }

    #[test]
    fn test_flag_parts() {
        let parts: Vec<_> = flag_to_parts(DEFAULT).collect();
        assert_eq!(parts, vec![BUILD, LINK]);
    }
}
