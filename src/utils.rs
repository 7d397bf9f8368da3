//! Utility functions.

/// Aligns an address or size up to the next multiple of `align`.
/// `align` must be a power of two; an alignment of 0 or 1 leaves `addr` unchanged.
pub fn align_up(addr: u64, align: u64) -> u64 {
    if align <= 1 {
        return addr;
    }
    debug_assert!(align.is_power_of_two());
    (addr + align - 1) & !(align - 1)
}

/// Returns the part of `name` before any `@unit` suffix.
pub fn base_name(name: &str) -> &str {
    name.split('@').next().unwrap_or(name)
}

/// Converts a symbol-style identifier into an entry name (`u_boot_spl` -> `u-boot-spl`).
pub fn symbol_to_entry_name(name: &str) -> String {
    name.replace('_', "-")
}

/// Copies `src` into a fixed-size, NUL-padded field, truncating if needed.
pub fn fixed_str<const N: usize>(src: &str) -> [u8; N] {
    let mut out = [0u8; N];
    let n = src.len().min(N);
    out[..n].copy_from_slice(&src.as_bytes()[..n]);
    out
}

/// Reads a NUL-padded string field back.
pub fn from_fixed_str(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_power_of_two() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(17, 4), 20);
        assert_eq!(align_up(5, 0), 5);
        assert_eq!(align_up(5, 1), 5);
    }

    #[test]
    fn names() {
        assert_eq!(base_name("fill@1"), "fill");
        assert_eq!(base_name("u-boot"), "u-boot");
        assert_eq!(symbol_to_entry_name("u_boot_spl"), "u-boot-spl");
        assert_eq!(from_fixed_str(&fixed_str::<8>("FMAP")), "FMAP");
        assert_eq!(fixed_str::<4>("too long"), *b"too ");
    }
}
